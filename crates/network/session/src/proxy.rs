//! Proxy-only session state: the backend channel and its bookkeeping.

use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Mutex,
};

use network_shared::{ConnectionInfo, Envelope, IdentityUpdate, SharedChannel};

use crate::{lock, session::SessionError};

/// Extension block attached to proxy-role sessions.
pub(crate) struct ProxyState {
    /// Channel to the real backend. Sends messages upstream. Set once per
    /// connect cycle; must be closed before it can be rebound.
    aux_channel: Mutex<Option<SharedChannel>>,
    /// Identity accumulated from traffic on the primary (client) channel.
    primary_info: Mutex<Option<ConnectionInfo>>,
    /// Identity accumulated from traffic on the aux (backend) channel.
    aux_info: Mutex<Option<ConnectionInfo>>,
    passthrough: AtomicBool,
    /// Number of successful backend binds for this session.
    connects: AtomicU32,
}

impl ProxyState {
    pub(crate) fn new() -> Self {
        Self {
            aux_channel: Mutex::new(None),
            primary_info: Mutex::new(None),
            aux_info: Mutex::new(None),
            passthrough: AtomicBool::new(false),
            connects: AtomicU32::new(0),
        }
    }

    /// Binds the backend channel. Returns the new connect count.
    pub(crate) fn bind_aux(&self, channel: SharedChannel) -> Result<u32, SessionError> {
        let mut slot = lock(&self.aux_channel);
        if slot.is_some() {
            return Err(SessionError::AuxChannelBound);
        }
        *slot = Some(channel);
        Ok(self.connects.fetch_add(1, Ordering::AcqRel) + 1)
    }

    /// Closes the backend channel, writing `kick` first if one is given.
    ///
    /// With `opened_expected` the absence of a bound channel is a state
    /// violation; without it the close is silent (redirects race against
    /// backend-initiated closes).
    pub(crate) fn close_aux(
        &self,
        opened_expected: bool,
        kick: Option<Envelope>,
    ) -> Result<(), SessionError> {
        let taken = lock(&self.aux_channel).take();
        match taken {
            Some(channel) => {
                match kick {
                    Some(envelope) => channel.write_then_close(envelope),
                    None => channel.close(),
                }
                Ok(())
            }
            None if opened_expected => Err(SessionError::AuxChannelMissing),
            None => Ok(()),
        }
    }

    pub(crate) fn aux_channel(&self) -> Option<SharedChannel> {
        lock(&self.aux_channel).clone()
    }

    /// Merges identity fields carried by a message into the info record of
    /// the channel the message touched.
    pub(crate) fn update_info(&self, aux_side: bool, update: &IdentityUpdate) {
        let slot = if aux_side {
            &self.aux_info
        } else {
            &self.primary_info
        };
        let mut guard = lock(slot);
        let merged = update.merge(guard.as_ref());
        *guard = Some(merged);
    }

    pub(crate) fn primary_info(&self) -> Option<ConnectionInfo> {
        lock(&self.primary_info).clone()
    }

    pub(crate) fn aux_info(&self) -> Option<ConnectionInfo> {
        lock(&self.aux_info).clone()
    }

    pub(crate) fn clear_aux_info(&self) {
        lock(&self.aux_info).take();
    }

    pub(crate) fn start_passthrough(&self) {
        let _ = self
            .passthrough
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire);
    }

    pub(crate) fn stop_passthrough(&self) {
        self.passthrough.store(false, Ordering::Release);
    }

    pub(crate) fn passthrough(&self) -> bool {
        self.passthrough.load(Ordering::Acquire)
    }

    pub(crate) fn connects(&self) -> u32 {
        self.connects.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryChannel;

    #[test]
    fn rebind_without_close_fails_and_keeps_count() {
        let proxy = ProxyState::new();
        let first = MemoryChannel::new("backend:1");
        let second = MemoryChannel::new("backend:2");

        assert_eq!(proxy.bind_aux(first.shared()).unwrap(), 1);
        assert!(matches!(
            proxy.bind_aux(second.shared()),
            Err(SessionError::AuxChannelBound)
        ));
        assert_eq!(proxy.connects(), 1);
    }

    #[test]
    fn close_then_rebind_increments_count() {
        let proxy = ProxyState::new();
        let first = MemoryChannel::new("backend:1");
        let second = MemoryChannel::new("backend:2");

        proxy.bind_aux(first.shared()).unwrap();
        proxy.close_aux(true, None).unwrap();
        assert_eq!(first.close_count(), 1);
        assert_eq!(proxy.bind_aux(second.shared()).unwrap(), 2);
    }

    #[test]
    fn close_with_nothing_bound() {
        let proxy = ProxyState::new();
        assert!(matches!(
            proxy.close_aux(true, None),
            Err(SessionError::AuxChannelMissing)
        ));
        // tolerant variant used by redirects and teardown
        assert!(proxy.close_aux(false, None).is_ok());
    }

    #[test]
    fn info_merging_is_per_side() {
        let proxy = ProxyState::new();
        proxy.update_info(false, &IdentityUpdate::identifier("elaria"));
        proxy.update_info(true, &IdentityUpdate::default().with_entity_id(9));

        assert_eq!(proxy.primary_info().unwrap().identifier, "elaria");
        assert_eq!(proxy.aux_info().unwrap().entity_id, Some(9));
        assert_eq!(proxy.primary_info().unwrap().entity_id, None);
    }
}
