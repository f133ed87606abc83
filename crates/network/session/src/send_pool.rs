//! Bucketed outbound delivery pool.
//!
//! Outbound envelopes are partitioned into [`BUCKET_COUNT`] buckets by
//! `channel_id & (BUCKET_COUNT - 1)`. Each bucket is one long-lived task fed
//! by an unbounded queue, so delivery within a bucket is strictly serial in
//! submission order while distinct buckets proceed in parallel. After
//! [`interrupt`](SendPool::interrupt) every already-queued envelope still
//! drains before the bucket task exits; later submissions bypass the pool and
//! write on the caller's thread.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use tokio::{
    runtime::{Builder, Runtime},
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
};
use tracing::{debug, error};

use network_shared::{Envelope, SharedChannel};

use crate::{lock, session::Session};

/// Number of delivery buckets. Power of two; the partition is a mask.
pub const BUCKET_COUNT: usize = 8;
const BUCKET_MASK: u32 = BUCKET_COUNT as u32 - 1;

struct WriteJob {
    session: Arc<Session>,
    channel: SharedChannel,
    envelope: Envelope,
}

impl WriteJob {
    fn deliver(self) {
        if !self.channel.is_open() {
            return;
        }
        if let Err(error) = self.channel.write(self.envelope) {
            error!(session = %self.session.id(), %error, "pooled write failed");
            self.session.disconnect(false, "Socket Error!");
        }
    }
}

struct BucketWorker {
    jobs: UnboundedSender<WriteJob>,
    handle: JoinHandle<()>,
}

/// Shared delivery pool, typically one per server process.
pub struct SendPool {
    runtime: Runtime,
    slots: Mutex<[Option<BucketWorker>; BUCKET_COUNT]>,
    interrupted: AtomicBool,
    /// Handles of workers detached by `interrupt`, kept for the join phase.
    draining: Mutex<Vec<JoinHandle<()>>>,
}

impl SendPool {
    pub fn new() -> std::io::Result<Arc<Self>> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(BUCKET_COUNT)
            .thread_name("send-pool")
            .build()?;
        Ok(Arc::new(Self {
            runtime,
            slots: Mutex::new(std::array::from_fn(|_| None)),
            interrupted: AtomicBool::new(false),
            draining: Mutex::new(Vec::new()),
        }))
    }

    /// Submits one envelope for ordered delivery. After shutdown began the
    /// envelope is written directly on the calling thread instead of being
    /// enqueued.
    pub fn send(&self, session: &Arc<Session>, channel: &SharedChannel, envelope: Envelope) {
        let job = WriteJob {
            session: Arc::clone(session),
            channel: Arc::clone(channel),
            envelope,
        };
        if self.interrupted.load(Ordering::Acquire) {
            job.deliver();
            return;
        }
        let bucket = (job.envelope.channel_id & BUCKET_MASK) as usize;
        let mut slots = lock(&self.slots);
        // interrupt may have landed while we waited for the lock
        if self.interrupted.load(Ordering::Acquire) {
            drop(slots);
            job.deliver();
            return;
        }
        let worker = slots[bucket].get_or_insert_with(|| self.spawn_worker(bucket));
        if let Err(rejected) = worker.jobs.send(job) {
            drop(slots);
            rejected.0.deliver();
        }
    }

    fn spawn_worker(&self, bucket: usize) -> BucketWorker {
        let (jobs, rx) = mpsc::unbounded_channel();
        debug!(bucket, "send bucket started");
        let handle = self.runtime.spawn(run_bucket(rx));
        BucketWorker { jobs, handle }
    }

    /// Begins shutdown: no new envelopes enter the pool, and each bucket
    /// task exits once its already-queued envelopes are written.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
        let workers: Vec<BucketWorker> = {
            let mut slots = lock(&self.slots);
            slots.iter_mut().filter_map(Option::take).collect()
        };
        let mut draining = lock(&self.draining);
        for worker in workers {
            // dropping the sender ends the bucket's queue after the backlog
            drop(worker.jobs);
            draining.push(worker.handle);
        }
    }

    /// [`interrupt`](Self::interrupt), then block until every bucket has
    /// flushed its backlog. Safe to call more than once.
    pub fn interrupt_and_join(&self) {
        self.interrupt();
        let handles: Vec<JoinHandle<()>> = lock(&self.draining).drain(..).collect();
        for handle in handles {
            let _ = self.runtime.block_on(handle);
        }
    }
}

async fn run_bucket(mut jobs: UnboundedReceiver<WriteJob>) {
    while let Some(job) = jobs.recv().await {
        job.deliver();
    }
}
