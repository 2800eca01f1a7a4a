// ── Event dispatcher ──
//
// Two delivery modes. Serial runs the job inline on the producing task,
// so events for one entity are strictly ordered and delivery cost lands
// on the producer. Concurrent hands the job to a small pool of worker
// tasks over bounded lanes; the lane is picked by hashing the source
// key, so jobs from one entity still share a FIFO lane while different
// entities proceed in parallel. There is no ordering guarantee across
// entities, and there never was one to give.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::CoreError;

/// How an entity's events reach its listeners.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display,
)]
pub enum SerializationMode {
    /// Deliver inline on the producing task.
    Serial,
    /// Deliver through the shared worker pool.
    #[default]
    Concurrent,
}

/// A unit of delivery work.
pub(crate) struct Job {
    run: Box<dyn FnOnce() + Send>,
    done: Option<oneshot::Sender<()>>,
}

impl Job {
    pub(crate) fn new(run: impl FnOnce() + Send + 'static) -> Self {
        Self {
            run: Box::new(run),
            done: None,
        }
    }

    /// Attach a completion signal, fired after the job body returns.
    #[cfg(test)]
    pub(crate) fn with_done(mut self, done: oneshot::Sender<()>) -> Self {
        self.done = Some(done);
        self
    }

    fn execute(self) {
        (self.run)();
        if let Some(done) = self.done {
            let _ = done.send(());
        }
    }
}

/// Stable lane key for a source name.
pub(crate) fn source_key(name: &str) -> u64 {
    let mut h = DefaultHasher::new();
    name.hash(&mut h);
    h.finish()
}

/// Shared worker pool for Concurrent delivery.
///
/// One worker task per lane; each worker drains its own queue, which is
/// what gives per-lane FIFO. Queues are bounded: a submission awaits
/// capacity instead of buffering without limit.
pub(crate) struct Dispatcher {
    lanes: Mutex<Option<Vec<mpsc::Sender<Job>>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    open: AtomicBool,
    lane_count: usize,
}

impl Dispatcher {
    /// Spawn `workers` lane tasks. Must be called inside a tokio runtime.
    pub(crate) fn new(workers: usize, queue_capacity: usize) -> Self {
        let workers = workers.max(1);
        let queue_capacity = queue_capacity.max(1);
        let mut senders = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for lane in 0..workers {
            let (tx, mut rx) = mpsc::channel::<Job>(queue_capacity);
            senders.push(tx);
            handles.push(tokio::spawn(async move {
                while let Some(job) = rx.recv().await {
                    job.execute();
                }
                tracing::trace!(lane, "dispatcher lane closed");
            }));
        }
        Self {
            lanes: Mutex::new(Some(senders)),
            workers: Mutex::new(handles),
            open: AtomicBool::new(true),
            lane_count: workers,
        }
    }

    /// Queue a job on the lane selected by `key`, awaiting queue
    /// capacity. Rejected once [`drain`](Self::drain) has begun.
    pub(crate) async fn submit(&self, key: u64, job: Job) -> Result<(), CoreError> {
        if !self.open.load(Ordering::Acquire) {
            return Err(CoreError::ShuttingDown);
        }
        #[allow(clippy::cast_possible_truncation)]
        let lane = (key % self.lane_count as u64) as usize;
        let sender = {
            let lanes = self.lanes.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            match lanes.as_ref() {
                Some(senders) => senders[lane].clone(),
                None => return Err(CoreError::ShuttingDown),
            }
        };
        sender.send(job).await.map_err(|_| CoreError::ShuttingDown)
    }

    /// Run `job` according to `mode`: inline for Serial, queued for
    /// Concurrent.
    pub(crate) async fn dispatch(
        &self,
        mode: SerializationMode,
        key: u64,
        job: Job,
    ) -> Result<(), CoreError> {
        match mode {
            SerializationMode::Serial => {
                if !self.open.load(Ordering::Acquire) {
                    return Err(CoreError::ShuttingDown);
                }
                job.execute();
                Ok(())
            }
            SerializationMode::Concurrent => self.submit(key, job).await,
        }
    }

    /// Stop accepting jobs, then run every queued job to completion and
    /// join the workers.
    pub(crate) async fn drain(&self) {
        self.open.store(false, Ordering::Release);
        let senders = self
            .lanes
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        drop(senders);
        let handles = std::mem::take(
            &mut *self
                .workers
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        );
        for handle in handles {
            let _ = handle.await;
        }
        tracing::debug!("dispatcher drained");
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn serial_mode_runs_inline() {
        let d = Dispatcher::new(2, 8);
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        d.dispatch(
            SerializationMode::Serial,
            source_key("a/b"),
            Job::new(move || {
                h.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .await
        .unwrap();
        // Inline means done before dispatch returns.
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        d.drain().await;
    }

    #[tokio::test]
    async fn same_key_jobs_stay_in_order() {
        let d = Dispatcher::new(3, 64);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let key = source_key("sim://dev/attr");
        let (done_tx, done_rx) = oneshot::channel();
        for i in 0..20 {
            let s = Arc::clone(&seen);
            let mut job = Job::new(move || s.lock().unwrap().push(i));
            if i == 19 {
                job = job.with_done(done_tx);
                d.submit(key, job).await.unwrap();
                break;
            }
            d.submit(key, job).await.unwrap();
        }
        done_rx.await.unwrap();
        assert_eq!(*seen.lock().unwrap(), (0..20).collect::<Vec<_>>());
        d.drain().await;
    }

    #[tokio::test]
    async fn drain_runs_queued_jobs_then_rejects() {
        let d = Dispatcher::new(1, 16);
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let h = Arc::clone(&hits);
            d.submit(
                1,
                Job::new(move || {
                    h.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await
            .unwrap();
        }
        d.drain().await;
        assert_eq!(hits.load(Ordering::SeqCst), 5);

        let err = d.submit(1, Job::new(|| {})).await.unwrap_err();
        assert!(matches!(err, CoreError::ShuttingDown));
        let err = d
            .dispatch(SerializationMode::Serial, 1, Job::new(|| {}))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::ShuttingDown));
    }

    #[test]
    fn source_key_is_stable() {
        assert_eq!(source_key("sim://dev/attr"), source_key("sim://dev/attr"));
        assert_ne!(source_key("sim://dev/attr"), source_key("sim://dev/other"));
    }
}
