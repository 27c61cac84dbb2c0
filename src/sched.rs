//! Main-Context and Worker Scheduling
//!
//! The pipeline runs its control flow on a single serial *main context*
//! and pushes long-running work (deflate, JPEG, video encode) onto worker
//! threads. The main context is a task draining an unbounded job queue,
//! so jobs posted to it never run concurrently with each other; worker
//! completions are posted back onto the same queue. All callbacks the
//! pipeline invokes on its consumers run on the main context.

use std::cell::Cell;

use tokio::sync::mpsc;
use tracing::{error, warn};

/// A unit of work.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

thread_local! {
    static IN_MAIN_CONTEXT: Cell<bool> = const { Cell::new(false) };
}

/// Handle onto the pipeline's scheduling contexts.
///
/// Cloning is cheap; every component keeps its own handle. The handle
/// must be created inside a tokio runtime, which also hosts the worker
/// pool (`spawn_blocking`).
#[derive(Clone)]
pub struct Scheduler {
    tx: mpsc::UnboundedSender<Job>,
    rt: tokio::runtime::Handle,
}

impl Scheduler {
    /// Start a main context on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn spawn() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let rt = tokio::runtime::Handle::current();
        rt.spawn(async move {
            while let Some(job) = rx.recv().await {
                IN_MAIN_CONTEXT.with(|flag| flag.set(true));
                job();
                IN_MAIN_CONTEXT.with(|flag| flag.set(false));
            }
        });
        Self { tx, rt }
    }

    /// Queue a job on the main context. The job never runs before this
    /// call returns.
    pub fn post(&self, job: impl FnOnce() + Send + 'static) {
        if self.tx.send(Box::new(job)).is_err() {
            warn!("main context is gone, dropping job");
        }
    }

    /// Run `work` on a worker thread, then `done` on the main context.
    ///
    /// `done` is skipped if the work panics; the panic is contained to
    /// the worker and logged.
    pub fn spawn_worker(
        &self,
        work: impl FnOnce() + Send + 'static,
        done: impl FnOnce() + Send + 'static,
    ) {
        let tx = self.tx.clone();
        self.rt.spawn(async move {
            match tokio::task::spawn_blocking(work).await {
                Ok(()) => {
                    if tx.send(Box::new(done)).is_err() {
                        warn!("main context is gone, dropping completion");
                    }
                }
                Err(e) => error!("worker job failed: {e}"),
            }
        });
    }

    /// Whether the calling code is running on a main context.
    pub fn is_main_context() -> bool {
        IN_MAIN_CONTEXT.with(|flag| flag.get())
    }

    /// Debug-assert that the calling code runs on a main context.
    #[track_caller]
    pub fn assert_main_context() {
        debug_assert!(
            Self::is_main_context(),
            "must be called from the main context"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_post_runs_on_main_context() {
        let sched = Scheduler::spawn();
        let (tx, rx) = oneshot::channel();
        sched.post(move || {
            let _ = tx.send(Scheduler::is_main_context());
        });
        assert!(rx.await.unwrap());
    }

    #[tokio::test]
    async fn test_posted_jobs_run_in_order() {
        let sched = Scheduler::spawn();
        let seen = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = oneshot::channel();
        for i in 0..100usize {
            let seen = seen.clone();
            sched.post(move || {
                assert_eq!(seen.fetch_add(1, Ordering::SeqCst), i);
            });
        }
        sched.post(move || {
            let _ = tx.send(());
        });
        rx.await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 100);
    }

    #[tokio::test]
    async fn test_worker_completion_runs_on_main_context() {
        let sched = Scheduler::spawn();
        let (tx, rx) = oneshot::channel();
        let flag = Arc::new(AtomicUsize::new(0));
        let work_flag = flag.clone();
        sched.spawn_worker(
            move || {
                assert!(!Scheduler::is_main_context());
                work_flag.store(7, Ordering::SeqCst);
            },
            move || {
                let _ = tx.send((Scheduler::is_main_context(), flag.load(Ordering::SeqCst)));
            },
        );
        let (on_main, value) = rx.await.unwrap();
        assert!(on_main);
        assert_eq!(value, 7);
    }
}
