use crate::{lock, RuntimeError};
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::JoinHandle;
use tokio::sync::oneshot;

const PENDING: u8 = 0;
const RUNNING: u8 = 1;
const CANCELLED: u8 = 2;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// How a dispatched task settled.
#[derive(Debug)]
pub enum TaskOutcome<T> {
    /// The work ran on a worker thread and returned (or panicked).
    Finished(anyhow::Result<T>),
    /// The task was cancelled before any worker picked it up.
    Cancelled,
}

/// Cancellation side of a dispatched task, independent of its result type.
pub trait CancelHandle: Send + Sync {
    /// Prevent the task from starting. Returns false if a worker already
    /// started it (or it was already cancelled).
    fn cancel(&self) -> bool;

    fn has_started(&self) -> bool;
}

struct TaskSlot<T> {
    state: AtomicU8,
    sender: Mutex<Option<oneshot::Sender<TaskOutcome<T>>>>,
}

impl<T: Send> TaskSlot<T> {
    fn try_start(&self) -> bool {
        self.state
            .compare_exchange(PENDING, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn deliver(&self, outcome: TaskOutcome<T>) {
        if let Some(sender) = lock(&self.sender).take() {
            // The receiver is gone after a timeout; the late result is dropped.
            let _ = sender.send(outcome);
        }
    }
}

impl<T: Send> CancelHandle for TaskSlot<T> {
    fn cancel(&self) -> bool {
        let prevented = self
            .state
            .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if prevented {
            self.deliver(TaskOutcome::Cancelled);
        }
        prevented
    }

    fn has_started(&self) -> bool {
        self.state.load(Ordering::Acquire) == RUNNING
    }
}

/// A unit of work that has been prepared but not yet queued.
pub struct Task {
    job: Job,
}

/// Everything produced by `WorkerPool::prepare`.
pub struct PreparedTask<T> {
    pub task: Task,
    pub cancel: Arc<dyn CancelHandle>,
    pub outcome: oneshot::Receiver<TaskOutcome<T>>,
}

/// Fixed-size pool of named OS threads pulling jobs from one shared queue.
///
/// Jobs are started in queue order. A job whose task was cancelled while
/// queued is skipped by the worker that dequeues it.
pub struct WorkerPool {
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(size: usize) -> Result<Self, RuntimeError> {
        if size == 0 {
            return Err(RuntimeError::InvalidConfig(
                "worker pool needs at least one thread".to_string(),
            ));
        }

        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));

        let mut workers = Vec::with_capacity(size);
        for index in 0..size {
            let receiver = Arc::clone(&receiver);
            let handle = std::thread::Builder::new()
                .name(format!("crew-worker-{}", index))
                .spawn(move || worker_loop(receiver))
                .map_err(|e| RuntimeError::WorkerSpawn(e.to_string()))?;
            workers.push(handle);
        }

        tracing::info!("Started worker pool with {} threads", size);

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
        })
    }

    /// Wrap `work` into a queueable task plus its cancel handle and result channel.
    pub fn prepare<T, F>(work: F) -> PreparedTask<T>
    where
        T: Send + 'static,
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        let (sender, outcome) = oneshot::channel();
        let slot = Arc::new(TaskSlot {
            state: AtomicU8::new(PENDING),
            sender: Mutex::new(Some(sender)),
        });

        let worker_slot = Arc::clone(&slot);
        let job: Job = Box::new(move || {
            if !worker_slot.try_start() {
                tracing::debug!("Skipping task cancelled while queued");
                return;
            }
            let result = catch_unwind(AssertUnwindSafe(work)).unwrap_or_else(|panic| {
                Err(anyhow::anyhow!("work panicked: {}", panic_message(&*panic)))
            });
            worker_slot.deliver(TaskOutcome::Finished(result));
        });

        PreparedTask {
            task: Task { job },
            cancel: slot,
            outcome,
        }
    }

    /// Queue a prepared task. Hands the task back if the pool is closed.
    pub fn enqueue(&self, task: Task) -> Result<(), Task> {
        let sender = lock(&self.sender);
        match sender.as_ref() {
            Some(sender) => sender
                .send(task.job)
                .map_err(|mpsc::SendError(job)| Task { job }),
            None => Err(task),
        }
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.sender).is_none()
    }

    /// Stop accepting work. Workers finish the jobs already queued and exit;
    /// their join handles are returned so the caller can wait for them.
    pub fn close(&self) -> Vec<JoinHandle<()>> {
        lock(&self.sender).take();
        std::mem::take(&mut *lock(&self.workers))
    }
}

fn worker_loop(receiver: Arc<Mutex<mpsc::Receiver<Job>>>) {
    loop {
        // The queue lock is released as soon as a job (or disconnect) arrives.
        let job = lock(&receiver).recv();
        match job {
            Ok(job) => job(),
            Err(_) => break,
        }
    }
    tracing::debug!(
        "Worker {} exiting",
        std::thread::current().name().unwrap_or("unnamed")
    );
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::time::Duration;

    #[tokio::test]
    async fn runs_work_and_delivers_result() {
        let pool = WorkerPool::new(2).unwrap();
        let prepared = WorkerPool::prepare(|| Ok(21 * 2));
        pool.enqueue(prepared.task).ok().unwrap();

        match prepared.outcome.await.unwrap() {
            TaskOutcome::Finished(Ok(value)) => assert_eq!(value, 42),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(!prepared.cancel.cancel());
    }

    #[tokio::test]
    async fn cancelled_task_never_runs() {
        let pool = WorkerPool::new(1).unwrap();
        let ran = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&ran);
        let prepared = WorkerPool::prepare(move || {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });
        assert!(prepared.cancel.cancel());
        assert!(!prepared.cancel.cancel());
        pool.enqueue(prepared.task).ok().unwrap();

        assert!(matches!(
            prepared.outcome.await.unwrap(),
            TaskOutcome::Cancelled
        ));
        for handle in pool.close() {
            handle.join().unwrap();
        }
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn panics_become_errors_and_worker_survives() {
        let pool = WorkerPool::new(1).unwrap();

        let boom = WorkerPool::prepare(|| -> anyhow::Result<()> { panic!("kaboom") });
        pool.enqueue(boom.task).ok().unwrap();
        match boom.outcome.await.unwrap() {
            TaskOutcome::Finished(Err(e)) => assert!(e.to_string().contains("kaboom")),
            other => panic!("unexpected outcome: {:?}", other),
        }

        let after = WorkerPool::prepare(|| Ok("still alive"));
        pool.enqueue(after.task).ok().unwrap();
        assert!(matches!(
            after.outcome.await.unwrap(),
            TaskOutcome::Finished(Ok("still alive"))
        ));
    }

    #[tokio::test]
    async fn parallelism_is_bounded_by_pool_size() {
        let pool = WorkerPool::new(3).unwrap();
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut outcomes = Vec::new();
        for _ in 0..9 {
            let current = Arc::clone(&current);
            let peak = Arc::clone(&peak);
            let prepared = WorkerPool::prepare(move || {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(20));
                current.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            });
            pool.enqueue(prepared.task).ok().unwrap();
            outcomes.push(prepared.outcome);
        }
        for outcome in outcomes {
            outcome.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn closed_pool_hands_task_back() {
        let pool = WorkerPool::new(1).unwrap();
        for handle in pool.close() {
            handle.join().unwrap();
        }
        assert!(pool.is_closed());

        let prepared = WorkerPool::prepare(|| Ok(()));
        assert!(pool.enqueue(prepared.task).is_err());
    }
}
