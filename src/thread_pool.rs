// Worker pool - fixed set of OS threads, one private job queue per thread
//
// There is no shared queue and no stealing: the caller decides which worker
// runs a job. `wait()` is the join point of a frame; it returns only once every
// queue is empty and no worker is still inside a job.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// A unit of work. Errors and panics are captured and reported by `wait()`.
pub type Job = Box<dyn FnOnce() -> anyhow::Result<()> + Send + 'static>;

/// A job that returned an error or panicked
#[derive(Debug, Clone)]
pub struct JobFailure {
    pub worker: usize,
    pub message: String,
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker {}: {}", self.worker, self.message)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("thread pool needs at least one worker")]
    NoWorkers,

    #[error("no worker with index {index} (pool has {count})")]
    NoSuchWorker { index: usize, count: usize },

    #[error("{} job(s) failed: {}", .0.len(), describe_failures(.0))]
    JobsFailed(Vec<JobFailure>),

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

fn describe_failures(failures: &[JobFailure]) -> String {
    failures
        .iter()
        .map(JobFailure::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Default)]
struct Queue {
    jobs: VecDeque<Job>,
    /// A job has been popped and is still running
    busy: bool,
    destroying: bool,
    failures: Vec<JobFailure>,
}

impl Queue {
    fn is_drained(&self) -> bool {
        self.jobs.is_empty() && !self.busy
    }
}

#[derive(Default)]
struct Shared {
    queue: Mutex<Queue>,
    /// Signalled when a job is queued or shutdown begins
    work: Condvar,
    /// Signalled when the queue drains
    idle: Condvar,
}

struct Worker {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    fn spawn(index: usize) -> Result<Self, PoolError> {
        let shared = Arc::new(Shared::default());

        let handle = thread::Builder::new()
            .name(format!("render-worker-{}", index))
            .spawn({
                let shared = Arc::clone(&shared);
                move || queue_loop(index, &shared)
            })?;

        Ok(Self {
            shared,
            handle: Some(handle),
        })
    }

    fn add_job(&self, job: Job) {
        let mut queue = self.shared.queue.lock();
        queue.jobs.push_back(job);
        self.shared.work.notify_one();
    }

    fn wait(&self) {
        let mut queue = self.shared.queue.lock();
        while !queue.is_drained() {
            self.shared.idle.wait(&mut queue);
        }
    }

    fn take_failures(&self) -> Vec<JobFailure> {
        std::mem::take(&mut self.shared.queue.lock().failures)
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        // Drain first, then stop. Reversing this would drop queued jobs.
        self.wait();

        {
            let mut queue = self.shared.queue.lock();
            queue.destroying = true;
            self.shared.work.notify_one();
        }

        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("Worker thread panicked outside of a job");
            }
        }
    }
}

fn queue_loop(index: usize, shared: &Shared) {
    log::debug!("Worker {} started", index);

    loop {
        let job = {
            let mut queue = shared.queue.lock();
            while queue.jobs.is_empty() && !queue.destroying {
                shared.work.wait(&mut queue);
            }
            if queue.destroying {
                break;
            }
            let Some(job) = queue.jobs.pop_front() else {
                continue;
            };
            queue.busy = true;
            job
        };

        let failure = match panic::catch_unwind(AssertUnwindSafe(job)) {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("{:#}", e)),
            Err(payload) => Some(panic_message(payload.as_ref())),
        };

        let mut queue = shared.queue.lock();
        queue.busy = false;
        if let Some(message) = failure {
            log::error!("Job on worker {} failed: {}", index, message);
            queue.failures.push(JobFailure {
                worker: index,
                message,
            });
        }
        if queue.jobs.is_empty() {
            shared.idle.notify_all();
        }
    }

    log::debug!("Worker {} stopped", index);
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}

/// Fixed-size pool of workers, each with its own FIFO job queue
pub struct ThreadPool {
    workers: Vec<Worker>,
}

impl ThreadPool {
    pub fn new(count: usize) -> Result<Self, PoolError> {
        let mut pool = Self { workers: Vec::new() };
        pool.set_thread_count(count)?;
        Ok(pool)
    }

    /// Replace all workers with `count` fresh ones.
    ///
    /// Existing workers finish their queued jobs before they are stopped.
    /// Failures they captured but nobody collected through `wait()` are dropped.
    /// If a thread cannot be spawned the current workers stay in place.
    pub fn set_thread_count(&mut self, count: usize) -> Result<(), PoolError> {
        self.replace_workers(count, Worker::spawn)
    }

    fn replace_workers<S>(&mut self, count: usize, spawn: S) -> Result<(), PoolError>
    where
        S: FnMut(usize) -> Result<Worker, PoolError>,
    {
        if count == 0 {
            return Err(PoolError::NoWorkers);
        }

        let workers = (0..count).map(spawn).collect::<Result<Vec<_>, _>>()?;
        // The old workers drain their queues as they drop
        self.workers = workers;

        log::debug!("Thread pool running {} workers", count);
        Ok(())
    }

    pub fn thread_count(&self) -> usize {
        self.workers.len()
    }

    /// Queue `job` on worker `worker`. Never waits for the job to run.
    pub fn add_job<F>(&self, worker: usize, job: F) -> Result<(), PoolError>
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        let target = self.workers.get(worker).ok_or(PoolError::NoSuchWorker {
            index: worker,
            count: self.workers.len(),
        })?;
        target.add_job(Box::new(job));
        Ok(())
    }

    /// Block until every worker has drained its queue.
    ///
    /// Reports the jobs that failed since the previous call.
    pub fn wait(&self) -> Result<(), PoolError> {
        for worker in &self.workers {
            worker.wait();
        }

        let failures: Vec<JobFailure> = self
            .workers
            .iter()
            .flat_map(Worker::take_failures)
            .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(PoolError::JobsFailed(failures))
        }
    }
}

pub fn available_parallelism() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn every_job_runs_exactly_once() {
        let pool = ThreadPool::new(4).unwrap();
        let counters: Arc<Vec<AtomicUsize>> =
            Arc::new((0..1000).map(|_| AtomicUsize::new(0)).collect());

        for job in 0..1000 {
            let counters = Arc::clone(&counters);
            pool.add_job(job % 4, move || {
                counters[job].fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        }
        pool.wait().unwrap();

        assert!(counters.iter().all(|c| c.load(Ordering::SeqCst) == 1));
    }

    #[test]
    fn wait_covers_random_batches() {
        let mut rng = StdRng::seed_from_u64(7);
        let pool = ThreadPool::new(3).unwrap();
        let total = Arc::new(AtomicUsize::new(0));
        let mut expected = 0;

        for _ in 0..25 {
            let batch = rng.gen_range(0..64);
            for _ in 0..batch {
                let worker = rng.gen_range(0..pool.thread_count());
                let amount = rng.gen_range(1..10);
                let sleep = rng.gen_range(0..50);
                expected += amount;

                let total = Arc::clone(&total);
                pool.add_job(worker, move || {
                    thread::sleep(Duration::from_micros(sleep));
                    total.fetch_add(amount, Ordering::SeqCst);
                    Ok(())
                })
                .unwrap();
            }

            pool.wait().unwrap();
            assert_eq!(total.load(Ordering::SeqCst), expected);
        }
    }

    #[test]
    fn jobs_on_one_worker_run_in_order() {
        let pool = ThreadPool::new(2).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..200 {
            let order = Arc::clone(&order);
            pool.add_job(1, move || {
                order.lock().push(i);
                Ok(())
            })
            .unwrap();
        }
        pool.wait().unwrap();

        let order = order.lock();
        assert_eq!(*order, (0..200).collect::<Vec<_>>());
    }

    #[test]
    fn rejects_unknown_worker_and_empty_pool() {
        let pool = ThreadPool::new(2).unwrap();
        let err = pool.add_job(2, || Ok(())).unwrap_err();
        assert!(matches!(err, PoolError::NoSuchWorker { index: 2, count: 2 }));

        assert!(matches!(ThreadPool::new(0), Err(PoolError::NoWorkers)));
    }

    #[test]
    fn failing_jobs_are_reported_and_worker_survives() {
        let pool = ThreadPool::new(2).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));

        pool.add_job(0, || anyhow::bail!("bad object")).unwrap();
        pool.add_job(1, || panic!("boom")).unwrap();
        for worker in 0..2 {
            let ran = Arc::clone(&ran);
            pool.add_job(worker, move || {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        }

        match pool.wait() {
            Err(PoolError::JobsFailed(failures)) => {
                assert_eq!(failures.len(), 2);
                assert!(failures.iter().any(|f| f.worker == 0 && f.message.contains("bad object")));
                assert!(failures.iter().any(|f| f.worker == 1 && f.message.contains("boom")));
            }
            other => panic!("expected JobsFailed, got {:?}", other),
        }
        assert_eq!(ran.load(Ordering::SeqCst), 2);

        // Failures are reported once
        pool.wait().unwrap();
    }

    #[test]
    fn dropping_the_pool_drains_queued_jobs() {
        let done = Arc::new(AtomicUsize::new(0));
        {
            let pool = ThreadPool::new(2).unwrap();
            for i in 0..100 {
                let done = Arc::clone(&done);
                pool.add_job(i % 2, move || {
                    thread::sleep(Duration::from_micros(100));
                    done.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .unwrap();
            }
        }
        assert_eq!(done.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn resizing_keeps_already_queued_work() {
        let done = Arc::new(AtomicUsize::new(0));
        let mut pool = ThreadPool::new(1).unwrap();
        for _ in 0..20 {
            let done = Arc::clone(&done);
            pool.add_job(0, move || {
                done.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        }

        pool.set_thread_count(3).unwrap();
        assert_eq!(pool.thread_count(), 3);
        assert_eq!(done.load(Ordering::SeqCst), 20);

        pool.add_job(2, || Ok(())).unwrap();
        pool.wait().unwrap();
    }

    #[test]
    fn failed_resize_keeps_the_old_workers() {
        let mut pool = ThreadPool::new(2).unwrap();

        let err = pool
            .replace_workers(4, |index| {
                if index == 2 {
                    Err(std::io::Error::other("out of threads").into())
                } else {
                    Worker::spawn(index)
                }
            })
            .unwrap_err();
        assert!(matches!(err, PoolError::Spawn(_)));
        assert_eq!(pool.thread_count(), 2);

        let ran = Arc::new(AtomicUsize::new(0));
        for worker in 0..2 {
            let ran = Arc::clone(&ran);
            pool.add_job(worker, move || {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        }
        pool.wait().unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 2);
    }
}
