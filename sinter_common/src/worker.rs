//! Dedicated worker threads.
//!
//! A [`DedicatedWorker`] is a named OS thread draining a bounded job channel
//! with concurrency one: whatever state its body closure owns is touched by
//! that thread only. An optional tick turns idle time into timer events.
//! [`FixedPool`] is a small fixed set of such workers used to fan out a
//! batch of jobs and join on the results.
//!
//! With the `rt` feature, [`pin_current_thread`] pins the calling thread to a
//! CPU core and switches it to `SCHED_FIFO`; without it, the call is a no-op.

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Worker failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkerError {
    /// The worker thread has exited.
    #[error("worker '{0}' stopped")]
    Stopped(String),
    /// The job queue is full.
    #[error("worker '{0}' queue full")]
    Full(String),
    /// Thread creation failed.
    #[error("failed to spawn worker: {0}")]
    Spawn(String),
    /// CPU pinning or scheduler change failed.
    #[error("real-time setup failed: {0}")]
    RtSetup(String),
}

/// What the worker body is woken for.
#[derive(Debug)]
pub enum WorkerEvent<J> {
    Job(J),
    /// The tick interval elapsed without a job.
    Tick,
}

/// Thread placement for a dedicated worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Placement {
    pub cpu: Option<usize>,
    pub rt_priority: Option<i32>,
}

/// Single-concurrency worker thread.
pub struct DedicatedWorker<J: Send + 'static> {
    name: String,
    tx: Option<Sender<J>>,
    handle: Option<JoinHandle<()>>,
}

impl<J: Send + 'static> DedicatedWorker<J> {
    /// Spawn a worker with a job queue of `capacity`.
    ///
    /// `body` runs for every job, and for every `tick` of idleness when a
    /// tick is given. The worker exits once all senders are gone.
    pub fn spawn<F>(
        name: impl Into<String>,
        capacity: usize,
        tick: Option<Duration>,
        placement: Placement,
        mut body: F,
    ) -> Result<Self, WorkerError>
    where
        F: FnMut(WorkerEvent<J>) + Send + 'static,
    {
        let name = name.into();
        let (tx, rx): (Sender<J>, Receiver<J>) = channel::bounded(capacity.max(1));
        let thread_name = name.clone();
        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                if placement.cpu.is_some() || placement.rt_priority.is_some() {
                    if let Err(e) = pin_current_thread(placement.cpu, placement.rt_priority) {
                        warn!(worker = %thread_name, error = %e, "worker placement failed, continuing unpinned");
                    }
                }
                debug!(worker = %thread_name, "worker started");
                loop {
                    let event = match tick {
                        Some(interval) => match rx.recv_timeout(interval) {
                            Ok(job) => WorkerEvent::Job(job),
                            Err(RecvTimeoutError::Timeout) => WorkerEvent::Tick,
                            Err(RecvTimeoutError::Disconnected) => break,
                        },
                        None => match rx.recv() {
                            Ok(job) => WorkerEvent::Job(job),
                            Err(_) => break,
                        },
                    };
                    body(event);
                }
                debug!(worker = %thread_name, "worker stopped");
            })
            .map_err(|e| WorkerError::Spawn(e.to_string()))?;
        Ok(Self {
            name,
            tx: Some(tx),
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue a job, blocking while the queue is full.
    pub fn submit(&self, job: J) -> Result<(), WorkerError> {
        match &self.tx {
            Some(tx) => tx
                .send(job)
                .map_err(|_| WorkerError::Stopped(self.name.clone())),
            None => Err(WorkerError::Stopped(self.name.clone())),
        }
    }

    /// Queue a job without blocking.
    pub fn try_submit(&self, job: J) -> Result<(), WorkerError> {
        match &self.tx {
            Some(tx) => tx.try_send(job).map_err(|e| match e {
                TrySendError::Full(_) => WorkerError::Full(self.name.clone()),
                TrySendError::Disconnected(_) => WorkerError::Stopped(self.name.clone()),
            }),
            None => Err(WorkerError::Stopped(self.name.clone())),
        }
    }

    /// Close the queue and join the thread. Queued jobs still run.
    pub fn shutdown(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!(worker = %self.name, "worker panicked");
            }
        }
    }
}

impl<J: Send + 'static> Drop for DedicatedWorker<J> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

type PoolTask = Box<dyn FnOnce() + Send + 'static>;

/// Fixed set of dedicated workers.
pub struct FixedPool {
    workers: Vec<DedicatedWorker<PoolTask>>,
    cursor: AtomicUsize,
}

impl FixedPool {
    pub fn new(name: &str, size: usize) -> Result<Self, WorkerError> {
        let workers = (0..size.max(1))
            .map(|i| {
                DedicatedWorker::spawn(
                    format!("{name}-{i}"),
                    64,
                    None,
                    Placement::default(),
                    |event: WorkerEvent<PoolTask>| {
                        if let WorkerEvent::Job(task) = event {
                            task();
                        }
                    },
                )
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            workers,
            cursor: AtomicUsize::new(0),
        })
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Fire-and-forget: queue `task` on the next worker, round robin.
    pub fn execute<F>(&self, task: F) -> Result<(), WorkerError>
    where
        F: FnOnce() + Send + 'static,
    {
        let i = self.cursor.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        self.workers[i].submit(Box::new(task))
    }

    /// Run job `i` on worker `i % size` and return results in job order.
    ///
    /// Blocks until every job has finished. A job that panics surfaces as
    /// [`WorkerError::Stopped`].
    pub fn run_all<T, F>(&self, jobs: Vec<F>) -> Result<Vec<T>, WorkerError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let count = jobs.len();
        let (tx, rx) = channel::bounded::<(usize, T)>(count);
        for (i, job) in jobs.into_iter().enumerate() {
            let tx = tx.clone();
            let worker = &self.workers[i % self.workers.len()];
            worker.submit(Box::new(move || {
                let _ = tx.send((i, job()));
            }))?;
        }
        drop(tx);

        let mut slots: Vec<Option<T>> = (0..count).map(|_| None).collect();
        for _ in 0..count {
            let (i, value) = rx
                .recv()
                .map_err(|_| WorkerError::Stopped("pool".to_string()))?;
            slots[i] = Some(value);
        }
        slots
            .into_iter()
            .map(|slot| slot.ok_or_else(|| WorkerError::Stopped("pool".to_string())))
            .collect()
    }
}

// ─── Real-time placement ────────────────────────────────────────────

#[cfg(feature = "rt")]
fn rt_set_affinity(cpu: usize) -> Result<(), WorkerError> {
    use nix::sched::{CpuSet, sched_setaffinity};
    use nix::unistd::Pid;

    let mut cpuset = CpuSet::new();
    cpuset
        .set(cpu)
        .map_err(|e| WorkerError::RtSetup(format!("CpuSet::set({cpu}) failed: {e}")))?;
    sched_setaffinity(Pid::from_raw(0), &cpuset)
        .map_err(|e| WorkerError::RtSetup(format!("sched_setaffinity failed: {e}")))?;
    Ok(())
}

#[cfg(not(feature = "rt"))]
fn rt_set_affinity(_cpu: usize) -> Result<(), WorkerError> {
    Ok(()) // No-op in simulation mode
}

#[cfg(feature = "rt")]
fn rt_set_scheduler(priority: i32) -> Result<(), WorkerError> {
    let param = libc::sched_param {
        sched_priority: priority,
    };
    let ret = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        return Err(WorkerError::RtSetup(format!(
            "sched_setscheduler(SCHED_FIFO, {priority}) failed: {err}"
        )));
    }
    Ok(())
}

#[cfg(not(feature = "rt"))]
fn rt_set_scheduler(_priority: i32) -> Result<(), WorkerError> {
    Ok(()) // No-op in simulation mode
}

/// Pin the calling thread and optionally raise it to `SCHED_FIFO`.
pub fn pin_current_thread(cpu: Option<usize>, rt_priority: Option<i32>) -> Result<(), WorkerError> {
    if let Some(cpu) = cpu {
        rt_set_affinity(cpu)?;
    }
    if let Some(priority) = rt_priority {
        rt_set_scheduler(priority)?;
    }
    Ok(())
}
