//! Background execution contexts.

use std::{
    any::Any,
    io, mem,
    panic::{self, resume_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    thread::{self, JoinHandle},
};

use crossbeam_channel::Sender;

use crate::context::{Affinity, Context};

pub(crate) type Job = Box<dyn FnOnce(&Context) + Send + 'static>;

/// A builder object that can be used to configure and spawn a [`BackgroundPool`].
#[derive(Clone)]
pub struct PoolBuilder {
    name: String,
    threads: usize,
}

impl PoolBuilder {
    /// Sets the base name of the pool threads.
    ///
    /// Each thread (and the [`Context`] it lends to jobs) is named after this base name and its
    /// index. Defaults to `"background"`.
    pub fn name<N: Into<String>>(self, name: N) -> Self {
        Self {
            name: name.into(),
            ..self
        }
    }

    /// Sets the number of worker threads. Defaults to 2, which lets both sides of a join run at
    /// the same time.
    #[inline]
    pub fn threads(self, threads: usize) -> Self {
        Self { threads, ..self }
    }

    /// Spawns the [`BackgroundPool`].
    ///
    /// # Panics
    ///
    /// Panics if the thread count is 0.
    pub fn spawn(self) -> io::Result<BackgroundPool> {
        assert_ne!(self.threads, 0, "a background pool needs at least 1 thread");

        let shared = Arc::new(Shared {
            name: self.name.clone(),
            poisoned: AtomicBool::new(false),
            panic: Mutex::new(None),
        });
        let (sender, recv) = crossbeam_channel::unbounded::<Job>();
        let mut handles = Vec::with_capacity(self.threads);
        for i in 0..self.threads {
            let name = format!("{}-{i}", self.name);
            let recv = recv.clone();
            let shared = shared.clone();
            let context = Context::new(Affinity::Background, name.as_str());
            let handle = thread::Builder::new().name(name.clone()).spawn(move || {
                log::trace!("pool thread '{name}' starting");
                let _exit = ExitLog(name);
                for job in recv {
                    if shared.is_poisoned() {
                        log::debug!("pool '{}' is poisoned, dropping queued job", shared.name);
                        drop(job);
                        continue;
                    }
                    let run = AssertUnwindSafe(|| job(&context));
                    if let Err(payload) = panic::catch_unwind(run) {
                        shared.poison(payload);
                    }
                }
            })?;
            handles.push(handle);
        }

        Ok(BackgroundPool {
            spawner: Some(Spawner {
                sender,
                shared: shared.clone(),
            }),
            shared,
            handles,
        })
    }
}

struct ExitLog(String);

impl Drop for ExitLog {
    fn drop(&mut self) {
        log::trace!("pool thread '{}' exiting", self.0);
    }
}

struct Shared {
    name: String,
    /// Set once any job panics. A poisoned pool refuses new jobs and drops queued ones.
    poisoned: AtomicBool,
    /// Payload of the first job that panicked. Jobs are expected to catch their own operational
    /// panics, so anything landing here is a contract violation or a bug in this crate.
    panic: Mutex<Option<Box<dyn Any + Send>>>,
}

impl Shared {
    fn poison(&self, payload: Box<dyn Any + Send>) {
        log::error!("background pool '{}' poisoned by a panicking job", self.name);
        let mut slot = self.panic.lock().unwrap_or_else(PoisonError::into_inner);
        // Keep the first payload; it is the root cause.
        if slot.is_none() && !self.is_poisoned() {
            *slot = Some(payload);
        }
        self.poisoned.store(true, Ordering::Release);
    }

    fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    fn take(&self) -> Option<Box<dyn Any + Send>> {
        self.panic
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

/// A cloneable handle that submits jobs to a [`BackgroundPool`] without owning it.
///
/// Jobs that need to schedule follow-up work on a pool hold a [`Spawner`] rather than the pool
/// itself, so that a pool is never dropped (and joined) from one of its own threads.
#[derive(Clone)]
pub(crate) struct Spawner {
    sender: Sender<Job>,
    shared: Arc<Shared>,
}

impl Spawner {
    /// Queues `job` for execution on one of the pool threads.
    ///
    /// Never blocks.
    ///
    /// # Panics
    ///
    /// Panics if a job on this pool has panicked before. The first such call propagates the
    /// original panic payload, every later one panics with a message naming the pool. `job` is
    /// dropped without running.
    pub(crate) fn spawn(&self, job: Job) {
        if self.shared.is_poisoned() {
            drop(job);
            match self.shared.take() {
                Some(payload) => resume_unwind(payload),
                None => panic!(
                    "background pool '{}' was poisoned by an earlier panic",
                    self.shared.name
                ),
            }
        }
        if self.sender.send(job).is_err() {
            unreachable!("pool threads only exit once every sender is gone");
        }
    }
}

/// An owned set of worker threads that run blocking jobs, the crate's background context.
///
/// Each thread owns its own [`Context`] token with [`Affinity::Background`], which is lent to
/// every job the thread executes.
///
/// This type enforces structured concurrency: when it's dropped, the job queue is closed and all
/// threads are joined after they finish the jobs already queued.
///
/// If a job panics with a payload that was not recovered (such as a [`ContractViolation`]), the
/// pool is poisoned for good. Jobs still in the queue are dropped without running, and every later
/// [`BackgroundPool::execute`] panics. The original payload is forwarded to whichever thread
/// submits the next job or drops the pool first.
///
/// [`ContractViolation`]: crate::ContractViolation
pub struct BackgroundPool {
    spawner: Option<Spawner>,
    shared: Arc<Shared>,
    handles: Vec<JoinHandle<()>>,
}

impl Drop for BackgroundPool {
    fn drop(&mut self) {
        // Close our end of the channel. Threads exit once every `Spawner` clone is gone too.
        drop(self.spawner.take());

        self.wait_for_exit();
    }
}

impl BackgroundPool {
    /// Returns a builder that can be used to configure and spawn a [`BackgroundPool`].
    #[inline]
    pub fn builder() -> PoolBuilder {
        PoolBuilder {
            name: "background".into(),
            threads: 2,
        }
    }

    fn wait_for_exit(&mut self) {
        let mut payload = None;
        for handle in mem::take(&mut self.handles) {
            if let Err(pl) = handle.join() {
                payload.get_or_insert(pl);
            }
        }
        if let Some(payload) = self.shared.take().or(payload) {
            if !thread::panicking() {
                resume_unwind(payload);
            }
        }
    }

    /// Returns the base name of the pool's threads.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Returns the number of worker threads.
    pub fn threads(&self) -> usize {
        self.handles.len()
    }

    /// Runs `job` on one of the pool threads, passing it the thread's [`Context`].
    ///
    /// # Panics
    ///
    /// Panics if an earlier job on this pool panicked. See [`BackgroundPool`] for details.
    pub fn execute<F>(&self, job: F)
    where
        F: FnOnce(&Context) + Send + 'static,
    {
        self.spawner().spawn(Box::new(job));
    }

    pub(crate) fn spawner(&self) -> &Spawner {
        // Only `None` while dropping.
        self.spawner.as_ref().unwrap()
    }
}
