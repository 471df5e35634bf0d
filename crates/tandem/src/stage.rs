//! Asynchronous single-slot inference stages.
//!
//! A [`StageWorker`] owns an [`ExecutionResource`] (a loaded network, possibly bound to an
//! accelerator) and runs it on a dedicated thread. Communication with the thread goes through two
//! one-element cells:
//!
//! - the *pending slot*, holding the job that is waiting for or undergoing execution, and
//! - the *result slot*, holding the latest finished result until somebody takes it.
//!
//! None of the methods used by the scheduler ([`StageWorker::is_ready_for_new_job`],
//! [`StageWorker::submit`], [`StageWorker::try_take_result`]) block on the computation. A stage
//! that is still busy simply refuses new work, and the caller decides what to do with it. This is
//! what lets capture, inference, and display overlap without ever queueing more than one job per
//! stage.

use std::{
    any::Any,
    borrow::Cow,
    fmt, io, mem,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam::channel::{self, Receiver, Select, Sender};

use crate::drop::defer;
use crate::job::{Extras, Job, JobResult};
use crate::nn::{Feeds, Tensor};

/// A computation that a [`StageWorker`] runs for each submitted [`Job`].
///
/// The resource is moved onto the worker's thread and is never touched from anywhere else, so it
/// does not need to be [`Sync`].
pub trait ExecutionResource: Send + 'static {
    /// Computes the outputs named by `fetches` from `inputs`.
    ///
    /// Must return exactly one tensor per fetch, in the same order.
    fn run(&mut self, fetches: &[String], inputs: &Feeds) -> anyhow::Result<Vec<Tensor>>;
}

impl<F> ExecutionResource for F
where
    F: FnMut(&[String], &Feeds) -> anyhow::Result<Vec<Tensor>> + Send + 'static,
{
    fn run(&mut self, fetches: &[String], inputs: &Feeds) -> anyhow::Result<Vec<Tensor>> {
        self(fetches, inputs)
    }
}

/// Identifies a stage in log messages and in the timestamp keys it adds to [`Extras`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StageId(Cow<'static, str>);

impl StageId {
    /// The first stage, fed with camera frames.
    pub const FAST: Self = Self(Cow::Borrowed("fast"));
    /// The optional second stage, fed with the first stage's intermediate outputs.
    pub const SLOW: Self = Self(Cow::Borrowed("slow"));

    pub fn new(name: impl Into<String>) -> Self {
        Self(Cow::Owned(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The [`Extras`] key under which the stage records when a job was accepted.
    pub fn in_time_key(&self) -> String {
        format!("{}_in_time", self.0)
    }

    /// The [`Extras`] key under which the stage records when a job's computation finished.
    pub fn out_time_key(&self) -> String {
        format!("{}_out_time", self.0)
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A job that a stage failed to execute.
///
/// These never bring down the stage: the worker keeps accepting jobs afterwards.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("stage `{stage}` failed to execute job")]
    Execution {
        stage: StageId,
        #[source]
        source: anyhow::Error,
    },
    #[error("stage `{stage}` panicked while executing job: {message}")]
    Panicked { stage: StageId, message: String },
}

impl StageError {
    pub fn stage(&self) -> &StageId {
        match self {
            Self::Execution { stage, .. } | Self::Panicked { stage, .. } => stage,
        }
    }
}

/// Outcome of [`StageWorker::submit`].
#[derive(Debug)]
#[must_use]
pub enum Submission {
    /// The job was stored in the pending slot and the execution loop was woken up.
    Accepted,
    /// The stage already has a job pending or running. The job is handed back untouched.
    Busy(Job),
    /// The stage has been stopped. The job is handed back untouched.
    Stopped(Job),
}

impl Submission {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }
}

/// Counters describing what happened to the jobs offered to a stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageStats {
    pub accepted: u64,
    /// Submissions refused because the stage was busy.
    pub rejected: u64,
    /// Finished results that were discarded unread because a newer job was accepted.
    pub superseded: u64,
}

type Published = Result<JobResult, StageError>;

enum Slot {
    Empty,
    Pending(Job),
    Running,
}

struct State {
    slot: Slot,
    stopped: bool,
}

struct Shared {
    state: Mutex<State>,
    wake: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        // The lock is never held across user code, so poisoning cannot leave the state torn.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A handle to a stage's execution thread.
///
/// Dropping the handle stops the stage and joins its thread (see [`StageWorker::stop`]).
pub struct StageWorker {
    id: StageId,
    shared: Arc<Shared>,
    results: Receiver<Published>,
    handle: Option<JoinHandle<()>>,
    stats: StageStats,
}

impl StageWorker {
    /// Spawns the execution thread for a stage, moving `resource` onto it.
    pub fn spawn<R: ExecutionResource>(id: StageId, resource: R) -> io::Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                slot: Slot::Empty,
                stopped: false,
            }),
            wake: Condvar::new(),
        });
        // Capacity 1: a stage never has more than one unpublished result, so publishing never
        // blocks.
        let (sender, results) = channel::bounded(1);

        let handle = thread::Builder::new().name(format!("stage {id}")).spawn({
            let id = id.clone();
            let shared = shared.clone();
            move || execution_loop(id, resource, &shared, sender)
        })?;

        Ok(Self {
            id,
            shared,
            results,
            handle: Some(handle),
            stats: StageStats::default(),
        })
    }

    pub fn id(&self) -> &StageId {
        &self.id
    }

    pub fn stats(&self) -> StageStats {
        self.stats
    }

    /// Returns whether the stage would accept a job right now.
    ///
    /// This is `true` iff no job is pending or running and the stage has not been stopped.
    pub fn is_ready_for_new_job(&self) -> bool {
        let state = self.shared.lock();
        !state.stopped && matches!(state.slot, Slot::Empty)
    }

    /// Offers a job to the stage.
    ///
    /// The job is only accepted when the pending slot is empty; otherwise nothing changes and the
    /// job is returned in [`Submission::Busy`]. On acceptance, the entry timestamp
    /// `<stage>_in_time` is recorded, any finished result nobody took yet is discarded, and the
    /// execution loop is woken up.
    pub fn submit(&mut self, fetches: Vec<String>, inputs: Feeds, extras: Extras) -> Submission {
        self.submit_job(Job::new(fetches, inputs, extras))
    }

    /// Like [`StageWorker::submit`], for an already assembled [`Job`].
    pub fn submit_job(&mut self, mut job: Job) -> Submission {
        let mut state = self.shared.lock();
        if state.stopped {
            return Submission::Stopped(job);
        }
        if !matches!(state.slot, Slot::Empty) {
            self.stats.rejected += 1;
            return Submission::Busy(job);
        }

        // The worker publishes before it empties the slot, so any result of the previous job is
        // already visible here.
        if self.results.try_recv().is_ok() {
            log::trace!("stage `{}`: discarding unread result", self.id);
            self.stats.superseded += 1;
        }

        job.extras.stamp(self.id.in_time_key());
        state.slot = Slot::Pending(job);
        self.stats.accepted += 1;
        drop(state);

        self.shared.wake.notify_one();
        Submission::Accepted
    }

    /// Takes the latest finished result, if there is one. Never blocks.
    pub fn try_take_result(&mut self) -> Option<Result<JobResult, StageError>> {
        self.results.try_recv().ok()
    }

    /// Blocks until a result is available or `timeout` has passed, without taking the result.
    ///
    /// Returns whether a result is available.
    pub fn wait_for_result(&self, timeout: Duration) -> bool {
        wait_for_any([self], timeout)
    }

    /// Stops the execution thread and waits for it to exit.
    ///
    /// A job that is currently running is finished first. A job that is pending but was not yet
    /// picked up is discarded. Calling this more than once has no effect.
    ///
    /// If the thread has panicked outside of a job, the panic is propagated to the caller.
    pub fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };

        self.shared.lock().stopped = true;
        self.shared.wake.notify_all();

        match handle.join() {
            Ok(()) => log::debug!("stage `{}` stopped", self.id),
            Err(payload) => {
                if !thread::panicking() {
                    panic::resume_unwind(payload);
                }
            }
        }
    }

    /// Returns whether [`StageWorker::stop`] has been called.
    pub fn is_stopped(&self) -> bool {
        self.handle.is_none()
    }
}

impl Drop for StageWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for StageWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageWorker")
            .field("id", &self.id)
            .field("stats", &self.stats)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Blocks until any of `stages` has a result available, or `timeout` passes.
///
/// Results are not taken. Returns whether a result became available.
pub fn wait_for_any<'a, I>(stages: I, timeout: Duration) -> bool
where
    I: IntoIterator<Item = &'a StageWorker>,
{
    let mut select = Select::new();
    let mut any = false;
    for stage in stages {
        select.recv(&stage.results);
        any = true;
    }
    if !any {
        thread::sleep(timeout);
        return false;
    }
    select.ready_timeout(timeout).is_ok()
}

fn execution_loop<R: ExecutionResource>(
    id: StageId,
    mut resource: R,
    shared: &Shared,
    results: Sender<Published>,
) {
    log::trace!("stage `{id}` starting");
    let _guard = defer(|| log::trace!("stage `{id}` exiting"));

    loop {
        let job = {
            let mut state = shared.lock();
            loop {
                if state.stopped {
                    if let Slot::Pending(job) = mem::replace(&mut state.slot, Slot::Empty) {
                        log::debug!(
                            "stage `{id}`: dropping unstarted job (frame {:?}) at shutdown",
                            job.extras.seq(),
                        );
                    }
                    return;
                }
                match mem::replace(&mut state.slot, Slot::Running) {
                    Slot::Pending(job) => break job,
                    other => state.slot = other,
                }
                state = shared
                    .wake
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };

        let result = execute(&id, &mut resource, job);
        if let Err(e) = &result {
            log::warn!("{e}");
        }
        if results.try_send(result).is_err() {
            // `submit` drains the slot before accepting a job, so this means the receiving
            // `StageWorker` is gone.
            log::error!("stage `{id}`: result slot unavailable, discarding result");
        }

        shared.lock().slot = Slot::Empty;
    }
}

fn execute<R: ExecutionResource>(id: &StageId, resource: &mut R, job: Job) -> Published {
    let Job {
        fetches,
        inputs,
        mut extras,
    } = job;

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| resource.run(&fetches, &inputs)));
    extras.stamp(id.out_time_key());

    match outcome {
        Ok(Ok(outputs)) if outputs.len() == fetches.len() => Ok(JobResult { outputs, extras }),
        Ok(Ok(outputs)) => Err(StageError::Execution {
            stage: id.clone(),
            source: anyhow::anyhow!(
                "computation returned {} outputs for {} fetches",
                outputs.len(),
                fetches.len(),
            ),
        }),
        Ok(Err(source)) => Err(StageError::Execution {
            stage: id.clone(),
            source,
        }),
        Err(payload) => Err(StageError::Panicked {
            stage: id.clone(),
            message: panic_message(&*payload),
        }),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}
