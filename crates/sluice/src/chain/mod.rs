mod stats;

use std::{
    io,
    sync::{
        Arc, Condvar, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::JoinHandle,
    time::Duration,
};

use sluice_communication::{Bqueue, PoolError};
use sluice_utils::ThreadKick;
use sluice_vbs::VbsError;
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub use stats::ChainStats;

use crate::errorspool::ErrorSpool;

/// Error escaping a stage body. The chain catches it, drives cancelled
/// teardown and records it in the error spool.
#[derive(Error, Debug)]
pub enum StepError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Vbs(#[from] VbsError),
    #[error("{0}")]
    Stage(String),
}

impl StepError {
    /// Control-reply error code this failure maps to: I/O trouble is 4,
    /// everything else is an internal invariant violation, 5.
    pub fn code(&self) -> u32 {
        match self {
            Self::Io(_) | Self::Vbs(_) => 4,
            Self::Pool(_) | Self::Stage(_) => 5,
        }
    }
}

#[derive(Error, Debug)]
pub enum ChainError {
    #[error("chain not in a runnable state")]
    NotRunnable,
    #[error("couldn't start step {name}: {err}")]
    Spawn { name: String, err: io::Error },
    #[error("step {name}: {err}")]
    Step { name: String, err: StepError },
}

/// How long an args-waiting stage sleeps between looks at the cancel flag.
const ARGS_POLL: Duration = Duration::from_millis(100);

type QueueCtl = Arc<dyn QueueControl>;

/// Type-erased control surface of one inter-stage queue, so the chain can
/// disable edges without knowing their element types.
trait QueueControl: Send + Sync {
    fn enable(&self);
    fn disable(&self);
    fn delayed_disable(&self);
}

struct Edge<T> {
    q: Arc<Bqueue<T>>,
    capacity: usize,
}

impl<T: Send> QueueControl for Edge<T> {
    fn enable(&self) {
        self.q.resize_enable(self.capacity);
    }

    fn disable(&self) {
        self.q.disable();
    }

    fn delayed_disable(&self) {
        self.q.delayed_disable();
    }
}

/// State shared by the chain object and all its stage threads.
struct Shared {
    cancelled: AtomicBool,
    draining: AtomicBool,
    queues: Mutex<Vec<QueueCtl>>,
    kicks: Mutex<Vec<(usize, ThreadKick)>>,
    spool: Mutex<Option<Arc<ErrorSpool>>>,
}

impl Shared {
    fn new() -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            draining: AtomicBool::new(false),
            queues: Mutex::new(Vec::new()),
            kicks: Mutex::new(Vec::new()),
            spool: Mutex::new(None),
        }
    }

    fn enable_all(&self) {
        for q in self.queues.lock().unwrap().iter() {
            q.enable();
        }
    }

    fn delayed_disable_head(&self) {
        if let Some(head) = self.queues.lock().unwrap().first() {
            head.delayed_disable();
        }
    }

    /// Cancelled teardown: flag, disable every edge, then poke every stage
    /// thread out of whatever syscall it sits in.
    fn cancel(&self, me: Option<usize>) {
        self.cancelled.store(true, Ordering::Relaxed);
        for q in self.queues.lock().unwrap().iter() {
            q.disable();
        }
        for (id, kick) in self.kicks.lock().unwrap().iter() {
            if Some(*id) != me {
                kick.kick();
            }
        }
    }

    fn fail(&self, step_id: usize, name: &str, err: &StepError) {
        error!(step = name, %err, "step failed, cancelling chain");
        if let Some(spool) = self.spool.lock().unwrap().as_ref() {
            spool.push(err.code(), &format!("{name}: {err}"));
        }
        self.cancel(Some(step_id));
    }

    fn register_kick(&self, step_id: usize) {
        self.kicks.lock().unwrap().push((step_id, ThreadKick::current()));
    }

    fn unregister_kick(&self, step_id: usize) {
        self.kicks.lock().unwrap().retain(|(id, _)| *id != step_id);
    }
}

/// Per-stage context: the argument record under its lock, the chain cancel
/// flag and this step's stat counter.
pub struct StageCtx<A> {
    args: Mutex<A>,
    changed: Condvar,
    shared: Arc<Shared>,
    counter: Arc<AtomicU64>,
}

/// Handle kept by command code to talk to a running stage.
pub type StepHandle<A> = Arc<StageCtx<A>>;

impl<A> StageCtx<A> {
    pub fn cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::Relaxed)
    }

    /// True once graceful stop started; producers give up waiting for work.
    pub fn draining(&self) -> bool {
        self.shared.draining.load(Ordering::Relaxed) || self.cancelled()
    }

    /// Add to this step's byte counter.
    pub fn count(&self, bytes: u64) {
        self.counter.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn total(&self) -> u64 {
        self.counter.load(Ordering::Relaxed)
    }

    /// Run `f` over the argument record under its lock and wake any stage
    /// blocked in [`wait_args`](Self::wait_args). This is how command
    /// handlers communicate with running stages.
    pub fn with_args<R>(&self, f: impl FnOnce(&mut A) -> R) -> R {
        let mut args = self.args.lock().unwrap();
        let r = f(&mut args);
        drop(args);
        self.changed.notify_all();
        r
    }

    /// Park until `pred` yields a value or the chain starts draining or is
    /// cancelled (then `None`).
    pub fn wait_args<R>(&self, mut pred: impl FnMut(&mut A) -> Option<R>) -> Option<R> {
        let mut args = self.args.lock().unwrap();
        loop {
            if let Some(r) = pred(&mut args) {
                return Some(r);
            }
            if self.draining() {
                return None;
            }
            args = self.changed.wait_timeout(args, ARGS_POLL).unwrap().0;
        }
    }
}

type Runner = Box<dyn FnOnce() -> Result<(), StepError> + Send + 'static>;

struct Step {
    name: String,
    runner: Option<Runner>,
    handle: Option<JoinHandle<Result<(), StepError>>>,
    finalizer: Option<Box<dyn FnOnce() + Send + 'static>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ChainState {
    Configured,
    Running,
    Joined,
}

/// A linear pipeline of stages with typed bounded queues between them.
///
/// Composed with [`ChainBuilder`], which tracks the element type flowing
/// out of the tail stage so producer and consumer of every edge agree at
/// compile time. Immutable once [`run`](Chain::run) has started.
pub struct Chain {
    shared: Arc<Shared>,
    steps: Vec<Step>,
    stats: Arc<ChainStats>,
    state: ChainState,
    finalizer: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl Chain {
    pub fn builder() -> ChainBuilder<()> {
        ChainBuilder {
            chain: Self {
                shared: Arc::new(Shared::new()),
                steps: Vec::new(),
                stats: Arc::new(ChainStats::new()),
                state: ChainState::Configured,
                finalizer: None,
            },
            tail: None,
        }
    }

    /// Stage failures end up in this spool.
    pub fn set_error_spool(&self, spool: Arc<ErrorSpool>) {
        *self.shared.spool.lock().unwrap() = Some(spool);
    }

    /// Chain-wide finalizer, invoked after all stage threads joined.
    pub fn set_finalizer(&mut self, f: impl FnOnce() + Send + 'static) {
        self.finalizer = Some(Box::new(f));
    }

    pub fn stats(&self) -> Arc<ChainStats> {
        Arc::clone(&self.stats)
    }

    pub fn is_running(&self) -> bool {
        self.state == ChainState::Running
    }

    /// Enable every queue, then start stage threads consumer-first so no
    /// producer pushes into a queue whose consumer is not yet there.
    /// Start failure unwinds atomically.
    pub fn run(&mut self) -> Result<(), ChainError> {
        if self.state != ChainState::Configured || self.steps.is_empty() {
            return Err(ChainError::NotRunnable);
        }
        self.shared.enable_all();

        for idx in (0..self.steps.len()).rev() {
            let runner = self.steps[idx].runner.take().ok_or(ChainError::NotRunnable)?;
            let name = self.steps[idx].name.clone();
            match std::thread::Builder::new().name(name.clone()).spawn(runner) {
                Ok(handle) => self.steps[idx].handle = Some(handle),
                Err(err) => {
                    warn!(step = %name, %err, "spawn failed, unwinding chain start");
                    self.shared.cancel(None);
                    self.join_threads();
                    self.state = ChainState::Joined;
                    return Err(ChainError::Spawn { name, err });
                }
            }
        }
        self.state = ChainState::Running;
        debug!(steps = self.steps.len(), "chain running");
        Ok(())
    }

    /// Graceful teardown: stop accepting new data at the head, let the
    /// drain ripple through, join everything.
    pub fn stop(&mut self) -> Result<(), ChainError> {
        if self.state != ChainState::Running {
            return Err(ChainError::NotRunnable);
        }
        self.shared.draining.store(true, Ordering::Relaxed);
        self.shared.delayed_disable_head();
        self.join()
    }

    /// Cancelled teardown: disable all queues at once, kick blocked stage
    /// threads, join everything.
    pub fn cancel(&mut self) -> Result<(), ChainError> {
        if self.state != ChainState::Running {
            return Err(ChainError::NotRunnable);
        }
        self.shared.cancel(None);
        self.join()
    }

    /// Join producer-first, run step finalizers and the chain finalizer,
    /// freeze statistics. Returns the first step failure, which has also
    /// been spooled already.
    pub fn join(&mut self) -> Result<(), ChainError> {
        let first_err = self.join_threads();
        for step in &mut self.steps {
            if let Some(f) = step.finalizer.take() {
                f();
            }
        }
        if let Some(f) = self.finalizer.take() {
            f();
        }
        self.state = ChainState::Joined;
        info!("chain joined");
        match first_err {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    fn join_threads(&mut self) -> Option<ChainError> {
        let mut first_err = None;
        for step in &mut self.steps {
            let Some(handle) = step.handle.take() else { continue };
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    if first_err.is_none() {
                        first_err =
                            Some(ChainError::Step { name: step.name.clone(), err });
                    }
                }
                Err(_) => {
                    error!(step = %step.name, "step thread panicked");
                    if first_err.is_none() {
                        first_err = Some(ChainError::Step {
                            name: step.name.clone(),
                            err: StepError::Stage(String::from("stage panicked")),
                        });
                    }
                }
            }
        }
        first_err
    }
}

impl Drop for Chain {
    fn drop(&mut self) {
        if self.state == ChainState::Running {
            self.shared.cancel(None);
            let _ = self.join();
        }
    }
}

/// Typestate builder for [`Chain`]; the parameter is the element type
/// flowing out of the current tail stage.
pub struct ChainBuilder<T> {
    chain: Chain,
    tail: Option<Arc<Bqueue<T>>>,
}

impl ChainBuilder<()> {
    /// First stage: producer with an outbound edge of `capacity` blocks.
    pub fn produce<T, A, F>(
        mut self,
        name: &str,
        capacity: usize,
        args: A,
        body: F,
    ) -> (ChainBuilder<T>, StepHandle<A>)
    where
        T: Send + 'static,
        A: Send + 'static,
        F: FnOnce(&Bqueue<T>, &StageCtx<A>) -> Result<(), StepError> + Send + 'static,
    {
        let outq = self.chain.new_edge(capacity);
        let (ctx, step_id) = self.chain.new_ctx(name, args);

        let shared = Arc::clone(&self.chain.shared);
        let ctx_thread = Arc::clone(&ctx);
        let q = Arc::clone(&outq);
        self.chain.push_step(name, move || {
            shared.register_kick(step_id);
            let res = body(&q, &ctx_thread);
            match &res {
                Ok(()) => q.delayed_disable(),
                Err(err) => shared.fail(step_id, &thread_name(), err),
            }
            shared.unregister_kick(step_id);
            res
        });

        (ChainBuilder { chain: self.chain, tail: Some(outq) }, ctx)
    }
}

impl<I: Send + 'static> ChainBuilder<I> {
    /// Intermediate stage: consumes the previous edge, produces a new one.
    pub fn step<O, A, F>(
        mut self,
        name: &str,
        capacity: usize,
        args: A,
        body: F,
    ) -> (ChainBuilder<O>, StepHandle<A>)
    where
        O: Send + 'static,
        A: Send + 'static,
        F: FnOnce(&Bqueue<I>, &Bqueue<O>, &StageCtx<A>) -> Result<(), StepError>
            + Send
            + 'static,
    {
        let inq = self.tail.take().expect("builder invariant: tail edge present");
        let outq = self.chain.new_edge(capacity);
        let (ctx, step_id) = self.chain.new_ctx(name, args);

        let shared = Arc::clone(&self.chain.shared);
        let ctx_thread = Arc::clone(&ctx);
        let q = Arc::clone(&outq);
        self.chain.push_step(name, move || {
            shared.register_kick(step_id);
            let res = body(&inq, &q, &ctx_thread);
            match &res {
                Ok(()) => q.delayed_disable(),
                Err(err) => shared.fail(step_id, &thread_name(), err),
            }
            shared.unregister_kick(step_id);
            res
        });

        (ChainBuilder { chain: self.chain, tail: Some(outq) }, ctx)
    }

    /// Final stage; sealing the chain.
    pub fn consume<A, F>(
        mut self,
        name: &str,
        args: A,
        body: F,
    ) -> (Chain, StepHandle<A>)
    where
        A: Send + 'static,
        F: FnOnce(&Bqueue<I>, &StageCtx<A>) -> Result<(), StepError> + Send + 'static,
    {
        let inq = self.tail.take().expect("builder invariant: tail edge present");
        let (ctx, step_id) = self.chain.new_ctx(name, args);

        let shared = Arc::clone(&self.chain.shared);
        let ctx_thread = Arc::clone(&ctx);
        self.chain.push_step(name, move || {
            shared.register_kick(step_id);
            let res = body(&inq, &ctx_thread);
            if let Err(err) = &res {
                shared.fail(step_id, &thread_name(), err);
            }
            shared.unregister_kick(step_id);
            res
        });

        (self.chain, ctx)
    }
}

fn thread_name() -> String {
    std::thread::current().name().unwrap_or("<step>").to_string()
}

impl Chain {
    fn new_edge<T: Send + 'static>(&mut self, capacity: usize) -> Arc<Bqueue<T>> {
        let q = Arc::new(Bqueue::new(capacity));
        self.shared
            .queues
            .lock()
            .unwrap()
            .push(Arc::new(Edge { q: Arc::clone(&q), capacity }));
        q
    }

    fn new_ctx<A: Send + 'static>(
        &mut self,
        name: &str,
        args: A,
    ) -> (StepHandle<A>, usize) {
        let step_id = self.steps.len();
        let ctx = Arc::new(StageCtx {
            args: Mutex::new(args),
            changed: Condvar::new(),
            shared: Arc::clone(&self.shared),
            counter: self.stats.register(name),
        });
        (ctx, step_id)
    }

    fn push_step(
        &mut self,
        name: &str,
        runner: impl FnOnce() -> Result<(), StepError> + Send + 'static,
    ) {
        self.steps.push(Step {
            name: name.to_string(),
            runner: Some(Box::new(runner)),
            handle: None,
            finalizer: None,
        });
    }

    /// Per-step finalizer for the most recently added step.
    pub fn set_step_finalizer(&mut self, f: impl FnOnce() + Send + 'static) {
        if let Some(step) = self.steps.last_mut() {
            step.finalizer = Some(Box::new(f));
        }
    }
}
