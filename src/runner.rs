use std::{
    fmt, io,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use crate::{
    context::Context,
    failure::catching,
    looper::Dispatcher,
    observer::{JoinEvent, JoinId, JoinObserver, LogObserver, Side},
    pool::{BackgroundPool, Spawner},
    promise::{promise, Promise, PromiseHandle},
    Failure,
};

/// How the two tasks of a join are scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JoinStrategy {
    /// Both tasks run one after the other in a single background job, followed by the combine
    /// step. If the first task fails, the second one never runs.
    Sequential,
    /// Both tasks are submitted to the pool right away and run in parallel. The task that
    /// finishes last runs the combine step on its own thread.
    ConcurrentForkJoin,
    /// The second task is forked to the pool, while the first task runs inline on the caller's
    /// context, blocking it.
    ///
    /// Starting such a join from the restricted context would block it, so that fails fast with
    /// [`Failure::RestrictedCaller`] and no task runs.
    CallerAffinitySensitive,
    /// Both tasks are forked to the runner's delegate pool, and the combine step is moved back to
    /// the runner's own pool once both are done.
    DelegatedPool,
}

impl JoinStrategy {
    /// Every strategy, in declaration order.
    pub const ALL: [JoinStrategy; 4] = [
        JoinStrategy::Sequential,
        JoinStrategy::ConcurrentForkJoin,
        JoinStrategy::CallerAffinitySensitive,
        JoinStrategy::DelegatedPool,
    ];
}

impl fmt::Display for JoinStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            JoinStrategy::Sequential => "sequential",
            JoinStrategy::ConcurrentForkJoin => "concurrent fork-join",
            JoinStrategy::CallerAffinitySensitive => "caller-affinity-sensitive",
            JoinStrategy::DelegatedPool => "delegated pool",
        })
    }
}

/// A builder object that can be used to configure and create a [`JoinRunner`].
pub struct RunnerBuilder {
    name: String,
    threads: usize,
    pool: Option<BackgroundPool>,
    delegate: Option<Arc<BackgroundPool>>,
    observer: Arc<dyn JoinObserver>,
}

impl RunnerBuilder {
    /// Sets the base name of the runner's pool threads. Ignored if [`RunnerBuilder::pool`] is
    /// used.
    pub fn name<N: Into<String>>(self, name: N) -> Self {
        Self {
            name: name.into(),
            ..self
        }
    }

    /// Sets the number of threads of the runner's pool. Ignored if [`RunnerBuilder::pool`] is
    /// used.
    #[inline]
    pub fn threads(self, threads: usize) -> Self {
        Self { threads, ..self }
    }

    /// Uses an existing pool as the runner's own pool instead of spawning one.
    ///
    /// The runner takes ownership, and joins the pool when it is dropped.
    pub fn pool(self, pool: BackgroundPool) -> Self {
        Self {
            pool: Some(pool),
            ..self
        }
    }

    /// Sets the shared pool that [`JoinStrategy::DelegatedPool`] forks its tasks onto.
    ///
    /// Without a delegate, that strategy uses the runner's own pool for both roles.
    pub fn delegate(self, delegate: Arc<BackgroundPool>) -> Self {
        Self {
            delegate: Some(delegate),
            ..self
        }
    }

    /// Sets the observer notified of every join's lifecycle. Defaults to [`LogObserver`].
    pub fn observer<O: JoinObserver + 'static>(self, observer: Arc<O>) -> Self {
        Self { observer, ..self }
    }

    /// Creates the [`JoinRunner`], delivering results through `dispatcher`.
    pub fn build(self, dispatcher: Dispatcher) -> io::Result<JoinRunner> {
        let pool = match self.pool {
            Some(pool) => pool,
            None => BackgroundPool::builder()
                .name(self.name)
                .threads(self.threads)
                .spawn()?,
        };
        Ok(JoinRunner {
            pool,
            delegate: self.delegate,
            dispatcher,
            observer: self.observer,
        })
    }
}

/// Runs pairs of blocking tasks in the background and joins their results.
///
/// A [`JoinRunner`] owns a [`BackgroundPool`] for the tasks and holds a [`Dispatcher`] for the
/// restricted context where outcomes are delivered. Dropping the runner joins its pool after the
/// queued tasks have finished.
pub struct JoinRunner {
    pool: BackgroundPool,
    delegate: Option<Arc<BackgroundPool>>,
    dispatcher: Dispatcher,
    observer: Arc<dyn JoinObserver>,
}

impl JoinRunner {
    /// Returns a builder that can be used to configure and create a [`JoinRunner`].
    #[inline]
    pub fn builder() -> RunnerBuilder {
        RunnerBuilder {
            name: "join".into(),
            threads: 2,
            pool: None,
            delegate: None,
            observer: Arc::new(LogObserver),
        }
    }

    /// Returns the runner's own background pool.
    pub fn pool(&self) -> &BackgroundPool {
        &self.pool
    }

    /// Runs `task_a` and `task_b` according to `strategy`, joins their results with `combine`,
    /// and delivers the outcome on the restricted context.
    ///
    /// Exactly one of `on_success` and `on_error` is called, exactly once, on the context of the
    /// runner's [`Dispatcher`]. The first failing task decides the error; the other task is left
    /// to finish and its result is discarded. `combine` only runs if both tasks succeeded.
    ///
    /// Panics in the tasks or in `combine` are reported as [`Failure::Panicked`], except for
    /// [`ContractViolation`]s, which poison the pool they happened on and propagate to its owner.
    /// A join that can no longer complete because of that reports [`Failure::Abandoned`].
    ///
    /// # Panics
    ///
    /// Panics if the pool this join is scheduled on was poisoned by an earlier join. `on_error`
    /// still receives [`Failure::Abandoned`] in that case.
    ///
    /// `caller` is the context this method is called from. Only
    /// [`JoinStrategy::CallerAffinitySensitive`] looks at it.
    ///
    /// [`ContractViolation`]: crate::ContractViolation
    #[allow(clippy::too_many_arguments)]
    pub fn run<A, B, C, TA, TB, F, S, E>(
        &self,
        caller: &Context,
        strategy: JoinStrategy,
        task_a: TA,
        task_b: TB,
        combine: F,
        on_success: S,
        on_error: E,
    ) -> JoinId
    where
        A: Send + 'static,
        B: Send + 'static,
        C: Send + 'static,
        TA: FnOnce(&Context) -> Result<A, Failure> + Send + 'static,
        TB: FnOnce(&Context) -> Result<B, Failure> + Send + 'static,
        F: FnOnce(A, B) -> C + Send + 'static,
        S: FnOnce(&Context, C) + Send + 'static,
        E: FnOnce(&Context, Failure) + Send + 'static,
    {
        let target = Target::Callbacks {
            dispatcher: self.dispatcher.clone(),
            on_success: Box::new(on_success),
            on_error: Box::new(on_error),
        };
        self.start(caller, strategy, task_a, task_b, combine, target)
    }

    /// Like [`JoinRunner::run`], but returns a handle to the outcome instead of delivering it to
    /// the restricted context.
    ///
    /// The handle is fulfilled directly from the background context that finished the join, so
    /// no [`Looper`] needs to run for it to resolve. Blocking on it from the restricted context
    /// stalls that context until the join is done; prefer [`JoinRunner::run`] there.
    ///
    /// [`Looper`]: crate::Looper
    pub fn submit<A, B, C, TA, TB, F>(
        &self,
        caller: &Context,
        strategy: JoinStrategy,
        task_a: TA,
        task_b: TB,
        combine: F,
    ) -> PromiseHandle<C>
    where
        A: Send + 'static,
        B: Send + 'static,
        C: Send + 'static,
        TA: FnOnce(&Context) -> Result<A, Failure> + Send + 'static,
        TB: FnOnce(&Context) -> Result<B, Failure> + Send + 'static,
        F: FnOnce(A, B) -> C + Send + 'static,
    {
        let (promise, handle) = promise();
        self.start(caller, strategy, task_a, task_b, combine, Target::Promise(promise));
        handle
    }

    /// Runs a single blocking `task` on the pool and delivers its outcome on the restricted
    /// context, with the same guarantees as [`JoinRunner::run`].
    ///
    /// There is nothing to join, so observers see `Pending`, `Submitted`, `Started`, then
    /// `Completed` or `Failed`, and finally `Delivered`.
    pub fn offload<T, F, S, E>(&self, task: F, on_success: S, on_error: E) -> JoinId
    where
        T: Send + 'static,
        F: FnOnce(&Context) -> Result<T, Failure> + Send + 'static,
        S: FnOnce(&Context, T) + Send + 'static,
        E: FnOnce(&Context, Failure) + Send + 'static,
    {
        let tracker = self.tracker();
        let id = tracker.id;
        tracker.event(JoinEvent::Pending { strategy: None });
        let sink = Sink::new(
            tracker.clone(),
            Target::Callbacks {
                dispatcher: self.dispatcher.clone(),
                on_success: Box::new(on_success),
                on_error: Box::new(on_error),
            },
        );
        tracker.event(JoinEvent::Submitted { side: Side::A });
        self.pool.execute(move |cx| {
            let outcome = run_task(&tracker, Side::A, cx, task);
            sink.deliver(cx, outcome);
        });
        id
    }

    fn tracker(&self) -> Tracker {
        Tracker {
            id: JoinId::next(),
            observer: self.observer.clone(),
        }
    }

    fn start<A, B, C, TA, TB, F>(
        &self,
        caller: &Context,
        strategy: JoinStrategy,
        task_a: TA,
        task_b: TB,
        combine: F,
        target: Target<C>,
    ) -> JoinId
    where
        A: Send + 'static,
        B: Send + 'static,
        C: Send + 'static,
        TA: FnOnce(&Context) -> Result<A, Failure> + Send + 'static,
        TB: FnOnce(&Context) -> Result<B, Failure> + Send + 'static,
        F: FnOnce(A, B) -> C + Send + 'static,
    {
        let tracker = self.tracker();
        let id = tracker.id;
        tracker.event(JoinEvent::Pending {
            strategy: Some(strategy),
        });
        let finish = Finish {
            combine: Box::new(combine),
            sink: Sink::new(tracker.clone(), target),
        };

        match strategy {
            JoinStrategy::Sequential => {
                tracker.event(JoinEvent::Submitted { side: Side::A });
                tracker.event(JoinEvent::Submitted { side: Side::B });
                self.pool.execute(move |cx| {
                    let both = run_task(&tracker, Side::A, cx, task_a).and_then(|a| {
                        let b = run_task(&tracker, Side::B, cx, task_b)?;
                        Ok((a, b))
                    });
                    match both {
                        Ok((a, b)) => {
                            tracker.event(JoinEvent::BothComplete);
                            finish.combine_and_deliver(&tracker, cx, a, b);
                        }
                        Err(failure) => finish.sink.deliver(cx, Err(failure)),
                    }
                });
            }
            JoinStrategy::ConcurrentForkJoin => {
                let join = Join::new(tracker, None, finish);
                let spawner = self.pool.spawner();
                fork(spawner, &join, Side::A, task_a, Arrival::A);
                fork(spawner, &join, Side::B, task_b, Arrival::B);
            }
            JoinStrategy::CallerAffinitySensitive => {
                if caller.is_restricted() {
                    log::warn!("{id}: refusing to block restricted context {caller}");
                    let failure = Failure::RestrictedCaller(caller.name().to_owned());
                    finish.sink.deliver(caller, Err(failure));
                    return id;
                }
                let join = Join::new(tracker, None, finish);
                fork(self.pool.spawner(), &join, Side::B, task_b, Arrival::B);
                join.tracker.event(JoinEvent::Submitted { side: Side::A });
                let a = run_task(&join.tracker, Side::A, caller, task_a);
                join.arrive(caller, a.map(Arrival::A));
            }
            JoinStrategy::DelegatedPool => {
                let home = self.pool.spawner();
                let spawner = match &self.delegate {
                    Some(delegate) => delegate.spawner(),
                    None => home,
                };
                let join = Join::new(tracker, Some(home.clone()), finish);
                fork(spawner, &join, Side::A, task_a, Arrival::A);
                fork(spawner, &join, Side::B, task_b, Arrival::B);
            }
        }
        id
    }
}

#[derive(Clone)]
struct Tracker {
    id: JoinId,
    observer: Arc<dyn JoinObserver>,
}

impl Tracker {
    fn event(&self, event: JoinEvent) {
        self.observer.on_event(self.id, &event);
    }
}

fn run_task<T, F>(tracker: &Tracker, side: Side, cx: &Context, task: F) -> Result<T, Failure>
where
    F: FnOnce(&Context) -> Result<T, Failure>,
{
    tracker.event(JoinEvent::Started {
        side,
        context: cx.id(),
    });
    let result = catching(|| task(cx));
    match &result {
        Ok(_) => tracker.event(JoinEvent::Completed {
            side,
            context: cx.id(),
        }),
        Err(failure) => tracker.event(JoinEvent::Failed {
            side,
            failure: failure.clone(),
        }),
    }
    result
}

/// Where the outcome of a join ends up.
enum Target<C> {
    Callbacks {
        dispatcher: Dispatcher,
        on_success: Box<dyn FnOnce(&Context, C) + Send>,
        on_error: Box<dyn FnOnce(&Context, Failure) + Send>,
    },
    Promise(Promise<C>),
}

/// Delivers the outcome of a join to its [`Target`] once.
///
/// A sink dropped before delivering (because the pool dropped or refused the job holding it)
/// reports [`Failure::Abandoned`] instead.
struct Sink<C> {
    tracker: Tracker,
    target: Option<Target<C>>,
}

impl<C> Sink<C> {
    fn new(tracker: Tracker, target: Target<C>) -> Self {
        Self {
            tracker,
            target: Some(target),
        }
    }
}

impl<C: Send + 'static> Sink<C> {
    fn deliver(mut self, from: &Context, outcome: Result<C, Failure>) {
        let Some(target) = self.target.take() else {
            return;
        };
        match target {
            Target::Callbacks {
                dispatcher,
                on_success,
                on_error,
            } => {
                let tracker = self.tracker.clone();
                dispatcher.post(move |cx| {
                    cx.expect_restricted("join delivery");
                    tracker.event(JoinEvent::Delivered {
                        success: outcome.is_ok(),
                        context: cx.id(),
                    });
                    match outcome {
                        Ok(value) => on_success(cx, value),
                        Err(failure) => on_error(cx, failure),
                    }
                });
            }
            Target::Promise(promise) => {
                self.tracker.event(JoinEvent::Delivered {
                    success: outcome.is_ok(),
                    context: from.id(),
                });
                promise.fulfill(outcome);
            }
        }
    }
}

impl<C> Drop for Sink<C> {
    fn drop(&mut self) {
        let Some(target) = self.target.take() else {
            return;
        };
        log::warn!("{}: abandoned before delivery", self.tracker.id);
        match target {
            Target::Callbacks {
                dispatcher,
                on_error,
                ..
            } => {
                let tracker = self.tracker.clone();
                dispatcher.post(move |cx| {
                    cx.expect_restricted("join delivery");
                    tracker.event(JoinEvent::Delivered {
                        success: false,
                        context: cx.id(),
                    });
                    on_error(cx, Failure::Abandoned);
                });
            }
            // Resolves the handle to `Failure::Abandoned`.
            Target::Promise(promise) => drop(promise),
        }
    }
}

/// The part of a join that runs once: the combine step and the delivery.
struct Finish<A, B, C> {
    combine: Box<dyn FnOnce(A, B) -> C + Send>,
    sink: Sink<C>,
}

impl<A, B, C: Send + 'static> Finish<A, B, C> {
    fn combine_and_deliver(self, tracker: &Tracker, cx: &Context, a: A, b: B) {
        tracker.event(JoinEvent::Combining { context: cx.id() });
        let combine = self.combine;
        let outcome = catching(|| Ok(combine(a, b)));
        self.sink.deliver(cx, outcome);
    }
}

enum Arrival<A, B> {
    A(A),
    B(B),
}

/// Join point shared by two independently scheduled tasks.
struct Join<A, B, C> {
    tracker: Tracker,
    /// Pool to move the combine step to. `None` combines on the thread of the last arrival.
    combine_on: Option<Spawner>,
    slots: Mutex<Slots<A, B, C>>,
}

struct Slots<A, B, C> {
    a: Option<A>,
    b: Option<B>,
    /// Taken by whichever arrival completes or fails the join.
    finish: Option<Finish<A, B, C>>,
}

impl<A, B, C> Join<A, B, C>
where
    A: Send + 'static,
    B: Send + 'static,
    C: Send + 'static,
{
    fn new(tracker: Tracker, combine_on: Option<Spawner>, finish: Finish<A, B, C>) -> Arc<Self> {
        Arc::new(Self {
            tracker,
            combine_on,
            slots: Mutex::new(Slots {
                a: None,
                b: None,
                finish: Some(finish),
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Slots<A, B, C>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn arrive(&self, cx: &Context, arrival: Result<Arrival<A, B>, Failure>) {
        let mut slots = self.lock();
        let Some(finish) = slots.finish.take() else {
            // The other side already failed; this result is discarded.
            return;
        };
        let (a, b) = match arrival {
            Err(failure) => {
                drop(slots);
                finish.sink.deliver(cx, Err(failure));
                return;
            }
            Ok(Arrival::A(a)) => match slots.b.take() {
                Some(b) => (a, b),
                None => {
                    slots.a = Some(a);
                    slots.finish = Some(finish);
                    return;
                }
            },
            Ok(Arrival::B(b)) => match slots.a.take() {
                Some(a) => (a, b),
                None => {
                    slots.b = Some(b);
                    slots.finish = Some(finish);
                    return;
                }
            },
        };
        drop(slots);

        self.tracker.event(JoinEvent::BothComplete);
        match &self.combine_on {
            None => finish.combine_and_deliver(&self.tracker, cx, a, b),
            Some(spawner) => {
                let tracker = self.tracker.clone();
                spawner.spawn(Box::new(move |cx: &Context| {
                    finish.combine_and_deliver(&tracker, cx, a, b);
                }));
            }
        }
    }
}

fn fork<A, B, C, T, F>(
    spawner: &Spawner,
    join: &Arc<Join<A, B, C>>,
    side: Side,
    task: F,
    arrival: fn(T) -> Arrival<A, B>,
) where
    A: Send + 'static,
    B: Send + 'static,
    C: Send + 'static,
    T: Send + 'static,
    F: FnOnce(&Context) -> Result<T, Failure> + Send + 'static,
{
    join.tracker.event(JoinEvent::Submitted { side });
    let join = join.clone();
    spawner.spawn(Box::new(move |cx: &Context| {
        let result = run_task(&join.tracker, side, cx, task);
        join.arrive(cx, result.map(arrival));
    }));
}
