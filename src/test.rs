//! Internal unit test utilities.

use std::{
    sync::{Arc, Mutex},
    thread::{self, ThreadId},
    time::Duration,
};

use crate::{
    context::{Affinity, Context, ContextId},
    observer::{JoinEvent, JoinId, JoinObserver, LogObserver},
    Failure, Looper,
};

/// Generous upper bound for anything a test waits on.
pub const PATIENCE: Duration = Duration::from_secs(10);

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A background token for code that plays the part of a non-restricted caller.
pub fn background_caller() -> Context {
    Context::new(Affinity::Background, "caller")
}

/// Pumps `looper` until a message is delivered, failing the test after [`PATIENCE`].
pub fn pump_one(looper: &Looper) {
    assert!(
        looper.pump_timeout(PATIENCE),
        "nothing was delivered to the looper"
    );
}

/// Observer that records every event, and forwards it to the [`LogObserver`].
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<(JoinId, JoinEvent)>>,
}

impl JoinObserver for Recorder {
    fn on_event(&self, join: JoinId, event: &JoinEvent) {
        LogObserver.on_event(join, event);
        self.events.lock().unwrap().push((join, event.clone()));
    }
}

impl Recorder {
    pub fn events_of(&self, join: JoinId) -> Vec<JoinEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| *id == join)
            .map(|(_, event)| event.clone())
            .collect()
    }
}

/// One invocation of a delivery callback.
#[derive(Debug)]
pub struct Delivery<C> {
    pub outcome: Result<C, Failure>,
    pub context: ContextId,
    pub thread: ThreadId,
}

/// Test double for `on_success`/`on_error` that records what it was called with, and where.
pub struct Outcomes<C> {
    deliveries: Arc<Mutex<Vec<Delivery<C>>>>,
}

impl<C> Clone for Outcomes<C> {
    fn clone(&self) -> Self {
        Self {
            deliveries: self.deliveries.clone(),
        }
    }
}

impl<C: Send + 'static> Outcomes<C> {
    pub fn new() -> Self {
        Self {
            deliveries: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn record(&self, cx: &Context, outcome: Result<C, Failure>) {
        self.deliveries.lock().unwrap().push(Delivery {
            outcome,
            context: cx.id(),
            thread: thread::current().id(),
        });
    }

    pub fn on_success(&self) -> impl FnOnce(&Context, C) + Send + 'static {
        let this = self.clone();
        move |cx, value| this.record(cx, Ok(value))
    }

    pub fn on_error(&self) -> impl FnOnce(&Context, Failure) + Send + 'static {
        let this = self.clone();
        move |cx, failure| this.record(cx, Err(failure))
    }

    pub fn take(&self) -> Vec<Delivery<C>> {
        std::mem::take(&mut *self.deliveries.lock().unwrap())
    }
}
