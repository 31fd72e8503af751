//! The affinity-restricted execution context.
//!
//! A [`Looper`] is a message loop owned by a single thread, comparable to the event loop of a UI
//! toolkit. Other threads hand it closures through [`Dispatcher`]s; the owning thread runs them,
//! lending each one the restricted [`Context`] token. Join results are always delivered through
//! a [`Looper`].

use std::{marker::PhantomData, time::Duration};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};

use crate::context::{Affinity, Context};

type Message = Box<dyn FnOnce(&Context) + Send + 'static>;

enum Envelope {
    Run(Message),
    Quit,
}

/// A single-consumer message loop representing the affinity-restricted context.
///
/// [`Looper`] is deliberately not [`Send`]: it is created on, and drained by, the thread it
/// represents.
pub struct Looper {
    context: Context,
    sender: Sender<Envelope>,
    recv: Receiver<Envelope>,
    _not_send: PhantomData<*const ()>,
}

impl Looper {
    /// Creates a [`Looper`] named `"main"` for the current thread.
    pub fn new() -> Self {
        Self::with_name("main")
    }

    /// Creates a [`Looper`] for the current thread with a custom context name.
    pub fn with_name<N: Into<String>>(name: N) -> Self {
        let name = name.into();
        let (sender, recv) = crossbeam_channel::unbounded();
        log::trace!("looper '{name}' created");
        Self {
            context: Context::new(Affinity::Restricted, name),
            sender,
            recv,
            _not_send: PhantomData,
        }
    }

    /// Returns the restricted [`Context`] token of this looper.
    ///
    /// Code running directly on the owning thread can pass this token to functions that check
    /// their affinity.
    #[inline]
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Returns a [`Dispatcher`] that posts work to this looper from any thread.
    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher {
            sender: self.sender.clone(),
            name: self.context.to_string(),
        }
    }

    /// Runs posted messages until [`Dispatcher::quit`] is called.
    pub fn run(&self) {
        log::trace!("looper '{}' running", self.context);
        for envelope in self.recv.iter() {
            match envelope {
                Envelope::Run(message) => message(&self.context),
                Envelope::Quit => break,
            }
        }
        log::trace!("looper '{}' quit", self.context);
    }

    /// Runs one posted message if one is queued, without blocking.
    ///
    /// Returns whether a message was run. A pending quit request is consumed and reported as
    /// `false`.
    pub fn pump(&self) -> bool {
        match self.recv.try_recv() {
            Ok(envelope) => self.dispatch(envelope),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => false,
        }
    }

    /// Waits up to `timeout` for a posted message and runs it.
    ///
    /// Returns whether a message was run.
    pub fn pump_timeout(&self, timeout: Duration) -> bool {
        match self.recv.recv_timeout(timeout) {
            Ok(envelope) => self.dispatch(envelope),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => false,
        }
    }

    fn dispatch(&self, envelope: Envelope) -> bool {
        match envelope {
            Envelope::Run(message) => {
                message(&self.context);
                true
            }
            Envelope::Quit => false,
        }
    }
}

impl Default for Looper {
    fn default() -> Self {
        Self::new()
    }
}

/// A cloneable, [`Send`] handle that posts closures to a [`Looper`].
#[derive(Clone)]
pub struct Dispatcher {
    sender: Sender<Envelope>,
    name: String,
}

impl Dispatcher {
    /// Queues `message` to run on the looper's thread with the restricted [`Context`].
    ///
    /// Returns `false` if the [`Looper`] has been dropped, in which case `message` is dropped
    /// without running.
    pub fn post<F>(&self, message: F) -> bool
    where
        F: FnOnce(&Context) + Send + 'static,
    {
        if self.sender.send(Envelope::Run(Box::new(message))).is_err() {
            log::warn!("looper '{}' is gone, dropping message", self.name);
            return false;
        }
        true
    }

    /// Makes [`Looper::run`] return after the messages queued before this call.
    pub fn quit(&self) {
        self.sender.send(Envelope::Quit).ok();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, Mutex},
        thread,
    };

    use super::*;

    fn assert_send<T: Send>() {}

    #[test]
    fn posted_messages_run_on_restricted_context() {
        let looper = Looper::new();
        let dispatcher = looper.dispatcher();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen2 = seen.clone();
        let poster = thread::spawn(move || {
            for i in 0..3 {
                let seen = seen2.clone();
                assert!(dispatcher.post(move |cx| {
                    cx.expect_restricted("message");
                    seen.lock().unwrap().push((i, cx.id(), thread::current().id()));
                }));
            }
            dispatcher.quit();
        });
        looper.run();
        poster.join().unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        for (i, (n, id, thread)) in seen.iter().enumerate() {
            assert_eq!(*n, i);
            assert_eq!(*id, looper.context().id());
            assert_eq!(*thread, thread::current().id());
        }
    }

    #[test]
    fn pump() {
        let looper = Looper::with_name("ui");
        assert_eq!(looper.context().name(), "ui");
        assert!(looper.context().is_restricted());
        assert!(!looper.pump());

        let dispatcher = looper.dispatcher();
        dispatcher.post(|_| {});
        assert!(looper.pump());
        assert!(!looper.pump());
        assert!(!looper.pump_timeout(Duration::from_millis(10)));

        dispatcher.quit();
        assert!(!looper.pump());
    }

    #[test]
    fn post_to_dropped_looper() {
        let dispatcher = Looper::new().dispatcher();
        assert!(!dispatcher.post(|_| unreachable!()));
    }

    #[test]
    fn dispatcher_is_send() {
        assert_send::<Dispatcher>();
    }
}
