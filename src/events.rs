//! Before/after event hooks bracketing observable engine effects

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::EngineError;
use crate::instruction::Instruction;

/// A boxed, owned future, the shape every registered handler returns.
pub type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// A registered event handler. Takes an owned [`EventPayload`] rather than
/// a borrow so it can be stored independently of the call site that
/// produced the payload — the source's coroutines close over call-site
/// locals instead, which Rust's ownership rules don't let us imitate
/// directly.
pub type Handler = Arc<dyn Fn(EventPayload) -> BoxFuture + Send + Sync>;

/// The kind of event a handler can be registered against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    Exit,
    Step,
    Input,
    Output,
    Breakpoint,
    Error,
    Download,
}

/// Which side of an effect a handler brackets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Position {
    Before,
    After,
}

/// The data carried to a handler. Each [`EventType`] has one shape; the
/// `after` call for I/O-shaped events additionally carries the result the
/// `before` call doesn't have yet.
#[derive(Debug, Clone)]
pub enum EventPayload {
    /// Brackets one decoded instruction's dispatch.
    Step(Instruction),
    /// Brackets the `INPUT`/`OUTPUT`/`LIST_FILES` syscalls.
    Io {
        buf: crate::consts::Word,
        length: crate::consts::Word,
        result: Option<crate::consts::Word>,
    },
    /// Brackets the `EXIT` syscall.
    Exit { code: crate::consts::Word },
    /// Brackets the `DOWNLOAD` syscall.
    Download {
        name: Vec<u8>,
        url: Vec<u8>,
        result: Option<crate::consts::Word>,
    },
    /// Brackets a breakpoint gate. Fires with the current PC.
    Breakpoint { pc: crate::consts::Word },
    /// Fires once, `before` only, when `step()` catches an error.
    Error(EngineError),
}

/// A registry of before/after handlers keyed by [`EventType`].
///
/// The source implements this as a decorator that wraps a coroutine with
/// two `trigger` calls; per the redesign guidance this is inlined here as
/// two explicit `trigger` calls at each call site instead of reproducing
/// the higher-order wrapper.
#[derive(Default, Clone)]
pub struct EventEmitter {
    before: HashMap<EventType, Handler>,
    after: HashMap<EventType, Handler>,
}

impl EventEmitter {
    /// An emitter with no handlers registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or overwrite) the handler for `event` at `position`.
    pub fn register(&mut self, event: EventType, position: Position, handler: Handler) {
        let table = match position {
            Position::Before => &mut self.before,
            Position::After => &mut self.after,
        };
        table.insert(event, handler);
    }

    /// Remove the handler for `event` at `position`, if any.
    pub fn unregister(&mut self, event: EventType, position: Position) {
        let table = match position {
            Position::Before => &mut self.before,
            Position::After => &mut self.after,
        };
        table.remove(&event);
    }

    /// Await the handler registered for `event` at `position`, if any.
    pub async fn trigger(&self, event: EventType, position: Position, payload: EventPayload) {
        let table = match position {
            Position::Before => &self.before,
            Position::After => &self.after,
        };
        if let Some(handler) = table.get(&event) {
            handler.clone()(payload).await;
        }
    }
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("before", &self.before.keys().collect::<Vec<_>>())
            .field("after", &self.after.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn unregistered_event_is_a_no_op() {
        let emitter = EventEmitter::new();
        emitter.trigger(EventType::Step, Position::Before, EventPayload::Exit { code: 0 }).await;
    }

    #[tokio::test]
    async fn registered_handler_fires() {
        let mut emitter = EventEmitter::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        emitter.register(
            EventType::Exit,
            Position::Before,
            Arc::new(move |_payload| {
                let count = count_clone.clone();
                Box::pin(async move {
                    count.fetch_add(1, Ordering::SeqCst);
                })
            }),
        );

        emitter.trigger(EventType::Exit, Position::Before, EventPayload::Exit { code: 7 }).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        emitter.trigger(EventType::Exit, Position::After, EventPayload::Exit { code: 7 }).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unregister_stops_future_firing() {
        let mut emitter = EventEmitter::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        emitter.register(
            EventType::Error,
            Position::Before,
            Arc::new(move |_payload| {
                let count = count_clone.clone();
                Box::pin(async move {
                    count.fetch_add(1, Ordering::SeqCst);
                })
            }),
        );
        emitter.unregister(EventType::Error, Position::Before);
        emitter
            .trigger(EventType::Error, Position::Before, EventPayload::Error(EngineError::bad_inst("x")))
            .await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
