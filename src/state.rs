//! Engine state machine and breakpoint gating

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::Notify;

use crate::consts::Word;

/// Lifecycle state of an [`crate::engine::Engine`].
///
/// `Unknown` is reserved for future use and is never produced by this
/// implementation; it exists so external tooling has a value to fall back
/// on rather than a partial match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum EngineState {
    /// Initial and terminal state. `run()` exits its loop here.
    Stopped,
    /// A step may be taken.
    Running,
    /// A step is currently in flight; guards against re-entrant stepping.
    Stepping,
    /// Reserved, currently unreachable.
    Unknown,
}

impl Default for EngineState {
    fn default() -> Self {
        Self::Stopped
    }
}

/// Breakpoint set plus the "continue" signal a gated loop iteration waits
/// on. Kept separate from [`EngineState`] because breakpoints may be
/// mutated between steps regardless of which state the engine is in.
#[derive(Debug, Clone)]
pub struct Debugger {
    breakpoints: BTreeSet<Word>,
    continue_signal: Arc<Notify>,
}

impl Default for Debugger {
    fn default() -> Self {
        Self::new()
    }
}

impl Debugger {
    /// A debugger with no breakpoints set.
    pub fn new() -> Self {
        Self {
            breakpoints: BTreeSet::new(),
            continue_signal: Arc::new(Notify::new()),
        }
    }

    /// Register a breakpoint at `addr`.
    pub fn add_breakpoint(&mut self, addr: Word) {
        self.breakpoints.insert(addr);
    }

    /// Remove a breakpoint at `addr`, if set.
    pub fn remove_breakpoint(&mut self, addr: Word) {
        self.breakpoints.remove(&addr);
    }

    /// True if `addr` is a registered breakpoint.
    pub fn is_breakpoint(&self, addr: Word) -> bool {
        self.breakpoints.contains(&addr)
    }

    /// Every registered breakpoint address.
    pub fn breakpoints(&self) -> impl Iterator<Item = Word> + '_ {
        self.breakpoints.iter().copied()
    }

    /// Clear every breakpoint. Called on boot and on `EXEC`.
    pub fn clear(&mut self) {
        self.breakpoints.clear();
    }

    /// Wait for an external `release()` call. The run loop awaits this
    /// while gated on a breakpoint; no other step proceeds concurrently
    /// because the loop itself is the only place that awaits it.
    pub async fn wait_for_continue(&self) {
        self.continue_signal.notified().await;
    }

    /// Release a thread paused in [`Debugger::wait_for_continue`].
    pub fn release(&self) {
        self.continue_signal.notify_one();
    }
}
