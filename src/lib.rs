//! A virtual execution engine for a small custom 32-bit instruction set.
//!
//! Parses a textual assembly program and simulates a register file,
//! segmented linear address space, descending stack, and syscall
//! interface, all run under observation with breakpoints, step control,
//! and before/after event hooks. See [`Engine`] for the entry point.

pub mod arith;
pub mod consts;
pub mod engine;
pub mod error;
pub mod events;
pub mod files;
pub mod instruction;
pub mod memory;
pub mod operand;
pub mod registers;
pub mod segment;
pub mod state;

pub mod prelude {
    pub use crate::consts::Word;
    pub use crate::engine::{Engine, Stdin, Stdout};
    pub use crate::error::{EngineError, Result};
    pub use crate::events::{EventEmitter, EventPayload, EventType, Handler, Position};
    pub use crate::files::FileManager;
    pub use crate::instruction::Instruction;
    pub use crate::memory::MemoryManager;
    pub use crate::operand::{AddrOp, AddressExpr, Operand};
    pub use crate::registers::{EvalResult, Registers};
    pub use crate::segment::{Permission, Segment};
    pub use crate::state::{Debugger, EngineState};
}
