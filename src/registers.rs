//! The fixed named register file and operand evaluation

use std::collections::BTreeMap;

use crate::arith::to_u32;
use crate::consts::{Word, FRAME_POINTER_REG_NAME, PROGRAM_COUNTER_REG_NAME, REGISTERS, STACK_POINTER_REG_NAME};
use crate::error::EngineError;
use crate::operand::{resolve_address, Operand};

/// The outcome of evaluating an operand: either a value ready to use
/// directly, or a memory address that still needs dereferencing.
///
/// This replaces the `(value, bool)` tuple the source ISA returns from its
/// operand evaluator with a tagged enum, so callers can't mix up which
/// branch they're in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalResult {
    /// An immediate value or register contents, usable as-is.
    Direct(Word),
    /// An address that must be read through memory to get the operand's
    /// value.
    Deref(Word),
}

/// The register file: `R1..R8`, `PC`, `FP`, `SP`.
#[derive(Debug, Clone)]
pub struct Registers {
    values: BTreeMap<&'static str, Word>,
}

impl Default for Registers {
    fn default() -> Self {
        Self::new()
    }
}

impl Registers {
    /// All registers initialized to zero.
    pub fn new() -> Self {
        Self {
            values: REGISTERS.iter().map(|&name| (name, 0)).collect(),
        }
    }

    /// Read a general-purpose register. `PC` cannot be read through this
    /// path — use [`Registers::program_counter`].
    pub fn get(&self, name: &str) -> crate::error::Result<Word> {
        if name == PROGRAM_COUNTER_REG_NAME || !self.values.contains_key(name) {
            return Err(EngineError::bad_inst("invalid operand"));
        }
        Ok(self.values[name])
    }

    /// Write a general-purpose register. `PC` cannot be written through
    /// this path — use [`Registers::set_program_counter`].
    pub fn set(&mut self, name: &str, value: Word) -> crate::error::Result<()> {
        if name == PROGRAM_COUNTER_REG_NAME || !self.values.contains_key(name) {
            return Err(EngineError::bad_inst("invalid operand"));
        }
        self.values.insert(self.canonical_name(name), to_u32(value as i64));
        Ok(())
    }

    fn canonical_name(&self, name: &str) -> &'static str {
        REGISTERS.iter().copied().find(|&r| r == name).expect("checked by caller")
    }

    /// Current program counter.
    pub fn program_counter(&self) -> Word {
        self.values[PROGRAM_COUNTER_REG_NAME]
    }

    /// Overwrite the program counter.
    pub fn set_program_counter(&mut self, new_pc: Word) {
        self.values.insert(PROGRAM_COUNTER_REG_NAME, to_u32(new_pc as i64));
    }

    /// Frame pointer convenience accessor.
    pub fn frame_pointer(&self) -> Word {
        self.values[FRAME_POINTER_REG_NAME]
    }

    /// Stack pointer convenience accessor.
    pub fn stack_pointer(&self) -> Word {
        self.values[STACK_POINTER_REG_NAME]
    }

    /// Snapshot of every register, `PC` included, for inspection/tooling.
    pub fn snapshot(&self) -> BTreeMap<&'static str, Word> {
        self.values.clone()
    }

    /// Evaluate an operand token into an [`EvalResult`].
    pub fn eval(&self, operand: &Operand) -> crate::error::Result<EvalResult> {
        match operand {
            Operand::Register(name) => Ok(EvalResult::Direct(self.get(name)?)),
            Operand::Address(expr) => {
                let reg_val = self.get(&expr.register)?;
                Ok(EvalResult::Deref(resolve_address(reg_val, expr)))
            }
            Operand::Immediate { value, .. } => Ok(EvalResult::Direct(to_u32(*value))),
        }
    }
}
