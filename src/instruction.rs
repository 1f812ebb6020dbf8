//! Textual instruction decoding

use crate::consts::{Word, INST_MNEMONIC_SEPARATOR, INST_OPERANDS_SEPARATOR, MNEMONICS};
use crate::error::EngineError;
use crate::operand::{parse_operand, Operand};

/// One decoded line of program text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub mnemonic: String,
    pub operands: Vec<Operand>,
    /// Byte length of the source line plus its trailing delimiter — how
    /// far the program counter advances past this instruction.
    pub len: Word,
}

impl Instruction {
    /// Decode a single source line (without its trailing newline).
    ///
    /// Anything after a `;` is a comment and is discarded before parsing.
    /// An empty line (after comment-stripping) decodes to a bare `NOP`.
    pub fn parse(line: &[u8]) -> crate::error::Result<Self> {
        let len = line.len() as Word + 1;

        let code = match line.iter().position(|&b| b == b';') {
            Some(pos) => &line[..pos],
            None => line,
        };
        let code = std::str::from_utf8(code).map_err(|_| EngineError::bad_inst("non-utf8 instruction"))?.trim();

        if code.is_empty() {
            return Ok(Self {
                mnemonic: "NOP".to_string(),
                operands: Vec::new(),
                len,
            });
        }

        let (mnemonic, rest) = match code.split_once(INST_MNEMONIC_SEPARATOR as char) {
            Some((m, r)) => (m, r.trim()),
            None => (code, ""),
        };

        let mut operands = Vec::new();
        if !rest.is_empty() {
            for token in rest.split(INST_OPERANDS_SEPARATOR as char) {
                operands.push(parse_operand(token)?);
            }
        }

        let inst = Self {
            mnemonic: mnemonic.to_string(),
            operands,
            len,
        };
        inst.validate()?;
        Ok(inst)
    }

    fn validate(&self) -> crate::error::Result<()> {
        if !MNEMONICS.contains(&self.mnemonic.as_str()) {
            return Err(EngineError::bad_inst(format!("unknown mnemonic: {}", self.mnemonic)));
        }
        let expected = required_operands(&self.mnemonic);
        if self.operands.len() != expected {
            return Err(EngineError::bad_inst(format!(
                "{} takes {expected} operand(s), got {}",
                self.mnemonic,
                self.operands.len()
            )));
        }
        Ok(())
    }
}

/// Number of operands each mnemonic requires. Consulted by
/// [`Instruction::validate`] so `resolve_inst` can index `operands[0]`/`[1]`
/// unconditionally without risking an out-of-bounds panic on malformed
/// input.
fn required_operands(mnemonic: &str) -> usize {
    match mnemonic {
        "RET" | "SYSCALL" | "NOP" => 0,
        "JMP" | "JZ" | "JNZ" | "NOT" | "CALL" | "PUSH" | "POP" | "SWAP" | "COPY" => 1,
        "MOV" | "AND" | "OR" | "XOR" | "SAL" | "SAR" | "SHL" | "SHR" | "ROL" | "ROR" | "ADD" | "SUB" | "MULu" | "MUL"
        | "DIVu" | "DIV" | "EQ" | "NEQ" | "GT" | "GTu" | "GTE" | "GTEu" | "LT" | "LTu" | "LTE" | "LTEu" => 2,
        _ => unreachable!("mnemonic set already validated against MNEMONICS"),
    }
}
