//! Operand tokens: registers, memory dereferences, and immediates

use crate::consts::{Word, REGISTERS};
use crate::error::EngineError;

/// The arithmetic operator allowed inside an address expression, e.g. the
/// `+` in `[R1 + 5]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrOp {
    Add,
    Sub,
    Mul,
}

/// A parsed `[...]` dereference expression: either a bare register
/// (`[R1]`) or a register combined with an immediate (`[R1 + 5]`,
/// `[R1 - 0x10]`, `[R1 * 4]`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressExpr {
    pub register: String,
    pub offset: Option<(AddrOp, i64)>,
}

/// A decoded operand, still in its unevaluated textual form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    /// A bare register name (`R1`, `PC`, `SP`, ...).
    Register(String),
    /// A `[...]` memory dereference.
    Address(AddressExpr),
    /// A numeric literal. `text` is kept verbatim (not just the parsed
    /// value) because `JMP`/`JZ`/`JNZ` treat a literal carrying an
    /// explicit leading `+`/`-` as PC-relative.
    Immediate { text: String, value: i64 },
}

impl Operand {
    /// True if this operand's literal text starts with an explicit sign,
    /// i.e. is a PC-relative jump target rather than an absolute address.
    pub fn is_pc_relative(&self) -> bool {
        matches!(self, Operand::Immediate { text, .. } if text.starts_with('+') || text.starts_with('-'))
    }
}

fn parse_int(text: &str) -> Option<i64> {
    let (neg, rest) = match text.strip_prefix('-') {
        Some(r) => (true, r),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };

    let value = if let Some(hex) = rest.strip_prefix("0x").or_else(|| rest.strip_prefix("0X")) {
        i64::from_str_radix(hex, 16).ok()?
    } else if let Some(bin) = rest.strip_prefix("0b").or_else(|| rest.strip_prefix("0B")) {
        i64::from_str_radix(bin, 2).ok()?
    } else if let Some(oct) = rest.strip_prefix("0o").or_else(|| rest.strip_prefix("0O")) {
        i64::from_str_radix(oct, 8).ok()?
    } else {
        rest.parse::<i64>().ok()?
    };

    Some(if neg { -value } else { value })
}

fn marker_op(c: char) -> Option<AddrOp> {
    match c {
        '+' => Some(AddrOp::Add),
        '-' => Some(AddrOp::Sub),
        '*' => Some(AddrOp::Mul),
        _ => None,
    }
}

fn parse_address_expr(inner: &str) -> crate::error::Result<AddressExpr> {
    // Mirrors the greedy regex `(.*)([+*-])(.*)` the source ISA evaluates an
    // address expression with: greedy `.*` backtracks as little as possible,
    // so the operator it lands on is the LAST `+`/`-`/`*` in the string, not
    // the first — `[R1+-5]` splits as register `"R1+"` / op `-` / imm `5`,
    // and `"R1+"` then fails register lookup (BAD_INST), rather than
    // splitting on the leftmost `+` into a valid `R1`/`Add`/`-5`.
    if let Some(pos) = inner.rfind(|c| marker_op(c).is_some()) {
        let op = marker_op(inner.as_bytes()[pos] as char).expect("position matched the same predicate");
        let (reg, imm) = inner.split_at(pos);
        let imm = &imm[1..];
        let value = parse_int(imm.trim()).ok_or_else(|| EngineError::bad_inst("invalid operand"))?;
        return Ok(AddressExpr {
            register: reg.trim().to_string(),
            offset: Some((op, value)),
        });
    }

    Ok(AddressExpr {
        register: inner.trim().to_string(),
        offset: None,
    })
}

/// Parse one whitespace-trimmed operand token into a typed [`Operand`].
pub fn parse_operand(token: &str) -> crate::error::Result<Operand> {
    let token = token.trim();

    if REGISTERS.contains(&token) {
        return Ok(Operand::Register(token.to_string()));
    }

    if let Some(inner) = token.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
        return Ok(Operand::Address(parse_address_expr(inner)?));
    }

    if let Some(value) = parse_int(token) {
        return Ok(Operand::Immediate {
            text: token.to_string(),
            value,
        });
    }

    Err(EngineError::bad_inst(format!("invalid operand: {token}")))
}

/// Evaluate the register side of an [`AddressExpr`] plus its optional
/// immediate offset into an absolute machine-word address.
///
/// The arithmetic runs in `i128` rather than `i64`: `imm` is any value a
/// 64-bit literal can hold, and `reg_value * imm` can exceed `i64::MAX`
/// for a register near `0xFFFFFFFF` and a large immediate — `i128` has
/// enough headroom that the product never overflows before the final
/// mask truncates it back down to 32 bits (mirroring the arbitrary
/// precision the original ISA computes this expression in).
pub fn resolve_address(reg_value: Word, expr: &AddressExpr) -> Word {
    let result: i128 = match expr.offset {
        None => return reg_value,
        Some((AddrOp::Add, imm)) => reg_value as i128 + imm as i128,
        Some((AddrOp::Sub, imm)) => reg_value as i128 - imm as i128,
        Some((AddrOp::Mul, imm)) => reg_value as i128 * imm as i128,
    };
    result as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_operand() {
        assert_eq!(parse_operand("R1").unwrap(), Operand::Register("R1".into()));
    }

    #[test]
    fn bare_address_operand() {
        let op = parse_operand("[R2]").unwrap();
        assert_eq!(
            op,
            Operand::Address(AddressExpr {
                register: "R2".into(),
                offset: None
            })
        );
    }

    #[test]
    fn address_with_offset() {
        let op = parse_operand("[R1 + 5]").unwrap();
        assert_eq!(
            op,
            Operand::Address(AddressExpr {
                register: "R1".into(),
                offset: Some((AddrOp::Add, 5))
            })
        );
    }

    #[test]
    fn hex_and_binary_immediates() {
        assert_eq!(parse_operand("0x10").unwrap(), Operand::Immediate { text: "0x10".into(), value: 16 });
        assert_eq!(parse_operand("0b101").unwrap(), Operand::Immediate { text: "0b101".into(), value: 5 });
    }

    #[test]
    fn signed_immediate_is_pc_relative() {
        let op = parse_operand("+3").unwrap();
        assert!(op.is_pc_relative());
        let op = parse_operand("3").unwrap();
        assert!(!op.is_pc_relative());
    }

    #[test]
    fn invalid_token_is_bad_inst() {
        assert!(parse_operand("garbage!!").is_err());
    }

    #[test]
    fn resolve_address_applies_offset() {
        let expr = AddressExpr {
            register: "R1".into(),
            offset: Some((AddrOp::Sub, 0x10)),
        };
        assert_eq!(resolve_address(0x20, &expr), 0x10);
    }

    #[test]
    fn resolve_address_mul_does_not_overflow_on_large_operands() {
        // A register value near u32::MAX times a large i64 immediate
        // overflows i64 math well before it's masked back to 32 bits.
        let expr = AddressExpr {
            register: "R2".into(),
            offset: Some((AddrOp::Mul, 4_000_000_000)),
        };
        let expected = (0xFFFF_FFFFu32 as i128 * 4_000_000_000i128) as u32;
        assert_eq!(resolve_address(0xFFFF_FFFF, &expr), expected);
    }

    #[test]
    fn compound_sign_splits_on_the_last_marker() {
        // Mirrors the source's greedy-regex split: the rightmost of
        // +/-/* wins, leaving "R1+" as the register half (which later
        // fails register lookup), not "R1" with imm "-5".
        let op = parse_operand("[R1+-5]").unwrap();
        assert_eq!(
            op,
            Operand::Address(AddressExpr {
                register: "R1+".into(),
                offset: Some((AddrOp::Sub, 5))
            })
        );
    }
}
