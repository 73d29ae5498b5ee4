//! Length disassembler for 32-bit x86.
//!
//! Given a pointer into executable code, [`decode`] (and its safe,
//! slice-based core [`decode_slice`]) classifies the next instruction as a
//! byte length, as `Undecodable` (opcode not in the table below), or —
//! opt-in only — as `Unrelocatable` (the instruction carries a PC-relative
//! operand and cannot be copied verbatim to a new address).
//!
//! This is *not* a full x86 decoder: operands are never modeled, only the
//! byte length and relocatability of the instruction.

use core::fmt;

use bit_field::BitField;

use crate::diagnostics::DecodeDiagnostic;

/// Maximum length of a legal x86 instruction (legacy encoding).
pub const MAX_INSTRUCTION_LENGTH: usize = 15;

/// The set of one-byte legacy prefixes this decoder recognizes.
const PREFIX_BYTES: [u8; 11] = [
    0x66, 0x67, 0x2E, 0x36, 0x3E, 0x26, 0x64, 0x65, 0xF0, 0xF2, 0xF3,
];

/// Result of classifying the instruction at a cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeOutcome {
    /// A complete instruction of the given byte length (1..=15).
    Length(u8),
    /// A well-formed instruction whose operand is PC-relative. Only
    /// returned when the caller opted into early termination.
    Unrelocatable,
    /// The opcode is not in this decoder's table.
    Undecodable,
}

impl DecodeOutcome {
    /// The byte length of the instruction, if known.
    pub fn len(self) -> Option<u8> {
        match self {
            DecodeOutcome::Length(n) => Some(n),
            _ => None,
        }
    }
}

/// Effective operand/address sizes after prefix scanning. This decoder only
/// targets 32-bit protected mode, so the only override available is the
/// `0x66`/`0x67` pair collapsing a 4-byte default down to 2.
#[derive(Debug, Clone, Copy)]
struct Sizes {
    operand_size: u8,
    address_size: u8,
}

impl Default for Sizes {
    fn default() -> Self {
        Self {
            operand_size: 4,
            address_size: 4,
        }
    }
}

/// Decode the instruction at a live code address.
///
/// # Safety
///
/// `cursor` must point at the start of a valid instruction, and the 15
/// bytes starting at `cursor` must be mapped and readable. The decoder never
/// writes through `cursor`.
pub unsafe fn decode(cursor: *const u8, stop_on_unrelocatable: bool) -> DecodeOutcome {
    let bytes = unsafe { core::slice::from_raw_parts(cursor, MAX_INSTRUCTION_LENGTH) };
    decode_slice(bytes, stop_on_unrelocatable)
}

/// Decode the instruction at the start of `bytes`.
///
/// Pure and side-effect free (other than advisory logging on an
/// `Undecodable` result): identical inputs always yield identical outputs,
/// and `bytes` is never mutated.
pub fn decode_slice(bytes: &[u8], stop_on_unrelocatable: bool) -> DecodeOutcome {
    let mut sizes = Sizes::default();

    // Prefix scan: consume a run of legacy prefix bytes, tracking operand-
    // and address-size overrides as we go.
    let mut pos = 0usize;
    while pos < bytes.len() && PREFIX_BYTES.contains(&bytes[pos]) {
        match bytes[pos] {
            0x66 => sizes.operand_size = 2,
            0x67 => sizes.address_size = 2,
            _ => {}
        }
        pos += 1;
    }
    let prefix_len = pos;

    if pos >= bytes.len() {
        return Undecodable::report(bytes, pos);
    }

    let op = bytes[pos];

    if op == 0x0F {
        return decode_two_byte(bytes, prefix_len, stop_on_unrelocatable);
    }

    decode_one_byte(bytes, prefix_len, op, &sizes, stop_on_unrelocatable)
}

/// Length contributed by a ModR/M (+ optional SIB + displacement) operand,
/// given a slice whose byte 0 is the opcode and byte 1 is the ModR/M byte.
/// Returns `None` if the ModR/M byte itself is out of range.
fn modrm_length(tail: &[u8]) -> Option<usize> {
    let modrm = *tail.get(1)?;
    let md = modrm.get_bits(6..8);
    let rm = modrm.get_bits(0..3);

    let mut length = 2usize; // opcode + ModR/M

    match md {
        3 => return Some(length),
        1 => length += 1,
        2 => length += 4,
        _ => {}
    }

    if md == 0 && rm == 5 {
        // Absolute disp32 addressing, no base register, no SIB.
        length += 4;
        return Some(length);
    }

    if rm == 4 {
        // SIB byte follows the ModR/M byte.
        length += 1;
        if md == 0 {
            let sib = *tail.get(2)?;
            if sib.get_bits(0..3) == 5 {
                length += 4;
            }
        }
    }

    Some(length)
}

fn decode_one_byte(
    bytes: &[u8],
    prefix_len: usize,
    op: u8,
    sizes: &Sizes,
    stop_on_unrelocatable: bool,
) -> DecodeOutcome {
    let tail = &bytes[prefix_len..];

    // Position-dependent (PC-relative) short forms.
    if (0x70..=0x7F).contains(&op) || op == 0xE3 || op == 0xEB {
        if stop_on_unrelocatable {
            return DecodeOutcome::Unrelocatable;
        }
        return finish(prefix_len, 2);
    }
    if op == 0xE8 || op == 0xE9 {
        if stop_on_unrelocatable {
            return DecodeOutcome::Unrelocatable;
        }
        return finish(prefix_len, 5);
    }

    // Fixed-length one-byte-no-operand instructions: PUSH/POP reg, INC/DEC
    // reg, PUSHA/POPA, string ops, flag ops, NOP/XCHG eAX,reg, INT3, XLAT,
    // RET near/far, LEAVE, segment PUSH/POP, DAA/DAS/AAA/AAS, HLT/CMC/CLC/
    // STC/CLI/STI/CLD/STD, undocumented ICEBP (0xF1), INTO/IRET.
    if matches!(op, 0x06 | 0x07 | 0x0E | 0x16 | 0x17 | 0x1E | 0x1F)
        || matches!(op, 0x27 | 0x2F | 0x37 | 0x3F)
        || (0x40..=0x5F).contains(&op)
        || op == 0x60
        || op == 0x61
        || (0x6C..=0x6F).contains(&op)
        || (0x90..=0x99).contains(&op)
        || (0x9B..=0x9F).contains(&op)
        || op == 0xC3
        || op == 0xC9
        || op == 0xCB
        || op == 0xCC
        || op == 0xCE
        || op == 0xCF
        || op == 0xD7
        || (0xA4..=0xA7).contains(&op)
        || (0xAA..=0xAF).contains(&op)
        || (0xEC..=0xEF).contains(&op)
        || op == 0xF1
        || (0xF4..=0xF5).contains(&op)
        || (0xF8..=0xFD).contains(&op)
    {
        return finish(prefix_len, 1);
    }

    // `AL, imm8` arithmetic, MOV reg8,imm8, PUSH imm8, TEST AL,imm8: 2 bytes.
    if matches!(op, 0x04 | 0x0C | 0x14 | 0x1C | 0x24 | 0x2C | 0x34 | 0x3C)
        || (0xB0..=0xB7).contains(&op)
        || op == 0x6A
        || op == 0xA8
        || op == 0xCD
    {
        return finish(prefix_len, 2);
    }

    // AAM / AAD imm8: 2 bytes.
    if op == 0xD4 || op == 0xD5 {
        return finish(prefix_len, 2);
    }

    // RET imm16 / RET far imm16: 3 bytes.
    if op == 0xC2 || op == 0xCA {
        return finish(prefix_len, 3);
    }

    // ENTER imm16, imm8: 4 bytes.
    if op == 0xC8 {
        return finish(prefix_len, 4);
    }

    // PUSH imm32: 5 bytes.
    if op == 0x68 {
        return finish(prefix_len, 5);
    }

    // `EAX, imm32` arithmetic, MOV reg32,imm32, TEST EAX,imm32: 1 + operand size.
    if matches!(op, 0x05 | 0x0D | 0x15 | 0x1D | 0x25 | 0x2D | 0x35 | 0x3D)
        || (0xB8..=0xBF).contains(&op)
        || op == 0xA9
    {
        return finish(prefix_len, 1 + sizes.operand_size as usize);
    }

    // MOV AL/EAX <-> moffs: 1 + address size.
    if (0xA0..=0xA3).contains(&op) {
        return finish(prefix_len, 1 + sizes.address_size as usize);
    }

    // `F6`/`F7`: TEST/NOT/NEG/MUL/IMUL/DIV/IDIV group, variable length.
    if op == 0xF6 || op == 0xF7 {
        return match modrm_length(tail) {
            Some(base) => {
                let modrm = tail[1];
                let mut total = base;
                if modrm.get_bits(4..6) == 0 {
                    // reg extension selects TEST, which carries an immediate.
                    total += if op == 0xF6 { 1 } else { sizes.operand_size as usize };
                }
                finish(prefix_len, total)
            }
            None => Undecodable::report(bytes, prefix_len),
        };
    }

    // ModR/M + imm8: group 1 (80/82/83), shift group 2 (C0/C1), MOV r/m8,imm8
    // (C6), IMUL r32,r/m32,imm8 (6B).
    if matches!(op, 0x80 | 0x82 | 0x83 | 0xC0 | 0xC1 | 0xC6 | 0x6B) {
        return match modrm_length(tail) {
            Some(base) => finish(prefix_len, base + 1),
            None => Undecodable::report(bytes, prefix_len),
        };
    }

    // ModR/M + imm{16/32}: group 1 (81), MOV r/m,imm (C7), IMUL r32,r/m32,imm32 (69).
    if matches!(op, 0x81 | 0xC7 | 0x69) {
        return match modrm_length(tail) {
            Some(base) => finish(prefix_len, base + sizes.operand_size as usize),
            None => Undecodable::report(bytes, prefix_len),
        };
    }

    // ModR/M-only forms: ADD/OR/ADC/SBB/AND/SUB/XOR/CMP reg-mem, TEST,
    // XCHG, MOV reg-mem, LEA, BOUND, ARPL, LES/LDS, shift-by-1/CL (D0..D3),
    // opcode-extension groups FE/FF.
    if matches!(op, 0x00..=0x03 | 0x08..=0x0B | 0x10..=0x13 | 0x18..=0x1B)
        || matches!(op, 0x20..=0x23 | 0x28..=0x2B | 0x30..=0x33 | 0x38..=0x3B)
        || op == 0x62
        || op == 0x63
        || matches!(op, 0x84 | 0x85 | 0x86 | 0x87)
        || (0x88..=0x8F).contains(&op)
        || op == 0xC4
        || op == 0xC5
        || (0xD0..=0xD3).contains(&op)
        || op == 0xFE
        || op == 0xFF
    {
        return match modrm_length(tail) {
            Some(len) => finish(prefix_len, len),
            None => Undecodable::report(bytes, prefix_len),
        };
    }

    Undecodable::report(bytes, prefix_len)
}

fn decode_two_byte(bytes: &[u8], prefix_len: usize, stop_on_unrelocatable: bool) -> DecodeOutcome {
    let Some(&op2) = bytes.get(prefix_len + 1) else {
        return Undecodable::report(bytes, prefix_len);
    };
    let tail = &bytes[prefix_len + 1..];

    // MOVZX/MOVSX (B6,B7,BE,BF) and SETcc (90..9F).
    if matches!(op2, 0xB6 | 0xB7 | 0xBE | 0xBF) || (0x90..=0x9F).contains(&op2) {
        return match modrm_length(tail) {
            Some(len) => finish(prefix_len, 1 + len),
            None => Undecodable::report(bytes, prefix_len),
        };
    }

    // Long conditional jumps Jcc rel32 (0F 80..8F): position-dependent.
    if (0x80..=0x8F).contains(&op2) {
        if stop_on_unrelocatable {
            return DecodeOutcome::Unrelocatable;
        }
        return finish(prefix_len, 6);
    }

    Undecodable::report(bytes, prefix_len)
}

fn finish(prefix_len: usize, rest: usize) -> DecodeOutcome {
    let total = prefix_len + rest;
    debug_assert!(total >= 1 && total <= MAX_INSTRUCTION_LENGTH);
    DecodeOutcome::Length(total as u8)
}

/// Helper namespace for the `Undecodable` path: builds and logs the
/// advisory diagnostic in one place so every call site stays terse.
struct Undecodable;

impl Undecodable {
    fn report(bytes: &[u8], at: usize) -> DecodeOutcome {
        if let Some(&byte) = bytes.get(at) {
            let diag = DecodeDiagnostic { byte, offset: at };
            log::debug!("{diag}");
        }
        DecodeOutcome::Undecodable
    }
}

impl fmt::Display for DecodeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeOutcome::Length(n) => write!(f, "Length({n})"),
            DecodeOutcome::Unrelocatable => write!(f, "Unrelocatable"),
            DecodeOutcome::Undecodable => write!(f, "Undecodable"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn len(bytes: &[u8]) -> i32 {
        match decode_slice(bytes, false) {
            DecodeOutcome::Length(n) => n as i32,
            DecodeOutcome::Undecodable => -1,
            DecodeOutcome::Unrelocatable => -2,
        }
    }

    #[test]
    fn concrete_opcode_scenarios() {
        let cases: &[(&str, &[u8], i32)] = &[
            ("NOP", &[0x90], 1),
            ("Prefix abuse", &[0xF0, 0x64, 0x67, 0xF0, 0x90], 5),
            ("MOV EAX,[small]", &[0x67, 0xA1, 0x00, 0x00], 4),
            ("PUSH reg", &[0x50], 1),
            ("ADD 16", &[0x66, 0x00, 0xC0], 3),
            ("ADD 32", &[0x01, 0xC0], 2),
            ("ADD r32,[disp32]", &[0x03, 0x05, 0x00, 0x00, 0x00, 0x00], 6),
            (
                "ADD r16,[disp32]",
                &[0x66, 0x03, 0x05, 0x00, 0x00, 0x00, 0x00],
                7,
            ),
            ("ADD r,[r+r]", &[0x03, 0x0C, 0x03], 3),
            (
                "MOV r,[r*4+disp32]",
                &[0x8B, 0x04, 0x85, 0x02, 0x00, 0x00, 0x00],
                7,
            ),
            (
                "MOV r,[r*2+r+disp32]",
                &[0x8B, 0x84, 0x40, 0x02, 0x00, 0x00, 0x00],
                7,
            ),
            ("MOV r,[r*4+r+disp8]", &[0x8B, 0x44, 0x80, 0x01], 4),
            ("ADD byte [r],imm8", &[0x80, 0x00, 0x01], 3),
            ("ADD [r],imm32", &[0x81, 0x00, 0x01, 0x00, 0x00, 0x00], 6),
            ("MOV [r-1],imm8", &[0xC6, 0x45, 0xFF, 0x00], 4),
            (
                "IMUL r,[r+disp8],imm32",
                &[0x69, 0x6E, 0x2D, 0x02, 0x00, 0x00, 0x00],
                7,
            ),
            ("MUL [disp32]", &[0xF7, 0x25, 0x12, 0x00, 0x00, 0x00], 6),
            ("TEST byte [r+disp8],imm8", &[0xF6, 0x45, 0x08, 0x01], 4),
            ("MUL byte [r+disp8]", &[0xF6, 0x65, 0x08], 3),
        ];

        for (name, bytes, expected) in cases {
            assert_eq!(len(bytes), *expected, "case {name} failed");
        }
    }

    #[test]
    fn unrelocatable_short_jumps_stop_when_requested() {
        for op in [0x70u8, 0x7Fu8, 0xE3, 0xEB, 0xE8, 0xE9] {
            assert_eq!(
                decode_slice(&[op, 0, 0, 0, 0, 0], true),
                DecodeOutcome::Unrelocatable,
                "opcode {op:#x} should stop early"
            );
        }
    }

    #[test]
    fn unrelocatable_long_conditional_jump() {
        let bytes = [0x0F, 0x84, 0, 0, 0, 0];
        assert_eq!(decode_slice(&bytes, true), DecodeOutcome::Unrelocatable);
        assert_eq!(decode_slice(&bytes, false), DecodeOutcome::Length(6));
    }

    #[test]
    fn far_call_is_undecodable() {
        assert_eq!(
            decode_slice(&[0x9A, 0, 0, 0, 0, 0, 0], false),
            DecodeOutcome::Undecodable
        );
    }

    #[test]
    fn unknown_two_byte_opcode_is_undecodable() {
        // 0F 05 (SYSCALL) is not in this decoder's table.
        assert_eq!(
            decode_slice(&[0x0F, 0x05], false),
            DecodeOutcome::Undecodable
        );
    }

    #[test]
    fn prefix_additivity() {
        let base = [0x90u8];
        let DecodeOutcome::Length(base_len) = decode_slice(&base, false) else {
            panic!("expected a length");
        };
        let prefixed = [0xF0, 0x64, 0x90];
        let DecodeOutcome::Length(with_prefixes) = decode_slice(&prefixed, false) else {
            panic!("expected a length");
        };
        assert_eq!(with_prefixes, base_len + 2);
    }

    #[test]
    fn purity_does_not_mutate_input() {
        let bytes = [0x8B, 0x04, 0x85, 0x02, 0x00, 0x00, 0x00];
        let snapshot = bytes;
        let _ = decode_slice(&bytes, false);
        assert_eq!(bytes, snapshot);
    }

    proptest::proptest! {
        #[test]
        fn prefix_runs_add_exactly_their_length(n in 0usize..4) {
            let prefixes = [0x66u8, 0x67, 0x2E, 0xF0];
            let mut buf = Vec::new();
            for i in 0..n {
                buf.push(prefixes[i % prefixes.len()]);
            }
            buf.push(0x90); // NOP, 1 byte, never itself a prefix byte.

            if let DecodeOutcome::Length(total) = decode_slice(&buf, false) {
                proptest::prop_assert_eq!(total as usize, n + 1);
            } else {
                proptest::prop_assert!(false, "expected a length result");
            }
        }

        #[test]
        fn jcc_short_is_unrelocatable_for_any_rel8(op in 0x70u8..=0x7F, rel in proptest::prelude::any::<u8>()) {
            let bytes = [op, rel];
            proptest::prop_assert_eq!(decode_slice(&bytes, true), DecodeOutcome::Unrelocatable);
            proptest::prop_assert_eq!(decode_slice(&bytes, false), DecodeOutcome::Length(2));
        }
    }
}
