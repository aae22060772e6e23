//! x86_64 instruction decoder.
//!
//! Length-decodes entry sequences so the patcher can pick a cut point that
//! never splits an instruction, and scans generic dispatch shims for their
//! single indirect call target. This is not a disassembler; it understands
//! exactly enough encoding structure (prefixes, REX, ModRM/SIB, immediates)
//! to walk prologues and recognize branches.

use std::ops::Range;

use crate::types::MockError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InsnKind {
    Other,
    /// RET / RET imm16.
    Ret,
    /// INT3, UD2, HLT.
    Trap,
    /// E8 rel32, with the signed displacement.
    CallRel32(i32),
    Jmp,
    Jcc,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Insn {
    pub len: usize,
    pub kind: InsnKind,
}

struct Cursor<'a> {
    code: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn u8(&mut self) -> Result<u8, ()> {
        let b = *self.code.get(self.pos).ok_or(())?;
        self.pos += 1;
        Ok(b)
    }

    fn peek(&self) -> Result<u8, ()> {
        self.code.get(self.pos).copied().ok_or(())
    }

    fn skip(&mut self, n: usize) -> Result<(), ()> {
        if self.pos + n > self.code.len() {
            return Err(());
        }
        self.pos += n;
        Ok(())
    }

    fn i32(&mut self) -> Result<i32, ()> {
        if self.pos + 4 > self.code.len() {
            return Err(());
        }
        let b = &self.code[self.pos..self.pos + 4];
        self.pos += 4;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
}

/// ModRM-carrying one-byte opcodes.
fn one_byte_has_modrm(op: u8) -> bool {
    matches!(op,
        0x00..=0x03 | 0x08..=0x0B | 0x10..=0x13 | 0x18..=0x1B
        | 0x20..=0x23 | 0x28..=0x2B | 0x30..=0x33 | 0x38..=0x3B
        | 0x62..=0x63 | 0x69 | 0x6B | 0x80..=0x8F | 0xC0..=0xC1
        | 0xC4..=0xC7 | 0xD0..=0xD3 | 0xD8..=0xDF | 0xF6..=0xF7
        | 0xFE..=0xFF)
}

/// Immediate width for a one-byte opcode (F6/F7 handled separately).
fn one_byte_imm(op: u8, opsize16: bool, rexw: bool) -> usize {
    let imm_zv = |small: usize| if opsize16 { 2 } else { small };
    match op {
        0x04 | 0x0C | 0x14 | 0x1C | 0x24 | 0x2C | 0x34 | 0x3C => 1,
        0x05 | 0x0D | 0x15 | 0x1D | 0x25 | 0x2D | 0x35 | 0x3D => imm_zv(4),
        0x68 | 0x69 | 0x81 => imm_zv(4),
        0x6A | 0x6B => 1,
        0x80 | 0x82 | 0x83 => 1,
        0xA0..=0xA3 => {
            if rexw {
                8
            } else {
                4
            }
        }
        0xA8 => 1,
        0xA9 => imm_zv(4),
        0xB0..=0xB7 => 1,
        0xB8..=0xBF => {
            if rexw {
                8
            } else {
                imm_zv(4)
            }
        }
        0xC0 | 0xC1 | 0xC6 => 1,
        0xC7 => imm_zv(4),
        0xC8 => 3,
        0xCD => 1,
        0xD4 | 0xD5 => 1,
        0xE0..=0xE7 => 1,
        _ => 0,
    }
}

/// ModRM-carrying two-byte (0F xx) opcodes.
fn two_byte_has_modrm(op2: u8) -> bool {
    !matches!(op2,
        0x05..=0x09 | 0x0B | 0x0E | 0x30..=0x37 | 0x77
        | 0x80..=0x8F | 0xA0 | 0xA1 | 0xA8 | 0xA9)
}

fn two_byte_imm(op2: u8) -> usize {
    match op2 {
        0x70..=0x73 | 0xA4 | 0xAC | 0xBA | 0xC2 | 0xC4..=0xC6 => 1,
        _ => 0,
    }
}

/// Skip ModRM, optional SIB, and displacement.
fn skip_modrm(c: &mut Cursor<'_>) -> Result<(), ()> {
    let modrm = c.u8()?;
    let mode = modrm >> 6;
    let rm = modrm & 7;
    if mode == 3 {
        return Ok(());
    }
    let mut disp = match mode {
        1 => 1,
        2 => 4,
        _ => 0,
    };
    if rm == 4 {
        let sib = c.u8()?;
        if mode == 0 && sib & 7 == 5 {
            disp = 4;
        }
    } else if mode == 0 && rm == 5 {
        // RIP-relative.
        disp = 4;
    }
    c.skip(disp)
}

/// Decode one instruction at the start of `code`.
pub(crate) fn decode(code: &[u8]) -> Result<Insn, ()> {
    let mut c = Cursor { code, pos: 0 };

    let mut opsize16 = false;
    loop {
        match c.peek()? {
            0x26 | 0x2E | 0x36 | 0x3E | 0x64 | 0x65 | 0x67 | 0xF0 | 0xF2 | 0xF3 => {
                c.skip(1)?;
            }
            0x66 => {
                opsize16 = true;
                c.skip(1)?;
            }
            _ => break,
        }
    }

    let mut rexw = false;
    if c.peek()? & 0xF0 == 0x40 {
        rexw = c.u8()? & 0x08 != 0;
    }

    let op = c.u8()?;
    let done = |c: Cursor<'_>, kind| Ok(Insn { len: c.pos, kind });

    // Opcodes removed in 64-bit mode; hitting one means the walk has left
    // real code.
    if matches!(op, 0x06 | 0x07 | 0x0E | 0x16 | 0x17 | 0x1E | 0x1F | 0x27 | 0x2F | 0x37 | 0x3F | 0x60 | 0x61 | 0xD6 | 0xEA)
    {
        return Err(());
    }

    match op {
        0xC3 => return done(c, InsnKind::Ret),
        0xC2 => {
            c.skip(2)?;
            return done(c, InsnKind::Ret);
        }
        0xCC | 0xF4 => return done(c, InsnKind::Trap),
        0xEB => {
            c.skip(1)?;
            return done(c, InsnKind::Jmp);
        }
        0xE9 => {
            c.skip(4)?;
            return done(c, InsnKind::Jmp);
        }
        0xE8 => {
            let rel = c.i32()?;
            return done(c, InsnKind::CallRel32(rel));
        }
        0x70..=0x7F => {
            c.skip(1)?;
            return done(c, InsnKind::Jcc);
        }
        0x0F => {
            let op2 = c.u8()?;
            if op2 == 0x0B {
                return done(c, InsnKind::Trap);
            }
            if (0x80..=0x8F).contains(&op2) {
                c.skip(4)?;
                return done(c, InsnKind::Jcc);
            }
            // 0F 38 / 0F 3A escape groups always carry ModRM; 0F 3A adds imm8.
            let mut imm = two_byte_imm(op2);
            let has_modrm = match op2 {
                0x38 => {
                    c.skip(1)?;
                    true
                }
                0x3A => {
                    c.skip(1)?;
                    imm = 1;
                    true
                }
                _ => two_byte_has_modrm(op2),
            };
            if has_modrm {
                skip_modrm(&mut c)?;
            }
            c.skip(imm)?;
            return done(c, InsnKind::Other);
        }
        _ => {}
    }

    if one_byte_has_modrm(op) {
        // ModRM must be read before the F6/F7 immediate decision.
        let modrm = c.peek()?;
        skip_modrm(&mut c)?;
        let imm = if op == 0xF6 || op == 0xF7 {
            // Only the TEST forms (/0, /1) carry an immediate.
            if (modrm >> 3) & 7 <= 1 {
                if op == 0xF6 {
                    1
                } else if opsize16 {
                    2
                } else {
                    4
                }
            } else {
                0
            }
        } else {
            one_byte_imm(op, opsize16, rexw)
        };
        c.skip(imm)?;
    } else {
        c.skip(one_byte_imm(op, opsize16, rexw))?;
    }
    done(c, InsnKind::Other)
}

/// First instruction boundary at or past `required`.
///
/// With `safety` enabled, crossing an unconditional return before the
/// boundary is fatal: the function body is too short to host the branch
/// sequence. Unsafe mode accepts any boundary.
pub fn disassemble(code: &[u8], required: usize, safety: bool) -> Result<usize, MockError> {
    let mut pos = 0usize;
    while pos < required {
        let insn = decode(&code[pos..]).map_err(|_| MockError::Disassembly { offset: pos })?;
        if safety && insn.kind == InsnKind::Ret {
            return Err(MockError::FunctionTooShort);
        }
        pos += insn.len;
    }
    Ok(pos)
}

/// Scan a dispatch shim for its single qualifying call target.
///
/// Walks forward until a return, collecting `CALL rel32` targets whose
/// destination is outside `skip` (bulk-copy helper ranges). Exactly one
/// surviving target is required; anything else means the shim shape
/// assumption does not hold for this code.
pub fn locate_indirect_target(
    code: &[u8],
    pc: usize,
    skip: &[Range<usize>],
) -> Result<usize, MockError> {
    let mut pos = 0usize;
    let mut found: Vec<usize> = Vec::new();

    while pos < code.len() {
        let insn = decode(&code[pos..]).map_err(|_| MockError::Disassembly { offset: pos })?;
        match insn.kind {
            InsnKind::Ret | InsnKind::Trap => break,
            InsnKind::CallRel32(rel) => {
                let next = pc.wrapping_add(pos).wrapping_add(insn.len);
                let target = next.wrapping_add(rel as isize as usize);
                if skip.iter().any(|r| r.contains(&target)) {
                    log::trace!("shim scan: skipping copy helper at {target:#x}");
                } else {
                    found.push(target);
                }
            }
            _ => {}
        }
        pos += insn.len;
    }

    if found.len() != 1 {
        return Err(MockError::IndirectTarget { count: found.len() });
    }
    Ok(found[0])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn len_of(code: &[u8]) -> usize {
        decode(code).unwrap().len
    }

    #[test]
    fn common_prologue_lengths() {
        assert_eq!(len_of(&[0x55]), 1); // push rbp
        assert_eq!(len_of(&[0x48, 0x89, 0xE5]), 3); // mov rbp, rsp
        assert_eq!(len_of(&[0x48, 0x83, 0xEC, 0x20]), 4); // sub rsp, 0x20
        assert_eq!(len_of(&[0x48, 0x81, 0xEC, 0x80, 0x00, 0x00, 0x00]), 7); // sub rsp, 0x80
        assert_eq!(len_of(&[0xF3, 0x0F, 0x1E, 0xFA]), 4); // endbr64
        assert_eq!(len_of(&[0x90]), 1); // nop
    }

    #[test]
    fn rip_relative_and_imm64_lengths() {
        // mov rax, [rip+0x10]
        assert_eq!(len_of(&[0x48, 0x8B, 0x05, 0x10, 0x00, 0x00, 0x00]), 7);
        // lea rax, [rip+0x10]
        assert_eq!(len_of(&[0x48, 0x8D, 0x05, 0x10, 0x00, 0x00, 0x00]), 7);
        // movabs rax, imm64
        assert_eq!(len_of(&[0x48, 0xB8, 1, 2, 3, 4, 5, 6, 7, 8]), 10);
        // mov [rsp+8], rdi (SIB)
        assert_eq!(len_of(&[0x48, 0x89, 0x7C, 0x24, 0x08]), 5);
    }

    #[test]
    fn branch_kinds() {
        assert_eq!(decode(&[0xC3]).unwrap().kind, InsnKind::Ret);
        assert_eq!(decode(&[0xC2, 0x08, 0x00]).unwrap().kind, InsnKind::Ret);
        assert_eq!(decode(&[0xCC]).unwrap().kind, InsnKind::Trap);
        assert_eq!(decode(&[0x0F, 0x0B]).unwrap().kind, InsnKind::Trap);
        assert_eq!(decode(&[0xEB, 0x10]).unwrap().kind, InsnKind::Jmp);
        assert_eq!(decode(&[0xE9, 0, 1, 0, 0]).unwrap().kind, InsnKind::Jmp);
        assert_eq!(decode(&[0x74, 0x10]).unwrap().kind, InsnKind::Jcc);
        assert_eq!(decode(&[0x0F, 0x84, 0, 1, 0, 0]).unwrap().kind, InsnKind::Jcc);
        assert_eq!(
            decode(&[0xE8, 0x00, 0x01, 0x00, 0x00]).unwrap().kind,
            InsnKind::CallRel32(0x100)
        );
    }

    #[test]
    fn disassemble_lands_on_boundaries() {
        // push rbp (1); mov rbp,rsp (3); sub rsp,0x80 (7); nop (1)
        let code = [
            0x55, 0x48, 0x89, 0xE5, 0x48, 0x81, 0xEC, 0x80, 0x00, 0x00, 0x00, 0x90,
        ];
        assert_eq!(disassemble(&code, 1, true).unwrap(), 1);
        assert_eq!(disassemble(&code, 2, true).unwrap(), 4);
        assert_eq!(disassemble(&code, 5, true).unwrap(), 11);
        assert_eq!(disassemble(&code, 11, true).unwrap(), 11);
        assert_eq!(disassemble(&code, 12, true).unwrap(), 12);
    }

    #[test]
    fn disassemble_rejects_short_function_in_safety_mode() {
        // xor eax, eax; ret
        let code = [0x31, 0xC0, 0xC3, 0x90, 0x90, 0x90, 0x90, 0x90];
        assert!(matches!(
            disassemble(&code, 5, true),
            Err(MockError::FunctionTooShort)
        ));
        // Unsafe mode takes the boundary past the return.
        assert_eq!(disassemble(&code, 5, false).unwrap(), 5);
    }

    #[test]
    fn invalid_64bit_opcodes_are_undecodable() {
        // AAA (0x37) and 16-bit-era PUSH CS (0x0E) do not exist in 64-bit
        // mode.
        assert!(decode(&[0x37, 0x90]).is_err());
        assert!(decode(&[0x0E, 0x90]).is_err());
        assert!(matches!(
            disassemble(&[0x90, 0x37, 0x90, 0x90], 3, true),
            Err(MockError::Disassembly { offset: 1 })
        ));
    }

    #[test]
    fn disassemble_fails_on_truncated_window() {
        let code = [0x48, 0x81]; // truncated sub
        assert!(matches!(
            disassemble(&code, 2, true),
            Err(MockError::Disassembly { offset: 0 })
        ));
    }

    #[test]
    fn locate_single_call_target() {
        // mov rax, rdi; call +0x100; ret
        let code = [0x48, 0x89, 0xF8, 0xE8, 0x00, 0x01, 0x00, 0x00, 0xC3];
        let target = locate_indirect_target(&code, 0x1000, &[]).unwrap();
        // call at 0x1003, next insn at 0x1008, +0x100
        assert_eq!(target, 0x1108);
    }

    #[test]
    fn locate_rejects_zero_and_multiple_targets() {
        let none = [0x48, 0x89, 0xF8, 0xC3];
        assert!(matches!(
            locate_indirect_target(&none, 0x1000, &[]),
            Err(MockError::IndirectTarget { count: 0 })
        ));

        let two = [
            0xE8, 0x00, 0x01, 0x00, 0x00, // call +0x100
            0xE8, 0x00, 0x02, 0x00, 0x00, // call +0x200
            0xC3,
        ];
        assert!(matches!(
            locate_indirect_target(&two, 0x1000, &[]),
            Err(MockError::IndirectTarget { count: 2 })
        ));
    }

    #[test]
    fn locate_skips_copy_helper_ranges() {
        let code = [
            0xE8, 0x00, 0x01, 0x00, 0x00, // call +0x100 -> 0x1105 (helper)
            0xE8, 0x00, 0x02, 0x00, 0x00, // call +0x200 -> 0x120A (body)
            0xC3,
        ];
        let target = locate_indirect_target(&code, 0x1000, &[0x1100..0x1200]).unwrap();
        assert_eq!(target, 0x120A);
    }

    #[test]
    fn locate_stops_scanning_at_return() {
        let code = [
            0xC3, // ret
            0xE8, 0x00, 0x01, 0x00, 0x00, // unreachable call
        ];
        assert!(matches!(
            locate_indirect_target(&code, 0x1000, &[]),
            Err(MockError::IndirectTarget { count: 0 })
        ));
    }

    #[test]
    fn backward_call_displacement_resolves() {
        // call -0x10 at pc 0x2000: next = 0x2005, target = 0x1FF5
        let code = [0xE8, 0xF0, 0xFF, 0xFF, 0xFF, 0xC3];
        assert_eq!(locate_indirect_target(&code, 0x2000, &[]).unwrap(), 0x1FF5);
    }
}
