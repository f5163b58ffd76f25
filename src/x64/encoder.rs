//! x86-64 instruction encoder.
//!
//! Hand-built REX/ModRM/SIB construction for the integer core. The encoder
//! is pure: it reads the [`EncodeCtx`] and returns bytes plus an optional
//! label fixup; buffer writes and label links are the assembler's job.
//! Branches pick the shortest form that can hold the displacement unless
//! `SHORT_FORM`/`LONG_FORM` overrides the choice.

use crate::core::arch::ArchId;
use crate::core::buffer::fits_either;
use crate::core::encoder::{ArchEncoder, EncodeCtx, Encoded};
use crate::core::error::{EmitError, EmitResult};
use crate::core::inst::{InstId, InstOptions};
use crate::core::operand::{Imm, Label, Mem, MemBaseKind, Operand, Reg, Segment};

use super::inst::Inst;

/// Build a REX prefix byte.
const fn rex(w: bool, r: bool, x: bool, b: bool) -> u8 {
    0x40 | (w as u8) << 3 | (r as u8) << 2 | (x as u8) << 1 | (b as u8)
}

const fn modrm(md: u8, reg: u8, rm: u8) -> u8 {
    md << 6 | (reg & 7) << 3 | (rm & 7)
}

const fn sib(scale: u8, index: u8, base: u8) -> u8 {
    scale << 6 | (index & 7) << 3 | (base & 7)
}

/// Validates a physical general-purpose register and splits it into
/// `(size, id)`.
fn gp(reg: Reg) -> EmitResult<(u32, u32)> {
    if !reg.is_gp() || reg.id() >= 16 {
        return Err(EmitError::InvalidInstruction);
    }
    Ok((reg.size(), reg.id()))
}

/// Whether the immediate is representable in a slot of `size` bytes under
/// either signedness reading.
fn imm_fits(imm: &Imm, size: u32) -> bool {
    fits_either(imm.value(), size as usize)
}

/// The r/m side of a ModR/M encoded instruction.
enum Rm<'a> {
    Reg { id: u32, byte: bool },
    Mem(&'a Mem),
}

fn segment_prefix(seg: Segment) -> Option<u8> {
    match seg {
        Segment::None => None,
        Segment::Es => Some(0x26),
        Segment::Cs => Some(0x2E),
        Segment::Ss => Some(0x36),
        Segment::Ds => Some(0x3E),
        Segment::Fs => Some(0x64),
        Segment::Gs => Some(0x65),
    }
}

/// Emits `[seg] [66] [REX] opcode modrm [sib] [disp]` for one r/m form.
///
/// `reg` is the full 4-bit reg field (a register id or an opcode digit);
/// `reg_is_byte` marks it as an 8-bit register so SPL..DIL force a REX
/// prefix.
fn emit_rm(
    e: &mut Encoded,
    ctx: &EncodeCtx<'_, '_>,
    opsize: u32,
    opcode: &[u8],
    reg: u32,
    reg_is_byte: bool,
    rm: &Rm<'_>,
) -> EmitResult<()> {
    if let Rm::Mem(mem) = rm {
        if let Some(prefix) = segment_prefix(mem.segment_override()) {
            e.push(prefix);
        }
    }
    if opsize == 2 {
        e.push(0x66);
    }

    let rex_w = opsize == 8;
    let rex_r = reg & 8 != 0;
    let (rex_x, rex_b, rm_forces_rex) = match rm {
        Rm::Reg { id, byte } => (false, id & 8 != 0, *byte && (4..8).contains(id)),
        Rm::Mem(mem) => {
            let b = mem.base_reg().is_some_and(|id| id & 8 != 0);
            let x = mem.index_reg().is_some_and(|id| id & 8 != 0);
            (x, b, false)
        }
    };
    let reg_forces_rex = reg_is_byte && (4..8).contains(&reg);
    if rex_w || rex_r || rex_x || rex_b || rm_forces_rex || reg_forces_rex {
        e.push(rex(rex_w, rex_r, rex_x, rex_b));
    }

    e.push_slice(opcode);

    match rm {
        Rm::Reg { id, .. } => e.push(modrm(0b11, reg as u8, *id as u8)),
        Rm::Mem(mem) => emit_mem(e, ctx, reg as u8, mem)?,
    }
    Ok(())
}

/// Emits ModR/M + SIB + displacement for a memory operand; `reg` is the
/// already-masked reg field.
fn emit_mem(e: &mut Encoded, ctx: &EncodeCtx<'_, '_>, reg: u8, mem: &Mem) -> EmitResult<()> {
    let disp = mem.displacement();
    match mem.base_kind() {
        MemBaseKind::Label => {
            // RIP-relative; the 4-byte slot resolves against the label.
            if mem.has_index() {
                return Err(EmitError::InvalidInstruction);
            }
            let label = Label::from_id(mem.base_label().map(Label::id).unwrap_or(u32::MAX));
            if !ctx.code.is_label_valid(label) {
                return Err(EmitError::InvalidLabel);
            }
            e.push(modrm(0b00, reg, 0b101));
            e.push_fixup_slot(label, 4, disp);
        }
        MemBaseKind::Reg => {
            let base = match mem.base_reg() {
                Some(id) if id < 16 => id,
                _ => return Err(EmitError::InvalidInstruction),
            };
            let base_low = (base & 7) as u8;
            // mod 00 with rbp/r13 means disp32-only, so those take disp8=0.
            let (md, disp_size) = if disp == 0 && base_low != 0b101 {
                (0b00, 0)
            } else if (-128..=127).contains(&disp) {
                (0b01, 1)
            } else {
                (0b10, 4)
            };
            match mem.index_reg() {
                None => {
                    if base_low == 0b100 {
                        // rsp/r12 as base always needs a SIB byte.
                        e.push(modrm(md, reg, 0b100));
                        e.push(sib(0, 0b100, base_low));
                    } else {
                        e.push(modrm(md, reg, base_low));
                    }
                }
                Some(index) => {
                    if index >= 16 || index == 4 {
                        return Err(EmitError::InvalidInstruction);
                    }
                    e.push(modrm(md, reg, 0b100));
                    e.push(sib(mem.shift() as u8, (index & 7) as u8, base_low));
                }
            }
            e.push_value_le(disp as u32 as u64, disp_size);
        }
        MemBaseKind::None => {
            // Absolute [disp32] through a SIB byte with no base.
            match mem.index_reg() {
                None => {
                    e.push(modrm(0b00, reg, 0b100));
                    e.push(sib(0, 0b100, 0b101));
                }
                Some(index) => {
                    if index >= 16 || index == 4 {
                        return Err(EmitError::InvalidInstruction);
                    }
                    e.push(modrm(0b00, reg, 0b100));
                    e.push(sib(mem.shift() as u8, (index & 7) as u8, 0b101));
                }
            }
            e.push_value_le(disp as u32 as u64, 4);
        }
    }
    Ok(())
}

/// Emits an opcode with the register encoded in its low bits
/// (`B8+rd`-style).
fn emit_plus_r(e: &mut Encoded, opsize: u32, base: u8, id: u32) {
    if opsize == 2 {
        e.push(0x66);
    }
    let rex_w = opsize == 8;
    let rex_b = id & 8 != 0;
    let byte_forces_rex = opsize == 1 && (4..8).contains(&id);
    if rex_w || rex_b || byte_forces_rex {
        e.push(rex(rex_w, false, false, rex_b));
    }
    e.push(base + (id & 7) as u8);
}

/// Rejects a memory operand whose displacement slot would be followed by
/// an immediate; the fixup patch assumes the slot ends the instruction.
fn reject_label_mem(rm: &Rm<'_>) -> EmitResult<()> {
    if let Rm::Mem(mem) = rm {
        if mem.base_kind() == MemBaseKind::Label {
            return Err(EmitError::InvalidInstruction);
        }
    }
    Ok(())
}

/// ALU group sharing the `00/08/20/28/30/38` opcode layout plus the
/// `80/81/83` immediate forms.
fn encode_alu(
    e: &mut Encoded,
    ctx: &EncodeCtx<'_, '_>,
    ops: &[Operand],
    base_opc: u8,
    ext: u32,
) -> EmitResult<()> {
    match ops {
        [Operand::Reg(dst), Operand::Reg(src)] => {
            let (dst_size, dst_id) = gp(*dst)?;
            let (src_size, src_id) = gp(*src)?;
            if dst_size != src_size {
                return Err(EmitError::InvalidOperandSize);
            }
            let byte = dst_size == 1;
            let opc = if byte { base_opc } else { base_opc + 1 };
            let rm = Rm::Reg { id: dst_id, byte };
            emit_rm(e, ctx, dst_size, &[opc], src_id, byte, &rm)
        }
        [Operand::Reg(dst), Operand::Mem(mem)] => {
            let (size, id) = gp(*dst)?;
            let byte = size == 1;
            let opc = if byte { base_opc + 2 } else { base_opc + 3 };
            emit_rm(e, ctx, size, &[opc], id, byte, &Rm::Mem(mem))
        }
        [Operand::Mem(mem), Operand::Reg(src)] => {
            let (size, id) = gp(*src)?;
            let byte = size == 1;
            let opc = if byte { base_opc } else { base_opc + 1 };
            emit_rm(e, ctx, size, &[opc], id, byte, &Rm::Mem(mem))
        }
        [Operand::Reg(dst), Operand::Imm(imm)] => {
            let (size, id) = gp(*dst)?;
            let rm = Rm::Reg { id, byte: size == 1 };
            encode_alu_imm(e, ctx, size, ext, &rm, imm)
        }
        [Operand::Mem(mem), Operand::Imm(imm)] => {
            let size = mem.size_hint();
            if !matches!(size, 1 | 2 | 4 | 8) {
                return Err(EmitError::InvalidOperandSize);
            }
            let rm = Rm::Mem(mem);
            reject_label_mem(&rm)?;
            encode_alu_imm(e, ctx, size, ext, &rm, imm)
        }
        _ => Err(EmitError::InvalidInstruction),
    }
}

fn encode_alu_imm(
    e: &mut Encoded,
    ctx: &EncodeCtx<'_, '_>,
    opsize: u32,
    ext: u32,
    rm: &Rm<'_>,
    imm: &Imm,
) -> EmitResult<()> {
    if opsize == 1 {
        if !imm_fits(imm, 1) {
            return Err(EmitError::InvalidInstruction);
        }
        emit_rm(e, ctx, 1, &[0x80], ext, false, rm)?;
        e.push(imm.value() as u8);
        return Ok(());
    }
    if imm.fits_i8() {
        // Sign-extended imm8 is the shortest form.
        emit_rm(e, ctx, opsize, &[0x83], ext, false, rm)?;
        e.push(imm.value() as u8);
        return Ok(());
    }
    let fits = match opsize {
        2 => imm_fits(imm, 2),
        4 => imm_fits(imm, 4),
        // 64-bit forms sign-extend a 32-bit immediate.
        _ => imm.fits_i32(),
    };
    if !fits {
        return Err(EmitError::InvalidInstruction);
    }
    emit_rm(e, ctx, opsize, &[0x81], ext, false, rm)?;
    e.push_value_le(imm.value() as u64, opsize.min(4) as usize);
    Ok(())
}

fn encode_mov(e: &mut Encoded, ctx: &EncodeCtx<'_, '_>, ops: &[Operand]) -> EmitResult<()> {
    match ops {
        [Operand::Reg(dst), Operand::Reg(src)] => {
            let (dst_size, dst_id) = gp(*dst)?;
            let (src_size, src_id) = gp(*src)?;
            if dst_size != src_size {
                return Err(EmitError::InvalidOperandSize);
            }
            let byte = dst_size == 1;
            let opc = if byte { 0x88 } else { 0x89 };
            let rm = Rm::Reg { id: dst_id, byte };
            emit_rm(e, ctx, dst_size, &[opc], src_id, byte, &rm)
        }
        [Operand::Reg(dst), Operand::Mem(mem)] => {
            let (size, id) = gp(*dst)?;
            let byte = size == 1;
            let opc = if byte { 0x8A } else { 0x8B };
            emit_rm(e, ctx, size, &[opc], id, byte, &Rm::Mem(mem))
        }
        [Operand::Mem(mem), Operand::Reg(src)] => {
            let (size, id) = gp(*src)?;
            let byte = size == 1;
            let opc = if byte { 0x88 } else { 0x89 };
            emit_rm(e, ctx, size, &[opc], id, byte, &Rm::Mem(mem))
        }
        [Operand::Reg(dst), Operand::Imm(imm)] => {
            let (size, id) = gp(*dst)?;
            match size {
                1 | 2 | 4 => {
                    if !imm_fits(imm, size) {
                        return Err(EmitError::InvalidInstruction);
                    }
                    let base = if size == 1 { 0xB0 } else { 0xB8 };
                    emit_plus_r(e, size, base, id);
                    e.push_value_le(imm.value() as u64, size as usize);
                    Ok(())
                }
                _ => {
                    if imm.value() >= 0 && imm.fits_u32() {
                        // Implicit zero extension: a 32-bit move is shorter.
                        emit_plus_r(e, 4, 0xB8, id);
                        e.push_value_le(imm.value() as u64, 4);
                    } else if imm.fits_i32() {
                        let rm = Rm::Reg { id, byte: false };
                        emit_rm(e, ctx, 8, &[0xC7], 0, false, &rm)?;
                        e.push_value_le(imm.value() as u64, 4);
                    } else {
                        emit_plus_r(e, 8, 0xB8, id);
                        e.push_value_le(imm.value() as u64, 8);
                    }
                    Ok(())
                }
            }
        }
        [Operand::Mem(mem), Operand::Imm(imm)] => {
            let size = mem.size_hint();
            if !matches!(size, 1 | 2 | 4 | 8) {
                return Err(EmitError::InvalidOperandSize);
            }
            let rm = Rm::Mem(mem);
            reject_label_mem(&rm)?;
            let fits = if size == 8 { imm.fits_i32() } else { imm_fits(imm, size) };
            if !fits {
                return Err(EmitError::InvalidInstruction);
            }
            let opc = if size == 1 { 0xC6 } else { 0xC7 };
            emit_rm(e, ctx, size, &[opc], 0, false, &rm)?;
            e.push_value_le(imm.value() as u64, size.min(4) as usize);
            Ok(())
        }
        _ => Err(EmitError::InvalidInstruction),
    }
}

fn encode_movzx(e: &mut Encoded, ctx: &EncodeCtx<'_, '_>, ops: &[Operand]) -> EmitResult<()> {
    let (dst_size, dst_id, src) = match ops {
        [Operand::Reg(dst), src] => {
            let (size, id) = gp(*dst)?;
            (size, id, src)
        }
        _ => return Err(EmitError::InvalidInstruction),
    };
    if dst_size < 2 {
        return Err(EmitError::InvalidInstruction);
    }
    let (src_size, rm) = match src {
        Operand::Reg(src) => {
            let (size, id) = gp(*src)?;
            (size, Rm::Reg { id, byte: size == 1 })
        }
        Operand::Mem(mem) => (mem.size_hint(), Rm::Mem(mem)),
        _ => return Err(EmitError::InvalidInstruction),
    };
    let opc = match src_size {
        1 => 0xB6,
        2 if dst_size > 2 => 0xB7,
        _ => return Err(EmitError::InvalidInstruction),
    };
    emit_rm(e, ctx, dst_size, &[0x0F, opc], dst_id, false, &rm)
}

fn encode_test(e: &mut Encoded, ctx: &EncodeCtx<'_, '_>, ops: &[Operand]) -> EmitResult<()> {
    match ops {
        [Operand::Reg(a), Operand::Reg(b)] => {
            let (a_size, a_id) = gp(*a)?;
            let (b_size, b_id) = gp(*b)?;
            if a_size != b_size {
                return Err(EmitError::InvalidOperandSize);
            }
            let byte = a_size == 1;
            let opc = if byte { 0x84 } else { 0x85 };
            let rm = Rm::Reg { id: a_id, byte };
            emit_rm(e, ctx, a_size, &[opc], b_id, byte, &rm)
        }
        [Operand::Mem(mem), Operand::Reg(b)] => {
            let (size, id) = gp(*b)?;
            let byte = size == 1;
            let opc = if byte { 0x84 } else { 0x85 };
            emit_rm(e, ctx, size, &[opc], id, byte, &Rm::Mem(mem))
        }
        [Operand::Reg(a), Operand::Imm(imm)] => {
            let (size, id) = gp(*a)?;
            let rm = Rm::Reg { id, byte: size == 1 };
            encode_test_imm(e, ctx, size, &rm, imm)
        }
        [Operand::Mem(mem), Operand::Imm(imm)] => {
            let size = mem.size_hint();
            if !matches!(size, 1 | 2 | 4 | 8) {
                return Err(EmitError::InvalidOperandSize);
            }
            let rm = Rm::Mem(mem);
            reject_label_mem(&rm)?;
            encode_test_imm(e, ctx, size, &rm, imm)
        }
        _ => Err(EmitError::InvalidInstruction),
    }
}

fn encode_test_imm(
    e: &mut Encoded,
    ctx: &EncodeCtx<'_, '_>,
    opsize: u32,
    rm: &Rm<'_>,
    imm: &Imm,
) -> EmitResult<()> {
    let fits = if opsize == 8 { imm.fits_i32() } else { imm_fits(imm, opsize) };
    if !fits {
        return Err(EmitError::InvalidInstruction);
    }
    let opc = if opsize == 1 { 0xF6 } else { 0xF7 };
    emit_rm(e, ctx, opsize, &[opc], 0, false, rm)?;
    e.push_value_le(imm.value() as u64, opsize.min(4) as usize);
    Ok(())
}

/// `inc`/`dec` (`FE`/`FF`) and `not`/`neg` (`F6`/`F7`) unary forms.
fn encode_unary(
    e: &mut Encoded,
    ctx: &EncodeCtx<'_, '_>,
    ops: &[Operand],
    byte_opc: u8,
    wide_opc: u8,
    ext: u32,
) -> EmitResult<()> {
    match ops {
        [Operand::Reg(reg)] => {
            let (size, id) = gp(*reg)?;
            let byte = size == 1;
            let opc = if byte { byte_opc } else { wide_opc };
            let rm = Rm::Reg { id, byte };
            emit_rm(e, ctx, size, &[opc], ext, false, &rm)
        }
        [Operand::Mem(mem)] => {
            let size = mem.size_hint();
            if !matches!(size, 1 | 2 | 4 | 8) {
                return Err(EmitError::InvalidOperandSize);
            }
            let opc = if size == 1 { byte_opc } else { wide_opc };
            emit_rm(e, ctx, size, &[opc], ext, false, &Rm::Mem(mem))
        }
        _ => Err(EmitError::InvalidInstruction),
    }
}

/// `push`/`pop` operate on the full 64-bit width without REX.W.
fn encode_push_pop(
    e: &mut Encoded,
    ctx: &EncodeCtx<'_, '_>,
    ops: &[Operand],
    plus_r: u8,
    mem_opc: u32,
    allow_imm: bool,
) -> EmitResult<()> {
    match ops {
        [Operand::Reg(reg)] => {
            let (size, id) = gp(*reg)?;
            if size != 8 {
                return Err(EmitError::InvalidOperandSize);
            }
            if id & 8 != 0 {
                e.push(rex(false, false, false, true));
            }
            e.push(plus_r + (id & 7) as u8);
            Ok(())
        }
        [Operand::Mem(mem)] => {
            if !matches!(mem.size_hint(), 0 | 8) {
                return Err(EmitError::InvalidOperandSize);
            }
            let opc = if mem_opc == 6 { 0xFF } else { 0x8F };
            emit_rm(e, ctx, 4, &[opc], mem_opc, false, &Rm::Mem(mem))
        }
        [Operand::Imm(imm)] if allow_imm => {
            if imm.fits_i8() {
                e.push(0x6A);
                e.push(imm.value() as u8);
            } else if imm.fits_i32() {
                e.push(0x68);
                e.push_value_le(imm.value() as u64, 4);
            } else {
                return Err(EmitError::InvalidInstruction);
            }
            Ok(())
        }
        _ => Err(EmitError::InvalidInstruction),
    }
}

fn encode_branch(
    e: &mut Encoded,
    ctx: &EncodeCtx<'_, '_>,
    inst: Inst,
    ops: &[Operand],
) -> EmitResult<()> {
    match ops {
        [Operand::Label(label)] => {
            if !ctx.code.is_label_valid(*label) {
                return Err(EmitError::InvalidLabel);
            }
            let force_short = ctx.options.contains(InstOptions::SHORT_FORM);
            let force_long = ctx.options.contains(InstOptions::LONG_FORM);
            // Both short forms are two bytes: opcode + disp8.
            let use_short = if force_long {
                false
            } else if force_short {
                true
            } else {
                match ctx.bound_label_offset(*label) {
                    Some(target) => {
                        let disp = target as i64 - (ctx.offset + 2) as i64;
                        (-128..=127).contains(&disp)
                    }
                    None => false,
                }
            };
            match inst {
                Inst::Jmp => {
                    if use_short {
                        e.push(0xEB);
                        e.push_fixup_slot(*label, 1, 0);
                    } else {
                        e.push(0xE9);
                        e.push_fixup_slot(*label, 4, 0);
                    }
                }
                Inst::Call => {
                    if force_short {
                        return Err(EmitError::InvalidInstruction);
                    }
                    e.push(0xE8);
                    e.push_fixup_slot(*label, 4, 0);
                }
                _ => {
                    let cc = inst
                        .condition_code()
                        .ok_or(EmitError::InvalidInstruction)?;
                    if use_short {
                        e.push(0x70 + cc);
                        e.push_fixup_slot(*label, 1, 0);
                    } else {
                        e.push(0x0F);
                        e.push(0x80 + cc);
                        e.push_fixup_slot(*label, 4, 0);
                    }
                }
            }
            Ok(())
        }
        [Operand::Reg(reg)] if matches!(inst, Inst::Jmp | Inst::Call) => {
            let (size, id) = gp(*reg)?;
            if size != 8 {
                return Err(EmitError::InvalidOperandSize);
            }
            let ext = if matches!(inst, Inst::Jmp) { 4 } else { 2 };
            let rm = Rm::Reg { id, byte: false };
            emit_rm(e, ctx, 4, &[0xFF], ext, false, &rm)
        }
        [Operand::Mem(mem)] if matches!(inst, Inst::Jmp | Inst::Call) => {
            let ext = if matches!(inst, Inst::Jmp) { 4 } else { 2 };
            emit_rm(e, ctx, 4, &[0xFF], ext, false, &Rm::Mem(mem))
        }
        _ => Err(EmitError::InvalidInstruction),
    }
}

pub(crate) struct X64Encoder;

/// The encoder instance registered with the core dispatch.
pub(crate) static ENCODER: X64Encoder = X64Encoder;

impl ArchEncoder for X64Encoder {
    fn arch_id(&self) -> ArchId {
        ArchId::X64
    }

    fn encode(
        &self,
        inst_id: InstId,
        ops: &[Operand],
        ctx: &EncodeCtx<'_, '_>,
    ) -> EmitResult<Encoded> {
        let inst = Inst::from_id(inst_id).ok_or(EmitError::InvalidInstruction)?;
        if ctx.extra_reg.is_some() {
            // No EVEX/op-mask support in the integer core.
            return Err(EmitError::InvalidInstruction);
        }

        let mut e = Encoded::new();

        if ctx.options.contains(InstOptions::LOCK) {
            let lockable = matches!(
                inst,
                Inst::Add
                    | Inst::And
                    | Inst::Or
                    | Inst::Sub
                    | Inst::Xor
                    | Inst::Inc
                    | Inst::Dec
                    | Inst::Neg
                    | Inst::Not
            );
            if !lockable || !matches!(ops.first(), Some(Operand::Mem(_))) {
                return Err(EmitError::InvalidInstruction);
            }
            e.push(0xF0);
        }

        match inst {
            Inst::Nop => {
                if !ops.is_empty() {
                    return Err(EmitError::InvalidInstruction);
                }
                e.push(0x90);
            }
            Inst::Ret => match ops {
                [] => e.push(0xC3),
                [Operand::Imm(imm)] => {
                    if !imm_fits(imm, 2) {
                        return Err(EmitError::InvalidInstruction);
                    }
                    e.push(0xC2);
                    e.push_value_le(imm.value() as u64, 2);
                }
                _ => return Err(EmitError::InvalidInstruction),
            },
            Inst::Add => encode_alu(&mut e, ctx, ops, 0x00, 0)?,
            Inst::Or => encode_alu(&mut e, ctx, ops, 0x08, 1)?,
            Inst::And => encode_alu(&mut e, ctx, ops, 0x20, 4)?,
            Inst::Sub => encode_alu(&mut e, ctx, ops, 0x28, 5)?,
            Inst::Xor => encode_alu(&mut e, ctx, ops, 0x30, 6)?,
            Inst::Cmp => encode_alu(&mut e, ctx, ops, 0x38, 7)?,
            Inst::Mov => encode_mov(&mut e, ctx, ops)?,
            Inst::Movzx => encode_movzx(&mut e, ctx, ops)?,
            Inst::Test => encode_test(&mut e, ctx, ops)?,
            Inst::Lea => match ops {
                [Operand::Reg(dst), Operand::Mem(mem)] => {
                    let (size, id) = gp(*dst)?;
                    if size < 4 {
                        return Err(EmitError::InvalidOperandSize);
                    }
                    emit_rm(&mut e, ctx, size, &[0x8D], id, false, &Rm::Mem(mem))?;
                }
                _ => return Err(EmitError::InvalidInstruction),
            },
            Inst::IMul => match ops {
                [Operand::Reg(dst), Operand::Reg(src)] => {
                    let (dst_size, dst_id) = gp(*dst)?;
                    let (src_size, src_id) = gp(*src)?;
                    if dst_size != src_size || dst_size < 2 {
                        return Err(EmitError::InvalidOperandSize);
                    }
                    let rm = Rm::Reg { id: src_id, byte: false };
                    emit_rm(&mut e, ctx, dst_size, &[0x0F, 0xAF], dst_id, false, &rm)?;
                }
                [Operand::Reg(dst), Operand::Mem(mem)] => {
                    let (size, id) = gp(*dst)?;
                    if size < 2 {
                        return Err(EmitError::InvalidOperandSize);
                    }
                    emit_rm(&mut e, ctx, size, &[0x0F, 0xAF], id, false, &Rm::Mem(mem))?;
                }
                _ => return Err(EmitError::InvalidInstruction),
            },
            Inst::Inc => encode_unary(&mut e, ctx, ops, 0xFE, 0xFF, 0)?,
            Inst::Dec => encode_unary(&mut e, ctx, ops, 0xFE, 0xFF, 1)?,
            Inst::Not => encode_unary(&mut e, ctx, ops, 0xF6, 0xF7, 2)?,
            Inst::Neg => encode_unary(&mut e, ctx, ops, 0xF6, 0xF7, 3)?,
            Inst::Push => encode_push_pop(&mut e, ctx, ops, 0x50, 6, true)?,
            Inst::Pop => encode_push_pop(&mut e, ctx, ops, 0x58, 0, false)?,
            // Jmp, Call and the Jcc family.
            _ => encode_branch(&mut e, ctx, inst, ops)?,
        }
        Ok(e)
    }

    fn nop_fill(&self, count: usize, optimized: bool, out: &mut Vec<u8>) {
        if !optimized {
            out.resize(out.len() + count, 0x90);
            return;
        }
        // Recommended multi-byte NOP sequences, longest first.
        const NOPS: [&[u8]; 9] = [
            &[0x90],
            &[0x66, 0x90],
            &[0x0F, 0x1F, 0x00],
            &[0x0F, 0x1F, 0x40, 0x00],
            &[0x0F, 0x1F, 0x44, 0x00, 0x00],
            &[0x66, 0x0F, 0x1F, 0x44, 0x00, 0x00],
            &[0x0F, 0x1F, 0x80, 0x00, 0x00, 0x00, 0x00],
            &[0x0F, 0x1F, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
            &[0x66, 0x0F, 0x1F, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
        ];
        let mut left = count;
        while left > 0 {
            let n = left.min(NOPS.len());
            out.extend_from_slice(NOPS[n - 1]);
            left -= n;
        }
    }

    fn ret_inst(&self) -> InstId {
        Inst::Ret.id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::arch::{ArchId, ArchInfo};
    use crate::core::emitter::EmitterOptions;
    use crate::core::holder::{CodeHolder, CodeInfo};
    use crate::x64::{al, eax, ecx, ptr, r12, r8, r9, rax, rbp, rbx, rcx, rsp, spl};
    use bumpalo::Bump;

    fn encode_at(inst: Inst, ops: &[Operand], offset: u64) -> EmitResult<Encoded> {
        let zone = Bump::new();
        let mut code = CodeHolder::new(&zone);
        code.init(CodeInfo::new(ArchInfo::new(ArchId::X64, 0))).unwrap();
        let ctx = EncodeCtx {
            code: &code,
            section: 0,
            offset,
            options: InstOptions::NONE,
            extra_reg: None,
            emitter_options: EmitterOptions::NONE,
        };
        ENCODER.encode(inst.id(), ops, &ctx)
    }

    fn bytes(inst: Inst, ops: &[Operand]) -> Vec<u8> {
        encode_at(inst, ops, 0).unwrap().as_slice().to_vec()
    }

    #[test]
    fn test_simple_encodings() {
        assert_eq!(bytes(Inst::Ret, &[]), vec![0xC3]);
        assert_eq!(bytes(Inst::Nop, &[]), vec![0x90]);
        assert_eq!(
            bytes(Inst::Mov, &[eax.into(), Imm::new(1).into()]),
            vec![0xB8, 0x01, 0x00, 0x00, 0x00]
        );
        assert_eq!(bytes(Inst::Push, &[rbp.into()]), vec![0x55]);
        assert_eq!(bytes(Inst::Pop, &[rbp.into()]), vec![0x5D]);
    }

    #[test]
    fn test_alu_rr() {
        assert_eq!(bytes(Inst::Add, &[rax.into(), rcx.into()]), vec![0x48, 0x01, 0xC8]);
        assert_eq!(bytes(Inst::Mov, &[rax.into(), rbx.into()]), vec![0x48, 0x89, 0xD8]);
        assert_eq!(bytes(Inst::Xor, &[eax.into(), eax.into()]), vec![0x31, 0xC0]);
        // Extended registers set REX.R and REX.B.
        assert_eq!(bytes(Inst::Mov, &[r8.into(), r9.into()]), vec![0x4D, 0x89, 0xC8]);
    }

    #[test]
    fn test_alu_imm_shortest_form() {
        assert_eq!(
            bytes(Inst::Sub, &[rsp.into(), Imm::new(32).into()]),
            vec![0x48, 0x83, 0xEC, 0x20]
        );
        assert_eq!(
            bytes(Inst::Cmp, &[eax.into(), Imm::new(100).into()]),
            vec![0x83, 0xF8, 0x64]
        );
        assert_eq!(
            bytes(Inst::Add, &[eax.into(), Imm::new(1000).into()]),
            vec![0x81, 0xC0, 0xE8, 0x03, 0x00, 0x00]
        );
    }

    #[test]
    fn test_mov_imm_width_selection() {
        // Positive values below 2^32 narrow to the 32-bit form.
        assert_eq!(
            bytes(Inst::Mov, &[rax.into(), Imm::new(1).into()]),
            vec![0xB8, 0x01, 0x00, 0x00, 0x00]
        );
        // Negative 32-bit values sign-extend through C7.
        assert_eq!(
            bytes(Inst::Mov, &[rax.into(), Imm::new(-1).into()]),
            vec![0x48, 0xC7, 0xC0, 0xFF, 0xFF, 0xFF, 0xFF]
        );
        // Everything else takes the full 64-bit immediate.
        assert_eq!(
            bytes(Inst::Mov, &[rax.into(), Imm::new(0x1_0000_0000).into()]),
            vec![0x48, 0xB8, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_memory_forms() {
        // [rbp-8] forces disp8 through mod=01.
        assert_eq!(
            bytes(Inst::Mov, &[ptr(rbp, -8).into(), ecx.into()]),
            vec![0x89, 0x4D, 0xF8]
        );
        // rsp base always takes a SIB byte.
        assert_eq!(
            bytes(Inst::Mov, &[eax.into(), ptr(rsp, 4).into()]),
            vec![0x8B, 0x44, 0x24, 0x04]
        );
        // r12 is the extended rsp-slot; REX.B plus SIB.
        assert_eq!(
            bytes(Inst::Mov, &[eax.into(), ptr(r12, 0).into()]),
            vec![0x41, 0x8B, 0x04, 0x24]
        );
        assert_eq!(
            bytes(Inst::Lea, &[rax.into(), ptr(rbp, 16).into()]),
            vec![0x48, 0x8D, 0x45, 0x10]
        );
        // Scaled index: [rax + rcx*4 + 8].
        assert_eq!(
            bytes(Inst::Mov, &[eax.into(), ptr(rax, 8).index(rcx, 2).into()]),
            vec![0x8B, 0x44, 0x88, 0x08]
        );
    }

    #[test]
    fn test_byte_registers() {
        assert_eq!(bytes(Inst::Mov, &[al.into(), Imm::new(5).into()]), vec![0xB0, 0x05]);
        // SPL needs a bare REX prefix.
        assert_eq!(
            bytes(Inst::Mov, &[spl.into(), Imm::new(5).into()]),
            vec![0x40, 0xB4, 0x05]
        );
        assert_eq!(bytes(Inst::Movzx, &[eax.into(), al.into()]), vec![0x0F, 0xB6, 0xC0]);
    }

    #[test]
    fn test_branch_forms() {
        let zone = Bump::new();
        let mut code = CodeHolder::new(&zone);
        code.init(CodeInfo::new(ArchInfo::new(ArchId::X64, 0))).unwrap();
        let label = code.new_label().unwrap();

        // Unbound forward jump defaults to the near form with a fixup.
        let ctx = EncodeCtx {
            code: &code,
            section: 0,
            offset: 0,
            options: InstOptions::NONE,
            extra_reg: None,
            emitter_options: EmitterOptions::NONE,
        };
        let e = ENCODER.encode(Inst::Jmp.id(), &[label.into()], &ctx).unwrap();
        assert_eq!(e.as_slice(), &[0xE9, 0x00, 0x00, 0x00, 0x00]);
        let fix = e.fixup.unwrap();
        assert_eq!((fix.offset, fix.size), (1, 4));

        // A bound nearby label selects the short form.
        code.bind_label(label, 0, 0).unwrap();
        let ctx = EncodeCtx {
            code: &code,
            section: 0,
            offset: 16,
            options: InstOptions::NONE,
            extra_reg: None,
            emitter_options: EmitterOptions::NONE,
        };
        let e = ENCODER.encode(Inst::Jmp.id(), &[label.into()], &ctx).unwrap();
        assert_eq!(e.as_slice(), &[0xEB, 0x00]);
        let e = ENCODER.encode(Inst::Je.id(), &[label.into()], &ctx).unwrap();
        assert_eq!(e.as_slice(), &[0x74, 0x00]);

        // LONG_FORM overrides the shortest-form choice.
        let ctx = EncodeCtx {
            code: &code,
            section: 0,
            offset: 16,
            options: InstOptions::LONG_FORM,
            extra_reg: None,
            emitter_options: EmitterOptions::NONE,
        };
        let e = ENCODER.encode(Inst::Jmp.id(), &[label.into()], &ctx).unwrap();
        assert_eq!(e.as_slice(), &[0xE9, 0x00, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_indirect_branches() {
        assert_eq!(bytes(Inst::Jmp, &[rax.into()]), vec![0xFF, 0xE0]);
        assert_eq!(bytes(Inst::Call, &[rax.into()]), vec![0xFF, 0xD0]);
        assert_eq!(bytes(Inst::Jmp, &[r12.into()]), vec![0x41, 0xFF, 0xE4]);
    }

    #[test]
    fn test_rejections() {
        // Mismatched operand sizes.
        assert!(encode_at(Inst::Add, &[rax.into(), eax.into()], 0).is_err());
        // Virtual register ids cannot be encoded.
        let virt = Reg::new(crate::core::operand::RegType::Gp64, crate::VIRT_ID_BASE);
        assert_eq!(
            encode_at(Inst::Mov, &[virt.into(), rax.into()], 0).unwrap_err(),
            EmitError::InvalidInstruction
        );
        // rsp cannot be an index register.
        assert!(encode_at(Inst::Mov, &[eax.into(), ptr(rax, 0).index(rsp, 0).into()], 0).is_err());
        // Unknown instruction id.
        let zone = Bump::new();
        let mut code = CodeHolder::new(&zone);
        code.init(CodeInfo::new(ArchInfo::new(ArchId::X64, 0))).unwrap();
        let ctx = EncodeCtx {
            code: &code,
            section: 0,
            offset: 0,
            options: InstOptions::NONE,
            extra_reg: None,
            emitter_options: EmitterOptions::NONE,
        };
        assert_eq!(
            ENCODER.encode(9999, &[], &ctx).unwrap_err(),
            EmitError::InvalidInstruction
        );
    }

    #[test]
    fn test_nop_fill() {
        let mut out = Vec::new();
        ENCODER.nop_fill(4, false, &mut out);
        assert_eq!(out, vec![0x90; 4]);

        let mut out = Vec::new();
        ENCODER.nop_fill(12, true, &mut out);
        assert_eq!(out.len(), 12);
        assert_eq!(&out[..9], &[0x66, 0x0F, 0x1F, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(&out[9..], &[0x0F, 0x1F, 0x00]);
    }
}

