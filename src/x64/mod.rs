//! x86-64 backend: registers, operand sugar, instruction table and the
//! encoder plugged into the core dispatch.

pub mod encoder;
pub mod inst;

pub use inst::{inst_info, Inst, InstInfo, RwOp};

use crate::core::operand::{Label, Mem, Reg, RegType};

/// 8-bit general purpose register (low byte).
pub const fn gpb(id: u32) -> Reg {
    Reg::new(RegType::Gp8, id)
}

/// 16-bit general purpose register.
pub const fn gpw(id: u32) -> Reg {
    Reg::new(RegType::Gp16, id)
}

/// 32-bit general purpose register.
pub const fn gpd(id: u32) -> Reg {
    Reg::new(RegType::Gp32, id)
}

/// 64-bit general purpose register.
pub const fn gpq(id: u32) -> Reg {
    Reg::new(RegType::Gp64, id)
}

/// 128-bit vector register.
pub const fn xmm(id: u32) -> Reg {
    Reg::new(RegType::Xmm, id)
}

/// AVX-512 mask register.
pub const fn kreg(id: u32) -> Reg {
    Reg::new(RegType::KMask, id)
}

/// `[base + disp]`.
pub const fn ptr(base: Reg, disp: i32) -> Mem {
    Mem::base_disp(base, disp)
}

/// `[base + disp]` with a byte size hint.
pub const fn byte_ptr(base: Reg, disp: i32) -> Mem {
    Mem::base_disp(base, disp).size(1)
}

/// `[base + disp]` with a word size hint.
pub const fn word_ptr(base: Reg, disp: i32) -> Mem {
    Mem::base_disp(base, disp).size(2)
}

/// `[base + disp]` with a dword size hint.
pub const fn dword_ptr(base: Reg, disp: i32) -> Mem {
    Mem::base_disp(base, disp).size(4)
}

/// `[base + disp]` with a qword size hint.
pub const fn qword_ptr(base: Reg, disp: i32) -> Mem {
    Mem::base_disp(base, disp).size(8)
}

/// `[label]`, RIP-relative to the label's final position.
pub const fn label_ptr(label: Label) -> Mem {
    Mem::label_disp(label, 0)
}

#[allow(non_upper_case_globals)]
mod regs {
    use super::*;

    pub const al: Reg = gpb(0);
    pub const cl: Reg = gpb(1);
    pub const dl: Reg = gpb(2);
    pub const bl: Reg = gpb(3);
    pub const spl: Reg = gpb(4);
    pub const bpl: Reg = gpb(5);
    pub const sil: Reg = gpb(6);
    pub const dil: Reg = gpb(7);
    pub const r8b: Reg = gpb(8);
    pub const r9b: Reg = gpb(9);
    pub const r10b: Reg = gpb(10);
    pub const r11b: Reg = gpb(11);
    pub const r12b: Reg = gpb(12);
    pub const r13b: Reg = gpb(13);
    pub const r14b: Reg = gpb(14);
    pub const r15b: Reg = gpb(15);

    pub const ax: Reg = gpw(0);
    pub const cx: Reg = gpw(1);
    pub const dx: Reg = gpw(2);
    pub const bx: Reg = gpw(3);
    pub const sp: Reg = gpw(4);
    pub const bp: Reg = gpw(5);
    pub const si: Reg = gpw(6);
    pub const di: Reg = gpw(7);

    pub const eax: Reg = gpd(0);
    pub const ecx: Reg = gpd(1);
    pub const edx: Reg = gpd(2);
    pub const ebx: Reg = gpd(3);
    pub const esp: Reg = gpd(4);
    pub const ebp: Reg = gpd(5);
    pub const esi: Reg = gpd(6);
    pub const edi: Reg = gpd(7);
    pub const r8d: Reg = gpd(8);
    pub const r9d: Reg = gpd(9);
    pub const r10d: Reg = gpd(10);
    pub const r11d: Reg = gpd(11);
    pub const r12d: Reg = gpd(12);
    pub const r13d: Reg = gpd(13);
    pub const r14d: Reg = gpd(14);
    pub const r15d: Reg = gpd(15);

    pub const rax: Reg = gpq(0);
    pub const rcx: Reg = gpq(1);
    pub const rdx: Reg = gpq(2);
    pub const rbx: Reg = gpq(3);
    pub const rsp: Reg = gpq(4);
    pub const rbp: Reg = gpq(5);
    pub const rsi: Reg = gpq(6);
    pub const rdi: Reg = gpq(7);
    pub const r8: Reg = gpq(8);
    pub const r9: Reg = gpq(9);
    pub const r10: Reg = gpq(10);
    pub const r11: Reg = gpq(11);
    pub const r12: Reg = gpq(12);
    pub const r13: Reg = gpq(13);
    pub const r14: Reg = gpq(14);
    pub const r15: Reg = gpq(15);

    pub const xmm0: Reg = xmm(0);
    pub const xmm1: Reg = xmm(1);
    pub const xmm2: Reg = xmm(2);
    pub const xmm3: Reg = xmm(3);
    pub const xmm4: Reg = xmm(4);
    pub const xmm5: Reg = xmm(5);
    pub const xmm6: Reg = xmm(6);
    pub const xmm7: Reg = xmm(7);

    pub const k0: Reg = kreg(0);
    pub const k1: Reg = kreg(1);
    pub const k2: Reg = kreg(2);
    pub const k3: Reg = kreg(3);
    pub const k4: Reg = kreg(4);
    pub const k5: Reg = kreg(5);
    pub const k6: Reg = kreg(6);
    pub const k7: Reg = kreg(7);
}

pub use regs::*;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::operand::RegGroup;

    #[test]
    fn test_register_constants() {
        assert_eq!(rax.id(), 0);
        assert_eq!(rax.size(), 8);
        assert_eq!(eax.size(), 4);
        assert_eq!(r15.id(), 15);
        assert_eq!(al.size(), 1);
        assert_eq!(xmm3.group(), RegGroup::Vec);
        assert_eq!(k1.group(), RegGroup::Mask);
        assert_eq!(rax.with_type(RegType::Gp32), eax);
    }

    #[test]
    fn test_ptr_sugar() {
        let m = qword_ptr(rbp, -16);
        assert_eq!(m.base_reg(), Some(5));
        assert_eq!(m.displacement(), -16);
        assert_eq!(m.size_hint(), 8);
        let l = label_ptr(Label::from_id(2));
        assert_eq!(l.base_label(), Some(Label::from_id(2)));
    }
}
