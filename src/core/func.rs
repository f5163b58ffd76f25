//! Function signatures, calling conventions and argument assignment.
//!
//! [`FuncDetail`] maps a declared signature onto concrete argument and
//! return locations so a register-allocation pass can synthesize the
//! prolog, epilog and argument shuffles.

use crate::core::arch::ArchInfo;
use crate::core::error::{EmitError, EmitResult};
use crate::core::operand::{Reg, RegType};
use crate::core::types::TypeId;

/// Calling convention identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallConv {
    /// System V AMD64 ABI (Linux, BSD, macOS).
    SysV64,
    /// Microsoft x64 calling convention.
    Win64,
}

impl CallConv {
    /// Default convention of the host platform.
    pub fn host() -> CallConv {
        if cfg!(windows) {
            CallConv::Win64
        } else {
            CallConv::SysV64
        }
    }
}

/// A declared function signature: convention, return type and argument
/// types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuncSignature {
    call_conv: CallConv,
    ret: TypeId,
    args: Vec<TypeId>,
}

impl FuncSignature {
    pub fn new(call_conv: CallConv, ret: TypeId, args: &[TypeId]) -> Self {
        Self { call_conv, ret, args: args.to_vec() }
    }

    pub fn call_conv(&self) -> CallConv {
        self.call_conv
    }

    pub fn ret(&self) -> TypeId {
        self.ret
    }

    pub fn arg_count(&self) -> usize {
        self.args.len()
    }

    pub fn arg(&self, index: usize) -> Option<TypeId> {
        self.args.get(index).copied()
    }

    pub fn args(&self) -> &[TypeId] {
        &self.args
    }
}

/// Where a single argument or return value lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuncValue {
    None,
    /// Passed in a register.
    Reg(Reg),
    /// Passed on the stack at this offset from the first stack slot.
    Stack(i32),
}

impl FuncValue {
    pub const fn is_reg(&self) -> bool {
        matches!(self, FuncValue::Reg(_))
    }

    pub const fn is_stack(&self) -> bool {
        matches!(self, FuncValue::Stack(_))
    }

    pub const fn reg(&self) -> Option<Reg> {
        match self {
            FuncValue::Reg(r) => Some(*r),
            _ => None,
        }
    }
}

// SysV integer argument order: rdi, rsi, rdx, rcx, r8, r9.
const SYSV_GP_ARGS: [u32; 6] = [7, 6, 2, 1, 8, 9];
// Win64 integer argument order: rcx, rdx, r8, r9.
const WIN64_GP_ARGS: [u32; 4] = [1, 2, 8, 9];

const RAX: u32 = 0;
const RDX: u32 = 2;

fn gp_reg_for(type_size: u32, id: u32) -> Reg {
    let ty = match type_size {
        1 => RegType::Gp8,
        2 => RegType::Gp16,
        8 => RegType::Gp64,
        _ => RegType::Gp32,
    };
    Reg::new(ty, id)
}

/// Computed argument and return locations for one signature.
#[derive(Debug, Clone)]
pub struct FuncDetail {
    call_conv: CallConv,
    args: Vec<FuncValue>,
    rets: [FuncValue; 2],
    arg_stack_size: u32,
}

impl FuncDetail {
    /// Assigns locations for `sig` on `arch`. Only 64-bit x86 targets are
    /// supported here; other targets fail with `InvalidArgument`.
    pub fn init(sig: &FuncSignature, arch: ArchInfo) -> EmitResult<Self> {
        if !arch.is_x86_family() || !arch.is_64bit() {
            return Err(EmitError::InvalidArgument);
        }
        let gp_size = arch.gp_size();

        let mut args = Vec::with_capacity(sig.arg_count());
        let mut gp_index = 0usize;
        let mut vec_index = 0usize;
        let mut stack_offset = 0i32;

        for &arg in sig.args() {
            let ty = arg.deabstract(gp_size);
            if ty.size() == 0 {
                return Err(EmitError::InvalidArgument);
            }
            // Win64 consumes one slot per argument regardless of its class.
            let slot = match sig.call_conv() {
                CallConv::SysV64 => {
                    if ty.is_float() {
                        let index = vec_index;
                        vec_index += 1;
                        if index < 8 {
                            Some(FuncValue::Reg(Reg::new(RegType::Xmm, index as u32)))
                        } else {
                            None
                        }
                    } else {
                        let index = gp_index;
                        gp_index += 1;
                        SYSV_GP_ARGS
                            .get(index)
                            .map(|&id| FuncValue::Reg(gp_reg_for(ty.size(), id)))
                    }
                }
                CallConv::Win64 => {
                    let index = gp_index;
                    gp_index += 1;
                    if index < WIN64_GP_ARGS.len() {
                        if ty.is_float() {
                            Some(FuncValue::Reg(Reg::new(RegType::Xmm, index as u32)))
                        } else {
                            Some(FuncValue::Reg(gp_reg_for(ty.size(), WIN64_GP_ARGS[index])))
                        }
                    } else {
                        None
                    }
                }
            };
            match slot {
                Some(value) => args.push(value),
                None => {
                    args.push(FuncValue::Stack(stack_offset));
                    stack_offset += gp_size as i32;
                }
            }
        }

        let ret_ty = sig.ret().deabstract(gp_size);
        let mut rets = [FuncValue::None, FuncValue::None];
        if ret_ty != TypeId::Void {
            if ret_ty.is_float() {
                rets[0] = FuncValue::Reg(Reg::new(RegType::Xmm, 0));
            } else {
                rets[0] = FuncValue::Reg(gp_reg_for(ret_ty.size(), RAX));
            }
        }

        Ok(Self {
            call_conv: sig.call_conv(),
            args,
            rets,
            arg_stack_size: stack_offset as u32,
        })
    }

    pub fn call_conv(&self) -> CallConv {
        self.call_conv
    }

    pub fn arg_count(&self) -> usize {
        self.args.len()
    }

    pub fn arg(&self, index: usize) -> FuncValue {
        self.args.get(index).copied().unwrap_or(FuncValue::None)
    }

    pub fn ret(&self, index: usize) -> FuncValue {
        self.rets.get(index).copied().unwrap_or(FuncValue::None)
    }

    pub fn ret_count(&self) -> usize {
        self.rets.iter().filter(|r| !matches!(r, FuncValue::None)).count()
    }

    /// Bytes of stack the caller must reserve for stack-passed arguments
    /// (shadow space excluded).
    pub fn arg_stack_size(&self) -> u32 {
        self.arg_stack_size
    }

    /// The second return register (rdx) used for two-register returns.
    pub fn high_ret_reg() -> Reg {
        Reg::new(RegType::Gp64, RDX)
    }
}
