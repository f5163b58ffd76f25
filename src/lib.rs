//! jitforge - machine code emission for Rust.
//!
//! jitforge is the core of a just-in-time and ahead-of-time code
//! generation library: a typed description of CPU instructions goes in,
//! encoded bytes plus the metadata needed to load, relocate and execute
//! them come out.
//!
//! # Primary Usage
//!
//! ```
//! use bumpalo::Bump;
//! use jitforge::{ArchId, ArchInfo, Assembler, CodeHolder, CodeInfo, Emitter, Operand};
//! use jitforge::x64::{self, Inst};
//!
//! let arena = Bump::new();
//! let mut code = CodeHolder::new(&arena);
//! code.init(CodeInfo::new(ArchInfo::new(ArchId::X64, 0)))?;
//!
//! let mut a = Assembler::new(&mut code)?;
//! a.emit(Inst::Mov.id(), &[x64::eax.into(), jitforge::imm(1).into()])?;
//! a.emit(Inst::Ret.id(), &[])?;
//! drop(a);
//!
//! assert_eq!(
//!     code.text_section().buffer().as_slice(),
//!     &[0xB8, 0x01, 0x00, 0x00, 0x00, 0xC3]
//! );
//! # Ok::<(), jitforge::EmitError>(())
//! ```
//!
//! # Architecture
//!
//! - [`core`] - holder, operands, emitters, relocation machinery
//! - [`x64`] - x86-64 registers, instruction table and encoder
//!
//! The [`CodeHolder`] owns sections, labels and relocations; emitters
//! borrow it mutably while they produce code. The [`Assembler`] writes
//! bytes immediately, the [`Builder`] records a node stream for passes to
//! rewrite, and the [`Compiler`] adds virtual registers and function
//! bookkeeping on top of the builder.

pub mod core;
pub mod x64;

pub use crate::core::arch::{sub_id, ArchId, ArchInfo};
pub use crate::core::assembler::Assembler;
pub use crate::core::buffer::CodeBuffer;
pub use crate::core::builder::{Builder, Node, NodeId, NodeKind, SentinelKind};
pub use crate::core::compiler::{
    Compiler, ConstScope, FuncData, InvokeData, JumpAnnotation, VirtReg,
};
pub use crate::core::constpool::ConstPool;
pub use crate::core::emitter::{
    AlignMode, Emitter, EmitterKind, EmitterOptions, ErrorHandler,
};
pub use crate::core::encoder::{encoder_for, ArchEncoder, EncodeCtx, Encoded, Fixup};
pub use crate::core::error::{EmitError, EmitResult};
pub use crate::core::func::{CallConv, FuncDetail, FuncSignature, FuncValue};
pub use crate::core::holder::{
    CodeHolder, CodeInfo, Expr, ExprOp, ExprValue, LabelEntry, LabelId, LabelKind, LabelLink,
    RelocEntry, RelocId, RelocKind, Section, SectionFlags, SectionId,
};
pub use crate::core::inst::{BaseInst, InstId, InstOptions, INST_NONE};
pub use crate::core::objfile::write_elf;
pub use crate::core::operand::{
    Imm, Label, Mem, MemBaseKind, OpArray, Operand, Reg, RegGroup, RegType, Segment,
    VIRT_ID_BASE,
};
pub use crate::core::runtime::{add_code, HeapAllocator, RuntimeAllocator, Span};
pub use crate::core::types::TypeId;
pub use crate::core::INVALID_ID;

/// Shorthand for a signed immediate operand.
pub const fn imm(value: i64) -> Imm {
    Imm::new(value)
}

/// Shorthand for an unsigned immediate operand.
pub const fn uimm(value: u64) -> Imm {
    Imm::new_unsigned(value)
}
