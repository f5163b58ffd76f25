//! The abstract emission contract shared by every emitter.
//!
//! [`Emitter`] is the capability set a code consumer programs against:
//! create and bind labels, switch sections, emit one instruction, align,
//! embed data, comment. The [`Assembler`](crate::core::assembler::Assembler)
//! produces bytes immediately; the
//! [`Builder`](crate::core::builder::Builder) and
//! [`Compiler`](crate::core::compiler::Compiler) record nodes for deferred
//! serialization.
//!
//! Emitters attach to a [`CodeHolder`](crate::core::holder::CodeHolder) by
//! mutably borrowing it; the borrow checker guarantees a single writer.
//! Every operation on a detached emitter fails with
//! [`EmitError::NotInitialized`].

use crate::core::arch::ArchInfo;
use crate::core::constpool::ConstPool;
use crate::core::error::{EmitError, EmitResult};
use crate::core::holder::{CodeHolder, LabelKind, SectionId};
use crate::core::inst::{InstId, InstOptions};
use crate::core::operand::{Label, Operand, Reg};
use crate::core::types::TypeId;

/// Concrete emitter kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EmitterKind {
    Assembler,
    Builder,
    Compiler,
}

/// Per-emitter option bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EmitterOptions(u32);

impl EmitterOptions {
    pub const NONE: EmitterOptions = EmitterOptions(0);
    /// Emit per-operation trace output through the `log` facade.
    pub const LOGGING: EmitterOptions = EmitterOptions(0x01);
    /// Run the full validator before encoding each instruction.
    pub const STRICT_VALIDATION: EmitterOptions = EmitterOptions(0x02);
    /// Prefer size-optimized encodings where semantics allow it.
    pub const SIZE_OPT: EmitterOptions = EmitterOptions(0x04);
    /// Use multi-byte NOP sequences for code alignment.
    pub const OPTIMIZED_ALIGN: EmitterOptions = EmitterOptions(0x08);
    /// Emit branch-prediction hints (annotation only on modern CPUs).
    pub const PREDICTED_JUMPS: EmitterOptions = EmitterOptions(0x10);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: EmitterOptions) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn union(self, other: EmitterOptions) -> EmitterOptions {
        EmitterOptions(self.0 | other.0)
    }

    pub const fn difference(self, other: EmitterOptions) -> EmitterOptions {
        EmitterOptions(self.0 & !other.0)
    }
}

impl std::ops::BitOr for EmitterOptions {
    type Output = EmitterOptions;

    fn bitor(self, rhs: EmitterOptions) -> EmitterOptions {
        self.union(rhs)
    }
}

/// Alignment fill mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlignMode {
    /// Pad with NOP sequences.
    Code,
    /// Pad with zeros.
    Data,
    /// Pad with zeros, for zero-initialized sections.
    Zero,
}

/// Receives every error an emitter reports.
///
/// Handlers must not panic across the core; the reported error is always
/// returned to the caller as well, whatever the handler does.
pub trait ErrorHandler {
    fn handle_error(&mut self, err: EmitError, message: &str, origin: EmitterKind);
}

/// State shared by all emitter implementations: the holder borrow, options,
/// the error handler and the transient next-instruction state.
pub(crate) struct EmitterCore<'c, 'z> {
    pub kind: EmitterKind,
    pub code: Option<&'c mut CodeHolder<'z>>,
    pub options: EmitterOptions,
    pub handler: Option<Box<dyn ErrorHandler>>,
    pub inst_options: InstOptions,
    pub extra_reg: Option<Reg>,
    pub inline_comment: Option<&'z str>,
}

impl<'c, 'z> EmitterCore<'c, 'z> {
    pub fn new(kind: EmitterKind) -> Self {
        Self {
            kind,
            code: None,
            options: EmitterOptions::NONE,
            handler: None,
            inst_options: InstOptions::NONE,
            extra_reg: None,
            inline_comment: None,
        }
    }

    pub fn attach(&mut self, code: &'c mut CodeHolder<'z>) -> EmitResult<()> {
        if self.code.is_some() {
            return Err(EmitError::AlreadyAttached);
        }
        if !code.is_initialized() {
            return Err(EmitError::NotInitialized);
        }
        self.code = Some(code);
        Ok(())
    }

    pub fn detach(&mut self) -> Option<&'c mut CodeHolder<'z>> {
        self.reset_inst_state();
        self.code.take()
    }

    pub fn expect(&self) -> EmitResult<&CodeHolder<'z>> {
        match self.code.as_deref() {
            Some(code) => Ok(code),
            None => Err(EmitError::NotInitialized),
        }
    }

    pub fn expect_mut(&mut self) -> EmitResult<&mut CodeHolder<'z>> {
        match self.code.as_deref_mut() {
            Some(code) => Ok(code),
            None => Err(EmitError::NotInitialized),
        }
    }

    /// Takes and clears the next-instruction state. Called by every emit
    /// path, including failing ones.
    pub fn take_inst_state(&mut self) -> (InstOptions, Option<Reg>, Option<&'z str>) {
        let state = (self.inst_options, self.extra_reg, self.inline_comment);
        self.reset_inst_state();
        state
    }

    pub fn reset_inst_state(&mut self) {
        self.inst_options = InstOptions::NONE;
        self.extra_reg = None;
        self.inline_comment = None;
    }

    /// Routes `err` to the emitter's handler, falling back to the holder's,
    /// and hands the error back for propagation.
    pub fn report(&mut self, err: EmitError) -> EmitError {
        let message = err.to_string();
        if let Some(handler) = self.handler.as_deref_mut() {
            handler.handle_error(err, &message, self.kind);
        } else if let Some(code) = self.code.as_deref_mut() {
            if let Some(handler) = code.error_handler_mut() {
                handler.handle_error(err, &message, self.kind);
            }
        }
        err
    }
}

/// The emission capability set.
///
/// All operations return their error; emitters also report failures to the
/// attached [`ErrorHandler`] before returning.
pub trait Emitter {
    fn kind(&self) -> EmitterKind;

    /// Whether the emitter is attached to a holder.
    fn is_attached(&self) -> bool;

    /// Architecture of the attached holder.
    fn arch(&self) -> Option<ArchInfo>;

    fn emitter_options(&self) -> EmitterOptions;

    fn add_emitter_options(&mut self, options: EmitterOptions);

    fn clear_emitter_options(&mut self, options: EmitterOptions);

    /// Creates a new anonymous label in the attached holder.
    fn new_label(&mut self) -> EmitResult<Label>;

    /// Creates a new named label in the attached holder.
    fn new_named_label(
        &mut self,
        name: &str,
        kind: LabelKind,
        parent: Option<Label>,
    ) -> EmitResult<Label>;

    /// Looks up a named label; returns an invalid label when absent.
    fn label_by_name(&self, name: &str, parent: Option<Label>) -> Label;

    /// Binds `label` at the current position of the current section.
    fn bind(&mut self, label: Label) -> EmitResult<()>;

    /// Switches the cursor to the end of `section`.
    fn section(&mut self, section: SectionId) -> EmitResult<()>;

    /// Emits one instruction with up to 6 operands.
    fn emit(&mut self, inst: InstId, ops: &[Operand]) -> EmitResult<()>;

    /// Pads to the next multiple of `alignment` (a power of two).
    fn align(&mut self, mode: AlignMode, alignment: u32) -> EmitResult<()>;

    /// Embeds raw bytes.
    fn embed(&mut self, data: &[u8]) -> EmitResult<()>;

    /// Embeds `item_count` items of `type_id` from `data` (already encoded
    /// little-endian), repeated `repeat_count` times.
    fn embed_data_array(
        &mut self,
        type_id: TypeId,
        data: &[u8],
        item_count: usize,
        repeat_count: usize,
    ) -> EmitResult<()>;

    /// Aligns to the pool's alignment, binds `label` and embeds the pool.
    fn embed_const_pool(&mut self, label: Label, pool: &ConstPool) -> EmitResult<()>;

    /// Embeds the absolute address of `label` as gp-size placeholder bytes
    /// plus a relocation.
    fn embed_label(&mut self, label: Label) -> EmitResult<()>;

    /// Embeds `label - base` as a `size`-byte value (0 = gp-size), folding
    /// immediately when both labels are bound in the same section.
    fn embed_label_delta(&mut self, label: Label, base: Label, size: usize) -> EmitResult<()>;

    /// Annotates the stream; produces no bytes in an assembler.
    fn comment(&mut self, text: &str) -> EmitResult<()>;

    /// Routes `err` through the emitter's error handler (the holder's as
    /// fallback) and returns it unchanged for propagation.
    fn report_error(&mut self, err: EmitError) -> EmitError;

    /// Sets options applied to the next instruction only.
    fn set_inst_options(&mut self, options: InstOptions);

    /// Sets the extra register (AVX-512 op-mask) for the next instruction.
    fn set_extra_reg(&mut self, reg: Reg);

    /// Attaches an inline comment to the next instruction.
    fn set_inline_comment(&mut self, text: &str) -> EmitResult<()>;

    // Typed embed helpers over `embed_data_array`.

    fn embed_i8(&mut self, value: i8, repeat: usize) -> EmitResult<()> {
        self.embed_data_array(TypeId::I8, &value.to_le_bytes(), 1, repeat)
    }

    fn embed_u8(&mut self, value: u8, repeat: usize) -> EmitResult<()> {
        self.embed_data_array(TypeId::U8, &value.to_le_bytes(), 1, repeat)
    }

    fn embed_i16(&mut self, value: i16, repeat: usize) -> EmitResult<()> {
        self.embed_data_array(TypeId::I16, &value.to_le_bytes(), 1, repeat)
    }

    fn embed_u16(&mut self, value: u16, repeat: usize) -> EmitResult<()> {
        self.embed_data_array(TypeId::U16, &value.to_le_bytes(), 1, repeat)
    }

    fn embed_i32(&mut self, value: i32, repeat: usize) -> EmitResult<()> {
        self.embed_data_array(TypeId::I32, &value.to_le_bytes(), 1, repeat)
    }

    fn embed_u32(&mut self, value: u32, repeat: usize) -> EmitResult<()> {
        self.embed_data_array(TypeId::U32, &value.to_le_bytes(), 1, repeat)
    }

    fn embed_i64(&mut self, value: i64, repeat: usize) -> EmitResult<()> {
        self.embed_data_array(TypeId::I64, &value.to_le_bytes(), 1, repeat)
    }

    fn embed_u64(&mut self, value: u64, repeat: usize) -> EmitResult<()> {
        self.embed_data_array(TypeId::U64, &value.to_le_bytes(), 1, repeat)
    }

    fn embed_f32(&mut self, value: f32, repeat: usize) -> EmitResult<()> {
        self.embed_data_array(TypeId::F32, &value.to_le_bytes(), 1, repeat)
    }

    fn embed_f64(&mut self, value: f64, repeat: usize) -> EmitResult<()> {
        self.embed_data_array(TypeId::F64, &value.to_le_bytes(), 1, repeat)
    }
}
