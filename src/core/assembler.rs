//! Assembler: encodes instructions and writes bytes directly into the
//! holder's section buffers.
//!
//! The assembler keeps a cursor into the current section. Writes normally
//! append, but [`Assembler::set_offset`] can rewind the cursor to patch
//! already-emitted code; the buffer size never shrinks.

use crate::core::arch::ArchInfo;
use crate::core::buffer::{fits_either, fits_signed};
use crate::core::constpool::ConstPool;
use crate::core::emitter::{
    AlignMode, Emitter, EmitterCore, EmitterKind, EmitterOptions, ErrorHandler,
};
use crate::core::encoder::{encoder_for, ArchEncoder, EncodeCtx};
use crate::core::error::{EmitError, EmitResult};
use crate::core::holder::{
    CodeHolder, ExprOp, ExprValue, LabelKind, LabelLink, RelocKind, SectionId,
};
use crate::core::inst::{InstId, InstOptions};
use crate::core::operand::{Label, OpArray, Operand, Reg};
use crate::core::types::TypeId;
use crate::core::INVALID_ID;

/// Emitter that writes encoded machine code immediately.
pub struct Assembler<'c, 'z> {
    base: EmitterCore<'c, 'z>,
    enc: Option<&'static dyn ArchEncoder>,
    section: SectionId,
    cursor: u64,
}

impl<'c, 'z> Assembler<'c, 'z> {
    /// Creates an assembler attached to `code`, positioned at the end of
    /// the `.text` section.
    pub fn new(code: &'c mut CodeHolder<'z>) -> EmitResult<Self> {
        let mut asm = Self::detached();
        asm.attach(code)?;
        Ok(asm)
    }

    /// Creates an assembler that is not attached to any holder yet.
    pub fn detached() -> Self {
        Self {
            base: EmitterCore::new(EmitterKind::Assembler),
            enc: None,
            section: 0,
            cursor: 0,
        }
    }

    /// Attaches to `code`; the cursor starts at the end of `.text`.
    pub fn attach(&mut self, code: &'c mut CodeHolder<'z>) -> EmitResult<()> {
        if self.base.code.is_some() {
            return Err(EmitError::AlreadyAttached);
        }
        if !code.is_initialized() {
            return Err(EmitError::NotInitialized);
        }
        let enc = encoder_for(code.arch())?;
        self.section = 0;
        self.cursor = code.text_section().buffer_size() as u64;
        self.enc = Some(enc);
        self.base.attach(code)
    }

    /// Detaches and hands the holder borrow back to the caller.
    pub fn detach(&mut self) -> Option<&'c mut CodeHolder<'z>> {
        self.enc = None;
        self.section = 0;
        self.cursor = 0;
        self.base.detach()
    }

    pub fn set_error_handler(&mut self, handler: Box<dyn ErrorHandler>) {
        self.base.handler = Some(handler);
    }

    pub fn reset_error_handler(&mut self) {
        self.base.handler = None;
    }

    /// Read access to the attached holder.
    pub fn code(&self) -> Option<&CodeHolder<'z>> {
        self.base.code.as_deref()
    }

    /// Section the cursor currently points into.
    pub fn current_section(&self) -> SectionId {
        self.section
    }

    /// Cursor offset within the current section.
    pub fn offset(&self) -> u64 {
        self.cursor
    }

    /// Rewinds or advances the cursor within the emitted part of the
    /// current section, for in-place patching.
    pub fn set_offset(&mut self, offset: u64) -> EmitResult<()> {
        let code = self.base.expect()?;
        let size = code.section(self.section)?.buffer_size() as u64;
        if offset > size {
            return Err(self.base.report(EmitError::InvalidArgument));
        }
        self.cursor = offset;
        Ok(())
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> EmitResult<()> {
        let section = self.section;
        let cursor = self.cursor as usize;
        let code = self.base.expect_mut()?;
        let buf = code.section_mut(section)?.buffer_mut();
        buf.ensure(bytes.len())?;
        buf.write_bytes_at(cursor, bytes)?;
        self.cursor += bytes.len() as u64;
        Ok(())
    }

    fn write_zeros(&mut self, count: usize) -> EmitResult<()> {
        // Zeros are also a patch-safe fill when the cursor was rewound.
        let zeros = [0u8; 32];
        let mut remaining = count;
        while remaining > 0 {
            let n = remaining.min(zeros.len());
            self.write_bytes(&zeros[..n])?;
            remaining -= n;
        }
        Ok(())
    }

    fn gp_size(&self) -> EmitResult<u32> {
        Ok(self.base.expect()?.arch().gp_size())
    }
}

impl Emitter for Assembler<'_, '_> {
    fn kind(&self) -> EmitterKind {
        EmitterKind::Assembler
    }

    fn is_attached(&self) -> bool {
        self.base.code.is_some()
    }

    fn arch(&self) -> Option<ArchInfo> {
        self.base.code.as_deref().map(CodeHolder::arch)
    }

    fn emitter_options(&self) -> EmitterOptions {
        self.base.options
    }

    fn add_emitter_options(&mut self, options: EmitterOptions) {
        self.base.options = self.base.options.union(options);
    }

    fn clear_emitter_options(&mut self, options: EmitterOptions) {
        self.base.options = self.base.options.difference(options);
    }

    fn new_label(&mut self) -> EmitResult<Label> {
        match self.base.expect_mut()?.new_label() {
            Ok(label) => Ok(label),
            Err(err) => Err(self.base.report(err)),
        }
    }

    fn new_named_label(
        &mut self,
        name: &str,
        kind: LabelKind,
        parent: Option<Label>,
    ) -> EmitResult<Label> {
        match self.base.expect_mut()?.new_named_label(name, kind, parent) {
            Ok(label) => Ok(label),
            Err(err) => Err(self.base.report(err)),
        }
    }

    fn label_by_name(&self, name: &str, parent: Option<Label>) -> Label {
        match self.base.expect() {
            Ok(code) => code.label_by_name(name, parent),
            Err(_) => Label::invalid(),
        }
    }

    fn bind(&mut self, label: Label) -> EmitResult<()> {
        let section = self.section;
        let cursor = self.cursor;
        self.base.inline_comment = None;
        let code = self.base.expect_mut()?;
        match code.bind_label(label, section, cursor) {
            Ok(()) => Ok(()),
            Err(err) => Err(self.base.report(err)),
        }
    }

    fn section(&mut self, section: SectionId) -> EmitResult<()> {
        let code = self.base.expect()?;
        if !code.is_section_valid(section) {
            return Err(self.base.report(EmitError::InvalidSection));
        }
        let end = code.section(section)?.buffer_size() as u64;
        if self.base.options.contains(EmitterOptions::LOGGING) {
            log::trace!(".section {} {{#{}}}", code.section(section)?.name(), section);
        }
        self.section = section;
        self.cursor = end;
        Ok(())
    }

    fn emit(&mut self, inst: InstId, ops: &[Operand]) -> EmitResult<()> {
        let (inst_options, extra_reg, comment) = self.base.take_inst_state();
        if self.base.code.is_none() {
            return Err(EmitError::NotInitialized);
        }
        if ops.len() > OpArray::CAPACITY {
            return Err(self.base.report(EmitError::InvalidArgument));
        }
        let enc = match self.enc {
            Some(enc) => enc,
            None => return Err(EmitError::NotInitialized),
        };

        let mut encoded = {
            let code = self.base.code.as_deref().unwrap();
            let ctx = EncodeCtx {
                code,
                section: self.section,
                offset: self.cursor,
                options: inst_options,
                extra_reg,
                emitter_options: self.base.options,
            };
            if self.base.options.contains(EmitterOptions::STRICT_VALIDATION) {
                if let Err(err) = enc.validate(inst, ops, &ctx) {
                    return Err(self.base.report(err));
                }
            }
            match enc.encode(inst, ops, &ctx) {
                Ok(encoded) => encoded,
                Err(err) => return Err(self.base.report(err)),
            }
        };

        if let Some(fix) = encoded.fixup {
            let slot = self.cursor + fix.offset as u64;
            let size = fix.size as usize;

            enum Slot {
                Invalid,
                Bound(u64),
                Pending,
            }
            let state = {
                let code = self.base.code.as_deref().unwrap();
                if !code.is_label_valid(fix.label) {
                    Slot::Invalid
                } else {
                    match code.label_offset_in(fix.label, self.section) {
                        Some(target) => Slot::Bound(target),
                        None => Slot::Pending,
                    }
                }
            };
            match state {
                Slot::Invalid => return Err(self.base.report(EmitError::InvalidLabel)),
                Slot::Bound(target) => {
                    // Bound in this section: fold the displacement now.
                    let value =
                        target as i64 + fix.addend as i64 - (slot + fix.size as u64) as i64;
                    if !fits_signed(value, size) {
                        return Err(self.base.report(EmitError::RelocationOverflow));
                    }
                    encoded.patch_value_le(fix.offset as usize, value as u64, size);
                }
                Slot::Pending => {
                    let link = LabelLink {
                        section: self.section,
                        offset: slot,
                        size: fix.size,
                        addend: fix.addend as i64,
                        reloc_id: INVALID_ID,
                    };
                    let result = self
                        .base
                        .code
                        .as_deref_mut()
                        .unwrap()
                        .add_label_link(fix.label, link);
                    if let Err(err) = result {
                        return Err(self.base.report(err));
                    }
                }
            }
        }

        self.write_bytes(encoded.as_slice())?;
        if self.base.options.contains(EmitterOptions::LOGGING) {
            match comment {
                Some(text) => log::trace!("emit #{inst} ({} bytes) ; {text}", encoded.len()),
                None => log::trace!("emit #{inst} ({} bytes)", encoded.len()),
            }
        }
        Ok(())
    }

    fn align(&mut self, mode: AlignMode, alignment: u32) -> EmitResult<()> {
        if self.base.code.is_none() {
            return Err(EmitError::NotInitialized);
        }
        if alignment == 0 || !alignment.is_power_of_two() {
            return Err(self.base.report(EmitError::InvalidAlignment));
        }
        let align = alignment as u64;
        let padding = (align - (self.cursor % align)) % align;
        if padding == 0 {
            return Ok(());
        }
        match mode {
            AlignMode::Code => {
                let optimized = self.base.options.contains(EmitterOptions::OPTIMIZED_ALIGN);
                let enc = match self.enc {
                    Some(enc) => enc,
                    None => return Err(EmitError::NotInitialized),
                };
                let mut fill = Vec::with_capacity(padding as usize);
                enc.nop_fill(padding as usize, optimized, &mut fill);
                self.write_bytes(&fill)
            }
            AlignMode::Data | AlignMode::Zero => self.write_zeros(padding as usize),
        }
    }

    fn embed(&mut self, data: &[u8]) -> EmitResult<()> {
        if self.base.code.is_none() {
            return Err(EmitError::NotInitialized);
        }
        if data.is_empty() {
            return Ok(());
        }
        self.write_bytes(data)
    }

    fn embed_data_array(
        &mut self,
        type_id: TypeId,
        data: &[u8],
        item_count: usize,
        repeat_count: usize,
    ) -> EmitResult<()> {
        let gp_size = self.gp_size()?;
        let final_type = type_id.deabstract(gp_size);
        let type_size = final_type.size() as usize;
        if type_size == 0 {
            return Err(self.base.report(EmitError::InvalidArgument));
        }
        if item_count == 0 || repeat_count == 0 {
            return Ok(());
        }
        let data_size = item_count
            .checked_mul(type_size)
            .ok_or(EmitError::OutOfMemory)?;
        if data.len() != data_size {
            return Err(self.base.report(EmitError::InvalidArgument));
        }
        data_size
            .checked_mul(repeat_count)
            .ok_or(EmitError::OutOfMemory)?;
        for _ in 0..repeat_count {
            self.write_bytes(data)?;
        }
        Ok(())
    }

    fn embed_const_pool(&mut self, label: Label, pool: &ConstPool) -> EmitResult<()> {
        let code = self.base.expect()?;
        if !code.is_label_valid(label) {
            return Err(self.base.report(EmitError::InvalidLabel));
        }
        self.align(AlignMode::Data, pool.alignment() as u32)?;
        self.bind(label)?;
        if pool.is_empty() {
            return Ok(());
        }
        self.write_bytes(pool.as_slice())
    }

    fn embed_label(&mut self, label: Label) -> EmitResult<()> {
        let size = self.gp_size()?;
        let section = self.section;
        let cursor = self.cursor;

        let bound_at = {
            let code = self.base.expect()?;
            match code.label_entry(label) {
                Ok(entry) if entry.is_bound() => Ok(Some((entry.section(), entry.offset()))),
                Ok(_) => Ok(None),
                Err(err) => Err(err),
            }
        };
        let bound_at = match bound_at {
            Ok(bound_at) => bound_at,
            Err(err) => return Err(self.base.report(err)),
        };

        let result = {
            let code = self.base.expect_mut()?;
            code.new_reloc_entry(RelocKind::RelToAbs, size).and_then(|reloc| {
                code.reloc_mut(reloc)?.set_source(section, cursor);
                match bound_at {
                    Some((target_section, target_offset)) => {
                        code.reloc_mut(reloc)?.set_target(target_section, target_offset);
                        Ok(())
                    }
                    None => code.add_label_link(
                        label,
                        LabelLink {
                            section,
                            offset: cursor,
                            size: size as u8,
                            addend: 0,
                            reloc_id: reloc,
                        },
                    ),
                }
            })
        };
        if let Err(err) = result {
            return Err(self.base.report(err));
        }
        self.write_zeros(size as usize)
    }

    fn embed_label_delta(&mut self, label: Label, base: Label, size: usize) -> EmitResult<()> {
        let gp_size = self.gp_size()? as usize;
        let size = if size == 0 { gp_size } else { size };
        if !size.is_power_of_two() || size > 8 {
            return Err(self.base.report(EmitError::InvalidOperandSize));
        }
        let section = self.section;
        let cursor = self.cursor;

        enum Plan {
            Fold(i64),
            Defer,
        }

        let plan = {
            let code = self.base.expect()?;
            let label_entry = match code.label_entry(label) {
                Ok(entry) => entry,
                Err(err) => return Err(self.base.report(err)),
            };
            let base_entry = match code.label_entry(base) {
                Ok(entry) => entry,
                Err(err) => return Err(self.base.report(err)),
            };
            if label_entry.is_bound()
                && base_entry.is_bound()
                && label_entry.section() == base_entry.section()
            {
                Plan::Fold(label_entry.offset() as i64 - base_entry.offset() as i64)
            } else {
                Plan::Defer
            }
        };

        match plan {
            Plan::Fold(delta) => {
                if !fits_either(delta, size) {
                    return Err(self.base.report(EmitError::RelocationOverflow));
                }
                self.write_bytes(&delta.to_le_bytes()[..size])
            }
            Plan::Defer => {
                let result = {
                    let code = self.base.expect_mut()?;
                    let expr = code.new_expr(
                        ExprOp::Sub,
                        ExprValue::Label(label.id()),
                        ExprValue::Label(base.id()),
                    );
                    code.new_reloc_entry(RelocKind::Expression, size as u32)
                        .and_then(|reloc| {
                            let entry = code.reloc_mut(reloc)?;
                            entry.set_source(section, cursor);
                            entry.set_expr(expr);
                            Ok(())
                        })
                };
                if let Err(err) = result {
                    return Err(self.base.report(err));
                }
                self.write_zeros(size)
            }
        }
    }

    fn comment(&mut self, text: &str) -> EmitResult<()> {
        if self.base.code.is_none() {
            return Err(EmitError::NotInitialized);
        }
        if self.base.options.contains(EmitterOptions::LOGGING) {
            log::debug!("; {text}");
        }
        Ok(())
    }

    fn report_error(&mut self, err: EmitError) -> EmitError {
        self.base.report(err)
    }

    fn set_inst_options(&mut self, options: InstOptions) {
        self.base.inst_options = options;
    }

    fn set_extra_reg(&mut self, reg: Reg) {
        self.base.extra_reg = Some(reg);
    }

    fn set_inline_comment(&mut self, text: &str) -> EmitResult<()> {
        let zone = self.base.expect()?.zone();
        let interned: &str = zone.alloc_str(text);
        self.base.inline_comment = Some(interned);
        Ok(())
    }
}
