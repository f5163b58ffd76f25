//! CodeHolder: the single owner of emitted code and its metadata.
//!
//! A holder owns the section buffers, the label and relocation tables and
//! an arena ("zone") for expression trees and interned strings. Emitters are
//! short-lived views that borrow the holder mutably; exactly one emitter can
//! write at a time, which the borrow checker enforces for us.
//!
//! Lifecycle: `CodeHolder::new(&arena)` then [`CodeHolder::init`] with a
//! [`CodeInfo`], emit through an attached emitter, then
//! [`CodeHolder::flatten`] → [`CodeHolder::resolve_unresolved_links`] →
//! [`CodeHolder::relocate_to`] to produce loadable bytes.

use bumpalo::Bump;
use std::collections::HashMap;

use crate::core::arch::ArchInfo;
use crate::core::buffer::{fits_either, fits_signed, fits_unsigned, CodeBuffer};
use crate::core::emitter::ErrorHandler;
use crate::core::error::{EmitError, EmitResult};
use crate::core::operand::Label;
use crate::core::INVALID_ID;

pub type SectionId = u32;
pub type LabelId = u32;
pub type RelocId = u32;

/// Basic information the holder is configured with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeInfo {
    arch: ArchInfo,
    base_address: Option<u64>,
}

impl CodeInfo {
    pub const fn new(arch: ArchInfo) -> Self {
        Self { arch, base_address: None }
    }

    /// Sets a fixed load address known ahead of time.
    pub const fn with_base_address(mut self, base: u64) -> Self {
        self.base_address = Some(base);
        self
    }

    pub const fn arch(&self) -> ArchInfo {
        self.arch
    }

    pub const fn base_address(&self) -> Option<u64> {
        self.base_address
    }
}

/// Section flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SectionFlags(u32);

impl SectionFlags {
    pub const NONE: SectionFlags = SectionFlags(0);
    /// Executable code.
    pub const EXEC: SectionFlags = SectionFlags(0x1);
    /// Read-only after load.
    pub const CONST: SectionFlags = SectionFlags(0x2);
    /// Zero-initialized, not stored in the output image.
    pub const ZERO_FILL: SectionFlags = SectionFlags(0x4);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: SectionFlags) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn union(self, other: SectionFlags) -> SectionFlags {
        SectionFlags(self.0 | other.0)
    }
}

impl std::ops::BitOr for SectionFlags {
    type Output = SectionFlags;

    fn bitor(self, rhs: SectionFlags) -> SectionFlags {
        self.union(rhs)
    }
}

/// A named, aligned, contiguous byte region.
#[derive(Debug)]
pub struct Section {
    id: SectionId,
    name: String,
    flags: SectionFlags,
    alignment: u32,
    offset: u64,
    buffer: CodeBuffer,
}

impl Section {
    pub fn id(&self) -> SectionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn flags(&self) -> SectionFlags {
        self.flags
    }

    pub fn alignment(&self) -> u32 {
        self.alignment
    }

    /// Base offset assigned by [`CodeHolder::flatten`]; 0 before flattening.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn buffer(&self) -> &CodeBuffer {
        &self.buffer
    }

    pub(crate) fn buffer_mut(&mut self) -> &mut CodeBuffer {
        &mut self.buffer
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_exec(&self) -> bool {
        self.flags.contains(SectionFlags::EXEC)
    }

    pub fn is_zero_fill(&self) -> bool {
        self.flags.contains(SectionFlags::ZERO_FILL)
    }
}

/// Label visibility and scoping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum LabelKind {
    /// Unnamed label, only addressable by id.
    #[default]
    Anonymous = 0,
    /// Named label scoped to a parent label.
    Local = 1,
    /// Named label visible to the whole holder (and exported symbols).
    Global = 2,
}

/// A pending reference to a label: the slot at `(section, offset)` of
/// `size` bytes awaits the label's position.
///
/// Plain links are PC-relative displacement slots patched with
/// `target + addend - (offset + size)`; links owned by a relocation entry
/// keep their placeholder and complete that entry instead.
#[derive(Debug, Clone, Copy)]
pub struct LabelLink {
    /// Section holding the unpatched slot.
    pub section: SectionId,
    /// Offset of the slot within its section.
    pub offset: u64,
    /// Slot size in bytes.
    pub size: u8,
    /// Constant added to the resolved target.
    pub addend: i64,
    /// Relocation entry consuming this link once the label binds, or
    /// `INVALID_ID` for a plain PC-relative patch.
    pub reloc_id: RelocId,
}

/// Per-label record.
#[derive(Debug)]
pub struct LabelEntry<'z> {
    id: LabelId,
    kind: LabelKind,
    parent: LabelId,
    name: Option<&'z str>,
    section: SectionId,
    offset: u64,
    links: Vec<LabelLink>,
}

impl<'z> LabelEntry<'z> {
    pub fn id(&self) -> LabelId {
        self.id
    }

    pub fn kind(&self) -> LabelKind {
        self.kind
    }

    pub fn parent(&self) -> Option<LabelId> {
        if self.parent == INVALID_ID {
            None
        } else {
            Some(self.parent)
        }
    }

    pub fn name(&self) -> Option<&'z str> {
        self.name
    }

    pub fn is_bound(&self) -> bool {
        self.section != INVALID_ID
    }

    /// Section the label is bound in; meaningless while unbound.
    pub fn section(&self) -> SectionId {
        self.section
    }

    /// Offset within the bound section; 0 while unbound.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }
}

/// Operator of a relocation expression node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExprOp {
    Add,
    Sub,
}

/// One side of a relocation expression.
#[derive(Debug, Clone, Copy)]
pub enum ExprValue<'z> {
    Imm(i64),
    /// Resolves to the label's absolute address after relocation.
    Label(LabelId),
    Expr(&'z Expr<'z>),
}

/// A small arithmetic tree over labels, evaluated at relocation time.
#[derive(Debug, Clone, Copy)]
pub struct Expr<'z> {
    pub op: ExprOp,
    pub lhs: ExprValue<'z>,
    pub rhs: ExprValue<'z>,
}

/// Relocation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RelocKind {
    /// Payload is an absolute address, written unchanged.
    AbsToAbs = 1,
    /// Payload is an offset within the target section, converted to an
    /// absolute address against the chosen base.
    RelToAbs = 2,
    /// Value is computed from an expression tree.
    Expression = 3,
}

/// A byte slot that must be rewritten once the final base address is known.
#[derive(Debug, Clone, Copy)]
pub struct RelocEntry<'z> {
    id: RelocId,
    kind: RelocKind,
    size: u8,
    source_section: SectionId,
    source_offset: u64,
    target_section: SectionId,
    payload: u64,
    expr: Option<&'z Expr<'z>>,
}

impl<'z> RelocEntry<'z> {
    pub fn id(&self) -> RelocId {
        self.id
    }

    pub fn kind(&self) -> RelocKind {
        self.kind
    }

    pub fn size(&self) -> u32 {
        self.size as u32
    }

    pub fn source_section(&self) -> SectionId {
        self.source_section
    }

    pub fn source_offset(&self) -> u64 {
        self.source_offset
    }

    /// Target section, or `None` for absolute and expression relocations.
    pub fn target_section(&self) -> Option<SectionId> {
        if self.target_section == INVALID_ID {
            None
        } else {
            Some(self.target_section)
        }
    }

    pub fn payload(&self) -> u64 {
        self.payload
    }

    pub fn expr(&self) -> Option<&'z Expr<'z>> {
        self.expr
    }

    pub fn set_source(&mut self, section: SectionId, offset: u64) {
        self.source_section = section;
        self.source_offset = offset;
    }

    pub fn set_target(&mut self, section: SectionId, offset: u64) {
        self.target_section = section;
        self.payload = offset;
    }

    pub fn set_absolute(&mut self, address: u64) {
        self.payload = address;
    }

    pub fn set_expr(&mut self, expr: &'z Expr<'z>) {
        self.expr = Some(expr);
    }
}

/// Container of sections, labels, relocations and the emission zone.
pub struct CodeHolder<'z> {
    zone: &'z Bump,
    info: CodeInfo,
    sections: Vec<Section>,
    section_names: HashMap<String, SectionId>,
    labels: Vec<LabelEntry<'z>>,
    named_labels: HashMap<(LabelId, String), LabelId>,
    relocs: Vec<RelocEntry<'z>>,
    error_handler: Option<Box<dyn ErrorHandler>>,
}

impl<'z> CodeHolder<'z> {
    /// Creates an empty, uninitialized holder backed by `zone`.
    pub fn new(zone: &'z Bump) -> Self {
        Self {
            zone,
            info: CodeInfo::new(ArchInfo::none()),
            sections: Vec::new(),
            section_names: HashMap::new(),
            labels: Vec::new(),
            named_labels: HashMap::new(),
            relocs: Vec::new(),
            error_handler: None,
        }
    }

    /// Initializes the holder for a target and seeds section 0 (`.text`).
    pub fn init(&mut self, info: CodeInfo) -> EmitResult<()> {
        if self.is_initialized() {
            return Err(EmitError::InvalidState);
        }
        if !info.arch().is_initialized() {
            return Err(EmitError::InvalidArgument);
        }
        self.info = info;
        self.sections.push(Section {
            id: 0,
            name: ".text".to_string(),
            flags: SectionFlags::EXEC,
            alignment: 4,
            offset: 0,
            buffer: CodeBuffer::new(),
        });
        self.section_names.insert(".text".to_string(), 0);
        log::debug!(
            "code holder initialized for arch {:?} (gp_size={})",
            info.arch().arch_id(),
            info.arch().gp_size()
        );
        Ok(())
    }

    /// Drops all sections, labels and relocations and returns the holder to
    /// the uninitialized state. With `free_memory` the table and buffer
    /// allocations are released too.
    ///
    /// Zone allocations are not reclaimed here; they live until the backing
    /// arena is dropped.
    pub fn reset(&mut self, free_memory: bool) {
        self.info = CodeInfo::new(ArchInfo::none());
        if free_memory {
            self.sections = Vec::new();
            self.section_names = HashMap::new();
            self.labels = Vec::new();
            self.named_labels = HashMap::new();
            self.relocs = Vec::new();
        } else {
            for section in &mut self.sections {
                section.buffer.reset(false);
            }
            self.sections.clear();
            self.section_names.clear();
            self.labels.clear();
            self.named_labels.clear();
            self.relocs.clear();
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.info.arch().is_initialized()
    }

    pub fn code_info(&self) -> CodeInfo {
        self.info
    }

    pub fn arch(&self) -> ArchInfo {
        self.info.arch()
    }

    pub fn zone(&self) -> &'z Bump {
        self.zone
    }

    pub fn set_error_handler(&mut self, handler: Box<dyn ErrorHandler>) {
        self.error_handler = Some(handler);
    }

    pub fn reset_error_handler(&mut self) {
        self.error_handler = None;
    }

    pub(crate) fn error_handler_mut(&mut self) -> Option<&mut (dyn ErrorHandler + 'static)> {
        self.error_handler.as_deref_mut()
    }

    // ── Sections ──────────────────────────────────────────────────────

    pub fn section_count(&self) -> usize {
        self.sections.len()
    }

    pub fn is_section_valid(&self, id: SectionId) -> bool {
        (id as usize) < self.sections.len()
    }

    pub fn section(&self, id: SectionId) -> EmitResult<&Section> {
        self.sections
            .get(id as usize)
            .ok_or(EmitError::InvalidSection)
    }

    pub(crate) fn section_mut(&mut self, id: SectionId) -> EmitResult<&mut Section> {
        self.sections
            .get_mut(id as usize)
            .ok_or(EmitError::InvalidSection)
    }

    pub fn sections(&self) -> impl Iterator<Item = &Section> {
        self.sections.iter()
    }

    /// Section 0, created by `init`.
    pub fn text_section(&self) -> &Section {
        &self.sections[0]
    }

    /// Creates a new section. Fails with `DuplicateSectionName` or
    /// `InvalidAlignment` (zero or non-power-of-two alignment).
    pub fn new_section(
        &mut self,
        name: &str,
        flags: SectionFlags,
        alignment: u32,
    ) -> EmitResult<SectionId> {
        if !self.is_initialized() {
            return Err(EmitError::NotInitialized);
        }
        if alignment == 0 || !alignment.is_power_of_two() {
            return Err(EmitError::InvalidAlignment);
        }
        if name.is_empty() {
            return Err(EmitError::InvalidArgument);
        }
        if self.section_names.contains_key(name) {
            return Err(EmitError::DuplicateSectionName);
        }
        let id = self.sections.len() as SectionId;
        self.sections.push(Section {
            id,
            name: name.to_string(),
            flags,
            alignment,
            offset: 0,
            buffer: CodeBuffer::new(),
        });
        self.section_names.insert(name.to_string(), id);
        log::debug!("new section {:?} (#{}, align={})", name, id, alignment);
        Ok(id)
    }

    pub fn section_by_name(&self, name: &str) -> Option<SectionId> {
        self.section_names.get(name).copied()
    }

    // ── Labels ────────────────────────────────────────────────────────

    pub fn label_count(&self) -> usize {
        self.labels.len()
    }

    pub fn is_label_valid(&self, label: Label) -> bool {
        label.is_valid() && (label.id() as usize) < self.labels.len()
    }

    pub fn label_entry(&self, label: Label) -> EmitResult<&LabelEntry<'z>> {
        if !label.is_valid() {
            return Err(EmitError::InvalidLabel);
        }
        self.labels
            .get(label.id() as usize)
            .ok_or(EmitError::InvalidLabel)
    }

    pub fn label_entries(&self) -> impl Iterator<Item = &LabelEntry<'z>> {
        self.labels.iter()
    }

    /// Creates a new anonymous label.
    pub fn new_label(&mut self) -> EmitResult<Label> {
        if !self.is_initialized() {
            return Err(EmitError::NotInitialized);
        }
        if self.labels.len() >= INVALID_ID as usize {
            return Err(EmitError::TooManyLabels);
        }
        let id = self.labels.len() as LabelId;
        self.labels.push(LabelEntry {
            id,
            kind: LabelKind::Anonymous,
            parent: INVALID_ID,
            name: None,
            section: INVALID_ID,
            offset: 0,
            links: Vec::new(),
        });
        Ok(Label::from_id(id))
    }

    /// Creates a named label. Names are unique within their `(parent, name)`
    /// scope; a clash fails with `InvalidLabel`.
    pub fn new_named_label(
        &mut self,
        name: &str,
        kind: LabelKind,
        parent: Option<Label>,
    ) -> EmitResult<Label> {
        if !self.is_initialized() {
            return Err(EmitError::NotInitialized);
        }
        if name.is_empty() || matches!(kind, LabelKind::Anonymous) {
            return Err(EmitError::InvalidArgument);
        }
        let parent_id = match parent {
            Some(p) => {
                if !self.is_label_valid(p) {
                    return Err(EmitError::InvalidLabel);
                }
                p.id()
            }
            None => INVALID_ID,
        };
        let key = (parent_id, name.to_string());
        if self.named_labels.contains_key(&key) {
            return Err(EmitError::InvalidLabel);
        }
        if self.labels.len() >= INVALID_ID as usize {
            return Err(EmitError::TooManyLabels);
        }
        let id = self.labels.len() as LabelId;
        self.labels.push(LabelEntry {
            id,
            kind,
            parent: parent_id,
            name: Some(self.zone.alloc_str(name)),
            section: INVALID_ID,
            offset: 0,
            links: Vec::new(),
        });
        self.named_labels.insert(key, id);
        Ok(Label::from_id(id))
    }

    /// Pure lookup of a named label; returns an invalid label when absent.
    pub fn label_by_name(&self, name: &str, parent: Option<Label>) -> Label {
        let parent_id = parent.map_or(INVALID_ID, Label::id);
        match self.named_labels.get(&(parent_id, name.to_string())) {
            Some(&id) => Label::from_id(id),
            None => Label::invalid(),
        }
    }

    /// The label's bound offset, or 0 for unbound or invalid labels.
    pub fn label_offset(&self, label: Label) -> u64 {
        match self.label_entry(label) {
            Ok(entry) if entry.is_bound() => entry.offset,
            _ => 0,
        }
    }

    /// Offset of `label` if it is bound inside `section`.
    pub fn label_offset_in(&self, label: Label, section: SectionId) -> Option<u64> {
        match self.label_entry(label) {
            Ok(entry) if entry.is_bound() && entry.section == section => Some(entry.offset),
            _ => None,
        }
    }

    /// Queues a pending reference to `label`.
    pub(crate) fn add_label_link(&mut self, label: Label, link: LabelLink) -> EmitResult<()> {
        if !self.is_label_valid(label) {
            return Err(EmitError::InvalidLabel);
        }
        self.labels[label.id() as usize].links.push(link);
        Ok(())
    }

    /// Binds `label` at `(section_id, offset)` and resolves what it can:
    /// same-section links are patched in place, links owned by a relocation
    /// complete that entry, and cross-section displacement links stay queued
    /// for [`CodeHolder::resolve_unresolved_links`].
    pub fn bind_label(
        &mut self,
        label: Label,
        section_id: SectionId,
        offset: u64,
    ) -> EmitResult<()> {
        if !self.is_initialized() {
            return Err(EmitError::NotInitialized);
        }
        if !self.is_section_valid(section_id) {
            return Err(EmitError::InvalidSection);
        }
        if !self.is_label_valid(label) {
            return Err(EmitError::InvalidLabel);
        }
        let lid = label.id() as usize;
        if self.labels[lid].is_bound() {
            return Err(EmitError::LabelAlreadyBound);
        }
        if offset > self.sections[section_id as usize].buffer.len() as u64 {
            return Err(EmitError::InvalidArgument);
        }

        self.labels[lid].section = section_id;
        self.labels[lid].offset = offset;
        log::debug!("label #{} bound at section {} offset {}", lid, section_id, offset);

        let links = std::mem::take(&mut self.labels[lid].links);
        let mut remaining = Vec::new();
        let mut first_err = None;

        for link in links {
            if link.reloc_id != INVALID_ID {
                // The slot belongs to a relocation; record the now-known
                // target and leave the placeholder for `relocate_to`.
                let re = &mut self.relocs[link.reloc_id as usize];
                re.target_section = section_id;
                if re.kind == RelocKind::RelToAbs {
                    re.payload = offset;
                }
                continue;
            }
            if link.section == section_id {
                let value = offset as i64 + link.addend - (link.offset + link.size as u64) as i64;
                if !fits_signed(value, link.size as usize) {
                    first_err.get_or_insert(EmitError::RelocationOverflow);
                    continue;
                }
                log::trace!(
                    "patching link at section {} offset {} with displacement {}",
                    link.section,
                    link.offset,
                    value
                );
                self.sections[link.section as usize].buffer.patch_value_le(
                    link.offset as usize,
                    value as u64,
                    link.size as usize,
                )?;
            } else {
                remaining.push(link);
            }
        }

        self.labels[lid].links = remaining;
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    // ── Relocations and expressions ───────────────────────────────────

    pub fn reloc_count(&self) -> usize {
        self.relocs.len()
    }

    pub fn reloc_entries(&self) -> impl Iterator<Item = &RelocEntry<'z>> {
        self.relocs.iter()
    }

    /// Allocates a new relocation entry and returns its id.
    pub fn new_reloc_entry(&mut self, kind: RelocKind, size: u32) -> EmitResult<RelocId> {
        if !matches!(size, 1 | 2 | 4 | 8) {
            return Err(EmitError::InvalidArgument);
        }
        if self.relocs.len() >= INVALID_ID as usize {
            return Err(EmitError::TooManyRelocations);
        }
        let id = self.relocs.len() as RelocId;
        self.relocs.push(RelocEntry {
            id,
            kind,
            size: size as u8,
            source_section: 0,
            source_offset: 0,
            target_section: INVALID_ID,
            payload: 0,
            expr: None,
        });
        Ok(id)
    }

    pub fn reloc_mut(&mut self, id: RelocId) -> EmitResult<&mut RelocEntry<'z>> {
        self.relocs
            .get_mut(id as usize)
            .ok_or(EmitError::InvalidArgument)
    }

    /// Allocates an expression node in the holder's zone.
    pub fn new_expr(&self, op: ExprOp, lhs: ExprValue<'z>, rhs: ExprValue<'z>) -> &'z Expr<'z> {
        self.zone.alloc(Expr { op, lhs, rhs })
    }

    // ── Layout and relocation passes ──────────────────────────────────

    /// Assigns every section its base offset in declaration order, aligning
    /// each section up to its alignment. Idempotent.
    pub fn flatten(&mut self) -> EmitResult<()> {
        if !self.is_initialized() {
            return Err(EmitError::NotInitialized);
        }
        let mut cursor: u64 = 0;
        for section in &mut self.sections {
            let align = section.alignment as u64;
            let offset = cursor
                .checked_add(align - 1)
                .ok_or(EmitError::OutOfMemory)?
                & !(align - 1);
            section.offset = offset;
            cursor = offset + section.buffer.len() as u64;
        }
        log::debug!("flattened {} sections, total size {}", self.sections.len(), cursor);
        Ok(())
    }

    /// Total image size after [`CodeHolder::flatten`]: end of the last
    /// section.
    pub fn code_size(&self) -> u64 {
        self.sections
            .iter()
            .map(|s| s.offset + s.buffer.len() as u64)
            .max()
            .unwrap_or(0)
    }

    /// Number of label links still waiting for a label or layout.
    pub fn unresolved_link_count(&self) -> usize {
        self.labels.iter().map(|l| l.links.len()).sum()
    }

    /// Patches the remaining links of bound labels using the flattened
    /// section offsets. Links to unbound labels stay queued and count
    /// toward [`CodeHolder::unresolved_link_count`].
    pub fn resolve_unresolved_links(&mut self) -> EmitResult<()> {
        if !self.is_initialized() {
            return Err(EmitError::NotInitialized);
        }
        let mut first_err = None;
        for lid in 0..self.labels.len() {
            if !self.labels[lid].is_bound() || self.labels[lid].links.is_empty() {
                continue;
            }
            let target_section = self.labels[lid].section as usize;
            let target = self.sections[target_section].offset + self.labels[lid].offset;
            let links = std::mem::take(&mut self.labels[lid].links);
            for link in links {
                let source = self.sections[link.section as usize].offset + link.offset;
                let value = target as i64 + link.addend - (source + link.size as u64) as i64;
                if !fits_signed(value, link.size as usize) {
                    first_err.get_or_insert(EmitError::RelocationOverflow);
                    continue;
                }
                self.sections[link.section as usize].buffer.patch_value_le(
                    link.offset as usize,
                    value as u64,
                    link.size as usize,
                )?;
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Applies every relocation entry against `base`, writing little-endian
    /// values into the section buffers.
    pub fn relocate_to(&mut self, base: u64) -> EmitResult<()> {
        if !self.is_initialized() {
            return Err(EmitError::NotInitialized);
        }
        if self.unresolved_link_count() != 0 {
            return Err(EmitError::UnresolvedLabel);
        }
        for index in 0..self.relocs.len() {
            let re = self.relocs[index];
            let size = re.size as usize;
            let (value, signed) = match re.kind {
                RelocKind::AbsToAbs => (re.payload as i64, false),
                RelocKind::RelToAbs => {
                    if re.target_section == INVALID_ID {
                        return Err(EmitError::UnresolvedLabel);
                    }
                    let section = &self.sections[re.target_section as usize];
                    (
                        base.wrapping_add(section.offset)
                            .wrapping_add(re.payload) as i64,
                        false,
                    )
                }
                RelocKind::Expression => {
                    let expr = re.expr.ok_or(EmitError::UnresolvedExpression)?;
                    (self.eval_expr(expr, base)?, true)
                }
            };
            let fits = if signed {
                fits_either(value, size)
            } else {
                fits_unsigned(value as u64, size)
            };
            if !fits {
                return Err(EmitError::RelocationOverflow);
            }
            log::trace!(
                "reloc #{} -> {:#x} at section {} offset {}",
                re.id,
                value,
                re.source_section,
                re.source_offset
            );
            self.sections[re.source_section as usize].buffer.patch_value_le(
                re.source_offset as usize,
                value as u64,
                size,
            )?;
        }
        Ok(())
    }

    fn eval_expr(&self, expr: &Expr<'z>, base: u64) -> EmitResult<i64> {
        let lhs = self.eval_value(expr.lhs, base)?;
        let rhs = self.eval_value(expr.rhs, base)?;
        Ok(match expr.op {
            ExprOp::Add => lhs.wrapping_add(rhs),
            ExprOp::Sub => lhs.wrapping_sub(rhs),
        })
    }

    fn eval_value(&self, value: ExprValue<'z>, base: u64) -> EmitResult<i64> {
        match value {
            ExprValue::Imm(imm) => Ok(imm),
            ExprValue::Label(id) => {
                let entry = self.label_entry(Label::from_id(id))?;
                if !entry.is_bound() {
                    return Err(EmitError::UnresolvedLabel);
                }
                let section = &self.sections[entry.section as usize];
                Ok(base.wrapping_add(section.offset).wrapping_add(entry.offset) as i64)
            }
            ExprValue::Expr(inner) => self.eval_expr(inner, base),
        }
    }
}

impl std::fmt::Debug for CodeHolder<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeHolder")
            .field("info", &self.info)
            .field("sections", &self.sections.len())
            .field("labels", &self.labels.len())
            .field("relocs", &self.relocs.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::arch::ArchId;

    fn holder(zone: &Bump) -> CodeHolder<'_> {
        let mut code = CodeHolder::new(zone);
        code.init(CodeInfo::new(ArchInfo::new(ArchId::X64, 0))).unwrap();
        code
    }

    #[test]
    fn test_init_seeds_text_section() {
        let zone = Bump::new();
        let code = holder(&zone);
        assert_eq!(code.section_count(), 1);
        assert_eq!(code.text_section().name(), ".text");
        assert!(code.text_section().is_exec());
        assert_eq!(code.section_by_name(".text"), Some(0));
    }

    #[test]
    fn test_double_init_fails() {
        let zone = Bump::new();
        let mut code = holder(&zone);
        assert_eq!(
            code.init(CodeInfo::new(ArchInfo::new(ArchId::X64, 0))),
            Err(EmitError::InvalidState)
        );
    }

    #[test]
    fn test_new_section_validation() {
        let zone = Bump::new();
        let mut code = holder(&zone);
        assert_eq!(
            code.new_section(".data", SectionFlags::NONE, 3),
            Err(EmitError::InvalidAlignment)
        );
        assert_eq!(
            code.new_section(".data", SectionFlags::NONE, 0),
            Err(EmitError::InvalidAlignment)
        );
        let id = code.new_section(".data", SectionFlags::NONE, 8).unwrap();
        assert_eq!(id, 1);
        assert_eq!(
            code.new_section(".data", SectionFlags::NONE, 8),
            Err(EmitError::DuplicateSectionName)
        );
    }

    #[test]
    fn test_named_label_dedup() {
        let zone = Bump::new();
        let mut code = holder(&zone);
        let a = code.new_named_label("entry", LabelKind::Global, None).unwrap();
        assert_eq!(code.label_by_name("entry", None), a);
        assert_eq!(
            code.new_named_label("entry", LabelKind::Global, None),
            Err(EmitError::InvalidLabel)
        );
        // Same name under a different parent is a different scope.
        let b = code.new_named_label("entry", LabelKind::Local, Some(a)).unwrap();
        assert_ne!(a, b);
        assert_eq!(code.label_by_name("entry", Some(a)), b);
        assert!(!code.label_by_name("missing", None).is_valid());
    }

    #[test]
    fn test_bind_and_label_offset() {
        let zone = Bump::new();
        let mut code = holder(&zone);
        let label = code.new_label().unwrap();
        assert_eq!(code.label_offset(label), 0);
        code.section_mut(0).unwrap().buffer_mut().emit_zeros(10);
        code.bind_label(label, 0, 6).unwrap();
        assert_eq!(code.label_offset(label), 6);
        assert_eq!(
            code.bind_label(label, 0, 6),
            Err(EmitError::LabelAlreadyBound)
        );
    }

    #[test]
    fn test_bind_past_buffer_end_fails() {
        let zone = Bump::new();
        let mut code = holder(&zone);
        let label = code.new_label().unwrap();
        assert_eq!(code.bind_label(label, 0, 4), Err(EmitError::InvalidArgument));
    }

    #[test]
    fn test_bind_patches_forward_link() {
        let zone = Bump::new();
        let mut code = holder(&zone);
        let label = code.new_label().unwrap();
        // 5-byte jump: opcode at 0, 4-byte displacement slot at 1.
        code.section_mut(0).unwrap().buffer_mut().emit_u8(0xE9);
        code.section_mut(0).unwrap().buffer_mut().emit_zeros(4);
        code.add_label_link(
            label,
            LabelLink { section: 0, offset: 1, size: 4, addend: 0, reloc_id: INVALID_ID },
        )
        .unwrap();
        code.section_mut(0).unwrap().buffer_mut().emit_u8(0x90);
        code.bind_label(label, 0, 6).unwrap();
        assert_eq!(code.unresolved_link_count(), 0);
        assert_eq!(
            code.text_section().buffer().as_slice(),
            &[0xE9, 0x01, 0x00, 0x00, 0x00, 0x90]
        );
    }

    #[test]
    fn test_bind_link_overflow() {
        let zone = Bump::new();
        let mut code = holder(&zone);
        let label = code.new_label().unwrap();
        code.section_mut(0).unwrap().buffer_mut().emit_zeros(300);
        code.add_label_link(
            label,
            LabelLink { section: 0, offset: 0, size: 1, addend: 0, reloc_id: INVALID_ID },
        )
        .unwrap();
        assert_eq!(
            code.bind_label(label, 0, 300),
            Err(EmitError::RelocationOverflow)
        );
    }

    #[test]
    fn test_flatten_layout() {
        let zone = Bump::new();
        let mut code = holder(&zone);
        code.section_mut(0).unwrap().buffer_mut().emit_zeros(5);
        let data = code.new_section(".data", SectionFlags::NONE, 8).unwrap();
        code.section_mut(data).unwrap().buffer_mut().emit_zeros(3);
        code.flatten().unwrap();
        let off = code.section(data).unwrap().offset();
        assert_eq!(off, 8);
        assert!(off >= code.text_section().buffer_size() as u64);
        // Idempotent.
        code.flatten().unwrap();
        assert_eq!(code.section(data).unwrap().offset(), 8);
        assert_eq!(code.code_size(), 11);
    }

    #[test]
    fn test_cross_section_link_resolution() {
        let zone = Bump::new();
        let mut code = holder(&zone);
        // A 4-byte PC-relative slot at .text offset 2 referring to .data.
        code.section_mut(0).unwrap().buffer_mut().emit_zeros(6);
        let data = code.new_section(".data", SectionFlags::NONE, 8).unwrap();
        code.section_mut(data).unwrap().buffer_mut().emit_u8(0x01);
        let label = code.new_label().unwrap();
        code.add_label_link(
            label,
            LabelLink { section: 0, offset: 2, size: 4, addend: 0, reloc_id: INVALID_ID },
        )
        .unwrap();
        code.bind_label(label, data, 0).unwrap();
        // Still pending: the sections have no layout yet.
        assert_eq!(code.unresolved_link_count(), 1);
        code.flatten().unwrap();
        code.resolve_unresolved_links().unwrap();
        assert_eq!(code.unresolved_link_count(), 0);
        // .data starts at 8; slot ends at 6 → displacement 2.
        assert_eq!(
            &code.text_section().buffer().as_slice()[2..6],
            &[0x02, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_relocate_rel_to_abs() {
        let zone = Bump::new();
        let mut code = holder(&zone);
        code.section_mut(0).unwrap().buffer_mut().emit_zeros(8);
        let label = code.new_label().unwrap();
        let reloc = code.new_reloc_entry(RelocKind::RelToAbs, 8).unwrap();
        code.reloc_mut(reloc).unwrap().set_source(0, 0);
        code.add_label_link(label, LabelLink { section: 0, offset: 0, size: 8, addend: 0, reloc_id: reloc })
            .unwrap();
        code.bind_label(label, 0, 4).unwrap();
        code.flatten().unwrap();
        code.relocate_to(0x40_0000).unwrap();
        assert_eq!(
            code.text_section().buffer().read_value_le(0, 8).unwrap(),
            0x40_0004
        );
    }

    #[test]
    fn test_relocate_unbound_label_fails() {
        let zone = Bump::new();
        let mut code = holder(&zone);
        code.section_mut(0).unwrap().buffer_mut().emit_zeros(8);
        let label = code.new_label().unwrap();
        let reloc = code.new_reloc_entry(RelocKind::RelToAbs, 8).unwrap();
        code.reloc_mut(reloc).unwrap().set_source(0, 0);
        code.add_label_link(label, LabelLink { section: 0, offset: 0, size: 8, addend: 0, reloc_id: reloc })
            .unwrap();
        assert_eq!(code.relocate_to(0), Err(EmitError::UnresolvedLabel));
    }

    #[test]
    fn test_relocate_expression_delta() {
        let zone = Bump::new();
        let mut code = holder(&zone);
        code.section_mut(0).unwrap().buffer_mut().emit_zeros(4);
        let data = code.new_section(".data", SectionFlags::NONE, 16).unwrap();
        code.section_mut(data).unwrap().buffer_mut().emit_zeros(2);
        let a = code.new_label().unwrap();
        let b = code.new_label().unwrap();
        code.bind_label(a, data, 2).unwrap();
        code.bind_label(b, 0, 0).unwrap();
        let expr = code.new_expr(ExprOp::Sub, ExprValue::Label(a.id()), ExprValue::Label(b.id()));
        let reloc = code.new_reloc_entry(RelocKind::Expression, 4).unwrap();
        {
            let re = code.reloc_mut(reloc).unwrap();
            re.set_source(0, 0);
            re.set_expr(expr);
        }
        code.flatten().unwrap();
        code.relocate_to(0x1000).unwrap();
        // a = base + 16 + 2, b = base + 0 → delta 18, base-independent.
        assert_eq!(code.text_section().buffer().read_value_le(0, 4).unwrap(), 18);
    }

    #[test]
    fn test_reset() {
        let zone = Bump::new();
        let mut code = holder(&zone);
        code.new_label().unwrap();
        code.section_mut(0).unwrap().buffer_mut().emit_zeros(16);
        code.reset(true);
        assert!(!code.is_initialized());
        assert_eq!(code.section_count(), 0);
        assert_eq!(code.label_count(), 0);
        assert_eq!(code.reloc_count(), 0);
        assert_eq!(code.new_label(), Err(EmitError::NotInitialized));
    }
}
