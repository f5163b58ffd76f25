//! Builder: records the emission stream as a node graph for deferred
//! processing.
//!
//! Every operation of the emitter contract becomes a typed [`Node`] in a
//! doubly linked list (intrusive prev/next indices into a slab owned by the
//! builder, payload slices in the holder's zone). Passes may walk and
//! mutate the list before [`Builder::finalize`] replays it through an
//! [`Assembler`] attached to the same holder.

use crate::core::arch::ArchInfo;
use crate::core::assembler::Assembler;
use crate::core::compiler::{FuncData, InvokeData};
use crate::core::constpool::ConstPool;
use crate::core::emitter::{
    AlignMode, Emitter, EmitterCore, EmitterKind, EmitterOptions, ErrorHandler,
};
use crate::core::encoder::encoder_for;
use crate::core::error::{EmitError, EmitResult};
use crate::core::holder::{CodeHolder, LabelKind, SectionId};
use crate::core::inst::{InstId, InstOptions};
use crate::core::operand::{Label, OpArray, Operand, Reg};
use crate::core::types::TypeId;
use crate::core::INVALID_ID;

/// Index of a node in the builder's slab.
pub type NodeId = u32;

/// Marker nodes that carry no payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SentinelKind {
    /// End of a function body.
    FuncEnd,
}

/// Kind and payload of one recorded operation.
#[derive(Debug)]
pub enum NodeKind<'z> {
    Inst {
        id: InstId,
        options: InstOptions,
        extra_reg: Option<Reg>,
        ops: OpArray,
    },
    Label {
        label: Label,
    },
    Align {
        mode: AlignMode,
        alignment: u32,
    },
    EmbedData {
        type_id: TypeId,
        data: &'z [u8],
        item_count: usize,
        repeat_count: usize,
    },
    EmbedLabel {
        label: Label,
    },
    EmbedLabelDelta {
        label: Label,
        base: Label,
        size: u8,
    },
    ConstPool {
        label: Label,
        pool: ConstPool,
    },
    Comment {
        text: &'z str,
    },
    Sentinel {
        kind: SentinelKind,
    },
    Section {
        id: SectionId,
    },
    Func(FuncData),
    FuncRet {
        ops: [Operand; 2],
    },
    Invoke(InvokeData),
    Jump {
        id: InstId,
        options: InstOptions,
        target: Operand,
        annotation: Option<u32>,
    },
}

/// One node of the builder's intrusive list.
#[derive(Debug)]
pub struct Node<'z> {
    prev: NodeId,
    next: NodeId,
    removed: bool,
    comment: Option<&'z str>,
    kind: NodeKind<'z>,
}

impl<'z> Node<'z> {
    pub fn kind(&self) -> &NodeKind<'z> {
        &self.kind
    }

    pub fn kind_mut(&mut self) -> &mut NodeKind<'z> {
        &mut self.kind
    }

    pub fn prev(&self) -> Option<NodeId> {
        if self.prev == INVALID_ID {
            None
        } else {
            Some(self.prev)
        }
    }

    pub fn next(&self) -> Option<NodeId> {
        if self.next == INVALID_ID {
            None
        } else {
            Some(self.next)
        }
    }

    pub fn is_removed(&self) -> bool {
        self.removed
    }

    pub fn inline_comment(&self) -> Option<&'z str> {
        self.comment
    }
}

/// Emitter that records nodes instead of bytes.
pub struct Builder<'c, 'z> {
    base: EmitterCore<'c, 'z>,
    nodes: Vec<Node<'z>>,
    first: NodeId,
    last: NodeId,
    cursor: NodeId,
    section: SectionId,
}

impl<'c, 'z> Builder<'c, 'z> {
    /// Creates a builder attached to `code`.
    pub fn new(code: &'c mut CodeHolder<'z>) -> EmitResult<Self> {
        let mut builder = Self::detached();
        builder.attach(code)?;
        Ok(builder)
    }

    /// Creates a builder that is not attached to any holder yet.
    pub fn detached() -> Self {
        Self {
            base: EmitterCore::new(EmitterKind::Builder),
            nodes: Vec::new(),
            first: INVALID_ID,
            last: INVALID_ID,
            cursor: INVALID_ID,
            section: 0,
        }
    }

    pub fn attach(&mut self, code: &'c mut CodeHolder<'z>) -> EmitResult<()> {
        if self.base.code.is_some() {
            return Err(EmitError::AlreadyAttached);
        }
        self.section = 0;
        self.base.attach(code)
    }

    /// Detaches and hands the holder borrow back; recorded nodes survive.
    pub fn detach(&mut self) -> Option<&'c mut CodeHolder<'z>> {
        self.base.detach()
    }

    pub fn set_error_handler(&mut self, handler: Box<dyn ErrorHandler>) {
        self.base.handler = Some(handler);
    }

    pub fn code(&self) -> Option<&CodeHolder<'z>> {
        self.base.code.as_deref()
    }

    pub fn current_section(&self) -> SectionId {
        self.section
    }

    /// Drops every recorded node; the attachment state is kept.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.first = INVALID_ID;
        self.last = INVALID_ID;
        self.cursor = INVALID_ID;
        self.section = 0;
        self.base.reset_inst_state();
    }

    // ── Node list management ──────────────────────────────────────────

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn first_node(&self) -> Option<NodeId> {
        if self.first == INVALID_ID {
            None
        } else {
            Some(self.first)
        }
    }

    pub fn last_node(&self) -> Option<NodeId> {
        if self.last == INVALID_ID {
            None
        } else {
            Some(self.last)
        }
    }

    pub fn node(&self, id: NodeId) -> EmitResult<&Node<'z>> {
        self.nodes.get(id as usize).ok_or(EmitError::InvalidArgument)
    }

    pub fn node_mut(&mut self, id: NodeId) -> EmitResult<&mut Node<'z>> {
        self.nodes
            .get_mut(id as usize)
            .ok_or(EmitError::InvalidArgument)
    }

    /// Insertion cursor; new nodes link after it. `None` appends at the
    /// list end.
    pub fn cursor(&self) -> Option<NodeId> {
        if self.cursor == INVALID_ID {
            None
        } else {
            Some(self.cursor)
        }
    }

    pub fn set_cursor(&mut self, cursor: Option<NodeId>) {
        self.cursor = cursor.unwrap_or(INVALID_ID);
    }

    /// Allocates a node without linking it into the list.
    pub fn new_detached_node(&mut self, kind: NodeKind<'z>) -> NodeId {
        let id = self.nodes.len() as NodeId;
        self.nodes.push(Node {
            prev: INVALID_ID,
            next: INVALID_ID,
            removed: false,
            comment: None,
            kind,
        });
        id
    }

    /// Links a detached node after `after`, or at the list end.
    pub fn link_after(&mut self, id: NodeId, after: Option<NodeId>) {
        match after {
            Some(prev) => {
                let next = self.nodes[prev as usize].next;
                self.nodes[id as usize].prev = prev;
                self.nodes[id as usize].next = next;
                self.nodes[prev as usize].next = id;
                if next == INVALID_ID {
                    self.last = id;
                } else {
                    self.nodes[next as usize].prev = id;
                }
            }
            None => {
                if self.last == INVALID_ID {
                    self.first = id;
                    self.last = id;
                } else {
                    let last = self.last;
                    self.nodes[last as usize].next = id;
                    self.nodes[id as usize].prev = last;
                    self.last = id;
                }
            }
        }
    }

    /// Creates a node at the cursor position and advances the cursor.
    pub fn add_node(&mut self, kind: NodeKind<'z>) -> NodeId {
        let id = self.new_detached_node(kind);
        let after = if self.cursor == INVALID_ID {
            None
        } else {
            Some(self.cursor)
        };
        self.link_after(id, after);
        if self.cursor != INVALID_ID {
            self.cursor = id;
        }
        id
    }

    /// Unlinks a node from the list; the slab entry is retained and marked
    /// removed.
    pub fn remove_node(&mut self, id: NodeId) -> EmitResult<()> {
        let (prev, next) = {
            let node = self.node(id)?;
            if node.is_removed() {
                return Ok(());
            }
            (node.prev, node.next)
        };
        if prev == INVALID_ID {
            self.first = next;
        } else {
            self.nodes[prev as usize].next = next;
        }
        if next == INVALID_ID {
            self.last = prev;
        } else {
            self.nodes[next as usize].prev = prev;
        }
        let node = &mut self.nodes[id as usize];
        node.prev = INVALID_ID;
        node.next = INVALID_ID;
        node.removed = true;
        if self.cursor == id {
            self.cursor = INVALID_ID;
        }
        Ok(())
    }

    /// Ids of the linked nodes in stream order.
    pub fn node_ids(&self) -> NodeIter<'_, 'z> {
        NodeIter { nodes: &self.nodes, current: self.first }
    }

    fn add_simple(&mut self, kind: NodeKind<'z>) -> NodeId {
        let comment = self.base.inline_comment.take();
        let id = self.add_node(kind);
        self.nodes[id as usize].comment = comment;
        id
    }

    // ── Serialization ─────────────────────────────────────────────────

    /// Replays the recorded stream into another emitter (typically attached
    /// to a different holder; label and section ids must agree).
    pub fn serialize_into<E: Emitter + ?Sized>(&self, dst: &mut E) -> EmitResult<()> {
        serialize_node_list(&self.nodes, self.first, dst)
    }

    /// Replays the recorded stream through an internal assembler attached
    /// to this builder's holder.
    pub fn finalize(&mut self) -> EmitResult<()> {
        let arch = self.base.expect()?.arch();
        encoder_for(arch)?;
        let code = match self.base.code.take() {
            Some(code) => code,
            None => return Err(EmitError::NotInitialized),
        };
        let mut asm = match Assembler::new(code) {
            Ok(asm) => asm,
            Err(err) => return Err(err),
        };
        let result = serialize_node_list(&self.nodes, self.first, &mut asm);
        if let Some(code) = asm.detach() {
            self.base.code = Some(code);
        }
        result
    }

    pub(crate) fn core_mut(&mut self) -> &mut EmitterCore<'c, 'z> {
        &mut self.base
    }
}

/// Iterator over linked node ids.
pub struct NodeIter<'a, 'z> {
    nodes: &'a [Node<'z>],
    current: NodeId,
}

impl Iterator for NodeIter<'_, '_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        if self.current == INVALID_ID {
            return None;
        }
        let id = self.current;
        self.current = self.nodes[id as usize].next;
        Some(id)
    }
}

pub(crate) fn serialize_node_list<E: Emitter + ?Sized>(
    nodes: &[Node<'_>],
    first: NodeId,
    dst: &mut E,
) -> EmitResult<()> {
    let mut current = first;
    while current != INVALID_ID {
        let node = &nodes[current as usize];
        match &node.kind {
            NodeKind::Inst { id, options, extra_reg, ops } => {
                if let Some(text) = node.comment {
                    dst.set_inline_comment(text)?;
                }
                if !options.is_empty() {
                    dst.set_inst_options(*options);
                }
                if let Some(reg) = extra_reg {
                    dst.set_extra_reg(*reg);
                }
                dst.emit(*id, ops.as_slice())?;
            }
            NodeKind::Label { label } => dst.bind(*label)?,
            NodeKind::Align { mode, alignment } => dst.align(*mode, *alignment)?,
            NodeKind::EmbedData { type_id, data, item_count, repeat_count } => {
                dst.embed_data_array(*type_id, data, *item_count, *repeat_count)?;
            }
            NodeKind::EmbedLabel { label } => dst.embed_label(*label)?,
            NodeKind::EmbedLabelDelta { label, base, size } => {
                dst.embed_label_delta(*label, *base, *size as usize)?;
            }
            NodeKind::ConstPool { label, pool } => dst.embed_const_pool(*label, pool)?,
            NodeKind::Comment { text } => dst.comment(text)?,
            NodeKind::Sentinel { .. } => {}
            NodeKind::Section { id } => dst.section(*id)?,
            NodeKind::Func(func) => dst.bind(func.entry)?,
            NodeKind::FuncRet { ops } => {
                for op in ops {
                    if let Operand::Reg(reg) = op {
                        if reg.is_virtual() {
                            return Err(EmitError::InvalidState);
                        }
                    }
                }
                let arch = dst.arch().ok_or(EmitError::NotInitialized)?;
                let ret = encoder_for(arch)?.ret_inst();
                dst.emit(ret, &[])?;
            }
            NodeKind::Invoke(invoke) => dst.emit(invoke.inst_id, &[invoke.target])?,
            NodeKind::Jump { id, options, target, .. } => {
                if !options.is_empty() {
                    dst.set_inst_options(*options);
                }
                dst.emit(*id, &[*target])?;
            }
        }
        current = node.next;
    }
    Ok(())
}

impl Emitter for Builder<'_, '_> {
    fn kind(&self) -> EmitterKind {
        EmitterKind::Builder
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
        let valid = self.base.expect()?.is_label_valid(label);
        if !valid {
            return Err(self.base.report(EmitError::InvalidLabel));
        }
        self.base.inline_comment = None;
        self.add_node(NodeKind::Label { label });
        Ok(())
    }

    fn section(&mut self, section: SectionId) -> EmitResult<()> {
        let valid = self.base.expect()?.is_section_valid(section);
        if !valid {
            return Err(self.base.report(EmitError::InvalidSection));
        }
        self.section = section;
        self.add_node(NodeKind::Section { id: section });
        Ok(())
    }

    fn emit(&mut self, inst: InstId, ops: &[Operand]) -> EmitResult<()> {
        let (options, extra_reg, comment) = self.base.take_inst_state();
        if self.base.code.is_none() {
            return Err(EmitError::NotInitialized);
        }
        if ops.len() > OpArray::CAPACITY {
            return Err(self.base.report(EmitError::InvalidArgument));
        }
        let id = self.add_node(NodeKind::Inst {
            id: inst,
            options,
            extra_reg,
            ops: OpArray::from_slice(ops),
        });
        self.nodes[id as usize].comment = comment;
        Ok(())
    }

    fn align(&mut self, mode: AlignMode, alignment: u32) -> EmitResult<()> {
        if self.base.code.is_none() {
            return Err(EmitError::NotInitialized);
        }
        if alignment == 0 || !alignment.is_power_of_two() {
            return Err(self.base.report(EmitError::InvalidAlignment));
        }
        self.add_simple(NodeKind::Align { mode, alignment });
        Ok(())
    }

    fn embed(&mut self, data: &[u8]) -> EmitResult<()> {
        let zone = self.base.expect()?.zone();
        if data.is_empty() {
            return Ok(());
        }
        let data: &[u8] = zone.alloc_slice_copy(data);
        self.add_simple(NodeKind::EmbedData {
            type_id: TypeId::U8,
            data,
            item_count: data.len(),
            repeat_count: 1,
        });
        Ok(())
    }

    fn embed_data_array(
        &mut self,
        type_id: TypeId,
        data: &[u8],
        item_count: usize,
        repeat_count: usize,
    ) -> EmitResult<()> {
        let (zone, gp_size) = {
            let code = self.base.expect()?;
            (code.zone(), code.arch().gp_size())
        };
        let type_size = type_id.deabstract(gp_size).size() as usize;
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
        let data: &[u8] = zone.alloc_slice_copy(data);
        self.add_simple(NodeKind::EmbedData { type_id, data, item_count, repeat_count });
        Ok(())
    }

    fn embed_const_pool(&mut self, label: Label, pool: &ConstPool) -> EmitResult<()> {
        let valid = self.base.expect()?.is_label_valid(label);
        if !valid {
            return Err(self.base.report(EmitError::InvalidLabel));
        }
        self.add_simple(NodeKind::ConstPool { label, pool: pool.clone() });
        Ok(())
    }

    fn embed_label(&mut self, label: Label) -> EmitResult<()> {
        let valid = self.base.expect()?.is_label_valid(label);
        if !valid {
            return Err(self.base.report(EmitError::InvalidLabel));
        }
        self.add_simple(NodeKind::EmbedLabel { label });
        Ok(())
    }

    fn embed_label_delta(&mut self, label: Label, base: Label, size: usize) -> EmitResult<()> {
        let (valid, gp_size) = {
            let code = self.base.expect()?;
            (
                code.is_label_valid(label) && code.is_label_valid(base),
                code.arch().gp_size() as usize,
            )
        };
        if !valid {
            return Err(self.base.report(EmitError::InvalidLabel));
        }
        let size = if size == 0 { gp_size } else { size };
        if !size.is_power_of_two() || size > 8 {
            return Err(self.base.report(EmitError::InvalidOperandSize));
        }
        self.add_simple(NodeKind::EmbedLabelDelta { label, base, size: size as u8 });
        Ok(())
    }

    fn comment(&mut self, text: &str) -> EmitResult<()> {
        let zone = self.base.expect()?.zone();
        let text: &str = zone.alloc_str(text);
        self.add_node(NodeKind::Comment { text });
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::arch::{ArchId, ArchInfo};
    use crate::core::holder::CodeInfo;
    use bumpalo::Bump;

    fn holder(zone: &Bump) -> CodeHolder<'_> {
        let mut code = CodeHolder::new(zone);
        code.init(CodeInfo::new(ArchInfo::new(ArchId::X64, 0))).unwrap();
        code
    }

    #[test]
    fn test_record_order() {
        let zone = Bump::new();
        let mut code = holder(&zone);
        let mut b = Builder::new(&mut code).unwrap();
        let label = b.new_label().unwrap();
        b.bind(label).unwrap();
        b.emit(1, &[]).unwrap();
        b.comment("hi").unwrap();
        let kinds: Vec<_> = b.node_ids().collect();
        assert_eq!(kinds.len(), 3);
        assert!(matches!(b.node(kinds[0]).unwrap().kind(), NodeKind::Label { .. }));
        assert!(matches!(b.node(kinds[1]).unwrap().kind(), NodeKind::Inst { .. }));
        assert!(matches!(b.node(kinds[2]).unwrap().kind(), NodeKind::Comment { .. }));
    }

    #[test]
    fn test_remove_node() {
        let zone = Bump::new();
        let mut code = holder(&zone);
        let mut b = Builder::new(&mut code).unwrap();
        b.emit(1, &[]).unwrap();
        b.emit(2, &[]).unwrap();
        b.emit(3, &[]).unwrap();
        let ids: Vec<_> = b.node_ids().collect();
        b.remove_node(ids[1]).unwrap();
        let left: Vec<_> = b.node_ids().collect();
        assert_eq!(left, vec![ids[0], ids[2]]);
        assert!(b.node(ids[1]).unwrap().is_removed());
    }

    #[test]
    fn test_cursor_insertion() {
        let zone = Bump::new();
        let mut code = holder(&zone);
        let mut b = Builder::new(&mut code).unwrap();
        b.emit(1, &[]).unwrap();
        b.emit(3, &[]).unwrap();
        let ids: Vec<_> = b.node_ids().collect();
        b.set_cursor(Some(ids[0]));
        b.emit(2, &[]).unwrap();
        b.set_cursor(None);
        let order: Vec<_> = b
            .node_ids()
            .map(|id| match b.node(id).unwrap().kind() {
                NodeKind::Inst { id, .. } => *id,
                _ => 0,
            })
            .collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn test_detached_builder_errors() {
        let mut b = Builder::detached();
        assert_eq!(b.emit(1, &[]), Err(EmitError::NotInitialized));
        assert_eq!(b.comment("x"), Err(EmitError::NotInitialized));
        assert_eq!(b.align(AlignMode::Code, 8), Err(EmitError::NotInitialized));
    }

    #[test]
    fn test_inline_comment_attaches_to_inst() {
        let zone = Bump::new();
        let mut code = holder(&zone);
        let mut b = Builder::new(&mut code).unwrap();
        b.set_inline_comment("the answer").unwrap();
        b.emit(1, &[]).unwrap();
        let id = b.first_node().unwrap();
        assert_eq!(b.node(id).unwrap().inline_comment(), Some("the answer"));
    }
}
