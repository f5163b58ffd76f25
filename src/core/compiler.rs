//! Compiler: a builder with virtual registers, functions and invocations.
//!
//! The compiler records the same node stream as the
//! [`Builder`](crate::core::builder::Builder) and adds the substrate a
//! register allocator consumes: a virtual-register table, function
//! boundaries with computed argument locations, call sites and annotated
//! indirect jumps. Register allocation itself is an external pass that
//! rewrites virtual operands to physical ones on the node graph before
//! [`Compiler::finalize`] serializes it.

use crate::core::arch::ArchInfo;
use crate::core::builder::{Builder, NodeId, NodeKind, SentinelKind};
use crate::core::constpool::ConstPool;
use crate::core::emitter::{AlignMode, Emitter, EmitterKind, EmitterOptions, ErrorHandler};
use crate::core::error::{EmitError, EmitResult};
use crate::core::func::{FuncDetail, FuncSignature};
use crate::core::holder::{CodeHolder, LabelKind, SectionId};
use crate::core::inst::{InstId, InstOptions};
use crate::core::operand::{
    virt_id_to_index, virt_index_to_id, Label, Mem, Operand, Reg, RegGroup, RegType, VIRT_ID_BASE,
};
use crate::core::types::TypeId;
use crate::core::INVALID_ID;

/// A virtual register managed by the compiler.
///
/// The `work_id` field is transient allocator state: an external register
/// allocator may park the index of its working record here and must reset
/// it before it returns.
#[derive(Debug)]
pub struct VirtReg<'z> {
    id: u32,
    ty: RegType,
    virt_size: u32,
    alignment: u8,
    type_id: TypeId,
    weight: u8,
    is_fixed: bool,
    is_stack: bool,
    name: Option<&'z str>,
    work_id: u32,
}

impl<'z> VirtReg<'z> {
    /// Full operand id (`VIRT_ID_BASE + index`).
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Dense table index.
    pub fn index(&self) -> u32 {
        virt_id_to_index(self.id)
    }

    pub fn reg_type(&self) -> RegType {
        self.ty
    }

    pub fn group(&self) -> RegGroup {
        self.ty.group()
    }

    /// Size of the physical register class this maps to.
    pub fn reg_size(&self) -> u32 {
        self.ty.size()
    }

    /// Packed `{type, group, size}` signature, identical to
    /// [`Reg::signature`].
    pub fn signature(&self) -> u32 {
        Reg::new(self.ty, self.id).signature()
    }

    /// Bytes the virtual register actually stores (≤ `reg_size`).
    pub fn virt_size(&self) -> u32 {
        self.virt_size
    }

    /// Spill-slot alignment.
    pub fn alignment(&self) -> u32 {
        self.alignment as u32
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Allocation weight hint (higher = keep in a register).
    pub fn weight(&self) -> u32 {
        self.weight as u32
    }

    pub fn set_weight(&mut self, weight: u8) {
        self.weight = weight;
    }

    /// Pinned to a fixed physical register, never reallocated.
    pub fn is_fixed(&self) -> bool {
        self.is_fixed
    }

    /// A stack slot addressed through the virtual id; it is an error to use
    /// it as a register operand.
    pub fn is_stack(&self) -> bool {
        self.is_stack
    }

    pub fn name(&self) -> Option<&'z str> {
        self.name
    }

    pub fn work_id(&self) -> Option<u32> {
        if self.work_id == INVALID_ID {
            None
        } else {
            Some(self.work_id)
        }
    }

    pub fn set_work_id(&mut self, work_id: u32) {
        self.work_id = work_id;
    }

    pub fn reset_work_id(&mut self) {
        self.work_id = INVALID_ID;
    }

    /// As an operand of its natural register class.
    pub fn as_reg(&self) -> Reg {
        Reg::new(self.ty, self.id)
    }
}

/// Candidate targets of an indirect jump, for control-flow reconstruction.
#[derive(Debug)]
pub struct JumpAnnotation {
    id: u32,
    labels: Vec<u32>,
}

impl JumpAnnotation {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn add_label(&mut self, label: Label) {
        if !self.labels.contains(&label.id()) {
            self.labels.push(label.id());
        }
    }

    pub fn has_label(&self, label: Label) -> bool {
        self.labels.contains(&label.id())
    }

    pub fn label_ids(&self) -> &[u32] {
        &self.labels
    }
}

/// Payload of a function node: entry/exit labels, computed argument
/// locations and bound argument registers.
#[derive(Debug)]
pub struct FuncData {
    pub entry: Label,
    pub exit: Label,
    pub detail: FuncDetail,
    /// Virtual-register indices bound to declared arguments.
    pub args: Vec<Option<u32>>,
    /// End sentinel, set by `end_func`.
    pub end: Option<NodeId>,
}

/// Payload of an invocation node: the call instruction, its target and the
/// argument/return operand slots.
#[derive(Debug)]
pub struct InvokeData {
    pub inst_id: InstId,
    pub target: Operand,
    pub detail: FuncDetail,
    pub rets: [Operand; 2],
    pub args: Vec<Operand>,
}

/// Scope of a compiler-created constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstScope {
    /// Flushed at the end of the current function.
    Local,
    /// Flushed by `finalize`.
    Global,
}

fn reg_type_for(type_id: TypeId, arch: ArchInfo) -> EmitResult<RegType> {
    match type_id.deabstract(arch.gp_size()) {
        TypeId::I8 | TypeId::U8 => Ok(RegType::Gp8),
        TypeId::I16 | TypeId::U16 => Ok(RegType::Gp16),
        TypeId::I32 | TypeId::U32 => Ok(RegType::Gp32),
        TypeId::I64 | TypeId::U64 => Ok(RegType::Gp64),
        TypeId::F32 | TypeId::F64 => Ok(RegType::Xmm),
        _ => Err(EmitError::InvalidArgument),
    }
}

/// Emitter that extends the node-recording builder with virtual registers
/// and function management.
pub struct Compiler<'c, 'z> {
    b: Builder<'c, 'z>,
    virt_regs: Vec<VirtReg<'z>>,
    annotations: Vec<JumpAnnotation>,
    func: Option<NodeId>,
    local_pool: Option<NodeId>,
    global_pool: Option<NodeId>,
}

impl<'c, 'z> Compiler<'c, 'z> {
    pub fn new(code: &'c mut CodeHolder<'z>) -> EmitResult<Self> {
        let mut compiler = Self::detached();
        compiler.attach(code)?;
        Ok(compiler)
    }

    pub fn detached() -> Self {
        Self {
            b: Builder::detached(),
            virt_regs: Vec::new(),
            annotations: Vec::new(),
            func: None,
            local_pool: None,
            global_pool: None,
        }
    }

    pub fn attach(&mut self, code: &'c mut CodeHolder<'z>) -> EmitResult<()> {
        self.b.attach(code)
    }

    pub fn detach(&mut self) -> Option<&'c mut CodeHolder<'z>> {
        self.b.detach()
    }

    pub fn set_error_handler(&mut self, handler: Box<dyn ErrorHandler>) {
        self.b.set_error_handler(handler);
    }

    pub fn code(&self) -> Option<&CodeHolder<'z>> {
        self.b.code()
    }

    /// The underlying node graph.
    pub fn builder(&self) -> &Builder<'c, 'z> {
        &self.b
    }

    pub fn builder_mut(&mut self) -> &mut Builder<'c, 'z> {
        &mut self.b
    }

    /// Drops all recorded nodes, virtual registers and annotations.
    /// Outstanding virtual-register operands become invalid.
    pub fn clear(&mut self) {
        self.b.clear();
        self.virt_regs.clear();
        self.annotations.clear();
        self.func = None;
        self.local_pool = None;
        self.global_pool = None;
    }

    // ── Virtual registers ─────────────────────────────────────────────

    pub fn virt_reg_count(&self) -> usize {
        self.virt_regs.len()
    }

    pub fn is_virt_reg_valid(&self, reg: Reg) -> bool {
        reg.is_virtual() && (virt_id_to_index(reg.id()) as usize) < self.virt_regs.len()
    }

    pub fn virt_regs(&self) -> &[VirtReg<'z>] {
        &self.virt_regs
    }

    pub fn virt_reg_by_id(&self, id: u32) -> EmitResult<&VirtReg<'z>> {
        if id < VIRT_ID_BASE {
            return Err(EmitError::InvalidArgument);
        }
        self.virt_regs
            .get(virt_id_to_index(id) as usize)
            .ok_or(EmitError::InvalidArgument)
    }

    pub fn virt_reg_by_reg(&self, reg: Reg) -> EmitResult<&VirtReg<'z>> {
        self.virt_reg_by_id(reg.id())
    }

    pub fn virt_reg_mut_by_id(&mut self, id: u32) -> EmitResult<&mut VirtReg<'z>> {
        if id < VIRT_ID_BASE {
            return Err(EmitError::InvalidArgument);
        }
        self.virt_regs
            .get_mut(virt_id_to_index(id) as usize)
            .ok_or(EmitError::InvalidArgument)
    }

    /// Creates a virtual register of an explicit register class.
    pub fn new_virt_reg(
        &mut self,
        type_id: TypeId,
        ty: RegType,
        name: Option<&str>,
    ) -> EmitResult<Reg> {
        let (zone, gp_size) = {
            let code = match self.b.code() {
                Some(code) => code,
                None => return Err(EmitError::NotInitialized),
            };
            (code.zone(), code.arch().gp_size())
        };
        let index = self.virt_regs.len() as u32;
        if index >= u32::MAX - VIRT_ID_BASE {
            return Err(EmitError::OutOfMemory);
        }
        let virt_size = match type_id.deabstract(gp_size).size() {
            0 => ty.size(),
            size => size.min(ty.size()),
        };
        let id = virt_index_to_id(index);
        self.virt_regs.push(VirtReg {
            id,
            ty,
            virt_size,
            alignment: virt_size.clamp(1, 64) as u8,
            type_id,
            weight: 1,
            is_fixed: false,
            is_stack: false,
            name: name.map(|n| {
                let interned: &'z str = zone.alloc_str(n);
                interned
            }),
            work_id: INVALID_ID,
        });
        Ok(Reg::new(ty, id))
    }

    /// Creates a virtual register whose class is derived from `type_id`.
    pub fn new_reg(&mut self, type_id: TypeId, name: Option<&str>) -> EmitResult<Reg> {
        let arch = match self.b.arch() {
            Some(arch) => arch,
            None => return Err(EmitError::NotInitialized),
        };
        let ty = reg_type_for(type_id, arch)?;
        self.new_virt_reg(type_id, ty, name)
    }

    /// Renames a virtual register; display-only, never changes semantics.
    pub fn rename(&mut self, reg: Reg, name: &str) -> EmitResult<()> {
        let zone = match self.b.code() {
            Some(code) => code.zone(),
            None => return Err(EmitError::NotInitialized),
        };
        let interned: &str = zone.alloc_str(name);
        let entry = self.virt_reg_mut_by_id(reg.id())?;
        entry.name = Some(interned);
        Ok(())
    }

    /// Creates a virtual stack slot addressed through a virtual base id.
    pub fn new_stack(&mut self, size: u32, alignment: u32, name: Option<&str>) -> EmitResult<Mem> {
        if size == 0 || alignment == 0 || !alignment.is_power_of_two() || alignment > 64 {
            return Err(EmitError::InvalidArgument);
        }
        let arch = match self.b.arch() {
            Some(arch) => arch,
            None => return Err(EmitError::NotInitialized),
        };
        let ty = if arch.is_64bit() { RegType::Gp64 } else { RegType::Gp32 };
        let reg = self.new_virt_reg(TypeId::UIntPtr, ty, name)?;
        let entry = self.virt_reg_mut_by_id(reg.id())?;
        entry.is_stack = true;
        entry.virt_size = size;
        entry.alignment = alignment as u8;
        Ok(Mem::base_disp(reg, 0))
    }

    /// Adds a constant to the local or global pool and returns a memory
    /// operand addressing it.
    pub fn new_const(&mut self, scope: ConstScope, data: &[u8]) -> EmitResult<Mem> {
        if self.b.code().is_none() {
            return Err(EmitError::NotInitialized);
        }
        if matches!(scope, ConstScope::Local) && self.func.is_none() {
            return Err(EmitError::FuncNotStarted);
        }
        let node = self.pool_node(scope)?;
        let (label, offset) = {
            let node = self.b.node_mut(node)?;
            match node.kind_mut() {
                NodeKind::ConstPool { label, pool } => {
                    let label = *label;
                    let offset = pool.add(data)?;
                    (label, offset)
                }
                _ => return Err(EmitError::InvalidState),
            }
        };
        Ok(Mem::label_disp(label, offset as i32).size(data.len() as u32))
    }

    fn pool_node(&mut self, scope: ConstScope) -> EmitResult<NodeId> {
        let slot = match scope {
            ConstScope::Local => self.local_pool,
            ConstScope::Global => self.global_pool,
        };
        if let Some(node) = slot {
            return Ok(node);
        }
        let label = self.b.new_label()?;
        let node = self
            .b
            .new_detached_node(NodeKind::ConstPool { label, pool: ConstPool::new() });
        match scope {
            ConstScope::Local => self.local_pool = Some(node),
            ConstScope::Global => self.global_pool = Some(node),
        }
        Ok(node)
    }

    // ── Functions ─────────────────────────────────────────────────────

    /// The currently open function node.
    pub fn func(&self) -> Option<NodeId> {
        self.func
    }

    pub fn func_data(&self, node: NodeId) -> EmitResult<&FuncData> {
        match self.b.node(node)?.kind() {
            NodeKind::Func(data) => Ok(data),
            _ => Err(EmitError::InvalidArgument),
        }
    }

    pub fn func_data_mut(&mut self, node: NodeId) -> EmitResult<&mut FuncData> {
        match self.b.node_mut(node)?.kind_mut() {
            NodeKind::Func(data) => Ok(data),
            _ => Err(EmitError::InvalidArgument),
        }
    }

    /// Opens a function: creates its node, entry and exit labels, and
    /// computes argument locations from `signature`.
    pub fn new_func(&mut self, signature: &FuncSignature) -> EmitResult<NodeId> {
        if self.func.is_some() {
            return Err(EmitError::InvalidState);
        }
        let arch = match self.b.arch() {
            Some(arch) => arch,
            None => return Err(EmitError::NotInitialized),
        };
        let detail = FuncDetail::init(signature, arch)?;
        let entry = self.b.new_label()?;
        let exit = self.b.new_label()?;
        let args = vec![None; detail.arg_count()];
        let node = self
            .b
            .add_node(NodeKind::Func(FuncData { entry, exit, detail, args, end: None }));
        self.func = Some(node);
        log::debug!("function opened (node #{node}, {} args)", signature.arg_count());
        Ok(node)
    }

    /// Closes the current function: binds the exit label, flushes the local
    /// constant pool and places the end sentinel.
    pub fn end_func(&mut self) -> EmitResult<()> {
        let func = match self.func.take() {
            Some(func) => func,
            None => return Err(EmitError::FuncNotStarted),
        };
        let exit = self.func_data(func)?.exit;
        self.b.bind(exit)?;
        if let Some(pool) = self.local_pool.take() {
            self.b.link_after(pool, None);
        }
        let end = self.b.add_node(NodeKind::Sentinel { kind: SentinelKind::FuncEnd });
        self.func_data_mut(func)?.end = Some(end);
        Ok(())
    }

    /// Binds a virtual register to the function's `index`-th argument.
    pub fn set_arg(&mut self, index: usize, reg: Reg) -> EmitResult<()> {
        let func = match self.func {
            Some(func) => func,
            None => return Err(EmitError::FuncNotStarted),
        };
        if !self.is_virt_reg_valid(reg) {
            return Err(EmitError::InvalidArgument);
        }
        let data = self.func_data_mut(func)?;
        if index >= data.args.len() {
            return Err(EmitError::InvalidArgument);
        }
        data.args[index] = Some(virt_id_to_index(reg.id()));
        Ok(())
    }

    /// Records a function return carrying up to two values.
    pub fn add_ret(&mut self, ret0: Operand, ret1: Operand) -> EmitResult<()> {
        if self.func.is_none() {
            return Err(EmitError::FuncNotStarted);
        }
        self.b.add_node(NodeKind::FuncRet { ops: [ret0, ret1] });
        Ok(())
    }

    // ── Invocations ───────────────────────────────────────────────────

    /// Records a call to `target` with the given signature.
    pub fn new_invoke(
        &mut self,
        inst_id: InstId,
        target: Operand,
        signature: &FuncSignature,
    ) -> EmitResult<NodeId> {
        let arch = match self.b.arch() {
            Some(arch) => arch,
            None => return Err(EmitError::NotInitialized),
        };
        let detail = FuncDetail::init(signature, arch)?;
        let args = vec![Operand::None; detail.arg_count()];
        let node = self.b.add_node(NodeKind::Invoke(InvokeData {
            inst_id,
            target,
            detail,
            rets: [Operand::None, Operand::None],
            args,
        }));
        Ok(node)
    }

    pub fn invoke_data(&self, node: NodeId) -> EmitResult<&InvokeData> {
        match self.b.node(node)?.kind() {
            NodeKind::Invoke(data) => Ok(data),
            _ => Err(EmitError::InvalidArgument),
        }
    }

    pub fn invoke_data_mut(&mut self, node: NodeId) -> EmitResult<&mut InvokeData> {
        match self.b.node_mut(node)?.kind_mut() {
            NodeKind::Invoke(data) => Ok(data),
            _ => Err(EmitError::InvalidArgument),
        }
    }

    /// Sets the `index`-th argument operand of an invocation.
    pub fn set_invoke_arg(&mut self, node: NodeId, index: usize, op: Operand) -> EmitResult<()> {
        let data = self.invoke_data_mut(node)?;
        if index >= data.args.len() {
            return Err(EmitError::InvalidArgument);
        }
        data.args[index] = op;
        Ok(())
    }

    /// Sets an invocation return operand (index 0 or 1).
    pub fn set_invoke_ret(&mut self, node: NodeId, index: usize, op: Operand) -> EmitResult<()> {
        let data = self.invoke_data_mut(node)?;
        if index >= data.rets.len() {
            return Err(EmitError::InvalidArgument);
        }
        data.rets[index] = op;
        Ok(())
    }

    // ── Jump annotations ──────────────────────────────────────────────

    /// Creates an annotation aggregating the possible targets of an
    /// indirect jump.
    pub fn new_jump_annotation(&mut self) -> u32 {
        let id = self.annotations.len() as u32;
        self.annotations.push(JumpAnnotation { id, labels: Vec::new() });
        id
    }

    pub fn jump_annotation(&self, id: u32) -> EmitResult<&JumpAnnotation> {
        self.annotations
            .get(id as usize)
            .ok_or(EmitError::InvalidArgument)
    }

    pub fn jump_annotation_mut(&mut self, id: u32) -> EmitResult<&mut JumpAnnotation> {
        self.annotations
            .get_mut(id as usize)
            .ok_or(EmitError::InvalidArgument)
    }

    pub fn jump_annotations(&self) -> &[JumpAnnotation] {
        &self.annotations
    }

    /// Emits an indirect jump carrying an annotation of candidate targets.
    pub fn emit_annotated_jump(
        &mut self,
        inst_id: InstId,
        target: Operand,
        annotation: u32,
    ) -> EmitResult<()> {
        if (annotation as usize) >= self.annotations.len() {
            return Err(EmitError::InvalidArgument);
        }
        if self.b.code().is_none() {
            return Err(EmitError::NotInitialized);
        }
        let options = {
            let core = self.b.core_mut();
            let (options, _, _) = core.take_inst_state();
            options
        };
        self.b.add_node(NodeKind::Jump {
            id: inst_id,
            options,
            target,
            annotation: Some(annotation),
        });
        Ok(())
    }

    // ── Deprecated compatibility shims ────────────────────────────────

    /// No-op kept so legacy streams that request explicit allocation still
    /// serialize.
    #[deprecated(note = "register allocation is an external pass; this has no effect")]
    pub fn alloc(&mut self, _reg: Reg) {}

    /// No-op kept so legacy streams that request explicit spills still
    /// serialize.
    #[deprecated(note = "register allocation is an external pass; this has no effect")]
    pub fn spill(&mut self, _reg: Reg) {}

    // ── Finalization ──────────────────────────────────────────────────

    /// Flushes the global constant pool and replays the node stream
    /// through an internal assembler. All operands must be physical by
    /// now; an unallocated virtual register fails the serialization.
    pub fn finalize(&mut self) -> EmitResult<()> {
        if self.func.is_some() {
            return Err(EmitError::InvalidState);
        }
        if let Some(pool) = self.global_pool.take() {
            self.b.link_after(pool, None);
        }
        self.b.finalize()
    }
}

impl Emitter for Compiler<'_, '_> {
    fn kind(&self) -> EmitterKind {
        EmitterKind::Compiler
    }

    fn is_attached(&self) -> bool {
        self.b.is_attached()
    }

    fn arch(&self) -> Option<ArchInfo> {
        self.b.arch()
    }

    fn emitter_options(&self) -> EmitterOptions {
        self.b.emitter_options()
    }

    fn add_emitter_options(&mut self, options: EmitterOptions) {
        self.b.add_emitter_options(options);
    }

    fn clear_emitter_options(&mut self, options: EmitterOptions) {
        self.b.clear_emitter_options(options);
    }

    fn new_label(&mut self) -> EmitResult<Label> {
        self.b.new_label()
    }

    fn new_named_label(
        &mut self,
        name: &str,
        kind: LabelKind,
        parent: Option<Label>,
    ) -> EmitResult<Label> {
        self.b.new_named_label(name, kind, parent)
    }

    fn label_by_name(&self, name: &str, parent: Option<Label>) -> Label {
        self.b.label_by_name(name, parent)
    }

    fn bind(&mut self, label: Label) -> EmitResult<()> {
        self.b.bind(label)
    }

    fn section(&mut self, section: SectionId) -> EmitResult<()> {
        self.b.section(section)
    }

    fn emit(&mut self, inst: InstId, ops: &[Operand]) -> EmitResult<()> {
        self.b.emit(inst, ops)
    }

    fn align(&mut self, mode: AlignMode, alignment: u32) -> EmitResult<()> {
        self.b.align(mode, alignment)
    }

    fn embed(&mut self, data: &[u8]) -> EmitResult<()> {
        self.b.embed(data)
    }

    fn embed_data_array(
        &mut self,
        type_id: TypeId,
        data: &[u8],
        item_count: usize,
        repeat_count: usize,
    ) -> EmitResult<()> {
        self.b.embed_data_array(type_id, data, item_count, repeat_count)
    }

    fn embed_const_pool(&mut self, label: Label, pool: &ConstPool) -> EmitResult<()> {
        self.b.embed_const_pool(label, pool)
    }

    fn embed_label(&mut self, label: Label) -> EmitResult<()> {
        self.b.embed_label(label)
    }

    fn embed_label_delta(&mut self, label: Label, base: Label, size: usize) -> EmitResult<()> {
        self.b.embed_label_delta(label, base, size)
    }

    fn comment(&mut self, text: &str) -> EmitResult<()> {
        self.b.comment(text)
    }

    fn report_error(&mut self, err: EmitError) -> EmitError {
        self.b.report_error(err)
    }

    fn set_inst_options(&mut self, options: InstOptions) {
        self.b.set_inst_options(options);
    }

    fn set_extra_reg(&mut self, reg: Reg) {
        self.b.set_extra_reg(reg);
    }

    fn set_inline_comment(&mut self, text: &str) -> EmitResult<()> {
        self.b.set_inline_comment(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::arch::ArchId;
    use crate::core::func::CallConv;
    use crate::core::holder::CodeInfo;
    use bumpalo::Bump;

    fn holder(zone: &Bump) -> CodeHolder<'_> {
        let mut code = CodeHolder::new(zone);
        code.init(CodeInfo::new(ArchInfo::new(ArchId::X64, 0))).unwrap();
        code
    }

    #[test]
    fn test_virt_reg_identity() {
        let zone = Bump::new();
        let mut code = holder(&zone);
        let mut cc = Compiler::new(&mut code).unwrap();
        let a = cc.new_reg(TypeId::I64, Some("a")).unwrap();
        let b = cc.new_reg(TypeId::I32, None).unwrap();
        assert_eq!(a.id(), VIRT_ID_BASE);
        assert_eq!(b.id(), VIRT_ID_BASE + 1);
        assert!(a.is_virtual());
        let entry = cc.virt_reg_by_id(a.id()).unwrap();
        assert_eq!(entry.id(), a.id());
        assert_eq!(entry.name(), Some("a"));
        assert_eq!(entry.reg_type(), RegType::Gp64);
        assert_eq!(entry.virt_size(), 8);
        let entry_b = cc.virt_reg_by_reg(b).unwrap();
        assert_eq!(entry_b.reg_type(), RegType::Gp32);
    }

    #[test]
    fn test_virt_reg_float_class() {
        let zone = Bump::new();
        let mut code = holder(&zone);
        let mut cc = Compiler::new(&mut code).unwrap();
        let f = cc.new_reg(TypeId::F64, None).unwrap();
        let entry = cc.virt_reg_by_reg(f).unwrap();
        assert_eq!(entry.reg_type(), RegType::Xmm);
        assert_eq!(entry.virt_size(), 8);
        assert_eq!(entry.reg_size(), 16);
    }

    #[test]
    fn test_clear_invalidates_virt_ids() {
        let zone = Bump::new();
        let mut code = holder(&zone);
        let mut cc = Compiler::new(&mut code).unwrap();
        let a = cc.new_reg(TypeId::I64, None).unwrap();
        cc.clear();
        assert!(cc.virt_reg_by_id(a.id()).is_err());
        assert_eq!(cc.virt_reg_count(), 0);
        let b = cc.new_reg(TypeId::I64, None).unwrap();
        assert_eq!(b.id(), VIRT_ID_BASE);
    }

    #[test]
    fn test_func_lifecycle() {
        let zone = Bump::new();
        let mut code = holder(&zone);
        let mut cc = Compiler::new(&mut code).unwrap();
        assert_eq!(cc.end_func(), Err(EmitError::FuncNotStarted));

        let sig = FuncSignature::new(CallConv::SysV64, TypeId::I32, &[TypeId::I32, TypeId::I32]);
        let func = cc.new_func(&sig).unwrap();
        let x = cc.new_reg(TypeId::I32, None).unwrap();
        cc.set_arg(0, x).unwrap();
        assert_eq!(cc.set_arg(5, x), Err(EmitError::InvalidArgument));
        cc.add_ret(Operand::Reg(x), Operand::None).unwrap();
        cc.end_func().unwrap();

        let data = cc.func_data(func).unwrap();
        assert_eq!(data.args[0], Some(0));
        assert!(data.args[1].is_none());
        assert!(data.end.is_some());
        assert_eq!(cc.end_func(), Err(EmitError::FuncNotStarted));
    }

    #[test]
    fn test_nested_func_rejected() {
        let zone = Bump::new();
        let mut code = holder(&zone);
        let mut cc = Compiler::new(&mut code).unwrap();
        let sig = FuncSignature::new(CallConv::SysV64, TypeId::Void, &[]);
        cc.new_func(&sig).unwrap();
        assert_eq!(cc.new_func(&sig), Err(EmitError::InvalidState));
    }

    #[test]
    fn test_invoke_slots() {
        let zone = Bump::new();
        let mut code = holder(&zone);
        let mut cc = Compiler::new(&mut code).unwrap();
        let sig = FuncSignature::new(CallConv::SysV64, TypeId::I64, &[TypeId::I64]);
        let target = cc.new_reg(TypeId::I64, None).unwrap();
        let node = cc.new_invoke(1, Operand::Reg(target), &sig).unwrap();
        let arg = cc.new_reg(TypeId::I64, None).unwrap();
        cc.set_invoke_arg(node, 0, Operand::Reg(arg)).unwrap();
        let ret = cc.new_reg(TypeId::I64, None).unwrap();
        cc.set_invoke_ret(node, 0, Operand::Reg(ret)).unwrap();
        assert_eq!(
            cc.set_invoke_arg(node, 3, Operand::None),
            Err(EmitError::InvalidArgument)
        );
        let data = cc.invoke_data(node).unwrap();
        assert_eq!(data.args.len(), 1);
        assert!(data.rets[0].is_reg());
        assert!(data.rets[1].is_none());
    }

    #[test]
    fn test_jump_annotation() {
        let zone = Bump::new();
        let mut code = holder(&zone);
        let mut cc = Compiler::new(&mut code).unwrap();
        let ann = cc.new_jump_annotation();
        let l1 = cc.new_label().unwrap();
        let l2 = cc.new_label().unwrap();
        cc.jump_annotation_mut(ann).unwrap().add_label(l1);
        cc.jump_annotation_mut(ann).unwrap().add_label(l2);
        cc.jump_annotation_mut(ann).unwrap().add_label(l1);
        assert_eq!(cc.jump_annotation(ann).unwrap().label_ids().len(), 2);
        let target = cc.new_reg(TypeId::I64, None).unwrap();
        cc.emit_annotated_jump(1, Operand::Reg(target), ann).unwrap();
        assert_eq!(
            cc.emit_annotated_jump(1, Operand::Reg(target), 99),
            Err(EmitError::InvalidArgument)
        );
    }

    #[test]
    fn test_local_const_requires_func() {
        let zone = Bump::new();
        let mut code = holder(&zone);
        let mut cc = Compiler::new(&mut code).unwrap();
        assert_eq!(
            cc.new_const(ConstScope::Local, &1u32.to_le_bytes()),
            Err(EmitError::FuncNotStarted)
        );
        let mem = cc.new_const(ConstScope::Global, &1u32.to_le_bytes()).unwrap();
        assert!(mem.base_label().is_some());
        assert_eq!(mem.size_hint(), 4);
    }

    #[test]
    fn test_new_stack() {
        let zone = Bump::new();
        let mut code = holder(&zone);
        let mut cc = Compiler::new(&mut code).unwrap();
        let slot = cc.new_stack(24, 8, Some("frame")).unwrap();
        let base = slot.base_reg().unwrap();
        let entry = cc.virt_reg_by_id(base).unwrap();
        assert!(entry.is_stack());
        assert_eq!(entry.virt_size(), 24);
        assert_eq!(entry.alignment(), 8);
        assert_eq!(cc.new_stack(0, 8, None), Err(EmitError::InvalidArgument));
        assert_eq!(cc.new_stack(8, 3, None), Err(EmitError::InvalidArgument));
    }
}
