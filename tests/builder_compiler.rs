//! Builder round-trips and the compiler substrate: recorded node streams
//! must serialize to the same bytes a direct assembler produces, and
//! virtual-register streams must serialize once operands are rewritten to
//! physical registers.

use bumpalo::Bump;
use jitforge::x64::{self, Inst};
use jitforge::{
    imm, ArchId, ArchInfo, Assembler, Builder, CallConv, CodeHolder, CodeInfo, Compiler,
    ConstScope, EmitError, Emitter, FuncSignature, NodeKind, Operand, TypeId,
};

fn new_holder(zone: &Bump) -> CodeHolder<'_> {
    let mut code = CodeHolder::new(zone);
    code.init(CodeInfo::new(ArchInfo::new(ArchId::X64, 0))).unwrap();
    code
}

/// The instruction sequence used for the round-trip comparison.
fn emit_sequence<E: Emitter>(e: &mut E) {
    let loop_top = e.new_label().unwrap();
    e.emit(Inst::Mov.id(), &[x64::ecx.into(), imm(10).into()]).unwrap();
    e.bind(loop_top).unwrap();
    e.emit(Inst::Add.id(), &[x64::eax.into(), x64::ecx.into()]).unwrap();
    e.emit(Inst::Dec.id(), &[x64::ecx.into()]).unwrap();
    e.emit(Inst::Jne.id(), &[loop_top.into()]).unwrap();
    e.embed_u32(0xDEAD_BEEF, 1).unwrap();
    e.emit(Inst::Ret.id(), &[]).unwrap();
}

#[test]
fn builder_round_trip_matches_direct_assembly() {
    let zone_direct = Bump::new();
    let mut direct = new_holder(&zone_direct);
    {
        let mut a = Assembler::new(&mut direct).unwrap();
        emit_sequence(&mut a);
    }

    let zone_deferred = Bump::new();
    let mut deferred = new_holder(&zone_deferred);
    {
        let mut b = Builder::new(&mut deferred).unwrap();
        emit_sequence(&mut b);
        // Nothing reaches the buffer until the stream is serialized.
        assert_eq!(b.code().unwrap().text_section().buffer_size(), 0);
        b.finalize().unwrap();
    }

    assert_eq!(
        direct.text_section().buffer().as_slice(),
        deferred.text_section().buffer().as_slice()
    );
}

#[test]
fn builder_pass_can_rewrite_the_stream() {
    let zone = Bump::new();
    let mut code = new_holder(&zone);
    let mut b = Builder::new(&mut code).unwrap();
    b.emit(Inst::Nop.id(), &[]).unwrap();
    b.emit(Inst::Nop.id(), &[]).unwrap();
    b.emit(Inst::Ret.id(), &[]).unwrap();

    // A dead-code pass: drop every nop.
    let ids: Vec<_> = b.node_ids().collect();
    for id in ids {
        if matches!(b.node(id).unwrap().kind(), NodeKind::Inst { id, .. } if *id == Inst::Nop.id())
        {
            b.remove_node(id).unwrap();
        }
    }
    b.finalize().unwrap();
    assert_eq!(b.code().unwrap().text_section().buffer().as_slice(), &[0xC3]);
}

#[test]
fn compiler_serializes_after_operand_rewrite() {
    let zone = Bump::new();
    let mut code = new_holder(&zone);
    let mut cc = Compiler::new(&mut code).unwrap();

    let sig = FuncSignature::new(CallConv::SysV64, TypeId::I32, &[TypeId::I32, TypeId::I32]);
    let func = cc.new_func(&sig).unwrap();
    let lhs = cc.new_reg(TypeId::I32, Some("lhs")).unwrap();
    let rhs = cc.new_reg(TypeId::I32, Some("rhs")).unwrap();
    cc.set_arg(0, lhs).unwrap();
    cc.set_arg(1, rhs).unwrap();
    cc.emit(Inst::Add.id(), &[lhs.into(), rhs.into()]).unwrap();
    cc.add_ret(Operand::Reg(lhs), Operand::None).unwrap();
    cc.end_func().unwrap();

    // The argument locations computed for the signature drive the rewrite.
    let detail = &cc.func_data(func).unwrap().detail;
    let arg0 = detail.arg(0).reg().unwrap();
    let arg1 = detail.arg(1).reg().unwrap();
    assert_eq!(arg0, x64::edi);
    assert_eq!(arg1, x64::esi);

    // Stand-in for the register allocator: map each virtual register onto
    // its argument home, in place on the node graph.
    let assignment = [(lhs.id(), arg0), (rhs.id(), arg1)];
    let ids: Vec<_> = cc.builder().node_ids().collect();
    for id in ids {
        let node = cc.builder_mut().node_mut(id).unwrap();
        if let NodeKind::Inst { ops, .. } = node.kind_mut() {
            for op in ops.as_mut_slice() {
                if let Operand::Reg(reg) = op {
                    if let Some((_, phys)) =
                        assignment.iter().find(|(virt, _)| *virt == reg.id())
                    {
                        *op = Operand::Reg(*phys);
                    }
                }
            }
        }
        if let NodeKind::FuncRet { ops } = cc.builder_mut().node_mut(id).unwrap().kind_mut() {
            ops[0] = Operand::Reg(arg0);
        }
    }

    cc.finalize().unwrap();
    // add edi, esi ; ret
    assert_eq!(
        cc.code().unwrap().text_section().buffer().as_slice(),
        &[0x01, 0xF7, 0xC3]
    );
}

#[test]
fn unallocated_virtual_register_fails_serialization() {
    let zone = Bump::new();
    let mut code = new_holder(&zone);
    let mut cc = Compiler::new(&mut code).unwrap();
    let v = cc.new_reg(TypeId::I64, None).unwrap();
    cc.emit(Inst::Mov.id(), &[v.into(), imm(1).into()]).unwrap();
    assert_eq!(cc.finalize(), Err(EmitError::InvalidInstruction));
}

#[test]
fn finalize_with_open_function_fails() {
    let zone = Bump::new();
    let mut code = new_holder(&zone);
    let mut cc = Compiler::new(&mut code).unwrap();
    let sig = FuncSignature::new(CallConv::SysV64, TypeId::Void, &[]);
    cc.new_func(&sig).unwrap();
    assert_eq!(cc.finalize(), Err(EmitError::InvalidState));
}

#[test]
fn global_const_pool_flushes_at_finalize() {
    let zone = Bump::new();
    let mut code = new_holder(&zone);
    let mut cc = Compiler::new(&mut code).unwrap();
    let mem = cc
        .new_const(ConstScope::Global, &0x4041_4243u32.to_le_bytes())
        .unwrap();
    let pool_label = mem.base_label().unwrap();
    cc.emit(Inst::Ret.id(), &[]).unwrap();
    cc.finalize().unwrap();

    let holder = cc.code().unwrap();
    // ret, then the pool aligned to 4.
    assert_eq!(
        holder.text_section().buffer().as_slice(),
        &[0xC3, 0x00, 0x00, 0x00, 0x43, 0x42, 0x41, 0x40]
    );
    assert_eq!(holder.label_offset(pool_label), 4);
}

#[test]
fn local_const_pool_flushes_at_end_func() {
    let zone = Bump::new();
    let mut code = new_holder(&zone);
    let mut cc = Compiler::new(&mut code).unwrap();
    let sig = FuncSignature::new(CallConv::SysV64, TypeId::Void, &[]);
    cc.new_func(&sig).unwrap();
    let mem = cc
        .new_const(ConstScope::Local, &7u64.to_le_bytes())
        .unwrap();
    assert_eq!(mem.size_hint(), 8);
    cc.emit(Inst::Ret.id(), &[]).unwrap();
    cc.end_func().unwrap();
    cc.finalize().unwrap();

    let holder = cc.code().unwrap();
    // ret at 0, pool starts aligned at 8.
    assert_eq!(holder.text_section().buffer_size(), 16);
    assert_eq!(
        &holder.text_section().buffer().as_slice()[8..16],
        &7u64.to_le_bytes()
    );
}

#[test]
fn serialize_into_separate_holder() {
    // Record against one holder, then replay against another with the same
    // label ids.
    let zone_record = Bump::new();
    let mut record = new_holder(&zone_record);
    let mut b = Builder::new(&mut record).unwrap();
    let l = b.new_label().unwrap();
    b.emit(Inst::Jmp.id(), &[l.into()]).unwrap();
    b.bind(l).unwrap();
    b.emit(Inst::Ret.id(), &[]).unwrap();
    b.detach().unwrap();

    let zone_replay = Bump::new();
    let mut replay = new_holder(&zone_replay);
    {
        let mut a = Assembler::new(&mut replay).unwrap();
        a.new_label().unwrap();
        b.serialize_into(&mut a).unwrap();
    }
    assert_eq!(
        replay.text_section().buffer().as_slice(),
        &[0xE9, 0x00, 0x00, 0x00, 0x00, 0xC3]
    );
}
