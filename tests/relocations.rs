//! Cross-section references, expression deltas and the flatten →
//! resolve → relocate pipeline.

use bumpalo::Bump;
use jitforge::x64::{self, Inst};
use jitforge::{
    Assembler, ArchId, ArchInfo, CodeHolder, CodeInfo, EmitError, Emitter, RelocKind,
    SectionFlags,
};

fn new_holder(zone: &Bump) -> CodeHolder<'_> {
    let mut code = CodeHolder::new(zone);
    code.init(CodeInfo::new(ArchInfo::new(ArchId::X64, 0))).unwrap();
    code
}

#[test]
fn cross_section_rip_reference() {
    let zone = Bump::new();
    let mut code = new_holder(&zone);
    let data = code.new_section(".data", SectionFlags::NONE, 8).unwrap();
    {
        let mut a = Assembler::new(&mut code).unwrap();
        let l_data = a.new_label().unwrap();
        a.emit(Inst::Lea.id(), &[x64::rsi.into(), x64::label_ptr(l_data).into()])
            .unwrap();
        a.section(data).unwrap();
        a.bind(l_data).unwrap();
        a.embed(&[0x01]).unwrap();
    }

    // The reference is queued until layout exists.
    assert_eq!(code.unresolved_link_count(), 1);
    code.flatten().unwrap();
    let data_offset = code.section(data).unwrap().offset();
    assert_eq!(data_offset % 8, 0);
    assert!(data_offset >= code.text_section().buffer_size() as u64);

    code.resolve_unresolved_links().unwrap();
    assert_eq!(code.unresolved_link_count(), 0);
    code.relocate_to(0x40_0000).unwrap();

    // lea rsi, [rip+disp32]: 7 bytes, slot at 3; .data lands at offset 8,
    // so the displacement is 8 - 7 = 1.
    assert_eq!(
        code.text_section().buffer().as_slice(),
        &[0x48, 0x8D, 0x35, 0x01, 0x00, 0x00, 0x00]
    );
}

#[test]
fn label_mem_with_displacement_folds_addend() {
    let zone = Bump::new();
    let mut code = new_holder(&zone);
    {
        let mut a = Assembler::new(&mut code).unwrap();
        let table = a.new_label().unwrap();
        a.emit(
            Inst::Lea.id(),
            &[x64::rax.into(), x64::label_ptr(table).disp(16).into()],
        )
        .unwrap();
        a.emit(Inst::Ret.id(), &[]).unwrap();
        a.bind(table).unwrap();
    }
    // Target is offset 8 (+16 addend); slot ends at 7 → 8 + 16 - 7 = 17.
    assert_eq!(
        &code.text_section().buffer().as_slice()[3..7],
        &[0x11, 0x00, 0x00, 0x00]
    );
}

#[test]
fn expression_delta_across_sections() {
    let zone = Bump::new();
    let mut code = new_holder(&zone);
    let data = code.new_section(".data", SectionFlags::NONE, 16).unwrap();
    {
        let mut a = Assembler::new(&mut code).unwrap();
        let a_label = a.new_label().unwrap();
        let b_label = a.new_label().unwrap();
        a.bind(b_label).unwrap();
        a.embed_label_delta(a_label, b_label, 4).unwrap();
        a.section(data).unwrap();
        a.embed(&[0u8; 4]).unwrap();
        a.bind(a_label).unwrap();
    }
    assert_eq!(code.reloc_count(), 1);
    assert_eq!(
        code.reloc_entries().next().unwrap().kind(),
        RelocKind::Expression
    );

    code.flatten().unwrap();
    code.resolve_unresolved_links().unwrap();
    code.relocate_to(0x1000).unwrap();

    // A = base + 16 + 4, B = base + 0 → 20, independent of the base.
    assert_eq!(
        code.text_section().buffer().as_slice(),
        &[0x14, 0x00, 0x00, 0x00]
    );
}

#[test]
fn expression_delta_overflow() {
    let zone = Bump::new();
    let mut code = new_holder(&zone);
    let data = code.new_section(".data", SectionFlags::NONE, 512).unwrap();
    {
        let mut a = Assembler::new(&mut code).unwrap();
        let a_label = a.new_label().unwrap();
        let b_label = a.new_label().unwrap();
        a.bind(b_label).unwrap();
        a.embed_label_delta(a_label, b_label, 1).unwrap();
        a.section(data).unwrap();
        a.bind(a_label).unwrap();
        a.embed(&[0]).unwrap();
    }
    code.flatten().unwrap();
    // .data is 512-aligned, so the delta cannot fit one byte.
    assert_eq!(code.relocate_to(0), Err(EmitError::RelocationOverflow));
}

#[test]
fn embed_label_emits_absolute_address() {
    let zone = Bump::new();
    let mut code = new_holder(&zone);
    {
        let mut a = Assembler::new(&mut code).unwrap();
        let target = a.new_label().unwrap();
        a.embed_label(target).unwrap();
        a.bind(target).unwrap();
        a.emit(Inst::Ret.id(), &[]).unwrap();
    }
    assert_eq!(code.text_section().buffer_size(), 9);
    assert_eq!(code.reloc_count(), 1);
    let re = code.reloc_entries().next().unwrap();
    assert_eq!(re.kind(), RelocKind::RelToAbs);
    assert_eq!(re.size(), 8);

    code.flatten().unwrap();
    code.relocate_to(0x40_0000).unwrap();
    assert_eq!(
        code.text_section().buffer().read_value_le(0, 8).unwrap(),
        0x40_0008
    );
}

#[test]
fn embed_label_bound_first_still_relocates() {
    let zone = Bump::new();
    let mut code = new_holder(&zone);
    {
        let mut a = Assembler::new(&mut code).unwrap();
        let target = a.new_label().unwrap();
        a.bind(target).unwrap();
        a.emit(Inst::Nop.id(), &[]).unwrap();
        a.embed_label(target).unwrap();
    }
    // The placeholder stays zero until relocation.
    assert_eq!(
        code.text_section().buffer().read_value_le(1, 8).unwrap(),
        0
    );
    code.flatten().unwrap();
    code.relocate_to(0x1000).unwrap();
    assert_eq!(
        code.text_section().buffer().read_value_le(1, 8).unwrap(),
        0x1000
    );
}

#[test]
fn narrow_slot_overflows_at_relocate_time() {
    let zone = Bump::new();
    let mut code = new_holder(&zone);
    {
        let mut a = Assembler::new(&mut code).unwrap();
        a.embed(&[0u8; 4]).unwrap();
    }
    // A 4-byte absolute slot cannot hold an address at or above 2^32.
    let reloc = code.new_reloc_entry(RelocKind::RelToAbs, 4).unwrap();
    {
        let re = code.reloc_mut(reloc).unwrap();
        re.set_source(0, 0);
        re.set_target(0, 0);
    }
    code.flatten().unwrap();
    assert_eq!(
        code.relocate_to(0x1_0000_0000),
        Err(EmitError::RelocationOverflow)
    );
    code.relocate_to(0x1000).unwrap();
    assert_eq!(
        code.text_section().buffer().read_value_le(0, 4).unwrap(),
        0x1000
    );
}

#[test]
fn relocate_with_unbound_label_fails() {
    let zone = Bump::new();
    let mut code = new_holder(&zone);
    {
        let mut a = Assembler::new(&mut code).unwrap();
        let never = a.new_label().unwrap();
        a.emit(Inst::Jmp.id(), &[never.into()]).unwrap();
    }
    assert_eq!(code.unresolved_link_count(), 1);
    code.flatten().unwrap();
    assert_eq!(code.relocate_to(0), Err(EmitError::UnresolvedLabel));
}
