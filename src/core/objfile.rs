//! Relocatable ELF export built on the `object` crate.
//!
//! Bridges a populated [`CodeHolder`] into a linkable object: sections map
//! one to one, bound named labels become symbols (global labels with
//! linkage scope, the rest compilation-local) and outstanding address
//! relocations become ELF relocations against section symbols. Call after
//! emission; the holder does not need to be flattened or relocated.

use object::write::{Object, Relocation, Symbol, SymbolSection};
use object::{
    Architecture, BinaryFormat, Endianness, RelocationEncoding, RelocationFlags, RelocationKind,
    SectionKind, SymbolFlags, SymbolKind, SymbolScope,
};

use crate::core::arch::ArchId;
use crate::core::error::{EmitError, EmitResult};
use crate::core::holder::{CodeHolder, LabelKind, RelocKind};

/// Serializes the holder into a relocatable ELF object.
///
/// Cross-section displacement links must have been resolved or still
/// pending binds fail with `UnresolvedLabel`. Expression relocations have
/// no ELF equivalent and fail with `InvalidState`.
pub fn write_elf(code: &CodeHolder<'_>) -> EmitResult<Vec<u8>> {
    if !code.is_initialized() {
        return Err(EmitError::NotInitialized);
    }
    if code.unresolved_link_count() != 0 {
        return Err(EmitError::UnresolvedLabel);
    }
    let arch = match code.arch().arch_id() {
        ArchId::X64 => Architecture::X86_64,
        ArchId::Arm64 => Architecture::Aarch64,
        _ => return Err(EmitError::InvalidArgument),
    };

    // Absolute relocations carry base-independent values; apply them to a
    // local copy of the section data up front.
    let mut datas: Vec<Vec<u8>> = code
        .sections()
        .map(|s| s.buffer().as_slice().to_vec())
        .collect();
    for re in code.reloc_entries() {
        if re.kind() == RelocKind::AbsToAbs {
            let data = &mut datas[re.source_section() as usize];
            let offset = re.source_offset() as usize;
            let size = re.size() as usize;
            if offset + size > data.len() {
                return Err(EmitError::InvalidArgument);
            }
            data[offset..offset + size]
                .copy_from_slice(&re.payload().to_le_bytes()[..size]);
        }
    }

    let mut obj = Object::new(BinaryFormat::Elf, arch, Endianness::Little);

    let mut section_ids = Vec::with_capacity(code.section_count());
    for section in code.sections() {
        let kind = if section.is_exec() {
            SectionKind::Text
        } else if section.is_zero_fill() {
            SectionKind::UninitializedData
        } else {
            SectionKind::Data
        };
        let id = obj.add_section(Vec::new(), section.name().as_bytes().to_vec(), kind);
        if section.is_zero_fill() {
            obj.append_section_bss(id, section.buffer_size() as u64, section.alignment() as u64);
        } else {
            obj.append_section_data(
                id,
                &datas[section.id() as usize],
                section.alignment() as u64,
            );
        }
        section_ids.push(id);
    }

    for entry in code.label_entries() {
        let name = match entry.name() {
            Some(name) if entry.is_bound() => name,
            _ => continue,
        };
        let section = code.section(entry.section())?;
        let scope = match entry.kind() {
            LabelKind::Global => SymbolScope::Linkage,
            _ => SymbolScope::Compilation,
        };
        let kind = if section.is_exec() {
            SymbolKind::Text
        } else {
            SymbolKind::Data
        };
        obj.add_symbol(Symbol {
            name: name.as_bytes().to_vec(),
            value: entry.offset(),
            size: 0,
            kind,
            scope,
            weak: false,
            section: SymbolSection::Section(section_ids[entry.section() as usize]),
            flags: SymbolFlags::None,
        });
    }

    for re in code.reloc_entries() {
        match re.kind() {
            RelocKind::AbsToAbs => {}
            RelocKind::RelToAbs => {
                let target = re.target_section().ok_or(EmitError::UnresolvedLabel)?;
                let symbol = obj.section_symbol(section_ids[target as usize]);
                obj.add_relocation(
                    section_ids[re.source_section() as usize],
                    Relocation {
                        offset: re.source_offset(),
                        symbol,
                        addend: re.payload() as i64,
                        flags: RelocationFlags::Generic {
                            kind: RelocationKind::Absolute,
                            encoding: RelocationEncoding::Generic,
                            size: (re.size() * 8) as u8,
                        },
                    },
                )
                .map_err(|_| EmitError::InvalidArgument)?;
            }
            RelocKind::Expression => return Err(EmitError::InvalidState),
        }
    }

    obj.write().map_err(|_| EmitError::OutOfMemory)
}
