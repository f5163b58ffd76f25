//! Scalar type identifiers.
//!
//! Type ids describe the element type of embedded data arrays and the content
//! of virtual registers. The two pointer types are *abstract*: they stand for
//! "an integer as wide as a general-purpose register" and must be
//! deabstracted against the target's `gp_size` before their size is known.

/// Scalar type identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TypeId {
    Void = 0,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    /// Signed integer as wide as a GP register (abstract).
    IntPtr,
    /// Unsigned integer as wide as a GP register (abstract).
    UIntPtr,
    F32,
    F64,
}

impl TypeId {
    /// Size of the type in bytes. Abstract types and `Void` report 0.
    pub const fn size(self) -> u32 {
        match self {
            TypeId::Void | TypeId::IntPtr | TypeId::UIntPtr => 0,
            TypeId::I8 | TypeId::U8 => 1,
            TypeId::I16 | TypeId::U16 => 2,
            TypeId::I32 | TypeId::U32 | TypeId::F32 => 4,
            TypeId::I64 | TypeId::U64 | TypeId::F64 => 8,
        }
    }

    /// Whether this is one of the abstract pointer-width types.
    pub const fn is_abstract(self) -> bool {
        matches!(self, TypeId::IntPtr | TypeId::UIntPtr)
    }

    pub const fn is_int(self) -> bool {
        matches!(
            self,
            TypeId::I8
                | TypeId::U8
                | TypeId::I16
                | TypeId::U16
                | TypeId::I32
                | TypeId::U32
                | TypeId::I64
                | TypeId::U64
                | TypeId::IntPtr
                | TypeId::UIntPtr
        )
    }

    pub const fn is_float(self) -> bool {
        matches!(self, TypeId::F32 | TypeId::F64)
    }

    /// Maps abstract pointer types onto the concrete integer type matching
    /// `gp_size`; concrete types are returned unchanged.
    pub const fn deabstract(self, gp_size: u32) -> TypeId {
        match self {
            TypeId::IntPtr => {
                if gp_size == 8 {
                    TypeId::I64
                } else {
                    TypeId::I32
                }
            }
            TypeId::UIntPtr => {
                if gp_size == 8 {
                    TypeId::U64
                } else {
                    TypeId::U32
                }
            }
            other => other,
        }
    }
}
