//! Target architecture identification.
//!
//! Every [`CodeHolder`](crate::core::holder::CodeHolder) is configured with an
//! [`ArchInfo`] that packs the architecture id, sub-id (feature level or
//! execution mode), the native general-purpose register size and the
//! general-purpose register count into a single 32-bit signature.

/// Architecture identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ArchId {
    /// Unknown or uninitialized architecture.
    None = 0,
    /// 32-bit x86.
    X86 = 1,
    /// 64-bit x86, also known as x86_64 and AMD64.
    X64 = 2,
    /// 32-bit ARM (AArch32).
    Arm32 = 3,
    /// 64-bit ARM (AArch64).
    Arm64 = 4,
}

impl ArchId {
    /// Architecture of the machine this crate was compiled for.
    pub const fn host() -> ArchId {
        if cfg!(target_arch = "x86_64") {
            ArchId::X64
        } else if cfg!(target_arch = "x86") {
            ArchId::X86
        } else if cfg!(target_arch = "aarch64") {
            ArchId::Arm64
        } else if cfg!(target_arch = "arm") {
            ArchId::Arm32
        } else {
            ArchId::None
        }
    }

    pub const fn is_x86_family(self) -> bool {
        matches!(self, ArchId::X86 | ArchId::X64)
    }

    pub const fn is_arm_family(self) -> bool {
        matches!(self, ArchId::Arm32 | ArchId::Arm64)
    }
}

/// Architecture sub-ids: instruction-set levels and execution modes.
pub mod sub_id {
    /// Baseline, no specific mode.
    pub const NONE: u8 = 0;
    /// x86: code generation may use AVX.
    pub const X86_AVX: u8 = 1;
    /// x86: code generation may use AVX2.
    pub const X86_AVX2: u8 = 2;
    /// x86: code generation may use AVX-512F.
    pub const X86_AVX512: u8 = 3;
    /// x86: code generation may use AVX-512VL.
    pub const X86_AVX512VL: u8 = 4;
    /// ARM 32-bit: Thumb/Thumb-2 encoding.
    pub const ARM32_THUMB: u8 = 8;
}

/// Packed architecture signature `{id, sub_id, gp_size, gp_count}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArchInfo {
    id: ArchId,
    sub_id: u8,
    gp_size: u8,
    gp_count: u8,
}

impl ArchInfo {
    /// An uninitialized architecture (`ArchId::None`).
    pub const fn none() -> Self {
        Self { id: ArchId::None, sub_id: 0, gp_size: 0, gp_count: 0 }
    }

    /// Creates architecture information for `id` with an optional `sub_id`.
    ///
    /// The general-purpose register size and count are derived from `id`.
    pub const fn new(id: ArchId, sub_id: u8) -> Self {
        let (gp_size, gp_count) = match id {
            ArchId::None => (0, 0),
            ArchId::X86 => (4, 8),
            ArchId::X64 => (8, 16),
            ArchId::Arm32 => (4, 16),
            ArchId::Arm64 => (8, 32),
        };
        Self { id, sub_id, gp_size, gp_count }
    }

    /// Architecture of the host machine.
    pub const fn host() -> Self {
        Self::new(ArchId::host(), sub_id::NONE)
    }

    /// Whether this signature describes a real architecture.
    pub const fn is_initialized(&self) -> bool {
        !matches!(self.id, ArchId::None)
    }

    /// The packed 32-bit signature `{id, sub_id, gp_size, gp_count}`.
    pub const fn signature(&self) -> u32 {
        (self.id as u32)
            | (self.sub_id as u32) << 8
            | (self.gp_size as u32) << 16
            | (self.gp_count as u32) << 24
    }

    pub const fn arch_id(&self) -> ArchId {
        self.id
    }

    pub const fn arch_sub_id(&self) -> u8 {
        self.sub_id
    }

    /// Native size of a general-purpose register in bytes (4 or 8).
    pub const fn gp_size(&self) -> u32 {
        self.gp_size as u32
    }

    /// Number of addressable general-purpose registers.
    pub const fn gp_count(&self) -> u32 {
        self.gp_count as u32
    }

    pub const fn is_32bit(&self) -> bool {
        self.gp_size == 4
    }

    pub const fn is_64bit(&self) -> bool {
        self.gp_size == 8
    }

    pub const fn is_x86_family(&self) -> bool {
        self.id.is_x86_family()
    }

    pub const fn is_arm_family(&self) -> bool {
        self.id.is_arm_family()
    }

    /// Resets to the uninitialized state.
    pub fn reset(&mut self) {
        *self = Self::none();
    }
}

impl Default for ArchInfo {
    fn default() -> Self {
        Self::none()
    }
}
