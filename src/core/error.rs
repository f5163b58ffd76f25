//! Error codes shared by the holder and every emitter.
//!
//! Using thiserror for more idiomatic error handling. Each variant is a
//! distinct error *code*; operations return them directly and emitters
//! additionally report them through the attached
//! [`ErrorHandler`](crate::core::emitter::ErrorHandler).

use thiserror::Error;

/// Result alias used across the crate.
pub type EmitResult<T> = Result<T, EmitError>;

/// Error codes produced by the emission core.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EmitError {
    /// The emitter is not attached to a `CodeHolder`.
    #[error("emitter is not attached to a code holder")]
    NotInitialized,

    /// The emitter is already attached to a `CodeHolder`.
    #[error("emitter is already attached to a code holder")]
    AlreadyAttached,

    /// The object has been destroyed or torn down.
    #[error("object was destroyed")]
    Destroyed,

    /// A generic argument was invalid.
    #[error("invalid argument")]
    InvalidArgument,

    /// A label id does not reference a registered label, or a named label
    /// clashes with an existing `(parent, name)` pair.
    #[error("invalid label")]
    InvalidLabel,

    /// A section id does not reference a registered section.
    #[error("invalid section")]
    InvalidSection,

    /// A data size is not one of the supported slot sizes.
    #[error("invalid operand size")]
    InvalidOperandSize,

    /// An alignment is zero or not a power of two.
    #[error("invalid alignment")]
    InvalidAlignment,

    /// The instruction cannot be encoded with the given operands.
    #[error("invalid instruction or operand combination")]
    InvalidInstruction,

    /// The operation is not valid in the current state.
    #[error("operation not valid in the current state")]
    InvalidState,

    /// The label was already bound to a section offset.
    #[error("label is already bound")]
    LabelAlreadyBound,

    /// A function-scoped operation was used while no function is open.
    #[error("no function is active")]
    FuncNotStarted,

    /// A section with the same name already exists.
    #[error("section name is already in use")]
    DuplicateSectionName,

    /// Allocation failed or a size computation overflowed.
    #[error("out of memory")]
    OutOfMemory,

    /// A patched displacement or relocated value does not fit its slot.
    #[error("relocated value does not fit into its slot")]
    RelocationOverflow,

    /// The label table is exhausted.
    #[error("too many labels")]
    TooManyLabels,

    /// The relocation table is exhausted.
    #[error("too many relocations")]
    TooManyRelocations,

    /// A referenced label was never bound.
    #[error("unresolved label")]
    UnresolvedLabel,

    /// A relocation expression could not be evaluated.
    #[error("unresolved expression")]
    UnresolvedExpression,
}
