//! JIT memory interface.
//!
//! The core never maps executable pages itself; a host supplies a
//! [`RuntimeAllocator`] that hands out dual-view spans (a writable pointer
//! and an executable pointer, equal on RWX hosts). [`add_code`] drives the
//! finalize pipeline and copies the relocated sections into such a span.

use crate::core::error::{EmitError, EmitResult};
use crate::core::holder::CodeHolder;

/// A span of allocated JIT memory.
///
/// `rw` is the writable view, `rx` the executable view of the same
/// physical memory. Allocators without W^X separation return the same
/// address for both.
#[derive(Debug, Clone, Copy)]
pub struct Span {
    pub rx: *const u8,
    pub rw: *mut u8,
    pub size: usize,
}

/// Executable-memory provider. Implementations manage page permissions
/// and cache coherency; the core only copies bytes.
pub trait RuntimeAllocator {
    /// Allocates a span of at least `size` bytes.
    fn alloc(&mut self, size: usize) -> EmitResult<Span>;

    /// Releases a span returned by [`RuntimeAllocator::alloc`].
    fn release(&mut self, span: Span) -> EmitResult<()>;

    /// Makes written code visible to the instruction stream (instruction
    /// cache flush, W^X flip). No-op by default.
    fn flush(&mut self, _span: &Span) {}
}

/// Flattens, resolves and relocates `code` to a freshly allocated span and
/// copies every section into place. Returns the address of `.text`.
pub fn add_code(
    allocator: &mut dyn RuntimeAllocator,
    code: &mut CodeHolder<'_>,
) -> EmitResult<*const u8> {
    code.flatten()?;
    code.resolve_unresolved_links()?;
    let size = code.code_size() as usize;
    if size == 0 {
        return Err(EmitError::InvalidArgument);
    }
    let span = allocator.alloc(size)?;
    if let Err(err) = code.relocate_to(span.rx as u64) {
        allocator.release(span)?;
        return Err(err);
    }
    unsafe {
        std::ptr::write_bytes(span.rw, 0, size);
        for section in code.sections() {
            if section.is_zero_fill() || section.buffer_size() == 0 {
                continue;
            }
            std::ptr::copy_nonoverlapping(
                section.buffer().as_slice().as_ptr(),
                span.rw.add(section.offset() as usize),
                section.buffer_size(),
            );
        }
    }
    allocator.flush(&span);
    Ok(unsafe { span.rx.add(code.text_section().offset() as usize) })
}

/// Plain heap allocator. The spans are writable but *not* executable;
/// useful for tests and for staging ahead-of-time images.
#[derive(Debug, Default)]
pub struct HeapAllocator {
    blocks: Vec<Box<[u8]>>,
}

impl HeapAllocator {
    pub fn new() -> Self {
        Self { blocks: Vec::new() }
    }
}

impl RuntimeAllocator for HeapAllocator {
    fn alloc(&mut self, size: usize) -> EmitResult<Span> {
        if size == 0 {
            return Err(EmitError::InvalidArgument);
        }
        let mut block = vec![0u8; size].into_boxed_slice();
        let rw = block.as_mut_ptr();
        self.blocks.push(block);
        Ok(Span { rx: rw as *const u8, rw, size })
    }

    fn release(&mut self, span: Span) -> EmitResult<()> {
        // Blocks are freed in bulk when the allocator drops; just validate
        // that the span belongs to us.
        if self.blocks.iter().any(|b| b.as_ptr() == span.rx) {
            Ok(())
        } else {
            Err(EmitError::InvalidArgument)
        }
    }
}
