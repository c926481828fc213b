mod embed;
mod gc;

pub use embed::{EmbeddedRuntime, SeqRef, StrRef};

use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};
use std::mem::{align_of, size_of};
use std::process::abort;
use std::ptr;
use std::sync::atomic::AtomicU8;

/// Reference to a managed object: a pointer to its header.
pub type MRef = *mut ObjectHeader;

#[derive(Debug)]
pub struct ObjectHeader {
    pub kind: ObjectKind,
    pub color: AtomicU8,
    pub index: usize,
    pub size: usize,
    pub align: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Str,
    StrSeq,
}

#[derive(Debug, Clone, Copy)]
pub enum Color {
    White = 0,
    Gray = 1,
    Black = 2,
}

// |ObjectHeader|Alignment|Payload|
pub(crate) unsafe fn raw_allocate(kind: ObjectKind, size: usize, align: usize) -> MRef {
    // in release mode, the alignment would be checked in Layout::from_size_align.
    debug_assert!(align.is_power_of_two(), "incorrect alignment: {align}");

    let align = align.max(align_of::<ObjectHeader>());
    let offset = payload_offset(align);

    let alloc_size = size + offset;

    let layout = match Layout::from_size_align(alloc_size, align) {
        Ok(layout) => layout,
        Err(e) => {
            eprintln!("{e}, Size = {alloc_size}, Align = {align}");
            abort();
        }
    };

    let base = unsafe { alloc(layout) };
    if base.is_null() {
        handle_alloc_error(layout);
    }

    unsafe {
        base.cast::<ObjectHeader>().write(ObjectHeader {
            kind,
            color: AtomicU8::new(Color::White as u8),
            index: usize::MAX,
            size,
            align,
        });
    }

    base.cast()
}

pub(crate) unsafe fn raw_deallocate(obj: MRef) {
    let kind = unsafe { (*obj).kind };
    let size = unsafe { (*obj).size };
    let align = unsafe { (*obj).align };

    let offset = payload_offset(align);

    if kind == ObjectKind::StrSeq {
        // the sequence payload owns its element vector
        unsafe { ptr::drop_in_place(payload_ptr(obj).cast::<Vec<MRef>>()) };
    }

    let layout = Layout::from_size_align(size + offset, align).unwrap();

    unsafe { dealloc(obj.cast(), layout) };
}

#[inline]
pub(crate) unsafe fn payload_ptr(obj: MRef) -> *mut u8 {
    unsafe { obj.cast::<u8>().add(payload_offset((*obj).align)) }
}

#[inline]
pub(crate) unsafe fn seq_payload(obj: MRef) -> *mut Vec<MRef> {
    debug_assert_eq!(unsafe { (*obj).kind }, ObjectKind::StrSeq);
    unsafe { payload_ptr(obj).cast() }
}

#[inline]
pub const fn payload_offset(mut align: usize) -> usize {
    let head_align = align_of::<ObjectHeader>();

    if align < head_align {
        align = head_align;
    }

    let head_size = size_of::<ObjectHeader>();
    // |Align|Align|Align|Align|
    // |Head---------| -> Offset = 3 * Align
    // |Head-------------| -> Offset = 3 * Align
    // |-------Head------|Payload...|
    let mut offset = (head_size / align) * align;
    if offset != head_size {
        offset += align;
    }

    offset
}
