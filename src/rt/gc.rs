use crate::rt::{seq_payload, Color, MRef, ObjectKind};
use crossbeam_channel::{Receiver, Sender};
use sharded_slab::Slab;
use std::cell::UnsafeCell;
use std::sync::atomic::Ordering;

pub(crate) struct OwnedObject(pub(crate) MRef);

unsafe impl Send for OwnedObject {}
unsafe impl Sync for OwnedObject {}

pub(crate) struct SyncObject(pub(crate) MRef);

unsafe impl Send for SyncObject {}
unsafe impl Sync for SyncObject {}

pub(crate) struct HeapSlab(pub(crate) UnsafeCell<Slab<OwnedObject>>);

unsafe impl Send for HeapSlab {}
unsafe impl Sync for HeapSlab {}

impl HeapSlab {
    pub(crate) fn new() -> Self {
        HeapSlab(UnsafeCell::new(Slab::new()))
    }
}

pub(crate) type GrayChan = (Sender<SyncObject>, Receiver<SyncObject>);

pub(crate) unsafe fn mark_gray(obj: MRef, gray: &Sender<SyncObject>) {
    match unsafe { &(*obj) }.color.compare_exchange(
        Color::White as u8,
        Color::Gray as u8,
        Ordering::Relaxed,
        Ordering::Relaxed,
    ) {
        Ok(_) => {
            // add the object to the gray set.
            gray.send(SyncObject(obj)).expect("gray worklist closed");
        }
        Err(_) => {} // already gray or black.
    }
}

// Recv gray objects from the worklist, blacken them and push their
// children. Runs on the mark pool workers and once more single-threaded
// afterwards to pick up anything a worker raced past.
pub(crate) unsafe fn drain_gray(gray: &GrayChan) {
    while let Ok(obj) = gray.1.try_recv() {
        let obj = obj.0;
        unsafe {
            (*obj)
                .color
                .store(Color::Black as u8, Ordering::Relaxed);

            if (*obj).kind == ObjectKind::StrSeq {
                for &elem in (*seq_payload(obj)).iter() {
                    if !elem.is_null() {
                        mark_gray(elem, &gray.0);
                    }
                }
            }
        }
    }
}
