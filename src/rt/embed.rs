use crate::boot::{BootError, HomeMode, Runtime};
use crate::rt::gc::{drain_gray, mark_gray, GrayChan, HeapSlab, OwnedObject, SyncObject};
use crate::rt::{payload_ptr, raw_allocate, raw_deallocate, seq_payload, Color, MRef, ObjectKind};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::cell::{Cell, RefCell};
use std::io::{self, Write};
use std::mem::{align_of, size_of};
use std::ptr;
use std::slice;
use std::sync::atomic::{AtomicUsize, Ordering};

const MARK_THREADS: usize = 4;
const GC_TRIGGER: usize = 4096;

/// Handle to a managed string.
#[derive(Debug, Clone, Copy)]
#[repr(transparent)]
pub struct StrRef(MRef);

/// Handle to a managed, growable sequence of managed strings.
#[derive(Debug, Clone, Copy)]
#[repr(transparent)]
pub struct SeqRef(MRef);

impl SeqRef {
    pub fn raw(self) -> MRef {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Unconfigured,
    Configured,
    Started,
    Finalized,
}

/// In-process embedded runtime: a tri-color mark/sweep heap behind the
/// `Runtime` bootstrap contract. One mutator thread; collection happens
/// only at allocation points or explicit `collect` calls.
pub struct EmbeddedRuntime {
    phase: Phase,
    image: Option<String>,
    home: Option<HomeMode>,
    heap: HeapSlab,
    roots: RefCell<Vec<MRef>>,
    gray: GrayChan,
    pool: Option<ThreadPool>,
    live: AtomicUsize,
    since_gc: Cell<usize>,
    stress: Cell<bool>,
}

impl EmbeddedRuntime {
    pub fn new() -> Self {
        EmbeddedRuntime {
            phase: Phase::Unconfigured,
            image: None,
            home: None,
            heap: HeapSlab::new(),
            roots: RefCell::new(Vec::new()),
            gray: crossbeam_channel::unbounded(),
            pool: None,
            live: AtomicUsize::new(0),
            since_gc: Cell::new(0),
            stress: Cell::new(false),
        }
    }

    pub fn image(&self) -> Option<&str> {
        self.image.as_deref()
    }

    pub fn home(&self) -> Option<HomeMode> {
        self.home
    }

    pub fn live_objects(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    /// Collect before every allocation. Test instrumentation.
    pub fn set_gc_stress(&self, on: bool) {
        self.stress.set(on);
    }

    pub fn seq_len(&self, seq: SeqRef) -> usize {
        unsafe { (*seq_payload(seq.0)).len() }
    }

    /// Copies the string at `index` out of the managed heap.
    pub fn seq_string(&self, seq: SeqRef, index: usize) -> Option<Vec<u8>> {
        unsafe {
            let slot = *(&(*seq_payload(seq.0))).get(index)?;
            if slot.is_null() {
                return None;
            }
            Some(slice::from_raw_parts(payload_ptr(slot), (*slot).size).to_vec())
        }
    }

    // Allocation happens in two steps: `alloc` hands back a raw object so
    // the caller can initialize the payload, `register` puts it on the
    // heap. Nothing may allocate in between.
    fn alloc(&self, kind: ObjectKind, size: usize, align: usize) -> MRef {
        debug_assert_eq!(self.phase, Phase::Started, "allocation before start");

        self.maybe_collect();

        unsafe { raw_allocate(kind, size, align) }
    }

    fn register(&self, obj: MRef) {
        let index = unsafe {
            (*self.heap.0.get())
                .insert(OwnedObject(obj))
                .expect("unable to register object")
        };

        unsafe {
            (*obj).index = index;
        }

        self.live.fetch_add(1, Ordering::Relaxed);
        self.since_gc.set(self.since_gc.get() + 1);
    }

    fn maybe_collect(&self) {
        if self.pool.is_some() && (self.stress.get() || self.since_gc.get() >= GC_TRIGGER) {
            self.collect();
        }
    }

    /// Blocking mark/sweep over everything reachable from the root stack.
    pub fn collect(&self) {
        let Some(pool) = self.pool.as_ref() else {
            return;
        };

        for &root in self.roots.borrow().iter() {
            unsafe { mark_gray(root, &self.gray.0) };
        }

        // Concurrent marking phase.
        let gray = &self.gray;
        pool.scope(|scope| {
            for _ in 0..MARK_THREADS {
                scope.spawn(|_| unsafe { drain_gray(gray) });
            }
        });

        // Final marking phase.
        unsafe { drain_gray(gray) };

        let mut heap_objects: Vec<SyncObject> = Vec::new();
        unsafe {
            for object in (*self.heap.0.get()).unique_iter() {
                heap_objects.push(SyncObject(object.0));
            }
        }

        // Sweep phase. All white objects here are unreachable.
        let heap = &self.heap;
        let freed = AtomicUsize::new(0);
        heap_objects.par_iter().for_each(|obj| {
            let obj = obj.0;

            match unsafe { &(*obj) }.color.compare_exchange(
                Color::Black as u8,
                Color::White as u8,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    // survivor, back to white for the next cycle.
                }
                Err(_) => unsafe {
                    (*heap.0.get()).remove((*obj).index);
                    raw_deallocate(obj);
                    freed.fetch_add(1, Ordering::Relaxed);
                },
            }
        });

        let freed = freed.into_inner();
        self.live.fetch_sub(freed, Ordering::Relaxed);
        self.since_gc.set(0);
        tracing::debug!(freed, live = self.live_objects(), "gc.cycle");
    }

    fn release_heap(&mut self) {
        let slab = self.heap.0.get_mut();
        let objects: Vec<MRef> = slab.unique_iter().map(|object| object.0).collect();
        for obj in objects {
            unsafe {
                slab.remove((*obj).index);
                raw_deallocate(obj);
            }
        }
        self.live.store(0, Ordering::Relaxed);
    }
}

impl Runtime for EmbeddedRuntime {
    type Str = StrRef;
    type Seq = SeqRef;

    fn configure(&mut self, image: &str) -> Result<(), BootError> {
        if self.phase != Phase::Unconfigured {
            return Err(BootError::AlreadyStarted);
        }
        if image.is_empty() {
            return Err(BootError::BadImage(image.to_owned()));
        }

        self.image = Some(image.to_owned());
        self.phase = Phase::Configured;
        Ok(())
    }

    fn start(&mut self, home: HomeMode) -> Result<(), BootError> {
        match self.phase {
            Phase::Configured => {}
            Phase::Unconfigured => return Err(BootError::ImageUnset),
            _ => return Err(BootError::AlreadyStarted),
        }

        let pool = ThreadPoolBuilder::new()
            .num_threads(MARK_THREADS)
            .thread_name(|i| format!("gc-mark-{i}"))
            .build()
            .map_err(|e| BootError::WorkerPool(e.to_string()))?;

        self.pool = Some(pool);
        self.home = Some(home);
        self.phase = Phase::Started;
        tracing::debug!(image = self.image.as_deref(), "runtime.init");
        Ok(())
    }

    fn new_string_seq(&self) -> SeqRef {
        let obj = self.alloc(
            ObjectKind::StrSeq,
            size_of::<Vec<MRef>>(),
            align_of::<Vec<MRef>>(),
        );

        unsafe { seq_payload(obj).write(Vec::new()) };
        self.register(obj);

        SeqRef(obj)
    }

    fn seq_grow(&self, seq: SeqRef, extra: usize) {
        unsafe {
            let vec = &mut *seq_payload(seq.0);
            let len = vec.len();
            vec.resize(len + extra, ptr::null_mut());
        }
    }

    fn new_string(&self, bytes: &[u8]) -> StrRef {
        let obj = self.alloc(ObjectKind::Str, bytes.len(), 1);

        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), payload_ptr(obj), bytes.len()) };
        self.register(obj);

        StrRef(obj)
    }

    fn seq_store(&self, seq: SeqRef, index: usize, value: StrRef) {
        unsafe {
            (&mut (*seq_payload(seq.0)))[index] = value.0;
        }
    }

    fn root_push(&self, root: SeqRef) {
        self.roots.borrow_mut().push(root.0);
    }

    fn root_pop(&self) {
        self.roots.borrow_mut().pop();
    }

    fn finalize(&mut self, exit_hint: i32) {
        debug_assert_eq!(self.phase, Phase::Started, "finalize out of sequence");

        self.roots.get_mut().clear();
        self.release_heap();
        self.pool = None;
        io::stdout().flush().ok();
        self.phase = Phase::Finalized;
        tracing::debug!(exit_hint, "runtime.atexit");
    }
}

impl Default for EmbeddedRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EmbeddedRuntime {
    fn drop(&mut self) {
        if self.phase != Phase::Finalized {
            self.release_heap();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot::{boot, marshal_args, BootSpec, Entry};

    const IMAGE: &str = "libgaramondmain";

    fn started() -> EmbeddedRuntime {
        let mut rt = EmbeddedRuntime::new();
        rt.configure(IMAGE).unwrap();
        rt.start(HomeMode::RuntimeHome).unwrap();
        rt
    }

    #[test]
    fn marshals_argv_tail_in_order() {
        let rt = started();
        let argv: [&[u8]; 3] = [b"prog", b"--x", b"hello world"];

        let (seq, scope) = marshal_args(&rt, &argv);

        assert_eq!(rt.seq_len(seq), 2);
        assert_eq!(rt.seq_string(seq, 0).unwrap(), b"--x");
        assert_eq!(rt.seq_string(seq, 1).unwrap(), b"hello world");
        drop(scope);
    }

    #[test]
    fn no_user_args_is_an_empty_sequence() {
        let rt = started();
        let argv: [&[u8]; 1] = [b"prog"];

        let (seq, _scope) = marshal_args(&rt, &argv);

        assert_eq!(rt.seq_len(seq), 0);
    }

    #[test]
    fn rooted_sequence_survives_stress_collection() {
        let rt = started();
        rt.set_gc_stress(true);

        let args: Vec<Vec<u8>> = (0..16).map(|i| format!("arg-{i}").into_bytes()).collect();
        let mut argv = vec![b"prog".to_vec()];
        argv.extend(args.iter().cloned());

        let (seq, scope) = marshal_args(&rt, &argv);
        rt.collect();

        assert_eq!(rt.seq_len(seq), 16);
        for (i, expected) in args.iter().enumerate() {
            assert_eq!(rt.seq_string(seq, i).unwrap(), *expected);
        }
        assert_eq!(rt.live_objects(), 17);

        drop(scope);
        rt.collect();
        assert_eq!(rt.live_objects(), 0);
    }

    #[test]
    fn unrooted_objects_are_collected() {
        let rt = started();

        rt.new_string(b"transient");
        assert_eq!(rt.live_objects(), 1);

        rt.collect();
        assert_eq!(rt.live_objects(), 0);
    }

    #[test]
    fn start_requires_a_configured_image() {
        let mut rt = EmbeddedRuntime::new();
        assert!(matches!(
            rt.start(HomeMode::RuntimeHome),
            Err(BootError::ImageUnset)
        ));
    }

    #[test]
    fn empty_image_identifier_is_rejected() {
        let mut rt = EmbeddedRuntime::new();
        assert!(matches!(rt.configure(""), Err(BootError::BadImage(_))));
    }

    #[test]
    fn double_start_is_rejected() {
        let mut rt = started();
        assert!(matches!(
            rt.start(HomeMode::RuntimeHome),
            Err(BootError::AlreadyStarted)
        ));
    }

    #[test]
    fn boot_invokes_once_and_finalize_releases_the_heap() {
        use std::sync::atomic::AtomicUsize;

        static CALLS: AtomicUsize = AtomicUsize::new(0);

        fn entry(rt: &EmbeddedRuntime, args: SeqRef) {
            CALLS.fetch_add(1, Ordering::Relaxed);
            assert_eq!(rt.seq_len(args), 1);
            assert_eq!(rt.seq_string(args, 0).unwrap(), b"one");
        }

        let spec = BootSpec {
            image: IMAGE,
            home: HomeMode::RuntimeHome,
            entry: Entry::Forward(entry),
        };
        let argv: [&[u8]; 2] = [b"prog", b"one"];

        let mut rt = EmbeddedRuntime::new();
        boot(&mut rt, &spec, &argv).unwrap();

        assert_eq!(CALLS.load(Ordering::Relaxed), 1);
        assert_eq!(rt.live_objects(), 0);
        assert_eq!(rt.image(), Some(IMAGE));
    }
}
