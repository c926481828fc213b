use thiserror::Error;

/// How the runtime resolves its prebuilt image at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HomeMode {
    RuntimeHome,
    CurrentDir,
}

/// Compiled-in bootstrap configuration: which image to load and which entry
/// symbol receives control once the runtime is live.
pub struct BootSpec<R: Runtime> {
    pub image: &'static str,
    pub home: HomeMode,
    pub entry: Entry<R>,
}

/// The application entry symbol, bound at build time.
pub enum Entry<R: Runtime> {
    /// Called with the marshalled argument sequence.
    Forward(fn(&R, R::Seq)),
    /// Called with nothing; argv is discarded.
    Bare(fn(&R)),
}

/// Fatal startup errors surfaced by the runtime collaborator. Nothing here
/// is recoverable; the host prints one line and exits non-zero.
#[derive(Debug, Error)]
pub enum BootError {
    #[error("no runtime image configured")]
    ImageUnset,
    #[error("runtime image {0:?} is not loadable")]
    BadImage(String),
    #[error("runtime started twice")]
    AlreadyStarted,
    #[error("runtime worker pool: {0}")]
    WorkerPool(String),
}

/// Contract consumed from the embedded runtime.
///
/// `configure` must precede `start`; `start` must complete before any
/// allocation; `finalize` must be the last call made on the handle.
pub trait Runtime {
    type Str: Copy;
    type Seq: Copy;

    fn configure(&mut self, image: &str) -> Result<(), BootError>;
    fn start(&mut self, home: HomeMode) -> Result<(), BootError>;

    fn new_string_seq(&self) -> Self::Seq;
    fn seq_grow(&self, seq: Self::Seq, extra: usize);
    fn new_string(&self, bytes: &[u8]) -> Self::Str;
    fn seq_store(&self, seq: Self::Seq, index: usize, value: Self::Str);

    fn root_push(&self, root: Self::Seq);
    fn root_pop(&self);

    fn finalize(&mut self, exit_hint: i32);
}

/// Stack-discipline GC root registration. The root is released when the
/// scope drops, on every exit path of the frame that entered it.
pub struct RootScope<'rt, R: Runtime> {
    rt: &'rt R,
}

impl<'rt, R: Runtime> RootScope<'rt, R> {
    pub fn enter(rt: &'rt R, root: R::Seq) -> Self {
        rt.root_push(root);
        RootScope { rt }
    }
}

impl<R: Runtime> Drop for RootScope<'_, R> {
    fn drop(&mut self) {
        self.rt.root_pop();
    }
}

/// Builds the managed argument sequence for `argv[1..]`.
///
/// The sequence is rooted immediately after allocation, before anything
/// else is allocated; the returned scope keeps it rooted until the caller
/// drops it.
pub fn marshal_args<'rt, R: Runtime, A: AsRef<[u8]>>(
    rt: &'rt R,
    argv: &[A],
) -> (R::Seq, RootScope<'rt, R>) {
    let seq = rt.new_string_seq();
    let scope = RootScope::enter(rt, seq);

    let user_args = argv.len().saturating_sub(1);
    rt.seq_grow(seq, user_args);

    for (i, raw) in argv.iter().skip(1).enumerate() {
        let s = rt.new_string(until_nul(raw.as_ref()));
        rt.seq_store(seq, i, s);
    }

    (seq, scope)
}

// Native strings end at the first NUL; anything after an embedded NUL is
// dropped. Known limitation inherited from the native argv contract.
fn until_nul(bytes: &[u8]) -> &[u8] {
    match bytes.iter().position(|&b| b == 0) {
        Some(n) => &bytes[..n],
        None => bytes,
    }
}

/// Runs one full bootstrap: configure → start → [marshal] → invoke →
/// release root → finalize.
///
/// The entry's return value does not exist; any application-level outcome
/// is out-of-band. On success the host exits 0.
pub fn boot<R: Runtime, A: AsRef<[u8]>>(
    rt: &mut R,
    spec: &BootSpec<R>,
    argv: &[A],
) -> Result<(), BootError> {
    rt.configure(spec.image)?;
    rt.start(spec.home)?;

    match spec.entry {
        Entry::Forward(entry) => {
            let (args, scope) = marshal_args(&*rt, argv);
            entry(&*rt, args);
            drop(scope);
        }
        Entry::Bare(entry) => entry(&*rt),
    }

    rt.finalize(0);
    Ok(())
}
