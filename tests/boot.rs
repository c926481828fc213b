use garamond_host::boot::{boot, marshal_args, BootSpec, Entry, HomeMode, Runtime};
use garamond_host::rt::{EmbeddedRuntime, SeqRef};
use proptest::prelude::*;

const IMAGE: &str = "libgaramondmain";

fn started() -> EmbeddedRuntime {
    let mut rt = EmbeddedRuntime::new();
    rt.configure(IMAGE).unwrap();
    rt.start(HomeMode::RuntimeHome).unwrap();
    rt
}

// What the native argv contract hands across the boundary: everything up
// to the first NUL byte.
fn native_view(arg: &[u8]) -> Vec<u8> {
    match arg.iter().position(|&b| b == 0) {
        Some(n) => arg[..n].to_vec(),
        None => arg.to_vec(),
    }
}

#[test]
fn forwarding_boot_hands_argv_tail_to_the_entry() {
    static SEEN: std::sync::Mutex<Vec<Vec<u8>>> = std::sync::Mutex::new(Vec::new());

    fn entry(rt: &EmbeddedRuntime, args: SeqRef) {
        let mut seen = SEEN.lock().unwrap();
        for i in 0..rt.seq_len(args) {
            seen.push(rt.seq_string(args, i).unwrap());
        }
    }

    let spec = BootSpec {
        image: IMAGE,
        home: HomeMode::RuntimeHome,
        entry: Entry::Forward(entry),
    };
    let argv: [&[u8]; 3] = [b"prog", b"--x", b"hello world"];

    let mut rt = EmbeddedRuntime::new();
    boot(&mut rt, &spec, &argv).unwrap();

    assert_eq!(
        *SEEN.lock().unwrap(),
        vec![b"--x".to_vec(), b"hello world".to_vec()]
    );
    assert_eq!(rt.live_objects(), 0);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn marshalled_sequence_matches_native_argv(
        args in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..24), 0..6)
    ) {
        let rt = started();
        rt.set_gc_stress(true);

        let mut argv: Vec<Vec<u8>> = vec![b"prog".to_vec()];
        argv.extend(args.iter().cloned());

        let (seq, scope) = marshal_args(&rt, &argv);
        rt.collect();

        prop_assert_eq!(rt.seq_len(seq), args.len());
        for (i, arg) in args.iter().enumerate() {
            prop_assert_eq!(rt.seq_string(seq, i).unwrap(), native_view(arg));
        }

        drop(scope);
    }
}
