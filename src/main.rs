// Host entry for the argument-forwarding bootstrap: bring the embedded
// runtime up, hand it argv[1..] as a managed string sequence, and tear it
// down when the entry symbol returns.

use std::ffi::OsString;
use std::process::ExitCode;

use garamond_host::boot::{boot, BootSpec, Entry, HomeMode};
use garamond_host::rt::{EmbeddedRuntime, SeqRef};

const IMAGE: &str = "libgaramondmain";

#[cfg(feature = "link_entry")]
extern "C" {
    // Provided at link time by the prebuilt application image.
    fn garamondmain(args: SeqRef);
}

#[cfg(feature = "link_entry")]
fn forward_entry(_rt: &EmbeddedRuntime, args: SeqRef) {
    unsafe { garamondmain(args) }
}

// Placeholder entry used when no application image is linked in: echo the
// marshalled arguments so the handoff stays observable.
#[cfg(not(feature = "link_entry"))]
fn forward_entry(rt: &EmbeddedRuntime, args: SeqRef) {
    for i in 0..rt.seq_len(args) {
        if let Some(bytes) = rt.seq_string(args, i) {
            println!("{}", String::from_utf8_lossy(&bytes));
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let argv: Vec<Vec<u8>> = std::env::args_os()
        .map(OsString::into_encoded_bytes)
        .collect();

    let spec = BootSpec {
        image: IMAGE,
        home: HomeMode::RuntimeHome,
        entry: Entry::Forward(forward_entry),
    };

    let mut rt = EmbeddedRuntime::new();
    match boot(&mut rt, &spec, &argv) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("garamond: {e}");
            ExitCode::FAILURE
        }
    }
}
