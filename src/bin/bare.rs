// Host entry for the no-argument bootstrap variant: same runtime bring-up
// and teardown as `garamond`, but command-line arguments are discarded and
// the entry symbol is called with nothing.

use std::ffi::OsString;
use std::process::ExitCode;

use garamond_host::boot::{boot, BootSpec, Entry, HomeMode};
use garamond_host::rt::EmbeddedRuntime;

const IMAGE: &str = "libgaramondmain";

#[cfg(feature = "link_entry")]
extern "C" {
    // Provided at link time by the prebuilt application image.
    fn garamond_main();
}

#[cfg(feature = "link_entry")]
fn bare_entry(_rt: &EmbeddedRuntime) {
    unsafe { garamond_main() }
}

// Placeholder entry used when no application image is linked in.
#[cfg(not(feature = "link_entry"))]
fn bare_entry(_rt: &EmbeddedRuntime) {}

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
        entry: Entry::Bare(bare_entry),
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
