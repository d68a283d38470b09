use std::{env, fs, path::PathBuf, process};

use kiln_compiler_test_copy::compile;
use kiln_compiler_test_flaky::MARKER_ENV;
use kiln_worker::worker_api::run_worker;

fn main() {
    let marker = env::var_os(MARKER_ENV)
        .map_or_else(|| PathBuf::from("flaky.marker"), PathBuf::from);
    if !marker.exists() {
        // first invocation: leave a trace for the next one and die.
        let _ = fs::write(&marker, b"crashed once\n");
        eprintln!("flaky compiler: failing first invocation");
        process::exit(1);
    }

    process::exit(match run_worker(1, |request| compile(request)) {
        Ok(()) => 0,
        Err(_) => 1,
    });
}
