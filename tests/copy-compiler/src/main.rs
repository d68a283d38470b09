use kiln_compiler_test_copy::compile;
use kiln_worker::worker_api::run_worker;

fn main() {
    // reports protocol version 2 so the pool's version cache moves off
    // its default in tests.
    std::process::exit(match run_worker(2, |request| compile(request)) {
        Ok(()) => 0,
        Err(_) => 1,
    });
}
