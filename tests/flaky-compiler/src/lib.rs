//! Test compiler that dies on its first invocation and then behaves like
//! the copy compiler, exercising the restart path of the process host.

/// Name of the produced executable.
pub const BIN_NAME: &str = "compiler-flaky";

/// Environment variable naming the marker file that distinguishes the
/// first invocation from later ones.
pub const MARKER_ENV: &str = "KILN_FLAKY_MARKER";
