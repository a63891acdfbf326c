pub const SUCCESS: i32 = 0;
pub const EXECUTION_ERROR: i32 = 1;
pub const INPUT_ERROR: i32 = 2;

use ephys_stream::{ErrorKind, StreamError};

/// Exit code for a library error.
pub fn for_error(err: &StreamError) -> i32 {
    match err.kind() {
        ErrorKind::Config => INPUT_ERROR,
        _ => EXECUTION_ERROR,
    }
}
