pub mod dm;
pub mod luks2;

use std::sync::atomic::{AtomicBool, Ordering};

static VERBOSE: AtomicBool = AtomicBool::new(false);

/// Forward libcryptsetup debug output when the process itself runs at debug
/// verbosity.
pub fn set_verbose(verbose: bool) {
    VERBOSE.store(verbose, Ordering::Relaxed);
}

pub(crate) fn get_verbose() -> bool {
    VERBOSE.load(Ordering::Relaxed)
}
