use std::{
    io::Read,
    path::Path,
    process::ExitCode,
    sync::atomic::{AtomicBool, AtomicPtr, Ordering},
    thread,
    time::Duration,
};

use anyhow::{Context as _, Result};
use libcryptsetup_rs::{consts::vals::CryptReencryptInfo, CryptDevice};
use nix::{
    sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal},
    unistd::{self, ForkResult},
};

use crate::{
    cli::HelperArgs,
    fs::luks2,
    rundir::{self, RunDir},
    types::{Passphrase, PASSPHRASE_MAX},
};

/// Exit code understood by the boot machinery as "prompt for the passphrase
/// again".
pub const EXIT_UNABLE_TO_ACTIVATE: u8 = 2;

const MOUNT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const BOOT_DONE_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Set from the signal handler, polled by the wait loops and by the
/// reencryption progress callback.
static TEARDOWN: AtomicBool = AtomicBool::new(false);

/// Failures of the pre-fork phase that must be distinguishable by exit code.
#[derive(Debug, thiserror::Error)]
enum HelperError {
    #[error("Unable to read passphrase: {0:#}")]
    ReadPassphrase(anyhow::Error),
    #[error("Unable to activate volume: {0:#}")]
    Activate(anyhow::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HelperError {
    fn exit_code(&self) -> ExitCode {
        match self {
            HelperError::ReadPassphrase(_) | HelperError::Activate(_) => {
                ExitCode::from(EXIT_UNABLE_TO_ACTIVATE)
            }
            HelperError::Other(_) => ExitCode::FAILURE,
        }
    }
}

/// Entry point of the helper executable. Activates the volume, then forks a
/// long-lived child which survives the root pivot and resumes the staged
/// reencryption once the boot has settled.
pub fn run(args: &HelperArgs) -> ExitCode {
    match run_parent(args) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{e:#}");
            e.exit_code()
        }
    }
}

fn run_parent(args: &HelperArgs) -> Result<ExitCode, HelperError> {
    let passphrase = read_passphrase(std::io::stdin().lock(), args.strip_newlines)
        .map_err(HelperError::ReadPassphrase)?;

    let mut device =
        luks2::open_with_data_device(&args.header, &args.device).map_err(HelperError::Other)?;

    luks2::activate(&mut device, &args.name, &passphrase).map_err(HelperError::Activate)?;

    match luks2::reencrypt_status(&mut device) {
        Ok(CryptReencryptInfo::Clean) => {}
        Ok(CryptReencryptInfo::None) => {
            tracing::info!("Device is fully encrypted, nothing to resume");
            return Ok(ExitCode::SUCCESS);
        }
        Ok(info) => {
            // The header is in a bad state; log it, but never block the boot.
            tracing::error!(
                "libcryptsetup reported reencryption failure on {}: {info:?}",
                args.device.display()
            );
            return Ok(ExitCode::SUCCESS);
        }
        Err(e) => {
            tracing::error!("{e:#}");
            return Ok(ExitCode::SUCCESS);
        }
    }

    // Captured before the fork so the child can reach the stamps after it has
    // chrooted away from this root.
    let run_dir = RunDir::open(Path::new(rundir::RUN_DIR)).map_err(HelperError::Other)?;

    match unsafe { unistd::fork() }.context("Unable to fork()")? {
        ForkResult::Parent { child } => {
            std::fs::write(rundir::helper_pidfile(), child.as_raw().to_string())
                .context("Unable to write helper pidfile")?;
            Ok(ExitCode::SUCCESS)
        }
        ForkResult::Child => Ok(run_child(args, device, passphrase, run_dir)),
    }
}

fn run_child(
    args: &HelperArgs,
    mut device: CryptDevice,
    passphrase: Passphrase,
    run_dir: RunDir,
) -> ExitCode {
    mark_as_storage_daemon();

    let result = child_main(args, &mut device, &passphrase, &run_dir);

    let mut code = ExitCode::SUCCESS;
    if let Err(e) = &result {
        tracing::error!("{e:#}");
        if let Err(e) = run_dir.write(rundir::HELPER_FAILURE_STAMP, format!("{e:#}").as_bytes()) {
            tracing::error!("Unable to write failure stamp: {e:#}");
        }
        code = ExitCode::FAILURE;
    }

    if run_dir.exists(rundir::HELPER_PIDFILE) {
        if let Err(e) = run_dir.remove(rundir::HELPER_PIDFILE) {
            tracing::error!("Unable to unlink pidfile: {e:#}");
            code = ExitCode::FAILURE;
        }
    }

    // The crypt context and the /run descriptor are released on drop.
    code
}

fn child_main(
    args: &HelperArgs,
    device: &mut CryptDevice,
    passphrase: &Passphrase,
    run_dir: &RunDir,
) -> Result<()> {
    register_termination_handlers().context("Unable to register termination handlers")?;

    // Wait for the move to happen if rootmnt has been specified.
    if let Some(rootmnt) = &args.rootmnt {
        while !teardown_requested() && !run_dir.exists(rundir::HALIUM_MOUNTED_STAMP) {
            tracing::debug!("Root move stamp not found, waiting");
            thread::sleep(MOUNT_POLL_INTERVAL);
        }
        if teardown_requested() {
            return Ok(());
        }

        unistd::chroot(rootmnt)
            .with_context(|| format!("Unable to chroot to {}", rootmnt.display()))?;

        run_dir
            .remove(rundir::HALIUM_MOUNTED_STAMP)
            .context("Unable to remove halium mounted stamp")?;
    }

    // Hold off the heavy I/O until the boot has settled.
    while !teardown_requested() && !run_dir.exists(rundir::BOOT_DONE_STAMP) {
        tracing::debug!("Boot done stamp not found, waiting");
        thread::sleep(BOOT_DONE_POLL_INTERVAL);
    }
    if teardown_requested() {
        return Ok(());
    }

    if let Err(e) = luks2::resume_reencryption(device, &args.name, passphrase, reencrypt_progress)
    {
        if teardown_requested() {
            // Interrupted at a checkpoint; the header stays clean and a later
            // run picks up from there.
            tracing::info!("Reencryption interrupted, will resume on the next boot");
            return Ok(());
        }
        return Err(e);
    }

    tracing::info!("Reencryption finished");
    Ok(())
}

/// Read at most [`PASSPHRASE_MAX`] bytes of passphrase. With `strip_newlines`
/// set, newline bytes are skipped instead of stored. Zero usable bytes is an
/// error.
fn read_passphrase(input: impl Read, strip_newlines: bool) -> Result<Passphrase> {
    let mut passphrase = Vec::with_capacity(PASSPHRASE_MAX);

    for byte in input.bytes() {
        let byte = byte.context("Unable to read passphrase from stdin")?;
        if strip_newlines && byte == b'\n' {
            continue;
        }
        if passphrase.len() == PASSPHRASE_MAX {
            tracing::warn!("Passphrase limit of {PASSPHRASE_MAX} bytes reached, truncating");
            break;
        }
        passphrase.push(byte);
    }

    if passphrase.is_empty() {
        anyhow::bail!("Unable to read passphrase");
    }

    Ok(Passphrase::from(passphrase))
}

fn teardown_requested() -> bool {
    TEARDOWN.load(Ordering::Relaxed)
}

extern "C" fn handle_termination(_signal: libc::c_int) {
    TEARDOWN.store(true, Ordering::Relaxed);
}

fn register_termination_handlers() -> Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(handle_termination),
        SaFlags::empty(),
        SigSet::empty(),
    );

    unsafe {
        signal::sigaction(Signal::SIGINT, &action).context("sigaction(SIGINT) failed")?;
        signal::sigaction(Signal::SIGTERM, &action).context("sigaction(SIGTERM) failed")?;
    }

    Ok(())
}

/// Returning non-zero makes libcryptsetup stop at the next checkpoint.
unsafe extern "C" fn reencrypt_progress(
    _size: u64,
    _offset: u64,
    _usrptr: *mut std::ffi::c_void,
) -> std::ffi::c_int {
    TEARDOWN.load(Ordering::Relaxed) as std::ffi::c_int
}

static ARGV0: AtomicPtr<libc::c_char> = AtomicPtr::new(std::ptr::null_mut());

// Runs before main with the real argv, which Rust does not otherwise expose.
extern "C" fn capture_argv0(
    argc: libc::c_int,
    argv: *mut *mut libc::c_char,
    _envp: *mut *mut libc::c_char,
) {
    if argc > 0 && !argv.is_null() {
        ARGV0.store(unsafe { *argv }, Ordering::Relaxed);
    }
}

#[used]
#[link_section = ".init_array"]
static CAPTURE_ARGV0: extern "C" fn(
    libc::c_int,
    *mut *mut libc::c_char,
    *mut *mut libc::c_char,
) = capture_argv0;

/// Overwrite the first byte of argv[0] with '@' so the boot supervisor treats
/// the child as a root storage daemon and does not kill it when tearing down
/// the initramfs: https://systemd.io/ROOT_STORAGE_DAEMONS/
fn mark_as_storage_daemon() {
    let argv0 = ARGV0.load(Ordering::Relaxed);
    if !argv0.is_null() {
        unsafe { *argv0 = b'@' as libc::c_char };
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use rstest::rstest;

    use super::*;

    #[test]
    fn passphrase_of_exactly_the_cap_is_accepted_in_full() {
        let input = vec![b'a'; PASSPHRASE_MAX];
        let passphrase = read_passphrase(Cursor::new(input), false).unwrap();
        assert_eq!(passphrase.len(), PASSPHRASE_MAX);
    }

    #[test]
    fn passphrase_over_the_cap_is_truncated() {
        let input = vec![b'a'; PASSPHRASE_MAX + 1];
        let passphrase = read_passphrase(Cursor::new(input), false).unwrap();
        assert_eq!(passphrase.len(), PASSPHRASE_MAX);
    }

    #[test]
    fn empty_input_is_an_error() {
        assert!(read_passphrase(Cursor::new(Vec::new()), false).is_err());
    }

    #[test]
    fn newline_only_input_with_stripping_is_an_error() {
        assert!(read_passphrase(Cursor::new(b"\n\n".to_vec()), true).is_err());
    }

    #[rstest]
    #[case(true, b"abc\ndef\n".as_slice(), b"abcdef".as_slice())]
    #[case(false, b"abc\ndef\n".as_slice(), b"abc\ndef\n".as_slice())]
    #[case(true, b"s3cret".as_slice(), b"s3cret".as_slice())]
    fn newline_stripping(#[case] strip: bool, #[case] input: &[u8], #[case] expected: &[u8]) {
        let passphrase = read_passphrase(Cursor::new(input.to_vec()), strip).unwrap();
        assert_eq!(passphrase.as_bytes(), expected);
    }

    #[test]
    fn stripping_does_not_count_newlines_against_the_cap() {
        let mut input = Vec::new();
        for _ in 0..PASSPHRASE_MAX {
            input.extend_from_slice(b"a\n");
        }
        let passphrase = read_passphrase(Cursor::new(input), true).unwrap();
        assert_eq!(passphrase.len(), PASSPHRASE_MAX);
    }
}
