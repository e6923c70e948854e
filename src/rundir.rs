use std::{
    fs::File,
    io::Write as _,
    os::fd::OwnedFd,
    path::{Path, PathBuf},
};

use anyhow::{Context as _, Result};
use nix::{
    fcntl::{self, AtFlags, OFlag},
    sys::stat::Mode,
    unistd::{self, AccessFlags, UnlinkatFlags},
};

pub const RUN_DIR: &str = "/run";

/// Touched by the boot scripts once the real root is mounted at rootmnt.
pub const HALIUM_MOUNTED_STAMP: &str = "halium-mounted";

/// Touched by the boot scripts once full userspace has settled.
pub const BOOT_DONE_STAMP: &str = "boot-done";

/// Written by the helper parent right after forking the reencryption child;
/// its presence is the sole external witness that work is in progress.
pub const HELPER_PIDFILE: &str = "droidian-encryption-helper.pid";

/// Written by the helper child when the reencryption fails.
pub const HELPER_FAILURE_STAMP: &str = "droidian-encryption-helper-failed";

/// Absolute pidfile path for processes that never leave the final root.
pub fn helper_pidfile() -> PathBuf {
    Path::new(RUN_DIR).join(HELPER_PIDFILE)
}

/// Absolute failure stamp path for processes that never leave the final root.
pub fn helper_failure_stamp() -> PathBuf {
    Path::new(RUN_DIR).join(HELPER_FAILURE_STAMP)
}

/// Directory descriptor captured before any chroot.
///
/// After the root pivot an absolute /run resolves inside the new root, so all
/// stamp traffic from the helper child goes through this descriptor with the
/// *at family of calls.
pub struct RunDir {
    fd: OwnedFd,
}

impl RunDir {
    pub fn open(path: &Path) -> Result<Self> {
        let fd = fcntl::open(path, OFlag::O_PATH | OFlag::O_DIRECTORY, Mode::empty())
            .with_context(|| format!("Unable to open {}", path.display()))?;

        Ok(Self { fd })
    }

    pub fn exists(&self, name: &str) -> bool {
        unistd::faccessat(&self.fd, name, AccessFlags::F_OK, AtFlags::empty()).is_ok()
    }

    pub fn remove(&self, name: &str) -> Result<()> {
        unistd::unlinkat(&self.fd, name, UnlinkatFlags::NoRemoveDir)
            .with_context(|| format!("Unable to unlink {name}"))
    }

    pub fn write(&self, name: &str, contents: &[u8]) -> Result<()> {
        let fd = fcntl::openat(
            &self.fd,
            name,
            OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_TRUNC,
            Mode::from_bits_truncate(0o644),
        )
        .with_context(|| format!("Unable to create {name}"))?;

        File::from(fd)
            .write_all(contents)
            .with_context(|| format!("Unable to write {name}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stamp_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let run_dir = RunDir::open(dir.path()).unwrap();

        assert!(!run_dir.exists(HALIUM_MOUNTED_STAMP));

        std::fs::write(dir.path().join(HALIUM_MOUNTED_STAMP), b"").unwrap();
        assert!(run_dir.exists(HALIUM_MOUNTED_STAMP));

        run_dir.remove(HALIUM_MOUNTED_STAMP).unwrap();
        assert!(!run_dir.exists(HALIUM_MOUNTED_STAMP));
        assert!(!dir.path().join(HALIUM_MOUNTED_STAMP).exists());
    }

    #[test]
    fn write_creates_and_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let run_dir = RunDir::open(dir.path()).unwrap();

        run_dir.write(HELPER_PIDFILE, b"12345").unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join(HELPER_PIDFILE)).unwrap(),
            "12345"
        );

        run_dir.write(HELPER_PIDFILE, b"7").unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join(HELPER_PIDFILE)).unwrap(),
            "7"
        );
    }

    #[test]
    fn removing_a_missing_stamp_fails() {
        let dir = tempfile::tempdir().unwrap();
        let run_dir = RunDir::open(dir.path()).unwrap();

        assert!(run_dir.remove(BOOT_DONE_STAMP).is_err());
    }

    #[test]
    fn absolute_helpers_point_into_run() {
        assert_eq!(
            helper_pidfile(),
            Path::new("/run/droidian-encryption-helper.pid")
        );
        assert_eq!(
            helper_failure_stamp(),
            Path::new("/run/droidian-encryption-helper-failed")
        );
    }
}
