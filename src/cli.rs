use std::path::PathBuf;

use clap::Parser;

/// Arguments accepted by the bus-attached service executable.
#[derive(Parser, Debug)]
#[command(version, about = "Disk encryption orchestration service", long_about = None)]
pub struct ServiceArgs {}

/// Arguments accepted by the early-boot helper executable.
#[derive(Parser, Debug)]
#[command(version, about = "Helper for droidian-encryption-service", long_about = None)]
pub struct HelperArgs {
    /// Device to open.
    #[clap(long)]
    pub device: PathBuf,

    /// Detached header to use.
    #[clap(long)]
    pub header: PathBuf,

    /// Device-mapper name to activate the volume under.
    #[clap(long)]
    pub name: String,

    /// Root mountpoint to chroot into once the boot scripts signal the move.
    #[clap(long)]
    pub rootmnt: Option<PathBuf>,

    /// Skip newline bytes while reading the passphrase from stdin.
    #[clap(long, default_value = "false")]
    pub strip_newlines: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn helper_requires_device_header_and_name() {
        assert!(HelperArgs::try_parse_from(["droidian-encryption-helper"]).is_err());
        assert!(HelperArgs::try_parse_from([
            "droidian-encryption-helper",
            "--device",
            "/dev/sda2",
        ])
        .is_err());
        assert!(HelperArgs::try_parse_from([
            "droidian-encryption-helper",
            "--device",
            "/dev/sda2",
            "--header",
            "/dev/sda3",
        ])
        .is_err());
    }

    #[test]
    fn helper_full_invocation() {
        let args = HelperArgs::try_parse_from([
            "droidian-encryption-helper",
            "--device",
            "/dev/droidian/droidian-rootfs",
            "--header",
            "/dev/droidian/droidian-reserved",
            "--name",
            "droidian_encrypted",
            "--rootmnt",
            "/mnt/root",
            "--strip-newlines",
        ])
        .unwrap();

        assert_eq!(args.device, PathBuf::from("/dev/droidian/droidian-rootfs"));
        assert_eq!(args.header, PathBuf::from("/dev/droidian/droidian-reserved"));
        assert_eq!(args.name, "droidian_encrypted");
        assert_eq!(args.rootmnt, Some(PathBuf::from("/mnt/root")));
        assert!(args.strip_newlines);
    }

    #[test]
    fn newline_stripping_is_off_by_default() {
        let args = HelperArgs::try_parse_from([
            "droidian-encryption-helper",
            "--device",
            "/dev/sda2",
            "--header",
            "/dev/sda3",
            "--name",
            "crypt",
        ])
        .unwrap();

        assert!(!args.strip_newlines);
        assert_eq!(args.rootmnt, None);
    }
}
