use std::fmt::Debug;

use strum::Display;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Upper bound for passphrases accepted from callers or from stdin.
pub const PASSPHRASE_MAX: usize = 256;

/// A passphrase held in memory for the duration of a single operation. The
/// backing buffer is wiped when the value is dropped.
#[derive(Zeroize, ZeroizeOnDrop, Clone)]
pub struct Passphrase(Vec<u8>);

impl Passphrase {
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_slice()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for Passphrase {
    fn from(value: Vec<u8>) -> Self {
        Self(value)
    }
}

impl Debug for Passphrase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("Passphrase({} bytes)", self.0.len()))
    }
}

/// Progress of the in-place encryption of the root filesystem. The integer
/// values are part of the bus interface and must stay stable.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum EncryptionStatus {
    /// No status has been derived since the service started.
    Unknown = 0,
    /// One of the configured devices does not exist.
    Unsupported = 1,
    /// Devices are present but no LUKS2 header has been formatted yet.
    Unconfigured = 2,
    /// The worker is formatting the header and staging the reencryption.
    Configuring = 3,
    /// Header formatted and reencryption staged, waiting for the next boot.
    Configured = 4,
    /// The helper child is carrying out the reencryption.
    Encrypting = 5,
    /// The header reports no pending reencryption.
    Encrypted = 6,
    Failed = 7,
}

impl EncryptionStatus {
    /// States that a status refresh never leaves on its own. They are only
    /// advanced by the worker or by the helper's stamps.
    pub fn is_sticky(self) -> bool {
        matches!(
            self,
            EncryptionStatus::Configuring
                | EncryptionStatus::Configured
                | EncryptionStatus::Unsupported
                | EncryptionStatus::Failed
        )
    }

    /// States during which the service must keep running past the idle
    /// timeout.
    pub fn forbids_idle_exit(self) -> bool {
        matches!(
            self,
            EncryptionStatus::Configuring | EncryptionStatus::Configured
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_values_are_stable() {
        assert_eq!(EncryptionStatus::Unknown as i32, 0);
        assert_eq!(EncryptionStatus::Unsupported as i32, 1);
        assert_eq!(EncryptionStatus::Unconfigured as i32, 2);
        assert_eq!(EncryptionStatus::Configuring as i32, 3);
        assert_eq!(EncryptionStatus::Configured as i32, 4);
        assert_eq!(EncryptionStatus::Encrypting as i32, 5);
        assert_eq!(EncryptionStatus::Encrypted as i32, 6);
        assert_eq!(EncryptionStatus::Failed as i32, 7);
    }

    #[test]
    fn sticky_states() {
        for status in [
            EncryptionStatus::Configuring,
            EncryptionStatus::Configured,
            EncryptionStatus::Unsupported,
            EncryptionStatus::Failed,
        ] {
            assert!(status.is_sticky(), "{status} should be sticky");
        }
        for status in [
            EncryptionStatus::Unknown,
            EncryptionStatus::Unconfigured,
            EncryptionStatus::Encrypting,
            EncryptionStatus::Encrypted,
        ] {
            assert!(!status.is_sticky(), "{status} should not be sticky");
        }
    }

    #[test]
    fn idle_exit_is_forbidden_while_configuring() {
        assert!(EncryptionStatus::Configuring.forbids_idle_exit());
        assert!(EncryptionStatus::Configured.forbids_idle_exit());
        assert!(!EncryptionStatus::Encrypting.forbids_idle_exit());
        assert!(!EncryptionStatus::Encrypted.forbids_idle_exit());
        assert!(!EncryptionStatus::Failed.forbids_idle_exit());
    }

    #[test]
    fn passphrase_debug_does_not_leak_contents() {
        let passphrase = Passphrase::from(b"s3cret".to_vec());
        let rendered = format!("{passphrase:?}");
        assert!(!rendered.contains("s3cret"));
        assert!(rendered.contains("6 bytes"));
    }
}
