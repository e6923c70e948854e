use std::path::Path;

use configparser::ini::Ini;
use tracing::warn;

pub const CONFIGURATION_FILE: &str = "/etc/droidian-encryption-service.conf";
const CONFIGURATION_FILE_SECTION: &str = "droidian-encryption-service";

const DEFAULT_HEADER_DEVICE: &str = "/dev/droidian/droidian-reserved";
const DEFAULT_DATA_DEVICE: &str = "/dev/droidian/droidian-rootfs";
const DEFAULT_MAPPED_NAME: &str = "droidian_encrypted";
const DEFAULT_CIPHER: &str = "aes";
const DEFAULT_CIPHER_MODE: &str = "xts-plain64";
const DEFAULT_SECTOR_SIZE: u32 = 4096;
const DEFAULT_SECTOR_SIZE_FORCE: bool = false;

/// Settings of the encryption service, read once at construction.
///
/// Every accessor falls back to its default when the file, the section or the
/// key is missing, so an absent configuration file still yields a usable
/// instance.
pub struct Config {
    ini: Ini,
}

impl Config {
    pub fn load() -> Self {
        Self::load_from(CONFIGURATION_FILE)
    }

    pub fn load_from(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let mut ini = Ini::new();

        if let Err(e) = ini.load(path) {
            warn!(
                "Unable to read configuration file {}: {e}",
                path.display()
            );
        }

        Self { ini }
    }

    fn get_string(&self, key: &str, default: &str) -> String {
        match self.ini.get(CONFIGURATION_FILE_SECTION, key) {
            Some(value) => value,
            None => {
                warn!("Unable to get key {key}, using default {default}");
                default.to_owned()
            }
        }
    }

    /// Path of the detached LUKS2 header device.
    pub fn header_device(&self) -> String {
        self.get_string("header_device", DEFAULT_HEADER_DEVICE)
    }

    /// Path of the plaintext/ciphertext data device.
    pub fn data_device(&self) -> String {
        self.get_string("data_device", DEFAULT_DATA_DEVICE)
    }

    /// Device-mapper name of the activated volume.
    pub fn mapped_name(&self) -> String {
        self.get_string("mapped_name", DEFAULT_MAPPED_NAME)
    }

    pub fn cipher(&self) -> String {
        self.get_string("cipher", DEFAULT_CIPHER)
    }

    pub fn cipher_mode(&self) -> String {
        self.get_string("cipher_mode", DEFAULT_CIPHER_MODE)
    }

    /// LUKS2 sector size to format with, when the kernel supports it.
    pub fn sector_size(&self) -> u32 {
        match self.ini.getuint(CONFIGURATION_FILE_SECTION, "sector_size") {
            Ok(Some(value)) => match u32::try_from(value) {
                Ok(value) => value,
                Err(_) => {
                    warn!("sector_size {value} is out of range, using default {DEFAULT_SECTOR_SIZE}");
                    DEFAULT_SECTOR_SIZE
                }
            },
            Ok(None) => {
                warn!("Unable to get key sector_size, using default {DEFAULT_SECTOR_SIZE}");
                DEFAULT_SECTOR_SIZE
            }
            Err(e) => {
                warn!("Unable to parse sector_size: {e}, using default {DEFAULT_SECTOR_SIZE}");
                DEFAULT_SECTOR_SIZE
            }
        }
    }

    /// Use the configured sector size even when the kernel capability probe
    /// does not report support for it.
    pub fn sector_size_force(&self) -> bool {
        match self
            .ini
            .getbool(CONFIGURATION_FILE_SECTION, "sector_size_force")
        {
            Ok(Some(value)) => value,
            Ok(None) => {
                warn!("Unable to get key sector_size_force, using default {DEFAULT_SECTOR_SIZE_FORCE}");
                DEFAULT_SECTOR_SIZE_FORCE
            }
            Err(e) => {
                warn!("Unable to parse sector_size_force: {e}, using default {DEFAULT_SECTOR_SIZE_FORCE}");
                DEFAULT_SECTOR_SIZE_FORCE
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(contents: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.conf"), contents).unwrap();
        dir
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = Config::load_from("/nonexistent/droidian-encryption-service.conf");

        assert_eq!(config.header_device(), DEFAULT_HEADER_DEVICE);
        assert_eq!(config.data_device(), DEFAULT_DATA_DEVICE);
        assert_eq!(config.mapped_name(), DEFAULT_MAPPED_NAME);
        assert_eq!(config.cipher(), DEFAULT_CIPHER);
        assert_eq!(config.cipher_mode(), DEFAULT_CIPHER_MODE);
        assert_eq!(config.sector_size(), DEFAULT_SECTOR_SIZE);
        assert!(!config.sector_size_force());
    }

    #[test]
    fn all_keys_round_trip() {
        let dir = write_config(
            r#"
[droidian-encryption-service]
header_device = /dev/mapper/header
data_device = /dev/mapper/data
mapped_name = rootfs_crypt
cipher = serpent
cipher_mode = cbc-essiv:sha256
sector_size = 512
sector_size_force = true
"#,
        );
        let config = Config::load_from(dir.path().join("config.conf"));

        assert_eq!(config.header_device(), "/dev/mapper/header");
        assert_eq!(config.data_device(), "/dev/mapper/data");
        assert_eq!(config.mapped_name(), "rootfs_crypt");
        assert_eq!(config.cipher(), "serpent");
        assert_eq!(config.cipher_mode(), "cbc-essiv:sha256");
        assert_eq!(config.sector_size(), 512);
        assert!(config.sector_size_force());
    }

    #[test]
    fn missing_section_yields_defaults() {
        let dir = write_config("[other-section]\nheader_device = /dev/null\n");
        let config = Config::load_from(dir.path().join("config.conf"));

        assert_eq!(config.header_device(), DEFAULT_HEADER_DEVICE);
    }

    #[test]
    fn unparseable_values_fall_back() {
        let dir = write_config(
            "[droidian-encryption-service]\nsector_size = not-a-number\nsector_size_force = maybe\n",
        );
        let config = Config::load_from(dir.path().join("config.conf"));

        assert_eq!(config.sector_size(), DEFAULT_SECTOR_SIZE);
        assert!(!config.sector_size_force());
    }
}
