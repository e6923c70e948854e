use anyhow::{Context as _, Result};
use devicemapper::DM;

/// The dm-crypt target learned the sector_size option in version 1.17.
const SECTOR_SIZE_MIN_VERSION: (u32, u32) = (1, 17);

/// Whether the running kernel's `crypt` device-mapper target accepts a sector
/// size other than 512 bytes.
pub fn crypt_target_supports_sector_size() -> Result<bool> {
    let dm = DM::new().context("Failed to communicating with device-mapper driver")?;
    let versions = dm
        .list_versions()
        .context("Failed to list device-mapper target versions")?;

    Ok(supports_sector_size(&versions))
}

fn supports_sector_size(versions: &[(String, u32, u32, u32)]) -> bool {
    versions
        .iter()
        .any(|(name, major, minor, _)| name == "crypt" && (*major, *minor) >= SECTOR_SIZE_MIN_VERSION)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(name: &str, major: u32, minor: u32) -> (String, u32, u32, u32) {
        (name.to_owned(), major, minor, 0)
    }

    #[test]
    fn old_crypt_target_is_rejected() {
        assert!(!supports_sector_size(&[target("crypt", 1, 16)]));
    }

    #[test]
    fn matching_and_newer_crypt_targets_are_accepted() {
        assert!(supports_sector_size(&[target("crypt", 1, 17)]));
        assert!(supports_sector_size(&[target("crypt", 1, 23)]));
        assert!(supports_sector_size(&[target("crypt", 2, 0)]));
    }

    #[test]
    fn other_targets_do_not_count() {
        assert!(!supports_sector_size(&[
            target("linear", 1, 17),
            target("verity", 1, 20),
        ]));
        assert!(!supports_sector_size(&[]));
    }
}
