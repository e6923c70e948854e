use std::path::Path;

use anyhow::{Context as _, Result};
use libcryptsetup_rs::{
    consts::{
        flags::{CryptActivate, CryptReencrypt, CryptVolumeKey},
        vals::{
            CryptDebugLevel, CryptReencryptDirectionInfo, CryptReencryptInfo,
            CryptReencryptModeInfo, CryptStatusInfo, EncryptionFormat,
        },
    },
    CryptDevice, CryptInit, CryptParamsLuks2, CryptParamsLuks2Ref, CryptParamsReencrypt,
};

use crate::types::Passphrase;

use super::get_verbose;

const LUKS2_VOLUME_KEY_SIZE_BIT: usize = 512;

/// Sector size used when the running kernel's dm-crypt predates the
/// sector_size option.
pub const FALLBACK_SECTOR_SIZE: u32 = 512;

const REENCRYPT_RESILIENCE: &str = "checksum";
const REENCRYPT_HASH: &str = "sha256";

/// Progress callback handed to the reencryption loop. A non-zero return asks
/// libcryptsetup to stop at the next checkpoint.
pub type ReencryptProgress = unsafe extern "C" fn(
    size: u64,
    offset: u64,
    usrptr: *mut std::ffi::c_void,
) -> std::ffi::c_int;

fn apply_debug_level() {
    if get_verbose() {
        libcryptsetup_rs::set_debug_level(CryptDebugLevel::All);
    } else {
        libcryptsetup_rs::set_debug_level(CryptDebugLevel::None);
    }
}

/// Open a crypt context on a detached header device.
pub fn open_header(header: &Path) -> Result<CryptDevice> {
    apply_debug_level();

    CryptInit::init(header)
        .with_context(|| format!("Failed to init crypt context on {}", header.display()))
}

/// Open a crypt context on a detached header paired with its data device.
pub fn open_with_data_device(header: &Path, data: &Path) -> Result<CryptDevice> {
    apply_debug_level();

    CryptInit::init_with_data_device(libcryptsetup_rs::Either::Right((header, data))).with_context(|| {
        format!(
            "Failed to init crypt context on {} with data device {}",
            header.display(),
            data.display()
        )
    })
}

pub struct FormatRequest<'a> {
    pub data_device: &'a Path,
    pub cipher: &'a str,
    pub cipher_mode: &'a str,
    pub sector_size: u32,
}

fn luks2_params(data_device: Option<&Path>, sector_size: u32) -> CryptParamsLuks2 {
    CryptParamsLuks2 {
        pbkdf: None,
        integrity: None,
        integrity_params: None,
        data_alignment: 0,
        data_device: data_device.map(Path::to_path_buf),
        sector_size,
        label: None,
        subsystem: None,
    }
}

/// Format the detached header as LUKS2 and persist the reencryption metadata
/// describing the intended in-place encryption, without moving any data yet.
///
/// The data offset is pinned at 0 so the ciphertext occupies exactly the space
/// of the previous plaintext.
pub fn format_and_stage_encryption(
    device: &mut CryptDevice,
    request: &FormatRequest<'_>,
    passphrase: &Passphrase,
) -> Result<()> {
    apply_debug_level();

    device
        .set_data_offset(0)
        .context("Failed to set data offset on header")?;

    let params = luks2_params(Some(request.data_device), request.sector_size);
    let mut params_ref = (&params).try_into()?;

    device
        .context_handle()
        .format::<CryptParamsLuks2Ref>(
            EncryptionFormat::Luks2,
            (request.cipher, request.cipher_mode),
            None,
            libcryptsetup_rs::Either::Right(LUKS2_VOLUME_KEY_SIZE_BIT / 8),
            Some(&mut params_ref),
        )
        .with_context(|| {
            format!(
                "Failed to format {} as LUKS2 header",
                request.data_device.display()
            )
        })?;

    device
        .keyslot_handle()
        .add_by_key(
            None,
            Some(libcryptsetup_rs::Either::Right(
                LUKS2_VOLUME_KEY_SIZE_BIT / 8,
            )),
            passphrase.as_bytes(),
            CryptVolumeKey::empty(),
        )
        .context("Failed to bind passphrase to the volume key")?;

    let reencrypt_params = CryptParamsReencrypt {
        mode: CryptReencryptModeInfo::Encrypt,
        direction: CryptReencryptDirectionInfo::Forward,
        resilience: REENCRYPT_RESILIENCE.to_owned(),
        hash: REENCRYPT_HASH.to_owned(),
        data_shift: 0,
        max_hotzone_size: 0,
        device_size: 0,
        luks2: Some(luks2_params(Some(request.data_device), request.sector_size)),
        flags: CryptReencrypt::INITIALIZE_ONLY,
    };

    device
        .reencrypt_handle()
        .reencrypt_init_by_passphrase(
            None,
            passphrase.as_bytes(),
            None,
            None,
            Some((request.cipher, request.cipher_mode)),
            reencrypt_params,
        )
        .context("Failed to initialize reencryption metadata")?;

    Ok(())
}

/// Load the LUKS2 metadata from the header and activate the volume under
/// `name` using any keyslot matching the passphrase.
pub fn activate(device: &mut CryptDevice, name: &str, passphrase: &Passphrase) -> Result<()> {
    apply_debug_level();

    device
        .context_handle()
        .load::<()>(Some(EncryptionFormat::Luks2), None)
        .context("Unable to load LUKS2 header")?;

    device
        .activate_handle()
        .activate_by_passphrase(
            Some(name),
            None,
            passphrase.as_bytes(),
            CryptActivate::empty(),
        )
        .with_context(|| format!("Unable to activate device as {name}"))?;

    Ok(())
}

/// Device-mapper status of the mapped volume.
pub fn status(device: &mut CryptDevice, name: &str) -> Result<CryptStatusInfo> {
    apply_debug_level();

    libcryptsetup_rs::status(Some(device), name)
        .with_context(|| format!("Failed to query crypt status of {name}"))
}

/// Reencryption state recorded in the LUKS2 header.
pub fn reencrypt_status(device: &mut CryptDevice) -> Result<CryptReencryptInfo> {
    apply_debug_level();

    device
        .reencrypt_handle()
        .status(empty_reencrypt_params())
        .context("Failed to query reencryption status")
}

/// Resume a previously staged reencryption and run it to completion, or until
/// the progress callback requests an interruption.
pub fn resume_reencryption(
    device: &mut CryptDevice,
    name: &str,
    passphrase: &Passphrase,
    progress: ReencryptProgress,
) -> Result<()> {
    apply_debug_level();

    // The reencryption parameters are reloaded from the header; only the
    // resilience settings and the resume flag are ours to provide.
    let params = CryptParamsReencrypt {
        mode: CryptReencryptModeInfo::Reencrypt,
        direction: CryptReencryptDirectionInfo::Forward,
        resilience: REENCRYPT_RESILIENCE.to_owned(),
        hash: REENCRYPT_HASH.to_owned(),
        data_shift: 0,
        max_hotzone_size: 0,
        device_size: 0,
        luks2: Some(luks2_params(None, 0)),
        flags: CryptReencrypt::RESUME_ONLY,
    };

    let cipher = device
        .status_handle()
        .get_cipher()
        .context("Failed to read cipher from header")?;
    let cipher_mode = device
        .status_handle()
        .get_cipher_mode()
        .context("Failed to read cipher mode from header")?;

    device
        .reencrypt_handle()
        .reencrypt_init_by_passphrase(
            Some(name),
            passphrase.as_bytes(),
            None,
            None,
            Some((cipher.as_str(), cipher_mode.as_str())),
            params,
        )
        .with_context(|| format!("Unable to resume reencryption on {name}"))?;

    device
        .reencrypt_handle()
        .reencrypt2::<std::ffi::c_void>(Some(progress), None)
        .with_context(|| format!("Reencryption run failed on {name}"))?;

    Ok(())
}

fn empty_reencrypt_params() -> CryptParamsReencrypt {
    CryptParamsReencrypt {
        mode: CryptReencryptModeInfo::Reencrypt,
        direction: CryptReencryptDirectionInfo::Forward,
        resilience: String::new(),
        hash: String::new(),
        data_shift: 0,
        max_hotzone_size: 0,
        device_size: 0,
        luks2: Some(luks2_params(None, 0)),
        flags: CryptReencrypt::empty(),
    }
}
