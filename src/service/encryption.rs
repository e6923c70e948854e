use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use anyhow::{Context as _, Result};
use libcryptsetup_rs::{
    consts::vals::{CryptReencryptInfo, CryptStatusInfo},
    CryptDevice,
};
use tokio::task;
use zbus::{
    fdo, interface, message::Header, object_server::SignalEmitter, Connection,
};
use zbus_polkit::policykit1::{AuthorityProxy, CheckAuthorizationFlags, Subject};

use crate::{
    config::Config,
    fs::{dm, luks2},
    rundir,
    types::{EncryptionStatus, Passphrase, PASSPHRASE_MAX},
};

use super::{ActivityTimestamp, ENCRYPTION_PATH};

/// Polkit action required to start the initial encryption.
const ACTION_ENCRYPTION_START: &str = "org.droidian.EncryptionService.EncryptionStart";

/// Polkit action guarding each bus method; `None` means always authorized.
fn action_for_method(method: &str) -> Option<&'static str> {
    match method {
        "Start" => Some(ACTION_ENCRYPTION_START),
        "RefreshStatus" => None,
        _ => None,
    }
}

/// State guarded by the encryption process mutex. The worker owns the lock for
/// the whole format + reencrypt-init phase, which is what makes a contended
/// try-acquire mean "operation ongoing".
struct ProcessState {
    /// Crypt context on the header device, opened lazily and kept across
    /// status probes.
    crypt_device: Option<CryptDevice>,
    /// Passphrase staged by Start for the worker. Taken out (and wiped on
    /// drop) by the worker on every path.
    staged_passphrase: Option<Passphrase>,
}

/// The encryption core: owns the published status, authorizes callers and
/// drives the header format + reencryption staging.
pub struct Encryption {
    config: Arc<Config>,
    authority: AuthorityProxy<'static>,
    activity: ActivityTimestamp,
    published: Arc<Mutex<EncryptionStatus>>,
    process: Arc<Mutex<ProcessState>>,
    worker: Mutex<Option<task::JoinHandle<()>>>,
}

impl Encryption {
    pub async fn new(
        connection: &Connection,
        config: Arc<Config>,
        activity: ActivityTimestamp,
    ) -> Result<Self> {
        let authority = AuthorityProxy::new(connection)
            .await
            .context("Error while getting polkit authority")?;

        Ok(Self {
            config,
            authority,
            activity,
            published: Arc::new(Mutex::new(EncryptionStatus::Unknown)),
            process: Arc::new(Mutex::new(ProcessState {
                crypt_device: None,
                staged_passphrase: None,
            })),
            worker: Mutex::new(None),
        })
    }

    /// Last published status, without touching the process mutex.
    pub fn last_status(&self) -> EncryptionStatus {
        *self.published.lock().expect("published status mutex poisoned")
    }

    /// Hand out the worker join handle so the daemon can wait for it on
    /// shutdown.
    pub fn take_worker(&self) -> Option<task::JoinHandle<()>> {
        self.worker.lock().expect("worker slot mutex poisoned").take()
    }

    fn publish(&self, status: EncryptionStatus) {
        *self.published.lock().expect("published status mutex poisoned") = status;
    }

    async fn authorize(&self, header: &Header<'_>, method: &str) -> fdo::Result<()> {
        let Some(action) = action_for_method(method) else {
            return Ok(());
        };

        let subject = Subject::new_for_message_header(header)
            .map_err(|e| fdo::Error::Failed(format!("Authorization error: {e}")))?;

        let result = self
            .authority
            .check_authorization(
                &subject,
                action,
                &HashMap::new(),
                CheckAuthorizationFlags::AllowUserInteraction.into(),
                "",
            )
            .await
            .map_err(|e| fdo::Error::Failed(format!("Authorization error: {e}")))?;

        if result.is_authorized {
            Ok(())
        } else {
            Err(fdo::Error::AccessDenied("Not authorized".to_owned()))
        }
    }

    /// Recompute the published status. Returns the new value when it changed.
    ///
    /// A contended process mutex means the worker is mid-operation: the cached
    /// status (`Configuring`) stands. Sticky states are only ever advanced by
    /// the worker or by the helper's stamps.
    fn derive_status(&self) -> Option<EncryptionStatus> {
        let Ok(mut process) = self.process.try_lock() else {
            return None;
        };

        let current = self.last_status();
        if current.is_sticky() {
            return None;
        }

        let next = probe_status(&self.config, &mut process)?;
        if next == current {
            return None;
        }

        self.publish(next);
        tracing::info!("Encryption status is now {next}");
        Some(next)
    }

    fn spawn_worker(&self, connection: Connection) {
        let config = self.config.clone();
        let process = self.process.clone();
        let published = self.published.clone();

        let handle = tokio::spawn(async move {
            let result =
                task::spawn_blocking(move || run_initial_encryption(&config, &process))
                    .await
                    .context("Encryption worker task failed")
                    .and_then(|result| result);

            let status = match result {
                Ok(()) => {
                    tracing::debug!("Encryption staging finished");
                    EncryptionStatus::Configured
                }
                Err(e) => {
                    tracing::warn!("Unable to start encryption: {e:#}");
                    EncryptionStatus::Failed
                }
            };

            *published.lock().expect("published status mutex poisoned") = status;

            match connection
                .object_server()
                .interface::<_, Encryption>(ENCRYPTION_PATH)
                .await
            {
                Ok(iface) => {
                    if let Err(e) = iface
                        .get()
                        .await
                        .status_changed(iface.signal_emitter())
                        .await
                    {
                        tracing::warn!("Unable to signal status change: {e}");
                    }
                }
                Err(e) => tracing::warn!("Unable to signal status change: {e}"),
            }
        });

        *self.worker.lock().expect("worker slot mutex poisoned") = Some(handle);
    }
}

#[interface(name = "org.droidian.EncryptionService.Encryption")]
impl Encryption {
    /// Begin the header format + reencryption staging with the given
    /// passphrase. A no-op returning success when the status is not
    /// `Unconfigured`.
    async fn start(
        &self,
        passphrase: String,
        #[zbus(connection)] connection: &Connection,
        #[zbus(header)] header: Header<'_>,
        #[zbus(signal_context)] ctxt: SignalEmitter<'_>,
    ) -> fdo::Result<()> {
        self.activity.register();
        self.authorize(&header, "Start").await?;

        let mut bytes = passphrase.into_bytes();
        if bytes.len() > PASSPHRASE_MAX {
            tracing::warn!("Passphrase exceeds {PASSPHRASE_MAX} bytes, truncating");
            bytes.truncate(PASSPHRASE_MAX);
        }
        let passphrase = Passphrase::from(bytes);

        {
            let Ok(mut process) = self.process.try_lock() else {
                // Worker already running; keep the no-op success contract.
                return Ok(());
            };

            let status = self.last_status();
            if status != EncryptionStatus::Unconfigured {
                // TODO: return a typed error instead of a silent success.
                tracing::debug!("Start requested while status is {status}, ignoring");
                return Ok(());
            }

            self.publish(EncryptionStatus::Configuring);
            process.staged_passphrase = Some(passphrase);

            // The worker blocks on the process mutex until this guard drops.
            self.spawn_worker(connection.clone());
        }

        self.status_changed(&ctxt).await?;

        Ok(())
    }

    /// Recompute and publish the current status.
    async fn refresh_status(
        &self,
        #[zbus(signal_context)] ctxt: SignalEmitter<'_>,
    ) -> fdo::Result<()> {
        self.activity.register();

        // The probes issue blocking libcryptsetup and stat calls.
        let changed = task::block_in_place(|| self.derive_status());

        if changed.is_some() {
            self.status_changed(&ctxt).await?;
        }

        Ok(())
    }

    /// Integer value of the status enumeration.
    #[zbus(property)]
    async fn status(&self) -> i32 {
        self.last_status() as i32
    }
}

/// One pass of the status derivation, first match wins. `None` keeps the
/// previously published value.
fn probe_status(config: &Config, process: &mut ProcessState) -> Option<EncryptionStatus> {
    if rundir::helper_pidfile().exists() {
        // Helper pidfile exists, the reencryption child is at work.
        return Some(EncryptionStatus::Encrypting);
    }

    if rundir::helper_failure_stamp().exists() {
        return Some(EncryptionStatus::Failed);
    }

    let header = PathBuf::from(config.header_device());
    let data = PathBuf::from(config.data_device());
    if !header.exists() || !data.exists() {
        return Some(EncryptionStatus::Unsupported);
    }

    if process.crypt_device.is_none() {
        match luks2::open_header(&header) {
            Ok(device) => process.crypt_device = Some(device),
            Err(e) => {
                tracing::warn!("{e:#}");
                return None;
            }
        }
    }
    let device = process.crypt_device.as_mut()?;

    match luks2::status(device, &config.mapped_name()) {
        Ok(CryptStatusInfo::Invalid | CryptStatusInfo::Inactive) => {
            return Some(EncryptionStatus::Unconfigured);
        }
        Ok(CryptStatusInfo::Active | CryptStatusInfo::Busy) => {
            tracing::debug!("Found active or busy encrypted device");
        }
        Err(e) => {
            tracing::warn!("{e:#}");
            return None;
        }
    }

    match luks2::reencrypt_status(device) {
        Ok(info) => Some(status_from_reencrypt(info)),
        Err(e) => {
            tracing::warn!("{e:#}");
            Some(EncryptionStatus::Failed)
        }
    }
}

/// Map the header's reencryption state onto a published status, for a device
/// that is already active.
fn status_from_reencrypt(info: CryptReencryptInfo) -> EncryptionStatus {
    match info {
        // Reencryption has finished, the device is fully encrypted.
        CryptReencryptInfo::None => EncryptionStatus::Encrypted,
        // No errors, but the bulk pass is still ahead or underway.
        CryptReencryptInfo::Clean => EncryptionStatus::Encrypting,
        _ => EncryptionStatus::Failed,
    }
}

/// Format the detached header and stage the reencryption metadata. Runs on a
/// blocking thread, holding the process mutex for the whole operation.
fn run_initial_encryption(config: &Config, process: &Mutex<ProcessState>) -> Result<()> {
    let mut process = process.lock().expect("encryption process mutex poisoned");
    let process = &mut *process;

    // Dropped (and wiped) on every path out of this function.
    let passphrase = process
        .staged_passphrase
        .take()
        .context("No staged passphrase")?;

    let sector_size = if config.sector_size_force() || sector_size_supported() {
        config.sector_size()
    } else {
        tracing::warn!(
            "Sector size is not supported by the running kernel, fallbacking to {}",
            luks2::FALLBACK_SECTOR_SIZE
        );
        luks2::FALLBACK_SECTOR_SIZE
    };

    let header = PathBuf::from(config.header_device());
    if process.crypt_device.is_none() {
        process.crypt_device = Some(luks2::open_header(&header)?);
    }
    let device = process
        .crypt_device
        .as_mut()
        .context("No crypt context")?;

    luks2::format_and_stage_encryption(
        device,
        &luks2::FormatRequest {
            data_device: Path::new(&config.data_device()),
            cipher: &config.cipher(),
            cipher_mode: &config.cipher_mode(),
            sector_size,
        },
        &passphrase,
    )
}

fn sector_size_supported() -> bool {
    match dm::crypt_target_supports_sector_size() {
        Ok(supported) => supported,
        Err(e) => {
            tracing::warn!("{e:#}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_start_requires_an_action() {
        assert_eq!(action_for_method("Start"), Some(ACTION_ENCRYPTION_START));
        assert_eq!(action_for_method("RefreshStatus"), None);
        assert_eq!(action_for_method("Bogus"), None);
    }

    #[test]
    fn reencrypt_state_maps_onto_status() {
        assert_eq!(
            status_from_reencrypt(CryptReencryptInfo::None),
            EncryptionStatus::Encrypted
        );
        assert_eq!(
            status_from_reencrypt(CryptReencryptInfo::Clean),
            EncryptionStatus::Encrypting
        );
        assert_eq!(
            status_from_reencrypt(CryptReencryptInfo::Crash),
            EncryptionStatus::Failed
        );
    }
}
