pub mod encryption;

use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use anyhow::{Context as _, Result};
use tokio::{
    signal::unix::{signal, SignalKind},
    sync::mpsc,
};
use zbus::{connection::Builder as ConnectionBuilder, Connection};

use crate::config::Config;

use encryption::Encryption;

pub const BUS_NAME: &str = "org.droidian.EncryptionService";
pub const ENCRYPTION_PATH: &str = "/Encryption";

const IDLE_TICK: Duration = Duration::from_secs(60);
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Monotonic timestamp of the latest authorized method entry, shared between
/// the method handlers and the idle supervisor.
#[derive(Clone)]
pub struct ActivityTimestamp(Arc<Mutex<Instant>>);

impl ActivityTimestamp {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(Instant::now())))
    }

    pub fn register(&self) {
        *self.0.lock().unwrap() = Instant::now();
    }

    fn elapsed(&self) -> Duration {
        self.0.lock().unwrap().elapsed()
    }
}

fn idle_expired(elapsed: Duration) -> bool {
    elapsed > IDLE_TIMEOUT
}

/// The bus-attached half of the service: owns the connection, exports the
/// encryption object and watches for idle periods.
pub struct Daemon {
    connection: Connection,
    idle_rx: mpsc::Receiver<()>,
}

impl Daemon {
    /// Connect to the system bus, export the encryption object at
    /// [`ENCRYPTION_PATH`] and request the well-known name.
    pub async fn connect(config: Arc<Config>) -> Result<Self> {
        let activity = ActivityTimestamp::new();

        let connection = ConnectionBuilder::system()?
            .build()
            .await
            .context("Unable to connect to the system bus")?;

        let encryption = Encryption::new(&connection, config, activity.clone()).await?;
        connection
            .object_server()
            .at(ENCRYPTION_PATH, encryption)
            .await
            .context("Unable to export Encryption DBus interface")?;

        connection
            .request_name(BUS_NAME)
            .await
            .with_context(|| format!("Unable to own {BUS_NAME} on the system bus"))?;

        tracing::debug!("Bus name acquired: {BUS_NAME}");

        let (idle_tx, idle_rx) = mpsc::channel(1);
        tokio::spawn(idle_watch(activity, idle_tx));

        Ok(Self {
            connection,
            idle_rx,
        })
    }

    /// Serve until SIGTERM/SIGINT, or until an idle timeout arrives while the
    /// status permits exiting.
    pub async fn run(mut self) -> Result<()> {
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::warn!("Asked to exit...");
                    break;
                }
                _ = sigint.recv() => {
                    tracing::warn!("Asked to exit...");
                    break;
                }
                Some(()) = self.idle_rx.recv() => {
                    tracing::debug!("Idle timeout reached");

                    let status = self.encryption().await?.get().await.last_status();
                    if status.forbids_idle_exit() {
                        tracing::warn!(
                            "Service will remain in background due to {status} status"
                        );
                    } else {
                        break;
                    }
                }
            }
        }

        // An in-flight format must run to completion before the process goes
        // away; the helper owns everything past that point.
        let worker = self.encryption().await?.get().await.take_worker();
        if let Some(worker) = worker {
            tracing::debug!("Waiting for the encryption worker to finish");
            let _ = worker.await;
        }

        Ok(())
    }

    async fn encryption(&self) -> Result<zbus::object_server::InterfaceRef<Encryption>> {
        self.connection
            .object_server()
            .interface::<_, Encryption>(ENCRYPTION_PATH)
            .await
            .context("Encryption interface is not exported")
    }
}

/// Periodic idle check. Fires at most once: after signalling the main loop it
/// removes itself, matching the one-shot timeout source of the original
/// service.
async fn idle_watch(activity: ActivityTimestamp, idle_tx: mpsc::Sender<()>) {
    let mut tick = tokio::time::interval(IDLE_TICK);
    // The first tick of a tokio interval completes immediately.
    tick.tick().await;

    loop {
        tick.tick().await;

        if idle_expired(activity.elapsed()) {
            let _ = idle_tx.send(()).await;
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_threshold_is_five_minutes() {
        assert!(!idle_expired(Duration::from_secs(0)));
        assert!(!idle_expired(Duration::from_secs(299)));
        assert!(!idle_expired(Duration::from_secs(300)));
        assert!(idle_expired(Duration::from_secs(301)));
    }

    #[test]
    fn register_resets_the_clock() {
        let activity = ActivityTimestamp::new();
        activity.register();
        assert!(activity.elapsed() < IDLE_TIMEOUT);
    }
}
