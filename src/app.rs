//! Application facade.
//!
//! [`Orchestrator`] is what a front-end talks to. It owns the settings snapshot, both
//! device clients and the sequencer, and is the only component that writes the settings
//! file: addresses discovered by a scan come back from the oiler client as values and
//! are persisted here.
//!
//! The settings snapshot is an `Arc<Settings>` published through a `watch` channel, so
//! readers always see a complete, validated value and updates replace it wholesale.
//! Writers are serialized, and derived updates are computed from the snapshot current
//! at write time, so a slow device operation never clobbers a save made meanwhile.

use crate::config::{normalize_identity, Settings};
use crate::error::{AppResult, OilerError};
use crate::hardware::capabilities::{Dispenser, InstrumentControl, ZMove};
use crate::hardware::instrument::{InstrumentClient, InstrumentOptions};
use crate::hardware::oiler::{PeripheralClient, PeripheralOptions, ResolvedAddress, WirelessAdapter};
use crate::messages::{BatteryReading, RunEvent, StatusBus, StatusEvent};
use crate::procedures::{ProcedureKind, ProcedureParams, ProcedureRun, Sequencer};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Coordinates the controller, the oiler and the procedures.
pub struct Orchestrator {
    settings_path: PathBuf,
    settings: watch::Sender<Arc<Settings>>,
    /// Held across read-modify-write of the settings file
    settings_write: Mutex<()>,
    instrument: Arc<InstrumentClient>,
    peripheral: PeripheralClient,
    sequencer: Sequencer,
    status: StatusBus,
}

impl Orchestrator {
    /// Load settings from `settings_path` and start the device clients.
    pub fn open(
        settings_path: impl Into<PathBuf>,
        adapter: Arc<dyn WirelessAdapter>,
    ) -> AppResult<Self> {
        let settings_path = settings_path.into();
        let settings = Settings::load(&settings_path)?;
        Self::with_options(
            settings_path,
            settings,
            adapter,
            InstrumentOptions::default(),
            PeripheralOptions::default(),
        )
    }

    /// Start the device clients around an already loaded snapshot.
    pub fn with_options(
        settings_path: impl Into<PathBuf>,
        settings: Settings,
        adapter: Arc<dyn WirelessAdapter>,
        instrument_options: InstrumentOptions,
        peripheral_options: PeripheralOptions,
    ) -> AppResult<Self> {
        settings.validate()?;
        let status = StatusBus::default();
        let instrument = Arc::new(InstrumentClient::with_options(
            status.clone(),
            instrument_options,
        ));
        let peripheral = PeripheralClient::spawn(adapter, peripheral_options, status.clone())?;

        let sequencer = Sequencer::new(
            instrument.clone() as Arc<dyn InstrumentControl>,
            Arc::new(peripheral.clone()) as Arc<dyn Dispenser>,
        );
        let (settings, _) = watch::channel(Arc::new(settings));

        Ok(Self {
            settings_path: settings_path.into(),
            settings,
            settings_write: Mutex::new(()),
            instrument,
            peripheral,
            sequencer,
            status,
        })
    }

    // =========================================================================
    // Settings
    // =========================================================================

    /// Current snapshot.
    pub fn settings(&self) -> Arc<Settings> {
        self.settings.borrow().clone()
    }

    /// File the snapshot is persisted to.
    pub fn settings_path(&self) -> &Path {
        &self.settings_path
    }

    /// Observe snapshot replacements.
    pub fn watch_settings(&self) -> watch::Receiver<Arc<Settings>> {
        self.settings.subscribe()
    }

    /// Re-read the settings file and replace the snapshot.
    pub async fn load_settings(&self) -> AppResult<Arc<Settings>> {
        let _write = self.settings_write.lock().await;
        let path = self.settings_path.clone();
        let loaded = tokio::task::spawn_blocking(move || Settings::load(path))
            .await
            .map_err(|e| OilerError::Io(std::io::Error::other(e)))??;
        let loaded = Arc::new(loaded);
        self.settings.send_replace(loaded.clone());
        Ok(loaded)
    }

    /// Persist `snapshot` atomically, then make it current.
    ///
    /// The in-memory snapshot is only replaced once the file is on disk.
    pub async fn save_settings(&self, snapshot: Settings) -> AppResult<()> {
        let _write = self.settings_write.lock().await;
        self.write_settings(snapshot).await
    }

    /// Derive a new snapshot from the current one and persist it.
    ///
    /// `update` sees the snapshot as of the write, not as of the caller's start.
    pub async fn update_settings(
        &self,
        update: impl FnOnce(&Settings) -> Settings,
    ) -> AppResult<Arc<Settings>> {
        let _write = self.settings_write.lock().await;
        let next = update(&self.settings());
        self.write_settings(next).await?;
        Ok(self.settings())
    }

    async fn write_settings(&self, snapshot: Settings) -> AppResult<()> {
        let path = self.settings_path.clone();
        let snapshot = Arc::new(snapshot);
        let to_write = snapshot.clone();
        tokio::task::spawn_blocking(move || to_write.save(path))
            .await
            .map_err(|e| OilerError::Io(std::io::Error::other(e)))??;
        self.settings.send_replace(snapshot);
        info!(path = %self.settings_path.display(), "Settings saved");
        Ok(())
    }

    // =========================================================================
    // Devices
    // =========================================================================

    /// Attach a status observer.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.status.subscribe()
    }

    /// Controller client, for direct queries.
    pub fn instrument(&self) -> &InstrumentClient {
        &self.instrument
    }

    /// Oiler client, for direct queries.
    pub fn peripheral(&self) -> &PeripheralClient {
        &self.peripheral
    }

    /// Connect to the controller at the configured endpoint.
    pub async fn connect_instrument(&self) -> AppResult<()> {
        let endpoint = self.settings().instrument.clone();
        self.instrument.connect(&endpoint).await
    }

    /// Connect to the oiler `identity`, or the selected one when `None`.
    ///
    /// A cached address is tried first. When there is none, or it no longer answers,
    /// a scan runs and the discovered address is remembered and saved together with
    /// the selection.
    pub async fn connect_peripheral(&self, identity: Option<&str>) -> AppResult<ResolvedAddress> {
        let settings = self.settings();
        let identity = normalize_identity(identity.unwrap_or(&settings.peripheral.identity));

        if let Some(address) = settings.known_address(&identity) {
            match self.peripheral.connect(address).await {
                Ok(()) => {
                    if settings.peripheral.identity != identity {
                        self.persist(|current| current.select_peripheral(&identity))
                            .await;
                    }
                    return Ok(ResolvedAddress {
                        identity,
                        address: address.to_string(),
                        discovered: false,
                    });
                }
                Err(e @ OilerError::Protocol(_)) => return Err(e),
                Err(e) => {
                    warn!(%identity, %address, "Cached oiler address failed, scanning: {}", e)
                }
            }
        }

        let resolved = self.peripheral.scan(&identity).await?;
        self.peripheral.connect(&resolved.address).await?;

        self.persist(|current| {
            current
                .remember_peripheral(&identity, &resolved.address)
                .select_peripheral(&identity)
        })
        .await;
        Ok(resolved)
    }

    /// Save without failing the caller; the device side already succeeded.
    async fn persist(&self, update: impl FnOnce(&Settings) -> Settings) {
        if let Err(e) = self.update_settings(update).await {
            error!("Failed to persist oiler selection: {}", e);
        }
    }

    /// Fresh battery reading from the oiler.
    pub async fn query_battery(&self) -> AppResult<BatteryReading> {
        self.peripheral.query_battery().await
    }

    /// Round-trip a ping to the oiler.
    pub async fn ping_peripheral(&self) -> AppResult<()> {
        self.peripheral.ping().await
    }

    /// Manual focus drop by the configured distance.
    ///
    /// Holds the run slot for the duration of the move, so it can neither interleave
    /// with a procedure nor let one start halfway through.
    pub async fn lower_stage(&self) -> AppResult<()> {
        let _slot = self.sequencer.reserve()?;
        let distance = self.settings().operation.default_z_drop_microns;
        self.instrument.move_z(ZMove::Relative(-distance)).await
    }

    /// Close both links.
    pub async fn disconnect_all(&self) {
        self.instrument.disconnect().await;
        self.peripheral.disconnect().await;
    }

    // =========================================================================
    // Procedures
    // =========================================================================

    fn ensure_connected(&self) -> AppResult<ProcedureParams> {
        if self.sequencer.is_running() {
            return Err(OilerError::Busy);
        }
        if !self.instrument.is_connected() {
            return Err(OilerError::Connection(
                "stage/objective controller is not connected".to_string(),
            ));
        }
        if !self.peripheral.is_connected() {
            return Err(OilerError::Connection("oiler is not connected".to_string()));
        }
        Ok(ProcedureParams::from(&self.settings().operation))
    }

    /// Run `kind` to completion.
    pub async fn run_procedure(
        &self,
        kind: ProcedureKind,
        events: Option<mpsc::UnboundedSender<RunEvent>>,
    ) -> AppResult<ProcedureRun> {
        let params = self.ensure_connected()?;
        self.sequencer.run(kind, params, events).await
    }

    /// Start `kind` in the background.
    pub fn start_procedure(
        &self,
        kind: ProcedureKind,
        events: Option<mpsc::UnboundedSender<RunEvent>>,
    ) -> AppResult<JoinHandle<ProcedureRun>> {
        let params = self.ensure_connected()?;
        self.sequencer.spawn(kind, params, events)
    }

    /// Cancel the active run at its next step boundary.
    pub fn cancel(&self) -> bool {
        self.sequencer.cancel()
    }

    /// Whether a procedure or manual move holds the run slot.
    pub fn is_running(&self) -> bool {
        self.sequencer.is_running()
    }

    /// Disconnect everything and stop the oiler worker.
    pub async fn shutdown(&self) {
        self.disconnect_all().await;
        self.peripheral.shutdown().await;
    }
}
