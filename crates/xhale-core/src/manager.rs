//! Connection state machine and session owner.
//!
//! [`SessionManager`] owns every piece of mutable session state: the
//! discovered-device set, the current connection, the sampling gate and the
//! duration tracker. It runs as a single task that selects over three
//! inputs:
//!
//! - commands from [`SessionHandle`]s
//! - [`TransportEvent`]s from the Bluetooth stack
//! - completions of the transport and store calls it spawned
//!
//! Nothing else mutates the state, so transport callbacks and store
//! listeners never interleave writes. Consumers read published
//! [`SessionSnapshot`]s through a `watch` channel and receive
//! [`SessionEvent`]s for things that happened.
//!
//! Every connection attempt gets a fresh generation number. Completions and
//! listener snapshots carry the generation that spawned them; anything from
//! an earlier generation is logged and dropped.
//!
//! Duration reads and writes go through one worker in the order the manager
//! issues them, so an in-progress marker can never land after the write
//! that ends its session.
//!
//! ```text
//! Disconnected ──scan──▶ Discovering ──connect──▶ Connecting ──link up──▶ ServiceDiscovery
//!      ▲                                              │                         │
//!      │                                           failure                 subscribed
//!      │                                              ▼                         ▼
//!      └──────────────── cleanup ◀── Disconnecting ◀──disconnect── Connected ◀──┘
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::advertisement::AdvertisementProcessor;
use crate::config::Config;
use crate::decoder::{
    decode, decode_serial_number, Characteristic, Decoded, DEVICE_INFORMATION_SERVICE,
    ENVIRONMENTAL_SENSING_SERVICE,
};
use crate::duration::{DurationRecord, DurationTracker, FinalTotal};
use crate::sampling::{SampleSummary, SamplingGate};
use crate::store::{sensor_data_collection, DocumentKey, Fields, RemoteStore, StoreError};
use crate::transport::{Transport, TransportError, TransportEvent, TransportEvents};
use crate::types::{ConnectionState, HardwareAddress, SensorKind, SessionId, SessionSnapshot};

const COMMAND_CAPACITY: usize = 32;
const EVENT_CAPACITY: usize = 64;

/// Runtime settings of a [`SessionManager`].
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    /// Service UUID passed to the transport as the scan filter.
    pub service_filter: Uuid,
    /// Open an untimed sampling window when a sensor connects.
    pub start_sampling_on_connect: bool,
    /// Period of the live-duration tick.
    pub tick_interval: Duration,
    /// Minimum gap between retries of a failed final duration write.
    pub retry_interval: Duration,
    /// Account whose documents are read and written.
    pub account_id: String,
}

impl From<&Config> for ManagerSettings {
    fn from(config: &Config) -> Self {
        Self {
            service_filter: config.bluetooth.service_uuid,
            start_sampling_on_connect: config.sampling.start_on_connect,
            tick_interval: config.tick_interval(),
            retry_interval: config.retry_interval(),
            account_id: config.store.account_id.clone(),
        }
    }
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

/// Why a command was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ManagerError {
    /// The session id is not in the discovered set.
    #[error("Device {0} has not been discovered")]
    UnknownDevice(SessionId),

    /// A connection already owns the session.
    #[error("Session is busy ({0:?})")]
    Busy(ConnectionState),

    /// No sensor is connected or connecting.
    #[error("No sensor is connected")]
    NotConnected,

    /// The adapter is powered off.
    #[error("Bluetooth adapter is powered off")]
    AdapterPoweredOff,

    /// The manager task has stopped.
    #[error("Session manager has stopped")]
    Stopped,
}

/// Something that happened in the session, for consumers that react to
/// transitions rather than poll snapshots.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Services are subscribed and telemetry is flowing.
    Connected {
        /// Connected device.
        session_id: SessionId,
        /// Its hardware address, when known.
        hardware_address: Option<HardwareAddress>,
    },
    /// A connection attempt failed. It is not retried.
    ConnectFailed {
        /// Device that was being connected.
        session_id: SessionId,
        /// Failure description.
        reason: String,
    },
    /// A session ended.
    Disconnected {
        /// Device that was connected.
        session_id: SessionId,
        /// Why, when the link was lost rather than closed.
        reason: Option<String>,
    },
    /// The connected device never advertised its hardware address, so its
    /// usage is not tracked.
    TrackingUnavailable {
        /// Connected device.
        session_id: SessionId,
    },
    /// A sampling window closed.
    SamplingFinished(SampleSummary),
    /// A scan could not be started.
    ScanFailed(String),
    /// A final duration write failed; it will be retried.
    PersistenceFailed {
        /// Sensor whose total was not stored.
        hardware_address: HardwareAddress,
        /// Failure description.
        message: String,
    },
}

type Reply = oneshot::Sender<Result<(), ManagerError>>;

enum Command {
    StartScanning(Reply),
    StopScanning(Reply),
    Connect(SessionId, Reply),
    Disconnect(Reply),
    StartSampling(Option<Duration>, Reply),
    StopSampling(Reply),
    Shutdown(oneshot::Sender<()>),
}

#[derive(Debug, Default)]
struct GattSetup {
    subscribed: Vec<Uuid>,
    serial_number: Option<Vec<u8>>,
    initial_values: Vec<(Characteristic, Vec<u8>)>,
}

enum Completion {
    ScanStarted(Result<(), TransportError>),
    LinkUp {
        session_id: SessionId,
        generation: u64,
        result: Result<(), TransportError>,
    },
    GattReady {
        session_id: SessionId,
        generation: u64,
        result: Result<GattSetup, TransportError>,
    },
    LinkDown {
        session_id: SessionId,
        generation: u64,
        result: Result<(), TransportError>,
    },
    RemoteFetched {
        address: HardwareAddress,
        generation: u64,
        result: Result<Option<Fields>, StoreError>,
    },
    RemoteChanged {
        address: HardwareAddress,
        generation: u64,
        fields: Fields,
    },
    FinalWritten {
        address: HardwareAddress,
        total: FinalTotal,
        result: Result<f64, StoreError>,
    },
}

/// Store work for duration documents, applied strictly in order.
enum DurationJob {
    Fetch {
        address: HardwareAddress,
        key: DocumentKey,
        generation: u64,
    },
    Marker {
        address: HardwareAddress,
        key: DocumentKey,
        fields: Fields,
    },
    Final(FinalWrite),
    Drain(oneshot::Sender<()>),
}

struct Tracking {
    address: HardwareAddress,
    key: DocumentKey,
    listener: JoinHandle<()>,
}

struct CurrentSession {
    session_id: SessionId,
    generation: u64,
    serial_number: Option<String>,
    subscribed: Vec<Uuid>,
    tracking: Option<Tracking>,
    tracking_degraded: bool,
}

struct FinalWrite {
    address: HardwareAddress,
    key: DocumentKey,
    total: FinalTotal,
}

/// Owner of all session state. See the module docs.
pub struct SessionManager {
    settings: ManagerSettings,
    transport: Arc<dyn Transport>,
    store: Arc<dyn RemoteStore>,
    transport_events: TransportEvents,
    commands: mpsc::Receiver<Command>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions: mpsc::UnboundedReceiver<Completion>,
    scan_requests_tx: mpsc::UnboundedSender<bool>,
    scan_requests: Option<mpsc::UnboundedReceiver<bool>>,
    duration_jobs_tx: mpsc::UnboundedSender<DurationJob>,
    duration_jobs: Option<mpsc::UnboundedReceiver<DurationJob>>,
    snapshots: watch::Sender<SessionSnapshot>,
    events: broadcast::Sender<SessionEvent>,

    advertisements: AdvertisementProcessor,
    gate: SamplingGate,
    tracker: DurationTracker,
    adapter_powered: bool,
    is_scanning: bool,
    state: ConnectionState,
    current: Option<CurrentSession>,
    next_generation: u64,
    decode_failures: u64,
}

impl SessionManager {
    /// Create a manager and the handle that drives it. Nothing happens until
    /// [`SessionManager::run`] is awaited.
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        transport_events: TransportEvents,
        store: Arc<dyn RemoteStore>,
        settings: ManagerSettings,
    ) -> (Self, SessionHandle) {
        let (commands_tx, commands) = mpsc::channel(COMMAND_CAPACITY);
        let (completions_tx, completions) = mpsc::unbounded_channel();
        let (scan_requests_tx, scan_requests) = mpsc::unbounded_channel();
        let (duration_jobs_tx, duration_jobs) = mpsc::unbounded_channel();
        let (snapshots, snapshot_rx) = watch::channel(SessionSnapshot::default());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let handle = SessionHandle {
            commands: commands_tx,
            snapshots: snapshot_rx,
            events: events.clone(),
            store: Arc::clone(&store),
            account_id: Arc::from(settings.account_id.as_str()),
        };

        let manager = Self {
            settings,
            transport,
            store,
            transport_events,
            commands,
            completions_tx,
            completions,
            scan_requests_tx,
            scan_requests: Some(scan_requests),
            duration_jobs_tx,
            duration_jobs: Some(duration_jobs),
            snapshots,
            events,
            advertisements: AdvertisementProcessor::new(),
            gate: SamplingGate::new(),
            tracker: DurationTracker::new(),
            adapter_powered: false,
            is_scanning: false,
            state: ConnectionState::Disconnected,
            current: None,
            next_generation: 0,
            decode_failures: 0,
        };
        (manager, handle)
    }

    /// Create a manager and run it on a new task.
    #[must_use]
    pub fn spawn(
        transport: Arc<dyn Transport>,
        transport_events: TransportEvents,
        store: Arc<dyn RemoteStore>,
        settings: ManagerSettings,
    ) -> (SessionHandle, JoinHandle<()>) {
        let (manager, handle) = Self::new(transport, transport_events, store, settings);
        (handle, tokio::spawn(manager.run()))
    }

    /// Run the event loop until shut down or every handle is dropped.
    pub async fn run(mut self) {
        let mut tick = tokio::time::interval(self.settings.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let scan_worker = self.spawn_scan_worker();
        let duration_worker = self.spawn_duration_worker();
        info!(account_id = %self.settings.account_id, "Session manager started");

        let shutdown_reply = loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown(reply)) => break Some(reply),
                    Some(command) => self.handle_command(command),
                    None => break None,
                },
                Some(event) = self.transport_events.recv() => self.handle_transport_event(event),
                Some(completion) = self.completions.recv() => self.handle_completion(completion),
                _ = tick.tick() => self.on_tick(),
            }
            self.publish();
        };

        self.shutdown().await;
        for worker in [scan_worker, duration_worker].into_iter().flatten() {
            worker.abort();
        }
        if let Some(reply) = shutdown_reply {
            let _ = reply.send(());
        }
    }

    // =========================================================================
    // COMMANDS
    // =========================================================================

    fn handle_command(&mut self, command: Command) {
        let (reply, result) = match command {
            Command::StartScanning(reply) => (reply, self.start_scanning()),
            Command::StopScanning(reply) => (reply, self.stop_scanning()),
            Command::Connect(session_id, reply) => (reply, self.connect(session_id)),
            Command::Disconnect(reply) => (reply, self.disconnect()),
            Command::StartSampling(length, reply) => (reply, self.start_sampling(length)),
            Command::StopSampling(reply) => (reply, self.stop_sampling()),
            Command::Shutdown(_) => return,
        };
        let _ = reply.send(result);
    }

    fn start_scanning(&mut self) -> Result<(), ManagerError> {
        if !self.adapter_powered {
            warn!("Scan requested while the adapter is powered off");
            return Err(ManagerError::AdapterPoweredOff);
        }
        if !self.is_scanning {
            info!(service = %self.settings.service_filter, "Scanning started");
            self.set_scanning(true);
        }
        Ok(())
    }

    fn stop_scanning(&mut self) -> Result<(), ManagerError> {
        if self.is_scanning {
            info!("Scanning stopped");
            self.set_scanning(false);
        }
        Ok(())
    }

    fn set_scanning(&mut self, scanning: bool) {
        self.is_scanning = scanning;
        if !self.state.is_busy() {
            self.state = self.idle_state();
        }
        let _ = self.scan_requests_tx.send(scanning);
    }

    fn connect(&mut self, session_id: SessionId) -> Result<(), ManagerError> {
        if self.state.is_busy() {
            return Err(ManagerError::Busy(self.state));
        }
        if !self.advertisements.contains(&session_id) {
            return Err(ManagerError::UnknownDevice(session_id));
        }

        self.next_generation += 1;
        let generation = self.next_generation;
        self.current = Some(CurrentSession {
            session_id: session_id.clone(),
            generation,
            serial_number: None,
            subscribed: Vec::new(),
            tracking: None,
            tracking_degraded: false,
        });
        self.state = ConnectionState::Connecting;
        info!(session_id = %session_id, generation, "Connecting");

        let transport = Arc::clone(&self.transport);
        self.spawn_completion(async move {
            let result = transport.connect(&session_id).await;
            Completion::LinkUp {
                session_id,
                generation,
                result,
            }
        });
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), ManagerError> {
        let Some(session) = self.current.as_ref() else {
            return Err(ManagerError::NotConnected);
        };
        if self.state == ConnectionState::Disconnecting {
            return Ok(());
        }
        let session_id = session.session_id.clone();
        let generation = session.generation;
        info!(session_id = %session_id, "Disconnecting");
        self.request_link_down(session_id, generation);
        Ok(())
    }

    fn request_link_down(&mut self, session_id: SessionId, generation: u64) {
        self.state = ConnectionState::Disconnecting;
        let transport = Arc::clone(&self.transport);
        self.spawn_completion(async move {
            let result = transport.disconnect(&session_id).await;
            Completion::LinkDown {
                session_id,
                generation,
                result,
            }
        });
    }

    fn start_sampling(&mut self, length: Option<Duration>) -> Result<(), ManagerError> {
        let now = Utc::now();
        match length.and_then(|l| chrono::Duration::from_std(l).ok()) {
            Some(length) => {
                info!(secs = length.num_seconds(), "Timed sampling started");
                self.gate.start_timed(now, length);
            }
            None => {
                info!("Sampling started");
                self.gate.start();
            }
        }
        Ok(())
    }

    fn stop_sampling(&mut self) -> Result<(), ManagerError> {
        self.close_sampling_window();
        Ok(())
    }

    fn close_sampling_window(&mut self) {
        if self.gate.is_active() {
            self.gate.stop();
            let summary = self.gate.summary();
            info!(
                temperature_count = summary.temperature_count,
                carbon_monoxide_count = summary.carbon_monoxide_count,
                "Sampling stopped"
            );
            self.emit(SessionEvent::SamplingFinished(summary));
        }
    }

    // =========================================================================
    // TRANSPORT EVENTS
    // =========================================================================

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Discovered(advertisement) => {
                if !self.is_scanning {
                    debug!(session_id = %advertisement.session_id, "Advertisement outside scan dropped");
                    return;
                }
                self.advertisements.process(advertisement, Utc::now());
            }
            TransportEvent::Notification {
                session_id,
                characteristic,
                payload,
            } => self.on_notification(&session_id, characteristic, &payload),
            TransportEvent::Disconnected { session_id, reason } => {
                let is_current = self
                    .current
                    .as_ref()
                    .is_some_and(|s| s.session_id == session_id);
                if is_current {
                    info!(session_id = %session_id, reason = ?reason, "Link lost");
                    self.finish_session(reason);
                } else if self.advertisements.remove(&session_id) {
                    debug!(session_id = %session_id, "Dropped disconnected device from discovered set");
                }
            }
            TransportEvent::AdapterPowered(powered) => self.on_adapter_powered(powered),
        }
    }

    fn on_notification(&mut self, session_id: &SessionId, characteristic: Uuid, payload: &[u8]) {
        let is_current = self.state == ConnectionState::Connected
            && self
                .current
                .as_ref()
                .is_some_and(|s| &s.session_id == session_id);
        if !is_current {
            debug!(session_id = %session_id, "Notification for inactive session dropped");
            return;
        }
        let Some(characteristic) = Characteristic::from_uuid(characteristic) else {
            debug!(characteristic = %characteristic, "Notification for unknown characteristic");
            return;
        };
        self.apply_payload(characteristic, payload, Utc::now());
    }

    fn apply_payload(&mut self, characteristic: Characteristic, payload: &[u8], now: DateTime<Utc>) {
        match decode(characteristic, payload) {
            Ok(Decoded::Reading(kind, value)) => {
                self.expire_sampling(now);
                self.gate.ingest(kind, value, now);
            }
            Ok(Decoded::SerialNumber(serial)) => {
                if let Some(session) = self.current.as_mut() {
                    session.serial_number = Some(serial);
                }
            }
            Err(e) => {
                self.decode_failures += 1;
                debug!(error = %e, "Dropping undecodable payload");
            }
        }
    }

    fn on_adapter_powered(&mut self, powered: bool) {
        if powered == self.adapter_powered {
            return;
        }
        self.adapter_powered = powered;
        if powered {
            info!("Bluetooth adapter powered on");
            return;
        }

        warn!("Bluetooth adapter powered off");
        self.is_scanning = false;
        let _ = self.scan_requests_tx.send(false);
        if self.current.is_some() {
            self.finish_session(Some("adapter powered off".to_string()));
        }
        self.state = self.idle_state();
    }

    // =========================================================================
    // COMPLETIONS
    // =========================================================================

    fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::ScanStarted(result) => {
                if let Err(e) = result {
                    warn!(error = %e, "Failed to start scan");
                    if self.is_scanning {
                        self.is_scanning = false;
                        if !self.state.is_busy() {
                            self.state = self.idle_state();
                        }
                    }
                    self.emit(SessionEvent::ScanFailed(e.to_string()));
                }
            }
            Completion::LinkUp {
                session_id,
                generation,
                result,
            } => self.on_link_up(session_id, generation, result),
            Completion::GattReady {
                session_id,
                generation,
                result,
            } => self.on_gatt_ready(session_id, generation, result),
            Completion::LinkDown {
                session_id,
                generation,
                result,
            } => {
                if let Err(e) = result {
                    warn!(session_id = %session_id, error = %e, "Disconnect reported an error");
                }
                if self.is_current(&session_id, generation) {
                    self.finish_session(None);
                }
            }
            Completion::RemoteFetched {
                address,
                generation,
                result,
            } => self.on_remote_fetched(address, generation, result),
            Completion::RemoteChanged {
                address,
                generation,
                fields,
            } => {
                let record = DurationRecord::from_fields(&fields);
                if !self.tracker.apply_remote(address, generation, record) {
                    debug!(address = %address, generation, "Stale duration snapshot dropped");
                }
            }
            Completion::FinalWritten {
                address,
                total,
                result,
            } => self.on_final_written(address, total, result),
        }
    }

    fn is_current(&self, session_id: &SessionId, generation: u64) -> bool {
        self.current
            .as_ref()
            .is_some_and(|s| &s.session_id == session_id && s.generation == generation)
    }

    fn on_link_up(
        &mut self,
        session_id: SessionId,
        generation: u64,
        result: Result<(), TransportError>,
    ) {
        if !self.is_current(&session_id, generation) {
            debug!(session_id = %session_id, generation, "Stale connect completion");
            if result.is_ok() {
                // The attempt was abandoned while the link came up.
                let transport = Arc::clone(&self.transport);
                tokio::spawn(async move {
                    if let Err(e) = transport.disconnect(&session_id).await {
                        warn!(session_id = %session_id, error = %e, "Failed to drop abandoned link");
                    }
                });
            }
            return;
        }

        match result {
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Connect failed");
                self.current = None;
                self.state = self.idle_state();
                self.emit(SessionEvent::ConnectFailed {
                    session_id,
                    reason: e.to_string(),
                });
            }
            Ok(()) => {
                debug!(session_id = %session_id, "Link up, discovering services");
                self.state = ConnectionState::ServiceDiscovery;
                if self.is_scanning {
                    debug!("Stopping scan for the connection");
                    self.set_scanning(false);
                }
                let transport = Arc::clone(&self.transport);
                self.spawn_completion(async move {
                    let result = prepare_gatt(transport.as_ref(), &session_id).await;
                    Completion::GattReady {
                        session_id,
                        generation,
                        result,
                    }
                });
            }
        }
    }

    fn on_gatt_ready(
        &mut self,
        session_id: SessionId,
        generation: u64,
        result: Result<GattSetup, TransportError>,
    ) {
        if !self.is_current(&session_id, generation) {
            debug!(session_id = %session_id, generation, "Stale service discovery completion");
            return;
        }
        match result {
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Service setup failed");
                self.emit(SessionEvent::ConnectFailed {
                    session_id: session_id.clone(),
                    reason: e.to_string(),
                });
                self.request_link_down(session_id, generation);
            }
            Ok(setup) => self.enter_connected(session_id, generation, setup),
        }
    }

    fn enter_connected(&mut self, session_id: SessionId, generation: u64, setup: GattSetup) {
        let now = Utc::now();
        self.state = ConnectionState::Connected;

        if self.settings.start_sampling_on_connect {
            self.gate.start();
        }
        for (characteristic, payload) in &setup.initial_values {
            self.apply_payload(*characteristic, payload, now);
        }

        let address = self.advertisements.hardware_address(&session_id);
        let key = address.and_then(|address| {
            DocumentKey::device_timer(&self.settings.account_id, &address)
                .map_err(|e| warn!(error = %e, "Cannot build duration document key"))
                .ok()
        });
        let tracking = match (address, key) {
            (Some(address), Some(key)) => {
                self.tracker.begin(address, generation, now);
                self.request_fetch(address, key.clone(), generation);
                let listener = self.spawn_listener(address, key.clone(), generation);
                Some(Tracking {
                    address,
                    key,
                    listener,
                })
            }
            _ => {
                warn!(
                    session_id = %session_id,
                    "Hardware address unresolved, usage tracking disabled for this session"
                );
                None
            }
        };
        let tracking_degraded = tracking.is_none();

        if let Some(session) = self.current.as_mut() {
            session.subscribed = setup.subscribed;
            session.serial_number = setup
                .serial_number
                .as_deref()
                .map(decode_serial_number)
                .or(session.serial_number.take());
            session.tracking = tracking;
            session.tracking_degraded = tracking_degraded;
        }

        info!(session_id = %session_id, address = ?address, "Connected");
        if tracking_degraded {
            self.emit(SessionEvent::TrackingUnavailable {
                session_id: session_id.clone(),
            });
        }
        self.emit(SessionEvent::Connected {
            session_id,
            hardware_address: address,
        });
    }

    fn on_remote_fetched(
        &mut self,
        address: HardwareAddress,
        generation: u64,
        result: Result<Option<Fields>, StoreError>,
    ) {
        let document = match result {
            Ok(document) => document,
            Err(e) => {
                warn!(address = %address, error = %e, "Duration fetch failed, will retry");
                return;
            }
        };
        let remote = document.as_ref().map(DurationRecord::from_fields);
        let Some(marker) = self.tracker.reconcile(address, generation, remote) else {
            return;
        };
        let Some(key) = self.tracking_key(address) else {
            return;
        };
        self.queue_duration_job(DurationJob::Marker {
            address,
            key,
            fields: marker,
        });
    }

    /// A failure is kept as pending. If a newer session for the sensor is
    /// running, that session folds it in when it reconciles or ends, since
    /// its own fetch is queued behind this write.
    fn on_final_written(
        &mut self,
        address: HardwareAddress,
        total: FinalTotal,
        result: Result<f64, StoreError>,
    ) {
        match result {
            Ok(total_secs) => {
                info!(address = %address, total_secs, "Duration stored");
                self.tracker.clear_pending(&address);
            }
            Err(e) => {
                error!(address = %address, total = ?total, error = %e, "Final duration write failed, will retry");
                self.tracker.mark_pending(address, total, Utc::now());
                self.emit(SessionEvent::PersistenceFailed {
                    hardware_address: address,
                    message: e.to_string(),
                });
            }
        }
    }

    fn tracking_key(&self, address: HardwareAddress) -> Option<DocumentKey> {
        self.current
            .as_ref()
            .and_then(|s| s.tracking.as_ref())
            .filter(|t| t.address == address)
            .map(|t| t.key.clone())
    }

    // =========================================================================
    // SESSION END
    // =========================================================================

    /// Tear down the current session. Runs at most once per session: a
    /// second call finds no current session and does nothing.
    fn end_session(&mut self, reason: Option<String>) -> Option<FinalWrite> {
        let session = self.current.take()?;
        let now = Utc::now();

        self.advertisements.remove(&session.session_id);
        self.close_sampling_window();
        self.state = self.idle_state();
        info!(
            session_id = %session.session_id,
            reason = ?reason,
            subscriptions = session.subscribed.len(),
            "Session ended"
        );
        self.emit(SessionEvent::Disconnected {
            session_id: session.session_id,
            reason,
        });

        let tracking = session.tracking?;
        tracking.listener.abort();
        let total = self.tracker.finish(tracking.address, now)?;
        Some(FinalWrite {
            address: tracking.address,
            key: tracking.key,
            total,
        })
    }

    fn finish_session(&mut self, reason: Option<String>) {
        if let Some(write) = self.end_session(reason) {
            self.queue_duration_job(DurationJob::Final(write));
        }
    }

    async fn shutdown(&mut self) {
        info!("Session manager shutting down");
        if let Some(session_id) = self.current.as_ref().map(|s| s.session_id.clone()) {
            if let Err(e) = self.transport.disconnect(&session_id).await {
                warn!(session_id = %session_id, error = %e, "Disconnect on shutdown failed");
            }
            if let Some(write) = self.end_session(Some("shutdown".to_string())) {
                self.queue_duration_job(DurationJob::Final(write));
            }
        }
        self.drain_duration_jobs().await;
        if self.is_scanning {
            self.is_scanning = false;
            if let Err(e) = self.transport.stop_scan().await {
                warn!(error = %e, "Failed to stop scan on shutdown");
            }
        }
        self.state = self.idle_state();
        self.publish();
    }

    // =========================================================================
    // TICK & PUBLISHING
    // =========================================================================

    fn on_tick(&mut self) {
        let now = Utc::now();
        self.expire_sampling(now);

        let retry_interval = chrono::Duration::from_std(self.settings.retry_interval)
            .unwrap_or_else(|_| chrono::Duration::seconds(30));
        let unreconciled = self.current.as_ref().and_then(|s| {
            s.tracking
                .as_ref()
                .map(|t| (t.address, t.key.clone(), s.generation))
        });
        if let Some((address, key, generation)) = unreconciled {
            if self
                .tracker
                .needs_fetch(address, generation, now, retry_interval)
            {
                debug!(address = %address, "Retrying duration fetch");
                self.request_fetch(address, key, generation);
            }
        }

        for (address, total) in self.tracker.due_retries(now, retry_interval) {
            match DocumentKey::device_timer(&self.settings.account_id, &address) {
                Ok(key) => {
                    debug!(address = %address, total = ?total, "Retrying final duration write");
                    self.queue_duration_job(DurationJob::Final(FinalWrite {
                        address,
                        key,
                        total,
                    }));
                }
                Err(e) => warn!(address = %address, error = %e, "Cannot retry duration write"),
            }
        }
    }

    fn expire_sampling(&mut self, now: DateTime<Utc>) {
        if self.gate.expire(now) {
            let summary = self.gate.summary();
            info!(
                temperature_mean = ?summary.temperature_mean,
                carbon_monoxide_mean = ?summary.carbon_monoxide_mean,
                "Sampling window elapsed"
            );
            self.emit(SessionEvent::SamplingFinished(summary));
        }
    }

    const fn idle_state(&self) -> ConnectionState {
        if self.is_scanning {
            ConnectionState::Discovering
        } else {
            ConnectionState::Disconnected
        }
    }

    fn snapshot(&self, now: DateTime<Utc>) -> SessionSnapshot {
        let current = self.current.as_ref();
        SessionSnapshot {
            adapter_powered: self.adapter_powered,
            is_scanning: self.is_scanning,
            state: self.state,
            current_device: current.map(|s| s.session_id.clone()),
            current_address: current.and_then(|s| {
                s.tracking
                    .as_ref()
                    .map(|t| t.address)
                    .or_else(|| self.advertisements.hardware_address(&s.session_id))
            }),
            serial_number: current.and_then(|s| s.serial_number.clone()),
            sampling_active: self.gate.is_active(),
            sampling_ends_at: self.gate.ends_at(),
            temperature: self.gate.readings(SensorKind::Temperature).to_vec(),
            carbon_monoxide: self.gate.readings(SensorKind::CarbonMonoxide).to_vec(),
            discovered: self.advertisements.devices().to_vec(),
            durations: self.tracker.durations(now),
            decode_failures: self.decode_failures,
            tracking_degraded: current.is_some_and(|s| s.tracking_degraded),
        }
    }

    fn publish(&self) {
        let snapshot = self.snapshot(Utc::now());
        self.snapshots.send_if_modified(|published| {
            if *published == snapshot {
                false
            } else {
                *published = snapshot;
                true
            }
        });
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    // =========================================================================
    // SPAWNED WORK
    // =========================================================================

    fn spawn_completion<F>(&self, work: F)
    where
        F: Future<Output = Completion> + Send + 'static,
    {
        let completions = self.completions_tx.clone();
        tokio::spawn(async move {
            let _ = completions.send(work.await);
        });
    }

    /// Scan start/stop requests are applied in order by one worker so a
    /// quick start-stop pair cannot reach the transport reversed.
    fn spawn_scan_worker(&mut self) -> Option<JoinHandle<()>> {
        let mut requests = self.scan_requests.take()?;
        let transport = Arc::clone(&self.transport);
        let service = self.settings.service_filter;
        let completions = self.completions_tx.clone();
        Some(tokio::spawn(async move {
            while let Some(start) = requests.recv().await {
                if start {
                    let result = transport.start_scan(service).await;
                    if completions.send(Completion::ScanStarted(result)).is_err() {
                        break;
                    }
                } else if let Err(e) = transport.stop_scan().await {
                    warn!(error = %e, "Failed to stop scan");
                }
            }
        }))
    }

    fn queue_duration_job(&self, job: DurationJob) {
        if self.duration_jobs_tx.send(job).is_err() {
            warn!("Duration worker has stopped, dropping store work");
        }
    }

    fn request_fetch(&self, address: HardwareAddress, key: DocumentKey, generation: u64) {
        self.queue_duration_job(DurationJob::Fetch {
            address,
            key,
            generation,
        });
    }

    /// Wait until every queued duration job has run, then apply the final
    /// write results that came back.
    async fn drain_duration_jobs(&mut self) {
        let (done, drained) = oneshot::channel();
        self.queue_duration_job(DurationJob::Drain(done));
        let _ = drained.await;
        while let Ok(completion) = self.completions.try_recv() {
            if let Completion::FinalWritten {
                address,
                total,
                result,
            } = completion
            {
                self.on_final_written(address, total, result);
            }
        }
    }

    fn spawn_duration_worker(&mut self) -> Option<JoinHandle<()>> {
        let mut jobs = self.duration_jobs.take()?;
        let store = Arc::clone(&self.store);
        let completions = self.completions_tx.clone();
        Some(tokio::spawn(async move {
            while let Some(job) = jobs.recv().await {
                let completion = match job {
                    DurationJob::Fetch {
                        address,
                        key,
                        generation,
                    } => Completion::RemoteFetched {
                        address,
                        generation,
                        result: store.get_document(&key).await,
                    },
                    DurationJob::Marker {
                        address,
                        key,
                        fields,
                    } => {
                        match store.set_fields(&key, fields, true).await {
                            Ok(()) => debug!(address = %address, "In-progress marker written"),
                            Err(e) => {
                                warn!(address = %address, error = %e, "Failed to write in-progress marker");
                            }
                        }
                        continue;
                    }
                    DurationJob::Final(write) => Completion::FinalWritten {
                        address: write.address,
                        total: write.total,
                        result: store_final_total(store.as_ref(), &write).await,
                    },
                    DurationJob::Drain(done) => {
                        let _ = done.send(());
                        continue;
                    }
                };
                // Writes still reach the store if the manager is gone.
                let _ = completions.send(completion);
            }
        }))
    }

    fn spawn_listener(
        &self,
        address: HardwareAddress,
        key: DocumentKey,
        generation: u64,
    ) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let completions = self.completions_tx.clone();
        tokio::spawn(async move {
            let mut subscription = match store.listen(&key).await {
                Ok(subscription) => subscription,
                Err(e) => {
                    warn!(address = %address, error = %e, "Duration listener unavailable");
                    return;
                }
            };
            while let Some(snapshot) = subscription.next().await {
                let Some(fields) = snapshot else {
                    continue;
                };
                let changed = Completion::RemoteChanged {
                    address,
                    generation,
                    fields,
                };
                if completions.send(changed).is_err() {
                    break;
                }
            }
        })
    }
}

/// End a session in one write. A total built on an unread remote record is
/// resolved against the stored total first.
async fn store_final_total(store: &dyn RemoteStore, write: &FinalWrite) -> Result<f64, StoreError> {
    let stored_secs = if write.total.needs_stored_total() {
        store
            .get_document(&write.key)
            .await?
            .as_ref()
            .map_or(0.0, |fields| DurationRecord::from_fields(fields).cumulative_secs)
    } else {
        0.0
    };
    let total_secs = write.total.resolve(stored_secs);
    store
        .update_fields(&write.key, DurationRecord::finish_updates(total_secs))
        .await?;
    Ok(total_secs)
}

/// Enumerate services, subscribe to the sensor characteristics and read the
/// serial number.
async fn prepare_gatt(
    transport: &dyn Transport,
    session_id: &SessionId,
) -> Result<GattSetup, TransportError> {
    let services = transport.discover_services(session_id).await?;
    if !services
        .iter()
        .any(|s| s.uuid == ENVIRONMENTAL_SENSING_SERVICE)
    {
        return Err(TransportError::DiscoveryFailed(
            "environmental sensing service not offered".to_string(),
        ));
    }

    let mut setup = GattSetup::default();
    for service in services.iter().filter(|s| {
        s.uuid == ENVIRONMENTAL_SENSING_SERVICE || s.uuid == DEVICE_INFORMATION_SERVICE
    }) {
        for info in transport
            .discover_characteristics(session_id, service.uuid)
            .await?
        {
            let Some(characteristic) = Characteristic::from_uuid(info.uuid) else {
                continue;
            };
            if characteristic == Characteristic::SerialNumber {
                if info.read {
                    match transport.read(session_id, info.uuid).await {
                        Ok(raw) => setup.serial_number = Some(raw),
                        Err(e) => warn!(error = %e, "Serial number unavailable"),
                    }
                }
                continue;
            }
            if info.notify {
                transport.subscribe(session_id, info.uuid).await?;
                setup.subscribed.push(info.uuid);
            }
            if info.read {
                match transport.read(session_id, info.uuid).await {
                    Ok(raw) => setup.initial_values.push((characteristic, raw)),
                    Err(e) => debug!(error = %e, "Initial read failed"),
                }
            }
        }
    }

    if setup.subscribed.is_empty() {
        return Err(TransportError::DiscoveryFailed(
            "no sensor characteristic supports notifications".to_string(),
        ));
    }
    Ok(setup)
}

/// Cheap, cloneable front end of a [`SessionManager`].
///
/// Commands return as soon as the manager has accepted or refused them;
/// none waits for a radio or network round trip. Results of the work they
/// start show up in snapshots and [`SessionEvent`]s.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    snapshots: watch::Receiver<SessionSnapshot>,
    events: broadcast::Sender<SessionEvent>,
    store: Arc<dyn RemoteStore>,
    account_id: Arc<str>,
}

impl SessionHandle {
    async fn request(&self, build: impl FnOnce(Reply) -> Command) -> Result<(), ManagerError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| ManagerError::Stopped)?;
        response.await.map_err(|_| ManagerError::Stopped)?
    }

    /// Start scanning for sensors.
    ///
    /// # Errors
    ///
    /// [`ManagerError::AdapterPoweredOff`] if the adapter is off.
    pub async fn start_scanning(&self) -> Result<(), ManagerError> {
        self.request(Command::StartScanning).await
    }

    /// Stop scanning.
    ///
    /// # Errors
    ///
    /// [`ManagerError::Stopped`] if the manager is gone.
    pub async fn stop_scanning(&self) -> Result<(), ManagerError> {
        self.request(Command::StopScanning).await
    }

    /// Connect to a discovered sensor.
    ///
    /// # Errors
    ///
    /// [`ManagerError::UnknownDevice`] if it has not been discovered,
    /// [`ManagerError::Busy`] if another connection owns the session.
    pub async fn connect(&self, session_id: SessionId) -> Result<(), ManagerError> {
        self.request(|reply| Command::Connect(session_id, reply))
            .await
    }

    /// Disconnect the current sensor.
    ///
    /// # Errors
    ///
    /// [`ManagerError::NotConnected`] if nothing is connected.
    pub async fn disconnect(&self) -> Result<(), ManagerError> {
        self.request(Command::Disconnect).await
    }

    /// Open a sampling window. With a length the window closes itself.
    ///
    /// # Errors
    ///
    /// [`ManagerError::Stopped`] if the manager is gone.
    pub async fn start_sampling(&self, length: Option<Duration>) -> Result<(), ManagerError> {
        self.request(|reply| Command::StartSampling(length, reply))
            .await
    }

    /// Close the sampling window, keeping its readings.
    ///
    /// # Errors
    ///
    /// [`ManagerError::Stopped`] if the manager is gone.
    pub async fn stop_sampling(&self) -> Result<(), ManagerError> {
        self.request(Command::StopSampling).await
    }

    /// The latest published snapshot.
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshots.borrow().clone()
    }

    /// A receiver that is notified of every published snapshot.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.clone()
    }

    /// A receiver of session events from now on.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Wait until a published snapshot satisfies `predicate`.
    ///
    /// # Errors
    ///
    /// [`ManagerError::Stopped`] if the manager stops first.
    pub async fn wait_for(
        &self,
        mut predicate: impl FnMut(&SessionSnapshot) -> bool,
    ) -> Result<SessionSnapshot, ManagerError> {
        let mut snapshots = self.snapshots.clone();
        let snapshot = snapshots
            .wait_for(|s| predicate(s))
            .await
            .map_err(|_| ManagerError::Stopped)?
            .clone();
        Ok(snapshot)
    }

    /// Store one averaged sample for the account, independent of duration
    /// tracking.
    ///
    /// # Errors
    ///
    /// Returns the store error if the write fails.
    pub async fn upload_average_reading(
        &self,
        hardware_address: HardwareAddress,
        temperature: f64,
        carbon_monoxide: f64,
    ) -> Result<DocumentKey, StoreError> {
        let mut fields = Fields::new();
        fields.insert("timestamp".to_string(), Value::from(Utc::now().to_rfc3339()));
        fields.insert("temperature".to_string(), Value::from(temperature));
        fields.insert("co".to_string(), Value::from(carbon_monoxide));
        fields.insert(
            "hardwareAddress".to_string(),
            Value::from(hardware_address.to_string()),
        );
        let key = self
            .store
            .add_document(&sensor_data_collection(&self.account_id), fields)
            .await?;
        info!(key = %key, "Average reading uploaded");
        Ok(key)
    }

    /// Stop the manager, ending any session gracefully.
    pub async fn shutdown(&self) {
        let (reply, done) = oneshot::channel();
        if self.commands.send(Command::Shutdown(reply)).await.is_ok() {
            let _ = done.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;

    use crate::decoder::{CARBON_MONOXIDE_CHARACTERISTIC, TEMPERATURE_CHARACTERISTIC};
    use crate::duration::{CUMULATIVE_FIELD, START_FIELD};
    use crate::store::{FieldUpdate, MemoryStore, Subscription};
    use crate::transport::{MockCall, MockDevice, MockTransport};

    const ADDR: HardwareAddress = HardwareAddress::new([1, 2, 3, 4, 5, 6]);
    const WAIT: Duration = Duration::from_secs(3);

    struct Harness {
        handle: SessionHandle,
        transport: Arc<MockTransport>,
        store: MemoryStore,
        task: JoinHandle<()>,
    }

    fn settings() -> ManagerSettings {
        ManagerSettings {
            tick_interval: Duration::from_millis(20),
            retry_interval: Duration::from_millis(50),
            account_id: "test".to_string(),
            ..ManagerSettings::default()
        }
    }

    /// Delays merge writes, so an in-progress marker is still in flight
    /// when the session ends.
    struct SlowMergeStore {
        inner: MemoryStore,
        delay: Duration,
    }

    #[async_trait]
    impl RemoteStore for SlowMergeStore {
        async fn get_document(&self, key: &DocumentKey) -> Result<Option<Fields>, StoreError> {
            self.inner.get_document(key).await
        }

        async fn set_fields(
            &self,
            key: &DocumentKey,
            fields: Fields,
            merge: bool,
        ) -> Result<(), StoreError> {
            if merge {
                tokio::time::sleep(self.delay).await;
            }
            self.inner.set_fields(key, fields, merge).await
        }

        async fn update_fields(
            &self,
            key: &DocumentKey,
            updates: Vec<FieldUpdate>,
        ) -> Result<(), StoreError> {
            self.inner.update_fields(key, updates).await
        }

        async fn add_document(
            &self,
            collection: &str,
            fields: Fields,
        ) -> Result<DocumentKey, StoreError> {
            self.inner.add_document(collection, fields).await
        }

        async fn listen(&self, key: &DocumentKey) -> Result<Subscription, StoreError> {
            self.inner.listen(key).await
        }
    }

    fn harness_with(device: MockDevice, store: MemoryStore) -> Harness {
        harness_on(device, store.clone(), Arc::new(store), settings())
    }

    fn harness_on(
        device: MockDevice,
        store: MemoryStore,
        remote: Arc<dyn RemoteStore>,
        settings: ManagerSettings,
    ) -> Harness {
        let (transport, events) = MockTransport::new();
        transport.add_device(device);
        let (handle, task) = SessionManager::spawn(transport.clone(), events, remote, settings);
        Harness {
            handle,
            transport,
            store,
            task,
        }
    }

    fn harness() -> Harness {
        harness_with(MockDevice::sensor("s1", ADDR), MemoryStore::new())
    }

    fn sid() -> SessionId {
        SessionId::from("s1")
    }

    fn key() -> DocumentKey {
        DocumentKey::device_timer("test", &ADDR).unwrap()
    }

    async fn wait(
        handle: &SessionHandle,
        predicate: impl FnMut(&SessionSnapshot) -> bool,
    ) -> SessionSnapshot {
        tokio::time::timeout(WAIT, handle.wait_for(predicate))
            .await
            .expect("timed out waiting for snapshot")
            .unwrap()
    }

    /// Polls through `documents()`, which never consumes injected read
    /// failures.
    async fn stored(store: &MemoryStore) -> Option<Fields> {
        store
            .documents()
            .await
            .into_iter()
            .find(|(k, _)| *k == key())
            .map(|(_, fields)| fields)
    }

    async fn wait_for_document(
        store: &MemoryStore,
        predicate: impl Fn(&Fields) -> bool,
    ) -> Fields {
        tokio::time::timeout(WAIT, async {
            loop {
                if let Some(fields) = stored(store).await {
                    if predicate(&fields) {
                        return fields;
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("timed out waiting for document")
    }

    async fn discover(h: &Harness) {
        wait(&h.handle, |s| s.adapter_powered).await;
        h.handle.start_scanning().await.unwrap();
        wait(&h.handle, |s| s.discovered.iter().any(|d| d.session_id == sid())).await;
    }

    async fn connect(h: &Harness) -> SessionSnapshot {
        discover(h).await;
        h.handle.connect(sid()).await.unwrap();
        wait(&h.handle, |s| s.state == ConnectionState::Connected).await
    }

    /// Events on the transport channel are handled in order, so waiting for
    /// a later advertisement guarantees earlier notifications were handled.
    async fn barrier(h: &Harness, id: &str) {
        h.handle.start_scanning().await.unwrap();
        h.transport
            .advertise_raw(crate::advertisement::Advertisement {
                session_id: SessionId::from(id),
                ..Default::default()
            });
        wait(&h.handle, |s| {
            s.discovered.iter().any(|d| d.session_id.as_str() == id)
        })
        .await;
    }

    fn cumulative(fields: &Fields) -> f64 {
        DurationRecord::from_fields(fields).cumulative_secs
    }

    fn as_fields(value: Value) -> Fields {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected an object"),
        }
    }

    #[tokio::test]
    async fn test_scan_then_connect_reaches_connected() {
        let h = harness();
        discover(&h).await;
        let snapshot = h.handle.snapshot();
        assert!(snapshot.is_scanning);
        assert_eq!(snapshot.state, ConnectionState::Discovering);
        assert_eq!(snapshot.discovered[0].hardware_address, Some(ADDR));

        h.handle.connect(sid()).await.unwrap();
        let snapshot = wait(&h.handle, |s| s.state == ConnectionState::Connected).await;
        assert_eq!(snapshot.current_device, Some(sid()));
        assert_eq!(snapshot.current_address, Some(ADDR));
        assert_eq!(snapshot.serial_number.as_deref(), Some("XH-010203040506"));
        assert!(snapshot.sampling_active);
        assert!(snapshot.sampling_ends_at.is_none());
        assert!(!snapshot.tracking_degraded);

        // Scanning stops once a sensor is connected.
        assert!(!snapshot.is_scanning);
        assert!(h
            .transport
            .calls()
            .contains(&MockCall::Subscribe(sid(), TEMPERATURE_CHARACTERISTIC)));
    }

    #[tokio::test]
    async fn test_connect_rejects_unknown_and_busy() {
        let h = harness();
        assert_eq!(
            h.handle.connect(SessionId::from("nope")).await,
            Err(ManagerError::UnknownDevice(SessionId::from("nope")))
        );

        connect(&h).await;
        assert!(matches!(
            h.handle.connect(sid()).await,
            Err(ManagerError::Busy(ConnectionState::Connected))
        ));
    }

    #[tokio::test]
    async fn test_notifications_are_decoded_and_gated() {
        let h = harness();
        connect(&h).await;

        h.transport
            .notify(&sid(), TEMPERATURE_CHARACTERISTIC, &[0xE8, 0x03]);
        h.transport
            .notify(&sid(), CARBON_MONOXIDE_CHARACTERISTIC, &[0x00, 0x64]);
        let snapshot = wait(&h.handle, |s| {
            s.temperature.len() == 1 && s.carbon_monoxide.len() == 1
        })
        .await;
        assert!((snapshot.temperature[0].value - 10.0).abs() < f64::EPSILON);
        assert!((snapshot.carbon_monoxide[0].value - 100.0).abs() < f64::EPSILON);

        h.handle.stop_sampling().await.unwrap();
        h.transport
            .notify(&sid(), TEMPERATURE_CHARACTERISTIC, &[0x10, 0x0E]);
        h.transport.notify(&sid(), TEMPERATURE_CHARACTERISTIC, &[0x01]);
        let snapshot = wait(&h.handle, |s| s.decode_failures == 1).await;
        assert!(!snapshot.sampling_active);
        assert_eq!(snapshot.temperature.len(), 1);
    }

    #[tokio::test]
    async fn test_restarting_sampling_clears_history() {
        let h = harness();
        connect(&h).await;
        h.transport
            .notify(&sid(), TEMPERATURE_CHARACTERISTIC, &[0xE8, 0x03]);
        wait(&h.handle, |s| s.temperature.len() == 1).await;

        h.handle.start_sampling(None).await.unwrap();
        let snapshot = wait(&h.handle, |s| s.temperature.is_empty()).await;
        assert!(snapshot.sampling_active);
    }

    #[tokio::test]
    async fn test_timed_sampling_window_closes_itself() {
        let h = harness();
        let mut events = h.handle.events();
        h.handle
            .start_sampling(Some(Duration::from_millis(60)))
            .await
            .unwrap();
        let snapshot = wait(&h.handle, |s| s.sampling_active).await;
        assert!(snapshot.sampling_ends_at.is_some());

        wait(&h.handle, |s| !s.sampling_active).await;
        let finished = tokio::time::timeout(WAIT, async {
            loop {
                if let Ok(SessionEvent::SamplingFinished(summary)) = events.recv().await {
                    return summary;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(finished.temperature_count, 0);
    }

    #[tokio::test]
    async fn test_reading_after_window_deadline_is_dropped_between_ticks() {
        let store = MemoryStore::new();
        let h = harness_on(
            MockDevice::sensor("s1", ADDR),
            store.clone(),
            Arc::new(store),
            ManagerSettings {
                tick_interval: Duration::from_secs(60),
                ..settings()
            },
        );
        let mut events = h.handle.events();
        connect(&h).await;
        h.handle
            .start_sampling(Some(Duration::from_millis(50)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        h.transport
            .notify(&sid(), TEMPERATURE_CHARACTERISTIC, &[0xE8, 0x03]);
        barrier(&h, "other").await;
        let snapshot = h.handle.snapshot();
        assert!(snapshot.temperature.is_empty());
        assert!(!snapshot.sampling_active);

        let mut finished = false;
        while let Ok(event) = events.try_recv() {
            finished |= matches!(event, SessionEvent::SamplingFinished(_));
        }
        assert!(finished);
    }

    #[tokio::test]
    async fn test_notification_after_disconnect_is_dropped() {
        let h = harness();
        connect(&h).await;
        h.handle.disconnect().await.unwrap();
        wait(&h.handle, |s| s.state == ConnectionState::Disconnected).await;

        h.transport
            .notify(&sid(), TEMPERATURE_CHARACTERISTIC, &[0x01]);
        barrier(&h, "other").await;
        assert_eq!(h.handle.snapshot().decode_failures, 0);
    }

    #[tokio::test]
    async fn test_marker_written_on_connect() {
        let h = harness();
        connect(&h).await;
        let fields = wait_for_document(&h.store, |f| f.contains_key(START_FIELD)).await;
        assert!(cumulative(&fields).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_disconnect_cleans_up_and_stores_total() {
        let h = harness();
        let mut events = h.handle.events();
        connect(&h).await;
        wait_for_document(&h.store, |f| f.contains_key(START_FIELD)).await;
        tokio::time::sleep(Duration::from_millis(120)).await;

        h.handle.disconnect().await.unwrap();
        let snapshot = wait(&h.handle, |s| s.state == ConnectionState::Disconnected).await;
        assert!(snapshot.discovered.is_empty());
        assert!(snapshot.serial_number.is_none());
        assert!(!snapshot.sampling_active);
        assert!(snapshot.current_device.is_none());

        let fields = wait_for_document(&h.store, |f| !f.contains_key(START_FIELD)).await;
        assert!(cumulative(&fields) >= 0.1);
        let published = h.handle.snapshot().duration_for(&ADDR).unwrap();
        assert!((published - cumulative(&fields)).abs() < 1e-9);

        let mut saw_disconnect = false;
        while let Ok(event) = events.try_recv() {
            saw_disconnect |= matches!(event, SessionEvent::Disconnected { .. });
        }
        assert!(saw_disconnect);
    }

    #[tokio::test]
    async fn test_consecutive_sessions_accumulate() {
        let h = harness();
        connect(&h).await;
        wait_for_document(&h.store, |f| f.contains_key(START_FIELD)).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        h.handle.disconnect().await.unwrap();
        let first = cumulative(&wait_for_document(&h.store, |f| !f.contains_key(START_FIELD)).await);

        connect(&h).await;
        wait_for_document(&h.store, |f| f.contains_key(START_FIELD)).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        h.handle.disconnect().await.unwrap();
        wait(&h.handle, |s| s.state == ConnectionState::Disconnected).await;
        let second = cumulative(
            &wait_for_document(&h.store, move |f| {
                !f.contains_key(START_FIELD) && cumulative(f) > first
            })
            .await,
        );

        assert!(second - first >= 0.1);
    }

    #[tokio::test]
    async fn test_link_loss_cleanup_runs_once() {
        let h = harness();
        connect(&h).await;
        wait_for_document(&h.store, |f| f.contains_key(START_FIELD)).await;

        h.transport.drop_link(&sid(), "out of range");
        wait(&h.handle, |s| s.state == ConnectionState::Disconnected).await;
        let once = cumulative(&wait_for_document(&h.store, |f| !f.contains_key(START_FIELD)).await);

        h.transport.drop_link(&sid(), "out of range");
        barrier(&h, "other").await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let fields = stored(&h.store).await.unwrap();
        assert!((cumulative(&fields) - once).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_crash_recovery_from_marker() {
        let store = MemoryStore::new();
        let h = harness_with(MockDevice::sensor("s1", ADDR), store.clone());
        connect(&h).await;
        wait_for_document(&store, |f| f.contains_key(START_FIELD)).await;

        // Ungraceful termination: no final write happens.
        h.task.abort();
        tokio::time::sleep(Duration::from_millis(150)).await;
        let left_behind = stored(&store).await.unwrap();
        let record = DurationRecord::from_fields(&left_behind);
        assert!(record.is_in_progress());
        assert!(record.current(Utc::now()) >= 0.15);

        let restarted = harness_with(MockDevice::sensor("s1", ADDR), store.clone());
        connect(&restarted).await;
        let snapshot = wait(&restarted.handle, |s| {
            s.duration_for(&ADDR).is_some_and(|d| d >= 0.15)
        })
        .await;
        assert!(snapshot.durations[0].active);
    }

    #[tokio::test]
    async fn test_unresolved_address_skips_tracking() {
        let h = harness_with(
            MockDevice::sensor("s1", ADDR).without_address(),
            MemoryStore::new(),
        );
        let mut events = h.handle.events();
        let snapshot = connect(&h).await;
        assert!(snapshot.tracking_degraded);
        assert!(snapshot.current_address.is_none());

        let degraded = tokio::time::timeout(WAIT, async {
            loop {
                if let Ok(SessionEvent::TrackingUnavailable { session_id }) = events.recv().await {
                    return session_id;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(degraded, sid());

        h.handle.disconnect().await.unwrap();
        wait(&h.handle, |s| s.state == ConnectionState::Disconnected).await;
        assert!(h.store.documents().await.is_empty());
    }

    #[tokio::test]
    async fn test_connect_failure_returns_to_idle_without_retry() {
        let h = harness();
        h.transport.fail_connect(&sid(), "timeout");
        let mut events = h.handle.events();
        discover(&h).await;

        h.handle.connect(sid()).await.unwrap();
        let reason = tokio::time::timeout(WAIT, async {
            loop {
                if let Ok(SessionEvent::ConnectFailed { reason, .. }) = events.recv().await {
                    return reason;
                }
            }
        })
        .await
        .unwrap();
        assert!(reason.contains("timeout"));

        let snapshot = wait(&h.handle, |s| !s.state.is_busy()).await;
        assert_eq!(snapshot.state, ConnectionState::Discovering);
        assert!(snapshot.current_device.is_none());
        let connects = h
            .transport
            .calls()
            .iter()
            .filter(|c| matches!(c, MockCall::Connect(_)))
            .count();
        assert_eq!(connects, 1);
    }

    #[tokio::test]
    async fn test_disconnect_while_connecting_drops_late_link() {
        let h = harness();
        h.transport.set_connect_delay(Duration::from_millis(100));
        discover(&h).await;

        h.handle.connect(sid()).await.unwrap();
        wait(&h.handle, |s| s.state == ConnectionState::Connecting).await;
        h.handle.disconnect().await.unwrap();
        wait(&h.handle, |s| s.state == ConnectionState::Discovering).await;

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(h.handle.snapshot().state, ConnectionState::Discovering);
        assert!(!h.transport.is_connected(&sid()));
        assert!(h.store.documents().await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_final_write_is_retried() {
        let h = harness();
        let mut events = h.handle.events();
        connect(&h).await;
        wait_for_document(&h.store, |f| f.contains_key(START_FIELD)).await;

        h.store.fail_next_writes(1);
        h.handle.disconnect().await.unwrap();

        tokio::time::timeout(WAIT, async {
            loop {
                if let Ok(SessionEvent::PersistenceFailed { hardware_address, .. }) =
                    events.recv().await
                {
                    assert_eq!(hardware_address, ADDR);
                    return;
                }
            }
        })
        .await
        .unwrap();

        let fields = wait_for_document(&h.store, |f| !f.contains_key(START_FIELD)).await;
        assert!(cumulative(&fields) > 0.0);
    }

    #[tokio::test]
    async fn test_marker_write_cannot_outlive_session_end() {
        let store = MemoryStore::new();
        let slow = SlowMergeStore {
            inner: store.clone(),
            delay: Duration::from_millis(300),
        };
        let h = harness_on(
            MockDevice::sensor("s1", ADDR),
            store.clone(),
            Arc::new(slow),
            settings(),
        );
        connect(&h).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        h.handle.disconnect().await.unwrap();
        wait(&h.handle, |s| s.state == ConnectionState::Disconnected).await;
        let ended = wait_for_document(&store, |f| {
            f.contains_key(CUMULATIVE_FIELD) && !f.contains_key(START_FIELD)
        })
        .await;
        assert!(cumulative(&ended) >= 0.1);

        // Nothing queued before the final write may land after it.
        tokio::time::sleep(Duration::from_millis(400)).await;
        let fields = stored(&store).await.unwrap();
        assert!(!fields.contains_key(START_FIELD));
        assert!((cumulative(&fields) - cumulative(&ended)).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_failed_fetch_does_not_overwrite_remote_total() {
        let store = MemoryStore::new();
        store
            .set_fields(&key(), as_fields(json!({ "cumulativeDuration": 1000.0 })), false)
            .await
            .unwrap();
        // The fetch and the listener both fail; no fetch retry before the end.
        store.fail_next_reads(2);
        let h = harness_on(
            MockDevice::sensor("s1", ADDR),
            store.clone(),
            Arc::new(store.clone()),
            ManagerSettings {
                retry_interval: Duration::from_secs(60),
                ..settings()
            },
        );
        connect(&h).await;
        tokio::time::sleep(Duration::from_millis(150)).await;

        h.handle.disconnect().await.unwrap();
        let fields = wait_for_document(&store, |f| cumulative(f) > 1000.0).await;
        assert!(!fields.contains_key(START_FIELD));
        let total = cumulative(&fields);
        assert!(total >= 1000.1 && total < 1010.0, "total was {total}");
    }

    #[tokio::test]
    async fn test_failed_fetch_is_retried_on_tick() {
        let store = MemoryStore::new();
        store
            .set_fields(&key(), as_fields(json!({ "cumulativeDuration": 1000.0 })), false)
            .await
            .unwrap();
        store.fail_next_reads(2);
        let h = harness_with(MockDevice::sensor("s1", ADDR), store.clone());
        connect(&h).await;

        let marker = wait_for_document(&store, |f| f.contains_key(START_FIELD)).await;
        assert!((cumulative(&marker) - 1000.0).abs() < f64::EPSILON);
        wait(&h.handle, |s| s.duration_for(&ADDR).is_some_and(|d| d >= 1000.0)).await;

        h.handle.disconnect().await.unwrap();
        let fields = wait_for_document(&store, |f| !f.contains_key(START_FIELD)).await;
        assert!(cumulative(&fields) > 1000.0);
    }

    #[tokio::test]
    async fn test_adapter_power_loss_ends_session() {
        let h = harness();
        connect(&h).await;

        h.transport.set_powered(false);
        let snapshot = wait(&h.handle, |s| !s.adapter_powered).await;
        assert_eq!(snapshot.state, ConnectionState::Disconnected);
        assert!(!snapshot.is_scanning);
        assert_eq!(
            h.handle.start_scanning().await,
            Err(ManagerError::AdapterPoweredOff)
        );
    }

    #[tokio::test]
    async fn test_shutdown_stores_final_total() {
        let h = harness();
        connect(&h).await;
        wait_for_document(&h.store, |f| f.contains_key(START_FIELD)).await;

        h.handle.shutdown().await;
        let fields = stored(&h.store).await.unwrap();
        assert!(!fields.contains_key(START_FIELD));
        assert_eq!(h.handle.start_scanning().await, Err(ManagerError::Stopped));
    }

    #[tokio::test]
    async fn test_upload_average_reading() {
        let h = harness();
        let key = h
            .handle
            .upload_average_reading(ADDR, 36.6, 12.0)
            .await
            .unwrap();
        assert!(key.as_str().starts_with("users/test/sensorData/"));

        let fields = h.store.get_document(&key).await.unwrap().unwrap();
        assert_eq!(fields["hardwareAddress"], "01:02:03:04:05:06");
        assert_eq!(fields["co"], 12.0);
        assert!(fields.contains_key("timestamp"));
    }
}
