//! Session engine
//!
//! Owns the characteristic table, device registry, router and transfer
//! session. Transport events, caller commands and timer ticks are all
//! funnelled into [`SessionEngine::run`] and processed one at a time.

use super::{
    Message, Request, SessionCommand, SessionHandle, SessionSnapshot, SessionState, TimerEvent,
    TimerKind,
};
use crate::config::EngineConfig;
use crate::control::{GnssMaskControl, MaskFollowUp, StartTrigger};
use crate::device::{Advertisement, DeviceId, DeviceRegistry};
use crate::directory::DirectoryListing;
use crate::error::TransportError;
use crate::gatt::{
    CharacteristicInfo, CharacteristicRef, CharacteristicRole, CharacteristicTable,
    DISCOVERY_SERVICES, FILE_SERVICE_UUID,
};
use crate::packet::{self, opcode, FilePacket};
use crate::router::{Consumer, NotificationRouter};
use crate::store::BondStore;
use crate::telemetry::{self, LiveGnssSample};
use crate::transfer::{
    ActiveTransfer, DownloadSession, TransferDirection, TransferResult, TransferSession,
    TransferStep, UploadSession,
};
use crate::transport::{ScanFilter, Transport, TransportEvent, WriteKind};
use crate::{ProtocolError, Result};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// Characteristics whose values are pushed by the device
const SUBSCRIBED_ROLES: [CharacteristicRole; 6] = [
    CharacteristicRole::FileOut,
    CharacteristicRole::GnssMeasurement,
    CharacteristicRole::GnssControl,
    CharacteristicRole::StartControl,
    CharacteristicRole::StartResult,
    CharacteristicRole::DeviceMode,
];

#[derive(Debug)]
struct TimerSlot {
    generation: u64,
    task: JoinHandle<()>,
}

/// Running timer tasks, keyed by kind
///
/// Every spawned timer carries a fresh generation; ticks from an aborted
/// or replaced timer no longer match and are dropped.
#[derive(Debug)]
struct Timers {
    tx: mpsc::UnboundedSender<TimerEvent>,
    next_generation: u64,
    slots: HashMap<TimerKind, TimerSlot>,
}

impl Timers {
    fn new(tx: mpsc::UnboundedSender<TimerEvent>) -> Self {
        Self {
            tx,
            next_generation: 0,
            slots: HashMap::new(),
        }
    }

    fn arm(&mut self, kind: TimerKind, delay: Duration, repeat: bool) {
        self.cancel(kind);
        if repeat && delay.is_zero() {
            warn!("Not arming {:?}: a repeating timer needs a non-zero period", kind);
            return;
        }
        self.next_generation += 1;
        let generation = self.next_generation;
        let tx = self.tx.clone();
        let task = tokio::spawn(async move {
            let event = TimerEvent { kind, generation };
            if repeat {
                let mut interval = tokio::time::interval_at(
                    tokio::time::Instant::now() + delay,
                    delay,
                );
                loop {
                    interval.tick().await;
                    if tx.send(event).is_err() {
                        break;
                    }
                }
            } else {
                tokio::time::sleep(delay).await;
                let _ = tx.send(event);
            }
        });
        self.slots.insert(kind, TimerSlot { generation, task });
    }

    fn cancel(&mut self, kind: TimerKind) {
        if let Some(slot) = self.slots.remove(&kind) {
            slot.task.abort();
        }
    }

    fn cancel_where(&mut self, mut pred: impl FnMut(&TimerKind) -> bool) {
        self.slots.retain(|kind, slot| {
            if pred(kind) {
                slot.task.abort();
                false
            } else {
                true
            }
        });
    }

    fn cancel_all(&mut self) {
        self.cancel_where(|_| true);
    }

    /// Whether a tick is current; one-shot timers are retired on acceptance
    fn accept(&mut self, event: &TimerEvent) -> bool {
        let current = self
            .slots
            .get(&event.kind)
            .is_some_and(|slot| slot.generation == event.generation);
        if current && !matches!(event.kind, TimerKind::Keepalive) {
            self.slots.remove(&event.kind);
        }
        current
    }

    #[cfg(test)]
    fn is_armed(&self, kind: TimerKind) -> bool {
        self.slots.contains_key(&kind)
    }

    #[cfg(test)]
    fn generation(&self, kind: TimerKind) -> Option<u64> {
        self.slots.get(&kind).map(|slot| slot.generation)
    }
}

/// The session actor
pub struct SessionEngine {
    config: EngineConfig,
    transport: Arc<dyn Transport>,
    store: Box<dyn BondStore>,

    commands: mpsc::UnboundedReceiver<SessionCommand>,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    timer_rx: mpsc::UnboundedReceiver<TimerEvent>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    timers: Timers,

    state: SessionState,
    powered: bool,
    registry: DeviceRegistry,
    connected: Option<DeviceId>,
    /// Connect requested while another device was still attached
    pending_connect: Option<DeviceId>,
    /// Services whose characteristics have not been reported yet
    pending_services: HashSet<Uuid>,
    /// Bonding-trigger read outstanding
    bonding_pending: bool,

    characteristics: CharacteristicTable,
    router: NotificationRouter,
    directory: DirectoryListing,
    transfer: Option<ActiveTransfer>,
    download_progress: f64,
    upload_progress: f64,
    live_sample: Option<LiveGnssSample>,
    mask: GnssMaskControl,
    trigger: StartTrigger,
    firmware_revision: Option<String>,
    device_mode: Option<u8>,
    rssi: Option<i16>,
}

impl std::fmt::Debug for SessionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEngine")
            .field("state", &self.state)
            .field("connected", &self.connected)
            .field("transfer", &self.transfer.as_ref().map(|t| t.path().to_string()))
            .finish_non_exhaustive()
    }
}

impl SessionEngine {
    /// Build an engine and its handle without starting it
    pub fn new(
        config: EngineConfig,
        transport: Arc<dyn Transport>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
        store: Box<dyn BondStore>,
    ) -> (Self, SessionHandle) {
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot {
            powered: true,
            ..Default::default()
        });

        let engine = Self {
            config,
            transport,
            store,
            commands,
            events,
            timer_rx,
            snapshot_tx,
            timers: Timers::new(timer_tx),
            state: SessionState::Idle,
            powered: true,
            registry: DeviceRegistry::new(),
            connected: None,
            pending_connect: None,
            pending_services: HashSet::new(),
            bonding_pending: false,
            characteristics: CharacteristicTable::new(),
            router: NotificationRouter::new(),
            directory: DirectoryListing::default(),
            transfer: None,
            download_progress: 0.0,
            upload_progress: 0.0,
            live_sample: None,
            mask: GnssMaskControl::new(),
            trigger: StartTrigger::new(),
            firmware_revision: None,
            device_mode: None,
            rssi: None,
        };
        (engine, SessionHandle::new(command_tx, snapshot_rx))
    }

    /// Start the engine on the current runtime
    pub fn spawn(
        config: EngineConfig,
        transport: Arc<dyn Transport>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
        store: Box<dyn BondStore>,
    ) -> (SessionHandle, JoinHandle<()>) {
        let (engine, handle) = Self::new(config, transport, events, store);
        let task = tokio::spawn(engine.run());
        (handle, task)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Process messages until shutdown or until every handle is dropped
    pub async fn run(mut self) {
        info!("Session engine started");
        self.load_known_devices();
        self.auto_reconnect().await;
        self.publish();

        loop {
            let message = tokio::select! {
                command = self.commands.recv() => match command {
                    Some(SessionCommand::Shutdown) | None => break,
                    Some(command) => Message::Command(command),
                },
                Some(event) = self.events.recv() => Message::Transport(event),
                Some(tick) = self.timer_rx.recv() => Message::Timer(tick),
            };
            self.process(message).await;
            self.publish();
        }

        self.shutdown().await;
        info!("Session engine stopped");
    }

    pub(crate) async fn process(&mut self, message: Message) {
        match message {
            Message::Command(command) => self.handle_command(command).await,
            Message::Transport(event) => self.handle_event(event).await,
            Message::Timer(tick) => self.handle_timer(tick).await,
        }
    }

    // ===== Commands =====

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Request(request, reply) => {
                let result = self.handle_request(request).await;
                if let Err(e) = &result {
                    debug!("Request rejected: {}", e);
                }
                let _ = reply.send(result);
            }
            SessionCommand::Download {
                path,
                expected_size,
                completion,
            } => {
                let session = TransferSession::Download(DownloadSession::new(path, expected_size));
                self.begin_transfer(session, completion).await;
            }
            SessionCommand::Upload {
                path,
                data,
                completion,
            } => {
                let session = TransferSession::Upload(UploadSession::new(path, data));
                self.begin_transfer(session, completion).await;
            }
            SessionCommand::Shutdown => {}
        }
    }

    pub(crate) async fn handle_request(&mut self, request: Request) -> Result<()> {
        match request {
            Request::StartScan { pairing } => self.start_scan(pairing).await,
            Request::StopScan => self.stop_scan().await,
            Request::Connect(id) => self.connect(id).await,
            Request::Disconnect => match self.state.target() {
                Some(id) => {
                    self.pending_connect = None;
                    self.begin_disconnect(id).await;
                    Ok(())
                }
                None => Err(ProtocolError::NotConnected),
            },
            Request::Forget(id) => self.forget(id).await,
            Request::ListDirectory(path) => self.list_directory(path).await,
            Request::CancelTransfer => self.cancel_transfer().await,
            Request::GetMask => {
                self.require_connected(CharacteristicRole::GnssControl)?;
                let bytes = self.mask.request_get();
                self.write_mask(bytes).await
            }
            Request::SetMask(mask) => {
                self.require_connected(CharacteristicRole::GnssControl)?;
                let bytes = self.mask.request_set(mask);
                self.write_mask(bytes).await
            }
            Request::StartCountdown => {
                self.require_connected(CharacteristicRole::StartControl)?;
                let bytes = self.trigger.request_start();
                self.write_start(bytes).await
            }
            Request::CancelCountdown => {
                self.require_connected(CharacteristicRole::StartControl)?;
                let bytes = self.trigger.request_cancel();
                self.write_start(bytes).await
            }
            Request::SetDeviceMode(mode) => {
                self.write_role(CharacteristicRole::DeviceControl, &[mode], WriteKind::WithResponse)
                    .await
            }
            Request::Ping => {
                self.write_role(CharacteristicRole::FileIn, &packet::ping(), WriteKind::WithoutResponse)
                    .await
            }
            Request::RefreshRssi => {
                let id = self.connected_id()?;
                self.transport.read_rssi(id).await
            }
        }
    }

    async fn start_scan(&mut self, pairing: bool) -> Result<()> {
        if !self.powered {
            return Err(ProtocolError::invalid_state("Bluetooth is powered off"));
        }
        if !self.state.is_unattached() {
            return Err(ProtocolError::invalid_state(format!(
                "cannot scan while {}",
                self.state
            )));
        }
        if self.state == SessionState::ScanningPairing && !pairing {
            self.drop_pairing_candidates(None);
        }

        self.transport
            .start_scan(ScanFilter {
                services: vec![FILE_SERVICE_UUID],
                allow_duplicates: pairing,
            })
            .await?;
        self.state = if pairing {
            SessionState::ScanningPairing
        } else {
            SessionState::ScanningKnown
        };
        info!("Session: {}", self.state);
        Ok(())
    }

    async fn stop_scan(&mut self) -> Result<()> {
        if !self.state.is_scanning() {
            return Ok(());
        }
        if let Err(e) = self.transport.stop_scan().await {
            warn!("Failed to stop scan: {}", e);
        }
        if self.state == SessionState::ScanningPairing {
            self.drop_pairing_candidates(None);
        }
        self.state = SessionState::Idle;
        info!("Session: scan stopped");
        Ok(())
    }

    /// Pairing scan over: stop the disappearance timers and drop their
    /// devices, except `keep`
    fn drop_pairing_candidates(&mut self, keep: Option<DeviceId>) {
        let candidates: Vec<DeviceId> = self
            .timers
            .slots
            .keys()
            .filter_map(|kind| match kind {
                TimerKind::PairingTimeout(id) => Some(*id),
                _ => None,
            })
            .collect();
        self.timers
            .cancel_where(|kind| matches!(kind, TimerKind::PairingTimeout(_)));
        for id in candidates.into_iter().filter(|id| Some(*id) != keep) {
            self.registry.expire_pairing(&id);
        }
    }

    async fn connect(&mut self, id: DeviceId) -> Result<()> {
        if !self.powered {
            return Err(ProtocolError::invalid_state("Bluetooth is powered off"));
        }
        match self.state.target() {
            Some(current) if current == id && !matches!(self.state, SessionState::Disconnecting(_)) => {
                debug!("Already attached to {}", id);
                Ok(())
            }
            Some(current) => {
                info!("Switching from {} to {}", current, id);
                self.pending_connect = Some(id);
                if !matches!(self.state, SessionState::Disconnecting(_)) {
                    self.begin_disconnect(current).await;
                }
                Ok(())
            }
            None => self.start_connect(id).await,
        }
    }

    async fn start_connect(&mut self, id: DeviceId) -> Result<()> {
        if self.state.is_scanning() {
            if let Err(e) = self.transport.stop_scan().await {
                warn!("Failed to stop scan before connecting: {}", e);
            }
            if self.state == SessionState::ScanningPairing {
                self.drop_pairing_candidates(Some(id));
            }
        }
        if !self.registry.contains(&id) {
            let name = self
                .transport
                .resolve_peripheral(id)
                .await
                .and_then(|info| info.name);
            let bonded = self.is_bonded(&id);
            self.registry.ensure(id, name, bonded);
        }

        self.state = SessionState::Connecting(id);
        info!("Session: {}", self.state);
        if let Err(e) = self.transport.connect(id).await {
            warn!("Connect request for {} failed: {}", id, e);
            self.state = SessionState::Idle;
            return Err(e);
        }
        Ok(())
    }

    async fn begin_disconnect(&mut self, id: DeviceId) {
        self.state = SessionState::Disconnecting(id);
        info!("Session: {}", self.state);
        if let Err(e) = self.transport.disconnect(id).await {
            warn!("Disconnect request for {} failed: {}", id, e);
            self.handle_disconnected(id, None).await;
        }
    }

    async fn forget(&mut self, id: DeviceId) -> Result<()> {
        info!("Forgetting device {}", id);
        self.store.remove_bonded(&id)?;
        if self.store.last_connected_id()? == Some(id) {
            self.store.set_last_connected_id(None)?;
        }
        self.timers.cancel(TimerKind::PairingTimeout(id));
        self.registry.remove(&id);
        if self.state.target() == Some(id) {
            if self.pending_connect == Some(id) {
                self.pending_connect = None;
            }
            self.begin_disconnect(id).await;
        }
        Ok(())
    }

    async fn list_directory(&mut self, path: String) -> Result<()> {
        let request = packet::list_directory(&path)?;
        self.require_connected(CharacteristicRole::FileIn)?;
        self.require_connected(CharacteristicRole::FileOut)?;

        self.directory.begin(&path);
        debug!("Listing {}", path);
        if let Err(e) = self
            .write_role(CharacteristicRole::FileIn, &request, WriteKind::WithResponse)
            .await
        {
            self.directory.fail(e.to_string());
            return Err(e);
        }
        Ok(())
    }

    async fn write_mask(&mut self, bytes: Vec<u8>) -> Result<()> {
        let result = self
            .write_role(CharacteristicRole::GnssControl, &bytes, WriteKind::WithResponse)
            .await;
        if let Err(e) = &result {
            self.mask.write_failed(e.to_string());
        }
        result
    }

    async fn write_start(&mut self, bytes: Vec<u8>) -> Result<()> {
        let result = self
            .write_role(CharacteristicRole::StartControl, &bytes, WriteKind::WithResponse)
            .await;
        if let Err(e) = &result {
            self.trigger.fail_pending(e.to_string());
        }
        result
    }

    // ===== Transfers =====

    async fn begin_transfer(
        &mut self,
        session: TransferSession,
        completion: oneshot::Sender<TransferResult>,
    ) {
        let precondition = self
            .require_connected(CharacteristicRole::FileIn)
            .and_then(|_| self.require_connected(CharacteristicRole::FileOut));
        let request = precondition.and_then(|_| match &session {
            TransferSession::Download(d) => d.request(),
            TransferSession::Upload(u) => u.open_request(),
        });
        let request = match request {
            Ok(r) => r,
            Err(e) => {
                let _ = completion.send(Err(e));
                return;
            }
        };

        let mut active = ActiveTransfer::new(session, completion);
        if let Some(previous) = self.transfer.take() {
            warn!(
                "Transfer of {} replaced by {}",
                previous.path(),
                active.path()
            );
            self.end_transfer(previous, Err(ProtocolError::TransferInProgress));
        }
        if let Some(previous) =
            self.router
                .register(CharacteristicRole::FileOut, None, Consumer::Transfer)
        {
            self.consumer_evicted(previous);
        }
        info!("Starting {:?} of {}", active.direction(), active.path());

        if let Err(e) = self
            .write_role(CharacteristicRole::FileIn, &request, WriteKind::WithResponse)
            .await
        {
            self.router
                .unregister(CharacteristicRole::FileOut, None, Consumer::Transfer);
            active.finish(Err(e));
            return;
        }

        match active.direction() {
            TransferDirection::Download => self.download_progress = 0.0,
            TransferDirection::Upload => {
                self.upload_progress = 0.0;
                self.timers.arm(
                    TimerKind::UploadSettle,
                    self.config.upload_settle_delay(),
                    false,
                );
            }
        }
        self.transfer = Some(active);
    }

    async fn cancel_transfer(&mut self) -> Result<()> {
        let Some(active) = self.transfer.take() else {
            return Err(ProtocolError::invalid_state("no transfer in progress"));
        };
        info!("Cancelling transfer of {}", active.path());
        if let Err(e) = self
            .write_role(
                CharacteristicRole::FileIn,
                &packet::cancel_transfer(),
                WriteKind::WithResponse,
            )
            .await
        {
            warn!("Failed to send cancel: {}", e);
        }
        self.end_transfer(active, Err(ProtocolError::Cancelled("cancelled by caller".to_string())));
        Ok(())
    }

    fn end_transfer(&mut self, active: ActiveTransfer, result: TransferResult) {
        self.timers.cancel(TimerKind::UploadSettle);
        self.router
            .unregister(CharacteristicRole::FileOut, None, Consumer::Transfer);
        if result.is_ok() {
            match active.direction() {
                TransferDirection::Download => self.download_progress = 1.0,
                TransferDirection::Upload => self.upload_progress = 1.0,
            }
        }
        active.finish(result);
    }

    async fn on_transfer_packet(&mut self, bytes: &[u8]) {
        let packet = match packet::parse_file_packet(bytes) {
            Ok(p) => p,
            Err(e) => {
                debug!("Dropping file packet: {}", e);
                return;
            }
        };
        let Some(active) = self.transfer.as_mut() else {
            return;
        };
        let step = active.on_packet(packet);
        let progress = active.progress();
        match progress.direction {
            TransferDirection::Download => self.download_progress = progress.fraction,
            TransferDirection::Upload => self.upload_progress = progress.fraction,
        }

        match step {
            TransferStep::Continue(frames) => {
                if let Err(e) = self.write_frames(&frames).await {
                    if let Some(active) = self.transfer.take() {
                        self.end_transfer(active, Err(e));
                    }
                }
            }
            TransferStep::Finish(frames, result) => {
                let write = self.write_frames(&frames).await;
                if let Some(active) = self.transfer.take() {
                    let result = match (result, write) {
                        (Ok(_), Err(e)) => Err(e),
                        (result, _) => result,
                    };
                    self.end_transfer(active, result);
                }
            }
        }
    }

    async fn write_frames(&mut self, frames: &[Vec<u8>]) -> Result<()> {
        for frame in frames {
            self.write_role(CharacteristicRole::FileIn, frame, WriteKind::WithoutResponse)
                .await?;
        }
        Ok(())
    }

    // ===== Transport events =====

    pub(crate) async fn handle_event(&mut self, event: TransportEvent) {
        trace!("Transport event: {}", event);
        match event {
            TransportEvent::PoweredOn => {
                info!("Bluetooth powered on");
                self.powered = true;
                self.auto_reconnect().await;
            }
            TransportEvent::PoweredOff => self.handle_powered_off(),
            TransportEvent::Advertisement(adv) => self.handle_advertisement(adv),
            TransportEvent::Connected { id } => self.handle_connected(id).await,
            TransportEvent::ConnectFailed { id, error } => {
                self.handle_connect_failed(id, error).await
            }
            TransportEvent::Disconnected { id, error } => {
                self.handle_disconnected(id, error).await
            }
            TransportEvent::ServicesDiscovered { id, result } => {
                self.handle_services(id, result).await
            }
            TransportEvent::CharacteristicsDiscovered {
                id,
                service,
                result,
            } => self.handle_characteristics(id, service, result).await,
            TransportEvent::ValueUpdated {
                id,
                characteristic,
                value,
            } => self.handle_value(id, characteristic, value).await,
            TransportEvent::Rssi { id, result } => match result {
                Ok(rssi) => {
                    self.registry.set_rssi(&id, rssi);
                    if self.connected == Some(id) {
                        self.rssi = Some(rssi);
                    }
                }
                Err(e) => debug!("RSSI read for {} failed: {}", id, e),
            },
        }
    }

    fn handle_powered_off(&mut self) {
        warn!("Bluetooth powered off");
        self.powered = false;
        self.pending_connect = None;
        self.timers.cancel_all();
        self.teardown_device_state();
        self.registry.clear_connected();
        self.connected = None;
        self.state = SessionState::Idle;
    }

    fn handle_advertisement(&mut self, adv: Advertisement) {
        let bonded = self.is_bonded(&adv.id);
        let candidate = self.registry.observe(&adv, bonded);
        if candidate && self.state == SessionState::ScanningPairing {
            self.timers.arm(
                TimerKind::PairingTimeout(adv.id),
                self.config.pairing_timeout(),
                false,
            );
        }
    }

    async fn handle_connected(&mut self, id: DeviceId) {
        if self.state != SessionState::Connecting(id) {
            warn!("Unexpected connection to {} while {}", id, self.state);
            if self.state.target() != Some(id) {
                if let Err(e) = self.transport.disconnect(id).await {
                    warn!("Failed to drop stray connection {}: {}", id, e);
                }
            }
            return;
        }

        self.connected = Some(id);
        self.registry.set_connected(&id, true);
        self.state = SessionState::DiscoveringServices(id);
        info!("Session: {}", self.state);

        if let Err(e) = self.transport.discover_services(id, &DISCOVERY_SERVICES).await {
            error!("Service discovery request failed: {}", e);
            self.begin_disconnect(id).await;
        }
    }

    async fn handle_connect_failed(&mut self, id: DeviceId, error: TransportError) {
        if self.state != SessionState::Connecting(id) {
            return;
        }
        warn!("Connection to {} failed: {}", id, error);
        self.registry.set_connected(&id, false);
        self.state = SessionState::Idle;

        if let Some(next) = self.pending_connect.take() {
            if let Err(e) = self.start_connect(next).await {
                warn!("Queued connect to {} failed: {}", next, e);
            }
            return;
        }
        if self.last_connected() == Some(id) {
            if let Err(e) = self.start_scan(false).await {
                warn!("Could not restart scan: {}", e);
            }
        }
    }

    async fn handle_services(
        &mut self,
        id: DeviceId,
        result: std::result::Result<Vec<Uuid>, TransportError>,
    ) {
        if self.state != SessionState::DiscoveringServices(id) {
            return;
        }
        let services = match result {
            Ok(services) if !services.is_empty() => services,
            Ok(_) => {
                warn!("{} exposes none of the expected services", id);
                self.begin_disconnect(id).await;
                return;
            }
            Err(e) => {
                warn!("Service discovery on {} failed: {}", id, e);
                self.begin_disconnect(id).await;
                return;
            }
        };

        self.state = SessionState::DiscoveringCharacteristics(id);
        info!("Session: {}", self.state);
        self.pending_services = services.iter().copied().collect();
        for service in services {
            if let Err(e) = self.transport.discover_characteristics(id, service).await {
                warn!("Characteristic discovery for {} failed: {}", service, e);
                self.pending_services.remove(&service);
            }
        }
        if self.pending_services.is_empty() {
            self.evaluate_readiness(id).await;
        }
    }

    async fn handle_characteristics(
        &mut self,
        id: DeviceId,
        service: Uuid,
        result: std::result::Result<Vec<CharacteristicInfo>, TransportError>,
    ) {
        if self.state != SessionState::DiscoveringCharacteristics(id)
            || !self.pending_services.remove(&service)
        {
            return;
        }
        match result {
            Ok(characteristics) => {
                let roles = self.characteristics.record_service(service, &characteristics);
                debug!("Service {} provides {:?}", service, roles);
                for role in roles.into_iter().filter(|r| SUBSCRIBED_ROLES.contains(r)) {
                    if let Some(characteristic) = self.characteristics.get(role) {
                        if let Err(e) = self.transport.subscribe(id, characteristic).await {
                            warn!("Subscribe to {} failed: {}", role, e);
                        }
                    }
                }
            }
            Err(e) => warn!("Characteristics of {} unavailable: {}", service, e),
        }
        if self.pending_services.is_empty() {
            self.evaluate_readiness(id).await;
        }
    }

    /// All characteristics are known; decide between connected, bonding and failure
    async fn evaluate_readiness(&mut self, id: DeviceId) {
        if !self.characteristics.has_file_transfer_pair() {
            warn!("{} lacks the file transfer characteristics", id);
            self.begin_disconnect(id).await;
            return;
        }
        if self.is_bonded(&id) {
            self.become_connected(id).await;
            return;
        }

        info!("{} is not bonded, triggering pairing", id);
        self.bonding_pending = true;
        let read = match self.characteristics.require(CharacteristicRole::FileIn) {
            Ok(characteristic) => self.transport.read(id, characteristic).await,
            Err(e) => Err(e),
        };
        if let Err(e) = read {
            warn!("Pairing trigger read failed to start: {}", e);
            self.bonding_pending = false;
            self.begin_disconnect(id).await;
        }
    }

    async fn handle_bonding_read(
        &mut self,
        id: DeviceId,
        value: &std::result::Result<Vec<u8>, TransportError>,
    ) {
        match value {
            Ok(_) => {
                info!("Bonded with {}", id);
                self.bonding_pending = false;
                if let Err(e) = self.store.add_bonded(id) {
                    error!("Failed to persist bond for {}: {}", id, e);
                }
                self.registry.set_bonded(&id, true);
                self.become_connected(id).await;
            }
            Err(e) if e.is_security_pending() => {
                info!("Waiting for the platform to finish pairing with {}", id);
            }
            Err(e) => {
                warn!("Pairing with {} failed: {}", id, e);
                self.bonding_pending = false;
                self.begin_disconnect(id).await;
            }
        }
    }

    async fn become_connected(&mut self, id: DeviceId) {
        self.state = SessionState::Connected(id);
        info!("Session: {}", self.state);
        self.registry.set_bonded(&id, true);
        if let Err(e) = self.store.set_last_connected_id(Some(id)) {
            error!("Failed to persist last connected device: {}", e);
        }

        use CharacteristicRole::*;
        self.router
            .register(FileOut, Some(opcode::DIRECTORY_ENTRY), Consumer::Directory);
        self.router
            .register(FileOut, Some(opcode::LIST_DIRECTORY), Consumer::Directory);
        self.router
            .register(FileOut, Some(opcode::PING), Consumer::Keepalive);
        self.router.register(GnssMeasurement, None, Consumer::Telemetry);
        self.router.register(GnssControl, None, Consumer::GnssControl);
        self.router.register(StartControl, None, Consumer::StartControl);
        self.router.register(StartResult, None, Consumer::StartResult);
        self.router.register(DeviceMode, None, Consumer::DeviceMode);
        self.router
            .register(FirmwareRevision, None, Consumer::FirmwareRevision);

        self.timers.arm(
            TimerKind::Keepalive,
            self.config.keepalive_interval(),
            true,
        );

        for role in [FirmwareRevision, DeviceMode] {
            if let Some(characteristic) = self.characteristics.get(role) {
                if let Err(e) = self.transport.read(id, characteristic).await {
                    debug!("Initial read of {} failed: {}", role, e);
                }
            }
        }
        if self.characteristics.contains(GnssControl) {
            let bytes = self.mask.request_get();
            if let Err(e) = self.write_mask(bytes).await {
                debug!("Initial mask read failed: {}", e);
            }
        }
    }

    async fn handle_disconnected(&mut self, id: DeviceId, error: Option<TransportError>) {
        let attached = self.connected == Some(id) || self.state.target() == Some(id);
        if !attached {
            debug!("Ignoring disconnect of unrelated device {}", id);
            return;
        }
        match &error {
            Some(e) => warn!("Disconnected from {}: {}", id, e),
            None => info!("Disconnected from {}", id),
        }

        self.timers.cancel(TimerKind::Keepalive);
        self.teardown_device_state();
        self.registry.set_connected(&id, false);
        self.connected = None;
        self.state = SessionState::Idle;

        if let Some(next) = self.pending_connect.take() {
            if let Err(e) = self.start_connect(next).await {
                warn!("Queued connect to {} failed: {}", next, e);
            }
            return;
        }
        if error.is_some() {
            self.auto_reconnect().await;
        }
    }

    /// Drop everything learned from the current peripheral
    fn teardown_device_state(&mut self) {
        if let Some(active) = self.transfer.take() {
            self.end_transfer(active, Err(ProtocolError::ConnectionLost));
        }
        self.timers.cancel(TimerKind::UploadSettle);
        self.characteristics.clear();
        self.router.clear();
        self.pending_services.clear();
        self.bonding_pending = false;
        if self.directory.awaiting_response {
            self.directory.fail("connection lost");
        }
        self.mask.reset();
        self.trigger.reset();
        self.firmware_revision = None;
        self.device_mode = None;
        self.rssi = None;
        self.live_sample = None;
    }

    async fn auto_reconnect(&mut self) {
        if !self.config.auto_reconnect
            || !self.powered
            || self.state != SessionState::Idle
            || self.connected.is_some()
        {
            return;
        }
        let Some(last) = self.last_connected() else {
            return;
        };

        match self.transport.resolve_peripheral(last).await {
            Some(info) => {
                info!("Reconnecting to {}", last);
                let bonded = self.is_bonded(&last);
                self.registry.ensure(last, info.name, bonded);
                if let Err(e) = self.start_connect(last).await {
                    warn!("Reconnect to {} failed: {}", last, e);
                }
            }
            None => {
                info!("{} not resolvable, scanning for known devices", last);
                if let Err(e) = self.start_scan(false).await {
                    warn!("Fallback scan failed: {}", e);
                }
            }
        }
    }

    async fn handle_value(
        &mut self,
        id: DeviceId,
        characteristic: CharacteristicRef,
        value: std::result::Result<Vec<u8>, TransportError>,
    ) {
        if self.state.target() != Some(id) {
            return;
        }
        let Some(role) = self.characteristics.role_of(&characteristic) else {
            trace!("Update on unknown characteristic {}", characteristic.uuid);
            return;
        };

        if role == CharacteristicRole::FileIn {
            if self.bonding_pending && self.state == SessionState::DiscoveringCharacteristics(id) {
                self.handle_bonding_read(id, &value).await;
            }
            return;
        }

        let bytes = match value {
            Ok(bytes) => bytes,
            Err(e) => {
                let consumers = self.router.route_error(role);
                if consumers.is_empty() {
                    debug!("Unclaimed error on {}: {}", role, e);
                }
                for consumer in consumers {
                    self.dispatch_error(consumer, &e);
                }
                return;
            }
        };

        match self.router.route_value(role, &bytes) {
            Some(consumer) => self.dispatch(consumer, &bytes).await,
            None => trace!("Unclaimed update on {}: {}", role, hex::encode(&bytes)),
        }
    }

    async fn dispatch(&mut self, consumer: Consumer, bytes: &[u8]) {
        match consumer {
            Consumer::Directory => match packet::parse_file_packet(bytes) {
                Ok(FilePacket::DirectoryEntry(body)) => {
                    if self.directory.accept(body) {
                        info!(
                            "Listing of {} complete: {} entries",
                            self.directory.path,
                            self.directory.entries.len()
                        );
                    }
                }
                Ok(FilePacket::Nak { opcode }) => {
                    let reason = ProtocolError::Nak { opcode }.to_string();
                    warn!("Listing of {} rejected", self.directory.path);
                    self.directory.fail(reason);
                }
                Ok(other) => trace!("Directory ignoring {:?}", other),
                Err(e) => debug!("Dropping directory packet: {}", e),
            },
            Consumer::Transfer => self.on_transfer_packet(bytes).await,
            Consumer::Keepalive => trace!("Keepalive echoed"),
            Consumer::Telemetry => match telemetry::decode_sample(bytes) {
                Some(sample) => self.live_sample = Some(sample),
                None => debug!("Dropping empty telemetry notification"),
            },
            Consumer::GnssControl => {
                if let MaskFollowUp::Send(request) = self.mask.handle_response(bytes) {
                    if let Err(e) = self.write_mask(request).await {
                        warn!("Mask re-read failed: {}", e);
                    }
                }
            }
            Consumer::StartControl => self.trigger.handle_response(bytes),
            Consumer::StartResult => self.trigger.handle_result(bytes, Utc::now()),
            Consumer::DeviceMode => match bytes.first() {
                Some(&mode) => self.device_mode = Some(mode),
                None => debug!("Dropping empty device mode update"),
            },
            Consumer::FirmwareRevision => {
                let revision = String::from_utf8_lossy(bytes)
                    .trim_end_matches('\0')
                    .trim()
                    .to_string();
                info!("Firmware revision {}", revision);
                self.firmware_revision = Some(revision);
            }
        }
    }

    /// Fail whatever `consumer` was waiting for on a channel that errored
    fn dispatch_error(&mut self, consumer: Consumer, error: &TransportError) {
        match consumer {
            Consumer::Transfer => {
                if let Some(active) = self.transfer.take() {
                    self.end_transfer(active, Err(ProtocolError::Transport(error.clone())));
                }
            }
            Consumer::Directory => {
                if self.directory.awaiting_response {
                    warn!("Listing of {} failed: {}", self.directory.path, error);
                    self.directory.fail(error.to_string());
                }
            }
            Consumer::GnssControl => {
                if self.mask.fail_pending(error.to_string()) {
                    warn!("GNSS mask exchange failed: {}", error);
                }
            }
            Consumer::StartControl => {
                self.trigger.fail_pending(error.to_string());
            }
            other => debug!("{:?} update error: {}", other, error),
        }
    }

    /// Another handler took a route `consumer` was using
    fn consumer_evicted(&mut self, consumer: Consumer) {
        match consumer {
            Consumer::Transfer => {
                if let Some(active) = self.transfer.take() {
                    self.end_transfer(active, Err(ProtocolError::TransferInProgress));
                }
            }
            other => debug!("{:?} lost its route", other),
        }
    }

    // ===== Timers =====

    async fn handle_timer(&mut self, tick: TimerEvent) {
        if !self.timers.accept(&tick) {
            trace!("Stale timer tick {:?}", tick);
            return;
        }
        match tick.kind {
            TimerKind::Keepalive => {
                let SessionState::Connected(id) = self.state else {
                    return;
                };
                if let Err(e) = self
                    .write_role(CharacteristicRole::FileIn, &packet::ping(), WriteKind::WithoutResponse)
                    .await
                {
                    debug!("Keepalive ping failed: {}", e);
                }
                if self.config.read_rssi_on_keepalive {
                    if let Err(e) = self.transport.read_rssi(id).await {
                        debug!("Keepalive RSSI read failed: {}", e);
                    }
                }
            }
            TimerKind::UploadSettle => {
                let frames = match self.transfer.as_mut() {
                    Some(active) => active.start_upload(),
                    None => return,
                };
                if let Err(e) = self.write_frames(&frames).await {
                    if let Some(active) = self.transfer.take() {
                        self.end_transfer(active, Err(e));
                    }
                }
            }
            TimerKind::PairingTimeout(id) => {
                self.registry.expire_pairing(&id);
            }
        }
    }

    // ===== Helpers =====

    fn connected_id(&self) -> Result<DeviceId> {
        match self.state {
            SessionState::Connected(id) => Ok(id),
            _ => Err(ProtocolError::NotConnected),
        }
    }

    fn require_connected(&self, role: CharacteristicRole) -> Result<CharacteristicRef> {
        self.connected_id()?;
        self.characteristics.require(role)
    }

    async fn write_role(
        &self,
        role: CharacteristicRole,
        data: &[u8],
        kind: WriteKind,
    ) -> Result<()> {
        let id = self.connected_id()?;
        let characteristic = self.characteristics.require(role)?;
        self.transport.write(id, characteristic, data, kind).await
    }

    fn is_bonded(&self, id: &DeviceId) -> bool {
        self.store.is_bonded(id).unwrap_or_else(|e| {
            error!("Bond store read failed: {}", e);
            false
        })
    }

    fn last_connected(&self) -> Option<DeviceId> {
        self.store.last_connected_id().unwrap_or_else(|e| {
            error!("Bond store read failed: {}", e);
            None
        })
    }

    /// Seed the registry with bonded identities
    fn load_known_devices(&mut self) {
        let ids = self.store.bonded_ids().unwrap_or_else(|e| {
            error!("Bond store read failed: {}", e);
            Default::default()
        });
        for id in ids {
            if !self.registry.contains(&id) {
                self.registry.ensure(id, None, true);
            }
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            connected_device: self.connected,
            powered: self.powered,
            known_devices: self.registry.known_devices(),
            pairing_devices: self.registry.pairing_devices(),
            directory: self.directory.clone(),
            transfer: self.transfer.as_ref().map(|t| t.progress()),
            download_progress: self.download_progress,
            upload_progress: self.upload_progress,
            live_sample: self.live_sample,
            gnss_mask: self.mask.mask(),
            gnss_mask_status: self.mask.status().clone(),
            start_trigger: self.trigger.state(),
            start_result: self.trigger.last_result().cloned(),
            start_pending: self.trigger.is_pending(),
            start_error: self.trigger.last_error().map(str::to_string),
            firmware_revision: self.firmware_revision.clone(),
            device_mode: self.device_mode,
            rssi: self.rssi,
        }
    }

    pub(crate) fn publish(&self) {
        self.snapshot_tx.send_replace(self.snapshot());
    }

    async fn shutdown(&mut self) {
        self.timers.cancel_all();
        if let Some(active) = self.transfer.take() {
            active.finish(Err(ProtocolError::EngineStopped));
        }
        if let Some(id) = self.state.target() {
            if let Err(e) = self.transport.disconnect(id).await {
                debug!("Disconnect on shutdown failed: {}", e);
            }
        }
        self.state = SessionState::Idle;
        self.publish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{GnssMaskStatus, StartTriggerState};
    use crate::error::TransportErrorKind;
    use crate::gatt::{
        CharacteristicProperties, DEVICE_INFORMATION_SERVICE_UUID, FILE_IN_CHAR_UUID,
        FILE_OUT_CHAR_UUID, FIRMWARE_REVISION_CHAR_UUID, GNSS_CONTROL_CHAR_UUID,
        GNSS_SERVICE_UUID, START_CONTROL_CHAR_UUID, START_RESULT_CHAR_UUID, START_SERVICE_UUID,
    };
    use crate::store::MemoryBondStore;
    use crate::test_utils::{MockTransport, TransportCall};

    fn device(n: u128) -> DeviceId {
        DeviceId(Uuid::from_u128(n))
    }

    fn info(uuid: Uuid) -> CharacteristicInfo {
        CharacteristicInfo {
            uuid,
            properties: CharacteristicProperties::default(),
        }
    }

    fn engine_with(store: MemoryBondStore) -> (SessionEngine, SessionHandle, Arc<MockTransport>) {
        engine_with_config(EngineConfig::default(), Box::new(store))
    }

    fn engine_with_config(
        config: EngineConfig,
        store: Box<dyn BondStore>,
    ) -> (SessionEngine, SessionHandle, Arc<MockTransport>) {
        let transport = Arc::new(MockTransport::new());
        let (_tx, rx) = mpsc::unbounded_channel();
        let (engine, handle) = SessionEngine::new(config, transport.clone(), rx, store);
        (engine, handle, transport)
    }

    fn failed_update(id: DeviceId, characteristic: CharacteristicRef) -> TransportEvent {
        TransportEvent::ValueUpdated {
            id,
            characteristic,
            value: Err(TransportError::other("attribute error")),
        }
    }

    fn pairing_advertisement(id: DeviceId) -> TransportEvent {
        TransportEvent::Advertisement(Advertisement {
            id,
            name: None,
            rssi: Some(-70),
            payload: crate::device::AdvertisementPayload {
                manufacturer_data: Some(vec![crate::device::PAIRING_MODE_FLAG]),
                services: Vec::new(),
            },
        })
    }

    /// Bond store whose writes always fail
    #[derive(Debug)]
    struct ReadOnlyStore(MemoryBondStore);

    impl BondStore for ReadOnlyStore {
        fn bonded_ids(&self) -> Result<std::collections::BTreeSet<DeviceId>> {
            self.0.bonded_ids()
        }

        fn set_bonded_ids(&mut self, _ids: &std::collections::BTreeSet<DeviceId>) -> Result<()> {
            Err(ProtocolError::Storage("read-only".to_string()))
        }

        fn last_connected_id(&self) -> Result<Option<DeviceId>> {
            self.0.last_connected_id()
        }

        fn set_last_connected_id(&mut self, _id: Option<DeviceId>) -> Result<()> {
            Err(ProtocolError::Storage("read-only".to_string()))
        }
    }

    fn file_ref(uuid: Uuid) -> CharacteristicRef {
        CharacteristicRef::new(FILE_SERVICE_UUID, uuid)
    }

    async fn event(engine: &mut SessionEngine, event: TransportEvent) {
        engine.process(Message::Transport(event)).await;
    }

    /// Drive a bonded device all the way to Connected
    async fn connect_bonded(engine: &mut SessionEngine, id: DeviceId) {
        engine.handle_request(Request::Connect(id)).await.unwrap();
        event(engine, TransportEvent::Connected { id }).await;
        event(
            engine,
            TransportEvent::ServicesDiscovered {
                id,
                result: Ok(vec![
                    FILE_SERVICE_UUID,
                    GNSS_SERVICE_UUID,
                    START_SERVICE_UUID,
                    DEVICE_INFORMATION_SERVICE_UUID,
                ]),
            },
        )
        .await;
        event(
            engine,
            TransportEvent::CharacteristicsDiscovered {
                id,
                service: FILE_SERVICE_UUID,
                result: Ok(vec![info(FILE_IN_CHAR_UUID), info(FILE_OUT_CHAR_UUID)]),
            },
        )
        .await;
        event(
            engine,
            TransportEvent::CharacteristicsDiscovered {
                id,
                service: GNSS_SERVICE_UUID,
                result: Ok(vec![info(GNSS_CONTROL_CHAR_UUID)]),
            },
        )
        .await;
        event(
            engine,
            TransportEvent::CharacteristicsDiscovered {
                id,
                service: START_SERVICE_UUID,
                result: Ok(vec![
                    info(START_CONTROL_CHAR_UUID),
                    info(START_RESULT_CHAR_UUID),
                ]),
            },
        )
        .await;
        event(
            engine,
            TransportEvent::CharacteristicsDiscovered {
                id,
                service: DEVICE_INFORMATION_SERVICE_UUID,
                result: Ok(vec![info(FIRMWARE_REVISION_CHAR_UUID)]),
            },
        )
        .await;
    }

    fn notify(id: DeviceId, characteristic: CharacteristicRef, bytes: &[u8]) -> TransportEvent {
        TransportEvent::ValueUpdated {
            id,
            characteristic,
            value: Ok(bytes.to_vec()),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_generations() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = Timers::new(tx);

        timers.arm(TimerKind::Keepalive, Duration::from_secs(5), true);
        let first = rx.recv().await.unwrap();
        assert!(timers.accept(&first));
        // repeating timers stay armed after a tick
        assert!(timers.accept(&first));

        timers.arm(TimerKind::Keepalive, Duration::from_secs(5), true);
        assert!(!timers.accept(&first));

        let settle = TimerKind::UploadSettle;
        timers.arm(settle, Duration::from_millis(500), false);
        let tick = loop {
            let tick = rx.recv().await.unwrap();
            if tick.kind == settle {
                break tick;
            }
        };
        assert!(timers.accept(&tick));
        assert!(!timers.is_armed(settle));

        timers.cancel_all();
        assert!(!timers.is_armed(TimerKind::Keepalive));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_period_repeating_timer_is_not_armed() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut timers = Timers::new(tx);
        timers.arm(TimerKind::Keepalive, Duration::ZERO, true);
        assert!(!timers.is_armed(TimerKind::Keepalive));

        // one-shot timers may fire immediately
        timers.arm(TimerKind::UploadSettle, Duration::ZERO, false);
        assert!(timers.is_armed(TimerKind::UploadSettle));
    }

    #[tokio::test]
    async fn test_zero_keepalive_interval_still_connects() {
        let id = device(30);
        let config = EngineConfig {
            keepalive_interval_secs: 0,
            ..EngineConfig::default()
        };
        let (mut engine, _handle, _transport) =
            engine_with_config(config, Box::new(MemoryBondStore::with_bonded([id])));
        connect_bonded(&mut engine, id).await;

        assert_eq!(engine.state(), SessionState::Connected(id));
        assert!(!engine.timers.is_armed(TimerKind::Keepalive));
    }

    #[tokio::test]
    async fn test_bonded_device_reaches_connected() {
        let id = device(1);
        let (mut engine, _handle, transport) = engine_with(MemoryBondStore::with_bonded([id]));
        connect_bonded(&mut engine, id).await;

        assert_eq!(engine.state(), SessionState::Connected(id));
        assert!(engine.timers.is_armed(TimerKind::Keepalive));
        assert_eq!(engine.store.last_connected_id().unwrap(), Some(id));

        let calls = transport.calls();
        assert!(calls.contains(&TransportCall::Subscribe(file_ref(FILE_OUT_CHAR_UUID))));
        // initial mask read goes out on the GNSS control point
        assert!(calls.iter().any(|c| matches!(
            c,
            TransportCall::Write { characteristic, data, .. }
                if characteristic.uuid == GNSS_CONTROL_CHAR_UUID && data == &vec![0x01]
        )));
        assert!(calls.contains(&TransportCall::Read(CharacteristicRef::new(
            DEVICE_INFORMATION_SERVICE_UUID,
            FIRMWARE_REVISION_CHAR_UUID
        ))));
    }

    #[tokio::test]
    async fn test_bonding_trigger_waits_through_security_errors() {
        let id = device(2);
        let (mut engine, _handle, transport) = engine_with(MemoryBondStore::new());
        connect_bonded(&mut engine, id).await;

        assert_eq!(engine.state(), SessionState::DiscoveringCharacteristics(id));
        assert!(transport
            .calls()
            .contains(&TransportCall::Read(file_ref(FILE_IN_CHAR_UUID))));

        event(
            &mut engine,
            TransportEvent::ValueUpdated {
                id,
                characteristic: file_ref(FILE_IN_CHAR_UUID),
                value: Err(TransportError::new(
                    TransportErrorKind::InsufficientEncryption,
                    "encryption required",
                )),
            },
        )
        .await;
        assert_eq!(engine.state(), SessionState::DiscoveringCharacteristics(id));

        event(&mut engine, notify(id, file_ref(FILE_IN_CHAR_UUID), &[])).await;
        assert_eq!(engine.state(), SessionState::Connected(id));
        assert!(engine.store.is_bonded(&id).unwrap());
    }

    #[tokio::test]
    async fn test_bonding_trigger_hard_failure_disconnects() {
        let id = device(3);
        let (mut engine, _handle, transport) = engine_with(MemoryBondStore::new());
        connect_bonded(&mut engine, id).await;

        event(
            &mut engine,
            TransportEvent::ValueUpdated {
                id,
                characteristic: file_ref(FILE_IN_CHAR_UUID),
                value: Err(TransportError::other("gatt error")),
            },
        )
        .await;
        assert_eq!(engine.state(), SessionState::Disconnecting(id));
        assert!(transport.calls().contains(&TransportCall::Disconnect(id)));
    }

    #[tokio::test]
    async fn test_missing_file_characteristics_disconnects() {
        let id = device(4);
        let (mut engine, _handle, _transport) = engine_with(MemoryBondStore::with_bonded([id]));
        engine.handle_request(Request::Connect(id)).await.unwrap();
        event(&mut engine, TransportEvent::Connected { id }).await;
        event(
            &mut engine,
            TransportEvent::ServicesDiscovered {
                id,
                result: Ok(vec![FILE_SERVICE_UUID]),
            },
        )
        .await;
        event(
            &mut engine,
            TransportEvent::CharacteristicsDiscovered {
                id,
                service: FILE_SERVICE_UUID,
                result: Ok(vec![info(FILE_IN_CHAR_UUID)]),
            },
        )
        .await;
        assert_eq!(engine.state(), SessionState::Disconnecting(id));
    }

    #[tokio::test]
    async fn test_empty_service_list_disconnects() {
        let id = device(5);
        let (mut engine, _handle, _transport) = engine_with(MemoryBondStore::new());
        engine.handle_request(Request::Connect(id)).await.unwrap();
        event(&mut engine, TransportEvent::Connected { id }).await;
        event(
            &mut engine,
            TransportEvent::ServicesDiscovered {
                id,
                result: Ok(vec![]),
            },
        )
        .await;
        assert_eq!(engine.state(), SessionState::Disconnecting(id));
    }

    #[tokio::test]
    async fn test_connect_to_same_device_is_noop() {
        let id = device(6);
        let (mut engine, _handle, transport) = engine_with(MemoryBondStore::new());
        engine.handle_request(Request::Connect(id)).await.unwrap();
        engine.handle_request(Request::Connect(id)).await.unwrap();
        let connects = transport
            .calls()
            .into_iter()
            .filter(|c| *c == TransportCall::Connect(id))
            .count();
        assert_eq!(connects, 1);
    }

    #[tokio::test]
    async fn test_connect_other_device_disconnects_first() {
        let a = device(7);
        let b = device(8);
        let (mut engine, _handle, transport) = engine_with(MemoryBondStore::with_bonded([a, b]));
        connect_bonded(&mut engine, a).await;

        engine.handle_request(Request::Connect(b)).await.unwrap();
        assert_eq!(engine.state(), SessionState::Disconnecting(a));
        assert!(!transport.calls().contains(&TransportCall::Connect(b)));

        event(&mut engine, TransportEvent::Disconnected { id: a, error: None }).await;
        assert_eq!(engine.state(), SessionState::Connecting(b));
        assert!(transport.calls().contains(&TransportCall::Connect(b)));
    }

    #[tokio::test]
    async fn test_connect_failure_rescans_for_last_device() {
        let id = device(9);
        let mut store = MemoryBondStore::with_bonded([id]);
        store.set_last_connected_id(Some(id)).unwrap();
        let (mut engine, _handle, transport) = engine_with(store);

        engine.handle_request(Request::Connect(id)).await.unwrap();
        event(
            &mut engine,
            TransportEvent::ConnectFailed {
                id,
                error: TransportError::other("timeout"),
            },
        )
        .await;
        assert_eq!(engine.state(), SessionState::ScanningKnown);
        assert!(transport
            .calls()
            .iter()
            .any(|c| matches!(c, TransportCall::StartScan(_))));
    }

    #[tokio::test]
    async fn test_unexpected_disconnect_reconnects_when_resolvable() {
        let id = device(10);
        let (mut engine, _handle, transport) = engine_with(MemoryBondStore::with_bonded([id]));
        transport.make_resolvable(id);
        connect_bonded(&mut engine, id).await;

        event(
            &mut engine,
            TransportEvent::Disconnected {
                id,
                error: Some(TransportError::other("supervision timeout")),
            },
        )
        .await;
        assert_eq!(engine.state(), SessionState::Connecting(id));
        assert!(!engine.timers.is_armed(TimerKind::Keepalive));
        assert!(engine.characteristics.is_empty());
    }

    #[tokio::test]
    async fn test_unexpected_disconnect_falls_back_to_scan() {
        let id = device(11);
        let (mut engine, _handle, _transport) = engine_with(MemoryBondStore::with_bonded([id]));
        connect_bonded(&mut engine, id).await;

        event(
            &mut engine,
            TransportEvent::Disconnected {
                id,
                error: Some(TransportError::other("gone")),
            },
        )
        .await;
        assert_eq!(engine.state(), SessionState::ScanningKnown);
    }

    #[tokio::test]
    async fn test_clean_disconnect_stays_idle() {
        let id = device(12);
        let (mut engine, _handle, transport) = engine_with(MemoryBondStore::with_bonded([id]));
        transport.make_resolvable(id);
        connect_bonded(&mut engine, id).await;

        engine.handle_request(Request::Disconnect).await.unwrap();
        assert_eq!(engine.state(), SessionState::Disconnecting(id));
        event(&mut engine, TransportEvent::Disconnected { id, error: None }).await;
        assert_eq!(engine.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_power_off_clears_everything() {
        let id = device(13);
        let (mut engine, _handle, _transport) = engine_with(MemoryBondStore::with_bonded([id]));
        connect_bonded(&mut engine, id).await;

        event(&mut engine, TransportEvent::PoweredOff).await;
        assert_eq!(engine.state(), SessionState::Idle);
        assert!(engine.connected.is_none());
        assert!(!engine.registry.get(&id).unwrap().is_connected);
        assert!(matches!(
            engine.handle_request(Request::StartScan { pairing: false }).await,
            Err(ProtocolError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_keepalive_pings_and_reads_rssi() {
        let id = device(14);
        let (mut engine, _handle, transport) = engine_with(MemoryBondStore::with_bonded([id]));
        connect_bonded(&mut engine, id).await;
        transport.clear();

        let generation = engine.timers.generation(TimerKind::Keepalive).unwrap();
        engine
            .process(Message::Timer(TimerEvent {
                kind: TimerKind::Keepalive,
                generation,
            }))
            .await;
        let calls = transport.calls();
        assert!(calls.contains(&TransportCall::Write {
            characteristic: file_ref(FILE_IN_CHAR_UUID),
            data: vec![0xFE],
            kind: WriteKind::WithoutResponse,
        }));
        assert!(calls.contains(&TransportCall::ReadRssi(id)));

        // a tick from an older generation does nothing
        transport.clear();
        engine
            .process(Message::Timer(TimerEvent {
                kind: TimerKind::Keepalive,
                generation: generation - 1,
            }))
            .await;
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn test_pairing_timer_removes_unbonded_device() {
        let id = device(15);
        let (mut engine, _handle, _transport) = engine_with(MemoryBondStore::new());
        engine
            .handle_request(Request::StartScan { pairing: true })
            .await
            .unwrap();
        event(
            &mut engine,
            TransportEvent::Advertisement(Advertisement {
                id,
                name: Some("GNSS".to_string()),
                rssi: Some(-60),
                payload: crate::device::AdvertisementPayload {
                    manufacturer_data: Some(vec![crate::device::PAIRING_MODE_FLAG]),
                    services: vec![FILE_SERVICE_UUID],
                },
            }),
        )
        .await;
        assert_eq!(engine.registry.pairing_devices().len(), 1);

        let kind = TimerKind::PairingTimeout(id);
        let generation = engine.timers.generation(kind).unwrap();
        engine
            .process(Message::Timer(TimerEvent { kind, generation }))
            .await;
        assert!(engine.registry.pairing_devices().is_empty());
        assert!(!engine.timers.is_armed(kind));
    }

    #[tokio::test]
    async fn test_stop_scan_cancels_pairing_timers() {
        let id = device(16);
        let (mut engine, _handle, _transport) = engine_with(MemoryBondStore::new());
        engine
            .handle_request(Request::StartScan { pairing: true })
            .await
            .unwrap();
        event(
            &mut engine,
            TransportEvent::Advertisement(Advertisement {
                id,
                name: None,
                rssi: Some(-70),
                payload: crate::device::AdvertisementPayload {
                    manufacturer_data: Some(vec![crate::device::PAIRING_MODE_FLAG]),
                    services: Vec::new(),
                },
            }),
        )
        .await;
        engine.handle_request(Request::StopScan).await.unwrap();
        assert_eq!(engine.state(), SessionState::Idle);
        assert!(!engine.timers.is_armed(TimerKind::PairingTimeout(id)));
        assert!(engine.registry.pairing_devices().is_empty());
    }

    #[tokio::test]
    async fn test_directory_listing_and_nak() {
        let id = device(17);
        let (mut engine, _handle, transport) = engine_with(MemoryBondStore::with_bonded([id]));
        connect_bonded(&mut engine, id).await;
        transport.clear();

        engine
            .handle_request(Request::ListDirectory("/LOG".to_string()))
            .await
            .unwrap();
        assert!(engine.directory.awaiting_response);
        assert!(transport.calls().contains(&TransportCall::Write {
            characteristic: file_ref(FILE_IN_CHAR_UUID),
            data: b"\x05/LOG\0".to_vec(),
            kind: WriteKind::WithResponse,
        }));

        let mut entry = vec![opcode::DIRECTORY_ENTRY];
        entry.extend_from_slice(&[0u8; 22]);
        entry[1] = 10;
        // 2025-01-01 00:00:00
        entry[5..7].copy_from_slice(&0x5A21u16.to_le_bytes());
        entry[10..15].copy_from_slice(b"A.UBX");
        event(&mut engine, notify(id, file_ref(FILE_OUT_CHAR_UUID), &entry)).await;
        let mut end = vec![opcode::DIRECTORY_ENTRY];
        end.extend_from_slice(&[0u8; 22]);
        event(&mut engine, notify(id, file_ref(FILE_OUT_CHAR_UUID), &end)).await;

        assert!(!engine.directory.awaiting_response);
        assert_eq!(engine.directory.entries.len(), 1);
        assert_eq!(engine.directory.entries[0].name, "A.UBX");

        engine
            .handle_request(Request::ListDirectory("/NOPE".to_string()))
            .await
            .unwrap();
        event(&mut engine, notify(id, file_ref(FILE_OUT_CHAR_UUID), &[0xF0, 0x05])).await;
        assert!(!engine.directory.awaiting_response);
        assert!(engine.directory.error.is_some());
    }

    #[tokio::test]
    async fn test_requests_fail_before_wire_traffic_when_disconnected() {
        let (mut engine, _handle, transport) = engine_with(MemoryBondStore::new());
        assert!(matches!(
            engine
                .handle_request(Request::ListDirectory("/".to_string()))
                .await,
            Err(ProtocolError::NotConnected)
        ));
        assert!(matches!(
            engine.handle_request(Request::SetMask(0x07)).await,
            Err(ProtocolError::NotConnected)
        ));
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn test_control_points_update_published_state() {
        let id = device(18);
        let (mut engine, handle, _transport) = engine_with(MemoryBondStore::with_bonded([id]));
        connect_bonded(&mut engine, id).await;

        let gnss = CharacteristicRef::new(GNSS_SERVICE_UUID, GNSS_CONTROL_CHAR_UUID);
        event(&mut engine, notify(id, gnss, &[0xF0, 0x01, 0x00, 0x1F])).await;
        engine.handle_request(Request::StartCountdown).await.unwrap();
        let start = CharacteristicRef::new(START_SERVICE_UUID, START_CONTROL_CHAR_UUID);
        event(&mut engine, notify(id, start, &[0xF0, 0x01, 0x00])).await;
        engine.publish();

        let snapshot = handle.snapshot();
        assert_eq!(snapshot.gnss_mask, Some(0x1F));
        assert_eq!(snapshot.gnss_mask_status, GnssMaskStatus::Idle);
        assert_eq!(snapshot.start_trigger, StartTriggerState::Counting);

        let result = CharacteristicRef::new(START_SERVICE_UUID, START_RESULT_CHAR_UUID);
        event(&mut engine, notify(id, result, &[0x01])).await;
        engine.publish();
        let snapshot = handle.snapshot();
        assert_eq!(snapshot.start_trigger, StartTriggerState::Idle);
        assert!(snapshot.start_result.is_some());
    }

    #[tokio::test]
    async fn test_firmware_revision_published() {
        let id = device(19);
        let (mut engine, _handle, _transport) = engine_with(MemoryBondStore::with_bonded([id]));
        connect_bonded(&mut engine, id).await;
        let fw = CharacteristicRef::new(DEVICE_INFORMATION_SERVICE_UUID, FIRMWARE_REVISION_CHAR_UUID);
        event(&mut engine, notify(id, fw, b"2.4.1\0\0")).await;
        assert_eq!(engine.firmware_revision.as_deref(), Some("2.4.1"));
    }

    #[tokio::test]
    async fn test_upload_waits_for_settle_then_fills_window() {
        let id = device(21);
        let (mut engine, _handle, transport) = engine_with(MemoryBondStore::with_bonded([id]));
        connect_bonded(&mut engine, id).await;
        transport.clear();

        let (completion, mut rx) = oneshot::channel();
        engine
            .process(Message::Command(SessionCommand::Upload {
                path: "/CFG.TXT".to_string(),
                data: vec![0xAB; 242 * 10],
                completion,
            }))
            .await;
        assert_eq!(
            transport.writes_to(FILE_IN_CHAR_UUID),
            vec![b"\x03/CFG.TXT\0".to_vec()]
        );

        let generation = engine.timers.generation(TimerKind::UploadSettle).unwrap();
        engine
            .process(Message::Timer(TimerEvent {
                kind: TimerKind::UploadSettle,
                generation,
            }))
            .await;
        let frames = transport.writes_to(FILE_IN_CHAR_UUID);
        assert_eq!(frames.len(), 1 + WINDOW);
        assert_eq!(frames[1][..2], [0x10, 0]);
        assert_eq!(frames[WINDOW][..2], [0x10, 7]);

        engine.handle_request(Request::CancelTransfer).await.unwrap();
        assert!(rx.try_recv().unwrap().unwrap_err().is_cancellation());
        assert_eq!(transport.writes_to(FILE_IN_CHAR_UUID).last().unwrap(), &vec![0xFF]);
        assert!(engine
            .router
            .owner(CharacteristicRole::FileOut, None)
            .is_none());
    }

    #[tokio::test]
    async fn test_new_transfer_replaces_running_one() {
        let id = device(22);
        let (mut engine, _handle, transport) = engine_with(MemoryBondStore::with_bonded([id]));
        connect_bonded(&mut engine, id).await;

        let (first, mut first_rx) = oneshot::channel();
        engine
            .process(Message::Command(SessionCommand::Upload {
                path: "/CFG.TXT".to_string(),
                data: vec![0xAB; 300],
                completion: first,
            }))
            .await;
        assert!(engine.timers.is_armed(TimerKind::UploadSettle));
        transport.clear();

        let (second, mut second_rx) = oneshot::channel();
        engine
            .process(Message::Command(SessionCommand::Download {
                path: "/X".to_string(),
                expected_size: 0,
                completion: second,
            }))
            .await;

        assert!(matches!(
            first_rx.try_recv().unwrap(),
            Err(ProtocolError::TransferInProgress)
        ));
        assert!(second_rx.try_recv().is_err());
        assert!(!engine.timers.is_armed(TimerKind::UploadSettle));
        assert_eq!(
            transport.writes_to(FILE_IN_CHAR_UUID),
            vec![packet::read_file("/X", 0, 0).unwrap()]
        );
        assert_eq!(engine.transfer.as_ref().map(|t| t.path()), Some("/X"));
        assert_eq!(
            engine.router.owner(CharacteristicRole::FileOut, None),
            Some(Consumer::Transfer)
        );

        // the replacement runs to completion
        event(&mut engine, notify(id, file_ref(FILE_OUT_CHAR_UUID), &[0x10, 0x00, 0x41])).await;
        event(&mut engine, notify(id, file_ref(FILE_OUT_CHAR_UUID), &[0x10, 0x01])).await;
        assert_eq!(second_rx.try_recv().unwrap().unwrap(), b"A".to_vec());
    }

    #[tokio::test]
    async fn test_file_channel_error_fails_pending_listing() {
        let id = device(23);
        let (mut engine, _handle, _transport) = engine_with(MemoryBondStore::with_bonded([id]));
        connect_bonded(&mut engine, id).await;

        engine
            .handle_request(Request::ListDirectory("/LOG".to_string()))
            .await
            .unwrap();
        event(&mut engine, failed_update(id, file_ref(FILE_OUT_CHAR_UUID))).await;

        assert!(!engine.directory.awaiting_response);
        assert!(engine.directory.error.is_some());
        assert_eq!(engine.state(), SessionState::Connected(id));
    }

    #[tokio::test]
    async fn test_gnss_control_error_fails_pending_mask() {
        let id = device(24);
        let (mut engine, handle, _transport) = engine_with(MemoryBondStore::with_bonded([id]));
        connect_bonded(&mut engine, id).await;

        engine.handle_request(Request::SetMask(0x07)).await.unwrap();
        let gnss = CharacteristicRef::new(GNSS_SERVICE_UUID, GNSS_CONTROL_CHAR_UUID);
        event(&mut engine, failed_update(id, gnss)).await;
        engine.publish();

        assert!(matches!(
            handle.snapshot().gnss_mask_status,
            GnssMaskStatus::Failure(_)
        ));
    }

    #[tokio::test]
    async fn test_start_control_error_fails_pending_request() {
        let id = device(25);
        let (mut engine, handle, _transport) = engine_with(MemoryBondStore::with_bonded([id]));
        connect_bonded(&mut engine, id).await;

        engine.handle_request(Request::StartCountdown).await.unwrap();
        engine.publish();
        assert!(handle.snapshot().start_pending);

        let start = CharacteristicRef::new(START_SERVICE_UUID, START_CONTROL_CHAR_UUID);
        event(&mut engine, failed_update(id, start)).await;
        engine.publish();

        let snapshot = handle.snapshot();
        assert!(!snapshot.start_pending);
        assert!(snapshot.start_error.is_some());
        assert_eq!(snapshot.start_trigger, StartTriggerState::Idle);
    }

    #[tokio::test]
    async fn test_connect_from_pairing_scan_drops_other_candidates() {
        let chosen = device(26);
        let other = device(27);
        let (mut engine, _handle, _transport) = engine_with(MemoryBondStore::new());
        engine
            .handle_request(Request::StartScan { pairing: true })
            .await
            .unwrap();
        event(&mut engine, pairing_advertisement(chosen)).await;
        event(&mut engine, pairing_advertisement(other)).await;
        assert_eq!(engine.registry.pairing_devices().len(), 2);

        engine.handle_request(Request::Connect(chosen)).await.unwrap();
        assert_eq!(engine.state(), SessionState::Connecting(chosen));
        assert!(engine.registry.contains(&chosen));
        assert!(!engine.registry.contains(&other));
        assert!(!engine.timers.is_armed(TimerKind::PairingTimeout(other)));
        assert!(!engine.timers.is_armed(TimerKind::PairingTimeout(chosen)));
    }

    #[tokio::test]
    async fn test_forget_keeps_registry_when_store_fails() {
        let id = device(28);
        let store = ReadOnlyStore(MemoryBondStore::with_bonded([id]));
        let (mut engine, _handle, _transport) =
            engine_with_config(EngineConfig::default(), Box::new(store));
        engine.load_known_devices();

        assert!(matches!(
            engine.handle_request(Request::Forget(id)).await,
            Err(ProtocolError::Storage(_))
        ));
        assert!(engine.registry.contains(&id));
    }

    #[tokio::test]
    async fn test_run_reconnects_to_last_device_at_startup() {
        let id = device(29);
        let mut store = MemoryBondStore::with_bonded([id]);
        store.set_last_connected_id(Some(id)).unwrap();
        let transport = Arc::new(MockTransport::new());
        transport.make_resolvable(id);
        let (_events_tx, events_rx) = mpsc::unbounded_channel();
        let (handle, task) = SessionEngine::spawn(
            EngineConfig::default(),
            transport.clone(),
            events_rx,
            Box::new(store),
        );

        let snapshot = tokio::time::timeout(
            Duration::from_secs(5),
            handle.wait_for(|s| s.state == SessionState::Connecting(id)),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(snapshot.state, SessionState::Connecting(id));
        assert!(transport.calls().contains(&TransportCall::Connect(id)));

        handle.shutdown().unwrap();
        task.await.unwrap();
    }

    const WINDOW: usize = crate::transfer::WINDOW_SIZE as usize;

    #[tokio::test]
    async fn test_forget_connected_device() {
        let id = device(20);
        let mut store = MemoryBondStore::with_bonded([id]);
        store.set_last_connected_id(Some(id)).unwrap();
        let (mut engine, _handle, _transport) = engine_with(store);
        connect_bonded(&mut engine, id).await;

        engine.handle_request(Request::Forget(id)).await.unwrap();
        assert_eq!(engine.state(), SessionState::Disconnecting(id));
        assert!(!engine.store.is_bonded(&id).unwrap());
        assert_eq!(engine.store.last_connected_id().unwrap(), None);
        assert!(!engine.registry.contains(&id));
    }
}
