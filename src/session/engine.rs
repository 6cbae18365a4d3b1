use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch};
use tokio::time;
use uuid::Uuid;

use super::error::SessionError;
use super::latch::{OnceLatch, PhaseLatches};
use super::slot::PendingSlots;
use super::watchdog::Watchdog;
use super::worker::TransportWorker;
use crate::ble::gatt::{
    clamp_mtu, GattStatus, CLIENT_CHARACTERISTIC_CONFIG_UUID, ENABLE_NOTIFICATION_VALUE,
    MTU_DEFAULT, RSSI_UNKNOWN,
};
use crate::ble::transport::{
    phase, BleAddress, CharacteristicHandle, GattEvent, GattEventReceiver, GattTransport, Issue,
};
use crate::ble::BleError;
use crate::config::GattConfig;
use crate::model::registry::ResolvedCharacteristic;
use crate::model::state::{LinkAction, WatchdogPhase};
use crate::model::{ApplicationCharacteristic, CharacteristicRegistry, ConnectionState, Target};
use crate::result::{
    GattResult, MtuResult, OperationPayload, ReadResult, RssiResult, Subscribed,
    SubscriptionResult, WriteResult, Written,
};

const SESSION_ENDED: &str = "session ended before the operation completed";

/// A value pushed by the peripheral on a subscribed characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub characteristic: ResolvedCharacteristic,
    pub value: Vec<u8>,
}

struct ReadCompletion {
    uuid: Uuid,
    status: GattStatus,
    value: Vec<u8>,
}

struct WriteCompletion {
    uuid: Uuid,
    status: GattStatus,
}

struct DescriptorCompletion {
    handle: CharacteristicHandle,
    descriptor: Uuid,
    status: GattStatus,
}

enum Issuance {
    Accepted,
    Busy,
    Failed(BleError),
}

struct SessionInner {
    tag: String,
    address: BleAddress,
    config: GattConfig,
    transport: Arc<dyn GattTransport>,
    worker: TransportWorker,
    characteristics: Vec<ApplicationCharacteristic>,
    registry: OnceLock<CharacteristicRegistry>,

    state: watch::Sender<ConnectionState>,
    rssi: watch::Sender<i16>,
    mtu: watch::Sender<u16>,
    notifications: broadcast::Sender<Notification>,

    reads: PendingSlots<CharacteristicHandle, ReadCompletion>,
    writes: PendingSlots<CharacteristicHandle, WriteCompletion>,
    descriptor: PendingSlots<(), DescriptorCompletion>,
    mtu_request: PendingSlots<(), (u16, GattStatus)>,
    rssi_request: PendingSlots<(), (i16, GattStatus)>,

    phases: PhaseLatches,
    connect_requested: OnceLatch,
    disconnect_requested: OnceLatch,
    closed: OnceLatch,
    watchdog: Watchdog,
    raise_errors: AtomicBool,
}

/// One GATT client session over a single transport link.
///
/// Cheap to clone; all clones drive the same link. Must be created inside a
/// tokio runtime, which runs the callback loop, the transport worker and
/// the watchdog.
#[derive(Clone)]
pub struct GattSession {
    inner: Arc<SessionInner>,
}

impl GattSession {
    /// Bind a session to `transport`, consuming its callback stream.
    ///
    /// `characteristics` lists what the application requires; leave it empty
    /// to register every discovered characteristic instead. Fails outside a
    /// tokio runtime.
    pub fn new(
        transport: Arc<dyn GattTransport>,
        events: GattEventReceiver,
        characteristics: Vec<ApplicationCharacteristic>,
        config: GattConfig,
    ) -> Result<Self, SessionError> {
        let runtime = Handle::try_current().map_err(|e| SessionError::Runtime(e.to_string()))?;
        let address = transport.address().clone();
        let tag = match transport.name() {
            Some(name) => format!("{} @ {}", name, address),
            None => address.to_string(),
        };
        let (state, _) = watch::channel(ConnectionState::Created);
        let (rssi, _) = watch::channel(RSSI_UNKNOWN);
        let (mtu, _) = watch::channel(MTU_DEFAULT);
        let (notifications, _) = broadcast::channel(config.notification_capacity.max(1));

        let inner = Arc::new(SessionInner {
            worker: TransportWorker::spawn(&runtime, tag.clone(), transport.clone()),
            raise_errors: AtomicBool::new(config.raise_errors),
            tag,
            address,
            config,
            transport,
            characteristics,
            registry: OnceLock::new(),
            state,
            rssi,
            mtu,
            notifications,
            reads: PendingSlots::new(),
            writes: PendingSlots::new(),
            descriptor: PendingSlots::new(),
            mtu_request: PendingSlots::new(),
            rssi_request: PendingSlots::new(),
            phases: PhaseLatches::default(),
            connect_requested: OnceLatch::new(),
            disconnect_requested: OnceLatch::new(),
            closed: OnceLatch::new(),
            watchdog: Watchdog::new(),
        });

        runtime.spawn(Self::run_callbacks(Arc::downgrade(&inner), events));
        Ok(Self { inner })
    }

    async fn run_callbacks(session: Weak<SessionInner>, mut events: GattEventReceiver) {
        while let Some(event) = events.recv().await {
            let Some(inner) = session.upgrade() else {
                break;
            };
            GattSession { inner }.handle_event(event).await;
        }
    }

    pub fn tag(&self) -> &str {
        &self.inner.tag
    }

    pub fn address(&self) -> &BleAddress {
        &self.inner.address
    }

    pub fn config(&self) -> &GattConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.borrow().clone()
    }

    /// Observe state changes. The receiver starts at the current state.
    pub fn state_stream(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Last RSSI reading, or [`RSSI_UNKNOWN`] while none is available.
    pub fn rssi(&self) -> i16 {
        *self.inner.rssi.borrow()
    }

    pub fn rssi_stream(&self) -> watch::Receiver<i16> {
        self.inner.rssi.subscribe()
    }

    pub fn mtu(&self) -> u16 {
        *self.inner.mtu.borrow()
    }

    pub fn mtu_stream(&self) -> watch::Receiver<u16> {
        self.inner.mtu.subscribe()
    }

    /// Subscribe to characteristic notifications. A subscriber that falls
    /// behind loses the oldest values.
    pub fn notifications(&self) -> broadcast::Receiver<Notification> {
        self.inner.notifications.subscribe()
    }

    /// The registry built from service discovery, once it has run.
    pub fn registry(&self) -> Option<&CharacteristicRegistry> {
        self.inner.registry.get()
    }

    pub fn set_raise_errors(&self, raise: bool) {
        self.inner.raise_errors.store(raise, Ordering::Relaxed);
    }

    /// Whether the platform currently lists this device as connected.
    pub fn is_connected(&self) -> bool {
        self.inner
            .transport
            .connected_devices()
            .contains(&self.inner.address)
    }

    // ---- link lifecycle ----

    /// Start connecting. Only the first call has any effect.
    pub async fn connect(&self) -> Result<(), SessionError> {
        if !self.inner.connect_requested.trip() {
            warn!("{} connect already requested", self.tag());
            return Ok(());
        }
        if !self.transition(ConnectionState::Connecting) {
            return Err(SessionError::Transport(BleError::Disconnected));
        }
        info!("{} connecting", self.tag());

        let options = self.inner.config.connect_options();
        let connected = self
            .inner
            .worker
            .call(move |t| t.connect(options))
            .await
            .and_then(|issued| issued);
        if let Err(e) = connected {
            error!("{} connect failed: {}", self.tag(), e);
            self.transition(ConnectionState::ConnectionStateError {
                phase: phase::DISCONNECTED,
                status: GattStatus::FAILURE,
            });
            self.close().await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Ask the platform to drop the link. Only the first call has any effect.
    pub async fn disconnect(&self) {
        if !self.inner.disconnect_requested.trip() {
            debug!("{} disconnect already requested", self.tag());
            return;
        }
        info!("{} disconnecting", self.tag());
        let result = self
            .inner
            .worker
            .call(|t| t.disconnect())
            .await
            .and_then(|issued| issued);
        if let Err(e) = result {
            warn!("{} disconnect failed: {}", self.tag(), e);
        }
    }

    /// Release the link. Only the first call has any effect. If the state
    /// machine has not reached a terminal state yet, it is moved to
    /// `Disconnected` since no further callbacks will arrive.
    pub async fn close(&self) {
        if !self.inner.closed.trip() {
            debug!("{} already closed", self.tag());
            return;
        }
        info!("{} closing link", self.tag());
        self.inner.watchdog.disarm();
        if let Err(e) = self.inner.worker.call(|t| t.close()).await {
            warn!("{} close failed: {}", self.tag(), e);
        }
        if !self.state().is_terminal() {
            self.transition(ConnectionState::Disconnected);
        }
    }

    /// Move from `ServicesDiscovered` to `Ready` once post-discovery setup
    /// has finished.
    pub fn mark_ready(&self) -> bool {
        self.transition(ConnectionState::Ready)
    }

    /// Apply `next` if the graph allows it and its one-shot phase has not
    /// been entered before. Arms or disarms the watchdog to match.
    fn transition(&self, next: ConnectionState) -> bool {
        let mut previous = None;
        let applied = self.inner.state.send_if_modified(|current| {
            if !current.can_transition_to(&next) {
                return false;
            }
            if let Some(one_shot) = next.one_shot_phase() {
                if !self.inner.phases.trip(one_shot) {
                    return false;
                }
            }
            previous = Some(std::mem::replace(current, next.clone()));
            true
        });
        let Some(previous) = previous.filter(|_| applied) else {
            debug!("{} refused transition {} -> {}", self.tag(), self.state(), next);
            return false;
        };
        info!("{} {} -> {}", self.tag(), previous, next);

        match next.watchdog() {
            Some(watched) => self.arm_watchdog(watched),
            None => self.inner.watchdog.disarm(),
        }
        if next.is_terminal() {
            self.inner.rssi.send_replace(RSSI_UNKNOWN);
            self.abandon_pending();
        }
        true
    }

    fn arm_watchdog(&self, watched: WatchdogPhase) {
        let session = Arc::downgrade(&self.inner);
        let limit = watched.limit(&self.inner.config);
        self.inner.watchdog.arm(watched, limit, async move {
            if let Some(inner) = session.upgrade() {
                GattSession { inner }.on_watchdog(watched, limit).await;
            }
        });
    }

    async fn on_watchdog(&self, watched: WatchdogPhase, limit: Duration) {
        if self.transition(watched.timeout_state()) {
            error!("{} {:?} phase timed out after {:?}", self.tag(), watched, limit);
            self.close().await;
        }
    }

    fn abandon_pending(&self) {
        self.inner.reads.abandon_all();
        self.inner.writes.abandon_all();
        self.inner.descriptor.abandon_all();
        self.inner.mtu_request.abandon_all();
        self.inner.rssi_request.abandon_all();
    }

    // ---- callbacks ----

    async fn handle_event(&self, event: GattEvent) {
        match event {
            GattEvent::ConnectionStateChanged { status, phase } => {
                self.on_connection_change(phase, status).await
            }
            GattEvent::ServicesDiscovered { status } => self.on_services_discovered(status).await,
            GattEvent::CharacteristicRead {
                handle,
                uuid,
                status,
                value,
            } => {
                let completion = ReadCompletion {
                    uuid,
                    status,
                    value,
                };
                if !self.inner.reads.resolve(&handle, completion) {
                    warn!("{} unsolicited read completion on {}", self.tag(), handle);
                }
            }
            GattEvent::CharacteristicWrite {
                handle,
                uuid,
                status,
            } => {
                if !self
                    .inner
                    .writes
                    .resolve(&handle, WriteCompletion { uuid, status })
                {
                    warn!("{} unsolicited write completion on {}", self.tag(), handle);
                }
            }
            GattEvent::DescriptorWrite {
                handle,
                descriptor,
                status,
            } => {
                let completion = DescriptorCompletion {
                    handle,
                    descriptor,
                    status,
                };
                if !self.inner.descriptor.resolve(&(), completion) {
                    warn!("{} unsolicited descriptor write on {}", self.tag(), handle);
                }
            }
            GattEvent::CharacteristicChanged { handle, value } => {
                self.on_characteristic_changed(handle, value)
            }
            GattEvent::RemoteRssi { rssi, status } => {
                if !self.inner.rssi_request.resolve(&(), (rssi, status)) {
                    debug!("{} unsolicited RSSI {}", self.tag(), rssi);
                }
            }
            GattEvent::MtuChanged { mtu, status } => {
                if !self.inner.mtu_request.resolve(&(), (mtu, status)) && status.is_success() {
                    info!("{} MTU changed to {} by peer", self.tag(), mtu);
                    self.inner.mtu.send_replace(mtu);
                }
            }
        }
    }

    async fn on_connection_change(&self, raw_phase: i32, status: GattStatus) {
        debug!(
            "{} link callback: phase {} status {}",
            self.tag(),
            raw_phase,
            status
        );
        let Some(transition) = self.state().on_connection_change(raw_phase, status) else {
            warn!("{} ignoring link phase {} in {}", self.tag(), raw_phase, self.state());
            return;
        };
        if !self.transition(transition.next) {
            return;
        }
        match transition.action {
            LinkAction::None => {}
            LinkAction::DiscoverServices => {
                let session = self.clone();
                tokio::spawn(async move { session.start_service_discovery().await });
            }
            LinkAction::Close => self.close().await,
        }
    }

    async fn start_service_discovery(&self) {
        time::sleep(self.inner.config.service_discovery_start_delay()).await;
        if !self.transition(ConnectionState::ServiceDiscoveryStarted) {
            return;
        }
        match self.issue("discover services", |t| t.discover_services()).await {
            Issuance::Accepted => debug!("{} service discovery requested", self.tag()),
            Issuance::Busy => {
                error!("{} service discovery rejected", self.tag());
                self.fail_discovery(GattStatus::BUSY).await;
            }
            Issuance::Failed(e) => {
                error!("{} service discovery failed to start: {}", self.tag(), e);
                self.fail_discovery(GattStatus::FAILURE).await;
            }
        }
    }

    async fn fail_discovery(&self, status: GattStatus) {
        if self.transition(ConnectionState::ServicesDiscoveryError { status }) {
            self.disconnect().await;
        }
    }

    async fn on_services_discovered(&self, status: GattStatus) {
        if self.state() != ConnectionState::ServiceDiscoveryStarted {
            warn!("{} services discovered in {}, ignoring", self.tag(), self.state());
            return;
        }
        if !status.is_success() {
            error!("{} service discovery failed: {}", self.tag(), status);
            self.fail_discovery(status).await;
            return;
        }

        let services = match self.inner.worker.call(|t| t.services()).await {
            Ok(services) => services,
            Err(e) => {
                error!("{} cannot read service tree: {}", self.tag(), e);
                self.fail_discovery(GattStatus::FAILURE).await;
                return;
            }
        };
        let registration =
            CharacteristicRegistry::register(self.tag(), &self.inner.characteristics, &services);
        let satisfied = registration.is_satisfied();
        if self.inner.registry.set(registration.registry).is_err() {
            warn!("{} characteristic registry already built", self.tag());
        }

        if satisfied {
            self.transition(ConnectionState::ServicesDiscovered);
        } else {
            error!(
                "{} required features missing: {}/{} matched",
                self.tag(),
                registration.matched_features,
                registration.required_features
            );
            self.fail_discovery(status).await;
        }
    }

    fn on_characteristic_changed(&self, handle: CharacteristicHandle, value: Vec<u8>) {
        let Some(characteristic) = self.registry().and_then(|r| r.by_handle(handle)) else {
            warn!("{} notification on unknown handle {}", self.tag(), handle);
            return;
        };
        debug!(
            "{} {} [{}] changed: 0x{}",
            self.tag(),
            characteristic.target,
            characteristic.id,
            hex::encode(&value)
        );
        let notification = Notification {
            characteristic: characteristic.clone(),
            value,
        };
        // No receivers is fine; nobody is listening yet.
        let _ = self.inner.notifications.send(notification);
    }

    // ---- operations ----

    fn resolve(&self, target: Target) -> Result<ResolvedCharacteristic, SessionError> {
        self.registry()
            .and_then(|r| r.get(&target))
            .cloned()
            .ok_or_else(|| SessionError::UnresolvedTarget(target.to_string()))
    }

    fn deliver<T: OperationPayload>(
        &self,
        result: GattResult<T>,
    ) -> Result<GattResult<T>, SessionError> {
        if self.inner.raise_errors.load(Ordering::Relaxed) {
            if let Some(e) = result.to_error() {
                return Err(SessionError::Operation(e));
            }
        }
        Ok(result)
    }

    fn report<T: OperationPayload>(&self, subject: &str, result: &GattResult<T>) {
        if result.is_success() {
            debug!("{} {}: {}", self.tag(), subject, result);
        } else {
            error!("{} {}: {}", self.tag(), subject, result);
        }
    }

    /// Issue a request, retrying rejections up to the configured count.
    async fn issue<F>(&self, what: &str, call: F) -> Issuance
    where
        F: Fn(&dyn GattTransport) -> Result<Issue, BleError> + Send + Sync + 'static,
    {
        let call = Arc::new(call);
        let retries = self.inner.config.busy_retry_count;
        let mut attempt = 0;
        loop {
            if self.state().is_terminal() {
                return Issuance::Failed(BleError::Disconnected);
            }
            let call = Arc::clone(&call);
            let issued = self
                .inner
                .worker
                .call(move |t| (*call)(t))
                .await
                .and_then(|issued| issued);
            match issued {
                Ok(Issue::Accepted) => return Issuance::Accepted,
                Ok(Issue::Rejected) if attempt < retries => {
                    attempt += 1;
                    warn!(
                        "{} {} rejected, retry {}/{}",
                        self.tag(),
                        what,
                        attempt,
                        retries
                    );
                    time::sleep(self.inner.config.busy_retry_delay()).await;
                }
                Ok(Issue::Rejected) => return Issuance::Busy,
                Err(e) => return Issuance::Failed(e),
            }
        }
    }

    /// Read a characteristic by id or target pair.
    pub async fn read<T: Into<Target>>(
        &self,
        target: T,
        timeout: Duration,
    ) -> Result<ReadResult, SessionError> {
        let characteristic = self.resolve(target.into())?;
        let result = self.read_characteristic(&characteristic, timeout).await;
        self.deliver(result)
    }

    async fn read_characteristic(
        &self,
        characteristic: &ResolvedCharacteristic,
        timeout: Duration,
    ) -> ReadResult {
        let subject = format!("read {} [{}]", characteristic.target, characteristic.id);
        let Some((_slot, completion)) = self.inner.reads.occupy(characteristic.handle) else {
            let result = GattResult::DeviceIsBusy;
            self.report(&subject, &result);
            return result;
        };
        let handle = characteristic.handle;
        let expected = characteristic.uuid();

        let result = time::timeout(timeout, async {
            match self.issue(&subject, move |t| t.read_characteristic(handle)).await {
                Issuance::Accepted => {}
                Issuance::Busy => return GattResult::DeviceIsBusy,
                Issuance::Failed(e) => return GattResult::IssuanceFailed(e),
            }
            match completion.await {
                Ok(done) if done.uuid != expected => GattResult::WrongCharacteristicCallback,
                Ok(done) if done.status.is_success() => {
                    if done.value.is_empty() {
                        warn!("{} {}: empty value", self.tag(), subject);
                    }
                    GattResult::Success(done.value)
                }
                Ok(done) => GattResult::GattError(done.status),
                Err(_) => GattResult::OperationException(SESSION_ENDED.to_string()),
            }
        })
        .await
        .unwrap_or(GattResult::OperationTimeout(timeout));

        self.report(&subject, &result);
        result
    }

    /// Write `value` to a characteristic, acknowledged or not depending on
    /// the write type resolved for it.
    pub async fn write<T: Into<Target>>(
        &self,
        target: T,
        value: &[u8],
        timeout: Duration,
    ) -> Result<WriteResult, SessionError> {
        let characteristic = self.resolve(target.into())?;
        let result = self
            .write_characteristic(&characteristic, value.to_vec(), timeout)
            .await;
        self.deliver(result)
    }

    async fn write_characteristic(
        &self,
        characteristic: &ResolvedCharacteristic,
        value: Vec<u8>,
        timeout: Duration,
    ) -> WriteResult {
        let subject = format!("write {} [{}]", characteristic.target, characteristic.id);
        let Some((_slot, completion)) = self.inner.writes.occupy(characteristic.handle) else {
            let result = GattResult::DeviceIsBusy;
            self.report(&subject, &result);
            return result;
        };
        debug!("{} {}: 0x{}", self.tag(), subject, hex::encode(&value));
        let handle = characteristic.handle;
        let write_type = characteristic.write_type;
        let expected = characteristic.uuid();

        let result = time::timeout(timeout, async {
            let issued = self
                .issue(&subject, move |t| {
                    t.write_characteristic(handle, &value, write_type)
                })
                .await;
            match issued {
                Issuance::Accepted => {}
                Issuance::Busy => return GattResult::DeviceIsBusy,
                Issuance::Failed(e) => return GattResult::IssuanceFailed(e),
            }
            match completion.await {
                Ok(done) if done.uuid != expected => GattResult::WrongCharacteristicCallback,
                Ok(done) if done.status.is_success() => GattResult::Success(Written),
                Ok(done) => GattResult::GattError(done.status),
                Err(_) => GattResult::OperationException(SESSION_ENDED.to_string()),
            }
        })
        .await
        .unwrap_or(GattResult::OperationTimeout(timeout));

        self.report(&subject, &result);
        result
    }

    /// Enable notifications on a characteristic: local enable, then the
    /// CCCD write, then its acknowledgement.
    pub async fn subscribe<T: Into<Target>>(
        &self,
        target: T,
        timeout: Duration,
    ) -> Result<SubscriptionResult, SessionError> {
        let characteristic = self.resolve(target.into())?;
        let result = self.enable_notifications(&characteristic, timeout).await;
        self.deliver(result)
    }

    async fn enable_notifications(
        &self,
        characteristic: &ResolvedCharacteristic,
        timeout: Duration,
    ) -> SubscriptionResult {
        let subject = format!("subscribe {} [{}]", characteristic.target, characteristic.id);
        let Some((_slot, completion)) = self.inner.descriptor.occupy(()) else {
            let result = GattResult::DeviceIsBusy;
            self.report(&subject, &result);
            return result;
        };
        let handle = characteristic.handle;

        let result = time::timeout(timeout, async {
            let enabled = self
                .issue(&subject, move |t| t.set_characteristic_notification(handle, true))
                .await;
            match enabled {
                Issuance::Accepted => {}
                Issuance::Busy => return GattResult::DeviceIsBusy,
                Issuance::Failed(e) => return GattResult::IssuanceFailed(e),
            }
            let written = self
                .issue(&subject, move |t| {
                    t.write_descriptor(
                        handle,
                        CLIENT_CHARACTERISTIC_CONFIG_UUID,
                        &ENABLE_NOTIFICATION_VALUE,
                    )
                })
                .await;
            match written {
                Issuance::Accepted => {}
                Issuance::Busy => return GattResult::DeviceIsBusy,
                Issuance::Failed(e) => return GattResult::IssuanceFailed(e),
            }
            match completion.await {
                Ok(done)
                    if done.handle != handle
                        || done.descriptor != CLIENT_CHARACTERISTIC_CONFIG_UUID =>
                {
                    GattResult::WrongCharacteristicCallback
                }
                Ok(done) if done.status.is_success() => GattResult::Success(Subscribed),
                Ok(done) => GattResult::GattError(done.status),
                Err(_) => GattResult::OperationException(SESSION_ENDED.to_string()),
            }
        })
        .await
        .unwrap_or(GattResult::OperationTimeout(timeout));

        self.report(&subject, &result);
        result
    }

    /// Read the remote signal strength and publish it on the RSSI cell.
    pub async fn request_rssi(&self, timeout: Duration) -> Result<RssiResult, SessionError> {
        let result = self.read_rssi(timeout).await;
        self.deliver(result)
    }

    async fn read_rssi(&self, timeout: Duration) -> RssiResult {
        let subject = "read RSSI";
        let Some((_slot, completion)) = self.inner.rssi_request.occupy(()) else {
            let result = GattResult::DeviceIsBusy;
            self.report(subject, &result);
            return result;
        };

        let result = time::timeout(timeout, async {
            match self.issue(subject, |t| t.read_remote_rssi()).await {
                Issuance::Accepted => {}
                Issuance::Busy => return GattResult::DeviceIsBusy,
                Issuance::Failed(e) => return GattResult::IssuanceFailed(e),
            }
            match completion.await {
                Ok((rssi, status)) if status.is_success() => {
                    self.inner.rssi.send_replace(rssi);
                    GattResult::Success(rssi)
                }
                Ok((_, status)) => GattResult::GattError(status),
                Err(_) => GattResult::OperationException(SESSION_ENDED.to_string()),
            }
        })
        .await
        .unwrap_or(GattResult::OperationTimeout(timeout));

        self.report(subject, &result);
        result
    }

    /// Negotiate the ATT MTU. `desired` is clamped to the legal range.
    /// Platforms without MTU exchange report the default MTU immediately.
    pub async fn request_mtu(
        &self,
        desired: u16,
        timeout: Duration,
    ) -> Result<MtuResult, SessionError> {
        let result = self.exchange_mtu(desired, timeout).await;
        self.deliver(result)
    }

    async fn exchange_mtu(&self, desired: u16, timeout: Duration) -> MtuResult {
        let subject = "request MTU";
        let mtu = clamp_mtu(desired);
        if mtu != desired {
            warn!("{} requested MTU {} clamped to {}", self.tag(), desired, mtu);
        }
        if !self.inner.transport.supports_mtu_exchange() {
            info!(
                "{} MTU exchange unsupported, using {}",
                self.tag(),
                MTU_DEFAULT
            );
            self.inner.mtu.send_replace(MTU_DEFAULT);
            return GattResult::Success(MTU_DEFAULT);
        }
        let Some((_slot, completion)) = self.inner.mtu_request.occupy(()) else {
            let result = GattResult::DeviceIsBusy;
            self.report(subject, &result);
            return result;
        };

        let result = time::timeout(timeout, async {
            match self.issue(subject, move |t| t.request_mtu(mtu)).await {
                Issuance::Accepted => {}
                Issuance::Busy => return GattResult::DeviceIsBusy,
                Issuance::Failed(e) => return GattResult::IssuanceFailed(e),
            }
            match completion.await {
                Ok((negotiated, status)) if status.is_success() => {
                    self.inner.mtu.send_replace(negotiated);
                    GattResult::Success(negotiated)
                }
                Ok((_, status)) => GattResult::GattError(status),
                Err(_) => GattResult::OperationException(SESSION_ENDED.to_string()),
            }
        })
        .await
        .unwrap_or(GattResult::OperationTimeout(timeout));

        self.report(subject, &result);
        result
    }
}
