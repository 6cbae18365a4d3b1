//! Per-device session orchestration
//!
//! [`BleDevice`] owns one [`GattSession`] and reacts to its state stream:
//! once services are discovered it subscribes to every declared notifying
//! characteristic, starts RSSI polling, negotiates the MTU, runs the
//! application's ready hook and marks the session ready. When the session
//! reaches a terminal state it closes the link, waits a short grace period
//! and runs the disconnect callback exactly once.
//!
//! Every operation has an async form and a blocking form for callers
//! outside the runtime. Background work and in-flight operations are
//! cancelled together when the device is released or torn down.

use std::future::Future;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch};
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::ble::gatt::{Capability, MTU_DEFAULT, RSSI_UNKNOWN};
use crate::ble::transport::{BleAddress, GattEventReceiver, GattTransport};
use crate::ble::BleError;
use crate::config::{GattConfig, MIN_RSSI_POLL_PERIOD_MS};
use crate::lock;
use crate::model::{ApplicationCharacteristic, ConnectionState, Target};
use crate::result::{MtuResult, ReadResult, RssiResult, SubscriptionResult, WriteResult};
use crate::session::{GattSession, Notification, OnceLatch, SessionError};

/// Called once with the device address after the session has ended.
pub type DisconnectCallback = Box<dyn FnOnce(&BleAddress) + Send>;

/// Application extension points.
#[async_trait]
pub trait DeviceHooks: Send + Sync {
    /// Runs after auto-subscription and MTU negotiation, just before the
    /// session is marked ready.
    async fn on_ready(&self, _session: &GattSession) {}
}

/// Hooks that do nothing.
pub struct NoHooks;

#[async_trait]
impl DeviceHooks for NoHooks {}

struct DeviceInner {
    characteristics: Vec<ApplicationCharacteristic>,
    config: GattConfig,
    hooks: Arc<dyn DeviceHooks>,
    on_disconnected: Mutex<Option<DisconnectCallback>>,
    session: OnceLock<GattSession>,
    connect_requested: OnceLatch,
    torn_down: OnceLatch,
    cancel: CancellationToken,
    runtime: Handle,
}

#[derive(Clone)]
pub struct BleDevice {
    inner: Arc<DeviceInner>,
}

impl BleDevice {
    /// Create a device for the given characteristics. Must be called from
    /// within a tokio runtime; its handle drives the blocking API.
    pub fn new(
        characteristics: Vec<ApplicationCharacteristic>,
        config: GattConfig,
        hooks: Arc<dyn DeviceHooks>,
    ) -> Result<Self, SessionError> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|e| SessionError::Runtime(e.to_string()))?;
        Ok(Self {
            inner: Arc::new(DeviceInner {
                characteristics,
                config,
                hooks,
                on_disconnected: Mutex::new(None),
                session: OnceLock::new(),
                connect_requested: OnceLatch::new(),
                torn_down: OnceLatch::new(),
                cancel: CancellationToken::new(),
                runtime,
            }),
        })
    }

    /// Register the callback run once the session has ended.
    pub fn on_disconnected<F>(&self, callback: F)
    where
        F: FnOnce(&BleAddress) + Send + 'static,
    {
        *lock(&self.inner.on_disconnected) = Some(Box::new(callback));
    }

    pub fn config(&self) -> &GattConfig {
        &self.inner.config
    }

    pub fn session(&self) -> Option<&GattSession> {
        self.inner.session.get()
    }

    fn active_session(&self) -> Result<GattSession, SessionError> {
        self.inner
            .session
            .get()
            .cloned()
            .ok_or(SessionError::NotConnected)
    }

    /// Current state; `Created` until a connection has been requested.
    pub fn state(&self) -> ConnectionState {
        self.session()
            .map(|s| s.state())
            .unwrap_or(ConnectionState::Created)
    }

    pub fn state_stream(&self) -> Result<watch::Receiver<ConnectionState>, SessionError> {
        Ok(self.active_session()?.state_stream())
    }

    pub fn notifications(&self) -> Result<broadcast::Receiver<Notification>, SessionError> {
        Ok(self.active_session()?.notifications())
    }

    pub fn rssi(&self) -> i16 {
        self.session().map(|s| s.rssi()).unwrap_or(RSSI_UNKNOWN)
    }

    pub fn mtu(&self) -> u16 {
        self.session().map(|s| s.mtu()).unwrap_or(MTU_DEFAULT)
    }

    /// Live check against the platform's list of connected devices.
    pub fn is_connected(&self) -> bool {
        self.session().map(|s| s.is_connected()).unwrap_or(false)
    }

    // ---- lifecycle ----

    /// Open a session over `transport`. A device connects at most once.
    pub async fn connect(
        &self,
        transport: Arc<dyn GattTransport>,
        events: GattEventReceiver,
    ) -> Result<(), SessionError> {
        if !self.inner.connect_requested.trip() {
            return Err(SessionError::DuplicateConnection(
                transport.address().to_string(),
            ));
        }
        let session = GattSession::new(
            transport,
            events,
            self.inner.characteristics.clone(),
            self.inner.config.clone(),
        )?;
        let states = session.state_stream();
        let _ = self.inner.session.set(session.clone());

        self.inner
            .runtime
            .spawn(self.clone().supervise(session.clone(), states));
        session.connect().await
    }

    pub fn connect_blocking(
        &self,
        transport: Arc<dyn GattTransport>,
        events: GattEventReceiver,
    ) -> Result<(), SessionError> {
        let device = self.clone();
        self.block_on(async move { device.connect(transport, events).await })
    }

    /// Wait until the session is ready. Fails if it ends first.
    pub async fn wait_until_ready(&self) -> Result<(), SessionError> {
        let mut states = self.active_session()?.state_stream();
        let reached = self
            .scoped(async move {
                states
                    .wait_for(|s| *s == ConnectionState::Ready || s.is_terminal())
                    .await
                    .map(|state| (*state).clone())
                    .map_err(|_| SessionError::Cancelled)
            })
            .await?;
        match reached {
            ConnectionState::Ready => Ok(()),
            _ => Err(SessionError::Transport(BleError::Disconnected)),
        }
    }

    pub async fn disconnect(&self) {
        if let Some(session) = self.session() {
            session.disconnect().await;
        }
    }

    pub fn disconnect_blocking(&self) {
        let device = self.clone();
        let _ = self.block_on(async move {
            device.disconnect().await;
            Ok(())
        });
    }

    /// Disconnect, close the link and cancel all session work.
    pub async fn release(&self) {
        if let Some(session) = self.session().cloned() {
            session.disconnect().await;
            session.close().await;
            self.teardown(&session).await;
        }
        self.inner.cancel.cancel();
    }

    pub fn release_blocking(&self) {
        let device = self.clone();
        let _ = self.block_on(async move {
            device.release().await;
            Ok(())
        });
    }

    async fn supervise(self, session: GattSession, mut states: watch::Receiver<ConnectionState>) {
        loop {
            let state = states.borrow_and_update().clone();
            if state.is_terminal() {
                self.teardown(&session).await;
                return;
            }
            if state == ConnectionState::ServicesDiscovered {
                let device = self.clone();
                let session = session.clone();
                self.spawn_scoped(async move { device.prepare(session).await });
            }
            tokio::select! {
                changed = states.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = self.inner.cancel.cancelled() => return,
            }
        }
    }

    /// Post-discovery setup, ending with the transition to `Ready`.
    async fn prepare(self, session: GattSession) {
        let config = &self.inner.config;

        if config.auto_subscribe {
            let notifying = self
                .inner
                .characteristics
                .iter()
                .filter(|c| c.requires(Capability::Notify));
            for characteristic in notifying {
                let subscribed = session
                    .subscribe(characteristic.id, config.subscription_timeout())
                    .await;
                match subscribed {
                    Ok(result) if result.is_success() => info!(
                        "{} subscribed to [{}] {}",
                        session.tag(),
                        characteristic.id,
                        characteristic.target()
                    ),
                    Ok(result) => error!(
                        "{} auto-subscribe [{}] failed: {}",
                        session.tag(),
                        characteristic.id,
                        result
                    ),
                    Err(e) => error!(
                        "{} auto-subscribe [{}] failed: {}",
                        session.tag(),
                        characteristic.id,
                        e
                    ),
                }
            }
        }

        if let Some(period) = config.rssi_poll_period() {
            if config
                .rssi_poll_period_ms
                .map_or(false, |ms| ms < MIN_RSSI_POLL_PERIOD_MS)
            {
                error!(
                    "{} RSSI poll period too short, using {:?}",
                    session.tag(),
                    period
                );
            }
            let polled = session.clone();
            self.spawn_scoped(poll_rssi(polled, period));
        }

        if let Some(desired) = config.desired_mtu {
            if let Err(e) = session.request_mtu(desired, config.mtu_timeout()).await {
                error!("{} MTU request failed: {}", session.tag(), e);
            }
        }

        self.inner.hooks.on_ready(&session).await;
        session.mark_ready();
    }

    /// Close, wait out the grace period, run the disconnect callback and
    /// cancel the session scope. Concurrent callers wait for the first.
    async fn teardown(&self, session: &GattSession) {
        if !self.inner.torn_down.trip() {
            self.inner.cancel.cancelled().await;
            return;
        }
        info!("{} session ended: {}", session.tag(), session.state());
        session.close().await;
        time::sleep(self.inner.config.disconnect_event_delay()).await;

        let callback = lock(&self.inner.on_disconnected).take();
        if let Some(callback) = callback {
            callback(session.address());
        }
        self.inner.cancel.cancel();
    }

    fn spawn_scoped<F>(&self, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let cancel = self.inner.cancel.clone();
        self.inner.runtime.spawn(async move {
            tokio::select! {
                _ = work => {}
                _ = cancel.cancelled() => {}
            }
        });
    }

    async fn scoped<T, F>(&self, work: F) -> Result<T, SessionError>
    where
        F: Future<Output = Result<T, SessionError>>,
    {
        tokio::select! {
            biased;
            _ = self.inner.cancel.cancelled() => Err(SessionError::Cancelled),
            result = work => result,
        }
    }

    /// Run `work` on the device's runtime and wait for it on this thread.
    /// Must not be called from inside that runtime.
    fn block_on<T, F>(&self, work: F) -> Result<T, SessionError>
    where
        F: Future<Output = Result<T, SessionError>> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = std::sync::mpsc::channel();
        self.inner.runtime.spawn(async move {
            let _ = tx.send(work.await);
        });
        rx.recv().map_err(|_| SessionError::Cancelled)?
    }

    // ---- operations ----

    pub async fn read(
        &self,
        target: impl Into<Target>,
        timeout: Option<Duration>,
    ) -> Result<ReadResult, SessionError> {
        let session = self.active_session()?;
        let timeout = timeout.unwrap_or_else(|| self.inner.config.read_timeout());
        self.scoped(session.read(target, timeout)).await
    }

    pub fn read_blocking(
        &self,
        target: impl Into<Target>,
        timeout: Option<Duration>,
    ) -> Result<ReadResult, SessionError> {
        let target = target.into();
        let device = self.clone();
        self.block_on(async move { device.read(target, timeout).await })
    }

    pub async fn write(
        &self,
        target: impl Into<Target>,
        value: &[u8],
        timeout: Option<Duration>,
    ) -> Result<WriteResult, SessionError> {
        let session = self.active_session()?;
        let timeout = timeout.unwrap_or_else(|| self.inner.config.write_timeout());
        self.scoped(session.write(target, value, timeout)).await
    }

    pub fn write_blocking(
        &self,
        target: impl Into<Target>,
        value: &[u8],
        timeout: Option<Duration>,
    ) -> Result<WriteResult, SessionError> {
        let target = target.into();
        let value = value.to_vec();
        let device = self.clone();
        self.block_on(async move { device.write(target, &value, timeout).await })
    }

    pub async fn subscribe(
        &self,
        target: impl Into<Target>,
        timeout: Option<Duration>,
    ) -> Result<SubscriptionResult, SessionError> {
        let session = self.active_session()?;
        let timeout = timeout.unwrap_or_else(|| self.inner.config.subscription_timeout());
        self.scoped(session.subscribe(target, timeout)).await
    }

    pub fn subscribe_blocking(
        &self,
        target: impl Into<Target>,
        timeout: Option<Duration>,
    ) -> Result<SubscriptionResult, SessionError> {
        let target = target.into();
        let device = self.clone();
        self.block_on(async move { device.subscribe(target, timeout).await })
    }

    pub async fn request_rssi(&self, timeout: Option<Duration>) -> Result<RssiResult, SessionError> {
        let session = self.active_session()?;
        let timeout = timeout.unwrap_or_else(|| self.inner.config.rssi_timeout());
        self.scoped(session.request_rssi(timeout)).await
    }

    pub fn request_rssi_blocking(
        &self,
        timeout: Option<Duration>,
    ) -> Result<RssiResult, SessionError> {
        let device = self.clone();
        self.block_on(async move { device.request_rssi(timeout).await })
    }

    pub async fn request_mtu(
        &self,
        desired: u16,
        timeout: Option<Duration>,
    ) -> Result<MtuResult, SessionError> {
        let session = self.active_session()?;
        let timeout = timeout.unwrap_or_else(|| self.inner.config.mtu_timeout());
        self.scoped(session.request_mtu(desired, timeout)).await
    }

    pub fn request_mtu_blocking(
        &self,
        desired: u16,
        timeout: Option<Duration>,
    ) -> Result<MtuResult, SessionError> {
        let device = self.clone();
        self.block_on(async move { device.request_mtu(desired, timeout).await })
    }
}

async fn poll_rssi(session: GattSession, period: Duration) {
    let timeout = session.config().rssi_timeout();
    loop {
        if session.state().is_terminal() {
            debug!("{} RSSI polling stopped", session.tag());
            return;
        }
        if let Err(e) = session.request_rssi(timeout).await {
            warn!("{} RSSI poll failed: {}", session.tag(), e);
        }
        time::sleep(period).await;
    }
}
