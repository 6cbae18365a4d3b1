//! In-process simulated GATT peripheral
//!
//! Implements [`GattTransport`] entirely in memory so the session engine
//! can be exercised without radio hardware. Completions are delivered on
//! the event channel as soon as a request is accepted, unless the
//! operation has been scripted to stall, fail or be rejected.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use uuid::Uuid;

use super::gatt::{
    CharacteristicProperties, GattStatus, WriteType, BATTERY_LEVEL_UUID, BATTERY_SERVICE_UUID,
    CLIENT_CHARACTERISTIC_CONFIG_UUID, MTU_MAX,
};
use super::transport::{
    phase, BleAddress, CharacteristicHandle, ConnectOptions, DiscoveredCharacteristic,
    DiscoveredService, GattEvent, GattEventReceiver, GattEventSender, GattTransport, Issue,
};
use super::BleError;
use crate::lock;

/// Transport calls the simulator can script and count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimOp {
    Connect,
    Disconnect,
    Close,
    DiscoverServices,
    Read,
    Write,
    SetNotification,
    WriteDescriptor,
    RequestMtu,
    ReadRssi,
}

/// Builds a service tree with sequential characteristic handles.
#[derive(Debug)]
pub struct GattTableBuilder {
    services: Vec<DiscoveredService>,
    next_handle: u16,
}

impl Default for GattTableBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl GattTableBuilder {
    pub fn new() -> Self {
        Self {
            services: Vec::new(),
            next_handle: 0x10,
        }
    }

    pub fn service(mut self, uuid: Uuid) -> Self {
        self.services.push(DiscoveredService {
            uuid,
            characteristics: Vec::new(),
        });
        self
    }

    /// Add a characteristic to the most recently added service. Notifying
    /// characteristics get a CCCD automatically.
    pub fn characteristic(mut self, uuid: Uuid, properties: u8) -> Self {
        let handle = CharacteristicHandle(self.next_handle);
        self.next_handle += 2;
        let properties = CharacteristicProperties(properties);
        let descriptors = if properties.contains(CharacteristicProperties::NOTIFY) {
            vec![CLIENT_CHARACTERISTIC_CONFIG_UUID]
        } else {
            Vec::new()
        };
        if let Some(service) = self.services.last_mut() {
            service.characteristics.push(DiscoveredCharacteristic {
                handle,
                uuid,
                properties,
                descriptors,
            });
        }
        self
    }

    pub fn build(self) -> Vec<DiscoveredService> {
        self.services
    }
}

#[derive(Debug)]
struct SimScript {
    /// Phase callbacks emitted in order when `connect` is called.
    connect_phases: Vec<(GattStatus, i32)>,
    discovery_status: GattStatus,
    /// Remaining rejections per operation before calls are accepted.
    rejections: HashMap<SimOp, usize>,
    /// Operations whose issuance fails outright.
    failing: HashSet<SimOp>,
    /// Operations that are accepted but never complete.
    stalled: HashSet<SimOp>,
    /// Completion status overrides per operation.
    statuses: HashMap<SimOp, GattStatus>,
    /// Report a foreign characteristic UUID in read/write completions.
    wrong_uuid: bool,
    rssi: i16,
    supports_mtu: bool,
    max_mtu: u16,
}

impl Default for SimScript {
    fn default() -> Self {
        Self {
            connect_phases: vec![(GattStatus::SUCCESS, phase::CONNECTED)],
            discovery_status: GattStatus::SUCCESS,
            rejections: HashMap::new(),
            failing: HashSet::new(),
            stalled: HashSet::new(),
            statuses: HashMap::new(),
            wrong_uuid: false,
            rssi: -50,
            supports_mtu: true,
            max_mtu: 247,
        }
    }
}

struct SimInner {
    address: BleAddress,
    name: String,
    events: GattEventSender,
    services: Vec<DiscoveredService>,
    values: Mutex<HashMap<CharacteristicHandle, Vec<u8>>>,
    script: Mutex<SimScript>,
    calls: Mutex<HashMap<SimOp, usize>>,
    history: Mutex<Vec<SimOp>>,
    written: Mutex<Vec<(CharacteristicHandle, Vec<u8>, WriteType)>>,
    connected: AtomicBool,
    closed: AtomicBool,
}

/// A simulated peripheral bound to one central-side link.
#[derive(Clone)]
pub struct SimPeripheral {
    inner: Arc<SimInner>,
}

impl SimPeripheral {
    /// Create a peripheral exposing `services`, returning the event stream
    /// the session engine consumes.
    pub fn new(name: &str, services: Vec<DiscoveredService>) -> (Self, GattEventReceiver) {
        let (events, rx) = mpsc::unbounded_channel();
        let sim = Self {
            inner: Arc::new(SimInner {
                address: BleAddress::Simulated(Uuid::new_v4()),
                name: name.to_string(),
                events,
                services,
                values: Mutex::new(HashMap::new()),
                script: Mutex::new(SimScript::default()),
                calls: Mutex::new(HashMap::new()),
                history: Mutex::new(Vec::new()),
                written: Mutex::new(Vec::new()),
                connected: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        };
        (sim, rx)
    }

    /// A peripheral with a readable, notifying battery level characteristic.
    pub fn battery(name: &str) -> (Self, GattEventReceiver) {
        let services = GattTableBuilder::new()
            .service(BATTERY_SERVICE_UUID)
            .characteristic(
                BATTERY_LEVEL_UUID,
                CharacteristicProperties::READ | CharacteristicProperties::NOTIFY,
            )
            .build();
        let (sim, rx) = Self::new(name, services);
        if let Some(handle) = sim.handle_of(BATTERY_LEVEL_UUID) {
            sim.set_value(handle, vec![87]);
        }
        (sim, rx)
    }

    pub fn handle_of(&self, characteristic: Uuid) -> Option<CharacteristicHandle> {
        self.inner
            .services
            .iter()
            .flat_map(|s| s.characteristics.iter())
            .find(|c| c.uuid == characteristic)
            .map(|c| c.handle)
    }

    pub fn set_value(&self, handle: CharacteristicHandle, value: Vec<u8>) {
        lock(&self.inner.values).insert(handle, value);
    }

    /// Replace the phase callbacks emitted on `connect`.
    pub fn script_connect(&self, phases: Vec<(GattStatus, i32)>) {
        lock(&self.inner.script).connect_phases = phases;
    }

    pub fn set_discovery_status(&self, status: GattStatus) {
        lock(&self.inner.script).discovery_status = status;
    }

    /// Reject the next `count` issuances of `op`.
    pub fn reject(&self, op: SimOp, count: usize) {
        lock(&self.inner.script).rejections.insert(op, count);
    }

    /// Make every issuance of `op` fail without reaching the stack.
    pub fn fail(&self, op: SimOp) {
        lock(&self.inner.script).failing.insert(op);
    }

    /// Accept `op` but never deliver its completion.
    pub fn stall(&self, op: SimOp) {
        lock(&self.inner.script).stalled.insert(op);
    }

    pub fn unstall(&self, op: SimOp) {
        lock(&self.inner.script).stalled.remove(&op);
    }

    /// Complete `op` with `status` instead of success.
    pub fn complete_with(&self, op: SimOp, status: GattStatus) {
        lock(&self.inner.script).statuses.insert(op, status);
    }

    pub fn report_wrong_uuid(&self, enabled: bool) {
        lock(&self.inner.script).wrong_uuid = enabled;
    }

    pub fn set_rssi(&self, rssi: i16) {
        lock(&self.inner.script).rssi = rssi;
    }

    pub fn set_mtu_support(&self, supported: bool) {
        lock(&self.inner.script).supports_mtu = supported;
    }

    pub fn set_max_mtu(&self, mtu: u16) {
        lock(&self.inner.script).max_mtu = mtu.min(MTU_MAX);
    }

    /// Number of times `op` reached the simulator.
    pub fn calls(&self, op: SimOp) -> usize {
        lock(&self.inner.calls).get(&op).copied().unwrap_or(0)
    }

    /// Every call that reached the simulator, in arrival order.
    pub fn history(&self) -> Vec<SimOp> {
        lock(&self.inner.history).clone()
    }

    /// Values written to characteristics, in order.
    pub fn written(&self) -> Vec<(CharacteristicHandle, Vec<u8>, WriteType)> {
        lock(&self.inner.written).clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Deliver an arbitrary callback, as the radio stack would.
    /// Dropped once the link has been closed.
    pub fn emit(&self, event: GattEvent) {
        if self.is_closed() {
            return;
        }
        let _ = self.inner.events.send(event);
    }

    /// Push a characteristic value change to the central.
    pub fn notify(&self, handle: CharacteristicHandle, value: Vec<u8>) {
        self.set_value(handle, value.clone());
        self.emit(GattEvent::CharacteristicChanged { handle, value });
    }

    /// Drop the link from the peripheral side.
    pub fn drop_link(&self, status: GattStatus) {
        self.inner.connected.store(false, Ordering::SeqCst);
        self.emit(GattEvent::ConnectionStateChanged {
            status,
            phase: phase::DISCONNECTED,
        });
    }

    fn characteristic(&self, handle: CharacteristicHandle) -> Option<&DiscoveredCharacteristic> {
        self.inner
            .services
            .iter()
            .flat_map(|s| s.characteristics.iter())
            .find(|c| c.handle == handle)
    }

    /// Count the call and decide how it is issued. Returns the completion
    /// status to report, or `None` when no completion should follow.
    fn record(&self, op: SimOp) {
        *lock(&self.inner.calls).entry(op).or_insert(0) += 1;
        lock(&self.inner.history).push(op);
    }

    fn admit(&self, op: SimOp) -> Result<(Issue, Option<GattStatus>), BleError> {
        self.record(op);
        if self.is_closed() {
            return Err(BleError::Disconnected);
        }
        let mut script = lock(&self.inner.script);
        if script.failing.contains(&op) {
            return Err(BleError::GattError(format!("{:?} unavailable", op)));
        }
        if let Some(remaining) = script.rejections.get_mut(&op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Ok((Issue::Rejected, None));
            }
        }
        if script.stalled.contains(&op) {
            return Ok((Issue::Accepted, None));
        }
        let status = script
            .statuses
            .get(&op)
            .copied()
            .unwrap_or(GattStatus::SUCCESS);
        Ok((Issue::Accepted, Some(status)))
    }

    fn reported_uuid(&self, actual: Uuid) -> Uuid {
        if lock(&self.inner.script).wrong_uuid {
            Uuid::new_v4()
        } else {
            actual
        }
    }
}

impl GattTransport for SimPeripheral {
    fn address(&self) -> &BleAddress {
        &self.inner.address
    }

    fn name(&self) -> Option<String> {
        Some(self.inner.name.clone())
    }

    fn connect(&self, _options: ConnectOptions) -> Result<(), BleError> {
        let (issue, _) = self.admit(SimOp::Connect)?;
        if issue == Issue::Rejected {
            return Err(BleError::ConnectionError("connect rejected".to_string()));
        }
        let phases = lock(&self.inner.script).connect_phases.clone();
        for (status, raw_phase) in phases {
            if status.is_success() && raw_phase == phase::CONNECTED {
                self.inner.connected.store(true, Ordering::SeqCst);
            }
            self.emit(GattEvent::ConnectionStateChanged {
                status,
                phase: raw_phase,
            });
        }
        Ok(())
    }

    fn disconnect(&self) -> Result<(), BleError> {
        let (_, status) = self.admit(SimOp::Disconnect)?;
        let was_connected = self.inner.connected.swap(false, Ordering::SeqCst);
        if was_connected && status.is_some() {
            self.emit(GattEvent::ConnectionStateChanged {
                status: GattStatus::SUCCESS,
                phase: phase::DISCONNECTED,
            });
        }
        Ok(())
    }

    fn close(&self) {
        self.record(SimOp::Close);
        self.inner.connected.store(false, Ordering::SeqCst);
        self.inner.closed.store(true, Ordering::SeqCst);
    }

    fn discover_services(&self) -> Result<Issue, BleError> {
        let (issue, status) = self.admit(SimOp::DiscoverServices)?;
        if status.is_some() {
            let status = lock(&self.inner.script).discovery_status;
            self.emit(GattEvent::ServicesDiscovered { status });
        }
        Ok(issue)
    }

    fn services(&self) -> Vec<DiscoveredService> {
        self.inner.services.clone()
    }

    fn read_characteristic(&self, handle: CharacteristicHandle) -> Result<Issue, BleError> {
        let (issue, status) = self.admit(SimOp::Read)?;
        let Some(characteristic) = self.characteristic(handle) else {
            return Err(BleError::GattError(format!("no characteristic at {}", handle)));
        };
        if let Some(status) = status {
            let value = if status.is_success() {
                lock(&self.inner.values).get(&handle).cloned().unwrap_or_default()
            } else {
                Vec::new()
            };
            self.emit(GattEvent::CharacteristicRead {
                handle,
                uuid: self.reported_uuid(characteristic.uuid),
                status,
                value,
            });
        }
        Ok(issue)
    }

    fn write_characteristic(
        &self,
        handle: CharacteristicHandle,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<Issue, BleError> {
        let (issue, status) = self.admit(SimOp::Write)?;
        let Some(characteristic) = self.characteristic(handle) else {
            return Err(BleError::GattError(format!("no characteristic at {}", handle)));
        };
        if issue == Issue::Accepted {
            lock(&self.inner.written).push((handle, value.to_vec(), write_type));
        }
        if let Some(status) = status {
            if status.is_success() {
                self.set_value(handle, value.to_vec());
            }
            self.emit(GattEvent::CharacteristicWrite {
                handle,
                uuid: self.reported_uuid(characteristic.uuid),
                status,
            });
        }
        Ok(issue)
    }

    fn set_characteristic_notification(
        &self,
        handle: CharacteristicHandle,
        _enable: bool,
    ) -> Result<Issue, BleError> {
        let (issue, _) = self.admit(SimOp::SetNotification)?;
        if self.characteristic(handle).is_none() {
            return Err(BleError::GattError(format!("no characteristic at {}", handle)));
        }
        Ok(issue)
    }

    fn write_descriptor(
        &self,
        handle: CharacteristicHandle,
        descriptor: Uuid,
        _value: &[u8],
    ) -> Result<Issue, BleError> {
        let (issue, status) = self.admit(SimOp::WriteDescriptor)?;
        let has_descriptor = self
            .characteristic(handle)
            .map(|c| c.descriptors.contains(&descriptor))
            .unwrap_or(false);
        if !has_descriptor {
            return Err(BleError::GattError(format!(
                "no descriptor {} on {}",
                descriptor, handle
            )));
        }
        if let Some(status) = status {
            self.emit(GattEvent::DescriptorWrite {
                handle,
                descriptor,
                status,
            });
        }
        Ok(issue)
    }

    fn request_mtu(&self, mtu: u16) -> Result<Issue, BleError> {
        let (issue, status) = self.admit(SimOp::RequestMtu)?;
        if let Some(status) = status {
            let negotiated = mtu.min(lock(&self.inner.script).max_mtu);
            self.emit(GattEvent::MtuChanged {
                mtu: negotiated,
                status,
            });
        }
        Ok(issue)
    }

    fn read_remote_rssi(&self) -> Result<Issue, BleError> {
        let (issue, status) = self.admit(SimOp::ReadRssi)?;
        if let Some(status) = status {
            let rssi = lock(&self.inner.script).rssi;
            self.emit(GattEvent::RemoteRssi { rssi, status });
        }
        Ok(issue)
    }

    fn supports_mtu_exchange(&self) -> bool {
        lock(&self.inner.script).supports_mtu
    }

    fn connected_devices(&self) -> Vec<BleAddress> {
        if self.inner.connected.load(Ordering::SeqCst) {
            vec![self.inner.address.clone()]
        } else {
            Vec::new()
        }
    }
}
