//! Scripted in-process transport.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use super::{
    CharacteristicInfo, ServiceInfo, Transport, TransportError, TransportEvent, TransportEvents,
};
use crate::advertisement::Advertisement;
use crate::decoder::{
    CARBON_MONOXIDE_CHARACTERISTIC, DEVICE_INFORMATION_SERVICE, ENVIRONMENTAL_SENSING_SERVICE,
    SERIAL_NUMBER_CHARACTERISTIC, TEMPERATURE_CHARACTERISTIC,
};
use crate::types::{HardwareAddress, SessionId};

/// Company identifier placed in front of mock manufacturer data.
const MOCK_COMPANY_ID: u16 = 0x0059;

/// A simulated peripheral.
#[derive(Debug, Clone)]
pub struct MockDevice {
    /// Session id the device advertises under.
    pub session_id: SessionId,
    /// Manufacturer data block, company id included.
    pub manufacturer_data: Option<Vec<u8>>,
    /// Advertised name.
    pub name: Option<String>,
    /// Advertised signal strength.
    pub rssi: Option<i16>,
    /// GATT table.
    pub services: Vec<(Uuid, Vec<CharacteristicInfo>)>,
    /// Values returned by reads.
    pub values: HashMap<Uuid, Vec<u8>>,
}

impl MockDevice {
    /// An XHale sensor with the standard GATT layout.
    ///
    /// Advertises `address` in its manufacturer data and reports a serial
    /// number derived from it.
    #[must_use]
    pub fn sensor(session_id: &str, address: HardwareAddress) -> Self {
        let mut manufacturer_data = MOCK_COMPANY_ID.to_le_bytes().to_vec();
        manufacturer_data.extend_from_slice(&address.octets());

        let serial = format!("XH-{}", address.to_string().replace(':', ""));
        let values = HashMap::from([(SERIAL_NUMBER_CHARACTERISTIC, serial.into_bytes())]);

        Self {
            session_id: SessionId::from(session_id),
            manufacturer_data: Some(manufacturer_data),
            name: Some("XHale".to_string()),
            rssi: Some(-55),
            services: vec![
                (
                    ENVIRONMENTAL_SENSING_SERVICE,
                    vec![
                        CharacteristicInfo {
                            uuid: TEMPERATURE_CHARACTERISTIC,
                            notify: true,
                            read: false,
                        },
                        CharacteristicInfo {
                            uuid: CARBON_MONOXIDE_CHARACTERISTIC,
                            notify: true,
                            read: false,
                        },
                    ],
                ),
                (
                    DEVICE_INFORMATION_SERVICE,
                    vec![CharacteristicInfo {
                        uuid: SERIAL_NUMBER_CHARACTERISTIC,
                        notify: false,
                        read: true,
                    }],
                ),
            ],
            values,
        }
    }

    /// The same sensor without an address in its advertisement.
    #[must_use]
    pub fn without_address(mut self) -> Self {
        self.manufacturer_data = None;
        self
    }

    fn advertisement(&self) -> Advertisement {
        Advertisement {
            session_id: self.session_id.clone(),
            manufacturer_data: self.manufacturer_data.clone(),
            local_name: self.name.clone(),
            rssi: self.rssi,
        }
    }

    fn characteristic(&self, uuid: Uuid) -> Option<CharacteristicInfo> {
        self.services
            .iter()
            .flat_map(|(_, chars)| chars)
            .find(|c| c.uuid == uuid)
            .copied()
    }
}

/// A transport request, recorded for assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    /// `start_scan`
    StartScan(Uuid),
    /// `stop_scan`
    StopScan,
    /// `connect`
    Connect(SessionId),
    /// `discover_services`
    DiscoverServices(SessionId),
    /// `discover_characteristics`
    DiscoverCharacteristics(SessionId, Uuid),
    /// `subscribe`
    Subscribe(SessionId, Uuid),
    /// `read`
    Read(SessionId, Uuid),
    /// `disconnect`
    Disconnect(SessionId),
}

#[derive(Default)]
struct MockState {
    devices: HashMap<SessionId, MockDevice>,
    connected: HashSet<SessionId>,
    scanning: bool,
    connect_failures: HashMap<SessionId, String>,
    connect_delay: Option<Duration>,
    calls: Vec<MockCall>,
}

/// In-process [`Transport`] driven by test code.
///
/// Starting a scan advertises every registered device. Tests inject the
/// rest of the stack's behaviour (notifications, link loss, adapter power)
/// through the helper methods.
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
    events: mpsc::UnboundedSender<TransportEvent>,
    synthetic_interval: Option<Duration>,
}

impl MockTransport {
    /// Create a powered mock adapter with no devices.
    #[must_use]
    pub fn new() -> (Arc<Self>, TransportEvents) {
        Self::build(None)
    }

    /// A mock adapter with one sensor that streams synthetic readings every
    /// `interval` while connected.
    #[must_use]
    pub fn demo(interval: Duration) -> (Arc<Self>, TransportEvents) {
        let (transport, events) = Self::build(Some(interval));
        transport.add_device(MockDevice::sensor(
            "mock-0",
            HardwareAddress::new([0x0A, 0x0B, 0x0C, 0x0D, 0x0E, 0x0F]),
        ));
        (transport, events)
    }

    fn build(synthetic_interval: Option<Duration>) -> (Arc<Self>, TransportEvents) {
        let (events, receiver) = mpsc::unbounded_channel();
        let _ = events.send(TransportEvent::AdapterPowered(true));
        let transport = Arc::new(Self {
            state: Arc::new(Mutex::new(MockState::default())),
            events,
            synthetic_interval,
        });
        (transport, receiver)
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: TransportEvent) {
        if self.events.send(event).is_err() {
            debug!("Mock transport event dropped, receiver gone");
        }
    }

    /// Register a device. It is advertised immediately if a scan is running.
    pub fn add_device(&self, device: MockDevice) {
        let advertisement = device.advertisement();
        let scanning = {
            let mut state = self.state();
            state.devices.insert(device.session_id.clone(), device);
            state.scanning
        };
        if scanning {
            self.emit(TransportEvent::Discovered(advertisement));
        }
    }

    /// Re-send a registered device's advertisement.
    pub fn advertise(&self, session_id: &SessionId) {
        let advertisement = self.state().devices.get(session_id).map(MockDevice::advertisement);
        if let Some(advertisement) = advertisement {
            self.emit(TransportEvent::Discovered(advertisement));
        }
    }

    /// Deliver a raw advertisement.
    pub fn advertise_raw(&self, advertisement: Advertisement) {
        self.emit(TransportEvent::Discovered(advertisement));
    }

    /// Deliver a characteristic notification.
    pub fn notify(&self, session_id: &SessionId, characteristic: Uuid, payload: &[u8]) {
        self.emit(TransportEvent::Notification {
            session_id: session_id.clone(),
            characteristic,
            payload: payload.to_vec(),
        });
    }

    /// Drop a link as if the peripheral went out of range.
    pub fn drop_link(&self, session_id: &SessionId, reason: &str) {
        self.state().connected.remove(session_id);
        self.emit(TransportEvent::Disconnected {
            session_id: session_id.clone(),
            reason: Some(reason.to_string()),
        });
    }

    /// Change the adapter power state.
    pub fn set_powered(&self, powered: bool) {
        if !powered {
            let mut state = self.state();
            state.scanning = false;
            state.connected.clear();
        }
        self.emit(TransportEvent::AdapterPowered(powered));
    }

    /// Make every connect to `session_id` fail with `reason`.
    pub fn fail_connect(&self, session_id: &SessionId, reason: &str) {
        self.state()
            .connect_failures
            .insert(session_id.clone(), reason.to_string());
    }

    /// Delay every connect by `delay`.
    pub fn set_connect_delay(&self, delay: Duration) {
        self.state().connect_delay = Some(delay);
    }

    /// Whether a scan is running.
    #[must_use]
    pub fn is_scanning(&self) -> bool {
        self.state().scanning
    }

    /// Whether the device's link is up.
    #[must_use]
    pub fn is_connected(&self, session_id: &SessionId) -> bool {
        self.state().connected.contains(session_id)
    }

    /// Every request made so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<MockCall> {
        self.state().calls.clone()
    }

    fn record(&self, call: MockCall) {
        self.state().calls.push(call);
    }

    fn connected_device(&self, session_id: &SessionId) -> Result<MockDevice, TransportError> {
        let state = self.state();
        if !state.connected.contains(session_id) {
            return Err(TransportError::UnknownDevice(session_id.clone()));
        }
        state
            .devices
            .get(session_id)
            .cloned()
            .ok_or_else(|| TransportError::UnknownDevice(session_id.clone()))
    }

    fn spawn_synthetic(&self, session_id: SessionId, characteristic: Uuid, interval: Duration) {
        let state = Arc::clone(&self.state);
        let events = self.events.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            let mut step: u16 = 0;
            loop {
                ticker.tick().await;
                let connected = state
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .connected
                    .contains(&session_id);
                if !connected {
                    break;
                }
                step = step.wrapping_add(1);
                let payload = if characteristic == TEMPERATURE_CHARACTERISTIC {
                    (3400 + step % 300).to_le_bytes().to_vec()
                } else {
                    (step % 40).to_be_bytes().to_vec()
                };
                let event = TransportEvent::Notification {
                    session_id: session_id.clone(),
                    characteristic,
                    payload,
                };
                if events.send(event).is_err() {
                    break;
                }
            }
        });
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn start_scan(&self, service: Uuid) -> Result<(), TransportError> {
        self.record(MockCall::StartScan(service));
        let advertisements: Vec<Advertisement> = {
            let mut state = self.state();
            state.scanning = true;
            state
                .devices
                .values()
                .filter(|d| !state.connected.contains(&d.session_id))
                .map(MockDevice::advertisement)
                .collect()
        };
        for advertisement in advertisements {
            self.emit(TransportEvent::Discovered(advertisement));
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        self.record(MockCall::StopScan);
        self.state().scanning = false;
        Ok(())
    }

    async fn connect(&self, session_id: &SessionId) -> Result<(), TransportError> {
        self.record(MockCall::Connect(session_id.clone()));
        let delay = self.state().connect_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        if let Some(reason) = state.connect_failures.get(session_id) {
            return Err(TransportError::ConnectFailed {
                session_id: session_id.clone(),
                reason: reason.clone(),
            });
        }
        if !state.devices.contains_key(session_id) {
            return Err(TransportError::UnknownDevice(session_id.clone()));
        }
        state.connected.insert(session_id.clone());
        Ok(())
    }

    async fn discover_services(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<ServiceInfo>, TransportError> {
        self.record(MockCall::DiscoverServices(session_id.clone()));
        let device = self.connected_device(session_id)?;
        Ok(device
            .services
            .iter()
            .map(|(uuid, _)| ServiceInfo { uuid: *uuid })
            .collect())
    }

    async fn discover_characteristics(
        &self,
        session_id: &SessionId,
        service: Uuid,
    ) -> Result<Vec<CharacteristicInfo>, TransportError> {
        self.record(MockCall::DiscoverCharacteristics(session_id.clone(), service));
        let device = self.connected_device(session_id)?;
        device
            .services
            .into_iter()
            .find(|(uuid, _)| *uuid == service)
            .map(|(_, chars)| chars)
            .ok_or_else(|| TransportError::DiscoveryFailed(format!("no service {service}")))
    }

    async fn subscribe(
        &self,
        session_id: &SessionId,
        characteristic: Uuid,
    ) -> Result<(), TransportError> {
        self.record(MockCall::Subscribe(session_id.clone(), characteristic));
        let device = self.connected_device(session_id)?;
        match device.characteristic(characteristic) {
            Some(info) if info.notify => {
                if let Some(interval) = self.synthetic_interval {
                    self.spawn_synthetic(session_id.clone(), characteristic, interval);
                }
                Ok(())
            }
            _ => Err(TransportError::SubscribeFailed {
                characteristic,
                reason: "notifications not supported".to_string(),
            }),
        }
    }

    async fn read(
        &self,
        session_id: &SessionId,
        characteristic: Uuid,
    ) -> Result<Vec<u8>, TransportError> {
        self.record(MockCall::Read(session_id.clone(), characteristic));
        let device = self.connected_device(session_id)?;
        device
            .values
            .get(&characteristic)
            .cloned()
            .ok_or_else(|| TransportError::ReadFailed {
                characteristic,
                reason: "no value".to_string(),
            })
    }

    async fn disconnect(&self, session_id: &SessionId) -> Result<(), TransportError> {
        self.record(MockCall::Disconnect(session_id.clone()));
        self.state().connected.remove(session_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scan_advertises_registered_devices() {
        let (transport, mut events) = MockTransport::new();
        assert_eq!(
            events.recv().await,
            Some(TransportEvent::AdapterPowered(true))
        );

        let address = HardwareAddress::new([1, 2, 3, 4, 5, 6]);
        transport.add_device(MockDevice::sensor("a", address));
        transport
            .start_scan(ENVIRONMENTAL_SENSING_SERVICE)
            .await
            .unwrap();

        match events.recv().await {
            Some(TransportEvent::Discovered(adv)) => {
                assert_eq!(adv.session_id, SessionId::from("a"));
                let data = adv.manufacturer_data.unwrap();
                assert_eq!(&data[2..8], &address.octets());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_gatt_requires_connection() {
        let (transport, _events) = MockTransport::new();
        let id = SessionId::from("a");
        transport.add_device(MockDevice::sensor("a", HardwareAddress::new([0; 6])));

        assert!(transport.discover_services(&id).await.is_err());
        transport.connect(&id).await.unwrap();
        let services = transport.discover_services(&id).await.unwrap();
        assert_eq!(services.len(), 2);

        let serial = transport
            .read(&id, SERIAL_NUMBER_CHARACTERISTIC)
            .await
            .unwrap();
        assert_eq!(serial, b"XH-000000000000");

        assert!(transport
            .subscribe(&id, SERIAL_NUMBER_CHARACTERISTIC)
            .await
            .is_err());

        transport.disconnect(&id).await.unwrap();
        assert!(!transport.is_connected(&id));
    }

    #[tokio::test]
    async fn test_connect_failure_injection() {
        let (transport, _events) = MockTransport::new();
        let id = SessionId::from("a");
        transport.add_device(MockDevice::sensor("a", HardwareAddress::new([0; 6])));
        transport.fail_connect(&id, "timeout");

        assert!(matches!(
            transport.connect(&id).await,
            Err(TransportError::ConnectFailed { .. })
        ));
        assert_eq!(transport.calls(), vec![MockCall::Connect(id)]);
    }
}
