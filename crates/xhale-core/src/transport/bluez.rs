//! BlueZ backend.
//!
//! Talks to `bluetoothd` over D-Bus through `bluer`. Session ids are the
//! BlueZ device addresses. Manufacturer data arrives from BlueZ keyed by
//! company id, so the on-air block (company id little-endian, then payload)
//! is rebuilt before it reaches the advertisement processor.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bluer::gatt::remote::Characteristic as GattCharacteristic;
use bluer::{
    Adapter, AdapterEvent, AdapterProperty, Address, Device, DeviceEvent, DeviceProperty,
    DiscoveryFilter, DiscoveryTransport, Session,
};
use futures::{pin_mut, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    CharacteristicInfo, ServiceInfo, Transport, TransportError, TransportEvent, TransportEvents,
};
use crate::advertisement::Advertisement;
use crate::types::SessionId;

/// How long to wait for BlueZ to resolve a freshly connected device's
/// services.
const SERVICES_RESOLVE_TIMEOUT: Duration = Duration::from_secs(5);
const SERVICES_RESOLVE_POLL: Duration = Duration::from_millis(250);

fn stack_error(e: &bluer::Error) -> String {
    e.to_string()
}

/// [`Transport`] backed by the system BlueZ daemon.
pub struct BluerTransport {
    _session: Session,
    adapter: Adapter,
    events: mpsc::UnboundedSender<TransportEvent>,
    scan: Mutex<Option<JoinHandle<()>>>,
    links: Mutex<HashMap<SessionId, Vec<JoinHandle<()>>>>,
    _adapter_watch: JoinHandle<()>,
}

impl BluerTransport {
    /// Open the named adapter (or the default one) and start watching its
    /// power state.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::AdapterUnavailable`] if BlueZ is not
    /// reachable or the adapter does not exist.
    pub async fn new(adapter_name: Option<&str>) -> Result<(Arc<Self>, TransportEvents), TransportError> {
        let unavailable = |e: bluer::Error| TransportError::AdapterUnavailable(stack_error(&e));

        let session = Session::new().await.map_err(unavailable)?;
        let adapter = match adapter_name {
            Some(name) => session.adapter(name).map_err(unavailable)?,
            None => session.default_adapter().await.map_err(unavailable)?,
        };
        let powered = adapter.is_powered().await.map_err(unavailable)?;
        info!(adapter = %adapter.name(), powered, "Opened Bluetooth adapter");

        let (events, receiver) = mpsc::unbounded_channel();
        let _ = events.send(TransportEvent::AdapterPowered(powered));

        let adapter_events = adapter.events().await.map_err(unavailable)?;
        let power_tx = events.clone();
        let adapter_watch = tokio::spawn(async move {
            pin_mut!(adapter_events);
            while let Some(event) = adapter_events.next().await {
                if let AdapterEvent::PropertyChanged(AdapterProperty::Powered(powered)) = event {
                    info!(powered, "Adapter power changed");
                    if power_tx.send(TransportEvent::AdapterPowered(powered)).is_err() {
                        break;
                    }
                }
            }
        });

        let transport = Arc::new(Self {
            _session: session,
            adapter,
            events,
            scan: Mutex::new(None),
            links: Mutex::new(HashMap::new()),
            _adapter_watch: adapter_watch,
        });
        Ok((transport, receiver))
    }

    fn device(&self, session_id: &SessionId) -> Result<Device, TransportError> {
        let address: Address = session_id
            .as_str()
            .parse()
            .map_err(|_| TransportError::UnknownDevice(session_id.clone()))?;
        self.adapter
            .device(address)
            .map_err(|_| TransportError::UnknownDevice(session_id.clone()))
    }

    async fn track(&self, session_id: &SessionId, task: JoinHandle<()>) {
        self.links
            .lock()
            .await
            .entry(session_id.clone())
            .or_default()
            .push(task);
    }

    async fn find_characteristic(
        &self,
        session_id: &SessionId,
        uuid: Uuid,
    ) -> Result<GattCharacteristic, TransportError> {
        let failed = |e: bluer::Error| TransportError::DiscoveryFailed(stack_error(&e));
        let device = self.device(session_id)?;
        for service in device.services().await.map_err(failed)? {
            for characteristic in service.characteristics().await.map_err(failed)? {
                if characteristic.uuid().await.map_err(failed)? == uuid {
                    return Ok(characteristic);
                }
            }
        }
        Err(TransportError::DiscoveryFailed(format!(
            "characteristic {uuid} not found"
        )))
    }
}

async fn advertisement(adapter: &Adapter, address: Address) -> Result<Advertisement, bluer::Error> {
    let device = adapter.device(address)?;
    let manufacturer_data = device
        .manufacturer_data()
        .await?
        .and_then(|blocks| blocks.into_iter().next())
        .map(|(company, payload)| {
            let mut block = company.to_le_bytes().to_vec();
            block.extend(payload);
            block
        });
    Ok(Advertisement {
        session_id: SessionId::new(address.to_string()),
        manufacturer_data,
        local_name: device.name().await?,
        rssi: device.rssi().await?,
    })
}

#[async_trait]
impl Transport for BluerTransport {
    async fn start_scan(&self, service: Uuid) -> Result<(), TransportError> {
        let failed = |e: bluer::Error| TransportError::ScanFailed(stack_error(&e));
        if !self.adapter.is_powered().await.map_err(failed)? {
            return Err(TransportError::PoweredOff);
        }

        self.adapter
            .set_discovery_filter(DiscoveryFilter {
                uuids: HashSet::from([service]),
                transport: DiscoveryTransport::Le,
                ..DiscoveryFilter::default()
            })
            .await
            .map_err(failed)?;
        let discovery = self.adapter.discover_devices().await.map_err(failed)?;

        let adapter = self.adapter.clone();
        let events = self.events.clone();
        let task = tokio::spawn(async move {
            pin_mut!(discovery);
            while let Some(event) = discovery.next().await {
                let AdapterEvent::DeviceAdded(address) = event else {
                    continue;
                };
                match advertisement(&adapter, address).await {
                    Ok(adv) => {
                        if events.send(TransportEvent::Discovered(adv)).is_err() {
                            break;
                        }
                    }
                    Err(e) => debug!(address = %address, error = %e, "Skipping device"),
                }
            }
        });

        if let Some(previous) = self.scan.lock().await.replace(task) {
            previous.abort();
        }
        debug!(service = %service, "Discovery started");
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        // Dropping the discovery stream ends the BlueZ discovery session.
        if let Some(task) = self.scan.lock().await.take() {
            task.abort();
            debug!("Discovery stopped");
        }
        Ok(())
    }

    async fn connect(&self, session_id: &SessionId) -> Result<(), TransportError> {
        let device = self.device(session_id)?;
        let failed = |e: bluer::Error| TransportError::ConnectFailed {
            session_id: session_id.clone(),
            reason: stack_error(&e),
        };

        let device_events = device.events().await.map_err(failed)?;
        device.connect().await.map_err(failed)?;

        let events = self.events.clone();
        let id = session_id.clone();
        let watch = tokio::spawn(async move {
            pin_mut!(device_events);
            while let Some(event) = device_events.next().await {
                if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) = event {
                    let _ = events.send(TransportEvent::Disconnected {
                        session_id: id,
                        reason: Some("link lost".to_string()),
                    });
                    break;
                }
            }
        });
        self.track(session_id, watch).await;
        Ok(())
    }

    async fn discover_services(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<ServiceInfo>, TransportError> {
        let failed = |e: bluer::Error| TransportError::DiscoveryFailed(stack_error(&e));
        let device = self.device(session_id)?;

        let deadline = tokio::time::Instant::now() + SERVICES_RESOLVE_TIMEOUT;
        while !device.is_services_resolved().await.map_err(failed)? {
            if tokio::time::Instant::now() >= deadline {
                return Err(TransportError::DiscoveryFailed(
                    "services not resolved in time".to_string(),
                ));
            }
            tokio::time::sleep(SERVICES_RESOLVE_POLL).await;
        }

        let mut services = Vec::new();
        for service in device.services().await.map_err(failed)? {
            services.push(ServiceInfo {
                uuid: service.uuid().await.map_err(failed)?,
            });
        }
        Ok(services)
    }

    async fn discover_characteristics(
        &self,
        session_id: &SessionId,
        service: Uuid,
    ) -> Result<Vec<CharacteristicInfo>, TransportError> {
        let failed = |e: bluer::Error| TransportError::DiscoveryFailed(stack_error(&e));
        let device = self.device(session_id)?;

        for remote in device.services().await.map_err(failed)? {
            if remote.uuid().await.map_err(failed)? != service {
                continue;
            }
            let mut found = Vec::new();
            for characteristic in remote.characteristics().await.map_err(failed)? {
                let flags = characteristic.flags().await.map_err(failed)?;
                found.push(CharacteristicInfo {
                    uuid: characteristic.uuid().await.map_err(failed)?,
                    notify: flags.notify || flags.indicate,
                    read: flags.read,
                });
            }
            return Ok(found);
        }
        Err(TransportError::DiscoveryFailed(format!(
            "service {service} not found"
        )))
    }

    async fn subscribe(
        &self,
        session_id: &SessionId,
        characteristic: Uuid,
    ) -> Result<(), TransportError> {
        let remote = self.find_characteristic(session_id, characteristic).await?;
        let values = remote
            .notify()
            .await
            .map_err(|e| TransportError::SubscribeFailed {
                characteristic,
                reason: stack_error(&e),
            })?;

        let events = self.events.clone();
        let id = session_id.clone();
        let task = tokio::spawn(async move {
            pin_mut!(values);
            while let Some(payload) = values.next().await {
                let event = TransportEvent::Notification {
                    session_id: id.clone(),
                    characteristic,
                    payload,
                };
                if events.send(event).is_err() {
                    break;
                }
            }
            debug!(session_id = %id, characteristic = %characteristic, "Notification stream ended");
        });
        self.track(session_id, task).await;
        Ok(())
    }

    async fn read(
        &self,
        session_id: &SessionId,
        characteristic: Uuid,
    ) -> Result<Vec<u8>, TransportError> {
        let remote = self.find_characteristic(session_id, characteristic).await?;
        remote.read().await.map_err(|e| TransportError::ReadFailed {
            characteristic,
            reason: stack_error(&e),
        })
    }

    async fn disconnect(&self, session_id: &SessionId) -> Result<(), TransportError> {
        if let Some(tasks) = self.links.lock().await.remove(session_id) {
            for task in tasks {
                task.abort();
            }
        }
        let device = self.device(session_id)?;
        if let Err(e) = device.disconnect().await {
            warn!(session_id = %session_id, error = %e, "BlueZ disconnect failed");
            return Err(TransportError::DisconnectFailed(stack_error(&e)));
        }
        Ok(())
    }
}
