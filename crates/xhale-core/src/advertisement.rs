//! Advertisement processing.
//!
//! Keeps the set of discovered sensors and resolves each transport session
//! id to the hardware address carried in the advertisement's manufacturer
//! data. The resulting mapping is the join key between the ephemeral
//! session ids the transport hands out and the stable addresses used for
//! usage accounting.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::types::{DiscoveredDevice, HardwareAddress, SessionId};

/// Minimum manufacturer data length that carries a hardware address.
///
/// The block starts with the 2-byte company identifier; bytes 2..8 are the
/// sensor's MAC.
pub const MIN_MANUFACTURER_DATA_LEN: usize = 8;

/// A raw advertisement as delivered by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Advertisement {
    /// Transport session id of the advertiser.
    pub session_id: SessionId,

    /// Manufacturer-specific data block as it appears on air: company id
    /// (little-endian) followed by the payload.
    pub manufacturer_data: Option<Vec<u8>>,

    /// Advertised local name.
    pub local_name: Option<String>,

    /// Received signal strength in dBm.
    pub rssi: Option<i16>,
}

/// What processing one advertisement changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProcessOutcome {
    /// The session id was not in the discovered set and has been added.
    pub added: bool,

    /// The advertisement carried a hardware address that was recorded.
    pub resolved: Option<HardwareAddress>,
}

/// Extract the hardware address from a manufacturer data block.
///
/// Returns `None` when the block is shorter than
/// [`MIN_MANUFACTURER_DATA_LEN`].
#[must_use]
pub fn extract_hardware_address(manufacturer_data: &[u8]) -> Option<HardwareAddress> {
    let octets: [u8; 6] = manufacturer_data
        .get(2..MIN_MANUFACTURER_DATA_LEN)?
        .try_into()
        .ok()?;
    Some(HardwareAddress::new(octets))
}

/// Discovered-device set plus the session id → hardware address mapping.
#[derive(Debug, Default)]
pub struct AdvertisementProcessor {
    discovered: Vec<DiscoveredDevice>,
    addresses: HashMap<SessionId, HardwareAddress>,
}

impl AdvertisementProcessor {
    /// Create an empty processor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one advertisement into the discovered set.
    ///
    /// A session id already present is never re-added; its RSSI, name and
    /// last-seen time are refreshed instead. A hardware address found in the
    /// manufacturer data is recorded even for known session ids, so an
    /// address missing from the first advertisement can arrive later.
    pub fn process(&mut self, advertisement: Advertisement, now: DateTime<Utc>) -> ProcessOutcome {
        let resolved = advertisement
            .manufacturer_data
            .as_deref()
            .and_then(extract_hardware_address);

        if let Some(address) = resolved {
            let previous = self
                .addresses
                .insert(advertisement.session_id.clone(), address);
            if previous != Some(address) {
                debug!(
                    session_id = %advertisement.session_id,
                    address = %address,
                    "Resolved hardware address"
                );
            }
        }

        let address = self.addresses.get(&advertisement.session_id).copied();

        if let Some(device) = self
            .discovered
            .iter_mut()
            .find(|d| d.session_id == advertisement.session_id)
        {
            device.hardware_address = address;
            device.last_seen_utc = now;
            if advertisement.rssi.is_some() {
                device.rssi_dbm = advertisement.rssi;
            }
            if advertisement.local_name.is_some() {
                device.name = advertisement.local_name;
            }
            return ProcessOutcome {
                added: false,
                resolved,
            };
        }

        debug!(session_id = %advertisement.session_id, "Discovered sensor");
        self.discovered.push(DiscoveredDevice {
            session_id: advertisement.session_id,
            hardware_address: address,
            name: advertisement.local_name,
            rssi_dbm: advertisement.rssi,
            last_seen_utc: now,
        });

        ProcessOutcome {
            added: true,
            resolved,
        }
    }

    /// Hardware address resolved for a session id, if any.
    #[must_use]
    pub fn hardware_address(&self, session_id: &SessionId) -> Option<HardwareAddress> {
        self.addresses.get(session_id).copied()
    }

    /// Whether the session id is in the discovered set.
    #[must_use]
    pub fn contains(&self, session_id: &SessionId) -> bool {
        self.discovered.iter().any(|d| &d.session_id == session_id)
    }

    /// Drop a device from the discovered set.
    ///
    /// The address mapping is kept so late callbacks for the session can
    /// still be attributed; a fresh advertisement overwrites it.
    pub fn remove(&mut self, session_id: &SessionId) -> bool {
        let before = self.discovered.len();
        self.discovered.retain(|d| &d.session_id != session_id);
        self.discovered.len() != before
    }

    /// Discovered devices in discovery order.
    #[must_use]
    pub fn devices(&self) -> &[DiscoveredDevice] {
        &self.discovered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adv(id: &str, manufacturer_data: Option<Vec<u8>>) -> Advertisement {
        Advertisement {
            session_id: SessionId::from(id),
            manufacturer_data,
            local_name: None,
            rssi: Some(-60),
        }
    }

    #[test]
    fn test_extract_address_from_bytes_two_to_seven() {
        let data = [0xAA, 0xBB, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06];
        let address = extract_hardware_address(&data).unwrap();
        assert_eq!(address.to_string(), "01:02:03:04:05:06");
    }

    #[test]
    fn test_extract_address_ignores_trailing_bytes() {
        let data = [0x59, 0x00, 0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x01, 0xFF, 0xFF];
        let address = extract_hardware_address(&data).unwrap();
        assert_eq!(address.to_string(), "DE:AD:BE:EF:00:01");
    }

    #[test]
    fn test_extract_address_requires_eight_bytes() {
        for len in 0..MIN_MANUFACTURER_DATA_LEN {
            let data = vec![0x11; len];
            assert!(extract_hardware_address(&data).is_none(), "len {len}");
        }
    }

    #[test]
    fn test_duplicate_session_id_is_not_re_added() {
        let mut processor = AdvertisementProcessor::new();
        let now = Utc::now();

        assert!(processor.process(adv("a", None), now).added);
        assert!(!processor.process(adv("a", None), now).added);
        assert!(processor.process(adv("b", None), now).added);

        assert_eq!(processor.devices().len(), 2);
    }

    #[test]
    fn test_repeat_advertisement_refreshes_rssi_and_name() {
        let mut processor = AdvertisementProcessor::new();
        let now = Utc::now();
        processor.process(adv("a", None), now);

        let mut again = adv("a", None);
        again.rssi = Some(-40);
        again.local_name = Some("XHale-01".into());
        processor.process(again, now);

        let device = &processor.devices()[0];
        assert_eq!(device.rssi_dbm, Some(-40));
        assert_eq!(device.name.as_deref(), Some("XHale-01"));
    }

    #[test]
    fn test_address_resolved_on_later_advertisement() {
        let mut processor = AdvertisementProcessor::new();
        let now = Utc::now();
        let id = SessionId::from("a");

        let first = processor.process(adv("a", Some(vec![0xAA, 0xBB, 0x01])), now);
        assert!(first.resolved.is_none());
        assert!(processor.hardware_address(&id).is_none());

        let second = processor.process(
            adv("a", Some(vec![0xAA, 0xBB, 1, 2, 3, 4, 5, 6])),
            now,
        );
        assert!(!second.added);
        let expected = HardwareAddress::new([1, 2, 3, 4, 5, 6]);
        assert_eq!(second.resolved, Some(expected));
        assert_eq!(processor.hardware_address(&id), Some(expected));
        assert_eq!(processor.devices()[0].hardware_address, Some(expected));
    }

    #[test]
    fn test_short_advertisement_keeps_known_address() {
        let mut processor = AdvertisementProcessor::new();
        let now = Utc::now();
        let id = SessionId::from("a");

        processor.process(adv("a", Some(vec![0, 0, 1, 2, 3, 4, 5, 6])), now);
        processor.process(adv("a", None), now);

        assert_eq!(
            processor.hardware_address(&id),
            Some(HardwareAddress::new([1, 2, 3, 4, 5, 6]))
        );
    }

    #[test]
    fn test_remove_keeps_address_mapping() {
        let mut processor = AdvertisementProcessor::new();
        let id = SessionId::from("a");
        processor.process(adv("a", Some(vec![0, 0, 1, 2, 3, 4, 5, 6])), Utc::now());

        assert!(processor.remove(&id));
        assert!(!processor.contains(&id));
        assert!(!processor.remove(&id));
        assert!(processor.hardware_address(&id).is_some());
    }
}
