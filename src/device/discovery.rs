//! Bus enumeration: who is listening and what they call themselves
use std::collections::BTreeMap;

use crate::bridge::GpibBridge;
use crate::serial::Result;
use super::DiscoveredDevice;

/// Recorded for a listener that stays silent on `*IDN?`
pub const NO_RESPONSE: &str = "No response";

pub fn bus_identifier(address: u8) -> String {
    format!("GPIB0::{}::INSTR", address)
}

/// Identify every listener on the bus, in the order the adapter reported them
pub async fn discover_devices(bridge: &mut GpibBridge) -> Result<Vec<DiscoveredDevice>> {
    bridge.prepare_controller().await?;

    let listeners = bridge.find_listeners().await?;
    if listeners.is_empty() {
        log::info!("No GPIB listeners found");
        return Ok(Vec::new());
    }
    log::info!("Found {} GPIB listener(s): {:?}", listeners.len(), listeners);

    let mut devices = Vec::with_capacity(listeners.len());
    for address in listeners {
        let identity = match bridge.identify(address).await? {
            Some(idn) => idn,
            None => {
                log::warn!("No identity response from GPIB address {}", address);
                NO_RESPONSE.to_string()
            }
        };
        log::info!("{}: {}", bus_identifier(address), identity);
        devices.push(DiscoveredDevice {
            bus_address: address,
            resource: bus_identifier(address),
            identity,
        });
    }

    Ok(devices)
}

/// Identity strings keyed by canonical bus identifier
pub async fn discover(bridge: &mut GpibBridge) -> Result<BTreeMap<String, String>> {
    let devices = discover_devices(bridge).await?;
    Ok(devices.into_iter().map(|d| (d.resource, d.identity)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::MockPort;
    use crate::test_support::bridge_over;

    #[tokio::test]
    async fn test_empty_bus() {
        let mock = MockPort::new();
        let mut bridge = bridge_over(&mock).await;
        assert!(discover(&mut bridge).await.unwrap().is_empty());
        assert_eq!(mock.commands(), vec!["++eoi 1", "++mode 1", "++fndl"]);
    }

    #[tokio::test]
    async fn test_identities_and_missing_marker() {
        let mock = MockPort::new()
            .reply("++fndl", "1 5")
            .reply_sequence("++read", &["HANDLER MODEL 5", ""]);
        let mut bridge = bridge_over(&mock).await;

        let found = discover(&mut bridge).await.unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found["GPIB0::1::INSTR"], "HANDLER MODEL 5");
        assert_eq!(found["GPIB0::5::INSTR"], NO_RESPONSE);
        assert_eq!(mock.count("*IDN?"), 2);
    }

    #[tokio::test]
    async fn test_device_list_keeps_bus_order() {
        let mock = MockPort::new().reply("++fndl", "12 3").reply("++read", "DMM");
        let mut bridge = bridge_over(&mock).await;

        let devices = discover_devices(&mut bridge).await.unwrap();
        let addresses: Vec<u8> = devices.iter().map(|d| d.bus_address).collect();
        assert_eq!(addresses, vec![12, 3]);
        assert_eq!(devices[0].resource, "GPIB0::12::INSTR");
    }
}
