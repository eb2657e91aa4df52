// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// mDNS discovery of raw-port receipt printers on the local network.
//
// LAN receipt printers advertise their raw print port as
// `_pdl-datastream._tcp.local.`.  Resolved services are converted into
// `DiscoveredDevice` values and forwarded for the length of the window.

use std::collections::HashSet;
use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use thermis_core::error::{Result, ThermisError};
use thermis_core::types::{DiscoveredDevice, normalize_address};

use crate::traits::DiscoveryNotifier;

/// mDNS service type for raw page-description-language printers.
const PDL_SERVICE: &str = "_pdl-datastream._tcp.local.";

/// Discovery notifier backed by an `mdns-sd` daemon per window.
#[derive(Debug, Default)]
pub struct MdnsNotifier;

impl MdnsNotifier {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl DiscoveryNotifier for MdnsNotifier {
    async fn discover(&self, window: Duration, found: mpsc::Sender<DiscoveredDevice>) -> Result<()> {
        let daemon = ServiceDaemon::new()
            .map_err(|e| ThermisError::Discovery(format!("failed to start mDNS daemon: {e}")))?;
        let receiver = daemon
            .browse(PDL_SERVICE)
            .map_err(|e| ThermisError::Discovery(format!("browse {PDL_SERVICE}: {e}")))?;

        info!(window_ms = window.as_millis(), "mDNS printer discovery started");
        let deadline = Instant::now() + window;
        let mut seen = HashSet::new();

        loop {
            let event = match tokio::time::timeout_at(deadline, receiver.recv_async()).await {
                Ok(Ok(event)) => event,
                // Window elapsed or the daemon went away.
                Ok(Err(_)) | Err(_) => break,
            };

            match event {
                ServiceEvent::ServiceResolved(info) => match service_info_to_device(&info) {
                    Some(device) => {
                        if !seen.insert(device.identity.clone()) {
                            continue;
                        }
                        info!(identity = %device.identity, address = %device.address, "printer found");
                        if found.send(device).await.is_err() {
                            debug!("discovery listener gone, ending window early");
                            break;
                        }
                    }
                    None => warn!(fullname = %info.get_fullname(), "resolved service has no address"),
                },
                other => debug!(event = ?other, "mDNS event"),
            }
        }

        if let Err(e) = daemon.stop_browse(PDL_SERVICE) {
            debug!(error = %e, "stop browse failed");
        }
        daemon
            .shutdown()
            .map_err(|e| ThermisError::Discovery(format!("daemon shutdown: {e}")))?;
        info!(found = seen.len(), "mDNS printer discovery finished");
        Ok(())
    }
}

/// Convert a resolved service into a device.
///
/// The identity prefers a `mac` TXT record, falling back to the host name.
fn service_info_to_device(info: &ServiceInfo) -> Option<DiscoveredDevice> {
    // Prefer IPv4 for wider printer compatibility.
    let ip: IpAddr = info
        .get_addresses()
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| info.get_addresses().iter().next())
        .copied()?;

    let address = match ip {
        IpAddr::V4(v4) => format!("{v4}:{}", info.get_port()),
        IpAddr::V6(v6) => format!("[{v6}]:{}", info.get_port()),
    };

    let identity = info
        .get_property_val_str("mac")
        .map(normalize_address)
        .unwrap_or_else(|| normalize_address(info.get_hostname().trim_end_matches('.')));

    let device_name = info
        .get_property_val_str("ty")
        .map(String::from)
        .or_else(|| instance_name(info.get_fullname()));

    Some(DiscoveredDevice {
        device_name,
        address,
        identity,
    })
}

/// Instance label of a full service name (`"TSP143 (kitchen)._pdl-datastream._tcp.local."`).
fn instance_name(fullname: &str) -> Option<String> {
    let (instance, _) = fullname.split_once("._")?;
    (!instance.is_empty()).then(|| instance.to_owned())
}
