// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Host service wiring: config loading and the collaborator set handed to the
// dispatcher.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use thermis_bridge::traits::DeviceGate;
use thermis_bridge::{LanGate, MdnsNotifier, SimulatedPrinter, SimulatedRenderer};
use thermis_core::config::DispatchConfig;
use thermis_core::error::Result;
use thermis_core::types::PrinterFamily;
use thermis_dispatch::Backends;

/// How the host should reach devices.
#[derive(Debug, Clone, Copy)]
pub struct HostOptions {
    /// Duration of every simulated driver operation.
    pub latency: Duration,
    /// Gate LAN jobs on a real TCP connect instead of the simulation.
    pub probe_lan: bool,
    /// Browse mDNS when discovery is requested.
    pub mdns: bool,
}

/// Load the dispatch config, or the defaults when no path is given.
pub fn load_config(path: Option<&Path>) -> Result<DispatchConfig> {
    match path {
        Some(path) => {
            let config = DispatchConfig::load(path)?;
            info!(path = %path.display(), "loaded dispatch config");
            Ok(config)
        }
        None => {
            let config = DispatchConfig::default();
            config.validate()?;
            Ok(config)
        }
    }
}

/// Build the collaborator set.  Both families print through the simulated
/// driver; the LAN gate and the discovery notifier can be real.
pub fn build_backends(options: HostOptions, config: &DispatchConfig) -> Backends {
    let printer = SimulatedPrinter::new(options.latency);

    let lan_gate: Arc<dyn DeviceGate> = if options.probe_lan {
        info!(port = config.lan_port, "LAN jobs gated on TCP reachability");
        Arc::new(LanGate::new(config.lan_port))
    } else {
        Arc::new(printer.clone())
    };

    let mut backends = Backends::new()
        .with_family(
            PrinterFamily::UsbGeneric,
            Arc::new(printer.clone()),
            Arc::new(printer.clone()),
        )
        .with_family(PrinterFamily::StarLan, lan_gate, Arc::new(printer))
        .with_renderer(Arc::new(SimulatedRenderer));

    if options.mdns {
        backends = backends.with_notifier(Arc::new(MdnsNotifier::new()));
    } else {
        warn!("no discovery notifier configured; start_discovery will be refused");
    }
    backends
}
