// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// LAN reachability gate.
//
// A LAN printer needs no permission, only a live link.  The gate resolves
// the configured `host[:port]` and proves reachability with a TCP connect
// bounded by the caller's deadline.  MAC-keyed printers are resolved by
// their vendor SDK and need a vendor gate instead.

use std::io::ErrorKind;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::debug;

use thermis_core::error::{DeviceError, DeviceStage};
use thermis_core::types::DeviceRef;

use crate::traits::{DeviceGate, DeviceGrant, Endpoint};

/// Default raw printing port (JetDirect).
pub const RAW_PORT: u16 = 9100;

pub struct LanGate {
    default_port: u16,
}

impl Default for LanGate {
    fn default() -> Self {
        Self::new(RAW_PORT)
    }
}

impl LanGate {
    pub fn new(default_port: u16) -> Self {
        Self { default_port }
    }

    /// `host` or `host:port`; bare IPv6 literals must be bracketed to carry a port.
    fn with_port(&self, address: &str) -> String {
        if address.parse::<SocketAddr>().is_ok() {
            return address.to_owned();
        }
        let has_port = address
            .rsplit_once(':')
            .is_some_and(|(host, port)| !host.contains(':') && port.parse::<u16>().is_ok());
        if has_port {
            address.to_owned()
        } else if address.contains(':') && !address.starts_with('[') {
            format!("[{address}]:{}", self.default_port)
        } else {
            format!("{address}:{}", self.default_port)
        }
    }
}

#[async_trait]
impl DeviceGate for LanGate {
    async fn acquire(&self, device: &DeviceRef, deadline: Instant) -> Result<DeviceGrant, DeviceError> {
        let started = Instant::now();
        let timed_out = || DeviceError::Timeout {
            stage: DeviceStage::Acquire,
            after: deadline.saturating_duration_since(started),
        };

        let address = device
            .address
            .as_deref()
            .ok_or_else(|| DeviceError::NotFound(format!("{device} has no address")))?;
        let target = self.with_port(address);

        let socket_addr = tokio::time::timeout_at(deadline, tokio::net::lookup_host(target.as_str()))
            .await
            .map_err(|_| timed_out())?
            .map_err(|e| DeviceError::NotFound(format!("cannot resolve {target}: {e}")))?
            .next()
            .ok_or_else(|| DeviceError::NotFound(format!("{target} resolved to no address")))?;

        let stream = tokio::time::timeout_at(deadline, TcpStream::connect(socket_addr))
            .await
            .map_err(|_| timed_out())?
            .map_err(|e| match e.kind() {
                ErrorKind::ConnectionRefused | ErrorKind::HostUnreachable | ErrorKind::NetworkUnreachable => {
                    DeviceError::Transport(format!("printer offline at {socket_addr}: {e}"))
                }
                ErrorKind::TimedOut => DeviceError::Transport(format!("connect timeout to {socket_addr}")),
                _ => DeviceError::Transport(format!("network error reaching {socket_addr}: {e}")),
            })?;
        drop(stream);

        debug!(device = %device, addr = %socket_addr, "LAN printer reachable");
        Ok(DeviceGrant {
            device: device.clone(),
            endpoint: Endpoint::Socket(socket_addr),
        })
    }
}
