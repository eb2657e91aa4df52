// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Capability traits for the collaborators the dispatcher drives.
//
// Each device family supplies one gate (access/permission) and one driver
// (open, then print/drawer/cut over the connection, then close).  The
// dispatcher picks the pair by family tag when a job is created and never
// inspects concrete types.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;

use thermis_core::error::{DeviceError, RenderError, Result};
use thermis_core::types::{DeviceRef, DiscoveredDevice, ReceiptImage};

/// Proof that a device is usable right now, produced by a [`DeviceGate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceGrant {
    pub device: DeviceRef,
    pub endpoint: Endpoint,
}

/// Where a granted device can be reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Usb(UsbDeviceInfo),
    Socket(SocketAddr),
    /// In-process device (simulation, tests).
    Virtual(String),
}

/// USB printer information as reported by the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbDeviceInfo {
    pub device_name: String,
    pub vendor_id: u16,
    pub product_id: u16,
}

/// Formatting options for a print.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrintOptions {
    /// Pulse the cash drawer after the image.
    pub open_drawer: bool,
    /// Partial cut after the image.
    pub cut_after: bool,
}

impl Default for PrintOptions {
    fn default() -> Self {
        Self {
            open_drawer: false,
            cut_after: true,
        }
    }
}

/// Resolves whether a usable handle for a device is available.
///
/// Implementations must return by `deadline`; the dispatcher additionally
/// bounds the call, so a gate that overruns is reported as a timeout.
#[async_trait]
pub trait DeviceGate: Send + Sync {
    async fn acquire(
        &self,
        device: &DeviceRef,
        deadline: Instant,
    ) -> std::result::Result<DeviceGrant, DeviceError>;
}

/// Opens connections to granted devices of one family.
#[async_trait]
pub trait DeviceDriver: Send + Sync {
    async fn open(
        &self,
        grant: &DeviceGrant,
    ) -> std::result::Result<Box<dyn DeviceConnection>, DeviceError>;
}

/// An open device handle.  Exactly one operation runs on it at a time.
#[async_trait]
pub trait DeviceConnection: Send {
    async fn print_bitmap(
        &mut self,
        image: &ReceiptImage,
        options: PrintOptions,
    ) -> std::result::Result<(), DeviceError>;

    async fn open_cash_drawer(&mut self) -> std::result::Result<(), DeviceError>;

    async fn cut_paper(&mut self) -> std::result::Result<(), DeviceError>;

    /// Best-effort release of the handle.
    async fn close(self: Box<Self>) -> std::result::Result<(), DeviceError>;
}

/// Turns a document description into a printable bitmap.
pub trait ReceiptRenderer: Send + Sync {
    fn render(&self, document: &str) -> std::result::Result<ReceiptImage, RenderError>;
}

/// Emits devices found on the LAN during a discovery window.
///
/// `discover` returns when the window has elapsed, the receiving side of
/// `found` is dropped, or discovery fails.
#[async_trait]
pub trait DiscoveryNotifier: Send + Sync {
    async fn discover(&self, window: Duration, found: mpsc::Sender<DiscoveredDevice>) -> Result<()>;
}
