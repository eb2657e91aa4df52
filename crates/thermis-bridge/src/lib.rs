// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Thermis Bridge — the collaborators the dispatcher drives but does not own.
//
// Defines the gate/driver/renderer/notifier capability traits and ships the
// implementations that need no vendor SDK: the USB permission gate, the LAN
// reachability gate, mDNS discovery, and a simulated printer.  Vendor
// drivers (ESC/POS over USB, Star over LAN) plug in through `traits`.

pub mod discovery;
pub mod lan;
pub mod sim;
pub mod traits;
pub mod usb;

pub use discovery::MdnsNotifier;
pub use lan::LanGate;
pub use sim::{SimulatedFault, SimulatedPrinter, SimulatedRenderer};
pub use traits::{
    DeviceConnection, DeviceDriver, DeviceGate, DeviceGrant, DiscoveryNotifier, Endpoint,
    PrintOptions, ReceiptRenderer, UsbDeviceInfo,
};
pub use usb::{PermissionBroker, PermissionRequestId, UsbHost, UsbPermissionGate};
