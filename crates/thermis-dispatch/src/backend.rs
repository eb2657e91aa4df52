// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Registry of collaborators, keyed by printer family.

use std::collections::HashMap;
use std::sync::Arc;

use thermis_bridge::traits::{DeviceDriver, DeviceGate, DiscoveryNotifier, ReceiptRenderer};
use thermis_core::types::PrinterFamily;

/// Gate and driver serving one printer family.
#[derive(Clone)]
pub struct FamilyBackend {
    pub gate: Arc<dyn DeviceGate>,
    pub driver: Arc<dyn DeviceDriver>,
}

/// Everything the dispatcher drives but does not own.
#[derive(Clone, Default)]
pub struct Backends {
    families: HashMap<PrinterFamily, FamilyBackend>,
    renderer: Option<Arc<dyn ReceiptRenderer>>,
    notifier: Option<Arc<dyn DiscoveryNotifier>>,
}

impl Backends {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `family` with this gate/driver pair, replacing any earlier one.
    pub fn with_family(
        mut self,
        family: PrinterFamily,
        gate: Arc<dyn DeviceGate>,
        driver: Arc<dyn DeviceDriver>,
    ) -> Self {
        self.families.insert(family, FamilyBackend { gate, driver });
        self
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn ReceiptRenderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn DiscoveryNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn family(&self, family: PrinterFamily) -> Option<&FamilyBackend> {
        self.families.get(&family)
    }

    pub fn serves(&self, family: PrinterFamily) -> bool {
        self.families.contains_key(&family)
    }

    pub fn renderer(&self) -> Option<&Arc<dyn ReceiptRenderer>> {
        self.renderer.as_ref()
    }

    pub fn notifier(&self) -> Option<&Arc<dyn DiscoveryNotifier>> {
        self.notifier.as_ref()
    }
}

impl std::fmt::Debug for Backends {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut families: Vec<_> = self.families.keys().map(PrinterFamily::tag).collect();
        families.sort_unstable();
        f.debug_struct("Backends")
            .field("families", &families)
            .field("renderer", &self.renderer.is_some())
            .field("notifier", &self.notifier.is_some())
            .finish()
    }
}
