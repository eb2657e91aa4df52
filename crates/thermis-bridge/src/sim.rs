// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Simulated printer backend for hosts without hardware and for tests.
//
// One `SimulatedPrinter` acts as both gate and driver for any number of
// devices.  Each device has a latency and a fault script; every driver
// invocation is recorded with its start and end time so callers can check
// serialization and pacing.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use image::Luma;
use tokio::time::Instant;
use tracing::debug;

use thermis_core::error::{DeviceError, RenderError};
use thermis_core::types::{DeviceIdentity, DeviceRef, OperationKind, ReceiptImage};

use crate::traits::{
    DeviceConnection, DeviceDriver, DeviceGate, DeviceGrant, Endpoint, PrintOptions,
    ReceiptRenderer,
};

/// A failure injected into a simulated device.
#[derive(Debug, Clone)]
pub enum SimulatedFault {
    /// The gate refuses with this error.
    Gate(DeviceError),
    /// The gate never answers.
    GateHang,
    /// Opening the connection fails.
    Open(DeviceError),
    /// The driver operation fails.
    Send(DeviceError),
    /// The driver operation never completes.
    SendHang,
    /// Releasing the connection never completes.
    CloseHang,
}

impl SimulatedFault {
    fn stage(&self) -> FaultStage {
        match self {
            Self::Gate(_) | Self::GateHang => FaultStage::Gate,
            Self::Open(_) => FaultStage::Open,
            Self::Send(_) | Self::SendHang => FaultStage::Send,
            Self::CloseHang => FaultStage::Close,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FaultStage {
    Gate,
    Open,
    Send,
    Close,
}

/// One recorded driver operation.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub device: DeviceIdentity,
    pub kind: OperationKind,
    pub started: Instant,
    pub finished: Instant,
    pub succeeded: bool,
}

#[derive(Default)]
struct DeviceScript {
    latency: Option<Duration>,
    scripted: VecDeque<SimulatedFault>,
    sticky: Option<SimulatedFault>,
    acquisitions: usize,
    in_flight: usize,
    max_in_flight: usize,
}

impl DeviceScript {
    /// Take the fault for `stage`, if the next one applies there.
    fn take_fault(&mut self, stage: FaultStage) -> Option<SimulatedFault> {
        if self.scripted.front().is_some_and(|f| f.stage() == stage) {
            return self.scripted.pop_front();
        }
        if self.scripted.is_empty() {
            return self.sticky.clone().filter(|f| f.stage() == stage);
        }
        None
    }
}

#[derive(Default)]
struct SimState {
    default_latency: Duration,
    devices: HashMap<DeviceIdentity, DeviceScript>,
    invocations: Vec<Invocation>,
}

/// Gate and driver for simulated devices.  Cloning shares the state.
#[derive(Clone, Default)]
pub struct SimulatedPrinter {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedPrinter {
    /// Every operation takes `latency` unless a device overrides it.
    pub fn new(latency: Duration) -> Self {
        let printer = Self::default();
        printer.lock().default_latency = latency;
        printer
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_latency(&self, device: &DeviceIdentity, latency: Duration) {
        self.lock().devices.entry(device.clone()).or_default().latency = Some(latency);
    }

    /// Queue a fault for the next interaction at its stage.
    pub fn push_fault(&self, device: &DeviceIdentity, fault: SimulatedFault) {
        self.lock()
            .devices
            .entry(device.clone())
            .or_default()
            .scripted
            .push_back(fault);
    }

    /// Apply `fault` to every interaction once the script is exhausted.
    pub fn fail_always(&self, device: &DeviceIdentity, fault: SimulatedFault) {
        self.lock().devices.entry(device.clone()).or_default().sticky = Some(fault);
    }

    pub fn heal(&self, device: &DeviceIdentity) {
        if let Some(script) = self.lock().devices.get_mut(device) {
            script.scripted.clear();
            script.sticky = None;
        }
    }

    /// All recorded driver operations, in start order.
    pub fn invocations(&self) -> Vec<Invocation> {
        let mut all = self.lock().invocations.clone();
        all.sort_by_key(|i| i.started);
        all
    }

    pub fn invocations_for(&self, device: &DeviceIdentity) -> Vec<Invocation> {
        self.invocations()
            .into_iter()
            .filter(|i| &i.device == device)
            .collect()
    }

    /// Number of gate acquisitions attempted for `device`.
    pub fn acquisitions(&self, device: &DeviceIdentity) -> usize {
        self.lock().devices.get(device).map_or(0, |s| s.acquisitions)
    }

    /// Highest number of simultaneous driver operations seen on `device`.
    pub fn max_concurrency(&self, device: &DeviceIdentity) -> usize {
        self.lock().devices.get(device).map_or(0, |s| s.max_in_flight)
    }

    fn latency(&self, device: &DeviceIdentity) -> Duration {
        let state = self.lock();
        state
            .devices
            .get(device)
            .and_then(|s| s.latency)
            .unwrap_or(state.default_latency)
    }

    fn take_fault(&self, device: &DeviceIdentity, stage: FaultStage) -> Option<SimulatedFault> {
        self.lock()
            .devices
            .entry(device.clone())
            .or_default()
            .take_fault(stage)
    }

    async fn perform(&self, device: &DeviceIdentity, kind: OperationKind) -> Result<(), DeviceError> {
        let fault = self.take_fault(device, FaultStage::Send);
        let started = Instant::now();
        {
            let mut state = self.lock();
            let script = state.devices.entry(device.clone()).or_default();
            script.in_flight += 1;
            script.max_in_flight = script.max_in_flight.max(script.in_flight);
        }
        // Decrements the in-flight count even if the caller drops us mid-way.
        let _guard = InFlightGuard {
            printer: self,
            device,
        };

        let latency = self.latency(device);
        let outcome = match fault {
            Some(SimulatedFault::SendHang) => std::future::pending().await,
            Some(SimulatedFault::Send(err)) => {
                tokio::time::sleep(latency).await;
                Err(err)
            }
            _ => {
                tokio::time::sleep(latency).await;
                Ok(())
            }
        };

        self.lock().invocations.push(Invocation {
            device: device.clone(),
            kind,
            started,
            finished: Instant::now(),
            succeeded: outcome.is_ok(),
        });
        debug!(device = %device, %kind, ok = outcome.is_ok(), "simulated operation");
        outcome
    }
}

struct InFlightGuard<'a> {
    printer: &'a SimulatedPrinter,
    device: &'a DeviceIdentity,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if let Some(script) = self.printer.lock().devices.get_mut(self.device) {
            script.in_flight = script.in_flight.saturating_sub(1);
        }
    }
}

#[async_trait]
impl DeviceGate for SimulatedPrinter {
    async fn acquire(&self, device: &DeviceRef, _deadline: Instant) -> Result<DeviceGrant, DeviceError> {
        self.lock()
            .devices
            .entry(device.identity.clone())
            .or_default()
            .acquisitions += 1;

        match self.take_fault(&device.identity, FaultStage::Gate) {
            Some(SimulatedFault::GateHang) => std::future::pending().await,
            Some(SimulatedFault::Gate(err)) => Err(err),
            _ => Ok(DeviceGrant {
                device: device.clone(),
                endpoint: Endpoint::Virtual(device.identity.to_string()),
            }),
        }
    }
}

#[async_trait]
impl DeviceDriver for SimulatedPrinter {
    async fn open(&self, grant: &DeviceGrant) -> Result<Box<dyn DeviceConnection>, DeviceError> {
        if let Some(SimulatedFault::Open(err)) = self.take_fault(&grant.device.identity, FaultStage::Open) {
            return Err(err);
        }
        Ok(Box::new(SimulatedConnection {
            printer: self.clone(),
            device: grant.device.identity.clone(),
        }))
    }
}

struct SimulatedConnection {
    printer: SimulatedPrinter,
    device: DeviceIdentity,
}

#[async_trait]
impl DeviceConnection for SimulatedConnection {
    async fn print_bitmap(&mut self, _image: &ReceiptImage, _options: PrintOptions) -> Result<(), DeviceError> {
        self.printer.perform(&self.device, OperationKind::Print).await
    }

    async fn open_cash_drawer(&mut self) -> Result<(), DeviceError> {
        self.printer.perform(&self.device, OperationKind::OpenDrawer).await
    }

    async fn cut_paper(&mut self) -> Result<(), DeviceError> {
        self.printer.perform(&self.device, OperationKind::CutPaper).await
    }

    async fn close(self: Box<Self>) -> Result<(), DeviceError> {
        if let Some(SimulatedFault::CloseHang) = self.printer.take_fault(&self.device, FaultStage::Close) {
            debug!(device = %self.device, "simulated close hangs");
            std::future::pending::<()>().await;
        }
        Ok(())
    }
}

/// Height in pixels of one rasterised document line.
const LINE_HEIGHT: u32 = 24;

/// Printable width of an 80 mm head at 203 dpi.
const PAPER_WIDTH: u32 = 576;

/// Renders one blank band per non-empty document line, with a rule under it.
#[derive(Debug, Default, Clone, Copy)]
pub struct SimulatedRenderer;

impl ReceiptRenderer for SimulatedRenderer {
    fn render(&self, document: &str) -> Result<ReceiptImage, RenderError> {
        let lines = document.lines().filter(|l| !l.trim().is_empty()).count() as u32;
        if lines == 0 {
            return Err(RenderError::EmptyDocument);
        }
        let mut image = ReceiptImage::from_pixel(PAPER_WIDTH, lines * LINE_HEIGHT, Luma([255]));
        for line in 1..=lines {
            let y = line * LINE_HEIGHT - 1;
            for x in 0..PAPER_WIDTH {
                image.put_pixel(x, y, Luma([0]));
            }
        }
        Ok(image)
    }
}
