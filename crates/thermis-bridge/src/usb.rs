// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// USB permission gate.
//
// Attaching to a USB printer needs an OS permission grant that arrives as an
// asynchronous platform event.  Each request is registered with a
// `PermissionBroker` as a oneshot; the platform event resolves it exactly
// once and the gate awaits it under the caller's deadline.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use thermis_core::error::{DeviceError, DeviceStage};
use thermis_core::types::DeviceRef;

use crate::traits::{DeviceGate, DeviceGrant, Endpoint, UsbDeviceInfo};

/// Identifier of one outstanding permission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PermissionRequestId(pub u64);

impl std::fmt::Display for PermissionRequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "usb-permission-{}", self.0)
    }
}

/// Platform side of the USB stack.
pub trait UsbHost: Send + Sync {
    /// First attached device that looks like a printer.
    fn first_connected_printer(&self) -> Option<UsbDeviceInfo>;

    /// Whether access to `device` has already been granted.
    fn has_permission(&self, device: &UsbDeviceInfo) -> bool;

    /// Ask the OS for access.  The answer must later be delivered through
    /// [`PermissionBroker::resolve`] with the same `request` id.
    fn request_permission(
        &self,
        device: &UsbDeviceInfo,
        request: PermissionRequestId,
    ) -> Result<(), DeviceError>;
}

/// Outstanding permission requests awaiting their platform answer.
#[derive(Default)]
pub struct PermissionBroker {
    next_id: AtomicU64,
    pending: Mutex<HashMap<PermissionRequestId, oneshot::Sender<bool>>>,
}

impl PermissionBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<PermissionRequestId, oneshot::Sender<bool>>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn register(&self) -> (PermissionRequestId, oneshot::Receiver<bool>) {
        let id = PermissionRequestId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        self.pending().insert(id, tx);
        (id, rx)
    }

    fn withdraw(&self, id: PermissionRequestId) {
        if self.pending().remove(&id).is_some() {
            debug!(request = %id, "permission request withdrawn");
        }
    }

    /// Deliver the platform's answer to a request.
    ///
    /// Returns `false` (and changes nothing) if the request is unknown,
    /// already resolved, or withdrawn.
    pub fn resolve(&self, id: PermissionRequestId, granted: bool) -> bool {
        let Some(tx) = self.pending().remove(&id) else {
            warn!(request = %id, granted, "ignoring permission answer for unknown request");
            return false;
        };
        // A send error means the waiter gave up in the meantime.
        tx.send(granted).is_ok()
    }

    /// Number of requests still waiting for an answer.
    pub fn outstanding(&self) -> usize {
        self.pending().len()
    }
}

/// Withdraws its request when the waiting future is dropped or times out.
struct PendingPermission<'a> {
    broker: &'a PermissionBroker,
    id: PermissionRequestId,
}

impl Drop for PendingPermission<'_> {
    fn drop(&mut self) {
        self.broker.withdraw(self.id);
    }
}

/// Gate for the (single) attached USB printer.
pub struct UsbPermissionGate {
    host: Arc<dyn UsbHost>,
    broker: Arc<PermissionBroker>,
}

impl UsbPermissionGate {
    pub fn new(host: Arc<dyn UsbHost>, broker: Arc<PermissionBroker>) -> Self {
        Self { host, broker }
    }

    pub fn broker(&self) -> &Arc<PermissionBroker> {
        &self.broker
    }
}

#[async_trait]
impl DeviceGate for UsbPermissionGate {
    async fn acquire(&self, device: &DeviceRef, deadline: Instant) -> Result<DeviceGrant, DeviceError> {
        let started = Instant::now();
        let usb = self
            .host
            .first_connected_printer()
            .ok_or_else(|| DeviceError::NotFound("no USB printer attached".into()))?;

        let grant = DeviceGrant {
            device: device.clone(),
            endpoint: Endpoint::Usb(usb.clone()),
        };

        if self.host.has_permission(&usb) {
            return Ok(grant);
        }

        let (id, answer) = self.broker.register();
        let _pending = PendingPermission {
            broker: &self.broker,
            id,
        };
        info!(request = %id, device = %usb.device_name, "requesting USB permission");
        self.host.request_permission(&usb, id)?;

        match tokio::time::timeout_at(deadline, answer).await {
            Ok(Ok(true)) => {
                info!(request = %id, "USB permission granted");
                Ok(grant)
            }
            Ok(Ok(false)) => Err(DeviceError::PermissionDenied(format!(
                "access to {} was denied",
                usb.device_name
            ))),
            Ok(Err(_)) => Err(DeviceError::Other("permission request abandoned".into())),
            Err(_) => Err(DeviceError::Timeout {
                stage: DeviceStage::Acquire,
                after: deadline.saturating_duration_since(started),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use thermis_core::types::{DeviceIdentity, PrinterFamily};

    struct FakeHost {
        device: Option<UsbDeviceInfo>,
        granted: bool,
        requests: Mutex<Vec<PermissionRequestId>>,
    }

    impl FakeHost {
        fn with_printer(granted: bool) -> Self {
            Self {
                device: Some(UsbDeviceInfo {
                    device_name: "/dev/bus/usb/001/004".into(),
                    vendor_id: 0x0416,
                    product_id: 0x5011,
                }),
                granted,
                requests: Mutex::new(Vec::new()),
            }
        }

        fn last_request(&self) -> Option<PermissionRequestId> {
            self.requests.lock().unwrap().last().copied()
        }
    }

    impl UsbHost for FakeHost {
        fn first_connected_printer(&self) -> Option<UsbDeviceInfo> {
            self.device.clone()
        }

        fn has_permission(&self, _device: &UsbDeviceInfo) -> bool {
            self.granted
        }

        fn request_permission(
            &self,
            _device: &UsbDeviceInfo,
            request: PermissionRequestId,
        ) -> Result<(), DeviceError> {
            self.requests.lock().unwrap().push(request);
            Ok(())
        }
    }

    fn usb_ref() -> DeviceRef {
        DeviceRef {
            family: PrinterFamily::UsbGeneric,
            identity: DeviceIdentity::Usb,
            address: None,
        }
    }

    #[tokio::test]
    async fn no_attached_printer_is_not_found() {
        let host = Arc::new(FakeHost {
            device: None,
            granted: false,
            requests: Mutex::new(Vec::new()),
        });
        let gate = UsbPermissionGate::new(host, Arc::new(PermissionBroker::new()));
        let err = gate
            .acquire(&usb_ref(), Instant::now() + Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, DeviceError::NotFound(_)));
    }

    #[tokio::test]
    async fn existing_permission_skips_request() {
        let host = Arc::new(FakeHost::with_printer(true));
        let gate = UsbPermissionGate::new(host.clone(), Arc::new(PermissionBroker::new()));
        let grant = gate
            .acquire(&usb_ref(), Instant::now() + Duration::from_secs(1))
            .await
            .expect("grant");
        assert!(matches!(grant.endpoint, Endpoint::Usb(_)));
        assert!(host.last_request().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn grant_event_resolves_acquire() {
        let host = Arc::new(FakeHost::with_printer(false));
        let broker = Arc::new(PermissionBroker::new());
        let gate = UsbPermissionGate::new(host.clone(), broker.clone());

        let waiter = tokio::spawn(async move {
            gate.acquire(&usb_ref(), Instant::now() + Duration::from_secs(5)).await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let id = host.last_request().expect("request issued");
        assert!(broker.resolve(id, true));
        // A duplicate platform event must not resolve anything again.
        assert!(!broker.resolve(id, true));

        assert!(waiter.await.unwrap().is_ok());
        assert_eq!(broker.outstanding(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn denial_is_permission_denied() {
        let host = Arc::new(FakeHost::with_printer(false));
        let broker = Arc::new(PermissionBroker::new());
        let gate = UsbPermissionGate::new(host.clone(), broker.clone());

        let waiter = tokio::spawn(async move {
            gate.acquire(&usb_ref(), Instant::now() + Duration::from_secs(5)).await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        broker.resolve(host.last_request().unwrap(), false);

        assert!(matches!(
            waiter.await.unwrap(),
            Err(DeviceError::PermissionDenied(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_request_times_out_and_is_withdrawn() {
        let host = Arc::new(FakeHost::with_printer(false));
        let broker = Arc::new(PermissionBroker::new());
        let gate = UsbPermissionGate::new(host.clone(), broker.clone());

        let err = gate
            .acquire(&usb_ref(), Instant::now() + Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DeviceError::Timeout {
                stage: DeviceStage::Acquire,
                ..
            }
        ));
        assert_eq!(broker.outstanding(), 0);
        // A late answer finds nothing to resolve.
        assert!(!broker.resolve(host.last_request().unwrap(), true));
    }
}
