// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Core domain types for the Thermis print dispatcher.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, ThermisError};

/// A rendered receipt, one byte of luminance per pixel.
pub type ReceiptImage = image::GrayImage;

/// Unique identifier for a dispatched job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Device family, selecting which gate/driver pair serves a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PrinterFamily {
    /// ESC/POS printer attached over USB.  Only one can be attached at a time.
    #[serde(rename = "usbgeneric")]
    UsbGeneric,
    /// Star Micronics printer on the LAN, addressed by MAC or host.
    #[serde(rename = "starmclan")]
    StarLan,
}

impl PrinterFamily {
    /// Parse the tag used by the command surface (case-insensitive).
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag.trim().to_ascii_lowercase().as_str() {
            "usbgeneric" => Some(Self::UsbGeneric),
            "starmclan" => Some(Self::StarLan),
            _ => None,
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Self::UsbGeneric => "usbgeneric",
            Self::StarLan => "starmclan",
        }
    }
}

/// Key deciding serialization scope: jobs sharing an identity never run
/// concurrently, jobs with different identities may.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeviceIdentity {
    /// The USB bus.  Singular per process.
    Usb,
    /// A LAN device keyed by its normalised primary address.
    Lan(String),
}

impl DeviceIdentity {
    /// Parse a key as produced by `Display` (`"usb"`, `"lan:<address>"`).
    ///
    /// A bare address is accepted as a LAN key.
    pub fn parse_key(key: &str) -> Option<Self> {
        let key = key.trim();
        if key.is_empty() {
            return None;
        }
        if key.eq_ignore_ascii_case("usb") {
            return Some(Self::Usb);
        }
        let address = match key.get(..4) {
            Some(prefix) if prefix.eq_ignore_ascii_case("lan:") => &key[4..],
            _ => key,
        };
        let normalised = normalize_address(address);
        (!normalised.is_empty()).then_some(Self::Lan(normalised))
    }
}

impl std::fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Usb => f.write_str("usb"),
            Self::Lan(address) => write!(f, "lan:{address}"),
        }
    }
}

/// Normalise a LAN address so that different spellings of the same device
/// collapse to one identity.
///
/// MAC-style identifiers (12 bare hex digits, or six 2-digit groups joined
/// by one of `:`, `-`, `.`) become upper-case and colon separated; anything
/// else (IP, IPv6, host name) is trimmed and lower-cased.
pub fn normalize_address(raw: &str) -> String {
    let trimmed = raw.trim();
    match mac_digits(trimmed) {
        Some(hex) => {
            let upper = hex.to_ascii_uppercase();
            upper
                .as_bytes()
                .chunks(2)
                .map(|pair| String::from_utf8_lossy(pair).into_owned())
                .collect::<Vec<_>>()
                .join(":")
        }
        None => trimmed.to_ascii_lowercase(),
    }
}

/// The 12 hex digits of a MAC-style identifier, or `None`.
fn mac_digits(candidate: &str) -> Option<String> {
    let is_hex = |s: &str| s.chars().all(|c| c.is_ascii_hexdigit());
    if candidate.len() == 12 && is_hex(candidate) {
        return Some(candidate.to_string());
    }

    let separator = candidate.chars().find(|c| matches!(c, ':' | '-' | '.'))?;
    let groups: Vec<&str> = candidate.split(separator).collect();
    if groups.len() == 6 && groups.iter().all(|g| g.len() == 2 && is_hex(g)) {
        Some(groups.concat())
    } else {
        None
    }
}

/// One physical device a job is aimed at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRef {
    pub family: PrinterFamily,
    pub identity: DeviceIdentity,
    /// Address as configured (trimmed); `None` for USB.
    pub address: Option<String>,
}

impl std::fmt::Display for DeviceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.identity)
    }
}

/// Target configuration accompanying every request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrinterTarget {
    pub family: PrinterFamily,
    /// LAN addresses; repeated entries print repeatedly on the same device.
    #[serde(default)]
    pub addresses: Vec<String>,
}

impl PrinterTarget {
    pub fn usb() -> Self {
        Self {
            family: PrinterFamily::UsbGeneric,
            addresses: Vec::new(),
        }
    }

    pub fn lan<I, S>(addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            family: PrinterFamily::StarLan,
            addresses: addresses.into_iter().map(Into::into).collect(),
        }
    }

    /// Expand the target into one device reference per addressed entry.
    ///
    /// Duplicate LAN entries yield duplicate references sharing an identity.
    pub fn device_refs(&self) -> Result<Vec<DeviceRef>> {
        match self.family {
            PrinterFamily::UsbGeneric => Ok(vec![DeviceRef {
                family: self.family,
                identity: DeviceIdentity::Usb,
                address: None,
            }]),
            PrinterFamily::StarLan => {
                if self.addresses.is_empty() {
                    return Err(ThermisError::InvalidTarget(
                        "LAN target requires at least one address".into(),
                    ));
                }
                self.addresses
                    .iter()
                    .map(|raw| {
                        let address = raw.trim();
                        if address.is_empty() {
                            return Err(ThermisError::InvalidTarget(
                                "LAN target contains a blank address".into(),
                            ));
                        }
                        Ok(DeviceRef {
                            family: self.family,
                            identity: DeviceIdentity::Lan(normalize_address(address)),
                            address: Some(address.to_owned()),
                        })
                    })
                    .collect()
            }
        }
    }
}

/// Operation requested against one device.
#[derive(Debug, Clone)]
pub enum Operation {
    Print {
        image: Arc<ReceiptImage>,
        open_drawer: bool,
    },
    OpenDrawer,
    CutPaper,
    CheckConnection,
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::Print { .. } => OperationKind::Print,
            Self::OpenDrawer => OperationKind::OpenDrawer,
            Self::CutPaper => OperationKind::CutPaper,
            Self::CheckConnection => OperationKind::CheckConnection,
        }
    }
}

/// Payload-free discriminant of [`Operation`], used for timeouts and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    Print,
    OpenDrawer,
    CutPaper,
    CheckConnection,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Print => "print",
            Self::OpenDrawer => "open-drawer",
            Self::CutPaper => "cut-paper",
            Self::CheckConnection => "check-connection",
        };
        f.write_str(name)
    }
}

/// Closed taxonomy of print failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureReason {
    PrinterBusy,
    PrinterOffline,
    PrinterNotFound,
    OutOfPaper,
    CoverOpen,
    NetworkError,
    CommunicationError,
    DeviceInUse,
    TimeoutError,
    UnknownError,
}

impl FailureReason {
    /// Static retryability of the reason.
    ///
    /// Paper and cover conditions are retryable on purpose: an operator can
    /// fix them between attempts.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::UnknownError)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PrinterBusy => "PRINTER_BUSY",
            Self::PrinterOffline => "PRINTER_OFFLINE",
            Self::PrinterNotFound => "PRINTER_NOT_FOUND",
            Self::OutOfPaper => "OUT_OF_PAPER",
            Self::CoverOpen => "COVER_OPEN",
            Self::NetworkError => "NETWORK_ERROR",
            Self::CommunicationError => "COMMUNICATION_ERROR",
            Self::DeviceInUse => "DEVICE_IN_USE",
            Self::TimeoutError => "TIMEOUT_ERROR",
            Self::UnknownError => "UNKNOWN_ERROR",
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal outcome of a job, delivered to the caller exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrintResult {
    Success,
    Failed {
        reason: FailureReason,
        retryable: bool,
        message: Option<String>,
    },
}

impl PrintResult {
    pub fn failed(reason: FailureReason, retryable: bool, message: impl Into<String>) -> Self {
        Self::Failed {
            reason,
            retryable,
            message: Some(message.into()),
        }
    }

    /// Non-retryable `UNKNOWN_ERROR` with a message, used for cancellation,
    /// shutdown, and rejected requests.
    pub fn terminal(message: impl Into<String>) -> Self {
        Self::failed(FailureReason::UnknownError, false, message)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    pub fn reason(&self) -> Option<FailureReason> {
        match self {
            Self::Success => None,
            Self::Failed { reason, .. } => Some(*reason),
        }
    }

    /// Structured record handed across the command surface.
    pub fn to_response(&self) -> PrintResponse {
        match self {
            Self::Success => PrintResponse {
                success: true,
                reason: None,
                retryable: false,
                message: None,
            },
            Self::Failed {
                reason,
                retryable,
                message,
            } => PrintResponse {
                success: false,
                reason: Some(*reason),
                retryable: *retryable,
                message: message.clone(),
            },
        }
    }
}

/// Wire shape of a [`PrintResult`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrintResponse {
    pub success: bool,
    pub reason: Option<FailureReason>,
    pub retryable: bool,
    pub message: Option<String>,
}

/// A printer reported by a discovery notifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    #[serde(rename = "deviceName")]
    pub device_name: Option<String>,
    pub address: String,
    /// Stable identity (MAC where known) suitable as a LAN target address.
    pub identity: String,
}

/// Event emitted during a discovery window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DiscoveryEvent {
    DeviceFound(DiscoveredDevice),
    Failed { message: String },
    Finished,
}
