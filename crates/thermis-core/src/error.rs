// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Unified error types for Thermis.
//
// `ThermisError` covers contract and infrastructure failures that are
// reported to the caller synchronously.  `DeviceError` is the raw taxonomy
// reported by gates and drivers; it never crosses the dispatcher boundary
// unclassified.

use std::time::Duration;

use thiserror::Error;

/// Top-level error type for all Thermis operations.
#[derive(Debug, Error)]
pub enum ThermisError {
    // -- Contract errors (rejected before a job exists) --
    #[error("invalid printer target: {0}")]
    InvalidTarget(String),

    #[error("missing required parameter: {0}")]
    MissingParameter(String),

    #[error("dispatcher has been shut down")]
    DispatcherShutdown,

    // -- Collaborator errors --
    #[error("failed to render receipt: {0}")]
    Render(#[from] RenderError),

    #[error("printer discovery failed: {0}")]
    Discovery(String),

    // -- Configuration / persistence --
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, ThermisError>;

/// Stage of a device interaction that exceeded its time bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStage {
    Acquire,
    Open,
    Send,
    Close,
}

impl std::fmt::Display for DeviceStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Acquire => "acquire",
            Self::Open => "open",
            Self::Send => "send",
            Self::Close => "close",
        };
        f.write_str(name)
    }
}

/// Raw failure reported by a device gate or device driver.
#[derive(Debug, Clone, Error)]
pub enum DeviceError {
    /// I/O failure opening or writing to the device.
    #[error("transport error: {0}")]
    Transport(String),

    /// The device answered with something garbled or a status error.
    #[error("bad response: {0}")]
    BadResponse(String),

    /// The device is not attached or not answering at its address.
    #[error("device not found: {0}")]
    NotFound(String),

    /// The platform refused access to the device.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// A link-level communication failure with no further detail.
    #[error("communication error: {0}")]
    Communication(String),

    /// The interaction exceeded its bound.
    #[error("{stage} timed out after {}ms", after.as_millis())]
    Timeout { stage: DeviceStage, after: Duration },

    /// Anything the driver could not attribute.
    #[error("{0}")]
    Other(String),
}

/// Failure producing a printable image from a document description.
#[derive(Debug, Clone, Error)]
pub enum RenderError {
    #[error("document is empty")]
    EmptyDocument,

    #[error("malformed document: {0}")]
    Malformed(String),
}
