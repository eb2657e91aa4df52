// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Failure classifier.
//
// Maps a raw gate/driver error onto the closed `FailureReason` taxonomy plus
// its retryability.  Pure: the same error always yields the same pair.

use thermis_core::error::DeviceError;
use thermis_core::types::FailureReason;

/// Classify a raw device error into `(reason, retryable)`.
pub fn classify(err: &DeviceError) -> (FailureReason, bool) {
    let reason = match err {
        DeviceError::Transport(detail) | DeviceError::BadResponse(detail) => classify_detail(detail),
        DeviceError::NotFound(_) => FailureReason::PrinterNotFound,
        DeviceError::Timeout { .. } => FailureReason::TimeoutError,
        DeviceError::Communication(_) => FailureReason::CommunicationError,
        // A refusal may still say why (e.g. "device in use by another app").
        DeviceError::PermissionDenied(detail) => classify_detail(detail),
        DeviceError::Other(_) => FailureReason::UnknownError,
    };
    (reason, reason.is_retryable())
}

/// Classify the free-text detail of a transport or response error.
///
/// Checked in a fixed order so a message naming several conditions always
/// lands on the same reason.
pub fn classify_detail(detail: &str) -> FailureReason {
    let lower = detail.to_ascii_lowercase();

    const PATTERNS: [(&str, FailureReason); 7] = [
        ("paper", FailureReason::OutOfPaper),
        ("cover", FailureReason::CoverOpen),
        ("busy", FailureReason::PrinterBusy),
        ("offline", FailureReason::PrinterOffline),
        ("in use", FailureReason::DeviceInUse),
        ("network", FailureReason::NetworkError),
        ("timeout", FailureReason::TimeoutError),
    ];

    PATTERNS
        .iter()
        .find(|(needle, _)| lower.contains(needle))
        .map(|(_, reason)| *reason)
        .unwrap_or(FailureReason::UnknownError)
}
