// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Unified error types for the connector.

use std::time::Duration;

use thiserror::Error;

use crate::types::OccurrenceKey;

/// Top-level error type for all connector operations.
#[derive(Debug, Error)]
pub enum ConnectorError {
    // -- Remote observance source --
    #[error("observance source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("malformed observance data: {0}")]
    SourceMalformed(String),

    // -- Printing --
    #[error("print submission failed: {0}")]
    PrintSubmissionFailed(String),

    #[error("no printer configured")]
    NoPrinterConfigured,

    #[error("{operation} timed out after {}s", after.as_secs())]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    // -- Occurrence tracking --
    #[error("no dispatch record for occurrence {0}")]
    UnknownKey(OccurrenceKey),

    #[error("dispatch store unavailable: {0}")]
    StoreUnavailable(String),

    // -- Configuration / local I/O --
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, ConnectorError>;
