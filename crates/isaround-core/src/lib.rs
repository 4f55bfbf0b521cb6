// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Is Around connector — core types, errors, configuration and recurrence
// expansion shared by the print engine and the daemon.

pub mod config;
pub mod error;
pub mod recurrence;
pub mod types;

pub use config::ConnectorConfig;
pub use error::ConnectorError;
pub use types::*;
