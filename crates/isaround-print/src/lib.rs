// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Is Around Print — observance polling, occurrence tracking and print
// dispatch.  This crate bridges the core domain types defined in
// `isaround-core` and the Is Around service on one side and the IPP printer
// on the other.

pub mod dispatcher;
pub mod evaluator;
pub mod health;
pub mod ipp_client;
pub mod print_service;
pub mod retry;
pub mod scheduler;
pub mod source;
pub mod store;
pub mod tracker;

pub use dispatcher::Dispatcher;
pub use evaluator::{DueOccurrence, Evaluation, EvaluationPolicy};
pub use ipp_client::IppClient;
pub use print_service::{DocumentFetcher, IppPrintService, PrintReceipt, PrintService};
pub use scheduler::{CyclePhase, CycleReport, PollScheduler};
pub use source::{Credentials, IsAroundClient, ObservanceSource};
pub use store::{DispatchStore, SqliteStore};
pub use tracker::Tracker;
