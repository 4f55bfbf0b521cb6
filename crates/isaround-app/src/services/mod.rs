// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Service layer — wires the isaround backend crates together for the CLI.
//
// Each command in `main.rs` goes through these helpers rather than touching
// the tracker, scheduler or HTTP client directly.

pub mod connector_services;
pub mod data_dir;
