// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Central service layer — loads configuration, opens the dispatch store and
// builds the source client, print service and poll scheduler.
//
// The tracker is the only owner of the dispatch database; everything here
// shares it through an `Arc`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use isaround_core::error::{ConnectorError, Result};
use isaround_core::types::{DispatchRecord, HealthReport, ObservanceId, OccurrenceKey};
use isaround_core::ConnectorConfig;
use isaround_print::evaluator;
use isaround_print::ipp_client::{IppClient, PrinterAttributes};
use isaround_print::print_service::IppPrintService;
use isaround_print::source::{Credentials, IsAroundClient, ObservanceSource};
use isaround_print::{Dispatcher, PollScheduler, Tracker};
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub const CONFIG_FILE: &str = "config.json";
pub const PASSWORD_ENV: &str = "ISAROUND_PASSWORD";
const DISPATCH_DB: &str = "dispatch.db";
const HEALTH_FILE: &str = "health.json";

/// Everything a command needs, built from one validated config.
#[derive(Clone)]
pub struct ConnectorServices {
    config: ConnectorConfig,
    data_dir: PathBuf,
    tracker: Arc<Tracker>,
    client: Arc<IsAroundClient>,
}

impl ConnectorServices {
    /// Validate `config`, open the dispatch store and build the HTTP client.
    pub fn init(config: ConnectorConfig, data_dir: &Path) -> Result<Self> {
        config.validate()?;
        info!(path = %data_dir.display(), app_url = %config.app_url, "initialising connector services");

        let tracker = Tracker::open(data_dir.join(DISPATCH_DB))?;
        let credentials = config.username.clone().map(|username| Credentials {
            username,
            password: config.password.clone().unwrap_or_default(),
        });
        let client = IsAroundClient::new(&config.app_url, config.request_timeout())?
            .with_credentials(credentials);

        Ok(Self {
            config,
            data_dir: data_dir.to_path_buf(),
            tracker: Arc::new(tracker),
            client: Arc::new(client),
        })
    }

    pub fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn client(&self) -> &Arc<IsAroundClient> {
        &self.client
    }

    /// Build the poll scheduler.  Needs a printer.
    pub fn scheduler(&self) -> Result<Arc<PollScheduler>> {
        let printer_uri = self
            .config
            .printer_uri
            .clone()
            .filter(|uri| !uri.trim().is_empty())
            .ok_or(ConnectorError::NoPrinterConfigured)?;
        // Reject a malformed URI now rather than on the first due occurrence.
        IppClient::new(&printer_uri)?;

        let printer = Arc::new(IppPrintService::new(self.client.clone(), self.config.copies));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&self.tracker),
            printer,
            printer_uri,
            self.config.retry_budget,
            self.config.request_timeout(),
            self.config.printer_failure_threshold,
        ));

        Ok(Arc::new(PollScheduler::new(
            &self.config,
            self.client.clone(),
            Arc::clone(&self.tracker),
            dispatcher,
        )))
    }

    /// Log in up front.  Failure is not fatal; the first fetch retries.
    pub async fn authenticate(&self) {
        if let Err(e) = self.client.authenticate().await {
            warn!(error = %e, "initial login failed; will retry on first poll");
        }
    }

    // -- Diagnostics ---------------------------------------------------------

    pub fn records(&self) -> Result<Vec<DispatchRecord>> {
        self.tracker.records()
    }

    pub fn last_poll_time(&self) -> Result<Option<DateTime<Utc>>> {
        self.tracker.last_poll_time()
    }

    /// Upcoming occurrences as `(observance id, title, time)`.
    pub async fn upcoming(&self) -> Result<Vec<(String, String, DateTime<Utc>)>> {
        let observances = self.client.fetch().await?;
        let list = evaluator::upcoming(
            &observances,
            Utc::now(),
            self.config.lookahead(),
            self.config.max_occurrences_per_observance,
        );
        Ok(list
            .into_iter()
            .map(|(o, t)| (o.id.to_string(), o.title.clone(), t))
            .collect())
    }

    /// Put a failed occurrence back to pending.
    pub fn reset(&self, observance_id: &str, occurrence_time: DateTime<Utc>) -> Result<DispatchRecord> {
        let key = OccurrenceKey::new(ObservanceId::new(observance_id), occurrence_time);
        self.tracker.reset(&key)
    }

    /// Query the configured printer.
    pub async fn printer_attributes(&self) -> Result<PrinterAttributes> {
        let uri = self
            .config
            .printer_uri
            .as_deref()
            .ok_or(ConnectorError::NoPrinterConfigured)?;
        IppClient::new(uri)?.get_printer_attributes().await
    }

    pub fn health_path(&self) -> PathBuf {
        self.data_dir.join(HEALTH_FILE)
    }
}

// -- Config file persistence -------------------------------------------------

/// Where the config lives: `--config` if given, else `config.json` in the
/// data directory.
pub fn config_path(explicit: Option<&Path>, data_dir: &Path) -> PathBuf {
    explicit
        .map(Path::to_path_buf)
        .unwrap_or_else(|| data_dir.join(CONFIG_FILE))
}

/// Read the config file, `None` if it does not exist.
pub fn load_config(path: &Path) -> Result<Option<ConnectorConfig>> {
    let data = match std::fs::read_to_string(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let config = serde_json::from_str(&data)
        .map_err(|e| ConnectorError::Config(format!("{}: {e}", path.display())))?;
    Ok(Some(config))
}

pub fn persist_config(path: &Path, config: &ConnectorConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(config)?;
    std::fs::write(path, json)?;
    Ok(())
}

/// Apply the password from the environment, if one is set.
pub fn with_password_override(mut config: ConnectorConfig, password: Option<String>) -> ConnectorConfig {
    if let Some(password) = password.filter(|p| !p.is_empty()) {
        debug!("using password from {PASSWORD_ENV}");
        config.password = Some(password);
    }
    config
}

// -- Health file ---------------------------------------------------------------

pub fn write_health(path: &Path, report: &HealthReport) -> Result<()> {
    let json = serde_json::to_string_pretty(report)?;
    std::fs::write(path, json)?;
    Ok(())
}

pub fn read_health(path: &Path) -> Option<HealthReport> {
    let data = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&data).ok()
}

/// Write `health.json` every time the scheduler publishes a report.
pub async fn health_writer(mut reports: watch::Receiver<HealthReport>, path: PathBuf) {
    while reports.changed().await.is_ok() {
        let report = reports.borrow_and_update().clone();
        if let Err(e) = write_health(&path, &report) {
            warn!(error = %e, path = %path.display(), "failed to write health file");
        }
    }
}
