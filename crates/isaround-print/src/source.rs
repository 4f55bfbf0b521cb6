// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Observance source client for the Is Around admin API.
//
//   POST /api/admin/login                              session cookie
//   GET  /api/admin/attendance/observances             observance list
//   POST /api/admin/attendance/{date}/export-pdf       attendance sheet PDF
//
// A 401 on any call triggers one re-login and one retry of that call.  Bad
// individual entries in the observance list are skipped and logged; only a
// body that cannot be read at all fails the fetch.

use std::collections::HashSet;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SubsecRound, Utc};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use isaround_core::error::{ConnectorError, Result};
use isaround_core::types::{
    DocumentRef, OCCURRENCE_TIME_DIGITS, Observance, ObservanceId, Recurrence,
};

use crate::print_service::DocumentFetcher;

const LOGIN_PATH: &str = "/api/admin/login";
const OBSERVANCES_PATH: &str = "/api/admin/attendance/observances";

/// Anything that can list the current observances.
#[async_trait]
pub trait ObservanceSource: Send + Sync {
    /// Current observances; malformed entries are already dropped.
    async fn fetch(&self) -> Result<Vec<Observance>>;
}

/// Login credentials for the admin API.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// HTTP client for the Is Around service.
pub struct IsAroundClient {
    /// Swapped out wholesale to discard the session cookies.
    client: RwLock<Client>,
    base_url: String,
    credentials: Option<Credentials>,
    timeout: Duration,
}

impl IsAroundClient {
    /// Create a client for `app_url` with the given per-request timeout.
    pub fn new(app_url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: RwLock::new(build_http_client(timeout)?),
            base_url: app_url.trim_end_matches('/').to_string(),
            credentials: None,
            timeout,
        })
    }

    pub fn with_credentials(mut self, credentials: Option<Credentials>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn http(&self) -> Client {
        match self.client.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Log in and keep the session cookie.  A no-op without credentials.
    #[instrument(skip(self), fields(base_url = %self.base_url))]
    pub async fn authenticate(&self) -> Result<()> {
        let Some(creds) = &self.credentials else {
            debug!("no credentials configured; skipping login");
            return Ok(());
        };

        let response = self
            .http()
            .post(self.url(LOGIN_PATH))
            .json(&serde_json::json!({
                "username": creds.username,
                "password": creds.password,
            }))
            .send()
            .await
            .map_err(|e| ConnectorError::SourceUnavailable(format!("login: {e}")))?;

        if response.status() != StatusCode::OK {
            return Err(ConnectorError::SourceUnavailable(format!(
                "login rejected with status {}",
                response.status()
            )));
        }

        info!("authenticated with Is Around");
        Ok(())
    }

    /// Drop the current session; the next 401 logs in again.
    pub fn discard_session(&self) -> Result<()> {
        let fresh = build_http_client(self.timeout)?;
        if let Ok(mut guard) = self.client.write() {
            *guard = fresh;
        }
        debug!("session cookies discarded");
        Ok(())
    }

    /// Check the service answers at all.  401/403 still count as reachable.
    #[instrument(skip(self), fields(base_url = %self.base_url))]
    pub async fn test_connection(&self) -> bool {
        match self.http().get(self.url(OBSERVANCES_PATH)).send().await {
            Ok(response) => matches!(
                response.status(),
                StatusCode::OK | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
            ),
            Err(e) => {
                debug!(error = %e, "connection test failed");
                false
            }
        }
    }

    /// Send a request, logging in again and retrying once on 401.
    async fn send_authed<F>(&self, what: &str, build: F) -> Result<Response>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let response = build(&self.http())
            .send()
            .await
            .map_err(|e| ConnectorError::SourceUnavailable(format!("{what}: {e}")))?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }
        if self.credentials.is_none() {
            return Err(ConnectorError::SourceUnavailable(format!(
                "{what}: unauthorized and no credentials configured"
            )));
        }

        debug!(what, "got 401, re-authenticating");
        self.authenticate().await?;

        let retried = build(&self.http())
            .send()
            .await
            .map_err(|e| ConnectorError::SourceUnavailable(format!("{what}: {e}")))?;
        if retried.status() == StatusCode::UNAUTHORIZED {
            return Err(ConnectorError::SourceUnavailable(format!(
                "{what}: still unauthorized after re-authentication"
            )));
        }
        Ok(retried)
    }

    /// Fetch the raw observance payload.
    async fn fetch_body(&self) -> Result<String> {
        let url = self.url(OBSERVANCES_PATH);
        let response = self.send_authed("observances", |c| c.get(&url)).await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ConnectorError::SourceUnavailable(format!(
                "observances returned status {status}"
            )));
        }

        response
            .text()
            .await
            .map_err(|e| ConnectorError::SourceUnavailable(format!("observances body: {e}")))
    }

    fn document_url(&self, document: &DocumentRef) -> String {
        match document {
            DocumentRef::AttendanceExport { date } => {
                self.url(&format!("/api/admin/attendance/{date}/export-pdf"))
            }
            DocumentRef::Url { url } if url.starts_with("http://") || url.starts_with("https://") => {
                url.clone()
            }
            DocumentRef::Url { url } if url.starts_with('/') => self.url(url),
            DocumentRef::Url { url } => self.url(&format!("/{url}")),
        }
    }
}

fn build_http_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .cookie_store(true)
        .build()
        .map_err(|e| ConnectorError::Config(format!("http client: {e}")))
}

#[async_trait]
impl ObservanceSource for IsAroundClient {
    #[instrument(skip_all)]
    async fn fetch(&self) -> Result<Vec<Observance>> {
        let body = self.fetch_body().await?;
        let observances = parse_observances(&body)?;
        debug!(count = observances.len(), "fetched observances");
        Ok(observances)
    }
}

#[async_trait]
impl DocumentFetcher for IsAroundClient {
    #[instrument(skip(self), fields(%document))]
    async fn download_document(&self, document: &DocumentRef) -> Result<Vec<u8>> {
        let url = self.document_url(document);
        let response = match document {
            DocumentRef::AttendanceExport { .. } => {
                self.send_authed("export-pdf", |c| {
                    c.post(&url).json(&serde_json::json!({ "service": "all" }))
                })
                .await
            }
            DocumentRef::Url { .. } => self.send_authed("document", |c| c.get(&url)).await,
        }
        .map_err(|e| ConnectorError::PrintSubmissionFailed(format!("download {document}: {e}")))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            return Err(ConnectorError::PrintSubmissionFailed(format!(
                "document not found: {document} (status {})",
                status.as_u16()
            )));
        }
        if !status.is_success() {
            return Err(ConnectorError::PrintSubmissionFailed(format!(
                "download {document}: status {}",
                status.as_u16()
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| ConnectorError::PrintSubmissionFailed(format!("download {document}: {e}")))?;
        debug!(bytes = bytes.len(), "document downloaded");
        Ok(bytes.to_vec())
    }
}

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObservancesPayload {
    #[serde(default)]
    observances: Vec<Value>,
    #[serde(default)]
    next_observance: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireObservance {
    id: Option<Value>,
    title: Option<String>,
    name: Option<String>,
    date: Option<String>,
    occurrence_time: Option<String>,
    #[serde(default)]
    recurrence: Option<Recurrence>,
    document_ref: Option<String>,
}

/// Parse the observance endpoint's body.
///
/// Accepts either `{"observances": [...], "nextObservance": {...}}` or a bare
/// array.  Entries that cannot be turned into an [`Observance`] are skipped.
pub fn parse_observances(body: &str) -> Result<Vec<Observance>> {
    let root: Value = serde_json::from_str(body)
        .map_err(|e| ConnectorError::SourceMalformed(format!("observances body: {e}")))?;

    let payload = match root {
        Value::Array(items) => ObservancesPayload {
            observances: items,
            next_observance: None,
        },
        Value::Object(_) => serde_json::from_value(root)
            .map_err(|e| ConnectorError::SourceMalformed(format!("observances body: {e}")))?,
        other => {
            return Err(ConnectorError::SourceMalformed(format!(
                "expected object or array, got {other}"
            )));
        }
    };

    let entries = payload
        .observances
        .into_iter()
        .map(|v| (v, false))
        .chain(payload.next_observance.filter(|v| !v.is_null()).map(|v| (v, true)));

    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for (raw, is_next) in entries {
        match to_observance(raw, is_next) {
            Ok(obs) => {
                if seen.insert((obs.id.clone(), obs.occurrence_time)) {
                    out.push(obs);
                }
            }
            Err(e) => warn!(error = %e, "skipping malformed observance"),
        }
    }
    Ok(out)
}

fn to_observance(raw: Value, is_next: bool) -> Result<Observance> {
    let wire: WireObservance =
        serde_json::from_value(raw).map_err(|e| ConnectorError::SourceMalformed(e.to_string()))?;

    let date = wire
        .date
        .as_deref()
        .map(|d| {
            NaiveDate::parse_from_str(d.get(..10).unwrap_or(d), "%Y-%m-%d")
                .map_err(|e| ConnectorError::SourceMalformed(format!("date '{d}': {e}")))
        })
        .transpose()?;

    let occurrence_time = match (&wire.occurrence_time, date) {
        (Some(t), _) => DateTime::parse_from_rfc3339(t)
            .map(|dt| dt.with_timezone(&Utc).trunc_subsecs(OCCURRENCE_TIME_DIGITS))
            .map_err(|e| ConnectorError::SourceMalformed(format!("occurrenceTime '{t}': {e}")))?,
        (None, Some(d)) => d.and_time(chrono::NaiveTime::MIN).and_utc(),
        (None, None) => {
            return Err(ConnectorError::SourceMalformed(
                "entry has neither date nor occurrenceTime".into(),
            ));
        }
    };

    let day = date.unwrap_or_else(|| occurrence_time.date_naive());

    let id = match wire.id {
        Some(Value::String(s)) if !s.trim().is_empty() => s,
        Some(Value::Number(n)) => n.to_string(),
        Some(other) if !other.is_null() => {
            return Err(ConnectorError::SourceMalformed(format!("unusable id {other}")));
        }
        _ if is_next => format!("next-observance:{day}"),
        _ => return Err(ConnectorError::SourceMalformed("entry has no id".into())),
    };

    let document_ref = match wire.document_ref {
        Some(url) if !url.trim().is_empty() => DocumentRef::Url { url },
        _ => DocumentRef::AttendanceExport { date: day },
    };

    Ok(Observance {
        id: ObservanceId(id),
        title: wire
            .title
            .or(wire.name)
            .unwrap_or_else(|| format!("Observance {day}")),
        occurrence_time,
        recurrence: wire.recurrence.unwrap_or_default(),
        document_ref,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parses_list_and_next_observance() {
        let body = r#"{
            "observances": [
                {"id": "a1", "title": "Morning service", "date": "2026-05-03"},
                {"id": 42, "name": "Evening", "occurrenceTime": "2026-05-03T18:00:00+02:00",
                 "recurrence": "weekly", "documentRef": "/files/evening.pdf"}
            ],
            "nextObservance": {"date": "2026-05-10"}
        }"#;

        let got = parse_observances(body).expect("parse");
        assert_eq!(got.len(), 3);

        assert_eq!(got[0].id.as_str(), "a1");
        assert_eq!(
            got[0].occurrence_time,
            Utc.with_ymd_and_hms(2026, 5, 3, 0, 0, 0).unwrap()
        );
        assert_eq!(
            got[0].document_ref,
            DocumentRef::AttendanceExport {
                date: NaiveDate::from_ymd_opt(2026, 5, 3).unwrap()
            }
        );

        assert_eq!(got[1].id.as_str(), "42");
        assert_eq!(got[1].recurrence, Recurrence::Weekly);
        assert_eq!(
            got[1].occurrence_time,
            Utc.with_ymd_and_hms(2026, 5, 3, 16, 0, 0).unwrap()
        );

        assert_eq!(got[2].id.as_str(), "next-observance:2026-05-10");
        assert_eq!(got[2].title, "Observance 2026-05-10");
    }

    #[test]
    fn malformed_entries_are_skipped() {
        let body = r#"[
            {"id": "ok", "date": "2026-05-03"},
            {"id": "no-time"},
            {"id": "bad-date", "date": "03/05/2026"},
            {"date": "2026-05-04"},
            "not even an object"
        ]"#;
        let got = parse_observances(body).expect("parse");
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].id.as_str(), "ok");
    }

    #[test]
    fn duplicate_next_observance_is_collapsed() {
        let body = r#"{
            "observances": [{"id": "x", "date": "2026-05-03"}],
            "nextObservance": {"id": "x", "date": "2026-05-03"}
        }"#;
        assert_eq!(parse_observances(body).expect("parse").len(), 1);
    }

    #[test]
    fn unreadable_body_is_malformed() {
        assert!(matches!(
            parse_observances("<html>oops</html>"),
            Err(ConnectorError::SourceMalformed(_))
        ));
        assert!(matches!(
            parse_observances("17"),
            Err(ConnectorError::SourceMalformed(_))
        ));
    }

    #[test]
    fn empty_object_yields_nothing() {
        assert!(parse_observances("{}").expect("parse").is_empty());
        assert!(parse_observances(r#"{"nextObservance": null}"#).expect("parse").is_empty());
    }

    #[test]
    fn nanosecond_times_are_truncated_to_key_precision() {
        let got = parse_observances(r#"[{"id": "n", "occurrenceTime": "2026-06-07T10:00:00.123456789Z"}]"#)
            .expect("parse");
        assert_eq!(got[0].occurrence_time.timestamp_subsec_nanos(), 123_456_000);
        assert_eq!(got[0].key_at(got[0].occurrence_time).occurrence_time, got[0].occurrence_time);
    }

    #[test]
    fn document_urls_resolve_against_base() {
        let client = IsAroundClient::new("http://isaround.local/", Duration::from_secs(5))
            .expect("client");
        let export = DocumentRef::AttendanceExport {
            date: NaiveDate::from_ymd_opt(2026, 5, 3).unwrap(),
        };
        assert_eq!(
            client.document_url(&export),
            "http://isaround.local/api/admin/attendance/2026-05-03/export-pdf"
        );
        assert_eq!(
            client.document_url(&DocumentRef::Url { url: "files/a.pdf".into() }),
            "http://isaround.local/files/a.pdf"
        );
        assert_eq!(
            client.document_url(&DocumentRef::Url { url: "https://cdn.example/a.pdf".into() }),
            "https://cdn.example/a.pdf"
        );
    }
}
