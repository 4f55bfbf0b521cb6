// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Async IPP client for the target printer.
//
// Uses the `ipp` crate's async API for the two operations the connector
// needs:
//   - Get-Printer-Attributes  (RFC 8011 §4.2.5) — reachability check
//   - Print-Job               (RFC 8011 §4.2.1) — submit an observance PDF

use std::collections::HashMap;
use std::io::Cursor;

use ipp::prelude::*;
use tracing::{debug, error, info, instrument};

use isaround_core::error::{ConnectorError, Result};

const PDF_MIME: &str = "application/pdf";

/// Flattened Get-Printer-Attributes response: attribute name to display value.
pub type PrinterAttributes = HashMap<String, String>;

/// Async IPP client bound to a single printer URI.
pub struct IppClient {
    uri: Uri,
}

impl IppClient {
    /// Create a client for an `ipp://` or `ipps://` printer URI.
    pub fn new(uri: &str) -> Result<Self> {
        let parsed: Uri = uri
            .parse()
            .map_err(|e| ConnectorError::Config(format!("invalid printer URI '{uri}': {e}")))?;
        Ok(Self { uri: parsed })
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// Query the printer's attributes; used to check the printer is reachable.
    #[instrument(skip(self), fields(uri = %self.uri))]
    pub async fn get_printer_attributes(&self) -> Result<PrinterAttributes> {
        let operation = IppOperationBuilder::get_printer_attributes(self.uri.clone()).build();
        let client = AsyncIppClient::new(self.uri.clone());

        debug!("sending Get-Printer-Attributes");
        let response = client.send(operation).await.map_err(|e| {
            ConnectorError::PrintSubmissionFailed(format!("Get-Printer-Attributes: {e}"))
        })?;

        if !response.header().status_code().is_success() {
            let code = response.header().status_code();
            error!(status = ?code, "Get-Printer-Attributes failed");
            return Err(ConnectorError::PrintSubmissionFailed(format!(
                "Get-Printer-Attributes returned status {code:?}"
            )));
        }

        let attrs = flatten_attributes(response.attributes());
        debug!(count = attrs.len(), "received printer attributes");
        Ok(attrs)
    }

    /// Submit a PDF as a Print-Job.  Returns the printer-assigned job id.
    #[instrument(skip(self, document_bytes), fields(uri = %self.uri, job_name = %job_name, copies))]
    pub async fn print_pdf(&self, document_bytes: Vec<u8>, job_name: &str, copies: u32) -> Result<i32> {
        let payload = IppPayload::new(Cursor::new(document_bytes));
        let copies = i32::try_from(copies.max(1)).unwrap_or(1);

        let operation = IppOperationBuilder::print_job(self.uri.clone(), payload)
            .job_title(job_name)
            .document_format(PDF_MIME)
            .attribute(IppAttribute::new("copies", IppValue::Integer(copies)))
            .build();

        let client = AsyncIppClient::new(self.uri.clone());

        info!("sending Print-Job");
        let response = client
            .send(operation)
            .await
            .map_err(|e| ConnectorError::PrintSubmissionFailed(format!("Print-Job: {e}")))?;

        if !response.header().status_code().is_success() {
            let code = response.header().status_code();
            error!(status = ?code, "Print-Job rejected");
            return Err(ConnectorError::PrintSubmissionFailed(format!(
                "Print-Job returned status {code:?}"
            )));
        }

        let job_id = extract_job_id(response.attributes()).ok_or_else(|| {
            ConnectorError::PrintSubmissionFailed("Print-Job response missing job-id".into())
        })?;

        info!(job_id, "print job accepted by printer");
        Ok(job_id)
    }
}

/// Flatten all attribute groups into a single map.
fn flatten_attributes(attrs: &IppAttributes) -> PrinterAttributes {
    let mut map = HashMap::new();
    for group in attrs.groups() {
        for (name, attr) in group.attributes() {
            map.insert(name.clone(), format!("{}", attr.value()));
        }
    }
    map
}

/// Extract `job-id` from the Job Attributes group.
fn extract_job_id(attrs: &IppAttributes) -> Option<i32> {
    for group in attrs.groups_of(DelimiterTag::JobAttributes) {
        if let Some(attr) = group.attributes().get("job-id")
            && let IppValue::Integer(id) = attr.value()
        {
            return Some(*id);
        }
    }
    None
}
