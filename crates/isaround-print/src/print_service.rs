// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Print service capability.
//
// The dispatcher only sees `PrintService::submit`.  The production
// implementation downloads the document from the Is Around service and sends
// it to the printer as an IPP Print-Job; tests substitute a fake.

use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::{info, instrument};

use isaround_core::error::{ConnectorError, Result};
use isaround_core::types::DocumentRef;

use crate::ipp_client::IppClient;

/// What the print service hands back when it accepts a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrintReceipt {
    /// Job id assigned by the printer, when it reports one.
    pub printer_job_id: Option<i32>,
    /// SHA-256 of the submitted document, hex-encoded.
    pub document_hash: String,
    pub bytes: usize,
}

/// Submit a document reference for printing on a named printer.
#[async_trait]
pub trait PrintService: Send + Sync {
    async fn submit(
        &self,
        document: &DocumentRef,
        printer_id: &str,
        job_name: &str,
    ) -> Result<PrintReceipt>;
}

/// Resolves a [`DocumentRef`] to PDF bytes.
#[async_trait]
pub trait DocumentFetcher: Send + Sync {
    async fn download_document(&self, document: &DocumentRef) -> Result<Vec<u8>>;
}

/// Prints documents fetched from the Is Around service on an IPP printer.
pub struct IppPrintService {
    fetcher: Arc<dyn DocumentFetcher>,
    copies: u32,
}

impl IppPrintService {
    pub fn new(fetcher: Arc<dyn DocumentFetcher>, copies: u32) -> Self {
        Self {
            fetcher,
            copies: copies.max(1),
        }
    }
}

#[async_trait]
impl PrintService for IppPrintService {
    #[instrument(skip(self), fields(%document))]
    async fn submit(
        &self,
        document: &DocumentRef,
        printer_id: &str,
        job_name: &str,
    ) -> Result<PrintReceipt> {
        if printer_id.trim().is_empty() {
            return Err(ConnectorError::NoPrinterConfigured);
        }
        let client = IppClient::new(printer_id)?;

        let pdf = self.fetcher.download_document(document).await?;
        if pdf.is_empty() {
            return Err(ConnectorError::PrintSubmissionFailed(format!(
                "document {document} is empty"
            )));
        }
        let document_hash = document_hash(&pdf);
        let bytes = pdf.len();

        let job_id = client.print_pdf(pdf, job_name, self.copies).await?;
        info!(job_id, %document_hash, bytes, copies = self.copies, "document sent to printer");

        Ok(PrintReceipt {
            printer_job_id: Some(job_id),
            document_hash,
            bytes,
        })
    }
}

/// Hex-encoded SHA-256 of a document.
pub fn document_hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}
