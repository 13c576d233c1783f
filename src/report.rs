// src/report.rs

use crate::config::ProcessingMode;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

/// A page that did not resolve to any driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnmatchedPage {
    pub file: String,
    pub page: usize,
    /// Identifier read from the page, when it was read but not in the lookup.
    pub identifier: Option<String>,
}

/// A driver whose output document could not be written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DriverFailure {
    pub driver_id: String,
    pub reason: String,
}

/// A source document that could not be opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocumentFailure {
    pub file: String,
    pub reason: String,
}

/// Outcome of one processing run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProcessingReport {
    pub mode: ProcessingMode,
    pub documents_processed: usize,
    pub documents_failed: Vec<DocumentFailure>,
    pub total_pages: usize,
    pub matched_count: usize,
    pub unmatched_count: usize,
    pub ocr_pages: usize,
    pub per_driver_page_counts: BTreeMap<String, usize>,
    pub unmatched_pages: Vec<UnmatchedPage>,
    /// Driver documents only.
    pub written_files: Vec<PathBuf>,
    /// Catch-all document for unmatched pages, when one was written.
    pub unmatched_file: Option<PathBuf>,
    pub failures: Vec<DriverFailure>,
    pub barcodes_registered: usize,
    /// The run was stopped before every input was read.
    pub cancelled: bool,
}

impl ProcessingReport {
    pub fn new(mode: ProcessingMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    pub fn record_match(&mut self, driver_id: &str) {
        self.total_pages += 1;
        self.matched_count += 1;
        *self
            .per_driver_page_counts
            .entry(driver_id.to_string())
            .or_insert(0) += 1;
    }

    pub fn record_unmatched(&mut self, page: UnmatchedPage) {
        self.total_pages += 1;
        self.unmatched_count += 1;
        self.unmatched_pages.push(page);
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.documents_failed.is_empty()
    }

    /// Plain-text summary written next to the output documents.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let title = match self.mode {
            ProcessingMode::Route => "PDF Processing Summary",
            ProcessingMode::Picking => "Picking Dockets Processing Summary",
        };
        let _ = writeln!(out, "{title}");
        let _ = writeln!(out, "{}\n", "=".repeat(50));
        let _ = writeln!(out, "Total PDF files processed: {}", self.documents_processed);
        let _ = writeln!(out, "Total pages scanned: {}", self.total_pages);
        let _ = writeln!(out, "Pages matched: {}", self.matched_count);
        let _ = writeln!(out, "Pages unmatched: {}", self.unmatched_count);
        let _ = writeln!(out, "Pages read with OCR: {}", self.ocr_pages);
        let _ = writeln!(out, "Driver PDF files created: {}", self.written_files.len());
        if let Some(path) = &self.unmatched_file {
            let _ = writeln!(out, "Unmatched pages written to: {}", file_name(path));
        }
        if !self.failures.is_empty() {
            let _ = writeln!(out, "Failed driver files: {}", self.failures.len());
        }
        if self.cancelled {
            let _ = writeln!(out, "Run was cancelled; remaining files were not read.");
        }
        if self.mode == ProcessingMode::Picking {
            let _ = writeln!(out, "Barcodes registered: {}", self.barcodes_registered);
            let _ = writeln!(out, "\nPages are in REVERSED order for picking.");
        }
        out.push('\n');

        if !self.written_files.is_empty() {
            let _ = writeln!(out, "Created files:");
            for path in &self.written_files {
                let _ = writeln!(out, "  - {}", file_name(path));
            }
            out.push('\n');
        }

        if !self.failures.is_empty() {
            let _ = writeln!(out, "Failed drivers:");
            for failure in &self.failures {
                let _ = writeln!(out, "  - Driver {}: {}", failure.driver_id, failure.reason);
            }
            out.push('\n');
        }

        if !self.documents_failed.is_empty() {
            let _ = writeln!(out, "Unreadable source files:");
            for failure in &self.documents_failed {
                let _ = writeln!(out, "  - {}: {}", failure.file, failure.reason);
            }
            out.push('\n');
        }

        let _ = writeln!(out, "Driver Page Counts:");
        for (driver, count) in &self.per_driver_page_counts {
            let _ = writeln!(out, "  Driver {driver}: {count} pages");
        }

        if !self.unmatched_pages.is_empty() {
            let _ = writeln!(out, "\nUnmatched pages:");
            for page in &self.unmatched_pages {
                match &page.identifier {
                    Some(id) => {
                        let _ = writeln!(
                            out,
                            "  - {} page {} (order {id} not in delivery data)",
                            page.file, page.page
                        );
                    }
                    None => {
                        let _ = writeln!(out, "  - {} page {} (no order id found)", page.file, page.page);
                    }
                }
            }
        }
        out
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
