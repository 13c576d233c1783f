// src/pipeline.rs

use crate::assemble::{self, AssemblyOutcome};
use crate::config::{ProcessingMode, SorterConfig};
use crate::document::SourceDocument;
use crate::error::PipelineError;
use crate::extract::{IdentifierExtractor, OrderIdentifier};
use crate::grouper::{Classification, DriverBuckets, PageClassifier, PageRef};
use crate::lookup::LookupTable;
use crate::report::{DocumentFailure, DriverFailure, ProcessingReport};
use crate::store::{BarcodeRecord, DispatchStore};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info, warn};

/// Shared stop switch, checked before each document is read.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Load → group → assemble over a batch of input PDFs.
pub struct Pipeline<'a> {
    config: &'a SorterConfig,
    lookup: &'a LookupTable,
    extractor: &'a IdentifierExtractor,
    cancel: CancelFlag,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        config: &'a SorterConfig,
        lookup: &'a LookupTable,
        extractor: &'a IdentifierExtractor,
    ) -> Self {
        Self {
            config,
            lookup,
            extractor,
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Process `inputs` in order. Unreadable documents and failed drivers are
    /// reported; the run only fails when no document could be opened at all.
    /// In picking mode, barcode records for every written page go to `store`.
    pub fn run(
        &self,
        inputs: &[PathBuf],
        store: Option<&mut DispatchStore>,
    ) -> Result<ProcessingReport, PipelineError> {
        let mode = self.config.mode;
        info!(
            %mode,
            inputs = inputs.len(),
            orders = self.lookup.len(),
            workers = self.config.workers,
            "Starting run"
        );

        let mut classifier =
            PageClassifier::new(self.lookup, self.extractor).with_workers(self.config.workers)?;
        let mut documents: Vec<SourceDocument> = Vec::new();
        let mut failed: Vec<DocumentFailure> = Vec::new();
        let mut cancelled = false;

        for (index, path) in inputs.iter().enumerate() {
            if self.cancel.is_cancelled() {
                warn!(remaining = inputs.len() - index, "Run cancelled");
                cancelled = true;
                break;
            }

            let span = tracing::info_span!("document", file = %path.display());
            let _guard = span.enter();

            match SourceDocument::load(path) {
                Ok(doc) => {
                    classifier.classify_document(&doc);
                    documents.push(doc);
                }
                Err(e) => {
                    error!(error = %e, "Skipping unreadable document");
                    failed.push(DocumentFailure {
                        file: display_name(path),
                        reason: e.to_string(),
                    });
                }
            }
        }

        if documents.is_empty() && !cancelled {
            return Err(PipelineError::NoDocuments(inputs.len()));
        }

        let Classification {
            buckets,
            mut report,
            unmatched,
        } = classifier.finish(mode);
        report.documents_failed = failed;
        report.cancelled = cancelled;

        let output_dir = &self.config.output_dir;
        let outcome = assemble::assemble(&buckets, &documents, output_dir, mode);
        outcome.record(&mut report);

        if self.config.keep_unmatched {
            match assemble::write_unmatched(&unmatched, &documents, output_dir) {
                Ok(Some(path)) => report.unmatched_file = Some(path),
                Ok(None) => {}
                Err(e) => {
                    error!(error = %e, "Failed to write unmatched pages");
                    report.failures.push(DriverFailure {
                        driver_id: "unmatched".into(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        if let (ProcessingMode::Picking, Some(store)) = (mode, store) {
            let records = barcode_records(&buckets, &outcome);
            match store.upsert_barcodes(&records) {
                Ok(count) => report.barcodes_registered = count,
                Err(e) => warn!(error = %e, "Failed to register barcodes"),
            }
        }

        if let Err(e) = assemble::write_summary(&report, output_dir) {
            error!(error = %e, "Failed to write run summary");
        }

        info!(
            documents = report.documents_processed,
            pages = report.total_pages,
            matched = report.matched_count,
            unmatched = report.unmatched_count,
            ocr = report.ocr_pages,
            written = report.written_files.len(),
            failed = report.failures.len(),
            "Run finished"
        );
        Ok(report)
    }
}

/// One record per page that landed in a driver document, numbered as it appears there.
pub fn barcode_records(buckets: &DriverBuckets, outcome: &AssemblyOutcome) -> Vec<BarcodeRecord> {
    let mut records = Vec::new();
    for written in &outcome.written {
        let Some(entries) = buckets.get(&written.driver_id) else {
            continue;
        };
        let orders: HashMap<PageRef, &OrderIdentifier> =
            entries.iter().map(|e| (e.source, &e.order_id)).collect();
        let file = display_name(&written.path);
        for (index, page) in written.included.iter().enumerate() {
            let Some(order_id) = orders.get(page) else {
                continue;
            };
            records.push(BarcodeRecord::new(
                order_id.as_str(),
                &written.driver_id,
                &file,
                index + 1,
            ));
        }
    }
    records
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SorterSection;
    use crate::document::tests::{make_pdf, page_marker};
    use crate::extract::tests::{extractor_with, ScriptedOcr};
    use crate::lookup::DeliveryRecord;
    use lopdf::Document;
    use std::fs;

    fn lookup() -> LookupTable {
        LookupTable::build(vec![
            DeliveryRecord::new("A060JR7", "D1", 2),
            DeliveryRecord::new("C123AB4", "D1", 1),
            DeliveryRecord::new("B900ZZ1", "D2", 1),
        ])
    }

    fn config(dir: &Path, mode: ProcessingMode) -> SorterConfig {
        SorterSection {
            mode,
            output_dir: dir.join("out"),
            ..SorterSection::default()
        }
        .validate()
        .unwrap()
    }

    fn write_input(dir: &Path, name: &str, pages: &[&str]) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, make_pdf(pages)).unwrap();
        path
    }

    fn markers(path: &Path) -> Vec<usize> {
        let doc = Document::load(path).unwrap();
        doc.get_pages().values().map(|id| page_marker(&doc, *id)).collect()
    }

    #[test]
    fn test_route_run_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_input(
            dir.path(),
            "route.pdf",
            &["A060JR7", "B900ZZ1", "C123AB4", "nothing"],
        );
        let cfg = config(dir.path(), ProcessingMode::Route);
        let table = lookup();
        let extractor = extractor_with(Arc::new(ScriptedOcr::default()));

        let report = Pipeline::new(&cfg, &table, &extractor)
            .run(&[input], None)
            .unwrap();

        assert_eq!(report.matched_count, 3);
        assert_eq!(report.unmatched_count, 1);
        assert_eq!(report.written_files.len(), 2);
        assert_eq!(markers(&cfg.output_dir.join("Driver_D1_Orders.pdf")), vec![3, 1]);
        assert_eq!(markers(&cfg.output_dir.join("Driver_D2_Orders.pdf")), vec![2]);
        assert!(cfg.output_dir.join("processing_summary.txt").exists());
        assert!(cfg.output_dir.join(assemble::REPORT_FILE_NAME).exists());
        assert!(!cfg.output_dir.join(assemble::UNMATCHED_FILE_NAME).exists());
    }

    #[test]
    fn test_unreadable_document_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let broken = dir.path().join("broken.pdf");
        fs::write(&broken, b"not a pdf").unwrap();
        let good = write_input(dir.path(), "good.pdf", &["B900ZZ1"]);
        let cfg = config(dir.path(), ProcessingMode::Picking);
        let table = lookup();
        let extractor = extractor_with(Arc::new(ScriptedOcr::default()));

        let report = Pipeline::new(&cfg, &table, &extractor)
            .run(&[broken, dir.path().join("missing.pdf"), good], None)
            .unwrap();

        assert_eq!(report.documents_processed, 1);
        assert_eq!(report.documents_failed.len(), 2);
        assert_eq!(report.documents_failed[0].file, "broken.pdf");
        assert_eq!(markers(&cfg.output_dir.join("Driver_D2_Picking_Dockets.pdf")), vec![1]);
    }

    #[test]
    fn test_no_readable_documents_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path(), ProcessingMode::Route);
        let table = lookup();
        let extractor = extractor_with(Arc::new(ScriptedOcr::default()));

        let result =
            Pipeline::new(&cfg, &table, &extractor).run(&[dir.path().join("nope.pdf")], None);
        assert!(matches!(result, Err(PipelineError::NoDocuments(1))));
    }

    #[test]
    fn test_cancelled_run_reads_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_input(dir.path(), "a.pdf", &["A060JR7"]);
        let cfg = config(dir.path(), ProcessingMode::Route);
        let table = lookup();
        let extractor = extractor_with(Arc::new(ScriptedOcr::default()));
        let cancel = CancelFlag::new();
        cancel.cancel();

        let report = Pipeline::new(&cfg, &table, &extractor)
            .with_cancel(cancel)
            .run(&[input], None)
            .unwrap();

        assert!(report.cancelled);
        assert_eq!(report.documents_processed, 0);
        assert!(report.written_files.is_empty());
    }

    #[test]
    fn test_picking_registers_barcodes_and_keeps_unmatched() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_input(
            dir.path(),
            "dockets.pdf",
            &["A060JR7", "Z999ZZ9", "B900ZZ1", "C123AB4"],
        );
        let mut cfg = config(dir.path(), ProcessingMode::Picking);
        cfg.keep_unmatched = true;
        let table = lookup();
        let extractor = extractor_with(Arc::new(ScriptedOcr::default()));
        let mut store = DispatchStore::in_memory().unwrap();

        let report = Pipeline::new(&cfg, &table, &extractor)
            .run(&[input], Some(&mut store))
            .unwrap();

        assert_eq!(report.barcodes_registered, 3);
        assert_eq!(report.written_files.len(), 2);
        // Picking: D1 gets pages 4 then 1, so C123AB4 is the first page of its file.
        let barcode = store.get_barcode("C123AB4").unwrap().unwrap();
        assert_eq!(barcode.driver_id, "D1");
        assert_eq!(barcode.pdf_file, "Driver_D1_Picking_Dockets.pdf");
        assert_eq!(barcode.page_number, 1);
        assert_eq!(store.get_barcode("A060JR7").unwrap().unwrap().page_number, 2);

        let catch_all = report.unmatched_file.clone().unwrap();
        assert_eq!(catch_all, cfg.output_dir.join(assemble::UNMATCHED_FILE_NAME));
        assert_eq!(markers(&catch_all), vec![2]);
        assert!(!report.written_files.contains(&catch_all));
        assert!(cfg.output_dir.join("picking_dockets_summary.txt").exists());
    }

    #[test]
    fn test_repeated_order_counts_once() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_input(dir.path(), "dockets.pdf", &["A060JR7", "A060JR7", "B900ZZ1"]);
        let cfg = config(dir.path(), ProcessingMode::Picking);
        let table = lookup();
        let extractor = extractor_with(Arc::new(ScriptedOcr::default()));
        let mut store = DispatchStore::in_memory().unwrap();

        let report = Pipeline::new(&cfg, &table, &extractor)
            .run(&[input], Some(&mut store))
            .unwrap();

        assert_eq!(report.matched_count, 3);
        assert_eq!(report.barcodes_registered, 2);
        assert_eq!(store.get_counts().unwrap().0, 2);
    }

    #[test]
    fn test_barcodes_follow_pages_actually_written() {
        let doc = SourceDocument::from_bytes(
            "dockets.pdf",
            make_pdf(&["A060JR7", "C123AB4", "B900ZZ1"]),
        )
        .unwrap();
        let table = lookup();
        let extractor = extractor_with(Arc::new(ScriptedOcr::default()));
        let (buckets, _) = crate::grouper::classify(&doc, ProcessingMode::Picking, &table, &extractor);
        // D1 holds pages [2, 1]; page 2 did not make it into the file.
        let outcome = AssemblyOutcome {
            written: vec![assemble::DriverOutput {
                driver_id: "D1".into(),
                path: PathBuf::from("out/Driver_D1_Picking_Dockets.pdf"),
                pages: 1,
                included: vec![PageRef { document: 0, page: 1 }],
            }],
            failures: Vec::new(),
        };

        let records = barcode_records(&buckets, &outcome);

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].order_id, "A060JR7");
        assert_eq!(records[0].page_number, 1);
        assert_eq!(records[0].pdf_file, "Driver_D1_Picking_Dockets.pdf");
    }
}
