// src/grouper.rs

use crate::config::ProcessingMode;
use crate::document::SourceDocument;
use crate::error::PipelineError;
use crate::extract::{Extraction, ExtractionMethod, IdentifierExtractor, OrderIdentifier};
use crate::lookup::LookupTable;
use crate::report::{ProcessingReport, UnmatchedPage};
use rayon::prelude::*;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// A page within a run: position of its document in the run, and 1-based page index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageRef {
    pub document: usize,
    pub page: usize,
}

/// One page routed to a driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketEntry {
    pub source: PageRef,
    pub order_id: OrderIdentifier,
    pub sequence_number: u32,
}

/// Pages per driver, in output order. A driver only appears once it has a page.
#[derive(Debug, Clone, Default)]
pub struct DriverBuckets {
    buckets: BTreeMap<String, Vec<BucketEntry>>,
}

impl DriverBuckets {
    pub fn get(&self, driver_id: &str) -> Option<&[BucketEntry]> {
        self.buckets.get(driver_id).map(Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[BucketEntry])> {
        self.buckets
            .iter()
            .map(|(driver, pages)| (driver.as_str(), pages.as_slice()))
    }

    pub fn drivers(&self) -> impl Iterator<Item = &str> {
        self.buckets.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn total_pages(&self) -> usize {
        self.buckets.values().map(Vec::len).sum()
    }

    fn push(&mut self, driver_id: &str, entry: BucketEntry) {
        self.buckets
            .entry(driver_id.to_string())
            .or_default()
            .push(entry);
    }

    fn order(&mut self, mode: ProcessingMode) {
        for pages in self.buckets.values_mut() {
            match mode {
                // Stable: equal stops keep arrival order.
                ProcessingMode::Route => pages.sort_by_key(|e| e.sequence_number),
                ProcessingMode::Picking => pages.reverse(),
            }
        }
    }
}

/// Everything a finished classification produced.
#[derive(Debug, Clone)]
pub struct Classification {
    pub buckets: DriverBuckets,
    pub report: ProcessingReport,
    /// Unmatched pages in arrival order.
    pub unmatched: Vec<PageRef>,
}

/// Accumulates driver buckets over the documents of one run.
pub struct PageClassifier<'a> {
    lookup: &'a LookupTable,
    extractor: &'a IdentifierExtractor,
    pool: Option<rayon::ThreadPool>,
    buckets: DriverBuckets,
    report: ProcessingReport,
    unmatched: Vec<PageRef>,
    documents: usize,
}

impl<'a> PageClassifier<'a> {
    pub fn new(lookup: &'a LookupTable, extractor: &'a IdentifierExtractor) -> Self {
        Self {
            lookup,
            extractor,
            pool: None,
            buckets: DriverBuckets::default(),
            report: ProcessingReport::default(),
            unmatched: Vec::new(),
            documents: 0,
        }
    }

    /// Extract identifiers on a bounded pool of `workers` threads.
    pub fn with_workers(mut self, workers: usize) -> Result<Self, PipelineError> {
        self.pool = if workers > 1 {
            Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(workers)
                    .thread_name(|i| format!("extract-{i}"))
                    .build()?,
            )
        } else {
            None
        };
        Ok(self)
    }

    /// Classify every page of `doc`. Returns the position assigned to the document,
    /// which callers use to find it again when assembling.
    pub fn classify_document(&mut self, doc: &SourceDocument) -> usize {
        let document = self.documents;
        self.documents += 1;
        let name = doc.name();

        let extractions = self.extract_all(doc);
        for (index, extraction) in extractions.into_iter().enumerate() {
            let page = index + 1;
            let source = PageRef { document, page };

            let Some(Extraction { identifier, method }) = extraction else {
                debug!(file = %name, page, "No order id found");
                self.unmatched.push(source);
                self.report.record_unmatched(UnmatchedPage {
                    file: name.clone(),
                    page,
                    identifier: None,
                });
                continue;
            };
            if method == ExtractionMethod::Ocr {
                self.report.ocr_pages += 1;
            }

            let Some(entry) = self.lookup.resolve(&identifier) else {
                info!(file = %name, page, order = %identifier, "Order not in delivery data, skipped");
                self.unmatched.push(source);
                self.report.record_unmatched(UnmatchedPage {
                    file: name.clone(),
                    page,
                    identifier: Some(identifier.to_string()),
                });
                continue;
            };

            info!(
                file = %name,
                page,
                order = %identifier,
                driver = %entry.driver_id,
                stop = entry.sequence_number,
                "Matched order"
            );
            self.report.record_match(&entry.driver_id);
            self.buckets.push(
                &entry.driver_id,
                BucketEntry {
                    source,
                    order_id: identifier,
                    sequence_number: entry.sequence_number,
                },
            );
        }

        self.report.documents_processed += 1;
        document
    }

    /// Identifiers for all pages, indexed by page order regardless of how they were computed.
    fn extract_all(&self, doc: &SourceDocument) -> Vec<Option<Extraction>> {
        let extractor = self.extractor;
        match &self.pool {
            Some(pool) => pool.install(|| {
                (1..=doc.page_count())
                    .into_par_iter()
                    .map(|page| extractor.extract_with_method(doc, page))
                    .collect()
            }),
            None => (1..=doc.page_count())
                .map(|page| extractor.extract_with_method(doc, page))
                .collect(),
        }
    }

    /// Apply the mode's page order and hand back the results.
    pub fn finish(mut self, mode: ProcessingMode) -> Classification {
        self.buckets.order(mode);
        self.report.mode = mode;
        Classification {
            buckets: self.buckets,
            report: self.report,
            unmatched: self.unmatched,
        }
    }
}

/// Classify a single document.
pub fn classify(
    doc: &SourceDocument,
    mode: ProcessingMode,
    lookup: &LookupTable,
    extractor: &IdentifierExtractor,
) -> (DriverBuckets, ProcessingReport) {
    let mut classifier = PageClassifier::new(lookup, extractor);
    classifier.classify_document(doc);
    let Classification { buckets, report, .. } = classifier.finish(mode);
    (buckets, report)
}
