// src/extract/mod.rs

mod ocr;
mod text;

pub use ocr::{OcrEngine, OcrStage, TesseractCli};
pub use text::TextLayerStage;

use crate::document::{PageRasterizer, SourceDocument};
use crate::error::ConfigError;
use regex::{Regex, RegexBuilder};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Canonical order identifier: trimmed and upper-cased.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct OrderIdentifier(String);

impl OrderIdentifier {
    /// Normalise a raw token. Blank input has no identifier.
    pub fn normalize(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_uppercase()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OrderIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The configured shape of an order identifier, always matched case-insensitively.
#[derive(Debug, Clone)]
pub struct IdentifierPattern {
    source: String,
    regex: Regex,
}

impl IdentifierPattern {
    pub fn new(pattern: &str) -> Result<Self, ConfigError> {
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|source| ConfigError::Pattern {
                pattern: pattern.to_string(),
                source,
            })?;
        Ok(Self {
            source: pattern.to_string(),
            regex,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// First match in scan order, normalised.
    pub fn find(&self, text: &str) -> Option<OrderIdentifier> {
        self.regex
            .find_iter(text)
            .find_map(|m| OrderIdentifier::normalize(m.as_str()))
    }
}

/// Which stage produced an identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    TextLayer,
    Ocr,
}

/// One way of reading an identifier off a page. A miss is `None`, never an error.
pub trait ExtractionStage: Send + Sync {
    fn method(&self) -> ExtractionMethod;

    fn try_extract(
        &self,
        doc: &SourceDocument,
        page: usize,
        pattern: &IdentifierPattern,
    ) -> Option<OrderIdentifier>;
}

/// Successful extraction together with the stage that found it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extraction {
    pub identifier: OrderIdentifier,
    pub method: ExtractionMethod,
}

/// Text layer first, OCR only when the text layer has no match.
pub struct IdentifierExtractor {
    pattern: IdentifierPattern,
    text: TextLayerStage,
    ocr: OcrStage,
}

impl IdentifierExtractor {
    pub fn new(
        pattern: IdentifierPattern,
        dpi: u32,
        rasterizer: Arc<dyn PageRasterizer>,
        engine: Arc<dyn OcrEngine>,
    ) -> Self {
        Self {
            pattern,
            text: TextLayerStage,
            ocr: OcrStage::new(dpi, rasterizer, engine),
        }
    }

    pub fn extract(&self, doc: &SourceDocument, page: usize) -> Option<OrderIdentifier> {
        self.extract_with_method(doc, page).map(|e| e.identifier)
    }

    pub fn extract_with_method(&self, doc: &SourceDocument, page: usize) -> Option<Extraction> {
        let stages: [&dyn ExtractionStage; 2] = [&self.text, &self.ocr];
        stages.iter().find_map(|stage| {
            stage
                .try_extract(doc, page, &self.pattern)
                .map(|identifier| Extraction {
                    identifier,
                    method: stage.method(),
                })
        })
    }
}
