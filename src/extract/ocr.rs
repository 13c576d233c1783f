use super::{ExtractionMethod, ExtractionStage, IdentifierPattern, OrderIdentifier};
use crate::document::{PageRasterizer, RasterImage, SourceDocument};
use crate::error::OcrError;
use std::fs;
use std::process::Command;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Turns a rendered page into plain text.
pub trait OcrEngine: Send + Sync {
    fn recognize(&self, image: &RasterImage) -> Result<String, OcrError>;
}

/// The `tesseract` command-line tool.
pub struct TesseractCli {
    binary: String,
    language: String,
}

impl TesseractCli {
    pub fn new(binary: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            language: language.into(),
        }
    }
}

impl Default for TesseractCli {
    fn default() -> Self {
        Self::new("tesseract", "eng")
    }
}

impl OcrEngine for TesseractCli {
    fn recognize(&self, image: &RasterImage) -> Result<String, OcrError> {
        let scratch = tempfile::Builder::new().prefix("ocr_").tempdir()?;
        let img_path = scratch.path().join(format!("page-{}.png", image.page));
        fs::write(&img_path, &image.png)?;

        let output = Command::new(&self.binary)
            .arg(&img_path)
            .arg("stdout")
            .arg("-l")
            .arg(&self.language)
            .output()?;

        if !output.status.success() {
            return Err(OcrError::Engine(format!(
                "{} exited with {}: {}",
                self.binary,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).replace('\x0c', ""))
    }
}

/// Rasterises the page and scans the OCR output.
pub struct OcrStage {
    dpi: u32,
    rasterizer: Arc<dyn PageRasterizer>,
    engine: Arc<dyn OcrEngine>,
}

impl OcrStage {
    pub fn new(dpi: u32, rasterizer: Arc<dyn PageRasterizer>, engine: Arc<dyn OcrEngine>) -> Self {
        Self {
            dpi,
            rasterizer,
            engine,
        }
    }
}

impl ExtractionStage for OcrStage {
    fn method(&self) -> ExtractionMethod {
        ExtractionMethod::Ocr
    }

    fn try_extract(
        &self,
        doc: &SourceDocument,
        page: usize,
        pattern: &IdentifierPattern,
    ) -> Option<OrderIdentifier> {
        let image = match doc.rasterize(page, self.dpi, self.rasterizer.as_ref()) {
            Ok(image) => image,
            Err(e) => {
                warn!(page, error = %e, "Rasterization failed, treating page as unmatched");
                return None;
            }
        };

        let text = match self.engine.recognize(&image) {
            Ok(text) => text,
            Err(e) => {
                warn!(page, error = %e, "OCR failed, treating page as unmatched");
                return None;
            }
        };

        info!(page, chars = text.len(), "Used OCR");
        let found = pattern.find(&text);
        if found.is_none() {
            debug!(page, "No identifier in OCR text");
        }
        found
    }
}
