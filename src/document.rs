// src/document.rs

use crate::error::{DocumentOpenError, RasterError};
use lopdf::{Document, ObjectId};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info, warn};

/// A loaded source PDF. Immutable once loaded.
#[derive(Debug)]
pub struct SourceDocument {
    path: PathBuf,
    bytes: Vec<u8>,
    pdf: Document,
    page_ids: Vec<ObjectId>,
    texts: Vec<String>,
}

/// A page rendered to PNG for the OCR fallback.
#[derive(Debug, Clone)]
pub struct RasterImage {
    /// 1-based page index the image was rendered from.
    pub page: usize,
    pub dpi: u32,
    pub png: Vec<u8>,
}

impl SourceDocument {
    /// Open a PDF from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, DocumentOpenError> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(|source| DocumentOpenError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_bytes(path, bytes)
    }

    /// Build a document from bytes already in memory; `path` is used for naming.
    pub fn from_bytes(path: impl AsRef<Path>, bytes: Vec<u8>) -> Result<Self, DocumentOpenError> {
        let path = path.as_ref().to_path_buf();
        let pdf = Document::load_mem(&bytes).map_err(|e| DocumentOpenError::InvalidPdf {
            path: path.clone(),
            reason: e.to_string(),
        })?;

        let pages = pdf.get_pages();
        if pages.is_empty() {
            return Err(DocumentOpenError::NoPages { path });
        }
        let page_ids: Vec<ObjectId> = pages.values().copied().collect();
        let texts = extract_page_texts(&pdf, &bytes, &pages);

        let image_only = page_ids
            .iter()
            .filter(|id| looks_like_scanned_page(&pdf, **id))
            .count();
        info!(
            file = %path.display(),
            pages = page_ids.len(),
            image_only,
            "Loaded source document"
        );

        Ok(Self {
            path,
            bytes,
            pdf,
            page_ids,
            texts,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File name used in logs, reports and barcode records.
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn pdf(&self) -> &Document {
        &self.pdf
    }

    pub fn page_count(&self) -> usize {
        self.page_ids.len()
    }

    /// Embedded text layer of a 1-based page; empty when there is none.
    pub fn page_text(&self, page: usize) -> &str {
        page.checked_sub(1)
            .and_then(|i| self.texts.get(i))
            .map(String::as_str)
            .unwrap_or("")
    }

    /// Render a 1-based page through `rasterizer`. Nothing is cached.
    pub fn rasterize(
        &self,
        page: usize,
        dpi: u32,
        rasterizer: &dyn PageRasterizer,
    ) -> Result<RasterImage, RasterError> {
        if page == 0 || page > self.page_count() {
            return Err(RasterError::PageOutOfRange {
                page,
                count: self.page_count(),
            });
        }
        rasterizer.rasterize(self, page, dpi)
    }
}

/// Pull the text layer for every page. `pdf-extract` first, lopdf's own
/// extractor when `pdf-extract` rejects the file or disagrees on page count.
fn extract_page_texts(
    pdf: &Document,
    bytes: &[u8],
    pages: &std::collections::BTreeMap<u32, ObjectId>,
) -> Vec<String> {
    match pdf_extract::extract_text_from_mem_by_pages(bytes) {
        Ok(texts) if texts.len() == pages.len() => return texts,
        Ok(texts) => {
            warn!(
                extracted = texts.len(),
                expected = pages.len(),
                "pdf-extract page count mismatch, falling back to lopdf"
            );
        }
        Err(e) => {
            warn!(error = %e, "pdf-extract failed, falling back to lopdf");
        }
    }

    pages
        .keys()
        .map(|&number| {
            pdf.extract_text(&[number]).unwrap_or_else(|e| {
                debug!(page = number, error = %e, "No text layer");
                String::new()
            })
        })
        .collect()
}

/// A page with image XObjects but no font resources is almost certainly a scan.
fn looks_like_scanned_page(doc: &Document, page_id: ObjectId) -> bool {
    let Ok(page_obj) = doc.get_object(page_id) else {
        return false;
    };
    let Some(page_dict) = page_obj.as_dict().ok() else {
        return false;
    };

    let resource = |key: &[u8]| {
        page_dict
            .get(b"Resources")
            .ok()
            .and_then(|r| doc.dereference(r).ok())
            .and_then(|(_, resolved)| resolved.as_dict().ok())
            .and_then(|res| res.get(key).ok())
            .and_then(|x| doc.dereference(x).ok())
            .and_then(|(_, resolved)| resolved.as_dict().ok())
            .is_some_and(|d| !d.is_empty())
    };

    resource(b"XObject") && !resource(b"Font")
}

/// Renders single pages to PNG.
pub trait PageRasterizer: Send + Sync {
    fn rasterize(
        &self,
        doc: &SourceDocument,
        page: usize,
        dpi: u32,
    ) -> Result<RasterImage, RasterError>;
}

/// Poppler's `pdftoppm`, one page per invocation.
pub struct Pdftoppm {
    binary: String,
}

impl Pdftoppm {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Default for Pdftoppm {
    fn default() -> Self {
        Self::new("pdftoppm")
    }
}

impl PageRasterizer for Pdftoppm {
    fn rasterize(
        &self,
        doc: &SourceDocument,
        page: usize,
        dpi: u32,
    ) -> Result<RasterImage, RasterError> {
        let scratch = tempfile::Builder::new().prefix("raster_").tempdir()?;

        // Documents built from memory may not exist on disk.
        let input = if doc.path().is_file() {
            doc.path().to_path_buf()
        } else {
            let copy = scratch.path().join("source.pdf");
            fs::write(&copy, doc.bytes())?;
            copy
        };

        let prefix = scratch.path().join("page");
        let output = Command::new(&self.binary)
            .arg("-r")
            .arg(dpi.to_string())
            .arg("-f")
            .arg(page.to_string())
            .arg("-l")
            .arg(page.to_string())
            .arg("-png")
            .arg("-singlefile")
            .arg(&input)
            .arg(&prefix)
            .output()?;

        if !output.status.success() {
            return Err(RasterError::Render(format!(
                "{} exited with {}: {}",
                self.binary,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let png = fs::read(prefix.with_extension("png"))?;
        if png.is_empty() {
            return Err(RasterError::Render("empty image".into()));
        }
        debug!(page, dpi, bytes = png.len(), "Rasterized page");
        Ok(RasterImage { page, dpi, png })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use lopdf::dictionary;
    use lopdf::{Object, Stream};

    /// Build a PDF with one Helvetica text line per page. An empty string
    /// gives a page with no text operators at all.
    pub(crate) fn make_pdf(page_texts: &[&str]) -> Vec<u8> {
        let mut doc = Document::with_version("1.4");
        let pages_id = doc.new_object_id();

        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Helvetica",
        });

        let mut kids: Vec<Object> = Vec::new();
        for (i, text) in page_texts.iter().enumerate() {
            let content = if text.is_empty() {
                "q Q".to_string()
            } else {
                format!("BT /F1 12 Tf 72 700 Td ({text}) Tj ET")
            };
            let content_id = doc.add_object(Stream::new(dictionary! {}, content.into_bytes()));
            let page_id = doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "TestMark" => (i + 1) as i64,
                "Contents" => content_id,
                "Resources" => dictionary! {
                    "Font" => dictionary! { "F1" => font_id },
                },
            });
            kids.push(page_id.into());
        }

        // MediaBox inherited from the page tree root.
        let count = kids.len() as i64;
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => count,
                "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
            }),
        );

        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);

        let mut buf = Vec::new();
        doc.save_to(&mut buf).unwrap();
        buf
    }

    /// Original 1-based page number stamped into each generated page.
    pub(crate) fn page_marker(doc: &Document, page_id: ObjectId) -> usize {
        doc.get_object(page_id)
            .and_then(Object::as_dict)
            .and_then(|d| d.get(b"TestMark"))
            .and_then(Object::as_i64)
            .unwrap() as usize
    }

    #[test]
    fn test_garbage_bytes() {
        let result = SourceDocument::from_bytes("junk.pdf", b"this is not a pdf".to_vec());
        assert!(matches!(result, Err(DocumentOpenError::InvalidPdf { .. })));
    }

    #[test]
    fn test_missing_file() {
        let result = SourceDocument::load("/definitely/not/here.pdf");
        assert!(matches!(result, Err(DocumentOpenError::Io { .. })));
    }

    #[test]
    fn test_page_count_and_text() {
        let bytes = make_pdf(&["Order No A060JR7", "", "Order No B900ZZ1"]);
        let doc = SourceDocument::from_bytes("run.pdf", bytes).unwrap();

        assert_eq!(doc.page_count(), 3);
        assert_eq!(doc.name(), "run.pdf");
        assert!(doc.page_text(1).contains("A060JR7"));
        assert!(doc.page_text(2).trim().is_empty());
        assert!(doc.page_text(3).contains("B900ZZ1"));
        // Out of range is empty, never a panic.
        assert_eq!(doc.page_text(0), "");
        assert_eq!(doc.page_text(4), "");
    }

    #[test]
    fn test_rasterize_rejects_out_of_range() {
        struct Never;
        impl PageRasterizer for Never {
            fn rasterize(&self, _: &SourceDocument, _: usize, _: u32) -> Result<RasterImage, RasterError> {
                panic!("should not be called");
            }
        }

        let doc = SourceDocument::from_bytes("one.pdf", make_pdf(&["x"])).unwrap();
        let err = doc.rasterize(2, 300, &Never).unwrap_err();
        assert!(matches!(err, RasterError::PageOutOfRange { page: 2, count: 1 }));
    }
}
