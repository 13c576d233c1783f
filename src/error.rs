use std::path::PathBuf;

use thiserror::Error;

/// A source PDF could not be opened. Fatal for that document only.
#[derive(Error, Debug)]
pub enum DocumentOpenError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path} is not a valid PDF: {reason}")]
    InvalidPdf { path: PathBuf, reason: String },

    #[error("{path} contains no pages")]
    NoPages { path: PathBuf },
}

/// Rendering a page to an image failed.
#[derive(Error, Debug)]
pub enum RasterError {
    #[error("page {page} out of range (document has {count} pages)")]
    PageOutOfRange { page: usize, count: usize },

    #[error("rasterizer I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("rasterizer failed: {0}")]
    Render(String),
}

/// The OCR engine could not produce text for an image.
#[derive(Error, Debug)]
pub enum OcrError {
    #[error("OCR I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("OCR engine failed: {0}")]
    Engine(String),
}

/// Writing one driver's output document failed.
#[derive(Error, Debug)]
pub enum WriteError {
    #[error("cannot create output directory {path}: {source}")]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("page {page} of {document} could not be copied: {reason}")]
    PageCopy {
        document: String,
        page: usize,
        reason: String,
    },

    #[error("no pages could be added to {path}")]
    Empty { path: PathBuf },

    #[error("failed to save {path}: {reason}")]
    Save { path: PathBuf, reason: String },
}

/// Invalid configuration, raised when the config is built.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid identifier pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("OCR DPI {0} outside supported range 72..=1200")]
    Dpi(u32),

    #[error("worker count must be at least 1")]
    Workers,

    #[error("unknown processing mode {0:?} (expected \"route\" or \"picking\")")]
    Mode(String),
}

/// Errors loading the delivery-sequence lookup data.
#[derive(Error, Debug)]
pub enum LookupError {
    #[error("failed to read lookup file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed lookup data: {0}")]
    Json(#[from] serde_json::Error),
}

/// Run-level failures. Everything finer grained ends up in the report.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("none of the {0} input documents could be opened")]
    NoDocuments(usize),

    #[error("failed to start extraction worker pool: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),
}
