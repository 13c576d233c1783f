//! Splits batches of delivery and picking PDFs into one document per driver.
//!
//! Each page's order id is read from the text layer, or through OCR when the
//! text layer has none, then resolved against delivery-sequence data.

pub mod assemble;
pub mod config;
pub mod document;
pub mod error;
pub mod extract;
pub mod grouper;
pub mod lookup;
pub mod pipeline;
pub mod report;
pub mod store;

pub use config::{Config, ProcessingMode, SorterConfig};
pub use extract::{IdentifierExtractor, IdentifierPattern, OrderIdentifier};
pub use lookup::LookupTable;
pub use pipeline::{CancelFlag, Pipeline};
pub use report::ProcessingReport;
