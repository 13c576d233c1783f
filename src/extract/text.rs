use super::{ExtractionMethod, ExtractionStage, IdentifierPattern, OrderIdentifier};
use crate::document::SourceDocument;
use tracing::debug;

/// Scans the page's embedded text layer.
pub struct TextLayerStage;

impl ExtractionStage for TextLayerStage {
    fn method(&self) -> ExtractionMethod {
        ExtractionMethod::TextLayer
    }

    fn try_extract(
        &self,
        doc: &SourceDocument,
        page: usize,
        pattern: &IdentifierPattern,
    ) -> Option<OrderIdentifier> {
        let text = doc.page_text(page);
        if text.trim().is_empty() {
            debug!(page, "Empty text layer");
            return None;
        }

        let found = pattern.find(text);
        if found.is_none() {
            let preview: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
            let preview: String = preview.chars().take(120).collect();
            debug!(page, preview = %preview, "No identifier in text layer");
        }
        found
    }
}
