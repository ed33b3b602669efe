//! PDF text extraction via `pdf-extract`.
//!
//! Extraction is CPU-bound, so it runs on the blocking pool.

use async_trait::async_trait;
use std::path::Path;

use crate::error::{EngineError, Result};
use crate::extract::Extractor;
use crate::models::{DocumentKind, ExtractedUnit};

pub struct PdfExtractor;

#[async_trait]
impl Extractor for PdfExtractor {
    fn kind(&self) -> DocumentKind {
        DocumentKind::Pdf
    }

    async fn extract(&self, path: &Path) -> Result<Vec<ExtractedUnit>> {
        let bytes = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let text = tokio::task::spawn_blocking(move || {
            pdf_extract::extract_text_from_mem(&bytes)
                .map_err(|e| EngineError::Extraction(format!("PDF extraction failed: {}", e)))
        })
        .await
        .map_err(|e| EngineError::Extraction(format!("PDF extraction task failed: {}", e)))??;

        Ok(vec![ExtractedUnit::plain(text, file_name)])
    }
}
