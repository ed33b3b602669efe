//! Extraction provider registry.
//!
//! Each [`Extractor`] converts one [`DocumentKind`] into ordered
//! [`ExtractedUnit`]s. Providers are registered once at startup in an
//! [`ExtractorRegistry`] and looked up by kind during ingestion; a kind
//! without a provider falls back to the generic stub extractor, which
//! describes the file instead of failing.

mod ooxml;
mod pdf;
mod text;
mod video;

pub use ooxml::{DocxExtractor, PptxExtractor};
pub use pdf::PdfExtractor;
pub use text::FlatTextExtractor;
pub use video::{HttpOutliner, HttpSpeechToText, Outliner, OutlineSection, SpeechToText,
    TranscriptSegment, VideoExtractor};

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;

use crate::config::MediaConfig;
use crate::error::Result;
use crate::models::{DocumentKind, ExtractedUnit, UnitMetadata};

/// A content extraction provider for one document kind.
#[async_trait]
pub trait Extractor: Send + Sync {
    fn kind(&self) -> DocumentKind;

    /// Extract ordered text units from the file. Implementations return
    /// [`EngineError::Extraction`](crate::error::EngineError::Extraction)
    /// for unreadable or malformed content.
    async fn extract(&self, path: &Path) -> Result<Vec<ExtractedUnit>>;
}

/// Kind-keyed provider registry with a generic fallback. Built once at
/// startup and shared by reference; O(1) lookup.
pub struct ExtractorRegistry {
    providers: HashMap<DocumentKind, Box<dyn Extractor>>,
    fallback: GenericExtractor,
}

impl ExtractorRegistry {
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
            fallback: GenericExtractor,
        }
    }

    /// Registry with all built-in providers.
    pub fn with_defaults(media: &MediaConfig) -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(FlatTextExtractor));
        registry.register(Box::new(PdfExtractor));
        registry.register(Box::new(DocxExtractor));
        registry.register(Box::new(PptxExtractor));
        registry.register(Box::new(VideoExtractor::from_config(media)));
        registry
    }

    /// Register a provider, replacing any existing one for the same kind.
    pub fn register(&mut self, extractor: Box<dyn Extractor>) {
        self.providers.insert(extractor.kind(), extractor);
    }

    /// Provider for a kind; the generic stub extractor when none is
    /// registered.
    pub fn find(&self, kind: DocumentKind) -> &dyn Extractor {
        self.providers
            .get(&kind)
            .map(|b| b.as_ref())
            .unwrap_or(&self.fallback)
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

impl Default for ExtractorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Fallback provider for unknown kinds. Emits a single descriptive unit
/// (name, size, mtime) so the document still produces one indexable chunk.
pub struct GenericExtractor;

#[async_trait]
impl Extractor for GenericExtractor {
    fn kind(&self) -> DocumentKind {
        DocumentKind::Generic
    }

    async fn extract(&self, path: &Path) -> Result<Vec<ExtractedUnit>> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        let meta = tokio::fs::metadata(path).await?;
        let modified = meta
            .modified()
            .ok()
            .map(chrono::DateTime::<chrono::Utc>::from)
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "unknown".to_string());

        let text = format!(
            "File '{}' ({} bytes, modified {}). Content could not be interpreted; \
             only this descriptive record is indexed.",
            file_name,
            meta.len(),
            modified
        );

        Ok(vec![ExtractedUnit {
            text,
            metadata: UnitMetadata {
                file_name,
                locator: None,
                summary: Some("unsupported file format".to_string()),
            },
        }])
    }
}
