//! Flat text extraction (txt, md, html, csv, and friends).

use async_trait::async_trait;
use std::path::Path;

use crate::error::Result;
use crate::extract::Extractor;
use crate::models::{DocumentKind, ExtractedUnit};

pub struct FlatTextExtractor;

#[async_trait]
impl Extractor for FlatTextExtractor {
    fn kind(&self) -> DocumentKind {
        DocumentKind::FlatText
    }

    async fn extract(&self, path: &Path) -> Result<Vec<ExtractedUnit>> {
        let bytes = tokio::fs::read(path).await?;
        // Tolerate stray non-UTF8 bytes rather than failing the document
        let text = String::from_utf8_lossy(&bytes).into_owned();

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        Ok(vec![ExtractedUnit::plain(text, file_name)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn reads_plain_text() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("note.txt");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(b"Alpha. Beta. Gamma.").unwrap();

        let units = FlatTextExtractor.extract(&path).await.unwrap();
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].text, "Alpha. Beta. Gamma.");
        assert_eq!(units[0].metadata.file_name, "note.txt");
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.txt");
        assert!(FlatTextExtractor.extract(&path).await.is_err());
    }
}
