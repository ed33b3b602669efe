//! OOXML extraction (DOCX and PPTX) via zip + quick-xml streaming.
//!
//! DOCX produces a single unit with paragraph breaks preserved; PPTX
//! produces one unit per slide, in slide order, with slide locators.

use async_trait::async_trait;
use std::io::Read;
use std::path::Path;

use crate::error::{EngineError, Result};
use crate::extract::Extractor;
use crate::models::{DocumentKind, ExtractedUnit, Locator, UnitMetadata};

/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb
/// protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

fn ooxml_err(e: impl std::fmt::Display) -> EngineError {
    EngineError::Extraction(format!("OOXML extraction failed: {}", e))
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn read_zip_entry_bounded(
    archive: &mut zip::ZipArchive<std::io::Cursor<Vec<u8>>>,
    name: &str,
) -> Result<Vec<u8>> {
    let entry = archive.by_name(name).map_err(ooxml_err)?;
    let mut out = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(ooxml_err)?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ooxml_err(format!(
            "ZIP entry {} exceeds size limit ({} bytes)",
            name, MAX_XML_ENTRY_BYTES
        )));
    }
    Ok(out)
}

/// Collect the text of all `t` elements, inserting a paragraph break at
/// the end of each `p` element.
fn extract_t_elements_with_breaks(xml: &[u8]) -> Result<String> {
    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                if e.local_name().as_ref() == b"t" {
                    if let Ok(quick_xml::events::Event::Text(te)) = reader.read_event_into(&mut buf)
                    {
                        out.push_str(te.unescape().unwrap_or_default().as_ref());
                    }
                }
            }
            Ok(quick_xml::events::Event::End(e)) => {
                if e.local_name().as_ref() == b"p" && !out.ends_with("\n\n") && !out.is_empty() {
                    out.push_str("\n\n");
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(ooxml_err(e)),
            _ => {}
        }
        buf.clear();
    }
    Ok(out.trim().to_string())
}

// ============ DOCX ============

pub struct DocxExtractor;

#[async_trait]
impl Extractor for DocxExtractor {
    fn kind(&self) -> DocumentKind {
        DocumentKind::Docx
    }

    async fn extract(&self, path: &Path) -> Result<Vec<ExtractedUnit>> {
        let bytes = tokio::fs::read(path).await?;
        let file_name = file_name_of(path);

        let text = tokio::task::spawn_blocking(move || -> Result<String> {
            let mut archive =
                zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(ooxml_err)?;
            let doc_xml = read_zip_entry_bounded(&mut archive, "word/document.xml")?;
            extract_t_elements_with_breaks(&doc_xml)
        })
        .await
        .map_err(ooxml_err)??;

        Ok(vec![ExtractedUnit::plain(text, file_name)])
    }
}

// ============ PPTX ============

pub struct PptxExtractor;

#[async_trait]
impl Extractor for PptxExtractor {
    fn kind(&self) -> DocumentKind {
        DocumentKind::Pptx
    }

    async fn extract(&self, path: &Path) -> Result<Vec<ExtractedUnit>> {
        let bytes = tokio::fs::read(path).await?;
        let file_name = file_name_of(path);

        let slides = tokio::task::spawn_blocking(move || -> Result<Vec<(u32, String)>> {
            let mut archive =
                zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(ooxml_err)?;

            let mut slide_names: Vec<(u32, String)> = archive
                .file_names()
                .filter(|n| n.starts_with("ppt/slides/slide") && n.ends_with(".xml"))
                .map(|name| {
                    let number = name
                        .trim_start_matches("ppt/slides/slide")
                        .trim_end_matches(".xml")
                        .parse::<u32>()
                        .unwrap_or(u32::MAX);
                    (number, name.to_string())
                })
                .collect();
            slide_names.sort_by_key(|(number, _)| *number);

            let mut slides = Vec::with_capacity(slide_names.len());
            for (number, name) in slide_names {
                let xml = read_zip_entry_bounded(&mut archive, &name)?;
                let text = extract_t_elements_with_breaks(&xml)?;
                slides.push((number, text));
            }
            Ok(slides)
        })
        .await
        .map_err(ooxml_err)??;

        Ok(slides
            .into_iter()
            .filter(|(_, text)| !text.is_empty())
            .map(|(number, text)| ExtractedUnit {
                text,
                metadata: UnitMetadata {
                    file_name: file_name.clone(),
                    locator: Some(Locator::Slide { number }),
                    summary: None,
                },
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_zip(path: &Path, entries: &[(&str, &str)]) {
        let file = std::fs::File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        for (name, content) in entries {
            zip.start_file(*name, options).unwrap();
            zip.write_all(content.as_bytes()).unwrap();
        }
        zip.finish().unwrap();
    }

    #[tokio::test]
    async fn docx_paragraphs_extracted_with_breaks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.docx");
        write_zip(
            &path,
            &[(
                "word/document.xml",
                r#"<w:document xmlns:w="ns"><w:body>
                    <w:p><w:r><w:t>First paragraph.</w:t></w:r></w:p>
                    <w:p><w:r><w:t>Second paragraph.</w:t></w:r></w:p>
                </w:body></w:document>"#,
            )],
        );

        let units = DocxExtractor.extract(&path).await.unwrap();
        assert_eq!(units.len(), 1);
        assert!(units[0].text.contains("First paragraph."));
        assert!(units[0].text.contains("\n\n"));
        assert!(units[0].text.contains("Second paragraph."));
    }

    #[tokio::test]
    async fn pptx_yields_one_unit_per_slide_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deck.pptx");
        write_zip(
            &path,
            &[
                (
                    "ppt/slides/slide2.xml",
                    r#"<p:sld xmlns:a="ns"><a:t>Slide two body</a:t></p:sld>"#,
                ),
                (
                    "ppt/slides/slide1.xml",
                    r#"<p:sld xmlns:a="ns"><a:t>Slide one body</a:t></p:sld>"#,
                ),
            ],
        );

        let units = PptxExtractor.extract(&path).await.unwrap();
        assert_eq!(units.len(), 2);
        assert!(units[0].text.contains("Slide one body"));
        assert_eq!(units[0].metadata.locator, Some(Locator::Slide { number: 1 }));
        assert!(units[1].text.contains("Slide two body"));
    }

    #[tokio::test]
    async fn invalid_zip_is_an_extraction_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.docx");
        std::fs::write(&path, b"not a zip").unwrap();

        let err = DocxExtractor.extract(&path).await.unwrap_err();
        assert!(matches!(err, EngineError::Extraction(_)));
    }

    #[tokio::test]
    async fn docx_without_document_xml_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.docx");
        write_zip(&path, &[("other.xml", "<x/>")]);

        let err = DocxExtractor.extract(&path).await.unwrap_err();
        assert!(matches!(err, EngineError::Extraction(_)));
    }
}
