//! File classification: maps an uploaded file to a [`DocumentKind`].
//!
//! Classification is a pure lookup and never fails. Extension matching comes
//! first, then MIME sniffing on the file name, then the generic fallback
//! (whose extraction provider emits a descriptive stub instead of erroring).

use std::path::Path;

use crate::models::DocumentKind;

const FLAT_TEXT_EXTENSIONS: &[&str] = &[
    "txt", "md", "markdown", "html", "htm", "csv", "tsv", "xml", "json", "yaml", "yml", "rst",
    "log",
];

const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "mkv", "avi", "webm", "m4v"];

pub fn classify(path: &Path) -> DocumentKind {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    if let Some(ext) = ext.as_deref() {
        match ext {
            "pdf" => return DocumentKind::Pdf,
            "docx" => return DocumentKind::Docx,
            "pptx" => return DocumentKind::Pptx,
            _ => {}
        }
        if FLAT_TEXT_EXTENSIONS.contains(&ext) {
            return DocumentKind::FlatText;
        }
        if VIDEO_EXTENSIONS.contains(&ext) {
            return DocumentKind::Video;
        }
    }

    // Extension unknown: let the MIME table have a say before giving up
    let guess = mime_guess::from_path(path).first();
    if let Some(mime) = guess {
        if mime.type_() == mime_guess::mime::TEXT {
            return DocumentKind::FlatText;
        }
        if mime.type_() == mime_guess::mime::VIDEO {
            return DocumentKind::Video;
        }
    }

    DocumentKind::Generic
}
