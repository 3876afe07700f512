//! Format-specific text extraction.
//!
//! Parsing is synchronous and CPU bound; callers run it on the blocking pool. Output is a list
//! of [`DocumentUnit`]s in reading order. Direct mode returns one unit per natural block of
//! the format (a row, a paragraph run, the whole text). Enriched mode, used for PDF, Word,
//! and HTML, keeps page-level layout units and appends OCR text for embedded images.

mod docx;
mod html;
mod legacy;
pub mod ocr;
mod pdf;
mod text;

pub use ocr::{OcrEngine, TesseractOcr};

use std::sync::Arc;
use thiserror::Error;

/// Errors raised while extracting text from a document.
#[derive(Debug, Error)]
pub enum ParseError {
    /// No parser is registered for the MIME type.
    #[error("Unsupported document type: {0}")]
    Unsupported(String),
    /// Bytes did not form a valid document of the declared type.
    #[error("Malformed {format} document: {message}")]
    Malformed {
        /// Format that failed to parse.
        format: &'static str,
        /// Parser diagnostic.
        message: String,
    },
    /// OCR engine failed.
    #[error("OCR failed: {0}")]
    Ocr(String),
}

impl ParseError {
    pub(crate) fn malformed(format: &'static str, message: impl ToString) -> Self {
        Self::Malformed {
            format,
            message: message.to_string(),
        }
    }
}

/// Parser selected for a MIME type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentFormat {
    /// `application/pdf`.
    Pdf,
    /// Office Open XML word processing document.
    Docx,
    /// Binary `application/msword` document.
    LegacyWord,
    /// `text/plain`.
    PlainText,
    /// `text/markdown`.
    Markdown,
    /// `text/csv`.
    Csv,
    /// `application/json`.
    Json,
    /// `application/xml` or `text/xml`.
    Xml,
    /// `text/html`.
    Html,
    /// No parser registered; carries the offending MIME type.
    Unsupported(String),
}

impl DocumentFormat {
    /// Resolve the parser for a MIME type. Parameters such as `; charset=utf-8` are ignored.
    pub fn from_mime(mime: &str) -> Self {
        let essence = mime
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        match essence.as_str() {
            "application/pdf" => Self::Pdf,
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => {
                Self::Docx
            }
            "application/msword" => Self::LegacyWord,
            "text/plain" => Self::PlainText,
            "text/markdown" | "text/x-markdown" => Self::Markdown,
            "text/csv" => Self::Csv,
            "application/json" => Self::Json,
            "application/xml" | "text/xml" => Self::Xml,
            "text/html" | "application/xhtml+xml" => Self::Html,
            _ => Self::Unsupported(essence),
        }
    }

    /// Formats parsed in enriched mode (layout units plus OCR).
    pub fn is_enriched(&self) -> bool {
        matches!(
            self,
            Self::Pdf | Self::Docx | Self::LegacyWord | Self::Html
        )
    }

    /// Short lowercase label for logs.
    pub fn label(&self) -> &str {
        match self {
            Self::Pdf => "pdf",
            Self::Docx => "docx",
            Self::LegacyWord => "doc",
            Self::PlainText => "text",
            Self::Markdown => "markdown",
            Self::Csv => "csv",
            Self::Json => "json",
            Self::Xml => "xml",
            Self::Html => "html",
            Self::Unsupported(mime) => mime.as_str(),
        }
    }
}

/// Where a unit of text came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKind {
    /// Body text.
    Text,
    /// Text recognized from an embedded image.
    ImageText,
    /// One structured record (CSV row, flattened JSON entry).
    Record,
}

/// A block of extracted text in reading order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentUnit {
    /// Extracted text.
    pub text: String,
    /// 1-based page, when the format has pages.
    pub page: Option<u32>,
    /// Origin of the text.
    pub kind: UnitKind,
}

impl DocumentUnit {
    pub(crate) fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            page: None,
            kind: UnitKind::Text,
        }
    }

    pub(crate) fn page(text: impl Into<String>, page: u32) -> Self {
        Self {
            text: text.into(),
            page: Some(page),
            kind: UnitKind::Text,
        }
    }

    pub(crate) fn image_text(text: impl Into<String>, page: Option<u32>) -> Self {
        Self {
            text: text.into(),
            page,
            kind: UnitKind::ImageText,
        }
    }

    pub(crate) fn record(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            page: None,
            kind: UnitKind::Record,
        }
    }
}

/// Options controlling extraction.
#[derive(Clone, Default)]
pub struct ParseOptions {
    /// Engine used to read text from embedded images in enriched mode.
    pub ocr: Option<Arc<dyn OcrEngine>>,
}

/// Extract text units from `bytes` using the parser for `format`.
pub fn parse_document(
    format: &DocumentFormat,
    bytes: &[u8],
    options: &ParseOptions,
) -> Result<Vec<DocumentUnit>, ParseError> {
    let ocr = if format.is_enriched() {
        options.ocr.as_deref()
    } else {
        None
    };

    let units = match format {
        DocumentFormat::Pdf => pdf::parse(bytes, ocr)?,
        DocumentFormat::Docx => docx::parse(bytes, ocr)?,
        DocumentFormat::LegacyWord => legacy::parse(bytes),
        DocumentFormat::PlainText | DocumentFormat::Markdown => text::parse_plain(bytes),
        DocumentFormat::Csv => text::parse_csv(bytes)?,
        DocumentFormat::Json => text::parse_json(bytes)?,
        DocumentFormat::Xml => text::parse_xml(bytes)?,
        DocumentFormat::Html => html::parse(bytes),
        DocumentFormat::Unsupported(mime) => return Err(ParseError::Unsupported(mime.clone())),
    };

    Ok(units
        .into_iter()
        .filter(|unit| !unit.text.trim().is_empty())
        .collect())
}

/// Join units into one text, separating blocks with blank lines.
pub fn join_units(units: &[DocumentUnit]) -> String {
    units
        .iter()
        .map(|unit| unit.text.trim())
        .filter(|text| !text.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Infer a MIME type from a filename extension.
///
/// Unknown extensions map to `application/octet-stream`, which [`DocumentFormat::from_mime`]
/// treats as unsupported.
pub fn mime_from_extension(ext: &str) -> &'static str {
    mime_guess::from_ext(ext.trim().trim_start_matches('.'))
        .first_raw()
        .unwrap_or("application/octet-stream")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_mime_ignores_parameters_and_case() {
        assert_eq!(
            DocumentFormat::from_mime("Text/Plain; charset=UTF-8"),
            DocumentFormat::PlainText
        );
        assert_eq!(
            DocumentFormat::from_mime("application/msword"),
            DocumentFormat::LegacyWord
        );
        assert_eq!(
            DocumentFormat::from_mime("application/x-rar"),
            DocumentFormat::Unsupported("application/x-rar".into())
        );
    }

    #[test]
    fn enriched_mode_covers_layout_formats_only() {
        assert!(DocumentFormat::Pdf.is_enriched());
        assert!(DocumentFormat::Docx.is_enriched());
        assert!(DocumentFormat::LegacyWord.is_enriched());
        assert!(DocumentFormat::Html.is_enriched());
        assert!(!DocumentFormat::Csv.is_enriched());
        assert!(!DocumentFormat::PlainText.is_enriched());
    }

    #[test]
    fn unsupported_format_is_an_error() {
        let error = parse_document(
            &DocumentFormat::Unsupported("application/zip".into()),
            b"PK",
            &ParseOptions::default(),
        )
        .expect_err("unsupported");
        assert!(matches!(error, ParseError::Unsupported(mime) if mime == "application/zip"));
    }

    #[test]
    fn whitespace_units_are_dropped() {
        let units = parse_document(
            &DocumentFormat::PlainText,
            b"   \n\t  ",
            &ParseOptions::default(),
        )
        .expect("parse");
        assert!(units.is_empty());
    }

    #[test]
    fn mime_inference_falls_back_to_octet_stream() {
        assert_eq!(mime_from_extension("PDF"), "application/pdf");
        assert_eq!(mime_from_extension(".jpeg"), "image/jpeg");
        assert_eq!(mime_from_extension("kbxq"), "application/octet-stream");
        assert_eq!(mime_from_extension(""), "application/octet-stream");
    }

    #[test]
    fn inferred_mime_types_reach_their_parsers() {
        let cases = [
            ("docx", DocumentFormat::Docx),
            ("doc", DocumentFormat::LegacyWord),
            ("txt", DocumentFormat::PlainText),
            ("md", DocumentFormat::Markdown),
            ("csv", DocumentFormat::Csv),
            ("json", DocumentFormat::Json),
            ("xml", DocumentFormat::Xml),
            ("html", DocumentFormat::Html),
        ];
        for (ext, format) in cases {
            assert_eq!(DocumentFormat::from_mime(mime_from_extension(ext)), format, "{ext}");
        }
        assert!(mime_from_extension("png").starts_with("image/"));
    }

    #[test]
    fn join_units_separates_blocks() {
        let units = vec![DocumentUnit::text(" first "), DocumentUnit::record("second")];
        assert_eq!(join_units(&units), "first\n\nsecond");
    }
}
