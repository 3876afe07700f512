//! Optical character recognition for images embedded in documents.

use super::ParseError;
use std::io::Write;
use std::process::Command;
use tempfile::NamedTempFile;

/// Synchronous OCR engine. Called from the blocking pool during parsing.
pub trait OcrEngine: Send + Sync {
    /// Recognize text in an encoded image (JPEG, PNG, ...).
    fn recognize(&self, image: &[u8]) -> Result<String, ParseError>;
}

/// OCR through the `tesseract` command line tool.
#[derive(Debug, Clone)]
pub struct TesseractOcr {
    binary: String,
    languages: String,
}

impl TesseractOcr {
    /// Use `binary` with the `+`-joined language set (e.g. `chi_sim+eng`).
    pub fn new(binary: impl Into<String>, languages: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            languages: languages.into(),
        }
    }
}

impl OcrEngine for TesseractOcr {
    fn recognize(&self, image: &[u8]) -> Result<String, ParseError> {
        let mut input = NamedTempFile::new().map_err(|err| ParseError::Ocr(err.to_string()))?;
        input
            .write_all(image)
            .and_then(|()| input.flush())
            .map_err(|err| ParseError::Ocr(err.to_string()))?;

        // `stdout` as the output base prints recognized text instead of writing a file.
        let output = Command::new(&self.binary)
            .arg(input.path())
            .arg("stdout")
            .arg("-l")
            .arg(&self.languages)
            .output()
            .map_err(|err| ParseError::Ocr(format!("failed to run {}: {err}", self.binary)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ParseError::Ocr(format!(
                "{} exited with {}: {}",
                self.binary,
                output.status,
                stderr.trim()
            )));
        }

        let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
        tracing::debug!(
            languages = %self.languages,
            bytes = image.len(),
            chars = text.chars().count(),
            "OCR completed"
        );
        Ok(text)
    }
}

/// Run OCR over `images`, skipping failures. Returns recognized non-empty texts in order.
pub(crate) fn recognize_all<'a>(
    engine: &dyn OcrEngine,
    images: impl IntoIterator<Item = &'a [u8]>,
) -> Vec<String> {
    images
        .into_iter()
        .filter_map(|image| match engine.recognize(image) {
            Ok(text) if !text.trim().is_empty() => Some(text),
            Ok(_) => None,
            Err(error) => {
                tracing::warn!(error = %error, "Skipping image after OCR failure");
                None
            }
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Returns a fixed string per call, failing for images that start with `b"bad"`.
    pub(crate) struct FixedOcr(pub &'static str);

    impl OcrEngine for FixedOcr {
        fn recognize(&self, image: &[u8]) -> Result<String, ParseError> {
            if image.starts_with(b"bad") {
                Err(ParseError::Ocr("unreadable".into()))
            } else {
                Ok(self.0.to_string())
            }
        }
    }

    #[test]
    fn recognize_all_skips_failures_and_blank_results() {
        let engine = FixedOcr("label text");
        let images = vec![b"good".as_slice(), b"bad image".as_slice(), b"also good".as_slice()];
        let texts = recognize_all(&engine, images);
        assert_eq!(texts, vec!["label text", "label text"]);

        let blank = FixedOcr("   ");
        assert!(recognize_all(&blank, vec![b"x".as_slice()]).is_empty());
    }

    #[test]
    fn missing_binary_reports_ocr_error() {
        let engine = TesseractOcr::new("/nonexistent/tesseract-binary", "eng");
        let error = engine.recognize(b"\xff\xd8\xff").expect_err("missing binary");
        assert!(matches!(error, ParseError::Ocr(_)));
    }
}
