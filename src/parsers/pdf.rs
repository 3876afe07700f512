//! PDF text via pdf-extract, embedded JPEG images via lopdf.

use super::ocr::{OcrEngine, recognize_all};
use super::{DocumentUnit, ParseError};
use lopdf::Document;

const MAX_IMAGES: usize = 100;
const MIN_DIMENSION: i64 = 50;

/// Parse one unit per page. With an OCR engine, image text follows its page's text.
pub(super) fn parse(
    bytes: &[u8],
    ocr: Option<&dyn OcrEngine>,
) -> Result<Vec<DocumentUnit>, ParseError> {
    let pages = match pdf_extract::extract_text_from_mem_by_pages(bytes) {
        Ok(pages) => pages,
        Err(error) => {
            tracing::debug!(error = %error, "Per-page extraction failed; retrying whole document");
            let text = pdf_extract::extract_text_from_mem(bytes)
                .map_err(|err| ParseError::malformed("pdf", err))?;
            vec![text]
        }
    };

    let mut page_images = match ocr {
        Some(_) => extract_page_images(bytes),
        None => Vec::new(),
    };

    let mut units = Vec::with_capacity(pages.len());
    for (index, text) in pages.into_iter().enumerate() {
        let page = u32::try_from(index + 1).unwrap_or(u32::MAX);
        units.push(DocumentUnit::page(normalize_page(&text), page));

        if let Some(engine) = ocr {
            let images: Vec<Vec<u8>> = page_images
                .iter_mut()
                .filter(|(image_page, _)| *image_page == page)
                .map(|(_, data)| std::mem::take(data))
                .collect();
            for recognized in recognize_all(engine, images.iter().map(Vec::as_slice)) {
                units.push(DocumentUnit::image_text(recognized, Some(page)));
            }
        }
    }

    Ok(units)
}

fn normalize_page(text: &str) -> String {
    text.lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// JPEG (DCTDecode) images by page number. Other encodings would need decoding to a raster
/// format before OCR and are skipped.
fn extract_page_images(bytes: &[u8]) -> Vec<(u32, Vec<u8>)> {
    let doc = match Document::load_mem(bytes) {
        Ok(doc) => doc,
        Err(error) => {
            tracing::warn!(error = %error, "Failed to load PDF for image extraction");
            return Vec::new();
        }
    };

    let mut images = Vec::new();
    for (page_num, page_id) in doc.get_pages() {
        if images.len() >= MAX_IMAGES {
            tracing::debug!(max = MAX_IMAGES, "Reached image limit; stopping extraction");
            break;
        }
        let page_images = match doc.get_page_images(page_id) {
            Ok(page_images) => page_images,
            Err(error) => {
                tracing::debug!(page = page_num, error = %error, "Failed to read page images");
                continue;
            }
        };
        for image in page_images {
            if images.len() >= MAX_IMAGES {
                break;
            }
            if image.width < MIN_DIMENSION || image.height < MIN_DIMENSION {
                continue;
            }
            let is_jpeg = image
                .filters
                .as_ref()
                .is_some_and(|filters| filters.iter().any(|f| f == "DCTDecode"));
            if is_jpeg {
                images.push((page_num, image.content.to_vec()));
            }
        }
    }

    tracing::debug!(images = images.len(), "Extracted PDF images for OCR");
    images
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn garbage_bytes_are_malformed() {
        let error = parse(b"definitely not a pdf", None).expect_err("malformed");
        assert!(matches!(error, ParseError::Malformed { format: "pdf", .. }));
    }

    #[test]
    fn normalize_page_trims_trailing_space_per_line() {
        assert_eq!(normalize_page("\n  Title   \nbody  \n\n"), "Title\nbody");
    }
}
