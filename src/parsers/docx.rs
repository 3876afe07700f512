//! Office Open XML word processing documents.

use super::ocr::{OcrEngine, recognize_all};
use super::{DocumentUnit, ParseError};
use quick_xml::Reader;
use quick_xml::events::Event;
use std::io::{Cursor, Read};
use zip::ZipArchive;

const DOCUMENT_PART: &str = "word/document.xml";
const MEDIA_PREFIX: &str = "word/media/";

/// Paragraph text as one unit, then one unit per OCR'd image from `word/media/`.
pub(super) fn parse(
    bytes: &[u8],
    ocr: Option<&dyn OcrEngine>,
) -> Result<Vec<DocumentUnit>, ParseError> {
    let mut archive =
        ZipArchive::new(Cursor::new(bytes)).map_err(|err| ParseError::malformed("docx", err))?;

    let mut xml = String::new();
    archive
        .by_name(DOCUMENT_PART)
        .map_err(|err| ParseError::malformed("docx", format!("{DOCUMENT_PART}: {err}")))?
        .read_to_string(&mut xml)
        .map_err(|err| ParseError::malformed("docx", err))?;

    let paragraphs = paragraphs(&xml)?;
    let mut units = vec![DocumentUnit::text(paragraphs.join("\n"))];

    if let Some(engine) = ocr {
        let images = media_images(&mut archive);
        tracing::debug!(images = images.len(), "Running OCR over Word media");
        units.extend(
            recognize_all(engine, images.iter().map(Vec::as_slice))
                .into_iter()
                .map(|text| DocumentUnit::image_text(text, None)),
        );
    }

    Ok(units)
}

/// Non-empty paragraphs of `w:body`. Tabs and line breaks inside a paragraph are kept.
fn paragraphs(xml: &str) -> Result<Vec<String>, ParseError> {
    let mut reader = Reader::from_str(xml);
    let mut paragraphs = Vec::new();
    let mut current = String::new();
    let mut in_text = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"t" => in_text = true,
                b"p" => current.clear(),
                _ => {}
            },
            Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"tab" => current.push('\t'),
                b"br" | b"cr" => current.push('\n'),
                _ => {}
            },
            Ok(Event::Text(t)) if in_text => {
                let text = t
                    .unescape()
                    .map_err(|err| ParseError::malformed("docx", err))?;
                current.push_str(&text);
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => {
                    let paragraph = current.trim();
                    if !paragraph.is_empty() {
                        paragraphs.push(paragraph.to_string());
                    }
                    current.clear();
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(err) => return Err(ParseError::malformed("docx", err)),
        }
    }

    Ok(paragraphs)
}

fn media_images(archive: &mut ZipArchive<Cursor<&[u8]>>) -> Vec<Vec<u8>> {
    let mut images = Vec::new();
    for index in 0..archive.len() {
        let mut entry = match archive.by_index(index) {
            Ok(entry) => entry,
            Err(error) => {
                tracing::debug!(index, error = %error, "Skipping unreadable archive entry");
                continue;
            }
        };
        if !entry.name().starts_with(MEDIA_PREFIX) || !is_ocr_candidate(entry.name()) {
            continue;
        }
        let mut data = Vec::new();
        match entry.read_to_end(&mut data) {
            Ok(_) => images.push(data),
            Err(error) => {
                tracing::debug!(name = entry.name(), error = %error, "Skipping unreadable image")
            }
        }
    }
    images
}

fn is_ocr_candidate(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    [".png", ".jpg", ".jpeg", ".bmp", ".gif", ".tif", ".tiff"]
        .iter()
        .any(|ext| lower.ends_with(ext))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parsers::UnitKind;
    use crate::parsers::ocr::tests::FixedOcr;
    use std::io::Write;
    use zip::ZipWriter;
    use zip::write::SimpleFileOptions;

    const BODY: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main">
  <w:body>
    <w:p><w:r><w:t>Quarterly</w:t></w:r><w:r><w:t xml:space="preserve"> report</w:t></w:r></w:p>
    <w:p></w:p>
    <w:p><w:r><w:t>Revenue</w:t><w:tab/><w:t>R&amp;D</w:t></w:r></w:p>
  </w:body>
</w:document>"#;

    fn build_docx(media: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default();
        writer.start_file(DOCUMENT_PART, options).expect("start");
        writer.write_all(BODY.as_bytes()).expect("write");
        for (name, data) in media {
            writer.start_file(*name, options).expect("start media");
            writer.write_all(data).expect("write media");
        }
        writer.finish().expect("finish").into_inner()
    }

    #[test]
    fn extracts_paragraphs_in_order() {
        let bytes = build_docx(&[]);
        let units = parse(&bytes, None).expect("parse");
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].text, "Quarterly report\nRevenue\tR&D");
    }

    #[test]
    fn ocr_appends_image_units() {
        let bytes = build_docx(&[
            ("word/media/image1.png", b"png-bytes"),
            ("word/media/chart.emf", b"vector"),
            ("word/media/image2.jpeg", b"bad jpeg"),
        ]);
        let units = parse(&bytes, Some(&FixedOcr("diagram label"))).expect("parse");
        assert_eq!(units.len(), 2);
        assert_eq!(units[1].kind, UnitKind::ImageText);
        assert_eq!(units[1].text, "diagram label");
    }

    #[test]
    fn missing_document_part_is_malformed() {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        writer
            .start_file("other.xml", SimpleFileOptions::default())
            .expect("start");
        writer.write_all(b"<x/>").expect("write");
        let bytes = writer.finish().expect("finish").into_inner();

        let error = parse(&bytes, None).expect_err("missing part");
        assert!(matches!(error, ParseError::Malformed { format: "docx", .. }));
    }

    #[test]
    fn non_zip_bytes_are_malformed() {
        assert!(parse(b"plain text", None).is_err());
    }
}
