//! Plain text and structured text formats, parsed in direct mode.

use super::{DocumentUnit, ParseError};
use quick_xml::Reader;
use quick_xml::events::Event;
use serde_json::Value;

fn decode(bytes: &[u8]) -> String {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

/// Whole text as a single unit. Invalid UTF-8 is replaced rather than rejected.
pub(super) fn parse_plain(bytes: &[u8]) -> Vec<DocumentUnit> {
    vec![DocumentUnit::text(decode(bytes).replace("\r\n", "\n"))]
}

/// One record per row, rendered as `header: value` lines. Empty cells are omitted.
pub(super) fn parse_csv(bytes: &[u8]) -> Result<Vec<DocumentUnit>, ParseError> {
    let text = decode(bytes);
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(text.as_bytes());
    let headers = reader
        .headers()
        .map_err(|err| ParseError::malformed("csv", err))?
        .clone();

    let mut units = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|err| ParseError::malformed("csv", err))?;
        let lines: Vec<String> = record
            .iter()
            .enumerate()
            .filter(|(_, value)| !value.trim().is_empty())
            .map(|(index, value)| match headers.get(index) {
                Some(header) if !header.trim().is_empty() => {
                    format!("{}: {}", header.trim(), value.trim())
                }
                _ => format!("column {}: {}", index + 1, value.trim()),
            })
            .collect();
        if !lines.is_empty() {
            units.push(DocumentUnit::record(lines.join("\n")));
        }
    }
    Ok(units)
}

/// Flattened `path: value` lines. A top-level array yields one record per element.
pub(super) fn parse_json(bytes: &[u8]) -> Result<Vec<DocumentUnit>, ParseError> {
    let value: Value = serde_json::from_slice(bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes))
        .map_err(|err| ParseError::malformed("json", err))?;

    let records = match value {
        Value::Array(items) => items,
        other => vec![other],
    };

    Ok(records
        .iter()
        .map(|item| {
            let mut lines = Vec::new();
            flatten(item, "", &mut lines);
            DocumentUnit::record(lines.join("\n"))
        })
        .collect())
}

fn flatten(value: &Value, path: &str, lines: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let child_path = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{path}.{key}")
                };
                flatten(child, &child_path, lines);
            }
        }
        Value::Array(items) => {
            for (index, child) in items.iter().enumerate() {
                flatten(child, &format!("{path}[{index}]"), lines);
            }
        }
        Value::Null => {}
        Value::String(text) if text.trim().is_empty() => {}
        scalar => {
            let rendered = match scalar {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            };
            if path.is_empty() {
                lines.push(rendered);
            } else {
                lines.push(format!("{path}: {rendered}"));
            }
        }
    }
}

/// Text and CDATA content of every element, one line per node.
pub(super) fn parse_xml(bytes: &[u8]) -> Result<Vec<DocumentUnit>, ParseError> {
    let xml = decode(bytes);
    let mut reader = Reader::from_str(&xml);
    reader.trim_text(true);

    let mut lines = Vec::new();
    loop {
        match reader.read_event() {
            Ok(Event::Text(t)) => {
                let text = t.unescape().map_err(|err| ParseError::malformed("xml", err))?;
                lines.push(text.trim().to_string());
            }
            Ok(Event::CData(data)) => {
                lines.push(String::from_utf8_lossy(&data).trim().to_string());
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(err) => return Err(ParseError::malformed("xml", err)),
        }
    }

    lines.retain(|line| !line.is_empty());
    Ok(vec![DocumentUnit::text(lines.join("\n"))])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parsers::UnitKind;

    #[test]
    fn plain_text_strips_bom_and_normalizes_newlines() {
        let units = parse_plain(b"\xEF\xBB\xBFline one\r\nline two");
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].text, "line one\nline two");
    }

    #[test]
    fn csv_rows_become_labelled_records() {
        let csv = "drug,dose,notes\nAspirin,100mg,\nMetformin,500mg,with food\n";
        let units = parse_csv(csv.as_bytes()).expect("parse");
        assert_eq!(units.len(), 2);
        assert!(units.iter().all(|unit| unit.kind == UnitKind::Record));
        assert_eq!(units[0].text, "drug: Aspirin\ndose: 100mg");
        assert_eq!(units[1].text, "drug: Metformin\ndose: 500mg\nnotes: with food");
    }

    #[test]
    fn csv_extra_cells_get_positional_labels() {
        let units = parse_csv(b"name\nalpha,beta\n").expect("parse");
        assert_eq!(units[0].text, "name: alpha\ncolumn 2: beta");
    }

    #[test]
    fn json_array_yields_one_record_per_element() {
        let json = r#"[{"title":"Fever","advice":{"adult":"rest","child":null}},{"tags":["a","b"]}]"#;
        let units = parse_json(json.as_bytes()).expect("parse");
        assert_eq!(units.len(), 2);
        let first: Vec<&str> = units[0].text.lines().collect();
        assert_eq!(first.len(), 2);
        assert!(first.contains(&"title: Fever"));
        assert!(first.contains(&"advice.adult: rest"));
        assert_eq!(units[1].text, "tags[0]: a\ntags[1]: b");
    }

    #[test]
    fn json_scalars_render_without_quotes() {
        let units = parse_json(br#"{"count": 3, "ok": true, "name": "x"}"#).expect("parse");
        assert_eq!(units.len(), 1);
        assert!(units[0].text.contains("count: 3"));
        assert!(units[0].text.contains("ok: true"));
        assert!(units[0].text.contains("name: x"));
    }

    #[test]
    fn invalid_json_is_malformed() {
        let error = parse_json(b"{not json").expect_err("malformed");
        assert!(matches!(error, ParseError::Malformed { format: "json", .. }));
    }

    #[test]
    fn xml_collects_text_and_cdata() {
        let xml = "<doc><title>Dosage &amp; Use</title><body><![CDATA[Take <b>twice</b>]]></body></doc>";
        let units = parse_xml(xml.as_bytes()).expect("parse");
        assert_eq!(units[0].text, "Dosage & Use\nTake <b>twice</b>");
    }

    #[test]
    fn xml_unknown_entity_is_malformed() {
        let error = parse_xml(b"<doc>&bogus;</doc>").expect_err("malformed");
        assert!(matches!(error, ParseError::Malformed { format: "xml", .. }));
    }
}
