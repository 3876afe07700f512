//! Best-effort text recovery from binary Word 97-2003 documents.
//!
//! The compound file container is not interpreted. Body text is stored either as UTF-16LE or
//! as 8-bit characters, so both encodings are scanned for runs of printable characters and the
//! richer result wins.

use super::DocumentUnit;

const MIN_WIDE_RUN: usize = 4;
const MIN_NARROW_RUN: usize = 8;

pub(super) fn parse(bytes: &[u8]) -> Vec<DocumentUnit> {
    let wide = wide_runs(bytes);
    let narrow = narrow_runs(bytes);

    let weight = |runs: &[String]| runs.iter().map(|run| run.chars().count()).sum::<usize>();
    let runs = if weight(&wide) >= weight(&narrow) {
        wide
    } else {
        narrow
    };
    tracing::debug!(runs = runs.len(), "Recovered text runs from legacy Word document");

    vec![DocumentUnit::text(runs.join("\n"))]
}

fn is_text_char(ch: char) -> bool {
    !ch.is_control() || matches!(ch, '\t' | '\r' | '\n')
}

fn push_run(runs: &mut Vec<String>, current: &mut String, min_len: usize) {
    let run = current.replace('\r', "\n");
    let trimmed = run.trim();
    if trimmed.chars().filter(|ch| !ch.is_whitespace()).count() >= min_len {
        runs.push(trimmed.to_string());
    }
    current.clear();
}

fn wide_runs(bytes: &[u8]) -> Vec<String> {
    let mut runs = Vec::new();
    // Text may begin on either byte parity.
    for offset in 0..2 {
        let mut current = String::new();
        let units = bytes
            .get(offset..)
            .unwrap_or_default()
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]));
        for decoded in char::decode_utf16(units) {
            match decoded {
                Ok(ch) if ch != '\u{fffd}' && is_text_char(ch) => current.push(ch),
                _ => push_run(&mut runs, &mut current, MIN_WIDE_RUN),
            }
        }
        push_run(&mut runs, &mut current, MIN_WIDE_RUN);
        if !runs.is_empty() {
            break;
        }
    }
    runs
}

fn narrow_runs(bytes: &[u8]) -> Vec<String> {
    let mut runs = Vec::new();
    let mut current = String::new();
    for &byte in bytes {
        if byte.is_ascii_graphic() || matches!(byte, b' ' | b'\t' | b'\r' | b'\n') {
            current.push(char::from(byte));
        } else {
            push_run(&mut runs, &mut current, MIN_NARROW_RUN);
        }
    }
    push_run(&mut runs, &mut current, MIN_NARROW_RUN);
    runs
}
