//! HTML to text with block structure kept as line breaks.

use super::DocumentUnit;
use regex::{Captures, Regex};
use std::sync::LazyLock;

static COMMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<!--.*?-->").expect("valid regex"));
static TITLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<title\b[^>]*>(.*?)</title\s*>").expect("valid regex"));
static SKIPPED_BLOCKS: LazyLock<[Regex; 4]> = LazyLock::new(|| {
    ["script", "style", "noscript", "head"]
        .map(|tag| Regex::new(&format!(r"(?is)<{tag}\b.*?</{tag}\s*>")).expect("valid regex"))
});
static IMAGE_ALT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)<img\b[^>]*?\balt\s*=\s*(?:"([^"]*)"|'([^']*)')"#).expect("valid regex")
});
static BLOCK_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)</?(?:p|div|br|hr|li|ul|ol|h[1-6]|tr|table|section|article|header|footer|nav|aside|main|blockquote|pre|dt|dd)\b[^>]*>",
    )
    .expect("valid regex")
});
static CELL_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)</t[dh]\s*>").expect("valid regex"));
static ANY_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").expect("valid regex"));
static ENTITY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"&(#[0-9]{1,7}|#[xX][0-9a-fA-F]{1,6}|[a-zA-Z]+);").expect("valid regex")
});
static SPACES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[ \t\u{a0}]+").expect("valid regex"));

/// Title, body text, then image alt texts as image units.
pub(super) fn parse(bytes: &[u8]) -> Vec<DocumentUnit> {
    let html = String::from_utf8_lossy(bytes);
    let html = COMMENT.replace_all(&html, "");

    let title = TITLE
        .captures(&html)
        .map(|caps| normalize(&decode_entities(&ANY_TAG.replace_all(&caps[1], ""))))
        .filter(|title| !title.is_empty());

    let mut body = html.into_owned();
    for pattern in SKIPPED_BLOCKS.iter() {
        body = pattern.replace_all(&body, "").into_owned();
    }

    let alts: Vec<String> = IMAGE_ALT
        .captures_iter(&body)
        .filter_map(|caps| caps.get(1).or_else(|| caps.get(2)))
        .map(|alt| normalize(&decode_entities(alt.as_str())))
        .filter(|alt| !alt.is_empty())
        .collect();

    let body = BLOCK_TAG.replace_all(&body, "\n");
    let body = CELL_TAG.replace_all(&body, " ");
    let body = ANY_TAG.replace_all(&body, "");
    let body = normalize(&decode_entities(&body));

    let mut units = Vec::new();
    if let Some(title) = title
        && !body.starts_with(&title)
    {
        units.push(DocumentUnit::text(title));
    }
    units.push(DocumentUnit::text(body));
    units.extend(alts.into_iter().map(|alt| DocumentUnit::image_text(alt, None)));
    units
}

fn decode_entities(text: &str) -> String {
    ENTITY
        .replace_all(text, |caps: &Captures<'_>| {
            let entity = &caps[1];
            let decoded = if let Some(hex) = entity
                .strip_prefix("#x")
                .or_else(|| entity.strip_prefix("#X"))
            {
                u32::from_str_radix(hex, 16).ok().and_then(char::from_u32)
            } else if let Some(dec) = entity.strip_prefix('#') {
                dec.parse::<u32>().ok().and_then(char::from_u32)
            } else {
                named_entity(entity)
            };
            decoded.map_or_else(|| caps[0].to_string(), String::from)
        })
        .into_owned()
}

fn named_entity(name: &str) -> Option<char> {
    Some(match name {
        "amp" => '&',
        "lt" => '<',
        "gt" => '>',
        "quot" => '"',
        "apos" => '\'',
        "nbsp" => ' ',
        "copy" => '©',
        "reg" => '®',
        "deg" => '°',
        "plusmn" => '±',
        "micro" => 'µ',
        "middot" => '·',
        "ndash" => '–',
        "mdash" => '—',
        "hellip" => '…',
        "times" => '×',
        _ => return None,
    })
}

/// Collapse runs of spaces, trim lines, and drop blank lines.
fn normalize(text: &str) -> String {
    text.lines()
        .map(|line| SPACES.replace_all(line, " ").trim().to_string())
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}
