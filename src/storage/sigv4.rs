//! AWS Signature Version 4 for S3-compatible stores.
//!
//! Two flavours are supported: header signing for requests this service sends itself, and
//! query-string presigning for URLs handed to clients. Only the `s3` service scope is used.

use hmac::{Hmac, Mac};
use reqwest::Url;
use sha2::{Digest, Sha256};
use std::time::Duration;
use time::{OffsetDateTime, UtcOffset};

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const SERVICE: &str = "s3";

/// Payload hash used for presigned URLs, where the body is unknown at signing time.
pub const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";

/// Longest expiry S3 accepts for a presigned URL (seven days).
pub const MAX_PRESIGN_EXPIRY: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Static credentials plus the region they sign for.
#[derive(Debug, Clone)]
pub struct Credentials {
    /// Access key id.
    pub access_key: String,
    /// Secret access key.
    pub secret_key: String,
    /// Signing region.
    pub region: String,
}

/// Hex-encoded SHA-256 of a request body.
pub fn payload_hash(body: &[u8]) -> String {
    hex::encode(Sha256::digest(body))
}

/// Produce a presigned copy of `url` valid for `expires`.
///
/// Any query parameters already on `url` (such as `uploadId` and `partNumber`) are covered by
/// the signature, which binds the URL to that specific multipart part.
pub fn presign(
    credentials: &Credentials,
    method: &str,
    url: &Url,
    expires: Duration,
    now: OffsetDateTime,
) -> Url {
    let (amz_date, date) = timestamps(now);
    let scope = credential_scope(&date, &credentials.region);
    let expires = expires.min(MAX_PRESIGN_EXPIRY).as_secs().max(1);

    let mut params = query_params(url);
    params.push(("X-Amz-Algorithm".into(), ALGORITHM.into()));
    params.push((
        "X-Amz-Credential".into(),
        format!("{}/{scope}", credentials.access_key),
    ));
    params.push(("X-Amz-Date".into(), amz_date.clone()));
    params.push(("X-Amz-Expires".into(), expires.to_string()));
    params.push(("X-Amz-SignedHeaders".into(), "host".into()));

    let canonical_query = canonical_query_string(&params);
    let canonical_headers = format!("host:{}\n", host_header(url));
    let canonical_request = format!(
        "{method}\n{}\n{canonical_query}\n{canonical_headers}\nhost\n{UNSIGNED_PAYLOAD}",
        canonical_uri(url)
    );

    let signature = sign(credentials, &amz_date, &date, &scope, &canonical_request);

    let mut presigned = url.clone();
    presigned.set_query(Some(&format!(
        "{canonical_query}&X-Amz-Signature={signature}"
    )));
    presigned
}

/// Headers that authenticate a request sent directly by this service.
///
/// Returns `(name, value)` pairs for `x-amz-date`, `x-amz-content-sha256`, and
/// `authorization`.
pub fn authorization_headers(
    credentials: &Credentials,
    method: &str,
    url: &Url,
    payload_hash: &str,
    now: OffsetDateTime,
) -> Vec<(&'static str, String)> {
    let (amz_date, date) = timestamps(now);
    let scope = credential_scope(&date, &credentials.region);
    let signed_headers = "host;x-amz-content-sha256;x-amz-date";
    let canonical_headers = format!(
        "host:{}\nx-amz-content-sha256:{payload_hash}\nx-amz-date:{amz_date}\n",
        host_header(url)
    );
    let canonical_request = format!(
        "{method}\n{}\n{}\n{canonical_headers}\n{signed_headers}\n{payload_hash}",
        canonical_uri(url),
        canonical_query_string(&query_params(url)),
    );

    let signature = sign(credentials, &amz_date, &date, &scope, &canonical_request);
    let authorization = format!(
        "{ALGORITHM} Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
        credentials.access_key
    );

    vec![
        ("x-amz-date", amz_date),
        ("x-amz-content-sha256", payload_hash.to_string()),
        ("authorization", authorization),
    ]
}

fn sign(
    credentials: &Credentials,
    amz_date: &str,
    date: &str,
    scope: &str,
    canonical_request: &str,
) -> String {
    let string_to_sign = format!(
        "{ALGORITHM}\n{amz_date}\n{scope}\n{}",
        hex::encode(Sha256::digest(canonical_request.as_bytes()))
    );

    let key = hmac(
        format!("AWS4{}", credentials.secret_key).as_bytes(),
        date.as_bytes(),
    );
    let key = hmac(&key, credentials.region.as_bytes());
    let key = hmac(&key, SERVICE.as_bytes());
    let key = hmac(&key, b"aws4_request");

    hex::encode(hmac(&key, string_to_sign.as_bytes()))
}

fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn timestamps(now: OffsetDateTime) -> (String, String) {
    let now = now.to_offset(UtcOffset::UTC);
    let date = format!(
        "{:04}{:02}{:02}",
        now.year(),
        u8::from(now.month()),
        now.day()
    );
    let amz_date = format!(
        "{date}T{:02}{:02}{:02}Z",
        now.hour(),
        now.minute(),
        now.second()
    );
    (amz_date, date)
}

fn credential_scope(date: &str, region: &str) -> String {
    format!("{date}/{region}/{SERVICE}/aws4_request")
}

fn host_header(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

/// Path is expected to be percent-encoded already (see [`encode_path`]).
fn canonical_uri(url: &Url) -> String {
    let path = url.path();
    if path.is_empty() {
        "/".to_string()
    } else {
        path.to_string()
    }
}

fn query_params(url: &Url) -> Vec<(String, String)> {
    url.query_pairs()
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect()
}

fn canonical_query_string(params: &[(String, String)]) -> String {
    let mut encoded: Vec<(String, String)> = params
        .iter()
        .map(|(key, value)| {
            (
                urlencoding::encode(key).into_owned(),
                urlencoding::encode(value).into_owned(),
            )
        })
        .collect();
    encoded.sort();
    encoded
        .into_iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join("&")
}

/// Percent-encode an object key for use in a path-style URL, keeping `/` separators.
pub fn encode_path(key: &str) -> String {
    key.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}
