//! S3 REST client (MinIO compatible) using path-style addressing and SigV4.

use super::sigv4::{self, Credentials};
use super::{ObjectStat, ObjectStore, ObjectStoreError, UploadedPart};
use async_trait::async_trait;
use quick_xml::Reader as XmlReader;
use quick_xml::events::Event;
use reqwest::{Client, Method, StatusCode, Url};
use std::time::Duration;
use time::OffsetDateTime;

/// Connection settings for an S3-compatible endpoint.
#[derive(Debug, Clone)]
pub struct S3Settings {
    /// Base URL, e.g. `http://minio:9000`.
    pub endpoint: String,
    /// Signing region.
    pub region: String,
    /// Access key id.
    pub access_key: String,
    /// Secret access key.
    pub secret_key: String,
    /// Bucket that holds knowledge files.
    pub bucket: String,
    /// Client-level request timeout.
    pub timeout: Duration,
}

/// Object store backed by the S3 REST API.
pub struct S3ObjectStore {
    pub(crate) client: Client,
    pub(crate) endpoint: Url,
    pub(crate) bucket: String,
    pub(crate) credentials: Credentials,
}

impl S3ObjectStore {
    /// Build a client for the configured endpoint and bucket.
    pub fn new(settings: S3Settings) -> Result<Self, ObjectStoreError> {
        let client = Client::builder()
            .user_agent("knowledge-ingest/0.1")
            .timeout(settings.timeout)
            .build()?;
        let endpoint = Url::parse(settings.endpoint.trim_end_matches('/'))
            .map_err(|err| ObjectStoreError::InvalidUrl(err.to_string()))?;
        if endpoint.host_str().is_none() {
            return Err(ObjectStoreError::InvalidUrl(settings.endpoint));
        }

        tracing::debug!(
            endpoint = %endpoint,
            bucket = %settings.bucket,
            region = %settings.region,
            "Initialized S3 object store client"
        );

        Ok(Self {
            client,
            endpoint,
            bucket: settings.bucket,
            credentials: Credentials {
                access_key: settings.access_key,
                secret_key: settings.secret_key,
                region: settings.region,
            },
        })
    }

    /// Create the bucket when it does not exist yet.
    pub async fn ensure_bucket(&self) -> Result<(), ObjectStoreError> {
        let url = self.bucket_url();
        let response = self.send(Method::HEAD, url.clone(), Vec::new()).await?;
        match response.status() {
            status if status.is_success() => {
                tracing::debug!(bucket = %self.bucket, "Bucket present");
                Ok(())
            }
            StatusCode::NOT_FOUND => {
                tracing::info!(bucket = %self.bucket, "Creating bucket");
                let response = self.send(Method::PUT, url, Vec::new()).await?;
                ensure_success(response).await.map(|_| ())
            }
            _ => ensure_success(response).await.map(|_| ()),
        }
    }

    fn bucket_url(&self) -> Url {
        let mut url = self.endpoint.clone();
        url.set_path(&format!("/{}", sigv4::encode_path(&self.bucket)));
        url
    }

    fn object_url(&self, path: &str, query: &[(&str, &str)]) -> Url {
        let mut url = self.endpoint.clone();
        url.set_path(&format!(
            "/{}/{}",
            sigv4::encode_path(&self.bucket),
            sigv4::encode_path(path.trim_start_matches('/'))
        ));
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
        }
        url
    }

    fn presign_url(&self, method: &str, url: &Url, ttl: Duration) -> String {
        sigv4::presign(&self.credentials, method, url, ttl, OffsetDateTime::now_utc()).to_string()
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        body: Vec<u8>,
    ) -> Result<reqwest::Response, ObjectStoreError> {
        let hash = sigv4::payload_hash(&body);
        let headers = sigv4::authorization_headers(
            &self.credentials,
            method.as_str(),
            &url,
            &hash,
            OffsetDateTime::now_utc(),
        );

        let mut request = self.client.request(method, url);
        for (name, value) in headers {
            request = request.header(name, value);
        }
        if !body.is_empty() {
            request = request.header("content-type", "application/xml").body(body);
        }
        Ok(request.send().await?)
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn presign_put(&self, path: &str, ttl: Duration) -> Result<String, ObjectStoreError> {
        let url = self.object_url(path, &[]);
        Ok(self.presign_url("PUT", &url, ttl))
    }

    async fn presign_get(&self, path: &str, ttl: Duration) -> Result<String, ObjectStoreError> {
        let url = self.object_url(path, &[]);
        Ok(self.presign_url("GET", &url, ttl))
    }

    async fn create_multipart_upload(
        &self,
        path: &str,
        content_type: &str,
    ) -> Result<String, ObjectStoreError> {
        let url = self.object_url(path, &[("uploads", "")]);
        let hash = sigv4::payload_hash(&[]);
        let headers = sigv4::authorization_headers(
            &self.credentials,
            "POST",
            &url,
            &hash,
            OffsetDateTime::now_utc(),
        );
        let mut request = self
            .client
            .request(Method::POST, url)
            .header("content-type", content_type);
        for (name, value) in headers {
            request = request.header(name, value);
        }
        let response = request.send().await?;
        let body = ensure_success(response).await?;

        let upload_id = first_element_text(&body, b"UploadId")?.ok_or_else(|| {
            ObjectStoreError::InvalidResponse("InitiateMultipartUploadResult without UploadId".into())
        })?;
        tracing::debug!(path, upload_id = %upload_id, "Multipart upload created");
        Ok(upload_id)
    }

    async fn presign_upload_part(
        &self,
        path: &str,
        upload_id: &str,
        part_number: u32,
        ttl: Duration,
    ) -> Result<String, ObjectStoreError> {
        let part = part_number.to_string();
        let url = self.object_url(path, &[("partNumber", part.as_str()), ("uploadId", upload_id)]);
        Ok(self.presign_url("PUT", &url, ttl))
    }

    async fn list_parts(
        &self,
        path: &str,
        upload_id: &str,
    ) -> Result<Vec<UploadedPart>, ObjectStoreError> {
        let mut parts = Vec::new();
        let mut marker = String::from("0");

        loop {
            let url = self.object_url(
                path,
                &[("uploadId", upload_id), ("part-number-marker", marker.as_str())],
            );
            let response = self.send(Method::GET, url, Vec::new()).await?;
            let body = ensure_success(response).await?;
            let page = parse_list_parts(&body)?;
            parts.extend(page.parts);

            match page.next_marker {
                Some(next) if page.is_truncated && next != marker => marker = next,
                _ => break,
            }
        }

        parts.sort_by_key(|part| part.part_number);
        tracing::debug!(path, upload_id, parts = parts.len(), "Listed uploaded parts");
        Ok(parts)
    }

    async fn complete_multipart_upload(
        &self,
        path: &str,
        upload_id: &str,
        parts: &[UploadedPart],
    ) -> Result<(), ObjectStoreError> {
        let url = self.object_url(path, &[("uploadId", upload_id)]);
        let body = complete_multipart_body(parts);
        let response = self.send(Method::POST, url, body.into_bytes()).await?;
        let body = ensure_success(response).await?;

        // S3 may report a failed assembly inside a 200 response.
        if let Some(error) = parse_error_document(&body) {
            return Err(error);
        }
        tracing::debug!(path, upload_id, parts = parts.len(), "Multipart upload completed");
        Ok(())
    }

    async fn stat_object(&self, path: &str) -> Result<Option<ObjectStat>, ObjectStoreError> {
        let url = self.object_url(path, &[]);
        let response = self.send(Method::HEAD, url, Vec::new()).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(ObjectStoreError::UnexpectedStatus {
                status: response.status(),
                body: String::new(),
            });
        }

        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        };
        let size = header("content-length")
            .and_then(|value| value.parse().ok())
            .unwrap_or(0);

        Ok(Some(ObjectStat {
            size,
            etag: header("etag"),
            content_type: header("content-type"),
        }))
    }

    async fn get_object(&self, path: &str, max_bytes: u64) -> Result<Vec<u8>, ObjectStoreError> {
        let url = self.object_url(path, &[]);
        let mut response = self.send(Method::GET, url, Vec::new()).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(ObjectStoreError::NoSuchKey(path.to_string()));
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ObjectStoreError::UnexpectedStatus { status, body });
        }

        let too_large = || ObjectStoreError::TooLarge {
            path: path.to_string(),
            limit: max_bytes,
        };
        if response.content_length().is_some_and(|length| length > max_bytes) {
            return Err(too_large());
        }
        // Content-Length may be absent or wrong; enforce the limit while reading.
        let mut bytes = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            if (bytes.len() + chunk.len()) as u64 > max_bytes {
                return Err(too_large());
            }
            bytes.extend_from_slice(&chunk);
        }
        Ok(bytes)
    }
}

async fn ensure_success(response: reqwest::Response) -> Result<String, ObjectStoreError> {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    if status.is_success() {
        return Ok(body);
    }

    let error = match parse_error_document(&body) {
        Some(ObjectStoreError::Api { code, message }) if code == "NoSuchUpload" => {
            ObjectStoreError::NoSuchUpload(message)
        }
        Some(error) => error,
        None => ObjectStoreError::UnexpectedStatus { status, body },
    };
    tracing::error!(error = %error, "Object store request failed");
    Err(error)
}

struct ListPartsPage {
    parts: Vec<UploadedPart>,
    is_truncated: bool,
    next_marker: Option<String>,
}

fn parse_list_parts(xml: &str) -> Result<ListPartsPage, ObjectStoreError> {
    let mut reader = XmlReader::from_str(xml);
    reader.trim_text(true);

    let mut page = ListPartsPage {
        parts: Vec::new(),
        is_truncated: false,
        next_marker: None,
    };
    let mut current: Option<Vec<u8>> = None;
    let mut in_part = false;
    let mut part_number: Option<u32> = None;
    let mut etag: Option<String> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = e.local_name().as_ref().to_vec();
                if name == b"Part" {
                    in_part = true;
                    part_number = None;
                    etag = None;
                }
                current = Some(name);
            }
            Ok(Event::Text(text)) => {
                let value = text
                    .unescape()
                    .map_err(|err| ObjectStoreError::InvalidResponse(err.to_string()))?;
                match (in_part, current.as_deref()) {
                    (true, Some(b"PartNumber")) => part_number = value.trim().parse().ok(),
                    (true, Some(b"ETag")) => etag = Some(value.trim().to_string()),
                    (false, Some(b"IsTruncated")) => {
                        page.is_truncated = value.trim().eq_ignore_ascii_case("true");
                    }
                    (false, Some(b"NextPartNumberMarker")) => {
                        page.next_marker = Some(value.trim().to_string());
                    }
                    _ => {}
                }
            }
            Ok(Event::End(e)) => {
                if e.local_name().as_ref() == b"Part" {
                    in_part = false;
                    match (part_number.take(), etag.take()) {
                        (Some(part_number), Some(etag)) => {
                            page.parts.push(UploadedPart { part_number, etag })
                        }
                        _ => {
                            return Err(ObjectStoreError::InvalidResponse(
                                "Part entry missing PartNumber or ETag".into(),
                            ));
                        }
                    }
                }
                current = None;
            }
            Ok(Event::Eof) => break,
            Err(err) => return Err(ObjectStoreError::InvalidResponse(err.to_string())),
            _ => {}
        }
    }

    Ok(page)
}

fn first_element_text(xml: &str, element: &[u8]) -> Result<Option<String>, ObjectStoreError> {
    let mut reader = XmlReader::from_str(xml);
    reader.trim_text(true);
    let mut inside = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => inside = e.local_name().as_ref() == element,
            Ok(Event::Text(text)) if inside => {
                let value = text
                    .unescape()
                    .map_err(|err| ObjectStoreError::InvalidResponse(err.to_string()))?;
                return Ok(Some(value.trim().to_string()));
            }
            Ok(Event::End(_)) => inside = false,
            Ok(Event::Eof) => return Ok(None),
            Err(err) => return Err(ObjectStoreError::InvalidResponse(err.to_string())),
            _ => {}
        }
    }
}

fn parse_error_document(xml: &str) -> Option<ObjectStoreError> {
    if !xml.contains("<Error") {
        return None;
    }
    let code = first_element_text(xml, b"Code").ok().flatten()?;
    let message = first_element_text(xml, b"Message")
        .ok()
        .flatten()
        .unwrap_or_default();
    Some(ObjectStoreError::Api { code, message })
}

fn complete_multipart_body(parts: &[UploadedPart]) -> String {
    let mut body = String::from("<CompleteMultipartUpload>");
    for part in parts {
        body.push_str(&format!(
            "<Part><PartNumber>{}</PartNumber><ETag>{}</ETag></Part>",
            part.part_number,
            quick_xml::escape::escape(part.etag.as_str())
        ));
    }
    body.push_str("</CompleteMultipartUpload>");
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::{Method::GET, Method::HEAD, Method::POST, MockServer};

    fn store_for(server: &MockServer) -> S3ObjectStore {
        S3ObjectStore::new(S3Settings {
            endpoint: server.base_url(),
            region: "us-east-1".into(),
            access_key: "minio".into(),
            secret_key: "minio-secret".into(),
            bucket: "knowledge".into(),
            timeout: Duration::from_secs(5),
        })
        .expect("store")
    }

    #[tokio::test]
    async fn create_multipart_upload_reads_upload_id() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/knowledge/kb_1/file-1/report.pdf")
                    .query_param_exists("uploads")
                    .header_exists("authorization")
                    .header_exists("x-amz-content-sha256");
                then.status(200).body(
                    "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
                     <InitiateMultipartUploadResult xmlns=\"http://s3.amazonaws.com/doc/2006-03-01/\">\
                     <Bucket>knowledge</Bucket><Key>kb_1/file-1/report.pdf</Key>\
                     <UploadId>upload-123</UploadId></InitiateMultipartUploadResult>",
                );
            })
            .await;

        let store = store_for(&server);
        let upload_id = store
            .create_multipart_upload("kb_1/file-1/report.pdf", "application/pdf")
            .await
            .expect("upload id");

        mock.assert_async().await;
        assert_eq!(upload_id, "upload-123");
    }

    #[tokio::test]
    async fn list_parts_follows_pagination() {
        let server = MockServer::start_async().await;
        let second = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/knowledge/kb_1/f/a.bin")
                    .query_param("uploadId", "u-1")
                    .query_param("part-number-marker", "2");
                then.status(200).body(
                    "<ListPartsResult><IsTruncated>false</IsTruncated>\
                     <Part><PartNumber>3</PartNumber><ETag>\"c\"</ETag><Size>1</Size></Part>\
                     </ListPartsResult>",
                );
            })
            .await;
        let first = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/knowledge/kb_1/f/a.bin")
                    .query_param("uploadId", "u-1")
                    .query_param("part-number-marker", "0");
                then.status(200).body(
                    "<ListPartsResult><IsTruncated>true</IsTruncated>\
                     <NextPartNumberMarker>2</NextPartNumberMarker>\
                     <Part><PartNumber>2</PartNumber><ETag>\"b\"</ETag></Part>\
                     <Part><PartNumber>1</PartNumber><ETag>\"a\"</ETag></Part>\
                     </ListPartsResult>",
                );
            })
            .await;

        let store = store_for(&server);
        let parts = store.list_parts("kb_1/f/a.bin", "u-1").await.expect("parts");

        first.assert_async().await;
        second.assert_async().await;
        let numbers: Vec<u32> = parts.iter().map(|part| part.part_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert_eq!(parts[0].etag, "\"a\"");
    }

    #[tokio::test]
    async fn complete_detects_error_inside_success_response() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/knowledge/kb_1/f/a.bin")
                    .query_param("uploadId", "u-1")
                    .body_contains("<PartNumber>1</PartNumber>");
                then.status(200).body(
                    "<Error><Code>InvalidPart</Code>\
                     <Message>One or more of the specified parts could not be found.</Message></Error>",
                );
            })
            .await;

        let store = store_for(&server);
        let parts = vec![UploadedPart {
            part_number: 1,
            etag: "\"a\"".into(),
        }];
        let error = store
            .complete_multipart_upload("kb_1/f/a.bin", "u-1", &parts)
            .await
            .expect_err("assembly error");

        mock.assert_async().await;
        match error {
            ObjectStoreError::Api { code, .. } => assert_eq!(code, "InvalidPart"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn stat_object_maps_missing_object_to_none() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(HEAD).path("/knowledge/kb_uncategorized/f/missing.txt");
                then.status(404);
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(HEAD).path("/knowledge/kb_uncategorized/f/present.txt");
                then.status(200)
                    .header("content-length", "42")
                    .header("etag", "\"abc\"");
            })
            .await;

        let store = store_for(&server);
        assert!(
            store
                .stat_object("kb_uncategorized/f/missing.txt")
                .await
                .expect("stat")
                .is_none()
        );
        let stat = store
            .stat_object("kb_uncategorized/f/present.txt")
            .await
            .expect("stat")
            .expect("object present");
        assert_eq!(stat.size, 42);
        assert_eq!(stat.etag.as_deref(), Some("\"abc\""));
    }

    #[tokio::test]
    async fn get_object_refuses_bodies_over_the_limit() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/knowledge/kb_1/f/big.txt");
                then.status(200).body("x".repeat(64));
            })
            .await;

        let store = store_for(&server);
        let error = store
            .get_object("kb_1/f/big.txt", 16)
            .await
            .expect_err("over limit");
        assert!(matches!(error, ObjectStoreError::TooLarge { limit: 16, .. }));

        let bytes = store.get_object("kb_1/f/big.txt", 64).await.expect("within limit");
        assert_eq!(bytes.len(), 64);
    }

    #[tokio::test]
    async fn presigned_part_url_carries_upload_binding() {
        let server = MockServer::start_async().await;
        let store = store_for(&server);
        let url = store
            .presign_upload_part("kb_1/f/a.bin", "u-1", 7, Duration::from_secs(1200))
            .await
            .expect("url");

        assert!(url.starts_with(&server.base_url()));
        assert!(url.contains("/knowledge/kb_1/f/a.bin?"));
        assert!(url.contains("partNumber=7"));
        assert!(url.contains("uploadId=u-1"));
        assert!(url.contains("X-Amz-Signature="));
        assert!(url.contains("X-Amz-Expires=1200"));
    }

    #[test]
    fn complete_body_lists_parts_in_given_order() {
        let body = complete_multipart_body(&[
            UploadedPart {
                part_number: 1,
                etag: "\"a\"".into(),
            },
            UploadedPart {
                part_number: 2,
                etag: "\"b\"".into(),
            },
        ]);
        assert!(body.starts_with("<CompleteMultipartUpload><Part><PartNumber>1</PartNumber>"));
        assert!(body.find("<PartNumber>1<").unwrap() < body.find("<PartNumber>2<").unwrap());
    }
}
