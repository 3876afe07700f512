//! HTTP client wrapper for interacting with Qdrant.

use super::{VectorHit, VectorRecord, VectorStore, VectorStoreError, check_dimensions};
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::time::Duration;
use uuid::Uuid;

/// Connection settings for [`QdrantService`].
#[derive(Debug, Clone)]
pub struct QdrantSettings {
    /// Base URL, e.g. `http://qdrant:6333`.
    pub url: String,
    /// Optional API key.
    pub api_key: Option<String>,
    /// Collection holding knowledge chunks.
    pub collection: String,
    /// Vector dimension of the collection.
    pub dimension: usize,
    /// Client-level request timeout.
    pub timeout: Duration,
}

/// Lightweight HTTP client for Qdrant operations on a single collection.
pub struct QdrantService {
    pub(crate) client: Client,
    pub(crate) base_url: String,
    pub(crate) api_key: Option<String>,
    pub(crate) collection: String,
    pub(crate) dimension: usize,
}

#[derive(Deserialize)]
struct QueryResponse {
    result: QueryResponseResult,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum QueryResponseResult {
    Points(Vec<QueryPoint>),
    Object {
        #[serde(default)]
        points: Vec<QueryPoint>,
    },
}

#[derive(Deserialize)]
struct QueryPoint {
    id: Value,
    score: f32,
    #[serde(default)]
    payload: Option<Map<String, Value>>,
}

#[derive(Deserialize)]
struct CountResponse {
    result: CountResult,
}

#[derive(Deserialize)]
struct CountResult {
    count: usize,
}

impl QdrantService {
    /// Construct a new client for the configured collection.
    pub fn new(settings: QdrantSettings) -> Result<Self, VectorStoreError> {
        let client = Client::builder()
            .user_agent("knowledge-ingest/0.1")
            .timeout(settings.timeout)
            .build()?;

        let base_url = normalize_base_url(&settings.url).map_err(VectorStoreError::InvalidUrl)?;
        tracing::debug!(
            url = %base_url,
            collection = %settings.collection,
            has_api_key = %settings
                .api_key
                .as_deref()
                .map(|value| !value.is_empty())
                .unwrap_or(false),
            "Initialized Qdrant HTTP client"
        );

        Ok(Self {
            client,
            base_url,
            api_key: settings.api_key,
            collection: settings.collection,
            dimension: settings.dimension,
        })
    }

    /// Create the collection and its payload indexes when missing.
    pub async fn ensure_collection(&self) -> Result<(), VectorStoreError> {
        if !self.collection_exists().await? {
            tracing::info!(
                collection = %self.collection,
                vector_size = self.dimension,
                "Creating collection"
            );
            self.create_collection().await?;
        }
        self.ensure_payload_indexes().await
    }

    async fn create_collection(&self) -> Result<(), VectorStoreError> {
        let body = json!({
            "vectors": {
                "size": self.dimension,
                "distance": "Cosine"
            }
        });

        let response = self
            .request(Method::PUT, &format!("collections/{}", self.collection))
            .json(&body)
            .send()
            .await?;

        self.ensure_success(response, || {
            tracing::debug!(collection = %self.collection, "Collection created");
        })
        .await
    }

    /// Ensure payload indexes exist for the filters the pipeline uses.
    async fn ensure_payload_indexes(&self) -> Result<(), VectorStoreError> {
        let fields: [(&str, &str); 2] = [("file_id", "keyword"), ("collection_id", "integer")];

        for (field, schema) in fields {
            let body = json!({
                "field_name": field,
                "field_schema": schema,
            });

            let response = self
                .request(
                    Method::PUT,
                    &format!("collections/{}/index", self.collection),
                )
                .query(&[("wait", true)])
                .json(&body)
                .send()
                .await?;

            if response.status().is_success() {
                tracing::debug!(collection = %self.collection, field, schema, "Payload index ensured");
            } else if response.status() == StatusCode::CONFLICT {
                tracing::debug!(collection = %self.collection, field, schema, "Payload index already exists");
            } else {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                let error = VectorStoreError::UnexpectedStatus { status, body };
                tracing::warn!(collection = %self.collection, field, schema, error = %error, "Failed to ensure payload index");
            }
        }

        Ok(())
    }

    async fn collection_exists(&self) -> Result<bool, VectorStoreError> {
        let response = self
            .request(Method::GET, &format!("collections/{}", self.collection))
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => {
                let body = response.text().await.unwrap_or_default();
                let error = VectorStoreError::UnexpectedStatus { status, body };
                tracing::error!(collection = %self.collection, error = %error, "Collection existence check failed");
                Err(error)
            }
        }
    }

    async fn count_for_file(&self, file_id: Uuid) -> Result<usize, VectorStoreError> {
        let response = self
            .request(
                Method::POST,
                &format!("collections/{}/points/count", self.collection),
            )
            .json(&json!({ "filter": file_filter(file_id), "exact": true }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(VectorStoreError::UnexpectedStatus { status, body });
        }
        let CountResponse { result } = response.json().await?;
        Ok(result.count)
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let url = format_endpoint(&self.base_url, path);
        let mut req = self.client.request(method, url);
        if let Some(api_key) = &self.api_key
            && !api_key.is_empty()
        {
            req = req.header("api-key", api_key);
        }
        req
    }

    async fn ensure_success<F>(
        &self,
        response: reqwest::Response,
        on_success: F,
    ) -> Result<(), VectorStoreError>
    where
        F: FnOnce(),
    {
        if response.status().is_success() {
            on_success();
            Ok(())
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let error = VectorStoreError::UnexpectedStatus { status, body };
            tracing::error!(error = %error, "Qdrant request failed");
            Err(error)
        }
    }
}

#[async_trait]
impl VectorStore for QdrantService {
    async fn insert(&self, records: Vec<VectorRecord>) -> Result<usize, VectorStoreError> {
        if records.is_empty() {
            return Ok(0);
        }
        check_dimensions(&records, self.dimension)?;

        let serialized: Vec<_> = records
            .into_iter()
            .map(|record| {
                json!({
                    "id": Uuid::new_v4().to_string(),
                    "vector": record.vector,
                    "payload": {
                        "file_id": record.file_id.to_string(),
                        "collection_id": record.collection_id,
                        "chunk_text": record.text,
                    },
                })
            })
            .collect();

        let point_count = serialized.len();
        let response = self
            .request(
                Method::PUT,
                &format!("collections/{}/points", self.collection),
            )
            .query(&[("wait", true)])
            .json(&json!({ "points": serialized }))
            .send()
            .await?;

        self.ensure_success(response, || {
            tracing::debug!(collection = %self.collection, points = point_count, "Points indexed");
        })
        .await?;

        Ok(point_count)
    }

    async fn delete_by_file(&self, file_id: Uuid) -> Result<usize, VectorStoreError> {
        let existing = self.count_for_file(file_id).await?;
        if existing == 0 {
            return Ok(0);
        }

        let response = self
            .request(
                Method::POST,
                &format!("collections/{}/points/delete", self.collection),
            )
            .query(&[("wait", true)])
            .json(&json!({ "filter": file_filter(file_id) }))
            .send()
            .await?;

        self.ensure_success(response, || {
            tracing::debug!(collection = %self.collection, file_id = %file_id, removed = existing, "Points deleted");
        })
        .await?;

        Ok(existing)
    }

    async fn search(
        &self,
        vector: Vec<f32>,
        collection_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<VectorHit>, VectorStoreError> {
        if vector.len() != self.dimension {
            return Err(VectorStoreError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }

        let mut body = json!({
            "query": vector,
            "limit": limit.max(1),
            "with_payload": true,
        });
        if let Some(collection_id) = collection_id
            && let Some(obj) = body.as_object_mut()
        {
            obj.insert(
                "filter".into(),
                json!({
                    "must": [ { "key": "collection_id", "match": { "value": collection_id } } ]
                }),
            );
        }

        let response = self
            .request(
                Method::POST,
                &format!("collections/{}/points/query", self.collection),
            )
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let error = VectorStoreError::UnexpectedStatus { status, body };
            tracing::error!(collection = %self.collection, error = %error, "Qdrant search failed");
            return Err(error);
        }

        let payload: QueryResponse = response.json().await?;
        let points = match payload.result {
            QueryResponseResult::Points(points) => points,
            QueryResponseResult::Object { points } => points,
        };

        Ok(points.into_iter().map(map_point).collect())
    }
}

fn file_filter(file_id: Uuid) -> Value {
    json!({
        "must": [ { "key": "file_id", "match": { "value": file_id.to_string() } } ]
    })
}

fn map_point(point: QueryPoint) -> VectorHit {
    let payload = point.payload.unwrap_or_default();
    VectorHit {
        id: stringify_point_id(point.id),
        score: point.score,
        file_id: payload
            .get("file_id")
            .and_then(Value::as_str)
            .and_then(|value| Uuid::parse_str(value).ok()),
        collection_id: payload.get("collection_id").and_then(Value::as_i64),
        text: payload
            .get("chunk_text")
            .and_then(Value::as_str)
            .map(str::to_string),
    }
}

fn normalize_base_url(url: &str) -> Result<String, String> {
    let mut parsed = reqwest::Url::parse(url).map_err(|err| err.to_string())?;
    let path = parsed.path().trim_end_matches('/').to_string();
    parsed.set_path(&path);
    Ok(parsed.to_string())
}

fn format_endpoint(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    format!("{base}/{path}")
}

fn stringify_point_id(id: Value) -> String {
    match id {
        Value::String(text) => text,
        Value::Number(number) => number.to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::{Method::POST, Method::PUT, MockServer};

    fn service_for(server: &MockServer, dimension: usize) -> QdrantService {
        QdrantService {
            client: Client::builder()
                .user_agent("knowledge-ingest-test")
                .build()
                .expect("client"),
            base_url: server.base_url(),
            api_key: None,
            collection: "health_documents".into(),
            dimension,
        }
    }

    #[tokio::test]
    async fn insert_writes_file_and_collection_payload() {
        let server = MockServer::start_async().await;
        let file_id = Uuid::now_v7();
        let expected_file = file_id.to_string();
        let mock = server
            .mock_async(|when, then| {
                when.method(PUT)
                    .path("/collections/health_documents/points")
                    .query_param("wait", "true")
                    .body_contains(&expected_file)
                    .body_contains("\"collection_id\":9")
                    .body_contains("\"chunk_text\":\"hello\"");
                then.status(200).json_body(json!({ "status": "ok", "result": {} }));
            })
            .await;

        let service = service_for(&server, 2);
        let written = service
            .insert(vec![VectorRecord {
                file_id,
                collection_id: Some(9),
                text: "hello".into(),
                vector: vec![0.1, 0.2],
            }])
            .await
            .expect("insert");

        mock.assert_async().await;
        assert_eq!(written, 1);
    }

    #[tokio::test]
    async fn insert_rejects_wrong_dimension_without_calling_qdrant() {
        let server = MockServer::start_async().await;
        let service = service_for(&server, 3);
        let error = service
            .insert(vec![VectorRecord {
                file_id: Uuid::now_v7(),
                collection_id: None,
                text: "x".into(),
                vector: vec![0.1],
            }])
            .await
            .expect_err("dimension");
        assert!(matches!(
            error,
            VectorStoreError::DimensionMismatch {
                expected: 3,
                actual: 1
            }
        ));
    }

    #[tokio::test]
    async fn delete_by_file_counts_then_deletes() {
        let server = MockServer::start_async().await;
        let file_id = Uuid::now_v7();
        let count = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/collections/health_documents/points/count")
                    .body_contains("\"exact\":true");
                then.status(200).json_body(json!({ "result": { "count": 4 } }));
            })
            .await;
        let delete = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/collections/health_documents/points/delete")
                    .query_param("wait", "true")
                    .body_contains("file_id");
                then.status(200).json_body(json!({ "status": "ok" }));
            })
            .await;

        let service = service_for(&server, 2);
        let removed = service.delete_by_file(file_id).await.expect("delete");

        count.assert_async().await;
        delete.assert_async().await;
        assert_eq!(removed, 4);
    }

    #[tokio::test]
    async fn search_filters_on_collection_and_maps_payload() {
        let server = MockServer::start_async().await;
        let file_id = Uuid::now_v7();
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/collections/health_documents/points/query")
                    .body_contains("\"key\":\"collection_id\"");
                then.status(200).json_body(json!({
                    "status": "ok",
                    "result": {
                        "points": [
                            {
                                "id": "point-1",
                                "score": 0.8,
                                "payload": {
                                    "file_id": file_id.to_string(),
                                    "collection_id": 5,
                                    "chunk_text": "Hypertension guidance"
                                }
                            }
                        ]
                    }
                }));
            })
            .await;

        let service = service_for(&server, 2);
        let hits = service
            .search(vec![0.3, 0.4], Some(5), 3)
            .await
            .expect("search");

        mock.assert_async().await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "point-1");
        assert_eq!(hits[0].file_id, Some(file_id));
        assert_eq!(hits[0].collection_id, Some(5));
        assert_eq!(hits[0].text.as_deref(), Some("Hypertension guidance"));
    }
}
