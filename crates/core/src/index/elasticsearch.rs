//! Elasticsearch REST backend.
//!
//! All content types of a store branch share one index. Each type's field
//! mapping is merged into the index mapping, and the set of mapped types is
//! recorded under `_meta.content_types` so it survives process restarts.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE, USER_AGENT};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde_json::{json, Map, Value};
use tracing::{debug, info, instrument};

use crate::errors::IndexError;
use crate::index::backend::{IndexBackend, DOC_TYPE_FIELD};

#[derive(Clone)]
pub struct ElasticsearchBackend {
    http: reqwest::Client,
    base_url: String,
}

impl ElasticsearchBackend {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, IndexError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(USER_AGENT, HeaderValue::from_static("gitindex/0.1"));
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()?;
        info!(base_url = %base_url, "created ElasticsearchBackend");
        Ok(Self { http, base_url })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}/{}", self.base_url, path))
    }

    async fn check_response(resp: Response) -> Result<Response, IndexError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(IndexError::Backend {
            status: status.as_u16(),
            body,
        })
    }

    async fn current_mapping(&self, index: &str) -> Result<Value, IndexError> {
        let resp = self
            .request(Method::GET, &format!("{}/_mapping", index))
            .send()
            .await?;
        let mapping: Value = Self::check_response(resp).await?.json().await?;
        Ok(mapping
            .get(index)
            .and_then(|m| m.get("mappings"))
            .cloned()
            .unwrap_or_else(|| json!({})))
    }
}

/// Pull the `properties` object out of a mapping, accepting either the full
/// `{"properties": ...}` form or a bare property map.
fn properties_of(mapping: &Value) -> Map<String, Value> {
    match mapping.get("properties").and_then(Value::as_object) {
        Some(props) => props.clone(),
        None => mapping.as_object().cloned().unwrap_or_default(),
    }
}

#[async_trait]
impl IndexBackend for ElasticsearchBackend {
    #[instrument(skip(self))]
    async fn exists(&self, index: &str) -> Result<bool, IndexError> {
        let resp = self.request(Method::HEAD, index).send().await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(false),
            _ => Self::check_response(resp).await.map(|_| true),
        }
    }

    #[instrument(skip(self))]
    async fn is_ready(&self, index: &str) -> Result<bool, IndexError> {
        let resp = self
            .request(Method::GET, &format!("_cluster/health/{}", index))
            .query(&[("wait_for_status", "yellow"), ("timeout", "1s")])
            .send()
            .await?;
        // 404 while the index is still being allocated, 408 on health timeout.
        if matches!(
            resp.status(),
            StatusCode::NOT_FOUND | StatusCode::REQUEST_TIMEOUT
        ) {
            return Ok(false);
        }
        let health: Value = Self::check_response(resp).await?.json().await?;
        let timed_out = health["timed_out"].as_bool().unwrap_or(false);
        let status = health["status"].as_str().unwrap_or("red");
        debug!(index, status, timed_out, "cluster health");
        Ok(!timed_out && matches!(status, "yellow" | "green"))
    }

    #[instrument(skip(self))]
    async fn create_index(&self, index: &str) -> Result<(), IndexError> {
        let body = json!({
            "mappings": {
                "properties": { DOC_TYPE_FIELD: { "type": "keyword" } },
                "_meta": { "content_types": {} }
            }
        });
        let resp = self.request(Method::PUT, index).json(&body).send().await?;
        match Self::check_response(resp).await {
            Err(IndexError::Backend { body, .. })
                if body.contains("resource_already_exists_exception") =>
            {
                Err(IndexError::AlreadyExists(index.to_string()))
            }
            Err(e) => Err(e),
            Ok(_) => {
                info!(index, "created index");
                Ok(())
            }
        }
    }

    #[instrument(skip(self, mapping))]
    async fn put_mapping(
        &self,
        index: &str,
        content_type: &str,
        mapping: &Value,
    ) -> Result<(), IndexError> {
        let mut types: Map<String, Value> = self
            .current_mapping(index)
            .await?
            .pointer("/_meta/content_types")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        types.insert(content_type.to_string(), Value::Bool(true));

        let mut properties = properties_of(mapping);
        properties.insert(DOC_TYPE_FIELD.to_string(), json!({ "type": "keyword" }));
        let body = json!({
            "properties": properties,
            "_meta": { "content_types": types }
        });
        let resp = self
            .request(Method::PUT, &format!("{}/_mapping", index))
            .json(&body)
            .send()
            .await?;
        Self::check_response(resp).await?;
        debug!(index, content_type, "put mapping");
        Ok(())
    }

    async fn mapped_types(&self, index: &str) -> Result<Vec<String>, IndexError> {
        if !self.exists(index).await? {
            return Ok(Vec::new());
        }
        let mapping = self.current_mapping(index).await?;
        Ok(mapping
            .pointer("/_meta/content_types")
            .and_then(Value::as_object)
            .map(|types| types.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn upsert(
        &self,
        index: &str,
        content_type: &str,
        id: &str,
        document: &Value,
    ) -> Result<(), IndexError> {
        let resp = self
            .request(Method::PUT, &format!("{}/_doc/{}", index, id))
            .json(document)
            .send()
            .await?;
        Self::check_response(resp).await?;
        debug!(index, content_type, id, "upserted document");
        Ok(())
    }

    async fn remove(&self, index: &str, id: &str) -> Result<bool, IndexError> {
        let resp = self
            .request(Method::DELETE, &format!("{}/_doc/{}", index, id))
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        Self::check_response(resp).await?;
        debug!(index, id, "removed document");
        Ok(true)
    }

    #[instrument(skip(self))]
    async fn delete_index(&self, index: &str) -> Result<bool, IndexError> {
        let resp = self.request(Method::DELETE, index).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        Self::check_response(resp).await?;
        info!(index, "deleted index");
        Ok(true)
    }

    async fn refresh(&self, index: &str) -> Result<(), IndexError> {
        let resp = self
            .request(Method::POST, &format!("{}/_refresh", index))
            .send()
            .await?;
        Self::check_response(resp).await?;
        Ok(())
    }

    async fn count(&self, index: &str, content_type: Option<&str>) -> Result<u64, IndexError> {
        let body = match content_type {
            Some(t) => json!({ "query": { "term": { DOC_TYPE_FIELD: t } } }),
            None => json!({ "query": { "match_all": {} } }),
        };
        let resp = self
            .request(Method::POST, &format!("{}/_count", index))
            .json(&body)
            .send()
            .await?;
        let result: Value = Self::check_response(resp).await?.json().await?;
        Ok(result["count"].as_u64().unwrap_or(0))
    }
}
