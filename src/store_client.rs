//! HTTP facade over the external workspace store service.
//!
//! The broker and scheduler are transport-agnostic; persistence of task
//! records, caching, and data-integrity checks live behind this service and
//! are reached over plain HTTP+JSON with `reqwest`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::config::StoreConfig;
use crate::contracts::TaskMessage;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("store returned {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("not found")]
    NotFound,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredTask {
    pub task_id: Uuid,
    pub task: TaskMessage,
    pub stored_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueView {
    pub queue: String,
    pub depth: u32,
    pub oldest_task_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub checked: u64,
    pub repaired: u64,
    pub unrepairable: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemStats {
    pub total_tasks: u64,
    pub active_tasks: u64,
    pub cache_entries: u64,
    pub uptime_seconds: u64,
}

/// Thin client over the store service's REST surface: AI-task CRUD, queue
/// inspection/cleanup, a small cache, data-integrity maintenance, and
/// system stats/health.
pub struct StoreClient {
    http: Client,
    base_url: String,
    auth_token: std::sync::RwLock<Option<String>>,
}

impl StoreClient {
    pub fn new(config: &StoreConfig) -> Result<Self, StoreError> {
        let http = Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            auth_token: std::sync::RwLock::new(config.auth_token.clone()),
        })
    }

    pub fn set_auth_token(&self, token: impl Into<String>) {
        *self.auth_token.write().unwrap() = Some(token.into());
    }

    pub fn clear_auth_token(&self) {
        *self.auth_token.write().unwrap() = None;
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let mut builder = self.http.request(method, url);
        if let Some(token) = self.auth_token.read().unwrap().as_ref() {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, StoreError> {
        if response.status() == StatusCode::NOT_FOUND {
            return Err(StoreError::NotFound);
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Status { status, body });
        }
        Ok(response)
    }

    pub async fn put_task(&self, task: &TaskMessage) -> Result<StoredTask, StoreError> {
        let response = self
            .request(reqwest::Method::PUT, &format!("/tasks/{}", task.task_id))
            .json(task)
            .send()
            .await?;
        let response = Self::check_status(response).await?;
        Ok(response.json().await?)
    }

    pub async fn get_task(&self, task_id: Uuid) -> Result<StoredTask, StoreError> {
        let response = self
            .request(reqwest::Method::GET, &format!("/tasks/{task_id}"))
            .send()
            .await?;
        let response = Self::check_status(response).await?;
        Ok(response.json().await?)
    }

    pub async fn delete_task(&self, task_id: Uuid) -> Result<(), StoreError> {
        let response = self
            .request(reqwest::Method::DELETE, &format!("/tasks/{task_id}"))
            .send()
            .await?;
        Self::check_status(response).await?;
        Ok(())
    }

    pub async fn queue_view(&self, queue: &str) -> Result<QueueView, StoreError> {
        let response = self
            .request(reqwest::Method::GET, &format!("/queues/{queue}"))
            .send()
            .await?;
        let response = Self::check_status(response).await?;
        Ok(response.json().await?)
    }

    pub async fn cleanup_queue(&self, queue: &str) -> Result<u32, StoreError> {
        let response = self
            .request(reqwest::Method::POST, &format!("/queues/{queue}/cleanup"))
            .send()
            .await?;
        let response = Self::check_status(response).await?;
        #[derive(Deserialize)]
        struct CleanupResponse {
            removed: u32,
        }
        Ok(response.json::<CleanupResponse>().await?.removed)
    }

    pub async fn cache_get(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
        let response = self
            .request(reqwest::Method::GET, &format!("/cache/{key}"))
            .send()
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            _ => {
                let response = Self::check_status(response).await?;
                Ok(Some(response.json().await?))
            }
        }
    }

    pub async fn cache_set(&self, key: &str, value: &serde_json::Value, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut body = serde_json::json!({ "value": value });
        if let Some(ttl) = ttl {
            body["ttl_seconds"] = serde_json::json!(ttl.as_secs());
        }
        let response = self
            .request(reqwest::Method::PUT, &format!("/cache/{key}"))
            .json(&body)
            .send()
            .await?;
        Self::check_status(response).await?;
        Ok(())
    }

    pub async fn cache_delete(&self, key: &str) -> Result<(), StoreError> {
        let response = self
            .request(reqwest::Method::DELETE, &format!("/cache/{key}"))
            .send()
            .await?;
        Self::check_status(response).await?;
        Ok(())
    }

    /// Deletes every cache entry whose key matches `pattern` (the store
    /// service's own glob syntax, e.g. `node:123:*`) and returns the count
    /// removed.
    pub async fn cache_delete_pattern(&self, pattern: &str) -> Result<u64, StoreError> {
        let response = self
            .request(reqwest::Method::DELETE, "/cache")
            .query(&[("pattern", pattern)])
            .send()
            .await?;
        let response = Self::check_status(response).await?;
        #[derive(Deserialize)]
        struct DeleteResponse {
            removed: u64,
        }
        Ok(response.json::<DeleteResponse>().await?.removed)
    }

    /// Stores many task records in one round trip.
    pub async fn batch_put_tasks(&self, tasks: &[TaskMessage]) -> Result<Vec<StoredTask>, StoreError> {
        let response = self
            .request(reqwest::Method::POST, "/tasks/batch")
            .json(&serde_json::json!({ "tasks": tasks }))
            .send()
            .await?;
        let response = Self::check_status(response).await?;
        #[derive(Deserialize)]
        struct BatchPutResponse {
            tasks: Vec<StoredTask>,
        }
        Ok(response.json::<BatchPutResponse>().await?.tasks)
    }

    /// Fetches many task records in one round trip. Ids the store has no
    /// record for are simply absent from the result, not an error.
    pub async fn batch_get_tasks(&self, task_ids: &[Uuid]) -> Result<Vec<StoredTask>, StoreError> {
        let response = self
            .request(reqwest::Method::POST, "/tasks/batch/get")
            .json(&serde_json::json!({ "task_ids": task_ids }))
            .send()
            .await?;
        let response = Self::check_status(response).await?;
        #[derive(Deserialize)]
        struct BatchGetResponse {
            tasks: Vec<StoredTask>,
        }
        Ok(response.json::<BatchGetResponse>().await?.tasks)
    }

    pub async fn validate_integrity(&self) -> Result<IntegrityReport, StoreError> {
        let response = self
            .request(reqwest::Method::POST, "/integrity/validate")
            .send()
            .await?;
        let response = Self::check_status(response).await?;
        Ok(response.json().await?)
    }

    pub async fn repair_integrity(&self) -> Result<IntegrityReport, StoreError> {
        let response = self
            .request(reqwest::Method::POST, "/integrity/repair")
            .send()
            .await?;
        let response = Self::check_status(response).await?;
        Ok(response.json().await?)
    }

    pub async fn system_stats(&self) -> Result<SystemStats, StoreError> {
        let response = self.request(reqwest::Method::GET, "/stats").send().await?;
        let response = Self::check_status(response).await?;
        Ok(response.json().await?)
    }

    pub async fn health_check(&self) -> Result<bool, StoreError> {
        let response = self.request(reqwest::Method::GET, "/health").send().await?;
        Ok(response.status().is_success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config_for(base_url: String) -> StoreConfig {
        StoreConfig {
            base_url,
            auth_token: None,
            timeout: Duration::from_secs(5),
            retries: 0,
        }
    }

    #[tokio::test]
    async fn health_check_reflects_2xx() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let client = StoreClient::new(&config_for(server.uri())).unwrap();
        assert!(client.health_check().await.unwrap());
    }

    #[tokio::test]
    async fn get_task_not_found_maps_to_not_found_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = StoreClient::new(&config_for(server.uri())).unwrap();
        let err = client.get_task(Uuid::new_v4()).await;
        assert!(matches!(err, Err(StoreError::NotFound)));
    }

    #[tokio::test]
    async fn cache_get_missing_key_returns_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/cache/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = StoreClient::new(&config_for(server.uri())).unwrap();
        assert!(client.cache_get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cache_delete_pattern_returns_removed_count() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/cache"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "removed": 3 })))
            .mount(&server)
            .await;

        let client = StoreClient::new(&config_for(server.uri())).unwrap();
        assert_eq!(client.cache_delete_pattern("node:*").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn batch_get_tasks_returns_only_known_ids() {
        use crate::contracts::{Priority, TaskMetadata, TaskType};

        let server = MockServer::start().await;
        let known = Uuid::new_v4();
        let task = TaskMessage {
            task_id: known,
            task_type: TaskType::Generate,
            inputs: vec!["hello".to_string()],
            context: None,
            instruction: None,
            node_id: "node-1".to_string(),
            project_id: "project-1".to_string(),
            user_id: "user-1".to_string(),
            priority: Priority::Normal,
            timestamp: Utc::now(),
            temperature: None,
            retry_count: 0,
            metadata: TaskMetadata::default(),
        };
        Mock::given(method("POST"))
            .and(path("/tasks/batch/get"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "tasks": [{
                    "task_id": known,
                    "task": task,
                    "stored_at": Utc::now(),
                }]
            })))
            .mount(&server)
            .await;

        let client = StoreClient::new(&config_for(server.uri())).unwrap();
        let missing = Uuid::new_v4();
        let tasks = client.batch_get_tasks(&[known, missing]).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].task_id, known);
    }

    #[tokio::test]
    async fn system_stats_deserializes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/stats"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "total_tasks": 10,
                "active_tasks": 2,
                "cache_entries": 5,
                "uptime_seconds": 3600
            })))
            .mount(&server)
            .await;

        let client = StoreClient::new(&config_for(server.uri())).unwrap();
        let stats = client.system_stats().await.unwrap();
        assert_eq!(stats.total_tasks, 10);
    }
}
