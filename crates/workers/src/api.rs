//! HTTP client for one worker.
//!
//! Covers both completion protocols: the ComfyUI-style queue endpoints
//! (`/prompt`, `/history/{id}`, `/view`, `/queue`, `/object_info/{node}`) and plain JSON `POST`
//! endpoints of synchronous workers. Bodies are decoded into the typed
//! schemas in [`crate::schemas`].

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::schemas::{HistoryResponse, ObjectInfoResponse, SubmitResponse};

/// HTTP client bound to a single worker's base URL.
#[derive(Clone)]
pub struct WorkerApi {
    client: reqwest::Client,
    base_url: String,
}

/// Errors from the worker HTTP layer.
#[derive(Debug, thiserror::Error)]
pub enum WorkerApiError {
    /// The request never got a response (connection refused, timeout, ...).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The worker answered with a non-2xx status code.
    #[error("worker API error ({status}): {body}")]
    ApiError { status: u16, body: String },

    /// The body did not match the expected schema.
    #[error("unexpected response body: {0}")]
    Decode(String),
}

impl WorkerApiError {
    /// Whether the worker could not be reached at all.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Request(_))
    }
}

impl WorkerApi {
    /// Client for the worker at `base_url` (e.g. `http://127.0.0.1:8188`),
    /// with `timeout` applied to every request.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self::with_client(client, base_url)
    }

    /// Reuse an existing [`reqwest::Client`] for connection pooling.
    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Queue a workflow graph via `POST /prompt`.
    pub async fn submit_workflow(
        &self,
        workflow: &serde_json::Value,
        client_id: &str,
    ) -> Result<SubmitResponse, WorkerApiError> {
        let body = serde_json::json!({
            "prompt": workflow,
            "client_id": client_id,
        });
        self.post_json("/prompt", &body).await
    }

    /// Fetch the history record of one prompt via `GET /history/{id}`.
    ///
    /// The returned map is empty while the prompt is still queued or
    /// running.
    pub async fn get_history(&self, prompt_id: &str) -> Result<HistoryResponse, WorkerApiError> {
        let response = self
            .client
            .get(format!("{}/history/{}", self.base_url, prompt_id))
            .send()
            .await?;
        Self::parse_response(response).await
    }

    /// Input schema of one node class via `GET /object_info/{node}`.
    pub async fn object_info(&self, node: &str) -> Result<ObjectInfoResponse, WorkerApiError> {
        let response = self
            .client
            .get(format!("{}/object_info/{}", self.base_url, node))
            .send()
            .await?;
        Self::parse_response(response).await
    }

    /// Download an output file via `GET /view`.
    pub async fn view(
        &self,
        filename: &str,
        subfolder: &str,
        kind: &str,
    ) -> Result<Vec<u8>, WorkerApiError> {
        let response = self
            .client
            .get(format!("{}/view", self.base_url))
            .query(&[("filename", filename), ("subfolder", subfolder), ("type", kind)])
            .send()
            .await?;
        let response = Self::ensure_success(response).await?;
        Ok(response.bytes().await?.to_vec())
    }

    /// Remove a queued prompt via `POST /queue`.
    pub async fn cancel_prompt(&self, prompt_id: &str) -> Result<(), WorkerApiError> {
        let body = serde_json::json!({ "delete": [prompt_id] });
        let response = self
            .client
            .post(format!("{}/queue", self.base_url))
            .json(&body)
            .send()
            .await?;
        Self::ensure_success(response).await?;
        Ok(())
    }

    /// `POST` a JSON body to `endpoint` and decode the JSON reply.
    pub async fn post_json<B, T>(&self, endpoint: &str, body: &B) -> Result<T, WorkerApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, endpoint))
            .json(body)
            .send()
            .await?;
        Self::parse_response(response).await
    }

    // ---- private helpers ----

    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, WorkerApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(WorkerApiError::ApiError {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// Read the body as text and decode it, keeping schema mismatches
    /// distinct from transport failures.
    async fn parse_response<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, WorkerApiError> {
        let response = Self::ensure_success(response).await?;
        let text = response.text().await?;
        serde_json::from_str(&text).map_err(|e| WorkerApiError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use axum::Json;

    use super::*;

    async fn serve(app: axum::Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn submit_sends_prompt_and_client_id() {
        let app = axum::Router::new().route(
            "/prompt",
            post(|Json(body): Json<serde_json::Value>| async move {
                assert_eq!(body["client_id"], "kiln-test");
                assert!(body["prompt"].is_object());
                Json(serde_json::json!({ "prompt_id": "abc", "number": 3 }))
            }),
        );
        let api = WorkerApi::new(serve(app).await, Duration::from_secs(5));

        let resp = api
            .submit_workflow(&serde_json::json!({}), "kiln-test")
            .await
            .unwrap();
        assert_eq!(resp.prompt_id, "abc");
        assert_eq!(resp.number, Some(3));
    }

    #[tokio::test]
    async fn non_success_status_is_an_api_error() {
        let app = axum::Router::new().route(
            "/prompt",
            post(|| async { (StatusCode::BAD_REQUEST, "invalid prompt") }),
        );
        let api = WorkerApi::new(serve(app).await, Duration::from_secs(5));

        let err = api
            .submit_workflow(&serde_json::json!({}), "c")
            .await
            .unwrap_err();
        assert_matches!(err, WorkerApiError::ApiError { status: 400, ref body } if body == "invalid prompt");
        assert!(!err.is_transport());
    }

    #[tokio::test]
    async fn schema_mismatch_is_a_decode_error() {
        let app = axum::Router::new().route(
            "/prompt",
            post(|| async { Json(serde_json::json!({ "number": 1 })) }),
        );
        let api = WorkerApi::new(serve(app).await, Duration::from_secs(5));

        let err = api
            .submit_workflow(&serde_json::json!({}), "c")
            .await
            .unwrap_err();
        assert_matches!(err, WorkerApiError::Decode(msg) if msg.contains("prompt_id"));
    }

    #[tokio::test]
    async fn unreachable_worker_is_a_transport_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let api = WorkerApi::new(format!("http://{addr}"), Duration::from_secs(2));
        let err = api.get_history("abc").await.unwrap_err();
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn view_passes_file_coordinates_as_query() {
        use axum::extract::Query;
        use std::collections::HashMap;

        let app = axum::Router::new().route(
            "/view",
            get(|Query(q): Query<HashMap<String, String>>| async move {
                format!("{}|{}|{}", q["filename"], q["subfolder"], q["type"])
            }),
        );
        let api = WorkerApi::new(serve(app).await, Duration::from_secs(5));

        let bytes = api.view("out.png", "batch", "output").await.unwrap();
        assert_eq!(bytes, b"out.png|batch|output");
    }

    #[tokio::test]
    async fn object_info_is_fetched_per_node() {
        let app = axum::Router::new().route(
            "/object_info/{node}",
            get(|axum::extract::Path(node): axum::extract::Path<String>| async move {
                Json(serde_json::json!({
                    node: { "input": { "required": { "ckpt_name": [["m.safetensors"], {}] } } }
                }))
            }),
        );
        let api = WorkerApi::new(serve(app).await, Duration::from_secs(5));

        let info = api.object_info("CheckpointLoaderSimple").await.unwrap();
        assert_eq!(
            info["CheckpointLoaderSimple"].choices("ckpt_name"),
            vec!["m.safetensors"]
        );
    }

    #[tokio::test]
    async fn history_of_pending_prompt_is_empty() {
        let app = axum::Router::new().route(
            "/history/{id}",
            get(|| async { Json(serde_json::json!({})) }),
        );
        let api = WorkerApi::new(serve(app).await, Duration::from_secs(5));
        assert!(api.get_history("abc").await.unwrap().is_empty());
    }
}
