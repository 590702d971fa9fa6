//! HTTP implementation of the outbound call collaborator.
//!
//! Each invocation POSTs the opaque payload to `http://{address}/{method}`
//! and returns the response body. A fresh connection per request keeps
//! concurrent calls to the same instance independent of each other.

use std::time::Duration;

use async_trait::async_trait;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::Request;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;

use crate::error::{MeshError, Result};
use crate::Payload;

use super::RemoteCaller;

#[derive(Debug, Clone, Copy, Default)]
pub struct HttpCaller;

impl HttpCaller {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl RemoteCaller for HttpCaller {
    async fn invoke(
        &self,
        address: &str,
        method: &str,
        payload: Payload,
        timeout: Duration,
    ) -> Result<Payload> {
        let url = format!("http://{}/{}", address, method);

        let request = Request::builder()
            .method("POST")
            .uri(&url)
            .header("Content-Type", "application/octet-stream")
            .body(Full::new(payload))
            .map_err(|e| MeshError::Transport(format!("failed to build request: {}", e)))?;

        let client = Client::builder(TokioExecutor::new()).build_http();

        let response = tokio::time::timeout(timeout, client.request(request))
            .await
            .map_err(|_| MeshError::Timeout(timeout.as_millis() as u64))?
            .map_err(|e| MeshError::Transport(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        let body: Bytes = tokio::time::timeout(timeout, response.into_body().collect())
            .await
            .map_err(|_| MeshError::Timeout(timeout.as_millis() as u64))?
            .map_err(|e| MeshError::Transport(format!("failed to read response: {}", e)))?
            .to_bytes();

        if !status.is_success() {
            return Err(MeshError::Transport(format!(
                "remote endpoint returned {}",
                status
            )));
        }

        Ok(body)
    }
}
