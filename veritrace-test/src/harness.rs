use anyhow::{Context, Result};
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tower::ServiceExt;
use veritrace::server::{build_router, init_engine};
use veritrace_core::{Config, VeritraceEngine};

pub struct TestApp {
    router: Router,
    engine: Arc<VeritraceEngine>,
}

impl TestApp {
    pub async fn new(mut config: Config) -> Result<Self> {
        config.server.cors_enabled = false;
        config.server.verbose = false;
        config.store.backend = "memory".into();
        config.engine.flush_interval_ms = 1;
        config.build.update_timeout_ms = 10;

        let engine = init_engine(&config)?;
        let router = build_router(&config, Arc::clone(&engine));

        Ok(Self { router, engine })
    }

    pub fn engine(&self) -> &Arc<VeritraceEngine> {
        &self.engine
    }

    pub async fn post_json(
        &self,
        path: &str,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let (status, body) = self.request("POST", path, Some(payload)).await?;
        ensure_success(status, body)
    }

    pub async fn get_json(&self, path: &str) -> Result<serde_json::Value> {
        let (status, body) = self.request("GET", path, None).await?;
        ensure_success(status, body)
    }

    pub async fn delete(&self, path: &str) -> Result<serde_json::Value> {
        let (status, body) = self.request("DELETE", path, None).await?;
        ensure_success(status, body)
    }

    /// Send a request and return the status with the decoded body, whatever
    /// the status.
    pub async fn request(
        &self,
        method: &str,
        path: &str,
        payload: Option<serde_json::Value>,
    ) -> Result<(StatusCode, serde_json::Value)> {
        let builder = Request::builder().method(method).uri(path);
        let request = match payload {
            Some(payload) => builder
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&payload)?))?,
            None => builder.body(Body::empty())?,
        };

        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .context("router execution failed")?;

        let status = response.status();
        let bytes = response.into_body().collect().await?.to_bytes();
        let body = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .with_context(|| format!("non-JSON response with status {}", status))?
        };
        Ok((status, body))
    }

    /// Open a trace and return its id.
    pub async fn open_trace(&self, name: &str, start_time: i64) -> Result<String> {
        let created = self
            .post_json(
                "/api/traces",
                serde_json::json!({ "name": name, "start_time": start_time }),
            )
            .await?;
        created["data"]["id"]
            .as_str()
            .map(str::to_string)
            .context("trace id missing from response")
    }

    /// Poll the trace until its background build reaches a terminal state.
    pub async fn wait_for_build(&self, trace_id: &str) -> Result<serde_json::Value> {
        let path = format!("/api/traces/{trace_id}");
        for _ in 0..200 {
            let summary = self.get_json(&path).await?;
            let state = summary["data"]["build_state"].as_str().unwrap_or_default();
            if matches!(state, "complete" | "cancelled") {
                return Ok(summary);
            }
            sleep(Duration::from_millis(10)).await;
        }
        Err(anyhow::anyhow!("build of trace {trace_id} did not finish"))
    }
}

fn ensure_success(status: StatusCode, body: serde_json::Value) -> Result<serde_json::Value> {
    if !status.is_success() {
        anyhow::bail!("request failed with status {}: {}", status, body);
    }
    Ok(body)
}
