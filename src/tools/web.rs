//! HTTP 工具：GET / POST / 下载，客户端带统一超时；下载目标限制在工作目录内

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, RequestBuilder, Response};
use serde_json::{json, Value};

use crate::tools::filesystem::SafeFs;
use crate::tools::registry::{mentions_any, required_str, Capability};
use crate::workflow::Params;

const USER_AGENT: &str = concat!("autotask/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WebOp {
    Get,
    Post,
    DownloadFile,
}

impl WebOp {
    const ALL: [WebOp; 3] = [WebOp::Get, WebOp::Post, WebOp::DownloadFile];

    fn as_str(self) -> &'static str {
        match self {
            WebOp::Get => "get",
            WebOp::Post => "post",
            WebOp::DownloadFile => "download_file",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.as_str() == s)
    }
}

/// HTTP 工具（`web_operations`）
pub struct WebOperations {
    client: Client,
    fs: SafeFs,
    timeout_secs: u64,
}

impl WebOperations {
    pub fn new(base_path: impl AsRef<Path>, timeout_secs: u64) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            fs: SafeFs::new(base_path),
            timeout_secs,
        }
    }

    fn request_error(&self, e: reqwest::Error) -> Value {
        let error = if e.is_timeout() {
            format!("Request timed out after {} seconds", self.timeout_secs)
        } else {
            e.to_string()
        };
        json!({"success": false, "error": error})
    }

    async fn send(&self, request: RequestBuilder, params: &Params, ok: &[u16]) -> Value {
        let request = request.headers(headers(params));
        match request.send().await {
            Ok(resp) => response_value(resp, ok).await,
            Err(e) => self.request_error(e),
        }
    }

    async fn download(&self, params: &Params) -> Result<Value, String> {
        let url = required_str(params, "url")?;
        let save_path = required_str(params, "save_path")?;
        let target = self.fs.resolve(save_path)?;

        let resp = match self.client.get(url).send().await.and_then(Response::error_for_status) {
            Ok(resp) => resp,
            Err(e) => return Ok(self.request_error(e)),
        };
        let bytes = match resp.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => return Ok(self.request_error(e)),
        };
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| format!("Create directory failed: {e}"))?;
        }
        tokio::fs::write(&target, &bytes)
            .await
            .map_err(|e| format!("Write failed: {e}"))?;
        tracing::info!(url = %url, path = %target.display(), size = bytes.len(), "file downloaded");
        Ok(json!({
            "success": true,
            "file_path": target.to_string_lossy(),
            "size": bytes.len(),
        }))
    }
}

fn headers(params: &Params) -> HeaderMap {
    let mut map = HeaderMap::new();
    if let Some(Value::Object(headers)) = params.get("headers") {
        for (k, v) in headers {
            let (Ok(name), Some(Ok(value))) = (
                HeaderName::from_bytes(k.as_bytes()),
                v.as_str().map(HeaderValue::from_str),
            ) else {
                continue;
            };
            map.insert(name, value);
        }
    }
    map
}

async fn response_value(resp: Response, ok: &[u16]) -> Value {
    let status = resp.status().as_u16();
    let url = resp.url().to_string();
    let headers: serde_json::Map<String, Value> = resp
        .headers()
        .iter()
        .filter_map(|(k, v)| Some((k.to_string(), Value::String(v.to_str().ok()?.to_string()))))
        .collect();
    let content = resp.text().await.unwrap_or_default();
    json!({
        "success": ok.contains(&status),
        "status_code": status,
        "content": content,
        "headers": headers,
        "url": url,
    })
}

#[async_trait]
impl Capability for WebOperations {
    fn name(&self) -> &str {
        "web_operations"
    }

    fn description(&self) -> &str {
        "HTTP GET / POST requests and file downloads"
    }

    fn operations(&self) -> Vec<&'static str> {
        WebOp::ALL.iter().map(|op| op.as_str()).collect()
    }

    fn default_operation(&self, description: &str) -> Option<&'static str> {
        let op = if mentions_any(description, &["download"]) {
            WebOp::DownloadFile
        } else if mentions_any(description, &["get", "fetch"]) {
            WebOp::Get
        } else if mentions_any(description, &["post"]) {
            WebOp::Post
        } else {
            return None;
        };
        Some(op.as_str())
    }

    async fn execute(&self, operation: &str, params: &Params) -> Result<Value, String> {
        let op = WebOp::parse(operation).ok_or_else(|| format!("Unsupported operation: {operation}"))?;
        let result = match op {
            WebOp::Get => match required_str(params, "url") {
                Ok(url) => {
                    let mut request = self.client.get(url);
                    if let Some(Value::Object(query)) = params.get("params") {
                        let pairs: Vec<(String, String)> = query
                            .iter()
                            .map(|(k, v)| (k.clone(), v.as_str().map_or_else(|| v.to_string(), str::to_string)))
                            .collect();
                        request = request.query(&pairs);
                    }
                    Ok(self.send(request, params, &[200]).await)
                }
                Err(e) => Err(e),
            },
            WebOp::Post => match required_str(params, "url") {
                Ok(url) => {
                    let mut request = self.client.post(url);
                    if let Some(body) = params.get("json_data") {
                        request = request.json(body);
                    }
                    Ok(self.send(request, params, &[200, 201]).await)
                }
                Err(e) => Err(e),
            },
            WebOp::DownloadFile => self.download(params).await,
        };
        Ok(result.unwrap_or_else(|e| json!({"success": false, "error": e})))
    }
}
