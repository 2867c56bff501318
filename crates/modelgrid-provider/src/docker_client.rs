//! Thin client for the container runtime's Engine REST API.
//!
//! Speaks HTTP/1.1 to a TCP endpoint (`DOCKER_HOST`-style
//! `http://host:2375`). Only the handful of calls the adapter needs are
//! implemented; 404s surface as [`ProviderError::NotFound`] so the adapter
//! can decide which operations treat absence as success.

use std::collections::HashMap;

use bytes::Bytes;
use http::{Method, Request, StatusCode};
use http_body_util::Full;
use serde::Deserialize;
use tracing::debug;

use modelgrid_core::ExecOutput;

use crate::error::{ProviderError, ProviderResult};
use crate::httpc::{self, Endpoint};

const API_VERSION: &str = "v1.43";

/// Client handle for one Engine API endpoint.
#[derive(Debug, Clone)]
pub struct DockerClient {
    endpoint: Endpoint,
}

// ── Wire types ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerInspect {
    pub id: String,
    pub state: ContainerState,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerState {
    pub status: String,
    pub running: bool,
    pub health: Option<ContainerHealth>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerHealth {
    pub status: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerSummary {
    pub id: String,
    pub names: Vec<String>,
    pub image: String,
    /// Machine state, e.g. "running", "exited".
    pub state: String,
    /// Human status, e.g. "Up 5 minutes (healthy)".
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct IdResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ExecInspect {
    exit_code: Option<i64>,
    #[allow(dead_code)]
    running: bool,
}

impl DockerClient {
    pub fn new(endpoint: &str) -> ProviderResult<Self> {
        Ok(Self {
            endpoint: Endpoint::parse(endpoint)?,
        })
    }

    // ── Images ─────────────────────────────────────────────────────

    /// Pull an image. The Engine streams progress as JSON lines; reading
    /// the body to completion is what makes this call synchronous with the
    /// pull finishing.
    pub async fn pull_image(&self, image: &str) -> ProviderResult<()> {
        let path = format!(
            "/{API_VERSION}/images/create?fromImage={}",
            encode_query(image)
        );
        let (status, body) = self.request(Method::POST, &path, None).await?;
        if !status.is_success() {
            return Err(ProviderError::Backend(format!(
                "image pull {image}: {status}: {}",
                text_of(&body)
            )));
        }
        debug!(%image, "image pulled");
        Ok(())
    }

    // ── Containers ─────────────────────────────────────────────────

    /// Create a named container. Returns the container id.
    pub async fn create_container(
        &self,
        name: &str,
        config: &serde_json::Value,
    ) -> ProviderResult<String> {
        let path = format!("/{API_VERSION}/containers/create?name={}", encode_query(name));
        let (status, body) = self.request(Method::POST, &path, Some(config)).await?;
        if !status.is_success() {
            return Err(ProviderError::Backend(format!(
                "container create {name}: {status}: {}",
                text_of(&body)
            )));
        }
        let created: IdResponse = serde_json::from_slice(&body)
            .map_err(|e| ProviderError::Serialize(e.to_string()))?;
        Ok(created.id)
    }

    pub async fn start_container(&self, name: &str) -> ProviderResult<()> {
        let path = format!("/{API_VERSION}/containers/{name}/start");
        let (status, body) = self.request(Method::POST, &path, None).await?;
        match status {
            StatusCode::NO_CONTENT | StatusCode::NOT_MODIFIED => Ok(()),
            StatusCode::NOT_FOUND => Err(ProviderError::NotFound(name.to_string())),
            other => Err(ProviderError::Backend(format!(
                "container start {name}: {other}: {}",
                text_of(&body)
            ))),
        }
    }

    pub async fn stop_container(&self, name: &str) -> ProviderResult<()> {
        let path = format!("/{API_VERSION}/containers/{name}/stop?t=10");
        let (status, body) = self.request(Method::POST, &path, None).await?;
        match status {
            StatusCode::NO_CONTENT | StatusCode::NOT_MODIFIED => Ok(()),
            StatusCode::NOT_FOUND => Err(ProviderError::NotFound(name.to_string())),
            other => Err(ProviderError::Backend(format!(
                "container stop {name}: {other}: {}",
                text_of(&body)
            ))),
        }
    }

    pub async fn remove_container(&self, name: &str) -> ProviderResult<()> {
        let path = format!("/{API_VERSION}/containers/{name}?force=true");
        let (status, body) = self.request(Method::DELETE, &path, None).await?;
        match status {
            StatusCode::NO_CONTENT => Ok(()),
            StatusCode::NOT_FOUND => Err(ProviderError::NotFound(name.to_string())),
            other => Err(ProviderError::Backend(format!(
                "container remove {name}: {other}: {}",
                text_of(&body)
            ))),
        }
    }

    /// Inspect a container; None when it does not exist.
    pub async fn inspect_container(&self, name: &str) -> ProviderResult<Option<ContainerInspect>> {
        let path = format!("/{API_VERSION}/containers/{name}/json");
        let (status, body) = self.request(Method::GET, &path, None).await?;
        match status {
            StatusCode::OK => {
                let inspect: ContainerInspect = serde_json::from_slice(&body)
                    .map_err(|e| ProviderError::Serialize(e.to_string()))?;
                Ok(Some(inspect))
            }
            StatusCode::NOT_FOUND => Ok(None),
            other => Err(ProviderError::Backend(format!(
                "container inspect {name}: {other}: {}",
                text_of(&body)
            ))),
        }
    }

    /// List containers (including stopped ones) carrying the given label.
    pub async fn list_containers(&self, label: &str) -> ProviderResult<Vec<ContainerSummary>> {
        let filters = serde_json::json!({ "label": [label] }).to_string();
        let path = format!(
            "/{API_VERSION}/containers/json?all=true&filters={}",
            encode_query(&filters)
        );
        let (status, body) = self.request(Method::GET, &path, None).await?;
        if status != StatusCode::OK {
            return Err(ProviderError::Backend(format!(
                "container list: {status}: {}",
                text_of(&body)
            )));
        }
        serde_json::from_slice(&body).map_err(|e| ProviderError::Serialize(e.to_string()))
    }

    /// Tail a container's log, both streams combined in arrival order.
    pub async fn logs(&self, name: &str, tail: u32) -> ProviderResult<String> {
        let path =
            format!("/{API_VERSION}/containers/{name}/logs?stdout=true&stderr=true&tail={tail}");
        let (status, body) = self.request(Method::GET, &path, None).await?;
        match status {
            StatusCode::OK => {
                let (stdout, stderr) = demux_stream(&body);
                Ok(if stderr.is_empty() {
                    stdout
                } else {
                    format!("{stdout}{stderr}")
                })
            }
            StatusCode::NOT_FOUND => Err(ProviderError::NotFound(name.to_string())),
            other => Err(ProviderError::Backend(format!(
                "container logs {name}: {other}: {}",
                text_of(&body)
            ))),
        }
    }

    // ── Exec ───────────────────────────────────────────────────────

    /// Run a command in a running container and capture its output.
    pub async fn exec(&self, name: &str, command: &[String]) -> ProviderResult<ExecOutput> {
        let create_body = serde_json::json!({
            "AttachStdout": true,
            "AttachStderr": true,
            "Cmd": command,
        });
        let path = format!("/{API_VERSION}/containers/{name}/exec");
        let (status, body) = self.request(Method::POST, &path, Some(&create_body)).await?;
        if status == StatusCode::NOT_FOUND {
            return Err(ProviderError::NotFound(name.to_string()));
        }
        if !status.is_success() {
            return Err(ProviderError::Backend(format!(
                "exec create {name}: {status}: {}",
                text_of(&body)
            )));
        }
        let exec: IdResponse = serde_json::from_slice(&body)
            .map_err(|e| ProviderError::Serialize(e.to_string()))?;

        // Attached start: the response body is the multiplexed output
        // stream, closed when the command finishes.
        let start_body = serde_json::json!({ "Detach": false, "Tty": false });
        let path = format!("/{API_VERSION}/exec/{}/start", exec.id);
        let (status, body) = self.request(Method::POST, &path, Some(&start_body)).await?;
        if !status.is_success() {
            return Err(ProviderError::Backend(format!(
                "exec start {name}: {status}: {}",
                text_of(&body)
            )));
        }
        let (stdout, stderr) = demux_stream(&body);

        let path = format!("/{API_VERSION}/exec/{}/json", exec.id);
        let (status, body) = self.request(Method::GET, &path, None).await?;
        let exit_code = if status == StatusCode::OK {
            serde_json::from_slice::<ExecInspect>(&body)
                .map(|i| i.exit_code)
                .unwrap_or(None)
        } else {
            None
        };

        Ok(ExecOutput {
            exit_code,
            stdout,
            stderr,
        })
    }

    // ── Plumbing ───────────────────────────────────────────────────

    async fn request(
        &self,
        method: Method,
        path_and_query: &str,
        body: Option<&serde_json::Value>,
    ) -> ProviderResult<(StatusCode, Bytes)> {
        let payload = match body {
            Some(value) => serde_json::to_vec(value)
                .map_err(|e| ProviderError::Serialize(e.to_string()))?,
            None => Vec::new(),
        };
        let mut builder = Request::builder()
            .method(method)
            .uri(path_and_query)
            .header("host", &self.endpoint.authority)
            .header("user-agent", "modelgrid/0.1");
        if body.is_some() {
            builder = builder.header("content-type", "application/json");
        }
        let req = builder
            .body(Full::new(Bytes::from(payload)))
            .map_err(|e| ProviderError::Backend(e.to_string()))?;
        httpc::send(&self.endpoint, req).await
    }
}

/// Split an Engine multiplexed stream into (stdout, stderr).
///
/// Frames are `[stream_type, 0, 0, 0, len_be32, payload]`; TTY streams
/// carry no framing and are treated as stdout wholesale.
fn demux_stream(raw: &[u8]) -> (String, String) {
    if raw.first().is_none_or(|b| *b > 2) {
        return (String::from_utf8_lossy(raw).into_owned(), String::new());
    }

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut rest = raw;
    while rest.len() >= 8 {
        let stream_type = rest[0];
        let len = u32::from_be_bytes([rest[4], rest[5], rest[6], rest[7]]) as usize;
        let end = (8 + len).min(rest.len());
        let payload = &rest[8..end];
        if stream_type == 2 {
            stderr.extend_from_slice(payload);
        } else {
            stdout.extend_from_slice(payload);
        }
        rest = &rest[end..];
    }

    (
        String::from_utf8_lossy(&stdout).into_owned(),
        String::from_utf8_lossy(&stderr).into_owned(),
    )
}

/// Percent-encode a query component (RFC 3986 unreserved set kept).
fn encode_query(raw: &str) -> String {
    let mut encoded = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(byte as char);
            }
            other => {
                encoded.push('%');
                encoded.push_str(&format!("{other:02X}"));
            }
        }
    }
    encoded
}

fn text_of(body: &[u8]) -> String {
    String::from_utf8_lossy(body).trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn demux_splits_streams() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&[1, 0, 0, 0, 0, 0, 0, 5]);
        raw.extend_from_slice(b"hello");
        raw.extend_from_slice(&[2, 0, 0, 0, 0, 0, 0, 4]);
        raw.extend_from_slice(b"oops");
        raw.extend_from_slice(&[1, 0, 0, 0, 0, 0, 0, 6]);
        raw.extend_from_slice(b" world");

        let (stdout, stderr) = demux_stream(&raw);
        assert_eq!(stdout, "hello world");
        assert_eq!(stderr, "oops");
    }

    #[test]
    fn demux_passes_tty_output_through() {
        let raw = b"plain tty output";
        let (stdout, stderr) = demux_stream(raw);
        assert_eq!(stdout, "plain tty output");
        assert!(stderr.is_empty());
    }

    #[test]
    fn demux_tolerates_truncated_frame() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&[1, 0, 0, 0, 0, 0, 0, 100]);
        raw.extend_from_slice(b"short");

        let (stdout, _) = demux_stream(&raw);
        assert_eq!(stdout, "short");
    }

    #[test]
    fn query_encoding() {
        assert_eq!(encode_query("jupyter/base-notebook:py311"), "jupyter%2Fbase-notebook%3Apy311");
        assert_eq!(
            encode_query(r#"{"label":["a=b"]}"#),
            "%7B%22label%22%3A%5B%22a%3Db%22%5D%7D"
        );
    }

    #[test]
    fn inspect_deserializes_engine_shape() {
        let json = r#"{
            "Id": "abc123",
            "State": {
                "Status": "running",
                "Running": true,
                "Health": { "Status": "healthy" }
            }
        }"#;
        let inspect: ContainerInspect = serde_json::from_str(json).unwrap();
        assert_eq!(inspect.state.status, "running");
        assert_eq!(inspect.state.health.unwrap().status, "healthy");
    }

    #[test]
    fn summary_deserializes_engine_shape() {
        let json = r#"[{
            "Id": "abc",
            "Names": ["/i-jupyter-alice"],
            "Image": "jupyter/base-notebook:py311",
            "State": "exited",
            "Status": "Exited (0) 2 hours ago",
            "Labels": { "modelgrid.managed": "true", "modelgrid.kind": "jupyter" }
        }]"#;
        let summaries: Vec<ContainerSummary> = serde_json::from_str(json).unwrap();
        assert_eq!(summaries[0].names[0], "/i-jupyter-alice");
        assert_eq!(summaries[0].status, "Exited (0) 2 hours ago");
        assert_eq!(summaries[0].labels["modelgrid.kind"], "jupyter");
    }
}
