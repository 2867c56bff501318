//! Minimal one-shot HTTP/1.1 client shared by the backend adapters.
//!
//! One TCP (or TLS) connection per request: connect, handshake, send,
//! collect the body, drop. Backend control traffic is low-volume, so
//! connection reuse buys nothing worth the pooling machinery.

use std::sync::Arc;

use bytes::Bytes;
use http::{Request, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use tracing::debug;

use crate::error::{ProviderError, ProviderResult};

/// Parsed endpoint: scheme + host + authority (`host:port`).
#[derive(Debug, Clone)]
pub(crate) struct Endpoint {
    pub https: bool,
    pub host: String,
    pub authority: String,
}

impl Endpoint {
    /// Parse an endpoint URL like `http://127.0.0.1:2375` or
    /// `https://ecs.eu-west-1.amazonaws.com`.
    pub fn parse(endpoint: &str) -> ProviderResult<Self> {
        let uri: Uri = endpoint
            .parse()
            .map_err(|e| ProviderError::Backend(format!("invalid endpoint {endpoint}: {e}")))?;
        let https = match uri.scheme_str() {
            Some("http") | None => false,
            Some("https") => true,
            Some(other) => {
                return Err(ProviderError::Backend(format!(
                    "unsupported scheme {other} in endpoint {endpoint}"
                )));
            }
        };
        let host = uri
            .host()
            .ok_or_else(|| ProviderError::Backend(format!("endpoint {endpoint} has no host")))?
            .to_string();
        let port = uri.port_u16().unwrap_or(if https { 443 } else { 80 });
        Ok(Self {
            https,
            authority: format!("{host}:{port}"),
            host,
        })
    }

    /// Host header value: the authority with any default port elided.
    pub fn host_header(&self) -> String {
        let default_suffix = if self.https { ":443" } else { ":80" };
        match self.authority.strip_suffix(default_suffix) {
            Some(host) => host.to_string(),
            None => self.authority.clone(),
        }
    }
}

/// Send a request to the endpoint and collect the full response body.
pub(crate) async fn send(
    endpoint: &Endpoint,
    req: Request<Full<Bytes>>,
) -> ProviderResult<(StatusCode, Bytes)> {
    let stream = tokio::net::TcpStream::connect(&endpoint.authority)
        .await
        .map_err(|e| ProviderError::Backend(format!("connect {}: {e}", endpoint.authority)))?;

    if endpoint.https {
        let connector = tls_connector();
        let server_name = rustls::pki_types::ServerName::try_from(endpoint.host.clone())
            .map_err(|e| ProviderError::Backend(format!("invalid host {}: {e}", endpoint.host)))?;
        let tls = connector
            .connect(server_name, stream)
            .await
            .map_err(|e| ProviderError::Backend(format!("tls {}: {e}", endpoint.host)))?;
        exchange(TokioIo::new(tls), req).await
    } else {
        exchange(TokioIo::new(stream), req).await
    }
}

async fn exchange<I>(io: I, req: Request<Full<Bytes>>) -> ProviderResult<(StatusCode, Bytes)>
where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| ProviderError::Backend(format!("handshake: {e}")))?;

    // Drive the connection in the background.
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let uri = req.uri().clone();
    let resp = sender
        .send_request(req)
        .await
        .map_err(|e| ProviderError::Backend(format!("request {uri}: {e}")))?;

    let status = resp.status();
    let body = resp
        .into_body()
        .collect()
        .await
        .map_err(|e| ProviderError::Backend(format!("read body {uri}: {e}")))?
        .to_bytes();

    debug!(%uri, %status, bytes = body.len(), "backend response");
    Ok((status, body))
}

fn tls_connector() -> tokio_rustls::TlsConnector {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    tokio_rustls::TlsConnector::from(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_http_endpoint_with_port() {
        let ep = Endpoint::parse("http://127.0.0.1:2375").unwrap();
        assert!(!ep.https);
        assert_eq!(ep.authority, "127.0.0.1:2375");
    }

    #[test]
    fn parse_https_endpoint_defaults_port() {
        let ep = Endpoint::parse("https://ecs.eu-west-1.amazonaws.com").unwrap();
        assert!(ep.https);
        assert_eq!(ep.authority, "ecs.eu-west-1.amazonaws.com:443");
        assert_eq!(ep.host, "ecs.eu-west-1.amazonaws.com");
    }

    #[test]
    fn parse_rejects_unknown_scheme() {
        assert!(Endpoint::parse("unix:///var/run/docker.sock").is_err());
    }
}
