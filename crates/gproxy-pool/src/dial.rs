use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use gproxy_account::Headers;
use http::Uri;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::errors::DialError;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Abstracts the actual network dial so the pool's acquire/selection logic
/// can be exercised in tests against a fake that never touches a socket.
pub trait Dialer: Send + Sync {
    fn dial<'a>(
        &'a self,
        url: &'a str,
        headers: &'a Headers,
        proxy: Option<&'a str>,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<(WsStream, Headers), DialError>> + Send + 'a>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TungsteniteDialer;

impl Dialer for TungsteniteDialer {
    fn dial<'a>(
        &'a self,
        url: &'a str,
        headers: &'a Headers,
        proxy: Option<&'a str>,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<(WsStream, Headers), DialError>> + Send + 'a>> {
        Box::pin(async move {
            tokio::time::timeout(timeout, dial_inner(url, headers, proxy))
                .await
                .map_err(|_| DialError {
                    status: None,
                    headers: Vec::new(),
                    cause: "dial timed out".to_string(),
                })?
        })
    }
}

async fn dial_inner(
    url: &str,
    headers: &Headers,
    proxy: Option<&str>,
) -> Result<(WsStream, Headers), DialError> {
    let mut request = url.into_client_request().map_err(|e| DialError {
        status: None,
        headers: Vec::new(),
        cause: e.to_string(),
    })?;
    for (name, value) in headers {
        let header_name: http::header::HeaderName = name.parse().map_err(|_| DialError {
            status: None,
            headers: Vec::new(),
            cause: format!("invalid dial header name: {name}"),
        })?;
        let header_value = http::header::HeaderValue::from_str(value).map_err(|_| DialError {
            status: None,
            headers: Vec::new(),
            cause: format!("invalid dial header value for {name}"),
        })?;
        request.headers_mut().insert(header_name, header_value);
    }

    let uri: Uri = url.parse().map_err(|e: http::uri::InvalidUri| DialError {
        status: None,
        headers: Vec::new(),
        cause: e.to_string(),
    })?;
    let host = uri.host().ok_or_else(|| DialError {
        status: None,
        headers: Vec::new(),
        cause: "dial url has no host".to_string(),
    })?;
    let port = uri.port_u16().unwrap_or(443);

    let tcp = match proxy {
        Some(proxy_url) => connect_via_proxy(proxy_url, host, port).await?,
        None => TcpStream::connect((host, port)).await.map_err(|e| DialError {
            status: None,
            headers: Vec::new(),
            cause: e.to_string(),
        })?,
    };

    let (stream, response) = tokio_tungstenite::client_async_tls(request, tcp)
        .await
        .map_err(|e| DialError {
            status: extract_status(&e),
            headers: Vec::new(),
            cause: e.to_string(),
        })?;

    let handshake_headers = response
        .headers()
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
        .collect();

    Ok((stream, handshake_headers))
}

/// Opens a plain CONNECT tunnel through an HTTP proxy, then hands the
/// resulting TCP stream to the TLS/WS handshake as if dialed directly.
async fn connect_via_proxy(proxy_url: &str, host: &str, port: u16) -> Result<TcpStream, DialError> {
    let proxy_uri: Uri = proxy_url.parse().map_err(|e: http::uri::InvalidUri| DialError {
        status: None,
        headers: Vec::new(),
        cause: e.to_string(),
    })?;
    let proxy_host = proxy_uri.host().ok_or_else(|| DialError {
        status: None,
        headers: Vec::new(),
        cause: "proxy url has no host".to_string(),
    })?;
    let proxy_port = proxy_uri.port_u16().unwrap_or(80);

    let mut stream = TcpStream::connect((proxy_host, proxy_port)).await.map_err(|e| DialError {
        status: None,
        headers: Vec::new(),
        cause: format!("proxy connect failed: {e}"),
    })?;

    let connect_req = format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n\r\n");
    stream.write_all(connect_req.as_bytes()).await.map_err(|e| DialError {
        status: None,
        headers: Vec::new(),
        cause: e.to_string(),
    })?;

    let mut buf = [0u8; 512];
    let n = stream.read(&mut buf).await.map_err(|e| DialError {
        status: None,
        headers: Vec::new(),
        cause: e.to_string(),
    })?;
    let response = String::from_utf8_lossy(&buf[..n]);
    if !response.starts_with("HTTP/1.1 200") && !response.starts_with("HTTP/1.0 200") {
        return Err(DialError {
            status: None,
            headers: Vec::new(),
            cause: format!("proxy CONNECT rejected: {}", response.lines().next().unwrap_or("")),
        });
    }

    Ok(stream)
}

fn extract_status(err: &tokio_tungstenite::tungstenite::Error) -> Option<u16> {
    match err {
        tokio_tungstenite::tungstenite::Error::Http(resp) => Some(resp.status().as_u16()),
        _ => None,
    }
}
