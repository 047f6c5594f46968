//! Protocol upgrade handling
//!
//! Detects upgrade requests, derives upstream WebSocket URLs, and splices
//! bytes between the hijacked client connection and the upstream once a
//! 101 response comes back. The relay runs both directions concurrently
//! and terminates when either side closes.

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::error::{GatewayError, Result};

/// The upgrade type named by the request, when `Connection: Upgrade` is
/// present.
pub fn upgrade_type(headers: &http::HeaderMap) -> Option<String> {
    let connection_names_upgrade = headers
        .get_all(http::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    if !connection_names_upgrade {
        return None;
    }
    headers
        .get(http::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase())
}

/// Check if an HTTP request is a WebSocket upgrade request.
pub fn is_websocket_upgrade(headers: &http::HeaderMap) -> bool {
    upgrade_type(headers).as_deref() == Some("websocket")
}

/// Build the upstream WebSocket URL from the backend URL and request path.
pub fn build_ws_url(backend_url: &str, path_and_query: &str) -> String {
    let backend = backend_url.trim_end_matches('/');

    let ws_url = if backend.starts_with("https://") {
        backend.replacen("https://", "wss://", 1)
    } else if backend.starts_with("http://") {
        backend.replacen("http://", "ws://", 1)
    } else if backend.starts_with("ws://") || backend.starts_with("wss://") {
        backend.to_string()
    } else {
        format!("ws://{}", backend)
    };

    format!("{}{}", ws_url, path_and_query)
}

/// Connect to an upstream WebSocket server.
pub async fn connect_upstream(url: &str) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>> {
    let (ws_stream, _response) = connect_async(url).await.map_err(|e| {
        GatewayError::UpstreamUnreachable(format!("WebSocket upstream connection failed: {}", e))
    })?;
    Ok(ws_stream)
}

/// Relay messages bidirectionally between two WebSocket streams.
pub async fn relay_websocket<A, B>(mut client: WebSocketStream<A>, mut upstream: WebSocketStream<B>)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            msg = client.next() => {
                match msg {
                    Some(Ok(msg)) => {
                        if msg.is_close() {
                            let _ = upstream.close(None).await;
                            break;
                        }
                        if upstream.send(msg).await.is_err() {
                            break;
                        }
                    }
                    _ => break,
                }
            }
            msg = upstream.next() => {
                match msg {
                    Some(Ok(msg)) => {
                        if msg.is_close() {
                            let _ = client.close(None).await;
                            break;
                        }
                        if client.send(msg).await.is_err() {
                            break;
                        }
                    }
                    _ => break,
                }
            }
        }
    }

    let _ = client.close(None).await;
    let _ = upstream.close(None).await;
}

/// Splice raw bytes between the hijacked client connection and the
/// upstream after a 101 response. Returns when either direction closes.
pub async fn splice<A, B>(mut client: A, mut upstream: B)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
        Ok((to_upstream, to_client)) => {
            tracing::debug!(to_upstream, to_client, "Upgrade relay finished");
        }
        Err(e) => {
            tracing::debug!(error = %e, "Upgrade relay ended");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> http::HeaderMap {
        let mut map = http::HeaderMap::new();
        for (k, v) in pairs {
            map.append(
                http::header::HeaderName::from_bytes(k.as_bytes()).unwrap(),
                v.parse().unwrap(),
            );
        }
        map
    }

    // --- Upgrade detection ---

    #[test]
    fn test_upgrade_type_requires_connection_token() {
        assert_eq!(upgrade_type(&headers(&[])), None);
        assert_eq!(
            upgrade_type(&headers(&[("upgrade", "websocket")])),
            None,
            "Upgrade header alone is not an upgrade request"
        );
        assert_eq!(
            upgrade_type(&headers(&[("connection", "Upgrade"), ("upgrade", "WebSocket")])),
            Some("websocket".to_string())
        );
        assert_eq!(
            upgrade_type(&headers(&[("connection", "keep-alive, Upgrade"), ("upgrade", "h2c")])),
            Some("h2c".to_string())
        );
    }

    #[test]
    fn test_is_websocket_upgrade() {
        assert!(is_websocket_upgrade(&headers(&[
            ("connection", "Upgrade"),
            ("upgrade", "websocket")
        ])));
        assert!(!is_websocket_upgrade(&headers(&[
            ("connection", "Upgrade"),
            ("upgrade", "h2c")
        ])));
        assert!(!is_websocket_upgrade(&headers(&[])));
    }

    // --- URL derivation ---

    #[test]
    fn test_build_ws_url_from_http() {
        assert_eq!(
            build_ws_url("http://127.0.0.1:8001", "/ws/chat"),
            "ws://127.0.0.1:8001/ws/chat"
        );
    }

    #[test]
    fn test_build_ws_url_from_https() {
        assert_eq!(
            build_ws_url("https://backend.example.com", "/ws"),
            "wss://backend.example.com/ws"
        );
    }

    #[test]
    fn test_build_ws_url_already_ws() {
        assert_eq!(build_ws_url("ws://127.0.0.1:9000", "/chat"), "ws://127.0.0.1:9000/chat");
    }

    #[test]
    fn test_build_ws_url_with_query() {
        assert_eq!(
            build_ws_url("http://127.0.0.1:8001/", "/ws?token=abc"),
            "ws://127.0.0.1:8001/ws?token=abc"
        );
    }

    #[test]
    fn test_build_ws_url_bare_host() {
        assert_eq!(build_ws_url("127.0.0.1:8001", "/ws"), "ws://127.0.0.1:8001/ws");
    }

    // --- Splice ---

    #[tokio::test]
    async fn test_splice_until_close() {
        let (client_near, mut client_far) = tokio::io::duplex(1024);
        let (upstream_near, mut upstream_far) = tokio::io::duplex(1024);

        let relay = tokio::spawn(splice(client_near, upstream_near));

        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        client_far.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        upstream_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        upstream_far.write_all(b"pong").await.unwrap();
        client_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        // closing one side terminates the relay
        drop(client_far);
        relay.await.unwrap();
    }
}
