//! WebSocket plumbing for the push hub.
//!
//! Wraps `tokio-tungstenite` into a writer/reader pair so the hub
//! connection can send keep-alive pings from one `tokio::select!` branch
//! while another branch waits for frames. Pings are answered by
//! tungstenite itself and surface only as [`WsFrame::Control`].

use anyhow::{Context, Result};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Data frame received from the peer.
#[derive(Debug, PartialEq, Eq)]
pub enum WsFrame {
    /// UTF-8 text frame.
    Text(String),
    /// Binary frame.
    Binary(Vec<u8>),
    /// Any frame without payload for us (ping, pong).
    Control,
    /// Close frame.
    Close {
        /// Close code (1005 when the peer sent none).
        code: u16,
        /// Close reason.
        reason: String,
    },
}

/// Write half.
#[derive(Debug)]
pub struct WsWriter {
    sink: SplitSink<WsStream, tungstenite::Message>,
}

impl WsWriter {
    /// Send a text frame.
    pub async fn send_text(&mut self, text: &str) -> Result<()> {
        self.sink
            .send(tungstenite::Message::Text(text.to_string()))
            .await
            .context("WebSocket send failed")
    }

    /// Send a close frame and shut the sink.
    pub async fn close(&mut self) -> Result<()> {
        // Peer may already be gone; the sink still has to be closed
        let _ = self.sink.send(tungstenite::Message::Close(None)).await;
        self.sink.close().await.context("WebSocket close failed")
    }
}

/// Read half.
#[derive(Debug)]
pub struct WsReader {
    stream: SplitStream<WsStream>,
}

impl WsReader {
    /// Next frame, or `None` once the stream has ended.
    pub async fn recv(&mut self) -> Option<Result<WsFrame>> {
        let message = match self.stream.next().await? {
            Ok(message) => message,
            Err(e) => return Some(Err(anyhow::anyhow!("WebSocket read error: {e}"))),
        };
        Some(Ok(match message {
            tungstenite::Message::Text(text) => WsFrame::Text(text),
            tungstenite::Message::Binary(data) => WsFrame::Binary(data),
            tungstenite::Message::Close(frame) => {
                let (code, reason) = frame
                    .map(|f| (f.code.into(), f.reason.to_string()))
                    .unwrap_or((1005, String::new()));
                WsFrame::Close { code, reason }
            }
            tungstenite::Message::Ping(_)
            | tungstenite::Message::Pong(_)
            | tungstenite::Message::Frame(_) => WsFrame::Control,
        }))
    }
}

/// Open a WebSocket to `url`, presenting `bearer` on the upgrade request.
///
/// The token travels in the `Authorization` header only, never in the URL.
pub async fn connect(url: &str, bearer: Option<&str>) -> Result<(WsWriter, WsReader)> {
    use tungstenite::client::IntoClientRequest;
    use tungstenite::http::header::AUTHORIZATION;
    use tungstenite::http::HeaderValue;

    let mut request = url
        .into_client_request()
        .with_context(|| format!("invalid WebSocket URL: {url}"))?;
    if let Some(token) = bearer {
        let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
            .context("bearer token is not a valid header value")?;
        value.set_sensitive(true);
        request.headers_mut().insert(AUTHORIZATION, value);
    }

    let (stream, response) = tokio_tungstenite::connect_async(request)
        .await
        .with_context(|| format!("WebSocket upgrade to {url} failed"))?;
    log::debug!("[Ws] Upgraded {} ({})", url, response.status());

    let (sink, stream) = stream.split();
    Ok((WsWriter { sink }, WsReader { stream }))
}

/// Rewrite an `http(s)://` URL to `ws(s)://`. WebSocket URLs pass through.
#[must_use]
pub fn http_to_ws_scheme(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        url.to_string()
    }
}
