//! SignalR JSON hub protocol over WebSockets.
//!
//! # Protocol
//!
//! ```text
//!   POST {hub}/negotiate?negotiateVersion=1   (Bearer)
//!        ◄── { connectionToken, availableTransports }  or  { url, accessToken }
//!   GET  ws(s)://{hub}?id={connectionToken}    (Bearer, upgrade)
//!   ──► {"protocol":"json","version":1}␞
//!   ◄── {}␞                                     handshake accepted
//!   ◄── {"type":1,"target":"Notification","arguments":[{...}]}␞
//!   ◄── {"type":6}␞                             server ping
//!   ──► {"type":6}␞                             client keep-alive
//!   ◄── {"type":7,"error":"...","allowReconnect":true}␞
//! ```
//!
//! Records are JSON objects terminated by the ASCII record separator
//! (`0x1e`). A WebSocket frame may carry several records and a record may
//! in principle span frames, so frames are appended to a buffer and split.
//!
//! Only the WebSockets transport is implemented; negotiation fails if the
//! server does not offer it.

use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use reqwest::Url;
use serde::Deserialize;
use tokio::time::{Instant, Interval, MissedTickBehavior};

use super::transport::{Disconnect, Invocation, PushConnection, PushTransport};
use super::PushError;
use crate::config::Config;
use crate::credentials::Credential;
use crate::ws::{self, WsFrame, WsReader, WsWriter};

const RECORD_SEPARATOR: char = '\u{1e}';
const HANDSHAKE_REQUEST: &str = "{\"protocol\":\"json\",\"version\":1}\u{1e}";
const PING_RECORD: &str = "{\"type\":6}\u{1e}";
const CLOSE_RECORD: &str = "{\"type\":7}\u{1e}";

/// Redirects followed during negotiation before giving up.
const MAX_NEGOTIATE_REDIRECTS: usize = 5;

/// Upper bound on a graceful close; a dead peer must not stall `stop`.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Tunables for hub connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubOptions {
    /// Connect straight to the WebSocket endpoint.
    pub skip_negotiation: bool,
    /// Interval between client pings.
    pub keepalive_interval: Duration,
    /// Silence after which the server is considered gone.
    pub server_timeout: Duration,
    /// Deadline for negotiate, upgrade and hub handshake together.
    pub handshake_timeout: Duration,
}

impl Default for HubOptions {
    fn default() -> Self {
        Self {
            skip_negotiation: false,
            keepalive_interval: Duration::from_secs(15),
            server_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(15),
        }
    }
}

impl HubOptions {
    /// Options from the session configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            skip_negotiation: config.skip_negotiation,
            keepalive_interval: config.keepalive_interval(),
            server_timeout: config.server_timeout(),
            handshake_timeout: config.handshake_timeout(),
        }
    }
}

/// Opens SignalR hub connections.
#[derive(Debug, Clone)]
pub struct SignalRTransport {
    hub_url: String,
    http: reqwest::Client,
    options: HubOptions,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NegotiateResponse {
    #[serde(default)]
    connection_id: Option<String>,
    #[serde(default)]
    connection_token: Option<String>,
    #[serde(default)]
    negotiate_version: u32,
    #[serde(default)]
    available_transports: Vec<AvailableTransport>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AvailableTransport {
    transport: String,
}

/// Where to open the WebSocket and with which token.
#[derive(Debug, PartialEq, Eq)]
struct Endpoint {
    url: String,
    token: String,
}

impl SignalRTransport {
    /// Transport for the hub at `hub_url` (an `http(s)://` URL).
    pub fn new(hub_url: impl Into<String>, options: HubOptions) -> Result<Self, PushError> {
        let http = reqwest::Client::builder()
            .timeout(options.handshake_timeout)
            .build()
            .map_err(|e| PushError::Transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            hub_url: hub_url.into(),
            http,
            options,
        })
    }

    /// Transport for the hub derived from the configured API URL.
    pub fn from_config(config: &Config) -> Result<Self, PushError> {
        Self::new(config.hub_url(), HubOptions::from_config(config))
    }

    /// Hub URL this transport connects to.
    pub fn hub_url(&self) -> &str {
        &self.hub_url
    }

    async fn negotiate(&self, credential: &Credential) -> Result<Endpoint, PushError> {
        let mut hub_url = self.hub_url.clone();
        let mut token = credential.expose().to_string();

        for _ in 0..=MAX_NEGOTIATE_REDIRECTS {
            let url = negotiate_url(&hub_url).map_err(|e| PushError::Negotiate(format!("{e:#}")))?;
            log::debug!("[SignalR] Negotiating with {}", hub_url);

            let response = self
                .http
                .post(url)
                .header(AUTHORIZATION, format!("Bearer {token}"))
                .send()
                .await
                .map_err(|e| PushError::Negotiate(e.to_string()))?;
            let status = response.status();
            if !status.is_success() {
                return Err(PushError::Negotiate(format!("negotiate returned {status}")));
            }
            let body: NegotiateResponse = response
                .json()
                .await
                .map_err(|e| PushError::Negotiate(format!("invalid negotiate response: {e}")))?;

            if let Some(error) = body.error {
                return Err(PushError::Negotiate(error));
            }
            if let Some(redirect) = body.url {
                log::debug!("[SignalR] Negotiate redirected to {}", redirect);
                hub_url = redirect;
                if let Some(access_token) = body.access_token {
                    token = access_token;
                }
                continue;
            }
            if !body
                .available_transports
                .iter()
                .any(|t| t.transport == "WebSockets")
            {
                return Err(PushError::Negotiate(
                    "server does not offer the WebSockets transport".to_string(),
                ));
            }

            let id = if body.negotiate_version >= 1 {
                body.connection_token
            } else {
                body.connection_id
            }
            .ok_or_else(|| PushError::Negotiate("negotiate response has no connection id".to_string()))?;

            let url = connect_url(&hub_url, &id).map_err(|e| PushError::Negotiate(format!("{e:#}")))?;
            return Ok(Endpoint { url, token });
        }

        Err(PushError::Negotiate("too many negotiate redirects".to_string()))
    }

    async fn open(&self, credential: &Credential) -> Result<SignalRConnection, PushError> {
        let endpoint = if self.options.skip_negotiation {
            Endpoint {
                url: self.hub_url.clone(),
                token: credential.expose().to_string(),
            }
        } else {
            self.negotiate(credential).await?
        };

        let ws_url = ws::http_to_ws_scheme(&endpoint.url);
        let (mut writer, mut reader) = ws::connect(&ws_url, Some(&endpoint.token))
            .await
            .map_err(|e| PushError::Transport(format!("{e:#}")))?;

        writer
            .send_text(HANDSHAKE_REQUEST)
            .await
            .map_err(|e| PushError::Transport(format!("{e:#}")))?;
        let leftover = read_handshake(&mut reader).await?;

        log::info!("[SignalR] Connected to {}", self.hub_url);
        Ok(SignalRConnection::new(writer, reader, leftover, &self.options))
    }
}

#[async_trait]
impl PushTransport for SignalRTransport {
    async fn connect(&self, credential: &Credential) -> Result<Box<dyn PushConnection>, PushError> {
        let timeout = self.options.handshake_timeout;
        let connection = tokio::time::timeout(timeout, self.open(credential))
            .await
            .map_err(|_| PushError::Timeout(timeout))??;
        Ok(Box::new(connection))
    }
}

/// Wait for the handshake response. Returns whatever followed it in the
/// same frame.
async fn read_handshake(reader: &mut WsReader) -> Result<String, PushError> {
    #[derive(Deserialize)]
    struct HandshakeResponse {
        #[serde(default)]
        error: Option<String>,
    }

    let mut buffer = String::new();
    loop {
        match reader.recv().await {
            Some(Ok(WsFrame::Text(text))) => {
                buffer.push_str(&text);
                let Some(end) = buffer.find(RECORD_SEPARATOR) else {
                    continue;
                };
                let response: HandshakeResponse = serde_json::from_str(&buffer[..end])
                    .map_err(|e| PushError::Handshake(format!("invalid handshake response: {e}")))?;
                if let Some(error) = response.error {
                    return Err(PushError::Handshake(error));
                }
                return Ok(buffer[end + 1..].to_string());
            }
            Some(Ok(WsFrame::Close { code, reason })) => {
                return Err(PushError::Handshake(format!(
                    "connection closed during handshake ({code}) {reason}"
                )));
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(PushError::Transport(format!("{e:#}"))),
            None => {
                return Err(PushError::Handshake(
                    "connection ended during handshake".to_string(),
                ))
            }
        }
    }
}

/// `{hub}/negotiate?negotiateVersion=1`, keeping any query on the hub URL.
fn negotiate_url(hub_url: &str) -> anyhow::Result<Url> {
    let mut url = Url::parse(hub_url).with_context(|| format!("invalid hub URL: {hub_url}"))?;
    let path = format!("{}/negotiate", url.path().trim_end_matches('/'));
    url.set_path(&path);
    url.query_pairs_mut().append_pair("negotiateVersion", "1");
    Ok(url)
}

/// `{hub}?id={connection}`.
fn connect_url(hub_url: &str, connection: &str) -> anyhow::Result<String> {
    let mut url = Url::parse(hub_url).with_context(|| format!("invalid hub URL: {hub_url}"))?;
    url.query_pairs_mut().append_pair("id", connection);
    Ok(url.into())
}

/// One decoded hub record.
#[derive(Debug, PartialEq)]
enum HubMessage {
    Invocation(Invocation),
    Ping,
    Close {
        error: Option<String>,
        allow_reconnect: bool,
    },
    /// Stream items, completions and other records a listener never needs.
    Ignored(u8),
}

fn parse_record(record: &str) -> anyhow::Result<HubMessage> {
    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct RawRecord {
        #[serde(rename = "type")]
        kind: u8,
        #[serde(default)]
        target: Option<String>,
        #[serde(default)]
        arguments: Vec<serde_json::Value>,
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        allow_reconnect: bool,
    }

    let raw: RawRecord = serde_json::from_str(record).context("record is not a hub message")?;
    Ok(match raw.kind {
        1 => {
            let Some(target) = raw.target else {
                bail!("invocation without target");
            };
            let payload = raw.arguments.into_iter().next().unwrap_or_default();
            HubMessage::Invocation(Invocation { target, payload })
        }
        6 => HubMessage::Ping,
        7 => HubMessage::Close {
            error: raw.error,
            allow_reconnect: raw.allow_reconnect,
        },
        other => HubMessage::Ignored(other),
    })
}

/// An established hub connection.
#[derive(Debug)]
struct SignalRConnection {
    writer: WsWriter,
    reader: WsReader,
    buffer: String,
    keepalive: Interval,
    server_timeout: Duration,
    last_seen: Instant,
    closed: bool,
}

impl SignalRConnection {
    fn new(writer: WsWriter, reader: WsReader, leftover: String, options: &HubOptions) -> Self {
        let now = Instant::now();
        let mut keepalive =
            tokio::time::interval_at(now + options.keepalive_interval, options.keepalive_interval);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            writer,
            reader,
            buffer: leftover,
            keepalive,
            server_timeout: options.server_timeout,
            last_seen: now,
            closed: false,
        }
    }

    /// Pop the next complete record from the buffer.
    fn next_record(&mut self) -> Option<String> {
        let end = self.buffer.find(RECORD_SEPARATOR)?;
        let record = self.buffer[..end].to_string();
        self.buffer.drain(..=end);
        Some(record)
    }
}

#[async_trait]
impl PushConnection for SignalRConnection {
    async fn next_event(&mut self) -> Result<Invocation, Disconnect> {
        loop {
            while let Some(record) = self.next_record() {
                match parse_record(&record) {
                    Ok(HubMessage::Invocation(invocation)) => return Ok(invocation),
                    Ok(HubMessage::Ping) => {}
                    Ok(HubMessage::Ignored(kind)) => {
                        log::trace!("[SignalR] Ignoring record of type {}", kind);
                    }
                    Ok(HubMessage::Close {
                        error,
                        allow_reconnect,
                    }) => {
                        let reason = match error {
                            Some(error) => format!("server closed the connection: {error}"),
                            None => "server closed the connection".to_string(),
                        };
                        return Err(Disconnect {
                            reason,
                            allow_reconnect,
                        });
                    }
                    Err(e) => log::warn!("[SignalR] Dropping malformed record: {e:#}"),
                }
            }

            let deadline = self.last_seen + self.server_timeout;
            tokio::select! {
                frame = self.reader.recv() => match frame {
                    Some(Ok(WsFrame::Text(text))) => {
                        self.last_seen = Instant::now();
                        self.buffer.push_str(&text);
                    }
                    Some(Ok(WsFrame::Binary(_))) => {
                        self.last_seen = Instant::now();
                        log::warn!("[SignalR] Ignoring binary frame on a JSON hub");
                    }
                    Some(Ok(WsFrame::Control)) => self.last_seen = Instant::now(),
                    Some(Ok(WsFrame::Close { code, reason })) => {
                        return Err(Disconnect::transient(format!("WebSocket closed ({code}) {reason}")));
                    }
                    Some(Err(e)) => return Err(Disconnect::transient(format!("{e:#}"))),
                    None => return Err(Disconnect::transient("WebSocket stream ended")),
                },
                _ = self.keepalive.tick() => {
                    if let Err(e) = self.writer.send_text(PING_RECORD).await {
                        return Err(Disconnect::transient(format!("keep-alive failed: {e:#}")));
                    }
                }
                () = tokio::time::sleep_until(deadline) => {
                    return Err(Disconnect::transient(format!(
                        "no message from server in {}s",
                        self.server_timeout.as_secs()
                    )));
                }
            }
        }
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let shutdown = async {
            let _ = self.writer.send_text(CLOSE_RECORD).await;
            self.writer.close().await
        };
        match tokio::time::timeout(CLOSE_TIMEOUT, shutdown).await {
            Ok(Ok(())) => log::debug!("[SignalR] Connection closed"),
            Ok(Err(e)) => log::debug!("[SignalR] Close on dead connection: {e:#}"),
            Err(_) => log::debug!("[SignalR] Close timed out"),
        }
    }
}
