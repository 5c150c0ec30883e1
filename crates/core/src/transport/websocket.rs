//
// Copyright (c) 2025 TRUSTEDGE LABS LLC
// This source code is subject to the terms of the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Project: obsidion-bridge — End-to-end encrypted peer bridge over an untrusted relay.
//

//! WebSocket transport over tokio-tungstenite.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};

use super::{Transport, TransportEvent, CLOSE_ABNORMAL};
use crate::error::TransportError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket client transport.
///
/// Sends the declared origin as the `Origin` upgrade header, which the relay
/// forwards to the peer for origin validation.
#[derive(Default)]
pub struct WebSocketTransport {
    stream: Option<WsStream>,
}

impl WebSocketTransport {
    pub fn new() -> Self {
        Self { stream: None }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&mut self, url: &str, origin: &str) -> Result<(), TransportError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| TransportError::ConnectionFailed(format!("invalid url: {}", e)))?;
        let origin_value = HeaderValue::from_str(origin)
            .map_err(|e| TransportError::ConnectionFailed(format!("invalid origin: {}", e)))?;
        request.headers_mut().insert("Origin", origin_value);

        debug!(url, origin, "opening websocket");
        let (stream, _response) = connect_async(request)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        self.stream = Some(stream);
        Ok(())
    }

    async fn send_frame(&mut self, frame: &str) -> Result<(), TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotOpen)?;
        stream
            .send(Message::Text(frame.to_string()))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn next_event(&mut self) -> Result<TransportEvent, TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotOpen)?;
        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    trace!(len = text.len(), "frame received");
                    return Ok(TransportEvent::Frame(text));
                }
                Some(Ok(Message::Binary(bytes))) => {
                    // The relay speaks JSON text; accept UTF-8 binary frames
                    // from lenient intermediaries, drop anything else.
                    if let Ok(text) = String::from_utf8(bytes) {
                        return Ok(TransportEvent::Frame(text));
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    self.stream = None;
                    let (code, reason) = match frame {
                        Some(f) => (u16::from(f.code), f.reason.into_owned()),
                        None => (1005, String::new()),
                    };
                    return Ok(TransportEvent::Closed {
                        code,
                        reason,
                        was_clean: true,
                    });
                }
                // tungstenite answers pings internally on the next flush.
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    self.stream = None;
                    return Ok(TransportEvent::Closed {
                        code: CLOSE_ABNORMAL,
                        reason: e.to_string(),
                        was_clean: false,
                    });
                }
                None => {
                    self.stream = None;
                    return Ok(TransportEvent::Closed {
                        code: CLOSE_ABNORMAL,
                        reason: "connection reset".to_string(),
                        was_clean: false,
                    });
                }
            }
        }
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError> {
        if let Some(mut stream) = self.stream.take() {
            let frame = CloseFrame {
                code: CloseCode::from(code),
                reason: reason.to_string().into(),
            };
            // Best effort: the peer may already be gone.
            let _ = stream.close(Some(frame)).await;
        }
        Ok(())
    }
}
