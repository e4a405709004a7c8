//! Opens the TLS-PSK (port 443) or self-encrypted HTTP (port 80) transport
//! to an appliance, upgrades to WebSocket, and moves frames across it.
//!
//! Ported from `HCSocket.py` (`wrap_socket_psk`, `reconnect`, `send`,
//! `recv`). The TLS-PSK variant disables hostname/chain verification (the
//! PSK itself authenticates both peers) and pins the handshake to TLS 1.2,
//! since the appliance does not negotiate 1.3. The HTTP variant passes
//! every frame through the `Framer`.

use std::pin::Pin;
use std::time::{Duration, Instant};

use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use openssl::ssl::{Ssl, SslContext, SslMethod, SslVerifyMode, SslVersion};
use tokio::net::TcpStream;
use tokio_openssl::SslStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::config::DeviceConfig;
use crate::crypto::Framer;
use crate::error::HcError;

const PSK_IDENTITY_HINT: &str = "HCCOM_Local_App";
const IO_TIMEOUT: Duration = Duration::from_secs(30);
pub const PING_INTERVAL: Duration = Duration::from_secs(120);
pub const PONG_TIMEOUT: Duration = Duration::from_secs(10);

/// Device `key`/`iv` fields arrive base64url-encoded with `=` padding
/// stripped, per `HCSocket.py` (`base64url(psk64 + "===")`).
fn base64url_decode_padded(s: &str) -> Result<Vec<u8>, HcError> {
    base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(s.trim_end_matches('='))
        .map_err(|e| HcError::Transport(format!("bad base64url key/iv material: {e}")))
}

enum WsConn {
    Tls(WebSocketStream<SslStream<TcpStream>>),
    Plain(WebSocketStream<TcpStream>),
}

pub struct Transport {
    ws: WsConn,
    framer: Option<Framer>,
    last_pong: Instant,
}

impl Transport {
    pub async fn connect(device: &DeviceConfig, domain_suffix: &str) -> Result<Transport, HcError> {
        let host = if domain_suffix.is_empty() {
            device.host.clone()
        } else {
            format!("{}.{}", device.host, domain_suffix)
        };

        let psk = base64url_decode_padded(&device.key)?;

        match &device.iv {
            None => {
                let addr = format!("{host}:443");
                let tcp = tokio::time::timeout(IO_TIMEOUT, TcpStream::connect(&addr))
                    .await
                    .map_err(|_| HcError::Transport("connect timed out".into()))?
                    .map_err(|e| HcError::Transport(format!("tcp connect {addr}: {e}")))?;

                let mut ssl_stream = build_psk_tls_stream(tcp, &psk)?;
                Pin::new(&mut ssl_stream)
                    .connect()
                    .await
                    .map_err(|e| HcError::Transport(format!("tls-psk handshake: {e}")))?;

                let uri = format!("wss://{host}:443/homeconnect");
                let request = build_request(&uri, true)?;
                let (ws, _response) = tokio_tungstenite::client_async(request, ssl_stream)
                    .await
                    .map_err(|e| HcError::Transport(format!("websocket upgrade: {e}")))?;

                Ok(Transport { ws: WsConn::Tls(ws), framer: None, last_pong: Instant::now() })
            }

            Some(iv64) => {
                let iv_bytes = base64url_decode_padded(iv64)?;
                if iv_bytes.len() != 16 {
                    return Err(HcError::Transport(format!(
                        "iv must decode to 16 bytes, got {}",
                        iv_bytes.len()
                    )));
                }
                let mut iv = [0u8; 16];
                iv.copy_from_slice(&iv_bytes);

                let addr = format!("{host}:80");
                let tcp = tokio::time::timeout(IO_TIMEOUT, TcpStream::connect(&addr))
                    .await
                    .map_err(|_| HcError::Transport("connect timed out".into()))?
                    .map_err(|e| HcError::Transport(format!("tcp connect {addr}: {e}")))?;

                let uri = format!("ws://{host}:80/homeconnect");
                let request = build_request(&uri, false)?;
                let (ws, _response) = tokio_tungstenite::client_async(request, tcp)
                    .await
                    .map_err(|e| HcError::Transport(format!("websocket upgrade: {e}")))?;

                Ok(Transport {
                    ws: WsConn::Plain(ws),
                    framer: Some(Framer::new(&psk, iv)),
                    last_pong: Instant::now(),
                })
            }
        }
    }

    /// Serialize `msg` as compact JSON, defensively swap any stray `'` for
    /// `"` (the original Python encoder's workaround; harmless but kept for
    /// parity), encrypt if this is an HTTP-variant transport, and send.
    pub async fn send_json(&mut self, msg: &crate::session::Frame) -> Result<(), HcError> {
        let mut buf = serde_json::to_string(msg)?;
        buf = buf.replace('\'', "\"");

        tracing::debug!(tx = %buf, "TX");

        match (&mut self.ws, &mut self.framer) {
            (WsConn::Tls(ws), None) => ws
                .send(Message::Text(buf))
                .await
                .map_err(|e| HcError::Transport(e.to_string())),
            (WsConn::Plain(ws), Some(framer)) => {
                let enc = framer.encrypt(&buf);
                ws.send(Message::Binary(enc))
                    .await
                    .map_err(|e| HcError::Transport(e.to_string()))
            }
            _ => unreachable!("framer presence always matches the transport variant"),
        }
    }

    pub async fn send_ping(&mut self) -> Result<(), HcError> {
        let result = match &mut self.ws {
            WsConn::Tls(ws) => ws.send(Message::Ping(Vec::new())).await,
            WsConn::Plain(ws) => ws.send(Message::Ping(Vec::new())).await,
        };
        result.map_err(|e| HcError::Transport(e.to_string()))
    }

    pub fn seconds_since_pong(&self) -> Duration {
        self.last_pong.elapsed()
    }

    /// Read the next application frame, transparently answering Pings and
    /// tracking Pongs. Returns `Ok(None)` on a clean close.
    pub async fn recv_json(&mut self) -> Result<Option<crate::session::Frame>, HcError> {
        loop {
            let next = match &mut self.ws {
                WsConn::Tls(ws) => ws.next().await,
                WsConn::Plain(ws) => ws.next().await,
            };

            let Some(msg) = next else { return Ok(None) };
            let msg = msg.map_err(|e| HcError::Transport(e.to_string()))?;

            let raw: Vec<u8> = match msg {
                Message::Text(t) => t.into_bytes(),
                Message::Binary(b) => b,
                Message::Ping(payload) => {
                    let send = match &mut self.ws {
                        WsConn::Tls(ws) => ws.send(Message::Pong(payload)).await,
                        WsConn::Plain(ws) => ws.send(Message::Pong(payload)).await,
                    };
                    send.map_err(|e| HcError::Transport(e.to_string()))?;
                    continue;
                }
                Message::Pong(_) => {
                    self.last_pong = Instant::now();
                    continue;
                }
                Message::Close(_) => return Ok(None),
                Message::Frame(_) => continue,
            };

            let decoded = match &mut self.framer {
                Some(framer) => framer.decrypt(&raw)?,
                None => raw,
            };

            if decoded.is_empty() {
                return Ok(None);
            }

            tracing::debug!(rx = %String::from_utf8_lossy(&decoded), "RX");
            let frame: crate::session::Frame = serde_json::from_slice(&decoded)?;
            return Ok(Some(frame));
        }
    }
}

fn build_request(
    uri: &str,
    empty_origin: bool,
) -> Result<tokio_tungstenite::tungstenite::http::Request<()>, HcError> {
    let mut builder = tokio_tungstenite::tungstenite::http::Request::builder().uri(uri);
    if empty_origin {
        builder = builder.header("Origin", "");
    }
    builder
        .body(())
        .map_err(|e| HcError::Transport(format!("building handshake request: {e}")))
}

fn build_psk_tls_stream(tcp: TcpStream, psk: &[u8]) -> Result<SslStream<TcpStream>, HcError> {
    let mut builder = SslContext::builder(SslMethod::tls_client())
        .map_err(|e| HcError::Transport(format!("openssl context: {e}")))?;
    builder.set_verify(SslVerifyMode::NONE);
    builder
        .set_min_proto_version(Some(SslVersion::SSL3))
        .map_err(|e| HcError::Transport(format!("openssl min version: {e}")))?;
    builder
        .set_max_proto_version(Some(SslVersion::TLS1_2))
        .map_err(|e| HcError::Transport(format!("openssl max version: {e}")))?;
    builder
        .set_cipher_list("PSK")
        .map_err(|e| HcError::Transport(format!("openssl PSK cipher list: {e}")))?;

    let psk_owned = psk.to_vec();
    builder.set_psk_client_callback(move |_ssl, _hint, identity_out, psk_out| {
        let identity = PSK_IDENTITY_HINT.as_bytes();
        identity_out[..identity.len()].copy_from_slice(identity);
        identity_out[identity.len()] = 0;
        psk_out[..psk_owned.len()].copy_from_slice(&psk_owned);
        Ok(psk_owned.len())
    });

    let ctx = builder.build();
    let ssl = Ssl::new(&ctx).map_err(|e| HcError::Transport(format!("openssl session: {e}")))?;
    let stream =
        SslStream::new(ssl, tcp).map_err(|e| HcError::Transport(format!("openssl stream: {e}")))?;

    // The handshake itself (`Pin::new(&mut stream).connect().await`) is
    // driven by the caller, since it is async and this constructor is not.
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base64url_decode_tolerates_stripped_padding() {
        // "hcpy" base64url-encoded with padding stripped, as devices.json stores it
        let decoded = base64url_decode_padded("aGNweQ").unwrap();
        assert_eq!(decoded, b"hcpy");
    }
}
