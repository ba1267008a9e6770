//! Sync channels.
//!
//! A [`Connection`] is a pair of unbounded queues in front of one WebSocket.
//! [`SyncConnector`] opens them; [`TungsteniteConnector`] is the real
//! implementation, and tests plug in an in-process server instead.

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

use crate::error::{DiaryxError, Result};
use crate::store::BoxFuture;

/// A frame on a sync channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    /// Y-sync protocol bytes
    Binary(Vec<u8>),
    /// JSON control message
    Text(String),
    /// Keepalive
    Ping,
    /// Closing handshake
    Close,
}

/// Both directions of an open channel.
///
/// The channel is closed when `incoming` yields `None`.
#[derive(Debug)]
pub struct Connection {
    /// Frames to send
    pub outgoing: mpsc::UnboundedSender<WireMessage>,
    /// Frames received
    pub incoming: mpsc::UnboundedReceiver<WireMessage>,
}

/// Opens sync channels.
pub trait SyncConnector: Send + Sync {
    /// Open a channel to `url`.
    fn connect<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Connection>>;
}

/// WebSocket connector over `tokio-tungstenite`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TungsteniteConnector;

impl SyncConnector for TungsteniteConnector {
    fn connect<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Connection>> {
        Box::pin(async move {
            let (ws_stream, _) = connect_async(url)
                .await
                .map_err(|e| DiaryxError::Transport(format!("WebSocket connection failed: {}", e)))?;
            log::info!("[Transport] Connected to {}", redact(url));

            let (mut write, mut read) = ws_stream.split();
            let (out_tx, mut out_rx) = mpsc::unbounded_channel::<WireMessage>();
            let (in_tx, in_rx) = mpsc::unbounded_channel::<WireMessage>();

            tokio::spawn(async move {
                while let Some(message) = out_rx.recv().await {
                    let frame = match message {
                        WireMessage::Binary(data) => Message::Binary(data.into()),
                        WireMessage::Text(text) => Message::Text(text.into()),
                        WireMessage::Ping => Message::Ping(Vec::new().into()),
                        WireMessage::Close => {
                            let _ = write.close().await;
                            break;
                        }
                    };
                    if let Err(e) = write.send(frame).await {
                        log::error!("[Transport] Send error: {}", e);
                        break;
                    }
                }
            });

            tokio::spawn(async move {
                while let Some(frame) = read.next().await {
                    let message = match frame {
                        Ok(Message::Binary(data)) => WireMessage::Binary(data.to_vec()),
                        Ok(Message::Text(text)) => WireMessage::Text(text.as_str().to_string()),
                        Ok(Message::Close(_)) => {
                            log::info!("[Transport] Connection closed by server");
                            break;
                        }
                        Ok(_) => continue,
                        Err(e) => {
                            log::warn!("[Transport] Read error: {}", e);
                            break;
                        }
                    };
                    if in_tx.send(message).is_err() {
                        break;
                    }
                }
            });

            Ok(Connection {
                outgoing: out_tx,
                incoming: in_rx,
            })
        })
    }
}

/// Strip the query string (which may carry a token) for logging.
fn redact(url: &str) -> &str {
    url.split('?').next().unwrap_or(url)
}

/// Build a channel URL for workspace document `doc`.
///
/// The body channel sets `multiplexed=true`; a token, if any, rides along as
/// a query parameter.
pub fn build_websocket_url(
    base: &str,
    doc: &str,
    multiplexed: bool,
    token: Option<&str>,
) -> Result<String> {
    let mut url = Url::parse(base)?;
    url.query_pairs_mut().append_pair("doc", doc);
    if multiplexed {
        url.query_pairs_mut().append_pair("multiplexed", "true");
    }
    if let Some(token) = token {
        url.query_pairs_mut().append_pair("token", token);
    }
    Ok(url.to_string())
}

/// JSON control messages carried in text frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Server-side sync progress
    SyncProgress {
        /// Files done
        completed: usize,
        /// Files expected
        total: usize,
    },
    /// The server finished its initial sync for this channel
    SyncComplete {
        /// Number of files sent
        #[serde(default)]
        files_synced: usize,
    },
    /// Another device joined
    PeerJoined {
        /// Devices connected
        #[serde(default)]
        peer_count: usize,
    },
    /// Another device left
    PeerLeft {
        /// Devices connected
        #[serde(default)]
        peer_count: usize,
    },
    /// Stop sending body updates for a file
    Unsubscribe {
        /// Entry path
        path: String,
    },
    /// Anything this client does not understand
    #[serde(other)]
    Other,
}

impl ControlMessage {
    /// Serialize for a text frame.
    pub fn to_wire(&self) -> Result<WireMessage> {
        Ok(WireMessage::Text(serde_json::to_string(self)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_websocket_url_metadata() {
        let url =
            build_websocket_url("wss://sync.diaryx.org/sync", "workspace123", false, Some("t0k"))
                .unwrap();
        assert!(url.starts_with("wss://sync.diaryx.org/sync?"));
        assert!(url.contains("doc=workspace123"));
        assert!(url.contains("token=t0k"));
        assert!(!url.contains("multiplexed"));
    }

    #[test]
    fn test_build_websocket_url_body() {
        let url = build_websocket_url("ws://localhost:3030/sync", "ws1", true, None).unwrap();
        assert!(url.contains("doc=ws1"));
        assert!(url.contains("multiplexed=true"));
        assert!(!url.contains("token"));
        assert!(build_websocket_url("not a url", "ws1", false, None).is_err());
    }

    #[test]
    fn test_control_message_deserialization() {
        let msg: ControlMessage =
            serde_json::from_str(r#"{"type":"sync_progress","completed":5,"total":42}"#).unwrap();
        assert_eq!(
            msg,
            ControlMessage::SyncProgress {
                completed: 5,
                total: 42
            }
        );

        let msg: ControlMessage =
            serde_json::from_str(r#"{"type":"sync_complete","files_synced":100}"#).unwrap();
        assert_eq!(msg, ControlMessage::SyncComplete { files_synced: 100 });

        let msg: ControlMessage =
            serde_json::from_str(r#"{"type":"peer_joined","guest_id":"abc","peer_count":3}"#)
                .unwrap();
        assert_eq!(msg, ControlMessage::PeerJoined { peer_count: 3 });

        let msg: ControlMessage =
            serde_json::from_str(r#"{"type":"unknown_future_message","foo":"bar"}"#).unwrap();
        assert_eq!(msg, ControlMessage::Other);
    }

    #[test]
    fn test_unsubscribe_wire_format() {
        let wire = ControlMessage::Unsubscribe {
            path: "notes.md".into(),
        }
        .to_wire()
        .unwrap();
        assert_eq!(
            wire,
            WireMessage::Text(r#"{"type":"unsubscribe","path":"notes.md"}"#.to_string())
        );
    }

    #[test]
    fn test_redact_drops_query() {
        assert_eq!(redact("wss://x/sync?doc=a&token=b"), "wss://x/sync");
    }
}
