//! WebSocket control-channel sub-client
//!
//! Maintains the persistent full-duplex link to the platform. The channel
//! URL is derived from the HTTP base URL (http->ws, https->wss, path
//! `/ws`, query `agent_id`). Liveness uses WebSocket ping control frames:
//! a silence of twice the ping interval marks the link dead. Writes are
//! serialised through a single writer task with a 10 second per-write
//! deadline. The sub-client never reconnects on its own; `run` returns
//! when the link dies and the lifecycle coordinator re-establishes it.

use crate::config::TlsSection;
use crate::protocol::frames::{parse_frame, ControlFrame};
use crate::transport::{tls, TransportError};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, connect_async_tls_with_config, Connector};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
/// Router handoff deadline; an enqueue that cannot proceed within this
/// window fails the frame
const ENQUEUE_TIMEOUT: Duration = Duration::from_secs(5);

/// Derive the control-channel URL from the platform base URL
///
/// http->ws and https->wss; ws/wss pass through unchanged; any other
/// scheme is a construction error. The path becomes `/ws` and the agent
/// id is carried as a query parameter.
pub fn derive_channel_url(base_url: &Url, agent_id: &str) -> Result<Url, TransportError> {
    let scheme = match base_url.scheme() {
        "http" => "ws",
        "https" => "wss",
        "ws" => "ws",
        "wss" => "wss",
        other => {
            return Err(TransportError::InvalidUrl(format!(
                "cannot derive channel URL from scheme '{other}'"
            )))
        }
    };

    let mut url = base_url.clone();
    url.set_scheme(scheme)
        .map_err(|_| TransportError::InvalidUrl(format!("cannot set scheme on {base_url}")))?;
    url.set_path("/ws");
    url.set_query(None);
    url.query_pairs_mut().append_pair("agent_id", agent_id);
    Ok(url)
}

enum Outgoing {
    Frame(ControlFrame, oneshot::Sender<Result<(), TransportError>>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
}

/// Cloneable handle for sending frames while the channel is up
#[derive(Clone)]
pub struct ChannelHandle {
    connected_rx: watch::Receiver<bool>,
    outbound: Arc<std::sync::Mutex<Option<mpsc::Sender<Outgoing>>>>,
}

impl ChannelHandle {
    /// Whether the link is currently established
    pub fn is_connected(&self) -> bool {
        *self.connected_rx.borrow()
    }

    /// Send one frame; fails when the link is down or the write stalls
    pub async fn send(&self, frame: &ControlFrame) -> Result<(), TransportError> {
        let sender = {
            let slot = self.outbound.lock().expect("outbound slot lock poisoned");
            slot.clone().ok_or(TransportError::NotConnected)?
        };

        let (done_tx, done_rx) = oneshot::channel();
        sender
            .send(Outgoing::Frame(frame.clone(), done_tx))
            .await
            .map_err(|_| TransportError::ChannelClosed)?;
        done_rx.await.map_err(|_| TransportError::ChannelClosed)?
    }
}

/// Control-channel sub-client
pub struct ControlChannel {
    url: Url,
    token: Option<String>,
    ping_interval: Duration,
    tls_section: Option<TlsSection>,
    connected_tx: watch::Sender<bool>,
    connected_rx: watch::Receiver<bool>,
    outbound: Arc<std::sync::Mutex<Option<mpsc::Sender<Outgoing>>>>,
}

impl ControlChannel {
    /// Build the sub-client; fails on a non-derivable base URL
    pub fn new(
        base_url: &Url,
        agent_id: &str,
        token: Option<String>,
        ping_interval: Duration,
        tls_section: Option<TlsSection>,
    ) -> Result<Self, TransportError> {
        let url = derive_channel_url(base_url, agent_id)?;
        let (connected_tx, connected_rx) = watch::channel(false);
        Ok(Self {
            url,
            token,
            ping_interval,
            tls_section,
            connected_tx,
            connected_rx,
            outbound: Arc::new(std::sync::Mutex::new(None)),
        })
    }

    /// Channel URL the sub-client will dial
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Handle for senders; usable from any task
    pub fn handle(&self) -> ChannelHandle {
        ChannelHandle {
            connected_rx: self.connected_rx.clone(),
            outbound: self.outbound.clone(),
        }
    }

    /// Whether the link is currently established
    pub fn is_connected(&self) -> bool {
        *self.connected_rx.borrow()
    }

    /// Establish the link and serve it until it dies or `cancel` fires
    ///
    /// Inbound frames are handed to `inbound_tx` (the router's bounded
    /// queue). Returns Ok on cancellation or orderly close, Err on
    /// connect or protocol failure.
    pub async fn run(
        &self,
        inbound_tx: mpsc::Sender<ControlFrame>,
        cancel: CancellationToken,
    ) -> Result<(), TransportError> {
        let mut request = self.url.as_str().into_client_request()?;
        if let Some(token) = &self.token {
            let value = format!("Bearer {token}").parse().map_err(|_| {
                TransportError::InvalidUrl("bearer token is not ASCII".to_string())
            })?;
            request.headers_mut().insert("Authorization", value);
        }

        info!(url = %self.url, "connecting control channel");
        let connect = async {
            match &self.tls_section {
                Some(section) => {
                    let config = tls::build_client_config(section)?;
                    let connector = Connector::Rustls(Arc::new(config));
                    let (stream, _) =
                        connect_async_tls_with_config(request, None, false, Some(connector))
                            .await?;
                    Ok::<_, TransportError>(stream)
                }
                None => {
                    let (stream, _) = connect_async(request).await?;
                    Ok(stream)
                }
            }
        };
        let stream = timeout(CONNECT_TIMEOUT, connect)
            .await
            .map_err(|_| TransportError::ConnectTimeout {
                secs: CONNECT_TIMEOUT.as_secs(),
            })??;

        let (mut write, mut read) = stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Outgoing>(32);
        {
            let mut slot = self.outbound.lock().expect("outbound slot lock poisoned");
            *slot = Some(outbound_tx);
        }
        let _ = self.connected_tx.send(true);
        info!(url = %self.url, "control channel connected");

        // Single writer task: serialises every write and applies the
        // per-write deadline
        let writer = tokio::spawn(async move {
            while let Some(outgoing) = outbound_rx.recv().await {
                match outgoing {
                    Outgoing::Frame(frame, done) => {
                        let result = match serde_json::to_string(&frame) {
                            Ok(text) => {
                                match timeout(WRITE_TIMEOUT, write.send(Message::Text(text))).await
                                {
                                    Ok(Ok(())) => Ok(()),
                                    Ok(Err(e)) => Err(TransportError::from(e)),
                                    Err(_) => Err(TransportError::WriteTimeout {
                                        secs: WRITE_TIMEOUT.as_secs(),
                                    }),
                                }
                            }
                            Err(e) => Err(TransportError::Serialization(e)),
                        };
                        let failed = result.is_err();
                        let _ = done.send(result);
                        if failed {
                            break;
                        }
                    }
                    Outgoing::Ping(data) => {
                        if timeout(WRITE_TIMEOUT, write.send(Message::Ping(data)))
                            .await
                            .map_err(|_| ())
                            .and_then(|r| r.map_err(|_| ()))
                            .is_err()
                        {
                            break;
                        }
                    }
                    Outgoing::Pong(data) => {
                        let _ = timeout(WRITE_TIMEOUT, write.send(Message::Pong(data))).await;
                    }
                }
            }
            let _ = write.close().await;
        });

        let result = self
            .serve_reads(&mut read, inbound_tx, cancel)
            .await;

        // Tear down: drop the writer's inlet so it drains and closes
        {
            let mut slot = self.outbound.lock().expect("outbound slot lock poisoned");
            *slot = None;
        }
        let _ = self.connected_tx.send(false);
        writer.abort();
        let _ = writer.await;
        info!(url = %self.url, "control channel disconnected");

        result
    }

    async fn serve_reads<S>(
        &self,
        read: &mut S,
        inbound_tx: mpsc::Sender<ControlFrame>,
        cancel: CancellationToken,
    ) -> Result<(), TransportError>
    where
        S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
            + Unpin,
    {
        // Any inbound frame (pong included) resets the read deadline;
        // the deadline is absolute so ping ticks do not extend it
        let read_deadline = self.ping_interval * 2;
        let mut deadline = tokio::time::Instant::now() + read_deadline;
        let mut ping_ticker = tokio::time::interval(self.ping_interval);
        ping_ticker.tick().await; // first tick completes immediately

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("control channel cancelled");
                    return Ok(());
                }

                _ = ping_ticker.tick() => {
                    if self.enqueue_outgoing(Outgoing::Ping(Vec::new())).await.is_err() {
                        return Err(TransportError::ChannelClosed);
                    }
                }

                message = tokio::time::timeout_at(deadline, read.next()) => {
                    let message = match message {
                        Err(_) => {
                            warn!(
                                deadline_secs = read_deadline.as_secs(),
                                "control channel silent past read deadline, marking dead"
                            );
                            return Err(TransportError::ChannelClosed);
                        }
                        Ok(None) => {
                            info!("control channel closed by platform");
                            return Ok(());
                        }
                        Ok(Some(Err(e))) => return Err(e.into()),
                        Ok(Some(Ok(message))) => message,
                    };
                    deadline = tokio::time::Instant::now() + read_deadline;

                    match message {
                        Message::Text(text) => {
                            self.handle_text(&text, &inbound_tx).await;
                        }
                        Message::Ping(data) => {
                            let _ = self.enqueue_outgoing(Outgoing::Pong(data)).await;
                        }
                        Message::Pong(_) => {
                            debug!("control channel pong");
                        }
                        Message::Close(_) => {
                            info!("control channel close frame received");
                            return Ok(());
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    async fn handle_text(&self, text: &str, inbound_tx: &mpsc::Sender<ControlFrame>) {
        let frame = match parse_frame(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "discarding malformed control frame");
                return;
            }
        };
        debug!(frame_type = %frame.frame_type, "control frame received");

        match inbound_tx.send_timeout(frame, ENQUEUE_TIMEOUT).await {
            Ok(()) => {}
            Err(mpsc::error::SendTimeoutError::Timeout(frame)) => {
                warn!(
                    frame_type = %frame.frame_type,
                    "inbound queue full, dropping frame"
                );
                let error = ControlFrame::error(crate::protocol::frames::ErrorPayload {
                    code: "queue_full".to_string(),
                    message: format!("agent dropped a {} frame: queue full", frame.frame_type),
                    config_id: None,
                });
                let _ = self.handle().send(&error).await;
            }
            Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                warn!("inbound queue closed, dropping frame");
            }
        }
    }

    async fn enqueue_outgoing(&self, outgoing: Outgoing) -> Result<(), TransportError> {
        let sender = {
            let slot = self.outbound.lock().expect("outbound slot lock poisoned");
            slot.clone().ok_or(TransportError::NotConnected)?
        };
        sender
            .send(outgoing)
            .await
            .map_err(|_| TransportError::ChannelClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base(url: &str) -> Url {
        Url::parse(url).unwrap()
    }

    #[test]
    fn test_derive_http_to_ws() {
        let url = derive_channel_url(&base("http://s:8080"), "a-1").unwrap();
        assert_eq!(url.as_str(), "ws://s:8080/ws?agent_id=a-1");
    }

    #[test]
    fn test_derive_https_to_wss() {
        let url = derive_channel_url(&base("https://platform.example.com"), "a-1").unwrap();
        assert_eq!(url.as_str(), "wss://platform.example.com/ws?agent_id=a-1");
    }

    #[test]
    fn test_derive_ws_schemes_unchanged() {
        let url = derive_channel_url(&base("ws://s:8080/other?x=1"), "a-2").unwrap();
        assert_eq!(url.as_str(), "ws://s:8080/ws?agent_id=a-2");

        let url = derive_channel_url(&base("wss://s:8443"), "a-2").unwrap();
        assert_eq!(url.scheme(), "wss");
    }

    #[test]
    fn test_derive_rejects_other_schemes() {
        let result = derive_channel_url(&base("ftp://s:21"), "a-1");
        assert!(matches!(result, Err(TransportError::InvalidUrl(_))));
    }

    #[test]
    fn test_derive_replaces_existing_path_and_query() {
        let url = derive_channel_url(&base("http://s:8080/api/v1?key=old"), "a-3").unwrap();
        assert_eq!(url.path(), "/ws");
        assert_eq!(url.query(), Some("agent_id=a-3"));
    }

    #[test]
    fn test_handle_reports_not_connected() {
        let channel = ControlChannel::new(
            &base("http://s:8080"),
            "a-1",
            None,
            Duration::from_secs(30),
            None,
        )
        .unwrap();
        assert!(!channel.is_connected());

        let handle = channel.handle();
        assert!(!handle.is_connected());

        let frame = ControlFrame::heartbeat("a-1");
        let result = tokio_test::block_on(handle.send(&frame));
        assert!(matches!(result, Err(TransportError::NotConnected)));
    }
}
