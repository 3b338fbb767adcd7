//! Secure channel over a WebSocket.
//!
//! A channel wraps one connected socket. Both ends exchange a single
//! `hello` (the acceptor speaks first), after which the acceptor's ticket is
//! mixed into every message key. Writes encrypt under the write lock so the
//! outgoing counter order always matches wire order; reads decrypt in a
//! single reader task that publishes [`ChannelEvent`]s.

mod cipher;

pub use cipher::{MessageCipher, derive_key};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use base64::{Engine, engine::general_purpose::STANDARD};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::{Notify, mpsc};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, trace, warn};

use clustd_common::constants::METADATA_HEADER;
use clustd_common::{ClustdError, ConnectionMeta, Hello, PeerKind, WireMessage};

use crate::identity::LocalIdentity;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Read half of a channel, consumed by [`SecureChannel::init`]
pub type ChannelReader = SplitStream<WsStream>;

const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Events published by an initialized channel's reader task
#[derive(Debug)]
pub enum ChannelEvent {
    Message(WireMessage),
    Ping,
    Pong,
    /// Terminal; no events follow
    Closed,
}

/// Encrypted, message-oriented link to one remote process
pub struct SecureChannel {
    is_initiator: bool,
    identity: LocalIdentity,
    remote: String,
    cipher: Mutex<MessageCipher>,
    sink: tokio::sync::Mutex<WsSink>,
    open: AtomicBool,
    closed: Notify,
}

impl SecureChannel {
    /// Wrap an already-connected socket.
    ///
    /// `cipher` must be the one that produced (or consumed) the metadata
    /// header so both ends agree on counters.
    pub fn new(
        socket: WsStream,
        cipher: MessageCipher,
        is_initiator: bool,
        identity: LocalIdentity,
        remote: impl Into<String>,
    ) -> (Arc<Self>, ChannelReader) {
        let (sink, reader) = socket.split();
        let channel = Arc::new(Self {
            is_initiator,
            identity,
            remote: remote.into(),
            cipher: Mutex::new(cipher),
            sink: tokio::sync::Mutex::new(sink),
            open: AtomicBool::new(true),
            closed: Notify::new(),
        });
        (channel, reader)
    }

    /// Connect to `host`, presenting an encrypted `{type}` metadata header
    pub async fn dial(
        host: &str,
        kind: PeerKind,
        identity: &LocalIdentity,
        timeout: Duration,
    ) -> Result<(Arc<Self>, ChannelReader), ClustdError> {
        let mut cipher = MessageCipher::new(identity.secret());
        let header = STANDARD.encode(cipher.encrypt(&ConnectionMeta { kind })?);

        let mut request = host
            .into_client_request()
            .map_err(|e| ClustdError::Transport(format!("invalid host {}: {}", host, e)))?;
        let value = HeaderValue::from_str(&header)
            .map_err(|e| ClustdError::Transport(e.to_string()))?;
        request.headers_mut().insert(METADATA_HEADER, value);

        let (socket, _) = tokio::time::timeout(timeout, tokio_tungstenite::connect_async(request))
            .await
            .map_err(|_| ClustdError::Timeout(format!("connecting to {}", host)))?
            .map_err(|e| ClustdError::Transport(e.to_string()))?;

        debug!(host = %host, kind = %kind, "Connected to remote host");
        Ok(Self::new(socket, cipher, true, identity.clone(), host))
    }

    /// Upgrade an accepted TCP stream and classify it by its metadata header
    pub async fn accept(
        stream: TcpStream,
        identity: &LocalIdentity,
    ) -> Result<(ConnectionMeta, Arc<Self>, ChannelReader), ClustdError> {
        let remote = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        let mut header: Option<String> = None;
        let capture = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            header = req
                .headers()
                .get(METADATA_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned);
            Ok(resp)
        };
        let socket = tokio_tungstenite::accept_hdr_async(MaybeTlsStream::Plain(stream), capture)
            .await
            .map_err(|e| ClustdError::Transport(e.to_string()))?;

        let header = header.ok_or_else(|| ClustdError::Protocol("missing metadata header".into()))?;
        let frame = STANDARD
            .decode(header.as_bytes())
            .map_err(|e| ClustdError::Protocol(format!("invalid metadata encoding: {}", e)))?;

        let mut cipher = MessageCipher::new(identity.secret());
        let meta: ConnectionMeta = match cipher.decrypt_as(&frame) {
            Ok(meta) => meta,
            Err(ClustdError::Decrypt) => {
                error!(remote = %remote, "Failed to decrypt connection metadata, verify the cluster secret");
                return Err(ClustdError::Decrypt);
            }
            Err(err) => {
                return Err(ClustdError::Protocol(format!("unknown connection metadata: {}", err)));
            }
        };

        let (channel, reader) = Self::new(socket, cipher, false, identity.clone(), remote);
        Ok((meta, channel, reader))
    }

    pub fn is_initiator(&self) -> bool {
        self.is_initiator
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn is_initialized(&self) -> bool {
        self.cipher().is_initialized()
    }

    /// Session ticket currently mixed into keys (after init)
    pub fn ticket(&self) -> u32 {
        self.cipher().ticket()
    }

    /// Remote address used for logs
    pub fn remote(&self) -> &str {
        &self.remote
    }

    fn cipher(&self) -> MutexGuard<'_, MessageCipher> {
        self.cipher.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seal a value under the next outgoing key
    pub fn encrypt<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, ClustdError> {
        self.cipher().encrypt(value)
    }

    /// Open a frame under the next incoming key. Any failure closes the channel.
    pub fn decrypt(self: &Arc<Self>, frame: &[u8]) -> Result<WireMessage, ClustdError> {
        let decrypted = self.cipher().decrypt(frame);
        match decrypted {
            Ok(value) => {
                let msg = WireMessage::from_value(value)?;
                trace!(remote = %self.remote, message = ?msg, "Received message");
                Ok(msg)
            }
            Err(err) => {
                self.close();
                error!(remote = %self.remote, error = %err, "Message decryption failure, verify the cluster secret");
                Err(err)
            }
        }
    }

    /// Encrypt and write one message.
    ///
    /// Rejects before the handshake completes unless `force` is set.
    pub async fn send<T: Serialize + ?Sized>(&self, value: &T, force: bool) -> Result<(), ClustdError> {
        if !(force || self.is_initialized()) {
            return Err(ClustdError::NotInitialized);
        }
        if !self.is_open() {
            return Err(ClustdError::Closed);
        }

        let mut sink = self.sink.lock().await;
        let frame = self.encrypt(value)?;
        sink.send(Message::Binary(frame))
            .await
            .map_err(|e| ClustdError::Transport(e.to_string()))?;
        Ok(())
    }

    /// Transport-level liveness ping
    pub async fn ping(&self) -> Result<(), ClustdError> {
        if !self.is_open() {
            return Ok(());
        }
        let mut sink = self.sink.lock().await;
        sink.send(Message::Ping(Vec::new()))
            .await
            .map_err(|e| ClustdError::Transport(e.to_string()))
    }

    /// Hold the write half; every writer stalls until the guard drops
    #[cfg(test)]
    pub(crate) async fn stall_writes(&self) -> tokio::sync::MutexGuard<'_, WsSink> {
        self.sink.lock().await
    }

    /// Tear the connection down. Idempotent.
    pub fn close(self: &Arc<Self>) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        self.closed.notify_one();

        let this = self.clone();
        tokio::spawn(async move {
            let mut sink = this.sink.lock().await;
            let _ = tokio::time::timeout(CLOSE_GRACE, sink.close()).await;
        });
    }

    async fn send_hello(&self) -> Result<(), ClustdError> {
        let hello = self.identity.hello(self.ticket());
        self.send(&hello, true).await
    }

    /// Run the hello exchange, then start the reader task.
    ///
    /// `verify` receives the remote hello once the local hello has been
    /// sent; returning an error aborts the handshake and closes the socket.
    pub async fn init<F>(
        self: &Arc<Self>,
        mut reader: ChannelReader,
        verify: F,
        timeout: Duration,
    ) -> Result<mpsc::UnboundedReceiver<ChannelEvent>, ClustdError>
    where
        F: FnOnce(&Hello) -> Result<(), ClustdError>,
    {
        let handshake = async {
            if !self.is_initiator {
                self.send_hello().await?;
            }

            let hello = self.read_hello(&mut reader).await?;
            self.cipher().set_ticket(hello.hello_world);

            if self.is_initiator {
                self.send_hello().await?;
            }

            verify(&hello)?;
            self.cipher().mark_initialized();
            debug!(remote = %self.remote, peer = %hello.id, "Handshake completed");
            Ok(())
        };

        let outcome = match tokio::time::timeout(timeout, handshake).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ClustdError::Handshake("handshake timed out".into())),
        };

        if let Err(err) = outcome {
            self.close();
            return Err(err);
        }

        Ok(self.spawn_reader(reader))
    }

    async fn read_hello(self: &Arc<Self>, reader: &mut ChannelReader) -> Result<Hello, ClustdError> {
        loop {
            match reader.next().await {
                Some(Ok(Message::Binary(frame))) => {
                    return match self.decrypt(&frame)? {
                        WireMessage::Hello(hello) => Ok(hello),
                        _ => Err(ClustdError::Protocol(
                            "received a message before handshake completed".into(),
                        )),
                    };
                }
                Some(Ok(Message::Text(_))) => {
                    return Err(ClustdError::Protocol("unexpected text frame".into()));
                }
                Some(Ok(Message::Close(_))) | None => return Err(ClustdError::Closed),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(ClustdError::Transport(e.to_string())),
            }
        }
    }

    fn spawn_reader(self: &Arc<Self>, mut reader: ChannelReader) -> mpsc::UnboundedReceiver<ChannelEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let this = self.clone();

        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    next = reader.next() => next,
                    _ = this.closed.notified() => break,
                };

                let event = match next {
                    Some(Ok(Message::Binary(frame))) => match this.decrypt(&frame) {
                        Ok(WireMessage::Hello(_)) => {
                            error!(remote = %this.remote, "Socket handshake already initialized");
                            break;
                        }
                        Ok(msg) => ChannelEvent::Message(msg),
                        Err(_) => break,
                    },
                    Some(Ok(Message::Ping(_))) => ChannelEvent::Ping,
                    Some(Ok(Message::Pong(_))) => ChannelEvent::Pong,
                    Some(Ok(Message::Text(_))) => {
                        warn!(remote = %this.remote, "Unexpected text frame, closing connection");
                        break;
                    }
                    Some(Ok(Message::Frame(_))) => continue,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(remote = %this.remote, error = %e, "Socket read error");
                        break;
                    }
                };

                if tx.send(event).is_err() {
                    break;
                }
            }

            this.close();
            let _ = tx.send(ChannelEvent::Closed);
        });

        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::TcpListener;

    use clustd_common::Request as RpcRequest;

    const TIMEOUT: Duration = Duration::from_secs(2);

    struct Pair {
        dialer: (Arc<SecureChannel>, ChannelReader),
        acceptor: Result<(ConnectionMeta, Arc<SecureChannel>, ChannelReader), ClustdError>,
    }

    async fn connect(dialer_secret: &str, acceptor_secret: &str, kind: PeerKind) -> Pair {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let host = format!("ws://{}", listener.local_addr().unwrap());

        let acceptor_identity = LocalIdentity::new("b", host.clone(), acceptor_secret);
        let accept = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            SecureChannel::accept(stream, &acceptor_identity).await
        });

        let dialer_identity = LocalIdentity::new("a", "ws://127.0.0.1:1", dialer_secret);
        let dialer = SecureChannel::dial(&host, kind, &dialer_identity, TIMEOUT)
            .await
            .unwrap();

        Pair {
            dialer,
            acceptor: accept.await.unwrap(),
        }
    }

    async fn next_message(events: &mut mpsc::UnboundedReceiver<ChannelEvent>) -> Option<WireMessage> {
        loop {
            match tokio::time::timeout(TIMEOUT, events.recv()).await.ok()?? {
                ChannelEvent::Message(msg) => return Some(msg),
                ChannelEvent::Closed => return None,
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_metadata_classifies_connection() {
        let pair = connect("secret", "secret", PeerKind::Driver).await;
        let (meta, channel, _) = pair.acceptor.unwrap();
        assert_eq!(meta.kind, PeerKind::Driver);
        assert!(!channel.is_initiator());
        assert!(pair.dialer.0.is_initiator());
    }

    #[tokio::test]
    async fn test_wrong_secret_rejects_metadata() {
        let pair = connect("secret", "other-secret", PeerKind::Cluster).await;
        assert_eq!(pair.acceptor.err(), Some(ClustdError::Decrypt));
    }

    #[tokio::test]
    async fn test_handshake_shares_ticket_and_carries_messages() {
        let pair = connect("secret", "secret", PeerKind::Cluster).await;
        let (a, a_reader) = pair.dialer;
        let (_, b, b_reader) = pair.acceptor.unwrap();

        let mut seen_by_a = None;
        let mut seen_by_b = None;
        let (a_events, b_events) = tokio::join!(
            a.init(a_reader, |hello| {
                seen_by_a = Some(hello.id.clone());
                Ok(())
            }, TIMEOUT),
            b.init(b_reader, |hello| {
                seen_by_b = Some(hello.id.clone());
                Ok(())
            }, TIMEOUT),
        );
        let _a_events = a_events.unwrap();
        let mut b_events = b_events.unwrap();

        assert_eq!(seen_by_a.as_deref(), Some("b"));
        assert_eq!(seen_by_b.as_deref(), Some("a"));
        assert!(a.is_initialized() && b.is_initialized());
        assert_eq!(a.ticket(), b.ticket());

        let request = RpcRequest {
            req_id: 0,
            method: "get_master".into(),
            params: Some(vec![json!(1)]),
        };
        a.send(&request, false).await.unwrap();

        match next_message(&mut b_events).await {
            Some(WireMessage::Request(received)) => assert_eq!(received, request),
            other => panic!("expected request, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_send_before_handshake_rejected() {
        let pair = connect("secret", "secret", PeerKind::Cluster).await;
        let (a, _) = pair.dialer;
        assert_eq!(
            a.send(&json!({ "req_id": 1, "method": "x" }), false).await,
            Err(ClustdError::NotInitialized)
        );
    }

    #[tokio::test]
    async fn test_closed_channel_rejects_send() {
        let pair = connect("secret", "secret", PeerKind::Cluster).await;
        let (a, _) = pair.dialer;
        a.close();
        a.close();
        assert!(!a.is_open());
        assert_eq!(a.send(&json!(1), true).await, Err(ClustdError::Closed));
        assert!(a.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_handshake_times_out_without_hello() {
        let pair = connect("secret", "secret", PeerKind::Cluster).await;
        let (a, a_reader) = pair.dialer;
        let (_, _b, _b_reader) = pair.acceptor.unwrap();

        // acceptor never sends its hello
        let result = a.init(a_reader, |_| Ok(()), Duration::from_millis(200)).await;
        assert!(matches!(result, Err(ClustdError::Handshake(_))));
        assert!(!a.is_open());
    }

    #[tokio::test]
    async fn test_rejected_identity_closes_connection() {
        let pair = connect("secret", "secret", PeerKind::Cluster).await;
        let (a, a_reader) = pair.dialer;
        let (_, b, b_reader) = pair.acceptor.unwrap();

        let (a_events, b_events) = tokio::join!(
            a.init(a_reader, |_| Ok(()), TIMEOUT),
            b.init(b_reader, |_| Err(ClustdError::Handshake("id mismatch".into())), TIMEOUT),
        );
        assert!(b_events.is_err());
        assert!(!b.is_open());

        // the dialer completed its side and then observes the close
        let mut a_events = a_events.unwrap();
        assert!(next_message(&mut a_events).await.is_none());
    }

    #[tokio::test]
    async fn test_second_hello_closes_channel() {
        let pair = connect("secret", "secret", PeerKind::Cluster).await;
        let (a, a_reader) = pair.dialer;
        let (_, b, b_reader) = pair.acceptor.unwrap();

        let (a_events, b_events) = tokio::join!(
            a.init(a_reader, |_| Ok(()), TIMEOUT),
            b.init(b_reader, |_| Ok(()), TIMEOUT),
        );
        let _a_events = a_events.unwrap();
        let mut b_events = b_events.unwrap();

        a.send(&a.identity.hello(7), true).await.unwrap();
        assert!(next_message(&mut b_events).await.is_none());
        assert!(!b.is_open());
    }
}
