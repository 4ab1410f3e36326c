//! The messenger: one connection, many handlers, correlated requests.
//!
//! Inbound bytes flow through the reassembler and codec, then each message is
//! either handed to the request waiting for its id or broadcast to the
//! handlers registered for its type. Handler results are encoded as reply
//! envelopes and written back under the same type and id.
//!
//! A message whose id matches a pending request is consumed by that request
//! and is not broadcast. Messages nobody is waiting for, including the later
//! envelopes of a streaming reply, go to the type handlers.
//!
//! Every dispatched message is answered. If both peers register handlers for
//! a type that also streams replies, those later envelopes are answered by
//! the requester, dispatched again by the other side, and can bounce between
//! the peers indefinitely. Use distinct types for requests that stream.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, oneshot, watch};
use tracing::{debug, info, trace, warn};

use linemux_core::{IdGenerator, UuidIdGenerator};
use linemux_protocol::{FrameReassembler, Message, decode_record, encode_record, truncate_for_log};

use crate::config::MessengerConfig;
use crate::correlation::{CorrelationTable, PendingGuard};
use crate::error::{HandlerError, MessengerError, MessengerResult};
use crate::registry::{FnHandler, Handler, HandlerResult, ListenerRegistry};
use crate::reply::ReplyEncoder;

type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;
type ErrorObserver = Arc<dyn Fn(&ErrorEvent<'_>) + Send + Sync>;

/// A failure reported to the observers registered with
/// [`Messenger::on_error`].
#[derive(Debug)]
pub enum ErrorEvent<'a> {
    /// A handler failed while processing `message`.
    Handler {
        message: &'a Message,
        error: &'a HandlerError,
    },
    /// Reading from or writing to the connection failed.
    Transport(&'a MessengerError),
}

/// Message exchange over a single byte stream.
///
/// Cheap to clone; clones share handlers, pending requests and the
/// connection.
#[derive(Clone)]
pub struct Messenger {
    inner: Arc<Inner>,
}

struct Inner {
    config: MessengerConfig,
    listeners: ListenerRegistry,
    pending: CorrelationTable,
    writer: Mutex<Option<BoxWriter>>,
    connected: watch::Sender<bool>,
    observers: RwLock<Vec<ErrorObserver>>,
    ids: Arc<dyn IdGenerator>,
}

impl Messenger {
    /// Creates a messenger that generates random UUID message ids.
    pub fn new(config: MessengerConfig) -> Self {
        Self::with_id_generator(config, Arc::new(UuidIdGenerator))
    }

    /// Creates a messenger drawing message ids from `ids`.
    pub fn with_id_generator(config: MessengerConfig, ids: Arc<dyn IdGenerator>) -> Self {
        let (connected, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                config,
                listeners: ListenerRegistry::new(),
                pending: CorrelationTable::new(),
                writer: Mutex::new(None),
                connected,
                observers: RwLock::new(Vec::new()),
                ids,
            }),
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &MessengerConfig {
        &self.inner.config
    }

    /// Registers `handler` for `message_type`.
    ///
    /// Handlers are never removed. Every handler of a type sees every message
    /// of that type.
    pub fn on<F, Fut>(&self, message_type: impl Into<String>, handler: F)
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.on_handler(message_type, Arc::new(FnHandler::new(handler)));
    }

    /// Registers an already boxed handler.
    pub fn on_handler(&self, message_type: impl Into<String>, handler: Arc<dyn Handler>) {
        let message_type = message_type.into();
        debug!(message_type = %message_type, "Registering handler");
        self.inner.listeners.register(message_type, handler);
    }

    /// Registers an observer for handler and transport failures.
    pub fn on_error<F>(&self, observer: F)
    where
        F: Fn(&ErrorEvent<'_>) + Send + Sync + 'static,
    {
        self.inner
            .observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(observer));
    }

    /// Calls the first local handler for `message_type` without touching the
    /// connection. Returns `None` when no handler is registered.
    pub async fn invoke(&self, message_type: &str, data: Value) -> Option<HandlerResult> {
        let message = Message::new(message_type, self.inner.ids.next_id(), data);
        let call = self.inner.listeners.invoke_first(message_type, message)?;
        Some(call.await)
    }

    /// Sends a message with a fresh id and returns the id.
    ///
    /// There is no acknowledgement; success means the record was written.
    pub async fn send(&self, message_type: &str, data: Value) -> MessengerResult<String> {
        let message_id = self.inner.ids.next_id();
        self.send_with_id(message_type, data, message_id).await
    }

    /// Sends a message under an explicit id and returns the id.
    pub async fn send_with_id(
        &self,
        message_type: &str,
        data: Value,
        message_id: impl Into<String>,
    ) -> MessengerResult<String> {
        let message = Message::new(message_type, message_id, data);
        self.write_message(&message).await?;
        Ok(message.message_id)
    }

    /// Sends a message and waits for the first message carrying its id.
    ///
    /// Completes with that message's `data` whatever its status. A write
    /// failure is reported to the error observers and the call keeps waiting;
    /// it only fails when the configured request timeout elapses.
    pub async fn request(&self, message_type: &str, data: Value) -> MessengerResult<Value> {
        self.await_reply(message_type, data, self.inner.config.request_timeout)
            .await
    }

    /// Like [`Messenger::request`] with an explicit timeout.
    pub async fn request_with_timeout(
        &self,
        message_type: &str,
        data: Value,
        timeout: Duration,
    ) -> MessengerResult<Value> {
        self.await_reply(message_type, data, Some(timeout)).await
    }

    async fn await_reply(
        &self,
        message_type: &str,
        data: Value,
        timeout: Option<Duration>,
    ) -> MessengerResult<Value> {
        let message_id = self.inner.ids.next_id();
        let (tx, rx) = oneshot::channel();
        self.inner.pending.register(message_id.clone(), tx);
        // Dropping this future (or timing out) must forget the entry.
        let _guard = PendingGuard::new(&self.inner.pending, message_id.clone());

        if let Err(e) = self.send_with_id(message_type, data, message_id.clone()).await {
            warn!(
                message_type = %message_type,
                message_id = %message_id,
                error = %e,
                "Failed to send request"
            );
            self.report(&ErrorEvent::Transport(&e));
        }

        let reply = match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(reply) => reply,
                Err(_) => {
                    debug!(message_id = %message_id, "Request timed out");
                    return Err(MessengerError::RequestTimeout {
                        message_type: message_type.to_string(),
                        message_id,
                        timeout: limit,
                    });
                }
            },
            None => rx.await,
        };

        reply
            .map(|message| message.data)
            .map_err(|_| MessengerError::Cancelled { message_id })
    }

    /// Number of requests waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }

    /// Returns true while a connection is attached.
    pub fn is_connected(&self) -> bool {
        *self.inner.connected.borrow()
    }

    /// Waits until a connection is attached.
    pub async fn await_connection(&self) {
        let mut connected = self.inner.connected.subscribe();
        while !*connected.borrow_and_update() {
            // The sender lives in `inner`, so this cannot close under us.
            if connected.changed().await.is_err() {
                return;
            }
        }
    }

    /// Makes `writer` the outbound half of the connection.
    pub async fn attach<W>(&self, writer: W)
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        *self.inner.writer.lock().await = Some(Box::new(writer));
        self.inner.connected.send_replace(true);
        debug!("Writer attached");
    }

    /// Drops the outbound half of the connection.
    pub async fn detach(&self) {
        let writer = self.inner.writer.lock().await.take();
        self.inner.connected.send_replace(false);
        if let Some(mut writer) = writer {
            if let Err(e) = writer.shutdown().await {
                debug!(error = %e, "Error shutting down writer");
            }
        }
        debug!("Writer detached");
    }

    /// Serves one connection until the peer closes it or the transport fails.
    pub async fn serve_connection<S>(&self, stream: S) -> MessengerResult<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        self.attach(writer).await;
        let result = self.read_loop(reader).await;
        self.detach().await;
        result
    }

    /// Reads `reader` to the end, dispatching every complete record.
    ///
    /// Bad records are logged and skipped. IO failures and oversized records
    /// end the loop and are reported to the error observers.
    pub async fn read_loop<R>(&self, mut reader: R) -> MessengerResult<()>
    where
        R: AsyncRead + Unpin,
    {
        let mut frames = FrameReassembler::new(self.inner.config.max_record_size);
        let mut buf = vec![0u8; self.inner.config.read_buffer_size];

        loop {
            let read = match reader.read(&mut buf).await {
                Ok(0) => {
                    info!("Peer closed the connection");
                    return Ok(());
                }
                Ok(n) => n,
                Err(e) => return Err(self.transport_failure(e.into())),
            };
            trace!(bytes = read, "Received chunk");

            if let Err(e) = self.handle_data(&mut frames, &buf[..read]) {
                return Err(self.transport_failure(e));
            }
        }
    }

    fn handle_data(&self, frames: &mut FrameReassembler, chunk: &[u8]) -> MessengerResult<()> {
        let overflow = match frames.feed(chunk) {
            Ok(records) => {
                for record in records {
                    self.handle_record(&record);
                }
                None
            }
            Err(e) => Some(e),
        };

        // Records completed before an oversize tail are still delivered.
        if let Some(e) = overflow {
            for record in frames.records() {
                self.handle_record(&record);
            }
            return Err(e.into());
        }
        Ok(())
    }

    fn handle_record(&self, record: &[u8]) {
        match decode_record(record) {
            Ok(message) => self.dispatch(message),
            Err(e) => {
                let text = String::from_utf8_lossy(record);
                warn!(
                    record = %truncate_for_log(&text),
                    error = %e,
                    "Dropping undecodable record"
                );
            }
        }
    }

    fn dispatch(&self, message: Message) {
        let Some(message) = self.inner.pending.resolve(message) else {
            trace!("Reply delivered to pending request");
            return;
        };

        let messenger = self.clone();
        let started = self.inner.listeners.dispatch_all(&message, move |request, result| {
            let messenger = messenger.clone();
            async move { messenger.send_reply(request, result).await }
        });

        if started == 0 {
            debug!(
                message_type = %message.message_type,
                message_id = %message.message_id,
                "No handler for message"
            );
        } else {
            trace!(
                message_type = %message.message_type,
                handlers = started,
                "Dispatched message"
            );
        }
    }

    async fn send_reply(&self, request: Message, result: HandlerResult) {
        let mut encoder = ReplyEncoder::new(result);
        while let Some(envelope) = encoder.next_envelope().await {
            if let Some(ref reason) = envelope.error {
                let error = HandlerError::new(reason.clone());
                warn!(
                    message_type = %request.message_type,
                    message_id = %request.message_id,
                    error = %error,
                    "Handler failed"
                );
                self.report(&ErrorEvent::Handler {
                    message: &request,
                    error: &error,
                });
            }

            if let Err(e) = self.write_message(&request.reply(&envelope)).await {
                warn!(
                    message_type = %request.message_type,
                    message_id = %request.message_id,
                    error = %e,
                    "Failed to write reply, abandoning it"
                );
                self.report(&ErrorEvent::Transport(&e));
                return;
            }
        }
    }

    async fn write_message(&self, message: &Message) -> MessengerResult<()> {
        let bytes = encode_record(message)?;

        let mut guard = self.inner.writer.lock().await;
        let writer = guard.as_mut().ok_or(MessengerError::NotConnected)?;
        let write = async {
            writer.write_all(&bytes).await?;
            writer.flush().await
        };
        match tokio::time::timeout(self.inner.config.write_timeout, write).await {
            Ok(result) => result?,
            Err(_) => return Err(MessengerError::timeout("write record")),
        }

        trace!(
            message_type = %message.message_type,
            message_id = %message.message_id,
            bytes = bytes.len(),
            "Wrote record"
        );
        Ok(())
    }

    fn transport_failure(&self, error: MessengerError) -> MessengerError {
        warn!(error = %error, "Transport failure");
        self.report(&ErrorEvent::Transport(&error));
        error
    }

    fn report(&self, event: &ErrorEvent<'_>) {
        let observers = self
            .inner
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for observer in &observers {
            observer(event);
        }
    }
}

impl fmt::Debug for Messenger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Messenger")
            .field("config", &self.inner.config)
            .field("listeners", &self.inner.listeners)
            .field("pending", &self.inner.pending.len())
            .field("connected", &self.is_connected())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures_util::{StreamExt, stream};
    use linemux_core::SequentialIdGenerator;
    use linemux_protocol::{Envelope, ProtocolError, ReplyStatus};
    use serde_json::json;
    use tokio::io::DuplexStream;
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;

    use crate::registry::HandlerOutput;

    const WAIT: Duration = Duration::from_secs(2);

    fn test_config() -> MessengerConfig {
        MessengerConfig::default().with_request_timeout(Some(Duration::from_secs(5)))
    }

    fn messenger(prefix: &str) -> Messenger {
        Messenger::with_id_generator(test_config(), Arc::new(SequentialIdGenerator::new(prefix)))
    }

    async fn echo(message: Message) -> HandlerResult {
        Ok(HandlerOutput::Value(message.data))
    }

    async fn pong(_message: Message) -> HandlerResult {
        Ok(HandlerOutput::Value(json!("pong")))
    }

    /// Two messengers wired to each other through an in-memory stream.
    async fn connected_pair() -> (Messenger, Messenger) {
        let left = messenger("left");
        let right = messenger("right");
        let (a, b) = tokio::io::duplex(64 * 1024);
        spawn_serve(&left, a);
        spawn_serve(&right, b);
        left.await_connection().await;
        right.await_connection().await;
        (left, right)
    }

    fn spawn_serve(messenger: &Messenger, stream: DuplexStream) -> JoinHandle<MessengerResult<()>> {
        let messenger = messenger.clone();
        tokio::spawn(async move { messenger.serve_connection(stream).await })
    }

    /// Test side of a connection that speaks raw bytes.
    struct RawPeer {
        stream: DuplexStream,
        frames: FrameReassembler,
        inbox: VecDeque<Message>,
        served: JoinHandle<MessengerResult<()>>,
    }

    impl RawPeer {
        async fn connect(messenger: &Messenger) -> Self {
            let (ours, theirs) = tokio::io::duplex(64 * 1024);
            let served = spawn_serve(messenger, theirs);
            messenger.await_connection().await;
            Self {
                stream: ours,
                frames: FrameReassembler::new(1024 * 1024),
                inbox: VecDeque::new(),
                served,
            }
        }

        async fn write(&mut self, bytes: &[u8]) {
            self.stream.write_all(bytes).await.unwrap();
            self.stream.flush().await.unwrap();
        }

        async fn next_message(&mut self) -> Message {
            loop {
                if let Some(message) = self.inbox.pop_front() {
                    return message;
                }
                let mut chunk = [0u8; 4096];
                let read = tokio::time::timeout(WAIT, self.stream.read(&mut chunk))
                    .await
                    .expect("timed out waiting for a record")
                    .unwrap();
                assert!(read > 0, "connection closed");
                for record in self.frames.feed(&chunk[..read]).unwrap() {
                    self.inbox.push_back(decode_record(&record).unwrap());
                }
            }
        }

        async fn next_envelope(&mut self) -> (Message, Envelope) {
            let message = self.next_message().await;
            let envelope = Envelope::from_value(message.data.clone()).unwrap();
            (message, envelope)
        }
    }

    fn content(data: Value) -> Value {
        let envelope = Envelope::from_value(data).unwrap();
        assert!(envelope.done);
        assert_eq!(envelope.status, ReplyStatus::Success);
        envelope.content.unwrap()
    }

    #[derive(Clone, Default)]
    struct Observed(Arc<StdMutex<Vec<String>>>);

    impl Observed {
        fn watch(&self, messenger: &Messenger) {
            let seen = Arc::clone(&self.0);
            messenger.on_error(move |event| {
                let line = match event {
                    ErrorEvent::Handler { message, error } => {
                        format!("handler {} {}: {}", message.message_type, message.message_id, error)
                    }
                    ErrorEvent::Transport(error) => format!("transport: {error}"),
                };
                seen.lock().unwrap().push(line);
            });
        }

        fn lines(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    #[tokio::test]
    async fn ping_split_across_three_chunks_dispatches_once() {
        let server = messenger("srv");
        let (tx, mut rx) = mpsc::unbounded_channel();
        server.on("ping", move |message: Message| {
            let tx = tx.clone();
            async move {
                let _ = tx.send((message.message_type, message.message_id));
                Ok::<_, HandlerError>(HandlerOutput::Value(json!("pong")))
            }
        });

        let mut peer = RawPeer::connect(&server).await;
        let record = b"{\"messageType\":\"ping\",\"messageId\":\"1\",\"data\":{}}\r\n";
        peer.write(&record[..7]).await;
        tokio::task::yield_now().await;
        peer.write(&record[7..30]).await;
        tokio::task::yield_now().await;
        peer.write(&record[30..]).await;

        let (reply, envelope) = peer.next_envelope().await;
        assert_eq!(reply.message_type, "ping");
        assert_eq!(reply.message_id, "1");
        assert_eq!(envelope, Envelope::complete(Some(json!("pong"))));

        assert_eq!(rx.recv().await.unwrap(), ("ping".to_string(), "1".to_string()));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn malformed_records_do_not_stop_the_stream() {
        let server = messenger("srv");
        server.on("echo", echo);

        let mut peer = RawPeer::connect(&server).await;
        peer.write(
            b"{\"messageType\":\"echo\",\"messageId\":\"1\",\"data\":\"first\"}\r\n\
              this is not json\r\n\
              {\"messageType\":\"echo\",\"data\":\"no id\"}\r\n\
              {\"messageType\":\"echo\",\"messageId\":\"2\",\"data\":\"second\"}\r\n",
        )
        .await;

        let mut replies = vec![peer.next_message().await, peer.next_message().await];
        replies.sort_by(|a, b| a.message_id.cmp(&b.message_id));
        assert_eq!(replies[0].message_id, "1");
        assert_eq!(content(replies[0].data.clone()), json!("first"));
        assert_eq!(replies[1].message_id, "2");
        assert_eq!(content(replies[1].data.clone()), json!("second"));
    }

    #[tokio::test]
    async fn streaming_reply_keeps_order() {
        let server = messenger("srv");
        server.on("letters", |_message: Message| async move {
            Ok::<_, HandlerError>(HandlerOutput::iter(vec![json!("a"), json!("b"), json!("c")]))
        });

        let mut peer = RawPeer::connect(&server).await;
        peer.write(b"{\"messageType\":\"letters\",\"messageId\":\"s1\"}\r\n").await;

        let mut envelopes = Vec::new();
        for _ in 0..3 {
            let (message, envelope) = peer.next_envelope().await;
            assert_eq!(message.message_id, "s1");
            assert_eq!(message.message_type, "letters");
            envelopes.push(envelope);
        }
        assert_eq!(
            envelopes,
            vec![
                Envelope::chunk(json!("a")),
                Envelope::chunk(json!("b")),
                Envelope::complete(Some(json!("c"))),
            ]
        );
    }

    #[tokio::test]
    async fn stream_failure_ends_the_reply() {
        let server = messenger("srv");
        let observed = Observed::default();
        observed.watch(&server);
        server.on("ping", pong);
        server.on("flaky", |_message: Message| async move {
            let values = stream::iter(vec![
                Ok(json!("a")),
                Err(HandlerError::new("sensor offline")),
                Ok(json!("b")),
            ]);
            Ok::<_, HandlerError>(HandlerOutput::stream(values))
        });

        let mut peer = RawPeer::connect(&server).await;
        peer.write(b"{\"messageType\":\"flaky\",\"messageId\":\"f1\"}\r\n").await;

        let (_, first) = peer.next_envelope().await;
        assert_eq!(first, Envelope::chunk(json!("a")));
        let (message, last) = peer.next_envelope().await;
        assert_eq!(message.message_id, "f1");
        assert_eq!(last, Envelope::failure("sensor offline"));

        // Nothing else follows for f1: the next record is the ping reply.
        peer.write(b"{\"messageType\":\"ping\",\"messageId\":\"p1\"}\r\n").await;
        let (message, _) = peer.next_envelope().await;
        assert_eq!(message.message_id, "p1");

        assert_eq!(observed.lines(), vec!["handler flaky f1: sensor offline".to_string()]);
    }

    #[tokio::test]
    async fn request_resolves_with_echoed_payload() {
        let (client, server) = connected_pair().await;
        server.on("echo", echo);

        let reply = client.request("echo", json!("hi")).await.unwrap();
        assert_eq!(content(reply), json!("hi"));
        assert_eq!(client.pending_requests(), 0);
    }

    #[tokio::test]
    async fn concurrent_requests_resolve_independently() {
        let (client, server) = connected_pair().await;
        server.on("delayed", |message: Message| async move {
            let millis = message.data["millis"].as_u64().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(millis)).await;
            Ok::<_, HandlerError>(HandlerOutput::Value(message.data["tag"].clone()))
        });

        let (slow, fast) = tokio::join!(
            client.request("delayed", json!({"millis": 150, "tag": "slow"})),
            client.request("delayed", json!({"millis": 5, "tag": "fast"})),
        );
        assert_eq!(content(slow.unwrap()), json!("slow"));
        assert_eq!(content(fast.unwrap()), json!("fast"));
        assert_eq!(client.pending_requests(), 0);
    }

    #[tokio::test]
    async fn failed_handler_replies_with_error() {
        let (client, server) = connected_pair().await;
        let observed = Observed::default();
        observed.watch(&server);
        server.on("divide", |message: Message| async move {
            let divisor = message.data.as_i64().unwrap_or(0);
            if divisor == 0 {
                return Err(HandlerError::new("division by zero"));
            }
            HandlerOutput::value(100 / divisor)
        });

        let reply = client.request("divide", json!(0)).await.unwrap();
        let envelope = Envelope::from_value(reply).unwrap();
        assert_eq!(envelope, Envelope::failure("division by zero"));
        assert_eq!(
            observed.lines(),
            vec!["handler divide left-1: division by zero".to_string()]
        );

        let reply = client.request("divide", json!(4)).await.unwrap();
        assert_eq!(content(reply), json!(25));
    }

    #[tokio::test]
    async fn reply_is_not_broadcast_to_local_listeners() {
        let (client, server) = connected_pair().await;
        server.on("echo", echo);

        let local_calls = Arc::new(AtomicUsize::new(0));
        let calls = Arc::clone(&local_calls);
        client.on("echo", move |message: Message| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok::<_, HandlerError>(HandlerOutput::Value(message.data)) }
        });

        let reply = client.request("echo", json!("hi")).await.unwrap();
        assert_eq!(content(reply), json!("hi"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(local_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn later_stream_envelopes_reach_type_handlers() {
        let client = messenger("cli");
        let (tx, mut rx) = mpsc::unbounded_channel();
        client.on("letters", move |message: Message| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(message.data);
                Ok::<_, HandlerError>(HandlerOutput::Value(json!("seen")))
            }
        });

        let mut peer = RawPeer::connect(&client).await;
        let request = {
            let client = client.clone();
            tokio::spawn(async move { client.request("letters", Value::Null).await })
        };

        let sent = peer.next_message().await;
        assert_eq!(sent.message_id, "cli-1");
        for envelope in [
            Envelope::chunk(json!("a")),
            Envelope::chunk(json!("b")),
            Envelope::complete(Some(json!("c"))),
        ] {
            peer.write(&encode_record(&sent.reply(&envelope)).unwrap()).await;
        }

        let reply = tokio::time::timeout(WAIT, request).await.unwrap().unwrap().unwrap();
        assert_eq!(Envelope::from_value(reply).unwrap(), Envelope::chunk(json!("a")));

        let mut later = Vec::new();
        for _ in 0..2 {
            let data = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
            let envelope = Envelope::from_value(data).unwrap();
            later.push(envelope.content.unwrap().as_str().unwrap().to_string());
        }
        later.sort();
        assert_eq!(later, vec!["b".to_string(), "c".to_string()]);

        // The local handler answers them back under the request's id.
        for _ in 0..2 {
            let (message, envelope) = peer.next_envelope().await;
            assert_eq!(message.message_type, "letters");
            assert_eq!(message.message_id, "cli-1");
            assert_eq!(envelope, Envelope::complete(Some(json!("seen"))));
        }
    }

    #[tokio::test]
    async fn every_listener_sees_a_broadcast() {
        let (client, server) = connected_pair().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        for name in ["audit", "metrics"] {
            let tx = tx.clone();
            server.on("note", move |message: Message| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send((name, message.data.clone()));
                    Ok::<_, HandlerError>(HandlerOutput::Value(Value::Null))
                }
            });
        }

        client.send("note", json!({"text": "hello"})).await.unwrap();

        let mut seen = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];
        seen.sort_by_key(|(name, _)| *name);
        assert_eq!(seen[0], ("audit", json!({"text": "hello"})));
        assert_eq!(seen[1], ("metrics", json!({"text": "hello"})));
    }

    #[tokio::test]
    async fn invoke_stays_local() {
        let local = messenger("local");
        local.on("double", |message: Message| async move {
            HandlerOutput::value(message.data.as_i64().unwrap_or(0) * 2)
        });
        local.on("double", |_message: Message| async move {
            Ok::<_, HandlerError>(HandlerOutput::Value(json!("second handler")))
        });

        assert!(!local.is_connected());
        match local.invoke("double", json!(21)).await {
            Some(Ok(HandlerOutput::Value(value))) => assert_eq!(value, json!(42)),
            other => panic!("unexpected invoke result: {other:?}"),
        }
        assert!(local.invoke("triple", json!(1)).await.is_none());
    }

    #[tokio::test]
    async fn send_without_connection_fails() {
        let lonely = messenger("lonely");
        let err = lonely.send("ping", Value::Null).await.unwrap_err();
        assert!(matches!(err, MessengerError::NotConnected));
    }

    #[tokio::test]
    async fn request_times_out_and_forgets_entry() {
        let (client, _server) = connected_pair().await;

        let err = client
            .request_with_timeout("nobody-home", Value::Null, Duration::from_millis(30))
            .await
            .unwrap_err();
        match err {
            MessengerError::RequestTimeout {
                message_type,
                message_id,
                ..
            } => {
                assert_eq!(message_type, "nobody-home");
                assert_eq!(message_id, "left-1");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(client.pending_requests(), 0);
    }

    #[tokio::test]
    async fn dropped_request_is_cancelled() {
        let (client, _server) = connected_pair().await;

        let outcome =
            tokio::time::timeout(Duration::from_millis(20), client.request("nobody-home", Value::Null))
                .await;
        assert!(outcome.is_err());
        assert_eq!(client.pending_requests(), 0);
    }

    #[tokio::test]
    async fn request_without_connection_reports_transport_error() {
        let lonely = messenger("lonely");
        let observed = Observed::default();
        observed.watch(&lonely);

        let err = lonely
            .request_with_timeout("ping", Value::Null, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, MessengerError::RequestTimeout { .. }));
        assert_eq!(observed.lines(), vec!["transport: Not connected".to_string()]);
    }

    #[tokio::test]
    async fn oversized_record_ends_the_connection() {
        let server = Messenger::new(test_config().with_max_record_size(16));
        let observed = Observed::default();
        observed.watch(&server);

        let mut peer = RawPeer::connect(&server).await;
        peer.write(&[b'x'; 64]).await;

        let result = tokio::time::timeout(WAIT, &mut peer.served).await.unwrap().unwrap();
        assert!(matches!(
            result,
            Err(MessengerError::Protocol(ProtocolError::RecordTooLarge { .. }))
        ));
        assert!(!server.is_connected());
        assert_eq!(observed.lines().len(), 1);
        assert!(observed.lines()[0].starts_with("transport: Protocol error: record too large"));
    }

    #[tokio::test]
    async fn records_before_an_oversized_tail_are_dispatched() {
        let server = Messenger::new(test_config().with_max_record_size(16));
        let (tx, mut rx) = mpsc::unbounded_channel();
        server.on("ping", move |message: Message| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(message.message_id);
                Ok::<_, HandlerError>(HandlerOutput::Value(json!("pong")))
            }
        });

        let mut input = b"{\"messageType\":\"ping\",\"messageId\":\"1\"}\r\n".to_vec();
        input.extend_from_slice(&[b'x'; 64]);
        let result = server.read_loop(input.as_slice()).await;

        assert!(matches!(
            result,
            Err(MessengerError::Protocol(ProtocolError::RecordTooLarge { .. }))
        ));
        let dispatched = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(dispatched, "1");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_streams_never_interleave_records() {
        const HANDLERS: usize = 8;
        const REQUESTS: usize = 2;
        const VALUES: usize = 20;

        let server = messenger("srv");
        for handler in 0..HANDLERS {
            server.on("bulk", move |_message: Message| async move {
                let pad = "x".repeat(5000);
                let values = (0..VALUES).map(move |n| json!({"handler": handler, "n": n, "pad": pad}));
                Ok::<_, HandlerError>(HandlerOutput::iter(values.collect::<Vec<_>>()))
            });
        }

        let (mut ours, theirs) = tokio::io::duplex(1024);
        spawn_serve(&server, theirs);
        server.await_connection().await;
        for id in ["b1", "b2"] {
            let record = format!("{{\"messageType\":\"bulk\",\"messageId\":\"{id}\"}}\r\n");
            ours.write_all(record.as_bytes()).await.unwrap();
        }

        let expected = HANDLERS * REQUESTS * VALUES;
        let mut frames = FrameReassembler::new(1024 * 1024);
        let mut chunk = [0u8; 4096];
        let (mut decoded, mut corrupt, mut done) = (0, 0, 0);
        while decoded + corrupt < expected {
            let read = tokio::time::timeout(WAIT, ours.read(&mut chunk))
                .await
                .expect("timed out waiting for replies")
                .unwrap();
            assert!(read > 0, "connection closed");
            for record in frames.feed(&chunk[..read]).unwrap() {
                match decode_record(&record).map(|m| Envelope::from_value(m.data)) {
                    Ok(Ok(envelope)) => {
                        decoded += 1;
                        if envelope.done {
                            done += 1;
                        }
                    }
                    _ => corrupt += 1,
                }
            }
        }

        assert_eq!(corrupt, 0);
        assert_eq!(decoded, expected);
        assert_eq!(done, HANDLERS * REQUESTS);
        assert_eq!(frames.pending_len(), 0);
    }

    #[tokio::test]
    async fn unwritable_stream_stops_being_pulled() {
        let lonely = messenger("lonely");
        let pulls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&pulls);
        lonely.on("numbers", move |_message: Message| {
            let counter = Arc::clone(&counter);
            async move {
                let values = stream::iter((0..100).map(|n| Ok(json!(n)))).inspect(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                });
                Ok::<_, HandlerError>(HandlerOutput::stream(values))
            }
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        lonely.on_error(move |event| {
            if let ErrorEvent::Transport(error) = event {
                let _ = tx.send(error.to_string());
            }
        });

        let input: &[u8] = b"{\"messageType\":\"numbers\",\"messageId\":\"n1\"}\r\n";
        lonely.read_loop(input).await.unwrap();

        let failure = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(failure, "Not connected");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pulls.load(Ordering::SeqCst), 2);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn peer_close_ends_serve_cleanly() {
        let server = messenger("srv");
        let peer = RawPeer::connect(&server).await;
        let RawPeer { stream, served, .. } = peer;
        drop(stream);

        let result = tokio::time::timeout(WAIT, served).await.unwrap().unwrap();
        assert!(result.is_ok());
        assert!(!server.is_connected());
    }

    #[tokio::test]
    async fn await_connection_wakes_on_attach() {
        let messenger = messenger("m");
        let waiter = {
            let messenger = messenger.clone();
            tokio::spawn(async move { messenger.await_connection().await })
        };

        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        messenger.attach(tokio::io::sink()).await;
        tokio::time::timeout(WAIT, waiter).await.unwrap().unwrap();
        assert!(messenger.is_connected());

        messenger.detach().await;
        assert!(!messenger.is_connected());
    }
}
