//! Persistent-connection client: one live connection, multiplexed requests,
//! reconnection with subscription resumption, keep-alive, and lazy mode.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace, warn};

use tether_core::{
    decode_incoming, encode_outgoing, BehaviorSubject, ClientError, IncomingMessage,
    IncomingMethod, Observable, Operation, RequestMessage, RequestParams, Response, ResultKind,
    Teardown,
};
use tether_transport::{
    ConnectOptions, ConnectionEvent, ConnectionParamsProvider, KeepAliveConfig, SocketConnector,
    TransportError, UrlProvider, WsConnection,
};

use crate::link::Envelope;
use crate::ws::request_manager::{RequestManager, TrackedRequest};

/// Computes the reconnect delay for a 0-based attempt index.
pub type RetryDelayFn = Arc<dyn Fn(usize) -> Duration + Send + Sync>;

/// First attempt fires immediately, then exponential backoff capped at 30s.
pub fn default_retry_delay(attempt: usize) -> Duration {
    if attempt == 0 {
        Duration::ZERO
    } else {
        let exp = 2u64.saturating_pow(attempt.min(32) as u32);
        Duration::from_millis(1000u64.saturating_mul(exp).min(30_000))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Idle,
    Connecting,
    Open,
}

/// Published through [`WsClient::connection_state`]; `error` carries what
/// triggered the transition when there was a failure.
#[derive(Debug, Clone)]
pub struct ConnectionStateEvent {
    pub status: ConnectionStatus,
    pub error: Option<ClientError>,
}

impl ConnectionStateEvent {
    fn new(status: ConnectionStatus) -> Self {
        ConnectionStateEvent {
            status,
            error: None,
        }
    }

    fn with_error(status: ConnectionStatus, error: ClientError) -> Self {
        ConnectionStateEvent {
            status,
            error: Some(error),
        }
    }
}

#[derive(Clone)]
pub struct WsClientOptions {
    pub url: UrlProvider,
    pub connector: Arc<dyn SocketConnector>,
    pub keep_alive: KeepAliveConfig,
    pub connection_params: Option<ConnectionParamsProvider>,
    /// Connect on first request instead of at construction.
    pub lazy: bool,
    /// Lazy-mode inactivity window before the connection is dropped.
    pub close_after: Duration,
    pub retry_delay: RetryDelayFn,
}

impl std::fmt::Debug for WsClientOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsClientOptions")
            .field("lazy", &self.lazy)
            .field("close_after", &self.close_after)
            .field("keep_alive", &self.keep_alive)
            .finish_non_exhaustive()
    }
}

impl WsClientOptions {
    pub fn new(url: impl Into<String>, connector: Arc<dyn SocketConnector>) -> Self {
        let url = url.into();
        WsClientOptions {
            url: Arc::new(move || {
                let url = url.clone();
                Box::pin(async move { Ok(url) })
            }),
            connector,
            keep_alive: KeepAliveConfig::default(),
            connection_params: None,
            lazy: false,
            close_after: Duration::ZERO,
            retry_delay: Arc::new(default_retry_delay),
        }
    }
}

struct ClientInner {
    conn: Option<Arc<WsConnection>>,
    /// A connect loop is running (covers backoff sleeps too).
    connecting: bool,
    flush_scheduled: bool,
    closed: bool,
    fatal: Option<ClientError>,
    lazy_closing: bool,
    next_connection_id: u64,
    last_activity: Instant,
}

struct Shared {
    opts: WsClientOptions,
    requests: RequestManager,
    state: BehaviorSubject<ConnectionStateEvent>,
    inner: Mutex<ClientInner>,
}

fn lock(mutex: &Mutex<ClientInner>) -> MutexGuard<'_, ClientInner> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn transport_to_client(err: &TransportError) -> ClientError {
    ClientError::transport(err.to_string())
}

/// The persistent multiplexing client. Cheap to clone.
#[derive(Clone)]
pub struct WsClient {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for WsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsClient")
            .field("state", &self.shared.state.get().status)
            .finish()
    }
}

impl WsClient {
    pub fn new(opts: WsClientOptions) -> Self {
        let lazy = opts.lazy;
        let shared = Arc::new(Shared {
            opts,
            requests: RequestManager::new(),
            state: BehaviorSubject::new(ConnectionStateEvent::new(ConnectionStatus::Idle)),
            inner: Mutex::new(ClientInner {
                conn: None,
                connecting: false,
                flush_scheduled: false,
                closed: false,
                fatal: None,
                lazy_closing: false,
                next_connection_id: 0,
                last_activity: Instant::now(),
            }),
        });
        if !lazy {
            ensure_connected(&shared);
        }
        WsClient { shared }
    }

    /// Latest connection state, replayed to new subscribers.
    pub fn connection_state(&self) -> BehaviorSubject<ConnectionStateEvent> {
        self.shared.state.clone()
    }

    /// Issues one operation over the persistent connection.
    ///
    /// The request is queued and flushed together with everything else
    /// registered in the same tick. Unsubscribing a subscription that is
    /// already on the wire sends `subscription.stop`.
    pub fn request(
        &self,
        op: &Operation,
        last_event_id: Option<String>,
    ) -> Observable<Envelope, ClientError> {
        let shared = self.shared.clone();
        let op = op.clone();
        Observable::new(move |sub| {
            {
                let inner = lock(&shared.inner);
                if let Some(fatal) = &inner.fatal {
                    return Err(fatal.clone());
                }
                if inner.closed {
                    return Err(ClientError::ClosedPrematurely);
                }
            }

            let message = RequestMessage {
                id: op.id,
                method: op.kind.into(),
                params: Some(RequestParams {
                    path: op.path.clone(),
                    input: op.input.clone(),
                    last_event_id: last_event_id.clone(),
                }),
            };
            shared
                .requests
                .register(Arc::new(TrackedRequest::new(message, sub.clone())));
            touch_activity(&shared);
            ensure_connected(&shared);
            schedule_flush(&shared);

            let teardown_shared = shared.clone();
            let id = op.id;
            Ok(Box::new(move || {
                if let Some((request, was_active)) = teardown_shared.requests.remove(id) {
                    if request.is_subscription() && was_active {
                        send_stop(&teardown_shared, id);
                    }
                }
            }) as Teardown)
        })
    }

    /// Graceful shutdown: subscriptions complete, unsent requests are
    /// rejected, in-flight queries and mutations are awaited, then the
    /// socket closes. Further requests fail immediately.
    pub async fn close(&self) {
        let shared = &self.shared;
        let conn = {
            let mut inner = lock(&shared.inner);
            inner.closed = true;
            inner.conn.clone()
        };

        for request in shared.requests.active_requests() {
            if request.is_subscription() {
                shared.requests.remove(request.id());
                request.subscriber.complete();
            }
        }
        for request in shared.requests.take_outgoing() {
            request
                .subscriber
                .error(ClientError::transport("closed before connection was established"));
        }

        shared.requests.wait_for_completions().await;
        if let Some(conn) = conn {
            conn.close();
        }
        shared.state.next(ConnectionStateEvent::new(ConnectionStatus::Idle));
    }
}

fn touch_activity(shared: &Arc<Shared>) {
    lock(&shared.inner).last_activity = Instant::now();
}

fn send_stop(shared: &Arc<Shared>, id: u64) {
    let conn = lock(&shared.inner).conn.clone();
    let Some(conn) = conn else { return };
    if !conn.is_open() {
        return;
    }
    match encode_outgoing(&[RequestMessage::stop(id)]) {
        Ok(text) => {
            let _ = conn.send(text);
        }
        Err(e) => warn!(id, error = %e, "failed to encode subscription stop"),
    }
}

fn ensure_connected(shared: &Arc<Shared>) {
    {
        let mut inner = lock(&shared.inner);
        if inner.closed || inner.fatal.is_some() || inner.connecting || inner.conn.is_some() {
            return;
        }
        inner.connecting = true;
        inner.lazy_closing = false;
    }
    let shared = shared.clone();
    tokio::spawn(connect_loop(shared));
}

fn schedule_flush(shared: &Arc<Shared>) {
    {
        let mut inner = lock(&shared.inner);
        if inner.flush_scheduled {
            return;
        }
        inner.flush_scheduled = true;
    }
    let shared = shared.clone();
    tokio::spawn(async move {
        // Everything requested before the current task suspends goes out in
        // one frame.
        tokio::task::yield_now().await;
        lock(&shared.inner).flush_scheduled = false;
        flush_now(&shared);
    });
}

fn flush_now(shared: &Arc<Shared>) {
    let conn = {
        let inner = lock(&shared.inner);
        match &inner.conn {
            Some(conn) if conn.is_open() => conn.clone(),
            // Not connected yet: requests stay queued and go out on open.
            _ => return,
        }
    };
    let batch = shared.requests.flush();
    if batch.is_empty() {
        return;
    }
    send_requests(shared, &conn, &batch);
}

fn send_requests(shared: &Arc<Shared>, conn: &Arc<WsConnection>, batch: &[Arc<TrackedRequest>]) {
    let messages: Vec<RequestMessage> = batch.iter().map(|r| r.message_snapshot()).collect();
    match encode_outgoing(&messages) {
        Ok(text) => {
            trace!(count = messages.len(), "sending request frame");
            let _ = conn.send(text);
        }
        Err(e) => {
            let err = ClientError::from(e);
            for request in batch {
                shared.requests.remove(request.id());
                request.subscriber.error(err.clone());
            }
        }
    }
}

async fn connect_loop(shared: Arc<Shared>) {
    let mut attempt: usize = 0;
    loop {
        if lock(&shared.inner).closed {
            break;
        }
        let delay = (shared.opts.retry_delay)(attempt);
        if !delay.is_zero() {
            debug!(attempt, delay_ms = delay.as_millis() as u64, "reconnect backoff");
            tokio::time::sleep(delay).await;
        }

        let connection_id = {
            let mut inner = lock(&shared.inner);
            inner.next_connection_id += 1;
            inner.next_connection_id
        };
        let connect_opts = ConnectOptions {
            url: shared.opts.url.clone(),
            connector: shared.opts.connector.clone(),
            keep_alive: shared.opts.keep_alive,
            connection_params: shared.opts.connection_params.clone(),
        };

        match WsConnection::open(connection_id, connect_opts).await {
            Ok((conn, events)) => {
                let conn = Arc::new(conn);
                {
                    let mut inner = lock(&shared.inner);
                    if inner.closed {
                        conn.close();
                        break;
                    }
                    inner.conn = Some(conn.clone());
                }
                shared
                    .state
                    .next(ConnectionStateEvent::new(ConnectionStatus::Open));
                touch_activity(&shared);
                attempt = 0;

                resume_and_flush(&shared, &conn);
                if shared.opts.lazy {
                    spawn_lazy_watchdog(&shared, &conn);
                }

                let close_err = run_connection(&shared, events).await;
                lock(&shared.inner).conn = None;

                if lock(&shared.inner).closed {
                    break;
                }
                let lazy_closed = std::mem::take(&mut lock(&shared.inner).lazy_closing);
                reject_interrupted(&shared);
                if lazy_closed {
                    if !shared.requests.is_idle() {
                        // A request slipped in while the idle close was in
                        // flight; it is still queued, so dial again.
                        debug!("request arrived during idle close, redialing");
                        shared
                            .state
                            .next(ConnectionStateEvent::new(ConnectionStatus::Connecting));
                        continue;
                    }
                    debug!("idle connection closed");
                    shared
                        .state
                        .next(ConnectionStateEvent::new(ConnectionStatus::Idle));
                    break;
                }
                let error = close_err.as_ref().map(transport_to_client);
                debug!(?error, "connection lost, reconnecting");
                shared.state.next(ConnectionStateEvent {
                    status: ConnectionStatus::Connecting,
                    error,
                });
            }
            Err(e) => {
                if e.is_fatal() {
                    let fatal = transport_to_client(&e);
                    {
                        let mut inner = lock(&shared.inner);
                        inner.fatal = Some(fatal.clone());
                    }
                    warn!(error = %e, "fatal connection setup failure");
                    for request in shared.requests.all_requests() {
                        shared.requests.remove(request.id());
                        request.subscriber.error(fatal.clone());
                    }
                    shared.state.next(ConnectionStateEvent::with_error(
                        ConnectionStatus::Idle,
                        fatal,
                    ));
                    break;
                }
                attempt += 1;
                shared.state.next(ConnectionStateEvent::with_error(
                    ConnectionStatus::Connecting,
                    transport_to_client(&e),
                ));
            }
        }
    }
    lock(&shared.inner).connecting = false;
    // A request registered while `connecting` was still set saw
    // ensure_connected as a no-op; pick it up now that the flag is clear.
    if !shared.requests.is_idle() {
        ensure_connected(&shared);
    }
}

/// Replays active subscriptions (same id, latest event id) and flushes the
/// queue, all in one frame when possible.
fn resume_and_flush(shared: &Arc<Shared>, conn: &Arc<WsConnection>) {
    let mut batch = shared.requests.active_requests();
    batch.retain(|r| r.is_subscription());
    batch.extend(shared.requests.flush());
    if batch.is_empty() {
        return;
    }
    send_requests(shared, conn, &batch);
}

async fn run_connection(
    shared: &Arc<Shared>,
    mut events: tokio::sync::mpsc::UnboundedReceiver<ConnectionEvent>,
) -> Option<TransportError> {
    while let Some(event) = events.recv().await {
        match event {
            ConnectionEvent::Message(text) => {
                touch_activity(shared);
                handle_message(shared, &text);
            }
            ConnectionEvent::Closed(err) => return err,
        }
    }
    None
}

fn handle_message(shared: &Arc<Shared>, text: &str) {
    match decode_incoming(text) {
        Ok(IncomingMessage::Request(request)) => match request.method {
            IncomingMethod::Reconnect => {
                debug!("server requested reconnect");
                let conn = lock(&shared.inner).conn.clone();
                if let Some(conn) = conn {
                    conn.close();
                }
            }
        },
        Ok(IncomingMessage::Response(response)) => route_response(shared, response),
        Err(e) => warn!(error = %e, "unparseable inbound frame"),
    }
}

fn route_response(shared: &Arc<Shared>, response: tether_core::ResponseMessage) {
    let Some(request) = shared.requests.get(response.id) else {
        // Stale response for a request torn down meanwhile.
        trace!(id = response.id, "response for unknown request");
        return;
    };
    match response.response {
        Response::Err { error } => {
            shared.requests.remove(response.id);
            request.subscriber.error(ClientError::Rpc(error));
        }
        Response::Ok { result } => {
            if request.is_subscription() {
                match result.kind {
                    // Acknowledgement only; subscribers see data and the
                    // terminal events.
                    ResultKind::Started => trace!(id = response.id, "subscription started"),
                    ResultKind::Stopped => {
                        shared.requests.remove(response.id);
                        request.subscriber.complete();
                    }
                    ResultKind::Data => {
                        if let Some(event_id) = &result.id {
                            request.set_last_event_id(event_id.clone());
                        }
                        request.subscriber.next(Envelope::new(result));
                    }
                }
            } else {
                shared.requests.remove(response.id);
                request.subscriber.next(Envelope::new(result));
                request.subscriber.complete();
            }
        }
    }
}

/// An abrupt close rejects sent queries/mutations; subscriptions stay
/// tracked and resume on the next connection, queued requests stay queued.
fn reject_interrupted(shared: &Arc<Shared>) {
    for request in shared.requests.active_requests() {
        if !request.is_subscription() {
            shared.requests.remove(request.id());
            request.subscriber.error(ClientError::ClosedPrematurely);
        }
    }
}

fn spawn_lazy_watchdog(shared: &Arc<Shared>, conn: &Arc<WsConnection>) {
    let shared = shared.clone();
    let conn = conn.clone();
    tokio::spawn(async move {
        loop {
            let deadline = lock(&shared.inner).last_activity + shared.opts.close_after;
            tokio::time::sleep_until(deadline).await;
            if !conn.is_open() {
                break;
            }
            let idle_since_deadline = {
                let inner = lock(&shared.inner);
                Instant::now() >= inner.last_activity + shared.opts.close_after
            };
            if idle_since_deadline && shared.requests.is_idle() {
                lock(&shared.inner).lazy_closing = true;
                conn.close();
                break;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tether_core::{ErrorCode, Observer, OperationKind};
    use tether_transport::{SocketEvent, SocketSink};
    use tokio::sync::{mpsc, Semaphore};

    struct ServerEnd {
        sent: mpsc::UnboundedReceiver<String>,
        events: mpsc::UnboundedSender<SocketEvent>,
        closes: Arc<AtomicUsize>,
    }

    struct FakeSink {
        sent: mpsc::UnboundedSender<String>,
        closes: Arc<AtomicUsize>,
        close_gate: Option<Arc<Semaphore>>,
    }

    #[async_trait]
    impl SocketSink for FakeSink {
        async fn send(&self, text: String) -> Result<(), TransportError> {
            self.sent
                .send(text)
                .map_err(|_| TransportError::ConnectionClosed)
        }

        async fn close(&self) {
            if let Some(gate) = &self.close_gate {
                let _ = gate.acquire().await;
            }
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct FakeConnector {
        servers: Arc<Mutex<Vec<ServerEnd>>>,
        connects: Arc<AtomicUsize>,
        /// When set, the next connection's close blocks until a permit is
        /// released, pinning the teardown mid-flight.
        close_gate: Mutex<Option<Arc<Semaphore>>>,
    }

    impl FakeConnector {
        fn new() -> Arc<Self> {
            Arc::new(FakeConnector {
                servers: Arc::new(Mutex::new(Vec::new())),
                connects: Arc::new(AtomicUsize::new(0)),
                close_gate: Mutex::new(None),
            })
        }

        fn server(&self, index: usize) -> ServerEnd {
            let mut servers = self.servers.lock().unwrap();
            assert!(index < servers.len(), "connection {index} never happened");
            servers.remove(index)
        }
    }

    #[async_trait]
    impl SocketConnector for FakeConnector {
        async fn connect(
            &self,
            _url: &str,
        ) -> Result<(Box<dyn SocketSink>, mpsc::UnboundedReceiver<SocketEvent>), TransportError>
        {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let (sent_tx, sent_rx) = mpsc::unbounded_channel();
            let (event_tx, event_rx) = mpsc::unbounded_channel();
            let closes = Arc::new(AtomicUsize::new(0));
            self.servers.lock().unwrap().push(ServerEnd {
                sent: sent_rx,
                events: event_tx.clone(),
                closes: closes.clone(),
            });
            Ok((
                Box::new(FakeSink {
                    sent: sent_tx,
                    closes,
                    close_gate: self.close_gate.lock().unwrap().take(),
                }),
                event_rx,
            ))
        }
    }

    async fn settle() {
        for _ in 0..30 {
            tokio::task::yield_now().await;
        }
    }

    fn instant_retry(mut opts: WsClientOptions) -> WsClientOptions {
        opts.retry_delay = Arc::new(|_| Duration::ZERO);
        opts
    }

    fn op(id: u64, kind: OperationKind, path: &str) -> Operation {
        Operation::new(id, kind, path, json!(null))
    }

    fn collecting_observer(
        values: Arc<Mutex<Vec<Envelope>>>,
        errors: Arc<Mutex<Vec<ClientError>>>,
        completes: Arc<AtomicUsize>,
    ) -> Observer<Envelope, ClientError> {
        Observer::new()
            .on_next(move |env| values.lock().unwrap().push(env))
            .on_error(move |err| errors.lock().unwrap().push(err))
            .on_complete(move || {
                completes.fetch_add(1, Ordering::SeqCst);
            })
    }

    #[tokio::test]
    async fn non_lazy_mode_opens_exactly_one_connection() {
        let connector = FakeConnector::new();
        let client = WsClient::new(WsClientOptions::new("ws://test", connector.clone()));
        settle().await;
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert_eq!(client.connection_state().get().status, ConnectionStatus::Open);

        // More requests never dial again.
        let _sub = client
            .request(&op(1, OperationKind::Query, "a"), None)
            .subscribe(Observer::new());
        settle().await;
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn same_tick_requests_go_out_as_one_array_frame() {
        let connector = FakeConnector::new();
        let client = WsClient::new(WsClientOptions::new("ws://test", connector.clone()));
        settle().await;
        let mut server = connector.server(0);

        let _a = client
            .request(&op(1, OperationKind::Query, "a"), None)
            .subscribe(Observer::new());
        let _b = client
            .request(&op(2, OperationKind::Query, "b"), None)
            .subscribe(Observer::new());
        settle().await;

        let frame = server.sent.recv().await.unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        let items = value.as_array().expect("batched frame is a bare array");
        assert_eq!(items.len(), 2);
        assert_eq!(items[0]["id"], json!(1));
        assert_eq!(items[1]["id"], json!(2));
        assert!(server.sent.try_recv().is_err());
    }

    #[tokio::test]
    async fn single_request_is_a_plain_object_frame() {
        let connector = FakeConnector::new();
        let client = WsClient::new(WsClientOptions::new("ws://test", connector.clone()));
        settle().await;
        let mut server = connector.server(0);

        let _a = client
            .request(&op(1, OperationKind::Query, "a"), None)
            .subscribe(Observer::new());
        settle().await;

        let frame = server.sent.recv().await.unwrap();
        assert!(frame.starts_with('{'));
    }

    #[tokio::test]
    async fn query_response_routes_by_id_and_completes() {
        let connector = FakeConnector::new();
        let client = WsClient::new(WsClientOptions::new("ws://test", connector.clone()));
        settle().await;
        let server = connector.server(0);

        let values = Arc::new(Mutex::new(Vec::new()));
        let errors = Arc::new(Mutex::new(Vec::new()));
        let completes = Arc::new(AtomicUsize::new(0));
        let _sub = client
            .request(&op(9, OperationKind::Query, "user.get"), None)
            .subscribe(collecting_observer(
                values.clone(),
                errors.clone(),
                completes.clone(),
            ));
        settle().await;

        server
            .events
            .send(SocketEvent::Message(
                r#"{"id":9,"result":{"data":{"name":"ada"}}}"#.to_string(),
            ))
            .unwrap();
        settle().await;

        assert_eq!(
            values.lock().unwrap()[0].result.data,
            Some(json!({"name": "ada"}))
        );
        assert!(errors.lock().unwrap().is_empty());
        assert_eq!(completes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn error_response_surfaces_the_rpc_error() {
        let connector = FakeConnector::new();
        let client = WsClient::new(WsClientOptions::new("ws://test", connector.clone()));
        settle().await;
        let server = connector.server(0);

        let values = Arc::new(Mutex::new(Vec::new()));
        let errors = Arc::new(Mutex::new(Vec::new()));
        let completes = Arc::new(AtomicUsize::new(0));
        let _sub = client
            .request(&op(4, OperationKind::Query, "x"), None)
            .subscribe(collecting_observer(
                values.clone(),
                errors.clone(),
                completes.clone(),
            ));
        settle().await;

        server
            .events
            .send(SocketEvent::Message(
                r#"{"id":4,"error":{"code":"NOT_FOUND","message":"gone"}}"#.to_string(),
            ))
            .unwrap();
        settle().await;

        let errors = errors.lock().unwrap();
        assert_eq!(errors[0].shape().unwrap().code, ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn subscription_stays_active_and_stop_is_sent_on_unsubscribe() {
        let connector = FakeConnector::new();
        let client = WsClient::new(WsClientOptions::new("ws://test", connector.clone()));
        settle().await;
        let mut server = connector.server(0);

        let values = Arc::new(Mutex::new(Vec::new()));
        let errors = Arc::new(Mutex::new(Vec::new()));
        let completes = Arc::new(AtomicUsize::new(0));
        let sub = client
            .request(&op(7, OperationKind::Subscription, "post.onAdd"), None)
            .subscribe(collecting_observer(
                values.clone(),
                errors.clone(),
                completes.clone(),
            ));
        settle().await;
        let _first_frame = server.sent.recv().await.unwrap();

        for n in 0..2 {
            server
                .events
                .send(SocketEvent::Message(format!(
                    r#"{{"id":7,"result":{{"type":"data","data":{n}}}}}"#
                )))
                .unwrap();
        }
        settle().await;
        assert_eq!(values.lock().unwrap().len(), 2);
        assert_eq!(completes.load(Ordering::SeqCst), 0);

        sub.unsubscribe();
        settle().await;
        let stop = server.sent.recv().await.unwrap();
        assert_eq!(
            serde_json::from_str::<Value>(&stop).unwrap(),
            json!({"id": 7, "method": "subscription.stop"})
        );
    }

    #[tokio::test]
    async fn subscription_resumes_with_same_id_and_last_event_id() {
        let connector = FakeConnector::new();
        let client = WsClient::new(instant_retry(WsClientOptions::new(
            "ws://test",
            connector.clone(),
        )));
        settle().await;
        let mut server = connector.server(0);

        let values = Arc::new(Mutex::new(Vec::new()));
        let errors = Arc::new(Mutex::new(Vec::new()));
        let completes = Arc::new(AtomicUsize::new(0));
        let _sub = client
            .request(&op(7, OperationKind::Subscription, "post.onAdd"), None)
            .subscribe(collecting_observer(
                values.clone(),
                errors.clone(),
                completes.clone(),
            ));
        settle().await;
        server.sent.recv().await.unwrap();

        server
            .events
            .send(SocketEvent::Message(
                r#"{"id":7,"result":{"type":"data","data":"x","id":"ev-42"}}"#.to_string(),
            ))
            .unwrap();
        settle().await;

        // Abrupt drop; the manager reconnects and replays the subscription.
        server
            .events
            .send(SocketEvent::Closed(Some(TransportError::WebSocket(
                "reset".to_string(),
            ))))
            .unwrap();
        settle().await;

        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
        let mut second = connector.server(0);
        let resume = second.sent.recv().await.unwrap();
        let value: Value = serde_json::from_str(&resume).unwrap();
        assert_eq!(value["id"], json!(7));
        assert_eq!(value["method"], json!("subscription"));
        assert_eq!(value["params"]["lastEventId"], json!("ev-42"));
        // The subscriber never saw the interruption.
        assert!(errors.lock().unwrap().is_empty());
        assert_eq!(completes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn interrupted_query_is_rejected_with_closed_prematurely() {
        let connector = FakeConnector::new();
        let client = WsClient::new(instant_retry(WsClientOptions::new(
            "ws://test",
            connector.clone(),
        )));
        settle().await;
        let server = connector.server(0);

        let values = Arc::new(Mutex::new(Vec::new()));
        let errors = Arc::new(Mutex::new(Vec::new()));
        let completes = Arc::new(AtomicUsize::new(0));
        let _sub = client
            .request(&op(3, OperationKind::Query, "x"), None)
            .subscribe(collecting_observer(
                values.clone(),
                errors.clone(),
                completes.clone(),
            ));
        settle().await;

        server.events.send(SocketEvent::Closed(None)).unwrap();
        settle().await;

        assert!(matches!(
            errors.lock().unwrap()[0],
            ClientError::ClosedPrematurely
        ));
        assert!(values.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn server_reconnect_push_dials_a_new_connection() {
        let connector = FakeConnector::new();
        let client = WsClient::new(instant_retry(WsClientOptions::new(
            "ws://test",
            connector.clone(),
        )));
        settle().await;
        let server = connector.server(0);

        server
            .events
            .send(SocketEvent::Message(
                r#"{"id":null,"method":"reconnect"}"#.to_string(),
            ))
            .unwrap();
        settle().await;

        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
        assert_eq!(client.connection_state().get().status, ConnectionStatus::Open);
        // The old socket was told to close.
        assert_eq!(server.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fatal_url_failure_stops_retrying_and_fails_requests() {
        let connector = FakeConnector::new();
        let mut opts = instant_retry(WsClientOptions::new("ws://test", connector.clone()));
        opts.url = Arc::new(|| {
            Box::pin(async { Err(TransportError::FatalSetup("bad url".to_string())) })
        });
        opts.lazy = true;
        let client = WsClient::new(opts);

        let errors = Arc::new(Mutex::new(Vec::new()));
        let errors2 = errors.clone();
        let _sub = client
            .request(&op(1, OperationKind::Query, "x"), None)
            .subscribe(Observer::new().on_error(move |e: ClientError| {
                errors2.lock().unwrap().push(e);
            }));
        settle().await;

        assert_eq!(connector.connects.load(Ordering::SeqCst), 0);
        assert!(errors.lock().unwrap()[0].is_transport());

        // Later requests fail immediately with the recorded fatal error.
        let late_errors = Arc::new(Mutex::new(Vec::new()));
        let late2 = late_errors.clone();
        let _late = client
            .request(&op(2, OperationKind::Query, "y"), None)
            .subscribe(Observer::new().on_error(move |e: ClientError| {
                late2.lock().unwrap().push(e);
            }));
        settle().await;
        assert_eq!(late_errors.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn lazy_mode_connects_on_demand_and_closes_when_idle() {
        let connector = FakeConnector::new();
        let mut opts = WsClientOptions::new("ws://test", connector.clone());
        opts.lazy = true;
        opts.close_after = Duration::from_secs(10);
        let client = WsClient::new(opts);
        settle().await;
        assert_eq!(connector.connects.load(Ordering::SeqCst), 0);

        let values = Arc::new(Mutex::new(Vec::new()));
        let errors = Arc::new(Mutex::new(Vec::new()));
        let completes = Arc::new(AtomicUsize::new(0));
        let _sub = client
            .request(&op(1, OperationKind::Query, "a"), None)
            .subscribe(collecting_observer(
                values.clone(),
                errors.clone(),
                completes.clone(),
            ));
        settle().await;
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        let server = connector.server(0);

        server
            .events
            .send(SocketEvent::Message(
                r#"{"id":1,"result":{"data":1}}"#.to_string(),
            ))
            .unwrap();
        settle().await;
        assert_eq!(completes.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(11)).await;
        settle().await;

        // Closed for inactivity, and the drop never triggered a reconnect.
        assert_eq!(client.connection_state().get().status, ConnectionStatus::Idle);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn request_during_idle_close_redials_and_flushes() {
        let connector = FakeConnector::new();
        let gate = Arc::new(Semaphore::new(0));
        *connector.close_gate.lock().unwrap() = Some(gate.clone());
        let mut opts = WsClientOptions::new("ws://test", connector.clone());
        opts.lazy = true;
        opts.close_after = Duration::from_secs(10);
        let client = WsClient::new(opts);

        let warmup_completes = Arc::new(AtomicUsize::new(0));
        let wc = warmup_completes.clone();
        let _warmup = client
            .request(&op(1, OperationKind::Query, "a"), None)
            .subscribe(Observer::new().on_complete(move || {
                wc.fetch_add(1, Ordering::SeqCst);
            }));
        settle().await;
        let server = connector.server(0);
        server
            .events
            .send(SocketEvent::Message(
                r#"{"id":1,"result":{"data":1}}"#.to_string(),
            ))
            .unwrap();
        settle().await;
        assert_eq!(warmup_completes.load(Ordering::SeqCst), 1);

        // The idle deadline fires and the socket teardown starts, but the
        // gate holds it open. A request arriving in this window must not
        // be stranded.
        tokio::time::advance(Duration::from_secs(11)).await;
        let values = Arc::new(Mutex::new(Vec::new()));
        let errors = Arc::new(Mutex::new(Vec::new()));
        let completes = Arc::new(AtomicUsize::new(0));
        let _sub = client
            .request(&op(2, OperationKind::Query, "b"), None)
            .subscribe(collecting_observer(
                values.clone(),
                errors.clone(),
                completes.clone(),
            ));
        settle().await;
        gate.add_permits(1);
        settle().await;

        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
        let mut second = connector.server(0);
        let frame = second.sent.recv().await.unwrap();
        assert_eq!(serde_json::from_str::<Value>(&frame).unwrap()["id"], json!(2));

        second
            .events
            .send(SocketEvent::Message(
                r#"{"id":2,"result":{"data":2}}"#.to_string(),
            ))
            .unwrap();
        settle().await;
        assert!(errors.lock().unwrap().is_empty());
        assert_eq!(completes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn subscription_started_ack_is_not_delivered_to_the_subscriber() {
        let connector = FakeConnector::new();
        let client = WsClient::new(WsClientOptions::new("ws://test", connector.clone()));
        settle().await;
        let server = connector.server(0);

        let values = Arc::new(Mutex::new(Vec::new()));
        let errors = Arc::new(Mutex::new(Vec::new()));
        let completes = Arc::new(AtomicUsize::new(0));
        let _sub = client
            .request(&op(7, OperationKind::Subscription, "post.onAdd"), None)
            .subscribe(collecting_observer(
                values.clone(),
                errors.clone(),
                completes.clone(),
            ));
        settle().await;

        server
            .events
            .send(SocketEvent::Message(
                r#"{"id":7,"result":{"type":"started"}}"#.to_string(),
            ))
            .unwrap();
        server
            .events
            .send(SocketEvent::Message(
                r#"{"id":7,"result":{"type":"data","data":"first"}}"#.to_string(),
            ))
            .unwrap();
        settle().await;

        // Only the data event reaches the subscriber, and the subscription
        // is still live.
        let values = values.lock().unwrap();
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].result.kind, ResultKind::Data);
        assert_eq!(values[0].result.data, Some(json!("first")));
        assert!(errors.lock().unwrap().is_empty());
        assert_eq!(completes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn graceful_close_completes_subscriptions_and_rejects_unsent() {
        let connector = FakeConnector::new();
        let client = WsClient::new(WsClientOptions::new("ws://test", connector.clone()));
        settle().await;
        let mut server = connector.server(0);

        let sub_completes = Arc::new(AtomicUsize::new(0));
        let sub_completes2 = sub_completes.clone();
        let _active = client
            .request(&op(1, OperationKind::Subscription, "s"), None)
            .subscribe(Observer::new().on_complete(move || {
                sub_completes2.fetch_add(1, Ordering::SeqCst);
            }));
        settle().await;
        server.sent.recv().await.unwrap();

        // Queued after the last flush, never sent: simulate by registering
        // and closing before the flush tick runs.
        let unsent_errors = Arc::new(Mutex::new(Vec::new()));
        let unsent2 = unsent_errors.clone();
        let _queued = client
            .request(&op(2, OperationKind::Query, "q"), None)
            .subscribe(Observer::new().on_error(move |e: ClientError| {
                unsent2.lock().unwrap().push(e);
            }));
        client.close().await;

        assert_eq!(sub_completes.load(Ordering::SeqCst), 1);
        assert!(unsent_errors.lock().unwrap()[0].is_transport());
        assert_eq!(client.connection_state().get().status, ConnectionStatus::Idle);

        // New requests are refused outright.
        let refused = Arc::new(Mutex::new(Vec::new()));
        let refused2 = refused.clone();
        let _r = client
            .request(&op(3, OperationKind::Query, "z"), None)
            .subscribe(Observer::new().on_error(move |e: ClientError| {
                refused2.lock().unwrap().push(e);
            }));
        assert!(matches!(
            refused.lock().unwrap()[0],
            ClientError::ClosedPrematurely
        ));
    }

    #[tokio::test]
    async fn connection_state_tracks_transitions() {
        let connector = FakeConnector::new();
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let client = WsClient::new(instant_retry(WsClientOptions::new(
            "ws://test",
            connector.clone(),
        )));
        let statuses2 = statuses.clone();
        let _watch = client
            .connection_state()
            .subscribe(move |event: ConnectionStateEvent| {
                statuses2.lock().unwrap().push(event.status);
            });
        settle().await;
        assert_eq!(
            *statuses.lock().unwrap(),
            vec![ConnectionStatus::Idle, ConnectionStatus::Open]
        );

        let server = connector.server(0);
        server.events.send(SocketEvent::Closed(None)).unwrap();
        settle().await;

        let seen = statuses.lock().unwrap().clone();
        assert!(seen.contains(&ConnectionStatus::Connecting));
        assert_eq!(*seen.last().unwrap(), ConnectionStatus::Open);
    }
}
