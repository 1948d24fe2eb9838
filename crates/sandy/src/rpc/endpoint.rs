use std::{
    collections::HashMap,
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::{sync::oneshot, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, debug_span, warn};

use super::{
    channel::{MessageReader, MessageWriter},
    message::{Message, RequestId},
};
use crate::{
    error::{Error, Result},
    protocol::{CANCEL_REQUEST, CancelParams},
};

/// Per-message context handed to a [`Service`].
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Id of the inbound request; `None` for notifications.
    pub id: Option<RequestId>,
    /// Fires when the peer cancels the request or the channel closes.
    pub cancel: CancellationToken,
}

/// Serves the requests and notifications a peer sends over an [`Endpoint`].
///
/// Requests are dispatched concurrently, each on its own task. Notifications
/// are delivered one at a time in arrival order, so handlers should return
/// promptly.
#[async_trait::async_trait]
pub trait Service: Send + Sync + 'static {
    async fn handle_request(&self, ctx: RequestContext, method: &str, params: Value)
    -> Result<Value>;

    async fn handle_notification(&self, ctx: RequestContext, method: &str, params: Value) {
        let _ = (ctx, params);
        debug!(method, "ignoring notification");
    }
}

#[async_trait::async_trait]
impl<T: Service + ?Sized> Service for Arc<T> {
    async fn handle_request(
        &self,
        ctx: RequestContext,
        method: &str,
        params: Value,
    ) -> Result<Value> {
        (**self).handle_request(ctx, method, params).await
    }

    async fn handle_notification(&self, ctx: RequestContext, method: &str, params: Value) {
        (**self).handle_notification(ctx, method, params).await;
    }
}

type Waiter = oneshot::Sender<Result<Value>>;

#[derive(Default)]
struct PendingTable {
    closed: Option<String>,
    waiters: HashMap<RequestId, Waiter>,
}

struct Inner {
    label: String,
    writer: MessageWriter,
    next_id: AtomicU64,
    pending: Mutex<PendingTable>,
    inbound: Mutex<HashMap<RequestId, CancellationToken>>,
    shutdown: CancellationToken,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

/// One side of a bidirectional request/response channel.
///
/// Outbound requests may be pipelined; responses are matched by id in any
/// order. When the channel closes every outstanding request fails with
/// [`Error::Channel`].
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("label", &self.inner.label)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Endpoint {
    /// Starts reading `reader` on a background task, dispatching to `service`.
    pub fn attach(
        label: impl Into<String>,
        reader: MessageReader,
        writer: MessageWriter,
        service: Arc<dyn Service>,
    ) -> Self {
        let inner = Arc::new(Inner {
            label: label.into(),
            writer,
            next_id: AtomicU64::new(1),
            pending: Mutex::new(PendingTable::default()),
            inbound: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            reader_task: Mutex::new(None),
        });
        let task = tokio::spawn(read_loop(Arc::downgrade(&inner), reader, service));
        *inner.reader_task.lock() = Some(task);
        Self { inner }
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub async fn request(
        &self,
        method: &str,
        params: Value,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.inner.pending.lock();
            if let Some(reason) = &pending.closed {
                return Err(Error::Channel(reason.clone()));
            }
            pending.waiters.insert(id, tx);
        }
        let mut guard = PendingGuard {
            inner: Arc::clone(&self.inner),
            id,
            sent: false,
        };

        self.inner
            .writer
            .send(&Message::request(id, method, params))
            .await?;
        guard.sent = true;

        tokio::select! {
            outcome = rx => {
                drop(guard);
                outcome.unwrap_or_else(|_| Err(self.closed_error()))
            }
            () = cancel.cancelled() => {
                debug!(endpoint = %self.inner.label, request_id = id, method, "cancelling request");
                drop(guard);
                Err(Error::Cancelled)
            }
        }
    }

    pub async fn notify(&self, method: &str, params: Value) -> Result<()> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        self.inner
            .writer
            .send(&Message::notification(method, params))
            .await?;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Resolves once the channel is closed, locally or by the peer.
    pub async fn closed(&self) {
        self.inner.shutdown.cancelled().await;
    }

    pub fn close_reason(&self) -> Option<String> {
        self.inner.pending.lock().closed.clone()
    }

    /// Closes the channel. Idempotent.
    pub async fn close(&self) {
        self.terminate("channel closed locally");
        self.inner.writer.close().await;
        if let Some(task) = self.inner.reader_task.lock().take() {
            task.abort();
        }
    }

    /// Closes the channel without awaiting the writer.
    pub fn abort(&self) {
        self.terminate("channel aborted");
        self.inner.writer.close_now();
        if let Some(task) = self.inner.reader_task.lock().take() {
            task.abort();
        }
    }

    fn closed_error(&self) -> Error {
        Error::Channel(
            self.close_reason()
                .unwrap_or_else(|| "channel is closed".to_string()),
        )
    }

    fn terminate(&self, reason: &str) {
        let waiters = {
            let mut pending = self.inner.pending.lock();
            if pending.closed.is_some() {
                return;
            }
            pending.closed = Some(format!("{}: {reason}", self.inner.label));
            std::mem::take(&mut pending.waiters)
        };
        self.inner.shutdown.cancel();
        debug!(endpoint = %self.inner.label, reason, outstanding = waiters.len(), "channel terminated");
        for (_, waiter) in waiters {
            let _ = waiter.send(Err(self.closed_error()));
        }
    }

    async fn dispatch(&self, message: Message, service: &Arc<dyn Service>) {
        match message {
            Message::Request { id, method, params } => {
                let token = self.inner.shutdown.child_token();
                self.inner.inbound.lock().insert(id, token.clone());
                let span = debug_span!("rpc.request", endpoint = %self.inner.label, request_id = id, %method);
                let endpoint = self.clone();
                let service = Arc::clone(service);
                tokio::spawn(
                    async move {
                        let ctx = RequestContext {
                            id: Some(id),
                            cancel: token.clone(),
                        };
                        // The handler is polled first so it can observe its own
                        // cancellation; one that ignores it is dropped.
                        let result = tokio::select! {
                            biased;
                            result = service.handle_request(ctx, &method, params) => result,
                            () = token.cancelled() => Err(Error::Cancelled),
                        };
                        endpoint.inner.inbound.lock().remove(&id);
                        let response = Message::response(id, result.map_err(|e| e.to_rpc()));
                        if let Err(err) = endpoint.inner.writer.send(&response).await {
                            debug!(%err, "response dropped");
                        }
                    }
                    .instrument(span),
                );
            }
            Message::Response { id, outcome } => {
                let waiter = self.inner.pending.lock().waiters.remove(&id);
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(outcome.map_err(Error::from));
                    }
                    None => debug!(endpoint = %self.inner.label, request_id = id, "response for unknown request"),
                }
            }
            Message::Notification { method, params } if method == CANCEL_REQUEST => {
                match serde_json::from_value::<CancelParams>(params) {
                    Ok(CancelParams { id }) => {
                        if let Some(token) = self.inner.inbound.lock().remove(&id) {
                            token.cancel();
                        }
                    }
                    Err(err) => warn!(endpoint = %self.inner.label, %err, "malformed cancellation"),
                }
            }
            Message::Notification { method, params } => {
                let ctx = RequestContext {
                    id: None,
                    cancel: self.inner.shutdown.child_token(),
                };
                service.handle_notification(ctx, &method, params).await;
            }
        }
    }
}

/// Removes the pending entry when the request future completes or is dropped.
///
/// A request still awaiting its response at that point is cancelled at the
/// peer, so dropping the future of a nested call retires the remote handler.
struct PendingGuard {
    inner: Arc<Inner>,
    id: RequestId,
    sent: bool,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        let outstanding = {
            let mut pending = self.inner.pending.lock();
            pending.waiters.remove(&self.id).is_some() && pending.closed.is_none()
        };
        if !(outstanding && self.sent) {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(request_id = self.id, "no runtime to deliver cancellation");
            return;
        };
        let endpoint = Endpoint {
            inner: Arc::clone(&self.inner),
        };
        let id = self.id;
        runtime.spawn(async move {
            if let Err(err) = endpoint.notify(CANCEL_REQUEST, json!(CancelParams { id })).await {
                debug!(%err, request_id = id, "failed to send cancellation");
            }
        });
    }
}

async fn read_loop(inner: Weak<Inner>, mut reader: MessageReader, service: Arc<dyn Service>) {
    let reason = loop {
        let Some(shutdown) = inner.upgrade().map(|i| i.shutdown.clone()) else {
            return;
        };
        let next = tokio::select! {
            () = shutdown.cancelled() => return,
            next = reader.read() => next,
        };
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let endpoint = Endpoint { inner };
        match next {
            Ok(Some(message)) => endpoint.dispatch(message, &service).await,
            Ok(None) => break "peer closed the channel".to_string(),
            Err(err) => {
                warn!(endpoint = %endpoint.inner.label, %err, "channel read failed");
                break err.to_string();
            }
        }
    };
    if let Some(inner) = inner.upgrade() {
        Endpoint { inner }.terminate(&reason);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use anyhow::{Context, Result};
    use tokio::{
        io::{DuplexStream, ReadHalf, WriteHalf, duplex, split},
        sync::Notify,
        time::timeout,
    };

    use super::*;

    struct Echo {
        started: Notify,
        cancelled: Notify,
        observed: Notify,
    }

    #[async_trait::async_trait]
    impl Service for Echo {
        async fn handle_request(
            &self,
            ctx: RequestContext,
            method: &str,
            params: Value,
        ) -> crate::Result<Value> {
            match method {
                "echo" => Ok(params),
                "slow" => {
                    tokio::time::sleep(Duration::from_millis(params.as_u64().unwrap_or(0))).await;
                    Ok(params)
                }
                "hang" => {
                    let _retired = NotifyOnDrop(&self.cancelled);
                    self.started.notify_one();
                    std::future::pending().await
                }
                "watch" => {
                    self.started.notify_one();
                    ctx.cancel.cancelled().await;
                    self.observed.notify_one();
                    Err(Error::Cancelled)
                }
                _ => Err(crate::error::ProtocolError::method_not_found(method).into()),
            }
        }
    }

    struct NotifyOnDrop<'a>(&'a Notify);

    impl Drop for NotifyOnDrop<'_> {
        fn drop(&mut self) {
            self.0.notify_one();
        }
    }

    fn echo() -> Arc<Echo> {
        Arc::new(Echo {
            started: Notify::new(),
            cancelled: Notify::new(),
            observed: Notify::new(),
        })
    }

    fn halves(stream: DuplexStream) -> (MessageReader, MessageWriter) {
        let (r, w): (ReadHalf<DuplexStream>, WriteHalf<DuplexStream>) = split(stream);
        (MessageReader::new(r), MessageWriter::new(w))
    }

    fn pair(server: Arc<Echo>) -> (Endpoint, Endpoint) {
        let (a, b) = duplex(64 * 1024);
        let (ar, aw) = halves(a);
        let (br, bw) = halves(b);
        let client = Endpoint::attach("client", ar, aw, echo());
        let server = Endpoint::attach("server", br, bw, server);
        (client, server)
    }

    #[tokio::test]
    async fn pipelined_requests_complete_out_of_order() -> Result<()> {
        let (client, _server) = pair(echo());
        let token = CancellationToken::new();

        let slow = client.request("slow", json!(200), &token);
        let fast = client.request("slow", json!(1), &token);
        let (slow, fast) = timeout(Duration::from_secs(5), async { tokio::join!(slow, fast) })
            .await
            .context("requests timed out")?;

        assert_eq!(slow?, json!(200));
        assert_eq!(fast?, json!(1));
        Ok(())
    }

    #[tokio::test]
    async fn remote_errors_keep_their_kind() {
        let (client, _server) = pair(echo());
        let err = client
            .request("nope", Value::Null, &CancellationToken::new())
            .await
            .expect_err("unknown method must fail");
        assert_eq!(err.kind(), crate::ErrorKind::MethodNotFound);
    }

    #[tokio::test]
    async fn cancellation_reaches_the_remote_handler() -> Result<()> {
        let server = echo();
        let (client, _server) = pair(Arc::clone(&server));
        let token = CancellationToken::new();

        let call = client.request("hang", Value::Null, &token);
        let cancel = async {
            server.started.notified().await;
            token.cancel();
            server.cancelled.notified().await;
        };
        let (result, ()) = timeout(Duration::from_secs(5), async { tokio::join!(call, cancel) })
            .await
            .context("cancellation timed out")?;

        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(
            client
                .request("echo", json!("still open"), &CancellationToken::new())
                .await?,
            json!("still open")
        );
        Ok(())
    }

    #[tokio::test]
    async fn handlers_observe_their_cancellation() -> Result<()> {
        let server = echo();
        let (client, _server) = pair(Arc::clone(&server));
        let token = CancellationToken::new();

        let call = client.request("watch", Value::Null, &token);
        let cancel = async {
            server.started.notified().await;
            token.cancel();
            server.observed.notified().await;
        };
        let (result, ()) = timeout(Duration::from_secs(5), async { tokio::join!(call, cancel) })
            .await
            .context("handler never saw the cancellation")?;
        assert!(matches!(result, Err(Error::Cancelled)));
        Ok(())
    }

    #[tokio::test]
    async fn dropping_a_request_cancels_it_remotely() -> Result<()> {
        let server = echo();
        let (client, _server) = pair(Arc::clone(&server));

        let cancel = CancellationToken::new();
        let call = client.request("hang", Value::Null, &cancel);
        let abandon = async {
            tokio::select! {
                _ = call => panic!("hang must not complete"),
                () = server.started.notified() => {}
            }
        };
        timeout(Duration::from_secs(5), abandon)
            .await
            .context("handler never started")?;
        timeout(Duration::from_secs(5), server.cancelled.notified())
            .await
            .context("dropped request was not cancelled at the peer")?;
        Ok(())
    }

    #[tokio::test]
    async fn closing_the_peer_fails_outstanding_requests() -> Result<()> {
        let server = echo();
        let (client, server_endpoint) = pair(Arc::clone(&server));

        let cancel = CancellationToken::new();
        let call = client.request("hang", Value::Null, &cancel);
        let close = async {
            server.started.notified().await;
            server_endpoint.close().await;
        };
        let (result, ()) = timeout(Duration::from_secs(5), async { tokio::join!(call, close) })
            .await
            .context("close timed out")?;

        assert!(matches!(result, Err(Error::Channel(_))));
        timeout(Duration::from_secs(5), client.closed())
            .await
            .context("client never observed closure")?;
        assert!(matches!(
            client.notify("echo", Value::Null).await,
            Err(Error::Channel(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (client, _server) = pair(echo());
        client.close().await;
        client.close().await;
        client.abort();
        assert!(client.is_closed());
        assert!(client.close_reason().is_some());
    }
}
