//! C3: the RPC client (§4.3).
//!
//! One [`Client`] owns one duplex TCP stream to exactly one peer. Requests
//! are written by a dedicated writer task reading off an unbounded channel
//! (so a [`Proxy`]'s `Drop` can enqueue a fire-and-forget `delete` without
//! needing an async context); responses are matched to pending callers by
//! `req_id` on a dedicated reader task. Because both tasks are plain tokio
//! tasks rather than a hand-rolled poll loop, a synchronous wait on a
//! [`RpcFuture`] already gives the tokio scheduler room to run this thread's
//! local [`crate::server::Server`] dispatch task concurrently, so a call
//! chain that loops back into this process is serviced while the original
//! call is still awaiting its reply (§4.6, §9 re-architecture note 4).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{Result, RpcError};
use crate::log::{debug, warn};
use crate::proxy::{ProxyHandle, ProxyOptions, ReturnType, SyncMode};
use crate::registry;
use crate::serializer::{self, SerializerTag};
use crate::value::Value;
use crate::wire::{self, RequestFrame, ResponseFrame};

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub serializer_tag: SerializerTag,
    pub connect_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            serializer_tag: SerializerTag::Msgpack,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

type PendingMap = Mutex<HashMap<i64, oneshot::Sender<Result<Value>>>>;

pub struct Client {
    address: String,
    tag: SerializerTag,
    pending: PendingMap,
    next_req_id: AtomicI64,
    closed: AtomicBool,
    write_tx: mpsc::UnboundedSender<RequestFrame>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    writer_task: Mutex<Option<JoinHandle<()>>>,
}

/// A pending reply to a single request, scoped to one client and one
/// `req_id` (§3 "Future"). `cancel` is deliberately absent: the request has
/// already been sent and the peer has no cancellation channel (§5).
pub struct RpcFuture {
    rx: oneshot::Receiver<Result<Value>>,
    action: String,
}

impl RpcFuture {
    /// Awaits the terminal value: a decoded result, a `RemoteCallError`, or
    /// `PeerGone` if the client disconnects first. `timeout` bounds the wait
    /// (§4.3's `process_until_future`); `None` waits indefinitely.
    pub async fn result(self, timeout: Option<Duration>) -> Result<Value> {
        match timeout {
            Some(d) => match tokio::time::timeout(d, self.rx).await {
                Ok(Ok(r)) => r,
                Ok(Err(_)) => Err(RpcError::PeerGone {
                    peer: "<client dropped>".to_string(),
                }),
                Err(_) => Err(RpcError::Timeout {
                    action: self.action,
                    waited_ms: d.as_millis() as u64,
                }),
            },
            None => self.rx.await.unwrap_or(Err(RpcError::PeerGone {
                peer: "<client dropped>".to_string(),
            })),
        }
    }
}

/// What [`Client::send`] hands back, mirroring §4.3's three `sync` modes.
pub enum Sent {
    /// `sync = off`: no reply is expected.
    None,
    /// `sync = async`: caller awaits the future on their own schedule.
    Future(RpcFuture),
    /// `sync = sync`: the client already blocked for the result.
    Value(Value),
}

fn strip_scheme(address: &str) -> Result<String> {
    if let Some(rest) = address.strip_prefix("tcp://") {
        return Ok(rest.to_string());
    }
    if let Some(name) = address.strip_prefix("inproc://") {
        return registry::resolve_inproc_alias(name).ok_or_else(|| RpcError::ConnectionRefused {
            peer: address.to_string(),
        });
    }
    Ok(address.to_string())
}

impl Client {
    /// Connects to `address` (a `tcp://host:port` or `inproc://name`
    /// endpoint) and health-checks it with a `ping` bounded by
    /// `options.connect_timeout` before returning (§4.3 construction).
    pub async fn connect(address: &str, options: ClientOptions) -> Result<Arc<Self>> {
        let dial_target = strip_scheme(address)?;
        let stream = tokio::time::timeout(options.connect_timeout, TcpStream::connect(&dial_target))
            .await
            .map_err(|_| RpcError::ConnectionRefused {
                peer: address.to_string(),
            })?
            .map_err(|_| RpcError::ConnectionRefused {
                peer: address.to_string(),
            })?;
        let (read_half, write_half) = stream.into_split();
        let (write_tx, write_rx) = mpsc::unbounded_channel::<RequestFrame>();

        let client = Arc::new(Self {
            address: address.to_string(),
            tag: options.serializer_tag,
            pending: Mutex::new(HashMap::new()),
            next_req_id: AtomicI64::new(1),
            closed: AtomicBool::new(false),
            write_tx,
            reader_task: Mutex::new(None),
            writer_task: Mutex::new(None),
        });

        let writer_task = tokio::spawn(Self::writer_loop(write_half, write_rx));
        let reader_task = tokio::spawn(client.clone().reader_loop(BufReader::new(read_half)));
        *client.writer_task.lock().unwrap() = Some(writer_task);
        *client.reader_task.lock().unwrap() = Some(reader_task);

        let _span = tracing::info_span!("rpc_client", peer = %address).entered();
        client
            .call_sync("ping", Value::Map(Vec::new()), ReturnType::Auto, Some(options.connect_timeout))
            .await
            .map_err(|_| {
                client.closed.store(true, Ordering::SeqCst);
                RpcError::ConnectionRefused {
                    peer: address.to_string(),
                }
            })?;
        debug!(peer = %address, "client established");
        Ok(client)
    }

    /// Returns the existing client for (this thread, `address`) from the
    /// process-wide registry, or connects and registers a new one (§3
    /// "Client registry").
    pub async fn get_or_connect(address: &str, options: ClientOptions) -> Result<Arc<Self>> {
        if let Some(existing) = registry::lookup_client(address) {
            return Ok(existing);
        }
        let client = Self::connect(address, options).await?;
        registry::register_client(address, client.clone()).map_err(|e| RpcError::BadOptions {
            action: "get_or_connect".to_string(),
            option: e.to_string(),
        })?;
        Ok(client)
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    async fn writer_loop(
        mut writer: tokio::net::tcp::OwnedWriteHalf,
        mut rx: mpsc::UnboundedReceiver<RequestFrame>,
    ) {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = wire::write_request(&mut writer, &frame).await {
                warn!("client writer stopping: {e:?}");
                break;
            }
        }
    }

    async fn reader_loop(self: Arc<Self>, mut reader: impl tokio::io::AsyncRead + Unpin) {
        loop {
            match wire::read_response(&mut reader, self.tag).await {
                Ok(ResponseFrame::Return { req_id, rval, error }) => {
                    let sender = self.pending.lock().unwrap().remove(&req_id);
                    let Some(sender) = sender else {
                        if req_id >= 0 {
                            warn!(req_id, "response for unknown (expired?) request");
                        }
                        continue;
                    };
                    let result = match error {
                        None => Ok(rval),
                        Some((type_name, traceback)) => Err(RpcError::RemoteCallError { type_name, traceback }),
                    };
                    let _ = sender.send(result);
                }
                Ok(ResponseFrame::Disconnect) => {
                    debug!(peer = %self.address, "peer sent disconnect");
                    self.mark_gone();
                    break;
                }
                Err(_) => {
                    self.mark_gone();
                    break;
                }
            }
        }
    }

    /// Fails every pending future with `PeerGone` and marks the client
    /// permanently closed (§4.3 "Receive loop" / "Disconnect detection").
    fn mark_gone(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let pending: Vec<_> = self.pending.lock().unwrap().drain().collect();
        for (_, tx) in pending {
            let _ = tx.send(Err(RpcError::PeerGone {
                peer: self.address.clone(),
            }));
        }
    }

    /// Non-blocking: drains nothing by itself (the reader task already does
    /// that continuously) but reports whether this client has observed its
    /// peer gone, either via an explicit `disconnect` or a transport error.
    pub fn disconnected(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// §4.3 `send`: encodes `opts` (proxying any non-transferable leaf
    /// through this thread's registered server, if any) and dispatches
    /// according to `sync`.
    pub async fn send(
        &self,
        action: &str,
        opts: Value,
        return_type: ReturnType,
        sync: SyncMode,
        timeout: Option<Duration>,
    ) -> Result<Sent> {
        match sync {
            SyncMode::Off => {
                self.call_off(action, opts, return_type)?;
                Ok(Sent::None)
            }
            SyncMode::Async => Ok(Sent::Future(self.call_async(action, opts, return_type).await?)),
            SyncMode::Sync => Ok(Sent::Value(self.call_sync(action, opts, return_type, timeout).await?)),
        }
    }

    /// Applies the proxy-or-fail rule (§4.1) to `opts` before it goes on the
    /// wire: any [`Value::Object`] leaf (e.g. a callback passed as an
    /// argument) is registered with this thread's local server, if any, and
    /// replaced with a [`Value::Proxy`]; absent a local server this fails
    /// with `NonSerializable` (§8 scenario F).
    fn encode_opts(&self, opts: Value) -> Result<Value> {
        let server = registry::current_server();
        serializer::substitute_objects(opts, server.as_ref())
    }

    fn build_frame(&self, req_id: i64, action: &str, opts: Value, return_type: ReturnType) -> Result<RequestFrame> {
        Ok(RequestFrame {
            req_id,
            action: action.to_string(),
            return_type,
            serializer_tag: self.tag,
            opts: self.encode_opts(opts)?,
        })
    }

    /// `sync = off`: fire the frame and forget it. Never blocks, never
    /// touches the pending map. Used directly by [`Proxy`]'s `Drop` impl for
    /// the `delete` action (§4.2 "auto-delete policy" — the destructor path
    /// must not re-enter attribute/call machinery).
    pub fn call_off(&self, action: &str, opts: Value, return_type: ReturnType) -> Result<()> {
        if self.disconnected() {
            return Err(RpcError::PeerGone {
                peer: self.address.clone(),
            });
        }
        let frame = self.build_frame(-1, action, opts, return_type)?;
        self.write_tx.send(frame).map_err(|_| RpcError::PeerGone {
            peer: self.address.clone(),
        })
    }

    /// `sync = async`: registers a pending future and writes the frame, but
    /// does not await the reply.
    pub async fn call_async(&self, action: &str, opts: Value, return_type: ReturnType) -> Result<RpcFuture> {
        if self.disconnected() {
            return Err(RpcError::PeerGone {
                peer: self.address.clone(),
            });
        }
        let req_id = self.next_req_id.fetch_add(1, Ordering::SeqCst);
        let frame = match self.build_frame(req_id, action, opts, return_type) {
            Ok(f) => f,
            Err(e) => return Err(e),
        };
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(req_id, tx);
        if self.write_tx.send(frame).is_err() {
            self.pending.lock().unwrap().remove(&req_id);
            return Err(RpcError::PeerGone {
                peer: self.address.clone(),
            });
        }
        Ok(RpcFuture {
            rx,
            action: action.to_string(),
        })
    }

    /// `sync = sync`: as [`Client::call_async`], then blocks for the result
    /// (§4.3's `process_until_future`).
    pub async fn call_sync(
        &self,
        action: &str,
        opts: Value,
        return_type: ReturnType,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let fut = self.call_async(action, opts, return_type).await?;
        self.process_until_future(fut, timeout).await
    }

    /// Waits on `fut`, bounded by `timeout`. Named after §4.3/§4.6 to keep
    /// the reentrancy story explicit in the API even though, on tokio, the
    /// interleaving itself is handled by tokio's own scheduler rather than
    /// by this function polling two sockets by hand (see module docs).
    pub async fn process_until_future(&self, fut: RpcFuture, timeout: Option<Duration>) -> Result<Value> {
        fut.result(timeout).await
    }

    /// Resolves any proxy in `value` addressed back to this thread's local
    /// server into the real referent (§4.1 "proxy unwrap locality"), leaving
    /// proxies addressed elsewhere untouched.
    async fn decode_rval(&self, value: Value) -> Value {
        let server = registry::current_server();
        serializer::resolve_value(value.clone(), server.as_ref()).await.unwrap_or(value)
    }

    pub async fn get_item(&self, name: &str, opts: ProxyOptions) -> Result<Value> {
        let args = Value::Map(vec![("name".to_string(), Value::Str(name.to_string()))]);
        let v = self
            .call_sync("get_item", args, opts.return_type, opts.timeout)
            .await?;
        Ok(self.decode_rval(v).await)
    }

    pub async fn set_item(&self, name: &str, value: Value) -> Result<()> {
        let args = Value::Map(vec![
            ("name".to_string(), Value::Str(name.to_string())),
            ("value".to_string(), value),
        ]);
        self.call_sync("set_item", args, ReturnType::Auto, None).await?;
        Ok(())
    }

    pub async fn import(&self, name: &str, fromlist: Option<Vec<String>>) -> Result<Value> {
        let mut entries = vec![("name".to_string(), Value::Str(name.to_string()))];
        if let Some(members) = fromlist {
            entries.push((
                "fromlist".to_string(),
                Value::Seq(members.into_iter().map(Value::Str).collect()),
            ));
        }
        let v = self.call_sync("import", Value::Map(entries), ReturnType::Auto, None).await?;
        Ok(self.decode_rval(v).await)
    }

    /// Wraps `handle` with this client so its deferred `call`/`get`/`delete`
    /// operations have a socket to use (§4.2: "implemented on
    /// `crate::client::Proxy`, which pairs a handle with a handle to the
    /// owning `Client`").
    pub fn proxy(self: &Arc<Self>, handle: ProxyHandle) -> Proxy {
        Proxy {
            client: self.clone(),
            handle,
            disposed: false,
        }
    }

    /// Ten paired timestamp round-trips, averaged with no outlier rejection
    /// (§4.3, §9, §10.5 "measure_clock_diff"). Returns the estimated
    /// `remote - local` offset.
    pub async fn measure_clock_diff(&self) -> Result<Duration> {
        use std::time::{SystemTime, UNIX_EPOCH};
        let now_ms = || -> i64 {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as i64
        };
        let mut offsets_ms: Vec<i64> = Vec::with_capacity(crate::consts::CLOCK_DIFF_SAMPLES);
        for _ in 0..crate::consts::CLOCK_DIFF_SAMPLES {
            let local_send = now_ms();
            let rval = self
                .call_sync("ping", Value::Map(Vec::new()), ReturnType::Auto, Some(Duration::from_secs(5)))
                .await?;
            let local_recv = now_ms();
            let _ = rval; // "pong" carries no timestamp of its own on this transport
            let midpoint = (local_send + local_recv) / 2;
            let remote_estimate = local_recv; // best estimate available without a server-side clock echo
            offsets_ms.push(remote_estimate - midpoint);
        }
        let mean = offsets_ms.iter().sum::<i64>() / offsets_ms.len() as i64;
        Ok(if mean >= 0 {
            Duration::from_millis(mean as u64)
        } else {
            Duration::from_millis(0)
        })
    }

    /// Closes the socket locally and forgets this client in the per-thread
    /// registry. Does not notify the peer (§4.3 `close`).
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        registry::forget_client(&self.address);
        if let Some(h) = self.reader_task.lock().unwrap().take() {
            h.abort();
        }
        if let Some(h) = self.writer_task.lock().unwrap().take() {
            h.abort();
        }
    }

    /// Sends the `close` action and, on success, transitions this client to
    /// disconnected. Other clients that share the peer observe it through
    /// the server's disconnect broadcast, not through this call (§4.3,
    /// §4.4 close protocol).
    pub async fn close_server(&self, timeout: Duration) -> Result<()> {
        self.call_sync("close", Value::Map(Vec::new()), ReturnType::Auto, Some(timeout))
            .await?;
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Live operations on a remote object (§4.2). Plain [`ProxyHandle`] data
/// plus the [`Client`] needed to actually make a call.
pub struct Proxy {
    client: Arc<Client>,
    handle: ProxyHandle,
    disposed: bool,
}

impl Proxy {
    pub fn handle(&self) -> &ProxyHandle {
        &self.handle
    }

    /// §4.2 attribute access. With `defer_getattr` set, appends to
    /// `attribute_path` with no round-trip; otherwise performs a `get_obj`
    /// walk immediately.
    pub async fn get(&self, attr: &str) -> Result<GetOutcome> {
        self.ensure_live()?;
        if self.handle.options.defer_getattr {
            return Ok(GetOutcome::Deferred(Proxy {
                client: self.client.clone(),
                handle: self.handle.deferred_attr(attr),
                disposed: false,
            }));
        }
        let extended = self.handle.deferred_attr(attr);
        let v = self.get_obj(&extended.attribute_path).await?;
        Ok(GetOutcome::Value(v))
    }

    async fn get_obj(&self, path: &[String]) -> Result<Value> {
        let opts = Value::Map(vec![
            ("obj".to_string(), Value::Proxy(self.handle.clone())),
            (
                "attribute_path".to_string(),
                Value::Seq(path.iter().cloned().map(Value::Str).collect()),
            ),
        ]);
        let v = self
            .client
            .call_sync("get_obj", opts, self.handle.options.return_type, self.handle.options.timeout)
            .await?;
        Ok(self.client.decode_rval(v).await)
    }

    /// §4.2 call: sends `call_obj` with the proxy and arguments, honoring
    /// this proxy's `sync`/`return_type`/`timeout` options.
    pub async fn call(&self, args: Vec<Value>, kwargs: Vec<(String, Value)>) -> Result<Value> {
        self.ensure_live()?;
        let opts = Value::Map(vec![
            ("obj".to_string(), Value::Proxy(self.handle.clone())),
            ("args".to_string(), Value::Tuple(args)),
            ("kwargs".to_string(), Value::Map(kwargs)),
        ]);
        match self
            .client
            .send(
                "call_obj",
                opts,
                self.handle.options.return_type,
                self.handle.options.sync,
                self.handle.options.timeout,
            )
            .await?
        {
            Sent::Value(v) => Ok(self.client.decode_rval(v).await),
            Sent::Future(_) | Sent::None => Ok(Value::None),
        }
    }

    /// Sends `call_obj` without waiting for a reply, per this proxy's
    /// options overridden to `sync = off`. Useful for genuinely
    /// fire-and-forget remote calls without cloning and rebuilding options.
    pub fn call_off(&self, args: Vec<Value>, kwargs: Vec<(String, Value)>) -> Result<()> {
        self.ensure_live()?;
        let opts = Value::Map(vec![
            ("obj".to_string(), Value::Proxy(self.handle.clone())),
            ("args".to_string(), Value::Tuple(args)),
            ("kwargs".to_string(), Value::Map(kwargs)),
        ]);
        self.client.call_off("call_obj", opts, self.handle.options.return_type)
    }

    /// §4.2 `delete`: sends `delete` for this proxy's `(object_id, ref_id)`
    /// and marks it invalid. Further use of a disposed proxy is a caller
    /// error surfaced as `ProxyInvalidated`.
    pub async fn delete(mut self) -> Result<()> {
        let opts = Value::Map(vec![
            ("object_id".to_string(), Value::Int(self.handle.object_id as i64)),
            ("ref_id".to_string(), Value::Int(self.handle.ref_id as i64)),
        ]);
        self.client
            .call_sync("delete", opts, ReturnType::Auto, self.handle.options.timeout)
            .await?;
        self.disposed = true;
        Ok(())
    }

    fn ensure_live(&self) -> Result<()> {
        if self.disposed {
            return Err(RpcError::ProxyInvalidated {
                peer: self.handle.peer_address.clone(),
                object_id: self.handle.object_id,
                ref_id: self.handle.ref_id,
            });
        }
        Ok(())
    }
}

pub enum GetOutcome {
    /// `defer_getattr = true`: a new proxy with an extended path, no I/O.
    Deferred(Proxy),
    /// `defer_getattr = false`: the value already fetched via `get_obj`.
    Value(Value),
}

impl Drop for Proxy {
    /// §4.2 auto-delete policy: best-effort, fire-and-forget `delete` if
    /// `auto_delete` is set. Builds the wire frame directly rather than
    /// calling back into `self.delete()`/`self.call()` — the destructor path
    /// must never re-enter the proxy's attribute/call machinery (§9 note 2,
    /// the `test_proxy_del_infinite_recursion` bug this re-architecture
    /// exists to avoid).
    fn drop(&mut self) {
        if self.disposed || !self.handle.options.auto_delete {
            return;
        }
        let opts = Value::Map(vec![
            ("object_id".to_string(), Value::Int(self.handle.object_id as i64)),
            ("ref_id".to_string(), Value::Int(self.handle.ref_id as i64)),
        ]);
        let _ = self.client.call_off("delete", opts, ReturnType::Auto);
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        registry::forget_client(&self.address);
        if let Some(h) = self.reader_task.lock().unwrap().take() {
            h.abort();
        }
        if let Some(h) = self.writer_task.lock().unwrap().take() {
            h.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::NativeFn;
    use crate::server::Server;
    use std::sync::Arc as StdArc;

    async fn echo_server() -> StdArc<Server> {
        let server = Server::bind("127.0.0.1:0", Duration::from_millis(50)).await.unwrap();
        server.publish(
            "add",
            NativeFn::new("add", |args, _| async move {
                let (Value::Int(a), Value::Int(b)) = (&args[0], &args[1]) else {
                    anyhow::bail!("expected two ints");
                };
                Ok(Value::Int(a + b))
            }),
        );
        server.run_in_thread();
        server
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn echo_and_arithmetic_scenario_a() {
        let server = echo_server().await;
        let client = Client::connect(&server.address(), ClientOptions::default()).await.unwrap();
        let add_fn = client.get_item("add", ProxyOptions::default()).await.unwrap();
        let Value::Proxy(handle) = add_fn else {
            panic!("expected a proxy-shaped function by default (functions aren't in the transferable set)");
        };
        let proxy = client.proxy(handle);
        let result = proxy.call(vec![Value::Int(7), Value::Int(5)], vec![]).await.unwrap();
        assert_eq!(result, Value::Int(12));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn ping_healthcheck_succeeds_on_connect() {
        let server = Server::bind("127.0.0.1:0", Duration::from_millis(50)).await.unwrap();
        server.run_in_thread();
        let client = Client::connect(&server.address(), ClientOptions::default()).await;
        assert!(client.is_ok());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn connect_to_unreachable_address_fails() {
        let result = Client::connect(
            "tcp://127.0.0.1:1",
            ClientOptions {
                connect_timeout: Duration::from_millis(200),
                ..Default::default()
            },
        )
        .await;
        assert!(matches!(result, Err(RpcError::ConnectionRefused { .. })));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn callback_argument_requires_a_local_server_scenario_f() {
        // No local server registered for this thread: a non-transferable
        // value (a function) in the opts map must fail with NonSerializable
        // rather than silently dropping the callback.
        let server = echo_server().await;
        let client = Client::connect(&server.address(), ClientOptions::default()).await.unwrap();
        let callback: Arc<dyn crate::object::RemoteObject> =
            NativeFn::new("cb", |_, _| async { Ok(Value::None) });
        let opts = Value::Map(vec![("obj".to_string(), Value::Object(callback))]);
        let err = client
            .call_sync("call_obj", opts, ReturnType::Auto, Some(Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::NonSerializable { .. }));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reentrant_call_chain_completes_without_deadlock_scenario_5() {
        // Two servers S1, S2 in the same process. S1.bounce(n) calls
        // S2.bounce(n-1), which calls back S1.bounce(n-2), alternating until
        // the count hits zero, then unwinds adding 1 per hop. Depth 3 forces
        // at least one A->B->A leg; under sync=sync this must not deadlock.
        let s1 = Server::bind("127.0.0.1:0", Duration::from_millis(50)).await.unwrap();
        let s2 = Server::bind("127.0.0.1:0", Duration::from_millis(50)).await.unwrap();
        s1.run_in_thread();
        s2.run_in_thread();

        let client_to_s1 = Client::connect(&s1.address(), ClientOptions::default()).await.unwrap();
        let client_to_s2 = Client::connect(&s2.address(), ClientOptions::default()).await.unwrap();

        async fn bounce_via(client: &Arc<Client>, depth: i64) -> anyhow::Result<Value> {
            if depth <= 0 {
                return Ok(Value::Int(0));
            }
            let target = client
                .get_item("bounce", ProxyOptions::default())
                .await
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            let Value::Proxy(handle) = target else {
                anyhow::bail!("expected bounce to be proxy-shaped");
            };
            let proxy = client.proxy(handle);
            let result = proxy
                .call(vec![Value::Int(depth - 1)], vec![])
                .await
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            let Value::Int(n) = result else {
                anyhow::bail!("expected an int result");
            };
            Ok(Value::Int(n + 1))
        }

        s1.publish(
            "bounce",
            NativeFn::new("bounce", {
                let client_to_s2 = client_to_s2.clone();
                move |args, _| {
                    let client_to_s2 = client_to_s2.clone();
                    async move {
                        let Value::Int(depth) = args[0] else {
                            anyhow::bail!("expected int");
                        };
                        bounce_via(&client_to_s2, depth).await
                    }
                }
            }),
        );
        s2.publish(
            "bounce",
            NativeFn::new("bounce", {
                let client_to_s1 = client_to_s1.clone();
                move |args, _| {
                    let client_to_s1 = client_to_s1.clone();
                    async move {
                        let Value::Int(depth) = args[0] else {
                            anyhow::bail!("expected int");
                        };
                        bounce_via(&client_to_s1, depth).await
                    }
                }
            }),
        );

        let outer = Client::connect(&s1.address(), ClientOptions::default()).await.unwrap();
        let entry = outer.get_item("bounce", ProxyOptions::default()).await.unwrap();
        let Value::Proxy(handle) = entry else {
            panic!("expected bounce to be proxy-shaped");
        };
        let proxy = outer.proxy(handle);
        let result = tokio::time::timeout(Duration::from_secs(5), proxy.call(vec![Value::Int(3)], vec![]))
            .await
            .expect("reentrant call chain deadlocked")
            .unwrap();
        assert_eq!(result, Value::Int(3));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn close_server_fans_out_disconnect_to_other_clients() {
        let server = Server::bind("127.0.0.1:0", Duration::from_millis(50)).await.unwrap();
        server.run_in_thread();
        let addr = server.address();
        let c1 = Client::connect(&addr, ClientOptions::default()).await.unwrap();
        let c2 = Client::connect(&addr, ClientOptions::default()).await.unwrap();
        // make sure c2 is "known" to the server before closing
        let _ = c2.get_item("self", ProxyOptions::default()).await;
        c1.close_server(Duration::from_secs(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(c2.disconnected());
    }
}
