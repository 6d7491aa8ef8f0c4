//! C4 + C7: the RPC server. Owns a listening endpoint, a namespace, a proxy
//! reference table, and dispatches actions to local objects (§4.4).

mod reftable;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use tokio::io::BufReader;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::{Duration, interval};

use crate::consts::SELF_KEY;
use crate::error::RpcError;
use crate::log::{debug, error, info, warn};
use crate::object::{NativeValue, RemoteObject};
use crate::proxy::{ProxyHandle, ReturnType};
use crate::registry;
use crate::serializer::{self, SerializerTag};
use crate::trigger::Trigger;
use crate::value::Value;
use crate::wire::{self, RequestFrame, ResponseFrame};

use reftable::RefTable;

struct KnownClient {
    tag: SerializerTag,
    writer: Arc<AsyncMutex<OwnedWriteHalf>>,
}

/// A request that was read off a connection but whose dispatch is deferred
/// to whichever thread drains [`MainThreadHandle`] (§4.4 "main-thread
/// dispatch mode" / §5 "the poller thread ... owns the raw socket and
/// forwards data via a bounded in-process queue").
struct PendingDispatch {
    frame: RequestFrame,
    writer: Arc<AsyncMutex<OwnedWriteHalf>>,
}

/// Where a connection task hands a decoded request off for dispatch.
enum DispatchSink {
    /// The default: dispatch inline on whatever task read the frame (§4.4
    /// `run_forever`/`run_in_thread`/`run_lazy`).
    Inline,
    /// §4.4 main-thread dispatch: the accept/read side only forwards frames;
    /// [`MainThreadHandle::tick`] on the designated thread does the actual
    /// dispatch and reply.
    Queued(mpsc::Sender<PendingDispatch>),
}

pub struct Server {
    address: RwLock<String>,
    namespace: RwLock<HashMap<String, Arc<dyn RemoteObject>>>,
    ref_table: std::sync::Mutex<RefTable>,
    known_clients: std::sync::Mutex<HashMap<SocketAddr, KnownClient>>,
    closed: AtomicBool,
    stop: Trigger,
    close_grace: Duration,
    listener: AsyncMutex<Option<TcpListener>>,
    dispatch_sink: RwLock<DispatchSink>,
}

impl Server {
    /// Binds a listener at `requested_addr` (a `host:port` pair; port `0`
    /// requests an ephemeral port) and returns a server that has not yet
    /// started dispatching — call [`Server::run_forever`],
    /// [`Server::run_in_thread`], or [`Server::run_lazy`].
    pub async fn bind(requested_addr: &str, close_grace: Duration) -> anyhow::Result<Arc<Self>> {
        let listener = TcpListener::bind(requested_addr).await?;
        let bound = listener.local_addr()?;
        let address = format!("tcp://{bound}");
        let server = Arc::new(Self {
            address: RwLock::new(address.clone()),
            namespace: RwLock::new(HashMap::new()),
            ref_table: std::sync::Mutex::new(RefTable::new()),
            known_clients: std::sync::Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            stop: Trigger::new(),
            close_grace,
            listener: AsyncMutex::new(Some(listener)),
            dispatch_sink: RwLock::new(DispatchSink::Inline),
        });
        server.publish_self();
        info!(address = %address, "server bound");
        Ok(server)
    }

    /// Like [`Server::bind`], but also registers `inproc_name` as a
    /// process-wide alias resolving to the bound `tcp://host:port` (§6:
    /// `inproc://name` is accepted and parsed but resolves onto loopback —
    /// this crate has no need of a separate zero-copy transport, so the
    /// alias just points `Client::connect("inproc://name", ..)` at the real
    /// socket).
    pub async fn bind_named(
        requested_addr: &str,
        close_grace: Duration,
        inproc_name: &str,
    ) -> anyhow::Result<Arc<Self>> {
        let server = Self::bind(requested_addr, close_grace).await?;
        registry::register_inproc_alias(inproc_name, &server.address());
        Ok(server)
    }

    fn publish_self(self: &Arc<Self>) {
        struct SelfHandle(std::sync::Weak<Server>);
        #[async_trait::async_trait]
        impl RemoteObject for SelfHandle {
            fn type_name(&self) -> String {
                "Server".to_string()
            }
            async fn get_item(&self, key: &Value) -> anyhow::Result<Value> {
                let Value::Str(name) = key else {
                    anyhow::bail!("namespace keys are strings");
                };
                let server = self.0.upgrade().ok_or_else(|| anyhow::anyhow!("server gone"))?;
                server.get_item(name)
            }
            async fn set_item(&self, key: &Value, value: Value) -> anyhow::Result<()> {
                let Value::Str(name) = key else {
                    anyhow::bail!("namespace keys are strings");
                };
                let server = self.0.upgrade().ok_or_else(|| anyhow::anyhow!("server gone"))?;
                server.set_item(name, value)
            }
        }
        let handle: Arc<dyn RemoteObject> = Arc::new(SelfHandle(Arc::downgrade(self)));
        self.namespace.write().unwrap().insert(SELF_KEY.to_string(), handle);
    }

    pub fn address(&self) -> String {
        self.address.read().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn publish(&self, key: impl Into<String>, obj: Arc<dyn RemoteObject>) {
        self.namespace.write().unwrap().insert(key.into(), obj);
    }

    pub fn publish_value(&self, key: impl Into<String>, value: Value) {
        self.publish(key, Arc::new(NativeValue(value)));
    }

    fn get_item(&self, name: &str) -> anyhow::Result<Value> {
        let obj = self
            .namespace
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no such name {name:?} in namespace"))?;
        Ok(Value::Object(obj))
    }

    fn set_item(&self, name: &str, value: Value) -> anyhow::Result<()> {
        let obj = serializer::as_remote_object(value);
        self.namespace.write().unwrap().insert(name.to_string(), obj);
        Ok(())
    }

    /// Registers `obj` (or reuses its existing object_id if this exact
    /// referent was already proxied) and returns a fresh handle bound to
    /// this server's address (§4.4 "Proxy issuance").
    pub fn get_proxy(&self, obj: Arc<dyn RemoteObject>) -> ProxyHandle {
        let type_string = obj.type_name();
        let mut table = self.ref_table.lock().unwrap();
        let (object_id, ref_id) = table.issue(obj);
        ProxyHandle::new(self.address(), object_id, ref_id, type_string)
    }

    /// Looks up `object_id` in the reference table and, if `path` is empty,
    /// returns a handle to the referent itself; otherwise walks the
    /// attribute path on it. Used by [`crate::serializer::decode_with_context`]
    /// to unwrap proxies that have arrived back home.
    pub async fn resolve_proxy(&self, object_id: u64, path: &[String]) -> anyhow::Result<Value> {
        let referent = {
            let table = self.ref_table.lock().unwrap();
            table.get(object_id)
        };
        let referent = referent.ok_or_else(|| anyhow::anyhow!("object_id {object_id} is unknown (deleted?)"))?;
        if path.is_empty() {
            Ok(Value::Object(referent))
        } else {
            referent.get_attr(path).await
        }
    }

    pub fn delete_ref(&self, object_id: u64, ref_id: u64) {
        let mut table = self.ref_table.lock().unwrap();
        table.release(object_id, ref_id);
    }

    /// Applies the return-type policy (§4.4) to a dispatch result.
    pub fn shape_return(&self, value: Value, return_type: ReturnType) -> Value {
        let force_proxy = return_type == ReturnType::Proxy;
        let needs_proxy = force_proxy || matches!(value, Value::Object(_));
        if needs_proxy {
            let obj = serializer::as_remote_object(value);
            Value::Proxy(self.get_proxy(obj))
        } else {
            value
        }
    }

    fn opt_str(opts: &Value, key: &str) -> Option<String> {
        let Value::Map(entries) = opts else { return None };
        entries.iter().find(|(k, _)| k == key).and_then(|(_, v)| match v {
            Value::Str(s) => Some(s.clone()),
            _ => None,
        })
    }

    fn opt_value(opts: &Value, key: &str) -> Option<Value> {
        let Value::Map(entries) = opts else { return None };
        entries.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone())
    }

    fn opt_u64(opts: &Value, key: &str) -> Option<u64> {
        match Self::opt_value(opts, key) {
            Some(Value::Int(i)) => Some(i as u64),
            _ => None,
        }
    }

    /// Expects `opts`'s `"obj"` field to already have passed through
    /// [`serializer::resolve_value`] (done once, up front, in
    /// [`Server::process_action`]) so any proxy addressed back to this
    /// server has already been unwrapped into a [`Value::Object`]. A proxy
    /// that survives resolution belongs to a different server and cannot be
    /// dispatched against here.
    fn unwrap_obj(self: &Arc<Self>, opts: &Value) -> Result<Arc<dyn RemoteObject>, RpcError> {
        match Self::opt_value(opts, "obj") {
            Some(Value::Object(o)) => Ok(o),
            _ => Err(RpcError::BadOptions {
                action: "call_obj/get_obj".to_string(),
                option: "obj".to_string(),
            }),
        }
    }

    /// Dispatches one decoded request frame and produces the response to
    /// send back (§4.4's action table).
    pub async fn dispatch(self: &Arc<Self>, frame: RequestFrame) -> ResponseFrame {
        if frame.req_id < 0 {
            // fire-and-forget: dispatch but never reply; errors go to the log.
            let this = self.clone();
            tokio::spawn(async move {
                if let Err(e) = this.process_action(&frame).await {
                    error!(action = %frame.action, "unhandled error in fire-and-forget dispatch: {e:?}");
                }
            });
            return ResponseFrame::Return {
                req_id: frame.req_id,
                rval: Value::None,
                error: None,
            };
        }
        match self.process_action(&frame).await {
            Ok(rval) => ResponseFrame::Return {
                req_id: frame.req_id,
                rval: self.shape_return(rval, frame.return_type),
                error: None,
            },
            Err(e) => {
                let (type_name, traceback) = RpcError::to_wire_error(&e);
                ResponseFrame::Return {
                    req_id: frame.req_id,
                    rval: Value::None,
                    error: Some((type_name, traceback)),
                }
            }
        }
    }

    async fn process_action(self: &Arc<Self>, frame: &RequestFrame) -> anyhow::Result<Value> {
        // Resolve proxy-unwrap-locality (§4.1) once over the whole opts
        // tree, not just the "obj" field: a proxy nested anywhere in args or
        // kwargs that happens to point back at this server should come back
        // as the live local referent, same as "obj" does.
        let opts = serializer::resolve_value(frame.opts.clone(), Some(self))
            .await
            .unwrap_or_else(|_| frame.opts.clone());
        match frame.action.as_str() {
            "ping" => Ok(Value::Str("pong".to_string())),
            "call_obj" => {
                let obj = self.unwrap_obj(&opts)?;
                let args = match Self::opt_value(&opts, "args") {
                    Some(Value::Seq(items)) | Some(Value::Tuple(items)) => items,
                    _ => Vec::new(),
                };
                let kwargs = match Self::opt_value(&opts, "kwargs") {
                    Some(Value::Map(entries)) => entries,
                    _ => Vec::new(),
                };
                obj.call(args, kwargs).await
            }
            "get_obj" => {
                let obj = self.unwrap_obj(&opts)?;
                let path = match Self::opt_value(&opts, "attribute_path") {
                    Some(Value::Seq(items)) => items
                        .into_iter()
                        .filter_map(|v| match v {
                            Value::Str(s) => Some(s),
                            _ => None,
                        })
                        .collect::<Vec<_>>(),
                    _ => Vec::new(),
                };
                match obj.get_attr(&path).await {
                    Ok(v) => Ok(v),
                    Err(_) if path.is_empty() => Ok(Value::Object(obj)),
                    Err(e) => Err(e),
                }
            }
            "get_item" => {
                let name = Self::opt_str(&opts, "name").ok_or_else(|| RpcError::BadOptions {
                    action: "get_item".to_string(),
                    option: "name".to_string(),
                })?;
                self.get_item(&name)
            }
            "set_item" => {
                let name = Self::opt_str(&opts, "name").ok_or_else(|| RpcError::BadOptions {
                    action: "set_item".to_string(),
                    option: "name".to_string(),
                })?;
                let value = Self::opt_value(&opts, "value").unwrap_or(Value::None);
                self.set_item(&name, value)?;
                Ok(Value::None)
            }
            "delete" => {
                let object_id = Self::opt_u64(&opts, "object_id").ok_or_else(|| RpcError::BadOptions {
                    action: "delete".to_string(),
                    option: "object_id".to_string(),
                })?;
                let ref_id = Self::opt_u64(&opts, "ref_id").ok_or_else(|| RpcError::BadOptions {
                    action: "delete".to_string(),
                    option: "ref_id".to_string(),
                })?;
                self.delete_ref(object_id, ref_id);
                Ok(Value::None)
            }
            "import" => {
                let name = Self::opt_str(&opts, "name").ok_or_else(|| RpcError::BadOptions {
                    action: "import".to_string(),
                    option: "name".to_string(),
                })?;
                let fromlist = match Self::opt_value(&opts, "fromlist") {
                    Some(Value::Seq(items)) => Some(
                        items
                            .into_iter()
                            .filter_map(|v| match v {
                                Value::Str(s) => Some(s),
                                _ => None,
                            })
                            .collect::<Vec<_>>(),
                    ),
                    _ => None,
                };
                let module = self.get_item(&name)?;
                let Value::Object(module) = module else {
                    return Ok(module);
                };
                match fromlist {
                    None => Ok(Value::Object(module)),
                    Some(names) => {
                        let mut entries = Vec::with_capacity(names.len());
                        for member in names {
                            let v = module.get_attr(&[member.clone()]).await?;
                            entries.push((member, v));
                        }
                        Ok(Value::Map(entries))
                    }
                }
            }
            "close" => {
                self.initiate_close().await;
                Ok(Value::Bool(true))
            }
            other => Err(RpcError::BadAction {
                action: other.to_string(),
            }
            .into()),
        }
    }

    /// §4.4 close protocol: reject further dispatch immediately (`closed`
    /// flips synchronously, before any awaiting), broadcast disconnect to
    /// every other known client, then give those disconnect frames — and the
    /// caller's own `true` reply, still in flight back through its
    /// connection's writer — a grace period to actually leave the socket
    /// before the accept loop and per-connection tasks are told to stop.
    pub async fn initiate_close(self: &Arc<Self>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return; // already closing; idempotent
        }
        let clients: Vec<KnownClient> = {
            let mut map = self.known_clients.lock().unwrap();
            map.drain().map(|(_, v)| v).collect()
        };
        for client in clients {
            let mut w = client.writer.lock().await;
            if let Err(e) = wire::write_response(&mut *w, client.tag, &ResponseFrame::Disconnect).await {
                warn!("failed to send disconnect to a known client: {e:?}");
            }
        }
        let stop = self.stop.clone();
        let grace = self.close_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            stop.trigger();
        });
    }

    /// Runs the accept loop on the current task until the server is closed.
    /// This is the shared body behind `run_forever`/`run_in_thread`.
    async fn accept_loop(self: Arc<Self>) {
        let listener = self.listener.lock().await.take();
        let Some(listener) = listener else {
            warn!("server accept loop started twice; ignoring");
            return;
        };
        loop {
            tokio::select! {
                _ = self.stop.wait_async() => {
                    info!("server stopping accept loop");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((socket, peer)) => {
                            let this = self.clone();
                            tokio::spawn(async move {
                                this.handle_connection(socket, peer).await;
                            });
                        }
                        Err(e) => warn!("accept failed: {e:?}"),
                    }
                }
            }
        }
    }

    async fn handle_connection(self: Arc<Self>, socket: TcpStream, peer: SocketAddr) {
        let _span = tracing::info_span!("server_connection", %peer).entered();
        let (read_half, write_half) = socket.into_split();
        let mut reader = BufReader::new(read_half);
        let writer = Arc::new(AsyncMutex::new(write_half));
        debug!("connection accepted");
        loop {
            let frame = tokio::select! {
                _ = self.stop.wait_async() => break,
                frame = wire::read_request(&mut reader) => frame,
            };
            let frame = match frame {
                Ok(f) => f,
                Err(_) => break, // peer disconnected or framing error
            };
            self.known_clients.lock().unwrap().entry(peer).or_insert_with(|| KnownClient {
                tag: frame.serializer_tag,
                writer: writer.clone(),
            });
            if self.is_closed() {
                let mut w = writer.lock().await;
                let _ = wire::write_response(&mut *w, frame.serializer_tag, &ResponseFrame::Disconnect).await;
                break;
            }
            let queued_to = match &*self.dispatch_sink.read().unwrap() {
                DispatchSink::Inline => None,
                DispatchSink::Queued(tx) => Some(tx.clone()),
            };
            if let Some(tx) = queued_to {
                // Forward and keep reading; ordering into the queue is FIFO
                // per connection even if the main thread dispatches slower
                // than frames arrive (§5).
                if tx
                    .send(PendingDispatch {
                        frame,
                        writer: writer.clone(),
                    })
                    .await
                    .is_err()
                {
                    warn!("main-thread dispatch queue is gone; dropping connection {peer}");
                    break;
                }
                continue;
            }
            let tag = frame.serializer_tag;
            let response = self.clone().dispatch(frame).await;
            if response.is_fire_and_forget_ack() {
                continue;
            }
            let mut w = writer.lock().await;
            if let Err(e) = wire::write_response(&mut *w, tag, &response).await {
                warn!("failed writing response to {peer}: {e:?}");
                break;
            }
        }
        self.known_clients.lock().unwrap().remove(&peer);
        debug!("connection closed");
    }

    /// Starts the accept loop as a background task and registers this
    /// server for the calling thread. Returns once dispatch is running.
    pub fn run_in_thread(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move { this.accept_loop().await })
    }

    /// Blocks the calling task running the accept loop until the server is
    /// closed. Used by a process whose main task has nothing else to do.
    pub async fn run_forever(self: &Arc<Self>) {
        self.accept_loop().await;
    }

    /// Registers this server as "the server for this thread" (enabling
    /// proxy-or-fail / unwrap-locality decisions for [`crate::client::Client`]
    /// calls made from this same OS thread) but does not eagerly spend a
    /// thread on dispatch itself: the accept loop still runs as a (cheap)
    /// async task, since unlike the source's dedicated OS thread, a tokio
    /// task costs nothing while idle. The registration is only visible to
    /// code that keeps running on the thread that called this — see
    /// [`crate::registry`]'s module docs for why that matters on a
    /// multi-threaded runtime.
    pub fn run_lazy(self: &Arc<Self>) -> anyhow::Result<JoinHandle<()>> {
        registry::register_server(self.clone())?;
        Ok(self.run_in_thread())
    }

    /// Starts the accept loop in "queued" mode (§4.4 main-thread dispatch):
    /// connection tasks read and forward frames but never dispatch them
    /// directly. Returns a [`MainThreadHandle`] the designated thread (e.g. a
    /// GUI event loop) drives by calling [`MainThreadHandle::tick`] or
    /// [`MainThreadHandle::drain_ready`] — typically from within that
    /// thread's own idle/tick callback, fulfilling the contract that remote
    /// objects pinned to a specific thread are only ever touched from it
    /// (the GUI event-loop integration itself is out of scope here; this
    /// just satisfies the queue side of the contract).
    pub fn run_main_thread_dispatch(self: &Arc<Self>, queue_size: usize) -> MainThreadHandle {
        let (tx, rx) = mpsc::channel(queue_size);
        *self.dispatch_sink.write().unwrap() = DispatchSink::Queued(tx);
        self.run_in_thread();
        MainThreadHandle {
            server: self.clone(),
            rx: AsyncMutex::new(rx),
        }
    }

    /// Dispatches one previously-queued request and writes its reply, used
    /// by [`MainThreadHandle::tick`].
    async fn dispatch_and_reply(self: &Arc<Self>, pending: PendingDispatch) {
        let tag = pending.frame.serializer_tag;
        let response = self.clone().dispatch(pending.frame).await;
        if response.is_fire_and_forget_ack() {
            return;
        }
        let mut w = pending.writer.lock().await;
        if let Err(e) = wire::write_response(&mut *w, tag, &response).await {
            warn!("failed writing queued response: {e:?}");
        }
    }

    pub fn stop_handle(&self) -> Trigger {
        self.stop.clone()
    }

    /// Registers a recurring local callback, invoked through the same
    /// dispatch path as a remote `call_obj` (§10.5 "start_timer").
    pub fn start_timer<F, Fut>(self: &Arc<Self>, period: Duration, callback: F) -> JoinHandle<()>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let stop = self.stop.clone();
        tokio::spawn(async move {
            let mut tick = interval(period);
            loop {
                tokio::select! {
                    _ = stop.wait_async() => break,
                    _ = tick.tick() => {
                        if let Err(e) = callback().await {
                            error!("timer callback failed: {e:?}");
                        }
                    }
                }
            }
        })
    }
}

impl ResponseFrame {
    fn is_fire_and_forget_ack(&self) -> bool {
        matches!(self, ResponseFrame::Return { req_id, .. } if *req_id < 0)
    }
}

/// The designated-thread side of §4.4's main-thread dispatch mode, returned
/// by [`Server::run_main_thread_dispatch`]. The owning thread calls
/// [`MainThreadHandle::tick`] (blocking) or [`MainThreadHandle::drain_ready`]
/// (non-blocking) from whatever idle point its own event loop offers.
pub struct MainThreadHandle {
    server: Arc<Server>,
    rx: AsyncMutex<mpsc::Receiver<PendingDispatch>>,
}

impl MainThreadHandle {
    /// Waits for and dispatches exactly one queued request. Returns `false`
    /// once the server's accept loop has stopped and no more requests will
    /// ever arrive.
    pub async fn tick(&self) -> bool {
        let next = self.rx.lock().await.recv().await;
        match next {
            Some(pending) => {
                self.server.dispatch_and_reply(pending).await;
                true
            }
            None => false,
        }
    }

    /// Dispatches every request already queued without waiting for more.
    /// Returns how many were processed — the shape an external event loop's
    /// "drain pending work" tick wants (§4.6 "External-loop tick").
    pub async fn drain_ready(&self) -> usize {
        let mut rx = self.rx.lock().await;
        let mut count = 0;
        while let Ok(pending) = rx.try_recv() {
            self.server.dispatch_and_reply(pending).await;
            count += 1;
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::NativeFn;

    async fn test_server() -> Arc<Server> {
        Server::bind("127.0.0.1:0", Duration::from_millis(50)).await.unwrap()
    }

    #[tokio::test]
    async fn publishes_self_under_reserved_key() {
        let server = test_server().await;
        assert!(server.namespace.read().unwrap().contains_key(SELF_KEY));
    }

    #[tokio::test]
    async fn get_proxy_reuses_object_id_for_same_referent() {
        let server = test_server().await;
        let obj: Arc<dyn RemoteObject> = NativeFn::new("noop", |_, _| async { Ok(Value::None) });
        let p1 = server.get_proxy(obj.clone());
        let p2 = server.get_proxy(obj.clone());
        assert_eq!(p1.object_id, p2.object_id);
        assert_ne!(p1.ref_id, p2.ref_id);
    }

    #[tokio::test]
    async fn delete_all_refs_frees_the_entry_and_next_issuance_gets_new_id() {
        let server = test_server().await;
        let obj: Arc<dyn RemoteObject> = NativeFn::new("noop", |_, _| async { Ok(Value::None) });
        let p1 = server.get_proxy(obj.clone());
        let p2 = server.get_proxy(obj.clone());
        server.delete_ref(p1.object_id, p1.ref_id);
        server.delete_ref(p2.object_id, p2.ref_id);
        let p3 = server.get_proxy(obj.clone());
        assert_ne!(p3.object_id, p1.object_id);
    }

    #[tokio::test]
    async fn call_obj_dispatch_invokes_published_function() {
        let server = test_server().await;
        server.publish(
            "add",
            NativeFn::new("add", |args, _| async move {
                let (Value::Int(a), Value::Int(b)) = (&args[0], &args[1]) else {
                    anyhow::bail!("expected two ints");
                };
                Ok(Value::Int(a + b))
            }),
        );
        let obj = server.get_item("add").unwrap();
        let Value::Object(add_fn) = obj else { panic!("expected object") };
        let result = add_fn.call(vec![Value::Int(7), Value::Int(5)], vec![]).await.unwrap();
        assert_eq!(result, Value::Int(12));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn main_thread_dispatch_mode_serves_calls_only_via_tick() {
        use crate::client::{Client, ClientOptions};
        use crate::proxy::ProxyOptions;

        let server = test_server().await;
        server.publish(
            "add",
            NativeFn::new("add", |args, _| async move {
                let (Value::Int(a), Value::Int(b)) = (&args[0], &args[1]) else {
                    anyhow::bail!("expected two ints");
                };
                Ok(Value::Int(a + b))
            }),
        );
        let handle = std::sync::Arc::new(server.run_main_thread_dispatch(8));
        // Stands in for "the designated thread's idle loop": keeps draining
        // the queue concurrently with every request the test below makes, so
        // no request can be answered except through `tick`.
        let ticker = {
            let handle = handle.clone();
            tokio::spawn(async move { while handle.tick().await {} })
        };

        let addr = server.address();
        let client = Client::connect(&addr, ClientOptions::default()).await.unwrap();
        let add_fn = client.get_item("add", ProxyOptions::default()).await.unwrap();
        let Value::Proxy(proxy_handle) = add_fn else {
            panic!("expected a proxy-shaped function");
        };
        let proxy = client.proxy(proxy_handle);
        let result = proxy.call(vec![Value::Int(2), Value::Int(3)], vec![]).await.unwrap();
        assert_eq!(result, Value::Int(5));

        // The dispatch queue's sender lives in `server.dispatch_sink` for the
        // server's whole lifetime, so `tick` never sees the channel close on
        // its own; abort the stand-in "main thread" loop instead of waiting
        // for it to exit.
        ticker.abort();
    }
}
