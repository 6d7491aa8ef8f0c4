//! Process-wide registries (§3, §5): "current server for this thread", and
//! the `(thread, peer_address) -> Client` map.
//!
//! Both follow the same shape: a thread-local slot for fast reads from the
//! owning thread, backed by a mutex-guarded global map keyed by thread id so
//! the uniqueness invariant ("at most one server per thread", "no duplicate
//! client for this (thread, address)") can be enforced and inspected from
//! any thread.
//!
//! This keys on `std::thread::current().id()`, a real OS thread, not a tokio
//! task: a request dispatched through [`crate::server::Server::process_action`]
//! never reads this registry (it threads the owning `Arc<Server>` through
//! explicitly), so inbound reentrancy works regardless of which worker
//! thread the server's connection tasks land on. What does depend on this
//! registry is a [`Client`] call made from a task that was registered via
//! [`crate::server::Server::run_lazy`] and expects `current_server()` to see
//! that registration later — e.g. to proxy-or-fail a callback argument, or
//! to unwrap a returned proxy addressed back to itself. On tokio's default
//! multi-threaded runtime a task can resume on a different worker thread
//! after an `.await`, so that later call is only guaranteed to observe the
//! registration if it runs on the same thread that called `run_lazy` without
//! crossing a `tokio::spawn` boundary in between (a `current_thread` runtime,
//! or a `LocalSet` + `spawn_local`, pins it for you).

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::ThreadId;

use crate::client::Client;
use crate::server::Server;

thread_local! {
    static CURRENT_SERVER: RefCell<Option<Arc<Server>>> = const { RefCell::new(None) };
}

fn global_servers() -> &'static Mutex<HashMap<ThreadId, Arc<Server>>> {
    static MAP: OnceLock<Mutex<HashMap<ThreadId, Arc<Server>>>> = OnceLock::new();
    MAP.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Registers `server` as the server for the calling thread. Fails if this
/// thread already has one registered (uniqueness invariant, §5).
pub fn register_server(server: Arc<Server>) -> anyhow::Result<()> {
    let tid = std::thread::current().id();
    let mut map = global_servers().lock().unwrap();
    if map.contains_key(&tid) {
        anyhow::bail!("this thread already has a registered server");
    }
    map.insert(tid, server.clone());
    CURRENT_SERVER.with(|slot| *slot.borrow_mut() = Some(server));
    Ok(())
}

pub fn unregister_server() {
    let tid = std::thread::current().id();
    global_servers().lock().unwrap().remove(&tid);
    CURRENT_SERVER.with(|slot| *slot.borrow_mut() = None);
}

/// The server registered for the calling thread, if any.
pub fn current_server() -> Option<Arc<Server>> {
    CURRENT_SERVER.with(|slot| slot.borrow().clone())
}

fn global_clients() -> &'static Mutex<HashMap<(ThreadId, String), Arc<Client>>> {
    static MAP: OnceLock<Mutex<HashMap<(ThreadId, String), Arc<Client>>>> = OnceLock::new();
    MAP.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Returns the existing client for (this thread, `address`), if any.
pub fn lookup_client(address: &str) -> Option<Arc<Client>> {
    let tid = std::thread::current().id();
    global_clients()
        .lock()
        .unwrap()
        .get(&(tid, address.to_string()))
        .cloned()
}

/// Registers `client` for (this thread, `address`). Fails if an entry
/// already exists — callers create clients through
/// [`crate::client::Client::get_or_connect`], which checks first.
pub fn register_client(address: &str, client: Arc<Client>) -> anyhow::Result<()> {
    let tid = std::thread::current().id();
    let mut map = global_clients().lock().unwrap();
    let key = (tid, address.to_string());
    if map.contains_key(&key) {
        anyhow::bail!("a client for {address} already exists on this thread");
    }
    map.insert(key, client);
    Ok(())
}

pub fn forget_client(address: &str) {
    let tid = std::thread::current().id();
    global_clients().lock().unwrap().remove(&(tid, address.to_string()));
}

fn global_inproc_aliases() -> &'static Mutex<HashMap<String, String>> {
    static MAP: OnceLock<Mutex<HashMap<String, String>>> = OnceLock::new();
    MAP.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Registers `name` as an alias for `resolved_addr` (§6 "`inproc://name` ...
/// resolve[s] onto loopback"). A server bound with
/// [`crate::server::Server::bind_named`] calls this so a later
/// `Client::connect("inproc://name", ...)` in the same process finds the
/// real `tcp://host:port` to dial.
pub fn register_inproc_alias(name: &str, resolved_addr: &str) {
    global_inproc_aliases()
        .lock()
        .unwrap()
        .insert(name.to_string(), resolved_addr.to_string());
}

pub fn resolve_inproc_alias(name: &str) -> Option<String> {
    global_inproc_aliases().lock().unwrap().get(name).cloned()
}

pub fn forget_inproc_alias(name: &str) {
    global_inproc_aliases().lock().unwrap().remove(name);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_server_registered_by_default() {
        assert!(current_server().is_none());
    }
}
