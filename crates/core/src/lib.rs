//! Cross-process object-proxy RPC runtime.
//!
//! A symmetric client/server library: code in one process invokes methods,
//! reads/writes attributes, imports published namespaces, and transfers
//! values against objects that live in a peer process over TCP, as if those
//! objects were local. Every process that links this crate can act as both
//! client and server, and a call chain that loops back through the same
//! process (A calls B, B calls back into A) completes without deadlock as
//! long as the looping side has registered a server for its thread (see
//! [`registry`]) — tokio schedules that thread's server-dispatch task
//! concurrently with the call awaiting its reply, no separate policy hook
//! needed.
//!
//! Module map, roughly leaves-first:
//! - [`value`] — the transferable value vocabulary.
//! - [`serializer`] — concrete wire formats (`msgpack`, `json`) plus
//!   context-aware proxy resolution.
//! - [`wire`] — request/response frame encoding over a duplex byte stream.
//! - [`proxy`] — the client-side [`proxy::ProxyHandle`] as plain data.
//! - [`object`] — the [`object::RemoteObject`] trait a published value
//!   implements to accept remote operations.
//! - [`server`] — the RPC server: namespace, reference table, dispatch.
//! - [`client`] — the RPC client: connection, pending futures, [`client::Proxy`].
//! - [`registry`] — process-wide "current server for this thread" and
//!   per-thread client registries.
//! - [`spawn`] — parent-side process spawner / bootstrap rendezvous.
//! - [`config`], [`error`], [`log`] — ambient configuration, error taxonomy,
//!   and logging setup.

pub mod client;
pub mod config;
pub mod consts;
pub mod error;
pub mod log;
pub mod object;
pub mod proxy;
pub mod registry;
pub mod serializer;
pub mod server;
pub mod spawn;
pub mod trigger;
pub mod value;
pub mod wire;

pub use client::{Client, ClientOptions, Proxy, RpcFuture};
pub use error::{Result, RpcError};
pub use object::{NativeFn, NativeValue, RemoteObject};
pub use proxy::{ProxyHandle, ProxyOptions, ReturnType, SyncMode};
pub use server::{MainThreadHandle, Server};
pub use value::Value;
