//! The trait a server-published value implements to accept remote
//! operations, and helpers for wiring plain functions up to it.
//!
//! Python's source dispatches via `getattr`/`setattr`/`__call__` reflection;
//! Rust has no runtime reflection over arbitrary types, so an object that
//! wants to be called, indexed, or have attributes walked remotely
//! implements these methods explicitly (§9, re-architecture note 1). Default
//! bodies report "not supported" so a value only needs to implement the
//! operations it actually exposes.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;

use crate::value::Value;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[async_trait]
pub trait RemoteObject: Send + Sync {
    /// Advisory type tag captured into a [`crate::proxy::ProxyHandle`] at
    /// issuance time.
    fn type_name(&self) -> String;

    async fn call(&self, _args: Vec<Value>, _kwargs: Vec<(String, Value)>) -> anyhow::Result<Value> {
        anyhow::bail!("{} is not callable", self.type_name())
    }

    /// Walks `path` (possibly empty, meaning "the object itself") and
    /// returns the resulting value.
    async fn get_attr(&self, path: &[String]) -> anyhow::Result<Value> {
        if path.is_empty() {
            anyhow::bail!("{} cannot be read by value directly", self.type_name())
        }
        anyhow::bail!("{} has no attribute {:?}", self.type_name(), path)
    }

    async fn get_item(&self, _key: &Value) -> anyhow::Result<Value> {
        anyhow::bail!("{} does not support indexing", self.type_name())
    }

    async fn set_item(&self, _key: &Value, _value: Value) -> anyhow::Result<()> {
        anyhow::bail!("{} does not support item assignment", self.type_name())
    }
}

/// Adapts a boxed async closure into a [`RemoteObject`], so publishing a
/// function under a namespace key is a one-liner (§8 scenario A: `add`).
pub struct NativeFn {
    name: String,
    f: Arc<dyn Fn(Vec<Value>, Vec<(String, Value)>) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>,
}

impl NativeFn {
    pub fn new<F, Fut>(name: impl Into<String>, f: F) -> Arc<Self>
    where
        F: Fn(Vec<Value>, Vec<(String, Value)>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Arc::new(Self {
            name: name.into(),
            f: Arc::new(move |args, kwargs| Box::pin(f(args, kwargs))),
        })
    }
}

#[async_trait]
impl RemoteObject for NativeFn {
    fn type_name(&self) -> String {
        format!("function<{}>", self.name)
    }

    async fn call(&self, args: Vec<Value>, kwargs: Vec<(String, Value)>) -> anyhow::Result<Value> {
        (self.f)(args, kwargs).await
    }
}

/// A plain remote value with no behavior beyond being returned by value or
/// by proxy; used to publish data (lists, maps, scalars) under a namespace
/// key the same way a function is published.
pub struct NativeValue(pub Value);

#[async_trait]
impl RemoteObject for NativeValue {
    fn type_name(&self) -> String {
        "value".to_string()
    }

    async fn get_attr(&self, path: &[String]) -> anyhow::Result<Value> {
        if path.is_empty() {
            Ok(self.0.clone())
        } else {
            anyhow::bail!("value has no attribute {:?}", path)
        }
    }

    async fn get_item(&self, key: &Value) -> anyhow::Result<Value> {
        match (&self.0, key) {
            (Value::Seq(items) | Value::Tuple(items), Value::Int(i)) => items
                .get(*i as usize)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("index {i} out of range")),
            (Value::Map(entries), Value::Str(k)) => entries
                .iter()
                .find(|(ek, _)| ek == k)
                .map(|(_, v)| v.clone())
                .ok_or_else(|| anyhow::anyhow!("no such key {k:?}")),
            _ => anyhow::bail!("value does not support this kind of indexing"),
        }
    }
}
