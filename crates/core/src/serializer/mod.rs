//! C1: encode/decode the transferable value vocabulary across a named wire
//! format, with context-aware proxy resolution (§4.1).
//!
//! Two concrete formats are provided: [`msgpack`] (self-describing binary,
//! preferred for intra-trust traffic) and [`json`] (text, for
//! interoperability). Both drive the same [`Value`] `Serialize`/`Deserialize`
//! impl; the only difference between them is `Serializer::is_human_readable`,
//! which [`Value`] inspects to decide between base64 text and raw bytes for
//! binary payloads.

pub mod json;
pub mod msgpack;

use std::sync::Arc;

use crate::consts::{SERIALIZER_TAG_JSON, SERIALIZER_TAG_MSGPACK};
use crate::error::{Result, RpcError};
use crate::object::{NativeValue, RemoteObject};
use crate::server::Server;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerializerTag {
    Msgpack,
    Json,
}

impl SerializerTag {
    pub fn as_wire_str(&self) -> &'static str {
        match self {
            SerializerTag::Msgpack => SERIALIZER_TAG_MSGPACK,
            SerializerTag::Json => SERIALIZER_TAG_JSON,
        }
    }

    pub fn from_wire_str(s: &str) -> Option<Self> {
        match s {
            SERIALIZER_TAG_MSGPACK => Some(SerializerTag::Msgpack),
            SERIALIZER_TAG_JSON => Some(SerializerTag::Json),
            _ => None,
        }
    }

    pub fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        match self {
            SerializerTag::Msgpack => msgpack::encode(value),
            SerializerTag::Json => json::encode(value),
        }
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<Value> {
        match self {
            SerializerTag::Msgpack => msgpack::decode(bytes),
            SerializerTag::Json => json::decode(bytes),
        }
    }
}

/// Encodes `value`, applying the proxy-or-fail rule to any
/// [`Value::Object`] leaf — at any depth — by registering it with
/// `server_context` and substituting a [`Value::Proxy`]. Fails with
/// `NonSerializable` if such a leaf is found and no server is available to
/// register it with.
pub fn encode_with_context(
    tag: SerializerTag,
    value: &Value,
    server_context: Option<&Arc<Server>>,
) -> Result<Vec<u8>> {
    let resolved = proxy_or_fail(value.clone(), server_context)?;
    tag.encode(&resolved)
}

/// Value-level version of the proxy-or-fail substitution used by
/// [`encode_with_context`], exposed so a caller that already has a decoded
/// [`Value`] in hand (e.g. [`crate::client::Client`] building request opts)
/// doesn't need to round-trip through bytes to apply it.
pub fn substitute_objects(value: Value, server_context: Option<&Arc<Server>>) -> Result<Value> {
    proxy_or_fail(value, server_context)
}

/// Value-level version of the proxy-unwrap pass used by
/// [`decode_with_context`], exposed for callers (e.g. [`crate::client::Client`])
/// that already hold a decoded [`Value`] (a response's `rval`) and need to
/// resolve any proxies addressed back to this thread's server.
pub async fn resolve_value(value: Value, server_context: Option<&Arc<Server>>) -> Result<Value> {
    resolve_proxies(value, server_context).await
}

fn proxy_or_fail(value: Value, server_context: Option<&Arc<Server>>) -> Result<Value> {
    Ok(match value {
        Value::Object(obj) => {
            let server = server_context.ok_or_else(|| RpcError::NonSerializable {
                type_name: obj.type_name(),
            })?;
            Value::Proxy(server.get_proxy(obj))
        }
        Value::Seq(items) => Value::Seq(
            items
                .into_iter()
                .map(|v| proxy_or_fail(v, server_context))
                .collect::<Result<_>>()?,
        ),
        Value::Tuple(items) => Value::Tuple(
            items
                .into_iter()
                .map(|v| proxy_or_fail(v, server_context))
                .collect::<Result<_>>()?,
        ),
        Value::Map(entries) => Value::Map(
            entries
                .into_iter()
                .map(|(k, v)| Ok((k, proxy_or_fail(v, server_context)?)))
                .collect::<Result<_>>()?,
        ),
        other => other,
    })
}

/// Decodes `bytes`, then recursively resolves any [`Value::Proxy`] whose
/// `peer_address` equals `server_context`'s address into the local referent
/// by walking its attribute path against the server's reference table
/// (§4.1's "proxy unwrap locality"). Proxies addressed elsewhere are left
/// untouched.
pub async fn decode_with_context(
    tag: SerializerTag,
    bytes: &[u8],
    server_context: Option<&Arc<Server>>,
) -> Result<Value> {
    let raw = tag.decode(bytes)?;
    resolve_proxies(raw, server_context).await
}

fn resolve_proxies<'a>(
    value: Value,
    server_context: Option<&'a Arc<Server>>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Value>> + Send + 'a>> {
    Box::pin(async move {
        Ok(match value {
            Value::Proxy(p) => {
                if let Some(server) = server_context {
                    if server.address() == p.peer_address {
                        return server
                            .resolve_proxy(p.object_id, &p.attribute_path)
                            .await
                            .map_err(|e| RpcError::Serialization(e.to_string()));
                    }
                }
                Value::Proxy(p)
            }
            Value::Seq(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(resolve_proxies(item, server_context).await?);
                }
                Value::Seq(out)
            }
            Value::Tuple(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(resolve_proxies(item, server_context).await?);
                }
                Value::Tuple(out)
            }
            Value::Map(entries) => {
                let mut out = Vec::with_capacity(entries.len());
                for (k, v) in entries {
                    out.push((k, resolve_proxies(v, server_context).await?));
                }
                Value::Map(out)
            }
            other => other,
        })
    })
}

/// Wraps a bare value that isn't already a [`RemoteObject`] so it can be
/// registered as a proxy referent (used by [`crate::server::Server::shape_return`]).
pub(crate) fn as_remote_object(value: Value) -> Arc<dyn RemoteObject> {
    match value {
        Value::Object(o) => o,
        other => Arc::new(NativeValue(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::NativeFn;
    use std::time::Duration;

    async fn test_server() -> Arc<Server> {
        Server::bind("127.0.0.1:0", Duration::from_millis(50)).await.unwrap()
    }

    #[tokio::test]
    async fn proxy_unwrap_locality_resolves_to_local_referent_on_owning_server() {
        let server = test_server().await;
        let obj: Arc<dyn RemoteObject> = NativeFn::new("f", |_, _| async { Ok(Value::Int(9)) });
        let handle = server.get_proxy(obj);
        let value = Value::Proxy(handle);

        let resolved = resolve_value(value, Some(&server)).await.unwrap();
        match resolved {
            Value::Object(o) => {
                let result = o.call(vec![], vec![]).await.unwrap();
                assert_eq!(result, Value::Int(9));
            }
            other => panic!("expected the proxy to unwrap to a local Object, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn proxy_addressed_elsewhere_is_left_untouched() {
        let server = test_server().await;
        let other = test_server().await;
        let obj: Arc<dyn RemoteObject> = NativeFn::new("f", |_, _| async { Ok(Value::None) });
        let handle = other.get_proxy(obj);
        let value = Value::Proxy(handle.clone());

        let resolved = resolve_value(value, Some(&server)).await.unwrap();
        match resolved {
            Value::Proxy(p) => assert_eq!(p.peer_address, other.address()),
            other => panic!("expected the proxy to survive untouched, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn proxy_nested_inside_args_resolves_too() {
        let server = test_server().await;
        let obj: Arc<dyn RemoteObject> = NativeFn::new("f", |_, _| async { Ok(Value::Int(1)) });
        let handle = server.get_proxy(obj);
        let nested = Value::Map(vec![(
            "args".to_string(),
            Value::Tuple(vec![Value::Proxy(handle)]),
        )]);

        let resolved = resolve_value(nested, Some(&server)).await.unwrap();
        let Value::Map(entries) = resolved else {
            panic!("expected a map");
        };
        let Value::Tuple(items) = &entries[0].1 else {
            panic!("expected a tuple");
        };
        assert!(matches!(items[0], Value::Object(_)));
    }

    #[test]
    fn object_without_server_context_fails_encode() {
        let obj: Arc<dyn RemoteObject> = NativeFn::new("f", |_, _| async { Ok(Value::None) });
        let err = substitute_objects(Value::Object(obj), None).unwrap_err();
        assert!(matches!(err, RpcError::NonSerializable { .. }));
    }
}
