//! The error taxonomy that crosses the library boundary. Internal plumbing
//! uses `anyhow`; anything a caller of this crate can match on is a variant
//! here.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("connection refused: peer {peer} unreachable")]
    ConnectionRefused { peer: String },

    #[error("timed out after {waited_ms}ms waiting on {action}")]
    Timeout { action: String, waited_ms: u64 },

    #[error("peer {peer} is gone")]
    PeerGone { peer: String },

    #[error("remote call raised {type_name}: {}", traceback.join("\n"))]
    RemoteCallError {
        type_name: String,
        traceback: Vec<String>,
    },

    #[error("proxy (object_id={object_id}, ref_id={ref_id}) on {peer} is no longer valid")]
    ProxyInvalidated {
        peer: String,
        object_id: u64,
        ref_id: u64,
    },

    #[error("value of type {type_name} is not serializable and no local server is available")]
    NonSerializable { type_name: String },

    #[error("unrecognized action {action:?}")]
    BadAction { action: String },

    #[error("missing or malformed option {option:?} for action {action:?}")]
    BadOptions { action: String, option: String },

    #[error("bootstrap of child process failed: {}", traceback.join("\n"))]
    BootstrapFailure { traceback: Vec<String> },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    Transport(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RpcError>;

impl RpcError {
    /// The wire `type_name` for this variant, matching its discriminant
    /// name exactly so a client-side `RemoteCallError` can be matched on by
    /// the same name a caller would `match` this enum on locally.
    fn variant_name(&self) -> &'static str {
        match self {
            RpcError::ConnectionRefused { .. } => "ConnectionRefused",
            RpcError::Timeout { .. } => "Timeout",
            RpcError::PeerGone { .. } => "PeerGone",
            RpcError::RemoteCallError { .. } => "RemoteCallError",
            RpcError::ProxyInvalidated { .. } => "ProxyInvalidated",
            RpcError::NonSerializable { .. } => "NonSerializable",
            RpcError::BadAction { .. } => "BadAction",
            RpcError::BadOptions { .. } => "BadOptions",
            RpcError::BootstrapFailure { .. } => "BootstrapFailure",
            RpcError::Serialization(_) => "Serialization",
            RpcError::Transport(_) => "Transport",
        }
    }

    /// Formats a Rust error as the `(type_name, traceback_lines)` pair that
    /// travels in a response frame's `error` field (§6, §7 — "the payload
    /// carries the peer's type name ... so the caller can diagnose"). If
    /// `err` or one of its causes is a known [`RpcError`] — e.g. the
    /// `BadAction`/`BadOptions` this crate's own dispatch raises for a
    /// malformed request — the wire `type_name` names that variant;
    /// otherwise it falls back to the generic `"RemoteError"` label used for
    /// an arbitrary exception a published object's `call`/`get_attr` raised,
    /// which has no Rust type more specific than `anyhow::Error` to report.
    pub fn to_wire_error(err: &anyhow::Error) -> (String, Vec<String>) {
        let type_name = err
            .chain()
            .find_map(|cause| cause.downcast_ref::<RpcError>())
            .map(|e| e.variant_name().to_string())
            .unwrap_or_else(|| "RemoteError".to_string());
        let traceback = err.chain().map(|e| e.to_string()).collect();
        (type_name, traceback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_error_chains_causes() {
        let err = anyhow::anyhow!("outer").context("middle").context("top");
        let (type_name, traceback) = RpcError::to_wire_error(&err);
        assert_eq!(type_name, "RemoteError");
        assert_eq!(traceback.len(), 3);
        assert_eq!(traceback[0], "top");
    }

    #[test]
    fn wire_error_names_a_known_rpc_error_variant() {
        let err: anyhow::Error = RpcError::BadAction {
            action: "frobnicate".to_string(),
        }
        .into();
        let err = err.context("while dispatching");
        let (type_name, traceback) = RpcError::to_wire_error(&err);
        assert_eq!(type_name, "BadAction");
        assert_eq!(traceback.len(), 2);
    }
}
