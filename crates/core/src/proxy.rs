//! Client-side stand-in for a remote object (§3, §4.2).
//!
//! `ProxyHandle` is deliberately plain data: an explicit struct with an
//! `attribute_path` field and builder methods, rather than a type that hooks
//! attribute access dynamically (§9 re-architecture note 1 — Rust has no
//! runtime `getattr` to hook, so deferred access is an explicit, cheap
//! builder call instead of "magic"). The live operations that need a socket
//! (`call`, `get`, `delete`) are implemented on [`crate::client::Proxy`],
//! which pairs a handle with a handle to the owning [`crate::client::Client`].

use std::hash::{Hash, Hasher};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Sync,
    Async,
    Off,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnType {
    Auto,
    Proxy,
}

impl ReturnType {
    pub fn as_wire_str(&self) -> &'static str {
        match self {
            ReturnType::Auto => "auto",
            ReturnType::Proxy => "proxy",
        }
    }

    pub fn from_wire_str(s: &str) -> Option<Self> {
        match s {
            "auto" => Some(ReturnType::Auto),
            "proxy" => Some(ReturnType::Proxy),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ProxyOptions {
    pub sync: SyncMode,
    pub return_type: ReturnType,
    pub timeout: Option<Duration>,
    pub defer_getattr: bool,
    pub auto_delete: bool,
    pub local_server_required: bool,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            sync: SyncMode::Sync,
            return_type: ReturnType::Auto,
            timeout: Some(Duration::from_secs(10)),
            defer_getattr: true,
            auto_delete: true,
            local_server_required: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProxyHandle {
    pub peer_address: String,
    pub object_id: u64,
    pub ref_id: u64,
    pub type_string: String,
    pub attribute_path: Vec<String>,
    pub options: ProxyOptions,
}

impl ProxyHandle {
    pub fn new(
        peer_address: impl Into<String>,
        object_id: u64,
        ref_id: u64,
        type_string: impl Into<String>,
    ) -> Self {
        Self {
            peer_address: peer_address.into(),
            object_id,
            ref_id,
            type_string: type_string.into(),
            attribute_path: Vec::new(),
            options: ProxyOptions::default(),
        }
    }

    /// Constructs a handle from the fields carried in a wire envelope.
    /// Ref-counting options (`auto_delete`, `sync`, ...) are not part of the
    /// envelope; a freshly decoded handle gets the caller's default options
    /// applied by whoever receives it.
    pub fn from_wire(
        peer_address: String,
        object_id: u64,
        ref_id: u64,
        type_string: String,
        attribute_path: Vec<String>,
    ) -> Self {
        Self {
            peer_address,
            object_id,
            ref_id,
            type_string,
            attribute_path,
            options: ProxyOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ProxyOptions) -> Self {
        self.options = options;
        self
    }

    /// Builds a new handle identical to `self` but with `attr` appended to
    /// `attribute_path`. Performs no I/O — this is the "deferred getattr"
    /// path from §4.2, only valid when `options.defer_getattr` is set.
    pub fn deferred_attr(&self, attr: impl Into<String>) -> Self {
        let mut path = self.attribute_path.clone();
        path.push(attr.into());
        Self {
            peer_address: self.peer_address.clone(),
            object_id: self.object_id,
            ref_id: self.ref_id,
            type_string: self.type_string.clone(),
            attribute_path: path,
            options: self.options,
        }
    }
}

impl PartialEq for ProxyHandle {
    fn eq(&self, other: &Self) -> bool {
        self.peer_address == other.peer_address
            && self.object_id == other.object_id
            && self.attribute_path == other.attribute_path
    }
}
impl Eq for ProxyHandle {}

impl Hash for ProxyHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // Hash only on (peer_address, object_id) per §9 design note 6:
        // attribute path participates in equality but not in the hash, so
        // two handles at different paths to the same referent still land in
        // the same bucket (equality is the finer-grained check).
        self.peer_address.hash(state);
        self.object_id.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_object_id_distinct_ref_id_compares_equal() {
        let a = ProxyHandle::new("peerA", 5, 1, "Widget");
        let b = ProxyHandle::new("peerA", 5, 2, "Widget");
        assert_eq!(a, b);
        assert_ne!(a.ref_id, b.ref_id);
    }

    #[test]
    fn differing_attribute_path_is_not_equal() {
        let a = ProxyHandle::new("peerA", 5, 1, "Widget");
        let b = a.deferred_attr("x");
        assert_ne!(a, b);
    }

    #[test]
    fn deferred_attr_chains_without_mutating_original() {
        let a = ProxyHandle::new("peerA", 5, 1, "Widget");
        let b = a.deferred_attr("x").deferred_attr("y").deferred_attr("z");
        assert!(a.attribute_path.is_empty());
        assert_eq!(b.attribute_path, vec!["x", "y", "z"]);
    }
}
