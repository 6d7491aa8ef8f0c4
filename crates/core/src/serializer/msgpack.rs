//! Self-describing binary serializer, preferred for intra-trust traffic.

use crate::error::{Result, RpcError};
use crate::value::Value;

pub fn encode(value: &Value) -> Result<Vec<u8>> {
    rmp_serde::to_vec_named(value).map_err(|e| RpcError::Serialization(e.to_string()))
}

pub fn decode(bytes: &[u8]) -> Result<Value> {
    rmp_serde::from_slice(bytes).map_err(|e| RpcError::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_maps_as_named_fields() {
        let v = Value::Map(vec![("x".to_string(), Value::Int(1))]);
        let bytes = encode(&v).unwrap();
        let back = decode(&bytes).unwrap();
        assert_eq!(v, back);
    }
}
