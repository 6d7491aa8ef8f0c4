//! Text serializer, for interoperability with non-Rust peers.

use crate::error::{Result, RpcError};
use crate::value::Value;

pub fn encode(value: &Value) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| RpcError::Serialization(e.to_string()))
}

pub fn decode(bytes: &[u8]) -> Result<Value> {
    serde_json::from_slice(bytes).map_err(|e| RpcError::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_round_trip_through_base64_envelope() {
        let v = Value::Bytes(vec![0, 1, 2, 255]);
        let bytes = encode(&v).unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(text.contains("___type_name___"));
        assert!(text.contains("bytes"));
        let back = decode(&bytes).unwrap();
        assert_eq!(v, back);
    }
}
