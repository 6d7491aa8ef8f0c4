//! Frame encoding over a duplex byte stream (§6).
//!
//! A request frame is five length-prefixed parts in order: `req_id`,
//! `action`, `return_type`, `serializer_tag`, `opts`. A response frame is a
//! single length-prefixed serialized mapping. Every length prefix is a
//! big-endian `u32` byte count, matching the "multipart message" framing
//! this lineage uses elsewhere for protocol plumbing.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, RpcError};
use crate::proxy::ReturnType;
use crate::serializer::SerializerTag;
use crate::value::Value;

pub const MAX_FRAME_PART_BYTES: u32 = 64 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct RequestFrame {
    pub req_id: i64,
    pub action: String,
    pub return_type: ReturnType,
    pub serializer_tag: SerializerTag,
    pub opts: Value,
}

#[derive(Debug, Clone)]
pub enum ResponseFrame {
    Return {
        req_id: i64,
        rval: Value,
        error: Option<(String, Vec<String>)>,
    },
    Disconnect,
}

async fn write_part<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> Result<()> {
    if bytes.len() as u64 > MAX_FRAME_PART_BYTES as u64 {
        return Err(RpcError::Serialization("frame part too large".to_string()));
    }
    writer.write_u32(bytes.len() as u32).await?;
    writer.write_all(bytes).await?;
    Ok(())
}

async fn read_part<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let len = reader.read_u32().await?;
    if len > MAX_FRAME_PART_BYTES {
        return Err(RpcError::Serialization("frame part too large".to_string()));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

pub async fn write_request<W: AsyncWrite + Unpin>(writer: &mut W, frame: &RequestFrame) -> Result<()> {
    write_part(writer, frame.req_id.to_string().as_bytes()).await?;
    write_part(writer, frame.action.as_bytes()).await?;
    write_part(writer, frame.return_type.as_wire_str().as_bytes()).await?;
    write_part(writer, frame.serializer_tag.as_wire_str().as_bytes()).await?;
    let opts_bytes = frame.serializer_tag.encode(&frame.opts)?;
    write_part(writer, &opts_bytes).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_request<R: AsyncRead + Unpin>(reader: &mut R) -> Result<RequestFrame> {
    let req_id: i64 = String::from_utf8(read_part(reader).await?)
        .map_err(|e| RpcError::Serialization(e.to_string()))?
        .parse()
        .map_err(|_| RpcError::BadOptions {
            action: "<unknown>".to_string(),
            option: "req_id".to_string(),
        })?;
    let action = String::from_utf8(read_part(reader).await?)
        .map_err(|e| RpcError::Serialization(e.to_string()))?;
    let return_type_raw = String::from_utf8(read_part(reader).await?)
        .map_err(|e| RpcError::Serialization(e.to_string()))?;
    let return_type = ReturnType::from_wire_str(&return_type_raw).ok_or_else(|| RpcError::BadOptions {
        action: action.clone(),
        option: "return_type".to_string(),
    })?;
    let tag_raw = String::from_utf8(read_part(reader).await?)
        .map_err(|e| RpcError::Serialization(e.to_string()))?;
    let serializer_tag = SerializerTag::from_wire_str(&tag_raw).ok_or_else(|| RpcError::BadOptions {
        action: action.clone(),
        option: "serializer_tag".to_string(),
    })?;
    let opts_bytes = read_part(reader).await?;
    let opts = if opts_bytes.is_empty() {
        Value::Map(Vec::new())
    } else {
        serializer_tag.decode(&opts_bytes)?
    };
    Ok(RequestFrame {
        req_id,
        action,
        return_type,
        serializer_tag,
        opts,
    })
}

fn response_to_value(frame: &ResponseFrame) -> Value {
    match frame {
        ResponseFrame::Return { req_id, rval, error } => Value::Map(vec![
            ("action".to_string(), Value::Str("return".to_string())),
            ("req_id".to_string(), Value::Int(*req_id)),
            ("rval".to_string(), rval.clone()),
            (
                "error".to_string(),
                match error {
                    None => Value::None,
                    Some((type_name, traceback)) => Value::Tuple(vec![
                        Value::Str(type_name.clone()),
                        Value::Seq(traceback.iter().cloned().map(Value::Str).collect()),
                    ]),
                },
            ),
        ]),
        ResponseFrame::Disconnect => Value::Map(vec![(
            "action".to_string(),
            Value::Str("disconnect".to_string()),
        )]),
    }
}

fn value_to_response(value: Value) -> Result<ResponseFrame> {
    let Value::Map(entries) = value else {
        return Err(RpcError::Serialization("response frame must be a mapping".to_string()));
    };
    let find = |name: &str| entries.iter().find(|(k, _)| k == name).map(|(_, v)| v.clone());
    let action = match find("action") {
        Some(Value::Str(s)) => s,
        _ => return Err(RpcError::Serialization("response frame missing action".to_string())),
    };
    match action.as_str() {
        "disconnect" => Ok(ResponseFrame::Disconnect),
        "return" => {
            let req_id = match find("req_id") {
                Some(Value::Int(i)) => i,
                _ => return Err(RpcError::Serialization("response frame missing req_id".to_string())),
            };
            let rval = find("rval").unwrap_or(Value::None);
            let error = match find("error") {
                None | Some(Value::None) => None,
                Some(Value::Tuple(mut items)) | Some(Value::Seq(mut items)) if items.len() == 2 => {
                    let traceback = items.pop().unwrap();
                    let type_name = items.pop().unwrap();
                    let Value::Str(type_name) = type_name else {
                        return Err(RpcError::Serialization("error type_name must be a string".to_string()));
                    };
                    let Value::Seq(lines) = traceback else {
                        return Err(RpcError::Serialization("error traceback must be a sequence".to_string()));
                    };
                    let lines = lines
                        .into_iter()
                        .map(|v| match v {
                            Value::Str(s) => Ok(s),
                            _ => Err(RpcError::Serialization("traceback lines must be strings".to_string())),
                        })
                        .collect::<Result<Vec<_>>>()?;
                    Some((type_name, lines))
                }
                _ => return Err(RpcError::Serialization("malformed error field".to_string())),
            };
            Ok(ResponseFrame::Return { req_id, rval, error })
        }
        other => Err(RpcError::BadAction {
            action: other.to_string(),
        }),
    }
}

pub async fn write_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    tag: SerializerTag,
    frame: &ResponseFrame,
) -> Result<()> {
    let bytes = tag.encode(&response_to_value(frame))?;
    write_part(writer, &bytes).await?;
    Ok(())
}

pub async fn read_response<R: AsyncRead + Unpin>(reader: &mut R, tag: SerializerTag) -> Result<ResponseFrame> {
    let bytes = read_part(reader).await?;
    let value = tag.decode(&bytes)?;
    value_to_response(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn request_frame_round_trips() {
        let (mut a, mut b) = duplex(4096);
        let frame = RequestFrame {
            req_id: 42,
            action: "call_obj".to_string(),
            return_type: ReturnType::Auto,
            serializer_tag: SerializerTag::Msgpack,
            opts: Value::Map(vec![("x".to_string(), Value::Int(1))]),
        };
        write_request(&mut a, &frame).await.unwrap();
        let back = read_request(&mut b).await.unwrap();
        assert_eq!(back.req_id, 42);
        assert_eq!(back.action, "call_obj");
        assert_eq!(back.return_type, ReturnType::Auto);
    }

    #[tokio::test]
    async fn response_frame_round_trips() {
        let (mut a, mut b) = duplex(4096);
        let frame = ResponseFrame::Return {
            req_id: 7,
            rval: Value::Int(12),
            error: None,
        };
        write_response(&mut a, SerializerTag::Json, &frame).await.unwrap();
        let back = read_response(&mut b, SerializerTag::Json).await.unwrap();
        match back {
            ResponseFrame::Return { req_id, rval, error } => {
                assert_eq!(req_id, 7);
                assert_eq!(rval, Value::Int(12));
                assert!(error.is_none());
            }
            _ => panic!("expected Return"),
        }
    }

    #[tokio::test]
    async fn disconnect_frame_round_trips() {
        let (mut a, mut b) = duplex(4096);
        write_response(&mut a, SerializerTag::Msgpack, &ResponseFrame::Disconnect)
            .await
            .unwrap();
        let back = read_response(&mut b, SerializerTag::Msgpack).await.unwrap();
        assert!(matches!(back, ResponseFrame::Disconnect));
    }
}
