//! Binary payload codecs

use std::convert::Infallible;

use minicbor::encode::{Error as EncodeError, Write};
use minicbor::Encoder;
use serde_json::Value;

use crate::infra::{RelayError, Result};

/// Turns a validated envelope into bytes
pub trait PayloadCodec: Send + Sync {
    /// MIME type of the produced bytes
    fn content_type(&self) -> &'static str;

    fn encode(&self, value: &Value) -> Result<Vec<u8>>;
}

/// Collects the encoder's output chunks
#[derive(Debug, Default)]
struct ChunkSink {
    chunks: Vec<Vec<u8>>,
}

impl ChunkSink {
    fn concat(self) -> Vec<u8> {
        self.chunks.concat()
    }
}

impl Write for ChunkSink {
    type Error = Infallible;

    fn write_all(&mut self, buf: &[u8]) -> std::result::Result<(), Self::Error> {
        self.chunks.push(buf.to_vec());
        Ok(())
    }
}

/// CBOR codec; numbers are written as 64-bit floats
#[derive(Debug, Clone, Copy, Default)]
pub struct CborCodec;

impl CborCodec {
    fn write<W: Write>(enc: &mut Encoder<W>, value: &Value) -> std::result::Result<(), EncodeError<W::Error>> {
        match value {
            Value::Null => {
                enc.null()?;
            }
            Value::Bool(b) => {
                enc.bool(*b)?;
            }
            Value::Number(n) => {
                let n = n
                    .as_f64()
                    .ok_or_else(|| EncodeError::message("number is not representable as f64"))?;
                enc.f64(n)?;
            }
            Value::String(s) => {
                enc.str(s)?;
            }
            Value::Array(items) => {
                enc.array(items.len() as u64)?;
                for item in items {
                    Self::write(enc, item)?;
                }
            }
            Value::Object(map) => {
                enc.map(map.len() as u64)?;
                for (key, item) in map {
                    enc.str(key)?;
                    Self::write(enc, item)?;
                }
            }
        }
        Ok(())
    }
}

impl PayloadCodec for CborCodec {
    fn content_type(&self) -> &'static str {
        "application/cbor"
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        let mut enc = Encoder::new(ChunkSink::default());
        Self::write(&mut enc, value).map_err(|e| RelayError::Encoding(e.to_string()))?;
        Ok(enc.into_writer().concat())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use minicbor::data::Type;
    use minicbor::Decoder;
    use serde_json::json;

    #[test]
    fn test_encodes_tagged_map() {
        let bytes = CborCodec.encode(&json!({"a": {"boolean": true}, "c": null})).unwrap();
        let mut dec = Decoder::new(&bytes);

        assert_eq!(dec.map().unwrap(), Some(2));
        assert_eq!(dec.str().unwrap(), "a");
        assert_eq!(dec.map().unwrap(), Some(1));
        assert_eq!(dec.str().unwrap(), "boolean");
        assert!(dec.bool().unwrap());
        assert_eq!(dec.str().unwrap(), "c");
        assert_eq!(dec.datatype().unwrap(), Type::Null);
    }

    #[test]
    fn test_integers_become_doubles() {
        let bytes = CborCodec.encode(&json!([1, 2.5])).unwrap();
        let mut dec = Decoder::new(&bytes);

        assert_eq!(dec.array().unwrap(), Some(2));
        assert_eq!(dec.f64().unwrap(), 1.0);
        assert_eq!(dec.f64().unwrap(), 2.5);
    }

    #[test]
    fn test_chunks_are_concatenated_in_order() {
        let mut sink = ChunkSink::default();
        sink.write_all(b"ab").unwrap();
        sink.write_all(b"cd").unwrap();
        assert_eq!(sink.chunks.len(), 2);
        assert_eq!(sink.concat(), b"abcd");
    }
}
