//! A minimal, deterministic BSON-like codec: `encode(doc) -> bytes` and
//! `decode(bytes) -> doc`.
//!
//! Layout: `[u32 total_len][u16 field_count]{[u16 key_len][key bytes][tagged
//! value]}*`. `total_len` covers the whole encoding, including itself.

use crate::error::{Error, Result};
use crate::value::{Document, Value};

const TAG_NULL: u8 = 0x00;
const TAG_BOOL: u8 = 0x01;
const TAG_INT32: u8 = 0x02;
const TAG_INT64: u8 = 0x03;
const TAG_DOUBLE: u8 = 0x04;
const TAG_STRING: u8 = 0x05;
const TAG_BINARY: u8 = 0x06;
const TAG_OBJECT_ID: u8 = 0x07;
const TAG_DATETIME: u8 = 0x08;
const TAG_TIMESTAMP: u8 = 0x09;
const TAG_REGEX: u8 = 0x0A;
const TAG_MIN_KEY: u8 = 0x0B;
const TAG_MAX_KEY: u8 = 0x0C;
const TAG_ARRAY: u8 = 0x0D;
const TAG_DOCUMENT: u8 = 0x0E;

pub fn encode(doc: &Document) -> Vec<u8> {
    let mut body = Vec::new();
    let count = u16::try_from(doc.len()).expect("field count fits u16");
    body.extend_from_slice(&count.to_le_bytes());
    for (key, value) in doc.iter() {
        write_key(&mut body, key);
        write_value(&mut body, value);
    }
    let total_len = u32::try_from(4 + body.len()).expect("document fits u32 length");
    let mut out = Vec::with_capacity(total_len as usize);
    out.extend_from_slice(&total_len.to_le_bytes());
    out.extend_from_slice(&body);
    out
}

pub fn decode(bytes: &[u8]) -> Result<Document> {
    if bytes.len() < 4 {
        return Err(Error::invalid_argument("document shorter than length prefix"));
    }
    let total_len = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
    if total_len != bytes.len() {
        return Err(Error::invalid_argument(format!(
            "document length mismatch: header says {total_len}, got {}",
            bytes.len()
        )));
    }
    let mut cursor = Cursor { buf: bytes, pos: 4 };
    let count = cursor.read_u16()? as usize;
    let mut doc = Document::new();
    for _ in 0..count {
        let key = cursor.read_key()?;
        let value = cursor.read_value()?;
        doc.insert(key, value);
    }
    Ok(doc)
}

fn write_key(out: &mut Vec<u8>, key: &str) {
    let bytes = key.as_bytes();
    let len = u16::try_from(bytes.len()).expect("key fits u16");
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(bytes);
}

fn write_value(out: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Null => out.push(TAG_NULL),
        Value::Bool(b) => {
            out.push(TAG_BOOL);
            out.push(if *b { 1 } else { 0 });
        }
        Value::Int32(i) => {
            out.push(TAG_INT32);
            out.extend_from_slice(&i.to_le_bytes());
        }
        Value::Int64(i) => {
            out.push(TAG_INT64);
            out.extend_from_slice(&i.to_le_bytes());
        }
        Value::Double(d) => {
            out.push(TAG_DOUBLE);
            out.extend_from_slice(&d.to_le_bytes());
        }
        Value::String(s) => {
            out.push(TAG_STRING);
            let bytes = s.as_bytes();
            let len = u32::try_from(bytes.len()).expect("string fits u32");
            out.extend_from_slice(&len.to_le_bytes());
            out.extend_from_slice(bytes);
        }
        Value::Binary(subtype, bytes) => {
            out.push(TAG_BINARY);
            out.push(*subtype);
            let len = u32::try_from(bytes.len()).expect("binary fits u32");
            out.extend_from_slice(&len.to_le_bytes());
            out.extend_from_slice(bytes);
        }
        Value::ObjectId(bytes) => {
            out.push(TAG_OBJECT_ID);
            out.extend_from_slice(bytes);
        }
        Value::DateTime(ms) => {
            out.push(TAG_DATETIME);
            out.extend_from_slice(&ms.to_le_bytes());
        }
        Value::Timestamp(secs, inc) => {
            out.push(TAG_TIMESTAMP);
            out.extend_from_slice(&secs.to_le_bytes());
            out.extend_from_slice(&inc.to_le_bytes());
        }
        Value::Regex(pattern, opts) => {
            out.push(TAG_REGEX);
            write_key(out, pattern);
            write_key(out, opts);
        }
        Value::MinKey => out.push(TAG_MIN_KEY),
        Value::MaxKey => out.push(TAG_MAX_KEY),
        Value::Array(items) => {
            out.push(TAG_ARRAY);
            let len = u32::try_from(items.len()).expect("array fits u32");
            out.extend_from_slice(&len.to_le_bytes());
            for item in items {
                write_value(out, item);
            }
        }
        Value::Document(doc) => {
            out.push(TAG_DOCUMENT);
            let len = u32::try_from(doc.len()).expect("document fits u32");
            out.extend_from_slice(&len.to_le_bytes());
            for (k, v) in doc.iter() {
                write_key(out, k);
                write_value(out, v);
            }
        }
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn need(&self, n: usize) -> Result<()> {
        if self.pos + n > self.buf.len() {
            return Err(Error::invalid_argument("truncated document encoding"));
        }
        Ok(())
    }

    fn read_u8(&mut self) -> Result<u8> {
        self.need(1)?;
        let v = self.buf[self.pos];
        self.pos += 1;
        Ok(v)
    }

    fn read_u16(&mut self) -> Result<u16> {
        self.need(2)?;
        let v = u16::from_le_bytes(self.buf[self.pos..self.pos + 2].try_into().unwrap());
        self.pos += 2;
        Ok(v)
    }

    fn read_u32(&mut self) -> Result<u32> {
        self.need(4)?;
        let v = u32::from_le_bytes(self.buf[self.pos..self.pos + 4].try_into().unwrap());
        self.pos += 4;
        Ok(v)
    }

    fn read_i32(&mut self) -> Result<i32> {
        Ok(self.read_u32()? as i32)
    }

    fn read_i64(&mut self) -> Result<i64> {
        self.need(8)?;
        let v = i64::from_le_bytes(self.buf[self.pos..self.pos + 8].try_into().unwrap());
        self.pos += 8;
        Ok(v)
    }

    fn read_f64(&mut self) -> Result<f64> {
        self.need(8)?;
        let v = f64::from_le_bytes(self.buf[self.pos..self.pos + 8].try_into().unwrap());
        self.pos += 8;
        Ok(v)
    }

    fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.need(n)?;
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_key(&mut self) -> Result<String> {
        let len = self.read_u16()? as usize;
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| Error::invalid_argument("invalid utf8 in key"))
    }

    fn read_string(&mut self) -> Result<String> {
        let len = self.read_u32()? as usize;
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| Error::invalid_argument("invalid utf8 in string value"))
    }

    fn read_value(&mut self) -> Result<Value> {
        let tag = self.read_u8()?;
        match tag {
            TAG_NULL => Ok(Value::Null),
            TAG_BOOL => Ok(Value::Bool(self.read_u8()? != 0)),
            TAG_INT32 => Ok(Value::Int32(self.read_i32()?)),
            TAG_INT64 => Ok(Value::Int64(self.read_i64()?)),
            TAG_DOUBLE => Ok(Value::Double(self.read_f64()?)),
            TAG_STRING => Ok(Value::String(self.read_string()?)),
            TAG_BINARY => {
                let subtype = self.read_u8()?;
                let len = self.read_u32()? as usize;
                Ok(Value::Binary(subtype, self.read_bytes(len)?.to_vec()))
            }
            TAG_OBJECT_ID => {
                let bytes = self.read_bytes(12)?;
                let mut arr = [0u8; 12];
                arr.copy_from_slice(bytes);
                Ok(Value::ObjectId(arr))
            }
            TAG_DATETIME => Ok(Value::DateTime(self.read_i64()?)),
            TAG_TIMESTAMP => {
                let secs = self.read_u32()?;
                let inc = self.read_u32()?;
                Ok(Value::Timestamp(secs, inc))
            }
            TAG_REGEX => {
                let pattern = self.read_key()?;
                let opts = self.read_key()?;
                Ok(Value::Regex(pattern, opts))
            }
            TAG_MIN_KEY => Ok(Value::MinKey),
            TAG_MAX_KEY => Ok(Value::MaxKey),
            TAG_ARRAY => {
                let len = self.read_u32()? as usize;
                let mut items = Vec::with_capacity(len);
                for _ in 0..len {
                    items.push(self.read_value()?);
                }
                Ok(Value::Array(items))
            }
            TAG_DOCUMENT => {
                let len = self.read_u32()? as usize;
                let mut doc = Document::new();
                for _ in 0..len {
                    let key = self.read_key()?;
                    let value = self.read_value()?;
                    doc.insert(key, value);
                }
                Ok(Value::Document(doc))
            }
            _ => Err(Error::invalid_argument(format!("unknown value tag {tag}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_value_kind() {
        let mut nested = Document::new();
        nested.insert("inner", Value::Bool(true));

        let mut doc = Document::new();
        doc.insert("_id", Value::ObjectId([7u8; 12]));
        doc.insert("name", Value::String("Alice".into()));
        doc.insert("age", Value::Int32(30));
        doc.insert("big", Value::Int64(9_000_000_000));
        doc.insert("score", Value::Double(1.5));
        doc.insert("tags", Value::Array(vec![Value::String("a".into()), Value::Null]));
        doc.insert("nested", Value::Document(nested));
        doc.insert("bin", Value::Binary(0, vec![1, 2, 3]));
        doc.insert("re", Value::Regex("^a".into(), "i".into()));
        doc.insert("min", Value::MinKey);
        doc.insert("max", Value::MaxKey);
        doc.insert("ts", Value::Timestamp(1, 2));
        doc.insert("dt", Value::DateTime(123));

        let bytes = encode(&doc);
        let decoded = decode(&bytes).unwrap();
        assert_eq!(doc, decoded);
    }

    #[test]
    fn rejects_length_mismatch() {
        let doc = Document::new();
        let mut bytes = encode(&doc);
        bytes.push(0xFF);
        assert!(decode(&bytes).is_err());
    }
}
