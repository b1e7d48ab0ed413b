//! Compact binary encoding for documents stored in extents.
//!
//! Layout: a document is a little-endian `u32` field count followed by
//! fields; a field is a tag byte, a `u16` name length + name bytes, and a
//! tag-specific payload. Arrays are a `u32` element count of tagged values.
//! The format is self-describing, so records can be decoded without any
//! schema at hand.

use eyre::{bail, ensure, Result};

use super::{Document, Value};

const TAG_MIN_KEY: u8 = 0x00;
const TAG_NULL: u8 = 0x01;
const TAG_INT: u8 = 0x02;
const TAG_DOUBLE: u8 = 0x03;
const TAG_STR: u8 = 0x04;
const TAG_DOC: u8 = 0x05;
const TAG_ARRAY: u8 = 0x06;
const TAG_BOOL: u8 = 0x07;
const TAG_MAX_KEY: u8 = 0x7f;

pub fn encode_document(doc: &Document) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    write_document(doc, &mut out);
    out
}

pub fn decode_document(bytes: &[u8]) -> Result<Document> {
    let mut reader = Reader { bytes, pos: 0 };
    let doc = reader.read_document()?;
    Ok(doc)
}

/// Number of bytes the leading encoded document occupies. Records are
/// padded, so the stored slice is usually longer than the document itself;
/// this walks the structure without materializing values.
pub fn encoded_len(bytes: &[u8]) -> Result<usize> {
    let mut reader = Reader { bytes, pos: 0 };
    reader.skip_document()?;
    Ok(reader.pos)
}

fn write_document(doc: &Document, out: &mut Vec<u8>) {
    out.extend_from_slice(&(doc.len() as u32).to_le_bytes());
    for (name, value) in doc.iter() {
        out.push(tag_of(value));
        out.extend_from_slice(&(name.len() as u16).to_le_bytes());
        out.extend_from_slice(name.as_bytes());
        write_value(value, out);
    }
}

fn tag_of(value: &Value) -> u8 {
    match value {
        Value::MinKey => TAG_MIN_KEY,
        Value::Null => TAG_NULL,
        Value::Int(_) => TAG_INT,
        Value::Double(_) => TAG_DOUBLE,
        Value::Str(_) => TAG_STR,
        Value::Doc(_) => TAG_DOC,
        Value::Array(_) => TAG_ARRAY,
        Value::Bool(_) => TAG_BOOL,
        Value::MaxKey => TAG_MAX_KEY,
    }
}

fn write_value(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::MinKey | Value::Null | Value::MaxKey => {}
        Value::Int(i) => out.extend_from_slice(&i.to_le_bytes()),
        Value::Double(d) => out.extend_from_slice(&d.to_le_bytes()),
        Value::Str(s) => {
            out.extend_from_slice(&(s.len() as u32).to_le_bytes());
            out.extend_from_slice(s.as_bytes());
        }
        Value::Doc(d) => write_document(d, out),
        Value::Array(values) => {
            out.extend_from_slice(&(values.len() as u32).to_le_bytes());
            for v in values {
                out.push(tag_of(v));
                write_value(v, out);
            }
        }
        Value::Bool(b) => out.push(*b as u8),
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl Reader<'_> {
    fn take(&mut self, n: usize) -> Result<&[u8]> {
        ensure!(
            self.pos + n <= self.bytes.len(),
            "truncated document: need {} bytes at offset {}, have {}",
            n,
            self.pos,
            self.bytes.len() - self.pos
        );
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn read_document(&mut self) -> Result<Document> {
        let count = self.read_u32()? as usize;
        ensure!(
            count <= self.bytes.len(),
            "implausible field count {} in document",
            count
        );
        let mut doc = Document::new();
        for _ in 0..count {
            let tag = self.read_u8()?;
            let name_len = self.read_u16()? as usize;
            let name = std::str::from_utf8(self.take(name_len)?)
                .map_err(|e| eyre::eyre!("field name is not utf-8: {}", e))?
                .to_string();
            let value = self.read_value(tag)?;
            doc.set(name, value);
        }
        Ok(doc)
    }

    fn read_value(&mut self, tag: u8) -> Result<Value> {
        Ok(match tag {
            TAG_MIN_KEY => Value::MinKey,
            TAG_NULL => Value::Null,
            TAG_INT => Value::Int(i64::from_le_bytes(self.take(8)?.try_into().unwrap())),
            TAG_DOUBLE => Value::Double(f64::from_le_bytes(self.take(8)?.try_into().unwrap())),
            TAG_STR => {
                let len = self.read_u32()? as usize;
                Value::Str(
                    std::str::from_utf8(self.take(len)?)
                        .map_err(|e| eyre::eyre!("string value is not utf-8: {}", e))?
                        .to_string(),
                )
            }
            TAG_DOC => Value::Doc(self.read_document()?),
            TAG_ARRAY => {
                let count = self.read_u32()? as usize;
                ensure!(
                    count <= self.bytes.len(),
                    "implausible array length {}",
                    count
                );
                let mut values = Vec::with_capacity(count);
                for _ in 0..count {
                    let tag = self.read_u8()?;
                    values.push(self.read_value(tag)?);
                }
                Value::Array(values)
            }
            TAG_BOOL => Value::Bool(self.read_u8()? != 0),
            TAG_MAX_KEY => Value::MaxKey,
            other => bail!("unknown value tag 0x{:02x} at offset {}", other, self.pos),
        })
    }

    fn skip_document(&mut self) -> Result<()> {
        let count = self.read_u32()? as usize;
        ensure!(
            count <= self.bytes.len(),
            "implausible field count {} in document",
            count
        );
        for _ in 0..count {
            let tag = self.read_u8()?;
            let name_len = self.read_u16()? as usize;
            self.take(name_len)?;
            self.skip_value(tag)?;
        }
        Ok(())
    }

    fn skip_value(&mut self, tag: u8) -> Result<()> {
        match tag {
            TAG_MIN_KEY | TAG_NULL | TAG_MAX_KEY => {}
            TAG_INT | TAG_DOUBLE => {
                self.take(8)?;
            }
            TAG_STR => {
                let len = self.read_u32()? as usize;
                self.take(len)?;
            }
            TAG_DOC => self.skip_document()?,
            TAG_ARRAY => {
                let count = self.read_u32()? as usize;
                ensure!(
                    count <= self.bytes.len(),
                    "implausible array length {}",
                    count
                );
                for _ in 0..count {
                    let tag = self.read_u8()?;
                    self.skip_value(tag)?;
                }
            }
            TAG_BOOL => {
                self.take(1)?;
            }
            other => bail!("unknown value tag 0x{:02x} at offset {}", other, self.pos),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;

    #[test]
    fn nested_document_round_trips() {
        let original = doc! {
            "name" => "orders",
            "count" => 42,
            "ratio" => 0.5,
            "live" => true,
            "tags" => vec![Value::Str("a".into()), Value::Int(7)],
            "nested" => doc! { "deep" => doc! { "x" => Value::Null } },
        };

        let bytes = encode_document(&original);
        let decoded = decode_document(&bytes).unwrap();

        assert_eq!(decoded, original);
    }

    #[test]
    fn key_sentinels_round_trip() {
        let original = doc! { "lo" => Value::MinKey, "hi" => Value::MaxKey };
        let decoded = decode_document(&encode_document(&original)).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn truncated_input_is_rejected() {
        let bytes = encode_document(&doc! { "a" => "hello world" });
        let result = decode_document(&bytes[..bytes.len() - 3]);
        assert!(result.is_err());
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let mut bytes = encode_document(&doc! { "a" => 1 });
        bytes[4] = 0x6e;
        assert!(decode_document(&bytes).is_err());
    }

    #[test]
    fn empty_document_encodes_to_count_only() {
        let bytes = encode_document(&Document::new());
        assert_eq!(bytes, vec![0, 0, 0, 0]);
        assert!(decode_document(&bytes).unwrap().is_empty());
    }

    #[test]
    fn encoded_len_ignores_record_padding() {
        let doc = doc! { "a" => 1, "tags" => vec![Value::Str("x".into())] };
        let mut bytes = encode_document(&doc);
        let exact = bytes.len();

        bytes.extend_from_slice(&[0xAB; 37]);
        assert_eq!(encoded_len(&bytes).unwrap(), exact);
    }
}
