//! Tagged key/value byte framing used for notification payloads.
//!
//! Wire layout: `[u32 tag count]` followed by, per tag,
//! `[u32 name len][name bytes][u32 value len][value bytes]`. All integers
//! are little-endian.

use crate::error::{EngineError, Result};

#[derive(Default)]
pub struct TagEncoder {
    tags: Vec<(String, Vec<u8>)>,
}

impl TagEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) -> &mut Self {
        self.tags.push((name.into(), value.into()));
        self
    }

    pub fn finish(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            4 + self
                .tags
                .iter()
                .map(|(name, value)| 8 + name.len() + value.len())
                .sum::<usize>(),
        );
        out.extend_from_slice(&(self.tags.len() as u32).to_le_bytes());
        for (name, value) in &self.tags {
            out.extend_from_slice(&(name.len() as u32).to_le_bytes());
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(&(value.len() as u32).to_le_bytes());
            out.extend_from_slice(value);
        }
        out
    }
}

pub struct TagDecoder {
    tags: Vec<(String, Vec<u8>)>,
}

impl TagDecoder {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut cursor = Cursor { bytes, pos: 0 };
        let count = cursor.read_u32()?;
        let mut tags = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let name = cursor.read_chunk()?;
            let name = String::from_utf8(name.to_vec())
                .map_err(|_| EngineError::invalid("tag name is not valid UTF-8"))?;
            let value = cursor.read_chunk()?.to_vec();
            tags.push((name, value));
        }
        if cursor.pos != bytes.len() {
            return Err(EngineError::invalid("trailing bytes after last tag"));
        }
        Ok(Self { tags })
    }

    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.tags
            .iter()
            .find(|(tag, _)| tag == name)
            .map(|(_, value)| value.as_slice())
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|value| std::str::from_utf8(value).ok())
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn read_u32(&mut self) -> Result<u32> {
        let end = self
            .pos
            .checked_add(4)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| EngineError::invalid("truncated tag frame"))?;
        let raw: [u8; 4] = self.bytes[self.pos..end]
            .try_into()
            .expect("slice is exactly four bytes");
        self.pos = end;
        Ok(u32::from_le_bytes(raw))
    }

    fn read_chunk(&mut self) -> Result<&'a [u8]> {
        let len = self.read_u32()? as usize;
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| EngineError::invalid("truncated tag frame"))?;
        let chunk = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(chunk)
    }
}
