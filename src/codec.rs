//! Frame encoding shared by the control and transfer channels
//!
//! A frame is one MessagePack map with an integer `type` entry; frames are
//! written back-to-back with no extra length prefix since MessagePack is
//! self-delimiting. [`FrameDecoder`] takes arbitrary-sized reads and yields
//! every complete frame buffered so far.

use anyhow::{anyhow, Result};
use rmpv::Value;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{Cursor, ErrorKind};

const TYPE_KEY: &str = "type";

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// Structurally valid MessagePack that is not a valid message. Only
    /// this frame is lost.
    #[error("malformed frame: {0}")]
    Malformed(String),
    /// The peer speaks a message we do not know; the connection is dropped
    #[error("unknown message type {0}")]
    UnknownType(u64),
}

/// A message that can travel as one frame
pub trait WireMessage: Sized + Send + 'static {
    fn to_value(&self) -> Result<Value>;
    fn from_value(value: Value) -> Result<Self, FrameError>;
}

pub fn encode_frame<M: WireMessage>(message: &M) -> Result<Vec<u8>> {
    let value = message.to_value()?;
    let mut buf = Vec::new();
    rmpv::encode::write_value(&mut buf, &value)
        .map_err(|e| anyhow!("failed to encode frame: {e:?}"))?;
    Ok(buf)
}

/// Builds the map for one outgoing frame
pub struct FrameBuilder {
    entries: Vec<(Value, Value)>,
}

impl FrameBuilder {
    pub fn new(type_tag: u8) -> Self {
        Self {
            entries: vec![(Value::from(TYPE_KEY), Value::from(type_tag))],
        }
    }

    pub fn field(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.entries.push((Value::from(name), value.into()));
        self
    }

    pub fn serde_field<T: Serialize>(self, name: &str, value: &T) -> Result<Self> {
        let value = rmpv::ext::to_value(value)
            .map_err(|e| anyhow!("failed to encode field {name}: {e}"))?;
        Ok(self.field(name, value))
    }

    pub fn build(self) -> Value {
        Value::Map(self.entries)
    }
}

/// Fields of one incoming frame, after the `type` tag was split off
pub struct FrameFields {
    entries: Vec<(Value, Value)>,
}

impl FrameFields {
    /// Split a decoded value into its type tag and remaining fields
    pub fn parse(value: Value) -> Result<(u64, Self), FrameError> {
        let Value::Map(entries) = value else {
            return Err(FrameError::Malformed("frame is not a map".into()));
        };
        let mut fields = Self { entries };
        let tag = fields
            .take(TYPE_KEY)?
            .as_u64()
            .ok_or_else(|| FrameError::Malformed("type is not an integer".into()))?;
        Ok((tag, fields))
    }

    fn take(&mut self, name: &str) -> Result<Value, FrameError> {
        let pos = self
            .entries
            .iter()
            .position(|(k, _)| k.as_str() == Some(name))
            .ok_or_else(|| FrameError::Malformed(format!("missing field {name}")))?;
        Ok(self.entries.swap_remove(pos).1)
    }

    pub fn string(&mut self, name: &str) -> Result<String, FrameError> {
        match self.take(name)? {
            Value::String(s) => s
                .into_str()
                .ok_or_else(|| FrameError::Malformed(format!("field {name} is not valid UTF-8"))),
            _ => Err(FrameError::Malformed(format!("field {name} is not a string"))),
        }
    }

    pub fn u64(&mut self, name: &str) -> Result<u64, FrameError> {
        self.take(name)?
            .as_u64()
            .ok_or_else(|| FrameError::Malformed(format!("field {name} is not an unsigned integer")))
    }

    pub fn i64(&mut self, name: &str) -> Result<i64, FrameError> {
        self.take(name)?
            .as_i64()
            .ok_or_else(|| FrameError::Malformed(format!("field {name} is not an integer")))
    }

    pub fn binary(&mut self, name: &str) -> Result<Vec<u8>, FrameError> {
        match self.take(name)? {
            Value::Binary(data) => Ok(data),
            _ => Err(FrameError::Malformed(format!("field {name} is not binary"))),
        }
    }

    pub fn serde<T: DeserializeOwned>(&mut self, name: &str) -> Result<T, FrameError> {
        rmpv::ext::from_value(self.take(name)?)
            .map_err(|e| FrameError::Malformed(format!("field {name}: {e}")))
    }
}

/// Incremental frame decoder fed with raw socket reads
#[derive(Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Next complete frame, or `None` until more bytes arrive.
    ///
    /// An error means the byte stream itself is corrupt and cannot be
    /// resynchronized.
    pub fn next_value(&mut self) -> Result<Option<Value>> {
        if self.buffer.is_empty() {
            return Ok(None);
        }

        let mut cursor = Cursor::new(&self.buffer[..]);
        match rmpv::decode::read_value(&mut cursor) {
            Ok(value) => {
                let used = cursor.position() as usize;
                self.buffer.drain(..used);
                Ok(Some(value))
            }
            Err(
                rmpv::decode::Error::InvalidMarkerRead(e) | rmpv::decode::Error::InvalidDataRead(e),
            ) if e.kind() == ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(anyhow!("undecodable byte stream: {e}")),
        }
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}
