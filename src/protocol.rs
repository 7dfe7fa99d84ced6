//! Shared protocol constants and messages for the control and transfer channels

use anyhow::Result;
use rmpv::Value;
use std::net::Ipv4Addr;

use crate::checksum::BlockChecksum;
use crate::codec::{FrameBuilder, FrameError, FrameFields, WireMessage};
use crate::index::{FileIndex, FileRecord, Timestamp};

/// Announced in discovery; peers on other versions are ignored
pub const VERSION: u32 = 0;

/// Control channel (TCP)
pub const DEFAULT_PORT: u16 = 5555;
/// Per-file transfer connections (TCP)
pub const DEFAULT_TRANSFER_PORT: u16 = 5556;
/// Discovery broadcasts (UDP)
pub const DEFAULT_DISCOVERY_PORT: u16 = 5555;
pub const BROADCAST_ADDRESS: Ipv4Addr = Ipv4Addr::BROADCAST;

pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Raw peer id written before the first frame on every TCP connection
pub const UUID_BYTE_LENGTH: usize = 16;

pub const INDEX_FILE_NAME: &str = ".syncall_index";
pub const TEMP_DIR_NAME: &str = ".syncall_temp";

pub const RECV_BUFFER_SIZE: usize = 64 * 1024;
/// Soft cap on delta bytes carried by one BLOCK_DATA frame
pub const MAX_BLOCK_DATA_BYTES: usize = 256 * 1024;

// Control channel message types
pub mod control {
    pub const INDEX: u8 = 1;
    pub const REQUEST_INDEX: u8 = 2;
    pub const INDEX_DELTA: u8 = 3;
    pub const INDEX_NO_CHANGE: u8 = 4;
}

// Transfer channel message types
pub mod transfer {
    pub const INIT: u8 = 0;
    pub const INIT_ACCEPT: u8 = 1;
    pub const CANCEL: u8 = 2;
    pub const BLOCK_DATA: u8 = 3;
    pub const DONE: u8 = 4;
    pub const DONE_ACCEPT: u8 = 5;
}

pub mod timeouts {
    // Outbound connect (control and transfer) (ms)
    pub const CONNECT_MS: u64 = 5_000;

    // Reading the 16-byte handshake on an accepted connection (ms)
    pub const HANDSHAKE_MS: u64 = 5_000;

    // A peer that stops reading fails our writes after this (ms)
    pub const WRITE_MS: u64 = 30_000;

    // How often blocking accept/recv loops check for shutdown (ms)
    pub const POLL_MS: u64 = 200;
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    Index(FileIndex),
    RequestIndex,
    IndexDelta(FileIndex),
    IndexNoChange,
}

impl WireMessage for ControlMessage {
    fn to_value(&self) -> Result<Value> {
        Ok(match self {
            Self::Index(index) => FrameBuilder::new(control::INDEX)
                .serde_field("index", index)?
                .build(),
            Self::RequestIndex => FrameBuilder::new(control::REQUEST_INDEX).build(),
            Self::IndexDelta(records) => FrameBuilder::new(control::INDEX_DELTA)
                .serde_field("index", records)?
                .build(),
            Self::IndexNoChange => FrameBuilder::new(control::INDEX_NO_CHANGE).build(),
        })
    }

    fn from_value(value: Value) -> Result<Self, FrameError> {
        let (tag, mut fields) = FrameFields::parse(value)?;
        match u8::try_from(tag) {
            Ok(control::INDEX) => Ok(Self::Index(fields.serde("index")?)),
            Ok(control::REQUEST_INDEX) => Ok(Self::RequestIndex),
            Ok(control::INDEX_DELTA) => Ok(Self::IndexDelta(fields.serde("index")?)),
            Ok(control::INDEX_NO_CHANGE) => Ok(Self::IndexNoChange),
            _ => Err(FrameError::UnknownType(tag)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransferMessage {
    Init {
        file_name: String,
        record: FileRecord,
    },
    InitAccept {
        block_size: u32,
        checksums: Vec<BlockChecksum>,
    },
    Cancel,
    /// bincode-packed batch of delta ops
    BlockData(Vec<u8>),
    Done,
    DoneAccept {
        timestamp: Timestamp,
    },
}

impl WireMessage for TransferMessage {
    fn to_value(&self) -> Result<Value> {
        Ok(match self {
            Self::Init { file_name, record } => FrameBuilder::new(transfer::INIT)
                .field("file_name", file_name.as_str())
                .serde_field("file_data", record)?
                .build(),
            Self::InitAccept {
                block_size,
                checksums,
            } => FrameBuilder::new(transfer::INIT_ACCEPT)
                .field("block_size", *block_size)
                .serde_field("checksums", checksums)?
                .build(),
            Self::Cancel => FrameBuilder::new(transfer::CANCEL).build(),
            Self::BlockData(data) => FrameBuilder::new(transfer::BLOCK_DATA)
                .field("binary_data", data.clone())
                .build(),
            Self::Done => FrameBuilder::new(transfer::DONE).build(),
            Self::DoneAccept { timestamp } => FrameBuilder::new(transfer::DONE_ACCEPT)
                .field("timestamp", *timestamp)
                .build(),
        })
    }

    fn from_value(value: Value) -> Result<Self, FrameError> {
        let (tag, mut fields) = FrameFields::parse(value)?;
        match u8::try_from(tag) {
            Ok(transfer::INIT) => Ok(Self::Init {
                file_name: fields.string("file_name")?,
                record: fields.serde("file_data")?,
            }),
            Ok(transfer::INIT_ACCEPT) => {
                let block_size = u32::try_from(fields.u64("block_size")?)
                    .map_err(|_| FrameError::Malformed("block_size out of range".into()))?;
                Ok(Self::InitAccept {
                    block_size,
                    checksums: fields.serde("checksums")?,
                })
            }
            Ok(transfer::CANCEL) => Ok(Self::Cancel),
            Ok(transfer::BLOCK_DATA) => Ok(Self::BlockData(fields.binary("binary_data")?)),
            Ok(transfer::DONE) => Ok(Self::Done),
            Ok(transfer::DONE_ACCEPT) => Ok(Self::DoneAccept {
                timestamp: fields.i64("timestamp")?,
            }),
            _ => Err(FrameError::UnknownType(tag)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode_frame, FrameDecoder};
    use crate::hash::Digest;
    use crate::identity::PeerId;

    fn decode<M: WireMessage>(bytes: &[u8]) -> Result<M, FrameError> {
        let mut decoder = FrameDecoder::new();
        decoder.feed(bytes);
        M::from_value(decoder.next_value().unwrap().unwrap())
    }

    #[test]
    fn test_type_tags_on_the_wire() {
        let bytes = encode_frame(&ControlMessage::IndexNoChange).unwrap();
        let mut decoder = FrameDecoder::new();
        decoder.feed(&bytes);
        let (tag, _) = FrameFields::parse(decoder.next_value().unwrap().unwrap()).unwrap();
        assert_eq!(tag, 4);

        let bytes = encode_frame(&TransferMessage::DoneAccept { timestamp: 9 }).unwrap();
        decoder.feed(&bytes);
        let (tag, _) = FrameFields::parse(decoder.next_value().unwrap().unwrap()).unwrap();
        assert_eq!(tag, 5);
    }

    #[test]
    fn test_index_message_carries_records() {
        let peer = PeerId::from_u128(1);
        let index = FileIndex::from([(
            "docs/a.txt".to_string(),
            FileRecord::new_local(peer, Digest::of(b"a"), 42),
        )]);

        let bytes = encode_frame(&ControlMessage::Index(index.clone())).unwrap();
        assert_eq!(decode::<ControlMessage>(&bytes).unwrap(), ControlMessage::Index(index));
    }

    #[test]
    fn test_init_and_block_data() {
        let record = FileRecord::new_local(PeerId::from_u128(2), Digest::of(b"x"), 7);
        let init = TransferMessage::Init {
            file_name: "x.bin".into(),
            record,
        };
        assert_eq!(decode::<TransferMessage>(&encode_frame(&init).unwrap()).unwrap(), init);

        let data = TransferMessage::BlockData(vec![0, 1, 2, 255]);
        assert_eq!(decode::<TransferMessage>(&encode_frame(&data).unwrap()).unwrap(), data);
    }

    #[test]
    fn test_unknown_type() {
        assert!(matches!(
            ControlMessage::from_value(FrameBuilder::new(9).build()),
            Err(FrameError::UnknownType(9))
        ));
        assert!(matches!(
            TransferMessage::from_value(FrameBuilder::new(6).build()),
            Err(FrameError::UnknownType(6))
        ));
    }
}
