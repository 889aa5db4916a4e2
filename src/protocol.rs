/*
 * Copyright 2020 Joyent, Inc.
 */

//! Record framing for the data-access wire protocol.
//!
//! Every record is self-delimited so a truncated reply is detectable by the
//! peer rather than read as corrupt data:
//!
//! * VERSION   1-byte integer, the framing version (currently 1)
//! * KIND      2-byte big-endian record kind (see [`RecordKind`])
//! * CRC       4-byte big-endian CRC-16/ARC of the payload
//! * DLEN      4-byte big-endian payload length in bytes
//! * DATA      JSON-encoded payload
//!
//! Record kinds keep the numeric identities of the protocol so older clients
//! continue to interoperate.

use std::io;
use std::str;

use byteorder::{BigEndian, ByteOrder};
use bytes::{Buf, BufMut, BytesMut};
use crc16::{State, ARC};
use num::{FromPrimitive, ToPrimitive};
use num_derive::{FromPrimitive, ToPrimitive};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

const RP_OFF_KIND: usize = 0x1;
const RP_OFF_CRC: usize = 0x3;
const RP_OFF_DATALEN: usize = 0x7;
const RP_OFF_DATA: usize = 0xb;

pub const RP_HEADER_SZ: usize = RP_OFF_DATA;

const RP_VERSION_1: u8 = 0x1;
const RP_VERSION_CURRENT: u8 = RP_VERSION_1;

/// Default upper bound on a single record payload.
pub const DEFAULT_MAX_RECORD_SIZE: usize = 256 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive, ToPrimitive)]
pub enum RecordKind {
    RequestBlock = 1,
    DataBlockList = 2,
    NextProtocol = 3,
    DataSystem = 4,
    SystemConfig = 5,
    DataSource = 6,
    Signal = 7,
    SignalDesc = 8,
    ClientBlock = 10,
    ServerBlock = 11,
    Closedown = 13,
    Sleep = 14,
    WakeUp = 15,
    PutDataBlockList = 16,
    SerialiseFile = 20,
    Structures = 101,
    Meta = 102,
    Efit = 103,
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("not enough bytes to parse a record: {0} available")]
    NotEnoughBytes(usize),

    #[error("unsupported framing version {0}")]
    UnsupportedVersion(u8),

    #[error("unknown record kind {0}")]
    UnknownKind(u16),

    #[error("calculated CRC {calculated} does not match the provided CRC {expected}")]
    CrcMismatch { expected: u32, calculated: u32 },

    #[error("record payload of {size} bytes exceeds the {max} byte limit")]
    TooLarge { size: usize, max: usize },

    #[error("failed to parse record payload as UTF-8")]
    Utf8(#[from] str::Utf8Error),

    #[error("record payload error: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("{0:?} is not a valid next-protocol instruction")]
    BadInstruction(Value),

    #[error(transparent)]
    Io(#[from] io::Error),
}

struct RecordHeader {
    kind: RecordKind,
    crc: u32,
    data_len: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub kind: RecordKind,
    pub payload: Value,
}

impl Record {
    pub fn new<T: Serialize>(
        kind: RecordKind,
        body: &T,
    ) -> Result<Record, ProtocolError> {
        Ok(Record {
            kind,
            payload: serde_json::to_value(body)?,
        })
    }

    /// A "next protocol" record naming the record kind the sender wants next,
    /// or one of the session instructions (closedown, sleep, wake up).
    pub fn next(kind: RecordKind) -> Record {
        let id = ToPrimitive::to_u16(&kind).unwrap_or(0);
        Record {
            kind: RecordKind::NextProtocol,
            payload: Value::from(id),
        }
    }

    pub fn body<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    /// The kind carried by a next-protocol record.
    pub fn next_kind(&self) -> Result<RecordKind, ProtocolError> {
        self.payload
            .as_u64()
            .and_then(FromPrimitive::from_u64)
            .ok_or_else(|| ProtocolError::BadInstruction(self.payload.clone()))
    }

    /// Parse one record from the front of `buf`, returning it with the number
    /// of bytes it occupied.
    pub fn parse(
        buf: &[u8],
        max_size: usize,
    ) -> Result<(Record, usize), ProtocolError> {
        Record::check_buffer_size(buf)?;
        let header = Record::parse_header(buf, max_size)?;

        Record::validate_data_length(buf, header.data_len)?;
        let raw_data = &buf[RP_OFF_DATA..RP_OFF_DATA + header.data_len];
        Record::validate_crc(raw_data, header.crc)?;
        let payload = Record::parse_data(raw_data)?;

        Ok((
            Record {
                kind: header.kind,
                payload,
            },
            RP_HEADER_SZ + header.data_len,
        ))
    }

    fn check_buffer_size(buf: &[u8]) -> Result<(), ProtocolError> {
        if buf.len() < RP_HEADER_SZ {
            Err(ProtocolError::NotEnoughBytes(buf.len()))
        } else {
            Ok(())
        }
    }

    fn parse_header(
        buf: &[u8],
        max_size: usize,
    ) -> Result<RecordHeader, ProtocolError> {
        if buf[0] != RP_VERSION_CURRENT {
            return Err(ProtocolError::UnsupportedVersion(buf[0]));
        }
        let kind_id = BigEndian::read_u16(&buf[RP_OFF_KIND..RP_OFF_KIND + 2]);
        let kind = FromPrimitive::from_u16(kind_id)
            .ok_or(ProtocolError::UnknownKind(kind_id))?;
        let crc = BigEndian::read_u32(&buf[RP_OFF_CRC..RP_OFF_CRC + 4]);
        let data_len =
            BigEndian::read_u32(&buf[RP_OFF_DATALEN..RP_OFF_DATALEN + 4])
                as usize;
        if data_len > max_size {
            return Err(ProtocolError::TooLarge {
                size: data_len,
                max: max_size,
            });
        }

        Ok(RecordHeader {
            kind,
            crc,
            data_len,
        })
    }

    fn validate_data_length(
        buf: &[u8],
        data_length: usize,
    ) -> Result<(), ProtocolError> {
        if buf.len() < (RP_HEADER_SZ + data_length) {
            Err(ProtocolError::NotEnoughBytes(buf.len()))
        } else {
            Ok(())
        }
    }

    fn validate_crc(data_buf: &[u8], crc: u32) -> Result<(), ProtocolError> {
        let calculated = u32::from(State::<ARC>::calculate(data_buf));
        if crc != calculated {
            Err(ProtocolError::CrcMismatch {
                expected: crc,
                calculated,
            })
        } else {
            Ok(())
        }
    }

    fn parse_data(data_buf: &[u8]) -> Result<Value, ProtocolError> {
        let data_str = str::from_utf8(data_buf)?;
        Ok(serde_json::from_str(data_str)?)
    }
}

/// Append the framed encoding of `record` to `buf`.
pub fn encode_record(
    record: &Record,
    buf: &mut BytesMut,
) -> Result<(), ProtocolError> {
    let kind_id = ToPrimitive::to_u16(&record.kind)
        .ok_or(ProtocolError::UnknownKind(0))?;
    let data = serde_json::to_vec(&record.payload)?;
    let data_len = data.len();
    if data_len > u32::MAX as usize {
        return Err(ProtocolError::TooLarge {
            size: data_len,
            max: u32::MAX as usize,
        });
    }

    buf.reserve(RP_HEADER_SZ + data_len);
    buf.put_u8(RP_VERSION_CURRENT);
    buf.put_u16(kind_id);
    buf.put_u32(u32::from(State::<ARC>::calculate(&data)));
    buf.put_u32(data_len as u32);
    buf.put_slice(&data);
    Ok(())
}

pub struct RecordCodec {
    max_record_size: usize,
}

impl RecordCodec {
    pub fn new(max_record_size: usize) -> RecordCodec {
        RecordCodec { max_record_size }
    }
}

impl Default for RecordCodec {
    fn default() -> RecordCodec {
        RecordCodec::new(DEFAULT_MAX_RECORD_SIZE)
    }
}

impl Decoder for RecordCodec {
    type Item = Record;
    type Error = ProtocolError;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Record>, ProtocolError> {
        match Record::parse(buf, self.max_record_size) {
            Ok((record, used)) => {
                buf.advance(used);
                Ok(Some(record))
            }
            Err(ProtocolError::NotEnoughBytes(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl Encoder<Record> for RecordCodec {
    type Error = ProtocolError;

    fn encode(
        &mut self,
        item: Record,
        buf: &mut BytesMut,
    ) -> Result<(), ProtocolError> {
        encode_record(&item, buf)
    }
}
