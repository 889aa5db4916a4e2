/*
 * Copyright 2020 Joyent, Inc.
 */

//! Element types, dimension descriptors and the Data Block.
//!
//! Numeric buffers are little-endian byte vectors tagged with a [`DataType`].
//! A [`DataBlock`] owns every buffer attached to it, so dropping the block
//! releases all of them at once; blocks created against a [`BlockLedger`]
//! also report their creation and release so a session can verify that no
//! block outlives its request cycle.

use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use num_derive::{FromPrimitive, ToPrimitive};
use serde_derive::{Deserialize, Serialize};
use serde_json::Value;

use crate::protocol::{ProtocolError, Record, RecordKind};

/// Protocol version that introduced native string data.
pub const STRING_VERSION: i32 = 6;
/// Protocol version that introduced serialised-object (capnp) data.
pub const CAPNP_VERSION: i32 = 9;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    FromPrimitive,
    ToPrimitive,
    Serialize,
    Deserialize,
)]
pub enum DataType {
    Unknown = 0,
    Char = 1,
    Short = 2,
    Int = 3,
    UnsignedInt = 4,
    Long = 5,
    Float = 6,
    Double = 7,
    UnsignedChar = 8,
    UnsignedShort = 9,
    UnsignedLong = 10,
    Long64 = 11,
    UnsignedLong64 = 12,
    Complex = 13,
    DComplex = 14,
    Undefined = 15,
    Vlen = 16,
    String = 17,
    Compound = 18,
    Opaque = 19,
    Enum = 20,
    String2 = 21,
    Void = 22,
    Capnp = 23,
}

impl Default for DataType {
    fn default() -> DataType {
        DataType::Unknown
    }
}

impl DataType {
    /// Size in bytes of one element, or zero for types without a fixed size.
    pub fn size_of(self) -> usize {
        match self {
            DataType::Char | DataType::UnsignedChar | DataType::String => 1,
            DataType::Capnp => 1,
            DataType::Short | DataType::UnsignedShort => 2,
            DataType::Int | DataType::UnsignedInt | DataType::Float => 4,
            DataType::Long | DataType::UnsignedLong => 8,
            DataType::Long64 | DataType::UnsignedLong64 => 8,
            DataType::Double | DataType::Complex => 8,
            DataType::DComplex => 16,
            _ => 0,
        }
    }

    /// Lowest protocol version able to carry this type.
    pub fn introduced_in(self) -> i32 {
        match self {
            DataType::UnsignedChar
            | DataType::UnsignedShort
            | DataType::UnsignedLong
            | DataType::Long64
            | DataType::UnsignedLong64
            | DataType::Complex
            | DataType::DComplex => 3,
            DataType::Compound => 4,
            DataType::String => STRING_VERSION,
            _ => 0,
        }
    }

    /// The representation sent to a client that negotiated `version`.
    pub fn downgrade(self, version: i32) -> DataType {
        match self {
            DataType::String if version < STRING_VERSION => DataType::Char,
            DataType::Capnp if version < CAPNP_VERSION => {
                DataType::UnsignedChar
            }
            t => t,
        }
    }
}

/// Whether a session at `version` can decode `data_type`.
pub fn protocol_version_type_test(version: i32, data_type: DataType) -> bool {
    version >= data_type.introduced_in()
}

/// Decode a little-endian buffer of `data_type` elements as doubles. Returns
/// `None` for types without a numeric scalar representation.
pub fn decode_f64(data_type: DataType, buf: &[u8]) -> Option<Vec<f64>> {
    let size = data_type.size_of();
    if size == 0 || buf.len() % size != 0 {
        return None;
    }
    let values = buf.chunks_exact(size);
    let out = match data_type {
        DataType::Char => values.map(|c| f64::from(c[0] as i8)).collect(),
        DataType::UnsignedChar => values.map(|c| f64::from(c[0])).collect(),
        DataType::Short => {
            values.map(|c| f64::from(LittleEndian::read_i16(c))).collect()
        }
        DataType::UnsignedShort => {
            values.map(|c| f64::from(LittleEndian::read_u16(c))).collect()
        }
        DataType::Int => {
            values.map(|c| f64::from(LittleEndian::read_i32(c))).collect()
        }
        DataType::UnsignedInt => {
            values.map(|c| f64::from(LittleEndian::read_u32(c))).collect()
        }
        DataType::Long | DataType::Long64 => {
            values.map(|c| LittleEndian::read_i64(c) as f64).collect()
        }
        DataType::UnsignedLong | DataType::UnsignedLong64 => {
            values.map(|c| LittleEndian::read_u64(c) as f64).collect()
        }
        DataType::Float => {
            values.map(|c| f64::from(LittleEndian::read_f32(c))).collect()
        }
        DataType::Double => values.map(LittleEndian::read_f64).collect(),
        _ => return None,
    };
    Some(out)
}

pub fn encode_f64(values: &[f64]) -> Vec<u8> {
    let mut buf = vec![0; values.len() * 8];
    LittleEndian::write_f64_into(values, &mut buf);
    buf
}

/// Compressed representation of a dimension's coordinate values. The value
/// buffers are typed by the owning [`Dim`]'s `data_type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DimCompression {
    None,
    /// `start + k * step` for every index `k`.
    Regular { start: f64, step: f64 },
    /// Domain `i` holds `sams[i]` samples starting at `offs[i]` spaced by
    /// `ints[i]`.
    Domains {
        sams: Vec<u32>,
        offs: Vec<u8>,
        ints: Vec<u8>,
    },
    /// One explicit value per domain.
    Offsets { offs: Vec<u8> },
    /// `offs + i * ints` for each of `udoms` domains.
    Periodic {
        offs: Vec<u8>,
        ints: Vec<u8>,
        udoms: usize,
    },
}

impl Default for DimCompression {
    fn default() -> DimCompression {
        DimCompression::None
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dim {
    pub data_type: DataType,
    pub dim_n: usize,
    /// Uncompressed coordinates; empty when `compression` is not `None`.
    pub data: Vec<u8>,
    pub compression: DimCompression,
    pub error_type: DataType,
    pub errhi: Vec<u8>,
    pub errlo: Vec<u8>,
    pub label: String,
    pub units: String,
}

impl Dim {
    pub fn regular(dim_n: usize, start: f64, step: f64) -> Dim {
        Dim {
            data_type: DataType::Float,
            dim_n,
            compression: DimCompression::Regular { start, step },
            ..Dim::default()
        }
    }

    pub fn is_compressed(&self) -> bool {
        self.compression != DimCompression::None
    }

    fn byte_len(&self) -> usize {
        let compressed = match &self.compression {
            DimCompression::None | DimCompression::Regular { .. } => 0,
            DimCompression::Domains { sams, offs, ints } => {
                sams.len() * 4 + offs.len() + ints.len()
            }
            DimCompression::Offsets { offs } => offs.len(),
            DimCompression::Periodic { offs, ints, .. } => {
                offs.len() + ints.len()
            }
        };
        self.data.len() + self.errhi.len() + self.errlo.len() + compressed
    }
}

/// Secondary payload attached to a Data Block. The variant selects the extra
/// record sent after the block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OpaquePayload {
    None,
    XmlDocument(String),
    Structures(Value),
    XdrFile(Vec<u8>),
    /// Blob for a named legacy domain reader.
    Legacy { domain: String, bytes: Vec<u8> },
}

impl Default for OpaquePayload {
    fn default() -> OpaquePayload {
        OpaquePayload::None
    }
}

/// Wire tag announcing which opaque payload, if any, follows a Data Block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpaqueTag {
    None,
    XmlDocument,
    Structures,
    XdrFile,
    Legacy,
}

impl Default for OpaqueTag {
    fn default() -> OpaqueTag {
        OpaqueTag::None
    }
}

impl OpaquePayload {
    pub fn is_none(&self) -> bool {
        *self == OpaquePayload::None
    }

    pub fn tag(&self) -> OpaqueTag {
        match self {
            OpaquePayload::None => OpaqueTag::None,
            OpaquePayload::XmlDocument(_) => OpaqueTag::XmlDocument,
            OpaquePayload::Structures(_) => OpaqueTag::Structures,
            OpaquePayload::XdrFile(_) => OpaqueTag::XdrFile,
            OpaquePayload::Legacy { .. } => OpaqueTag::Legacy,
        }
    }

    /// Record kind carrying this payload on the wire. The legacy kind set has
    /// no generic structure carrier, so that variant has no kind there.
    pub fn record_kind(&self, legacy: bool) -> Option<RecordKind> {
        match (self, legacy) {
            (OpaquePayload::None, _) => None,
            (OpaquePayload::XmlDocument(_), _) => Some(RecordKind::Meta),
            (OpaquePayload::Structures(_), false) => Some(RecordKind::Structures),
            (OpaquePayload::Structures(_), true) => None,
            (OpaquePayload::XdrFile(_), false) => Some(RecordKind::SerialiseFile),
            (OpaquePayload::XdrFile(_), true) => Some(RecordKind::Structures),
            (OpaquePayload::Legacy { .. }, _) => Some(RecordKind::Efit),
        }
    }

    pub fn to_record(&self, legacy: bool) -> Result<Option<Record>, ProtocolError> {
        let kind = match self.record_kind(legacy) {
            Some(kind) => kind,
            None => return Ok(None),
        };
        let record = match self {
            OpaquePayload::XmlDocument(doc) => Record::new(kind, doc)?,
            OpaquePayload::Structures(value) => Record::new(kind, value)?,
            OpaquePayload::XdrFile(bytes) => Record::new(kind, bytes)?,
            OpaquePayload::Legacy { domain, bytes } => Record::new(
                kind,
                &LegacyBlob {
                    domain: domain.clone(),
                    bytes: bytes.clone(),
                },
            )?,
            OpaquePayload::None => return Ok(None),
        };
        Ok(Some(record))
    }

    /// Rebuild the payload announced by `tag` from the record that carried it.
    pub fn from_record(
        tag: OpaqueTag,
        record: &Record,
    ) -> Result<OpaquePayload, ProtocolError> {
        Ok(match tag {
            OpaqueTag::None => OpaquePayload::None,
            OpaqueTag::XmlDocument => OpaquePayload::XmlDocument(record.body()?),
            OpaqueTag::Structures => {
                OpaquePayload::Structures(record.payload.clone())
            }
            OpaqueTag::XdrFile => OpaquePayload::XdrFile(record.body()?),
            OpaqueTag::Legacy => {
                let blob: LegacyBlob = record.body()?;
                OpaquePayload::Legacy {
                    domain: blob.domain,
                    bytes: blob.bytes,
                }
            }
        })
    }

    fn byte_len(&self) -> usize {
        match self {
            OpaquePayload::None => 0,
            OpaquePayload::XmlDocument(s) => s.len(),
            OpaquePayload::Structures(v) => v.to_string().len(),
            OpaquePayload::XdrFile(b) => b.len(),
            OpaquePayload::Legacy { bytes, .. } => bytes.len(),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct LegacyBlob {
    domain: String,
    bytes: Vec<u8>,
}

#[derive(Debug, Default)]
struct LedgerCounts {
    created: AtomicUsize,
    freed: AtomicUsize,
}

/// Counts Data Blocks created and released against it.
#[derive(Debug, Clone, Default)]
pub struct BlockLedger {
    counts: Arc<LedgerCounts>,
}

impl BlockLedger {
    pub fn new() -> BlockLedger {
        BlockLedger::default()
    }

    pub fn created(&self) -> usize {
        self.counts.created.load(Ordering::SeqCst)
    }

    pub fn freed(&self) -> usize {
        self.counts.freed.load(Ordering::SeqCst)
    }

    pub fn outstanding(&self) -> usize {
        self.created().saturating_sub(self.freed())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct DataBlock {
    pub rank: usize,
    /// Index of the ordering (time) dimension, or -1.
    pub order: i32,
    pub data_type: DataType,
    pub data_n: usize,
    pub data: Vec<u8>,
    pub error_type: DataType,
    pub errasymmetry: bool,
    pub errhi: Vec<u8>,
    pub errlo: Vec<u8>,
    pub dims: Vec<Dim>,
    /// Sent as a separate record after the block itself.
    #[serde(skip)]
    opaque: OpaquePayload,
    opaque_type: OpaqueTag,
    pub data_label: String,
    pub data_units: String,
    pub data_desc: String,
    #[serde(skip)]
    ledger: Option<BlockLedger>,
}

impl DataBlock {
    /// An empty block whose lifetime is reported to `ledger`.
    pub fn tracked(ledger: &BlockLedger) -> DataBlock {
        ledger.counts.created.fetch_add(1, Ordering::SeqCst);
        let mut block = DataBlock::default();
        block.order = -1;
        block.ledger = Some(ledger.clone());
        block
    }

    pub fn opaque(&self) -> &OpaquePayload {
        &self.opaque
    }

    pub fn opaque_type(&self) -> OpaqueTag {
        self.opaque_type
    }

    pub fn set_opaque(&mut self, payload: OpaquePayload) {
        self.opaque_type = payload.tag();
        self.opaque = payload;
    }

    /// Move the contents of `other` into this block, leaving `other` empty.
    /// The ledger of each block is untouched.
    pub fn adopt(&mut self, other: &mut DataBlock) {
        self.rank = other.rank;
        self.order = other.order;
        self.data_type = other.data_type;
        self.data_n = other.data_n;
        self.data = mem::take(&mut other.data);
        self.error_type = other.error_type;
        self.errasymmetry = other.errasymmetry;
        self.errhi = mem::take(&mut other.errhi);
        self.errlo = mem::take(&mut other.errlo);
        self.dims = mem::take(&mut other.dims);
        let opaque = mem::take(&mut other.opaque);
        self.set_opaque(opaque);
        other.opaque_type = OpaqueTag::None;
        self.data_label = mem::take(&mut other.data_label);
        self.data_units = mem::take(&mut other.data_units);
        self.data_desc = mem::take(&mut other.data_desc);
    }

    /// Fill the block with text, sent as string data.
    pub fn set_text(&mut self, text: &str) {
        self.set_bytes(text.as_bytes().to_vec());
        self.data_type = DataType::String;
    }

    pub fn set_scalar_i32(&mut self, value: i32) {
        let mut buf = vec![0; 4];
        LittleEndian::write_i32(&mut buf, value);
        self.rank = 0;
        self.order = -1;
        self.data_type = DataType::Int;
        self.data_n = 1;
        self.data = buf;
        self.dims.clear();
    }

    pub fn set_scalar_i64(&mut self, value: i64) {
        let mut buf = vec![0; 8];
        LittleEndian::write_i64(&mut buf, value);
        self.rank = 0;
        self.order = -1;
        self.data_type = DataType::Long;
        self.data_n = 1;
        self.data = buf;
        self.dims.clear();
    }

    pub fn set_scalar_f64(&mut self, value: f64) {
        self.set_f64(&[value], Vec::new());
    }

    /// Fill the block with double data over `dims`.
    pub fn set_f64(&mut self, values: &[f64], dims: Vec<Dim>) {
        self.rank = dims.len();
        self.data_type = DataType::Double;
        self.data_n = values.len();
        self.data = encode_f64(values);
        self.dims = dims;
    }

    pub fn set_bytes(&mut self, bytes: Vec<u8>) {
        self.rank = 1;
        self.order = -1;
        self.data_type = DataType::Char;
        self.data_n = bytes.len();
        self.data = bytes;
        self.dims = vec![Dim {
            data_type: DataType::Int,
            dim_n: self.data_n,
            compression: DimCompression::Regular {
                start: 0.0,
                step: 1.0,
            },
            ..Dim::default()
        }];
    }

    /// Types that must pass the version gate before transmission.
    pub fn element_types(&self) -> Vec<DataType> {
        let mut types = vec![self.data_type];
        if !self.errhi.is_empty() || !self.errlo.is_empty() {
            types.push(self.error_type);
        }
        for dim in &self.dims {
            types.push(dim.data_type);
            if !dim.errhi.is_empty() || !dim.errlo.is_empty() {
                types.push(dim.error_type);
            }
        }
        types
    }

    /// Apply the per-version type downgrades in place.
    pub fn downgrade_types(&mut self, version: i32) {
        self.data_type = self.data_type.downgrade(version);
        self.error_type = self.error_type.downgrade(version);
        for dim in self.dims.iter_mut() {
            dim.data_type = dim.data_type.downgrade(version);
            dim.error_type = dim.error_type.downgrade(version);
        }
    }

    /// Approximate number of payload bytes a reply carrying this block sends.
    pub fn estimated_size(&self) -> usize {
        let dims: usize = self.dims.iter().map(Dim::byte_len).sum();
        self.data.len()
            + self.errhi.len()
            + self.errlo.len()
            + dims
            + self.opaque.byte_len()
    }
}

impl Drop for DataBlock {
    fn drop(&mut self) {
        if let Some(ledger) = self.ledger.take() {
            ledger.counts.freed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_gate_follows_introduction_version() {
        assert!(!protocol_version_type_test(2, DataType::UnsignedShort));
        assert!(protocol_version_type_test(3, DataType::UnsignedShort));
        assert!(!protocol_version_type_test(3, DataType::Compound));
        assert!(protocol_version_type_test(4, DataType::Compound));
        assert!(!protocol_version_type_test(5, DataType::String));
        assert!(protocol_version_type_test(6, DataType::String));
        assert!(protocol_version_type_test(1, DataType::Double));
    }

    #[test]
    fn strings_and_capnp_downgrade_for_old_sessions() {
        assert_eq!(DataType::String.downgrade(5), DataType::Char);
        assert_eq!(DataType::String.downgrade(6), DataType::String);
        assert_eq!(DataType::Capnp.downgrade(8), DataType::UnsignedChar);
        assert_eq!(DataType::Capnp.downgrade(9), DataType::Capnp);
    }

    #[test]
    fn ledger_counts_each_block_once() {
        let ledger = BlockLedger::new();
        {
            let _a = DataBlock::tracked(&ledger);
            let _b = DataBlock::tracked(&ledger);
            assert_eq!(ledger.outstanding(), 2);
        }
        assert_eq!(ledger.created(), 2);
        assert_eq!(ledger.freed(), 2);
    }

    #[test]
    fn decoded_blocks_are_not_counted() {
        let ledger = BlockLedger::new();
        let mut block = DataBlock::tracked(&ledger);
        block.set_scalar_f64(1.5);
        let wire = serde_json::to_value(&block).unwrap();
        let copy: DataBlock = serde_json::from_value(wire).unwrap();
        drop(copy);
        assert_eq!(ledger.freed(), 0);
        drop(block);
        assert_eq!(ledger.freed(), 1);
    }

    #[test]
    fn opaque_payload_travels_out_of_band() {
        let mut block = DataBlock::default();
        block.set_opaque(OpaquePayload::XmlDocument("<a/>".to_string()));
        assert_eq!(block.opaque_type(), OpaqueTag::XmlDocument);

        let wire = serde_json::to_value(&block).unwrap();
        let decoded: DataBlock = serde_json::from_value(wire).unwrap();
        assert_eq!(decoded.opaque_type(), OpaqueTag::XmlDocument);
        assert!(decoded.opaque().is_none());
    }

    #[test]
    fn legacy_sessions_have_no_structure_carrier() {
        let structures = OpaquePayload::Structures(serde_json::json!({"a": 1}));
        assert_eq!(structures.record_kind(false), Some(RecordKind::Structures));
        assert_eq!(structures.record_kind(true), None);

        let xdr = OpaquePayload::XdrFile(vec![9]);
        assert_eq!(xdr.record_kind(true), Some(RecordKind::Structures));
        assert_eq!(xdr.record_kind(false), Some(RecordKind::SerialiseFile));
    }

    #[test]
    fn legacy_blobs_rebuild_from_their_record() {
        let blob = OpaquePayload::Legacy {
            domain: "EFIT".to_string(),
            bytes: vec![1, 2, 3],
        };
        let record = blob.to_record(true).unwrap().unwrap();
        assert_eq!(record.kind, RecordKind::Efit);
        let back = OpaquePayload::from_record(OpaqueTag::Legacy, &record).unwrap();
        assert_eq!(back, blob);
    }

    #[test]
    fn adopt_moves_buffers_and_opaque_payload() {
        let mut source = DataBlock::default();
        source.set_f64(&[1.0, 2.0], vec![Dim::regular(2, 0.0, 0.5)]);
        source.set_opaque(OpaquePayload::XdrFile(vec![1, 2]));

        let mut target = DataBlock::default();
        target.adopt(&mut source);

        assert_eq!(target.rank, 1);
        assert_eq!(target.data_n, 2);
        assert_eq!(target.opaque_type(), OpaqueTag::XdrFile);
        assert!(source.data.is_empty());
        assert_eq!(source.opaque_type(), OpaqueTag::None);
    }

    #[test]
    fn f64_buffers_decode_by_type() {
        let mut shorts = vec![0; 4];
        LittleEndian::write_i16_into(&[-3, 7], &mut shorts);
        assert_eq!(
            decode_f64(DataType::Short, &shorts),
            Some(vec![-3.0, 7.0])
        );
        assert_eq!(decode_f64(DataType::Short, &shorts[..3]), None);
        assert_eq!(decode_f64(DataType::Compound, &shorts), None);
    }
}
