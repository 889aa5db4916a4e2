/*
 * Copyright 2020 Joyent, Inc.
 */

//! Descriptor, request and metadata blocks exchanged during a session.
//!
//! Sessions at or below the legacy threshold use the `Legacy*` layouts, which
//! predate the environment fields of the server descriptor and several of the
//! metadata fields. Conversions go in both directions so the engines can share
//! one in-memory form.

use serde_derive::{Deserialize, Serialize};

use crate::errors::ErrorStack;
use crate::types::DataType;

/// Client flag requesting that the server close the session immediately.
pub const CLIENTFLAG_CLOSEDOWN: u32 = 0x8;
pub const CLIENTFLAG_ALTDATA: u32 = 0x1;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientBlock {
    pub version: i32,
    /// Idle timeout in seconds. Zero asks for an immediate close.
    pub timeout: u64,
    pub uid: String,
    pub get_scalar: bool,
    pub get_timedble: bool,
    pub get_dimdble: bool,
    pub get_nodimdata: bool,
    pub get_meta: bool,
    pub client_flags: u32,
    pub private_flags: u32,
    pub alt_rank: i32,
}

impl ClientBlock {
    pub fn new(version: i32, timeout: u64) -> ClientBlock {
        ClientBlock {
            version,
            timeout,
            ..ClientBlock::default()
        }
    }

    pub fn wants_closedown(&self) -> bool {
        self.timeout == 0 || self.client_flags & CLIENTFLAG_CLOSEDOWN != 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LegacyClientBlock {
    pub version: i32,
    pub timeout: u64,
    pub uid: String,
    pub get_scalar: bool,
    pub get_timedble: bool,
    pub get_dimdble: bool,
    pub get_nodimdata: bool,
    pub get_meta: bool,
    pub client_flags: u32,
}

impl From<LegacyClientBlock> for ClientBlock {
    fn from(legacy: LegacyClientBlock) -> ClientBlock {
        ClientBlock {
            version: legacy.version,
            timeout: legacy.timeout,
            uid: legacy.uid,
            get_scalar: legacy.get_scalar,
            get_timedble: legacy.get_timedble,
            get_dimdble: legacy.get_dimdble,
            get_nodimdata: legacy.get_nodimdata,
            get_meta: legacy.get_meta,
            client_flags: legacy.client_flags,
            ..ClientBlock::default()
        }
    }
}

impl From<&ClientBlock> for LegacyClientBlock {
    fn from(client: &ClientBlock) -> LegacyClientBlock {
        LegacyClientBlock {
            version: client.version,
            timeout: client.timeout,
            uid: client.uid.clone(),
            get_scalar: client.get_scalar,
            get_timedble: client.get_timedble,
            get_dimdble: client.get_dimdble,
            get_nodimdata: client.get_nodimdata,
            get_meta: client.get_meta,
            client_flags: client.client_flags,
        }
    }
}

/// Status block returned ahead of every reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerBlock {
    pub version: i32,
    /// Canonical failure code, zero on success.
    pub error: i32,
    pub msg: String,
    pub errors: ErrorStack,
    pub os_name: String,
    pub config_id: String,
}

impl ServerBlock {
    pub fn new(version: i32, os_name: &str, config_id: &str) -> ServerBlock {
        ServerBlock {
            version,
            os_name: os_name.to_string(),
            config_id: config_id.to_string(),
            ..ServerBlock::default()
        }
    }

    /// Clear the per-request status, keeping the identity fields.
    pub fn reset(&mut self) {
        self.error = 0;
        self.msg.clear();
        self.errors.reset();
    }

    pub fn failed(&self) -> bool {
        self.error != 0 || !self.errors.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LegacyServerBlock {
    pub version: i32,
    pub error: i32,
    pub msg: String,
    pub errors: ErrorStack,
}

impl From<&ServerBlock> for LegacyServerBlock {
    fn from(server: &ServerBlock) -> LegacyServerBlock {
        LegacyServerBlock {
            version: server.version,
            error: server.error,
            msg: server.msg.clone(),
            errors: server.errors.clone(),
        }
    }
}

impl From<LegacyServerBlock> for ServerBlock {
    fn from(legacy: LegacyServerBlock) -> ServerBlock {
        ServerBlock {
            version: legacy.version,
            error: legacy.error,
            msg: legacy.msg,
            errors: legacy.errors,
            ..ServerBlock::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NameValue {
    pub name: String,
    pub value: String,
}

/// One dimension of a subset: `[start:stop:stride]`. A missing stop means
/// "to the end of the dimension".
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SubsetDim {
    pub start: usize,
    pub stop: Option<usize>,
    pub stride: usize,
}

impl SubsetDim {
    /// Number of elements selected from a dimension of length `len`.
    pub fn count(&self, len: usize) -> usize {
        let stop = self.stop.map_or(len, |s| s.min(len));
        if self.start >= stop || self.stride == 0 {
            0
        } else {
            (stop - self.start + self.stride - 1) / self.stride
        }
    }

    pub fn indices(&self, len: usize) -> impl Iterator<Item = usize> {
        let stop = self.stop.map_or(len, |s| s.min(len));
        (self.start..stop).step_by(self.stride.max(1))
    }
}

/// A block of data uploaded by the client with a put request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PutDataBlock {
    pub data_type: DataType,
    pub rank: usize,
    pub count: usize,
    pub shape: Vec<usize>,
    pub data: Vec<u8>,
    pub block_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestData {
    /// Resolved request id; zero until the dispatcher resolves it.
    pub request: i32,
    pub signal: String,
    pub source: String,
    pub archive: String,
    pub device: String,
    pub format: String,
    pub path: String,
    pub file: String,
    pub exp_number: i32,
    pub pass: i32,
    pub function: String,
    pub name_values: Vec<NameValue>,
    pub subset: Vec<SubsetDim>,
    pub put: bool,
    pub put_data: Vec<PutDataBlock>,
}

impl RequestData {
    pub fn new(signal: &str, source: &str) -> RequestData {
        RequestData {
            signal: signal.to_string(),
            source: source.to_string(),
            ..RequestData::default()
        }
    }

    pub fn name_value(&self, name: &str) -> Option<&str> {
        self.name_values
            .iter()
            .find(|nv| nv.name.eq_ignore_ascii_case(name))
            .map(|nv| nv.value.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataSystem {
    pub system_id: i32,
    pub version: i32,
    pub kind: String,
    pub device_name: String,
    pub system_name: String,
    pub system_desc: String,
    pub creation: String,
    pub xml: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub config_id: i32,
    pub system_id: i32,
    pub config_name: String,
    pub config_desc: String,
    pub creation: String,
    pub xml: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataSource {
    pub source_id: i32,
    pub config_id: i32,
    pub exp_number: i32,
    pub pass: i32,
    pub status: i32,
    pub archive: String,
    pub device_name: String,
    pub format: String,
    pub path: String,
    pub filename: String,
    pub server: String,
    pub source_alias: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Signal {
    pub source_id: i32,
    pub signal_desc_id: i32,
    pub status: i32,
    pub status_desc: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalDesc {
    pub signal_desc_id: i32,
    pub rank: usize,
    pub signal_name: String,
    pub signal_alias: String,
    pub signal_class: String,
    pub description: String,
    pub xml: String,
}

/// The five metadata blocks sent ahead of the data when requested.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub data_system: DataSystem,
    pub system_config: SystemConfig,
    pub data_source: DataSource,
    pub signal: Signal,
    pub signal_desc: SignalDesc,
}

impl Metadata {
    pub fn reset(&mut self) {
        *self = Metadata::default();
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LegacyDataSystem {
    pub system_id: i32,
    pub version: i32,
    pub kind: String,
    pub device_name: String,
    pub system_name: String,
    pub system_desc: String,
}

impl From<&DataSystem> for LegacyDataSystem {
    fn from(b: &DataSystem) -> LegacyDataSystem {
        LegacyDataSystem {
            system_id: b.system_id,
            version: b.version,
            kind: b.kind.clone(),
            device_name: b.device_name.clone(),
            system_name: b.system_name.clone(),
            system_desc: b.system_desc.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LegacySystemConfig {
    pub config_id: i32,
    pub system_id: i32,
    pub config_name: String,
    pub config_desc: String,
}

impl From<&SystemConfig> for LegacySystemConfig {
    fn from(b: &SystemConfig) -> LegacySystemConfig {
        LegacySystemConfig {
            config_id: b.config_id,
            system_id: b.system_id,
            config_name: b.config_name.clone(),
            config_desc: b.config_desc.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LegacyDataSource {
    pub source_id: i32,
    pub config_id: i32,
    pub exp_number: i32,
    pub pass: i32,
    pub archive: String,
    pub device_name: String,
    pub format: String,
    pub path: String,
    pub filename: String,
}

impl From<&DataSource> for LegacyDataSource {
    fn from(b: &DataSource) -> LegacyDataSource {
        LegacyDataSource {
            source_id: b.source_id,
            config_id: b.config_id,
            exp_number: b.exp_number,
            pass: b.pass,
            archive: b.archive.clone(),
            device_name: b.device_name.clone(),
            format: b.format.clone(),
            path: b.path.clone(),
            filename: b.filename.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LegacySignal {
    pub source_id: i32,
    pub signal_desc_id: i32,
    pub status: i32,
}

impl From<&Signal> for LegacySignal {
    fn from(b: &Signal) -> LegacySignal {
        LegacySignal {
            source_id: b.source_id,
            signal_desc_id: b.signal_desc_id,
            status: b.status,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LegacySignalDesc {
    pub signal_desc_id: i32,
    pub rank: usize,
    pub signal_name: String,
    pub signal_class: String,
    pub description: String,
}

impl From<&SignalDesc> for LegacySignalDesc {
    fn from(b: &SignalDesc) -> LegacySignalDesc {
        LegacySignalDesc {
            signal_desc_id: b.signal_desc_id,
            rank: b.rank,
            signal_name: b.signal_name.clone(),
            signal_class: b.signal_class.clone(),
            description: b.description.clone(),
        }
    }
}

impl From<LegacyDataSystem> for DataSystem {
    fn from(b: LegacyDataSystem) -> DataSystem {
        DataSystem {
            system_id: b.system_id,
            version: b.version,
            kind: b.kind,
            device_name: b.device_name,
            system_name: b.system_name,
            system_desc: b.system_desc,
            ..DataSystem::default()
        }
    }
}

impl From<LegacySystemConfig> for SystemConfig {
    fn from(b: LegacySystemConfig) -> SystemConfig {
        SystemConfig {
            config_id: b.config_id,
            system_id: b.system_id,
            config_name: b.config_name,
            config_desc: b.config_desc,
            ..SystemConfig::default()
        }
    }
}

impl From<LegacyDataSource> for DataSource {
    fn from(b: LegacyDataSource) -> DataSource {
        DataSource {
            source_id: b.source_id,
            config_id: b.config_id,
            exp_number: b.exp_number,
            pass: b.pass,
            archive: b.archive,
            device_name: b.device_name,
            format: b.format,
            path: b.path,
            filename: b.filename,
            ..DataSource::default()
        }
    }
}

impl From<LegacySignal> for Signal {
    fn from(b: LegacySignal) -> Signal {
        Signal {
            source_id: b.source_id,
            signal_desc_id: b.signal_desc_id,
            status: b.status,
            ..Signal::default()
        }
    }
}

impl From<LegacySignalDesc> for SignalDesc {
    fn from(b: LegacySignalDesc) -> SignalDesc {
        SignalDesc {
            signal_desc_id: b.signal_desc_id,
            rank: b.rank,
            signal_name: b.signal_name,
            signal_class: b.signal_class,
            description: b.description,
            ..SignalDesc::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_timeout_or_flag_means_closedown() {
        assert!(ClientBlock::new(9, 0).wants_closedown());
        let mut client = ClientBlock::new(9, 30);
        assert!(!client.wants_closedown());
        client.client_flags |= CLIENTFLAG_CLOSEDOWN;
        assert!(client.wants_closedown());
    }

    #[test]
    fn subset_counts_respect_bounds_and_stride() {
        let all = SubsetDim {
            start: 0,
            stop: None,
            stride: 1,
        };
        assert_eq!(all.count(10), 10);

        let strided = SubsetDim {
            start: 2,
            stop: Some(9),
            stride: 3,
        };
        assert_eq!(strided.count(10), 3);
        assert_eq!(strided.indices(10).collect::<Vec<_>>(), vec![2, 5, 8]);

        let past_end = SubsetDim {
            start: 12,
            stop: Some(20),
            stride: 1,
        };
        assert_eq!(past_end.count(10), 0);
    }

    #[test]
    fn legacy_server_block_drops_environment_fields() {
        let mut server = ServerBlock::new(5, "Linux", "site-a");
        server.errors.push_code("test", 20, "unknown");
        server.error = 20;

        let legacy = LegacyServerBlock::from(&server);
        let wire = serde_json::to_value(&legacy).unwrap();
        assert!(wire.get("os_name").is_none());

        let back = ServerBlock::from(legacy);
        assert_eq!(back.error, 20);
        assert_eq!(back.errors.len(), 1);
        assert!(back.os_name.is_empty());
    }

    #[test]
    fn name_values_match_without_case() {
        let mut request = RequestData::new("x", "y");
        request.name_values.push(NameValue {
            name: "Shot".to_string(),
            value: "42".to_string(),
        });
        assert_eq!(request.name_value("shot"), Some("42"));
        assert_eq!(request.name_value("pass"), None);
    }
}
