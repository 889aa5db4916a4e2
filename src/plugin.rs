/*
 * Copyright 2020 Joyent, Inc.
 */

//! Plugin contract and the registry that maps request signatures to plugins.

use std::fmt;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;

use serde_derive::Serialize;
use slog::{debug, Logger};

use crate::blocks::{ClientBlock, Metadata, RequestData};
use crate::cache::{FileCache, PLAIN_READER};
use crate::errors::{codes, ErrorStack};
use crate::sockets::SocketRegistry;
use crate::types::DataBlock;

/// Request id of a request nothing has resolved yet.
pub const REQUEST_READ_UNKNOWN: i32 = 0;
/// First request id handed out by the registry.
pub const REQUEST_READ_START: i32 = 1000;

/// Everything a plugin may touch while serving one request.
pub struct PluginInterface<'a> {
    pub request: &'a RequestData,
    pub client: &'a ClientBlock,
    pub data_block: &'a mut DataBlock,
    pub metadata: &'a mut Metadata,
    pub errors: &'a mut ErrorStack,
    pub files: &'a mut FileCache,
    pub sockets: &'a mut SocketRegistry,
    pub log: &'a Logger,
}

/// A data reader. `call` fills the interface's data block and returns zero on
/// success; failures are described on the interface's error stack.
pub trait Plugin: Send + Sync {
    fn call(&self, iface: &mut PluginInterface<'_>) -> i32;

    /// Drop any state held between calls. Called when a session ends.
    fn reset(&self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PluginClass {
    File,
    Server,
    Function,
    Device,
    Other,
}

#[derive(Clone)]
pub struct PluginEntry {
    pub format: String,
    pub request: i32,
    pub class: PluginClass,
    /// File extension served by this plugin, without the leading dot.
    pub extension: String,
    /// Device name redirected to this plugin.
    pub device: String,
    pub desc: String,
    pub example: String,
    handler: Option<Arc<dyn Plugin>>,
}

impl PluginEntry {
    pub fn new(
        format: &str,
        class: PluginClass,
        handler: Arc<dyn Plugin>,
    ) -> PluginEntry {
        PluginEntry {
            format: format.to_string(),
            request: REQUEST_READ_UNKNOWN,
            class,
            extension: String::new(),
            device: String::new(),
            desc: String::new(),
            example: String::new(),
            handler: Some(handler),
        }
    }

    /// An entry that is listed but cannot be called.
    pub fn disabled(format: &str, class: PluginClass) -> PluginEntry {
        PluginEntry {
            format: format.to_string(),
            request: REQUEST_READ_UNKNOWN,
            class,
            extension: String::new(),
            device: String::new(),
            desc: String::new(),
            example: String::new(),
            handler: None,
        }
    }

    pub fn extension(mut self, ext: &str) -> PluginEntry {
        self.extension = ext.trim_start_matches('.').to_string();
        self
    }

    pub fn device(mut self, device: &str) -> PluginEntry {
        self.device = device.to_string();
        self
    }

    pub fn describe(mut self, desc: &str, example: &str) -> PluginEntry {
        self.desc = desc.to_string();
        self.example = example.to_string();
        self
    }

    pub fn handler(&self) -> Option<&Arc<dyn Plugin>> {
        self.handler.as_ref()
    }
}

impl fmt::Debug for PluginEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PluginEntry")
            .field("format", &self.format)
            .field("request", &self.request)
            .field("class", &self.class)
            .field("extension", &self.extension)
            .field("device", &self.device)
            .field("operational", &self.handler.is_some())
            .finish()
    }
}

/// Table of plugins, filled once before the server accepts connections.
/// Cloning is cheap; each session works on its own clone.
#[derive(Debug, Clone, Default)]
pub struct PluginRegistry {
    entries: Vec<PluginEntry>,
}

impl PluginRegistry {
    pub fn new() -> PluginRegistry {
        PluginRegistry::default()
    }

    /// A registry holding the plugins shipped with the server.
    pub fn with_builtins() -> PluginRegistry {
        let mut registry = PluginRegistry::new();
        registry.register(
            PluginEntry::new(
                "BYTES",
                PluginClass::File,
                Arc::new(BytesPlugin),
            )
            .describe(
                "Read the raw bytes of a file",
                "getdata(\"\", \"BYTES::/path/to/file\")",
            ),
        );
        registry.register(
            PluginEntry::new(
                "UDA",
                PluginClass::Server,
                Arc::new(crate::forward::ForwardPlugin::default()),
            )
            .describe(
                "Forward the request to another data server",
                "getdata(\"signal\", \"UDA::host:port/source\")",
            ),
        );
        registry
    }

    /// Add `entry`, assigning it the next request id. Returns the id.
    pub fn register(&mut self, mut entry: PluginEntry) -> i32 {
        let id = REQUEST_READ_START + self.entries.len() as i32;
        entry.request = id;
        self.entries.push(entry);
        id
    }

    pub fn by_request(&self, request: i32) -> Option<&PluginEntry> {
        self.entries.iter().find(|e| e.request == request)
    }

    pub fn by_format(&self, format: &str) -> Option<&PluginEntry> {
        self.entries
            .iter()
            .find(|e| e.format.eq_ignore_ascii_case(format))
    }

    pub fn by_device(&self, device: &str) -> Option<&PluginEntry> {
        self.entries
            .iter()
            .find(|e| !e.device.is_empty() && e.device.eq_ignore_ascii_case(device))
    }

    pub fn by_extension(&self, ext: &str) -> Option<&PluginEntry> {
        let ext = ext.trim_start_matches('.');
        self.entries.iter().find(|e| {
            !e.extension.is_empty() && e.extension.eq_ignore_ascii_case(ext)
        })
    }

    pub fn is_format(&self, name: &str) -> bool {
        self.by_format(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PluginEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Give every plugin the chance to drop state held between calls.
    pub fn release(&self) {
        for handler in self.entries.iter().filter_map(PluginEntry::handler) {
            handler.reset();
        }
    }
}

/// Returns the bytes of the file named by the request path, optionally
/// restricted by a rank-1 subset.
pub struct BytesPlugin;

impl Plugin for BytesPlugin {
    fn call(&self, iface: &mut PluginInterface<'_>) -> i32 {
        let path = Path::new(&iface.request.path);
        debug!(iface.log, "reading file bytes"; "path" => %path.display());

        let bytes = match read_all(iface.files, path) {
            Ok(bytes) => bytes,
            Err(e) => {
                iface.errors.push_system(
                    "BytesPlugin",
                    &e,
                    &format!("unable to read {}", path.display()),
                );
                return codes::RESOURCE;
            }
        };

        let bytes = match iface.request.subset.as_slice() {
            [] => bytes,
            [dim] => dim.indices(bytes.len()).map(|i| bytes[i]).collect(),
            _ => {
                iface.errors.push_code(
                    "BytesPlugin",
                    codes::PLUGIN_FAILED,
                    "byte data is rank 1; only one subset dimension applies",
                );
                return codes::PLUGIN_FAILED;
            }
        };

        iface.data_block.set_bytes(bytes);
        iface.metadata.data_source.path = iface.request.path.clone();
        0
    }
}

fn read_all(files: &mut FileCache, path: &Path) -> std::io::Result<Vec<u8>> {
    let file = files.open_as::<File>(PLAIN_READER, path)?;
    file.seek(SeekFrom::Start(0))?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    Ok(bytes)
}
