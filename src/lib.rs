// Copyright 2020 Joyent, Inc.

//! Dataserve: a versioned data-access server engine
//!
//! Dataserve serves experiment signal data to remote clients. A client opens
//! a session, announces its protocol version and then issues requests naming
//! a signal and a source. Each request is resolved to a reader plugin, the
//! plugin fills a Data Block, the server post-processes it as the client asked
//! and sends it back in a fixed order of records.
//!
//! Protocol definition
//!
//! Every record on the wire has the following structure:
//!
//! * VERSION   1-byte integer.  The only supported value is "1".
//!
//! * KIND      2-byte big-endian unsigned integer naming the record, e.g.
//!           client block (10), server block (11), request block (1) or data
//!           block list (2).
//!
//! * CRC1...CRC4        4-byte big-endian unsigned integer representing the CRC16
//!                     value of the data payload
//!
//! * DLEN0...DLEN4      4-byte big-endian unsigned integer representing the number
//!                    of bytes of data payload that follow
//!
//! * DATA0...DATAN      Data payload.  This is a JSON-encoded record body.  The
//!                    encoding length in bytes is given by the DLEN0...DLEN4
//!                    bytes.
//!
//! Sessions: the client sends a client block, the server answers with a server
//! block carrying its own version. The session runs at the lower of the two
//! versions; a client newer than the server is refused. Clients at or below
//! version 6 are served by the legacy engine, which sends each section of a
//! reply only when the client asks for it.
//!
//! Replies: a server block always comes first. If it reports an error nothing
//! else follows. Otherwise the five metadata blocks follow when the client set
//! `get_meta`, then the data block, then any opaque record the data block
//! announces.

#![allow(missing_docs)]

pub mod blocks;
pub mod cache;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod errors;
pub mod forward;
pub mod legacy;
pub mod plugin;
pub mod processing;
pub mod protocol;
pub mod server;
pub mod sockets;
pub mod types;
