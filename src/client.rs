/*
 * Copyright 2020 Joyent, Inc.
 */

//! Blocking client for the data-access protocol.
//!
//! Used by the forwarding plugin, the `datacall` demo and the integration
//! tests. Works over any `Read + Write` stream; modern sessions use [`get`],
//! sessions at or below the legacy threshold use [`legacy_get`], which drives
//! the reply with next-protocol records.

use std::io::{Read, Write};

use bytes::BytesMut;
use tokio_util::codec::Decoder;

use crate::blocks::{
    ClientBlock, LegacyClientBlock, LegacyDataSource, LegacyDataSystem,
    LegacyServerBlock, LegacySignal, LegacySignalDesc, LegacySystemConfig,
    Metadata, RequestData, ServerBlock,
};
use crate::errors::Error;
use crate::protocol::{encode_record, Record, RecordCodec, RecordKind};
use crate::types::{DataBlock, OpaquePayload, OpaqueTag};

/// Everything the server sent for one request.
#[derive(Debug)]
pub struct Reply {
    pub server: ServerBlock,
    pub metadata: Option<Metadata>,
    pub data: Option<DataBlock>,
}

impl Reply {
    fn status_only(server: ServerBlock) -> Reply {
        Reply {
            server,
            metadata: None,
            data: None,
        }
    }
}

pub fn send<S: Write>(record: &Record, stream: &mut S) -> Result<usize, Error> {
    let mut write_buf = BytesMut::new();
    encode_record(record, &mut write_buf)?;
    stream.write_all(write_buf.as_ref())?;
    stream.flush()?;
    Ok(write_buf.len())
}

/// Reads whole records from a blocking stream.
pub struct RecordReader<'s, S> {
    stream: &'s mut S,
    buf: BytesMut,
    codec: RecordCodec,
}

impl<'s, S: Read> RecordReader<'s, S> {
    pub fn new(stream: &'s mut S) -> RecordReader<'s, S> {
        RecordReader {
            stream,
            buf: BytesMut::new(),
            codec: RecordCodec::default(),
        }
    }

    pub fn receive(&mut self) -> Result<Record, Error> {
        loop {
            if let Some(record) = self.codec.decode(&mut self.buf)? {
                return Ok(record);
            }
            let mut read_buf = [0; 8192];
            let byte_count = self.stream.read(&mut read_buf)?;
            if byte_count == 0 {
                return Err(Error::Disconnected);
            }
            self.buf.extend_from_slice(&read_buf[0..byte_count]);
        }
    }

    pub fn expect(
        &mut self,
        kind: RecordKind,
        expected: &'static str,
    ) -> Result<Record, Error> {
        let record = self.receive()?;
        if record.kind == kind {
            Ok(record)
        } else {
            Err(Error::UnexpectedRecord {
                expected,
                received: record.kind,
            })
        }
    }
}

/// Send the client descriptor and return the server's acknowledgement.
pub fn handshake<S: Read + Write>(
    stream: &mut S,
    client: &ClientBlock,
) -> Result<ServerBlock, Error> {
    send(&Record::new(RecordKind::ClientBlock, client)?, stream)?;
    let record =
        RecordReader::new(stream).expect(RecordKind::ServerBlock, "server block")?;
    Ok(record.body()?)
}

/// Run one request on a modern session.
pub fn get<S: Read + Write>(
    stream: &mut S,
    client: &ClientBlock,
    request: &RequestData,
) -> Result<Reply, Error> {
    send(&Record::new(RecordKind::RequestBlock, request)?, stream)?;
    if request.put {
        send(
            &Record::new(RecordKind::PutDataBlockList, &request.put_data)?,
            stream,
        )?;
    }

    let mut reader = RecordReader::new(stream);
    let server: ServerBlock = reader
        .expect(RecordKind::ServerBlock, "server block")?
        .body()?;
    if server.failed() {
        return Ok(Reply::status_only(server));
    }

    let metadata = if client.get_meta {
        Some(Metadata {
            data_system: reader
                .expect(RecordKind::DataSystem, "data system")?
                .body()?,
            system_config: reader
                .expect(RecordKind::SystemConfig, "system config")?
                .body()?,
            data_source: reader
                .expect(RecordKind::DataSource, "data source")?
                .body()?,
            signal: reader.expect(RecordKind::Signal, "signal")?.body()?,
            signal_desc: reader
                .expect(RecordKind::SignalDesc, "signal description")?
                .body()?,
        })
    } else {
        None
    };

    let mut blocks: Vec<DataBlock> = reader
        .expect(RecordKind::DataBlockList, "data block list")?
        .body()?;
    let mut data = blocks.pop();
    if let Some(block) = data.as_mut() {
        read_opaque(&mut reader, block)?;
    }

    Ok(Reply {
        server,
        metadata,
        data,
    })
}

/// Run one request on a legacy session. `first` is true for the request
/// immediately following the handshake; later requests wake the server and
/// exchange descriptors again. The server is left asleep afterwards.
pub fn legacy_get<S: Read + Write>(
    stream: &mut S,
    client: &ClientBlock,
    request: &RequestData,
    first: bool,
) -> Result<Reply, Error> {
    if !first {
        send(&Record::next(RecordKind::WakeUp), stream)?;
        send(
            &Record::new(
                RecordKind::ClientBlock,
                &LegacyClientBlock::from(client),
            )?,
            stream,
        )?;
        let ack: LegacyServerBlock = RecordReader::new(stream)
            .expect(RecordKind::ServerBlock, "server block")?
            .body()?;
        let ack = ServerBlock::from(ack);
        if ack.failed() {
            return Ok(Reply::status_only(ack));
        }
    }

    send(&Record::new(RecordKind::RequestBlock, request)?, stream)?;
    if request.put {
        send(
            &Record::new(RecordKind::PutDataBlockList, &request.put_data)?,
            stream,
        )?;
    }

    let server: LegacyServerBlock = RecordReader::new(stream)
        .expect(RecordKind::ServerBlock, "server block")?
        .body()?;
    let server = ServerBlock::from(server);
    if server.failed() {
        send(&Record::next(RecordKind::Sleep), stream)?;
        return Ok(Reply::status_only(server));
    }

    let metadata = if client.get_meta {
        send(&Record::next(RecordKind::DataSystem), stream)?;
        let mut reader = RecordReader::new(stream);
        let data_system: LegacyDataSystem = reader
            .expect(RecordKind::DataSystem, "data system")?
            .body()?;
        let system_config: LegacySystemConfig = reader
            .expect(RecordKind::SystemConfig, "system config")?
            .body()?;
        let data_source: LegacyDataSource = reader
            .expect(RecordKind::DataSource, "data source")?
            .body()?;
        let signal: LegacySignal =
            reader.expect(RecordKind::Signal, "signal")?.body()?;
        let signal_desc: LegacySignalDesc = reader
            .expect(RecordKind::SignalDesc, "signal description")?
            .body()?;
        Some(Metadata {
            data_system: data_system.into(),
            system_config: system_config.into(),
            data_source: data_source.into(),
            signal: signal.into(),
            signal_desc: signal_desc.into(),
        })
    } else {
        None
    };

    send(&Record::next(RecordKind::DataBlockList), stream)?;
    let mut block: DataBlock = RecordReader::new(stream)
        .expect(RecordKind::DataBlockList, "data block")?
        .body()?;

    if block.opaque_type() != OpaqueTag::None {
        send(&Record::next(RecordKind::Structures), stream)?;
        read_opaque(&mut RecordReader::new(stream), &mut block)?;
    }

    send(&Record::next(RecordKind::Sleep), stream)?;

    Ok(Reply {
        server,
        metadata,
        data: Some(block),
    })
}

/// Tell the server to end the session.
pub fn closedown<S: Write>(stream: &mut S) -> Result<(), Error> {
    send(&Record::next(RecordKind::Closedown), stream)?;
    Ok(())
}

fn read_opaque<S: Read>(
    reader: &mut RecordReader<'_, S>,
    block: &mut DataBlock,
) -> Result<(), Error> {
    let tag = block.opaque_type();
    if tag == OpaqueTag::None {
        return Ok(());
    }
    let record = reader.receive()?;
    block.set_opaque(OpaquePayload::from_record(tag, &record)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Cursor;

    #[test]
    fn reader_collects_records_split_across_reads() {
        let mut wire = BytesMut::new();
        encode_record(&Record::next(RecordKind::Sleep), &mut wire).unwrap();
        encode_record(&Record::next(RecordKind::WakeUp), &mut wire).unwrap();
        let mut stream = Cursor::new(wire.to_vec());

        let mut reader = RecordReader::new(&mut stream);
        assert_eq!(reader.receive().unwrap().next_kind().unwrap(), RecordKind::Sleep);
        assert_eq!(reader.receive().unwrap().next_kind().unwrap(), RecordKind::WakeUp);
        assert!(matches!(reader.receive(), Err(Error::Disconnected)));
    }

    #[test]
    fn unexpected_records_are_reported() {
        let mut wire = BytesMut::new();
        encode_record(&Record::next(RecordKind::Sleep), &mut wire).unwrap();
        let mut stream = Cursor::new(wire.to_vec());

        let err = RecordReader::new(&mut stream)
            .expect(RecordKind::ServerBlock, "server block")
            .unwrap_err();
        assert!(matches!(
            err,
            Error::UnexpectedRecord {
                received: RecordKind::NextProtocol,
                ..
            }
        ));
    }
}
