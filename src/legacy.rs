/*
 * Copyright 2020 Joyent, Inc.
 */

//! Engine for clients at or below the legacy protocol version.
//!
//! Old clients pull each section of a reply by sending a next-protocol record
//! naming it, and every record uses the older layouts. After a reply the
//! client either closes the session or puts the server to sleep; a sleeping
//! session is woken for the next request, which is preceded by a fresh
//! exchange of client and server blocks.

use std::time::Instant;

use slog::debug;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::blocks::{
    LegacyDataSource, LegacyDataSystem, LegacySignal, LegacySignalDesc,
    LegacySystemConfig,
};
use crate::errors::{codes, Error};
use crate::protocol::RecordKind;
use crate::server::{receive_request, Connection, Session};
use crate::types::DataBlock;

/// What the client asked for once a reply was complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EndOfCycle {
    Continue,
    Closedown,
}

pub(crate) async fn run<S>(
    conn: &mut Connection<S>,
    session: &mut Session,
) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut first = true;
    loop {
        if !first && !exchange_blocks(conn, session).await? {
            return Ok(());
        }
        first = false;

        let started = Instant::now();
        let record = conn
            .expect(
                RecordKind::RequestBlock,
                "request block",
                Some(session.idle_timeout()),
            )
            .await?;
        let mut request =
            receive_request(conn, record, session.idle_timeout()).await?;

        let block = session.serve_blocking(&mut request);
        conn.send(session.server_record()?).await?;
        if !session.server.failed() {
            transmit(conn, session, &block).await?;
        }
        session.log_access(&request, &block, started);
        drop(block);

        if end_of_cycle(conn, session).await? == EndOfCycle::Closedown {
            return Ok(());
        }
    }
}

/// Repeat the handshake at the start of a later cycle. Returns false if the
/// client asked to close.
async fn exchange_blocks<S>(
    conn: &mut Connection<S>,
    session: &mut Session,
) -> Result<bool, Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let record = conn
        .expect(
            RecordKind::ClientBlock,
            "client block",
            Some(session.idle_timeout()),
        )
        .await?;
    let client = session.decode_client(&record)?;
    let closedown = client.wants_closedown();
    session.server.reset();
    let accepted = session.accept_client(client);
    conn.send(session.server_record()?).await?;
    if !accepted {
        return Err(Error::Fatal {
            code: codes::VERSION_INCOMPATIBLE,
            message: "client changed to an unsupported version".to_string(),
        });
    }
    Ok(!closedown)
}

/// Send the sections of a successful reply as the client asks for them.
async fn transmit<S>(
    conn: &mut Connection<S>,
    session: &Session,
    block: &DataBlock,
) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if session.client.get_meta {
        expect_next(
            conn,
            RecordKind::DataSystem,
            codes::PROTOCOL_INCONSISTENCY,
            session,
        )
        .await?;
        let meta = &session.metadata;
        conn.send_body(
            RecordKind::DataSystem,
            &LegacyDataSystem::from(&meta.data_system),
        )
        .await?;
        conn.send_body(
            RecordKind::SystemConfig,
            &LegacySystemConfig::from(&meta.system_config),
        )
        .await?;
        conn.send_body(
            RecordKind::DataSource,
            &LegacyDataSource::from(&meta.data_source),
        )
        .await?;
        conn.send_body(RecordKind::Signal, &LegacySignal::from(&meta.signal))
            .await?;
        conn.send_body(
            RecordKind::SignalDesc,
            &LegacySignalDesc::from(&meta.signal_desc),
        )
        .await?;
    }

    expect_next(
        conn,
        RecordKind::DataBlockList,
        codes::PROTOCOL_INCORRECT_REQUEST,
        session,
    )
    .await?;
    conn.send_body(RecordKind::DataBlockList, block).await?;

    if let Some(record) = block.opaque().to_record(true)? {
        expect_next(conn, RecordKind::Structures, codes::PROTOCOL_SEQUENCE, session)
            .await?;
        conn.send(record).await?;
    }
    debug!(session.log(), "legacy reply sent";
        "opaque" => ?block.opaque_type());
    Ok(())
}

/// Wait for the next-protocol record naming `wanted`. Anything else is out of
/// sequence and fails the session with `code`.
async fn expect_next<S>(
    conn: &mut Connection<S>,
    wanted: RecordKind,
    code: i32,
    session: &Session,
) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let record = conn
        .expect(
            RecordKind::NextProtocol,
            "next protocol",
            Some(session.idle_timeout()),
        )
        .await?;
    let kind = record.next_kind()?;
    if kind != wanted {
        return Err(Error::Fatal {
            code,
            message: format!(
                "protocol sequence error: expected {:?}, received {:?}",
                wanted, kind
            ),
        });
    }
    Ok(())
}

/// Read the instruction ending a cycle, sleeping until woken if asked.
async fn end_of_cycle<S>(
    conn: &mut Connection<S>,
    session: &Session,
) -> Result<EndOfCycle, Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let record = conn
        .expect(
            RecordKind::NextProtocol,
            "next protocol",
            Some(session.idle_timeout()),
        )
        .await?;
    match record.next_kind()? {
        RecordKind::Closedown => Ok(EndOfCycle::Closedown),
        RecordKind::WakeUp => Ok(EndOfCycle::Continue),
        RecordKind::Sleep => {
            debug!(session.log(), "session sleeping");
            loop {
                let record = conn
                    .expect(
                        RecordKind::NextProtocol,
                        "wake up",
                        Some(session.idle_timeout()),
                    )
                    .await?;
                match record.next_kind()? {
                    RecordKind::WakeUp => return Ok(EndOfCycle::Continue),
                    RecordKind::Closedown => return Ok(EndOfCycle::Closedown),
                    RecordKind::Sleep => continue,
                    other => {
                        return Err(Error::UnexpectedRecord {
                            expected: "wake up",
                            received: other,
                        })
                    }
                }
            }
        }
        other => Err(Error::UnexpectedRecord {
            expected: "closedown, sleep or wake up",
            received: other,
        }),
    }
}
