//-
// Copyright (c) 2025, the Tidemap developers
//
// This file is part of Tidemap.
//
// Tidemap is free software: you can  redistribute it and/or modify it under
// the terms of  the GNU General Public License as  published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Tidemap is distributed  in the hope that it will  be useful, but WITHOUT
// ANY WARRANTY; without even the  implied warranty of MERCHANTABILITY or
// FITNESS FOR  A PARTICULAR PURPOSE.  See the GNU General  Public License
// for more details.
//
// You should have received a copy of the GNU General Public License along
// with Tidemap. If not, see <http://www.gnu.org/licenses/>.

//! The per-connection session driver.
//!
//! Two futures run joined for the lifetime of a connection: the writer
//! actor, which serialises everything sent to the client, and the session
//! loop here, which reads logical commands, parses them, and dispatches to
//! the command processor. The loop also owns the flows the grammar can't
//! express on its own: the AUTHENTICATE continuation, APPEND/LAPPEND
//! literal streaming, STARTTLS, and the IDLE/DONE pairing.
//!
//! Responses within a session are strict FIFO: the tagged response for a
//! command is queued (and the queue is drained in order) before the next
//! command is read. IDLE is the exception; its tagged response is produced
//! only when DONE arrives, and unsolicited data from sibling sessions may
//! be interleaved before it.

use std::borrow::Cow;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use log::{error, info, warn};
use openssl::ssl::SslAcceptor;
use tokio::sync::mpsc::UnboundedSender;

use super::command_processor::CommandProcessor;
use super::request_reader::{trailing_literal, ReadError, RequestReader};
use super::response_writer::{
    write_responses, OutputControl, OutputEvent,
};
use super::session::{CommandGroup, SessionState};
use super::syntax as s;
use crate::support::async_io::ServerIo;
use crate::support::error::Error;

/// Runs one IMAP session over `io` until logout or disconnect.
pub async fn run(
    io: ServerIo,
    mut processor: CommandProcessor,
    ssl_acceptor: Option<Arc<SslAcceptor>>,
) {
    let (sender, receiver) = tokio::sync::mpsc::unbounded_channel();

    let writer = write_responses(io.clone(), receiver);
    let session =
        drive_session(&io, &mut processor, sender, ssl_acceptor.as_deref());
    let (write_result, session_result) = futures::join!(writer, session);

    // Unconditional cleanup so a failed session can't leak an idle
    // registration.
    processor.teardown();

    match session_result {
        Ok(()) => info!(
            "{} Connection closed normally",
            processor.log_prefix()
        ),
        Err(e) => {
            warn!("{} Connection error: {}", processor.log_prefix(), e)
        },
    }

    if let Err(e) = write_result {
        if io::ErrorKind::BrokenPipe != e.kind() {
            warn!("{} Write error: {}", processor.log_prefix(), e);
        }
    }
}

async fn drive_session(
    io: &ServerIo,
    processor: &mut CommandProcessor,
    sender: UnboundedSender<OutputEvent>,
    ssl_acceptor: Option<&SslAcceptor>,
) -> Result<(), Error> {
    let mut reader = RequestReader::new(io.clone());

    send_line(&sender, processor.greet(), OutputControl::Flush);

    loop {
        if processor.logged_out() {
            break;
        }

        let buffer = match reader.read_logical_command(&sender).await {
            Ok(Some(buffer)) => buffer,
            // Clean EOF at a command boundary; the session simply ends.
            Ok(None) => break,
            Err(ReadError::TooLong { tag }) => {
                send_cond(
                    &sender,
                    tag,
                    s::RespCondType::Bad,
                    None,
                    "Command line too long".to_owned(),
                );
                continue;
            },
            Err(ReadError::LiteralTimeout { tag }) => {
                send_cond(
                    &sender,
                    tag,
                    s::RespCondType::Bad,
                    None,
                    "Timed out reading literal".to_owned(),
                );
                continue;
            },
            Err(ReadError::Io(e))
                if io::ErrorKind::UnexpectedEof == e.kind() =>
            {
                break;
            },
            Err(ReadError::Io(e)) => return Err(e.into()),
        };

        // While idling, DONE is the only thing the client may say.
        if processor.is_idling() {
            let line = if buffer.eq_ignore_ascii_case(b"DONE") {
                processor.end_idle()
            } else {
                processor.abort_idle()
            };
            send_line(&sender, line, OutputControl::Flush);
            continue;
        }

        // A buffer ending in a literal marker is an APPEND or LAPPEND
        // whose literal is still on the wire.
        if trailing_literal(&buffer).is_some() {
            handle_append(&mut reader, processor, &sender, &buffer).await?;
            continue;
        }

        if let Ok((b"", auth)) = s::AuthenticateCommandStart::parse(&buffer) {
            handle_authenticate(&mut reader, processor, &sender, auth)
                .await?;
            continue;
        }

        if let Ok((b"", command_line)) = s::CommandLine::parse(&buffer) {
            match command_line.cmd {
                s::Command::Simple(s::SimpleCommand::Idle) => {
                    let tag = command_line.tag.into_owned();
                    if processor
                        .state()
                        .accepts(CommandGroup::Authenticated)
                    {
                        processor.begin_idle(tag, &sender);
                    } else {
                        send_cond(
                            &sender,
                            Some(tag),
                            s::RespCondType::Bad,
                            None,
                            "Bad Command".to_owned(),
                        );
                    }
                },

                s::Command::Simple(s::SimpleCommand::StartTls) => {
                    let tag = command_line.tag.into_owned();
                    handle_starttls(
                        io,
                        &mut reader,
                        processor,
                        &sender,
                        ssl_acceptor,
                        tag,
                    )
                    .await?;
                },

                _ => {
                    let tag = command_line.tag.clone().into_owned();
                    let line = match catch_unwind(AssertUnwindSafe(|| {
                        processor.handle_command(command_line, &sender)
                    })) {
                        Ok(line) => line,
                        Err(panic) => {
                            let msg = panic_message(&panic);
                            error!(
                                "{} Command handler panicked: {}",
                                processor.log_prefix(),
                                msg
                            );
                            s::ResponseLine {
                                tag: Some(Cow::Owned(tag)),
                                response: s::Response::Cond(
                                    s::CondResponse {
                                        cond: s::RespCondType::Bad,
                                        code: None,
                                        quip: Some(Cow::Owned(msg)),
                                    },
                                ),
                            }
                        },
                    };
                    send_line(&sender, line, OutputControl::Flush);
                    processor.flush_notifications();
                },
            }
            continue;
        }

        // Unparseable. Recover the tag if we can so the rejection lands
        // on the right command.
        if let Ok((_, frag)) = s::UnknownCommandFragment::parse(&buffer) {
            send_cond(
                &sender,
                Some(frag.tag.into_owned()),
                s::RespCondType::Bad,
                Some(s::RespTextCode::Parse),
                "Unrecognised command syntax".to_owned(),
            );
        } else {
            send_cond(
                &sender,
                None,
                s::RespCondType::Bad,
                Some(s::RespTextCode::Parse),
                "That doesn't look anything like an IMAP command".to_owned(),
            );
        }
    }

    processor.teardown();
    Ok(())
}

/// Drives an APPEND or LAPPEND whose command buffer ends with the literal
/// marker: size validation, the continuation line, streaming the payload
/// into the backend, and the command-terminating CRLF.
async fn handle_append(
    reader: &mut RequestReader<ServerIo>,
    processor: &mut CommandProcessor,
    sender: &UnboundedSender<OutputEvent>,
    buffer: &[u8],
) -> Result<(), Error> {
    let (before, size, literal_plus) =
        trailing_literal(buffer).expect("handle_append without literal");

    enum Parsed<'a> {
        Append(s::AppendCommandStart<'a>),
        Lappend(s::LappendCommandStart<'a>),
    }

    let (parsed, tag) =
        if let Ok((b"", cmd)) = s::AppendCommandStart::parse(before) {
            let tag = cmd.tag.clone().into_owned();
            (Parsed::Append(cmd), tag)
        } else if let Ok((b"", cmd)) = s::LappendCommandStart::parse(before) {
            let tag = cmd.tag.clone().into_owned();
            (Parsed::Lappend(cmd), tag)
        } else {
            let tag = s::UnknownCommandFragment::parse(before)
                .ok()
                .map(|(_, frag)| frag.tag.into_owned());
            if literal_plus {
                drain_rejected_literal(reader, size, &tag).await?;
            }
            send_cond(
                sender,
                tag,
                s::RespCondType::Bad,
                Some(s::RespTextCode::Parse),
                "Bad APPEND syntax".to_owned(),
            );
            return Ok(());
        };

    if 0 == size || size > processor.max_msg_size() {
        // Rejected before any continuation; a synchronizing client never
        // sends the payload, a LITERAL+ one already has it in flight.
        if literal_plus {
            drain_rejected_literal(reader, size, &Some(tag.clone())).await?;
        }
        send_cond(
            sender,
            Some(tag),
            s::RespCondType::Bad,
            if 0 == size {
                None
            } else {
                Some(s::RespTextCode::Limit)
            },
            if 0 == size {
                "APPEND aborted by 0-size literal".to_owned()
            } else {
                "APPEND size limit exceeded".to_owned()
            },
        );
        return Ok(());
    }

    if !literal_plus
        && sender
            .send(OutputEvent::ContinuationLine { prompt: "" })
            .is_err()
    {
        return Err(Error::Io(io::ErrorKind::BrokenPipe.into()));
    }

    let mut line = {
        let mut literal = reader.read_append_literal(size);
        let line = match parsed {
            Parsed::Append(cmd) => {
                processor.cmd_append(cmd, size, &mut literal).await
            },
            Parsed::Lappend(cmd) => {
                processor.cmd_lappend(cmd, size, &mut literal).await
            },
        };

        // The backend may have bailed out early; the rest of the literal
        // still has to leave the stream.
        let _ = tokio::io::copy(&mut literal, &mut tokio::io::sink()).await;
        line
    };

    // The command line terminates with a bare CRLF after the literal.
    if !processor.logged_out() {
        match reader.read_raw_line().await {
            Ok(Some(rest)) if !rest.is_empty() => {
                line = s::ResponseLine {
                    tag: line.tag,
                    response: s::Response::Cond(s::CondResponse {
                        cond: s::RespCondType::Bad,
                        code: Some(s::RespTextCode::Parse),
                        quip: Some(Cow::Borrowed(
                            "Trailing data after APPEND literal",
                        )),
                    }),
                };
            },
            // EOF or an empty line; either way the command is over. EOF
            // is noticed by the main loop on its next read.
            Ok(_) => {},
            Err(ReadError::Io(e)) => return Err(e.into()),
            Err(_) => {},
        }
    }

    send_line(sender, line, OutputControl::Flush);
    processor.flush_notifications();
    Ok(())
}

/// Discards the payload (and terminating line) of an append that was
/// rejected after the client already committed to sending it.
async fn drain_rejected_literal(
    reader: &mut RequestReader<ServerIo>,
    size: u32,
    tag: &Option<String>,
) -> Result<(), Error> {
    match reader.drain_literal(size, tag).await {
        Ok(()) => {
            let _ = reader.read_raw_line().await;
            Ok(())
        },
        Err(ReadError::Io(e)) => Err(e.into()),
        // Too-long/timeout while draining; the stream is already being
        // thrown away, so just stop.
        Err(_) => Ok(()),
    }
}

/// Drives the AUTHENTICATE exchange: an initial response completes it
/// immediately, otherwise the server prompts and reads one line.
async fn handle_authenticate(
    reader: &mut RequestReader<ServerIo>,
    processor: &mut CommandProcessor,
    sender: &UnboundedSender<OutputEvent>,
    auth: s::AuthenticateCommandStart<'_>,
) -> Result<(), Error> {
    if let Some(line) = processor.authenticate_start(&auth) {
        send_line(sender, line, OutputControl::Flush);
        return Ok(());
    }

    // The space after the + is mandatory; what follows would be server
    // challenge data, of which there is none.
    if sender
        .send(OutputEvent::ContinuationLine { prompt: "" })
        .is_err()
    {
        return Err(Error::Io(io::ErrorKind::BrokenPipe.into()));
    }

    let data = match reader.read_raw_line().await {
        Ok(Some(data)) => data,
        Ok(None) => return Ok(()),
        Err(ReadError::Io(e)) => return Err(e.into()),
        Err(_) => {
            send_cond(
                sender,
                Some(auth.tag.into_owned()),
                s::RespCondType::Bad,
                None,
                "AUTHENTICATE data too long".to_owned(),
            );
            return Ok(());
        },
    };

    let line = processor.authenticate_finish(
        auth.tag.into_owned(),
        auth.auth_type.into_owned(),
        &data,
    );
    send_line(sender, line, OutputControl::Flush);
    Ok(())
}

/// STARTTLS: answer OK, quiesce the writer, then swap the shared IO to TLS
/// in place. The swap is atomic with respect to subsequent reads and
/// writes since reader and writer actor share the one `ServerIo`.
async fn handle_starttls(
    io: &ServerIo,
    reader: &mut RequestReader<ServerIo>,
    processor: &mut CommandProcessor,
    sender: &UnboundedSender<OutputEvent>,
    ssl_acceptor: Option<&SslAcceptor>,
    tag: String,
) -> Result<(), Error> {
    if SessionState::NotAuthenticated != processor.state() {
        send_cond(
            sender,
            Some(tag),
            s::RespCondType::Bad,
            None,
            "Bad Command".to_owned(),
        );
        return Ok(());
    }

    let acceptor = match ssl_acceptor {
        Some(acceptor) if processor.starttls_enabled() => acceptor,
        _ => {
            send_cond(
                sender,
                Some(tag),
                s::RespCondType::Bad,
                None,
                "STARTTLS is not enabled".to_owned(),
            );
            return Ok(());
        },
    };

    if io.is_tls() {
        send_cond(
            sender,
            Some(tag),
            s::RespCondType::Bad,
            None,
            "Already using TLS".to_owned(),
        );
        return Ok(());
    }

    if reader.has_buffered() {
        // Cleartext data pipelined past STARTTLS could be an injection
        // attempt; refuse it.
        send_cond(
            sender,
            Some(tag),
            s::RespCondType::Bad,
            None,
            "Pipelining across STARTTLS is not permitted".to_owned(),
        );
        return Ok(());
    }

    send_cond(
        sender,
        Some(tag),
        s::RespCondType::Ok,
        None,
        "Begin TLS negotiation now".to_owned(),
    );

    let (ack_tx, ack_rx) = tokio::sync::oneshot::channel();
    if sender.send(OutputEvent::FlushAck(ack_tx)).is_err() {
        return Err(Error::Io(io::ErrorKind::BrokenPipe.into()));
    }
    let _ = ack_rx.await;

    io.ssl_accept(acceptor).await?;
    info!("{} TLS established", processor.log_prefix());
    Ok(())
}

fn send_line(
    sender: &UnboundedSender<OutputEvent>,
    line: s::ResponseLine<'static>,
    ctl: OutputControl,
) {
    let _ = sender.send(OutputEvent::ResponseLine { line, ctl });
}

fn send_cond(
    sender: &UnboundedSender<OutputEvent>,
    tag: Option<String>,
    cond: s::RespCondType,
    code: Option<s::RespTextCode<'static>>,
    quip: String,
) {
    send_line(
        sender,
        s::ResponseLine {
            tag: tag.map(Cow::Owned),
            response: s::Response::Cond(s::CondResponse {
                cond,
                code,
                quip: Some(Cow::Owned(quip)),
            }),
        },
        OutputControl::Flush,
    );
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(&msg) = panic.downcast_ref::<&'static str>() {
        msg.to_owned()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "Internal error".to_owned()
    }
}
