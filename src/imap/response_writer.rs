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

use std::io;

use tokio::io::AsyncWriteExt as _;

use super::{lex::LexWriter, syntax as s};
use crate::support::async_io::ServerIo;

/// An event to be sent to the client.
pub enum OutputEvent {
    /// A full response line.
    ResponseLine {
        line: s::ResponseLine<'static>,
        ctl: OutputControl,
    },
    /// A continuation line, i.e. `+ {prompt}\r\n`.
    ContinuationLine { prompt: &'static str },
    /// Flush, then report completion on the channel. Used to quiesce the
    /// writer before a STARTTLS handshake takes over the socket.
    FlushAck(tokio::sync::oneshot::Sender<()>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputControl {
    /// No special handling; the response may continue to be buffered.
    Buffer,
    /// Flush all internal buffers after writing this response.
    Flush,
}

const TEXT_FLUSH_THRESH: usize = 4096;

/// Actor for writing responses to the client.
///
/// Runs until an error occurs or the event channel is closed. Everything a
/// session emits, including cross-session IDLE notifications, funnels
/// through here, which is what keeps response bytes from interleaving.
pub async fn write_responses(
    mut io: ServerIo,
    mut outputs: tokio::sync::mpsc::UnboundedReceiver<OutputEvent>,
) -> io::Result<()> {
    let mut text = Vec::<u8>::with_capacity(TEXT_FLUSH_THRESH * 5 / 4);

    while let Some(evt) = outputs.recv().await {
        let ctl = match evt {
            OutputEvent::ResponseLine { line, ctl } => {
                line.write_to(&mut LexWriter::new(&mut text, false))?;
                text.extend_from_slice(b"\r\n");
                ctl
            },

            OutputEvent::ContinuationLine { prompt } => {
                text.extend_from_slice(b"+ ");
                text.extend_from_slice(prompt.as_bytes());
                text.extend_from_slice(b"\r\n");
                OutputControl::Flush
            },

            OutputEvent::FlushAck(ack) => {
                flush(&mut io, &mut text).await?;
                let _ = ack.send(());
                continue;
            },
        };

        match ctl {
            OutputControl::Buffer => {
                if text.len() >= TEXT_FLUSH_THRESH {
                    flush(&mut io, &mut text).await?;
                }
            },

            OutputControl::Flush => flush(&mut io, &mut text).await?,
        }
    }

    flush(&mut io, &mut text).await?;
    Ok(())
}

async fn flush(io: &mut ServerIo, text: &mut Vec<u8>) -> io::Result<()> {
    if !text.is_empty() {
        io.write_all(text).await?;
        text.clear();
    }

    Ok(())
}
