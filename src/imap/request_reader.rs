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

//! Manages the state of the network input.
//!
//! `read_logical_command` assembles one logical command: it reads
//! CRLF-terminated lines, detects trailing `{n}` / `{n+}` literal markers,
//! sends the continuation line for synchronizing literals, and splices the
//! payload into the buffer with the marker kept in-band so the command
//! parser sees a single context-free buffer.
//!
//! `APPEND` and `LAPPEND` are special: their literals can be much larger
//! than the command-line cap and are consumed by the storage backend
//! straight off the connection, so the reader returns their command buffer
//! with the literal marker still unconsumed at the end.

use std::io;
use std::pin::Pin;
use std::task;
use std::time::Duration;

use lazy_static::lazy_static;
use regex::bytes::Regex;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio::sync::mpsc::UnboundedSender;

use super::response_writer::OutputEvent;

lazy_static! {
    static ref LITERAL_AT_EOL: Regex =
        Regex::new(r#"~?\{([0-9]+)(\+?)\}\r?\n$"#).unwrap();
    static ref LITERAL_AT_END: Regex =
        Regex::new(r#"~?\{([0-9]+)(\+?)\}$"#).unwrap();
    static ref APPEND_START: Regex =
        Regex::new(r#"(?i)^[^ ]+ L?APPEND "#).unwrap();
}

/// Command lines (excluding APPEND literals) are capped at 10 KiB.
pub const MAX_CMDLINE: usize = 10240;

/// How long we are willing to wait for each chunk of a literal payload.
const LITERAL_TIMEOUT: Duration = Duration::from_secs(5);

/// How much of an overlong line is retained for recovering the tag.
const TOO_LONG_HEAD: usize = 256;

#[derive(Debug)]
pub enum ReadError {
    /// The command exceeded `MAX_CMDLINE`. The protocol has been
    /// resynchronised; the session may continue.
    TooLong { tag: Option<String> },
    /// A literal chunk did not arrive within `LITERAL_TIMEOUT`.
    LiteralTimeout { tag: Option<String> },
    Io(io::Error),
}

impl From<io::Error> for ReadError {
    fn from(e: io::Error) -> Self {
        ReadError::Io(e)
    }
}

enum NextLine {
    /// A complete line, including its terminating newline.
    Line(Vec<u8>),
    /// EOF at a line boundary.
    Eof,
    /// The line exceeded the given limit. The rest of it has been
    /// discarded; `head` is its retained prefix.
    TooLong { head: Vec<u8> },
}

pub struct RequestReader<R> {
    io: R,
    /// Bytes read from `io` but not yet consumed.
    pending: Vec<u8>,
    /// The consumed prefix of `pending`.
    offset: usize,
}

impl<R: AsyncRead + Unpin> RequestReader<R> {
    pub fn new(io: R) -> Self {
        Self {
            io,
            pending: Vec::with_capacity(4096),
            offset: 0,
        }
    }

    /// Whether any already-read bytes are waiting to be consumed.
    ///
    /// Used to refuse a STARTTLS when the client has pipelined cleartext
    /// data past the command.
    pub fn has_buffered(&self) -> bool {
        self.offset < self.pending.len()
    }

    /// Assembles the next logical command.
    ///
    /// `Ok(None)` is clean EOF at a command boundary. The returned buffer
    /// has its final CRLF removed; interior literal markers and payloads
    /// are preserved in-band. For APPEND/LAPPEND the buffer ends with the
    /// yet-unconsumed literal marker (see `trailing_literal`).
    pub async fn read_logical_command(
        &mut self,
        sender: &UnboundedSender<OutputEvent>,
    ) -> Result<Option<Vec<u8>>, ReadError> {
        let mut cmd = Vec::<u8>::new();

        loop {
            let line = match self
                .next_line(MAX_CMDLINE.saturating_sub(cmd.len()))
                .await?
            {
                NextLine::Line(line) => line,
                NextLine::Eof => {
                    if cmd.is_empty() {
                        return Ok(None);
                    }
                    // EOF in the middle of a command; return what we have
                    // and let the parser reject it.
                    trim_crlf(&mut cmd);
                    return Ok(Some(cmd));
                },
                NextLine::TooLong { head } => {
                    return Err(ReadError::TooLong {
                        tag: recover_tag(if cmd.is_empty() {
                            &head
                        } else {
                            &cmd
                        }),
                    });
                },
            };

            cmd.extend_from_slice(&line);

            let Some((len, literal_plus)) = check_literal_eol(&cmd) else {
                trim_crlf(&mut cmd);
                return Ok(Some(cmd));
            };

            // APPEND consumes its literal itself through the storage
            // backend, so hand the command over with the marker intact.
            if APPEND_START.is_match(&cmd) {
                trim_crlf(&mut cmd);
                return Ok(Some(cmd));
            }

            if cmd.len() + len as usize > MAX_CMDLINE {
                let tag = recover_tag(&cmd);
                if literal_plus {
                    // The client has already committed to sending the
                    // payload; drain it to stay synchronised.
                    self.drain_literal(len, &tag).await?;
                    self.skip_rest_of_command(&tag).await?;
                }
                return Err(ReadError::TooLong { tag });
            }

            if !literal_plus
                && sender
                    .send(OutputEvent::ContinuationLine { prompt: "" })
                    .is_err()
            {
                return Err(io::Error::from(io::ErrorKind::BrokenPipe).into());
            }

            self.read_literal_into(&mut cmd, len).await?;
        }
    }

    /// Reads a single raw line (without its line ending), used for the
    /// AUTHENTICATE continuation and the line terminating an APPEND.
    ///
    /// `Ok(None)` is EOF.
    pub async fn read_raw_line(&mut self) -> Result<Option<Vec<u8>>, ReadError> {
        match self.next_line(MAX_CMDLINE).await? {
            NextLine::Eof => Ok(None),
            NextLine::TooLong { head } => Err(ReadError::TooLong {
                tag: recover_tag(&head),
            }),
            NextLine::Line(mut line) => {
                trim_crlf(&mut line);
                Ok(Some(line))
            },
        }
    }

    /// Returns an `AsyncRead` yielding exactly the next `len` bytes, for
    /// streaming an APPEND literal into the storage backend.
    pub fn read_append_literal(
        &mut self,
        len: u32,
    ) -> impl AsyncRead + Unpin + '_ {
        self.take(u64::from(len))
    }

    /// Reads and discards `len` literal bytes.
    pub async fn drain_literal(
        &mut self,
        len: u32,
        tag: &Option<String>,
    ) -> Result<(), ReadError> {
        let mut remaining = len as usize;
        let mut scratch = [0u8; 4096];

        while remaining > 0 {
            let take = remaining.min(scratch.len());
            let nread = self.timed_read(&mut scratch[..take], tag).await?;
            if 0 == nread {
                return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
            }
            remaining -= nread;
        }

        Ok(())
    }

    /// Discards input until the end of the current command: lines are
    /// skipped, and LITERAL+ payloads are drained, until a line without a
    /// trailing literal is reached.
    async fn skip_rest_of_command(
        &mut self,
        tag: &Option<String>,
    ) -> Result<(), ReadError> {
        loop {
            match self.next_line(MAX_CMDLINE).await? {
                NextLine::Eof => return Ok(()),
                NextLine::TooLong { .. } => continue,
                NextLine::Line(line) => {
                    match check_literal_eol(&line) {
                        // A synchronizing literal is aborted by the error
                        // response already sent; the client won't transmit
                        // the payload.
                        Some((len, true)) => {
                            self.drain_literal(len, tag).await?
                        },
                        _ => return Ok(()),
                    }
                },
            }
        }
    }

    async fn read_literal_into(
        &mut self,
        cmd: &mut Vec<u8>,
        len: u32,
    ) -> Result<(), ReadError> {
        let mut remaining = len as usize;
        let mut scratch = [0u8; 4096];

        while remaining > 0 {
            let take = remaining.min(scratch.len());
            let tag = recover_tag(cmd);
            let nread = self.timed_read(&mut scratch[..take], &tag).await?;
            if 0 == nread {
                return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
            }
            cmd.extend_from_slice(&scratch[..nread]);
            remaining -= nread;
        }

        Ok(())
    }

    /// One read with the per-chunk literal timeout applied. The read races
    /// a 5-second timer; if the timer wins, the pending read is dropped.
    async fn timed_read(
        &mut self,
        dst: &mut [u8],
        tag: &Option<String>,
    ) -> Result<usize, ReadError> {
        match tokio::time::timeout(LITERAL_TIMEOUT, self.read_some(dst)).await {
            Ok(result) => Ok(result?),
            Err(_elapsed) => Err(ReadError::LiteralTimeout { tag: tag.clone() }),
        }
    }

    async fn read_some(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        if self.offset == self.pending.len() && 0 == self.fill().await? {
            return Ok(0);
        }

        let avail = &self.pending[self.offset..];
        let n = avail.len().min(dst.len());
        dst[..n].copy_from_slice(&avail[..n]);
        self.offset += n;
        Ok(n)
    }

    async fn next_line(&mut self, limit: usize) -> io::Result<NextLine> {
        let mut line = Vec::<u8>::new();

        loop {
            if self.offset == self.pending.len() && 0 == self.fill().await? {
                return Ok(if line.is_empty() {
                    NextLine::Eof
                } else {
                    NextLine::Line(line)
                });
            }

            let avail = &self.pending[self.offset..];
            if let Some(lf) = memchr::memchr(b'\n', avail) {
                line.extend_from_slice(&avail[..=lf]);
                self.offset += lf + 1;

                return Ok(if line.len() > limit {
                    NextLine::TooLong {
                        head: truncate_head(line),
                    }
                } else {
                    NextLine::Line(line)
                });
            }

            line.extend_from_slice(avail);
            self.offset = self.pending.len();

            if line.len() > limit {
                self.discard_to_eol().await?;
                return Ok(NextLine::TooLong {
                    head: truncate_head(line),
                });
            }
        }
    }

    async fn discard_to_eol(&mut self) -> io::Result<()> {
        loop {
            if self.offset == self.pending.len() && 0 == self.fill().await? {
                return Ok(());
            }

            let avail = &self.pending[self.offset..];
            match memchr::memchr(b'\n', avail) {
                Some(lf) => {
                    self.offset += lf + 1;
                    return Ok(());
                },
                None => self.offset = self.pending.len(),
            }
        }
    }

    /// Performs a read into `pending`, first dropping anything already
    /// consumed. Returns the number of bytes read; 0 is EOF.
    async fn fill(&mut self) -> io::Result<usize> {
        if self.offset == self.pending.len() {
            self.pending.clear();
            self.offset = 0;
        }

        self.io.read_buf(&mut self.pending).await
    }
}

/// The `AsyncRead` implementation reads from the logical byte stream:
/// already-buffered bytes first, then the underlying reader.
impl<R: AsyncRead + Unpin> AsyncRead for RequestReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> task::Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.offset < this.pending.len() {
            let avail = &this.pending[this.offset..];
            let n = buf.remaining().min(avail.len());
            buf.put_slice(&avail[..n]);
            this.offset += n;
            task::Poll::Ready(Ok(()))
        } else {
            Pin::new(&mut this.io).poll_read(ctx, buf)
        }
    }
}

/// Checks whether `buffer` (a logical command with its final CRLF already
/// removed) ends with a literal marker, returning the text before the
/// marker, the declared length, and whether the non-synchronizing form was
/// used.
pub fn trailing_literal(buffer: &[u8]) -> Option<(&[u8], u32, bool)> {
    LITERAL_AT_END.captures(buffer).and_then(|c| {
        let m0 = c.get(0)?;
        let len = std::str::from_utf8(c.get(1)?.as_bytes())
            .ok()?
            .parse::<u32>()
            .ok()?;
        Some((
            &buffer[..m0.start()],
            len,
            !c.get(2)?.as_bytes().is_empty(),
        ))
    })
}

fn check_literal_eol(buffer: &[u8]) -> Option<(u32, bool)> {
    LITERAL_AT_EOL.captures(buffer).and_then(|c| {
        let len = std::str::from_utf8(c.get(1)?.as_bytes())
            .ok()?
            .parse::<u32>()
            .ok()?;
        Some((len, !c.get(2)?.as_bytes().is_empty()))
    })
}

fn recover_tag(buffer: &[u8]) -> Option<String> {
    match super::syntax::UnknownCommandFragment::parse(buffer) {
        Ok((_, frag)) => Some(frag.tag.into_owned()),
        Err(_) => None,
    }
}

fn trim_crlf(buffer: &mut Vec<u8>) {
    if buffer.ends_with(b"\n") {
        buffer.pop();
    }
    if buffer.ends_with(b"\r") {
        buffer.pop();
    }
}

fn truncate_head(mut line: Vec<u8>) -> Vec<u8> {
    line.truncate(TOO_LONG_HEAD);
    line
}
