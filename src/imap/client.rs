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

//! A line-level test client.
//!
//! **THIS IS NOT A GENERAL-PURPOSE IMAP CLIENT.** It understands just
//! enough of the wire format to drive the integration tests: logical lines
//! (including server literals) and raw writes. Assertions happen at the
//! byte level in the tests themselves.

use std::io::{self, BufRead, Read, Write};
use std::str;

use lazy_static::lazy_static;
use regex::bytes::Regex;

lazy_static! {
    static ref LITERAL_AT_EOL: Regex =
        Regex::new(r#"\{([0-9]+)\}\r\n$"#).unwrap();
}

pub struct Client<R, W> {
    read: R,
    write: W,
    trace_stderr: Option<&'static str>,
}

impl<R: BufRead, W: Write> Client<R, W> {
    pub fn new(read: R, write: W, trace_stderr: Option<&'static str>) -> Self {
        Client {
            read,
            write,
            trace_stderr,
        }
    }

    /// Writes a single command line; the CRLF is appended here.
    pub fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.trace(">>", line.as_bytes());
        self.write.write_all(line.as_bytes())?;
        self.write.write_all(b"\r\n")?;
        self.write.flush()
    }

    /// Writes raw bytes, e.g. a literal payload.
    pub fn write_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.trace(">>", bytes);
        self.write.write_all(bytes)?;
        self.write.flush()
    }

    /// Reads one raw line into `dst`, returning the number of bytes read.
    /// Zero means EOF.
    pub fn read_line_raw(&mut self, dst: &mut Vec<u8>) -> io::Result<usize> {
        let start = dst.len();
        let nread = self.read.read_until(b'\n', dst)?;
        self.trace("<<", &dst[start..]);
        Ok(nread)
    }

    /// Reads one logical line: a raw line plus any server literals it
    /// announces.
    pub fn read_logical_line(&mut self, dst: &mut Vec<u8>) -> io::Result<()> {
        loop {
            let nread = self.read_line_raw(dst)?;
            if 0 == nread {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "EOF while reading logical line",
                ));
            }

            let literal_len = LITERAL_AT_EOL
                .captures(&dst[dst.len() - nread..])
                .and_then(|cap| {
                    str::from_utf8(cap.get(1).unwrap().as_bytes())
                        .ok()?
                        .parse::<u32>()
                        .ok()
                });

            match literal_len {
                Some(literal_len) => {
                    let start = dst.len();
                    let nread = self
                        .read
                        .by_ref()
                        .take(literal_len.into())
                        .read_to_end(dst)?;
                    self.trace("<<", &dst[start..]);
                    if nread < literal_len as usize {
                        return Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "EOF inside literal",
                        ));
                    }
                },
                None => return Ok(()),
            }
        }
    }

    fn trace(&self, what: &str, data: &[u8]) {
        if let Some(prefix) = self.trace_stderr {
            let mut vis = String::new();
            for &byte in data.iter().take(256) {
                match byte {
                    b' '..=b'~' => vis.push(byte as char),
                    b'\n' => vis.push_str("\\n"),
                    b'\r' => vis.push_str("\\r"),
                    b => vis.push_str(&format!("\\x{:02X}", b)),
                }
            }
            eprintln!("{} WIRE {} {}", prefix, what, vis);
        }
    }
}
