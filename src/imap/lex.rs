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

//! Utilities for *writing* values under IMAP's "lexical rules".
//!
//! This is write-only since IMAP's lexical syntax is not separable from its
//! grammar.
//!
//! The code here decides which form to use to encode a string: atom, quoted
//! string, or literal. We are conservative: a value is only written as an
//! atom if all its characters are in `a-zA-Z0-9?=+/_.-` and it is not "NIL",
//! and only written as a quoted string if it is shorter than 100 bytes and
//! free of controls, backslash and double-quote. Everything else becomes a
//! literal.

use std::io::{self, Write};

use chrono::prelude::*;

use crate::store::model::Flag;

#[derive(Clone, Copy, Debug)]
pub struct LexWriter<W> {
    writer: W,
    /// Whether literals are written in the non-synchronizing `{n+}` form.
    /// Only the client side (tests) sets this; server responses use plain
    /// literals.
    literal_plus: bool,
}

impl<W: Write> LexWriter<W> {
    pub fn new(writer: W, literal_plus: bool) -> Self {
        LexWriter {
            writer,
            literal_plus,
        }
    }

    #[cfg(test)]
    pub fn into_inner(self) -> W {
        self.writer
    }

    pub fn verbatim(&mut self, s: &str) -> io::Result<()> {
        self.writer.write_all(s.as_bytes())?;
        Ok(())
    }

    pub fn nil(&mut self) -> io::Result<()> {
        self.verbatim("NIL")
    }

    pub fn astring(&mut self, s: &str) -> io::Result<()> {
        if is_conservative_atom(s) {
            write!(self.writer, "{}", s)?;
        } else {
            self.string(s)?;
        }

        Ok(())
    }

    pub fn nstring(&mut self, s: &Option<impl AsRef<str>>) -> io::Result<()> {
        match s.as_ref() {
            None => self.nil(),
            Some(s) => self.string(s.as_ref()),
        }
    }

    pub fn string(&mut self, s: &str) -> io::Result<()> {
        if is_quotable(s) {
            write!(self.writer, "\"{}\"", s)?;
        } else {
            self.literal(s.as_bytes())?;
        }

        Ok(())
    }

    /// Mailbox names follow astring rules; they pass through verbatim
    /// otherwise (no modified-UTF-7 repair here).
    pub fn mailbox(&mut self, name: &str) -> io::Result<()> {
        self.astring(name)
    }

    pub fn literal(&mut self, data: &[u8]) -> io::Result<()> {
        write!(
            self.writer,
            "{{{}{}}}\r\n",
            data.len(),
            if self.literal_plus { "+" } else { "" },
        )?;
        self.writer.write_all(data)?;
        Ok(())
    }

    pub fn flag(&mut self, flag: &Flag) -> io::Result<()> {
        write!(self.writer, "{}", flag)
    }

    pub fn flags(&mut self, flags: &[Flag]) -> io::Result<()> {
        self.verbatim("(")?;
        for (ix, flag) in flags.iter().enumerate() {
            if ix > 0 {
                self.verbatim(" ")?;
            }
            self.flag(flag)?;
        }
        self.verbatim(")")
    }

    pub fn datetime(
        &mut self,
        datetime: &DateTime<FixedOffset>,
    ) -> io::Result<()> {
        write!(
            self.writer,
            "\"{}\"",
            datetime.format("%_d-%b-%Y %H:%M:%S %z")
        )
    }

    pub fn num_u32(&mut self, value: u32) -> io::Result<()> {
        write!(self.writer, "{}", value)
    }
}

pub(crate) fn is_conservative_atom(s: &str) -> bool {
    !"nil".eq_ignore_ascii_case(s)
        && !s.is_empty()
        && s.as_bytes().iter().copied().all(|b| {
            matches!(
                b,
                b'a'..=b'z'
                | b'A'..=b'Z'
                | b'0'..=b'9'
                | b'='
                | b'?'
                | b'/'
                | b'+'
                | b'_'
                | b'.'
                | b'-'
            )
        })
}

fn is_quotable(s: &str) -> bool {
    s.len() < 100
        && s.as_bytes()
            .iter()
            .copied()
            .all(|b| !matches!(b, 0..=31 | 127 | b'\\' | b'"'))
}
