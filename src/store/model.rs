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

//! Data types exchanged between the protocol layer and the mailbox storage
//! backend.

use std::fmt;
use std::str::FromStr;

use chrono::prelude::*;

use crate::support::error::Error;

/// A message flag.
///
/// System flags have their own variants; anything else is a keyword.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Flag {
    Answered,
    Deleted,
    Draft,
    Flagged,
    Seen,
    Keyword(String),
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            &Flag::Answered => write!(f, "\\Answered"),
            &Flag::Deleted => write!(f, "\\Deleted"),
            &Flag::Draft => write!(f, "\\Draft"),
            &Flag::Flagged => write!(f, "\\Flagged"),
            &Flag::Seen => write!(f, "\\Seen"),
            &Flag::Keyword(ref kw) => write!(f, "{}", kw),
        }
    }
}

impl fmt::Debug for Flag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        <Flag as fmt::Display>::fmt(self, f)
    }
}

impl FromStr for Flag {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        if s.eq_ignore_ascii_case("\\answered") {
            Ok(Flag::Answered)
        } else if s.eq_ignore_ascii_case("\\deleted") {
            Ok(Flag::Deleted)
        } else if s.eq_ignore_ascii_case("\\draft") {
            Ok(Flag::Draft)
        } else if s.eq_ignore_ascii_case("\\flagged") {
            Ok(Flag::Flagged)
        } else if s.eq_ignore_ascii_case("\\seen") {
            Ok(Flag::Seen)
        } else if s.starts_with('\\') {
            Err(Error::Syntax(format!("Unknown system flag: {}", s)))
        } else if !s.is_empty()
            && s.as_bytes().iter().copied().all(is_atom_char)
        {
            Ok(Flag::Keyword(s.to_owned()))
        } else {
            Err(Error::Syntax(format!("Invalid flag: {}", s)))
        }
    }
}

fn is_atom_char(ch: u8) -> bool {
    match ch {
        0..=b' ' => false,
        127..=255 => false,
        b'(' | b')' | b'{' | b'*' | b'%' | b'\\' | b'"' | b']' => false,
        _ => true,
    }
}

/// Summary counters for a mailbox, as returned by select/examine/status.
///
/// `uidvalidity` is a string because the backend contract allows it to be
/// empty, which is the "cannot produce one" sentinel and must surface to the
/// client as a failure.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MailboxHeader {
    /// Total number of messages.
    pub exists: u32,
    /// Number of messages with the session-transient recent marker.
    pub recent: u32,
    /// Number of messages without `\Seen`.
    pub unseen: u32,
    /// The UID that will be assigned to the next arriving message.
    pub uidnext: u32,
    /// The UID validity token, or `""` if the backend cannot produce one.
    pub uidvalidity: String,
}

/// Items a `STATUS` command may request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusItem {
    Messages,
    Recent,
    Uidnext,
    Uidvalidity,
    Unseen,
}

impl StatusItem {
    pub fn name(self) -> &'static str {
        match self {
            StatusItem::Messages => "MESSAGES",
            StatusItem::Recent => "RECENT",
            StatusItem::Uidnext => "UIDNEXT",
            StatusItem::Uidvalidity => "UIDVALIDITY",
            StatusItem::Unseen => "UNSEEN",
        }
    }
}

impl FromStr for StatusItem {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        if s.eq_ignore_ascii_case("messages") {
            Ok(StatusItem::Messages)
        } else if s.eq_ignore_ascii_case("recent") {
            Ok(StatusItem::Recent)
        } else if s.eq_ignore_ascii_case("uidnext") {
            Ok(StatusItem::Uidnext)
        } else if s.eq_ignore_ascii_case("uidvalidity") {
            Ok(StatusItem::Uidvalidity)
        } else if s.eq_ignore_ascii_case("unseen") {
            Ok(StatusItem::Unseen)
        } else {
            Err(Error::Syntax(format!("Unknown STATUS item: {}", s)))
        }
    }
}

/// One entry of a LIST or LSUB response: mailbox name plus name attributes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListEntry {
    pub name: String,
    pub flags: Vec<String>,
}

/// A parsed SEARCH program.
///
/// Leaf keys are carried as canonical text (keyword upper-cased, arguments
/// in their wire form); interpreting them is the backend's business. The
/// tree structure captures `NOT`, `OR` and parenthesised lists.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SearchNode {
    Key(String),
    List(Vec<SearchNode>),
    Not(Box<SearchNode>),
    Or(Box<SearchNode>, Box<SearchNode>),
}

/// One attribute a FETCH command may request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FetchAtt {
    Envelope,
    Flags,
    InternalDate,
    Rfc822,
    Rfc822Header,
    Rfc822Size,
    Rfc822Text,
    Body,
    BodyStructure,
    /// `BODY[...]` or `BODY.PEEK[...]`; the section text is passed through
    /// verbatim for the backend to interpret.
    BodySection { peek: bool, section: String },
    Uid,
}

/// The attribute list of a FETCH command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FetchTarget {
    All,
    Fast,
    Full,
    Single(FetchAtt),
    Multi(Vec<FetchAtt>),
}

/// How a STORE command combines the given flags with the current set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreType {
    Set,
    Add,
    Remove,
}

/// One datum of an untagged FETCH response emitted by the backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FetchItem {
    Flags(Vec<Flag>),
    Uid(u32),
    Rfc822Size(u32),
    InternalDate(DateTime<FixedOffset>),
    /// A named literal payload, e.g. `RFC822` or `BODY[]`.
    Literal { name: String, data: Vec<u8> },
}

/// Failure modes shared by most mailbox operations.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("No such mailbox")]
    NxMailbox,
    #[error("Mailbox is not selectable")]
    Unselectable,
    #[error("{0}")]
    Other(String),
}

/// Failure modes of APPEND, which additionally distinguishes a truncated
/// client stream.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum AppendError {
    #[error("No such mailbox")]
    NxMailbox,
    #[error("Mailbox is not selectable")]
    Unselectable,
    #[error("Truncated message")]
    Truncated,
    #[error("{0}")]
    Other(String),
}

/// Failure modes of authentication.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("Unsupported authentication mechanism")]
    UnsupportedMechanism,
    #[error("Malformed authentication data")]
    Malformed,
    #[error("Bad user id or password")]
    BadCredentials,
}

pub type StoreResult<T> = Result<T, StoreError>;
