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

//! Code for reading IMAP requests and writing IMAP responses.
//!
//! The parsers operate on a single already-spliced buffer produced by the
//! request reader; literal payloads appear in-band after their `{n}` marker,
//! which keeps the grammar context-free. `APPEND`, `LAPPEND` and
//! `AUTHENTICATE` are not complete commands at this level: the protocol
//! layer recognises their start forms and drives the continuation itself.
//!
//! Sequence sets are not interpreted here. They are recognised at an
//! extremely primitive level and returned as strings, since full
//! interpretation requires mailbox context the parser doesn't have. SEARCH
//! programs are parsed into their NOT/OR/list structure with leaf keys
//! carried as canonical text for the backend.

use std::borrow::Cow;
use std::io::{self, Write};
use std::str;

use chrono::prelude::*;
use nom::{
    branch::alt,
    bytes,
    bytes::complete::{is_a, is_not, tag, tag_no_case as kw},
    character,
    combinator::{map, map_opt, opt},
    multi, sequence, IResult,
};

use super::lex::{is_conservative_atom, LexWriter};
use crate::store::model::{
    FetchAtt, FetchItem, FetchTarget, Flag, SearchNode, StatusItem, StoreType,
};

macro_rules! simple_enum {
    (enum $name:ident { $($var:ident($text:expr),)+ }) => {
        #[derive(Clone, Copy, Debug, PartialEq, Eq)]
        pub enum $name {
            $($var,)+
        }

        impl $name {
            pub fn name(self) -> &'static str {
                match self {
                    $($name::$var => $text,)+
                }
            }

            fn parse(i: &[u8]) -> IResult<&[u8], Self> {
                alt(($(map(kw($text), |_| $name::$var),)+))(i)
            }
        }
    };
}

simple_enum! {
    enum SimpleCommand {
        Capability("CAPABILITY"),
        Check("CHECK"),
        Close("CLOSE"),
        Expunge("EXPUNGE"),
        Idle("IDLE"),
        LogOut("LOGOUT"),
        Noop("NOOP"),
        StartTls("STARTTLS"),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RespCondType {
    Ok,
    No,
    Bad,
    Bye,
    Preauth,
}

impl RespCondType {
    pub fn name(self) -> &'static str {
        match self {
            RespCondType::Ok => "OK",
            RespCondType::No => "NO",
            RespCondType::Bad => "BAD",
            RespCondType::Bye => "BYE",
            RespCondType::Preauth => "PREAUTH",
        }
    }
}

// ==================== Commands ====================

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandLine<'a> {
    pub tag: Cow<'a, str>,
    pub cmd: Command<'a>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command<'a> {
    Simple(SimpleCommand),
    Id(Vec<Option<Cow<'a, str>>>),
    LogIn(LogInCommand<'a>),
    Create(CreateCommand<'a>),
    Delete(DeleteCommand<'a>),
    Examine(ExamineCommand<'a>),
    Select(SelectCommand<'a>),
    Subscribe(SubscribeCommand<'a>),
    Unsubscribe(UnsubscribeCommand<'a>),
    Rename(RenameCommand<'a>),
    List(ListCommand<'a>),
    Lsub(ListCommand<'a>),
    Status(StatusCommand<'a>),
    Fetch(FetchCommand<'a>),
    Store(StoreCommand<'a>),
    Copy(CopyCommand<'a>),
    Search(SearchCommand<'a>),
    Uid(UidCommand<'a>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UidCommand<'a> {
    Copy(CopyCommand<'a>),
    Fetch(FetchCommand<'a>),
    Search(SearchCommand<'a>),
    Store(StoreCommand<'a>),
}

macro_rules! mailbox_command {
    ($($name:ident($verb:expr),)+) => {
        $(
            #[derive(Clone, Debug, PartialEq, Eq)]
            pub struct $name<'a> {
                pub mailbox: Cow<'a, str>,
            }

            impl<'a> $name<'a> {
                fn parse(i: &'a [u8]) -> IResult<&'a [u8], Self> {
                    map(
                        sequence::preceded(
                            sequence::pair(kw($verb), tag(" ")),
                            mailbox,
                        ),
                        |mailbox| $name { mailbox },
                    )(i)
                }

                fn write_to(
                    &self,
                    w: &mut LexWriter<impl Write>,
                ) -> io::Result<()> {
                    w.verbatim($verb)?;
                    w.verbatim(" ")?;
                    w.mailbox(&self.mailbox)
                }
            }
        )+
    };
}

mailbox_command! {
    CreateCommand("CREATE"),
    DeleteCommand("DELETE"),
    ExamineCommand("EXAMINE"),
    SelectCommand("SELECT"),
    SubscribeCommand("SUBSCRIBE"),
    UnsubscribeCommand("UNSUBSCRIBE"),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogInCommand<'a> {
    pub userid: Cow<'a, str>,
    pub password: Cow<'a, str>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RenameCommand<'a> {
    pub src: Cow<'a, str>,
    pub dst: Cow<'a, str>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListCommand<'a> {
    pub reference: Cow<'a, str>,
    pub pattern: Cow<'a, str>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusCommand<'a> {
    pub mailbox: Cow<'a, str>,
    pub items: Vec<StatusItem>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchCommand<'a> {
    pub sequence_set: Cow<'a, str>,
    pub target: FetchTarget,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreCommand<'a> {
    pub sequence_set: Cow<'a, str>,
    pub typ: StoreType,
    pub silent: bool,
    pub flags: Vec<Flag>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CopyCommand<'a> {
    pub sequence_set: Cow<'a, str>,
    pub mailbox: Cow<'a, str>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SearchCommand<'a> {
    pub charset: Option<Cow<'a, str>>,
    pub program: SearchNode,
}

/// The fixed prefix of an `AUTHENTICATE` command.
///
/// The rest of the exchange (continuation, client response) is driven by the
/// protocol layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthenticateCommandStart<'a> {
    pub tag: Cow<'a, str>,
    pub auth_type: Cow<'a, str>,
    pub initial_response: Option<Cow<'a, str>>,
}

/// Everything of an `APPEND` command before its literal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppendCommandStart<'a> {
    pub tag: Cow<'a, str>,
    pub mailbox: Cow<'a, str>,
    pub flags: Vec<Flag>,
    pub internal_date: Option<DateTime<FixedOffset>>,
}

/// Everything of an `LAPPEND` command before its literal.
///
/// LAPPEND is the privileged local-injection variant of APPEND: it names the
/// target user explicitly and is only legal before authentication.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LappendCommandStart<'a> {
    pub tag: Cow<'a, str>,
    pub user: Cow<'a, str>,
    pub mailbox: Cow<'a, str>,
}

/// Fallback parse which extracts just the tag of an otherwise
/// incomprehensible command so the rejection can be tagged properly.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnknownCommandFragment<'a> {
    pub tag: Cow<'a, str>,
}

impl<'a> CommandLine<'a> {
    pub fn parse(i: &'a [u8]) -> IResult<&'a [u8], Self> {
        map(
            sequence::tuple((tag_atom, tag(" "), Command::parse)),
            |(tag, _, cmd)| CommandLine { tag, cmd },
        )(i)
    }

    pub fn write_to(&self, w: &mut LexWriter<impl Write>) -> io::Result<()> {
        w.verbatim(&self.tag)?;
        w.verbatim(" ")?;
        self.cmd.write_to(w)
    }
}

impl<'a> Command<'a> {
    pub fn parse(i: &'a [u8]) -> IResult<&'a [u8], Self> {
        alt((
            // IDLE must be tried before ID.
            map(SimpleCommand::parse, Command::Simple),
            map(id_params, Command::Id),
            map(LogInCommand::parse, Command::LogIn),
            map(CreateCommand::parse, Command::Create),
            map(DeleteCommand::parse, Command::Delete),
            map(ExamineCommand::parse, Command::Examine),
            map(SelectCommand::parse, Command::Select),
            map(SubscribeCommand::parse, Command::Subscribe),
            map(UnsubscribeCommand::parse, Command::Unsubscribe),
            map(RenameCommand::parse, Command::Rename),
            map(list_command("LIST"), Command::List),
            map(list_command("LSUB"), Command::Lsub),
            map(StatusCommand::parse, Command::Status),
            map(FetchCommand::parse, Command::Fetch),
            map(StoreCommand::parse, Command::Store),
            map(CopyCommand::parse, Command::Copy),
            map(SearchCommand::parse, Command::Search),
            map(uid_command, Command::Uid),
        ))(i)
    }

    pub fn write_to(&self, w: &mut LexWriter<impl Write>) -> io::Result<()> {
        match *self {
            Command::Simple(cmd) => w.verbatim(cmd.name()),
            Command::Id(ref params) => write_id_params(w, params),
            Command::LogIn(ref cmd) => cmd.write_to(w),
            Command::Create(ref cmd) => cmd.write_to(w),
            Command::Delete(ref cmd) => cmd.write_to(w),
            Command::Examine(ref cmd) => cmd.write_to(w),
            Command::Select(ref cmd) => cmd.write_to(w),
            Command::Subscribe(ref cmd) => cmd.write_to(w),
            Command::Unsubscribe(ref cmd) => cmd.write_to(w),
            Command::Rename(ref cmd) => cmd.write_to(w),
            Command::List(ref cmd) => cmd.write_to(w, "LIST"),
            Command::Lsub(ref cmd) => cmd.write_to(w, "LSUB"),
            Command::Status(ref cmd) => cmd.write_to(w),
            Command::Fetch(ref cmd) => cmd.write_to(w),
            Command::Store(ref cmd) => cmd.write_to(w),
            Command::Copy(ref cmd) => cmd.write_to(w),
            Command::Search(ref cmd) => cmd.write_to(w),
            Command::Uid(ref cmd) => {
                w.verbatim("UID ")?;
                match *cmd {
                    UidCommand::Copy(ref cmd) => cmd.write_to(w),
                    UidCommand::Fetch(ref cmd) => cmd.write_to(w),
                    UidCommand::Search(ref cmd) => cmd.write_to(w),
                    UidCommand::Store(ref cmd) => cmd.write_to(w),
                }
            },
        }
    }
}

fn uid_command(i: &[u8]) -> IResult<&[u8], UidCommand> {
    sequence::preceded(
        sequence::pair(kw("UID"), tag(" ")),
        alt((
            map(CopyCommand::parse, UidCommand::Copy),
            map(FetchCommand::parse, UidCommand::Fetch),
            map(SearchCommand::parse, UidCommand::Search),
            map(StoreCommand::parse, UidCommand::Store),
        )),
    )(i)
}

fn id_params(i: &[u8]) -> IResult<&[u8], Vec<Option<Cow<str>>>> {
    sequence::preceded(
        sequence::pair(kw("ID"), tag(" ")),
        alt((
            map(kw("NIL"), |_| vec![]),
            sequence::delimited(
                tag("("),
                multi::separated_list1(tag(" "), nstring),
                tag(")"),
            ),
        )),
    )(i)
}

fn write_id_params(
    w: &mut LexWriter<impl Write>,
    params: &[Option<Cow<str>>],
) -> io::Result<()> {
    w.verbatim("ID ")?;
    if params.is_empty() {
        return w.nil();
    }

    w.verbatim("(")?;
    for (ix, param) in params.iter().enumerate() {
        if ix > 0 {
            w.verbatim(" ")?;
        }
        w.nstring(param)?;
    }
    w.verbatim(")")
}

impl<'a> LogInCommand<'a> {
    fn parse(i: &'a [u8]) -> IResult<&'a [u8], Self> {
        map(
            sequence::tuple((
                kw("LOGIN"),
                tag(" "),
                astring,
                tag(" "),
                astring,
            )),
            |(_, _, userid, _, password)| LogInCommand { userid, password },
        )(i)
    }

    fn write_to(&self, w: &mut LexWriter<impl Write>) -> io::Result<()> {
        w.verbatim("LOGIN ")?;
        w.astring(&self.userid)?;
        w.verbatim(" ")?;
        w.astring(&self.password)
    }
}

impl<'a> RenameCommand<'a> {
    fn parse(i: &'a [u8]) -> IResult<&'a [u8], Self> {
        map(
            sequence::tuple((
                kw("RENAME"),
                tag(" "),
                mailbox,
                tag(" "),
                mailbox,
            )),
            |(_, _, src, _, dst)| RenameCommand { src, dst },
        )(i)
    }

    fn write_to(&self, w: &mut LexWriter<impl Write>) -> io::Result<()> {
        w.verbatim("RENAME ")?;
        w.mailbox(&self.src)?;
        w.verbatim(" ")?;
        w.mailbox(&self.dst)
    }
}

fn list_command<'a>(
    verb: &'static str,
) -> impl FnMut(&'a [u8]) -> IResult<&'a [u8], ListCommand<'a>> {
    move |i| {
        map(
            sequence::tuple((
                kw(verb),
                tag(" "),
                mailbox,
                tag(" "),
                list_mailbox,
            )),
            |(_, _, reference, _, pattern)| ListCommand { reference, pattern },
        )(i)
    }
}

impl<'a> ListCommand<'a> {
    fn write_to(
        &self,
        w: &mut LexWriter<impl Write>,
        verb: &str,
    ) -> io::Result<()> {
        w.verbatim(verb)?;
        w.verbatim(" ")?;
        w.mailbox(&self.reference)?;
        w.verbatim(" ")?;
        w.astring(&self.pattern)
    }
}

impl<'a> StatusCommand<'a> {
    fn parse(i: &'a [u8]) -> IResult<&'a [u8], Self> {
        map(
            sequence::tuple((
                kw("STATUS"),
                tag(" "),
                mailbox,
                tag(" "),
                sequence::delimited(
                    tag("("),
                    multi::separated_list1(tag(" "), status_att),
                    tag(")"),
                ),
            )),
            |(_, _, mailbox, _, items)| StatusCommand { mailbox, items },
        )(i)
    }

    fn write_to(&self, w: &mut LexWriter<impl Write>) -> io::Result<()> {
        w.verbatim("STATUS ")?;
        w.mailbox(&self.mailbox)?;
        w.verbatim(" (")?;
        for (ix, item) in self.items.iter().enumerate() {
            if ix > 0 {
                w.verbatim(" ")?;
            }
            w.verbatim(item.name())?;
        }
        w.verbatim(")")
    }
}

fn status_att(i: &[u8]) -> IResult<&[u8], StatusItem> {
    map_opt(normal_atom, |a| a.parse::<StatusItem>().ok())(i)
}

impl<'a> FetchCommand<'a> {
    fn parse(i: &'a [u8]) -> IResult<&'a [u8], Self> {
        map(
            sequence::tuple((
                kw("FETCH"),
                tag(" "),
                sequence_set,
                tag(" "),
                fetch_target,
            )),
            |(_, _, sequence_set, _, target)| FetchCommand {
                sequence_set,
                target,
            },
        )(i)
    }

    fn write_to(&self, w: &mut LexWriter<impl Write>) -> io::Result<()> {
        w.verbatim("FETCH ")?;
        w.verbatim(&self.sequence_set)?;
        w.verbatim(" ")?;
        match self.target {
            FetchTarget::All => w.verbatim("ALL"),
            FetchTarget::Fast => w.verbatim("FAST"),
            FetchTarget::Full => w.verbatim("FULL"),
            FetchTarget::Single(ref att) => write_fetch_att(w, att),
            FetchTarget::Multi(ref atts) => {
                w.verbatim("(")?;
                for (ix, att) in atts.iter().enumerate() {
                    if ix > 0 {
                        w.verbatim(" ")?;
                    }
                    write_fetch_att(w, att)?;
                }
                w.verbatim(")")
            },
        }
    }
}

fn fetch_target(i: &[u8]) -> IResult<&[u8], FetchTarget> {
    alt((
        map(kw("ALL"), |_| FetchTarget::All),
        map(kw("FAST"), |_| FetchTarget::Fast),
        map(kw("FULL"), |_| FetchTarget::Full),
        map(
            sequence::delimited(
                tag("("),
                multi::separated_list1(tag(" "), fetch_att),
                tag(")"),
            ),
            FetchTarget::Multi,
        ),
        map(fetch_att, FetchTarget::Single),
    ))(i)
}

fn fetch_att(i: &[u8]) -> IResult<&[u8], FetchAtt> {
    alt((
        map(kw("ENVELOPE"), |_| FetchAtt::Envelope),
        map(kw("FLAGS"), |_| FetchAtt::Flags),
        map(kw("INTERNALDATE"), |_| FetchAtt::InternalDate),
        map(kw("RFC822.HEADER"), |_| FetchAtt::Rfc822Header),
        map(kw("RFC822.SIZE"), |_| FetchAtt::Rfc822Size),
        map(kw("RFC822.TEXT"), |_| FetchAtt::Rfc822Text),
        map(kw("RFC822"), |_| FetchAtt::Rfc822),
        map(kw("BODYSTRUCTURE"), |_| FetchAtt::BodyStructure),
        map(
            sequence::delimited(kw("BODY.PEEK["), section_text, tag("]")),
            |section| FetchAtt::BodySection {
                peek: true,
                section,
            },
        ),
        map(
            sequence::delimited(kw("BODY["), section_text, tag("]")),
            |section| FetchAtt::BodySection {
                peek: false,
                section,
            },
        ),
        map(kw("BODY"), |_| FetchAtt::Body),
        map(kw("UID"), |_| FetchAtt::Uid),
    ))(i)
}

fn section_text(i: &[u8]) -> IResult<&[u8], String> {
    map(opt(is_not("]")), |s: Option<&[u8]>| {
        String::from_utf8_lossy(s.unwrap_or(b"")).into_owned()
    })(i)
}

fn write_fetch_att(
    w: &mut LexWriter<impl Write>,
    att: &FetchAtt,
) -> io::Result<()> {
    match *att {
        FetchAtt::Envelope => w.verbatim("ENVELOPE"),
        FetchAtt::Flags => w.verbatim("FLAGS"),
        FetchAtt::InternalDate => w.verbatim("INTERNALDATE"),
        FetchAtt::Rfc822 => w.verbatim("RFC822"),
        FetchAtt::Rfc822Header => w.verbatim("RFC822.HEADER"),
        FetchAtt::Rfc822Size => w.verbatim("RFC822.SIZE"),
        FetchAtt::Rfc822Text => w.verbatim("RFC822.TEXT"),
        FetchAtt::Body => w.verbatim("BODY"),
        FetchAtt::BodyStructure => w.verbatim("BODYSTRUCTURE"),
        FetchAtt::BodySection { peek, ref section } => {
            w.verbatim(if peek { "BODY.PEEK[" } else { "BODY[" })?;
            w.verbatim(section)?;
            w.verbatim("]")
        },
        FetchAtt::Uid => w.verbatim("UID"),
    }
}

impl<'a> StoreCommand<'a> {
    fn parse(i: &'a [u8]) -> IResult<&'a [u8], Self> {
        map(
            sequence::tuple((
                kw("STORE"),
                tag(" "),
                sequence_set,
                tag(" "),
                alt((
                    map(kw("+FLAGS"), |_| StoreType::Add),
                    map(kw("-FLAGS"), |_| StoreType::Remove),
                    map(kw("FLAGS"), |_| StoreType::Set),
                )),
                map(opt(kw(".SILENT")), |s| s.is_some()),
                tag(" "),
                store_flags,
            )),
            |(_, _, sequence_set, _, typ, silent, _, flags)| StoreCommand {
                sequence_set,
                typ,
                silent,
                flags,
            },
        )(i)
    }

    fn write_to(&self, w: &mut LexWriter<impl Write>) -> io::Result<()> {
        w.verbatim("STORE ")?;
        w.verbatim(&self.sequence_set)?;
        w.verbatim(match self.typ {
            StoreType::Set => " FLAGS",
            StoreType::Add => " +FLAGS",
            StoreType::Remove => " -FLAGS",
        })?;
        if self.silent {
            w.verbatim(".SILENT")?;
        }
        w.verbatim(" ")?;
        w.flags(&self.flags)
    }
}

fn store_flags(i: &[u8]) -> IResult<&[u8], Vec<Flag>> {
    alt((
        sequence::delimited(
            tag("("),
            multi::separated_list0(tag(" "), flag),
            tag(")"),
        ),
        multi::separated_list1(tag(" "), flag),
    ))(i)
}

impl<'a> CopyCommand<'a> {
    fn parse(i: &'a [u8]) -> IResult<&'a [u8], Self> {
        map(
            sequence::tuple((
                kw("COPY"),
                tag(" "),
                sequence_set,
                tag(" "),
                mailbox,
            )),
            |(_, _, sequence_set, _, mailbox)| CopyCommand {
                sequence_set,
                mailbox,
            },
        )(i)
    }

    fn write_to(&self, w: &mut LexWriter<impl Write>) -> io::Result<()> {
        w.verbatim("COPY ")?;
        w.verbatim(&self.sequence_set)?;
        w.verbatim(" ")?;
        w.mailbox(&self.mailbox)
    }
}

impl<'a> SearchCommand<'a> {
    fn parse(i: &'a [u8]) -> IResult<&'a [u8], Self> {
        let (i, _) = sequence::pair(kw("SEARCH"), tag(" "))(i)?;
        let (i, charset) = opt(sequence::delimited(
            sequence::pair(kw("CHARSET"), tag(" ")),
            astring,
            tag(" "),
        ))(i)?;
        let (i, mut keys) =
            multi::separated_list1(tag(" "), search_key)(i)?;

        let program = if 1 == keys.len() {
            keys.pop().unwrap()
        } else {
            SearchNode::List(keys)
        };

        Ok((i, SearchCommand { charset, program }))
    }

    fn write_to(&self, w: &mut LexWriter<impl Write>) -> io::Result<()> {
        w.verbatim("SEARCH ")?;
        if let Some(ref charset) = self.charset {
            w.verbatim("CHARSET ")?;
            w.astring(charset)?;
            w.verbatim(" ")?;
        }
        write_search_node(w, &self.program, true)
    }
}

fn write_search_node(
    w: &mut LexWriter<impl Write>,
    node: &SearchNode,
    top: bool,
) -> io::Result<()> {
    match *node {
        SearchNode::Key(ref text) => w.verbatim(text),
        SearchNode::Not(ref inner) => {
            w.verbatim("NOT ")?;
            write_search_node(w, inner, false)
        },
        SearchNode::Or(ref a, ref b) => {
            w.verbatim("OR ")?;
            write_search_node(w, a, false)?;
            w.verbatim(" ")?;
            write_search_node(w, b, false)
        },
        SearchNode::List(ref keys) => {
            if !top {
                w.verbatim("(")?;
            }
            for (ix, key) in keys.iter().enumerate() {
                if ix > 0 {
                    w.verbatim(" ")?;
                }
                write_search_node(w, key, false)?;
            }
            if !top {
                w.verbatim(")")?;
            }
            Ok(())
        },
    }
}

fn search_key(i: &[u8]) -> IResult<&[u8], SearchNode> {
    alt((
        map(
            sequence::delimited(
                tag("("),
                multi::separated_list1(tag(" "), search_key),
                tag(")"),
            ),
            SearchNode::List,
        ),
        map(
            sequence::preceded(sequence::pair(kw("NOT"), tag(" ")), search_key),
            |inner| SearchNode::Not(Box::new(inner)),
        ),
        map(
            sequence::preceded(
                sequence::pair(kw("OR"), tag(" ")),
                sequence::separated_pair(search_key, tag(" "), search_key),
            ),
            |(a, b)| SearchNode::Or(Box::new(a), Box::new(b)),
        ),
        keyed_search_key,
        map(sequence_set, |s| SearchNode::Key(s.into_owned())),
    ))(i)
}

/// Simple keys with zero or more arguments, canonicalised to
/// `KEYWORD [args]` text for the backend.
fn keyed_search_key(i: &[u8]) -> IResult<&[u8], SearchNode> {
    let (i, word) = normal_atom(i)?;
    let upper = word.to_ascii_uppercase();

    fn fail(i: &[u8]) -> nom::Err<nom::error::Error<&[u8]>> {
        nom::Err::Error(nom::error::Error::new(
            i,
            nom::error::ErrorKind::Tag,
        ))
    }

    match upper.as_str() {
        "ALL" | "ANSWERED" | "DELETED" | "DRAFT" | "FLAGGED" | "NEW"
        | "OLD" | "RECENT" | "SEEN" | "UNANSWERED" | "UNDELETED"
        | "UNDRAFT" | "UNFLAGGED" | "UNSEEN" => {
            Ok((i, SearchNode::Key(upper)))
        },

        "BCC" | "BODY" | "CC" | "FROM" | "SUBJECT" | "TEXT" | "TO"
        | "KEYWORD" | "UNKEYWORD" => {
            let (i, arg) = sequence::preceded(tag(" "), astring)(i)?;
            Ok((
                i,
                SearchNode::Key(format!(
                    "{} {}",
                    upper,
                    canonical_astring(&arg)
                )),
            ))
        },

        "BEFORE" | "ON" | "SINCE" | "SENTBEFORE" | "SENTON"
        | "SENTSINCE" => {
            let (i, d) = sequence::preceded(tag(" "), date)(i)?;
            Ok((
                i,
                SearchNode::Key(format!("{} {}", upper, d.format("%-d-%b-%Y"))),
            ))
        },

        "LARGER" | "SMALLER" => {
            let (i, n) = sequence::preceded(tag(" "), number)(i)?;
            Ok((i, SearchNode::Key(format!("{} {}", upper, n))))
        },

        "HEADER" => {
            let (i, (field, value)) = sequence::preceded(
                tag(" "),
                sequence::separated_pair(astring, tag(" "), astring),
            )(i)?;
            Ok((
                i,
                SearchNode::Key(format!(
                    "HEADER {} {}",
                    canonical_astring(&field),
                    canonical_astring(&value)
                )),
            ))
        },

        "UID" => {
            let (i, set) = sequence::preceded(tag(" "), sequence_set)(i)?;
            Ok((i, SearchNode::Key(format!("UID {}", set))))
        },

        _ => Err(fail(i)),
    }
}

fn canonical_astring(s: &str) -> String {
    if is_conservative_atom(s) {
        s.to_owned()
    } else {
        format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
    }
}

impl<'a> AuthenticateCommandStart<'a> {
    pub fn parse(i: &'a [u8]) -> IResult<&'a [u8], Self> {
        map(
            sequence::tuple((
                tag_atom,
                tag(" "),
                kw("AUTHENTICATE"),
                tag(" "),
                normal_atom,
                opt(sequence::preceded(tag(" "), normal_atom)),
            )),
            |(tag, _, _, _, auth_type, initial_response)| {
                AuthenticateCommandStart {
                    tag,
                    auth_type,
                    initial_response,
                }
            },
        )(i)
    }

    #[cfg(test)]
    pub fn write_to(&self, w: &mut LexWriter<impl Write>) -> io::Result<()> {
        w.verbatim(&self.tag)?;
        w.verbatim(" AUTHENTICATE ")?;
        w.verbatim(&self.auth_type)?;
        if let Some(ref ir) = self.initial_response {
            w.verbatim(" ")?;
            w.verbatim(ir)?;
        }
        Ok(())
    }
}

impl<'a> AppendCommandStart<'a> {
    pub fn parse(i: &'a [u8]) -> IResult<&'a [u8], Self> {
        map(
            sequence::tuple((
                tag_atom,
                tag(" "),
                kw("APPEND"),
                tag(" "),
                mailbox,
                opt(sequence::preceded(
                    tag(" "),
                    sequence::delimited(
                        tag("("),
                        multi::separated_list0(tag(" "), flag),
                        tag(")"),
                    ),
                )),
                opt(sequence::preceded(tag(" "), datetime)),
                opt(tag(" ")),
            )),
            |(tag, _, _, _, mailbox, flags, internal_date, _)| {
                AppendCommandStart {
                    tag,
                    mailbox,
                    flags: flags.unwrap_or_default(),
                    internal_date,
                }
            },
        )(i)
    }

    #[cfg(test)]
    pub fn write_to(&self, w: &mut LexWriter<impl Write>) -> io::Result<()> {
        w.verbatim(&self.tag)?;
        w.verbatim(" APPEND ")?;
        w.mailbox(&self.mailbox)?;
        if !self.flags.is_empty() {
            w.verbatim(" ")?;
            w.flags(&self.flags)?;
        }
        if let Some(ref date) = self.internal_date {
            w.verbatim(" ")?;
            w.datetime(date)?;
        }
        Ok(())
    }
}

impl<'a> LappendCommandStart<'a> {
    pub fn parse(i: &'a [u8]) -> IResult<&'a [u8], Self> {
        map(
            sequence::tuple((
                tag_atom,
                tag(" "),
                kw("LAPPEND"),
                tag(" "),
                astring,
                tag(" "),
                mailbox,
                opt(tag(" ")),
            )),
            |(tag, _, _, _, user, _, mailbox, _)| LappendCommandStart {
                tag,
                user,
                mailbox,
            },
        )(i)
    }

    #[cfg(test)]
    pub fn write_to(&self, w: &mut LexWriter<impl Write>) -> io::Result<()> {
        w.verbatim(&self.tag)?;
        w.verbatim(" LAPPEND ")?;
        w.astring(&self.user)?;
        w.verbatim(" ")?;
        w.mailbox(&self.mailbox)
    }
}

impl<'a> UnknownCommandFragment<'a> {
    pub fn parse(i: &'a [u8]) -> IResult<&'a [u8], Self> {
        map(tag_atom, |tag| UnknownCommandFragment { tag })(i)
    }
}

// ==================== Responses ====================

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResponseLine<'a> {
    /// The tag, or `None` for untagged (`*`) responses.
    pub tag: Option<Cow<'a, str>>,
    pub response: Response<'a>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Response<'a> {
    Cond(CondResponse<'a>),
    Capability(Vec<Cow<'a, str>>),
    Id(Vec<(Cow<'a, str>, Cow<'a, str>)>),
    List(MailboxList<'a>),
    Lsub(MailboxList<'a>),
    Flags(Vec<Flag>),
    Exists(u32),
    Recent(u32),
    Expunge(u32),
    Fetch(u32, Vec<FetchItem>),
    Search(Vec<u32>),
    Status(StatusResponse<'a>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CondResponse<'a> {
    pub cond: RespCondType,
    pub code: Option<RespTextCode<'a>>,
    pub quip: Option<Cow<'a, str>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RespTextCode<'a> {
    Parse,
    TryCreate,
    ReadOnly,
    ReadWrite,
    Limit,
    AuthenticationFailed,
    Capability(Vec<Cow<'a, str>>),
    PermanentFlags(Vec<Flag>),
    UidNext(u32),
    UidValidity(Cow<'a, str>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MailboxList<'a> {
    pub flags: Vec<Cow<'a, str>>,
    pub name: Cow<'a, str>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusResponse<'a> {
    pub mailbox: Cow<'a, str>,
    pub items: Vec<(StatusItem, Cow<'a, str>)>,
}

impl<'a> ResponseLine<'a> {
    pub fn write_to(&self, w: &mut LexWriter<impl Write>) -> io::Result<()> {
        match self.tag {
            Some(ref tag) => w.verbatim(tag)?,
            None => w.verbatim("*")?,
        }
        w.verbatim(" ")?;
        self.response.write_to(w)
    }
}

impl<'a> Response<'a> {
    pub fn write_to(&self, w: &mut LexWriter<impl Write>) -> io::Result<()> {
        match *self {
            Response::Cond(ref cond) => cond.write_to(w),

            Response::Capability(ref caps) => {
                w.verbatim("CAPABILITY")?;
                for cap in caps {
                    w.verbatim(" ")?;
                    w.verbatim(cap)?;
                }
                Ok(())
            },

            Response::Id(ref params) => {
                w.verbatim("ID ")?;
                if params.is_empty() {
                    return w.nil();
                }
                w.verbatim("(")?;
                for (ix, (name, value)) in params.iter().enumerate() {
                    if ix > 0 {
                        w.verbatim(" ")?;
                    }
                    w.string(name)?;
                    w.verbatim(" ")?;
                    w.string(value)?;
                }
                w.verbatim(")")
            },

            Response::List(ref list) => write_mailbox_list(w, "LIST", list),
            Response::Lsub(ref list) => write_mailbox_list(w, "LSUB", list),

            Response::Flags(ref flags) => {
                w.verbatim("FLAGS ")?;
                w.flags(flags)
            },

            Response::Exists(n) => {
                w.num_u32(n)?;
                w.verbatim(" EXISTS")
            },

            Response::Recent(n) => {
                w.num_u32(n)?;
                w.verbatim(" RECENT")
            },

            Response::Expunge(n) => {
                w.num_u32(n)?;
                w.verbatim(" EXPUNGE")
            },

            Response::Fetch(seqnum, ref items) => {
                w.num_u32(seqnum)?;
                w.verbatim(" FETCH (")?;
                for (ix, item) in items.iter().enumerate() {
                    if ix > 0 {
                        w.verbatim(" ")?;
                    }
                    write_fetch_item(w, item)?;
                }
                w.verbatim(")")
            },

            Response::Search(ref hits) => {
                w.verbatim("SEARCH")?;
                for hit in hits {
                    w.verbatim(" ")?;
                    w.num_u32(*hit)?;
                }
                Ok(())
            },

            Response::Status(ref status) => {
                w.verbatim("STATUS ")?;
                w.mailbox(&status.mailbox)?;
                w.verbatim(" (")?;
                for (ix, (item, value)) in status.items.iter().enumerate() {
                    if ix > 0 {
                        w.verbatim(" ")?;
                    }
                    w.verbatim(item.name())?;
                    w.verbatim(" ")?;
                    w.verbatim(value)?;
                }
                w.verbatim(")")
            },
        }
    }
}

impl<'a> CondResponse<'a> {
    fn write_to(&self, w: &mut LexWriter<impl Write>) -> io::Result<()> {
        w.verbatim(self.cond.name())?;

        if let Some(ref code) = self.code {
            w.verbatim(" [")?;
            code.write_to(w)?;
            w.verbatim("]")?;
        }

        if let Some(ref quip) = self.quip {
            w.verbatim(" ")?;
            w.verbatim(quip)?;
        }

        Ok(())
    }
}

impl<'a> RespTextCode<'a> {
    fn write_to(&self, w: &mut LexWriter<impl Write>) -> io::Result<()> {
        match *self {
            RespTextCode::Parse => w.verbatim("PARSE"),
            RespTextCode::TryCreate => w.verbatim("TRYCREATE"),
            RespTextCode::ReadOnly => w.verbatim("READ-ONLY"),
            RespTextCode::ReadWrite => w.verbatim("READ-WRITE"),
            RespTextCode::Limit => w.verbatim("LIMIT"),
            RespTextCode::AuthenticationFailed => {
                w.verbatim("AUTHENTICATIONFAILED")
            },
            RespTextCode::Capability(ref caps) => {
                w.verbatim("CAPABILITY")?;
                for cap in caps {
                    w.verbatim(" ")?;
                    w.verbatim(cap)?;
                }
                Ok(())
            },
            RespTextCode::PermanentFlags(ref flags) => {
                w.verbatim("PERMANENTFLAGS ")?;
                w.flags(flags)
            },
            RespTextCode::UidNext(n) => {
                w.verbatim("UIDNEXT ")?;
                w.num_u32(n)
            },
            RespTextCode::UidValidity(ref v) => {
                w.verbatim("UIDVALIDITY ")?;
                w.verbatim(v)
            },
        }
    }
}

fn write_mailbox_list(
    w: &mut LexWriter<impl Write>,
    verb: &str,
    list: &MailboxList<'_>,
) -> io::Result<()> {
    w.verbatim(verb)?;
    w.verbatim(" (")?;
    for (ix, flag) in list.flags.iter().enumerate() {
        if ix > 0 {
            w.verbatim(" ")?;
        }
        w.verbatim(flag)?;
    }
    w.verbatim(") \"/\" ")?;
    w.mailbox(&list.name)
}

fn write_fetch_item(
    w: &mut LexWriter<impl Write>,
    item: &FetchItem,
) -> io::Result<()> {
    match *item {
        FetchItem::Flags(ref flags) => {
            w.verbatim("FLAGS ")?;
            w.flags(flags)
        },
        FetchItem::Uid(uid) => {
            w.verbatim("UID ")?;
            w.num_u32(uid)
        },
        FetchItem::Rfc822Size(size) => {
            w.verbatim("RFC822.SIZE ")?;
            w.num_u32(size)
        },
        FetchItem::InternalDate(ref date) => {
            w.verbatim("INTERNALDATE ")?;
            w.datetime(date)
        },
        FetchItem::Literal { ref name, ref data } => {
            w.verbatim(name)?;
            w.verbatim(" ")?;
            w.literal(data)
        },
    }
}

// ==================== Primitive parsers ====================

fn normal_atom(i: &[u8]) -> IResult<&[u8], Cow<str>> {
    map(
        bytes::complete::take_while1(|b| match b {
            0..=b' ' => false,
            127..=255 => false,
            b'(' | b')' | b'{' | b'*' | b'%' | b'\\' | b'"' | b']' => false,
            _ => true,
        }),
        String::from_utf8_lossy,
    )(i)
}

// Not formally part of the IMAP syntax definition. It lets us keep the
// backslash prefix of system flags through the whole pipeline. The parser
// initially accepts garbage like "foo\bar", but a later stage rejects it
// when the value is coerced into `Flag`.
fn backslash_atom(i: &[u8]) -> IResult<&[u8], Cow<str>> {
    map(
        bytes::complete::take_while1(|b| match b {
            0..=b' ' => false,
            127..=255 => false,
            b'(' | b')' | b'{' | b'*' | b'%' | b'"' | b']' => false,
            _ => true,
        }),
        String::from_utf8_lossy,
    )(i)
}

fn astring_atom(i: &[u8]) -> IResult<&[u8], Cow<str>> {
    map(
        bytes::complete::take_while1(|b| match b {
            0..=b' ' => false,
            127..=255 => false,
            b'(' | b')' | b'{' | b'*' | b'%' | b'\\' | b'"' => false,
            _ => true,
        }),
        String::from_utf8_lossy,
    )(i)
}

fn tag_atom(i: &[u8]) -> IResult<&[u8], Cow<str>> {
    map(
        bytes::complete::take_while1(|b| match b {
            0..=b' ' => false,
            127..=255 => false,
            b'(' | b')' | b'{' | b'*' | b'%' | b'\\' | b'"' | b'+' => false,
            _ => true,
        }),
        String::from_utf8_lossy,
    )(i)
}

fn list_mailbox_atom(i: &[u8]) -> IResult<&[u8], Cow<str>> {
    map(
        bytes::complete::take_while1(|b| match b {
            0..=b' ' => false,
            127..=255 => false,
            b'(' | b')' | b'{' | b'\\' | b'"' => false,
            _ => true,
        }),
        String::from_utf8_lossy,
    )(i)
}

fn number(i: &[u8]) -> IResult<&[u8], u32> {
    map_opt(character::complete::digit1, |s| {
        str::from_utf8(s).ok().and_then(|s| s.parse::<u32>().ok())
    })(i)
}

/// A literal, with its payload in-band after the `{n}` marker as the request
/// reader splices it.
fn literal(i: &[u8]) -> IResult<&[u8], &[u8]> {
    let (i, len) = sequence::delimited(
        tag("{"),
        number,
        alt((tag("+}\r\n"), tag("}\r\n"))),
    )(i)?;
    bytes::complete::take(len)(i)
}

fn quoted_char(i: &[u8]) -> IResult<&[u8], &[u8]> {
    sequence::preceded(tag("\\"), alt((tag("\\"), tag("\""))))(i)
}

fn quoted_string_content(i: &[u8]) -> IResult<&[u8], &[u8]> {
    alt((quoted_char, is_not("\r\n\"\\")))(i)
}

fn quoted(i: &[u8]) -> IResult<&[u8], Cow<str>> {
    sequence::delimited(
        tag("\""),
        multi::fold_many0(
            map(quoted_string_content, String::from_utf8_lossy),
            || Cow::Owned(String::new()),
            |mut accum: Cow<str>, piece| {
                if accum.is_empty() {
                    piece
                } else {
                    Cow::to_mut(&mut accum).push_str(&piece);
                    accum
                }
            },
        ),
        tag("\""),
    )(i)
}

fn string(i: &[u8]) -> IResult<&[u8], Cow<str>> {
    alt((quoted, map(literal, String::from_utf8_lossy)))(i)
}

fn astring(i: &[u8]) -> IResult<&[u8], Cow<str>> {
    alt((astring_atom, string))(i)
}

fn nstring(i: &[u8]) -> IResult<&[u8], Option<Cow<str>>> {
    alt((map(kw("NIL"), |_| None), map(string, Some)))(i)
}

fn mailbox(i: &[u8]) -> IResult<&[u8], Cow<str>> {
    astring(i)
}

// "Mailbox as used by LIST and LSUB": patterns may contain the `%` and `*`
// wildcards, which plain atoms exclude.
fn list_mailbox(i: &[u8]) -> IResult<&[u8], Cow<str>> {
    alt((list_mailbox_atom, string))(i)
}

fn sequence_set(i: &[u8]) -> IResult<&[u8], Cow<str>> {
    map(is_a("0123456789:*,"), String::from_utf8_lossy)(i)
}

fn keyword(i: &[u8]) -> IResult<&[u8], Flag> {
    map_opt(normal_atom, |a| a.parse::<Flag>().ok())(i)
}

fn flag(i: &[u8]) -> IResult<&[u8], Flag> {
    alt((keyword, map_opt(backslash_atom, |s| s.parse::<Flag>().ok())))(i)
}

fn parse_u32_infallible(i: &[u8]) -> u32 {
    str::from_utf8(i).unwrap().parse::<u32>().unwrap()
}

fn one_digit(i: &[u8]) -> IResult<&[u8], u32> {
    map(
        bytes::complete::take_while_m_n(1, 1, character::is_digit),
        parse_u32_infallible,
    )(i)
}

fn two_digit(i: &[u8]) -> IResult<&[u8], u32> {
    map(
        bytes::complete::take_while_m_n(2, 2, character::is_digit),
        parse_u32_infallible,
    )(i)
}

fn four_digit(i: &[u8]) -> IResult<&[u8], u32> {
    map(
        bytes::complete::take_while_m_n(4, 4, character::is_digit),
        parse_u32_infallible,
    )(i)
}

fn time_of_day(i: &[u8]) -> IResult<&[u8], (u32, u32, u32)> {
    sequence::tuple((
        two_digit,
        sequence::preceded(tag(":"), two_digit),
        sequence::preceded(tag(":"), two_digit),
    ))(i)
}

fn numeric_zone(i: &[u8]) -> IResult<&[u8], i32> {
    map(
        sequence::pair(
            alt((tag("+"), tag("-"))),
            sequence::pair(two_digit, two_digit),
        ),
        |(sign, (h, m))| {
            let n = (h * 60 + m) as i32;
            if b"-" == sign {
                -n
            } else {
                n
            }
        },
    )(i)
}

static MONTH_NAMES: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct",
    "nov", "dec",
];

fn month(i: &[u8]) -> IResult<&[u8], u32> {
    map_opt(bytes::complete::take(3usize), |name| {
        str::from_utf8(name).ok().and_then(|name| {
            MONTH_NAMES
                .iter()
                .position(|n| n.eq_ignore_ascii_case(name))
                .map(|ix| ix as u32 + 1)
        })
    })(i)
}

fn date_text(i: &[u8]) -> IResult<&[u8], NaiveDate> {
    map_opt(
        sequence::tuple((
            sequence::terminated(alt((two_digit, one_digit)), tag("-")),
            sequence::terminated(month, tag("-")),
            four_digit,
        )),
        |(d, m, y)| NaiveDate::from_ymd_opt(y as i32, m, d),
    )(i)
}

fn date(i: &[u8]) -> IResult<&[u8], NaiveDate> {
    alt((
        date_text,
        sequence::delimited(tag("\""), date_text, tag("\"")),
    ))(i)
}

fn datetime_date(i: &[u8]) -> IResult<&[u8], NaiveDate> {
    map_opt(
        sequence::tuple((
            sequence::terminated(
                alt((two_digit, sequence::preceded(tag(" "), one_digit))),
                tag("-"),
            ),
            sequence::terminated(month, tag("-")),
            four_digit,
        )),
        |(d, m, y)| NaiveDate::from_ymd_opt(y as i32, m, d),
    )(i)
}

fn datetime(i: &[u8]) -> IResult<&[u8], DateTime<FixedOffset>> {
    map_opt(
        sequence::delimited(
            tag("\""),
            sequence::tuple((
                sequence::terminated(datetime_date, tag(" ")),
                sequence::terminated(time_of_day, tag(" ")),
                numeric_zone,
            )),
            tag("\""),
        ),
        |(date, (h, m, s), zone)| {
            FixedOffset::east_opt(zone * 60).and_then(|offset| {
                date.and_hms_opt(h, m, s).and_then(|datetime| {
                    offset.from_local_datetime(&datetime).latest()
                })
            })
        },
    )(i)
}
