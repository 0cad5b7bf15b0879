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

//! An in-memory account and mailbox backend.
//!
//! Backs the integration tests and the development `serve` mode. Each
//! user's mailbox tree is shared between all of their sessions through an
//! `Arc<Mutex<_>>`, which is what lets one session's APPEND show up in a
//! sibling session's IDLE notifications.
//!
//! The hierarchy delimiter is `/`. INBOX is matched case-insensitively,
//! all other names case-sensitively.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::prelude::*;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::model::*;
use super::{
    AccountStore, EmitExpunge, EmitFetch, MailboxFactory, MailboxStore,
};

pub struct MemoryStore {
    users: Mutex<HashMap<String, UserRecord>>,
}

struct UserRecord {
    password: String,
    mailboxes: Arc<Mutex<UserMailboxes>>,
}

struct UserMailboxes {
    boxes: BTreeMap<String, MailboxData>,
    next_uidvalidity: u32,
}

struct MailboxData {
    messages: Vec<Message>,
    uidnext: u32,
    uidvalidity: String,
    subscribed: bool,
    selectable: bool,
}

struct Message {
    uid: u32,
    flags: Vec<Flag>,
    recent: bool,
    internal_date: DateTime<FixedOffset>,
    body: Vec<u8>,
}

impl MailboxData {
    fn new(uidvalidity: String) -> Self {
        MailboxData {
            messages: Vec::new(),
            uidnext: 1,
            uidvalidity,
            subscribed: false,
            selectable: true,
        }
    }

    fn header(&self) -> MailboxHeader {
        MailboxHeader {
            exists: self.messages.len() as u32,
            recent: self.messages.iter().filter(|m| m.recent).count() as u32,
            unseen: self
                .messages
                .iter()
                .filter(|m| !m.flags.contains(&Flag::Seen))
                .count() as u32,
            uidnext: self.uidnext,
            uidvalidity: self.uidvalidity.clone(),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            users: Mutex::new(HashMap::new()),
        }
    }

    /// Creates a user with an INBOX.
    pub fn add_user(&self, name: &str, password: &str) {
        let mut mailboxes = UserMailboxes {
            boxes: BTreeMap::new(),
            next_uidvalidity: 2,
        };
        mailboxes
            .boxes
            .insert("INBOX".to_owned(), MailboxData::new("1".to_owned()));

        self.users.lock().unwrap().insert(
            name.to_owned(),
            UserRecord {
                password: password.to_owned(),
                mailboxes: Arc::new(Mutex::new(mailboxes)),
            },
        );
    }

    /// Creates an extra mailbox for a user. `uidvalidity` may be empty to
    /// exercise the missing-UIDVALIDITY failure path.
    pub fn add_mailbox(&self, user: &str, name: &str, uidvalidity: &str) {
        let users = self.users.lock().unwrap();
        let record = users.get(user).expect("no such user");
        record
            .mailboxes
            .lock()
            .unwrap()
            .boxes
            .insert(name.to_owned(), MailboxData::new(uidvalidity.to_owned()));
    }

    /// Marks a mailbox as non-selectable.
    pub fn mark_unselectable(&self, user: &str, name: &str) {
        let users = self.users.lock().unwrap();
        let record = users.get(user).expect("no such user");
        record
            .mailboxes
            .lock()
            .unwrap()
            .boxes
            .get_mut(name)
            .expect("no such mailbox")
            .selectable = false;
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl AccountStore for MemoryStore {
    fn login(&self, userid: &str, password: &str) -> Result<String, AuthError> {
        let users = self.users.lock().unwrap();
        match users.get(userid) {
            Some(record) if record.password == password => {
                Ok(userid.to_owned())
            },
            _ => Err(AuthError::BadCredentials),
        }
    }

    fn authenticate(
        &self,
        mechanism: &str,
        data: &[u8],
    ) -> Result<String, AuthError> {
        if !mechanism.eq_ignore_ascii_case("PLAIN") {
            return Err(AuthError::UnsupportedMechanism);
        }

        let decoded = base64::decode(data)
            .ok()
            .and_then(|decoded| String::from_utf8(decoded).ok())
            .ok_or(AuthError::Malformed)?;

        // RFC 2595: <authzid>NUL<authcid>NUL<password>, where <authzid> is
        // optional when it equals <authcid>.
        let mut parts = decoded.split('\x00');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(authzid), Some(authcid), Some(password), None) => {
                if !authzid.is_empty() && authzid != authcid {
                    return Err(AuthError::BadCredentials);
                }
                self.login(authcid, password)
            },
            _ => Err(AuthError::Malformed),
        }
    }
}

impl MailboxFactory for MemoryStore {
    fn open(&self, user: &str) -> StoreResult<Box<dyn MailboxStore + Send>> {
        let users = self.users.lock().unwrap();
        let record = users
            .get(user)
            .ok_or_else(|| StoreError::Other("No such user".to_owned()))?;

        Ok(Box::new(MemoryMailbox {
            user: user.to_owned(),
            shared: Arc::clone(&record.mailboxes),
            selected: None,
            read_only: false,
        }))
    }
}

pub struct MemoryMailbox {
    user: String,
    shared: Arc<Mutex<UserMailboxes>>,
    selected: Option<String>,
    read_only: bool,
}

impl MemoryMailbox {
    fn with_selected<T>(
        &self,
        f: impl FnOnce(&mut MailboxData) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let name = self
            .selected
            .as_ref()
            .ok_or_else(|| StoreError::Other("No mailbox selected".to_owned()))?;
        let mut shared = self.shared.lock().unwrap();
        let data = shared
            .boxes
            .get_mut(name)
            .ok_or(StoreError::NxMailbox)?;
        f(data)
    }
}

#[async_trait(?Send)]
impl MailboxStore for MemoryMailbox {
    fn user(&self) -> &str {
        &self.user
    }

    fn create_mailbox(&mut self, name: &str) -> StoreResult<()> {
        let name = canonical_name(name);
        let mut shared = self.shared.lock().unwrap();
        if shared.boxes.contains_key(&name) {
            return Err(StoreError::Other("Mailbox already exists".to_owned()));
        }

        let uidvalidity = shared.next_uidvalidity.to_string();
        shared.next_uidvalidity += 1;
        shared.boxes.insert(name, MailboxData::new(uidvalidity));
        Ok(())
    }

    fn delete_mailbox(&mut self, name: &str) -> StoreResult<()> {
        let name = canonical_name(name);
        if "INBOX" == name {
            return Err(StoreError::Other(
                "Operation not allowed for INBOX".to_owned(),
            ));
        }

        let mut shared = self.shared.lock().unwrap();
        if !shared.boxes.contains_key(&name) {
            return Err(StoreError::NxMailbox);
        }

        let child_prefix = format!("{}/", name);
        if shared.boxes.keys().any(|k| k.starts_with(&child_prefix)) {
            return Err(StoreError::Other(
                "Mailbox has inferiors".to_owned(),
            ));
        }

        shared.boxes.remove(&name);
        Ok(())
    }

    fn rename_mailbox(&mut self, src: &str, dst: &str) -> StoreResult<()> {
        let src = canonical_name(src);
        let dst = canonical_name(dst);
        if "INBOX" == src {
            return Err(StoreError::Other(
                "Operation not allowed for INBOX".to_owned(),
            ));
        }

        let mut shared = self.shared.lock().unwrap();
        if shared.boxes.contains_key(&dst) {
            return Err(StoreError::Other("Mailbox already exists".to_owned()));
        }

        let data = shared.boxes.remove(&src).ok_or(StoreError::NxMailbox)?;
        shared.boxes.insert(dst.clone(), data);

        // Children move with their parent.
        let child_prefix = format!("{}/", src);
        let children: Vec<String> = shared
            .boxes
            .keys()
            .filter(|k| k.starts_with(&child_prefix))
            .cloned()
            .collect();
        for child in children {
            let data = shared.boxes.remove(&child).unwrap();
            let renamed =
                format!("{}{}", dst, &child[src.len()..]);
            shared.boxes.insert(renamed, data);
        }

        Ok(())
    }

    fn subscribe(&mut self, name: &str) -> StoreResult<()> {
        let name = canonical_name(name);
        let mut shared = self.shared.lock().unwrap();
        shared
            .boxes
            .get_mut(&name)
            .ok_or(StoreError::NxMailbox)?
            .subscribed = true;
        Ok(())
    }

    fn unsubscribe(&mut self, name: &str) -> StoreResult<()> {
        let name = canonical_name(name);
        let mut shared = self.shared.lock().unwrap();
        shared
            .boxes
            .get_mut(&name)
            .ok_or(StoreError::NxMailbox)?
            .subscribed = false;
        Ok(())
    }

    fn list_mailboxes(
        &self,
        reference: &str,
        pattern: &str,
    ) -> StoreResult<Vec<ListEntry>> {
        self.list_matching(reference, pattern, false)
    }

    fn list_subscriptions(
        &self,
        reference: &str,
        pattern: &str,
    ) -> StoreResult<Vec<ListEntry>> {
        self.list_matching(reference, pattern, true)
    }

    fn status(&self, mailbox: &str) -> StoreResult<MailboxHeader> {
        let name = canonical_name(mailbox);
        let shared = self.shared.lock().unwrap();
        let data = shared.boxes.get(&name).ok_or(StoreError::NxMailbox)?;
        if !data.selectable {
            return Err(StoreError::Unselectable);
        }

        Ok(data.header())
    }

    fn select(
        &mut self,
        mailbox: &str,
        read_only: bool,
    ) -> StoreResult<MailboxHeader> {
        let name = canonical_name(mailbox);
        self.selected = None;

        let header = {
            let mut shared = self.shared.lock().unwrap();
            let data =
                shared.boxes.get_mut(&name).ok_or(StoreError::NxMailbox)?;
            if !data.selectable {
                return Err(StoreError::Unselectable);
            }

            let header = data.header();
            // This session claims the recent messages.
            for message in &mut data.messages {
                message.recent = false;
            }
            header
        };

        self.selected = Some(name);
        self.read_only = read_only;
        Ok(header)
    }

    fn selected_mailbox(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    fn read_only(&self) -> bool {
        self.read_only
    }

    fn unselect(&mut self) {
        self.selected = None;
    }

    fn close(&mut self) {
        if !self.read_only {
            let _ = self.with_selected(|data| {
                data.messages
                    .retain(|m| !m.flags.contains(&Flag::Deleted));
                Ok(())
            });
        }
        self.selected = None;
    }

    async fn append(
        &mut self,
        mailbox: &str,
        flags: Vec<Flag>,
        internal_date: Option<DateTime<FixedOffset>>,
        size: u32,
        data: &mut (dyn AsyncRead + Unpin),
    ) -> Result<(), AppendError> {
        // Consume the payload first so the protocol stream stays
        // synchronised even when the target mailbox is missing.
        let mut body = vec![0u8; size as usize];
        data.read_exact(&mut body).await.map_err(|e| {
            if std::io::ErrorKind::UnexpectedEof == e.kind() {
                AppendError::Truncated
            } else {
                AppendError::Other(e.to_string())
            }
        })?;

        let name = canonical_name(mailbox);
        let mut shared = self.shared.lock().unwrap();
        let data = shared
            .boxes
            .get_mut(&name)
            .ok_or(AppendError::NxMailbox)?;
        if !data.selectable {
            return Err(AppendError::Unselectable);
        }

        let uid = data.uidnext;
        data.uidnext += 1;
        data.messages.push(Message {
            uid,
            flags,
            recent: true,
            internal_date: internal_date.unwrap_or_else(|| {
                Utc::now()
                    .with_timezone(&FixedOffset::east_opt(0).unwrap())
            }),
            body,
        });

        Ok(())
    }

    fn fetch(
        &mut self,
        sequence_set: &str,
        target: &FetchTarget,
        by_uid: bool,
        emit: EmitFetch<'_>,
    ) -> StoreResult<()> {
        let atts = flatten_target(target);
        let implicit_seen = atts.iter().any(|att| {
            matches!(
                att,
                FetchAtt::Rfc822
                    | FetchAtt::Rfc822Text
                    | FetchAtt::BodySection { peek: false, .. }
            )
        });

        self.with_selected(|data| {
            let hits = resolve_sequence_set(sequence_set, data, by_uid)?;

            for seqnum in hits {
                let message = &mut data.messages[seqnum as usize - 1];
                if implicit_seen && !message.flags.contains(&Flag::Seen) {
                    message.flags.push(Flag::Seen);
                }

                let mut items = Vec::new();
                if by_uid && !atts.contains(&FetchAtt::Uid) {
                    items.push(FetchItem::Uid(message.uid));
                }
                for att in &atts {
                    if let Some(item) = fetch_item(att, message) {
                        items.push(item);
                    }
                }

                emit(seqnum, items);
            }

            Ok(())
        })
    }

    fn store_flags(
        &mut self,
        sequence_set: &str,
        op: StoreType,
        silent: bool,
        flags: &[Flag],
        by_uid: bool,
        emit: EmitFetch<'_>,
    ) -> StoreResult<()> {
        if self.read_only {
            return Err(StoreError::Other("Mailbox is read-only".to_owned()));
        }

        self.with_selected(|data| {
            let hits = resolve_sequence_set(sequence_set, data, by_uid)?;

            for seqnum in hits {
                let message = &mut data.messages[seqnum as usize - 1];
                match op {
                    StoreType::Set => message.flags = flags.to_vec(),
                    StoreType::Add => {
                        for flag in flags {
                            if !message.flags.contains(flag) {
                                message.flags.push(flag.clone());
                            }
                        }
                    },
                    StoreType::Remove => {
                        message.flags.retain(|f| !flags.contains(f))
                    },
                }

                if !silent {
                    let mut items =
                        vec![FetchItem::Flags(message.flags.clone())];
                    if by_uid {
                        items.push(FetchItem::Uid(message.uid));
                    }
                    emit(seqnum, items);
                }
            }

            Ok(())
        })
    }

    fn copy(
        &mut self,
        destination: &str,
        sequence_set: &str,
        by_uid: bool,
    ) -> StoreResult<()> {
        let src_name = self
            .selected
            .clone()
            .ok_or_else(|| StoreError::Other("No mailbox selected".to_owned()))?;
        let dst_name = canonical_name(destination);

        let mut shared = self.shared.lock().unwrap();
        if !shared.boxes.contains_key(&dst_name) {
            return Err(StoreError::NxMailbox);
        }

        let src = shared.boxes.get(&src_name).ok_or(StoreError::NxMailbox)?;
        let hits = resolve_sequence_set(sequence_set, src, by_uid)?;
        let copies: Vec<(Vec<Flag>, DateTime<FixedOffset>, Vec<u8>)> = hits
            .iter()
            .map(|&seqnum| {
                let m = &src.messages[seqnum as usize - 1];
                (m.flags.clone(), m.internal_date, m.body.clone())
            })
            .collect();

        let dst = shared.boxes.get_mut(&dst_name).unwrap();
        if !dst.selectable {
            return Err(StoreError::Unselectable);
        }

        for (flags, internal_date, body) in copies {
            let uid = dst.uidnext;
            dst.uidnext += 1;
            dst.messages.push(Message {
                uid,
                flags,
                recent: true,
                internal_date,
                body,
            });
        }

        Ok(())
    }

    fn expunge(&mut self, emit: EmitExpunge<'_>) -> StoreResult<()> {
        if self.read_only {
            return Err(StoreError::Other("Mailbox is read-only".to_owned()));
        }

        self.with_selected(|data| {
            // Walk backwards so each reported sequence number is valid at
            // the time it is emitted.
            for ix in (0..data.messages.len()).rev() {
                if data.messages[ix].flags.contains(&Flag::Deleted) {
                    data.messages.remove(ix);
                    emit(ix as u32 + 1);
                }
            }

            Ok(())
        })
    }

    fn search(
        &self,
        program: &SearchNode,
        by_uid: bool,
    ) -> StoreResult<Vec<u32>> {
        let name = self
            .selected
            .as_ref()
            .ok_or_else(|| StoreError::Other("No mailbox selected".to_owned()))?;
        let shared = self.shared.lock().unwrap();
        let data = shared.boxes.get(name).ok_or(StoreError::NxMailbox)?;

        let mut hits = Vec::new();
        for (ix, message) in data.messages.iter().enumerate() {
            let seqnum = ix as u32 + 1;
            if eval_search(program, seqnum, message, data)? {
                hits.push(if by_uid { message.uid } else { seqnum });
            }
        }

        Ok(hits)
    }
}

impl MemoryMailbox {
    fn list_matching(
        &self,
        reference: &str,
        pattern: &str,
        subscribed_only: bool,
    ) -> StoreResult<Vec<ListEntry>> {
        let full_pattern = format!("{}{}", reference, pattern);
        let matcher = pattern_to_regex(&full_pattern)?;

        let shared = self.shared.lock().unwrap();
        let entries = shared
            .boxes
            .iter()
            .filter(|(name, data)| {
                (!subscribed_only || data.subscribed)
                    && matcher.is_match(name)
            })
            .map(|(name, data)| {
                let child_prefix = format!("{}/", name);
                let mut flags = Vec::new();
                if !data.selectable {
                    flags.push("\\Noselect".to_owned());
                }
                if shared
                    .boxes
                    .keys()
                    .any(|k| k.starts_with(&child_prefix))
                {
                    flags.push("\\HasChildren".to_owned());
                } else {
                    flags.push("\\HasNoChildren".to_owned());
                }

                ListEntry {
                    name: name.clone(),
                    flags,
                }
            })
            .collect();

        Ok(entries)
    }
}

fn canonical_name(name: &str) -> String {
    if name.eq_ignore_ascii_case("INBOX") {
        "INBOX".to_owned()
    } else {
        name.to_owned()
    }
}

/// Converts an IMAP list pattern to a regex: `*` matches anything, `%`
/// anything except the hierarchy delimiter.
fn pattern_to_regex(pattern: &str) -> StoreResult<regex::Regex> {
    let mut re = String::with_capacity(pattern.len() * 2 + 2);
    re.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => re.push_str(".*"),
            '%' => re.push_str("[^/]*"),
            ch => re.push_str(&regex::escape(&ch.to_string())),
        }
    }
    re.push('$');

    regex::Regex::new(&re)
        .map_err(|e| StoreError::Other(format!("Bad list pattern: {}", e)))
}

/// Resolves a wire-form sequence set against the mailbox, returning
/// matching sequence numbers in ascending order.
fn resolve_sequence_set(
    text: &str,
    data: &MailboxData,
    by_uid: bool,
) -> StoreResult<Vec<u32>> {
    let max = if by_uid {
        data.messages.last().map(|m| m.uid).unwrap_or(0)
    } else {
        data.messages.len() as u32
    };

    let ranges = parse_sequence_set(text, max)?;

    let mut hits = Vec::new();
    for (ix, message) in data.messages.iter().enumerate() {
        let seqnum = ix as u32 + 1;
        let key = if by_uid { message.uid } else { seqnum };
        if ranges.iter().any(|&(lo, hi)| key >= lo && key <= hi) {
            hits.push(seqnum);
        }
    }

    // Sequence numbers outside the current snapshot are a protocol
    // violation; UIDs out of range are explicitly allowed, as is `*`
    // anywhere.
    if !by_uid && !text.contains('*') {
        if let Some(&(_, hi)) = ranges.iter().max_by_key(|&&(_, hi)| hi) {
            if hi > max {
                return Err(StoreError::Other(
                    "Message sequence number out of range".to_owned(),
                ));
            }
        }
    }

    Ok(hits)
}

/// Parses `n`, `n:m`, `*` and comma lists into inclusive ranges.
fn parse_sequence_set(
    text: &str,
    max: u32,
) -> StoreResult<Vec<(u32, u32)>> {
    fn value(part: &str, max: u32) -> StoreResult<u32> {
        if "*" == part {
            Ok(max)
        } else {
            part.parse::<u32>().map_err(|_| {
                StoreError::Other("Invalid sequence set".to_owned())
            })
        }
    }

    let mut ranges = Vec::new();
    for part in text.split(',') {
        if part.is_empty() {
            return Err(StoreError::Other("Invalid sequence set".to_owned()));
        }

        let (lo, hi) = match part.split_once(':') {
            None => {
                let v = value(part, max)?;
                (v, v)
            },
            Some((a, b)) => {
                let a = value(a, max)?;
                let b = value(b, max)?;
                (a.min(b), a.max(b))
            },
        };

        ranges.push((lo, hi));
    }

    Ok(ranges)
}

fn flatten_target(target: &FetchTarget) -> Vec<FetchAtt> {
    match *target {
        FetchTarget::All => vec![
            FetchAtt::Flags,
            FetchAtt::InternalDate,
            FetchAtt::Rfc822Size,
        ],
        FetchTarget::Fast => vec![
            FetchAtt::Flags,
            FetchAtt::InternalDate,
            FetchAtt::Rfc822Size,
        ],
        FetchTarget::Full => vec![
            FetchAtt::Flags,
            FetchAtt::InternalDate,
            FetchAtt::Rfc822Size,
            FetchAtt::BodySection {
                peek: true,
                section: String::new(),
            },
        ],
        FetchTarget::Single(ref att) => vec![att.clone()],
        FetchTarget::Multi(ref atts) => atts.clone(),
    }
}

fn fetch_item(att: &FetchAtt, message: &Message) -> Option<FetchItem> {
    match *att {
        FetchAtt::Flags => Some(FetchItem::Flags(message.flags.clone())),
        FetchAtt::Uid => Some(FetchItem::Uid(message.uid)),
        FetchAtt::Rfc822Size => {
            Some(FetchItem::Rfc822Size(message.body.len() as u32))
        },
        FetchAtt::InternalDate => {
            Some(FetchItem::InternalDate(message.internal_date))
        },
        FetchAtt::Rfc822 => Some(FetchItem::Literal {
            name: "RFC822".to_owned(),
            data: message.body.clone(),
        }),
        FetchAtt::Rfc822Header => Some(FetchItem::Literal {
            name: "RFC822.HEADER".to_owned(),
            data: header_of(&message.body).to_vec(),
        }),
        FetchAtt::Rfc822Text => Some(FetchItem::Literal {
            name: "RFC822.TEXT".to_owned(),
            data: text_of(&message.body).to_vec(),
        }),
        FetchAtt::BodySection { ref section, .. } => {
            let data = if section.is_empty() {
                message.body.clone()
            } else if section.eq_ignore_ascii_case("HEADER") {
                header_of(&message.body).to_vec()
            } else if section.eq_ignore_ascii_case("TEXT") {
                text_of(&message.body).to_vec()
            } else {
                return None;
            };
            Some(FetchItem::Literal {
                name: format!("BODY[{}]", section),
                data,
            })
        },
        // This backend does not parse MIME structure.
        FetchAtt::Envelope | FetchAtt::Body | FetchAtt::BodyStructure => None,
    }
}

fn header_boundary(body: &[u8]) -> usize {
    body.windows(4)
        .position(|w| b"\r\n\r\n" == w)
        .map(|p| p + 4)
        .unwrap_or(body.len())
}

fn header_of(body: &[u8]) -> &[u8] {
    &body[..header_boundary(body)]
}

fn text_of(body: &[u8]) -> &[u8] {
    &body[header_boundary(body)..]
}

fn eval_search(
    node: &SearchNode,
    seqnum: u32,
    message: &Message,
    data: &MailboxData,
) -> StoreResult<bool> {
    match *node {
        SearchNode::List(ref nodes) => {
            for node in nodes {
                if !eval_search(node, seqnum, message, data)? {
                    return Ok(false);
                }
            }
            Ok(true)
        },

        SearchNode::Not(ref inner) => {
            Ok(!eval_search(inner, seqnum, message, data)?)
        },

        SearchNode::Or(ref a, ref b) => {
            Ok(eval_search(a, seqnum, message, data)?
                || eval_search(b, seqnum, message, data)?)
        },

        SearchNode::Key(ref text) => eval_search_key(text, seqnum, message, data),
    }
}

fn eval_search_key(
    text: &str,
    seqnum: u32,
    message: &Message,
    data: &MailboxData,
) -> StoreResult<bool> {
    let (word, arg) = match text.split_once(' ') {
        Some((word, arg)) => (word, arg),
        None => (text, ""),
    };

    let has = |flag: &Flag| message.flags.contains(flag);

    match word {
        "ALL" => Ok(true),
        "ANSWERED" => Ok(has(&Flag::Answered)),
        "UNANSWERED" => Ok(!has(&Flag::Answered)),
        "DELETED" => Ok(has(&Flag::Deleted)),
        "UNDELETED" => Ok(!has(&Flag::Deleted)),
        "DRAFT" => Ok(has(&Flag::Draft)),
        "UNDRAFT" => Ok(!has(&Flag::Draft)),
        "FLAGGED" => Ok(has(&Flag::Flagged)),
        "UNFLAGGED" => Ok(!has(&Flag::Flagged)),
        "SEEN" => Ok(has(&Flag::Seen)),
        "UNSEEN" => Ok(!has(&Flag::Seen)),
        "NEW" => Ok(message.recent && !has(&Flag::Seen)),
        "OLD" => Ok(!message.recent),
        "RECENT" => Ok(message.recent),

        "KEYWORD" => Ok(has(&Flag::Keyword(unquote(arg)))),
        "UNKEYWORD" => Ok(!has(&Flag::Keyword(unquote(arg)))),

        "FROM" => Ok(header_field_contains(message, "From", &unquote(arg))),
        "TO" => Ok(header_field_contains(message, "To", &unquote(arg))),
        "CC" => Ok(header_field_contains(message, "Cc", &unquote(arg))),
        "BCC" => Ok(header_field_contains(message, "Bcc", &unquote(arg))),
        "SUBJECT" => {
            Ok(header_field_contains(message, "Subject", &unquote(arg)))
        },
        "HEADER" => {
            let (field, value) = match arg.split_once(' ') {
                Some(pair) => pair,
                None => (arg, ""),
            };
            Ok(header_field_contains(
                message,
                &unquote(field),
                &unquote(value),
            ))
        },

        "BODY" => Ok(contains_ci(text_of(&message.body), &unquote(arg))),
        "TEXT" => Ok(contains_ci(&message.body, &unquote(arg))),

        "LARGER" => Ok(message.body.len() as u64 > parse_number(arg)?),
        "SMALLER" => Ok((message.body.len() as u64) < parse_number(arg)?),

        "BEFORE" | "SENTBEFORE" => {
            Ok(message.internal_date.date_naive() < parse_date(arg)?)
        },
        "ON" | "SENTON" => {
            Ok(message.internal_date.date_naive() == parse_date(arg)?)
        },
        "SINCE" | "SENTSINCE" => {
            Ok(message.internal_date.date_naive() >= parse_date(arg)?)
        },

        "UID" => {
            let max = data.messages.last().map(|m| m.uid).unwrap_or(0);
            let ranges = parse_sequence_set(arg, max)?;
            Ok(ranges
                .iter()
                .any(|&(lo, hi)| message.uid >= lo && message.uid <= hi))
        },

        _ => {
            // A bare sequence set, or something we don't understand.
            if text
                .bytes()
                .all(|b| b.is_ascii_digit() || b':' == b || b',' == b || b'*' == b)
            {
                let max = data.messages.len() as u32;
                let ranges = parse_sequence_set(text, max)?;
                Ok(ranges
                    .iter()
                    .any(|&(lo, hi)| seqnum >= lo && seqnum <= hi))
            } else {
                Err(StoreError::Other(format!(
                    "Unsupported search key: {}",
                    word
                )))
            }
        },
    }
}

fn parse_number(arg: &str) -> StoreResult<u64> {
    arg.parse::<u64>()
        .map_err(|_| StoreError::Other("Invalid search argument".to_owned()))
}

fn parse_date(arg: &str) -> StoreResult<NaiveDate> {
    NaiveDate::parse_from_str(arg, "%d-%b-%Y")
        .map_err(|_| StoreError::Other("Invalid search date".to_owned()))
}

fn unquote(arg: &str) -> String {
    if arg.len() >= 2 && arg.starts_with('"') && arg.ends_with('"') {
        arg[1..arg.len() - 1]
            .replace("\\\"", "\"")
            .replace("\\\\", "\\")
    } else {
        arg.to_owned()
    }
}

fn header_field_contains(message: &Message, field: &str, value: &str) -> bool {
    let header = header_of(&message.body);
    let prefix = format!("{}:", field).to_ascii_lowercase();

    for line in header.split(|&b| b'\n' == b) {
        let lower: Vec<u8> = line.to_ascii_lowercase();
        if lower.starts_with(prefix.as_bytes())
            && contains_ci(&line[prefix.len()..], value)
        {
            return true;
        }
    }

    false
}

fn contains_ci(haystack: &[u8], needle: &str) -> bool {
    if needle.is_empty() {
        return true;
    }

    let haystack = haystack.to_ascii_lowercase();
    let needle = needle.to_ascii_lowercase();
    haystack
        .windows(needle.len())
        .any(|w| w == needle.as_bytes())
}

#[cfg(test)]
mod test {
    use super::*;

    fn store_with_user() -> MemoryStore {
        let store = MemoryStore::new();
        store.add_user("azure", "hunter2");
        store
    }

    async fn append_message(
        mailbox: &mut Box<dyn MailboxStore + Send>,
        target: &str,
        body: &str,
    ) {
        let mut data = body.as_bytes();
        mailbox
            .append(target, vec![], None, body.len() as u32, &mut data)
            .await
            .unwrap();
    }

    #[test]
    fn login_checks_credentials() {
        let store = store_with_user();
        assert_eq!(Ok("azure".to_owned()), store.login("azure", "hunter2"));
        assert_eq!(
            Err(AuthError::BadCredentials),
            store.login("azure", "wrong")
        );
        assert_eq!(
            Err(AuthError::BadCredentials),
            store.login("nobody", "hunter2")
        );
    }

    #[test]
    fn authenticate_plain() {
        let store = store_with_user();
        let blob = base64::encode("\x00azure\x00hunter2");
        assert_eq!(
            Ok("azure".to_owned()),
            store.authenticate("PLAIN", blob.as_bytes())
        );
        assert_eq!(
            Err(AuthError::UnsupportedMechanism),
            store.authenticate("CRAM-MD5", blob.as_bytes())
        );
        assert_eq!(
            Err(AuthError::Malformed),
            store.authenticate("PLAIN", b"!!not-base64!!")
        );
    }

    #[tokio::test]
    async fn append_select_fetch() {
        let store = store_with_user();
        let mut mailbox = store.open("azure").unwrap();

        append_message(
            &mut mailbox,
            "INBOX",
            "From: bob@example.com\r\nSubject: hi\r\n\r\nhello world\r\n",
        )
        .await;

        let header = mailbox.select("INBOX", false).unwrap();
        assert_eq!(1, header.exists);
        assert_eq!(1, header.recent);
        assert_eq!(1, header.unseen);
        assert_eq!(2, header.uidnext);
        assert_eq!("1", header.uidvalidity);

        let mut fetched = Vec::new();
        mailbox
            .fetch(
                "1",
                &FetchTarget::Multi(vec![FetchAtt::Uid, FetchAtt::Rfc822Size]),
                false,
                &mut |seq, items| fetched.push((seq, items)),
            )
            .unwrap();

        assert_eq!(1, fetched.len());
        let (seq, items) = &fetched[0];
        assert_eq!(1, *seq);
        assert!(items.contains(&FetchItem::Uid(1)));
    }

    #[tokio::test]
    async fn append_to_missing_mailbox_consumes_payload() {
        let store = store_with_user();
        let mut mailbox = store.open("azure").unwrap();

        let payload = b"hello";
        let mut data = &payload[..];
        let result = mailbox
            .append("NoSuchBox", vec![], None, 5, &mut data)
            .await;
        assert_eq!(Err(AppendError::NxMailbox), result);
        // The payload was fully consumed despite the failure.
        assert!(data.is_empty());
    }

    #[tokio::test]
    async fn truncated_append_reports_eof() {
        let store = store_with_user();
        let mut mailbox = store.open("azure").unwrap();

        let mut data = &b"short"[..];
        let result = mailbox.append("INBOX", vec![], None, 100, &mut data).await;
        assert_eq!(Err(AppendError::Truncated), result);
    }

    #[tokio::test]
    async fn store_and_expunge() {
        let store = store_with_user();
        let mut mailbox = store.open("azure").unwrap();

        append_message(&mut mailbox, "INBOX", "a").await;
        append_message(&mut mailbox, "INBOX", "b").await;
        append_message(&mut mailbox, "INBOX", "c").await;
        mailbox.select("INBOX", false).unwrap();

        let mut stored = Vec::new();
        mailbox
            .store_flags(
                "2",
                StoreType::Add,
                false,
                &[Flag::Deleted],
                false,
                &mut |seq, items| stored.push((seq, items)),
            )
            .unwrap();
        assert_eq!(1, stored.len());
        assert_eq!(
            FetchItem::Flags(vec![Flag::Deleted]),
            stored[0].1[0]
        );

        let mut expunged = Vec::new();
        mailbox.expunge(&mut |seq| expunged.push(seq)).unwrap();
        assert_eq!(vec![2], expunged);

        assert_eq!(2, mailbox.status("INBOX").unwrap().exists);
    }

    #[tokio::test]
    async fn copy_assigns_fresh_uids() {
        let store = store_with_user();
        store.add_mailbox("azure", "Archive", "7");
        let mut mailbox = store.open("azure").unwrap();

        append_message(&mut mailbox, "INBOX", "a").await;
        append_message(&mut mailbox, "INBOX", "b").await;
        mailbox.select("INBOX", false).unwrap();

        mailbox.copy("Archive", "1:2", false).unwrap();
        let header = mailbox.status("Archive").unwrap();
        assert_eq!(2, header.exists);
        assert_eq!(3, header.uidnext);

        assert_eq!(
            Err(StoreError::NxMailbox),
            mailbox.copy("Missing", "1", false)
        );
    }

    #[tokio::test]
    async fn search_evaluates_trees() {
        let store = store_with_user();
        let mut mailbox = store.open("azure").unwrap();

        append_message(
            &mut mailbox,
            "INBOX",
            "From: bob@example.com\r\nSubject: invoice\r\n\r\npay up\r\n",
        )
        .await;
        append_message(
            &mut mailbox,
            "INBOX",
            "From: carol@example.com\r\nSubject: lunch\r\n\r\nnoodles?\r\n",
        )
        .await;
        mailbox.select("INBOX", false).unwrap();

        mailbox
            .store_flags(
                "1",
                StoreType::Add,
                true,
                &[Flag::Seen],
                false,
                &mut |_, _| {},
            )
            .unwrap();

        let hits = mailbox
            .search(&SearchNode::Key("UNSEEN".to_owned()), false)
            .unwrap();
        assert_eq!(vec![2], hits);

        let hits = mailbox
            .search(&SearchNode::Key("FROM bob".to_owned()), false)
            .unwrap();
        assert_eq!(vec![1], hits);

        let hits = mailbox
            .search(
                &SearchNode::Or(
                    Box::new(SearchNode::Key("FROM bob".to_owned())),
                    Box::new(SearchNode::Key("SUBJECT lunch".to_owned())),
                ),
                false,
            )
            .unwrap();
        assert_eq!(vec![1, 2], hits);

        let hits = mailbox
            .search(
                &SearchNode::Not(Box::new(SearchNode::Key(
                    "SEEN".to_owned(),
                ))),
                false,
            )
            .unwrap();
        assert_eq!(vec![2], hits);
    }

    #[test]
    fn list_patterns() {
        let store = store_with_user();
        store.add_mailbox("azure", "Archive", "2");
        store.add_mailbox("azure", "Archive/2025", "3");
        store.add_mailbox("azure", "Drafts", "4");
        let mailbox = store.open("azure").unwrap();

        let names = |entries: Vec<ListEntry>| {
            entries.into_iter().map(|e| e.name).collect::<Vec<_>>()
        };

        let all = names(mailbox.list_mailboxes("", "*").unwrap());
        assert_eq!(
            vec!["Archive", "Archive/2025", "Drafts", "INBOX"],
            all
        );

        // % does not cross the hierarchy delimiter.
        let top = names(mailbox.list_mailboxes("", "%").unwrap());
        assert_eq!(vec!["Archive", "Drafts", "INBOX"], top);

        let under = names(mailbox.list_mailboxes("Archive/", "%").unwrap());
        assert_eq!(vec!["Archive/2025"], under);
    }

    #[test]
    fn list_reports_children() {
        let store = store_with_user();
        store.add_mailbox("azure", "Archive", "2");
        store.add_mailbox("azure", "Archive/2025", "3");
        let mailbox = store.open("azure").unwrap();

        let entries = mailbox.list_mailboxes("", "*").unwrap();
        let archive = entries.iter().find(|e| "Archive" == e.name).unwrap();
        assert!(archive.flags.contains(&"\\HasChildren".to_owned()));
        let inbox = entries.iter().find(|e| "INBOX" == e.name).unwrap();
        assert!(inbox.flags.contains(&"\\HasNoChildren".to_owned()));
    }

    #[test]
    fn lsub_respects_subscriptions() {
        let store = store_with_user();
        store.add_mailbox("azure", "Archive", "2");
        let mut mailbox = store.open("azure").unwrap();

        assert!(mailbox.list_subscriptions("", "*").unwrap().is_empty());
        mailbox.subscribe("Archive").unwrap();
        let entries = mailbox.list_subscriptions("", "*").unwrap();
        assert_eq!(1, entries.len());
        assert_eq!("Archive", entries[0].name);
    }

    #[test]
    fn rename_moves_children() {
        let store = store_with_user();
        store.add_mailbox("azure", "Old", "2");
        store.add_mailbox("azure", "Old/Sub", "3");
        let mut mailbox = store.open("azure").unwrap();

        mailbox.rename_mailbox("Old", "New").unwrap();
        assert!(mailbox.status("New").is_ok());
        assert!(mailbox.status("New/Sub").is_ok());
        assert_eq!(Err(StoreError::NxMailbox), mailbox.status("Old"));
    }

    #[test]
    fn delete_refuses_inbox_and_parents() {
        let store = store_with_user();
        store.add_mailbox("azure", "Parent", "2");
        store.add_mailbox("azure", "Parent/Child", "3");
        let mut mailbox = store.open("azure").unwrap();

        assert!(mailbox.delete_mailbox("INBOX").is_err());
        assert!(mailbox.delete_mailbox("Parent").is_err());
        mailbox.delete_mailbox("Parent/Child").unwrap();
        mailbox.delete_mailbox("Parent").unwrap();
    }

    #[test]
    fn inbox_is_case_insensitive() {
        let store = store_with_user();
        let mailbox = store.open("azure").unwrap();
        assert!(mailbox.status("inbox").is_ok());
        assert!(mailbox.status("InBoX").is_ok());
    }

    #[test]
    fn unselectable_mailbox_cannot_be_selected() {
        let store = store_with_user();
        store.add_mailbox("azure", "Spool", "5");
        store.mark_unselectable("azure", "Spool");
        let mut mailbox = store.open("azure").unwrap();

        assert_eq!(
            Err(StoreError::Unselectable),
            mailbox.select("Spool", false).map(|_| ())
        );
    }

    #[test]
    fn sequence_set_parsing() {
        assert_eq!(
            vec![(1, 1), (3, 5), (7, 10)],
            parse_sequence_set("1,3:5,7:10", 10).unwrap()
        );
        assert_eq!(vec![(10, 10)], parse_sequence_set("*", 10).unwrap());
        // Backwards ranges normalise.
        assert_eq!(vec![(2, 10)], parse_sequence_set("10:2", 10).unwrap());
        assert!(parse_sequence_set("1,,2", 10).is_err());
        assert!(parse_sequence_set("x", 10).is_err());
    }

    #[tokio::test]
    async fn select_claims_recent() {
        let store = store_with_user();
        let mut mailbox = store.open("azure").unwrap();
        append_message(&mut mailbox, "INBOX", "a").await;

        let header = mailbox.select("INBOX", false).unwrap();
        assert_eq!(1, header.recent);

        // A second select sees nothing recent.
        let header = mailbox.select("INBOX", false).unwrap();
        assert_eq!(0, header.recent);
    }
}
