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

//! The contracts between the IMAP front end and its collaborators: the
//! account/credential backend and the mailbox storage backend.
//!
//! The protocol layer knows nothing about how mail is stored. It hands the
//! backend parsed requests (sequence sets still in wire form, search
//! programs as trees) and receives counters, list entries and fetch items
//! back. The only asynchronous operation is `append`, which consumes its
//! literal directly from the connection so that large messages are never
//! buffered by the core.

use async_trait::async_trait;
use chrono::prelude::*;
use tokio::io::AsyncRead;

pub mod memory;
pub mod model;

pub use model::*;

/// Verifies credentials for LOGIN and AUTHENTICATE.
///
/// Both methods return the canonical user name on success.
pub trait AccountStore {
    /// Plaintext LOGIN.
    fn login(&self, userid: &str, password: &str) -> Result<String, AuthError>;

    /// SASL AUTHENTICATE. `data` is the raw (base64) client response; the
    /// backend owns decoding since the format is mechanism-specific.
    fn authenticate(
        &self,
        mechanism: &str,
        data: &[u8],
    ) -> Result<String, AuthError>;
}

/// Opens the mailbox universe of an authenticated user.
pub trait MailboxFactory {
    fn open(&self, user: &str) -> StoreResult<Box<dyn MailboxStore + Send>>;
}

/// Callback used by fetch/store to emit untagged per-message data before
/// the tagged completion is written.
pub type EmitFetch<'a> = &'a mut dyn FnMut(u32, Vec<FetchItem>);

/// Callback used by expunge to emit untagged EXPUNGE responses.
pub type EmitExpunge<'a> = &'a mut dyn FnMut(u32);

/// A user's view of their mailboxes, bound to one session.
///
/// The handle also carries the session's selected mailbox, if any; `select`
/// installs it and `close` removes it.
#[async_trait(?Send)]
pub trait MailboxStore {
    /// The user this handle is bound to.
    fn user(&self) -> &str;

    fn create_mailbox(&mut self, name: &str) -> StoreResult<()>;
    fn delete_mailbox(&mut self, name: &str) -> StoreResult<()>;
    fn rename_mailbox(&mut self, src: &str, dst: &str) -> StoreResult<()>;
    fn subscribe(&mut self, name: &str) -> StoreResult<()>;
    fn unsubscribe(&mut self, name: &str) -> StoreResult<()>;

    fn list_mailboxes(
        &self,
        reference: &str,
        pattern: &str,
    ) -> StoreResult<Vec<ListEntry>>;
    fn list_subscriptions(
        &self,
        reference: &str,
        pattern: &str,
    ) -> StoreResult<Vec<ListEntry>>;

    /// Returns the header counters of `mailbox` without selecting it.
    fn status(&self, mailbox: &str) -> StoreResult<MailboxHeader>;

    /// Selects `mailbox` and returns its header counters.
    ///
    /// A `read_only` select corresponds to EXAMINE.
    fn select(
        &mut self,
        mailbox: &str,
        read_only: bool,
    ) -> StoreResult<MailboxHeader>;

    /// The currently selected mailbox, if any.
    fn selected_mailbox(&self) -> Option<&str>;

    /// Whether the selection is read-only.
    fn read_only(&self) -> bool;

    /// Drops the selection without expunging anything. Used when a SELECT
    /// fails partway (the session must not stay half-selected) and when a
    /// new SELECT implicitly replaces the old one.
    fn unselect(&mut self);

    /// Silently expunges `\Deleted` messages and deselects.
    fn close(&mut self);

    /// Appends a message of exactly `size` bytes, consumed from `data`.
    ///
    /// The implementation must read the full `size` bytes even on failure
    /// paths it can recover from, so the protocol stream stays
    /// synchronised. Hitting EOF before `size` bytes is `Truncated`, after
    /// which the stream is unusable.
    async fn append(
        &mut self,
        mailbox: &str,
        flags: Vec<Flag>,
        internal_date: Option<DateTime<FixedOffset>>,
        size: u32,
        data: &mut (dyn AsyncRead + Unpin),
    ) -> Result<(), AppendError>;

    fn fetch(
        &mut self,
        sequence_set: &str,
        target: &FetchTarget,
        by_uid: bool,
        emit: EmitFetch<'_>,
    ) -> StoreResult<()>;

    fn store_flags(
        &mut self,
        sequence_set: &str,
        op: StoreType,
        silent: bool,
        flags: &[Flag],
        by_uid: bool,
        emit: EmitFetch<'_>,
    ) -> StoreResult<()>;

    fn copy(
        &mut self,
        destination: &str,
        sequence_set: &str,
        by_uid: bool,
    ) -> StoreResult<()>;

    fn expunge(&mut self, emit: EmitExpunge<'_>) -> StoreResult<()>;

    fn search(
        &self,
        program: &SearchNode,
        by_uid: bool,
    ) -> StoreResult<Vec<u32>>;
}
