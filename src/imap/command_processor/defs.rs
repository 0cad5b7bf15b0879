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

use std::borrow::Cow;
use std::sync::Arc;

use crate::imap::registry::ConnectionRegistry;
use crate::imap::response_writer::{OutputControl, OutputEvent};
use crate::imap::session::SessionState;
use crate::store::model::{Flag, StoreError};
use crate::store::{AccountStore, MailboxFactory, MailboxStore};
use crate::support::{log_prefix::LogPrefix, system_config::SystemConfig};

pub(super) use crate::imap::syntax as s;

pub(super) static TAGLINE: &str = concat!(
    "High tide brings the mail in (",
    env!("CARGO_PKG_NAME"),
    " ",
    env!("CARGO_PKG_VERSION_MAJOR"),
    ".",
    env!("CARGO_PKG_VERSION_MINOR"),
    ".",
    env!("CARGO_PKG_VERSION_PATCH"),
    " ready)"
);

/// Receives commands in the raw AST defined in the `syntax` module, and
/// emits responses in that same raw AST model.
///
/// While primarily a translation layer between the wire grammar and the
/// storage contracts, it also owns the high-level session state machine:
/// authentication status, the selected mailbox, the pending IDLE tag, and
/// the deferred idler notification raised by mutating commands.
pub struct CommandProcessor {
    pub(super) log_prefix: LogPrefix,
    pub(super) system_config: Arc<SystemConfig>,
    pub(super) accounts: Arc<dyn AccountStore + Send + Sync>,
    pub(super) mailboxes: Arc<dyn MailboxFactory + Send + Sync>,
    pub(super) registry: ConnectionRegistry,
    pub(super) connection_id: u64,

    pub(super) state: SessionState,
    pub(super) mailbox: Option<Box<dyn MailboxStore + Send>>,
    /// The tag of the IDLE awaiting its DONE, if the session is idling.
    pub(super) idle_tag: Option<String>,
    /// Set by handlers that changed message counts; the session loop
    /// flushes it to sibling idlers after the tagged response is written.
    pub(super) notify_pending: bool,
}

/// Used just for the convenient `?` operator. We mostly don't distinguish
/// `Ok` from `Err`; the contained value is sent down the wire either way.
pub(super) type CmdResult = Result<s::Response<'static>, s::Response<'static>>;

/// Return value from an operation that can either succeed with a value, or
/// fail with an IMAP response.
pub(super) type PartialResult<T> = Result<T, s::Response<'static>>;

/// Channel used to emit additional untagged responses as they become
/// available.
pub(super) type SendResponse = tokio::sync::mpsc::UnboundedSender<OutputEvent>;

impl CommandProcessor {
    pub fn new(
        log_prefix: LogPrefix,
        system_config: Arc<SystemConfig>,
        accounts: Arc<dyn AccountStore + Send + Sync>,
        mailboxes: Arc<dyn MailboxFactory + Send + Sync>,
        registry: ConnectionRegistry,
        connection_id: u64,
    ) -> Self {
        CommandProcessor {
            log_prefix,
            system_config,
            accounts,
            mailboxes,
            registry,
            connection_id,

            state: SessionState::NotAuthenticated,
            mailbox: None,
            idle_tag: None,
            notify_pending: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn logged_out(&self) -> bool {
        SessionState::Logout == self.state
    }

    pub fn is_idling(&self) -> bool {
        self.idle_tag.is_some()
    }

    pub fn log_prefix(&self) -> &LogPrefix {
        &self.log_prefix
    }

    pub fn starttls_enabled(&self) -> bool {
        self.system_config.imap.starttls && self.system_config.tls.is_some()
    }

    pub fn max_msg_size(&self) -> u32 {
        self.system_config.imap.max_msg_size
    }

    pub(super) fn require_mailbox(
        &mut self,
    ) -> PartialResult<&mut (dyn MailboxStore + Send)> {
        match self.mailbox {
            Some(ref mut mailbox) => Ok(mailbox.as_mut()),
            None => Err(condr(s::RespCondType::Bad, None, "Not logged in")),
        }
    }

    /// Pushes EXISTS/RECENT to sibling idlers if the last command changed
    /// message counts. Called by the session loop after the tagged
    /// response has been written, which is what keeps the originating
    /// session's own response strictly ahead of the fan-out.
    pub fn flush_notifications(&mut self) {
        if !self.notify_pending {
            return;
        }
        self.notify_pending = false;

        let Some(ref store) = self.mailbox else { return };
        let user = store.user().to_owned();
        self.registry.notify(self.connection_id, &user, |mailbox| {
            store
                .status(mailbox)
                .ok()
                .map(|header| (header.exists, header.recent))
        });
    }

    /// Deregisters this connection from the idle table. Safe to call
    /// multiple times; the session loop calls it unconditionally on exit
    /// so a failing handler cannot leak an entry.
    pub fn teardown(&mut self) {
        self.registry.deregister(self.connection_id);
        self.idle_tag = None;
    }
}

/// The flags the backends in this tree support; advertised by
/// SELECT/EXAMINE as both FLAGS and PERMANENTFLAGS.
pub(super) fn system_flags() -> Vec<Flag> {
    vec![
        Flag::Answered,
        Flag::Flagged,
        Flag::Deleted,
        Flag::Seen,
        Flag::Draft,
    ]
}

pub(super) fn condr(
    cond: s::RespCondType,
    code: Option<s::RespTextCode<'static>>,
    quip: impl Into<Cow<'static, str>>,
) -> s::Response<'static> {
    s::Response::Cond(s::CondResponse {
        cond,
        code,
        quip: Some(quip.into()),
    })
}

pub(super) fn success(quip: &'static str) -> CmdResult {
    Ok(condr(s::RespCondType::Ok, None, quip))
}

pub(super) fn map_store_error(e: StoreError) -> s::Response<'static> {
    condr(s::RespCondType::No, None, e.to_string())
}

pub(super) fn send_response(
    sender: &SendResponse,
    response: s::Response<'static>,
) {
    let _ = sender.send(OutputEvent::ResponseLine {
        line: s::ResponseLine {
            tag: None,
            response,
        },
        ctl: OutputControl::Buffer,
    });
}
