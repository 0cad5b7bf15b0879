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

use tokio::io::AsyncRead;

use super::defs::*;
use crate::imap::session::{CommandGroup, SessionState};
use crate::store::model::AppendError;

impl CommandProcessor {
    pub(super) fn cmd_fetch(
        &mut self,
        cmd: s::FetchCommand<'_>,
        by_uid: bool,
        sender: &SendResponse,
    ) -> CmdResult {
        self.require_mailbox()?
            .fetch(&cmd.sequence_set, &cmd.target, by_uid, &mut |seq, items| {
                send_response(sender, s::Response::Fetch(seq, items));
            })
            .map_err(map_store_error)?;
        success("FETCH completed")
    }

    pub(super) fn cmd_store(
        &mut self,
        cmd: s::StoreCommand<'_>,
        by_uid: bool,
        sender: &SendResponse,
    ) -> CmdResult {
        self.require_mailbox()?
            .store_flags(
                &cmd.sequence_set,
                cmd.typ,
                cmd.silent,
                &cmd.flags,
                by_uid,
                &mut |seq, items| {
                    send_response(sender, s::Response::Fetch(seq, items));
                },
            )
            .map_err(map_store_error)?;

        self.notify_pending = true;
        success("STORE completed")
    }

    pub(super) fn cmd_copy(
        &mut self,
        cmd: s::CopyCommand<'_>,
        by_uid: bool,
    ) -> CmdResult {
        self.require_mailbox()?
            .copy(&cmd.mailbox, &cmd.sequence_set, by_uid)
            .map_err(|e| match e {
                crate::store::model::StoreError::NxMailbox => condr(
                    s::RespCondType::No,
                    Some(s::RespTextCode::TryCreate),
                    "No such mailbox",
                ),
                e => map_store_error(e),
            })?;

        self.notify_pending = true;
        success("COPY completed")
    }

    pub(super) fn cmd_search(
        &mut self,
        cmd: s::SearchCommand<'_>,
        by_uid: bool,
        sender: &SendResponse,
    ) -> CmdResult {
        // The charset argument is accepted but not acted upon; only the
        // default charset behaviour is provided.
        let hits = self
            .require_mailbox()?
            .search(&cmd.program, by_uid)
            .map_err(map_store_error)?;

        send_response(sender, s::Response::Search(hits));
        success("SEARCH completed")
    }

    pub(super) fn cmd_expunge(&mut self, sender: &SendResponse) -> CmdResult {
        self.require_mailbox()?
            .expunge(&mut |seq| {
                send_response(sender, s::Response::Expunge(seq));
            })
            .map_err(map_store_error)?;

        self.notify_pending = true;
        success("EXPUNGE completed")
    }

    /// APPEND, after the protocol layer has accepted the literal size and
    /// sent any continuation. `data` yields exactly `size` bytes; the
    /// storage backend consumes them directly so the message is never
    /// buffered here.
    pub async fn cmd_append(
        &mut self,
        cmd: s::AppendCommandStart<'_>,
        size: u32,
        data: &mut (dyn AsyncRead + Unpin),
    ) -> s::ResponseLine<'static> {
        let tag = cmd.tag.clone().into_owned();

        let response = if !self.state.accepts(CommandGroup::Authenticated) {
            condr(s::RespCondType::Bad, None, "Bad Command")
        } else {
            match self.require_mailbox() {
                Err(response) => response,
                Ok(store) => {
                    match store
                        .append(
                            &cmd.mailbox,
                            cmd.flags,
                            cmd.internal_date,
                            size,
                            data,
                        )
                        .await
                    {
                        Ok(()) => {
                            self.notify_pending = true;
                            condr(
                                s::RespCondType::Ok,
                                None,
                                "APPEND completed",
                            )
                        },
                        Err(e) => self.append_error_response(e),
                    }
                },
            }
        };

        s::ResponseLine {
            tag: Some(Cow::Owned(tag)),
            response,
        }
    }

    /// LAPPEND: the privileged local-injection variant. A temporary
    /// mailbox handle is synthesized for the named user for this command
    /// only; idlers of that user are notified directly since the handle
    /// is not this session's.
    pub async fn cmd_lappend(
        &mut self,
        cmd: s::LappendCommandStart<'_>,
        size: u32,
        data: &mut (dyn AsyncRead + Unpin),
    ) -> s::ResponseLine<'static> {
        let tag = cmd.tag.clone().into_owned();

        let response = if SessionState::NotAuthenticated != self.state {
            condr(s::RespCondType::Bad, None, "Bad Command")
        } else {
            match self.mailboxes.open(&cmd.user) {
                Err(e) => map_store_error(e),
                Ok(mut store) => {
                    match store
                        .append(&cmd.mailbox, vec![], None, size, data)
                        .await
                    {
                        Ok(()) => {
                            self.registry.notify(
                                self.connection_id,
                                &cmd.user,
                                |mailbox| {
                                    store.status(mailbox).ok().map(|header| {
                                        (header.exists, header.recent)
                                    })
                                },
                            );
                            condr(
                                s::RespCondType::Ok,
                                None,
                                "LAPPEND completed",
                            )
                        },
                        Err(e) => self.append_error_response(e),
                    }
                },
            }
        };

        s::ResponseLine {
            tag: Some(Cow::Owned(tag)),
            response,
        }
    }

    fn append_error_response(&mut self, e: AppendError) -> s::Response<'static> {
        match e {
            AppendError::NxMailbox | AppendError::Unselectable => condr(
                s::RespCondType::No,
                Some(s::RespTextCode::TryCreate),
                e.to_string(),
            ),
            // The client stream is unrecoverable after a short literal.
            AppendError::Truncated => {
                self.state = SessionState::Logout;
                condr(s::RespCondType::No, None, "Truncated Message")
            },
            AppendError::Other(msg) => {
                condr(s::RespCondType::No, None, msg)
            },
        }
    }
}
