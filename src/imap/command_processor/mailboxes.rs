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

use super::defs::*;
use crate::imap::session::SessionState;
use crate::store::model::StatusItem;

impl CommandProcessor {
    /// Shared SELECT/EXAMINE implementation.
    ///
    /// On success the canonical prelude is emitted in this order: FLAGS,
    /// OK [PERMANENTFLAGS], EXISTS, RECENT, OK [UIDVALIDITY],
    /// OK [UIDNEXT], followed by the tagged OK [READ-WRITE]/[READ-ONLY].
    pub(super) fn select(
        &mut self,
        mailbox: &str,
        sender: &SendResponse,
        read_only: bool,
    ) -> CmdResult {
        // SELECT and EXAMINE drop any current selection regardless of
        // whether they succeed.
        if SessionState::Selected == self.state {
            self.state = SessionState::Authenticated;
        }
        let store = self.require_mailbox()?;
        store.unselect();

        let header = store
            .select(mailbox, read_only)
            .map_err(map_store_error)?;

        if header.uidvalidity.is_empty() {
            // The backend cannot produce a UID validity token for this
            // mailbox, which makes it unusable for clients.
            store.unselect();
            return Err(condr(
                s::RespCondType::No,
                None,
                format!("Mailbox {} has no UIDVALIDITY", mailbox),
            ));
        }

        send_response(sender, s::Response::Flags(system_flags()));
        send_response(
            sender,
            s::Response::Cond(s::CondResponse {
                cond: s::RespCondType::Ok,
                code: Some(s::RespTextCode::PermanentFlags(system_flags())),
                quip: None,
            }),
        );
        send_response(sender, s::Response::Exists(header.exists));
        send_response(sender, s::Response::Recent(header.recent));
        send_response(
            sender,
            s::Response::Cond(s::CondResponse {
                cond: s::RespCondType::Ok,
                code: Some(s::RespTextCode::UidValidity(Cow::Owned(
                    header.uidvalidity,
                ))),
                quip: None,
            }),
        );
        send_response(
            sender,
            s::Response::Cond(s::CondResponse {
                cond: s::RespCondType::Ok,
                code: Some(s::RespTextCode::UidNext(header.uidnext)),
                quip: None,
            }),
        );

        self.state = SessionState::Selected;
        Ok(condr(
            s::RespCondType::Ok,
            Some(if read_only {
                s::RespTextCode::ReadOnly
            } else {
                s::RespTextCode::ReadWrite
            }),
            "Mailbox selected",
        ))
    }

    pub(super) fn cmd_close(&mut self) -> CmdResult {
        let store = self.require_mailbox()?;
        store.close();
        self.state = SessionState::Authenticated;
        success("CLOSE completed")
    }

    pub(super) fn cmd_create(
        &mut self,
        cmd: s::CreateCommand<'_>,
    ) -> CmdResult {
        self.require_mailbox()?
            .create_mailbox(&cmd.mailbox)
            .map_err(map_store_error)?;
        success("CREATE completed")
    }

    pub(super) fn cmd_delete(
        &mut self,
        cmd: s::DeleteCommand<'_>,
    ) -> CmdResult {
        self.require_mailbox()?
            .delete_mailbox(&cmd.mailbox)
            .map_err(map_store_error)?;
        success("DELETE completed")
    }

    pub(super) fn cmd_rename(
        &mut self,
        cmd: s::RenameCommand<'_>,
    ) -> CmdResult {
        self.require_mailbox()?
            .rename_mailbox(&cmd.src, &cmd.dst)
            .map_err(map_store_error)?;
        success("RENAME completed")
    }

    pub(super) fn cmd_subscribe(
        &mut self,
        cmd: s::SubscribeCommand<'_>,
    ) -> CmdResult {
        self.require_mailbox()?
            .subscribe(&cmd.mailbox)
            .map_err(map_store_error)?;
        success("SUBSCRIBE completed")
    }

    pub(super) fn cmd_unsubscribe(
        &mut self,
        cmd: s::UnsubscribeCommand<'_>,
    ) -> CmdResult {
        self.require_mailbox()?
            .unsubscribe(&cmd.mailbox)
            .map_err(map_store_error)?;
        success("UNSUBSCRIBE completed")
    }

    pub(super) fn cmd_list(
        &mut self,
        cmd: s::ListCommand<'_>,
        sender: &SendResponse,
    ) -> CmdResult {
        let entries = self
            .require_mailbox()?
            .list_mailboxes(&cmd.reference, &cmd.pattern)
            .map_err(map_store_error)?;

        for entry in entries {
            send_response(
                sender,
                s::Response::List(s::MailboxList {
                    flags: entry.flags.into_iter().map(Cow::Owned).collect(),
                    name: Cow::Owned(entry.name),
                }),
            );
        }

        success("LIST completed")
    }

    pub(super) fn cmd_lsub(
        &mut self,
        cmd: s::ListCommand<'_>,
        sender: &SendResponse,
    ) -> CmdResult {
        let entries = self
            .require_mailbox()?
            .list_subscriptions(&cmd.reference, &cmd.pattern)
            .map_err(map_store_error)?;

        for entry in entries {
            send_response(
                sender,
                s::Response::Lsub(s::MailboxList {
                    flags: entry.flags.into_iter().map(Cow::Owned).collect(),
                    name: Cow::Owned(entry.name),
                }),
            );
        }

        success("LSUB completed")
    }

    /// STATUS runs an examine against the target mailbox and formats only
    /// the requested items, in the order the client presented them.
    pub(super) fn cmd_status(
        &mut self,
        cmd: s::StatusCommand<'_>,
        sender: &SendResponse,
    ) -> CmdResult {
        let header = self
            .require_mailbox()?
            .status(&cmd.mailbox)
            .map_err(map_store_error)?;

        if header.uidvalidity.is_empty()
            && cmd.items.contains(&StatusItem::Uidvalidity)
        {
            return Err(condr(
                s::RespCondType::No,
                None,
                format!("Mailbox {} has no UIDVALIDITY", cmd.mailbox),
            ));
        }

        let items = cmd
            .items
            .iter()
            .map(|&item| {
                let value = match item {
                    StatusItem::Messages => header.exists.to_string(),
                    StatusItem::Recent => header.recent.to_string(),
                    StatusItem::Uidnext => header.uidnext.to_string(),
                    StatusItem::Uidvalidity => header.uidvalidity.clone(),
                    StatusItem::Unseen => header.unseen.to_string(),
                };
                (item, Cow::Owned(value))
            })
            .collect();

        send_response(
            sender,
            s::Response::Status(s::StatusResponse {
                mailbox: Cow::Owned(cmd.mailbox.into_owned()),
                items,
            }),
        );

        success("STATUS completed")
    }
}
