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

use log::info;

use super::defs::*;
use crate::imap::session::{self, SessionState};

impl CommandProcessor {
    /// Returns the greeting line sent when a client connects.
    pub fn greet(&self) -> s::ResponseLine<'static> {
        s::ResponseLine {
            tag: None,
            response: condr(
                s::RespCondType::Ok,
                Some(s::RespTextCode::Capability(self.capability_strings())),
                TAGLINE,
            ),
        }
    }

    /// Handles a regular command, i.e., one that the protocol level does
    /// not give special treatment to.
    ///
    /// `sender` is used for any secondary (untagged) responses. The
    /// returned line is the final, tagged response.
    pub fn handle_command(
        &mut self,
        command_line: s::CommandLine<'_>,
        sender: &SendResponse,
    ) -> s::ResponseLine<'static> {
        let tag = command_line.tag.into_owned();

        if !self.state.accepts(session::group_of(&command_line.cmd)) {
            return s::ResponseLine {
                tag: Some(Cow::Owned(tag)),
                response: condr(s::RespCondType::Bad, None, "Bad Command"),
            };
        }

        let res = match command_line.cmd {
            s::Command::Simple(s::SimpleCommand::Capability) => {
                self.cmd_capability(sender)
            },
            s::Command::Simple(s::SimpleCommand::Noop) => {
                success("NOOP completed")
            },
            s::Command::Simple(s::SimpleCommand::Check) => {
                success("CHECK completed")
            },
            s::Command::Simple(s::SimpleCommand::Close) => self.cmd_close(),
            s::Command::Simple(s::SimpleCommand::Expunge) => {
                self.cmd_expunge(sender)
            },
            s::Command::Simple(s::SimpleCommand::LogOut) => {
                self.cmd_log_out(sender)
            },
            s::Command::Simple(s::SimpleCommand::Idle) => {
                panic!("IDLE should be dispatched by server.rs")
            },
            s::Command::Simple(s::SimpleCommand::StartTls) => {
                panic!("STARTTLS should be dispatched by server.rs")
            },

            s::Command::Id(params) => self.cmd_id(params, sender),
            s::Command::LogIn(cmd) => self.cmd_log_in(cmd),

            s::Command::Select(cmd) => self.select(&cmd.mailbox, sender, false),
            s::Command::Examine(cmd) => self.select(&cmd.mailbox, sender, true),
            s::Command::Create(cmd) => self.cmd_create(cmd),
            s::Command::Delete(cmd) => self.cmd_delete(cmd),
            s::Command::Rename(cmd) => self.cmd_rename(cmd),
            s::Command::Subscribe(cmd) => self.cmd_subscribe(cmd),
            s::Command::Unsubscribe(cmd) => self.cmd_unsubscribe(cmd),
            s::Command::List(cmd) => self.cmd_list(cmd, sender),
            s::Command::Lsub(cmd) => self.cmd_lsub(cmd, sender),
            s::Command::Status(cmd) => self.cmd_status(cmd, sender),

            s::Command::Fetch(cmd) => self.cmd_fetch(cmd, false, sender),
            s::Command::Store(cmd) => self.cmd_store(cmd, false, sender),
            s::Command::Copy(cmd) => self.cmd_copy(cmd, false),
            s::Command::Search(cmd) => self.cmd_search(cmd, false, sender),

            s::Command::Uid(s::UidCommand::Fetch(cmd)) => {
                self.cmd_fetch(cmd, true, sender)
            },
            s::Command::Uid(s::UidCommand::Store(cmd)) => {
                self.cmd_store(cmd, true, sender)
            },
            s::Command::Uid(s::UidCommand::Copy(cmd)) => {
                self.cmd_copy(cmd, true)
            },
            s::Command::Uid(s::UidCommand::Search(cmd)) => {
                self.cmd_search(cmd, true, sender)
            },
        };

        let res = match res {
            Ok(res) => res,
            Err(res) => res,
        };

        s::ResponseLine {
            tag: Some(Cow::Owned(tag)),
            response: res,
        }
    }

    /// Enters IDLE: registers this connection for unsolicited
    /// notifications and prompts the client. The tagged response is
    /// deferred until DONE.
    pub fn begin_idle(&mut self, tag: String, sender: &SendResponse) {
        let (user, mailbox) = match self.mailbox {
            Some(ref store) => (
                store.user().to_owned(),
                store.selected_mailbox().map(str::to_owned),
            ),
            // Unreachable through the dispatch gate, but don't crash the
            // session over it.
            None => return,
        };

        self.registry
            .register(self.connection_id, user, mailbox, sender.clone());
        self.idle_tag = Some(tag);

        let _ = sender.send(
            crate::imap::response_writer::OutputEvent::ContinuationLine {
                prompt: "idling",
            },
        );
    }

    /// Leaves IDLE in response to DONE. The response carries the tag of
    /// the IDLE command that opened the sub-mode.
    pub fn end_idle(&mut self) -> s::ResponseLine<'static> {
        self.registry.deregister(self.connection_id);
        let tag = self.idle_tag.take().expect("end_idle without IDLE");

        s::ResponseLine {
            tag: Some(Cow::Owned(tag)),
            response: condr(s::RespCondType::Ok, None, "IDLE completed"),
        }
    }

    /// Called when the client sent something other than DONE during IDLE.
    /// The idle registration is dropped and the offence is reported under
    /// the IDLE's tag.
    pub fn abort_idle(&mut self) -> s::ResponseLine<'static> {
        self.registry.deregister(self.connection_id);
        let tag = self.idle_tag.take().expect("abort_idle without IDLE");

        s::ResponseLine {
            tag: Some(Cow::Owned(tag)),
            response: condr(s::RespCondType::Bad, None, "Expected DONE"),
        }
    }

    pub(super) fn capability_strings(&self) -> Vec<Cow<'static, str>> {
        let caps = if SessionState::NotAuthenticated == self.state {
            &self.system_config.capabilities.unauthenticated
        } else {
            &self.system_config.capabilities.authenticated
        };

        caps.iter().map(|cap| Cow::Owned(cap.clone())).collect()
    }

    fn cmd_capability(&mut self, sender: &SendResponse) -> CmdResult {
        send_response(
            sender,
            s::Response::Capability(self.capability_strings()),
        );
        success("CAPABILITY completed")
    }

    fn cmd_id(
        &mut self,
        params: Vec<Option<Cow<'_, str>>>,
        sender: &SendResponse,
    ) -> CmdResult {
        for pair in params.chunks(2) {
            if let [Some(ref name), Some(ref value)] = *pair {
                info!(
                    "{} Client identified itself: {:?} = {:?}",
                    self.log_prefix, name, value
                );
            }
        }

        send_response(
            sender,
            s::Response::Id(vec![
                (
                    Cow::Borrowed("name"),
                    Cow::Borrowed(env!("CARGO_PKG_NAME")),
                ),
                (
                    Cow::Borrowed("version"),
                    Cow::Borrowed(env!("CARGO_PKG_VERSION")),
                ),
            ]),
        );
        success("ID completed")
    }

    fn cmd_log_out(&mut self, sender: &SendResponse) -> CmdResult {
        send_response(
            sender,
            condr(
                s::RespCondType::Bye,
                None,
                "IMAP4rev1 server terminating connection",
            ),
        );
        self.state = SessionState::Logout;
        success("LOGOUT completed")
    }
}
