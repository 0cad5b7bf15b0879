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

//! The per-connection protocol state machine.
//!
//! `NotAuthenticated → Authenticated ↔ Selected → Logout`, where the only
//! back edge is CLOSE. `Logout` is terminal. IDLE is a sub-mode tracked
//! separately by the command processor, since the session returns to its
//! previous state when DONE arrives.

use super::syntax as s;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    NotAuthenticated,
    Authenticated,
    Selected,
    Logout,
}

/// Which states accept a command; see the dispatch table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandGroup {
    AnyState,
    NotAuthenticated,
    Authenticated,
    Selected,
}

impl SessionState {
    pub fn accepts(self, group: CommandGroup) -> bool {
        match group {
            CommandGroup::AnyState => true,
            CommandGroup::NotAuthenticated => {
                SessionState::NotAuthenticated == self
            },
            CommandGroup::Authenticated => matches!(
                self,
                SessionState::Authenticated | SessionState::Selected
            ),
            CommandGroup::Selected => SessionState::Selected == self,
        }
    }
}

pub fn group_of(cmd: &s::Command<'_>) -> CommandGroup {
    match *cmd {
        s::Command::Simple(simple) => match simple {
            s::SimpleCommand::Capability
            | s::SimpleCommand::Noop
            | s::SimpleCommand::LogOut => CommandGroup::AnyState,
            s::SimpleCommand::StartTls => CommandGroup::NotAuthenticated,
            s::SimpleCommand::Idle => CommandGroup::Authenticated,
            s::SimpleCommand::Check
            | s::SimpleCommand::Close
            | s::SimpleCommand::Expunge => CommandGroup::Selected,
        },

        s::Command::Id(..) => CommandGroup::AnyState,

        s::Command::LogIn(..) => CommandGroup::NotAuthenticated,

        s::Command::Select(..)
        | s::Command::Examine(..)
        | s::Command::Create(..)
        | s::Command::Delete(..)
        | s::Command::Rename(..)
        | s::Command::Subscribe(..)
        | s::Command::Unsubscribe(..)
        | s::Command::List(..)
        | s::Command::Lsub(..)
        | s::Command::Status(..) => CommandGroup::Authenticated,

        s::Command::Fetch(..)
        | s::Command::Store(..)
        | s::Command::Copy(..)
        | s::Command::Search(..)
        | s::Command::Uid(..) => CommandGroup::Selected,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn state_gating() {
        assert!(SessionState::NotAuthenticated
            .accepts(CommandGroup::AnyState));
        assert!(SessionState::NotAuthenticated
            .accepts(CommandGroup::NotAuthenticated));
        assert!(!SessionState::NotAuthenticated
            .accepts(CommandGroup::Authenticated));
        assert!(!SessionState::NotAuthenticated
            .accepts(CommandGroup::Selected));

        assert!(SessionState::Authenticated
            .accepts(CommandGroup::Authenticated));
        assert!(!SessionState::Authenticated
            .accepts(CommandGroup::NotAuthenticated));
        assert!(!SessionState::Authenticated.accepts(CommandGroup::Selected));

        assert!(SessionState::Selected.accepts(CommandGroup::Authenticated));
        assert!(SessionState::Selected.accepts(CommandGroup::Selected));
        assert!(
            !SessionState::Selected.accepts(CommandGroup::NotAuthenticated)
        );
    }

    #[test]
    fn command_grouping() {
        fn group(text: &str) -> CommandGroup {
            let (rest, line) =
                s::CommandLine::parse(text.as_bytes()).unwrap();
            assert!(rest.is_empty());
            group_of(&line.cmd)
        }

        assert_eq!(CommandGroup::AnyState, group("a CAPABILITY"));
        assert_eq!(CommandGroup::AnyState, group("a NOOP"));
        assert_eq!(CommandGroup::AnyState, group("a LOGOUT"));
        assert_eq!(CommandGroup::AnyState, group("a ID NIL"));

        assert_eq!(CommandGroup::NotAuthenticated, group("a LOGIN u p"));
        assert_eq!(CommandGroup::NotAuthenticated, group("a STARTTLS"));

        assert_eq!(CommandGroup::Authenticated, group("a SELECT INBOX"));
        assert_eq!(CommandGroup::Authenticated, group("a IDLE"));
        assert_eq!(
            CommandGroup::Authenticated,
            group("a STATUS INBOX (MESSAGES)")
        );

        assert_eq!(CommandGroup::Selected, group("a CHECK"));
        assert_eq!(CommandGroup::Selected, group("a EXPUNGE"));
        assert_eq!(CommandGroup::Selected, group("a FETCH 1 FLAGS"));
        assert_eq!(CommandGroup::Selected, group("a UID SEARCH ALL"));
    }
}
