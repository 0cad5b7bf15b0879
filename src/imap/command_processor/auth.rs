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

use log::{info, warn};

use super::defs::*;
use crate::imap::session::SessionState;
use crate::store::model::AuthError;

impl CommandProcessor {
    /// Called when a line initiating an `AUTHENTICATE` is received.
    ///
    /// If this returns `Some`, that response is sent to the client and the
    /// server returns to the normal command loop. If it returns `None`,
    /// the server sends a continuation line and feeds the next line to
    /// `authenticate_finish`.
    pub fn authenticate_start<'a>(
        &mut self,
        cmd: &'a s::AuthenticateCommandStart<'a>,
    ) -> Option<s::ResponseLine<'static>> {
        if SessionState::NotAuthenticated != self.state {
            return Some(s::ResponseLine {
                tag: Some(Cow::Owned(cmd.tag.clone().into_owned())),
                response: condr(s::RespCondType::Bad, None, "Bad Command"),
            });
        }

        cmd.initial_response.as_ref().map(|ir| {
            let ir = ir.clone().into_owned();
            self.authenticate_finish(
                cmd.tag.clone().into_owned(),
                cmd.auth_type.clone().into_owned(),
                ir.as_bytes(),
            )
        })
    }

    /// Completes an `AUTHENTICATE` with the client's (base64) response.
    pub fn authenticate_finish(
        &mut self,
        tag: String,
        auth_type: String,
        data: &[u8],
    ) -> s::ResponseLine<'static> {
        if b"*" == data {
            return s::ResponseLine {
                tag: Some(Cow::Owned(tag)),
                response: condr(
                    s::RespCondType::Bad,
                    None,
                    "AUTHENTICATE aborted",
                ),
            };
        }

        let response = match self.accounts.authenticate(&auth_type, data) {
            Ok(user) => match self.install_user(user) {
                Ok(()) => {
                    condr(s::RespCondType::Ok, None, "AUTHENTICATE completed")
                },
                Err(response) => response,
            },
            Err(e) => auth_error_response(e),
        };

        s::ResponseLine {
            tag: Some(Cow::Owned(tag)),
            response,
        }
    }

    pub(super) fn cmd_log_in(
        &mut self,
        cmd: s::LogInCommand<'_>,
    ) -> CmdResult {
        match self.accounts.login(&cmd.userid, &cmd.password) {
            Ok(user) => {
                self.install_user(user)?;
                success("LOGIN completed")
            },
            Err(e) => {
                // Only log when a password was actually supplied; empty
                // attempts can occur when the user mistypes into the
                // wrong prompt.
                if AuthError::BadCredentials == e && !cmd.password.is_empty()
                {
                    warn!(
                        "{} Rejected login for user '{}'",
                        self.log_prefix, cmd.userid
                    );
                }

                Err(auth_error_response(e))
            },
        }
    }

    /// Installs a fresh mailbox handle for an authenticated user and
    /// advances the session state.
    fn install_user(&mut self, user: String) -> PartialResult<()> {
        let handle = self
            .mailboxes
            .open(&user)
            .map_err(map_store_error)?;

        self.log_prefix.set_user(user);
        self.mailbox = Some(handle);
        self.state = SessionState::Authenticated;
        info!("{} Login successful", self.log_prefix);
        Ok(())
    }
}

fn auth_error_response(e: AuthError) -> s::Response<'static> {
    match e {
        AuthError::BadCredentials => condr(
            s::RespCondType::No,
            Some(s::RespTextCode::AuthenticationFailed),
            "Bad user id or password",
        ),
        AuthError::UnsupportedMechanism => condr(
            s::RespCondType::Bad,
            None,
            "Unsupported AUTHENTICATE mechanism",
        ),
        AuthError::Malformed => condr(
            s::RespCondType::Bad,
            Some(s::RespTextCode::Parse),
            "Malformed AUTHENTICATE data",
        ),
    }
}
