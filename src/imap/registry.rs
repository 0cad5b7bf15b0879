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

//! The process-wide table of connections currently sitting in IDLE.
//!
//! An entry exists only between IDLE and the matching DONE (or connection
//! teardown). When another session of the same user mutates a mailbox, the
//! entries' output channels receive unsolicited EXISTS/RECENT responses.
//!
//! The lock is only ever held to snapshot or mutate the table; writes to
//! the network happen in each idler's own writer actor after the lock is
//! released.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::UnboundedSender;

use super::response_writer::{OutputControl, OutputEvent};
use super::syntax as s;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Allocates a connection id, unique for the process lifetime.
pub fn next_connection_id() -> u64 {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

struct IdleEntry {
    user: String,
    /// The mailbox the idler had selected, if any. An idler without a
    /// selected mailbox has nothing to be notified about.
    mailbox: Option<String>,
    sender: UnboundedSender<OutputEvent>,
}

#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<Mutex<HashMap<u64, IdleEntry>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        connection_id: u64,
        user: String,
        mailbox: Option<String>,
        sender: UnboundedSender<OutputEvent>,
    ) {
        self.inner.lock().unwrap().insert(
            connection_id,
            IdleEntry {
                user,
                mailbox,
                sender,
            },
        );
    }

    pub fn deregister(&self, connection_id: u64) {
        self.inner.lock().unwrap().remove(&connection_id);
    }

    #[cfg(test)]
    pub fn contains(&self, connection_id: u64) -> bool {
        self.inner.lock().unwrap().contains_key(&connection_id)
    }

    /// Pushes `EXISTS`/`RECENT` to every idling session of `user` other
    /// than the acting connection.
    ///
    /// `header_for` resolves the current (exists, recent) counters of a
    /// mailbox; it is called after the registry lock has been released.
    /// Failures are swallowed: a dead idler must not affect the response
    /// of the session that performed the mutation.
    pub fn notify(
        &self,
        acting_id: u64,
        user: &str,
        mut header_for: impl FnMut(&str) -> Option<(u32, u32)>,
    ) {
        let targets: Vec<(Option<String>, UnboundedSender<OutputEvent>)> = {
            let inner = self.inner.lock().unwrap();
            inner
                .iter()
                .filter(|&(&id, entry)| {
                    id != acting_id && entry.user == user
                })
                .map(|(_, entry)| {
                    (entry.mailbox.clone(), entry.sender.clone())
                })
                .collect()
        };

        for (mailbox, sender) in targets {
            let Some(mailbox) = mailbox else { continue };
            let Some((exists, recent)) = header_for(&mailbox) else {
                continue;
            };

            let _ = sender.send(OutputEvent::ResponseLine {
                line: s::ResponseLine {
                    tag: None,
                    response: s::Response::Exists(exists),
                },
                ctl: OutputControl::Buffer,
            });
            let _ = sender.send(OutputEvent::ResponseLine {
                line: s::ResponseLine {
                    tag: None,
                    response: s::Response::Recent(recent),
                },
                ctl: OutputControl::Flush,
            });
        }
    }
}
