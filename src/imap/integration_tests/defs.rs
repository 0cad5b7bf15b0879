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

use std::io;
use std::sync::Arc;

use regex::bytes::Regex;

use crate::imap::client::Client;
use crate::imap::command_processor::CommandProcessor;
use crate::imap::registry::{self, ConnectionRegistry};
use crate::store::memory::MemoryStore;
use crate::store::{AccountStore, MailboxFactory};
use crate::support::async_io::ServerIo;
use crate::support::log_prefix::LogPrefix;
use crate::support::system_config::SystemConfig;

pub(super) type PipeClient =
    Client<io::BufReader<os_pipe::PipeReader>, os_pipe::PipeWriter>;

/// A server environment shared by every connection a test opens: one
/// in-memory store, one idle registry, one configuration.
pub(super) struct Setup {
    pub(super) store: Arc<MemoryStore>,
    registry: ConnectionRegistry,
    config: Arc<SystemConfig>,
}

pub(super) fn set_up() -> Setup {
    crate::init_test_log();

    let store = Arc::new(MemoryStore::new());
    store.add_user("azure", "hunter2");

    Setup {
        store,
        registry: ConnectionRegistry::new(),
        config: Arc::new(SystemConfig::default()),
    }
}

impl Setup {
    /// Opens a connection to the shared environment. The server side runs
    /// on its own thread with a current-thread runtime, exactly like the
    /// real accept loop.
    pub(super) fn connect(&self, name: &'static str) -> PipeClient {
        let (server_in, client_out) = os_pipe::pipe().unwrap();
        let (client_in, server_out) = os_pipe::pipe().unwrap();

        let store = Arc::clone(&self.store);
        let registry = self.registry.clone();
        let config = Arc::clone(&self.config);

        std::thread::spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_io()
                .enable_time()
                .build()
                .unwrap();

            runtime.block_on(async move {
                let io = ServerIo::new_owned_pair(server_in, server_out)
                    .unwrap();
                let accounts: Arc<dyn AccountStore + Send + Sync> =
                    store.clone();
                let mailboxes: Arc<dyn MailboxFactory + Send + Sync> = store;
                let processor = CommandProcessor::new(
                    LogPrefix::new(name.to_owned()),
                    config,
                    accounts,
                    mailboxes,
                    registry,
                    registry::next_connection_id(),
                );

                crate::imap::server::run(io, processor, None).await;
            });
        });

        Client::new(
            io::BufReader::new(client_in),
            client_out,
            Some(name),
        )
    }
}

/// Reads one logical line and asserts it matches the pattern.
pub(super) fn receive_line_like(client: &mut PipeClient, pat: &str) {
    let mut buf = Vec::new();
    client.read_logical_line(&mut buf).unwrap();
    assert!(
        Regex::new(pat).unwrap().is_match(&buf),
        "Expected\n\
         match: {:?}\n\
         Got:   {:?}\n",
        pat,
        String::from_utf8_lossy(&buf)
    );
}

/// Reads logical lines up to and including the one starting with `tag `,
/// returning all of them.
pub(super) fn read_until_tagged(
    client: &mut PipeClient,
    tag: &str,
) -> Vec<Vec<u8>> {
    let prefix = format!("{} ", tag).into_bytes();
    let mut lines = Vec::new();

    loop {
        let mut buf = Vec::new();
        client.read_logical_line(&mut buf).unwrap();
        let done = buf.starts_with(&prefix);
        lines.push(buf);
        if done {
            return lines;
        }
    }
}

pub(super) fn skip_greeting(client: &mut PipeClient) {
    receive_line_like(client, r"^\* OK \[CAPABILITY ");
}

pub(super) fn quick_log_in(client: &mut PipeClient) {
    skip_greeting(client);
    client.write_line("L1 LOGIN azure hunter2").unwrap();
    receive_line_like(client, r"^L1 OK LOGIN completed");
}

pub(super) fn quick_select(client: &mut PipeClient, mailbox: &str) {
    client
        .write_line(&format!("S1 SELECT {}", mailbox))
        .unwrap();
    let lines = read_until_tagged(client, "S1");
    assert!(
        lines.last().unwrap().starts_with(b"S1 OK"),
        "SELECT failed: {:?}",
        String::from_utf8_lossy(lines.last().unwrap())
    );
}

/// Runs a synchronizing-literal APPEND of `body` into `mailbox`.
pub(super) fn quick_append(
    client: &mut PipeClient,
    tag: &str,
    mailbox: &str,
    body: &[u8],
) {
    client
        .write_line(&format!(
            "{} APPEND {} {{{}}}",
            tag,
            mailbox,
            body.len()
        ))
        .unwrap();
    receive_line_like(client, r"^\+");
    client.write_raw(body).unwrap();
    client.write_raw(b"\r\n").unwrap();
    receive_line_like(client, &format!("^{} OK APPEND completed", tag));
}
