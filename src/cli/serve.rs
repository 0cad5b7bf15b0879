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

//! The accept loop: one OS thread per connection, each running a
//! current-thread runtime for the session's reader/writer pair.

use std::net::TcpListener;
use std::sync::Arc;

use log::{error, info, warn};
use openssl::ssl::{SslAcceptor, SslFiletype, SslMethod};

use crate::imap::command_processor::CommandProcessor;
use crate::imap::registry::{self, ConnectionRegistry};
use crate::store::memory::MemoryStore;
use crate::store::{AccountStore, MailboxFactory};
use crate::support::async_io::ServerIo;
use crate::support::log_prefix::LogPrefix;
use crate::support::system_config::{SystemConfig, TlsConfig};

pub fn serve(system_config: SystemConfig) {
    let system_config = Arc::new(system_config);

    let ssl_acceptor = if system_config.imap.starttls {
        match system_config.tls {
            Some(ref tls) => Some(Arc::new(create_ssl_acceptor(tls))),
            None => {
                error!(
                    "STARTTLS is enabled but no [tls] section is configured"
                );
                std::process::exit(78); // EX_CONFIG
            },
        }
    } else {
        None
    };

    // No persistent backend is wired up yet, so serve the in-memory store
    // with a fixed test user.
    let store = Arc::new(MemoryStore::new());
    store.add_user("user", "hunter2");

    let registry = ConnectionRegistry::new();

    let listener = match TcpListener::bind(&system_config.imap.listen) {
        Ok(listener) => listener,
        Err(e) => {
            error!(
                "Failed to bind listener on {}: {}",
                system_config.imap.listen, e
            );
            std::process::exit(74); // EX_IOERR
        },
    };

    info!("Listening on {}", system_config.imap.listen);
    info!("Log in with username 'user', password 'hunter2'");

    loop {
        let (stream, origin) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Failed to accept connection: {}", e);
                continue;
            },
        };

        let system_config = Arc::clone(&system_config);
        let accounts: Arc<dyn AccountStore + Send + Sync> = store.clone();
        let mailboxes: Arc<dyn MailboxFactory + Send + Sync> = store.clone();
        let registry = registry.clone();
        let ssl_acceptor = ssl_acceptor.clone();

        std::thread::spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_io()
                .enable_time()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    error!("{} Failed to build runtime: {}", origin, e);
                    return;
                },
            };

            runtime.block_on(async move {
                let io = match ServerIo::new_owned_socket(stream) {
                    Ok(io) => io,
                    Err(e) => {
                        warn!(
                            "{} Unable to put socket into \
                             non-blocking mode: {}",
                            origin, e
                        );
                        return;
                    },
                };

                let log_prefix =
                    LogPrefix::new(format!("imap:{}", origin));
                info!("{} Connection established", log_prefix);

                let processor = CommandProcessor::new(
                    log_prefix,
                    system_config,
                    accounts,
                    mailboxes,
                    registry,
                    registry::next_connection_id(),
                );

                crate::imap::server::run(io, processor, ssl_acceptor).await;
            });
        });
    }
}

fn create_ssl_acceptor(tls: &TlsConfig) -> SslAcceptor {
    let mut acceptor =
        match SslAcceptor::mozilla_intermediate_v5(SslMethod::tls_server()) {
            Ok(acceptor) => acceptor,
            Err(e) => {
                error!("Failed to initialise OpenSSL acceptor: {}", e);
                std::process::exit(70); // EX_SOFTWARE
            },
        };

    if let Err(e) =
        acceptor.set_private_key_file(&tls.private_key, SslFiletype::PEM)
    {
        error!(
            "Unable to load TLS private key from '{}': {}",
            tls.private_key.display(),
            e
        );
        std::process::exit(78); // EX_CONFIG
    }

    if let Err(e) =
        acceptor.set_certificate_chain_file(&tls.certificate_chain)
    {
        error!(
            "Unable to load TLS certificate chain from '{}': {}",
            tls.certificate_chain.display(),
            e
        );
        std::process::exit(78); // EX_CONFIG
    }

    if let Err(e) = acceptor.check_private_key() {
        error!("TLS key seems to be invalid: {}", e);
        std::process::exit(78); // EX_CONFIG
    }

    acceptor.build()
}
