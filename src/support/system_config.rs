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

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// The system-wide configuration for Tidemap.
///
/// This is stored in a file named `tidemap.toml` under the Tidemap system
/// root, which is typically `/usr/local/etc/tidemap` or `/etc/tidemap`.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SystemConfig {
    /// Options for the IMAP protocol layer.
    #[serde(default)]
    pub imap: ImapConfig,

    /// Capability strings reported to clients. These are emitted verbatim.
    #[serde(default)]
    pub capabilities: CapabilitiesConfig,

    /// Configuration for TLS. If absent, STARTTLS is rejected regardless of
    /// `imap.starttls`.
    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ImapConfig {
    /// The address the `serve` subcommand listens on.
    #[serde(default = "defaults::listen")]
    pub listen: String,

    /// The maximum size, in bytes, of a message accepted by APPEND.
    #[serde(default = "defaults::max_msg_size")]
    pub max_msg_size: u32,

    /// Whether STARTTLS is offered. Requires `[tls]` to be configured.
    #[serde(default)]
    pub starttls: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CapabilitiesConfig {
    /// Capabilities reported before authentication.
    #[serde(default = "defaults::unauthenticated_capabilities")]
    pub unauthenticated: Vec<String>,

    /// Capabilities reported once a user has authenticated.
    #[serde(default = "defaults::authenticated_capabilities")]
    pub authenticated: Vec<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TlsConfig {
    /// The path to the TLS private key, which must be in PEM format.
    pub private_key: PathBuf,
    /// The path to the TLS certificate chain, which must be in PEM format.
    pub certificate_chain: PathBuf,
}

impl Default for ImapConfig {
    fn default() -> Self {
        ImapConfig {
            listen: defaults::listen(),
            max_msg_size: defaults::max_msg_size(),
            starttls: false,
        }
    }
}

impl Default for CapabilitiesConfig {
    fn default() -> Self {
        CapabilitiesConfig {
            unauthenticated: defaults::unauthenticated_capabilities(),
            authenticated: defaults::authenticated_capabilities(),
        }
    }
}

impl Default for SystemConfig {
    fn default() -> Self {
        SystemConfig {
            imap: ImapConfig::default(),
            capabilities: CapabilitiesConfig::default(),
            tls: None,
        }
    }
}

mod defaults {
    pub(super) fn listen() -> String {
        "127.0.0.1:14143".to_owned()
    }

    pub(super) fn max_msg_size() -> u32 {
        64 * 1024 * 1024
    }

    pub(super) fn unauthenticated_capabilities() -> Vec<String> {
        ["IMAP4rev1", "AUTH=PLAIN", "LITERAL+", "IDLE", "ID"]
            .iter()
            .map(|&s| s.to_owned())
            .collect()
    }

    pub(super) fn authenticated_capabilities() -> Vec<String> {
        ["IMAP4rev1", "LITERAL+", "IDLE", "ID"]
            .iter()
            .map(|&s| s.to_owned())
            .collect()
    }
}
