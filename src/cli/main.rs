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

use std::fs;
use std::path::{Path, PathBuf};

use structopt::StructOpt;

use crate::support::system_config::SystemConfig;

#[derive(StructOpt)]
#[structopt(max_term_width = 80)]
enum Command {
    /// Listen for IMAP connections.
    ///
    /// Without a configuration file, Tidemap serves an in-memory account
    /// store with a single test user; this is only useful for development
    /// and protocol testing.
    Serve(ServeSubcommand),
}

#[derive(StructOpt)]
struct ServeSubcommand {
    /// The directory containing `tidemap.toml`
    /// [default: /etc/tidemap or /usr/local/etc/tidemap]
    #[structopt(long, parse(from_os_str))]
    root: Option<PathBuf>,

    /// Listen on this address instead of the configured one.
    #[structopt(long)]
    listen: Option<String>,
}

pub fn main() {
    let cmd = Command::from_args();

    match cmd {
        Command::Serve(cmd) => serve(cmd),
    }
}

fn serve(cmd: ServeSubcommand) {
    let root = cmd.root.or_else(|| {
        if Path::new("/etc/tidemap/tidemap.toml").is_file() {
            Some("/etc/tidemap".to_owned().into())
        } else if Path::new("/usr/local/etc/tidemap/tidemap.toml").is_file() {
            Some("/usr/local/etc/tidemap".to_owned().into())
        } else {
            None
        }
    });

    let mut system_config = match root {
        Some(root) => {
            let system_config_path = root.join("tidemap.toml");
            let system_config_toml = match fs::read(&system_config_path) {
                Ok(data) => data,
                Err(e) => {
                    eprintln!(
                        "Error reading '{}': {}",
                        system_config_path.display(),
                        e
                    );
                    std::process::exit(78); // EX_CONFIG
                },
            };

            match toml::from_slice::<SystemConfig>(&system_config_toml) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!(
                        "Error in config file at '{}': {}",
                        system_config_path.display(),
                        e
                    );
                    std::process::exit(78); // EX_CONFIG
                },
            }
        },

        None => SystemConfig::default(),
    };

    if let Some(listen) = cmd.listen {
        system_config.imap.listen = listen;
    }

    if Ok(true) == nix::unistd::isatty(2) {
        // Running interactively; just write to stderr.
        crate::init_simple_log();
    } else {
        let formatter = syslog::Formatter3164 {
            facility: syslog::Facility::LOG_MAIL,
            hostname: None,
            process: env!("CARGO_PKG_NAME").to_owned(),
            pid: nix::unistd::getpid().as_raw() as u32,
        };

        let logger =
            syslog::unix(formatter).expect("Failed to connect to syslog");
        log::set_boxed_logger(Box::new(syslog::BasicLogger::new(logger)))
            .map(|_| log::set_max_level(log::LevelFilter::Info))
            .expect("Failed to initialise logging");
    }

    super::serve::serve(system_config);
}
