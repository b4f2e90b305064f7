// SPDX-FileCopyrightText: 2025 notesync contributors
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
    /// Enable verbose logging.
    #[arg(long, global = true)]
    pub debug: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the collaboration server.
    Serve {
        /// Address to listen on, e.g. 127.0.0.1:3000.
        #[arg(long, env = "NOTESYNC_BIND")]
        bind: Option<String>,
    },
    /// Follow a note on a running server and print it as it converges.
    Watch {
        /// Server base URL, e.g. http://127.0.0.1:3000.
        url: String,
        /// Note id to follow.
        note_id: String,
    },
}

#[test]
fn verify() {
    use clap::CommandFactory as _;
    Cli::command().debug_assert();
}
