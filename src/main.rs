// SPDX-FileCopyrightText: 2025 notesync contributors
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use anyhow::{Context, Result};
use clap::Parser;
use notesync::{
    cli::{Cli, Commands},
    client,
    config::Config,
    logging, server,
};

#[tokio::main]
async fn main() -> Result<()> {
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_panic(info);
        std::process::exit(1);
    }));

    let cli = Cli::parse();

    logging::initialize(cli.debug).context("Failed to initialize logging")?;

    match cli.command {
        Commands::Serve { bind } => {
            server::serve(Config::with_bind(bind)).await?;
        }
        Commands::Watch { url, note_id } => {
            client::watch(&url, &note_id)
                .await
                .context("Watch command failed")?;
        }
    }
    Ok(())
}
