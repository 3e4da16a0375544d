// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Executable program to run the console-operator service

use anyhow::Context;
use camino::Utf8PathBuf;
use clap::Parser;
use console_operator::{start_server, Config};
use futures::StreamExt;
use signal_hook::consts::signal;
use signal_hook_tokio::Signals;
use slog::info;

#[derive(Debug, Parser)]
#[clap(
    name = "console-operator",
    about = "Control-plane operator for the console-access fleet"
)]
struct Args {
    /// Path to a TOML config file; built-in defaults apply when omitted
    #[clap(long)]
    config_file: Option<Utf8PathBuf>,

    /// Run in debug-only mode
    #[clap(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config_file {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("failed to load config from {path}"))?,
        None => Config::default(),
    };
    if args.debug {
        config.operator.debug_only = true;
    }

    // Set up the signal stream before starting anything that needs to be
    // cleaned up; signals are held until the stream is read.
    let mut signals = Signals::new([signal::SIGINT, signal::SIGTERM])
        .context("failed to set up signal handler")?;

    let server = start_server(config).await?;

    tokio::select! {
        received = signals.next() => {
            info!(
                server.log(), "detected signal to close service";
                "signal" => ?received,
            );
        }
        result = server.wait_for_finish() => {
            return result
                .map_err(|err| anyhow::anyhow!("server failed: {err}"));
        }
    }

    // Stop scheduling reconcile work, then drain the HTTP server. Active
    // websockets stay up until their exec streams end.
    server.begin_shutdown();
    info!(server.log(), "server shutting down");
    server
        .close()
        .await
        .map_err(|err| anyhow::anyhow!("server shutdown failed: {err}"))?;

    Ok(())
}
