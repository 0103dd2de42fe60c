// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! `shoalrsemd`: the shoalfs remote-semaphore server daemon.

use anyhow::Context;
use clap::Parser;
use shoalfs_core::daemon;
use shoalfs_core::glitch;
use shoalfs_core::log_config::DaemonKind;
use shoalfs_rsem::fastlog::RSEM_DUMPERS;
use shoalfs_rsem::{RsemServer, RsemServerConfig};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(
    name = "shoalrsemd",
    about = "The shoalfs remote semaphore server",
    disable_version_flag = true
)]
struct Args {
    /// The semaphore configuration file.
    #[arg(short = 'c', value_name = "FILE")]
    config: PathBuf,

    /// Run in the foreground (do not daemonize).
    #[arg(short = 'f')]
    foreground: bool,
}

fn run(args: &Args) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(&args.config).with_context(|| {
        format!("error reading config file '{}'", args.config.display())
    })?;
    let mut conf: RsemServerConfig = serde_json::from_str(&text).with_context(|| {
        format!("error parsing config file '{}'", args.config.display())
    })?;

    daemon::init(DaemonKind::Rsemd, args.foreground, &mut conf.lc, &RSEM_DUMPERS)?;

    let server = RsemServer::start(&conf).context("start_rsem_server failed")?;
    glitch!(
        "shoalrsemd: serving {} semaphores on port {}",
        conf.sems.len(),
        server.port()
    );

    // The server runs on its own thread; this one just has to stay alive.
    // Fatal signals (including SIGINT) go through the crash-log handler.
    loop {
        std::thread::sleep(Duration::from_secs(100));
    }
}

fn main() {
    let args = Args::parse();
    if let Err(e) = run(&args) {
        glitch!("shoalrsemd: {e:#}");
        daemon::shutdown();
        std::process::exit(1);
    }
}
