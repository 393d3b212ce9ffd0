// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{io, path::PathBuf, sync::Arc, sync::Mutex};

use anyhow::anyhow;
use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::fmt::format::FmtSpan;

mod breakpoints;
mod config;
mod console;
mod consts;
mod debugger;
mod fs;
mod hooks;
mod protocol;
mod queue;
mod reconcile;
mod signals;

pub use breakpoints::{Breakpoint, BreakpointRegistry};
pub use debugger::Debugger;
pub use fs::{FileSystem, OsFileSystem};
pub use hooks::{DebuggerState, DetachReason, Hooks};
pub use queue::{Operation, OperationQueue};
pub use reconcile::PathReconciler;

/// The command line arguments that stakeout expects.
/// These can be directly parsed with clap or manually
/// constructed in order to present some other user
/// interface.
///
/// NOTE: You must check `version()` and handle it yourself
/// if it is set. Clap won't do a good job with its
/// automatic version support for a library.
#[derive(Parser, Debug)]
#[clap(author, about)]
pub struct Args {
    #[clap(
        short,
        long,
        action,
        long_help = "The file to write logs to

By default logs go to stderr, where they interleave with the
console front-end; pass a file to keep the console clean."
    )]
    pub log_file: Option<String>,

    #[clap(
        short,
        long,
        action = clap::ArgAction::Count,
        help = "Show more in logs, may be provided multiple times",
    )]
    pub verbose: u8,

    #[clap(short, long, action, help = "a toml file containing configuration")]
    pub config_file: Option<String>,

    #[clap(subcommand)]
    pub command: Commands,
}

/// The subcommands that stakeout supports.
#[derive(Subcommand, Debug)]
pub enum Commands {
    #[clap(about = "Print version")]
    Version,

    #[clap(about = "Wait for a debugger runtime to dial in and drive it from the console")]
    Listen {
        #[clap(
            short = 'H',
            long,
            help = "Address to listen on (defaults to the config value or 127.0.0.1)"
        )]
        host: Option<String>,

        #[clap(short, long, help = "Port to listen on (defaults to the config value or 9000)")]
        port: Option<u16>,

        #[clap(help = "The directory to look for scripts in (defaults to the config value or '.')")]
        path: Option<String>,
    },
}

impl Args {
    /// Version indicates if the wrapping binary must display the
    /// version then exit.
    pub fn version(&self) -> bool {
        matches!(self.command, Commands::Version)
    }
}

/// Run the stakeout tool with the given arguments.
pub fn run(args: Args) -> anyhow::Result<()> {
    let trace_level = if args.verbose == 0 {
        tracing::Level::INFO
    } else if args.verbose == 1 {
        tracing::Level::DEBUG
    } else {
        tracing::Level::TRACE
    };
    if let Some(log_file) = args.log_file.clone() {
        let file = std::fs::File::create(log_file)?;
        tracing_subscriber::fmt()
            .with_max_level(trace_level)
            .with_thread_ids(true)
            .with_target(false)
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .with_writer(Mutex::new(file))
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(trace_level)
            .with_thread_ids(true)
            .with_target(false)
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .with_writer(io::stderr)
            .init();
    }

    let config = config::read_config(&args.config_file)?;

    let res: anyhow::Result<()> = match args.command {
        Commands::Version => return Err(anyhow!("wrapper binary must handle version")),
        Commands::Listen { host, port, path } => {
            let base_path = path
                .or(config.base_path)
                .unwrap_or_else(|| String::from("."));
            let host = host.or(config.host).unwrap_or_else(|| String::from(consts::DEFAULT_HOST));
            let port = port.or(config.port).unwrap_or(consts::DEFAULT_PORT);

            let (tx, rx) = crossbeam_channel::unbounded();
            signals::Handler::new(tx.clone()).spawn()?;
            let ui = Arc::new(console::ConsoleHooks::new(tx));
            let debugger = Debugger::new(
                PathBuf::from(base_path),
                host,
                port,
                ui,
                Arc::new(OsFileSystem),
            );
            console::run(debugger, rx)
        }
    };

    if let Err(err) = res {
        error!("{:?}", err);
        std::process::exit(1);
    }

    Ok(())
}
