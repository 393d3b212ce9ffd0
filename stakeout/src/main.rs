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
/// Stakeout is a client-side DBGP debugger: point your runtime's
/// debug extension (Xdebug or similar) at it and drive the paused
/// program from your terminal.
use clap::Parser;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    let args = libstakeout::Args::parse();

    if args.version() {
        println!("stakeout {}", VERSION);
        return Ok(());
    }

    libstakeout::run(args)
}
