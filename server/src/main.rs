// Copyright 2022 Ryan Seipp
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

use rask::config::{Config, ParseOutcome, USAGE};
use rask::supervisor::Supervisor;

fn main() {
    let outcome = match Config::from_args(std::env::args().skip(1)) {
        Ok(outcome) => outcome,
        Err(e) => {
            eprintln!("raskd: {e}");
            eprint!("{USAGE}");
            std::process::exit(1);
        }
    };

    let config = match outcome {
        ParseOutcome::Run(config) => config,
        ParseOutcome::Help => {
            print!("{USAGE}");
            std::process::exit(0);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let supervisor = match Supervisor::bootstrap(&config) {
        Ok(supervisor) => supervisor,
        Err(e) => {
            tracing::error!(error = %e, "startup failed");
            std::process::exit(e.exit_code());
        }
    };

    supervisor.run();
}
