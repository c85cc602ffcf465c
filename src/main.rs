/*
 * Copyright (C) 2020-2022 Fanout, Inc.
 * Copyright (C) 2024 Fastly, Inc.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use clap::Parser;
use log::error;
use std::error::Error;
use std::process;
use tinyweb::app::Config;
use tinyweb::cliargs::CliArgs;
use tinyweb::log::{ensure_init_simple_logger, shutdown};

fn process_args_and_run(args: CliArgs) -> Result<(), Box<dyn Error>> {
    let config = Config::from_args(&args)?;

    ensure_init_simple_logger(&config.log)?;

    tinyweb::run(&config)
}

fn main() {
    let args = CliArgs::parse();

    if let Err(e) = process_args_and_run(args) {
        error!("{}", e);
        shutdown();

        eprintln!("Error: {}", e);
        process::exit(1);
    }

    shutdown();
}
