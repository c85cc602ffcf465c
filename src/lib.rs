/*
 * Copyright (C) 2020-2021 Fanout, Inc.
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

pub mod accounts;
pub mod app;
pub mod buffer;
pub mod cliargs;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod fs;
pub mod http1;
pub mod list;
pub mod log;
pub mod pool;
pub mod queue;
pub mod server;
pub mod signal;
pub mod table;
pub mod timer;
pub mod worker;

use ::log::info;
use app::Config;
use std::error::Error;

pub fn run(config: &Config) -> Result<(), Box<dyn Error>> {
    info!("starting...");

    {
        let a = app::App::new(config)?;

        info!("started");

        a.run()?;

        info!("stopping...");
    }

    info!("stopped");

    Ok(())
}
