/*
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

use crate::dispatch::DispatchMode;
use crate::log::LogMode;
use clap::Parser;
use std::path::PathBuf;

// Struct to hold the command line arguments
#[derive(Parser, Debug)]
#[command(
    name = "tinyweb",
    version,
    about = "Small multi-threaded HTTP/1.1 server."
)]
pub struct CliArgs {
    /// Set the listen port
    #[arg(short, long, value_name = "port", default_value_t = 9006)]
    pub port: u16,

    /// Set the document root
    #[arg(short, long, value_name = "dir", default_value = "./root")]
    pub root: PathBuf,

    /// Set trigger modes (0=listen LT conn LT, 1=LT/ET, 2=ET/LT, 3=ET/ET)
    #[arg(short = 'm', long, value_name = "x", default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=3))]
    pub trigger_mode: u8,

    /// Linger on close
    #[arg(short = 'o', long)]
    pub linger: bool,

    /// Set the number of worker threads
    #[arg(short, long, value_name = "n", default_value_t = 8)]
    pub threads: usize,

    /// Set the number of user store handles
    #[arg(short = 's', long, value_name = "n", default_value_t = 8)]
    pub pool_size: usize,

    /// Set the dispatch mode (a=I/O in the poll thread, b=I/O in workers)
    #[arg(short = 'a', long, value_name = "mode", default_value = "a")]
    pub dispatch: DispatchMode,

    /// Disable logging
    #[arg(short = 'c', long)]
    pub disable_log: bool,

    /// Set the log write mode (sync, async)
    #[arg(short = 'l', long, value_name = "mode", default_value = "sync")]
    pub log_mode: LogMode,

    /// Set path to the log file
    #[arg(long, value_name = "file")]
    pub log_file: Option<PathBuf>,

    /// Set log level (0=error, 1=warn, 2=info, 3=debug, 4=trace)
    #[arg(long, value_name = "x", default_value_t = 2, value_parser = clap::value_parser!(u8).range(0..=4))]
    pub log_level: u8,

    /// Set the user store (file:<path> or memory)
    #[arg(long, value_name = "spec", default_value = "file:./users.db")]
    pub store: String,

    /// Set the maximum number of concurrent connections
    #[arg(long, value_name = "n", default_value_t = 65536)]
    pub max_connections: usize,

    /// Set the task queue capacity
    #[arg(long, value_name = "n", default_value_t = 10000)]
    pub queue_size: usize,

    /// Set the idle sweep interval in seconds
    #[arg(long, value_name = "secs", default_value_t = 5)]
    pub timeslot: u32,

    /// Set path to the configuration file
    #[arg(long = "config", value_name = "file")]
    pub config_file: Option<PathBuf>,
}
