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

//! Optional INI configuration file. Any key present overrides the
//! corresponding command line setting.
//!
//! ```ini
//! [server]
//! port = 9006
//! root = /srv/www
//! dispatch = b
//!
//! [log]
//! mode = async
//! file = /var/log/tinyweb/server.log
//! ```

use config::{Config, ConfigError, File, FileFormat};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Default, PartialEq, Eq)]
pub struct Server {
    pub port: Option<u16>,
    pub root: Option<String>,
    pub trigger_mode: Option<u8>,
    pub linger: Option<bool>,
    pub threads: Option<usize>,
    pub pool_size: Option<usize>,
    pub dispatch: Option<String>,
    pub store: Option<String>,
    pub max_connections: Option<usize>,
    pub queue_size: Option<usize>,
    pub timeslot: Option<u32>,
}

#[derive(Debug, Deserialize, Default, PartialEq, Eq)]
pub struct Log {
    pub disable: Option<bool>,
    pub mode: Option<String>,
    pub file: Option<String>,
    pub level: Option<u8>,
    pub split_lines: Option<usize>,
    pub queue_size: Option<usize>,
}

#[derive(Debug, Deserialize, Default, PartialEq, Eq)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: Server,

    #[serde(default)]
    pub log: Log,
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::from(path).format(FileFormat::Ini))
            .build()?
            .try_deserialize()
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::from_str(content, FileFormat::Ini))
            .build()?
            .try_deserialize()
    }
}
