/*
 * Copyright (C) 2020-2023 Fanout, Inc.
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

use crate::accounts::{Accounts, StoreError, StoreSpec};
use crate::cliargs::CliArgs;
use crate::config::ConfigFile;
use crate::connection::{Services, TriggerMode};
use crate::dispatch::DispatchMode;
use crate::log::{level_filter, LogConfig, LogMode};
use crate::server::{self, Dispatcher, DispatcherConfig, ServerError};
use log::info;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

// safety values
const THREADS_MAX: usize = 1024;
const CONNS_MAX: usize = 10_000_000;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config file: {0}")]
    Config(#[from] config::ConfigError),

    #[error("{0}")]
    Invalid(String),

    #[error("user store: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Server(#[from] ServerError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Listener and connection trigger modes for the combined `-m` value.
pub fn trigger_modes(value: u8) -> (TriggerMode, TriggerMode) {
    match value {
        0 => (TriggerMode::Level, TriggerMode::Level),
        1 => (TriggerMode::Level, TriggerMode::Edge),
        2 => (TriggerMode::Edge, TriggerMode::Level),
        _ => (TriggerMode::Edge, TriggerMode::Edge),
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub root: PathBuf,
    pub listen_mode: TriggerMode,
    pub conn_mode: TriggerMode,
    pub linger: bool,
    pub threads: usize,
    pub pool_size: usize,
    pub dispatch: DispatchMode,
    pub store: StoreSpec,
    pub max_connections: usize,
    pub queue_size: usize,
    pub timeslot: Duration,
    pub log: LogConfig,
}

impl Config {
    /// Builds the runtime configuration from the command line, with values
    /// from the configuration file (if any) taking precedence.
    pub fn from_args(args: &CliArgs) -> Result<Self, Error> {
        let file = match &args.config_file {
            Some(path) => ConfigFile::load(path)?,
            None => ConfigFile::default(),
        };

        Self::merge(args, file)
    }

    fn merge(args: &CliArgs, file: ConfigFile) -> Result<Self, Error> {
        let server = file.server;
        let log = file.log;

        let trigger_mode = server.trigger_mode.unwrap_or(args.trigger_mode);
        if trigger_mode > 3 {
            return Err(Error::Invalid(format!(
                "trigger mode must be 0-3, got {}",
                trigger_mode
            )));
        }

        let (listen_mode, conn_mode) = trigger_modes(trigger_mode);

        let dispatch = match server.dispatch {
            Some(s) => s.parse().map_err(Error::Invalid)?,
            None => args.dispatch,
        };

        let store: StoreSpec = server.store.as_deref().unwrap_or(&args.store).parse()?;

        let log_mode: LogMode = match log.mode {
            Some(s) => s.parse().map_err(Error::Invalid)?,
            None => args.log_mode,
        };

        let disable_log = log.disable.unwrap_or(args.disable_log);

        let level = if disable_log {
            ::log::LevelFilter::Off
        } else {
            level_filter(log.level.unwrap_or(args.log_level))
        };

        let defaults = LogConfig::default();

        let config = Self {
            port: server.port.unwrap_or(args.port),
            root: server.root.map(PathBuf::from).unwrap_or(args.root.clone()),
            listen_mode,
            conn_mode,
            linger: server.linger.unwrap_or(args.linger),
            threads: server.threads.unwrap_or(args.threads),
            pool_size: server.pool_size.unwrap_or(args.pool_size),
            dispatch,
            store,
            max_connections: server.max_connections.unwrap_or(args.max_connections),
            queue_size: server.queue_size.unwrap_or(args.queue_size),
            timeslot: Duration::from_secs(server.timeslot.unwrap_or(args.timeslot).into()),
            log: LogConfig {
                level,
                file: log.file.map(PathBuf::from).or(args.log_file.clone()),
                split_lines: log.split_lines.unwrap_or(defaults.split_lines),
                mode: log_mode,
                queue_size: log.queue_size.unwrap_or(defaults.queue_size),
            },
        };

        config.validate()?;

        Ok(config)
    }

    fn validate(&self) -> Result<(), Error> {
        if self.threads == 0 || self.threads > THREADS_MAX {
            return Err(Error::Invalid(format!(
                "threads must be between 1 and {}",
                THREADS_MAX
            )));
        }

        if self.pool_size == 0 {
            return Err(Error::Invalid("pool size must be > 0".into()));
        }

        if self.max_connections == 0 || self.max_connections > CONNS_MAX {
            return Err(Error::Invalid(format!(
                "max connections must be between 1 and {}",
                CONNS_MAX
            )));
        }

        if self.queue_size == 0 {
            return Err(Error::Invalid("queue size must be > 0".into()));
        }

        if self.timeslot.is_zero() {
            return Err(Error::Invalid("timeslot must be > 0".into()));
        }

        if self.log.split_lines == 0 || self.log.queue_size == 0 {
            return Err(Error::Invalid(
                "log split lines and queue size must be > 0".into(),
            ));
        }

        Ok(())
    }

    fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            listen_mode: self.listen_mode,
            conn_mode: self.conn_mode,
            timeslot: self.timeslot,
            max_connections: self.max_connections,
            threads: self.threads,
            queue_size: self.queue_size,
            dispatch: self.dispatch,
        }
    }
}

pub struct App {
    dispatcher: Dispatcher,
}

impl App {
    pub fn new(config: &Config) -> Result<Self, Error> {
        let pool = config.store.open_pool(config.pool_size)?;

        let accounts = Accounts::new(pool);
        let users = accounts.warm()?;

        info!("loaded {} users", users);

        let services = Arc::new(Services {
            root: config.root.clone(),
            accounts,
        });

        let addr = SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), config.port);
        let listener = server::bind(addr, config.linger)?;

        let mut dispatcher = Dispatcher::new(listener, &config.dispatcher_config(), services)?;

        dispatcher.install_signals()?;

        info!(
            "listening on {} dispatch={} threads={}",
            dispatcher.local_addr()?,
            config.dispatch,
            config.threads
        );

        Ok(Self { dispatcher })
    }

    /// Runs until a termination signal arrives.
    pub fn run(mut self) -> Result<(), Error> {
        self.dispatcher.run()?;

        Ok(())
    }
}
