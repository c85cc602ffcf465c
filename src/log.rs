/*
 * Copyright (C) 2020-2023 Fanout, Inc.
 * Copyright (C) 2023 Fastly, Inc.
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

use log::{Level, LevelFilter, Log, Metadata, Record};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::{self, FromStr};
use std::sync::{mpsc, Mutex, OnceLock};
use std::thread;
use time::macros::format_description;
use time::{Date, OffsetDateTime, UtcOffset};

pub const SPLIT_LINES_DEFAULT: usize = 800_000;
pub const QUEUE_SIZE_DEFAULT: usize = 800;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogMode {
    Sync,

    /// Lines are queued to a writer thread.
    Async,
}

impl FromStr for LogMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sync" | "0" => Ok(Self::Sync),
            "async" | "1" => Ok(Self::Async),
            _ => Err(format!("unknown log mode: {}", s)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: LevelFilter,
    pub file: Option<PathBuf>,
    pub split_lines: usize,
    pub mode: LogMode,
    pub queue_size: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LevelFilter::Info,
            file: None,
            split_lines: SPLIT_LINES_DEFAULT,
            mode: LogMode::Sync,
            queue_size: QUEUE_SIZE_DEFAULT,
        }
    }
}

/// Maps the numeric level used on the command line.
pub fn level_filter(level: u8) -> LevelFilter {
    match level {
        0 => LevelFilter::Error,
        1 => LevelFilter::Warn,
        2 => LevelFilter::Info,
        3 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

fn open_append(path: &Path) -> Result<File, io::Error> {
    OpenOptions::new().create(true).append(true).open(path)
}

fn file_path(dir: &Path, name: &str, date: Date, index: usize) -> PathBuf {
    let stem = format!(
        "{:04}_{:02}_{:02}_{}",
        date.year(),
        u8::from(date.month()),
        date.day(),
        name
    );

    if index == 0 {
        dir.join(stem)
    } else {
        dir.join(format!("{}.{}", stem, index))
    }
}

/// Log file named after the day it was written. A new file is started at
/// each new day, and a numbered continuation every `split_lines` lines.
pub struct RotatingFile {
    dir: PathBuf,
    name: String,
    split_lines: usize,
    date: Date,
    lines: usize,
    file: File,
}

impl RotatingFile {
    pub fn open(base: &Path, split_lines: usize, today: Date) -> Result<Self, io::Error> {
        let dir = match base.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let name = match base.file_name() {
            Some(name) => name.to_string_lossy().into_owned(),
            None => return Err(io::Error::from(io::ErrorKind::InvalidInput)),
        };

        let file = open_append(&file_path(&dir, &name, today, 0))?;

        Ok(Self {
            dir,
            name,
            split_lines,
            date: today,
            lines: 0,
            file,
        })
    }

    pub fn current_path(&self) -> PathBuf {
        let index = if self.split_lines > 0 {
            self.lines.saturating_sub(1) / self.split_lines
        } else {
            0
        };

        file_path(&self.dir, &self.name, self.date, index)
    }

    pub fn write_line(&mut self, today: Date, line: &str) -> Result<(), io::Error> {
        if today != self.date {
            self.file = open_append(&file_path(&self.dir, &self.name, today, 0))?;
            self.date = today;
            self.lines = 0;
        } else if self.split_lines > 0 && self.lines > 0 && self.lines % self.split_lines == 0 {
            let index = self.lines / self.split_lines;

            self.file = open_append(&file_path(&self.dir, &self.name, today, index))?;
        }

        self.file.write_all(line.as_bytes())?;
        self.file.write_all(b"\n")?;
        self.lines += 1;

        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), io::Error> {
        self.file.flush()
    }
}

enum Sink {
    Stdout,
    File(RotatingFile),
}

impl Sink {
    fn write_line(&mut self, today: Date, line: &str) {
        let ret = match self {
            Self::Stdout => writeln!(io::stdout().lock(), "{}", line),
            Self::File(f) => f.write_line(today, line),
        };

        if let Err(e) = ret {
            eprintln!("failed to write log output: {}", e);
        }
    }

    fn flush(&mut self) {
        let ret = match self {
            Self::Stdout => io::stdout().flush(),
            Self::File(f) => f.flush(),
        };

        if let Err(e) = ret {
            eprintln!("failed to flush log output: {}", e);
        }
    }
}

enum Output {
    Direct(Mutex<Sink>),
    Queue {
        sender: Mutex<Option<mpsc::SyncSender<(Date, String)>>>,
        writer: Mutex<Option<thread::JoinHandle<()>>>,
    },
}

pub struct SimpleLogger {
    local_offset: Option<UtcOffset>,
    level: LevelFilter,
    output: Output,
}

impl SimpleLogger {
    pub fn new(config: &LogConfig, local_offset: Option<UtcOffset>) -> Result<Self, io::Error> {
        let today = OffsetDateTime::now_utc()
            .to_offset(local_offset.unwrap_or(UtcOffset::UTC))
            .date();

        let sink = match &config.file {
            Some(base) => Sink::File(RotatingFile::open(base, config.split_lines, today)?),
            None => Sink::Stdout,
        };

        let output = match config.mode {
            LogMode::Sync => Output::Direct(Mutex::new(sink)),
            LogMode::Async => {
                let (s, r) = mpsc::sync_channel::<(Date, String)>(config.queue_size.max(1));
                let mut sink = sink;

                let writer = thread::Builder::new()
                    .name("log-writer".to_string())
                    .spawn(move || {
                        for (date, line) in r {
                            sink.write_line(date, &line);
                        }

                        sink.flush();
                    })?;

                Output::Queue {
                    sender: Mutex::new(Some(s)),
                    writer: Mutex::new(Some(writer)),
                }
            }
        };

        Ok(Self {
            local_offset,
            level: config.level,
            output,
        })
    }

    /// Stops queueing and waits for the writer thread to drain. Later
    /// records are dropped.
    pub fn shutdown(&self) {
        if let Output::Queue { sender, writer } = &self.output {
            sender.lock().unwrap().take();

            if let Some(writer) = writer.lock().unwrap().take() {
                let _ = writer.join();
            }
        }
    }
}

impl Log for SimpleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let now = OffsetDateTime::now_utc().to_offset(self.local_offset.unwrap_or(UtcOffset::UTC));

        let format = format_description!(
            "[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:3]"
        );

        let mut ts = [0u8; 64];

        let size = {
            let mut ts = io::Cursor::new(&mut ts[..]);

            if now.format_into(&mut ts, &format).is_err() {
                return;
            }

            ts.position() as usize
        };

        let ts = str::from_utf8(&ts[..size]).unwrap_or_default();

        let lname = match record.level() {
            log::Level::Error => "ERR",
            log::Level::Warn => "WARN",
            log::Level::Info => "INFO",
            log::Level::Debug => "DEBUG",
            log::Level::Trace => "TRACE",
        };

        let line = if record.level() <= Level::Info {
            format!("[{}] {} {}", lname, ts, record.args())
        } else {
            format!("[{}] {} [{}] {}", lname, ts, record.target(), record.args())
        };

        match &self.output {
            Output::Direct(sink) => sink.lock().unwrap().write_line(now.date(), &line),
            Output::Queue { sender, .. } => {
                if let Some(s) = &*sender.lock().unwrap() {
                    // blocks while the queue is full
                    let _ = s.send((now.date(), line));
                }
            }
        }
    }

    fn flush(&self) {
        if let Output::Direct(sink) = &self.output {
            sink.lock().unwrap().flush();
        }
    }
}

// SAFETY: this method is unsound on platforms where another thread may
// modify environment vars
unsafe fn get_offset() -> Option<UtcOffset> {
    time::util::local_offset::set_soundness(time::util::local_offset::Soundness::Unsound);

    let offset = UtcOffset::current_local_offset().ok();

    time::util::local_offset::set_soundness(time::util::local_offset::Soundness::Sound);

    offset
}

static LOGGER: OnceLock<SimpleLogger> = OnceLock::new();

/// Installs the process-wide logger. Only the first call has any effect.
pub fn ensure_init_simple_logger(config: &LogConfig) -> Result<(), io::Error> {
    if LOGGER.get().is_some() {
        return Ok(());
    }

    // SAFETY: called once at startup, before any other threads exist
    let local_offset = unsafe { get_offset() };

    let logger = SimpleLogger::new(config, local_offset)?;

    let logger = LOGGER.get_or_init(|| logger);

    if log::set_logger(logger).is_ok() {
        log::set_max_level(config.level);
    }

    Ok(())
}

/// Drains queued records, if any. Call before exiting.
pub fn shutdown() {
    if let Some(logger) = LOGGER.get() {
        logger.shutdown();
    }
}
