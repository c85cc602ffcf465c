/*
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

//! Where socket I/O happens once a connection becomes ready: either in the
//! dispatcher thread with only request processing queued, or entirely in a
//! worker.

use crate::connection::{Connection, Next};
use crate::worker::{Phase, Task, WorkerPool};
use log::{debug, warn};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// I/O in the dispatcher thread.
    InLoop,

    /// I/O in a worker thread.
    InWorker,
}

impl FromStr for DispatchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "a" | "A" | "0" => Ok(Self::InLoop),
            "b" | "B" | "1" => Ok(Self::InWorker),
            _ => Err(format!("unknown dispatch mode: {}", s)),
        }
    }
}

impl fmt::Display for DispatchMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        match self {
            Self::InLoop => write!(f, "a"),
            Self::InWorker => write!(f, "b"),
        }
    }
}

pub enum Handoff {
    /// A worker owns the connection and will return it as a completion.
    Queued,

    /// The work was done in place.
    Done(Box<Connection>, Next),

    /// The queue is full. The connection is returned along with the
    /// interest to re-arm.
    Rejected(Box<Connection>, Next),
}

pub trait Dispatch {
    fn readable(&self, workers: &WorkerPool, key: usize, conn: Box<Connection>) -> Handoff;

    fn writable(&self, workers: &WorkerPool, key: usize, conn: Box<Connection>) -> Handoff;
}

fn enqueue(workers: &WorkerPool, task: Task, front: bool, rearm: Next) -> Handoff {
    let ret = if front {
        workers.push_front(task)
    } else {
        workers.push_back(task)
    };

    match ret {
        Ok(()) => Handoff::Queued,
        Err(task) => {
            warn!("task queue full, deferring {}", task.conn.peer());

            Handoff::Rejected(task.conn, rearm)
        }
    }
}

pub struct InLoop;

impl Dispatch for InLoop {
    fn readable(&self, workers: &WorkerPool, key: usize, mut conn: Box<Connection>) -> Handoff {
        if !conn.receive() {
            return Handoff::Done(conn, Next::Close);
        }

        let task = Task {
            key,
            conn,
            phase: Phase::Process,
        };

        enqueue(workers, task, true, Next::Read)
    }

    fn writable(&self, _workers: &WorkerPool, _key: usize, mut conn: Box<Connection>) -> Handoff {
        let next = match conn.write() {
            Ok(next) => next,
            Err(e) => {
                debug!("{}: write failed: {}", conn.peer(), e);

                Next::Close
            }
        };

        Handoff::Done(conn, next)
    }
}

pub struct InWorker;

impl Dispatch for InWorker {
    fn readable(&self, workers: &WorkerPool, key: usize, conn: Box<Connection>) -> Handoff {
        let task = Task {
            key,
            conn,
            phase: Phase::Read,
        };

        enqueue(workers, task, false, Next::Read)
    }

    fn writable(&self, workers: &WorkerPool, key: usize, conn: Box<Connection>) -> Handoff {
        let task = Task {
            key,
            conn,
            phase: Phase::Write,
        };

        enqueue(workers, task, false, Next::Write)
    }
}

pub fn strategy(mode: DispatchMode) -> Box<dyn Dispatch + Send> {
    match mode {
        DispatchMode::InLoop => Box::new(InLoop),
        DispatchMode::InWorker => Box::new(InWorker),
    }
}
