/*
 * Copyright (C) 2020-2023 Fanout, Inc.
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

use crate::connection::{Connection, Next, Services};
use crate::queue::TaskQueue;
use log::{debug, error};
use std::io;
use std::sync::{mpsc, Arc};
use std::thread;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Bytes are already in the read buffer.
    Process,

    Read,
    Write,
}

pub struct Task {
    pub key: usize,
    pub conn: Box<Connection>,
    pub phase: Phase,
}

/// A connection coming back from a worker.
pub struct Completion {
    pub key: usize,
    pub conn: Box<Connection>,
    pub next: Next,
}

/// Delivers completions to the dispatcher and wakes its poll.
#[derive(Clone)]
pub struct Notifier {
    sender: mpsc::Sender<Completion>,
    waker: Arc<mio::Waker>,
}

impl Notifier {
    pub fn new(sender: mpsc::Sender<Completion>, waker: Arc<mio::Waker>) -> Self {
        Self { sender, waker }
    }

    pub fn notify(&self, c: Completion) {
        // receiver gone means the dispatcher is shutting down
        if self.sender.send(c).is_err() {
            return;
        }

        if let Err(e) = self.waker.wake() {
            error!("failed to wake dispatcher: {}", e);
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("worker count must be non-zero")]
    NoThreads,

    #[error("queue capacity must be non-zero")]
    NoCapacity,

    #[error("failed to spawn worker: {0}")]
    Spawn(#[from] io::Error),
}

fn run_task(task: Task, services: &Services) -> Completion {
    let Task {
        key,
        mut conn,
        phase,
    } = task;

    let next = match phase {
        Phase::Process => conn.process(services),
        Phase::Read => {
            if conn.receive() {
                conn.process(services)
            } else {
                Next::Close
            }
        }
        Phase::Write => match conn.write() {
            Ok(next) => next,
            Err(e) => {
                debug!("{}: write failed: {}", conn.peer(), e);

                Next::Close
            }
        },
    };

    Completion { key, conn, next }
}

/// Fixed set of threads draining a shared task queue.
pub struct WorkerPool {
    queue: Arc<TaskQueue<Task>>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(
        num_threads: usize,
        queue_size: usize,
        services: Arc<Services>,
        notifier: Notifier,
    ) -> Result<Self, PoolError> {
        if num_threads == 0 {
            return Err(PoolError::NoThreads);
        }

        if queue_size == 0 {
            return Err(PoolError::NoCapacity);
        }

        let queue = Arc::new(TaskQueue::new(queue_size));

        let mut pool = Self {
            queue,
            workers: Vec::with_capacity(num_threads),
        };

        for i in 0..num_threads {
            let queue = Arc::clone(&pool.queue);
            let services = Arc::clone(&services);
            let notifier = notifier.clone();

            // on error, dropping the pool stops what was already spawned
            let thread = thread::Builder::new()
                .name(format!("worker-{}", i))
                .spawn(move || {
                    while let Some(task) = queue.pop() {
                        notifier.notify(run_task(task, &services));
                    }
                })?;

            pool.workers.push(thread);
        }

        debug!("started {} workers", num_threads);

        Ok(pool)
    }

    pub fn thread_count(&self) -> usize {
        self.workers.len()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn push_back(&self, task: Task) -> Result<(), Task> {
        self.queue.push_back(task)
    }

    pub fn push_front(&self, task: Task) -> Result<(), Task> {
        self.queue.push_front(task)
    }

    fn stop(&mut self) {
        self.queue.close();

        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!("worker panicked");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}
