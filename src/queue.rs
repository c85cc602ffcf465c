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

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Bounded FIFO shared by producers and blocking consumers. Pushing never
/// blocks: a full queue hands the item back.
pub struct TaskQueue<T> {
    inner: Mutex<Inner<T>>,
    cond: Condvar,
    capacity: usize,
}

impl<T> TaskQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            cond: Condvar::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn push_back(&self, item: T) -> Result<(), T> {
        self.push(item, false)
    }

    /// Queues ahead of everything else. Used for work whose I/O is done.
    pub fn push_front(&self, item: T) -> Result<(), T> {
        self.push(item, true)
    }

    fn push(&self, item: T, front: bool) -> Result<(), T> {
        {
            let inner = &mut *self.inner.lock().unwrap();

            if inner.closed || inner.items.len() >= self.capacity {
                return Err(item);
            }

            if front {
                inner.items.push_front(item);
            } else {
                inner.items.push_back(item);
            }
        }

        self.cond.notify_one();

        Ok(())
    }

    /// Blocks until an item is available. Returns None once the queue has
    /// been closed and drained.
    pub fn pop(&self) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();

        loop {
            if let Some(item) = inner.items.pop_front() {
                return Some(item);
            }

            if inner.closed {
                return None;
            }

            inner = self.cond.wait(inner).unwrap();
        }
    }

    pub fn close(&self) {
        self.inner.lock().unwrap().closed = true;

        self.cond.notify_all();
    }
}
