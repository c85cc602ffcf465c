/*
 * Copyright (C) 2023 Fanout, Inc.
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

//! Bounded pool of externally-opened handles.
//!
//! Handles are only created in `ResourcePool::new` and destroyed when the
//! pool is dropped. A worker must never hold two handles at once: acquire
//! blocks while the pool is exhausted, so nested acquisition can deadlock.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex};

pub struct ResourcePool<T> {
    free: Mutex<VecDeque<T>>,
    permit: Condvar,
    capacity: usize,
}

impl<T> ResourcePool<T> {
    /// Opens `size` handles using `open`. Any failure aborts construction.
    pub fn new<F, E>(size: usize, mut open: F) -> Result<Self, E>
    where
        F: FnMut() -> Result<T, E>,
    {
        let mut free = VecDeque::with_capacity(size);

        for _ in 0..size {
            free.push_back(open()?);
        }

        Ok(Self {
            free: Mutex::new(free),
            permit: Condvar::new(),
            capacity: size,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.free.lock().unwrap().len()
    }

    /// Blocks until a handle is free. Returns None only for an empty pool.
    pub fn acquire(&self) -> Option<PoolGuard<'_, T>> {
        if self.capacity == 0 {
            return None;
        }

        let mut free = self.free.lock().unwrap();

        loop {
            if let Some(value) = free.pop_front() {
                return Some(PoolGuard {
                    pool: self,
                    value: Some(value),
                });
            }

            free = self.permit.wait(free).unwrap();
        }
    }

    pub fn try_acquire(&self) -> Option<PoolGuard<'_, T>> {
        let value = self.free.lock().unwrap().pop_front()?;

        Some(PoolGuard {
            pool: self,
            value: Some(value),
        })
    }

    fn release(&self, value: T) {
        self.free.lock().unwrap().push_back(value);

        self.permit.notify_one();
    }
}

/// A borrowed handle. Returned to the pool when dropped.
pub struct PoolGuard<'a, T> {
    pool: &'a ResourcePool<T>,
    value: Option<T>,
}

impl<T> PoolGuard<'_, T> {
    pub fn release(self) {
        // drop does the work
    }
}

impl<T> Deref for PoolGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.value.as_ref().expect("pool guard already released")
    }
}

impl<T> DerefMut for PoolGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.value.as_mut().expect("pool guard already released")
    }
}

impl<T> Drop for PoolGuard<'_, T> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            self.pool.release(value);
        }
    }
}
