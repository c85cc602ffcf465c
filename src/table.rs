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

use crate::connection::Connection;
use slab::Slab;

enum State {
    Idle(Box<Connection>),

    // checked out to a worker or to an inline operation
    InFlight,
}

struct Slot {
    state: State,
    timer: Option<usize>,
    close_pending: bool,
}

/// Result of returning a checked-out connection.
pub enum Checkin {
    Restored,

    /// The slot was closed while the connection was out. The slot is gone
    /// and the caller must dispose of the connection.
    Closed(Box<Connection>),
}

/// Live connections, keyed by slab key. Capacity is fixed at construction.
pub struct ConnectionTable {
    slots: Slab<Slot>,
    capacity: usize,
}

impl ConnectionTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Slab::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.slots.len() >= self.capacity
    }

    pub fn contains(&self, key: usize) -> bool {
        self.slots.contains(key)
    }

    /// Hands the connection back if the table is full.
    pub fn insert(&mut self, conn: Box<Connection>) -> Result<usize, Box<Connection>> {
        if self.is_full() {
            return Err(conn);
        }

        Ok(self.slots.insert(Slot {
            state: State::Idle(conn),
            timer: None,
            close_pending: false,
        }))
    }

    pub fn timer(&self, key: usize) -> Option<usize> {
        self.slots.get(key).and_then(|s| s.timer)
    }

    pub fn set_timer(&mut self, key: usize, timer: Option<usize>) {
        if let Some(s) = self.slots.get_mut(key) {
            s.timer = timer;
        }
    }

    pub fn get_mut(&mut self, key: usize) -> Option<&mut Connection> {
        match self.slots.get_mut(key) {
            Some(Slot {
                state: State::Idle(conn),
                ..
            }) => Some(conn),
            _ => None,
        }
    }

    pub fn is_in_flight(&self, key: usize) -> bool {
        matches!(
            self.slots.get(key),
            Some(Slot {
                state: State::InFlight,
                ..
            })
        )
    }

    /// Takes the connection out, leaving the slot marked in flight. Returns
    /// None if the slot is empty or already in flight.
    pub fn checkout(&mut self, key: usize) -> Option<Box<Connection>> {
        let slot = self.slots.get_mut(key)?;

        match std::mem::replace(&mut slot.state, State::InFlight) {
            State::Idle(conn) => Some(conn),
            State::InFlight => None,
        }
    }

    pub fn checkin(&mut self, key: usize, conn: Box<Connection>) -> Checkin {
        let slot = match self.slots.get_mut(key) {
            Some(slot) if matches!(slot.state, State::InFlight) => slot,
            _ => return Checkin::Closed(conn),
        };

        if slot.close_pending {
            self.slots.remove(key);

            return Checkin::Closed(conn);
        }

        slot.state = State::Idle(conn);

        Checkin::Restored
    }

    /// Removes the slot. If its connection is in flight, the slot is only
    /// marked and goes away on checkin. Returns the idle connection and the
    /// timer key, if any.
    pub fn close(&mut self, key: usize) -> (Option<Box<Connection>>, Option<usize>) {
        let slot = match self.slots.get_mut(key) {
            Some(slot) => slot,
            None => return (None, None),
        };

        let timer = slot.timer.take();

        if matches!(slot.state, State::InFlight) {
            slot.close_pending = true;

            return (None, timer);
        }

        match self.slots.remove(key).state {
            State::Idle(conn) => (Some(conn), timer),
            State::InFlight => (None, timer),
        }
    }

    /// Removes every slot, returning the idle connections.
    pub fn drain(&mut self) -> Vec<Box<Connection>> {
        self.slots
            .drain()
            .filter_map(|s| match s.state {
                State::Idle(conn) => Some(conn),
                State::InFlight => None,
            })
            .collect()
    }
}
