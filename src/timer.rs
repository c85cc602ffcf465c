/*
 * Copyright (C) 2020-2021 Fanout, Inc.
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

//! Idle-expiry timers kept in a list sorted ascending by expiration.
//!
//! Timers are slab records addressed by key. New timers almost always expire
//! after every existing one, so insertion scans backward from the tail.
//! Timers are only ever extended, so re-insertion scans forward from the
//! timer's old position instead of from the head.

use crate::list;
use slab::Slab;
use std::time::Instant;

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum TimerError {
    #[error("timer list is full")]
    Full,

    #[error("no such timer")]
    NotFound,

    #[error("timer expiry can only be extended")]
    Shortened,
}

struct Timer {
    expires: Instant,
    user_data: usize,
}

pub struct TimerList {
    nodes: Slab<list::Link<Timer>>,
    list: list::Chain,
    capacity: usize,
}

impl TimerList {
    pub fn new(capacity: usize) -> Self {
        Self {
            nodes: Slab::with_capacity(capacity),
            list: list::Chain::default(),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn expires(&self, key: usize) -> Option<Instant> {
        self.nodes.get(key).map(|n| n.value.expires)
    }

    pub fn next_expiry(&self) -> Option<Instant> {
        self.list.first().map(|key| self.nodes[key].value.expires)
    }

    pub fn add(&mut self, expires: Instant, user_data: usize) -> Result<usize, TimerError> {
        if self.nodes.len() >= self.capacity {
            return Err(TimerError::Full);
        }

        let key = self.nodes.insert(list::Link::new(Timer { expires, user_data }));

        // walk back past anything expiring later
        let mut after = self.list.last();
        while let Some(k) = after {
            if self.nodes[k].value.expires <= expires {
                break;
            }

            after = self.nodes[k].prev;
        }

        self.list.link_after(&mut self.nodes, after, key);

        Ok(key)
    }

    /// Pushes a timer's expiry later. Shortening is rejected and the timer is
    /// left untouched.
    pub fn adjust(&mut self, key: usize, expires: Instant) -> Result<(), TimerError> {
        let n = self.nodes.get_mut(key).ok_or(TimerError::NotFound)?;

        if expires < n.value.expires {
            return Err(TimerError::Shortened);
        }

        n.value.expires = expires;
        let next = n.next;

        let next = match next {
            Some(next) if self.nodes[next].value.expires < expires => next,

            // still ahead of its successor, nothing to move
            _ => return Ok(()),
        };

        let mut after = next;
        while let Some(k) = self.nodes[after].next {
            if self.nodes[k].value.expires > expires {
                break;
            }

            after = k;
        }

        self.list.unlink(&mut self.nodes, key);
        self.list.link_after(&mut self.nodes, Some(after), key);

        Ok(())
    }

    pub fn remove(&mut self, key: usize) -> Option<usize> {
        if !self.nodes.contains(key) {
            return None;
        }

        self.list.unlink(&mut self.nodes, key);

        Some(self.nodes.remove(key).value.user_data)
    }

    /// Fires `on_expire` with the user data of every timer whose expiry is at
    /// or before `now`, removing each one. Stops at the first timer still
    /// pending.
    pub fn tick<F>(&mut self, now: Instant, mut on_expire: F) -> usize
    where
        F: FnMut(usize),
    {
        let mut count = 0;

        while let Some(key) = self.list.first() {
            if self.nodes[key].value.expires > now {
                break;
            }

            self.list.unlink(&mut self.nodes, key);
            let t = self.nodes.remove(key).value;

            on_expire(t.user_data);
            count += 1;
        }

        count
    }

    #[cfg(test)]
    fn expirations(&self) -> Vec<Instant> {
        self.list
            .iter(&self.nodes)
            .map(|k| self.nodes[k].value.expires)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn secs(base: Instant, s: u64) -> Instant {
        base + Duration::from_secs(s)
    }

    fn assert_sorted(timers: &TimerList) {
        let exp = timers.expirations();
        assert_eq!(exp.len(), timers.len());
        assert!(exp.windows(2).all(|w| w[0] <= w[1]), "not sorted");
    }

    #[test]
    fn add_keeps_order() {
        let base = Instant::now();
        let mut timers = TimerList::new(10);

        timers.add(secs(base, 5), 5).unwrap();
        timers.add(secs(base, 9), 9).unwrap();
        timers.add(secs(base, 1), 1).unwrap();
        timers.add(secs(base, 7), 7).unwrap();
        timers.add(secs(base, 7), 70).unwrap();

        assert_sorted(&timers);
        assert_eq!(timers.next_expiry(), Some(secs(base, 1)));

        let mut fired = Vec::new();
        timers.tick(secs(base, 100), |d| fired.push(d));

        // equal expirations keep insertion order
        assert_eq!(fired, vec![1, 5, 7, 70, 9]);
    }

    #[test]
    fn add_when_full() {
        let base = Instant::now();
        let mut timers = TimerList::new(1);

        timers.add(base, 1).unwrap();
        assert_eq!(timers.add(base, 2), Err(TimerError::Full));
    }

    #[test]
    fn adjust_moves_forward() {
        let base = Instant::now();
        let mut timers = TimerList::new(10);

        let t1 = timers.add(secs(base, 1), 1).unwrap();
        timers.add(secs(base, 2), 2).unwrap();
        timers.add(secs(base, 3), 3).unwrap();
        let t4 = timers.add(secs(base, 4), 4).unwrap();

        timers.adjust(t1, secs(base, 3)).unwrap();
        assert_sorted(&timers);

        timers.adjust(t1, secs(base, 10)).unwrap();
        assert_sorted(&timers);
        assert_eq!(timers.expires(t1), Some(secs(base, 10)));

        // already last
        timers.adjust(t1, secs(base, 11)).unwrap();
        assert_sorted(&timers);

        // no successor overtaken
        timers.adjust(t4, secs(base, 5)).unwrap();
        assert_sorted(&timers);

        let mut fired = Vec::new();
        timers.tick(secs(base, 100), |d| fired.push(d));
        assert_eq!(fired, vec![2, 3, 4, 1]);
    }

    #[test]
    fn adjust_rejects_shorter_expiry() {
        let base = Instant::now();
        let mut timers = TimerList::new(10);

        let t = timers.add(secs(base, 5), 1).unwrap();

        assert_eq!(timers.adjust(t, secs(base, 4)), Err(TimerError::Shortened));
        assert_eq!(timers.expires(t), Some(secs(base, 5)));

        // same expiry is allowed
        assert_eq!(timers.adjust(t, secs(base, 5)), Ok(()));

        timers.remove(t);
        assert_eq!(timers.adjust(t, secs(base, 6)), Err(TimerError::NotFound));
    }

    #[test]
    fn remove_is_direct() {
        let base = Instant::now();
        let mut timers = TimerList::new(10);

        let t1 = timers.add(secs(base, 1), 1).unwrap();
        let t2 = timers.add(secs(base, 2), 2).unwrap();
        let t3 = timers.add(secs(base, 3), 3).unwrap();

        assert_eq!(timers.remove(t2), Some(2));
        assert_eq!(timers.remove(t2), None);
        assert_sorted(&timers);

        assert_eq!(timers.remove(t3), Some(3));
        assert_eq!(timers.remove(t1), Some(1));
        assert!(timers.is_empty());
        assert_eq!(timers.next_expiry(), None);
    }

    #[test]
    fn tick_removes_expired_prefix() {
        let base = Instant::now();
        let mut timers = TimerList::new(10);

        for s in [3, 1, 4, 1, 5, 9, 2, 6] {
            timers.add(secs(base, s), s as usize).unwrap();
        }

        let mut fired = Vec::new();
        let count = timers.tick(secs(base, 3), |d| fired.push(d));

        assert_eq!(count, 4);
        assert_eq!(fired, vec![1, 1, 2, 3]);
        assert_eq!(timers.len(), 4);
        assert_sorted(&timers);
        assert_eq!(timers.next_expiry(), Some(secs(base, 4)));

        assert_eq!(timers.tick(secs(base, 3), |_| unreachable!()), 0);
    }

    #[test]
    fn mixed_operations_stay_sorted() {
        let base = Instant::now();
        let mut timers = TimerList::new(64);
        let mut keys = Vec::new();

        // deterministic pseudo-random sequence
        let mut x: u64 = 7;
        for i in 0..64 {
            x = x.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let s = (x >> 33) % 50;

            keys.push((timers.add(secs(base, s), i).unwrap(), s));
            assert_sorted(&timers);
        }

        for (i, (key, s)) in keys.iter_mut().enumerate() {
            match i % 3 {
                0 => {
                    *s += (i as u64) % 17;
                    timers.adjust(*key, secs(base, *s)).unwrap();
                }
                1 => {
                    timers.remove(*key);
                }
                _ => {}
            }

            assert_sorted(&timers);
        }

        timers.tick(secs(base, 25), |_| {});
        assert_sorted(&timers);
        assert!(timers.next_expiry().map_or(true, |t| t > secs(base, 25)));
    }
}
