/*
 * Copyright (C) 2020 Fanout, Inc.
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

//! Doubly-linked chain threaded through an index-addressed arena.
//!
//! Links live in caller-owned storage (normally a `Slab`) and refer to each
//! other by key, so unlinking is O(1) and a key that leaves the chain keeps
//! no stale neighbours.

use std::ops::{Index, IndexMut};

pub struct Link<T> {
    pub value: T,
    pub prev: Option<usize>,
    pub next: Option<usize>,
}

impl<T> Link<T> {
    pub fn new(value: T) -> Self {
        Link {
            value,
            prev: None,
            next: None,
        }
    }
}

/// Ends of a chain. The links themselves are owned by the arena.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Chain {
    first: Option<usize>,
    last: Option<usize>,
}

impl Chain {
    pub fn first(&self) -> Option<usize> {
        self.first
    }

    pub fn last(&self) -> Option<usize> {
        self.last
    }

    pub fn is_empty(&self) -> bool {
        self.first.is_none()
    }

    /// Links `key` right behind `anchor`, or at the front when there is no
    /// anchor. `key` must not already be linked.
    pub fn link_after<T, A>(&mut self, arena: &mut A, anchor: Option<usize>, key: usize)
    where
        A: IndexMut<usize, Output = Link<T>>,
    {
        let successor = match anchor {
            Some(a) => arena[a].next.replace(key),
            None => self.first.replace(key),
        };

        let link = &mut arena[key];
        link.prev = anchor;
        link.next = successor;

        match successor {
            Some(s) => arena[s].prev = Some(key),
            None => self.last = Some(key),
        }
    }

    pub fn unlink<T, A>(&mut self, arena: &mut A, key: usize)
    where
        A: IndexMut<usize, Output = Link<T>>,
    {
        let (prev, next) = {
            let link = &mut arena[key];
            (link.prev.take(), link.next.take())
        };

        match prev {
            Some(p) => arena[p].next = next,
            None => self.first = next,
        }

        match next {
            Some(n) => arena[n].prev = prev,
            None => self.last = prev,
        }
    }

    /// Keys from front to back.
    pub fn iter<'a, T, A>(&self, arena: &'a A) -> Iter<'a, A>
    where
        A: Index<usize, Output = Link<T>>,
    {
        Iter {
            arena,
            at: self.first,
        }
    }
}

pub struct Iter<'a, A> {
    arena: &'a A,
    at: Option<usize>,
}

impl<T, A> Iterator for Iter<'_, A>
where
    A: Index<usize, Output = Link<T>>,
{
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let key = self.at?;
        self.at = self.arena[key].next;

        Some(key)
    }
}
