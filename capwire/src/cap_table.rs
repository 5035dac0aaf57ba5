// Copyright (c) 2013-2015 Sandstorm Development Group, Inc. and contributors
// Licensed under the MIT License:
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN
// THE SOFTWARE.

//! Index table behind the capability pointers of a message under construction.
//!
//! Writing a capability into a builder exports it here and stores the returned index in the
//! pointer. Exporting the same capability again bumps its reference count instead of taking a
//! new slot. An index stays valid until its count drops to zero; after that, reading it is an
//! error until the index is handed out again.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use crate::private::capability::ClientHook;
use crate::{Error, ErrorKind, Result};

struct CapEntry {
    hook: Box<dyn ClientHook>,
    refcount: u32,
}

pub struct CapTable {
    slots: Vec<Option<CapEntry>>,

    /// Released indices, smallest first.
    free_ids: BinaryHeap<Reverse<u32>>,

    /// `ClientHook::get_ptr()` of each live entry, mapped to its index.
    by_ptr: HashMap<usize, u32>,
}

impl CapTable {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_ids: BinaryHeap::new(),
            by_ptr: HashMap::new(),
        }
    }

    /// Adds a reference to `hook` and returns its index.
    pub fn export(&mut self, hook: Box<dyn ClientHook>) -> u32 {
        let ptr = hook.get_ptr();
        if let Some(&index) = self.by_ptr.get(&ptr) {
            if let Some(entry) = &mut self.slots[index as usize] {
                entry.refcount += 1;
                tracing::debug!(index, refcount = entry.refcount, "capability re-exported");
                return index;
            }
        }

        let entry = CapEntry { hook, refcount: 1 };
        let index = match self.free_ids.pop() {
            Some(Reverse(index)) => {
                self.slots[index as usize] = Some(entry);
                index
            }
            None => {
                self.slots.push(Some(entry));
                (self.slots.len() - 1) as u32
            }
        };
        self.by_ptr.insert(ptr, index);
        tracing::debug!(index, "capability exported");
        index
    }

    /// Returns a new reference to the capability at `index`.
    pub fn get(&self, index: u32) -> Result<Box<dyn ClientHook>> {
        match self.slots.get(index as usize) {
            Some(Some(entry)) => Ok(entry.hook.add_ref()),
            Some(None) => Err(Error::from_kind_context(
                ErrorKind::CapabilityReleased,
                format!("index {index}"),
            )),
            None => Err(Error::from_kind_context(
                ErrorKind::InvalidCapabilityPointer,
                format!("index {index}"),
            )),
        }
    }

    /// Drops `count` references to the entry at `index`, freeing the index once none remain.
    pub fn release(&mut self, index: u32, count: u32) -> Result<()> {
        let slot = match self.slots.get_mut(index as usize) {
            Some(slot) => slot,
            None => {
                return Err(Error::from_kind_context(
                    ErrorKind::InvalidCapabilityPointer,
                    format!("index {index}"),
                ))
            }
        };
        let Some(entry) = slot.as_mut() else {
            return Err(Error::from_kind_context(
                ErrorKind::CapabilityReleased,
                format!("index {index}"),
            ));
        };
        if count > entry.refcount {
            return Err(Error::failed(format!(
                "tried to release {count} references to capability {index}, which has only {}",
                entry.refcount
            )));
        }
        entry.refcount -= count;
        if entry.refcount == 0 {
            let ptr = entry.hook.get_ptr();
            *slot = None;
            self.by_ptr.remove(&ptr);
            self.free_ids.push(Reverse(index));
            tracing::debug!(index, "capability released");
        }
        Ok(())
    }

    /// Current reference count of `index`, or zero if the index is not live.
    pub fn refcount(&self, index: u32) -> u32 {
        match self.slots.get(index as usize) {
            Some(Some(entry)) => entry.refcount,
            _ => 0,
        }
    }

    /// Number of slots, live or released. Indices below this value have been handed out.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// One new reference per slot, `None` for released slots. The result is indexed the same
    /// way as the table, which is the form a message reader's capability table takes.
    pub fn snapshot(&self) -> Vec<Option<Box<dyn ClientHook>>> {
        self.slots
            .iter()
            .map(|slot| slot.as_ref().map(|entry| entry.hook.add_ref()))
            .collect()
    }

    /// Live entries in index order.
    pub fn entries(&self) -> impl Iterator<Item = (u32, &dyn ClientHook)> + '_ {
        self.slots.iter().enumerate().filter_map(|(idx, slot)| {
            slot.as_ref().map(|entry| (idx as u32, &*entry.hook))
        })
    }
}

impl Default for CapTable {
    fn default() -> Self {
        Self::new()
    }
}
