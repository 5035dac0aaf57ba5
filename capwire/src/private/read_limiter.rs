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

//! The traversal budget shared by every reader derived from one message.
//!
//! With the `sync_reader` feature the budget is atomic, so a message can be read from several
//! threads at once. Otherwise it lives in a `Cell`.

#[cfg(feature = "sync_reader")]
pub use sync::ReadLimiter;

#[cfg(feature = "sync_reader")]
mod sync {
    use crate::{Error, ErrorKind, Result};
    use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    pub struct ReadLimiter {
        limit: AtomicUsize,
        limit_reached: AtomicBool,
    }

    impl ReadLimiter {
        pub fn new(limit: u64) -> Self {
            Self {
                limit: AtomicUsize::new(usize::try_from(limit).unwrap_or(usize::MAX)),
                limit_reached: AtomicBool::new(false),
            }
        }

        #[inline]
        pub fn can_read(&self, amount: u64) -> Result<()> {
            if self.limit_reached.load(Ordering::Relaxed) {
                return Err(Error::from_kind(ErrorKind::TraversalLimitExceeded));
            }
            let amount = usize::try_from(amount).unwrap_or(usize::MAX);
            let prev = self.limit.fetch_sub(amount, Ordering::Relaxed);
            if prev < amount {
                // The subtraction wrapped; the flag keeps every later read failing.
                self.limit_reached.store(true, Ordering::Relaxed);
                tracing::debug!(amount, remaining = prev, "traversal limit exceeded");
                return Err(Error::from_kind(ErrorKind::TraversalLimitExceeded));
            }
            Ok(())
        }

        pub fn remaining(&self) -> u64 {
            if self.limit_reached.load(Ordering::Relaxed) {
                0
            } else {
                self.limit.load(Ordering::Relaxed) as u64
            }
        }
    }
}

#[cfg(not(feature = "sync_reader"))]
pub use unsync::ReadLimiter;

#[cfg(not(feature = "sync_reader"))]
mod unsync {
    use crate::{Error, ErrorKind, Result};
    use core::cell::Cell;

    pub struct ReadLimiter {
        limit: Cell<u64>,
    }

    impl ReadLimiter {
        pub fn new(limit: u64) -> Self {
            Self {
                limit: Cell::new(limit),
            }
        }

        #[inline]
        pub fn can_read(&self, amount: u64) -> Result<()> {
            let current = self.limit.get();
            if amount > current {
                tracing::debug!(amount, remaining = current, "traversal limit exceeded");
                Err(Error::from_kind(ErrorKind::TraversalLimitExceeded))
            } else {
                self.limit.set(current - amount);
                Ok(())
            }
        }

        pub fn remaining(&self) -> u64 {
            self.limit.get()
        }
    }
}
