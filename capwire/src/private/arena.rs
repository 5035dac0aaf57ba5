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

use crate::cap_table::CapTable;
use crate::message::{self, Allocator, ReaderSegments};
use crate::private::capability::ClientHook;
use crate::private::read_limiter::ReadLimiter;
use crate::private::units::*;
use crate::{Error, ErrorKind, OutputSegments, Result};

pub type SegmentId = u32;

/// Read access to the segments of a message.
///
/// Positions are word indices into a segment. Every interval handed out to a reader
/// passes through `contains_interval()`, which both bounds-checks it and charges it
/// against the traversal budget.
pub trait ReaderArena {
    /// Returns the bytes of segment `id`, truncated to a whole number of words.
    fn get_segment(&self, id: u32) -> Result<&[u8]>;

    /// Checks that `size_in_words` words starting at word `start` lie within segment `id`.
    fn contains_interval(&self, id: u32, start: i64, size_in_words: u64) -> Result<()>;

    /// Charges `virtual_amount` words against the traversal budget without any bounds check.
    /// Used for lists whose elements take up no space on the wire.
    fn amplified_read(&self, virtual_amount: u64) -> Result<()>;

    fn nesting_limit(&self) -> i32;

    /// Looks up a capability by its index in this message's capability table.
    fn extract_cap(&self, index: u32) -> Result<Box<dyn ClientHook>>;
}

/// The segments of a message together with its traversal budget. Capability pointers cannot
/// be resolved against it.
pub struct SegmentArena<S> {
    segments: S,
    read_limiter: ReadLimiter,
    nesting_limit: i32,
}

#[cfg(feature = "sync_reader")]
fn _assert_sync() {
    fn _assert_sync<T: Sync>() {}
    fn _assert_segments<S: ReaderSegments + Sync>() {
        _assert_sync::<SegmentArena<S>>();
    }
}

impl<S> SegmentArena<S>
where
    S: ReaderSegments,
{
    pub fn new(segments: S, options: message::ReaderOptions) -> Self {
        Self {
            segments,
            read_limiter: ReadLimiter::new(options.traversal_limit_in_words),
            nesting_limit: options.nesting_limit,
        }
    }

    pub fn into_segments(self) -> S {
        self.segments
    }

    pub fn segments(&self) -> &S {
        &self.segments
    }
}

/// A `SegmentArena` plus the capability table its capability pointers index into.
pub struct ReaderArenaImpl<S> {
    base: SegmentArena<S>,
    cap_table: Vec<Option<Box<dyn ClientHook>>>,
}

impl<S> ReaderArenaImpl<S>
where
    S: ReaderSegments,
{
    pub fn new(segments: S, options: message::ReaderOptions) -> Self {
        Self {
            base: SegmentArena::new(segments, options),
            cap_table: Vec::new(),
        }
    }

    pub fn into_segments(self) -> S {
        self.base.into_segments()
    }

    pub fn segments(&self) -> &S {
        self.base.segments()
    }

    pub fn set_cap_table(&mut self, cap_table: Vec<Option<Box<dyn ClientHook>>>) {
        self.cap_table = cap_table;
    }

    /// Drops the capability table, keeping the segments and what is left of the budget.
    pub fn into_segment_arena(self) -> SegmentArena<S> {
        self.base
    }
}

fn whole_words(segment: &[u8]) -> &[u8] {
    &segment[..segment.len() - segment.len() % BYTES_PER_WORD]
}

fn check_interval(segment: &[u8], start: i64, size_in_words: u64) -> Result<()> {
    let segment_words = (segment.len() / BYTES_PER_WORD) as u64;
    if start < 0 || (start as u64).saturating_add(size_in_words) > segment_words {
        Err(Error::from_kind(ErrorKind::MessageContainsOutOfBoundsPointer))
    } else {
        Ok(())
    }
}

impl<S> ReaderArena for SegmentArena<S>
where
    S: ReaderSegments,
{
    fn get_segment(&self, id: u32) -> Result<&[u8]> {
        match self.segments.get_segment(id) {
            Some(seg) => Ok(whole_words(seg)),
            None => Err(Error::from_kind_context(
                ErrorKind::InvalidSegmentId,
                format!("segment {id}"),
            )),
        }
    }

    fn contains_interval(&self, id: u32, start: i64, size_in_words: u64) -> Result<()> {
        let segment = self.get_segment(id)?;
        if let Err(e) = check_interval(segment, start, size_in_words) {
            tracing::debug!(segment = id, start, size_in_words, "rejected out-of-bounds pointer");
            return Err(e);
        }
        self.read_limiter.can_read(size_in_words)
    }

    fn amplified_read(&self, virtual_amount: u64) -> Result<()> {
        self.read_limiter.can_read(virtual_amount)
    }

    fn nesting_limit(&self) -> i32 {
        self.nesting_limit
    }

    fn extract_cap(&self, index: u32) -> Result<Box<dyn ClientHook>> {
        Err(Error::from_kind_context(
            ErrorKind::InvalidCapabilityPointer,
            format!("index {index} in a message without a capability table"),
        ))
    }
}

impl<S> ReaderArena for ReaderArenaImpl<S>
where
    S: ReaderSegments,
{
    fn get_segment(&self, id: u32) -> Result<&[u8]> {
        self.base.get_segment(id)
    }

    fn contains_interval(&self, id: u32, start: i64, size_in_words: u64) -> Result<()> {
        self.base.contains_interval(id, start, size_in_words)
    }

    fn amplified_read(&self, virtual_amount: u64) -> Result<()> {
        self.base.amplified_read(virtual_amount)
    }

    fn nesting_limit(&self) -> i32 {
        self.base.nesting_limit
    }

    fn extract_cap(&self, index: u32) -> Result<Box<dyn ClientHook>> {
        match self.cap_table.get(index as usize) {
            Some(Some(hook)) => Ok(hook.add_ref()),
            _ => Err(Error::from_kind_context(
                ErrorKind::InvalidCapabilityPointer,
                format!("index {index}"),
            )),
        }
    }
}

/// Arena backing default (null) readers. It has no segments and no capabilities.
pub struct NullArena;

pub static NULL_ARENA: NullArena = NullArena;

impl ReaderArena for NullArena {
    fn get_segment(&self, id: u32) -> Result<&[u8]> {
        Err(Error::from_kind_context(
            ErrorKind::InvalidSegmentId,
            format!("segment {id} of an empty arena"),
        ))
    }

    fn contains_interval(&self, _id: u32, _start: i64, size_in_words: u64) -> Result<()> {
        if size_in_words == 0 {
            Ok(())
        } else {
            Err(Error::from_kind(ErrorKind::MessageContainsOutOfBoundsPointer))
        }
    }

    fn amplified_read(&self, _virtual_amount: u64) -> Result<()> {
        Ok(())
    }

    fn nesting_limit(&self) -> i32 {
        0x7fffffff
    }

    fn extract_cap(&self, index: u32) -> Result<Box<dyn ClientHook>> {
        Err(Error::from_kind_context(
            ErrorKind::InvalidCapabilityPointer,
            format!("index {index}"),
        ))
    }
}

/// Mutable access to the segments of a message under construction.
pub trait BuilderArena: ReaderArena {
    /// Allocates `amount` words at the end of segment `segment_id`, if it has room.
    fn allocate(&mut self, segment_id: u32, amount: WordCount32) -> Option<u32>;

    /// Allocates `amount` words in whichever segment has room, opening a new one if needed.
    fn allocate_anywhere(&mut self, amount: WordCount32) -> Result<(SegmentId, u32)>;

    /// The allocated part of segment `id`. `id` must name an existing segment.
    fn get_segment_mut(&mut self, id: u32) -> &mut [u8];

    /// The allocated part of segment `id`. `id` must name an existing segment.
    fn get_segment_ref(&self, id: u32) -> &[u8];

    fn as_reader(&self) -> &dyn ReaderArena;

    fn inject_cap(&mut self, cap: Box<dyn ClientHook>) -> u32;

    fn drop_cap(&mut self, index: u32);
}

/// One segment of a message being built. Only the first `allocated` words are in use;
/// the rest of `data` is zeroed spare capacity.
struct BuilderSegment {
    data: Vec<u8>,
    allocated: u32,
}

impl BuilderSegment {
    fn capacity(&self) -> u32 {
        (self.data.len() / BYTES_PER_WORD) as u32
    }

    fn allocated_bytes(&self) -> &[u8] {
        &self.data[..self.allocated as usize * BYTES_PER_WORD]
    }
}

pub struct BuilderArenaImpl<A>
where
    A: Allocator,
{
    allocator: A,
    segments: Vec<BuilderSegment>,
    cap_table: CapTable,
}

impl<A> BuilderArenaImpl<A>
where
    A: Allocator,
{
    pub fn new(allocator: A) -> Self {
        Self {
            allocator,
            segments: Vec::new(),
            cap_table: CapTable::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Total allocated words across all segments.
    pub fn size_in_words(&self) -> usize {
        self.segments.iter().map(|s| s.allocated as usize).sum()
    }

    pub fn get_segments_for_output(&self) -> OutputSegments<'_> {
        match self.segments.len() {
            0 => OutputSegments::SingleSegment([&[]]),
            1 => OutputSegments::SingleSegment([self.segments[0].allocated_bytes()]),
            _ => OutputSegments::MultiSegment(
                self.segments.iter().map(|s| s.allocated_bytes()).collect(),
            ),
        }
    }

    pub fn cap_table(&self) -> &CapTable {
        &self.cap_table
    }

    pub fn cap_table_mut(&mut self) -> &mut CapTable {
        &mut self.cap_table
    }

    fn new_segment(&mut self, minimum_size: WordCount32) -> Result<SegmentId> {
        let data = self.allocator.allocate_segment(minimum_size)?;
        if data.len() / BYTES_PER_WORD < minimum_size as usize {
            return Err(Error::failed(format!(
                "allocator returned a segment of {} bytes, but {} words were requested",
                data.len(),
                minimum_size
            )));
        }
        let id = self.segments.len() as SegmentId;
        tracing::trace!(segment = id, words = data.len() / BYTES_PER_WORD, "opened segment");
        self.segments.push(BuilderSegment { data, allocated: 0 });
        Ok(id)
    }
}

impl<A> ReaderArena for BuilderArenaImpl<A>
where
    A: Allocator,
{
    fn get_segment(&self, id: u32) -> Result<&[u8]> {
        match self.segments.get(id as usize) {
            Some(seg) => Ok(seg.allocated_bytes()),
            None => Err(Error::from_kind_context(
                ErrorKind::InvalidSegmentId,
                format!("segment {id}"),
            )),
        }
    }

    fn contains_interval(&self, id: u32, start: i64, size_in_words: u64) -> Result<()> {
        check_interval(self.get_segment(id)?, start, size_in_words)
    }

    fn amplified_read(&self, _virtual_amount: u64) -> Result<()> {
        Ok(())
    }

    fn nesting_limit(&self) -> i32 {
        0x7fffffff
    }

    fn extract_cap(&self, index: u32) -> Result<Box<dyn ClientHook>> {
        self.cap_table.get(index)
    }
}

impl<A> BuilderArena for BuilderArenaImpl<A>
where
    A: Allocator,
{
    fn allocate(&mut self, segment_id: u32, amount: WordCount32) -> Option<u32> {
        let seg = self.segments.get_mut(segment_id as usize)?;
        if amount > seg.capacity() - seg.allocated {
            None
        } else {
            let result = seg.allocated;
            seg.allocated += amount;
            Some(result)
        }
    }

    fn allocate_anywhere(&mut self, amount: WordCount32) -> Result<(SegmentId, u32)> {
        if amount > SEGMENT_WORD_LIMIT {
            return Err(Error::from_kind_context(
                ErrorKind::ResourceExceeded,
                format!("cannot allocate {amount} words in a single segment"),
            ));
        }
        if let Some(last) = self.segments.len().checked_sub(1) {
            if let Some(pos) = self.allocate(last as u32, amount) {
                return Ok((last as u32, pos));
            }
        }
        let id = self.new_segment(amount)?;
        match self.allocate(id, amount) {
            Some(pos) => Ok((id, pos)),
            None => Err(Error::failed("fresh segment is too small".to_string())),
        }
    }

    fn get_segment_mut(&mut self, id: u32) -> &mut [u8] {
        let seg = &mut self.segments[id as usize];
        &mut seg.data[..seg.allocated as usize * BYTES_PER_WORD]
    }

    fn get_segment_ref(&self, id: u32) -> &[u8] {
        self.segments[id as usize].allocated_bytes()
    }

    fn as_reader(&self) -> &dyn ReaderArena {
        self
    }

    fn inject_cap(&mut self, cap: Box<dyn ClientHook>) -> u32 {
        self.cap_table.export(cap)
    }

    fn drop_cap(&mut self, index: u32) {
        if let Err(e) = self.cap_table.release(index, 1) {
            tracing::debug!(index, error = %e, "dropping capability pointer to released entry");
        }
    }
}
