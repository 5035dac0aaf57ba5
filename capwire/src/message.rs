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

//! Untyped root container for a message.

use crate::any_pointer;
use crate::cap_table::CapTable;
#[cfg(feature = "sync_reader")]
use crate::private::arena::SegmentArena;
use crate::private::arena::{BuilderArena, BuilderArenaImpl, ReaderArena, ReaderArenaImpl};
use crate::private::capability::ClientHook;
use crate::private::layout;
use crate::private::units::{BYTES_PER_WORD, SEGMENT_WORD_LIMIT};
use crate::traits::{FromPointerBuilder, FromPointerReader, SetPointerBuilder};
use crate::{Error, ErrorKind, OutputSegments, Result};

/// Options controlling how data is read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReaderOptions {
    /// Limits how many total words of data are allowed to be traversed. Traversal is counted
    /// when a new struct or list reader is obtained, e.g. from a get() accessor. Calling the
    /// getter for the same sub-struct multiple times will cause it to be double-counted. Once
    /// the traversal limit is reached, an error will be reported.
    ///
    /// A message may contain multiple pointers to the same location, which makes a message that
    /// is small on the wire appear much larger when traversed. This limit bounds the work a
    /// hostile message can cause.
    pub traversal_limit_in_words: u64,

    /// Limits how deeply nested a message structure can be, e.g. structs containing other
    /// structs or lists of structs. The default of 64 is far below anything that could exhaust
    /// the stack of recursive traversal code.
    pub nesting_limit: i32,
}

pub const DEFAULT_READER_OPTIONS: ReaderOptions = ReaderOptions {
    traversal_limit_in_words: 8 * 1024 * 1024,
    nesting_limit: 64,
};

impl Default for ReaderOptions {
    fn default() -> Self {
        DEFAULT_READER_OPTIONS
    }
}

impl ReaderOptions {
    pub fn new() -> Self {
        DEFAULT_READER_OPTIONS
    }

    pub fn nesting_limit(&mut self, value: i32) -> &mut Self {
        self.nesting_limit = value;
        self
    }

    pub fn traversal_limit_in_words(&mut self, value: u64) -> &mut Self {
        self.traversal_limit_in_words = value;
        self
    }
}

/// An object that manages the buffers underlying a message reader.
pub trait ReaderSegments {
    /// Gets the segment with index `idx`. Returns `None` if `idx` is out of range.
    fn get_segment(&self, idx: u32) -> Option<&[u8]>;

    /// Gets the number of segments.
    fn len(&self) -> usize {
        let mut count = 0;
        while self.get_segment(count as u32).is_some() {
            count += 1;
        }
        count
    }
}

impl<S> ReaderSegments for &S
where
    S: ReaderSegments + ?Sized,
{
    fn get_segment(&self, idx: u32) -> Option<&[u8]> {
        (**self).get_segment(idx)
    }

    fn len(&self) -> usize {
        (**self).len()
    }
}

/// An array of segments.
pub struct SegmentArray<'a> {
    segments: &'a [&'a [u8]],
}

impl<'a> SegmentArray<'a> {
    pub fn new(segments: &'a [&'a [u8]]) -> SegmentArray<'a> {
        SegmentArray { segments }
    }
}

impl ReaderSegments for SegmentArray<'_> {
    fn get_segment(&self, id: u32) -> Option<&[u8]> {
        self.segments.get(id as usize).copied()
    }

    fn len(&self) -> usize {
        self.segments.len()
    }
}

impl ReaderSegments for [&[u8]] {
    fn get_segment(&self, id: u32) -> Option<&[u8]> {
        self.get(id as usize).copied()
    }

    fn len(&self) -> usize {
        <[&[u8]]>::len(self)
    }
}

/// A container used to read a message.
pub struct Reader<S>
where
    S: ReaderSegments,
{
    arena: ReaderArenaImpl<S>,
}

impl<S> Reader<S>
where
    S: ReaderSegments,
{
    pub fn new(segments: S, options: ReaderOptions) -> Self {
        Reader {
            arena: ReaderArenaImpl::new(segments, options),
        }
    }

    /// Gets the root of the message, interpreting it as the given type.
    pub fn get_root<'a, T: FromPointerReader<'a>>(&'a self) -> Result<T> {
        root_of(&self.arena)?.get_as()
    }

    pub fn into_segments(self) -> S {
        self.arena.into_segments()
    }

    pub fn segments(&self) -> &S {
        self.arena.segments()
    }

    /// Total size of all segments, in words.
    pub fn size_in_words(&self) -> usize {
        let segments = self.arena.segments();
        (0..segments.len() as u32)
            .filter_map(|id| segments.get_segment(id))
            .map(|s| s.len() / BYTES_PER_WORD)
            .sum()
    }

    /// Supplies the capabilities that capability pointers in this message refer to.
    /// Entry `i` answers capability index `i`; `None` marks an index with no capability.
    pub fn set_cap_table(&mut self, cap_table: Vec<Option<Box<dyn ClientHook>>>) {
        self.arena.set_cap_table(cap_table);
    }

    /// Marks the message as shareable between threads. The capability table is dropped, so
    /// capability pointers in the result fail to resolve. Whatever traversal budget is left
    /// carries over and is shared by every thread.
    #[cfg(feature = "sync_reader")]
    pub fn into_shared(self) -> SharedReader<S> {
        SharedReader {
            arena: self.arena.into_segment_arena(),
        }
    }
}

fn root_of(arena: &dyn ReaderArena) -> Result<any_pointer::Reader<'_>> {
    let segment = arena.get_segment(0)?;
    if segment.is_empty() {
        return Ok(any_pointer::Reader::new(layout::PointerReader::new_default()));
    }
    let pointer_reader = layout::PointerReader::get_root(arena, 0, 0, arena.nesting_limit())?;
    Ok(any_pointer::Reader::new(pointer_reader))
}

/// A reader that is `Sync` whenever its segments are, so one message can be read from several
/// threads without copying it.
#[cfg(feature = "sync_reader")]
pub struct SharedReader<S>
where
    S: ReaderSegments,
{
    arena: SegmentArena<S>,
}

#[cfg(feature = "sync_reader")]
impl<S> SharedReader<S>
where
    S: ReaderSegments,
{
    pub fn new(segments: S, options: ReaderOptions) -> Self {
        SharedReader {
            arena: SegmentArena::new(segments, options),
        }
    }

    pub fn get_root<'a, T: FromPointerReader<'a>>(&'a self) -> Result<T> {
        root_of(&self.arena)?.get_as()
    }

    pub fn into_segments(self) -> S {
        self.arena.into_segments()
    }

    pub fn segments(&self) -> &S {
        self.arena.segments()
    }
}

/// An object that allocates memory for a message as it is being built.
pub trait Allocator {
    /// Allocates a zeroed segment of at least `minimum_size` words. The returned buffer's
    /// length is a multiple of eight bytes.
    fn allocate_segment(&mut self, minimum_size: u32) -> Result<Vec<u8>>;
}

/// A container used to build a message.
pub struct Builder<A>
where
    A: Allocator,
{
    arena: BuilderArenaImpl<A>,
}

impl<A> Builder<A>
where
    A: Allocator,
{
    pub fn new(allocator: A) -> Self {
        Builder {
            arena: BuilderArenaImpl::new(allocator),
        }
    }

    fn get_root_internal(&mut self) -> Result<any_pointer::Builder<'_>> {
        if self.arena.is_empty() {
            let (segment_id, pos) = self.arena.allocate_anywhere(1)?;
            debug_assert_eq!((segment_id, pos), (0, 0));
        }
        Ok(any_pointer::Builder::new(layout::PointerBuilder::get_root(
            &mut self.arena,
            0,
            0,
        )))
    }

    /// Initializes the root as a value of the given type.
    pub fn init_root<'a, T: FromPointerBuilder<'a>>(&'a mut self) -> Result<T> {
        self.get_root_internal()?.init_as()
    }

    /// Gets the root, interpreting it as the given type.
    pub fn get_root<'a, T: FromPointerBuilder<'a>>(&'a mut self) -> Result<T> {
        self.get_root_internal()?.get_as()
    }

    pub fn get_root_as_reader<'a, T: FromPointerReader<'a>>(&'a self) -> Result<T> {
        if self.arena.is_empty() {
            any_pointer::Reader::new(layout::PointerReader::new_default()).get_as()
        } else {
            let pointer_reader =
                layout::PointerReader::get_root(self.arena.as_reader(), 0, 0, i32::MAX)?;
            any_pointer::Reader::new(pointer_reader).get_as()
        }
    }

    /// Sets the root to a deep copy of the given value.
    pub fn set_root<T: SetPointerBuilder>(&mut self, value: T) -> Result<()> {
        self.get_root_internal()?.set_as(value)
    }

    pub fn get_segments_for_output(&self) -> OutputSegments<'_> {
        self.arena.get_segments_for_output()
    }

    /// Words allocated so far, across all segments.
    pub fn size_in_words(&self) -> usize {
        self.arena.size_in_words()
    }

    pub fn cap_table(&self) -> &CapTable {
        self.arena.cap_table()
    }

    pub fn cap_table_mut(&mut self) -> &mut CapTable {
        self.arena.cap_table_mut()
    }

    /// Converts this builder into a reader over the same segments. Capabilities stored in the
    /// message remain readable.
    pub fn into_reader(self) -> Reader<Builder<A>> {
        let caps = self.arena.cap_table().snapshot();
        let mut reader = Reader::new(
            self,
            ReaderOptions {
                traversal_limit_in_words: u64::MAX,
                nesting_limit: i32::MAX,
            },
        );
        reader.set_cap_table(caps);
        reader
    }
}

impl<A> ReaderSegments for Builder<A>
where
    A: Allocator,
{
    fn get_segment(&self, id: u32) -> Option<&[u8]> {
        self.arena.get_segment(id).ok()
    }

    fn len(&self) -> usize {
        self.arena.len()
    }
}

#[derive(Debug)]
pub struct HeapAllocator {
    next_size: u32,
    allocation_strategy: AllocationStrategy,
    max_segment_words: u32,
    total_words_limit: Option<u64>,
    total_words_allocated: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocationStrategy {
    /// Every segment gets the first-segment size, unless the allocation that opens it needs
    /// more, in which case the segment is exactly that large.
    FixedSize,

    /// Each new segment is at least as large as all previous segments combined.
    GrowHeuristically,
}

pub const SUGGESTED_FIRST_SEGMENT_WORDS: u32 = 1024;
pub const SUGGESTED_ALLOCATION_STRATEGY: AllocationStrategy = AllocationStrategy::GrowHeuristically;

impl HeapAllocator {
    pub fn new() -> HeapAllocator {
        HeapAllocator {
            next_size: SUGGESTED_FIRST_SEGMENT_WORDS,
            allocation_strategy: SUGGESTED_ALLOCATION_STRATEGY,
            max_segment_words: SEGMENT_WORD_LIMIT,
            total_words_limit: None,
            total_words_allocated: 0,
        }
    }

    /// Sets the size of the initial segment in words, where 1 word = 8 bytes.
    pub fn first_segment_words(mut self, value: u32) -> HeapAllocator {
        self.next_size = value;
        self
    }

    pub fn allocation_strategy(mut self, value: AllocationStrategy) -> HeapAllocator {
        self.allocation_strategy = value;
        self
    }

    /// Caps the size that heuristic growth will pick for new segments. A single allocation
    /// larger than this still gets a segment large enough to hold it.
    pub fn max_segment_words(mut self, value: u32) -> HeapAllocator {
        self.max_segment_words = value.min(SEGMENT_WORD_LIMIT);
        self
    }

    /// Caps the total number of words this allocator will hand out. Allocations past the cap
    /// fail with `ResourceExceeded`.
    pub fn total_words_limit(mut self, value: u64) -> HeapAllocator {
        self.total_words_limit = Some(value);
        self
    }
}

impl Default for HeapAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl Allocator for HeapAllocator {
    fn allocate_segment(&mut self, minimum_size: u32) -> Result<Vec<u8>> {
        let mut size = std::cmp::max(minimum_size, self.next_size);
        if let Some(limit) = self.total_words_limit {
            let remaining = limit.saturating_sub(self.total_words_allocated);
            if u64::from(minimum_size) > remaining {
                tracing::debug!(
                    minimum_size,
                    limit,
                    allocated = self.total_words_allocated,
                    "refusing allocation past the total size cap"
                );
                return Err(Error::from_kind_context(
                    ErrorKind::ResourceExceeded,
                    format!("message would exceed {limit} words"),
                ));
            }
            size = std::cmp::min(u64::from(size), remaining) as u32;
        }
        if size > SEGMENT_WORD_LIMIT {
            return Err(Error::from_kind_context(
                ErrorKind::ResourceExceeded,
                format!("segment of {size} words is too large"),
            ));
        }
        self.total_words_allocated += u64::from(size);

        if let AllocationStrategy::GrowHeuristically = self.allocation_strategy {
            self.next_size = self
                .next_size
                .saturating_add(size)
                .min(self.max_segment_words);
        }
        Ok(vec![0; size as usize * BYTES_PER_WORD])
    }
}

impl Builder<HeapAllocator> {
    pub fn new_default() -> Builder<HeapAllocator> {
        Builder::new(HeapAllocator::new())
    }
}

impl Default for Builder<HeapAllocator> {
    fn default() -> Self {
        Self::new_default()
    }
}

#[cfg(test)]
mod test {
    use super::{AllocationStrategy, Allocator, HeapAllocator, ReaderOptions};

    #[test]
    fn reader_options_setters() {
        let mut options = ReaderOptions::new();
        options.nesting_limit(7).traversal_limit_in_words(100);
        assert_eq!(options.nesting_limit, 7);
        assert_eq!(options.traversal_limit_in_words, 100);
        assert_eq!(ReaderOptions::default().traversal_limit_in_words, 8 * 1024 * 1024);
    }

    #[test]
    fn heap_allocator_growth() {
        let mut allocator = HeapAllocator::new().first_segment_words(16);
        assert_eq!(allocator.allocate_segment(1).unwrap().len(), 16 * 8);
        assert_eq!(allocator.allocate_segment(1).unwrap().len(), 32 * 8);
        assert_eq!(allocator.allocate_segment(100).unwrap().len(), 100 * 8);

        let mut fixed = HeapAllocator::new()
            .first_segment_words(16)
            .allocation_strategy(AllocationStrategy::FixedSize);
        assert_eq!(fixed.allocate_segment(1).unwrap().len(), 16 * 8);
        assert_eq!(fixed.allocate_segment(1).unwrap().len(), 16 * 8);
    }

    #[test]
    fn fixed_size_segments_only_grow_for_large_allocations() {
        let mut fixed = HeapAllocator::new()
            .first_segment_words(16)
            .allocation_strategy(AllocationStrategy::FixedSize);
        assert_eq!(fixed.allocate_segment(3).unwrap().len(), 16 * 8);
        assert_eq!(fixed.allocate_segment(40).unwrap().len(), 40 * 8);
        // A large allocation does not change the size of the ones after it.
        assert_eq!(fixed.allocate_segment(5).unwrap().len(), 16 * 8);
    }

    #[test]
    fn heap_allocator_max_segment_words() {
        let mut allocator = HeapAllocator::new()
            .first_segment_words(16)
            .max_segment_words(20);
        allocator.allocate_segment(1).unwrap();
        assert_eq!(allocator.allocate_segment(1).unwrap().len(), 20 * 8);
        assert_eq!(allocator.allocate_segment(50).unwrap().len(), 50 * 8);
    }
}
