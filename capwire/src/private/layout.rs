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

//! Wire pointers and the untyped reader/builder views over message segments.
//!
//! Readers and builders address their data by segment id and word position, paired with a
//! borrow of the arena that owns the segments. Every position taken from the wire is checked
//! through the arena before it is dereferenced.

use crate::private::arena::{BuilderArena, ReaderArena, SegmentId, NULL_ARENA};
use crate::private::capability::ClientHook;
use crate::private::primitive::Primitive;
use crate::private::units::*;
use crate::text;
use crate::{Error, ErrorKind, MessageSize, Result};

pub use self::ElementSize::{
    Bit, Byte, EightBytes, FourBytes, InlineComposite, Pointer, TwoBytes, Void,
};

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ElementSize {
    Void = 0,
    Bit = 1,
    Byte = 2,
    TwoBytes = 3,
    FourBytes = 4,
    EightBytes = 5,
    Pointer = 6,
    InlineComposite = 7,
}

impl ElementSize {
    fn from(val: u8) -> ElementSize {
        match val & 7 {
            0 => Void,
            1 => Bit,
            2 => Byte,
            3 => TwoBytes,
            4 => FourBytes,
            5 => EightBytes,
            6 => Pointer,
            _ => InlineComposite,
        }
    }

    pub fn data_bits_per_element(self) -> BitCount32 {
        match self {
            Void => 0,
            Bit => 1,
            Byte => 8,
            TwoBytes => 16,
            FourBytes => 32,
            EightBytes => 64,
            Pointer => 0,
            InlineComposite => 0,
        }
    }

    pub fn pointers_per_element(self) -> u32 {
        match self {
            Pointer => 1,
            _ => 0,
        }
    }
}

/// The element size used to store a list of `T`.
pub fn element_size_for<T: Primitive>() -> ElementSize {
    match T::BYTES {
        1 => Byte,
        2 => TwoBytes,
        4 => FourBytes,
        _ => EightBytes,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StructSize {
    pub data: WordCount16,
    pub pointers: WirePointerCount16,
}

impl StructSize {
    pub fn total(&self) -> WordCount32 {
        u32::from(self.data) + u32::from(self.pointers) * POINTER_SIZE_IN_WORDS
    }
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WirePointerKind {
    Struct = 0,
    List = 1,
    Far = 2,
    Other = 3,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PointerType {
    Null,
    Struct,
    List,
    Capability,
}

/// One decoded pointer word.
///
/// The low 32 bits hold the kind in bits 0..2 and a kind-specific offset above it. The high
/// 32 bits hold the struct size, the list element size and count, the far segment id, or the
/// capability index.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WirePointer {
    offset_and_kind: u32,
    upper32bits: u32,
}

impl WirePointer {
    pub fn from_bytes(bytes: &[u8]) -> WirePointer {
        WirePointer {
            offset_and_kind: <u32 as Primitive>::get(&bytes[0..4]),
            upper32bits: <u32 as Primitive>::get(&bytes[4..8]),
        }
    }

    pub fn to_bytes(self) -> [u8; 8] {
        let mut result = [0; 8];
        <u32 as Primitive>::set(&mut result[0..4], self.offset_and_kind);
        <u32 as Primitive>::set(&mut result[4..8], self.upper32bits);
        result
    }

    pub fn is_null(self) -> bool {
        self.offset_and_kind == 0 && self.upper32bits == 0
    }

    pub fn kind(self) -> WirePointerKind {
        match self.offset_and_kind & 3 {
            0 => WirePointerKind::Struct,
            1 => WirePointerKind::List,
            2 => WirePointerKind::Far,
            _ => WirePointerKind::Other,
        }
    }

    pub fn is_positional(self) -> bool {
        (self.offset_and_kind & 2) == 0 // match Struct and List but not Far and Other.
    }

    pub fn is_capability(self) -> bool {
        self.offset_and_kind == WirePointerKind::Other as u32
    }

    /// Signed offset, in words, from the end of the pointer to the start of its target.
    pub fn offset(self) -> i32 {
        (self.offset_and_kind as i32) >> 2
    }

    /// Word position of the target of a positional pointer stored at `pointer_pos`.
    pub fn target_from(self, pointer_pos: u32) -> i64 {
        i64::from(pointer_pos) + 1 + i64::from(self.offset())
    }

    pub fn set_kind_and_target(&mut self, kind: WirePointerKind, pointer_pos: u32, target_pos: u32) {
        let offset = i64::from(target_pos) - (i64::from(pointer_pos) + 1);
        self.offset_and_kind = ((offset as i32 as u32) << 2) | (kind as u32);
    }

    pub fn set_kind_with_zero_offset(&mut self, kind: WirePointerKind) {
        self.offset_and_kind = kind as u32;
    }

    pub fn set_kind_and_target_for_empty_struct(&mut self) {
        // An empty struct points at the word right before itself: offset -1.
        self.offset_and_kind = 0xfffffffc;
    }

    pub fn inline_composite_list_element_count(self) -> ElementCount32 {
        self.offset_and_kind >> 2
    }

    pub fn set_kind_and_inline_composite_list_element_count(
        &mut self,
        kind: WirePointerKind,
        element_count: ElementCount32,
    ) {
        self.offset_and_kind = (element_count << 2) | (kind as u32);
    }

    pub fn far_position_in_segment(self) -> WordCount32 {
        self.offset_and_kind >> 3
    }

    pub fn is_double_far(self) -> bool {
        ((self.offset_and_kind >> 2) & 1) != 0
    }

    pub fn set_far(&mut self, is_double_far: bool, pos: WordCount32) {
        self.offset_and_kind =
            (pos << 3) | (u32::from(is_double_far) << 2) | WirePointerKind::Far as u32;
    }

    pub fn far_segment_id(self) -> SegmentId {
        self.upper32bits
    }

    pub fn set_far_segment_id(&mut self, id: SegmentId) {
        self.upper32bits = id;
    }

    pub fn struct_data_size(self) -> WordCount16 {
        self.upper32bits as u16
    }

    pub fn struct_ptr_count(self) -> WirePointerCount16 {
        (self.upper32bits >> 16) as u16
    }

    pub fn struct_word_size(self) -> WordCount32 {
        u32::from(self.struct_data_size()) + u32::from(self.struct_ptr_count())
    }

    pub fn set_struct_size(&mut self, size: StructSize) {
        self.upper32bits = u32::from(size.data) | (u32::from(size.pointers) << 16);
    }

    pub fn list_element_size(self) -> ElementSize {
        ElementSize::from((self.upper32bits & 7) as u8)
    }

    pub fn list_element_count(self) -> ElementCount32 {
        self.upper32bits >> 3
    }

    pub fn list_inline_composite_word_count(self) -> WordCount32 {
        self.list_element_count()
    }

    pub fn set_list_size_and_count(&mut self, es: ElementSize, count: ElementCount32) {
        self.upper32bits = (count << 3) | es as u32;
    }

    pub fn set_list_inline_composite(&mut self, word_count: WordCount32) {
        self.upper32bits = (word_count << 3) | InlineComposite as u32;
    }

    pub fn cap_index(self) -> u32 {
        self.upper32bits
    }

    pub fn set_cap(&mut self, index: u32) {
        self.offset_and_kind = WirePointerKind::Other as u32;
        self.upper32bits = index;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct WordAddr {
    segment_id: SegmentId,
    pos: u32,
}

impl WordAddr {
    fn new(segment_id: SegmentId, pos: u32) -> Self {
        Self { segment_id, pos }
    }

    fn offset(self, words: u32) -> Self {
        Self::new(self.segment_id, self.pos + words)
    }
}

fn word_bytes(pos: u32, count: u32) -> std::ops::Range<usize> {
    let start = pos as usize * BYTES_PER_WORD;
    start..start + count as usize * BYTES_PER_WORD
}

mod wire_helpers {
    use super::*;

    fn out_of_bounds() -> Error {
        Error::from_kind(ErrorKind::MessageContainsOutOfBoundsPointer)
    }

    pub fn read_pointer(segment: &[u8], pos: u32) -> Result<WirePointer> {
        segment
            .get(word_bytes(pos, 1))
            .map(WirePointer::from_bytes)
            .ok_or_else(out_of_bounds)
    }

    pub fn words(segment: &[u8], pos: u32, count: u64) -> Result<&[u8]> {
        let start = pos as usize * BYTES_PER_WORD;
        let len = usize::try_from(count).map_err(|_| out_of_bounds())? * BYTES_PER_WORD;
        segment.get(start..start + len).ok_or_else(out_of_bounds)
    }

    fn target_pos(pointer: WirePointer, pointer_pos: u32) -> Result<u32> {
        u32::try_from(pointer.target_from(pointer_pos)).map_err(|_| out_of_bounds())
    }

    /// Where a pointer's object lives, after any far indirection: the pointer word that
    /// describes the object and the position of its content.
    pub struct Resolved<'a> {
        pub tag: WirePointer,
        pub segment_id: SegmentId,
        pub segment: &'a [u8],
        pub content: u32,
    }

    pub fn follow_fars<'a>(
        arena: &'a dyn ReaderArena,
        reff: WirePointer,
        ref_pos: u32,
        segment_id: SegmentId,
        segment: &'a [u8],
    ) -> Result<Resolved<'a>> {
        if reff.kind() != WirePointerKind::Far {
            return Ok(Resolved {
                tag: reff,
                segment_id,
                segment,
                content: target_pos(reff, ref_pos)?,
            });
        }

        let pad_segment_id = reff.far_segment_id();
        let pad_pos = reff.far_position_in_segment();
        let pad_words = if reff.is_double_far() { 2 } else { 1 };
        arena.contains_interval(pad_segment_id, i64::from(pad_pos), pad_words)?;
        let pad_segment = arena.get_segment(pad_segment_id)?;
        let pad = read_pointer(pad_segment, pad_pos)?;

        if !reff.is_double_far() {
            if pad.kind() == WirePointerKind::Far {
                return Err(Error::from_kind(ErrorKind::FarPointerLandingPadIsFar));
            }
            Ok(Resolved {
                tag: pad,
                segment_id: pad_segment_id,
                segment: pad_segment,
                content: target_pos(pad, pad_pos)?,
            })
        } else {
            // The first pad word is a plain far pointer to the content; the second word is
            // the tag describing it.
            if pad.kind() != WirePointerKind::Far || pad.is_double_far() {
                return Err(Error::from_kind(ErrorKind::MalformedDoubleFarPointer));
            }
            let tag = read_pointer(pad_segment, pad_pos + 1)?;
            let content_segment_id = pad.far_segment_id();
            Ok(Resolved {
                tag,
                segment_id: content_segment_id,
                segment: arena.get_segment(content_segment_id)?,
                content: pad.far_position_in_segment(),
            })
        }
    }

    pub fn read_struct_pointer<'a>(
        arena: &'a dyn ReaderArena,
        segment_id: SegmentId,
        segment: &'a [u8],
        ref_pos: u32,
        nesting_limit: i32,
    ) -> Result<StructReader<'a>> {
        let reff = read_pointer(segment, ref_pos)?;
        if reff.is_null() {
            return Ok(StructReader::new_default());
        }
        if nesting_limit <= 0 {
            return Err(Error::from_kind(ErrorKind::NestingLimitExceeded));
        }
        let r = follow_fars(arena, reff, ref_pos, segment_id, segment)?;
        if r.tag.kind() != WirePointerKind::Struct {
            return Err(Error::from_kind(ErrorKind::NotAStruct));
        }
        let data_words = u32::from(r.tag.struct_data_size());
        let pointer_count = r.tag.struct_ptr_count();
        arena.contains_interval(
            r.segment_id,
            i64::from(r.content),
            u64::from(r.tag.struct_word_size()),
        )?;
        Ok(StructReader {
            arena,
            segment_id: r.segment_id,
            segment: r.segment,
            data: words(r.segment, r.content, u64::from(data_words))?,
            data_size_bits: data_words * BITS_PER_WORD,
            pointers_start: r.content + data_words,
            pointer_count,
            nesting_limit: nesting_limit - 1,
        })
    }

    fn check_expected_size(
        expected: Option<ElementSize>,
        actual: ElementSize,
        data_bits: u32,
        pointer_count: u32,
    ) -> Result<()> {
        let expected = match expected {
            None | Some(Void) => return Ok(()),
            Some(expected) => expected,
        };
        let mismatch = |what: &str| {
            Err(Error::from_kind_context(
                ErrorKind::ListElementSizeMismatch,
                format!("found {actual:?} elements where {what} was expected"),
            ))
        };
        if (expected == Bit) != (actual == Bit) {
            return mismatch(if expected == Bit { "a bit list" } else { "a non-bit list" });
        }
        match expected {
            Void | Bit | InlineComposite => Ok(()),
            Pointer if pointer_count == 0 => mismatch("a pointer list"),
            Pointer => Ok(()),
            primitive if primitive.data_bits_per_element() > data_bits => {
                mismatch("a wider primitive list")
            }
            _ => Ok(()),
        }
    }

    pub fn read_list_pointer<'a>(
        arena: &'a dyn ReaderArena,
        segment_id: SegmentId,
        segment: &'a [u8],
        ref_pos: u32,
        expected: Option<ElementSize>,
        nesting_limit: i32,
    ) -> Result<ListReader<'a>> {
        let reff = read_pointer(segment, ref_pos)?;
        if reff.is_null() {
            return Ok(ListReader::new_default());
        }
        if nesting_limit <= 0 {
            return Err(Error::from_kind(ErrorKind::NestingLimitExceeded));
        }
        let r = follow_fars(arena, reff, ref_pos, segment_id, segment)?;
        if r.tag.kind() != WirePointerKind::List {
            return Err(Error::from_kind(ErrorKind::NotAList));
        }

        match r.tag.list_element_size() {
            InlineComposite => {
                let word_count = r.tag.list_inline_composite_word_count();
                arena.contains_interval(
                    r.segment_id,
                    i64::from(r.content),
                    u64::from(word_count) + 1,
                )?;
                let tag = read_pointer(r.segment, r.content)?;
                if tag.kind() != WirePointerKind::Struct {
                    return Err(Error::from_kind_context(
                        ErrorKind::MalformedInlineCompositeList,
                        "elements are not structs".to_string(),
                    ));
                }
                let size = tag.inline_composite_list_element_count();
                let data_words = u32::from(tag.struct_data_size());
                let pointer_count = tag.struct_ptr_count();
                let words_per_element = tag.struct_word_size();
                if u64::from(size) * u64::from(words_per_element) > u64::from(word_count) {
                    return Err(Error::from_kind_context(
                        ErrorKind::MalformedInlineCompositeList,
                        "elements overrun the list's word count".to_string(),
                    ));
                }
                if words_per_element == 0 {
                    arena.amplified_read(u64::from(size))?;
                }
                check_expected_size(
                    expected,
                    InlineComposite,
                    data_words * BITS_PER_WORD,
                    u32::from(pointer_count),
                )?;
                Ok(ListReader {
                    arena,
                    segment_id: r.segment_id,
                    segment: r.segment,
                    start_bit: u64::from(r.content + 1) * u64::from(BITS_PER_WORD),
                    element_count: size,
                    step_bits: words_per_element * BITS_PER_WORD,
                    struct_data_size_bits: data_words * BITS_PER_WORD,
                    struct_pointer_count: pointer_count,
                    element_size: InlineComposite,
                    nesting_limit: nesting_limit - 1,
                })
            }
            element_size => {
                let data_bits = element_size.data_bits_per_element();
                let pointer_count = element_size.pointers_per_element();
                let step = data_bits + pointer_count * BITS_PER_POINTER;
                let element_count = r.tag.list_element_count();
                let word_count =
                    round_bits_up_to_words(u64::from(element_count) * u64::from(step));
                arena.contains_interval(r.segment_id, i64::from(r.content), word_count)?;
                if element_size == Void {
                    arena.amplified_read(u64::from(element_count))?;
                }
                check_expected_size(expected, element_size, data_bits, pointer_count)?;
                Ok(ListReader {
                    arena,
                    segment_id: r.segment_id,
                    segment: r.segment,
                    start_bit: u64::from(r.content) * u64::from(BITS_PER_WORD),
                    element_count,
                    step_bits: step,
                    struct_data_size_bits: data_bits,
                    struct_pointer_count: pointer_count as u16,
                    element_size,
                    nesting_limit: nesting_limit - 1,
                })
            }
        }
    }

    fn read_byte_list<'a>(
        arena: &'a dyn ReaderArena,
        segment_id: SegmentId,
        segment: &'a [u8],
        ref_pos: u32,
        what: &str,
    ) -> Result<Option<&'a [u8]>> {
        let reff = read_pointer(segment, ref_pos)?;
        if reff.is_null() {
            return Ok(None);
        }
        let r = follow_fars(arena, reff, ref_pos, segment_id, segment)?;
        if r.tag.kind() != WirePointerKind::List {
            return Err(Error::from_kind_context(
                ErrorKind::NotAList,
                format!("found a non-list pointer where {what} was expected"),
            ));
        }
        if r.tag.list_element_size() != Byte {
            return Err(Error::from_kind_context(
                ErrorKind::ListElementSizeMismatch,
                format!("found a list of non-bytes where {what} was expected"),
            ));
        }
        let size = r.tag.list_element_count();
        arena.contains_interval(
            r.segment_id,
            i64::from(r.content),
            round_bytes_up_to_words(u64::from(size)),
        )?;
        let start = r.content as usize * BYTES_PER_WORD;
        r.segment
            .get(start..start + size as usize)
            .map(Some)
            .ok_or_else(out_of_bounds)
    }

    pub fn read_text_pointer<'a>(
        arena: &'a dyn ReaderArena,
        segment_id: SegmentId,
        segment: &'a [u8],
        ref_pos: u32,
    ) -> Result<Option<&'a str>> {
        let Some(bytes) = read_byte_list(arena, segment_id, segment, ref_pos, "text")? else {
            return Ok(None);
        };
        match bytes.split_last() {
            Some((0, text)) => Ok(Some(std::str::from_utf8(text)?)),
            _ => Err(Error::from_kind(ErrorKind::TextNotNulTerminated)),
        }
    }

    pub fn read_data_pointer<'a>(
        arena: &'a dyn ReaderArena,
        segment_id: SegmentId,
        segment: &'a [u8],
        ref_pos: u32,
    ) -> Result<Option<&'a [u8]>> {
        read_byte_list(arena, segment_id, segment, ref_pos, "data")
    }

    pub fn read_capability_pointer(
        arena: &dyn ReaderArena,
        segment: &[u8],
        ref_pos: u32,
    ) -> Result<Box<dyn ClientHook>> {
        let reff = read_pointer(segment, ref_pos)?;
        if reff.is_null() {
            Err(Error::from_kind(ErrorKind::MessageContainsNullCapabilityPointer))
        } else if !reff.is_capability() {
            Err(Error::from_kind(ErrorKind::NotACapability))
        } else {
            arena.extract_cap(reff.cap_index())
        }
    }

    // Builder-side helpers. Builder pointers are always written by this module, so their
    // targets are trusted to be in bounds.

    fn get_ptr(arena: &dyn BuilderArena, at: WordAddr) -> WirePointer {
        WirePointer::from_bytes(&arena.get_segment_ref(at.segment_id)[word_bytes(at.pos, 1)])
    }

    fn set_ptr(arena: &mut dyn BuilderArena, at: WordAddr, value: WirePointer) {
        arena.get_segment_mut(at.segment_id)[word_bytes(at.pos, 1)]
            .copy_from_slice(&value.to_bytes());
    }

    fn update_ptr(arena: &mut dyn BuilderArena, at: WordAddr, f: impl FnOnce(&mut WirePointer)) {
        let mut value = get_ptr(arena, at);
        f(&mut value);
        set_ptr(arena, at, value);
    }

    fn zero_words(arena: &mut dyn BuilderArena, at: WordAddr, count: u32) {
        arena.get_segment_mut(at.segment_id)[word_bytes(at.pos, count)].fill(0);
    }

    fn copy_words(arena: &mut dyn BuilderArena, from: WordAddr, to: WordAddr, count: u32) {
        let bytes = arena.get_segment_ref(from.segment_id)[word_bytes(from.pos, count)].to_vec();
        arena.get_segment_mut(to.segment_id)[word_bytes(to.pos, count)].copy_from_slice(&bytes);
    }

    fn builder_target(reff: WirePointer, at: WordAddr) -> WordAddr {
        WordAddr::new(at.segment_id, reff.target_from(at.pos) as u32)
    }

    /// Allocates space for an object and points `reff` at it, landing through a far pointer
    /// if the object has to go in another segment. On return `reff` addresses the pointer
    /// word that actually describes the object, so the caller can fill in its size.
    pub(super) fn allocate(
        arena: &mut dyn BuilderArena,
        reff: &mut WordAddr,
        amount: WordCount32,
        kind: WirePointerKind,
    ) -> Result<WordAddr> {
        if !get_ptr(arena, *reff).is_null() {
            zero_object(arena, *reff);
        }

        if amount == 0 && kind == WirePointerKind::Struct {
            let mut p = WirePointer::default();
            p.set_kind_and_target_for_empty_struct();
            set_ptr(arena, *reff, p);
            return Ok(*reff);
        }

        match arena.allocate(reff.segment_id, amount) {
            Some(pos) => {
                let mut p = WirePointer::default();
                p.set_kind_and_target(kind, reff.pos, pos);
                set_ptr(arena, *reff, p);
                Ok(WordAddr::new(reff.segment_id, pos))
            }
            None => {
                // Allocate the object together with a one-word landing pad in front of it.
                let amount_plus_ref = amount.checked_add(POINTER_SIZE_IN_WORDS).ok_or_else(|| {
                    Error::from_kind(ErrorKind::ResourceExceeded)
                })?;
                let (segment_id, pos) = arena.allocate_anywhere(amount_plus_ref)?;
                let mut far = WirePointer::default();
                far.set_far(false, pos);
                far.set_far_segment_id(segment_id);
                set_ptr(arena, *reff, far);

                *reff = WordAddr::new(segment_id, pos);
                let mut pad = WirePointer::default();
                pad.set_kind_and_target(kind, pos, pos + 1);
                set_ptr(arena, *reff, pad);
                Ok(WordAddr::new(segment_id, pos + 1))
            }
        }
    }

    /// Returns the tag describing the object `reff` points to and the address of its content.
    fn follow_builder_fars(arena: &dyn BuilderArena, reff: WordAddr) -> (WirePointer, WordAddr) {
        let p = get_ptr(arena, reff);
        if p.kind() != WirePointerKind::Far {
            return (p, builder_target(p, reff));
        }
        let pad_addr = WordAddr::new(p.far_segment_id(), p.far_position_in_segment());
        let pad = get_ptr(arena, pad_addr);
        if !p.is_double_far() {
            (pad, builder_target(pad, pad_addr))
        } else {
            let tag = get_ptr(arena, pad_addr.offset(1));
            (
                tag,
                WordAddr::new(pad.far_segment_id(), pad.far_position_in_segment()),
            )
        }
    }

    /// Zeroes the object `reff` points to, recursively, along with any landing pads. The
    /// pointer word itself is left alone.
    pub(super) fn zero_object(arena: &mut dyn BuilderArena, reff: WordAddr) {
        let p = get_ptr(arena, reff);
        if p.is_null() {
            return;
        }
        match p.kind() {
            WirePointerKind::Struct | WirePointerKind::List => {
                zero_object_helper(arena, p, builder_target(p, reff));
            }
            WirePointerKind::Far => {
                let pad_addr = WordAddr::new(p.far_segment_id(), p.far_position_in_segment());
                if p.is_double_far() {
                    let pad = get_ptr(arena, pad_addr);
                    let tag = get_ptr(arena, pad_addr.offset(1));
                    let content =
                        WordAddr::new(pad.far_segment_id(), pad.far_position_in_segment());
                    zero_object_helper(arena, tag, content);
                    zero_words(arena, pad_addr, 2);
                } else {
                    zero_object(arena, pad_addr);
                    zero_words(arena, pad_addr, 1);
                }
            }
            WirePointerKind::Other => {
                if p.is_capability() {
                    arena.drop_cap(p.cap_index());
                }
            }
        }
    }

    fn zero_object_helper(arena: &mut dyn BuilderArena, tag: WirePointer, content: WordAddr) {
        match tag.kind() {
            WirePointerKind::Struct => {
                let data_words = u32::from(tag.struct_data_size());
                for i in 0..u32::from(tag.struct_ptr_count()) {
                    zero_object(arena, content.offset(data_words + i));
                }
                zero_words(arena, content, tag.struct_word_size());
            }
            WirePointerKind::List => match tag.list_element_size() {
                Void => {}
                Pointer => {
                    let count = tag.list_element_count();
                    for i in 0..count {
                        zero_object(arena, content.offset(i));
                    }
                    zero_words(arena, content, count);
                }
                InlineComposite => {
                    let element_tag = get_ptr(arena, content);
                    let data_words = u32::from(element_tag.struct_data_size());
                    let pointer_count = u32::from(element_tag.struct_ptr_count());
                    if pointer_count > 0 {
                        let mut pos = 1;
                        for _ in 0..element_tag.inline_composite_list_element_count() {
                            pos += data_words;
                            for _ in 0..pointer_count {
                                zero_object(arena, content.offset(pos));
                                pos += 1;
                            }
                        }
                    }
                    zero_words(arena, content, tag.list_inline_composite_word_count() + 1);
                }
                primitive => {
                    let bits = u64::from(tag.list_element_count())
                        * u64::from(primitive.data_bits_per_element());
                    zero_words(arena, content, round_bits_up_to_words(bits) as u32);
                }
            },
            WirePointerKind::Far | WirePointerKind::Other => {
                tracing::debug!("ignoring malformed tag while zeroing an object");
            }
        }
    }

    /// Clears a pointer along with its far landing pads, leaving the object it described in
    /// place.
    fn zero_pointer_and_fars(arena: &mut dyn BuilderArena, reff: WordAddr) {
        let p = get_ptr(arena, reff);
        if p.kind() == WirePointerKind::Far {
            let pad_words = if p.is_double_far() { 2 } else { 1 };
            zero_words(
                arena,
                WordAddr::new(p.far_segment_id(), p.far_position_in_segment()),
                pad_words,
            );
        }
        zero_words(arena, reff, 1);
    }

    /// Moves the pointer at `src` to `dst`, re-encoding it relative to its new position.
    fn transfer_pointer(arena: &mut dyn BuilderArena, dst: WordAddr, src: WordAddr) -> Result<()> {
        let src_ptr = get_ptr(arena, src);
        if src_ptr.is_null() {
            set_ptr(arena, dst, WirePointer::default());
            Ok(())
        } else if !src_ptr.is_positional() {
            // Far and capability pointers are position independent.
            set_ptr(arena, dst, src_ptr);
            Ok(())
        } else {
            transfer_pointer_split(arena, dst, src_ptr, builder_target(src_ptr, src))
        }
    }

    fn transfer_pointer_split(
        arena: &mut dyn BuilderArena,
        dst: WordAddr,
        src_tag: WirePointer,
        content: WordAddr,
    ) -> Result<()> {
        let kind = src_tag.kind();
        if kind == WirePointerKind::Struct && src_tag.struct_word_size() == 0 {
            let mut p = src_tag;
            p.set_kind_and_target_for_empty_struct();
            set_ptr(arena, dst, p);
            return Ok(());
        }
        if dst.segment_id == content.segment_id {
            let mut p = src_tag;
            p.set_kind_and_target(kind, dst.pos, content.pos);
            set_ptr(arena, dst, p);
            return Ok(());
        }

        let mut far = WirePointer::default();
        match arena.allocate(content.segment_id, 1) {
            Some(pad_pos) => {
                let mut pad = src_tag;
                pad.set_kind_and_target(kind, pad_pos, content.pos);
                set_ptr(arena, WordAddr::new(content.segment_id, pad_pos), pad);
                far.set_far(false, pad_pos);
                far.set_far_segment_id(content.segment_id);
            }
            None => {
                // No room for a pad next to the content; use a double-far pad elsewhere.
                let (pad_segment_id, pad_pos) = arena.allocate_anywhere(2)?;
                let pad_addr = WordAddr::new(pad_segment_id, pad_pos);
                let mut pad = WirePointer::default();
                pad.set_far(false, content.pos);
                pad.set_far_segment_id(content.segment_id);
                set_ptr(arena, pad_addr, pad);
                let mut tag = src_tag;
                tag.set_kind_with_zero_offset(kind);
                set_ptr(arena, pad_addr.offset(1), tag);
                far.set_far(true, pad_pos);
                far.set_far_segment_id(pad_segment_id);
            }
        }
        set_ptr(arena, dst, far);
        Ok(())
    }

    pub fn init_struct_pointer<'a>(
        arena: &'a mut dyn BuilderArena,
        mut reff: WordAddr,
        size: StructSize,
    ) -> Result<StructBuilder<'a>> {
        let content = allocate(arena, &mut reff, size.total(), WirePointerKind::Struct)?;
        update_ptr(arena, reff, |p| p.set_struct_size(size));
        Ok(StructBuilder::at(arena, content, size))
    }

    pub fn get_writable_struct_pointer<'a>(
        arena: &'a mut dyn BuilderArena,
        reff: WordAddr,
        size: StructSize,
    ) -> Result<StructBuilder<'a>> {
        if get_ptr(arena, reff).is_null() {
            return init_struct_pointer(arena, reff, size);
        }
        let (tag, old) = follow_builder_fars(arena, reff);
        if tag.kind() != WirePointerKind::Struct {
            return Err(Error::from_kind(ErrorKind::NotAStruct));
        }
        let old_size = StructSize {
            data: tag.struct_data_size(),
            pointers: tag.struct_ptr_count(),
        };
        if old_size.data >= size.data && old_size.pointers >= size.pointers {
            return Ok(StructBuilder::at(arena, old, old_size));
        }

        // The existing allocation is too small; move it somewhere bigger.
        let new_size = StructSize {
            data: old_size.data.max(size.data),
            pointers: old_size.pointers.max(size.pointers),
        };
        zero_pointer_and_fars(arena, reff);
        let mut new_reff = reff;
        let new = allocate(arena, &mut new_reff, new_size.total(), WirePointerKind::Struct)?;
        update_ptr(arena, new_reff, |p| p.set_struct_size(new_size));

        copy_words(arena, old, new, u32::from(old_size.data));
        for i in 0..u32::from(old_size.pointers) {
            transfer_pointer(
                arena,
                new.offset(u32::from(new_size.data) + i),
                old.offset(u32::from(old_size.data) + i),
            )?;
        }
        zero_words(arena, old, old_size.total());
        tracing::trace!(
            old_words = old_size.total(),
            new_words = new_size.total(),
            "grew struct in place of a smaller one"
        );
        Ok(StructBuilder::at(arena, new, new_size))
    }

    pub fn init_list_pointer<'a>(
        arena: &'a mut dyn BuilderArena,
        mut reff: WordAddr,
        element_count: ElementCount32,
        element_size: ElementSize,
    ) -> Result<ListBuilder<'a>> {
        debug_assert!(element_size != InlineComposite, "use init_struct_list_pointer()");
        check_list_length(element_count)?;
        let data_bits = element_size.data_bits_per_element();
        let pointer_count = element_size.pointers_per_element();
        let step = data_bits + pointer_count * BITS_PER_POINTER;
        let word_count = round_bits_up_to_words(u64::from(element_count) * u64::from(step));
        let word_count = checked_word_count(word_count)?;
        let content = allocate(arena, &mut reff, word_count, WirePointerKind::List)?;
        update_ptr(arena, reff, |p| p.set_list_size_and_count(element_size, element_count));
        Ok(ListBuilder {
            arena,
            segment_id: content.segment_id,
            start: content.pos,
            element_count,
            step_bits: step,
            struct_data_size_bits: data_bits,
            struct_pointer_count: pointer_count as u16,
            element_size,
        })
    }

    pub fn init_struct_list_pointer<'a>(
        arena: &'a mut dyn BuilderArena,
        mut reff: WordAddr,
        element_count: ElementCount32,
        element_size: StructSize,
    ) -> Result<ListBuilder<'a>> {
        check_list_length(element_count)?;
        let words_per_element = element_size.total();
        let word_count =
            checked_word_count(u64::from(element_count) * u64::from(words_per_element))?;
        let content = allocate(
            arena,
            &mut reff,
            word_count + POINTER_SIZE_IN_WORDS,
            WirePointerKind::List,
        )?;
        update_ptr(arena, reff, |p| p.set_list_inline_composite(word_count));
        let mut tag = WirePointer::default();
        tag.set_kind_and_inline_composite_list_element_count(
            WirePointerKind::Struct,
            element_count,
        );
        tag.set_struct_size(element_size);
        set_ptr(arena, content, tag);
        Ok(ListBuilder {
            arena,
            segment_id: content.segment_id,
            start: content.pos + 1,
            element_count,
            step_bits: words_per_element * BITS_PER_WORD,
            struct_data_size_bits: u32::from(element_size.data) * BITS_PER_WORD,
            struct_pointer_count: element_size.pointers,
            element_size: InlineComposite,
        })
    }

    fn check_list_length(element_count: ElementCount32) -> Result<()> {
        if element_count > LIST_ELEMENT_COUNT_LIMIT {
            Err(Error::from_kind_context(
                ErrorKind::ResourceExceeded,
                format!("list of {element_count} elements is too long"),
            ))
        } else {
            Ok(())
        }
    }

    fn checked_word_count(words: u64) -> Result<u32> {
        if words > u64::from(SEGMENT_WORD_LIMIT) {
            Err(Error::from_kind_context(
                ErrorKind::ResourceExceeded,
                format!("object of {words} words is too large"),
            ))
        } else {
            Ok(words as u32)
        }
    }

    pub fn get_writable_list_pointer<'a>(
        arena: &'a mut dyn BuilderArena,
        reff: WordAddr,
        element_size: ElementSize,
    ) -> Result<ListBuilder<'a>> {
        if get_ptr(arena, reff).is_null() {
            return Ok(ListBuilder::new_empty(arena, reff.segment_id, element_size));
        }
        let (tag, content) = follow_builder_fars(arena, reff);
        if tag.kind() != WirePointerKind::List {
            return Err(Error::from_kind(ErrorKind::NotAList));
        }
        let old_size = tag.list_element_size();
        if old_size == InlineComposite {
            let element_tag = get_ptr(arena, content);
            let data_bits = u32::from(element_tag.struct_data_size()) * BITS_PER_WORD;
            let pointer_count = element_tag.struct_ptr_count();
            check_expected_size(
                Some(element_size),
                InlineComposite,
                data_bits,
                u32::from(pointer_count),
            )?;
            Ok(ListBuilder {
                arena,
                segment_id: content.segment_id,
                start: content.pos + 1,
                element_count: element_tag.inline_composite_list_element_count(),
                step_bits: element_tag.struct_word_size() * BITS_PER_WORD,
                struct_data_size_bits: data_bits,
                struct_pointer_count: pointer_count,
                element_size: InlineComposite,
            })
        } else {
            let data_bits = old_size.data_bits_per_element();
            let pointer_count = old_size.pointers_per_element();
            if element_size == InlineComposite {
                return Err(Error::from_kind_context(
                    ErrorKind::ListElementSizeMismatch,
                    "found a primitive list where a struct list was expected".to_string(),
                ));
            }
            check_expected_size(Some(element_size), old_size, data_bits, pointer_count)?;
            Ok(ListBuilder {
                arena,
                segment_id: content.segment_id,
                start: content.pos,
                element_count: tag.list_element_count(),
                step_bits: data_bits + pointer_count * BITS_PER_POINTER,
                struct_data_size_bits: data_bits,
                struct_pointer_count: pointer_count as u16,
                element_size: old_size,
            })
        }
    }

    pub fn get_writable_struct_list_pointer<'a>(
        arena: &'a mut dyn BuilderArena,
        reff: WordAddr,
        element_size: StructSize,
    ) -> Result<ListBuilder<'a>> {
        if get_ptr(arena, reff).is_null() {
            let mut empty = ListBuilder::new_empty(arena, reff.segment_id, InlineComposite);
            empty.struct_data_size_bits = u32::from(element_size.data) * BITS_PER_WORD;
            empty.struct_pointer_count = element_size.pointers;
            return Ok(empty);
        }
        let list = get_writable_list_pointer(arena, reff, InlineComposite)?;
        if list.struct_data_size_bits < u32::from(element_size.data) * BITS_PER_WORD
            || list.struct_pointer_count < element_size.pointers
        {
            return Err(Error::from_kind_context(
                ErrorKind::ListElementSizeMismatch,
                "existing struct list elements are smaller than requested".to_string(),
            ));
        }
        Ok(list)
    }

    pub fn init_text_pointer<'a>(
        arena: &'a mut dyn BuilderArena,
        reff: WordAddr,
        size: ByteCount32,
    ) -> Result<text::Builder<'a>> {
        // Allocate one extra byte for the NUL terminator.
        let list = init_list_pointer(arena, reff, size.saturating_add(1), Byte)?;
        let bytes = list.into_raw_bytes_mut();
        Ok(text::Builder::new(&mut bytes[..size as usize]))
    }

    pub fn set_text_pointer<'a>(
        arena: &'a mut dyn BuilderArena,
        reff: WordAddr,
        value: &str,
    ) -> Result<text::Builder<'a>> {
        let size = u32::try_from(value.len()).map_err(|_| {
            Error::from_kind_context(ErrorKind::ResourceExceeded, "text too long".to_string())
        })?;
        let mut builder = init_text_pointer(arena, reff, size)?;
        builder.push_str(value);
        Ok(builder)
    }

    pub fn get_writable_text_pointer<'a>(
        arena: &'a mut dyn BuilderArena,
        reff: WordAddr,
    ) -> Result<text::Builder<'a>> {
        if get_ptr(arena, reff).is_null() {
            return Ok(text::Builder::new(&mut []));
        }
        let list = get_writable_list_pointer(arena, reff, Byte)?;
        if list.element_size != Byte {
            return Err(Error::from_kind(ErrorKind::ListElementSizeMismatch));
        }
        let bytes = list.into_raw_bytes_mut();
        match bytes.split_last_mut() {
            Some((0, text)) => Ok(text::Builder::with_pos(text)),
            _ => Err(Error::from_kind(ErrorKind::TextNotNulTerminated)),
        }
    }

    pub fn init_data_pointer<'a>(
        arena: &'a mut dyn BuilderArena,
        reff: WordAddr,
        size: ByteCount32,
    ) -> Result<&'a mut [u8]> {
        Ok(init_list_pointer(arena, reff, size, Byte)?.into_raw_bytes_mut())
    }

    pub fn set_data_pointer<'a>(
        arena: &'a mut dyn BuilderArena,
        reff: WordAddr,
        value: &[u8],
    ) -> Result<&'a mut [u8]> {
        let size = u32::try_from(value.len()).map_err(|_| {
            Error::from_kind_context(ErrorKind::ResourceExceeded, "data too long".to_string())
        })?;
        let bytes = init_data_pointer(arena, reff, size)?;
        bytes.copy_from_slice(value);
        Ok(bytes)
    }

    pub fn get_writable_data_pointer<'a>(
        arena: &'a mut dyn BuilderArena,
        reff: WordAddr,
    ) -> Result<&'a mut [u8]> {
        if get_ptr(arena, reff).is_null() {
            return Ok(&mut []);
        }
        let list = get_writable_list_pointer(arena, reff, Byte)?;
        if list.element_size != Byte {
            return Err(Error::from_kind(ErrorKind::ListElementSizeMismatch));
        }
        Ok(list.into_raw_bytes_mut())
    }

    pub fn set_capability_pointer(
        arena: &mut dyn BuilderArena,
        reff: WordAddr,
        cap: Box<dyn ClientHook>,
    ) {
        if !get_ptr(arena, reff).is_null() {
            zero_object(arena, reff);
        }
        let index = arena.inject_cap(cap);
        let mut p = WirePointer::default();
        p.set_cap(index);
        set_ptr(arena, reff, p);
    }

    pub fn clear_pointer(arena: &mut dyn BuilderArena, reff: WordAddr) {
        zero_object(arena, reff);
        zero_pointer_and_fars(arena, reff);
    }

    pub fn set_struct_pointer(
        arena: &mut dyn BuilderArena,
        reff: WordAddr,
        value: &StructReader<'_>,
    ) -> Result<()> {
        let size = StructSize {
            data: round_bits_up_to_words(u64::from(value.data_size_bits)) as u16,
            pointers: value.pointer_count,
        };
        let mut builder = init_struct_pointer(arena, reff, size)?;
        builder.copy_content_from(value)
    }

    pub fn set_list_pointer(
        arena: &mut dyn BuilderArena,
        reff: WordAddr,
        value: &ListReader<'_>,
    ) -> Result<()> {
        let count = value.element_count;
        match value.element_size {
            InlineComposite => {
                let size = StructSize {
                    data: (value.struct_data_size_bits / BITS_PER_WORD) as u16,
                    pointers: value.struct_pointer_count,
                };
                let mut list = init_struct_list_pointer(arena, reff, count, size)?;
                for i in 0..count {
                    list.reborrow()
                        .get_struct_element(i)
                        .copy_content_from(&value.get_struct_element(i))?;
                }
            }
            Pointer => {
                let mut list = init_list_pointer(arena, reff, count, Pointer)?;
                for i in 0..count {
                    list.reborrow()
                        .get_pointer_element(i)
                        .copy_from(value.get_pointer_element(i))?;
                }
            }
            primitive => {
                let list = init_list_pointer(arena, reff, count, primitive)?;
                let bytes = list.into_raw_bytes_mut();
                bytes.copy_from_slice(value.raw_bytes()?);
            }
        }
        Ok(())
    }

    pub fn copy_pointer(
        arena: &mut dyn BuilderArena,
        dst: WordAddr,
        src: &PointerReader<'_>,
    ) -> Result<()> {
        match src.get_pointer_type()? {
            PointerType::Null => {
                clear_pointer(arena, dst);
                Ok(())
            }
            PointerType::Struct => set_struct_pointer(arena, dst, &src.get_struct()?),
            PointerType::List => set_list_pointer(arena, dst, &src.get_list(None)?),
            PointerType::Capability => {
                set_capability_pointer(arena, dst, src.get_capability()?);
                Ok(())
            }
        }
    }
}

#[derive(Clone, Copy)]
pub struct PointerReader<'a> {
    arena: &'a dyn ReaderArena,
    segment_id: SegmentId,
    segment: &'a [u8],
    pos: Option<u32>,
    nesting_limit: i32,
}

impl<'a> PointerReader<'a> {
    pub fn new_default<'b>() -> PointerReader<'b> {
        PointerReader {
            arena: &NULL_ARENA,
            segment_id: 0,
            segment: &[],
            pos: None,
            nesting_limit: 0x7fffffff,
        }
    }

    pub fn get_root(
        arena: &'a dyn ReaderArena,
        segment_id: SegmentId,
        pos: u32,
        nesting_limit: i32,
    ) -> Result<Self> {
        arena.contains_interval(segment_id, i64::from(pos), u64::from(POINTER_SIZE_IN_WORDS))?;
        Ok(PointerReader {
            arena,
            segment_id,
            segment: arena.get_segment(segment_id)?,
            pos: Some(pos),
            nesting_limit,
        })
    }

    pub fn is_null(&self) -> bool {
        match self.pos {
            None => true,
            Some(pos) => wire_helpers::read_pointer(self.segment, pos)
                .map(WirePointer::is_null)
                .unwrap_or(true),
        }
    }

    pub fn get_pointer_type(&self) -> Result<PointerType> {
        let Some(pos) = self.pos else {
            return Ok(PointerType::Null);
        };
        let reff = wire_helpers::read_pointer(self.segment, pos)?;
        if reff.is_null() {
            return Ok(PointerType::Null);
        }
        match reff.kind() {
            WirePointerKind::Struct => Ok(PointerType::Struct),
            WirePointerKind::List => Ok(PointerType::List),
            WirePointerKind::Other if reff.is_capability() => Ok(PointerType::Capability),
            WirePointerKind::Other => Err(Error::failed("unknown pointer type".to_string())),
            WirePointerKind::Far => {
                let r = wire_helpers::follow_fars(
                    self.arena,
                    reff,
                    pos,
                    self.segment_id,
                    self.segment,
                )?;
                match r.tag.kind() {
                    WirePointerKind::Struct => Ok(PointerType::Struct),
                    WirePointerKind::List => Ok(PointerType::List),
                    _ => Err(Error::failed(
                        "far pointer leads to a non-positional pointer".to_string(),
                    )),
                }
            }
        }
    }

    pub fn get_struct(&self) -> Result<StructReader<'a>> {
        match self.pos {
            None => Ok(StructReader::new_default()),
            Some(pos) => wire_helpers::read_struct_pointer(
                self.arena,
                self.segment_id,
                self.segment,
                pos,
                self.nesting_limit,
            ),
        }
    }

    /// Reads a list. `expected` is the element size the caller intends to read the elements
    /// as; `None` accepts any list.
    pub fn get_list(&self, expected: Option<ElementSize>) -> Result<ListReader<'a>> {
        match self.pos {
            None => Ok(ListReader::new_default()),
            Some(pos) => wire_helpers::read_list_pointer(
                self.arena,
                self.segment_id,
                self.segment,
                pos,
                expected,
                self.nesting_limit,
            ),
        }
    }

    /// Returns `None` for a null pointer, so that the caller can apply a default.
    pub fn get_text(&self) -> Result<Option<&'a str>> {
        match self.pos {
            None => Ok(None),
            Some(pos) => {
                wire_helpers::read_text_pointer(self.arena, self.segment_id, self.segment, pos)
            }
        }
    }

    /// Returns `None` for a null pointer, so that the caller can apply a default.
    pub fn get_data(&self) -> Result<Option<&'a [u8]>> {
        match self.pos {
            None => Ok(None),
            Some(pos) => {
                wire_helpers::read_data_pointer(self.arena, self.segment_id, self.segment, pos)
            }
        }
    }

    pub fn get_capability(&self) -> Result<Box<dyn ClientHook>> {
        match self.pos {
            None => Err(Error::from_kind(ErrorKind::MessageContainsNullCapabilityPointer)),
            Some(pos) => wire_helpers::read_capability_pointer(self.arena, self.segment, pos),
        }
    }

    pub fn total_size(&self) -> Result<MessageSize> {
        let mut result = MessageSize::default();
        match self.get_pointer_type()? {
            PointerType::Null => {}
            PointerType::Capability => result.cap_count += 1,
            PointerType::Struct => result += self.get_struct()?.total_size()?,
            PointerType::List => result += self.get_list(None)?.total_size()?,
        }
        Ok(result)
    }
}

pub struct PointerBuilder<'a> {
    arena: &'a mut dyn BuilderArena,
    segment_id: SegmentId,
    pos: u32,
}

impl<'a> PointerBuilder<'a> {
    pub fn get_root(arena: &'a mut dyn BuilderArena, segment_id: SegmentId, pos: u32) -> Self {
        PointerBuilder {
            arena,
            segment_id,
            pos,
        }
    }

    pub fn reborrow(&mut self) -> PointerBuilder<'_> {
        PointerBuilder {
            arena: &mut *self.arena,
            segment_id: self.segment_id,
            pos: self.pos,
        }
    }

    fn addr(&self) -> WordAddr {
        WordAddr::new(self.segment_id, self.pos)
    }

    pub fn is_null(&self) -> bool {
        self.as_reader().is_null()
    }

    pub fn as_reader(&self) -> PointerReader<'_> {
        PointerReader {
            arena: self.arena.as_reader(),
            segment_id: self.segment_id,
            segment: self.arena.get_segment_ref(self.segment_id),
            pos: Some(self.pos),
            nesting_limit: 0x7fffffff,
        }
    }

    pub fn into_reader(self) -> PointerReader<'a> {
        let arena: &'a dyn BuilderArena = self.arena;
        PointerReader {
            arena: arena.as_reader(),
            segment_id: self.segment_id,
            segment: arena.get_segment_ref(self.segment_id),
            pos: Some(self.pos),
            nesting_limit: 0x7fffffff,
        }
    }

    /// Gets the struct this pointer points to, initializing it if the pointer is null and
    /// moving it if its current allocation is smaller than `size`.
    pub fn get_struct(self, size: StructSize) -> Result<StructBuilder<'a>> {
        let addr = self.addr();
        wire_helpers::get_writable_struct_pointer(self.arena, addr, size)
    }

    pub fn get_list(self, element_size: ElementSize) -> Result<ListBuilder<'a>> {
        let addr = self.addr();
        wire_helpers::get_writable_list_pointer(self.arena, addr, element_size)
    }

    pub fn get_struct_list(self, element_size: StructSize) -> Result<ListBuilder<'a>> {
        let addr = self.addr();
        wire_helpers::get_writable_struct_list_pointer(self.arena, addr, element_size)
    }

    pub fn get_text(self) -> Result<text::Builder<'a>> {
        let addr = self.addr();
        wire_helpers::get_writable_text_pointer(self.arena, addr)
    }

    pub fn get_data(self) -> Result<&'a mut [u8]> {
        let addr = self.addr();
        wire_helpers::get_writable_data_pointer(self.arena, addr)
    }

    pub fn get_capability(&self) -> Result<Box<dyn ClientHook>> {
        wire_helpers::read_capability_pointer(
            self.arena.as_reader(),
            self.arena.get_segment_ref(self.segment_id),
            self.pos,
        )
    }

    pub fn init_struct(self, size: StructSize) -> Result<StructBuilder<'a>> {
        let addr = self.addr();
        wire_helpers::init_struct_pointer(self.arena, addr, size)
    }

    pub fn init_list(
        self,
        element_size: ElementSize,
        element_count: ElementCount32,
    ) -> Result<ListBuilder<'a>> {
        let addr = self.addr();
        wire_helpers::init_list_pointer(self.arena, addr, element_count, element_size)
    }

    pub fn init_struct_list(
        self,
        element_count: ElementCount32,
        element_size: StructSize,
    ) -> Result<ListBuilder<'a>> {
        let addr = self.addr();
        wire_helpers::init_struct_list_pointer(self.arena, addr, element_count, element_size)
    }

    pub fn init_text(self, size: ByteCount32) -> Result<text::Builder<'a>> {
        let addr = self.addr();
        wire_helpers::init_text_pointer(self.arena, addr, size)
    }

    pub fn init_data(self, size: ByteCount32) -> Result<&'a mut [u8]> {
        let addr = self.addr();
        wire_helpers::init_data_pointer(self.arena, addr, size)
    }

    pub fn set_struct(&mut self, value: &StructReader<'_>) -> Result<()> {
        let addr = self.addr();
        wire_helpers::set_struct_pointer(&mut *self.arena, addr, value)
    }

    pub fn set_list(&mut self, value: &ListReader<'_>) -> Result<()> {
        let addr = self.addr();
        wire_helpers::set_list_pointer(&mut *self.arena, addr, value)
    }

    pub fn set_text(&mut self, value: &str) -> Result<()> {
        let addr = self.addr();
        wire_helpers::set_text_pointer(&mut *self.arena, addr, value).map(|_| ())
    }

    pub fn set_data(&mut self, value: &[u8]) -> Result<()> {
        let addr = self.addr();
        wire_helpers::set_data_pointer(&mut *self.arena, addr, value).map(|_| ())
    }

    pub fn set_capability(&mut self, cap: Box<dyn ClientHook>) {
        let addr = self.addr();
        wire_helpers::set_capability_pointer(&mut *self.arena, addr, cap)
    }

    /// Deep-copies whatever `other` points to into this pointer's message.
    pub fn copy_from(&mut self, other: PointerReader<'_>) -> Result<()> {
        let addr = self.addr();
        wire_helpers::copy_pointer(&mut *self.arena, addr, &other)
    }

    pub fn clear(&mut self) {
        let addr = self.addr();
        wire_helpers::clear_pointer(&mut *self.arena, addr)
    }
}

#[derive(Clone, Copy)]
pub struct StructReader<'a> {
    arena: &'a dyn ReaderArena,
    segment_id: SegmentId,
    segment: &'a [u8],
    data: &'a [u8],
    data_size_bits: BitCount32,
    pointers_start: u32,
    pointer_count: WirePointerCount16,
    nesting_limit: i32,
}

impl<'a> StructReader<'a> {
    pub fn new_default<'b>() -> StructReader<'b> {
        StructReader {
            arena: &NULL_ARENA,
            segment_id: 0,
            segment: &[],
            data: &[],
            data_size_bits: 0,
            pointers_start: 0,
            pointer_count: 0,
            nesting_limit: 0x7fffffff,
        }
    }

    pub fn get_data_section_size(&self) -> BitCount32 {
        self.data_size_bits
    }

    pub fn get_pointer_section_size(&self) -> WirePointerCount16 {
        self.pointer_count
    }

    pub fn get_data_section_as_blob(&self) -> &'a [u8] {
        self.data
    }

    /// Reads the `offset`th value of type `T` in the data section. Values past the end of the
    /// data section, written by an older schema, read as zero.
    #[inline]
    pub fn get_data_field<T: Primitive>(&self, offset: usize) -> T {
        let start = offset * T::BYTES;
        self.data
            .get(start..start + T::BYTES)
            .map(T::get)
            .unwrap_or_default()
    }

    #[inline]
    pub fn get_data_field_mask<T: Primitive>(&self, offset: usize, mask: u64) -> T {
        self.get_data_field::<T>(offset).mask(mask)
    }

    #[inline]
    pub fn get_bool_field(&self, offset: BitCount32) -> bool {
        if offset >= self.data_size_bits {
            return false;
        }
        match self.data.get((offset / BITS_PER_BYTE) as usize) {
            Some(byte) => (byte >> (offset % BITS_PER_BYTE)) & 1 == 1,
            None => false,
        }
    }

    #[inline]
    pub fn get_bool_field_mask(&self, offset: BitCount32, mask: bool) -> bool {
        self.get_bool_field(offset) ^ mask
    }

    pub fn get_pointer_field(&self, ptr_index: WirePointerCount16) -> PointerReader<'a> {
        if ptr_index < self.pointer_count {
            PointerReader {
                arena: self.arena,
                segment_id: self.segment_id,
                segment: self.segment,
                pos: Some(self.pointers_start + u32::from(ptr_index)),
                nesting_limit: self.nesting_limit,
            }
        } else {
            PointerReader::new_default()
        }
    }

    pub fn total_size(&self) -> Result<MessageSize> {
        let mut result = MessageSize {
            word_count: round_bits_up_to_words(u64::from(self.data_size_bits))
                + u64::from(self.pointer_count),
            cap_count: 0,
        };
        for i in 0..self.pointer_count {
            result += self.get_pointer_field(i).total_size()?;
        }
        Ok(result)
    }
}

pub struct StructBuilder<'a> {
    arena: &'a mut dyn BuilderArena,
    segment_id: SegmentId,
    data_start: usize,
    data_size_bits: BitCount32,
    pointers_start: u32,
    pointer_count: WirePointerCount16,
}

impl<'a> StructBuilder<'a> {
    fn at(arena: &'a mut dyn BuilderArena, content: WordAddr, size: StructSize) -> Self {
        StructBuilder {
            arena,
            segment_id: content.segment_id,
            data_start: content.pos as usize * BYTES_PER_WORD,
            data_size_bits: u32::from(size.data) * BITS_PER_WORD,
            pointers_start: content.pos + u32::from(size.data),
            pointer_count: size.pointers,
        }
    }

    pub fn reborrow(&mut self) -> StructBuilder<'_> {
        StructBuilder {
            arena: &mut *self.arena,
            segment_id: self.segment_id,
            data_start: self.data_start,
            data_size_bits: self.data_size_bits,
            pointers_start: self.pointers_start,
            pointer_count: self.pointer_count,
        }
    }

    pub fn as_reader(&self) -> StructReader<'_> {
        let segment = self.arena.get_segment_ref(self.segment_id);
        StructReader {
            arena: self.arena.as_reader(),
            segment_id: self.segment_id,
            segment,
            data: &segment[self.data_range()],
            data_size_bits: self.data_size_bits,
            pointers_start: self.pointers_start,
            pointer_count: self.pointer_count,
            nesting_limit: 0x7fffffff,
        }
    }

    pub fn into_reader(self) -> StructReader<'a> {
        let data_range = self.data_range();
        let arena: &'a dyn BuilderArena = self.arena;
        let segment = arena.get_segment_ref(self.segment_id);
        StructReader {
            arena: arena.as_reader(),
            segment_id: self.segment_id,
            segment,
            data: &segment[data_range],
            data_size_bits: self.data_size_bits,
            pointers_start: self.pointers_start,
            pointer_count: self.pointer_count,
            nesting_limit: 0x7fffffff,
        }
    }

    pub fn struct_size(&self) -> StructSize {
        StructSize {
            data: (self.data_size_bits / BITS_PER_WORD) as u16,
            pointers: self.pointer_count,
        }
    }

    fn data_range(&self) -> std::ops::Range<usize> {
        self.data_start..self.data_start + (self.data_size_bits / BITS_PER_BYTE) as usize
    }

    fn data(&self) -> &[u8] {
        &self.arena.get_segment_ref(self.segment_id)[self.data_range()]
    }

    fn data_mut(&mut self) -> &mut [u8] {
        let range = self.data_range();
        &mut self.arena.get_segment_mut(self.segment_id)[range]
    }

    #[inline]
    pub fn get_data_field<T: Primitive>(&self, offset: usize) -> T {
        let start = offset * T::BYTES;
        self.data()
            .get(start..start + T::BYTES)
            .map(T::get)
            .unwrap_or_default()
    }

    #[inline]
    pub fn get_data_field_mask<T: Primitive>(&self, offset: usize, mask: u64) -> T {
        self.get_data_field::<T>(offset).mask(mask)
    }

    /// Writes the `offset`th value of type `T` in the data section. The struct must have been
    /// obtained with a size that covers the field.
    #[inline]
    pub fn set_data_field<T: Primitive>(&mut self, offset: usize, value: T) {
        let start = offset * T::BYTES;
        if let Some(bytes) = self.data_mut().get_mut(start..start + T::BYTES) {
            T::set(bytes, value);
        } else {
            debug_assert!(false, "data field {offset} is outside the data section");
        }
    }

    #[inline]
    pub fn set_data_field_mask<T: Primitive>(&mut self, offset: usize, value: T, mask: u64) {
        self.set_data_field::<T>(offset, value.mask(mask));
    }

    #[inline]
    pub fn get_bool_field(&self, offset: BitCount32) -> bool {
        match self.data().get((offset / BITS_PER_BYTE) as usize) {
            Some(byte) => (byte >> (offset % BITS_PER_BYTE)) & 1 == 1,
            None => false,
        }
    }

    #[inline]
    pub fn get_bool_field_mask(&self, offset: BitCount32, mask: bool) -> bool {
        self.get_bool_field(offset) ^ mask
    }

    #[inline]
    pub fn set_bool_field(&mut self, offset: BitCount32, value: bool) {
        let bit = offset % BITS_PER_BYTE;
        if let Some(byte) = self.data_mut().get_mut((offset / BITS_PER_BYTE) as usize) {
            *byte = (*byte & !(1 << bit)) | (u8::from(value) << bit);
        } else {
            debug_assert!(false, "bool field {offset} is outside the data section");
        }
    }

    #[inline]
    pub fn set_bool_field_mask(&mut self, offset: BitCount32, value: bool, mask: bool) {
        self.set_bool_field(offset, value ^ mask);
    }

    /// `ptr_index` must be less than the pointer section size.
    pub fn get_pointer_field(self, ptr_index: WirePointerCount16) -> PointerBuilder<'a> {
        debug_assert!(ptr_index < self.pointer_count);
        PointerBuilder {
            arena: self.arena,
            segment_id: self.segment_id,
            pos: self.pointers_start + u32::from(ptr_index),
        }
    }

    pub fn get_pointer_field_mut(&mut self, ptr_index: WirePointerCount16) -> PointerBuilder<'_> {
        self.reborrow().get_pointer_field(ptr_index)
    }

    /// Overwrites this struct with a copy of `other`, truncating or zero-filling sections
    /// whose sizes differ.
    pub fn copy_content_from(&mut self, other: &StructReader<'_>) -> Result<()> {
        let shared_bytes = (self.data_size_bits.min(other.data_size_bits) / BITS_PER_BYTE) as usize;
        let data = self.data_mut();
        data[..shared_bytes].copy_from_slice(&other.data[..shared_bytes]);
        data[shared_bytes..].fill(0);

        for i in 0..self.pointer_count {
            let addr = WordAddr::new(self.segment_id, self.pointers_start + u32::from(i));
            if i < other.pointer_count {
                wire_helpers::copy_pointer(&mut *self.arena, addr, &other.get_pointer_field(i))?;
            } else {
                wire_helpers::clear_pointer(&mut *self.arena, addr);
            }
        }
        Ok(())
    }
}

#[derive(Clone, Copy)]
pub struct ListReader<'a> {
    arena: &'a dyn ReaderArena,
    segment_id: SegmentId,
    segment: &'a [u8],
    start_bit: u64,
    element_count: ElementCount32,
    step_bits: BitCount32,
    struct_data_size_bits: BitCount32,
    struct_pointer_count: WirePointerCount16,
    element_size: ElementSize,
    nesting_limit: i32,
}

impl<'a> ListReader<'a> {
    pub fn new_default<'b>() -> ListReader<'b> {
        ListReader {
            arena: &NULL_ARENA,
            segment_id: 0,
            segment: &[],
            start_bit: 0,
            element_count: 0,
            step_bits: 0,
            struct_data_size_bits: 0,
            struct_pointer_count: 0,
            element_size: Void,
            nesting_limit: 0x7fffffff,
        }
    }

    #[inline]
    pub fn len(&self) -> ElementCount32 {
        self.element_count
    }

    pub fn is_empty(&self) -> bool {
        self.element_count == 0
    }

    pub fn element_size(&self) -> ElementSize {
        self.element_size
    }

    fn element_bit(&self, index: ElementCount32) -> u64 {
        self.start_bit + u64::from(index) * u64::from(self.step_bits)
    }

    pub fn get_struct_element(&self, index: ElementCount32) -> StructReader<'a> {
        if index >= self.element_count {
            return StructReader::new_default();
        }
        let bit = self.element_bit(index);
        let start = (bit / u64::from(BITS_PER_BYTE)) as usize;
        let data_bytes = (self.struct_data_size_bits / BITS_PER_BYTE) as usize;
        let data = self.segment.get(start..start + data_bytes).unwrap_or(&[]);
        StructReader {
            arena: self.arena,
            segment_id: self.segment_id,
            segment: self.segment,
            data,
            data_size_bits: (data.len() * BITS_PER_BYTE as usize) as u32,
            pointers_start: ((bit + u64::from(self.struct_data_size_bits))
                / u64::from(BITS_PER_WORD)) as u32,
            pointer_count: self.struct_pointer_count,
            nesting_limit: self.nesting_limit,
        }
    }

    pub fn get_pointer_element(&self, index: ElementCount32) -> PointerReader<'a> {
        if index >= self.element_count || self.struct_pointer_count == 0 {
            return PointerReader::new_default();
        }
        let bit = self.element_bit(index) + u64::from(self.struct_data_size_bits);
        PointerReader {
            arena: self.arena,
            segment_id: self.segment_id,
            segment: self.segment,
            pos: Some((bit / u64::from(BITS_PER_WORD)) as u32),
            nesting_limit: self.nesting_limit,
        }
    }

    #[inline]
    pub fn get_data_element<T: Primitive>(&self, index: ElementCount32) -> T {
        if index >= self.element_count || (self.struct_data_size_bits as usize) < T::BYTES * 8 {
            return T::default();
        }
        let start = (self.element_bit(index) / u64::from(BITS_PER_BYTE)) as usize;
        self.segment
            .get(start..start + T::BYTES)
            .map(T::get)
            .unwrap_or_default()
    }

    #[inline]
    pub fn get_bool_element(&self, index: ElementCount32) -> bool {
        if index >= self.element_count || self.struct_data_size_bits == 0 {
            return false;
        }
        let bit = self.element_bit(index);
        match self.segment.get((bit / u64::from(BITS_PER_BYTE)) as usize) {
            Some(byte) => (byte >> (bit % u64::from(BITS_PER_BYTE))) & 1 == 1,
            None => false,
        }
    }

    /// The bytes spanned by the list's elements.
    pub fn raw_bytes(&self) -> Result<&'a [u8]> {
        let start = (self.start_bit / u64::from(BITS_PER_BYTE)) as usize;
        let len = round_bits_up_to_bytes(u64::from(self.element_count) * u64::from(self.step_bits));
        self.segment
            .get(start..start + len as usize)
            .ok_or_else(|| Error::from_kind(ErrorKind::MessageContainsOutOfBoundsPointer))
    }

    pub fn total_size(&self) -> Result<MessageSize> {
        let mut result = MessageSize {
            word_count: round_bits_up_to_words(
                u64::from(self.element_count) * u64::from(self.step_bits),
            ),
            cap_count: 0,
        };
        match self.element_size {
            InlineComposite => {
                result.word_count += u64::from(POINTER_SIZE_IN_WORDS);
                for i in 0..self.element_count {
                    let element = self.get_struct_element(i);
                    for p in 0..element.pointer_count {
                        result += element.get_pointer_field(p).total_size()?;
                    }
                }
            }
            Pointer => {
                for i in 0..self.element_count {
                    result += self.get_pointer_element(i).total_size()?;
                }
            }
            _ => {}
        }
        Ok(result)
    }
}

pub struct ListBuilder<'a> {
    arena: &'a mut dyn BuilderArena,
    segment_id: SegmentId,
    start: u32,
    element_count: ElementCount32,
    step_bits: BitCount32,
    struct_data_size_bits: BitCount32,
    struct_pointer_count: WirePointerCount16,
    element_size: ElementSize,
}

impl<'a> ListBuilder<'a> {
    fn new_empty(
        arena: &'a mut dyn BuilderArena,
        segment_id: SegmentId,
        element_size: ElementSize,
    ) -> Self {
        ListBuilder {
            arena,
            segment_id,
            start: 0,
            element_count: 0,
            step_bits: element_size.data_bits_per_element()
                + element_size.pointers_per_element() * BITS_PER_POINTER,
            struct_data_size_bits: element_size.data_bits_per_element(),
            struct_pointer_count: element_size.pointers_per_element() as u16,
            element_size,
        }
    }

    pub fn reborrow(&mut self) -> ListBuilder<'_> {
        ListBuilder {
            arena: &mut *self.arena,
            segment_id: self.segment_id,
            start: self.start,
            element_count: self.element_count,
            step_bits: self.step_bits,
            struct_data_size_bits: self.struct_data_size_bits,
            struct_pointer_count: self.struct_pointer_count,
            element_size: self.element_size,
        }
    }

    #[inline]
    pub fn len(&self) -> ElementCount32 {
        self.element_count
    }

    pub fn is_empty(&self) -> bool {
        self.element_count == 0
    }

    pub fn element_size(&self) -> ElementSize {
        self.element_size
    }

    pub fn as_reader(&self) -> ListReader<'_> {
        ListReader {
            arena: self.arena.as_reader(),
            segment_id: self.segment_id,
            segment: self.arena.get_segment_ref(self.segment_id),
            start_bit: u64::from(self.start) * u64::from(BITS_PER_WORD),
            element_count: self.element_count,
            step_bits: self.step_bits,
            struct_data_size_bits: self.struct_data_size_bits,
            struct_pointer_count: self.struct_pointer_count,
            element_size: self.element_size,
            nesting_limit: 0x7fffffff,
        }
    }

    pub fn into_reader(self) -> ListReader<'a> {
        let arena: &'a dyn BuilderArena = self.arena;
        ListReader {
            arena: arena.as_reader(),
            segment_id: self.segment_id,
            segment: arena.get_segment_ref(self.segment_id),
            start_bit: u64::from(self.start) * u64::from(BITS_PER_WORD),
            element_count: self.element_count,
            step_bits: self.step_bits,
            struct_data_size_bits: self.struct_data_size_bits,
            struct_pointer_count: self.struct_pointer_count,
            element_size: self.element_size,
            nesting_limit: 0x7fffffff,
        }
    }

    fn element_bit(&self, index: ElementCount32) -> u64 {
        u64::from(self.start) * u64::from(BITS_PER_WORD)
            + u64::from(index) * u64::from(self.step_bits)
    }

    /// `index` must be less than `len()`.
    pub fn get_struct_element(self, index: ElementCount32) -> StructBuilder<'a> {
        debug_assert!(index < self.element_count);
        let bit = self.element_bit(index);
        StructBuilder {
            arena: self.arena,
            segment_id: self.segment_id,
            data_start: (bit / u64::from(BITS_PER_BYTE)) as usize,
            data_size_bits: self.struct_data_size_bits,
            pointers_start: ((bit + u64::from(self.struct_data_size_bits))
                / u64::from(BITS_PER_WORD)) as u32,
            pointer_count: self.struct_pointer_count,
        }
    }

    /// `index` must be less than `len()`, and the elements must contain a pointer.
    pub fn get_pointer_element(self, index: ElementCount32) -> PointerBuilder<'a> {
        debug_assert!(index < self.element_count && self.struct_pointer_count > 0);
        let bit = self.element_bit(index) + u64::from(self.struct_data_size_bits);
        PointerBuilder {
            arena: self.arena,
            segment_id: self.segment_id,
            pos: (bit / u64::from(BITS_PER_WORD)) as u32,
        }
    }

    fn element_bytes(&self, index: ElementCount32, len: usize) -> Option<std::ops::Range<usize>> {
        if index >= self.element_count || (self.struct_data_size_bits as usize) < len * 8 {
            return None;
        }
        let start = (self.element_bit(index) / u64::from(BITS_PER_BYTE)) as usize;
        Some(start..start + len)
    }

    #[inline]
    pub fn get_data_element<T: Primitive>(&self, index: ElementCount32) -> T {
        match self.element_bytes(index, T::BYTES) {
            Some(range) => T::get(&self.arena.get_segment_ref(self.segment_id)[range]),
            None => T::default(),
        }
    }

    #[inline]
    pub fn set_data_element<T: Primitive>(&mut self, index: ElementCount32, value: T) {
        if let Some(range) = self.element_bytes(index, T::BYTES) {
            T::set(&mut self.arena.get_segment_mut(self.segment_id)[range], value);
        } else {
            debug_assert!(false, "list element {index} is out of range");
        }
    }

    #[inline]
    pub fn get_bool_element(&self, index: ElementCount32) -> bool {
        if index >= self.element_count || self.struct_data_size_bits == 0 {
            return false;
        }
        let bit = self.element_bit(index);
        let byte = self.arena.get_segment_ref(self.segment_id)[(bit / 8) as usize];
        (byte >> (bit % 8)) & 1 == 1
    }

    #[inline]
    pub fn set_bool_element(&mut self, index: ElementCount32, value: bool) {
        if index >= self.element_count || self.struct_data_size_bits == 0 {
            debug_assert!(false, "list element {index} is out of range");
            return;
        }
        let bit = self.element_bit(index);
        let shift = bit % 8;
        let byte = &mut self.arena.get_segment_mut(self.segment_id)[(bit / 8) as usize];
        *byte = (*byte & !(1 << shift)) | (u8::from(value) << shift);
    }

    /// The bytes spanned by the list's elements.
    pub fn into_raw_bytes_mut(self) -> &'a mut [u8] {
        let ListBuilder {
            arena,
            segment_id,
            start,
            element_count,
            step_bits,
            ..
        } = self;
        let begin = start as usize * BYTES_PER_WORD;
        let len = round_bits_up_to_bytes(u64::from(element_count) * u64::from(step_bits)) as usize;
        &mut arena.get_segment_mut(segment_id)[begin..begin + len]
    }
}

/// A type that can be an element of a primitive list.
pub trait PrimitiveElement: Copy {
    fn element_size() -> ElementSize;
    fn get(list: &ListReader<'_>, index: ElementCount32) -> Self;
    fn get_from_builder(list: &ListBuilder<'_>, index: ElementCount32) -> Self;
    fn set(list: &mut ListBuilder<'_>, index: ElementCount32, value: Self);
}

macro_rules! primitive_element(
    ($($typ:ty),*) => ($(
        impl PrimitiveElement for $typ {
            #[inline]
            fn element_size() -> ElementSize {
                element_size_for::<$typ>()
            }

            #[inline]
            fn get(list: &ListReader<'_>, index: ElementCount32) -> Self {
                list.get_data_element(index)
            }

            #[inline]
            fn get_from_builder(list: &ListBuilder<'_>, index: ElementCount32) -> Self {
                list.get_data_element(index)
            }

            #[inline]
            fn set(list: &mut ListBuilder<'_>, index: ElementCount32, value: Self) {
                list.set_data_element(index, value)
            }
        }
    )*);
);

primitive_element!(u8, i8, u16, i16, u32, i32, u64, i64, f32, f64);

impl PrimitiveElement for bool {
    #[inline]
    fn element_size() -> ElementSize {
        Bit
    }

    #[inline]
    fn get(list: &ListReader<'_>, index: ElementCount32) -> Self {
        list.get_bool_element(index)
    }

    #[inline]
    fn get_from_builder(list: &ListBuilder<'_>, index: ElementCount32) -> Self {
        list.get_bool_element(index)
    }

    #[inline]
    fn set(list: &mut ListBuilder<'_>, index: ElementCount32, value: Self) {
        list.set_bool_element(index, value)
    }
}
