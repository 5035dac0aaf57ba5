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

use crate::any_pointer;
use crate::message::{self, ReaderOptions, SegmentArray};
use crate::primitive_list;
use crate::private::layout::{PointerReader, StructSize, WirePointer, WirePointerKind};
use crate::traits::FromPointerReader;
use crate::ErrorKind;

fn with_root<R>(
    segments: &[&[u8]],
    options: ReaderOptions,
    f: impl FnOnce(PointerReader<'_>) -> R,
) -> R {
    let message = message::Reader::new(SegmentArray::new(segments), options);
    let root: any_pointer::Reader = message.get_root().unwrap();
    f(root.into_pointer_reader())
}

#[test]
fn pointer_word_encoding() {
    let mut p = WirePointer::default();
    p.set_kind_and_target(WirePointerKind::Struct, 0, 1);
    p.set_struct_size(StructSize {
        data: 2,
        pointers: 1,
    });
    assert_eq!(p.to_bytes(), [0, 0, 0, 0, 2, 0, 1, 0]);
    assert_eq!(p.struct_word_size(), 3);

    let mut far = WirePointer::default();
    far.set_far(true, 5);
    far.set_far_segment_id(3);
    assert_eq!(far.to_bytes(), [46, 0, 0, 0, 3, 0, 0, 0]);
    assert!(far.is_double_far());
    assert_eq!(far.far_position_in_segment(), 5);

    let mut empty = WirePointer::default();
    empty.set_kind_and_target_for_empty_struct();
    assert_eq!(empty.offset(), -1);
    assert!(!empty.is_null());

    let mut cap = WirePointer::default();
    cap.set_cap(7);
    assert!(cap.is_capability());
    assert_eq!(WirePointer::from_bytes(&cap.to_bytes()).cap_index(), 7);
}

#[test]
fn simple_raw_data_struct() {
    let segment: &[u8] = &[
        0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00,
        0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef,
    ];

    with_root(&[segment], ReaderOptions::new(), |root| {
        let reader = root.get_struct().unwrap();

        assert_eq!(0xefcdab8967452301u64, reader.get_data_field::<u64>(0));
        assert_eq!(0, reader.get_data_field::<u64>(1)); // past end of struct

        assert_eq!(0x67452301u32, reader.get_data_field::<u32>(0));
        assert_eq!(0xefcdab89u32, reader.get_data_field::<u32>(1));
        assert_eq!(0, reader.get_data_field::<u32>(2));

        assert_eq!(0x2301u16, reader.get_data_field::<u16>(0));
        assert_eq!(0x6745u16, reader.get_data_field::<u16>(1));
        assert_eq!(0xab89u16, reader.get_data_field::<u16>(2));
        assert_eq!(0xefcdu16, reader.get_data_field::<u16>(3));
        assert_eq!(0u16, reader.get_data_field::<u16>(4));

        assert!(reader.get_bool_field(0));
        for bit in 1..8 {
            assert!(!reader.get_bool_field(bit));
        }
        assert!(reader.get_bool_field(8));
        assert!(reader.get_bool_field(9));
        assert!(!reader.get_bool_field(10));
        assert!(reader.get_bool_field(13));
        assert!(reader.get_bool_field(63));
        assert!(!reader.get_bool_field(64));
    });
}

#[test]
fn bool_list() {
    // [true, false, true, false, true, true, true, false, false, true]
    let segment: &[u8] = &[
        0x01, 0x00, 0x00, 0x00, 0x51, 0x00, 0x00, 0x00,
        0x75, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    ];

    with_root(&[segment], ReaderOptions::new(), |root| {
        let reader = primitive_list::Reader::<bool>::get_from_pointer(&root).unwrap();
        let values: Vec<bool> = reader.iter().collect();
        assert_eq!(
            values,
            [true, false, true, false, true, true, true, false, false, true]
        );
    });
}

#[test]
fn struct_size() {
    let segment: &[u8] = &[
        0x00, 0x00, 0x00, 0x00, 0x02, 0x00, 0x01, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    ];

    with_root(&[segment], ReaderOptions::new(), |root| {
        assert_eq!(root.total_size().unwrap().word_count, 3);
    });
}

#[test]
fn struct_list_size() {
    // The list pointer claims three words of content, but the tag describes a single
    // one-word element. The size reported is the one the tag implies, since that is what a
    // copy would take.
    let segment: &[u8] = &[
        0x01, 0x00, 0x00, 0x00, 0x1f, 0x00, 0x00, 0x00,
        0x04, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    ];

    with_root(&[segment], ReaderOptions::new(), |root| {
        assert_eq!(root.total_size().unwrap().word_count, 2);
    });
}

#[test]
fn empty_struct_list_size() {
    let segment: &[u8] = &[
        // struct with one pointer
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00,
        // inline-composite list, zero words long
        0x01, 0x00, 0x00, 0x00, 0x07, 0x00, 0x00, 0x00,
        // tag
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    ];

    with_root(&[segment], ReaderOptions::new(), |root| {
        assert_eq!(root.total_size().unwrap().word_count, 2);
    });
}

#[test]
fn out_of_bounds_pointers() {
    // One data word, but the segment ends right after the pointer.
    let past_end: &[u8] = &[0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00];
    with_root(&[past_end], ReaderOptions::new(), |root| {
        let err = root.get_struct().err().unwrap();
        assert_eq!(err.kind, ErrorKind::MessageContainsOutOfBoundsPointer);
    });

    // Offset -2 lands before the start of the segment.
    let before_start: &[u8] = &[
        0xf8, 0xff, 0xff, 0xff, 0x01, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    ];
    with_root(&[before_start], ReaderOptions::new(), |root| {
        let err = root.get_struct().err().unwrap();
        assert_eq!(err.kind, ErrorKind::MessageContainsOutOfBoundsPointer);
    });

    // A far pointer into a segment that does not exist.
    let missing_segment: &[u8] = &[0x02, 0x00, 0x00, 0x00, 0x05, 0x00, 0x00, 0x00];
    with_root(&[missing_segment], ReaderOptions::new(), |root| {
        let err = root.get_struct().err().unwrap();
        assert_eq!(err.kind, ErrorKind::InvalidSegmentId);
    });
}

#[test]
fn far_pointer_to_struct() {
    let segment0: &[u8] = &[0x02, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00];
    let segment1: &[u8] = &[
        0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00,
        0x2a, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    ];

    with_root(&[segment0, segment1], ReaderOptions::new(), |root| {
        let reader = root.get_struct().unwrap();
        assert_eq!(reader.get_data_field::<u64>(0), 42);
    });
}

#[test]
fn landing_pad_that_is_far() {
    let segment0: &[u8] = &[0x02, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00];
    let segment1: &[u8] = &[0x02, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00];

    with_root(&[segment0, segment1], ReaderOptions::new(), |root| {
        let err = root.get_struct().err().unwrap();
        assert_eq!(err.kind, ErrorKind::FarPointerLandingPadIsFar);
    });
}

#[test]
fn double_far_pointer() {
    let segment0: &[u8] = &[0x06, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00];
    let segment1: &[u8] = &[
        // far pointer to the content
        0x02, 0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00,
        // tag: struct with one data word
        0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00,
    ];
    let segment2: &[u8] = &[0x07, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];

    with_root(&[segment0, segment1, segment2], ReaderOptions::new(), |root| {
        let reader = root.get_struct().unwrap();
        assert_eq!(reader.get_data_field::<u64>(0), 7);
    });

    // The first pad word must itself be a far pointer.
    let bad_pad: &[u8] = &[
        0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00,
    ];
    with_root(&[segment0, bad_pad, segment2], ReaderOptions::new(), |root| {
        let err = root.get_struct().err().unwrap();
        assert_eq!(err.kind, ErrorKind::MalformedDoubleFarPointer);
    });
}

// A struct whose only pointer points back at itself.
const SELF_REFERENCE: &[u8] = &[
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00,
    0xfc, 0xff, 0xff, 0xff, 0x00, 0x00, 0x01, 0x00,
];

fn descend(root: PointerReader<'_>, steps: usize) -> crate::Result<()> {
    let mut pointer = root;
    for _ in 0..steps {
        pointer = pointer.get_struct()?.get_pointer_field(0);
    }
    Ok(())
}

#[test]
fn nesting_limit() {
    let mut options = ReaderOptions::new();
    options.nesting_limit(8);

    with_root(&[SELF_REFERENCE], options, |root| {
        assert!(descend(root, 8).is_ok());
    });
    with_root(&[SELF_REFERENCE], options, |root| {
        let err = descend(root, 9).err().unwrap();
        assert_eq!(err.kind, ErrorKind::NestingLimitExceeded);
    });
}

#[test]
fn traversal_limit() {
    let mut options = ReaderOptions::new();
    options.nesting_limit(1000).traversal_limit_in_words(50);

    // Each visit to the struct charges its single word again.
    with_root(&[SELF_REFERENCE], options, |root| {
        let err = descend(root, 100).err().unwrap();
        assert_eq!(err.kind, ErrorKind::TraversalLimitExceeded);
    });
}

#[test]
fn amplified_void_list() {
    // 2^28 void elements take no space on the wire, but still count against the budget.
    let segment: &[u8] = &[0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x80];

    with_root(&[segment], ReaderOptions::new(), |root| {
        let err = root.get_list(None).err().unwrap();
        assert_eq!(err.kind, ErrorKind::TraversalLimitExceeded);
    });

    let mut options = ReaderOptions::new();
    options.traversal_limit_in_words(u64::MAX);
    with_root(&[segment], options, |root| {
        assert_eq!(root.get_list(None).unwrap().len(), 1 << 28);
    });
}

#[test]
fn text_must_be_nul_terminated() {
    let terminated: &[u8] = &[
        0x01, 0x00, 0x00, 0x00, 0x22, 0x00, 0x00, 0x00,
        b'a', b'b', b'c', 0x00, 0x00, 0x00, 0x00, 0x00,
    ];
    with_root(&[terminated], ReaderOptions::new(), |root| {
        assert_eq!(root.get_text().unwrap(), Some("abc"));
    });

    let unterminated: &[u8] = &[
        0x01, 0x00, 0x00, 0x00, 0x1a, 0x00, 0x00, 0x00,
        b'a', b'b', b'c', 0x00, 0x00, 0x00, 0x00, 0x00,
    ];
    with_root(&[unterminated], ReaderOptions::new(), |root| {
        let err = root.get_text().err().unwrap();
        assert_eq!(err.kind, ErrorKind::TextNotNulTerminated);
    });
}

#[test]
fn list_element_size_mismatch() {
    // A list of three bytes cannot be read as a list of u64.
    let segment: &[u8] = &[
        0x01, 0x00, 0x00, 0x00, 0x1a, 0x00, 0x00, 0x00,
        0x01, 0x02, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00,
    ];
    with_root(&[segment], ReaderOptions::new(), |root| {
        let err = primitive_list::Reader::<u64>::get_from_pointer(&root).err().unwrap();
        assert_eq!(err.kind, ErrorKind::ListElementSizeMismatch);

        let bytes = primitive_list::Reader::<u8>::get_from_pointer(&root).unwrap();
        assert_eq!(bytes.iter().collect::<Vec<_>>(), [1, 2, 3]);
    });
}

#[test]
fn struct_pointer_where_list_expected() {
    let segment: &[u8] = &[
        0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    ];
    with_root(&[segment], ReaderOptions::new(), |root| {
        let err = root.get_list(None).err().unwrap();
        assert_eq!(err.kind, ErrorKind::NotAList);
    });
}

#[test]
fn pointer_builder_setters_write_through_the_arena() {
    let mut source = message::Builder::new_default();
    source.set_root::<crate::data::Reader<'_>>(&[1, 2, 3]).unwrap();

    let mut message = message::Builder::new_default();
    {
        let mut root: any_pointer::Builder = message.init_root().unwrap();
        root.reborrow().set_as::<crate::text::Reader<'_>>("hello").unwrap();
        assert_eq!(
            root.as_reader().get_as::<crate::text::Reader<'_>>().unwrap(),
            "hello"
        );

        root.clear();
        assert!(root.is_null());

        let copied: any_pointer::Reader = source.get_root_as_reader().unwrap();
        root.reborrow().set_as(copied).unwrap();
    }
    let root: any_pointer::Reader = message.get_root_as_reader().unwrap();
    assert_eq!(root.get_as::<crate::data::Reader<'_>>().unwrap(), &[1, 2, 3]);
}
