use capwire::message::{self, HeapAllocator, ReaderOptions, SegmentArray};
use capwire::schema::{DefaultValue, Field, FieldKind, StructSchema, Type, NO_DISCRIMINANT};
use capwire::{any_pointer, primitive_list, serialize, ErrorKind};

static PAIR: StructSchema = StructSchema {
    name: "Pair",
    data_words: 0,
    pointer_count: 2,
    discriminant_count: 0,
    discriminant_offset: 0,
    fields: &[
        Field {
            name: "first",
            ordinal: 0,
            discriminant_value: NO_DISCRIMINANT,
            kind: FieldKind::Slot {
                offset: 0,
                ty: Type::List(&Type::UInt64),
                default: DefaultValue::Zero,
            },
        },
        Field {
            name: "second",
            ordinal: 1,
            discriminant_value: NO_DISCRIMINANT,
            kind: FieldKind::Slot {
                offset: 1,
                ty: Type::List(&Type::UInt64),
                default: DefaultValue::Zero,
            },
        },
    ],
};

#[test]
fn aliased_pointers_are_charged_twice() {
    // Both pointers of the root struct point at the same four-word list.
    let segment: &[u8] = &[
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x02, 0x00,
        0x05, 0x00, 0x00, 0x00, 0x25, 0x00, 0x00, 0x00,
        0x01, 0x00, 0x00, 0x00, 0x25, 0x00, 0x00, 0x00,
        0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x03, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    ];
    let segments: &[&[u8]] = &[segment];

    let unlimited = message::Reader::new(SegmentArray::new(segments), ReaderOptions::new());
    let pair = unlimited
        .get_root::<any_pointer::Reader>()
        .unwrap()
        .get_as_struct(&PAIR)
        .unwrap();
    for name in ["first", "second"] {
        let list = pair
            .get_named(name)
            .unwrap()
            .downcast::<capwire::dynamic_list::Reader>();
        assert_eq!(list.get(3).unwrap().downcast::<u64>(), 4);
    }

    // Root pointer, struct and one list fit in eight words; the alias does not.
    let mut options = ReaderOptions::new();
    options.traversal_limit_in_words(8);
    let limited = message::Reader::new(SegmentArray::new(segments), options);
    let pair = limited
        .get_root::<any_pointer::Reader>()
        .unwrap()
        .get_as_struct(&PAIR)
        .unwrap();
    assert!(pair.get_named("first").is_ok());
    let err = pair.get_named("second").err().unwrap();
    assert_eq!(err.kind, ErrorKind::TraversalLimitExceeded);
}

#[test]
fn segment_table_limits() {
    let too_many: &[u8] = &[0xff, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
    let err = serialize::read_message(&mut &too_many[..], ReaderOptions::new())
        .err()
        .unwrap();
    assert_eq!(err.kind, ErrorKind::InvalidNumberOfSegments);

    let too_large: &[u8] = &[0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01];
    let err = serialize::read_message(&mut &too_large[..], ReaderOptions::new())
        .err()
        .unwrap();
    assert_eq!(err.kind, ErrorKind::MessageTooLarge);

    // Two words promised, one delivered.
    let truncated: &[u8] = &[
        0x00, 0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    ];
    let err = serialize::read_message(&mut &truncated[..], ReaderOptions::new())
        .err()
        .unwrap();
    assert_eq!(err.kind, ErrorKind::PrematureEndOfFile);
}

#[test]
fn allocator_total_limit() {
    let mut message = message::Builder::new(
        HeapAllocator::new()
            .first_segment_words(4)
            .total_words_limit(16),
    );
    let root: any_pointer::Builder = message.init_root().unwrap();
    let err = root
        .initn_as::<primitive_list::Builder<u64>>(100)
        .err()
        .unwrap();
    assert_eq!(err.kind, ErrorKind::ResourceExceeded);

    let root: any_pointer::Builder = message.init_root().unwrap();
    let list: primitive_list::Builder<u64> = root.initn_as(8).unwrap();
    assert_eq!(list.len(), 8);
}
