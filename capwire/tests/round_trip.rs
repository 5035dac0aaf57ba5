use capwire::dynamic_value;
use capwire::message::{self, AllocationStrategy, HeapAllocator, ReaderOptions};
use capwire::schema::{DefaultValue, Field, FieldKind, StructSchema, Type, NO_DISCRIMINANT};
use capwire::{any_pointer, dynamic_list, dynamic_struct, serialize, serialize_packed};

static PHONE: StructSchema = StructSchema {
    name: "Person.PhoneNumber",
    data_words: 1,
    pointer_count: 1,
    discriminant_count: 0,
    discriminant_offset: 0,
    fields: &[
        Field {
            name: "number",
            ordinal: 0,
            discriminant_value: NO_DISCRIMINANT,
            kind: FieldKind::Slot {
                offset: 0,
                ty: Type::Text,
                default: DefaultValue::Zero,
            },
        },
        Field {
            name: "type",
            ordinal: 1,
            discriminant_value: NO_DISCRIMINANT,
            kind: FieldKind::Slot {
                offset: 0,
                ty: Type::Enum,
                default: DefaultValue::Zero,
            },
        },
    ],
};

static PHONE_ELEMENT: Type = Type::Struct(&PHONE);

static PERSON: StructSchema = StructSchema {
    name: "Person",
    data_words: 1,
    pointer_count: 2,
    discriminant_count: 0,
    discriminant_offset: 0,
    fields: &[
        Field {
            name: "id",
            ordinal: 0,
            discriminant_value: NO_DISCRIMINANT,
            kind: FieldKind::Slot {
                offset: 0,
                ty: Type::UInt32,
                default: DefaultValue::Zero,
            },
        },
        Field {
            name: "name",
            ordinal: 1,
            discriminant_value: NO_DISCRIMINANT,
            kind: FieldKind::Slot {
                offset: 0,
                ty: Type::Text,
                default: DefaultValue::Zero,
            },
        },
        Field {
            name: "phones",
            ordinal: 2,
            discriminant_value: NO_DISCRIMINANT,
            kind: FieldKind::Slot {
                offset: 1,
                ty: Type::List(&PHONE_ELEMENT),
                default: DefaultValue::Zero,
            },
        },
    ],
};

const MOBILE: u16 = 0;
const WORK: u16 = 2;

fn build_person<A: message::Allocator>(message: &mut message::Builder<A>, id: u32, name: &str) {
    let mut person = message
        .init_root::<any_pointer::Builder>()
        .unwrap()
        .init_as_struct(&PERSON)
        .unwrap();
    person.set_named("id", id.into()).unwrap();
    person.set_named("name", name.into()).unwrap();
    let mut phones = person
        .initn_named("phones", 2)
        .unwrap()
        .downcast::<dynamic_list::Builder>();
    for (i, (number, kind)) in [("555-1212", MOBILE), ("555-0000", WORK)].iter().enumerate() {
        let mut phone = phones
            .reborrow()
            .get(i as u32)
            .unwrap()
            .downcast::<dynamic_struct::Builder>();
        phone.set_named("number", (*number).into()).unwrap();
        phone
            .set_named("type", dynamic_value::Reader::Enum(*kind))
            .unwrap();
    }
}

fn check_person<S: message::ReaderSegments>(message: &message::Reader<S>, id: u32, name: &str) {
    check_person_at(message.get_root().unwrap(), id, name);
}

fn check_person_at(root: any_pointer::Reader<'_>, id: u32, name: &str) {
    let person = root.get_as_struct(&PERSON).unwrap();
    assert_eq!(person.get_named("id").unwrap().downcast::<u32>(), id);
    assert_eq!(person.get_named("name").unwrap().downcast::<&str>(), name);
    let phones = person
        .get_named("phones")
        .unwrap()
        .downcast::<dynamic_list::Reader>();
    assert_eq!(phones.len(), 2);
    let second = phones.get(1).unwrap().downcast::<dynamic_struct::Reader>();
    assert_eq!(
        second.get_named("number").unwrap().downcast::<&str>(),
        "555-0000"
    );
    match second.get_named("type").unwrap() {
        dynamic_value::Reader::Enum(kind) => assert_eq!(kind, WORK),
        _ => panic!("expected an enum"),
    }
}

#[test]
fn alice_flat_and_packed() {
    let mut message = message::Builder::new_default();
    build_person(&mut message, 123, "Alice");

    let flat = serialize::write_message_to_words(&message);
    assert_eq!(
        flat.len(),
        serialize::compute_serialized_size_in_words(&message) * 8
    );
    let reader = serialize::read_message(&mut &flat[..], ReaderOptions::new()).unwrap();
    check_person(&reader, 123, "Alice");

    let mut packed = Vec::new();
    serialize_packed::write_message(&mut packed, &message).unwrap();
    assert!(packed.len() < flat.len());

    let reader = serialize_packed::read_message(&mut &packed[..], ReaderOptions::new()).unwrap();
    check_person(&reader, 123, "Alice");

    // Unpacking gives back exactly the flat encoding.
    let reread = serialize::write_message_segments_to_words(reader.segments());
    assert_eq!(reread, flat);
}

#[test]
fn message_spread_over_many_segments() {
    let mut message = message::Builder::new(
        HeapAllocator::new()
            .first_segment_words(2)
            .allocation_strategy(AllocationStrategy::FixedSize),
    );
    build_person(&mut message, 7, "a name long enough to need its own segment");
    assert!(message.get_segments_for_output().len() > 2);

    let flat = serialize::write_message_to_words(&message);
    let reader = serialize::read_message(&mut &flat[..], ReaderOptions::new()).unwrap();
    check_person(&reader, 7, "a name long enough to need its own segment");

    let mut packed = Vec::new();
    serialize_packed::write_message(&mut packed, &message).unwrap();
    let reader = serialize_packed::read_message(&mut &packed[..], ReaderOptions::new()).unwrap();
    check_person(&reader, 7, "a name long enough to need its own segment");
}

#[test]
fn stream_of_messages() {
    let names = ["Alice", "Bob", "Carol"];
    let mut flat = Vec::new();
    let mut packed = Vec::new();
    for (id, name) in names.iter().enumerate() {
        let mut message = message::Builder::new_default();
        build_person(&mut message, id as u32, name);
        serialize::write_message(&mut flat, &message).unwrap();
        serialize_packed::write_message(&mut packed, &message).unwrap();
    }

    let mut input = &flat[..];
    for (id, name) in names.iter().enumerate() {
        let reader = serialize::try_read_message(&mut input, ReaderOptions::new())
            .unwrap()
            .unwrap();
        check_person(&reader, id as u32, name);
    }
    assert!(serialize::try_read_message(&mut input, ReaderOptions::new())
        .unwrap()
        .is_none());

    let mut input = &packed[..];
    for (id, name) in names.iter().enumerate() {
        let reader = serialize_packed::try_read_message(&mut input, ReaderOptions::new())
            .unwrap()
            .unwrap();
        check_person(&reader, id as u32, name);
    }
    assert!(serialize_packed::try_read_message(&mut input, ReaderOptions::new())
        .unwrap()
        .is_none());
}

#[test]
fn flat_slice_reader_borrows_input() {
    let mut message = message::Builder::new_default();
    build_person(&mut message, 5, "Dave");
    let mut flat = serialize::write_message_to_words(&message);
    flat.extend_from_slice(&[1, 2, 3]);

    let mut input = &flat[..];
    let reader = serialize::read_message_from_flat_slice(&mut input, ReaderOptions::new()).unwrap();
    check_person(&reader, 5, "Dave");
    assert_eq!(input, &[1, 2, 3]);
}

#[test]
fn deep_copy_between_messages() {
    let mut source = message::Builder::new_default();
    build_person(&mut source, 42, "Eve");

    let mut copy = message::Builder::new_default();
    copy.set_root(source.get_root_as_reader::<any_pointer::Reader>().unwrap())
        .unwrap();

    let reader = copy.into_reader();
    check_person(&reader, 42, "Eve");
    assert_eq!(
        serialize::write_message_segments_to_words(reader.segments()),
        serialize::write_message_to_words(&source)
    );
}

#[cfg(feature = "sync_reader")]
#[test]
fn one_message_read_from_two_threads() {
    let mut message = message::Builder::new_default();
    build_person(&mut message, 42, "Shared");
    let flat = serialize::write_message_to_words(&message);
    let shared = serialize::read_message(&mut &flat[..], ReaderOptions::new())
        .unwrap()
        .into_shared();

    std::thread::scope(|scope| {
        let readers: Vec<_> = (0..2)
            .map(|_| {
                scope.spawn(|| {
                    for _ in 0..100 {
                        check_person_at(shared.get_root().unwrap(), 42, "Shared");
                    }
                })
            })
            .collect();
        for reader in readers {
            reader.join().unwrap();
        }
    });

    // The traversal budget is enforced across threads.
    let mut limits = ReaderOptions::new();
    limits.traversal_limit_in_words(flat.len() as u64 / 8);
    let tight = message::SharedReader::new(
        serialize::read_message(&mut &flat[..], ReaderOptions::new())
            .unwrap()
            .into_segments(),
        limits,
    );
    let exhausted = std::thread::scope(|scope| {
        let readers: Vec<_> = (0..2)
            .map(|_| {
                scope.spawn(|| {
                    (0..8)
                        .filter(|_| {
                            tight
                                .get_root::<any_pointer::Reader>()
                                .and_then(|root| root.get_as_struct(&PERSON))
                                .and_then(|person| person.get_named("name"))
                                .is_err()
                        })
                        .count()
                })
            })
            .collect();
        readers
            .into_iter()
            .map(|r| r.join().unwrap())
            .sum::<usize>()
    });
    assert!(exhausted > 0);
}
