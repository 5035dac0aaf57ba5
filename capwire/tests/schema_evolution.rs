use capwire::message::{self, ReaderOptions};
use capwire::schema::{DefaultValue, Field, FieldKind, StructSchema, Type, NO_DISCRIMINANT};
use capwire::{any_pointer, dynamic_struct, serialize, ErrorKind, NotInSchema};

static OLD: StructSchema = StructSchema {
    name: "Record",
    data_words: 1,
    pointer_count: 1,
    discriminant_count: 0,
    discriminant_offset: 0,
    fields: &[
        Field {
            name: "count",
            ordinal: 0,
            discriminant_value: NO_DISCRIMINANT,
            kind: FieldKind::Slot {
                offset: 0,
                ty: Type::Int32,
                default: DefaultValue::Zero,
            },
        },
        Field {
            name: "label",
            ordinal: 1,
            discriminant_value: NO_DISCRIMINANT,
            kind: FieldKind::Slot {
                offset: 0,
                ty: Type::Text,
                default: DefaultValue::Zero,
            },
        },
    ],
};

// Adds a data word, a pointer and a two-member union to `OLD`.
static NEW: StructSchema = StructSchema {
    name: "Record",
    data_words: 2,
    pointer_count: 2,
    discriminant_count: 2,
    discriminant_offset: 2,
    fields: &[
        Field {
            name: "count",
            ordinal: 0,
            discriminant_value: NO_DISCRIMINANT,
            kind: FieldKind::Slot {
                offset: 0,
                ty: Type::Int32,
                default: DefaultValue::Zero,
            },
        },
        Field {
            name: "label",
            ordinal: 1,
            discriminant_value: NO_DISCRIMINANT,
            kind: FieldKind::Slot {
                offset: 0,
                ty: Type::Text,
                default: DefaultValue::Zero,
            },
        },
        Field {
            name: "weight",
            ordinal: 2,
            discriminant_value: NO_DISCRIMINANT,
            kind: FieldKind::Slot {
                offset: 1,
                ty: Type::Float64,
                default: DefaultValue::Bits(1.5f64.to_bits()),
            },
        },
        Field {
            name: "note",
            ordinal: 3,
            discriminant_value: 0,
            kind: FieldKind::Slot {
                offset: 1,
                ty: Type::Text,
                default: DefaultValue::Text("none"),
            },
        },
        Field {
            name: "blob",
            ordinal: 4,
            discriminant_value: 1,
            kind: FieldKind::Slot {
                offset: 1,
                ty: Type::Data,
                default: DefaultValue::Zero,
            },
        },
    ],
};

fn write_old(count: i32, label: &str) -> Vec<u8> {
    let mut message = message::Builder::new_default();
    let mut root = message
        .init_root::<any_pointer::Builder>()
        .unwrap()
        .init_as_struct(&OLD)
        .unwrap();
    root.set_named("count", count.into()).unwrap();
    root.set_named("label", label.into()).unwrap();
    serialize::write_message_to_words(&message)
}

#[test]
fn new_reader_sees_defaults_in_old_message() {
    let bytes = write_old(-3, "old");
    let message = serialize::read_message(&mut &bytes[..], ReaderOptions::new()).unwrap();
    let root = message
        .get_root::<any_pointer::Reader>()
        .unwrap()
        .get_as_struct(&NEW)
        .unwrap();
    assert_eq!(root.get_named("count").unwrap().downcast::<i32>(), -3);
    assert_eq!(root.get_named("label").unwrap().downcast::<&str>(), "old");
    assert_eq!(root.get_named("weight").unwrap().downcast::<f64>(), 1.5);
    assert_eq!(root.which().unwrap().map(|f| f.name), Some("note"));
    assert_eq!(root.get_named("note").unwrap().downcast::<&str>(), "none");
    assert!(!root.has_named("note").unwrap());
}

#[test]
fn old_reader_skips_new_sections() {
    let mut message = message::Builder::new_default();
    {
        let mut root = message
            .init_root::<any_pointer::Builder>()
            .unwrap()
            .init_as_struct(&NEW)
            .unwrap();
        root.set_named("count", 9i32.into()).unwrap();
        root.set_named("label", "new".into()).unwrap();
        root.set_named("weight", 0.25f64.into()).unwrap();
        root.set_named("blob", (&[1u8, 2, 3][..]).into()).unwrap();
    }
    let bytes = serialize::write_message_to_words(&message);
    let message = serialize::read_message(&mut &bytes[..], ReaderOptions::new()).unwrap();

    let old = message
        .get_root::<any_pointer::Reader>()
        .unwrap()
        .get_as_struct(&OLD)
        .unwrap();
    assert_eq!(old.get_named("count").unwrap().downcast::<i32>(), 9);
    assert_eq!(old.get_named("label").unwrap().downcast::<&str>(), "new");

    let new = message
        .get_root::<any_pointer::Reader>()
        .unwrap()
        .get_as_struct(&NEW)
        .unwrap();
    assert_eq!(new.which().unwrap().map(|f| f.name), Some("blob"));
    assert_eq!(
        new.get_named("blob").unwrap().downcast::<&[u8]>(),
        &[1, 2, 3]
    );
    assert_eq!(new.get_named("weight").unwrap().downcast::<f64>(), 0.25);
}

#[test]
fn builder_grows_old_struct_in_place() {
    let bytes = write_old(11, "grow me");
    let old = serialize::read_message(&mut &bytes[..], ReaderOptions::new()).unwrap();

    let mut message = message::Builder::new_default();
    message
        .set_root(old.get_root::<any_pointer::Reader>().unwrap())
        .unwrap();
    let words_before = message.size_in_words();
    {
        // Asking for the larger layout moves the struct and keeps its contents.
        let mut root = message
            .get_root::<any_pointer::Builder>()
            .unwrap()
            .get_as_struct(&NEW)
            .unwrap();
        assert_eq!(root.reborrow_as_reader().get_named("count").unwrap().downcast::<i32>(), 11);
        root.set_named("note", "added later".into()).unwrap();
    }
    assert!(message.size_in_words() > words_before);

    let root = message
        .get_root_as_reader::<any_pointer::Reader>()
        .unwrap()
        .get_as_struct(&NEW)
        .unwrap();
    assert_eq!(root.get_named("label").unwrap().downcast::<&str>(), "grow me");
    assert_eq!(root.get_named("note").unwrap().downcast::<&str>(), "added later");
    assert_eq!(root.get_named("weight").unwrap().downcast::<f64>(), 1.5);
}

#[test]
fn discriminant_from_a_newer_schema() {
    let mut message = message::Builder::new_default();
    {
        let mut root = message
            .init_root::<any_pointer::Builder>()
            .unwrap()
            .init_as_struct(&NEW)
            .unwrap();
        root.set_named("count", 1i32.into()).unwrap();
    }
    let mut bytes = serialize::write_message_to_words(&message);
    // Segment table, root pointer, then the data section. The union tag sits at byte 4.
    bytes[16 + 4] = 3;

    let message = serialize::read_message(&mut &bytes[..], ReaderOptions::new()).unwrap();
    let root: dynamic_struct::Reader = message
        .get_root::<any_pointer::Reader>()
        .unwrap()
        .get_as_struct(&NEW)
        .unwrap();
    assert_eq!(root.which().err(), Some(NotInSchema(3)));
    assert_eq!(root.get_named("count").unwrap().downcast::<i32>(), 1);
}

#[test]
fn unknown_field_name() {
    let bytes = write_old(0, "");
    let message = serialize::read_message(&mut &bytes[..], ReaderOptions::new()).unwrap();
    let root = message
        .get_root::<any_pointer::Reader>()
        .unwrap()
        .get_as_struct(&OLD)
        .unwrap();
    let err = root.get_named("weight").err().unwrap();
    assert_eq!(err.kind, ErrorKind::FieldNotFound);
}
