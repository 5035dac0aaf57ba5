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

//! Dynamically-typed structs.

use crate::private::layout;
use crate::private::units::WirePointerCount16;
use crate::schema::{DefaultValue, Field, FieldKind, StructSchema, Type};
use crate::{any_pointer, dynamic_list, dynamic_value};
use crate::{Error, ErrorKind, NotInSchema, Result};

fn type_mismatch(field: &Field) -> Error {
    Error::from_kind_context(ErrorKind::TypeMismatch, format!("field {}", field.name))
}

fn pointer_index(offset: u32) -> WirePointerCount16 {
    offset as WirePointerCount16
}

/// A read-only dynamically-typed struct.
#[derive(Clone, Copy)]
pub struct Reader<'a> {
    pub(crate) reader: layout::StructReader<'a>,
    schema: &'static StructSchema,
}

impl<'a> From<Reader<'a>> for dynamic_value::Reader<'a> {
    fn from(x: Reader<'a>) -> dynamic_value::Reader<'a> {
        dynamic_value::Reader::Struct(x)
    }
}

impl<'a> Reader<'a> {
    pub fn new(reader: layout::StructReader<'a>, schema: &'static StructSchema) -> Self {
        Self { reader, schema }
    }

    pub fn total_size(&self) -> Result<crate::MessageSize> {
        self.reader.total_size()
    }

    pub fn get_schema(&self) -> &'static StructSchema {
        self.schema
    }

    pub fn get(self, field: &Field) -> Result<dynamic_value::Reader<'a>> {
        let (offset, ty, default) = match field.kind {
            FieldKind::Group(schema) => return Ok(Reader::new(self.reader, schema).into()),
            FieldKind::Slot {
                offset,
                ty,
                default,
            } => (offset, ty, default),
        };
        let mask = default.bits();
        let at = offset as usize;
        let value = match ty {
            Type::Void => dynamic_value::Reader::Void,
            Type::Bool => {
                dynamic_value::Reader::Bool(self.reader.get_bool_field_mask(offset, mask != 0))
            }
            Type::Int8 => dynamic_value::Reader::Int8(self.reader.get_data_field_mask(at, mask)),
            Type::Int16 => dynamic_value::Reader::Int16(self.reader.get_data_field_mask(at, mask)),
            Type::Int32 => dynamic_value::Reader::Int32(self.reader.get_data_field_mask(at, mask)),
            Type::Int64 => dynamic_value::Reader::Int64(self.reader.get_data_field_mask(at, mask)),
            Type::UInt8 => dynamic_value::Reader::UInt8(self.reader.get_data_field_mask(at, mask)),
            Type::UInt16 => {
                dynamic_value::Reader::UInt16(self.reader.get_data_field_mask(at, mask))
            }
            Type::UInt32 => {
                dynamic_value::Reader::UInt32(self.reader.get_data_field_mask(at, mask))
            }
            Type::UInt64 => {
                dynamic_value::Reader::UInt64(self.reader.get_data_field_mask(at, mask))
            }
            Type::Float32 => {
                dynamic_value::Reader::Float32(self.reader.get_data_field_mask(at, mask))
            }
            Type::Float64 => {
                dynamic_value::Reader::Float64(self.reader.get_data_field_mask(at, mask))
            }
            Type::Enum => dynamic_value::Reader::Enum(self.reader.get_data_field_mask(at, mask)),
            Type::Text => {
                let p = self.reader.get_pointer_field(pointer_index(offset));
                match (p.get_text()?, default) {
                    (Some(t), _) => dynamic_value::Reader::Text(t),
                    (None, DefaultValue::Text(t)) => dynamic_value::Reader::Text(t),
                    (None, _) => dynamic_value::Reader::Text(""),
                }
            }
            Type::Data => {
                let p = self.reader.get_pointer_field(pointer_index(offset));
                match (p.get_data()?, default) {
                    (Some(d), _) => dynamic_value::Reader::Data(d),
                    (None, DefaultValue::Data(d)) => dynamic_value::Reader::Data(d),
                    (None, _) => dynamic_value::Reader::Data(&[]),
                }
            }
            Type::Struct(schema) => {
                let p = self.reader.get_pointer_field(pointer_index(offset));
                Reader::new(p.get_struct()?, schema).into()
            }
            Type::List(element_type) => {
                let p = self.reader.get_pointer_field(pointer_index(offset));
                let list = p.get_list(Some(element_type.element_size()))?;
                dynamic_list::Reader::new(list, *element_type).into()
            }
            Type::AnyPointer => dynamic_value::Reader::AnyPointer(any_pointer::Reader::new(
                self.reader.get_pointer_field(pointer_index(offset)),
            )),
            Type::Capability => dynamic_value::Reader::Capability(any_pointer::Reader::new(
                self.reader.get_pointer_field(pointer_index(offset)),
            )),
        };
        Ok(value)
    }

    /// Gets the field with the given name.
    pub fn get_named(self, field_name: &str) -> Result<dynamic_value::Reader<'a>> {
        self.get(self.schema.get_field_by_name(field_name)?)
    }

    /// If this struct has union fields, returns the one that is currently active.
    /// Otherwise, returns None. A discriminant written by a newer schema that this one does
    /// not know about yields `NotInSchema`.
    pub fn which(&self) -> core::result::Result<Option<&'static Field>, NotInSchema> {
        if self.schema.discriminant_count == 0 {
            return Ok(None);
        }
        let discrim = self
            .reader
            .get_data_field::<u16>(self.schema.discriminant_offset as usize);
        match self.schema.field_by_discriminant(discrim) {
            Some(field) => Ok(Some(field)),
            None => Err(NotInSchema(discrim)),
        }
    }

    /// Returns `false` if the field is a pointer and the pointer is null, or if the field is a
    /// union member that is not active.
    pub fn has(&self, field: &Field) -> bool {
        if field.is_union_member() {
            let discrim = self
                .reader
                .get_data_field::<u16>(self.schema.discriminant_offset as usize);
            if discrim != field.discriminant_value {
                return false;
            }
        }
        match field.kind {
            FieldKind::Group(_) => true,
            FieldKind::Slot { offset, ty, .. } => {
                !ty.is_pointer_type()
                    || !self
                        .reader
                        .get_pointer_field(pointer_index(offset))
                        .is_null()
            }
        }
    }

    pub fn has_named(&self, field_name: &str) -> Result<bool> {
        Ok(self.has(self.schema.get_field_by_name(field_name)?))
    }
}

/// A mutable dynamically-typed struct.
pub struct Builder<'a> {
    builder: layout::StructBuilder<'a>,
    schema: &'static StructSchema,
}

impl<'a> From<Builder<'a>> for dynamic_value::Builder<'a> {
    fn from(x: Builder<'a>) -> dynamic_value::Builder<'a> {
        dynamic_value::Builder::Struct(x)
    }
}

impl<'a> Builder<'a> {
    pub fn new(builder: layout::StructBuilder<'a>, schema: &'static StructSchema) -> Self {
        Self { builder, schema }
    }

    pub fn reborrow(&mut self) -> Builder<'_> {
        Builder {
            builder: self.builder.reborrow(),
            schema: self.schema,
        }
    }

    pub fn reborrow_as_reader(&self) -> Reader<'_> {
        Reader {
            reader: self.builder.as_reader(),
            schema: self.schema,
        }
    }

    pub fn into_reader(self) -> Reader<'a> {
        Reader {
            schema: self.schema,
            reader: self.builder.into_reader(),
        }
    }

    pub fn get_schema(&self) -> &'static StructSchema {
        self.schema
    }

    pub fn get(self, field: &Field) -> Result<dynamic_value::Builder<'a>> {
        let (offset, ty, default) = match field.kind {
            FieldKind::Group(schema) => return Ok(Builder::new(self.builder, schema).into()),
            FieldKind::Slot {
                offset,
                ty,
                default,
            } => (offset, ty, default),
        };
        let mask = default.bits();
        let at = offset as usize;
        let b = &self.builder;
        let value = match ty {
            Type::Void => dynamic_value::Builder::Void,
            Type::Bool => dynamic_value::Builder::Bool(b.get_bool_field_mask(offset, mask != 0)),
            Type::Int8 => dynamic_value::Builder::Int8(b.get_data_field_mask(at, mask)),
            Type::Int16 => dynamic_value::Builder::Int16(b.get_data_field_mask(at, mask)),
            Type::Int32 => dynamic_value::Builder::Int32(b.get_data_field_mask(at, mask)),
            Type::Int64 => dynamic_value::Builder::Int64(b.get_data_field_mask(at, mask)),
            Type::UInt8 => dynamic_value::Builder::UInt8(b.get_data_field_mask(at, mask)),
            Type::UInt16 => dynamic_value::Builder::UInt16(b.get_data_field_mask(at, mask)),
            Type::UInt32 => dynamic_value::Builder::UInt32(b.get_data_field_mask(at, mask)),
            Type::UInt64 => dynamic_value::Builder::UInt64(b.get_data_field_mask(at, mask)),
            Type::Float32 => dynamic_value::Builder::Float32(b.get_data_field_mask(at, mask)),
            Type::Float64 => dynamic_value::Builder::Float64(b.get_data_field_mask(at, mask)),
            Type::Enum => dynamic_value::Builder::Enum(b.get_data_field_mask(at, mask)),
            Type::Text => {
                let mut p = self.builder.get_pointer_field(pointer_index(offset));
                if p.is_null() {
                    if let DefaultValue::Text(t) = default {
                        p.set_text(t)?;
                    }
                }
                dynamic_value::Builder::Text(p.get_text()?)
            }
            Type::Data => {
                let mut p = self.builder.get_pointer_field(pointer_index(offset));
                if p.is_null() {
                    if let DefaultValue::Data(d) = default {
                        p.set_data(d)?;
                    }
                }
                dynamic_value::Builder::Data(p.get_data()?)
            }
            Type::Struct(schema) => {
                let p = self.builder.get_pointer_field(pointer_index(offset));
                Builder::new(p.get_struct(schema.struct_size())?, schema).into()
            }
            Type::List(element_type) => {
                let p = self.builder.get_pointer_field(pointer_index(offset));
                let list = match element_type {
                    Type::Struct(schema) => p.get_struct_list(schema.struct_size())?,
                    other => p.get_list(other.element_size())?,
                };
                dynamic_list::Builder::new(list, *element_type).into()
            }
            Type::AnyPointer => dynamic_value::Builder::AnyPointer(any_pointer::Builder::new(
                self.builder.get_pointer_field(pointer_index(offset)),
            )),
            Type::Capability => dynamic_value::Builder::Capability(any_pointer::Builder::new(
                self.builder.get_pointer_field(pointer_index(offset)),
            )),
        };
        Ok(value)
    }

    pub fn get_named(self, field_name: &str) -> Result<dynamic_value::Builder<'a>> {
        let field = self.schema.get_field_by_name(field_name)?;
        self.get(field)
    }

    pub fn which(&self) -> core::result::Result<Option<&'static Field>, NotInSchema> {
        self.reborrow_as_reader().which()
    }

    pub fn has(&self, field: &Field) -> bool {
        self.reborrow_as_reader().has(field)
    }

    /// Writes `value` into `field`. Writing a union member also makes it the active member.
    pub fn set(&mut self, field: &Field, value: dynamic_value::Reader<'_>) -> Result<()> {
        self.set_in_union(field);
        let (offset, ty, default) = match field.kind {
            FieldKind::Slot {
                offset,
                ty,
                default,
            } => (offset, ty, default),
            FieldKind::Group(schema) => {
                let dynamic_value::Reader::Struct(from) = value else {
                    return Err(type_mismatch(field));
                };
                let mut group = Builder::new(self.builder.reborrow(), schema);
                for f in schema.fields {
                    if !f.is_union_member() || from.has(f) {
                        group.set(f, from.get(f)?)?;
                    }
                }
                return Ok(());
            }
        };
        let mask = default.bits();
        let at = offset as usize;
        let b = &mut self.builder;
        match (ty, value) {
            (Type::Void, dynamic_value::Reader::Void) => {}
            (Type::Bool, dynamic_value::Reader::Bool(v)) => {
                b.set_bool_field_mask(offset, v, mask != 0)
            }
            (Type::Int8, dynamic_value::Reader::Int8(v)) => b.set_data_field_mask(at, v, mask),
            (Type::Int16, dynamic_value::Reader::Int16(v)) => b.set_data_field_mask(at, v, mask),
            (Type::Int32, dynamic_value::Reader::Int32(v)) => b.set_data_field_mask(at, v, mask),
            (Type::Int64, dynamic_value::Reader::Int64(v)) => b.set_data_field_mask(at, v, mask),
            (Type::UInt8, dynamic_value::Reader::UInt8(v)) => b.set_data_field_mask(at, v, mask),
            (Type::UInt16, dynamic_value::Reader::UInt16(v)) => b.set_data_field_mask(at, v, mask),
            (Type::UInt32, dynamic_value::Reader::UInt32(v)) => b.set_data_field_mask(at, v, mask),
            (Type::UInt64, dynamic_value::Reader::UInt64(v)) => b.set_data_field_mask(at, v, mask),
            (Type::Float32, dynamic_value::Reader::Float32(v)) => {
                b.set_data_field_mask(at, v, mask)
            }
            (Type::Float64, dynamic_value::Reader::Float64(v)) => {
                b.set_data_field_mask(at, v, mask)
            }
            (Type::Enum, dynamic_value::Reader::Enum(v)) => b.set_data_field_mask(at, v, mask),
            (Type::Text, dynamic_value::Reader::Text(t)) => {
                b.get_pointer_field_mut(pointer_index(offset)).set_text(t)?
            }
            (Type::Data, dynamic_value::Reader::Data(d)) => {
                b.get_pointer_field_mut(pointer_index(offset)).set_data(d)?
            }
            (Type::Struct(_), dynamic_value::Reader::Struct(s)) => b
                .get_pointer_field_mut(pointer_index(offset))
                .set_struct(&s.reader)?,
            (Type::List(_), dynamic_value::Reader::List(l)) => b
                .get_pointer_field_mut(pointer_index(offset))
                .set_list(&l.reader)?,
            (Type::AnyPointer, dynamic_value::Reader::AnyPointer(a))
            | (Type::Capability, dynamic_value::Reader::Capability(a)) => b
                .get_pointer_field_mut(pointer_index(offset))
                .copy_from(a.into_pointer_reader())?,
            _ => return Err(type_mismatch(field)),
        }
        Ok(())
    }

    pub fn set_named(&mut self, field_name: &str, value: dynamic_value::Reader<'_>) -> Result<()> {
        let field = self.schema.get_field_by_name(field_name)?;
        self.set(field, value)
    }

    /// Initializes a struct-typed field, or clears a group, and returns a builder for it.
    pub fn init(mut self, field: &Field) -> Result<dynamic_value::Builder<'a>> {
        self.set_in_union(field);
        match field.kind {
            FieldKind::Group(schema) => {
                let mut group = Builder::new(self.builder, schema);
                for f in schema.fields {
                    group.clear(f)?;
                }
                Ok(group.into())
            }
            FieldKind::Slot {
                offset,
                ty: Type::Struct(schema),
                ..
            } => {
                let p = self.builder.get_pointer_field(pointer_index(offset));
                Ok(Builder::new(p.init_struct(schema.struct_size())?, schema).into())
            }
            FieldKind::Slot { .. } => Err(type_mismatch(field)),
        }
    }

    pub fn init_named(self, field_name: &str) -> Result<dynamic_value::Builder<'a>> {
        let field = self.schema.get_field_by_name(field_name)?;
        self.init(field)
    }

    /// Initializes a list, text or data field with room for `size` elements.
    pub fn initn(mut self, field: &Field, size: u32) -> Result<dynamic_value::Builder<'a>> {
        self.set_in_union(field);
        let FieldKind::Slot { offset, ty, .. } = field.kind else {
            return Err(type_mismatch(field));
        };
        let p = self.builder.get_pointer_field(pointer_index(offset));
        match ty {
            Type::List(&Type::Struct(schema)) => Ok(dynamic_list::Builder::new(
                p.init_struct_list(size, schema.struct_size())?,
                Type::Struct(schema),
            )
            .into()),
            Type::List(element_type) => Ok(dynamic_list::Builder::new(
                p.init_list(element_type.element_size(), size)?,
                *element_type,
            )
            .into()),
            Type::Text => Ok(dynamic_value::Builder::Text(p.init_text(size)?)),
            Type::Data => Ok(dynamic_value::Builder::Data(p.init_data(size)?)),
            _ => Err(type_mismatch(field)),
        }
    }

    pub fn initn_named(self, field_name: &str, size: u32) -> Result<dynamic_value::Builder<'a>> {
        let field = self.schema.get_field_by_name(field_name)?;
        self.initn(field, size)
    }

    /// Resets a field to its default. Pointer fields become null; the objects they pointed to
    /// are zeroed.
    pub fn clear(&mut self, field: &Field) -> Result<()> {
        self.set_in_union(field);
        match field.kind {
            FieldKind::Group(schema) => {
                let mut group = Builder::new(self.builder.reborrow(), schema);
                for f in schema.fields {
                    group.clear(f)?;
                }
            }
            FieldKind::Slot { offset, ty, .. } => {
                let at = offset as usize;
                let b = &mut self.builder;
                match ty {
                    Type::Void => {}
                    Type::Bool => b.set_bool_field(offset, false),
                    Type::Int8 | Type::UInt8 => b.set_data_field::<u8>(at, 0),
                    Type::Int16 | Type::UInt16 | Type::Enum => b.set_data_field::<u16>(at, 0),
                    Type::Int32 | Type::UInt32 | Type::Float32 => b.set_data_field::<u32>(at, 0),
                    Type::Int64 | Type::UInt64 | Type::Float64 => b.set_data_field::<u64>(at, 0),
                    Type::Text
                    | Type::Data
                    | Type::Struct(_)
                    | Type::List(_)
                    | Type::AnyPointer
                    | Type::Capability => b.get_pointer_field_mut(pointer_index(offset)).clear(),
                }
            }
        }
        Ok(())
    }

    pub fn clear_named(&mut self, field_name: &str) -> Result<()> {
        let field = self.schema.get_field_by_name(field_name)?;
        self.clear(field)
    }

    fn set_in_union(&mut self, field: &Field) {
        if field.is_union_member() {
            self.builder.set_data_field::<u16>(
                self.schema.discriminant_offset as usize,
                field.discriminant_value,
            );
        }
    }
}

#[cfg(test)]
mod test {
    use crate::dynamic_value;
    use crate::message;
    use crate::schema::test_schemas::{PERSON_V1, PERSON_V2, SHAPE};
    use crate::ErrorKind;

    #[test]
    fn defaults_apply_to_unset_fields() {
        let mut message = message::Builder::new_default();
        {
            let root = message
                .init_root::<crate::any_pointer::Builder>()
                .unwrap()
                .init_as_struct(&PERSON_V2)
                .unwrap();
            let reader = root.into_reader();
            assert_eq!(reader.get_named("age").unwrap().downcast::<u16>(), 18);
            assert!(reader.get_named("active").unwrap().downcast::<bool>());
            assert_eq!(
                reader.get_named("email").unwrap().downcast::<&str>(),
                "nobody@example.com"
            );
        }
        let mut root = message
            .get_root::<crate::any_pointer::Builder>()
            .unwrap()
            .get_as_struct(&PERSON_V2)
            .unwrap();
        root.set_named("age", 40u16.into()).unwrap();
        root.set_named("active", false.into()).unwrap();
        let reader = root.into_reader();
        assert_eq!(reader.get_named("age").unwrap().downcast::<u16>(), 40);
        assert!(!reader.get_named("active").unwrap().downcast::<bool>());
    }

    #[test]
    fn old_reader_ignores_new_fields() {
        let mut message = message::Builder::new_default();
        {
            let mut root = message
                .init_root::<crate::any_pointer::Builder>()
                .unwrap()
                .init_as_struct(&PERSON_V2)
                .unwrap();
            root.set_named("id", 7u32.into()).unwrap();
            root.set_named("name", "Bob".into()).unwrap();
            root.set_named("email", "bob@example.com".into()).unwrap();
        }
        let root = message
            .get_root_as_reader::<crate::any_pointer::Reader>()
            .unwrap()
            .get_as_struct(&PERSON_V1)
            .unwrap();
        assert_eq!(root.get_named("id").unwrap().downcast::<u32>(), 7);
        assert_eq!(root.get_named("name").unwrap().downcast::<&str>(), "Bob");
        assert_eq!(
            root.get_named("email").err().map(|e| e.kind),
            Some(ErrorKind::FieldNotFound)
        );
    }

    #[test]
    fn union_and_group() {
        let mut message = message::Builder::new_default();
        let mut root = message
            .init_root::<crate::any_pointer::Builder>()
            .unwrap()
            .init_as_struct(&SHAPE)
            .unwrap();
        assert_eq!(root.which().unwrap().map(|f| f.name), Some("circle"));

        root.set_named("label", "square".into()).unwrap();
        assert_eq!(root.which().unwrap().map(|f| f.name), Some("label"));
        assert!(!root.has(SHAPE.get_field_by_name("circle").unwrap()));

        {
            let mut dims = root
                .reborrow()
                .get_named("dimensions")
                .unwrap()
                .downcast::<super::Builder>();
            dims.set_named("width", 2.5f32.into()).unwrap();
            dims.set_named("height", 4.0f32.into()).unwrap();
        }
        {
            let mut tags = root
                .reborrow()
                .initn_named("tags", 3)
                .unwrap()
                .downcast::<crate::dynamic_list::Builder>();
            for i in 0..3 {
                tags.set(i, dynamic_value::Reader::UInt16(10 * i as u16)).unwrap();
            }
        }

        let reader = root.into_reader();
        let dims = reader
            .get_named("dimensions")
            .unwrap()
            .downcast::<super::Reader>();
        assert_eq!(dims.get_named("width").unwrap().downcast::<f32>(), 2.5);
        assert_eq!(dims.get_named("height").unwrap().downcast::<f32>(), 4.0);
        let tags = reader
            .get_named("tags")
            .unwrap()
            .downcast::<crate::dynamic_list::Reader>();
        assert_eq!(tags.len(), 3);
        assert_eq!(tags.get(2).unwrap().downcast::<u16>(), 20);
        assert_eq!(reader.get_named("label").unwrap().downcast::<&str>(), "square");
    }

    #[test]
    fn unknown_discriminant_is_not_in_schema() {
        let mut message = message::Builder::new_default();
        let mut root = message
            .init_root::<crate::any_pointer::Builder>()
            .unwrap()
            .init_as_struct(&SHAPE)
            .unwrap();
        root.set_named("label", "x".into()).unwrap();
        let mut raw = message
            .get_root::<crate::any_pointer::Builder>()
            .unwrap()
            .get_as_struct(&SHAPE)
            .unwrap();
        // A newer writer selected a third member.
        raw.builder.set_data_field::<u16>(0, 5);
        assert_eq!(raw.which().err(), Some(crate::NotInSchema(5)));
    }

    #[test]
    fn mismatched_value_is_rejected() {
        let mut message = message::Builder::new_default();
        let mut root = message
            .init_root::<crate::any_pointer::Builder>()
            .unwrap()
            .init_as_struct(&PERSON_V1)
            .unwrap();
        let err = root.set_named("id", "seven".into()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::TypeMismatch);
    }
}
