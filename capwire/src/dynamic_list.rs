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

//! Dynamically-typed lists.

use crate::private::layout::{self, PrimitiveElement};
use crate::schema::Type;
use crate::traits::{IndexMove, ListIter};
use crate::{any_pointer, dynamic_struct, dynamic_value};
use crate::{Error, ErrorKind, Result};

/// A read-only dynamically-typed list.
#[derive(Copy, Clone)]
pub struct Reader<'a> {
    pub(crate) reader: layout::ListReader<'a>,
    element_type: Type,
}

impl<'a> From<Reader<'a>> for dynamic_value::Reader<'a> {
    fn from(x: Reader<'a>) -> dynamic_value::Reader<'a> {
        dynamic_value::Reader::List(x)
    }
}

impl<'a> Reader<'a> {
    pub(crate) fn new(reader: layout::ListReader<'a>, element_type: Type) -> Self {
        Self {
            reader,
            element_type,
        }
    }

    pub fn len(&self) -> u32 {
        self.reader.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn element_type(&self) -> Type {
        self.element_type
    }

    /// Panics if `index` is out of range.
    pub fn get(self, index: u32) -> Result<dynamic_value::Reader<'a>> {
        assert!(index < self.reader.len());
        let r = &self.reader;
        let value = match self.element_type {
            Type::Void => dynamic_value::Reader::Void,
            Type::Bool => dynamic_value::Reader::Bool(PrimitiveElement::get(r, index)),
            Type::Int8 => dynamic_value::Reader::Int8(PrimitiveElement::get(r, index)),
            Type::Int16 => dynamic_value::Reader::Int16(PrimitiveElement::get(r, index)),
            Type::Int32 => dynamic_value::Reader::Int32(PrimitiveElement::get(r, index)),
            Type::Int64 => dynamic_value::Reader::Int64(PrimitiveElement::get(r, index)),
            Type::UInt8 => dynamic_value::Reader::UInt8(PrimitiveElement::get(r, index)),
            Type::UInt16 => dynamic_value::Reader::UInt16(PrimitiveElement::get(r, index)),
            Type::UInt32 => dynamic_value::Reader::UInt32(PrimitiveElement::get(r, index)),
            Type::UInt64 => dynamic_value::Reader::UInt64(PrimitiveElement::get(r, index)),
            Type::Float32 => dynamic_value::Reader::Float32(PrimitiveElement::get(r, index)),
            Type::Float64 => dynamic_value::Reader::Float64(PrimitiveElement::get(r, index)),
            Type::Enum => dynamic_value::Reader::Enum(PrimitiveElement::get(r, index)),
            Type::Text => dynamic_value::Reader::Text(
                r.get_pointer_element(index).get_text()?.unwrap_or(""),
            ),
            Type::Data => dynamic_value::Reader::Data(
                r.get_pointer_element(index).get_data()?.unwrap_or(&[]),
            ),
            Type::List(element_type) => Reader {
                reader: r
                    .get_pointer_element(index)
                    .get_list(Some(element_type.element_size()))?,
                element_type: *element_type,
            }
            .into(),
            Type::Struct(schema) => {
                dynamic_struct::Reader::new(r.get_struct_element(index), schema).into()
            }
            Type::AnyPointer => {
                dynamic_value::Reader::AnyPointer(any_pointer::Reader::new(r.get_pointer_element(index)))
            }
            Type::Capability => {
                dynamic_value::Reader::Capability(any_pointer::Reader::new(r.get_pointer_element(index)))
            }
        };
        Ok(value)
    }

    pub fn try_get(self, index: u32) -> Option<Result<dynamic_value::Reader<'a>>> {
        if index < self.reader.len() {
            Some(self.get(index))
        } else {
            None
        }
    }

    pub fn iter(self) -> ListIter<Reader<'a>, Result<dynamic_value::Reader<'a>>> {
        ListIter::new(self, self.len())
    }
}

impl<'a> IndexMove<u32, Result<dynamic_value::Reader<'a>>> for Reader<'a> {
    fn index_move(&self, index: u32) -> Result<dynamic_value::Reader<'a>> {
        self.get(index)
    }
}

impl<'a> IntoIterator for Reader<'a> {
    type Item = Result<dynamic_value::Reader<'a>>;
    type IntoIter = ListIter<Reader<'a>, Self::Item>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// A mutable dynamically-typed list.
pub struct Builder<'a> {
    builder: layout::ListBuilder<'a>,
    element_type: Type,
}

impl<'a> From<Builder<'a>> for dynamic_value::Builder<'a> {
    fn from(x: Builder<'a>) -> dynamic_value::Builder<'a> {
        dynamic_value::Builder::List(x)
    }
}

impl<'a> Builder<'a> {
    pub(crate) fn new(builder: layout::ListBuilder<'a>, element_type: Type) -> Self {
        Self {
            builder,
            element_type,
        }
    }

    pub fn reborrow(&mut self) -> Builder<'_> {
        Builder {
            builder: self.builder.reborrow(),
            element_type: self.element_type,
        }
    }

    pub fn into_reader(self) -> Reader<'a> {
        Reader {
            reader: self.builder.into_reader(),
            element_type: self.element_type,
        }
    }

    pub fn len(&self) -> u32 {
        self.builder.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn element_type(&self) -> Type {
        self.element_type
    }

    /// Panics if `index` is out of range.
    pub fn get(self, index: u32) -> Result<dynamic_value::Builder<'a>> {
        assert!(index < self.builder.len());
        let b = &self.builder;
        let value = match self.element_type {
            Type::Void => dynamic_value::Builder::Void,
            Type::Bool => dynamic_value::Builder::Bool(PrimitiveElement::get_from_builder(b, index)),
            Type::Int8 => dynamic_value::Builder::Int8(PrimitiveElement::get_from_builder(b, index)),
            Type::Int16 => {
                dynamic_value::Builder::Int16(PrimitiveElement::get_from_builder(b, index))
            }
            Type::Int32 => {
                dynamic_value::Builder::Int32(PrimitiveElement::get_from_builder(b, index))
            }
            Type::Int64 => {
                dynamic_value::Builder::Int64(PrimitiveElement::get_from_builder(b, index))
            }
            Type::UInt8 => {
                dynamic_value::Builder::UInt8(PrimitiveElement::get_from_builder(b, index))
            }
            Type::UInt16 => {
                dynamic_value::Builder::UInt16(PrimitiveElement::get_from_builder(b, index))
            }
            Type::UInt32 => {
                dynamic_value::Builder::UInt32(PrimitiveElement::get_from_builder(b, index))
            }
            Type::UInt64 => {
                dynamic_value::Builder::UInt64(PrimitiveElement::get_from_builder(b, index))
            }
            Type::Float32 => {
                dynamic_value::Builder::Float32(PrimitiveElement::get_from_builder(b, index))
            }
            Type::Float64 => {
                dynamic_value::Builder::Float64(PrimitiveElement::get_from_builder(b, index))
            }
            Type::Enum => dynamic_value::Builder::Enum(PrimitiveElement::get_from_builder(b, index)),
            Type::Text => {
                dynamic_value::Builder::Text(self.builder.get_pointer_element(index).get_text()?)
            }
            Type::Data => {
                dynamic_value::Builder::Data(self.builder.get_pointer_element(index).get_data()?)
            }
            Type::List(&Type::Struct(schema)) => Builder {
                builder: self
                    .builder
                    .get_pointer_element(index)
                    .get_struct_list(schema.struct_size())?,
                element_type: Type::Struct(schema),
            }
            .into(),
            Type::List(element_type) => Builder {
                builder: self
                    .builder
                    .get_pointer_element(index)
                    .get_list(element_type.element_size())?,
                element_type: *element_type,
            }
            .into(),
            Type::Struct(schema) => {
                dynamic_struct::Builder::new(self.builder.get_struct_element(index), schema).into()
            }
            Type::AnyPointer => dynamic_value::Builder::AnyPointer(any_pointer::Builder::new(
                self.builder.get_pointer_element(index),
            )),
            Type::Capability => dynamic_value::Builder::Capability(any_pointer::Builder::new(
                self.builder.get_pointer_element(index),
            )),
        };
        Ok(value)
    }

    /// Writes `value` at `index`. Struct elements are overwritten with a copy of `value`,
    /// truncated to the list's element size.
    pub fn set(&mut self, index: u32, value: dynamic_value::Reader<'_>) -> Result<()> {
        assert!(index < self.builder.len());
        let b = &mut self.builder;
        match (self.element_type, value) {
            (Type::Void, dynamic_value::Reader::Void) => {}
            (Type::Bool, dynamic_value::Reader::Bool(v)) => PrimitiveElement::set(b, index, v),
            (Type::Int8, dynamic_value::Reader::Int8(v)) => PrimitiveElement::set(b, index, v),
            (Type::Int16, dynamic_value::Reader::Int16(v)) => PrimitiveElement::set(b, index, v),
            (Type::Int32, dynamic_value::Reader::Int32(v)) => PrimitiveElement::set(b, index, v),
            (Type::Int64, dynamic_value::Reader::Int64(v)) => PrimitiveElement::set(b, index, v),
            (Type::UInt8, dynamic_value::Reader::UInt8(v)) => PrimitiveElement::set(b, index, v),
            (Type::UInt16, dynamic_value::Reader::UInt16(v)) => PrimitiveElement::set(b, index, v),
            (Type::UInt32, dynamic_value::Reader::UInt32(v)) => PrimitiveElement::set(b, index, v),
            (Type::UInt64, dynamic_value::Reader::UInt64(v)) => PrimitiveElement::set(b, index, v),
            (Type::Float32, dynamic_value::Reader::Float32(v)) => {
                PrimitiveElement::set(b, index, v)
            }
            (Type::Float64, dynamic_value::Reader::Float64(v)) => {
                PrimitiveElement::set(b, index, v)
            }
            (Type::Enum, dynamic_value::Reader::Enum(v)) => PrimitiveElement::set(b, index, v),
            (Type::Text, dynamic_value::Reader::Text(t)) => {
                b.reborrow().get_pointer_element(index).set_text(t)?
            }
            (Type::Data, dynamic_value::Reader::Data(d)) => {
                b.reborrow().get_pointer_element(index).set_data(d)?
            }
            (Type::List(_), dynamic_value::Reader::List(l)) => {
                b.reborrow().get_pointer_element(index).set_list(&l.reader)?
            }
            (Type::Struct(_), dynamic_value::Reader::Struct(s)) => b
                .reborrow()
                .get_struct_element(index)
                .copy_content_from(&s.reader)?,
            (Type::AnyPointer, dynamic_value::Reader::AnyPointer(a))
            | (Type::Capability, dynamic_value::Reader::Capability(a)) => b
                .reborrow()
                .get_pointer_element(index)
                .copy_from(a.into_pointer_reader())?,
            _ => return Err(Error::from_kind(ErrorKind::TypeMismatch)),
        }
        Ok(())
    }

    /// Initializes the list, text or data element at `index` with room for `size` elements.
    pub fn init(self, index: u32, size: u32) -> Result<dynamic_value::Builder<'a>> {
        assert!(index < self.builder.len());
        let p = self.builder.get_pointer_element(index);
        match self.element_type {
            Type::List(&Type::Struct(schema)) => Ok(Builder {
                builder: p.init_struct_list(size, schema.struct_size())?,
                element_type: Type::Struct(schema),
            }
            .into()),
            Type::List(element_type) => Ok(Builder {
                builder: p.init_list(element_type.element_size(), size)?,
                element_type: *element_type,
            }
            .into()),
            Type::Text => Ok(dynamic_value::Builder::Text(p.init_text(size)?)),
            Type::Data => Ok(dynamic_value::Builder::Data(p.init_data(size)?)),
            _ => Err(Error::from_kind(ErrorKind::TypeMismatch)),
        }
    }
}
