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

//! Dynamically typed values.

use crate::{any_pointer, data, dynamic_list, dynamic_struct, text};

/// A dynamically-typed read-only value.
#[derive(Clone, Copy)]
pub enum Reader<'a> {
    Void,
    Bool(bool),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Float32(f32),
    Float64(f64),

    /// Raw enumerant value.
    Enum(u16),
    Text(text::Reader<'a>),
    Data(data::Reader<'a>),
    Struct(dynamic_struct::Reader<'a>),
    List(dynamic_list::Reader<'a>),
    AnyPointer(any_pointer::Reader<'a>),

    /// The pointer holding the capability. Use `get_as_capability()` to extract a client.
    Capability(any_pointer::Reader<'a>),
}

impl<'a> Reader<'a> {
    /// Downcasts the `Reader` into a more specific type. Panics if the
    /// expected type does not match the value.
    pub fn downcast<T: DowncastReader<'a>>(self) -> T {
        T::downcast_reader(self)
    }

    /// Like `downcast()`, but fails with `TypeMismatch` instead of panicking.
    pub fn try_downcast<T: DowncastReader<'a>>(self) -> crate::Result<T> {
        T::try_downcast_reader(self)
            .ok_or_else(|| crate::Error::from_kind(crate::ErrorKind::TypeMismatch))
    }
}

impl<'a> From<()> for Reader<'a> {
    fn from((): ()) -> Reader<'a> {
        Reader::Void
    }
}

macro_rules! primitive_dynamic_value(
    ($t:ty, $v:ident) => (
        impl <'a> From<$t> for Reader<'a> {
            fn from(x: $t) -> Reader<'a> { Reader::$v(x) }
        }
    )
);

primitive_dynamic_value!(bool, Bool);
primitive_dynamic_value!(i8, Int8);
primitive_dynamic_value!(i16, Int16);
primitive_dynamic_value!(i32, Int32);
primitive_dynamic_value!(i64, Int64);
primitive_dynamic_value!(u8, UInt8);
primitive_dynamic_value!(u16, UInt16);
primitive_dynamic_value!(u32, UInt32);
primitive_dynamic_value!(u64, UInt64);
primitive_dynamic_value!(f32, Float32);
primitive_dynamic_value!(f64, Float64);

impl<'a> From<&'a str> for Reader<'a> {
    fn from(t: &'a str) -> Reader<'a> {
        Reader::Text(t)
    }
}

impl<'a> From<&'a [u8]> for Reader<'a> {
    fn from(d: &'a [u8]) -> Reader<'a> {
        Reader::Data(d)
    }
}

impl<'a> From<any_pointer::Reader<'a>> for Reader<'a> {
    fn from(a: any_pointer::Reader<'a>) -> Reader<'a> {
        Reader::AnyPointer(a)
    }
}

/// Helper trait for the `dynamic_value::Reader::downcast()` method.
pub trait DowncastReader<'a>: Sized {
    fn try_downcast_reader(v: Reader<'a>) -> Option<Self>;

    fn downcast_reader(v: Reader<'a>) -> Self {
        match Self::try_downcast_reader(v) {
            Some(x) => x,
            None => panic!("error downcasting to {}", core::any::type_name::<Self>()),
        }
    }
}

impl<'a> DowncastReader<'a> for () {
    fn try_downcast_reader(value: Reader<'a>) -> Option<()> {
        match value {
            Reader::Void => Some(()),
            _ => None,
        }
    }
}

macro_rules! downcast_reader_impl(
    ($t:ty, $v:ident) => (
        impl <'a> DowncastReader<'a> for $t {
            fn try_downcast_reader(value: Reader<'a>) -> Option<Self> {
                match value {
                    Reader::$v(x) => Some(x),
                    _ => None,
                }
            }
        }
    )
);

downcast_reader_impl!(bool, Bool);
downcast_reader_impl!(i8, Int8);
downcast_reader_impl!(i16, Int16);
downcast_reader_impl!(i32, Int32);
downcast_reader_impl!(i64, Int64);
downcast_reader_impl!(u8, UInt8);
downcast_reader_impl!(u16, UInt16);
downcast_reader_impl!(u32, UInt32);
downcast_reader_impl!(u64, UInt64);
downcast_reader_impl!(f32, Float32);
downcast_reader_impl!(f64, Float64);
downcast_reader_impl!(text::Reader<'a>, Text);
downcast_reader_impl!(data::Reader<'a>, Data);
downcast_reader_impl!(dynamic_list::Reader<'a>, List);
downcast_reader_impl!(dynamic_struct::Reader<'a>, Struct);
downcast_reader_impl!(any_pointer::Reader<'a>, AnyPointer);

/// A dynamically-typed value with mutable interior.
pub enum Builder<'a> {
    Void,
    Bool(bool),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Float32(f32),
    Float64(f64),
    Enum(u16),
    Text(text::Builder<'a>),
    Data(data::Builder<'a>),
    Struct(dynamic_struct::Builder<'a>),
    List(dynamic_list::Builder<'a>),
    AnyPointer(any_pointer::Builder<'a>),
    Capability(any_pointer::Builder<'a>),
}

impl<'a> Builder<'a> {
    pub fn reborrow(&mut self) -> Builder<'_> {
        match self {
            Builder::Void => Builder::Void,
            Builder::Bool(b) => Builder::Bool(*b),
            Builder::Int8(x) => Builder::Int8(*x),
            Builder::Int16(x) => Builder::Int16(*x),
            Builder::Int32(x) => Builder::Int32(*x),
            Builder::Int64(x) => Builder::Int64(*x),
            Builder::UInt8(x) => Builder::UInt8(*x),
            Builder::UInt16(x) => Builder::UInt16(*x),
            Builder::UInt32(x) => Builder::UInt32(*x),
            Builder::UInt64(x) => Builder::UInt64(*x),
            Builder::Float32(x) => Builder::Float32(*x),
            Builder::Float64(x) => Builder::Float64(*x),
            Builder::Enum(e) => Builder::Enum(*e),
            Builder::Text(t) => Builder::Text(t.reborrow()),
            Builder::Data(d) => Builder::Data(&mut **d),
            Builder::Struct(s) => Builder::Struct(s.reborrow()),
            Builder::List(l) => Builder::List(l.reborrow()),
            Builder::AnyPointer(a) => Builder::AnyPointer(a.reborrow()),
            Builder::Capability(a) => Builder::Capability(a.reborrow()),
        }
    }

    pub fn into_reader(self) -> crate::Result<Reader<'a>> {
        Ok(match self {
            Builder::Void => Reader::Void,
            Builder::Bool(b) => Reader::Bool(b),
            Builder::Int8(x) => Reader::Int8(x),
            Builder::Int16(x) => Reader::Int16(x),
            Builder::Int32(x) => Reader::Int32(x),
            Builder::Int64(x) => Reader::Int64(x),
            Builder::UInt8(x) => Reader::UInt8(x),
            Builder::UInt16(x) => Reader::UInt16(x),
            Builder::UInt32(x) => Reader::UInt32(x),
            Builder::UInt64(x) => Reader::UInt64(x),
            Builder::Float32(x) => Reader::Float32(x),
            Builder::Float64(x) => Reader::Float64(x),
            Builder::Enum(e) => Reader::Enum(e),
            Builder::Text(t) => Reader::Text(t.into_reader()?),
            Builder::Data(d) => Reader::Data(d),
            Builder::Struct(s) => Reader::Struct(s.into_reader()),
            Builder::List(l) => Reader::List(l.into_reader()),
            Builder::AnyPointer(a) => Reader::AnyPointer(a.into_reader()),
            Builder::Capability(a) => Reader::Capability(a.into_reader()),
        })
    }

    /// Downcasts the `Builder` into a more specific type. Panics if the
    /// expected type does not match the value.
    pub fn downcast<T: DowncastBuilder<'a>>(self) -> T {
        T::downcast_builder(self)
    }
}

/// Helper trait for the `dynamic_value::Builder::downcast()` method.
pub trait DowncastBuilder<'a> {
    fn downcast_builder(v: Builder<'a>) -> Self;
}

macro_rules! downcast_builder_impl(
    ($t:ty, $v:ident, $s:expr) => (
        impl <'a> DowncastBuilder<'a> for $t {
            fn downcast_builder(value: Builder<'a>) -> Self {
                let Builder::$v(x) = value else { panic!("error downcasting to {}", $s) };
                x
            }
        }
    )
);

downcast_builder_impl!(bool, Bool, "bool");
downcast_builder_impl!(i8, Int8, "i8");
downcast_builder_impl!(i16, Int16, "i16");
downcast_builder_impl!(i32, Int32, "i32");
downcast_builder_impl!(i64, Int64, "i64");
downcast_builder_impl!(u8, UInt8, "u8");
downcast_builder_impl!(u16, UInt16, "u16");
downcast_builder_impl!(u32, UInt32, "u32");
downcast_builder_impl!(u64, UInt64, "u64");
downcast_builder_impl!(f32, Float32, "f32");
downcast_builder_impl!(f64, Float64, "f64");
downcast_builder_impl!(text::Builder<'a>, Text, "text");
downcast_builder_impl!(data::Builder<'a>, Data, "data");
downcast_builder_impl!(dynamic_list::Builder<'a>, List, "list");
downcast_builder_impl!(dynamic_struct::Builder<'a>, Struct, "struct");
downcast_builder_impl!(any_pointer::Builder<'a>, AnyPointer, "anypointer");
