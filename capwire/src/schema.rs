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

//! Static descriptions of struct layouts.
//!
//! A schema compiler lowers each struct to a `StructSchema`: its section sizes, where its
//! union discriminant lives, and one `Field` per member giving the member's offset and type.
//! The dynamic readers and builders interpret messages through these tables.

use crate::private::layout::{ElementSize, StructSize};
use crate::{Error, ErrorKind, Result};

/// `Field::discriminant_value` of a field that is not a union member.
pub const NO_DISCRIMINANT: u16 = 0xffff;

#[derive(Debug)]
pub struct StructSchema {
    pub name: &'static str,
    pub data_words: u16,
    pub pointer_count: u16,

    /// Number of union members. Zero if the struct has no unnamed union.
    pub discriminant_count: u16,

    /// Offset of the discriminant in the data section, in multiples of 16 bits.
    pub discriminant_offset: u32,

    pub fields: &'static [Field],
}

impl StructSchema {
    pub fn struct_size(&self) -> StructSize {
        StructSize {
            data: self.data_words,
            pointers: self.pointer_count,
        }
    }

    pub fn get_fields(&self) -> &'static [Field] {
        self.fields
    }

    pub fn find_field_by_name(&self, name: &str) -> Option<&'static Field> {
        self.fields.iter().find(|field| field.name == name)
    }

    pub fn get_field_by_name(&self, name: &str) -> Result<&'static Field> {
        self.find_field_by_name(name).ok_or_else(|| {
            Error::from_kind_context(
                ErrorKind::FieldNotFound,
                format!("{} has no field named {name}", self.name),
            )
        })
    }

    /// Members of the unnamed union, if any.
    pub fn get_union_fields(&self) -> impl Iterator<Item = &'static Field> {
        self.fields.iter().filter(|f| f.is_union_member())
    }

    pub fn get_non_union_fields(&self) -> impl Iterator<Item = &'static Field> {
        self.fields.iter().filter(|f| !f.is_union_member())
    }

    pub(crate) fn field_by_discriminant(&self, discriminant: u16) -> Option<&'static Field> {
        self.fields
            .iter()
            .find(|f| f.discriminant_value == discriminant)
    }
}

#[derive(Debug)]
pub struct Field {
    pub name: &'static str,

    /// Position of the field in declaration order.
    pub ordinal: u16,

    /// The union discriminant that selects this field, or `NO_DISCRIMINANT`.
    pub discriminant_value: u16,

    pub kind: FieldKind,
}

impl Field {
    pub fn is_union_member(&self) -> bool {
        self.discriminant_value != NO_DISCRIMINANT
    }
}

#[derive(Debug)]
pub enum FieldKind {
    /// A value stored in the struct itself. `offset` counts in multiples of the type's size:
    /// bits for `Bool`, pointer slots for pointer types, the primitive's width otherwise.
    Slot {
        offset: u32,
        ty: Type,
        default: DefaultValue,
    },

    /// A named group of fields sharing the parent's sections. The group schema has the same
    /// section sizes as its parent.
    Group(&'static StructSchema),
}

#[derive(Debug, Clone, Copy)]
pub enum Type {
    Void,
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
    Enum,
    Text,
    Data,
    Struct(&'static StructSchema),
    List(&'static Type),
    AnyPointer,
    Capability,
}

impl Type {
    pub fn is_pointer_type(&self) -> bool {
        matches!(
            self,
            Type::Text
                | Type::Data
                | Type::Struct(_)
                | Type::List(_)
                | Type::AnyPointer
                | Type::Capability
        )
    }

    /// Encoding used for a list whose elements have this type.
    pub fn element_size(&self) -> ElementSize {
        match self {
            Type::Void => ElementSize::Void,
            Type::Bool => ElementSize::Bit,
            Type::Int8 | Type::UInt8 => ElementSize::Byte,
            Type::Int16 | Type::UInt16 | Type::Enum => ElementSize::TwoBytes,
            Type::Int32 | Type::UInt32 | Type::Float32 => ElementSize::FourBytes,
            Type::Int64 | Type::UInt64 | Type::Float64 => ElementSize::EightBytes,
            Type::Struct(_) => ElementSize::InlineComposite,
            Type::Text | Type::Data | Type::List(_) | Type::AnyPointer | Type::Capability => {
                ElementSize::Pointer
            }
        }
    }
}

/// Value a field reads as when it was never set.
#[derive(Debug, Clone, Copy)]
pub enum DefaultValue {
    Zero,

    /// XOR mask applied to a data-section field. For `Bool`, any non-zero value means `true`.
    /// Floating point defaults are given as their bit patterns.
    Bits(u64),

    /// Returned for a null text pointer.
    Text(&'static str),

    /// Returned for a null data pointer.
    Data(&'static [u8]),
}

impl DefaultValue {
    pub(crate) fn bits(self) -> u64 {
        match self {
            DefaultValue::Bits(b) => b,
            _ => 0,
        }
    }
}
