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

//! Dynamically typed value.

use crate::capability::FromClientHook;
use crate::{dynamic_list, dynamic_struct};
use crate::private::capability::{ClientHook, PipelineHook, PipelineOp};
use crate::private::layout::{PointerBuilder, PointerReader};
use crate::schema::{StructSchema, Type};
use crate::traits::{FromPointerBuilder, FromPointerReader, SetPointerBuilder};
use crate::Result;

#[derive(Copy, Clone)]
pub struct Reader<'a> {
    reader: PointerReader<'a>,
}

impl<'a> Reader<'a> {
    pub fn new(reader: PointerReader<'a>) -> Reader<'a> {
        Reader { reader }
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.reader.is_null()
    }

    /// Gets the total size of the target and all of its children. Does not count far pointer
    /// overhead.
    pub fn target_size(&self) -> Result<crate::MessageSize> {
        self.reader.total_size()
    }

    #[inline]
    pub fn get_as<T: FromPointerReader<'a>>(&self) -> Result<T> {
        FromPointerReader::get_from_pointer(&self.reader)
    }

    pub fn get_as_struct(&self, schema: &'static StructSchema) -> Result<dynamic_struct::Reader<'a>> {
        Ok(dynamic_struct::Reader::new(self.reader.get_struct()?, schema))
    }

    pub fn get_as_list(&self, element_type: Type) -> Result<dynamic_list::Reader<'a>> {
        Ok(dynamic_list::Reader::new(
            self.reader.get_list(Some(element_type.element_size()))?,
            element_type,
        ))
    }

    pub fn get_as_capability<T: FromClientHook>(&self) -> Result<T> {
        Ok(FromClientHook::new(self.reader.get_capability()?))
    }

    /// Follows `ops` through the value to a capability. Used to answer pipelined calls.
    pub fn get_pipelined_cap(&self, ops: &[PipelineOp]) -> Result<Box<dyn ClientHook>> {
        let mut pointer = self.reader;

        for op in ops {
            match *op {
                PipelineOp::Noop => {}
                PipelineOp::GetPointerField(idx) => {
                    pointer = pointer.get_struct()?.get_pointer_field(idx);
                }
            }
        }

        pointer.get_capability()
    }

    pub(crate) fn into_pointer_reader(self) -> PointerReader<'a> {
        self.reader
    }
}

impl<'a> FromPointerReader<'a> for Reader<'a> {
    fn get_from_pointer(reader: &PointerReader<'a>) -> Result<Reader<'a>> {
        Ok(Reader { reader: *reader })
    }
}

impl SetPointerBuilder for Reader<'_> {
    fn set_pointer_builder(self, mut pointer: PointerBuilder<'_>) -> Result<()> {
        pointer.copy_from(self.reader)
    }
}

pub struct Builder<'a> {
    builder: PointerBuilder<'a>,
}

impl<'a> Builder<'a> {
    pub fn new(builder: PointerBuilder<'a>) -> Builder<'a> {
        Builder { builder }
    }

    pub fn reborrow(&mut self) -> Builder<'_> {
        Builder {
            builder: self.builder.reborrow(),
        }
    }

    pub fn is_null(&self) -> bool {
        self.builder.is_null()
    }

    /// Gets the total size of the target and all of its children. Does not count far pointer
    /// overhead.
    pub fn target_size(&self) -> Result<crate::MessageSize> {
        self.builder.as_reader().total_size()
    }

    pub fn get_as<T: FromPointerBuilder<'a>>(self) -> Result<T> {
        FromPointerBuilder::get_from_pointer(self.builder)
    }

    pub fn init_as<T: FromPointerBuilder<'a>>(self) -> Result<T> {
        FromPointerBuilder::init_pointer(self.builder, 0)
    }

    pub fn initn_as<T: FromPointerBuilder<'a>>(self, size: u32) -> Result<T> {
        FromPointerBuilder::init_pointer(self.builder, size)
    }

    pub fn set_as<T: SetPointerBuilder>(self, value: T) -> Result<()> {
        value.set_pointer_builder(self.builder)
    }

    pub fn init_as_struct(self, schema: &'static StructSchema) -> Result<dynamic_struct::Builder<'a>> {
        Ok(dynamic_struct::Builder::new(
            self.builder.init_struct(schema.struct_size())?,
            schema,
        ))
    }

    pub fn get_as_struct(self, schema: &'static StructSchema) -> Result<dynamic_struct::Builder<'a>> {
        Ok(dynamic_struct::Builder::new(
            self.builder.get_struct(schema.struct_size())?,
            schema,
        ))
    }

    pub fn initn_as_list(self, element_type: Type, size: u32) -> Result<dynamic_list::Builder<'a>> {
        let list = match element_type {
            Type::Struct(schema) => self.builder.init_struct_list(size, schema.struct_size())?,
            other => self.builder.init_list(other.element_size(), size)?,
        };
        Ok(dynamic_list::Builder::new(list, element_type))
    }

    pub fn get_as_list(self, element_type: Type) -> Result<dynamic_list::Builder<'a>> {
        let list = match element_type {
            Type::Struct(schema) => self.builder.get_struct_list(schema.struct_size())?,
            other => self.builder.get_list(other.element_size())?,
        };
        Ok(dynamic_list::Builder::new(list, element_type))
    }

    pub fn set_as_capability(&mut self, value: Box<dyn ClientHook>) {
        self.builder.set_capability(value);
    }

    #[inline]
    pub fn clear(&mut self) {
        self.builder.clear()
    }

    pub fn as_reader(&self) -> Reader<'_> {
        Reader {
            reader: self.builder.as_reader(),
        }
    }

    pub fn into_reader(self) -> Reader<'a> {
        Reader {
            reader: self.builder.into_reader(),
        }
    }
}

impl<'a> FromPointerBuilder<'a> for Builder<'a> {
    fn init_pointer(mut builder: PointerBuilder<'a>, _len: u32) -> Result<Builder<'a>> {
        if !builder.is_null() {
            builder.clear();
        }
        Ok(Builder { builder })
    }

    fn get_from_pointer(builder: PointerBuilder<'a>) -> Result<Builder<'a>> {
        Ok(Builder { builder })
    }
}

/// A reference to a value inside the not-yet-received result of a call. Capabilities reached
/// through a pipeline can be called before the result arrives.
pub struct Pipeline {
    pub hook: Box<dyn PipelineHook>,
    ops: Vec<PipelineOp>,
}

impl Pipeline {
    pub fn new(hook: Box<dyn PipelineHook>) -> Pipeline {
        Pipeline {
            hook,
            ops: Vec::new(),
        }
    }

    pub fn noop(&self) -> Pipeline {
        Pipeline {
            hook: self.hook.add_ref(),
            ops: self.ops.clone(),
        }
    }

    pub fn get_pointer_field(&self, pointer_index: u16) -> Pipeline {
        let mut new_ops = Vec::with_capacity(self.ops.len() + 1);
        new_ops.extend_from_slice(&self.ops);
        new_ops.push(PipelineOp::GetPointerField(pointer_index));
        Pipeline {
            hook: self.hook.add_ref(),
            ops: new_ops,
        }
    }

    pub fn as_cap(&self) -> Box<dyn ClientHook> {
        self.hook.get_pipelined_cap(&self.ops)
    }
}

#[cfg(test)]
mod test {
    use crate::{any_pointer, message, primitive_list};

    #[test]
    fn init_clears_value() {
        let mut message = message::Builder::new_default();
        {
            let root: any_pointer::Builder = message.init_root().unwrap();
            let mut list: primitive_list::Builder<u16> = root.initn_as(10).unwrap();
            for idx in 0..10 {
                list.set(idx, idx as u16);
            }
        }

        {
            let root: any_pointer::Builder = message.init_root().unwrap();
            assert!(root.is_null());
        }

        let mut output: Vec<u8> = Vec::new();
        crate::serialize::write_message(&mut output, &message).unwrap();
        assert_eq!(output.len(), 40);
        for byte in &output[8..] {
            // Everything not in the message header is zero.
            assert_eq!(*byte, 0u8);
        }
    }

    #[test]
    fn target_size_counts_children() {
        let mut message = message::Builder::new_default();
        let root: any_pointer::Builder = message.init_root().unwrap();
        let list: primitive_list::Builder<u64> = root.initn_as(3).unwrap();
        assert_eq!(list.len(), 3);
        let root: any_pointer::Reader = message.get_root_as_reader().unwrap();
        assert_eq!(root.target_size().unwrap().word_count, 3);
    }
}
