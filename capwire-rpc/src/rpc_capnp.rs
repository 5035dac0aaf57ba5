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

//! Typed accessors for the messages of the two-party RPC protocol.
//!
//! Field offsets, discriminants and defaults follow the published `rpc.capnp` schema, which
//! is part of the wire contract. Only the parts that a two-party, level-one vat uses are
//! exposed; the remaining union members still decode, so that they can be answered with
//! `Unimplemented`.

use capwire::private::layout::{
    ElementSize, ListBuilder, ListReader, PointerBuilder, PointerReader, StructBuilder,
    StructReader, StructSize,
};
use capwire::traits::{FromPointerBuilder, FromPointerReader, SetPointerBuilder};
use capwire::{Error, ErrorKind, NotInSchema, Result};

use std::marker::PhantomData;

macro_rules! struct_views {
    ($data:expr, $pointers:expr) => {
        /// Marker naming this struct in list types.
        pub struct Owned;

        impl $crate::rpc_capnp::OwnedStruct for Owned {
            type Reader<'a> = Reader<'a>;
            type Builder<'a> = Builder<'a>;
        }

        pub const STRUCT_SIZE: capwire::private::layout::StructSize =
            capwire::private::layout::StructSize {
                data: $data,
                pointers: $pointers,
            };

        #[derive(Clone, Copy)]
        pub struct Reader<'a> {
            reader: capwire::private::layout::StructReader<'a>,
        }

        impl<'a> From<capwire::private::layout::StructReader<'a>> for Reader<'a> {
            fn from(reader: capwire::private::layout::StructReader<'a>) -> Self {
                Reader { reader }
            }
        }

        impl<'a> capwire::traits::FromPointerReader<'a> for Reader<'a> {
            fn get_from_pointer(
                reader: &capwire::private::layout::PointerReader<'a>,
            ) -> capwire::Result<Self> {
                Ok(reader.get_struct()?.into())
            }
        }

        impl capwire::traits::SetPointerBuilder for Reader<'_> {
            fn set_pointer_builder(
                self,
                mut pointer: capwire::private::layout::PointerBuilder<'_>,
            ) -> capwire::Result<()> {
                pointer.set_struct(&self.reader)
            }
        }

        pub struct Builder<'a> {
            builder: capwire::private::layout::StructBuilder<'a>,
        }

        impl<'a> From<capwire::private::layout::StructBuilder<'a>> for Builder<'a> {
            fn from(builder: capwire::private::layout::StructBuilder<'a>) -> Self {
                Builder { builder }
            }
        }

        impl<'a> capwire::traits::FromPointerBuilder<'a> for Builder<'a> {
            fn init_pointer(
                builder: capwire::private::layout::PointerBuilder<'a>,
                _len: u32,
            ) -> capwire::Result<Self> {
                Ok(builder.init_struct(STRUCT_SIZE)?.into())
            }

            fn get_from_pointer(
                builder: capwire::private::layout::PointerBuilder<'a>,
            ) -> capwire::Result<Self> {
                Ok(builder.get_struct(STRUCT_SIZE)?.into())
            }
        }

        impl<'a> Builder<'a> {
            pub fn reborrow(&mut self) -> Builder<'_> {
                Builder {
                    builder: self.builder.reborrow(),
                }
            }

            pub fn as_reader(&self) -> Reader<'_> {
                self.builder.as_reader().into()
            }

            pub fn into_reader(self) -> Reader<'a> {
                self.builder.into_reader().into()
            }
        }
    };
}

fn wrong_union_member(what: &str) -> Error {
    Error::from_kind_context(ErrorKind::TypeMismatch, format!("union is not set to {what}"))
}

/// Names a struct type independently of the lifetime of its views.
pub trait OwnedStruct {
    type Reader<'a>: From<StructReader<'a>>;
    type Builder<'a>: From<StructBuilder<'a>>;
}

pub mod struct_list {
    use super::*;

    /// A list of structs, read element by element.
    pub struct Reader<'a, T> {
        reader: ListReader<'a>,
        marker: PhantomData<T>,
    }

    impl<T> Clone for Reader<'_, T> {
        fn clone(&self) -> Self {
            *self
        }
    }

    impl<T> Copy for Reader<'_, T> {}

    impl<'a, T: OwnedStruct> Reader<'a, T> {
        pub fn len(&self) -> u32 {
            self.reader.len()
        }

        pub fn is_empty(&self) -> bool {
            self.reader.is_empty()
        }

        pub fn get(&self, index: u32) -> T::Reader<'a> {
            self.reader.get_struct_element(index).into()
        }

        pub fn iter(self) -> impl Iterator<Item = T::Reader<'a>> + 'a
        where
            T: 'a,
        {
            (0..self.len()).map(move |idx| self.get(idx))
        }
    }

    impl<'a, T> FromPointerReader<'a> for Reader<'a, T> {
        fn get_from_pointer(reader: &PointerReader<'a>) -> Result<Self> {
            Ok(Reader {
                reader: reader.get_list(Some(ElementSize::InlineComposite))?,
                marker: PhantomData,
            })
        }
    }

    pub struct Builder<'a, T> {
        builder: ListBuilder<'a>,
        marker: PhantomData<T>,
    }

    impl<'a, T: OwnedStruct> Builder<'a, T> {
        pub(crate) fn init(
            pointer: PointerBuilder<'a>,
            len: u32,
            size: StructSize,
        ) -> Result<Builder<'a, T>> {
            Ok(Builder {
                builder: pointer.init_struct_list(len, size)?,
                marker: PhantomData,
            })
        }

        pub fn len(&self) -> u32 {
            self.builder.len()
        }

        pub fn is_empty(&self) -> bool {
            self.len() == 0
        }

        pub fn reborrow(&mut self) -> Builder<'_, T> {
            Builder {
                builder: self.builder.reborrow(),
                marker: PhantomData,
            }
        }

        /// `index` must be less than `len()`.
        pub fn get(self, index: u32) -> T::Builder<'a> {
            self.builder.get_struct_element(index).into()
        }

        pub fn as_reader(&self) -> Reader<'_, T> {
            Reader {
                reader: self.builder.as_reader(),
                marker: PhantomData,
            }
        }
    }
}

pub mod message {
    use super::*;

    struct_views!(1, 1);

    pub enum Which<'a> {
        Unimplemented(Result<Reader<'a>>),
        Abort(Result<exception::Reader<'a>>),
        Call(Result<call::Reader<'a>>),
        Return(Result<return_::Reader<'a>>),
        Finish(Result<finish::Reader<'a>>),
        Resolve(Result<resolve::Reader<'a>>),
        Release(Result<release::Reader<'a>>),
        ObsoleteSave,
        Bootstrap(Result<bootstrap::Reader<'a>>),
        ObsoleteDelete,
        Provide,
        Accept,
        Join,
        Disembargo(Result<disembargo::Reader<'a>>),
    }

    impl<'a> Reader<'a> {
        pub fn which(self) -> ::core::result::Result<Which<'a>, NotInSchema> {
            let body = self.reader.get_pointer_field(0);
            match self.reader.get_data_field::<u16>(0) {
                0 => Ok(Which::Unimplemented(FromPointerReader::get_from_pointer(&body))),
                1 => Ok(Which::Abort(FromPointerReader::get_from_pointer(&body))),
                2 => Ok(Which::Call(FromPointerReader::get_from_pointer(&body))),
                3 => Ok(Which::Return(FromPointerReader::get_from_pointer(&body))),
                4 => Ok(Which::Finish(FromPointerReader::get_from_pointer(&body))),
                5 => Ok(Which::Resolve(FromPointerReader::get_from_pointer(&body))),
                6 => Ok(Which::Release(FromPointerReader::get_from_pointer(&body))),
                7 => Ok(Which::ObsoleteSave),
                8 => Ok(Which::Bootstrap(FromPointerReader::get_from_pointer(&body))),
                9 => Ok(Which::ObsoleteDelete),
                10 => Ok(Which::Provide),
                11 => Ok(Which::Accept),
                12 => Ok(Which::Join),
                13 => Ok(Which::Disembargo(FromPointerReader::get_from_pointer(&body))),
                x => Err(NotInSchema(x)),
            }
        }

        /// The name of the message kind, for logging.
        pub fn kind_name(self) -> &'static str {
            match self.reader.get_data_field::<u16>(0) {
                0 => "unimplemented",
                1 => "abort",
                2 => "call",
                3 => "return",
                4 => "finish",
                5 => "resolve",
                6 => "release",
                7 => "obsoleteSave",
                8 => "bootstrap",
                9 => "obsoleteDelete",
                10 => "provide",
                11 => "accept",
                12 => "join",
                13 => "disembargo",
                _ => "unknown",
            }
        }
    }

    impl<'a> Builder<'a> {
        fn init_member<T: FromPointerBuilder<'a>>(mut self, discriminant: u16) -> Result<T> {
            self.builder.set_data_field::<u16>(0, discriminant);
            T::init_pointer(self.builder.get_pointer_field(0), 0)
        }

        fn get_member<T: FromPointerBuilder<'a>>(self, discriminant: u16, what: &str) -> Result<T> {
            if self.builder.get_data_field::<u16>(0) != discriminant {
                return Err(wrong_union_member(what));
            }
            T::get_from_pointer(self.builder.get_pointer_field(0))
        }

        /// Echoes `message` back to its sender.
        pub fn set_unimplemented(mut self, message: super::message::Reader<'_>) -> Result<()> {
            self.builder.set_data_field::<u16>(0, 0);
            message.set_pointer_builder(self.builder.get_pointer_field(0))
        }

        pub fn init_abort(self) -> Result<exception::Builder<'a>> {
            self.init_member(1)
        }

        pub fn init_call(self) -> Result<call::Builder<'a>> {
            self.init_member(2)
        }

        pub fn get_call(self) -> Result<call::Builder<'a>> {
            self.get_member(2, "call")
        }

        pub fn init_return(self) -> Result<return_::Builder<'a>> {
            self.init_member(3)
        }

        pub fn get_return(self) -> Result<return_::Builder<'a>> {
            self.get_member(3, "return")
        }

        pub fn init_finish(self) -> Result<finish::Builder<'a>> {
            self.init_member(4)
        }

        pub fn init_resolve(self) -> Result<resolve::Builder<'a>> {
            self.init_member(5)
        }

        pub fn init_release(self) -> Result<release::Builder<'a>> {
            self.init_member(6)
        }

        pub fn init_bootstrap(self) -> Result<bootstrap::Builder<'a>> {
            self.init_member(8)
        }

        pub fn init_disembargo(self) -> Result<disembargo::Builder<'a>> {
            self.init_member(13)
        }
    }
}

pub mod bootstrap {
    use super::*;

    struct_views!(1, 1);

    impl Reader<'_> {
        pub fn get_question_id(self) -> u32 {
            self.reader.get_data_field::<u32>(0)
        }
    }

    impl Builder<'_> {
        pub fn set_question_id(&mut self, value: u32) {
            self.builder.set_data_field::<u32>(0, value);
        }
    }
}

pub mod call {
    use super::*;

    struct_views!(3, 3);

    pub enum SendResultsTo {
        Caller,
        Yourself,
        ThirdParty,
    }

    impl<'a> Reader<'a> {
        pub fn get_question_id(self) -> u32 {
            self.reader.get_data_field::<u32>(0)
        }

        pub fn get_target(self) -> Result<message_target::Reader<'a>> {
            FromPointerReader::get_from_pointer(&self.reader.get_pointer_field(0))
        }

        pub fn get_interface_id(self) -> u64 {
            self.reader.get_data_field::<u64>(1)
        }

        pub fn get_method_id(self) -> u16 {
            self.reader.get_data_field::<u16>(2)
        }

        pub fn get_params(self) -> Result<payload::Reader<'a>> {
            FromPointerReader::get_from_pointer(&self.reader.get_pointer_field(1))
        }

        pub fn get_send_results_to(self) -> ::core::result::Result<SendResultsTo, NotInSchema> {
            match self.reader.get_data_field::<u16>(3) {
                0 => Ok(SendResultsTo::Caller),
                1 => Ok(SendResultsTo::Yourself),
                2 => Ok(SendResultsTo::ThirdParty),
                x => Err(NotInSchema(x)),
            }
        }
    }

    impl<'a> Builder<'a> {
        pub fn get_question_id(&self) -> u32 {
            self.builder.get_data_field::<u32>(0)
        }

        pub fn set_question_id(&mut self, value: u32) {
            self.builder.set_data_field::<u32>(0, value);
        }

        pub fn get_interface_id(&self) -> u64 {
            self.builder.get_data_field::<u64>(1)
        }

        pub fn set_interface_id(&mut self, value: u64) {
            self.builder.set_data_field::<u64>(1, value);
        }

        pub fn get_method_id(&self) -> u16 {
            self.builder.get_data_field::<u16>(2)
        }

        pub fn set_method_id(&mut self, value: u16) {
            self.builder.set_data_field::<u16>(2, value);
        }

        pub fn init_target(self) -> Result<message_target::Builder<'a>> {
            FromPointerBuilder::init_pointer(self.builder.get_pointer_field(0), 0)
        }

        pub fn get_params(self) -> Result<payload::Builder<'a>> {
            FromPointerBuilder::get_from_pointer(self.builder.get_pointer_field(1))
        }
    }
}

pub mod return_ {
    use super::*;

    struct_views!(2, 1);

    pub enum Which<'a> {
        Results(Result<payload::Reader<'a>>),
        Exception(Result<exception::Reader<'a>>),
        Canceled,
        ResultsSentElsewhere,
        TakeFromOtherQuestion(u32),
        AcceptFromThirdParty,
    }

    impl<'a> Reader<'a> {
        pub fn get_answer_id(self) -> u32 {
            self.reader.get_data_field::<u32>(0)
        }

        pub fn get_release_param_caps(self) -> bool {
            self.reader.get_bool_field_mask(32, true)
        }

        pub fn which(self) -> ::core::result::Result<Which<'a>, NotInSchema> {
            let body = self.reader.get_pointer_field(0);
            match self.reader.get_data_field::<u16>(3) {
                0 => Ok(Which::Results(FromPointerReader::get_from_pointer(&body))),
                1 => Ok(Which::Exception(FromPointerReader::get_from_pointer(&body))),
                2 => Ok(Which::Canceled),
                3 => Ok(Which::ResultsSentElsewhere),
                4 => Ok(Which::TakeFromOtherQuestion(
                    self.reader.get_data_field::<u32>(2),
                )),
                5 => Ok(Which::AcceptFromThirdParty),
                x => Err(NotInSchema(x)),
            }
        }
    }

    impl<'a> Builder<'a> {
        pub fn set_answer_id(&mut self, value: u32) {
            self.builder.set_data_field::<u32>(0, value);
        }

        pub fn set_release_param_caps(&mut self, value: bool) {
            self.builder.set_bool_field_mask(32, value, true);
        }

        pub fn init_results(mut self) -> Result<payload::Builder<'a>> {
            self.builder.set_data_field::<u16>(3, 0);
            FromPointerBuilder::init_pointer(self.builder.get_pointer_field(0), 0)
        }

        pub fn get_results(self) -> Result<payload::Builder<'a>> {
            if self.builder.get_data_field::<u16>(3) != 0 {
                return Err(wrong_union_member("results"));
            }
            FromPointerBuilder::get_from_pointer(self.builder.get_pointer_field(0))
        }

        pub fn init_exception(mut self) -> Result<exception::Builder<'a>> {
            self.builder.set_data_field::<u16>(3, 1);
            FromPointerBuilder::init_pointer(self.builder.get_pointer_field(0), 0)
        }

        pub fn set_canceled(&mut self) {
            self.builder.set_data_field::<u16>(3, 2);
            self.builder.get_pointer_field_mut(0).clear();
        }
    }
}

pub mod finish {
    use super::*;

    struct_views!(1, 0);

    impl Reader<'_> {
        pub fn get_question_id(self) -> u32 {
            self.reader.get_data_field::<u32>(0)
        }

        pub fn get_release_result_caps(self) -> bool {
            self.reader.get_bool_field_mask(32, true)
        }
    }

    impl Builder<'_> {
        pub fn set_question_id(&mut self, value: u32) {
            self.builder.set_data_field::<u32>(0, value);
        }

        pub fn set_release_result_caps(&mut self, value: bool) {
            self.builder.set_bool_field_mask(32, value, true);
        }
    }
}

pub mod resolve {
    use super::*;

    struct_views!(1, 1);

    pub enum Which<'a> {
        Cap(Result<cap_descriptor::Reader<'a>>),
        Exception(Result<exception::Reader<'a>>),
    }

    impl<'a> Reader<'a> {
        pub fn get_promise_id(self) -> u32 {
            self.reader.get_data_field::<u32>(0)
        }

        pub fn which(self) -> ::core::result::Result<Which<'a>, NotInSchema> {
            let body = self.reader.get_pointer_field(0);
            match self.reader.get_data_field::<u16>(2) {
                0 => Ok(Which::Cap(FromPointerReader::get_from_pointer(&body))),
                1 => Ok(Which::Exception(FromPointerReader::get_from_pointer(&body))),
                x => Err(NotInSchema(x)),
            }
        }
    }

    impl<'a> Builder<'a> {
        pub fn set_promise_id(&mut self, value: u32) {
            self.builder.set_data_field::<u32>(0, value);
        }

        pub fn init_cap(mut self) -> Result<cap_descriptor::Builder<'a>> {
            self.builder.set_data_field::<u16>(2, 0);
            FromPointerBuilder::init_pointer(self.builder.get_pointer_field(0), 0)
        }

        pub fn init_exception(mut self) -> Result<exception::Builder<'a>> {
            self.builder.set_data_field::<u16>(2, 1);
            FromPointerBuilder::init_pointer(self.builder.get_pointer_field(0), 0)
        }
    }
}

pub mod release {
    use super::*;

    struct_views!(1, 0);

    impl Reader<'_> {
        pub fn get_id(self) -> u32 {
            self.reader.get_data_field::<u32>(0)
        }

        pub fn get_reference_count(self) -> u32 {
            self.reader.get_data_field::<u32>(1)
        }
    }

    impl Builder<'_> {
        pub fn set_id(&mut self, value: u32) {
            self.builder.set_data_field::<u32>(0, value);
        }

        pub fn set_reference_count(&mut self, value: u32) {
            self.builder.set_data_field::<u32>(1, value);
        }
    }
}

pub mod disembargo {
    use super::*;

    struct_views!(1, 1);

    pub enum Context {
        SenderLoopback(u32),
        ReceiverLoopback(u32),
        Accept,
        Provide(u32),
    }

    impl<'a> Reader<'a> {
        pub fn get_target(self) -> Result<message_target::Reader<'a>> {
            FromPointerReader::get_from_pointer(&self.reader.get_pointer_field(0))
        }

        pub fn get_context(self) -> ::core::result::Result<Context, NotInSchema> {
            let id = self.reader.get_data_field::<u32>(0);
            match self.reader.get_data_field::<u16>(2) {
                0 => Ok(Context::SenderLoopback(id)),
                1 => Ok(Context::ReceiverLoopback(id)),
                2 => Ok(Context::Accept),
                3 => Ok(Context::Provide(id)),
                x => Err(NotInSchema(x)),
            }
        }
    }

    impl<'a> Builder<'a> {
        pub fn init_target(self) -> Result<message_target::Builder<'a>> {
            FromPointerBuilder::init_pointer(self.builder.get_pointer_field(0), 0)
        }

        pub fn set_sender_loopback(&mut self, embargo_id: u32) {
            self.builder.set_data_field::<u16>(2, 0);
            self.builder.set_data_field::<u32>(0, embargo_id);
        }

        pub fn set_receiver_loopback(&mut self, embargo_id: u32) {
            self.builder.set_data_field::<u16>(2, 1);
            self.builder.set_data_field::<u32>(0, embargo_id);
        }
    }
}

pub mod message_target {
    use super::*;

    struct_views!(1, 1);

    pub enum Which<'a> {
        ImportedCap(u32),
        PromisedAnswer(Result<promised_answer::Reader<'a>>),
    }

    impl<'a> Reader<'a> {
        pub fn which(self) -> ::core::result::Result<Which<'a>, NotInSchema> {
            match self.reader.get_data_field::<u16>(2) {
                0 => Ok(Which::ImportedCap(self.reader.get_data_field::<u32>(0))),
                1 => Ok(Which::PromisedAnswer(FromPointerReader::get_from_pointer(
                    &self.reader.get_pointer_field(0),
                ))),
                x => Err(NotInSchema(x)),
            }
        }
    }

    impl<'a> Builder<'a> {
        pub fn set_imported_cap(&mut self, import_id: u32) {
            self.builder.set_data_field::<u16>(2, 0);
            self.builder.set_data_field::<u32>(0, import_id);
            self.builder.get_pointer_field_mut(0).clear();
        }

        pub fn init_promised_answer(mut self) -> Result<promised_answer::Builder<'a>> {
            self.builder.set_data_field::<u16>(2, 1);
            self.builder.set_data_field::<u32>(0, 0);
            FromPointerBuilder::init_pointer(self.builder.get_pointer_field(0), 0)
        }
    }
}

pub mod payload {
    use super::*;

    struct_views!(0, 2);

    impl<'a> Reader<'a> {
        pub fn get_content(self) -> capwire::any_pointer::Reader<'a> {
            capwire::any_pointer::Reader::new(self.reader.get_pointer_field(0))
        }

        pub fn get_cap_table(self) -> Result<struct_list::Reader<'a, cap_descriptor::Owned>> {
            FromPointerReader::get_from_pointer(&self.reader.get_pointer_field(1))
        }
    }

    impl<'a> Builder<'a> {
        pub fn get_content(self) -> capwire::any_pointer::Builder<'a> {
            capwire::any_pointer::Builder::new(self.builder.get_pointer_field(0))
        }

        pub fn init_cap_table(
            self,
            len: u32,
        ) -> Result<struct_list::Builder<'a, cap_descriptor::Owned>> {
            struct_list::Builder::init(
                self.builder.get_pointer_field(1),
                len,
                cap_descriptor::STRUCT_SIZE,
            )
        }
    }
}

pub mod cap_descriptor {
    use super::*;

    struct_views!(1, 1);

    pub enum Which<'a> {
        None,
        SenderHosted(u32),
        SenderPromise(u32),
        ReceiverHosted(u32),
        ReceiverAnswer(Result<promised_answer::Reader<'a>>),
        ThirdPartyHosted,
    }

    impl<'a> Reader<'a> {
        pub fn which(self) -> ::core::result::Result<Which<'a>, NotInSchema> {
            let id = self.reader.get_data_field::<u32>(1);
            match self.reader.get_data_field::<u16>(0) {
                0 => Ok(Which::None),
                1 => Ok(Which::SenderHosted(id)),
                2 => Ok(Which::SenderPromise(id)),
                3 => Ok(Which::ReceiverHosted(id)),
                4 => Ok(Which::ReceiverAnswer(FromPointerReader::get_from_pointer(
                    &self.reader.get_pointer_field(0),
                ))),
                5 => Ok(Which::ThirdPartyHosted),
                x => Err(NotInSchema(x)),
            }
        }

        /// Index of an attached file descriptor, or 255 for none.
        pub fn get_attached_fd(self) -> u8 {
            self.reader.get_data_field_mask::<u8>(2, 0xff)
        }
    }

    impl<'a> Builder<'a> {
        fn set_id(&mut self, discriminant: u16, id: u32) {
            self.builder.set_data_field::<u16>(0, discriminant);
            self.builder.set_data_field::<u32>(1, id);
        }

        pub fn set_none(&mut self) {
            self.set_id(0, 0);
        }

        pub fn set_sender_hosted(&mut self, export_id: u32) {
            self.set_id(1, export_id);
        }

        pub fn set_sender_promise(&mut self, export_id: u32) {
            self.set_id(2, export_id);
        }

        pub fn set_receiver_hosted(&mut self, import_id: u32) {
            self.set_id(3, import_id);
        }

        pub fn init_receiver_answer(mut self) -> Result<promised_answer::Builder<'a>> {
            self.set_id(4, 0);
            FromPointerBuilder::init_pointer(self.builder.get_pointer_field(0), 0)
        }
    }
}

pub mod promised_answer {
    use super::*;

    struct_views!(1, 1);

    impl<'a> Reader<'a> {
        pub fn get_question_id(self) -> u32 {
            self.reader.get_data_field::<u32>(0)
        }

        pub fn get_transform(self) -> Result<struct_list::Reader<'a, op::Owned>> {
            FromPointerReader::get_from_pointer(&self.reader.get_pointer_field(0))
        }
    }

    impl<'a> Builder<'a> {
        pub fn set_question_id(&mut self, value: u32) {
            self.builder.set_data_field::<u32>(0, value);
        }

        pub fn init_transform(self, len: u32) -> Result<struct_list::Builder<'a, op::Owned>> {
            struct_list::Builder::init(self.builder.get_pointer_field(0), len, op::STRUCT_SIZE)
        }
    }

    pub mod op {
        use super::super::*;

        struct_views!(1, 0);

        impl Reader<'_> {
            pub fn which(self) -> ::core::result::Result<capwire::private::capability::PipelineOp, NotInSchema> {
                use capwire::private::capability::PipelineOp;
                match self.reader.get_data_field::<u16>(0) {
                    0 => Ok(PipelineOp::Noop),
                    1 => Ok(PipelineOp::GetPointerField(self.reader.get_data_field::<u16>(1))),
                    x => Err(NotInSchema(x)),
                }
            }
        }

        impl Builder<'_> {
            pub fn set_noop(&mut self) {
                self.builder.set_data_field::<u16>(0, 0);
            }

            pub fn set_get_pointer_field(&mut self, index: u16) {
                self.builder.set_data_field::<u16>(0, 1);
                self.builder.set_data_field::<u16>(1, index);
            }
        }
    }
}

pub mod exception {
    use super::*;

    struct_views!(1, 2);

    impl<'a> Reader<'a> {
        pub fn get_reason(self) -> Result<&'a str> {
            FromPointerReader::get_from_pointer(&self.reader.get_pointer_field(0))
        }

        /// The raw type tag: failed, overloaded, disconnected, unimplemented.
        pub fn get_type(self) -> ::core::result::Result<ErrorKind, NotInSchema> {
            match self.reader.get_data_field::<u16>(2) {
                0 => Ok(ErrorKind::Failed),
                1 => Ok(ErrorKind::Overloaded),
                2 => Ok(ErrorKind::Disconnected),
                3 => Ok(ErrorKind::Unimplemented),
                x => Err(NotInSchema(x)),
            }
        }

        pub fn get_trace(self) -> Result<&'a str> {
            FromPointerReader::get_from_pointer(&self.reader.get_pointer_field(1))
        }
    }

    impl Builder<'_> {
        pub fn set_reason(&mut self, reason: &str) -> Result<()> {
            self.builder.get_pointer_field_mut(0).set_text(reason)
        }

        /// Kinds other than the four exception types travel as `failed`.
        pub fn set_type(&mut self, kind: ErrorKind) {
            let tag = match kind {
                ErrorKind::Overloaded => 1,
                ErrorKind::Disconnected => 2,
                ErrorKind::Unimplemented => 3,
                _ => 0,
            };
            self.builder.set_data_field::<u16>(2, tag);
        }
    }
}

#[cfg(test)]
mod test {
    use super::{call, cap_descriptor, exception, finish, message, promised_answer, return_};
    use capwire::message::Builder;
    use capwire::private::capability::PipelineOp;
    use capwire::ErrorKind;

    #[test]
    fn finish_defaults_to_releasing_caps() {
        let mut builder = Builder::new_default();
        {
            let root: message::Builder = builder.init_root().unwrap();
            let mut finish = root.init_finish().unwrap();
            finish.set_question_id(7);
        }
        let root: message::Reader = builder.get_root_as_reader().unwrap();
        match root.which().unwrap() {
            message::Which::Finish(finish) => {
                let finish: finish::Reader = finish.unwrap();
                assert_eq!(finish.get_question_id(), 7);
                assert!(finish.get_release_result_caps());
            }
            _ => panic!("expected finish"),
        }
    }

    #[test]
    fn call_fields_land_at_schema_offsets() {
        let mut builder = Builder::new_default();
        {
            let root: message::Builder = builder.init_root().unwrap();
            let mut call = root.init_call().unwrap();
            call.set_question_id(3);
            call.set_interface_id(0xaabb_ccdd_eeff_0011);
            call.set_method_id(9);
            let mut target = call.reborrow().init_target().unwrap();
            target.set_imported_cap(5);
        }
        let words = capwire::serialize::write_message_to_words(&builder);
        // Segment table, root pointer, then the message struct: discriminant 2 in its first word.
        assert_eq!(&words[16..18], &[2, 0]);

        let root: message::Reader = builder.get_root_as_reader().unwrap();
        let call: call::Reader = match root.which().unwrap() {
            message::Which::Call(call) => call.unwrap(),
            _ => panic!("expected call"),
        };
        assert_eq!(call.get_question_id(), 3);
        assert_eq!(call.get_interface_id(), 0xaabb_ccdd_eeff_0011);
        assert_eq!(call.get_method_id(), 9);
        assert!(matches!(
            call.get_target().unwrap().which().unwrap(),
            super::message_target::Which::ImportedCap(5)
        ));
        assert!(matches!(
            call.get_send_results_to().unwrap(),
            call::SendResultsTo::Caller
        ));
    }

    #[test]
    fn return_with_exception_and_cap_table() {
        let mut builder = Builder::new_default();
        {
            let root: message::Builder = builder.init_root().unwrap();
            let mut ret = root.init_return().unwrap();
            ret.set_answer_id(11);
            ret.set_release_param_caps(false);
            let mut exc: exception::Builder = ret.init_exception().unwrap();
            exc.set_reason("boom").unwrap();
            exc.set_type(ErrorKind::Overloaded);
        }
        let root: message::Reader = builder.get_root_as_reader().unwrap();
        let ret: return_::Reader = match root.which().unwrap() {
            message::Which::Return(ret) => ret.unwrap(),
            _ => panic!("expected return"),
        };
        assert_eq!(ret.get_answer_id(), 11);
        assert!(!ret.get_release_param_caps());
        match ret.which().unwrap() {
            return_::Which::Exception(e) => {
                let e = e.unwrap();
                assert_eq!(e.get_reason().unwrap(), "boom");
                assert_eq!(e.get_type().unwrap(), ErrorKind::Overloaded);
            }
            _ => panic!("expected exception"),
        }
    }

    #[test]
    fn payload_descriptors_and_transforms() {
        let mut builder = Builder::new_default();
        {
            let root: message::Builder = builder.init_root().unwrap();
            let ret = root.init_return().unwrap();
            let payload = ret.init_results().unwrap();
            let mut table = payload.init_cap_table(2).unwrap();
            table.reborrow().get(0).set_sender_promise(4);
            let mut answer = table.reborrow().get(1).init_receiver_answer().unwrap();
            answer.set_question_id(6);
            let mut transform = answer.init_transform(2).unwrap();
            transform.reborrow().get(0).set_noop();
            transform.reborrow().get(1).set_get_pointer_field(3);
        }
        let root: message::Reader = builder.get_root_as_reader().unwrap();
        let payload = match root.which().unwrap() {
            message::Which::Return(ret) => match ret.unwrap().which().unwrap() {
                return_::Which::Results(p) => p.unwrap(),
                _ => panic!("expected results"),
            },
            _ => panic!("expected return"),
        };
        let table = payload.get_cap_table().unwrap();
        assert_eq!(table.len(), 2);
        let first: cap_descriptor::Reader = table.get(0);
        assert!(matches!(first.which().unwrap(), cap_descriptor::Which::SenderPromise(4)));
        assert_eq!(first.get_attached_fd(), 0xff);
        match table.get(1).which().unwrap() {
            cap_descriptor::Which::ReceiverAnswer(a) => {
                let a = a.unwrap();
                assert_eq!(a.get_question_id(), 6);
                let ops: Vec<PipelineOp> =
                    a.get_transform().unwrap().iter().map(|op| op.which().unwrap()).collect();
                assert_eq!(ops, vec![PipelineOp::Noop, PipelineOp::GetPointerField(3)]);
            }
            _ => panic!("expected receiverAnswer"),
        }
    }

    #[test]
    fn list_elements_are_written_through_successive_reborrows() {
        let mut builder = Builder::new_default();
        let mut answer: promised_answer::Builder = builder.init_root().unwrap();
        let mut transform = answer.reborrow().init_transform(3).unwrap();
        for idx in 0..transform.len() {
            let mut op = transform.reborrow().get(idx);
            if idx % 2 == 0 {
                op.set_get_pointer_field(idx as u16);
            } else {
                op.set_noop();
            }
        }
        let ops: Vec<PipelineOp> = transform
            .as_reader()
            .iter()
            .map(|op| op.which().unwrap())
            .collect();
        assert_eq!(
            ops,
            vec![
                PipelineOp::GetPointerField(0),
                PipelineOp::Noop,
                PipelineOp::GetPointerField(2),
            ]
        );
    }
}
