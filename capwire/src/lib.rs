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

//! # capwire
//!
//! A zero-copy, segmented message format. Messages are built in place inside
//! word-aligned segments and read back lazily, straight out of the bytes, with
//! every pointer dereference bounds-checked and charged against a traversal budget.
//!
//! Readers and builders never hold raw addresses. They hold a reference to the
//! arena that owns the segments plus a `(segment id, word offset)` position.

pub mod any_pointer;
pub mod cap_table;
pub mod capability;
pub mod data;
pub mod dynamic_list;
pub mod dynamic_struct;
pub mod dynamic_value;
pub mod message;
pub mod primitive_list;
pub mod schema;
pub mod serialize;
pub mod serialize_packed;
pub mod text;
pub mod traits;

#[doc(hidden)]
pub mod private;

/// Size of a message or of one object within it, as reported by `total_size()`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct MessageSize {
    pub word_count: u64,

    /// Size of the capability table.
    pub cap_count: u32,
}

impl core::ops::AddAssign for MessageSize {
    fn add_assign(&mut self, rhs: Self) {
        self.word_count += rhs.word_count;
        self.cap_count += rhs.cap_count;
    }
}

/// An enum value or union discriminant that was not found among those defined in a schema.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub struct NotInSchema(pub u16);

impl core::fmt::Display for NotInSchema {
    fn fmt(&self, fmt: &mut core::fmt::Formatter) -> core::result::Result<(), core::fmt::Error> {
        write!(
            fmt,
            "Enum value or union discriminant {} was not present in the schema.",
            self.0
        )
    }
}

impl std::error::Error for NotInSchema {}

/// Because messages are lazily validated, the return type of any method that reads a pointer field
/// must be wrapped in a Result.
pub type Result<T> = ::core::result::Result<T, Error>;

/// Describes an arbitrary error that prevented an operation from completing.
#[derive(Debug, Clone)]
pub struct Error {
    /// The general kind of the error. Code that decides how to respond to an error
    /// should read only this field in making its decision.
    pub kind: ErrorKind,

    /// Extra context about error
    pub extra: String,
}

/// The general nature of an error. The purpose of this enum is not to describe the error itself,
/// but rather to describe how the client might want to respond to the error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Something went wrong
    Failed,

    /// The call failed because of a temporary lack of resources. This could be space resources
    /// (out of memory, out of disk space) or time resources (request queue overflow, operation
    /// timed out).
    ///
    /// The operation might work if tried again, but it should NOT be repeated immediately as this
    /// may simply exacerbate the problem.
    Overloaded,

    /// The call required communication over a connection that has been lost. The callee will need
    /// to re-establish connections and try again.
    Disconnected,

    /// The requested method is not implemented. The caller may wish to revert to a fallback
    /// approach based on other methods.
    Unimplemented,

    /// A pointer offset or size points outside of its segment.
    MessageContainsOutOfBoundsPointer,

    /// More words were traversed than the reader's traversal budget allows.
    TraversalLimitExceeded,

    /// Pointers were nested more deeply than the reader's nesting limit allows.
    NestingLimitExceeded,

    /// The input ended in the middle of a message.
    PrematureEndOfFile,

    /// An allocation would push the message past its configured total size.
    ResourceExceeded,

    /// Packed input ended in the middle of a word or run.
    PrematureEndOfPackedInput,

    /// A packed run extended past the end of the message it was encoding.
    PackedInputDidNotEndCleanlyOnASegmentBoundary,

    /// The segment table declared zero or too many segments.
    InvalidNumberOfSegments,

    /// The segment table declared more words than the receiver is willing to accept.
    MessageTooLarge,

    /// A far pointer named a segment that does not exist.
    InvalidSegmentId,

    /// A far pointer's landing pad was itself a far pointer.
    FarPointerLandingPadIsFar,

    /// A double-far landing pad did not start with a single-far pointer.
    MalformedDoubleFarPointer,

    /// A struct pointer was expected but something else was found.
    NotAStruct,

    /// A list pointer was expected but something else was found.
    NotAList,

    /// A capability pointer was expected but something else was found.
    NotACapability,

    /// The element size recorded in a list pointer cannot be read as the requested list type.
    ListElementSizeMismatch,

    /// An inline-composite list's tag word is not a struct tag, or its sizes don't add up.
    MalformedInlineCompositeList,

    /// Text was not terminated by a NUL byte.
    TextNotNulTerminated,

    /// Text contained bytes that are not valid UTF-8.
    TextContainsNonUtf8Data,

    /// A capability pointer named an index that has no entry in the capability table.
    InvalidCapabilityPointer,

    /// A capability table index was used after its reference count reached zero.
    CapabilityReleased,

    /// A capability pointer was null where a capability was required.
    MessageContainsNullCapabilityPointer,

    /// The value does not have the type the caller asked for.
    TypeMismatch,

    /// No field with the requested name exists in the schema.
    FieldNotFound,

    /// A list index was out of range.
    IndexOutOfBounds,
}

impl Error {
    /// Wraps a plain string. The kind is `Failed`.
    pub fn failed(description: String) -> Self {
        Self {
            extra: description,
            kind: ErrorKind::Failed,
        }
    }

    pub fn from_kind(kind: ErrorKind) -> Self {
        Self {
            extra: String::new(),
            kind,
        }
    }

    pub fn from_kind_context(kind: ErrorKind, extra: String) -> Self {
        Self { kind, extra }
    }

    pub fn overloaded(description: String) -> Self {
        Self {
            extra: description,
            kind: ErrorKind::Overloaded,
        }
    }

    pub fn disconnected(description: String) -> Self {
        Self {
            extra: description,
            kind: ErrorKind::Disconnected,
        }
    }

    pub fn unimplemented(description: String) -> Self {
        Self {
            extra: description,
            kind: ErrorKind::Unimplemented,
        }
    }

    /// Whether this error is one of the four kinds that can cross the RPC wire as an exception.
    pub fn is_exception_kind(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::Failed
                | ErrorKind::Overloaded
                | ErrorKind::Disconnected
                | ErrorKind::Unimplemented
        )
    }
}

impl core::convert::From<::std::io::Error> for Error {
    fn from(err: ::std::io::Error) -> Self {
        use std::io;
        // Codecs layered under an io::Read report their own errors through io::Error.
        if let Some(inner) = err.get_ref().and_then(|e| e.downcast_ref::<Error>()) {
            return inner.clone();
        }
        let kind = match err.kind() {
            io::ErrorKind::TimedOut => ErrorKind::Overloaded,
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected => ErrorKind::Disconnected,
            io::ErrorKind::UnexpectedEof => ErrorKind::PrematureEndOfFile,
            _ => ErrorKind::Failed,
        };
        Self {
            kind,
            extra: format!("{err}"),
        }
    }
}

impl core::convert::From<core::str::Utf8Error> for Error {
    fn from(err: core::str::Utf8Error) -> Self {
        Self::from_kind_context(ErrorKind::TextContainsNonUtf8Data, format!("{err}"))
    }
}

impl core::convert::From<NotInSchema> for Error {
    fn from(e: NotInSchema) -> Self {
        Self::failed(format!("Enum value or union discriminant {} was not present in schema.", e.0))
    }
}

impl core::fmt::Display for ErrorKind {
    fn fmt(&self, fmt: &mut core::fmt::Formatter) -> core::result::Result<(), core::fmt::Error> {
        match self {
            Self::Failed => write!(fmt, "Failed"),
            Self::Overloaded => write!(fmt, "Overloaded"),
            Self::Disconnected => write!(fmt, "Disconnected"),
            Self::Unimplemented => write!(fmt, "Unimplemented"),
            Self::MessageContainsOutOfBoundsPointer => {
                write!(fmt, "Message contains out-of-bounds pointer.")
            }
            Self::TraversalLimitExceeded => write!(
                fmt,
                "Exceeded message traversal limit. See capwire::message::ReaderOptions."
            ),
            Self::NestingLimitExceeded => write!(
                fmt,
                "Message is too deeply nested. See capwire::message::ReaderOptions."
            ),
            Self::PrematureEndOfFile => write!(fmt, "Premature end of file"),
            Self::ResourceExceeded => write!(fmt, "Message exceeds its allocation limit."),
            Self::PrematureEndOfPackedInput => write!(fmt, "Premature end of packed input."),
            Self::PackedInputDidNotEndCleanlyOnASegmentBoundary => write!(
                fmt,
                "Packed input did not end cleanly on a segment boundary."
            ),
            Self::InvalidNumberOfSegments => write!(fmt, "Invalid number of segments."),
            Self::MessageTooLarge => write!(
                fmt,
                "Message is too large. To increase the limit on the receiving end, see capwire::message::ReaderOptions."
            ),
            Self::InvalidSegmentId => write!(fmt, "Message contains far pointer to invalid segment."),
            Self::FarPointerLandingPadIsFar => write!(
                fmt,
                "Far pointer landing pad is itself a far pointer."
            ),
            Self::MalformedDoubleFarPointer => write!(
                fmt,
                "First word of a double-far landing pad must be a single-far pointer."
            ),
            Self::NotAStruct => write!(
                fmt,
                "Message contains non-struct pointer where struct pointer was expected."
            ),
            Self::NotAList => write!(
                fmt,
                "Message contains non-list pointer where list pointer was expected."
            ),
            Self::NotACapability => write!(
                fmt,
                "Message contains non-capability pointer where capability pointer was expected."
            ),
            Self::ListElementSizeMismatch => write!(
                fmt,
                "Existing list value is incompatible with expected type."
            ),
            Self::MalformedInlineCompositeList => {
                write!(fmt, "Inline-composite list is malformed.")
            }
            Self::TextNotNulTerminated => write!(fmt, "Message contains text that is not NUL-terminated."),
            Self::TextContainsNonUtf8Data => write!(fmt, "Text contains non-utf8 data."),
            Self::InvalidCapabilityPointer => {
                write!(fmt, "Message contains invalid capability pointer.")
            }
            Self::CapabilityReleased => write!(fmt, "Capability table entry has been released."),
            Self::MessageContainsNullCapabilityPointer => {
                write!(fmt, "Message contains null capability pointer.")
            }
            Self::TypeMismatch => write!(fmt, "Type mismatch."),
            Self::FieldNotFound => write!(fmt, "Field not found."),
            Self::IndexOutOfBounds => write!(fmt, "Index out of bounds."),
        }
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, fmt: &mut core::fmt::Formatter) -> core::result::Result<(), core::fmt::Error> {
        if self.extra.is_empty() {
            write!(fmt, "{}", self.kind)
        } else {
            write!(fmt, "{}: {}", self.kind, self.extra)
        }
    }
}

impl std::error::Error for Error {}

/// The segments of a finished message, ready to be written out.
pub enum OutputSegments<'a> {
    SingleSegment([&'a [u8]; 1]),
    MultiSegment(Vec<&'a [u8]>),
}

impl<'a> core::ops::Deref for OutputSegments<'a> {
    type Target = [&'a [u8]];
    fn deref(&self) -> &[&'a [u8]] {
        match self {
            OutputSegments::SingleSegment(s) => s,
            OutputSegments::MultiSegment(v) => v,
        }
    }
}

impl<'s> message::ReaderSegments for OutputSegments<'s> {
    fn get_segment(&self, id: u32) -> Option<&[u8]> {
        self.get(id as usize).copied()
    }

    fn len(&self) -> usize {
        match self {
            OutputSegments::SingleSegment(_) => 1,
            OutputSegments::MultiSegment(v) => v.len(),
        }
    }
}
