//! Binary value codec.
//!
//! Everything that crosses the wire outside of packet framing goes through
//! the [`Wire`] trait: little-endian fixed-width scalars, LEB128-style
//! varint lengths, UTF-8 strings, sequences, options, tuples, and
//! millisecond durations. Serializable aggregates declare an explicit field
//! list with [`wire_struct!`]; the field order is the wire order.
//!
//! Heterogeneous context values additionally carry a portable class name
//! and are decoded through a process-wide registry, so both peers must
//! register the same types (see [`register_context_type`]).

use crate::error::{Error, Result};
use crate::util::FlatMap;
use core::fmt;
use parking_lot::RwLock;
use std::any::Any;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// A value with a byte-exact wire encoding.
pub trait Wire: Sized {
    /// Appends the encoding of `self` to `buf`.
    fn encode(&self, buf: &mut Vec<u8>);

    /// Decodes one value from the reader.
    ///
    /// # Errors
    ///
    /// `data_mismatch` on truncated or malformed input.
    fn decode(r: &mut WireReader<'_>) -> Result<Self>;
}

/// A type with a portable class name shared by all peers.
pub trait Portable {
    /// The name used to identify this type on the wire.
    const CLASS_NAME: &'static str;
}

/// Cursor over a received byte buffer.
#[derive(Debug)]
pub struct WireReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    /// Creates a reader over `data`.
    #[must_use]
    pub const fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Returns the number of not-yet-consumed bytes.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Returns true if all bytes were consumed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Returns the unconsumed tail without advancing.
    #[must_use]
    pub fn rest(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    /// Consumes and returns the next `n` bytes.
    ///
    /// # Errors
    ///
    /// `data_mismatch` if fewer than `n` bytes remain.
    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(Error::data_mismatch(format!(
                "truncated input: need {n} bytes, have {}",
                self.remaining()
            )));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// Consumes and returns one byte.
    pub fn byte(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }
}

/// Appends a varint-encoded length (LEB128, 7 bits per byte).
pub fn encode_len(mut len: usize, buf: &mut Vec<u8>) {
    loop {
        let mut byte = (len & 0x7f) as u8;
        len >>= 7;
        if len != 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if len == 0 {
            return;
        }
    }
}

/// Decodes a varint-encoded length.
///
/// # Errors
///
/// `data_mismatch` on truncation or a varint wider than 64 bits.
pub fn decode_len(r: &mut WireReader<'_>) -> Result<usize> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    loop {
        let byte = r.byte()?;
        if shift >= 64 {
            return Err(Error::data_mismatch("varint length overflows 64 bits"));
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return usize::try_from(value)
                .map_err(|_| Error::data_mismatch("length does not fit in usize"));
        }
        shift += 7;
    }
}

macro_rules! impl_wire_scalar {
    ($($ty:ty),+) => {
        $(
            impl Wire for $ty {
                fn encode(&self, buf: &mut Vec<u8>) {
                    buf.extend_from_slice(&self.to_le_bytes());
                }

                fn decode(r: &mut WireReader<'_>) -> Result<Self> {
                    let bytes = r.take(core::mem::size_of::<$ty>())?;
                    let mut raw = [0u8; core::mem::size_of::<$ty>()];
                    raw.copy_from_slice(bytes);
                    Ok(<$ty>::from_le_bytes(raw))
                }
            }
        )+
    };
}

impl_wire_scalar!(u8, i8, u16, i16, u32, i32, u64, i64, f32, f64);

impl Wire for bool {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(u8::from(*self));
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        match r.byte()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(Error::data_mismatch(format!("invalid bool byte {other}"))),
        }
    }
}

impl Wire for () {
    fn encode(&self, _buf: &mut Vec<u8>) {}

    fn decode(_r: &mut WireReader<'_>) -> Result<Self> {
        Ok(())
    }
}

/// Appends a string without requiring an owned `String`.
pub fn encode_str(s: &str, buf: &mut Vec<u8>) {
    encode_len(s.len(), buf);
    buf.extend_from_slice(s.as_bytes());
}

impl Wire for String {
    fn encode(&self, buf: &mut Vec<u8>) {
        encode_str(self, buf);
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        let len = decode_len(r)?;
        let bytes = r.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| Error::data_mismatch("string is not valid UTF-8"))
    }
}

impl<T: Wire> Wire for Vec<T> {
    fn encode(&self, buf: &mut Vec<u8>) {
        encode_len(self.len(), buf);
        for item in self {
            item.encode(buf);
        }
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        let len = decode_len(r)?;
        // An element takes at least one byte; reject lengths the input
        // cannot possibly satisfy before reserving memory for them.
        if len > r.remaining() && core::mem::size_of::<T>() > 0 {
            return Err(Error::data_mismatch(format!(
                "sequence length {len} exceeds remaining input"
            )));
        }
        let mut out = Vec::with_capacity(len);
        for _ in 0..len {
            out.push(T::decode(r)?);
        }
        Ok(out)
    }
}

impl<T: Wire> Wire for Option<T> {
    fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            None => buf.push(0),
            Some(v) => {
                buf.push(1);
                v.encode(buf);
            }
        }
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        match r.byte()? {
            0 => Ok(None),
            1 => Ok(Some(T::decode(r)?)),
            other => Err(Error::data_mismatch(format!("invalid option byte {other}"))),
        }
    }
}

impl Wire for Duration {
    /// Durations travel as varint milliseconds.
    fn encode(&self, buf: &mut Vec<u8>) {
        let ms = u64::try_from(self.as_millis()).unwrap_or(u64::MAX);
        encode_len(ms as usize, buf);
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        let ms = decode_len(r)?;
        Ok(Duration::from_millis(ms as u64))
    }
}

macro_rules! impl_wire_tuple {
    ($(($T:ident, $idx:tt)),+) => {
        impl<$($T: Wire),+> Wire for ($($T,)+) {
            fn encode(&self, buf: &mut Vec<u8>) {
                $( self.$idx.encode(buf); )+
            }

            fn decode(r: &mut WireReader<'_>) -> Result<Self> {
                Ok(($($T::decode(r)?,)+))
            }
        }
    };
}

impl_wire_tuple!((T0, 0));
impl_wire_tuple!((T0, 0), (T1, 1));
impl_wire_tuple!((T0, 0), (T1, 1), (T2, 2));
impl_wire_tuple!((T0, 0), (T1, 1), (T2, 2), (T3, 3));
impl_wire_tuple!((T0, 0), (T1, 1), (T2, 2), (T3, 3), (T4, 4));

/// Declares a serializable aggregate with an explicit, ordered field list.
///
/// The struct gains `Debug`, `Clone`, `PartialEq` and `Default` derives, a
/// [`Wire`] implementation encoding the fields in declaration order, and a
/// [`Portable`] implementation whose class name is the struct identifier.
///
/// ```ignore
/// wire_struct! {
///     pub struct Sample {
///         pub x: u32,
///         pub y: f64,
///         pub z: Vec<String>,
///     }
/// }
/// ```
#[macro_export]
macro_rules! wire_struct {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $( $(#[$fmeta:meta])* $fvis:vis $field:ident : $ty:ty ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Default)]
        $vis struct $name {
            $( $(#[$fmeta])* $fvis $field: $ty, )*
        }

        impl $crate::wire::Wire for $name {
            fn encode(&self, buf: &mut ::std::vec::Vec<u8>) {
                $( $crate::wire::Wire::encode(&self.$field, buf); )*
            }

            fn decode(r: &mut $crate::wire::WireReader<'_>) -> $crate::error::Result<Self> {
                Ok(Self {
                    $( $field: $crate::wire::Wire::decode(r)?, )*
                })
            }
        }

        impl $crate::wire::Portable for $name {
            const CLASS_NAME: &'static str = stringify!($name);
        }
    };
}

wire_struct! {
    /// The wire form of an error: portable class name plus message.
    pub struct ErrorEnvelope {
        /// Portable class name, e.g. `deadline_exceeded`.
        pub class_name: String,
        /// Human-readable message carried alongside.
        pub message: String,
    }
}

impl ErrorEnvelope {
    /// Captures an [`Error`] for transmission.
    #[must_use]
    pub fn from_error(err: &Error) -> Self {
        Self {
            class_name: err.kind().portable_name().to_string(),
            message: err.message().to_string(),
        }
    }

    /// Resurrects the corresponding error kind, falling back to
    /// `unknown_error` for class names this build does not know.
    #[must_use]
    pub fn into_error(self) -> Error {
        match crate::error::ErrorKind::for_portable_name(&self.class_name) {
            Some(kind) => Error::new(kind).with_context(self.message),
            None => Error::new(crate::error::ErrorKind::Unknown)
                .with_context(format!("{}: {}", self.class_name, self.message)),
        }
    }
}

/// A call outcome on the wire: either the value or a transported error.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultHolder<T> {
    /// The call succeeded.
    Value(T),
    /// The call failed; the envelope names the error class.
    Error(ErrorEnvelope),
}

impl<T> ResultHolder<T> {
    /// Captures a call result for transmission.
    #[must_use]
    pub fn from_result(result: Result<T>) -> Self {
        match result {
            Ok(v) => Self::Value(v),
            Err(e) => Self::Error(ErrorEnvelope::from_error(&e)),
        }
    }

    /// Converts back into a `Result`, resurrecting transported errors.
    ///
    /// # Errors
    ///
    /// The transported error, when the holder carries one.
    pub fn into_result(self) -> Result<T> {
        match self {
            Self::Value(v) => Ok(v),
            Self::Error(env) => Err(env.into_error()),
        }
    }
}

impl<T: Wire> Wire for ResultHolder<T> {
    fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            Self::Value(v) => {
                buf.push(0);
                v.encode(buf);
            }
            Self::Error(env) => {
                buf.push(1);
                env.encode(buf);
            }
        }
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        match r.byte()? {
            0 => Ok(Self::Value(T::decode(r)?)),
            1 => Ok(Self::Error(ErrorEnvelope::decode(r)?)),
            other => Err(Error::data_mismatch(format!(
                "invalid result holder tag {other}"
            ))),
        }
    }
}

/// A dynamically-typed, serializable value stored in a context data bag.
pub trait ContextValue: Any + Send + Sync + fmt::Debug {
    /// The portable class name identifying the concrete type.
    fn class_name(&self) -> &'static str;

    /// Appends the wire encoding of the payload (without the name).
    fn encode_payload(&self, buf: &mut Vec<u8>);

    /// Upcast used to recover the concrete type.
    fn as_any(&self) -> &dyn Any;
}

impl<T> ContextValue for T
where
    T: Wire + Portable + Any + Send + Sync + fmt::Debug,
{
    fn class_name(&self) -> &'static str {
        T::CLASS_NAME
    }

    fn encode_payload(&self, buf: &mut Vec<u8>) {
        self.encode(buf);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

type DecodeFn = fn(&mut WireReader<'_>) -> Result<Arc<dyn ContextValue>>;

fn registry() -> &'static RwLock<FlatMap<String, DecodeFn>> {
    static REGISTRY: OnceLock<RwLock<FlatMap<String, DecodeFn>>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(FlatMap::new()))
}

/// Registers `T` so peers can send it inside a context data bag.
///
/// Registration is idempotent; both sides of a connection must register the
/// same set of types.
pub fn register_context_type<T>()
where
    T: Wire + Portable + Any + Send + Sync + fmt::Debug,
{
    fn decode_one<T>(r: &mut WireReader<'_>) -> Result<Arc<dyn ContextValue>>
    where
        T: Wire + Portable + Any + Send + Sync + fmt::Debug,
    {
        Ok(Arc::new(T::decode(r)?))
    }

    registry()
        .write()
        .replace(T::CLASS_NAME.to_string(), decode_one::<T>);
}

/// Decodes a registered context value by class name.
///
/// # Errors
///
/// `data_mismatch` if the class is not registered locally or the payload
/// has trailing bytes.
pub fn decode_context_value(name: &str, payload: &[u8]) -> Result<Arc<dyn ContextValue>> {
    let decode = registry()
        .read()
        .get(&name.to_string())
        .copied()
        .ok_or_else(|| Error::data_mismatch(format!("unregistered context value class {name}")))?;
    let mut r = WireReader::new(payload);
    let value = decode(&mut r)?;
    if !r.is_empty() {
        return Err(Error::data_mismatch(format!(
            "trailing bytes after context value {name}"
        )));
    }
    Ok(value)
}

/// Encodes a value into a fresh buffer.
#[must_use]
pub fn to_bytes<T: Wire>(value: &T) -> Vec<u8> {
    let mut buf = Vec::new();
    value.encode(&mut buf);
    buf
}

/// Decodes a value from a buffer, requiring full consumption.
///
/// # Errors
///
/// `data_mismatch` on malformed input or trailing bytes.
pub fn from_bytes<T: Wire>(bytes: &[u8]) -> Result<T> {
    let mut r = WireReader::new(bytes);
    let value = T::decode(&mut r)?;
    if !r.is_empty() {
        return Err(Error::data_mismatch("trailing bytes after value"));
    }
    Ok(value)
}
