//! # Wire Codec Module - Command Message Serialization
//!
//! This module implements the byte-level encoding used to invoke commands in
//! the simulation worker process. All framing is explicit and fixed-width so
//! the same bytes can be produced and consumed on either side of the FIFO
//! pair without any platform assumptions:
//!
//! - `uint`: 4 bytes, big-endian, values in `[0, 2^32)`.
//! - `int`: sign-magnitude packed into a `uint`; bit 31 set means
//!   non-negative, clear means negative, magnitude in bits 30..0.
//! - `char`: a single byte.
//! - `double`: the char-array encoding of the C `%.10e` rendering of the
//!   value, parsed back symmetrically.
//! - `vec`: three doubles (x, y, z).
//! - arrays: a `uint` length followed by the elements.
//! - `submsg`: a char array holding a complete inner message's bytes.
//!
//! [`WriteMessage`] builds outgoing messages by appending bytes;
//! [`ReadMessage`] is a cursor over a received byte buffer. Format-driven
//! reading ([`ReadMessage::read_values`]) interprets a character format
//! string with one handler per code character (`u,i,s,I,f,F,v,V,x`, where
//! `x` asserts end-of-message). Struct-valued messages are written as named
//! fields (a char-array field name followed by the value) and struct arrays,
//! mirroring how the master lays out the initialization commands.

// Unit tests
pub mod tests;

use crate::vector::Vec3;
use thiserror::Error;

/// Errors produced while encoding or decoding wire messages.
#[derive(Debug, Error)]
pub enum WireError {
    /// The buffer ended before the requested primitive was complete.
    #[error("unexpected end of message stream")]
    Eof,

    /// An `x` format code found unread bytes.
    #[error("expected end of message with {remaining} bytes remaining")]
    TrailingBytes { remaining: usize },

    /// A format string contained a code with no handler.
    #[error("unknown message format code {0:?}")]
    UnknownCode(char),

    /// A char array that should be text was not valid UTF-8.
    #[error("char array is not valid UTF-8 text")]
    BadText,

    /// A double literal failed to parse back from its text encoding.
    #[error("malformed double literal {0:?}")]
    BadDouble(String),

    /// A named field did not carry the expected name.
    #[error("expected message field {expected:?}, found {found:?}")]
    FieldMismatch { expected: String, found: String },
}

/// Largest magnitude representable by the sign-magnitude `int` encoding.
const INT_MAGNITUDE_MAX: i64 = (1 << 31) - 1;

/// Renders a double the way C's `%.10e` does: ten fractional digits and an
/// exponent that is always signed and at least two digits wide.
fn format_double(value: f64) -> String {
    let text = format!("{value:.10e}");
    // Rust renders the exponent bare ("1.0000000000e0"); normalize it.
    let (mantissa, exponent) = text
        .split_once('e')
        .expect("{:.10e} always contains an exponent");
    let (sign, digits) = match exponent.strip_prefix('-') {
        Some(digits) => ('-', digits),
        None => ('+', exponent),
    };
    format!("{mantissa}e{sign}{digits:0>2}")
}

/// Serializes arguments for a command invocation.
///
/// Messages are built by appending primitives; [`WriteMessage::into_bytes`]
/// freezes the buffer for framing. Writers return `&mut Self` so encodings
/// can be chained.
#[derive(Debug, Clone, Default)]
pub struct WriteMessage {
    buffer: Vec<u8>,
}

impl WriteMessage {
    /// Creates an empty message.
    pub fn new() -> Self {
        WriteMessage { buffer: Vec::new() }
    }

    /// Creates a message that begins with a command name char array.
    pub fn command(name: &str) -> Self {
        let mut msg = WriteMessage::new();
        msg.write_char_array(name);
        msg
    }

    /// The encoded bytes accumulated so far.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    /// Freezes the message and returns its bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    /// Number of encoded bytes accumulated so far.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// True when nothing has been written yet.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Writes a single byte.
    pub fn write_char(&mut self, c: u8) -> &mut Self {
        self.buffer.push(c);
        self
    }

    /// Writes a 4-byte big-endian unsigned integer.
    pub fn write_uint(&mut self, value: u32) -> &mut Self {
        self.buffer.extend_from_slice(&value.to_be_bytes());
        self
    }

    /// Writes a signed integer in the sign-magnitude encoding.
    ///
    /// # Panics
    ///
    /// Panics if `|value|` exceeds 31 bits; command arguments never do.
    pub fn write_int(&mut self, value: i64) -> &mut Self {
        assert!(
            value.abs() <= INT_MAGNITUDE_MAX,
            "int {value} exceeds the wire magnitude limit"
        );
        let sign = u32::from(value >= 0);
        self.write_uint(value.unsigned_abs() as u32 | (sign << 31))
    }

    /// Writes a length-prefixed array of raw bytes (a char array).
    pub fn write_byte_array(&mut self, bytes: &[u8]) -> &mut Self {
        self.write_uint(bytes.len() as u32);
        self.buffer.extend_from_slice(bytes);
        self
    }

    /// Writes a string as a char array.
    pub fn write_char_array(&mut self, s: &str) -> &mut Self {
        self.write_byte_array(s.as_bytes())
    }

    /// Writes a length-prefixed array of signed integers.
    pub fn write_int_array(&mut self, values: &[i64]) -> &mut Self {
        self.write_uint(values.len() as u32);
        for &v in values {
            self.write_int(v);
        }
        self
    }

    /// Writes a length-prefixed array of unsigned integers.
    pub fn write_uint_array(&mut self, values: &[u32]) -> &mut Self {
        self.write_uint(values.len() as u32);
        for &v in values {
            self.write_uint(v);
        }
        self
    }

    /// Writes a double as its `%.10e` char-array encoding.
    pub fn write_double(&mut self, value: f64) -> &mut Self {
        let text = format_double(value);
        self.write_char_array(&text)
    }

    /// Writes a length-prefixed array of doubles.
    pub fn write_double_array(&mut self, values: &[f64]) -> &mut Self {
        self.write_uint(values.len() as u32);
        for &v in values {
            self.write_double(v);
        }
        self
    }

    /// Writes a vector as three doubles.
    pub fn write_vec(&mut self, v: &Vec3) -> &mut Self {
        self.write_double(v.x);
        self.write_double(v.y);
        self.write_double(v.z)
    }

    /// Writes a length-prefixed array of vectors.
    pub fn write_vec_array(&mut self, values: &[Vec3]) -> &mut Self {
        self.write_uint(values.len() as u32);
        for v in values {
            self.write_vec(v);
        }
        self
    }

    /// Writes a complete inner message as a length-prefixed submessage.
    pub fn write_submsg(&mut self, msg: &WriteMessage) -> &mut Self {
        self.write_byte_array(msg.as_bytes())
    }

    /// Writes the name of a named field; the caller writes the value next.
    pub fn write_field(&mut self, name: &str) -> &mut Self {
        self.write_char_array(name)
    }

    /// Writes a struct array: a `uint` element count, then each element's
    /// named fields emitted by `write_element`.
    pub fn write_struct_array<T>(
        &mut self,
        elements: &[T],
        mut write_element: impl FnMut(&mut WriteMessage, &T),
    ) -> &mut Self {
        self.write_uint(elements.len() as u32);
        for el in elements {
            write_element(self, el);
        }
        self
    }
}

/// A decoded wire value, produced by format-driven reading.
#[derive(Debug, Clone, PartialEq)]
pub enum WireValue {
    Uint(u32),
    Int(i64),
    Str(String),
    IntArray(Vec<i64>),
    Double(f64),
    DoubleArray(Vec<f64>),
    Vector(Vec3),
    VecArray(Vec<Vec3>),
}

/// Interprets bytes returned from a command invocation in the worker process.
#[derive(Debug)]
pub struct ReadMessage {
    buffer: Vec<u8>,
    cursor: usize,
}

impl ReadMessage {
    /// Wraps received bytes in a reading cursor.
    pub fn new(bytes: Vec<u8>) -> Self {
        ReadMessage {
            buffer: bytes,
            cursor: 0,
        }
    }

    /// Number of unread bytes.
    pub fn remaining(&self) -> usize {
        self.buffer.len() - self.cursor
    }

    /// Reads a single byte.
    pub fn read_char(&mut self) -> Result<u8, WireError> {
        let b = *self.buffer.get(self.cursor).ok_or(WireError::Eof)?;
        self.cursor += 1;
        Ok(b)
    }

    fn read_exact(&mut self, n: usize) -> Result<&[u8], WireError> {
        if self.remaining() < n {
            return Err(WireError::Eof);
        }
        let slice = &self.buffer[self.cursor..self.cursor + n];
        self.cursor += n;
        Ok(slice)
    }

    /// Reads a 4-byte big-endian unsigned integer.
    pub fn read_uint(&mut self) -> Result<u32, WireError> {
        let bytes = self.read_exact(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Reads a sign-magnitude signed integer.
    pub fn read_int(&mut self) -> Result<i64, WireError> {
        let base = self.read_uint()?;
        let sign = (base >> 31) & 1;
        let magnitude = i64::from(base & 0x7fff_ffff);
        Ok(if sign == 1 { magnitude } else { -magnitude })
    }

    /// Reads a length-prefixed array of raw bytes.
    pub fn read_byte_array(&mut self) -> Result<Vec<u8>, WireError> {
        let len = self.read_uint()? as usize;
        Ok(self.read_exact(len)?.to_vec())
    }

    /// Reads a char array as UTF-8 text.
    pub fn read_char_array(&mut self) -> Result<String, WireError> {
        let bytes = self.read_byte_array()?;
        String::from_utf8(bytes).map_err(|_| WireError::BadText)
    }

    /// Reads a length-prefixed array of signed integers.
    pub fn read_int_array(&mut self) -> Result<Vec<i64>, WireError> {
        let len = self.read_uint()? as usize;
        let mut values = Vec::with_capacity(len);
        for _ in 0..len {
            values.push(self.read_int()?);
        }
        Ok(values)
    }

    /// Reads a double from its char-array text encoding.
    pub fn read_double(&mut self) -> Result<f64, WireError> {
        let text = self.read_char_array()?;
        text.trim().parse().map_err(|_| WireError::BadDouble(text))
    }

    /// Reads a length-prefixed array of doubles.
    pub fn read_double_array(&mut self) -> Result<Vec<f64>, WireError> {
        let len = self.read_uint()? as usize;
        let mut values = Vec::with_capacity(len);
        for _ in 0..len {
            values.push(self.read_double()?);
        }
        Ok(values)
    }

    /// Reads a vector (three doubles).
    pub fn read_vec(&mut self) -> Result<Vec3, WireError> {
        Ok(Vec3::new(
            self.read_double()?,
            self.read_double()?,
            self.read_double()?,
        ))
    }

    /// Reads a length-prefixed array of vectors.
    pub fn read_vec_array(&mut self) -> Result<Vec<Vec3>, WireError> {
        let len = self.read_uint()? as usize;
        let mut values = Vec::with_capacity(len);
        for _ in 0..len {
            values.push(self.read_vec()?);
        }
        Ok(values)
    }

    /// Asserts that the message has been fully consumed.
    pub fn require_end(&self) -> Result<(), WireError> {
        match self.remaining() {
            0 => Ok(()),
            remaining => Err(WireError::TrailingBytes { remaining }),
        }
    }

    /// Reads a named field's name and checks it against `expected`.
    pub fn expect_field(&mut self, expected: &str) -> Result<(), WireError> {
        let found = self.read_char_array()?;
        if found == expected {
            Ok(())
        } else {
            Err(WireError::FieldMismatch {
                expected: expected.to_string(),
                found,
            })
        }
    }

    /// Format-driven reading: one handler per format code character.
    ///
    /// Codes: `u` uint, `i` int, `s` char array, `I` int array, `f` double,
    /// `F` double array, `v` vec, `V` vec array, `x` end-of-message assert
    /// (produces no value).
    pub fn read_values(&mut self, format: &str) -> Result<Vec<WireValue>, WireError> {
        let mut values = Vec::new();
        for code in format.chars() {
            match code {
                'u' => values.push(WireValue::Uint(self.read_uint()?)),
                'i' => values.push(WireValue::Int(self.read_int()?)),
                's' => values.push(WireValue::Str(self.read_char_array()?)),
                'I' => values.push(WireValue::IntArray(self.read_int_array()?)),
                'f' => values.push(WireValue::Double(self.read_double()?)),
                'F' => values.push(WireValue::DoubleArray(self.read_double_array()?)),
                'v' => values.push(WireValue::Vector(self.read_vec()?)),
                'V' => values.push(WireValue::VecArray(self.read_vec_array()?)),
                'x' => self.require_end()?,
                other => return Err(WireError::UnknownCode(other)),
            }
        }
        Ok(values)
    }
}
