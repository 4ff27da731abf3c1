//! Payload encodings and the pack-function contract.
//!
//! Payloads exist in two byte layouts:
//!
//! | [`Encoding`] | Layout |
//! |---|---|
//! | `Native` | Host layout used inside the server: little-endian, packed, `u8`/`u16` at their natural width. |
//! | `Xdr` | Wire layout: big-endian, every scalar occupies at least 4 bytes, variable-length data padded to 4-byte alignment. |
//!
//! A payload type implements [`Payload`] once, in terms of
//! [`PayloadWriter`] / [`PayloadReader`]; [`transcode`] then converts
//! between the two layouts in either direction.  Monomorphised
//! `transcode::<T>` functions are what the dispatch table stores as
//! [`PackFn`]s.

use thiserror::Error;

/// Direction of a pack-function call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XdrOp {
    /// Native → wire.
    Pack,
    /// Wire → native.
    Unpack,
}

/// Signature of every payload codec registered in the dispatch table.
pub type PackFn = fn(&[u8], XdrOp) -> Result<Vec<u8>, WireError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Native,
    Xdr,
}

/// Errors raised while encoding or decoding wire data.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("buffer too short: need {need} bytes, got {got} ({context})")]
    TooShort {
        need: usize,
        got: usize,
        context: &'static str,
    },

    #[error("bad start marker: expected {expected:#06x}, got {actual:#06x}")]
    BadStartMarker { expected: u16, actual: u16 },

    #[error("unknown message type {0}")]
    UnknownMessageType(u8),

    #[error("no codec registered for interface {interface} type {msg_type} subtype {subtype}")]
    NoCodec {
        interface: u16,
        msg_type: u8,
        subtype: u8,
    },

    #[error("array of {count} elements exceeds the remaining {remaining} bytes")]
    ArrayTooLong { count: usize, remaining: usize },

    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),

    #[error("string is not valid UTF-8")]
    InvalidUtf8,

    #[error("value {value} does not fit in {width}")]
    Overflow { value: u32, width: &'static str },
}

impl From<WireError> for armature_types::HalError {
    fn from(e: WireError) -> Self {
        armature_types::HalError::Wire(e.to_string())
    }
}

fn xdr_pad(len: usize) -> usize {
    (4 - len % 4) % 4
}

/// Serialises payload fields in one [`Encoding`].
#[derive(Debug)]
pub struct PayloadWriter {
    encoding: Encoding,
    buf: Vec<u8>,
}

impl PayloadWriter {
    pub fn new(encoding: Encoding) -> Self {
        Self {
            encoding,
            buf: Vec::new(),
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn put_u8(&mut self, v: u8) {
        match self.encoding {
            Encoding::Native => self.buf.push(v),
            Encoding::Xdr => self.buf.extend_from_slice(&u32::from(v).to_be_bytes()),
        }
    }

    pub fn put_u16(&mut self, v: u16) {
        match self.encoding {
            Encoding::Native => self.buf.extend_from_slice(&v.to_le_bytes()),
            Encoding::Xdr => self.buf.extend_from_slice(&u32::from(v).to_be_bytes()),
        }
    }

    pub fn put_u32(&mut self, v: u32) {
        match self.encoding {
            Encoding::Native => self.buf.extend_from_slice(&v.to_le_bytes()),
            Encoding::Xdr => self.buf.extend_from_slice(&v.to_be_bytes()),
        }
    }

    pub fn put_f32(&mut self, v: f32) {
        self.put_u32(v.to_bits());
    }

    /// Element count of a variable-length array.
    pub fn put_len(&mut self, len: usize) {
        self.put_u32(len as u32);
    }

    /// Variable-length opaque bytes (counted, padded on the wire).
    pub fn put_opaque(&mut self, bytes: &[u8]) {
        self.put_len(bytes.len());
        self.buf.extend_from_slice(bytes);
        if self.encoding == Encoding::Xdr {
            self.buf.extend(std::iter::repeat_n(0u8, xdr_pad(bytes.len())));
        }
    }

    pub fn put_str(&mut self, s: &str) {
        self.put_opaque(s.as_bytes());
    }
}

/// Deserialises payload fields in one [`Encoding`].
#[derive(Debug)]
pub struct PayloadReader<'a> {
    encoding: Encoding,
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    pub fn new(encoding: Encoding, buf: &'a [u8]) -> Self {
        Self {
            encoding,
            buf,
            pos: 0,
        }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Fail unless the whole buffer has been consumed.
    pub fn finish(self) -> Result<(), WireError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(WireError::TrailingBytes(n)),
        }
    }

    fn take(&mut self, n: usize, context: &'static str) -> Result<&'a [u8], WireError> {
        if self.remaining() < n {
            return Err(WireError::TooShort {
                need: n,
                got: self.remaining(),
                context,
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self, context: &'static str) -> Result<[u8; N], WireError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N, context)?);
        Ok(out)
    }

    fn xdr_word(&mut self, width: &'static str) -> Result<u32, WireError> {
        Ok(u32::from_be_bytes(self.take_array::<4>(width)?))
    }

    pub fn get_u8(&mut self) -> Result<u8, WireError> {
        match self.encoding {
            Encoding::Native => Ok(self.take_array::<1>("u8")?[0]),
            Encoding::Xdr => {
                let v = self.xdr_word("u8")?;
                u8::try_from(v).map_err(|_| WireError::Overflow { value: v, width: "u8" })
            }
        }
    }

    pub fn get_u16(&mut self) -> Result<u16, WireError> {
        match self.encoding {
            Encoding::Native => Ok(u16::from_le_bytes(self.take_array::<2>("u16")?)),
            Encoding::Xdr => {
                let v = self.xdr_word("u16")?;
                u16::try_from(v).map_err(|_| WireError::Overflow { value: v, width: "u16" })
            }
        }
    }

    pub fn get_u32(&mut self) -> Result<u32, WireError> {
        match self.encoding {
            Encoding::Native => Ok(u32::from_le_bytes(self.take_array::<4>("u32")?)),
            Encoding::Xdr => self.xdr_word("u32"),
        }
    }

    pub fn get_f32(&mut self) -> Result<f32, WireError> {
        self.get_u32().map(f32::from_bits)
    }

    /// Element count of a variable-length array whose elements occupy at
    /// least `min_elem` bytes each.  Rejects counts the buffer cannot hold.
    pub fn get_len(&mut self, min_elem: usize) -> Result<usize, WireError> {
        let count = self.get_u32()? as usize;
        let remaining = self.remaining();
        if count.saturating_mul(min_elem.max(1)) > remaining {
            return Err(WireError::ArrayTooLong { count, remaining });
        }
        Ok(count)
    }

    pub fn get_opaque(&mut self) -> Result<Vec<u8>, WireError> {
        let len = self.get_len(1)?;
        let bytes = self.take(len, "opaque")?.to_vec();
        if self.encoding == Encoding::Xdr {
            self.take(xdr_pad(len), "opaque padding")?;
        }
        Ok(bytes)
    }

    pub fn get_string(&mut self) -> Result<String, WireError> {
        String::from_utf8(self.get_opaque()?).map_err(|_| WireError::InvalidUtf8)
    }

    /// Minimum encoded width of a `u8`/`u16` scalar in this encoding.
    pub fn scalar_width(&self, native: usize) -> usize {
        match self.encoding {
            Encoding::Native => native,
            Encoding::Xdr => 4,
        }
    }
}

/// A payload with one field-order definition shared by both encodings.
pub trait Payload: Sized {
    fn write(&self, w: &mut PayloadWriter);

    fn read(r: &mut PayloadReader<'_>) -> Result<Self, WireError>;

    fn encode(&self, encoding: Encoding) -> Vec<u8> {
        let mut w = PayloadWriter::new(encoding);
        self.write(&mut w);
        w.into_bytes()
    }

    /// Decode a complete buffer; trailing bytes are an error.
    fn decode(encoding: Encoding, buf: &[u8]) -> Result<Self, WireError> {
        let mut r = PayloadReader::new(encoding, buf);
        let value = Self::read(&mut r)?;
        r.finish()?;
        Ok(value)
    }

    fn to_native(&self) -> Vec<u8> {
        self.encode(Encoding::Native)
    }

    fn from_native(buf: &[u8]) -> Result<Self, WireError> {
        Self::decode(Encoding::Native, buf)
    }
}

/// Convert a `P` payload between native and wire layout.
pub fn transcode<P: Payload>(buf: &[u8], op: XdrOp) -> Result<Vec<u8>, WireError> {
    let (from, to) = match op {
        XdrOp::Pack => (Encoding::Native, Encoding::Xdr),
        XdrOp::Unpack => (Encoding::Xdr, Encoding::Native),
    };
    Ok(P::decode(from, buf)?.encode(to))
}
