//! Little-endian message buffers.
//!
//! [`MessageWriter`] assembles one outgoing frame in memory so it can be emitted with a
//! single write. [`MessageReader`] is a self-contained view over one incoming frame body
//! with its own cursor; reads are bounds-checked and report a [`ClientError::Decode`]
//! instead of panicking on truncated input.
//!
//! # Typed values
//!
//! Strings and UUIDs are written the way the server's binary codec expects them:
//!
//! - string: type code `9`, `i32` byte length, UTF-8 bytes
//! - uuid: type code `10`, most significant `i64`, least significant `i64`
//! - null: type code `101`
use bytes::{Buf, BufMut, Bytes, BytesMut};
use uuid::Uuid;

use crate::error::{ClientError, Result};

pub const TYPE_CODE_STRING: u8 = 9;
pub const TYPE_CODE_UUID: u8 = 10;
pub const TYPE_CODE_NULL: u8 = 101;

const LENGTH_FIELD_SIZE: usize = size_of::<i32>();

#[derive(Debug, Default)]
pub struct MessageWriter {
    buf: BytesMut,
}

impl MessageWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a length-prefixed frame; the length is patched in by [`Self::finish_frame`].
    pub(crate) fn framed() -> Self {
        let mut writer = Self::new();
        writer.buf.put_i32_le(0);
        writer
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.buf.put_u8(value as u8);
    }

    pub fn write_i16(&mut self, value: i16) {
        self.buf.put_i16_le(value);
    }

    pub fn write_i32(&mut self, value: i32) {
        self.buf.put_i32_le(value);
    }

    pub fn write_i64(&mut self, value: i64) {
        self.buf.put_i64_le(value);
    }

    pub fn write_bytes(&mut self, value: &[u8]) {
        self.buf.put_slice(value);
    }

    pub fn write_string(&mut self, value: Option<&str>) -> Result<()> {
        match value {
            Some(value) => {
                let len = i32::try_from(value.len()).map_err(|_| {
                    ClientError::IllegalArgument(format!(
                        "string of {} bytes is too long to encode",
                        value.len()
                    ))
                })?;
                self.buf.put_u8(TYPE_CODE_STRING);
                self.buf.put_i32_le(len);
                self.buf.put_slice(value.as_bytes());
            }
            None => self.buf.put_u8(TYPE_CODE_NULL),
        }
        Ok(())
    }

    pub fn write_uuid(&mut self, value: Option<Uuid>) {
        match value {
            Some(value) => {
                let (msb, lsb) = value.as_u64_pair();
                self.buf.put_u8(TYPE_CODE_UUID);
                self.buf.put_i64_le(msb as i64);
                self.buf.put_i64_le(lsb as i64);
            }
            None => self.buf.put_u8(TYPE_CODE_NULL),
        }
    }

    /// Patches the leading length field to cover everything after it.
    pub(crate) fn finish_frame(mut self) -> Result<Bytes> {
        let body = self.buf.len() - LENGTH_FIELD_SIZE;
        let body = i32::try_from(body).map_err(|_| {
            ClientError::IllegalArgument(format!("message of {body} bytes exceeds frame limit"))
        })?;
        self.buf[..LENGTH_FIELD_SIZE].copy_from_slice(&body.to_le_bytes());
        Ok(self.buf.freeze())
    }

    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }
}

#[derive(Debug, Clone, Default)]
pub struct MessageReader {
    buf: Bytes,
    len: usize,
}

impl MessageReader {
    pub fn new(buf: Bytes) -> Self {
        let len = buf.len();
        Self { buf, len }
    }

    /// Offset of the cursor from the start of the view.
    pub fn position(&self) -> usize {
        self.len - self.buf.remaining()
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn ensure(&self, wanted: usize) -> Result<()> {
        if self.buf.remaining() < wanted {
            return Err(ClientError::Decode(format!(
                "buffer underflow at {}: wanted {wanted} bytes, {} left",
                self.position(),
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        self.ensure(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        self.ensure(2)?;
        Ok(self.buf.get_i16_le())
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        self.ensure(4)?;
        Ok(self.buf.get_i32_le())
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        self.ensure(8)?;
        Ok(self.buf.get_i64_le())
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<Bytes> {
        self.ensure(len)?;
        Ok(self.buf.copy_to_bytes(len))
    }

    /// Unread bytes, without advancing the cursor.
    pub fn peek_remaining(&self) -> &[u8] {
        self.buf.chunk()
    }

    pub fn read_string(&mut self) -> Result<Option<String>> {
        match self.read_u8()? {
            TYPE_CODE_NULL => Ok(None),
            TYPE_CODE_STRING => {
                let len = self.read_i32()?;
                let len = usize::try_from(len)
                    .map_err(|_| ClientError::Decode(format!("negative string length {len}")))?;
                let raw = self.read_bytes(len)?;
                String::from_utf8(raw.to_vec())
                    .map(Some)
                    .map_err(|e| ClientError::Decode(format!("invalid utf-8 string: {e}")))
            }
            code => Err(ClientError::Decode(format!(
                "expected string type code {TYPE_CODE_STRING}, found {code}"
            ))),
        }
    }

    pub fn read_uuid(&mut self) -> Result<Option<Uuid>> {
        match self.read_u8()? {
            TYPE_CODE_NULL => Ok(None),
            TYPE_CODE_UUID => {
                let msb = self.read_i64()? as u64;
                let lsb = self.read_i64()? as u64;
                Ok(Some(Uuid::from_u64_pair(msb, lsb)))
            }
            code => Err(ClientError::Decode(format!(
                "expected uuid type code {TYPE_CODE_UUID}, found {code}"
            ))),
        }
    }
}
