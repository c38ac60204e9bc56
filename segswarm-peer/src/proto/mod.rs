mod command;

pub use command::{decode_command, encode_command, PeerCommand};

use bytes::{BufMut, BytesMut};

/// Prefix of every control frame. Anything else on the wire is raw payload.
pub const MAGIC: [u8; 4] = [0x53, 0x47, 0x53, 0x57];

/// Longest LEB128 encoding accepted for a length or count.
const MAX_VARINT_BYTES: usize = 5;

pub trait Encoder {
    fn encode(&self) -> Result<Vec<u8>>;
}

pub trait Decoder: Sized {
    fn decode(buf: &[u8]) -> Result<Self>;
}

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("not a control frame")]
    BadMagic,
    #[error("unknown command type {0}")]
    UnknownType(u8),
    #[error("unexpected end of frame")]
    Truncated,
    #[error("{0} trailing bytes after command")]
    TrailingBytes(usize),
    #[error("varint too long")]
    VarintOverflow,
    #[error("invalid presence flag {0}")]
    BadFlag(u8),
    #[error("invalid utf-8 in identifier")]
    Utf8(#[from] std::str::Utf8Error),
}

pub type Result<T> = std::result::Result<T, Error>;

pub(crate) struct FrameWriter {
    buf: BytesMut,
}

impl FrameWriter {
    pub(crate) fn new(command_type: u8) -> FrameWriter {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_slice(&MAGIC);
        buf.put_u8(command_type);
        FrameWriter { buf }
    }

    pub(crate) fn varint(&mut self, mut value: u64) {
        loop {
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            if value == 0 {
                self.buf.put_u8(byte);
                return;
            }
            self.buf.put_u8(byte | 0x80);
        }
    }

    pub(crate) fn string(&mut self, s: &str) {
        self.varint(s.len() as u64);
        self.buf.put_slice(s.as_bytes());
    }

    pub(crate) fn u64(&mut self, value: u64) {
        self.buf.put_u64(value);
    }

    pub(crate) fn opt_u64(&mut self, value: Option<u64>) {
        match value {
            Some(value) => {
                self.buf.put_u8(1);
                self.buf.put_u64(value);
            }
            None => self.buf.put_u8(0),
        }
    }

    pub(crate) fn strings(&mut self, items: &[String]) {
        self.varint(items.len() as u64);
        for item in items {
            self.string(item);
        }
    }

    pub(crate) fn finish(self) -> Vec<u8> {
        self.buf.to_vec()
    }
}

pub(crate) struct FrameReader<'a> {
    buf: &'a [u8],
}

impl<'a> FrameReader<'a> {
    /// Check the magic prefix and return the reader positioned after the
    /// command type, along with the type.
    pub(crate) fn open(buf: &'a [u8]) -> Result<(FrameReader<'a>, u8)> {
        if buf.len() < MAGIC.len() || buf[..MAGIC.len()] != MAGIC {
            return Err(Error::BadMagic);
        }
        let mut reader = FrameReader {
            buf: &buf[MAGIC.len()..],
        };
        let command_type = reader.u8()?;
        Ok((reader, command_type))
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() < n {
            return Err(Error::Truncated);
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    pub(crate) fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn varint(&mut self) -> Result<u64> {
        let mut value = 0u64;
        for i in 0..MAX_VARINT_BYTES {
            let byte = self.u8()?;
            value |= u64::from(byte & 0x7f) << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(Error::VarintOverflow)
    }

    pub(crate) fn u64(&mut self) -> Result<u64> {
        let bytes = self.take(8)?;
        let mut be = [0u8; 8];
        be.copy_from_slice(bytes);
        Ok(u64::from_be_bytes(be))
    }

    pub(crate) fn opt_u64(&mut self) -> Result<Option<u64>> {
        match self.u8()? {
            0 => Ok(None),
            1 => Ok(Some(self.u64()?)),
            flag => Err(Error::BadFlag(flag)),
        }
    }

    pub(crate) fn string(&mut self) -> Result<String> {
        let len = self.varint()?;
        if len > self.buf.len() as u64 {
            return Err(Error::Truncated);
        }
        let bytes = self.take(len as usize)?;
        Ok(std::str::from_utf8(bytes)?.to_owned())
    }

    pub(crate) fn strings(&mut self) -> Result<Vec<String>> {
        let count = self.varint()?;
        // Every string takes at least one byte, so a count beyond the
        // remaining length is already known to be truncated.
        if count > self.buf.len() as u64 {
            return Err(Error::Truncated);
        }
        let mut items = Vec::with_capacity(count as usize);
        for _ in 0..count {
            items.push(self.string()?);
        }
        Ok(items)
    }

    pub(crate) fn finish(self) -> Result<()> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(Error::TrailingBytes(self.buf.len()))
        }
    }
}
