use std::borrow::Cow;
use std::ops::Deref;

use anyhow::Context;

use crate::QnameError;

/// Cursor over a raw DNS message.
///
/// Borrows the message for reads and only copies it once something is written.
pub struct ByteBuf<'a> {
    buf: Cow<'a, [u8]>,
    pos: usize,
}

impl<'a> Deref for ByteBuf<'a> {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.buf.as_ref()
    }
}

impl<'a> AsRef<[u8]> for ByteBuf<'a> {
    fn as_ref(&self) -> &[u8] {
        &self.buf
    }
}

impl<'a> ByteBuf<'a> {
    pub fn new(src: &'a impl AsRef<[u8]>) -> ByteBuf<'a> {
        ByteBuf {
            buf: Cow::Borrowed(src.as_ref()),
            pos: 0,
        }
    }

    pub fn new_from_vec(src: Vec<u8>) -> ByteBuf<'static> {
        ByteBuf {
            buf: Cow::Owned(src),
            pos: 0,
        }
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf.into_owned()
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn seek(&mut self, pos: usize) {
        self.pos = pos;
    }

    pub fn peek_u16(&self, pos: usize) -> anyhow::Result<u16> {
        self.peek_bytes(pos, 2)
            .and_then(|bytes| TryInto::<[u8; 2]>::try_into(bytes).context("bug: should be exactly two bytes in length"))
            .map(u16::from_be_bytes)
    }

    /// Overwrites two bytes in place. Never grows the buffer.
    pub fn set_u16(&mut self, pos: usize, data: u16) -> anyhow::Result<()> {
        self.ensure_length(pos, 2)
            .with_context(|| format!("can't write u16 at byte {}", pos))?;
        self.buf.to_mut()[pos..pos + 2].copy_from_slice(&data.to_be_bytes());
        Ok(())
    }

    pub fn peek_bytes(&self, pos: usize, n: usize) -> anyhow::Result<&[u8]> {
        self.ensure_length(pos, n)?;
        self.get_range(pos, n).context("bug: should be present")
    }

    /// Reads uncompressed length-prefixed labels until the zero label or the end of the buffer.
    ///
    /// Compression pointers are not followed: a pointer byte is read as a label length and
    /// will typically overrun the buffer.
    pub fn read_qname(&mut self) -> Result<String, QnameError> {
        let mut labels: Vec<Cow<'_, str>> = Vec::new();
        let mut pos = self.pos;
        while pos < self.buf.len() {
            let label_length = self.buf[pos] as usize;
            pos += 1;

            // Last label, nothing more to parse
            if label_length == 0 {
                break;
            }

            let label = self
                .buf
                .get(pos..pos + label_length)
                .ok_or(QnameError::LabelOutOfBounds {
                    length: label_length,
                    pos,
                })?;
            labels.push(String::from_utf8_lossy(label));
            pos += label_length;
        }
        self.pos = pos;

        if labels.is_empty() {
            return Err(QnameError::Empty);
        }

        Ok(labels.join("."))
    }

    fn ensure_length(&self, pos: usize, n: usize) -> anyhow::Result<()> {
        if self.buf.len() < pos + n {
            anyhow::bail!("underlying buffer is too small")
        }
        Ok(())
    }

    fn get_range(&self, pos: usize, len: usize) -> Option<&[u8]> {
        self.buf.get(pos..pos + len)
    }
}
