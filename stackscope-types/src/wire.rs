//! Compact byte representation of stack frames for cross-process transport.
//!
//! Layout per frame, all integers little-endian: `address` (8 bytes),
//! `address2` (8 bytes), `line` (4 bytes), then three length-prefixed
//! (2-byte) strings `object`, `filename`, `function`. [`pack_array`] prefixes
//! the sequence with a 4-byte frame count.

use thiserror::Error;

use crate::frame::StackFrame;

/// Decoding failure.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    /// Input ended before the encoded value did.
    #[error("truncated input: needed {needed} more bytes at offset {offset}")]
    Truncated {
        /// Byte offset at which the read failed.
        offset: usize,
        /// Bytes missing to complete the read.
        needed: usize,
    },
    /// A string field did not hold valid UTF-8.
    #[error("invalid utf-8 in field `{field}`")]
    InvalidString {
        /// Name of the offending field.
        field: &'static str,
    },
}

impl StackFrame {
    /// Number of bytes [`pack`](Self::pack) will append for this frame.
    pub fn packed_size(&self) -> usize {
        8 + 8 + 4 + 3 * 2 + self.object.len() + self.filename.len() + self.function.len()
    }

    /// Appends the wire encoding of this frame to `out`.
    pub fn pack(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.address.to_le_bytes());
        out.extend_from_slice(&self.address2.to_le_bytes());
        out.extend_from_slice(&self.line.to_le_bytes());
        pack_str(out, &self.object);
        pack_str(out, &self.filename);
        pack_str(out, &self.function);
    }

    /// Decodes one frame from `input`, returning it with the remaining bytes.
    pub fn unpack(input: &[u8]) -> Result<(StackFrame, &[u8]), WireError> {
        let mut cursor = Cursor::new(input);
        let address = cursor.read_u64()?;
        let address2 = cursor.read_u64()?;
        let line = cursor.read_u32()?;
        let object = cursor.read_str("object")?;
        let filename = cursor.read_str("filename")?;
        let function = cursor.read_str("function")?;
        let mut frame = StackFrame {
            address,
            address2,
            object,
            function,
            ..Default::default()
        };
        frame.set_location(&filename, line);
        Ok((frame, cursor.rest()))
    }
}

/// Encodes a sequence of frames, prefixed with a 4-byte count.
pub fn pack_array(frames: &[StackFrame]) -> Vec<u8> {
    let size: usize = 4 + frames.iter().map(StackFrame::packed_size).sum::<usize>();
    let mut out = Vec::with_capacity(size);
    out.extend_from_slice(&(frames.len() as u32).to_le_bytes());
    for frame in frames {
        frame.pack(&mut out);
    }
    out
}

/// Decodes a sequence produced by [`pack_array`].
pub fn unpack_array(input: &[u8]) -> Result<Vec<StackFrame>, WireError> {
    let mut cursor = Cursor::new(input);
    let count = cursor.read_u32()? as usize;
    let mut rest = cursor.rest();
    let mut frames = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let (frame, tail) = StackFrame::unpack(rest)?;
        frames.push(frame);
        rest = tail;
    }
    Ok(frames)
}

fn pack_str(out: &mut Vec<u8>, value: &str) {
    let bytes = value.as_bytes();
    let len = bytes.len().min(u16::MAX as usize);
    out.extend_from_slice(&(len as u16).to_le_bytes());
    out.extend_from_slice(&bytes[..len]);
}

struct Cursor<'a> {
    input: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn new(input: &'a [u8]) -> Self {
        Cursor { input, offset: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        let remaining = self.input.len() - self.offset;
        if remaining < len {
            return Err(WireError::Truncated {
                offset: self.offset,
                needed: len - remaining,
            });
        }
        let slice = &self.input[self.offset..self.offset + len];
        self.offset += len;
        Ok(slice)
    }

    fn read_u64(&mut self) -> Result<u64, WireError> {
        let bytes = self.take(8)?;
        Ok(u64::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn read_u32(&mut self) -> Result<u32, WireError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn read_u16(&mut self) -> Result<u16, WireError> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn read_str(&mut self, field: &'static str) -> Result<String, WireError> {
        let len = self.read_u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| WireError::InvalidString { field })
    }

    fn rest(&self) -> &'a [u8] {
        &self.input[self.offset..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> StackFrame {
        StackFrame {
            address: 0x7f80_1234_5678,
            address2: 0x1234_5678,
            object: "/usr/lib/libexample.so".into(),
            function: "example::run".into(),
            filename: "src/run.rs".into(),
            line: 321,
        }
    }

    #[test]
    fn roundtrip_single_frame() {
        let frame = sample();
        let mut buf = Vec::new();
        frame.pack(&mut buf);
        assert_eq!(buf.len(), frame.packed_size());

        let (back, rest) = StackFrame::unpack(&buf).unwrap();
        assert!(rest.is_empty());
        assert_eq!(back, frame);
    }

    #[test]
    fn roundtrip_wide_line_numbers() {
        // lines past the 8-bit range survive the wire
        let mut frame = sample();
        frame.line = 70_000;
        let mut buf = Vec::new();
        frame.pack(&mut buf);
        let (back, _) = StackFrame::unpack(&buf).unwrap();
        assert_eq!(back.line, 70_000);
    }

    #[test]
    fn roundtrip_array() {
        let frames = vec![sample(), StackFrame::from_address(0x10), sample()];
        let buf = pack_array(&frames);
        let back = unpack_array(&buf).unwrap();
        assert_eq!(back, frames);
    }

    #[test]
    fn empty_array() {
        let buf = pack_array(&[]);
        assert_eq!(buf, vec![0, 0, 0, 0]);
        assert!(unpack_array(&buf).unwrap().is_empty());
    }

    #[test]
    fn truncated_input_is_an_error() {
        let frame = sample();
        let mut buf = Vec::new();
        frame.pack(&mut buf);
        for len in [0, 7, 19, buf.len() - 1] {
            let err = StackFrame::unpack(&buf[..len]).unwrap_err();
            assert!(matches!(err, WireError::Truncated { .. }), "len {len}");
        }
    }

    #[test]
    fn location_invariant_survives_decoding() {
        // a frame encoded with a line but no filename decodes with line 0
        let mut buf = Vec::new();
        let frame = StackFrame {
            address: 1,
            line: 99,
            ..Default::default()
        };
        frame.pack(&mut buf);
        let (back, _) = StackFrame::unpack(&buf).unwrap();
        assert!(back.filename.is_empty());
        assert_eq!(back.line, 0);
    }
}
