//! Length-prefixed framing shared by the log file and the peer transport.
//!
//! Frames are a 4-byte big-endian length followed by that many bytes, so a
//! reader knows exactly how much to consume without scanning for delimiters.

use std::io::{self, Read, Write};

/// Frames larger than this are treated as corruption.
pub const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

pub fn write_frame<W: Write>(writer: &mut W, body: &[u8]) -> io::Result<()> {
    let len = u32::try_from(body.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame too large"))?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(body)
}

/// Reads one frame. Returns `Ok(None)` on a clean end of stream and
/// `UnexpectedEof` when the stream stops inside a frame.
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < len_buf.len() {
        let n = reader.read(&mut len_buf[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        filled += n;
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame length {len} exceeds limit"),
        ));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    Ok(Some(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn reads_frames_until_clean_eof() -> io::Result<()> {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"one")?;
        write_frame(&mut buf, b"")?;
        write_frame(&mut buf, b"three")?;

        let mut cursor = Cursor::new(buf);
        assert_eq!(read_frame(&mut cursor)?, Some(b"one".to_vec()));
        assert_eq!(read_frame(&mut cursor)?, Some(Vec::new()));
        assert_eq!(read_frame(&mut cursor)?, Some(b"three".to_vec()));
        assert_eq!(read_frame(&mut cursor)?, None);
        Ok(())
    }

    #[test]
    fn truncated_frame_is_unexpected_eof() -> io::Result<()> {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"complete")?;
        buf.truncate(buf.len() - 2);

        let err = read_frame(&mut Cursor::new(buf)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);

        let err = read_frame(&mut Cursor::new(vec![0u8, 0])).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        Ok(())
    }
}
