//! Little-endian cursor helpers shared by the FlatAST codec and the wire formats built on it.
//!
//! Every reader advances `offset` only on success, so a failed read leaves the cursor where it was.
use crate::error::CodecError;

#[inline]
pub fn read_bytes_at<'a>(data: &'a [u8], offset: &mut usize, len: usize) -> Result<&'a [u8], CodecError> {
    let end = offset
        .checked_add(len)
        .filter(|end| *end <= data.len())
        .ok_or(CodecError::BufferTooSmall {
            needed: offset.saturating_add(len),
            actual: data.len(),
        })?;
    let bytes = &data[*offset..end];
    *offset = end;
    Ok(bytes)
}

#[inline]
fn read_array_at<const N: usize>(data: &[u8], offset: &mut usize) -> Result<[u8; N], CodecError> {
    let bytes = read_bytes_at(data, offset, N)?;
    let mut buf = [0u8; N];
    buf.copy_from_slice(bytes);
    Ok(buf)
}

#[inline]
pub fn read_u8_at(data: &[u8], offset: &mut usize) -> Result<u8, CodecError> {
    Ok(read_array_at::<1>(data, offset)?[0])
}

#[inline]
pub fn read_u16_at(data: &[u8], offset: &mut usize) -> Result<u16, CodecError> {
    read_array_at(data, offset).map(u16::from_le_bytes)
}

#[inline]
pub fn read_u32_at(data: &[u8], offset: &mut usize) -> Result<u32, CodecError> {
    read_array_at(data, offset).map(u32::from_le_bytes)
}

#[inline]
pub fn read_f64_at(data: &[u8], offset: &mut usize) -> Result<f64, CodecError> {
    read_array_at(data, offset).map(f64::from_le_bytes)
}

/// Reads a `length:u32` prefixed UTF-8 string.
pub fn read_str_at(data: &[u8], offset: &mut usize, what: &'static str) -> Result<String, CodecError> {
    let start = *offset;
    let len = read_u32_at(data, offset)? as usize;
    match read_bytes_at(data, offset, len) {
        Ok(bytes) => String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidUtf8(what)),
        Err(e) => {
            *offset = start;
            Err(e)
        }
    }
}

#[inline]
pub fn write_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_le_bytes());
}

#[inline]
pub fn write_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

#[inline]
pub fn write_f64(out: &mut Vec<u8>, value: f64) {
    out.extend_from_slice(&value.to_le_bytes());
}

pub fn write_str(out: &mut Vec<u8>, value: &str) -> Result<(), CodecError> {
    write_u32(out, to_u32(value.len())?);
    out.extend_from_slice(value.as_bytes());
    Ok(())
}

#[inline]
pub fn to_u32(value: usize) -> Result<u32, CodecError> {
    u32::try_from(value).map_err(|_| CodecError::TooLarge)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_u32_advances_offset() {
        let data = [0x01, 0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00];
        let mut offset = 0;
        assert_eq!(read_u32_at(&data, &mut offset).unwrap(), 1);
        assert_eq!(read_u32_at(&data, &mut offset).unwrap(), 2);
        assert_eq!(offset, 8);
    }

    #[test]
    fn test_short_read_keeps_offset() {
        let data = [0x01, 0x00];
        let mut offset = 1;
        assert!(matches!(
            read_u32_at(&data, &mut offset),
            Err(CodecError::BufferTooSmall { needed: 5, actual: 2 })
        ));
        assert_eq!(offset, 1);
    }

    #[test]
    fn test_str_roundtrip() {
        let mut out = Vec::new();
        write_str(&mut out, "px").unwrap();
        let mut offset = 0;
        assert_eq!(read_str_at(&out, &mut offset, "unit").unwrap(), "px");
        assert_eq!(offset, out.len());
    }

    #[test]
    fn test_truncated_str_restores_offset() {
        let mut out = Vec::new();
        write_str(&mut out, "hello").unwrap();
        out.truncate(6);
        let mut offset = 0;
        assert!(read_str_at(&out, &mut offset, "value").is_err());
        assert_eq!(offset, 0);
    }
}
