//! Primitive readers and writers for the payload encoding
//!
//! Payload integers are little-endian; strings are length-prefixed UTF-8.
//! The frame length prefix (big-endian) is handled by the codec, not here.
//! Readers check `remaining()` before every fetch so a truncated payload
//! surfaces as an error instead of a panic.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{ProtoError, ProtoResult};

pub fn put_str(dst: &mut BytesMut, s: &str) {
    dst.put_u32_le(s.len() as u32);
    dst.put_slice(s.as_bytes());
}

pub fn put_bool(dst: &mut BytesMut, v: bool) {
    dst.put_u8(u8::from(v));
}

pub fn put_bytes(dst: &mut BytesMut, b: &[u8]) {
    dst.put_u32_le(b.len() as u32);
    dst.put_slice(b);
}

pub fn get_u8(src: &mut Bytes, context: &'static str) -> ProtoResult<u8> {
    if src.remaining() < 1 {
        return Err(ProtoError::Truncated { context });
    }
    Ok(src.get_u8())
}

pub fn get_bool(src: &mut Bytes, context: &'static str) -> ProtoResult<bool> {
    Ok(get_u8(src, context)? != 0)
}

pub fn get_u32(src: &mut Bytes, context: &'static str) -> ProtoResult<u32> {
    if src.remaining() < 4 {
        return Err(ProtoError::Truncated { context });
    }
    Ok(src.get_u32_le())
}

pub fn get_i32(src: &mut Bytes, context: &'static str) -> ProtoResult<i32> {
    if src.remaining() < 4 {
        return Err(ProtoError::Truncated { context });
    }
    Ok(src.get_i32_le())
}

pub fn get_u64(src: &mut Bytes, context: &'static str) -> ProtoResult<u64> {
    if src.remaining() < 8 {
        return Err(ProtoError::Truncated { context });
    }
    Ok(src.get_u64_le())
}

pub fn get_str(src: &mut Bytes, context: &'static str) -> ProtoResult<String> {
    let len = get_u32(src, context)? as usize;
    if src.remaining() < len {
        return Err(ProtoError::Truncated { context });
    }
    let raw = src.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| ProtoError::InvalidUtf8 { context })
}

pub fn get_bytes(src: &mut Bytes, context: &'static str) -> ProtoResult<Bytes> {
    let len = get_u32(src, context)? as usize;
    if src.remaining() < len {
        return Err(ProtoError::Truncated { context });
    }
    Ok(src.split_to(len))
}

pub fn get_md5(src: &mut Bytes, context: &'static str) -> ProtoResult<[u8; 16]> {
    if src.remaining() < 16 {
        return Err(ProtoError::Truncated { context });
    }
    let mut digest = [0u8; 16];
    src.copy_to_slice(&mut digest);
    Ok(digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_round_trip() {
        let mut buf = BytesMut::new();
        put_str(&mut buf, "LSST.Object");
        let mut src = buf.freeze();
        assert_eq!(get_str(&mut src, "table").unwrap(), "LSST.Object");
        assert_eq!(src.remaining(), 0);
    }

    #[test]
    fn truncated_string_is_an_error() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(100); // claims 100 bytes, provides none
        let mut src = buf.freeze();
        assert!(matches!(
            get_str(&mut src, "db"),
            Err(ProtoError::Truncated { .. })
        ));
    }
}
