use anyhow::bail;
use bytes::{Buf, BufMut};

macro_rules! read_checked_impl {
    ($reader: ident, $ty:ty, $getter: ident) => {
        fn $reader(&mut self) -> anyhow::Result<$ty> {
            if self.remaining() < size_of::<$ty>() {
                bail!("buffer underflow: {} bytes left, reading {}", self.remaining(), stringify!($ty));
            }
            Ok(self.$getter())
        }
    }
}

/// Reading from untrusted buffers: every read checks the remaining length and fails instead
///  of panicking. All numbers are in network byte order.
pub trait BufExt: Buf {
    read_checked_impl!(read_u8, u8, get_u8);
    read_checked_impl!(read_u16, u16, get_u16);
    read_checked_impl!(read_u32, u32, get_u32);
    read_checked_impl!(read_u64, u64, get_u64);
    read_checked_impl!(read_i32, i32, get_i32);

    /// A string with a u16 length prefix, see [BufMutExt::put_string]
    fn read_string(&mut self) -> anyhow::Result<String> {
        let len: usize = self.read_u16()?.into();
        if self.remaining() < len {
            bail!("string of length {} exceeds the buffer's {} remaining bytes", len, self.remaining());
        }
        let mut raw = vec![0u8; len];
        self.copy_to_slice(&mut raw);
        Ok(String::from_utf8(raw)?)
    }
}

pub trait BufMutExt: BufMut {
    /// NB: Strings are length-prefixed with a u16, so longer strings are truncated. The strings
    ///      written here (connection ids and target addresses) are validated to be short.
    fn put_string(&mut self, s: &str) {
        let len = s.len().min(u16::MAX.into());
        debug_assert_eq!(len, s.len(), "string too long for serialization");
        self.put_u16(len as u16);
        self.put_slice(&s.as_bytes()[..len]);
    }
}

impl <T: Buf> BufExt for T {
}

impl <T: BufMut> BufMutExt for T {
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::empty("")]
    #[case::ascii("hello")]
    #[case::utf8("grüße")]
    fn test_string(#[case] s: &str) {
        let mut buf = BytesMut::new();
        buf.put_string(s);
        buf.put_u8(99);

        let mut b: &[u8] = &buf;
        assert_eq!(b.read_string().unwrap(), s);
        assert_eq!(b, &[99]);
    }

    #[rstest]
    #[case::no_length(b"")]
    #[case::partial_length(b"\0")]
    #[case::truncated(b"\0\x05abc")]
    #[case::invalid_utf8(b"\0\x02\xff\xfe")]
    fn test_read_string_invalid(#[case] mut buf: &[u8]) {
        assert!(buf.read_string().is_err());
    }

    #[test]
    fn test_read_checked() {
        let mut buf: &[u8] = &[1, 2, 3, 4, 5, 6, 7];
        assert_eq!(buf.read_u8().unwrap(), 1);
        assert_eq!(buf.read_u16().unwrap(), 0x0203);
        assert_eq!(buf.read_i32().unwrap(), 0x04050607);
        assert!(buf.read_u8().is_err());

        let mut buf: &[u8] = &[1, 2, 3];
        assert!(buf.read_u32().is_err());
        assert!(buf.read_u64().is_err());
        // a failed read consumes nothing
        assert_eq!(buf.read_u16().unwrap(), 0x0102);
    }
}
