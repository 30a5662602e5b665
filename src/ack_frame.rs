use bytes::{Buf, BufMut, BytesMut};

/// A cumulative acknowledgement: everything up to and including `value`
///  arrived contiguously. -1 means nothing has arrived yet.
///
/// ACK records carry no checksum; instead the 32-bit value is written three
///  times and a record whose copies disagree is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckFrame {
    pub value: i64,
}

impl AckFrame {
    pub const SERIALIZED_LEN: usize = 12;

    pub fn ser(&self, buf: &mut BytesMut) {
        let raw = self.value as i32;
        buf.put_i32(raw);
        buf.put_i32(raw);
        buf.put_i32(raw);
    }

    pub fn deser(mut buf: &[u8]) -> anyhow::Result<AckFrame> {
        if buf.len() < Self::SERIALIZED_LEN {
            anyhow::bail!("ACK record is shorter than {} bytes", Self::SERIALIZED_LEN);
        }

        let first = buf.get_i32();
        let second = buf.get_i32();
        let third = buf.get_i32();
        if first != second || first != third {
            anyhow::bail!("ACK record copies disagree: {} / {} / {}", first, second, third);
        }

        Ok(AckFrame {
            value: first as i64,
        })
    }
}
