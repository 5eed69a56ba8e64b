use bytes::{Bytes, BytesMut};

/// Frame codec applied per connection.
///
/// A prototype instance lives in [`Options`](crate::Options); each new
/// connection gets its own clone so codecs may carry per-stream state.
pub trait Codec: Send + Sync {
    /// Extract one frame from the inbound buffer, consuming its bytes.
    /// Returns None when no complete frame is available.
    fn decode(&mut self, inbound: &mut BytesMut) -> Option<Bytes>;

    /// Frame outbound bytes into the write buffer.
    fn encode(&mut self, data: &[u8], outbound: &mut BytesMut);

    /// Clone this codec for a new connection.
    fn clone_box(&self) -> Box<dyn Codec>;
}

/// Passthrough codec: every read batch is one frame, writes are unframed.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawCodec;

impl Codec for RawCodec {
    fn decode(&mut self, inbound: &mut BytesMut) -> Option<Bytes> {
        if inbound.is_empty() {
            return None;
        }
        Some(inbound.split().freeze())
    }

    fn encode(&mut self, data: &[u8], outbound: &mut BytesMut) {
        outbound.extend_from_slice(data);
    }

    fn clone_box(&self) -> Box<dyn Codec> {
        Box::new(*self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_codec_passthrough() {
        let mut codec = RawCodec;
        let mut inbound = BytesMut::from(&b"hello"[..]);
        let frame = codec.decode(&mut inbound).unwrap();
        assert_eq!(&frame[..], b"hello");
        assert!(inbound.is_empty());
        assert!(codec.decode(&mut inbound).is_none());

        let mut outbound = BytesMut::new();
        codec.encode(b"world", &mut outbound);
        assert_eq!(&outbound[..], b"world");
    }
}
