use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::protocol::Packet;
use crate::{AppError, AppResult};

/// Frames packets on a byte stream.
///
/// Each frame is a 4 byte big-endian length followed by the JSON encoded
/// [`Packet`]. A frame above `max_frame_length`, or a body that is not a packet
/// this build understands, is a protocol error and the connection is dropped.
#[derive(Debug)]
pub struct PacketCodec {
    frames: LengthDelimitedCodec,
}

impl PacketCodec {
    pub fn new(max_frame_length: usize) -> Self {
        PacketCodec {
            frames: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .max_frame_length(max_frame_length)
                .new_codec(),
        }
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> AppResult<Option<Packet>> {
        let frame = match self.frames.decode(src) {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(None),
            Err(e) => return Err(AppError::MalformedProtocol(e.to_string())),
        };
        let packet = serde_json::from_slice(&frame)?;
        Ok(Some(packet))
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = AppError;

    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> AppResult<()> {
        let body = serde_json::to_vec(&packet)
            .map_err(|e| AppError::PacketSendFailed(e.to_string()))?;
        self.frames
            .encode(Bytes::from(body), dst)
            .map_err(|e| AppError::PacketSendFailed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use bytes::BufMut;

    use super::*;
    use crate::protocol::PacketType;

    #[test]
    fn waits_for_the_whole_frame() {
        let mut codec = PacketCodec::new(1024);
        let mut encoded = BytesMut::new();
        codec
            .encode(Packet::hello("Welcome to Biddr"), &mut encoded)
            .unwrap();

        let mut partial = encoded.split_to(encoded.len() - 3);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.unsplit(encoded);
        let packet = codec.decode(&mut partial).unwrap().unwrap();
        assert!(packet.is(PacketType::Hello));
        assert_eq!(packet.payload().as_text(), Some("Welcome to Biddr"));
        assert!(partial.is_empty());
    }

    #[test]
    fn two_frames_in_one_read() {
        let mut codec = PacketCodec::new(1024);
        let mut buf = BytesMut::new();
        codec.encode(Packet::ping(), &mut buf).unwrap();
        codec.encode(Packet::version(7), &mut buf).unwrap();

        assert!(codec.decode(&mut buf).unwrap().unwrap().is(PacketType::Ping));
        let version = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(version.payload().as_number(), Some(7));
    }

    #[test]
    fn oversized_frame_is_malformed() {
        let mut codec = PacketCodec::new(16);
        let mut buf = BytesMut::new();
        buf.put_u32(1024);
        buf.put_slice(&[0u8; 32]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, AppError::MalformedProtocol(_)));
    }

    #[test]
    fn garbage_body_is_malformed() {
        let mut codec = PacketCodec::new(1024);
        let mut buf = BytesMut::new();
        let body = b"{\"not\":\"a packet\"}";
        buf.put_u32(body.len() as u32);
        buf.put_slice(body);
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, AppError::MalformedProtocol(_)));
    }
}
