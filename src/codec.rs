//! LDAP message framing over a byte stream
//!
//! One LDAPMessage per frame: peek the outer SEQUENCE header, defer until the
//! whole definite-length frame is buffered, then parse. Indefinite lengths
//! are rejected (LDAP constrains BER to definite form on the wire).

use crate::ldap::LdapMessage;
use crate::parser::recover_message_id;
use asn1_rs::FromBer;
use bytes::BytesMut;
use std::io;
use tokio_util::codec::{Decoder, Encoder};

/// Upper bound for one frame; anything larger is treated as a protocol error
pub const MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

const TAG_SEQUENCE: u8 = 0x30;

/// One decoded inbound frame
///
/// Decode failures are data, not `Err`: the session still needs the
/// best-effort message id to build the `protocolError` notice before it
/// closes the connection.
#[derive(Debug)]
pub enum InboundFrame {
    Message(LdapMessage<'static>),
    Malformed(MalformedFrame),
}

#[derive(Debug)]
pub struct MalformedFrame {
    /// Recovered message id, 0 when unknown
    pub message_id: u32,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct LdapCodec;

impl LdapCodec {
    fn malformed(&self, src: &mut BytesMut, message_id: u32, reason: impl Into<String>) -> InboundFrame {
        // no way to resync after a broken header, drop everything buffered
        src.clear();
        InboundFrame::Malformed(MalformedFrame {
            message_id,
            reason: reason.into(),
        })
    }
}

impl Decoder for LdapCodec {
    type Item = InboundFrame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }
        if src[0] != TAG_SEQUENCE {
            return Ok(Some(self.malformed(src, 0, "frame does not start with SEQUENCE")));
        }
        if src.len() < 2 {
            return Ok(None);
        }
        let first = src[1];
        let (header_len, content_len) = if first < 0x80 {
            (2usize, first as usize)
        } else if first == 0x80 {
            return Ok(Some(self.malformed(src, 0, "indefinite length is not allowed")));
        } else {
            let n = (first & 0x7f) as usize;
            if n > 4 {
                return Ok(Some(self.malformed(src, 0, "overlong length encoding")));
            }
            if src.len() < 2 + n {
                return Ok(None);
            }
            let mut len = 0usize;
            for &b in &src[2..2 + n] {
                len = (len << 8) | b as usize;
            }
            (2 + n, len)
        };

        let total = header_len + content_len;
        if total > MAX_FRAME_LEN {
            return Ok(Some(self.malformed(src, 0, "frame exceeds maximum length")));
        }
        if src.len() < total {
            // wait for the rest of the frame; the reader issues no further
            // reads for other frames until this one is decoded
            src.reserve(total - src.len());
            return Ok(None);
        }

        let frame = src.split_to(total);
        match LdapMessage::from_ber(&frame) {
            Ok((_, msg)) => Ok(Some(InboundFrame::Message(msg.into_static()))),
            Err(e) => {
                let message_id = recover_message_id(&frame);
                Ok(Some(InboundFrame::Malformed(MalformedFrame {
                    message_id,
                    reason: e.to_string(),
                })))
            }
        }
    }
}

impl Encoder<LdapMessage<'static>> for LdapCodec {
    type Error = io::Error;

    fn encode(
        &mut self,
        msg: LdapMessage<'static>,
        dst: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        dst.extend_from_slice(&msg.to_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ldap::{MessageID, ProtocolOp};
    use hex_literal::hex;

    fn decode_all(data: &[u8]) -> Vec<InboundFrame> {
        let mut codec = LdapCodec;
        let mut buf = BytesMut::from(data);
        let mut out = Vec::new();
        while let Some(frame) = codec.decode(&mut buf).expect("io error") {
            out.push(frame);
        }
        out
    }

    #[test]
    fn partial_frame_is_deferred() {
        let mut codec = LdapCodec;
        // abandon(5) frame, truncated after the message id
        let mut buf = BytesMut::from(&hex!("30 06 02 01 06")[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&hex!("50 01 05"));
        match codec.decode(&mut buf).unwrap() {
            Some(InboundFrame::Message(msg)) => {
                assert_eq!(msg.message_id, MessageID(6));
                assert!(matches!(msg.protocol_op, ProtocolOp::AbandonRequest(_)));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn pipelined_frames_decode_in_order() {
        let mut data = Vec::new();
        data.extend_from_slice(&hex!("30 06 02 01 01 50 01 05"));
        data.extend_from_slice(&hex!("30 06 02 01 02 50 01 05"));
        let frames = decode_all(&data);
        assert_eq!(frames.len(), 2);
        match (&frames[0], &frames[1]) {
            (InboundFrame::Message(a), InboundFrame::Message(b)) => {
                assert_eq!(a.message_id, MessageID(1));
                assert_eq!(b.message_id, MessageID(2));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn indefinite_length_is_rejected() {
        let frames = decode_all(&hex!("30 80 02 01 01 00 00"));
        assert!(matches!(frames[0], InboundFrame::Malformed(_)));
    }

    #[test]
    fn malformed_op_recovers_message_id() {
        // valid envelope and id, bogus protocol op tag (universal NULL)
        let frames = decode_all(&hex!("30 05 02 01 2a 05 00"));
        match &frames[0] {
            InboundFrame::Malformed(m) => assert_eq!(m.message_id, 42),
            other => panic!("unexpected {other:?}"),
        }
    }
}
