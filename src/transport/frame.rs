//! Frame codec for the upgraded stream.
//!
//! Wire layout of one frame:
//!
//! ```text
//! byte 0: FIN (0x80) | RSV1-3 (0x70, must be zero) | opcode (0x0F)
//! byte 1: MASK (0x80) | length code (0x7F)
//!         code < 126   -> payload length
//!         code == 126  -> u16 big-endian length follows
//!         code == 127  -> u64 big-endian length follows
//! [4-byte masking key if MASK]
//! payload (XOR-ed with the key, cycling, if MASK)
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use crate::FrameError;

/// Largest payload a control frame may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Frame opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// Continuation of a fragmented message.
    Continuation,
    /// UTF-8 text.
    Text,
    /// Raw bytes.
    Binary,
    /// Connection close.
    Close,
    /// Ping; answered with a pong carrying the same payload.
    Ping,
    /// Pong.
    Pong,
}

impl Opcode {
    /// Wire value of this opcode.
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Continuation => 0x0,
            Self::Text => 0x1,
            Self::Binary => 0x2,
            Self::Close => 0x8,
            Self::Ping => 0x9,
            Self::Pong => 0xA,
        }
    }

    /// Parses a wire value.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::ReservedOpcode`] for 0x3-0x7 and 0xB-0xF.
    pub fn from_u8(value: u8) -> Result<Self, FrameError> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            other => Err(FrameError::ReservedOpcode(other)),
        }
    }

    /// Returns `true` for close, ping and pong.
    pub fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }
}

/// One decoded frame, payload already unmasked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Final fragment of a message.
    pub fin: bool,
    /// Frame opcode.
    pub opcode: Opcode,
    /// Unmasked payload.
    pub payload: Bytes,
}

/// A complete message reassembled from one or more frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// A text message.
    Text(String),
    /// A binary message.
    Binary(Bytes),
    /// A ping with its payload.
    Ping(Bytes),
    /// A pong with its payload.
    Pong(Bytes),
    /// A close frame with its status code, if one was sent.
    Close(Option<u16>),
}

/// Appends one complete frame to `dst`.
///
/// With `mask` set the payload is XOR-ed with the key and the key is written
/// after the length.
pub fn encode_frame(opcode: Opcode, payload: &[u8], mask: Option<[u8; 4]>, dst: &mut BytesMut) {
    let len = payload.len();
    dst.reserve(len + 14);
    dst.put_u8(0x80 | opcode.as_u8());

    let mask_bit = if mask.is_some() { 0x80 } else { 0x00 };
    if len < 126 {
        dst.put_u8(mask_bit | len as u8);
    } else if len < 65536 {
        dst.put_u8(mask_bit | 126);
        dst.put_u16(len as u16);
    } else {
        dst.put_u8(mask_bit | 127);
        dst.put_u64(len as u64);
    }

    match mask {
        Some(key) => {
            dst.put_slice(&key);
            dst.extend(payload.iter().enumerate().map(|(i, b)| b ^ key[i % 4]));
        }
        None => dst.put_slice(payload),
    }
}

/// Builds outbound frames, masking them with a fresh random key when enabled.
#[derive(Debug, Clone, Copy)]
pub struct FrameEncoder {
    mask: bool,
}

impl FrameEncoder {
    /// Creates an encoder.
    pub fn new(mask: bool) -> Self {
        Self { mask }
    }

    /// Encodes one unfragmented frame.
    pub fn encode(&self, opcode: Opcode, payload: &[u8]) -> BytesMut {
        let mut dst = BytesMut::new();
        let key = self.mask.then(rand::random::<[u8; 4]>);
        encode_frame(opcode, payload, key, &mut dst);
        dst
    }
}

/// Incremental decoder for inbound bytes.
///
/// Feed bytes with [`extend`](Self::extend) as they arrive and pull
/// complete messages with [`next_message`](Self::next_message). Control
/// frames interleaved in a fragmented message are returned as they arrive.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    max_payload: usize,
    partial: Option<(Opcode, BytesMut)>,
}

impl FrameDecoder {
    /// Creates a decoder rejecting messages larger than `max_payload` bytes.
    pub fn new(max_payload: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_payload,
            partial: None,
        }
    }

    /// Appends received bytes.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes received but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Parses the next raw frame, or `None` if more bytes are needed.
    ///
    /// # Errors
    ///
    /// Returns a [`FrameError`] on any format violation. The decoder should
    /// be discarded afterwards.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        if self.buf.len() < 2 {
            return Ok(None);
        }
        let b0 = self.buf[0];
        let b1 = self.buf[1];

        let rsv = b0 & 0x70;
        if rsv != 0 {
            return Err(FrameError::ReservedBits(rsv >> 4));
        }
        let fin = b0 & 0x80 != 0;
        let opcode = Opcode::from_u8(b0 & 0x0F)?;
        let masked = b1 & 0x80 != 0;

        let (len, mut header_len) = match b1 & 0x7F {
            126 => {
                if self.buf.len() < 4 {
                    return Ok(None);
                }
                (u64::from(u16::from_be_bytes([self.buf[2], self.buf[3]])), 4)
            }
            127 => {
                if self.buf.len() < 10 {
                    return Ok(None);
                }
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&self.buf[2..10]);
                (u64::from_be_bytes(raw), 10)
            }
            n => (u64::from(n), 2),
        };

        if opcode.is_control() {
            if !fin {
                return Err(FrameError::InvalidControlFrame("fragmented control frame"));
            }
            if len > MAX_CONTROL_PAYLOAD as u64 {
                return Err(FrameError::InvalidControlFrame(
                    "control payload over 125 bytes",
                ));
            }
        }
        if len > self.max_payload as u64 {
            return Err(FrameError::PayloadTooLarge {
                len,
                max: self.max_payload,
            });
        }

        let key_start = header_len;
        if masked {
            header_len += 4;
        }
        // Bounded by max_payload above
        let total = header_len + len as usize;
        if self.buf.len() < total {
            return Ok(None);
        }

        let mut raw = self.buf.split_to(total);
        let mut payload = raw.split_off(header_len);
        if masked {
            let key = [
                raw[key_start],
                raw[key_start + 1],
                raw[key_start + 2],
                raw[key_start + 3],
            ];
            for (i, byte) in payload.iter_mut().enumerate() {
                *byte ^= key[i % 4];
            }
        }

        Ok(Some(Frame {
            fin,
            opcode,
            payload: payload.freeze(),
        }))
    }

    /// Returns the next complete message, or `None` if more bytes are needed.
    ///
    /// # Errors
    ///
    /// Returns a [`FrameError`] on format violations, out-of-order
    /// fragments, oversized reassembled messages or invalid UTF-8 text.
    pub fn next_message(&mut self) -> Result<Option<Message>, FrameError> {
        loop {
            let Some(frame) = self.next_frame()? else {
                return Ok(None);
            };

            match frame.opcode {
                Opcode::Ping => return Ok(Some(Message::Ping(frame.payload))),
                Opcode::Pong => return Ok(Some(Message::Pong(frame.payload))),
                Opcode::Close => {
                    let code = (frame.payload.len() >= 2)
                        .then(|| u16::from_be_bytes([frame.payload[0], frame.payload[1]]));
                    return Ok(Some(Message::Close(code)));
                }
                Opcode::Text | Opcode::Binary => {
                    if self.partial.is_some() {
                        return Err(FrameError::UnexpectedFragment(
                            "new message while a fragmented one is in progress",
                        ));
                    }
                    if frame.fin {
                        return complete(frame.opcode, frame.payload).map(Some);
                    }
                    self.partial = Some((frame.opcode, BytesMut::from(&frame.payload[..])));
                }
                Opcode::Continuation => {
                    let Some((opcode, mut acc)) = self.partial.take() else {
                        return Err(FrameError::UnexpectedFragment(
                            "continuation without a message in progress",
                        ));
                    };
                    let len = acc.len() + frame.payload.len();
                    if len > self.max_payload {
                        return Err(FrameError::PayloadTooLarge {
                            len: len as u64,
                            max: self.max_payload,
                        });
                    }
                    acc.extend_from_slice(&frame.payload);
                    if frame.fin {
                        return complete(opcode, acc.freeze()).map(Some);
                    }
                    self.partial = Some((opcode, acc));
                }
            }
        }
    }
}

fn complete(opcode: Opcode, payload: Bytes) -> Result<Message, FrameError> {
    if opcode == Opcode::Text {
        String::from_utf8(payload.to_vec())
            .map(Message::Text)
            .map_err(|_| FrameError::InvalidUtf8)
    } else {
        Ok(Message::Binary(payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: usize = 1024 * 1024;

    fn encode(opcode: Opcode, payload: &[u8], mask: Option<[u8; 4]>) -> BytesMut {
        let mut dst = BytesMut::new();
        encode_frame(opcode, payload, mask, &mut dst);
        dst
    }

    fn raw_frame(fin: bool, opcode: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![if fin { 0x80 } else { 0x00 } | opcode, payload.len() as u8];
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn test_length_encoding_boundaries() {
        // (payload length, expected header length)
        for (len, header) in [(0, 2), (125, 2), (126, 4), (65535, 4), (65536, 10)] {
            let frame = encode(Opcode::Binary, &vec![0xAB; len], None);
            assert_eq!(frame.len(), header + len, "payload {len}");
            assert_eq!(frame[0], 0x82);
        }

        let frame = encode(Opcode::Binary, &[0u8; 125], None);
        assert_eq!(frame[1], 125);
        let frame = encode(Opcode::Binary, &[0u8; 126], None);
        assert_eq!(&frame[1..4], &[126, 0x00, 0x7E]);
        let frame = encode(Opcode::Binary, &vec![0u8; 65536], None);
        assert_eq!(frame[1], 127);
        assert_eq!(&frame[2..10], &65536u64.to_be_bytes());
    }

    #[test]
    fn test_text_frame_header() {
        let frame = encode(Opcode::Text, b"hi", None);
        assert_eq!(&frame[..], &[0x81, 0x02, b'h', b'i']);
    }

    #[test]
    fn test_masked_frame_layout() {
        let key = [0x37, 0xfa, 0x21, 0x3d];
        let frame = encode(Opcode::Text, b"Hello", Some(key));
        // Known masked "Hello" sample
        assert_eq!(
            &frame[..],
            &[0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58]
        );
    }

    #[test]
    fn test_decode_masked_and_unmasked() {
        let mut decoder = FrameDecoder::new(MAX);
        decoder.extend(&encode(Opcode::Text, b"plain", None));
        decoder.extend(&encode(Opcode::Text, b"masked", Some([1, 2, 3, 4])));

        assert_eq!(
            decoder.next_message().unwrap(),
            Some(Message::Text("plain".into()))
        );
        assert_eq!(
            decoder.next_message().unwrap(),
            Some(Message::Text("masked".into()))
        );
        assert_eq!(decoder.next_message().unwrap(), None);
    }

    #[test]
    fn test_decode_extended_lengths() {
        let mut decoder = FrameDecoder::new(MAX);
        let medium = vec![7u8; 300];
        let large = vec![9u8; 70_000];
        decoder.extend(&encode(Opcode::Binary, &medium, None));
        decoder.extend(&encode(Opcode::Binary, &large, Some([9, 8, 7, 6])));

        assert_eq!(
            decoder.next_message().unwrap(),
            Some(Message::Binary(Bytes::from(medium)))
        );
        assert_eq!(
            decoder.next_message().unwrap(),
            Some(Message::Binary(Bytes::from(large)))
        );
    }

    #[test]
    fn test_partial_input_waits() {
        let frame = encode(Opcode::Binary, &[1u8; 200], None);
        let mut decoder = FrameDecoder::new(MAX);

        decoder.extend(&frame[..1]);
        assert_eq!(decoder.next_frame().unwrap(), None);
        decoder.extend(&frame[1..3]);
        assert_eq!(decoder.next_frame().unwrap(), None);
        decoder.extend(&frame[3..100]);
        assert_eq!(decoder.next_frame().unwrap(), None);
        decoder.extend(&frame[100..]);
        let decoded = decoder.next_frame().unwrap().unwrap();
        assert_eq!(decoded.payload.len(), 200);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_fragmented_message_with_interleaved_ping() {
        let mut decoder = FrameDecoder::new(MAX);
        decoder.extend(&raw_frame(false, 0x1, b"hel"));
        decoder.extend(&raw_frame(true, 0x9, b"p"));
        decoder.extend(&raw_frame(false, 0x0, b"lo "));
        decoder.extend(&raw_frame(true, 0x0, b"world"));

        assert_eq!(
            decoder.next_message().unwrap(),
            Some(Message::Ping(Bytes::from_static(b"p")))
        );
        assert_eq!(
            decoder.next_message().unwrap(),
            Some(Message::Text("hello world".into()))
        );
    }

    #[test]
    fn test_close_with_code() {
        let mut decoder = FrameDecoder::new(MAX);
        decoder.extend(&encode(Opcode::Close, &1000u16.to_be_bytes(), None));
        decoder.extend(&encode(Opcode::Close, &[], None));
        assert_eq!(decoder.next_message().unwrap(), Some(Message::Close(Some(1000))));
        assert_eq!(decoder.next_message().unwrap(), Some(Message::Close(None)));
    }

    #[test]
    fn test_reserved_opcode_rejected() {
        let mut decoder = FrameDecoder::new(MAX);
        decoder.extend(&raw_frame(true, 0x3, b""));
        assert_eq!(
            decoder.next_frame().unwrap_err(),
            FrameError::ReservedOpcode(0x3)
        );
    }

    #[test]
    fn test_reserved_bits_rejected() {
        let mut decoder = FrameDecoder::new(MAX);
        decoder.extend(&[0xC1, 0x00]);
        assert_eq!(decoder.next_frame().unwrap_err(), FrameError::ReservedBits(4));
    }

    #[test]
    fn test_control_frame_rules() {
        let mut decoder = FrameDecoder::new(MAX);
        decoder.extend(&raw_frame(false, 0x9, b"x"));
        assert!(matches!(
            decoder.next_frame().unwrap_err(),
            FrameError::InvalidControlFrame(_)
        ));

        let mut decoder = FrameDecoder::new(MAX);
        decoder.extend(&[0x89, 126, 0x00, 0x7E]);
        assert!(matches!(
            decoder.next_frame().unwrap_err(),
            FrameError::InvalidControlFrame(_)
        ));
    }

    #[test]
    fn test_payload_limit() {
        let mut decoder = FrameDecoder::new(100);
        decoder.extend(&[0x82, 126, 0x01, 0x00]);
        assert_eq!(
            decoder.next_frame().unwrap_err(),
            FrameError::PayloadTooLarge { len: 256, max: 100 }
        );

        // Reassembled size is limited too
        let mut decoder = FrameDecoder::new(4);
        decoder.extend(&raw_frame(false, 0x2, b"abc"));
        decoder.extend(&raw_frame(true, 0x0, b"de"));
        assert!(matches!(
            decoder.next_message().unwrap_err(),
            FrameError::PayloadTooLarge { len: 5, max: 4 }
        ));
    }

    #[test]
    fn test_out_of_order_fragments() {
        let mut decoder = FrameDecoder::new(MAX);
        decoder.extend(&raw_frame(true, 0x0, b"orphan"));
        assert!(matches!(
            decoder.next_message().unwrap_err(),
            FrameError::UnexpectedFragment(_)
        ));

        let mut decoder = FrameDecoder::new(MAX);
        decoder.extend(&raw_frame(false, 0x1, b"a"));
        decoder.extend(&raw_frame(true, 0x1, b"b"));
        assert!(matches!(
            decoder.next_message().unwrap_err(),
            FrameError::UnexpectedFragment(_)
        ));
    }

    #[test]
    fn test_invalid_utf8_text() {
        let mut decoder = FrameDecoder::new(MAX);
        decoder.extend(&raw_frame(true, 0x1, &[0xff, 0xfe]));
        assert_eq!(decoder.next_message().unwrap_err(), FrameError::InvalidUtf8);
    }

    #[test]
    fn test_encoder_masks_by_default() {
        let frame = FrameEncoder::new(true).encode(Opcode::Binary, &[1, 2, 3]);
        assert_eq!(frame[1] & 0x80, 0x80);
        assert_eq!(frame.len(), 2 + 4 + 3);

        let mut decoder = FrameDecoder::new(MAX);
        decoder.extend(&frame);
        assert_eq!(
            decoder.next_message().unwrap(),
            Some(Message::Binary(Bytes::from_static(&[1, 2, 3])))
        );

        let plain = FrameEncoder::new(false).encode(Opcode::Binary, &[1, 2, 3]);
        assert_eq!(&plain[..], &[0x82, 0x03, 1, 2, 3]);
    }
}
