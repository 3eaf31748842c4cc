//! The wire framing codec: a compact variable-length binary frame format
//! with four action types.
//!
//! Wire layout (big-endian, streamed):
//!
//! ```text
//! byte 0:  [AA F L XXXXX]
//!            AA    = action (2 bits)
//!            F     = "has extended payload-length bytes following" (1 bit)
//!            L     = "has label" (1 bit)
//!            XXXXX = inline payload length 0..31, used only when F=0
//! ```
//!
//! When `F=1`, one more byte follows; together with the low nibble of byte 0
//! it encodes a 12-bit payload length (0..4095), capping payloads at 4095
//! bytes. When `L=1`, one length byte (0..255) follows, then that many label
//! bytes. Order on the wire: header byte, [extended-length byte], [payload],
//! [label-len], [label].
//!
//! Ported from the reference encoder/decoder in
//! `internal/protocol/frame.go`, with the inline 0..31 fast path spelled out
//! explicitly (the reference always takes the extended-length path whenever
//! a payload is present).

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{BrokerError, Result};

pub const MAX_PAYLOAD_LEN: usize = 4095;
pub const MAX_LABEL_LEN: usize = 255;
/// Per-frame data capacity once fragment header overhead is subtracted.
pub const MAX_FRAGMENT_DATA_LEN: usize = 4082;

/// The four wire actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Action {
    Response = 0,
    Handshake = 1,
    Label = 2,
    Multicast = 3,
}

impl Action {
    fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => Action::Response,
            1 => Action::Handshake,
            2 => Action::Label,
            _ => Action::Multicast,
        }
    }
}

/// One protocol message on the wire.
///
/// `Label` and `Multicast` frames carry a non-empty label; `Response`
/// frames carry an empty label and either an empty payload (success or
/// heartbeat) or an error string.
#[derive(Debug, Clone)]
pub struct Frame {
    pub act: Action,
    pub label: String,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(act: Action, label: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            act,
            label: label.into(),
            payload: payload.into(),
        }
    }

    pub fn response(payload: impl Into<Bytes>) -> Self {
        Self::new(Action::Response, String::new(), payload)
    }

    pub fn handshake(secret: impl Into<Bytes>) -> Self {
        Self::new(Action::Handshake, String::new(), secret)
    }

    pub fn label_op(label: impl Into<String>, op: u8) -> Self {
        Self::new(Action::Label, label, Bytes::copy_from_slice(&[op]))
    }

    pub fn multicast(label: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self::new(Action::Multicast, label, payload)
    }

    /// Encode into a standalone wire buffer. Fails if payload > 4095 bytes
    /// or label > 255 bytes.
    pub fn encode(&self) -> Result<Bytes> {
        if self.payload.len() > MAX_PAYLOAD_LEN {
            return Err(BrokerError::protocol(format!(
                "payload is more than {MAX_PAYLOAD_LEN} bytes"
            )));
        }
        if self.label.len() > MAX_LABEL_LEN {
            return Err(BrokerError::protocol(format!(
                "label is more than {MAX_LABEL_LEN} bytes"
            )));
        }

        let mut buf = BytesMut::with_capacity(3 + self.payload.len() + 1 + self.label.len());
        let mut header = (self.act as u8) << 6;
        let plen = self.payload.len();

        if plen <= 0x1F {
            header |= plen as u8;
            buf.put_u8(header);
        } else {
            header |= 0x20 | (((plen >> 8) & 0x0F) as u8);
            buf.put_u8(header);
            buf.put_u8((plen & 0xFF) as u8);
        }
        buf.put_slice(&self.payload);

        if !self.label.is_empty() {
            // header byte was already written; patch the L bit in place.
            buf[0] |= 0x10;
            buf.put_u8(self.label.len() as u8);
            buf.put_slice(self.label.as_bytes());
        }

        Ok(buf.freeze())
    }

    /// Decode one frame from an async byte stream. Atomic: either the frame
    /// is fully parsed or an error is returned; no partial state escapes.
    pub async fn decode<R>(reader: &mut R) -> Result<Frame>
    where
        R: AsyncRead + Unpin,
    {
        let mut header_byte = [0u8; 1];
        reader.read_exact(&mut header_byte).await?;
        let header = header_byte[0];

        let act = Action::from_bits(header >> 6);
        let has_ext_len = header & 0x20 != 0;
        let has_label = header & 0x10 != 0;

        let payload = if has_ext_len {
            let mut lo = [0u8; 1];
            reader.read_exact(&mut lo).await?;
            let len = (((header & 0x0F) as usize) << 8) | (lo[0] as usize);
            let mut data = vec![0u8; len];
            reader.read_exact(&mut data).await?;
            Bytes::from(data)
        } else {
            let len = (header & 0x1F) as usize;
            if len == 0 {
                Bytes::new()
            } else {
                let mut data = vec![0u8; len];
                reader.read_exact(&mut data).await?;
                Bytes::from(data)
            }
        };

        let label = if has_label {
            let mut len_byte = [0u8; 1];
            reader.read_exact(&mut len_byte).await?;
            let mut data = vec![0u8; len_byte[0] as usize];
            reader.read_exact(&mut data).await?;
            String::from_utf8(data)
                .map_err(|_| BrokerError::protocol("label is not valid utf-8"))?
        } else {
            String::new()
        };

        Ok(Frame {
            act,
            label,
            payload,
        })
    }

    /// Encode and write this frame, bounded by the caller-supplied write
    /// path (the connection applies its own write timeout around this).
    pub async fn write<W>(&self, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let encoded = self.encode()?;
        writer.write_all(&encoded).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn roundtrip(frame: &Frame) -> Frame {
        let encoded = frame.encode().unwrap();
        let mut cursor = std::io::Cursor::new(encoded.to_vec());
        Frame::decode(&mut cursor).await.unwrap()
    }

    #[tokio::test]
    async fn roundtrips_empty_response() {
        let f = Frame::response(Bytes::new());
        let out = roundtrip(&f).await;
        assert!(matches!(out.act, Action::Response));
        assert_eq!(out.label, "");
        assert_eq!(out.payload, Bytes::new());
    }

    #[tokio::test]
    async fn roundtrips_inline_small_payload() {
        let f = Frame::multicast("room", Bytes::from_static(b"hi"));
        let out = roundtrip(&f).await;
        assert_eq!(out.label, "room");
        assert_eq!(out.payload, Bytes::from_static(b"hi"));
    }

    #[tokio::test]
    async fn roundtrips_extended_length_payload() {
        let data = vec![7u8; 4095];
        let f = Frame::multicast("room", Bytes::from(data.clone()));
        let out = roundtrip(&f).await;
        assert_eq!(out.payload.to_vec(), data);
    }

    #[tokio::test]
    async fn roundtrips_max_label() {
        let label = "x".repeat(255);
        let f = Frame::new(Action::Label, label.clone(), Bytes::from_static(b"+"));
        let out = roundtrip(&f).await;
        assert_eq!(out.label, label);
    }

    #[test]
    fn encode_fails_oversized_payload() {
        let data = vec![0u8; MAX_PAYLOAD_LEN + 1];
        let f = Frame::multicast("room", Bytes::from(data));
        assert!(f.encode().is_err());
    }

    #[test]
    fn encode_fails_oversized_label() {
        let label = "x".repeat(MAX_LABEL_LEN + 1);
        let f = Frame::new(Action::Label, label, Bytes::from_static(b"+"));
        assert!(f.encode().is_err());
    }

    #[tokio::test]
    async fn decode_fails_on_short_read() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        assert!(Frame::decode(&mut cursor).await.is_err());
    }

    #[test]
    fn action_bits_roundtrip() {
        for (bits, expect) in [
            (0u8, Action::Response),
            (1, Action::Handshake),
            (2, Action::Label),
            (3, Action::Multicast),
        ] {
            assert_eq!(Action::from_bits(bits) as u8, expect as u8);
        }
    }
}
