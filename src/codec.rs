//! Stream framing for event records
//!
//! Each record travels as one frame:
//! - 4-byte big-endian length prefix
//! - JSON encoding of the record
//!
//! The same codec is used synchronously by the emitter (encode into a
//! buffer, write, flush) and asynchronously by the receiver through
//! `FramedRead`.

use crate::error::{RelayError, Result};
use crate::event::EventRecord;
use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};
use tracing::debug;

/// Largest frame accepted in either direction (10MB)
pub const MAX_FRAME_LENGTH: usize = 10 * 1024 * 1024;

/// Length-prefixed JSON codec for [`EventRecord`]s
#[derive(Debug)]
pub struct EventCodec {
    frames: LengthDelimitedCodec,
}

impl EventCodec {
    pub fn new() -> Self {
        Self {
            frames: LengthDelimitedCodec::builder()
                .max_frame_length(MAX_FRAME_LENGTH)
                .new_codec(),
        }
    }
}

impl Default for EventCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder<EventRecord> for EventCodec {
    type Error = RelayError;

    fn encode(&mut self, record: EventRecord, dst: &mut BytesMut) -> Result<()> {
        let payload = serde_json::to_vec(&record)?;
        self.frames.encode(Bytes::from(payload), dst)?;
        Ok(())
    }
}

impl Decoder for EventCodec {
    type Item = EventRecord;
    type Error = RelayError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<EventRecord>> {
        match self.frames.decode(src)? {
            Some(frame) => Ok(Some(serde_json::from_slice(&frame)?)),
            None => Ok(None),
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<EventRecord>> {
        if let Some(record) = self.decode(buf)? {
            return Ok(Some(record));
        }

        // Worker died mid-write; the stream simply ends here
        if !buf.is_empty() {
            debug!(
                "Discarding {} bytes of partial frame at end of stream",
                buf.len()
            );
            buf.clear();
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventName;
    use bytes::BufMut;
    use proptest::prelude::*;
    use serde_json::json;

    fn sample_records() -> Vec<EventRecord> {
        vec![
            EventRecord::new(EventName::Pid, vec![json!(4242)]),
            EventRecord::new(EventName::Port, vec![json!(50123)]),
            EventRecord::new(
                EventName::StartSuite,
                vec![json!("S1"), json!({"doc": "", "metadata": {"owner": "qa"}})],
            ),
            EventRecord::new(
            EventName::LogMessage,
            vec![json!({"message": "héllo", "level": "INFO"})],
        ),
            EventRecord::new(EventName::Close, vec![]),
        ]
    }

    #[test]
    fn test_frame_layout() {
        let mut codec = EventCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(EventRecord::new(EventName::Close, vec![]), &mut buf)
            .unwrap();

        let payload = br#"["close",[]]"#;
        assert_eq!(&buf[..4], &(payload.len() as u32).to_be_bytes());
        assert_eq!(&buf[4..], payload);
    }

    #[test]
    fn test_decode_waits_for_complete_frame() {
        let mut codec = EventCodec::new();
        let mut encoded = BytesMut::new();
        let record = EventRecord::new(EventName::StartTest, vec![json!("T1"), json!({})]);
        codec.encode(record.clone(), &mut encoded).unwrap();

        let mut partial = encoded.split_to(encoded.len() - 3);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.unsplit(encoded);
        assert_eq!(codec.decode(&mut partial).unwrap(), Some(record));
        assert!(partial.is_empty());
    }

    #[test]
    fn test_partial_frame_at_eof_ends_stream() {
        let mut codec = EventCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32(64);
        buf.put_slice(b"[\"end_te");

        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_oversized_frame_is_rejected() {
        let mut codec = EventCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_LENGTH + 1) as u32);

        assert!(matches!(codec.decode(&mut buf), Err(RelayError::Io(_))));
    }

    #[test]
    fn test_garbage_payload_is_a_serialization_error() {
        let mut codec = EventCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32(5);
        buf.put_slice(b"hello");

        assert!(matches!(
            codec.decode(&mut buf),
            Err(RelayError::Serialization(_))
        ));
    }

    proptest! {
        #[test]
        fn prop_records_survive_arbitrary_chunking(chunk in 1usize..64) {
            let records = sample_records();
            let mut codec = EventCodec::new();
            let mut wire = BytesMut::new();
            for record in records.clone() {
                codec.encode(record, &mut wire).unwrap();
            }

            let mut decoded = Vec::new();
            let mut buf = BytesMut::new();
            for piece in wire.chunks(chunk) {
                buf.extend_from_slice(piece);
                while let Some(record) = codec.decode(&mut buf).unwrap() {
                    decoded.push(record);
                }
            }

            prop_assert!(buf.is_empty());
            prop_assert_eq!(decoded, records);
        }
    }
}
