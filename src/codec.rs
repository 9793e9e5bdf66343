use crate::error::Error;
use flate2::{Decompress, FlushDecompress};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::Read;
use tracing::trace;

/// Gateway opcodes as they appear on the wire.
pub mod opcode {
    pub const DISPATCH: u8 = 0;
    pub const HEARTBEAT: u8 = 1;
    pub const IDENTIFY: u8 = 2;
    pub const RESUME: u8 = 6;
    pub const RECONNECT: u8 = 7;
    pub const INVALID_SESSION: u8 = 9;
    pub const HELLO: u8 = 10;
    pub const HEARTBEAT_ACK: u8 = 11;
}

/// Opcodes a shard may send before it has reached Ready.
pub const ALLOWED_BEFORE_READY: [u8; 4] = [
    opcode::HEARTBEAT,
    opcode::HEARTBEAT_ACK,
    opcode::IDENTIFY,
    opcode::RESUME,
];

/// Close codes the client itself uses when tearing a connection down.
pub mod close_code {
    /// Normal closure; the gateway will invalidate the session.
    pub const NORMAL: u16 = 1000;
    /// Closure that asks the gateway to keep the session resumable.
    pub const RESUMING: u16 = 4200;
}

/// What a close code tells us about how to recover.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseBehavior {
    /// Reconnect and resume the existing session
    Resume,
    /// Drop the session and identify from scratch
    Reidentify,
    /// Do not reconnect; surface the code to the host
    Fatal,
}

/// Classify a gateway close code into a recovery behavior.
pub fn classify_close(code: u16) -> CloseBehavior {
    match code {
        // Server-side transient conditions; the session survives.
        4000 | 4001 | 4002 | 4009 => CloseBehavior::Resume,
        // The session state is out of sync; start over with a fresh identify.
        1000 | 4003 | 4005 | 4007 | 4008 => CloseBehavior::Reidentify,
        // Credential/config problems that a retry cannot fix.
        4004 | 4010 | 4011 | 4012 | 4013 | 4014 => CloseBehavior::Fatal,
        // Unknown codes get the least destructive treatment.
        _ => CloseBehavior::Resume,
    }
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Hello { heartbeat_interval_ms: u64 },
    /// The gateway is requesting an immediate heartbeat
    HeartbeatRequest,
    HeartbeatAck,
    /// The gateway wants us to disconnect and resume
    Reconnect,
    InvalidSession { resumable: bool },
    Dispatch {
        event: String,
        sequence: Option<u64>,
        data: Value,
    },
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    op: u8,
    #[serde(default)]
    d: Value,
    #[serde(default)]
    s: Option<u64>,
    #[serde(default)]
    t: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawHello {
    heartbeat_interval: u64,
}

/// Decode one complete JSON document into a typed frame.
pub fn decode_frame(bytes: &[u8]) -> Result<InboundFrame, Error> {
    let raw: RawFrame = serde_json::from_slice(bytes)
        .map_err(|e| Error::Protocol(format!("undecodable frame: {e}")))?;

    match raw.op {
        opcode::DISPATCH => {
            let event = raw
                .t
                .ok_or_else(|| Error::Protocol("dispatch frame without event type".into()))?;
            Ok(InboundFrame::Dispatch {
                event,
                sequence: raw.s,
                data: raw.d,
            })
        }
        opcode::HEARTBEAT => Ok(InboundFrame::HeartbeatRequest),
        opcode::RECONNECT => Ok(InboundFrame::Reconnect),
        opcode::INVALID_SESSION => Ok(InboundFrame::InvalidSession {
            resumable: raw.d.as_bool().unwrap_or(false),
        }),
        opcode::HELLO => {
            let hello: RawHello = serde_json::from_value(raw.d)
                .map_err(|e| Error::Protocol(format!("malformed hello: {e}")))?;
            Ok(InboundFrame::Hello {
                heartbeat_interval_ms: hello.heartbeat_interval,
            })
        }
        opcode::HEARTBEAT_ACK => Ok(InboundFrame::HeartbeatAck),
        other => Err(Error::Protocol(format!("unknown opcode {other}"))),
    }
}

/// An outbound control payload: opcode plus opaque data.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutboundPayload {
    pub op: u8,
    pub d: Value,
}

/// Client properties reported during identify.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdentifyProperties {
    pub os: String,
    pub browser: String,
    pub device: String,
}

impl Default for IdentifyProperties {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            browser: "gateway-shard-manager".to_string(),
            device: "gateway-shard-manager".to_string(),
        }
    }
}

impl OutboundPayload {
    pub fn heartbeat(sequence: Option<u64>) -> Self {
        Self {
            op: opcode::HEARTBEAT,
            d: sequence.map_or(Value::Null, Into::into),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn identify(
        token: &str,
        intents: u64,
        shard_id: u16,
        shard_count: u16,
        properties: &IdentifyProperties,
        compress: bool,
        large_threshold: Option<u16>,
    ) -> Self {
        let mut d = serde_json::json!({
            "token": token,
            "intents": intents,
            "shard": [shard_id, shard_count],
            "properties": properties,
            "compress": compress,
        });
        if let Some(threshold) = large_threshold {
            d["large_threshold"] = threshold.into();
        }
        Self {
            op: opcode::IDENTIFY,
            d,
        }
    }

    pub fn resume(token: &str, session_id: &str, sequence: u64) -> Self {
        Self {
            op: opcode::RESUME,
            d: serde_json::json!({
                "token": token,
                "session_id": session_id,
                "seq": sequence,
            }),
        }
    }

    /// Serialize for the wire.
    pub fn encode(&self) -> String {
        // op and d always serialize; a Value cannot fail here
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Transport compression negotiated for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Compression {
    /// Plain JSON text frames
    #[default]
    None,
    /// Whole-message zlib, negotiated via the identify payload
    Payload,
    /// Connection-wide zlib stream with sync-flush framing
    Stream,
}

/// zlib-stream suffix marking the end of one compressed document.
const SYNC_FLUSH_SUFFIX: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// Inflates inbound frames according to the negotiated compression.
///
/// Stream mode keeps one inflate context for the whole connection: chunks
/// are buffered until the sync-flush suffix arrives, then inflated as a
/// continuation of everything seen so far.
pub enum Decompressor {
    Plain,
    Payload,
    Stream {
        inflater: Decompress,
        buffer: Vec<u8>,
    },
}

impl Decompressor {
    pub fn new(compression: Compression) -> Self {
        match compression {
            Compression::None => Self::Plain,
            Compression::Payload => Self::Payload,
            Compression::Stream => Self::Stream {
                inflater: Decompress::new(true),
                buffer: Vec::new(),
            },
        }
    }

    /// Feed one text frame. Text is never compressed.
    pub fn feed_text(&mut self, text: &str) -> Result<Option<InboundFrame>, Error> {
        decode_frame(text.as_bytes()).map(Some)
    }

    /// Feed one binary frame. Returns `None` when a stream chunk is not yet
    /// a complete document.
    pub fn feed_binary(&mut self, bytes: &[u8]) -> Result<Option<InboundFrame>, Error> {
        match self {
            Self::Plain => Err(Error::Protocol(
                "binary frame on an uncompressed connection".into(),
            )),
            Self::Payload => {
                let mut decoded = Vec::new();
                flate2::read::ZlibDecoder::new(bytes)
                    .read_to_end(&mut decoded)
                    .map_err(|e| Error::Protocol(format!("payload inflate failed: {e}")))?;
                decode_frame(&decoded).map(Some)
            }
            Self::Stream { inflater, buffer } => {
                buffer.extend_from_slice(bytes);
                if !buffer.ends_with(&SYNC_FLUSH_SUFFIX) {
                    trace!(buffered = buffer.len(), "partial zlib-stream chunk");
                    return Ok(None);
                }

                let mut decoded = Vec::with_capacity(buffer.len() * 4);
                let mut out = [0u8; 16 * 1024];
                let mut consumed = 0usize;
                loop {
                    let before_in = inflater.total_in();
                    let before_out = inflater.total_out();
                    let status = inflater
                        .decompress(&buffer[consumed..], &mut out, FlushDecompress::Sync)
                        .map_err(|e| Error::Protocol(format!("stream inflate failed: {e}")))?;
                    consumed += (inflater.total_in() - before_in) as usize;
                    let produced = (inflater.total_out() - before_out) as usize;
                    decoded.extend_from_slice(&out[..produced]);

                    match status {
                        flate2::Status::StreamEnd | flate2::Status::BufError => break,
                        // keep going while input remains or the output
                        // buffer filled mid-document
                        flate2::Status::Ok => {
                            if consumed >= buffer.len() && produced < out.len() {
                                break;
                            }
                        }
                    }
                }
                buffer.clear();
                decode_frame(&decoded).map(Some)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::ZlibEncoder;
    use std::io::Write;

    #[test]
    fn test_decode_hello() {
        let frame = decode_frame(br#"{"op":10,"d":{"heartbeat_interval":41250}}"#).unwrap();
        assert_eq!(
            frame,
            InboundFrame::Hello {
                heartbeat_interval_ms: 41250
            }
        );
    }

    #[test]
    fn test_decode_dispatch() {
        let frame =
            decode_frame(br#"{"op":0,"t":"MESSAGE_CREATE","s":42,"d":{"id":"123"}}"#).unwrap();
        match frame {
            InboundFrame::Dispatch {
                event,
                sequence,
                data,
            } => {
                assert_eq!(event, "MESSAGE_CREATE");
                assert_eq!(sequence, Some(42));
                assert_eq!(data["id"], "123");
            }
            other => panic!("expected dispatch, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_invalid_session() {
        let frame = decode_frame(br#"{"op":9,"d":true}"#).unwrap();
        assert_eq!(frame, InboundFrame::InvalidSession { resumable: true });

        let frame = decode_frame(br#"{"op":9,"d":false}"#).unwrap();
        assert_eq!(frame, InboundFrame::InvalidSession { resumable: false });
    }

    #[test]
    fn test_decode_rejects_unknown_opcode() {
        assert!(decode_frame(br#"{"op":42,"d":null}"#).is_err());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_frame(b"not json").is_err());
        assert!(decode_frame(br#"{"op":0,"s":1,"d":{}}"#).is_err()); // dispatch without t
    }

    #[test]
    fn test_encode_heartbeat() {
        assert_eq!(
            OutboundPayload::heartbeat(Some(251)).encode(),
            r#"{"op":1,"d":251}"#
        );
        assert_eq!(
            OutboundPayload::heartbeat(None).encode(),
            r#"{"op":1,"d":null}"#
        );
    }

    #[test]
    fn test_encode_identify_shape() {
        let payload = OutboundPayload::identify(
            "token",
            513,
            2,
            8,
            &IdentifyProperties::default(),
            false,
            Some(250),
        );
        assert_eq!(payload.op, opcode::IDENTIFY);
        assert_eq!(payload.d["shard"], serde_json::json!([2, 8]));
        assert_eq!(payload.d["intents"], 513);
        assert_eq!(payload.d["large_threshold"], 250);
    }

    #[test]
    fn test_encode_resume_shape() {
        let payload = OutboundPayload::resume("token", "abc", 99);
        assert_eq!(payload.op, opcode::RESUME);
        assert_eq!(payload.d["session_id"], "abc");
        assert_eq!(payload.d["seq"], 99);
    }

    #[test]
    fn test_classify_close_codes() {
        assert_eq!(classify_close(4000), CloseBehavior::Resume);
        assert_eq!(classify_close(4009), CloseBehavior::Resume);
        assert_eq!(classify_close(1000), CloseBehavior::Reidentify);
        assert_eq!(classify_close(4007), CloseBehavior::Reidentify);
        assert_eq!(classify_close(4004), CloseBehavior::Fatal);
        assert_eq!(classify_close(4014), CloseBehavior::Fatal);
        // unknown codes stay resumable
        assert_eq!(classify_close(4999), CloseBehavior::Resume);
    }

    #[test]
    fn test_allow_list_contents() {
        assert!(ALLOWED_BEFORE_READY.contains(&opcode::HEARTBEAT));
        assert!(ALLOWED_BEFORE_READY.contains(&opcode::IDENTIFY));
        assert!(ALLOWED_BEFORE_READY.contains(&opcode::RESUME));
        assert!(!ALLOWED_BEFORE_READY.contains(&opcode::DISPATCH));
    }

    fn zlib_stream_chunks(doc: &[u8], split_at: usize) -> (Vec<u8>, Vec<u8>) {
        let mut encoder = ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(doc).unwrap();
        let compressed = encoder.finish().unwrap();
        let split = split_at.min(compressed.len());
        (compressed[..split].to_vec(), compressed[split..].to_vec())
    }

    #[test]
    fn test_payload_decompression() {
        let doc = br#"{"op":11,"d":null}"#;
        let mut encoder = ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(doc).unwrap();
        let compressed = encoder.finish().unwrap();

        let mut decompressor = Decompressor::new(Compression::Payload);
        let frame = decompressor.feed_binary(&compressed).unwrap();
        assert_eq!(frame, Some(InboundFrame::HeartbeatAck));
    }

    #[test]
    fn test_stream_decompression_reassembles_chunks() {
        let doc = br#"{"op":10,"d":{"heartbeat_interval":1000}}"#;
        let (first, mut second) = zlib_stream_chunks(doc, 7);
        // zlib finish() ends with the final deflate block rather than an
        // empty sync-flush; append the marker the gateway would send
        second.extend_from_slice(&[0x00, 0x00, 0xff, 0xff]);

        let mut decompressor = Decompressor::new(Compression::Stream);
        assert_eq!(decompressor.feed_binary(&first).unwrap(), None);
        let frame = decompressor.feed_binary(&second).unwrap();
        assert_eq!(
            frame,
            Some(InboundFrame::Hello {
                heartbeat_interval_ms: 1000
            })
        );
    }

    #[test]
    fn test_plain_mode_rejects_binary() {
        let mut decompressor = Decompressor::new(Compression::None);
        assert!(decompressor.feed_binary(&[0, 1, 2]).is_err());
    }
}
