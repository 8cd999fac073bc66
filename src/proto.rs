//! Wire formats shared by the emitter and the Coordinator.
//!
//! Two messages exist.  Registration travels over TCP as ASCII
//! `node_id "|" anchor_hex`, answered by the literal bytes `ACK` or
//! `NACK`.  Heartbeats travel over UDP as
//!
//! ```text
//! node_id "|" ts "|" i  "||"  w(32 bytes)  "||"  tag(32 bytes)
//! ```
//!
//! with no length prefix or trailer; the datagram boundary delimits.  The
//! trailing `w` and `tag` segments are raw octets and may themselves
//! contain `||`, so decoding walks backwards from the tail over the two
//! fixed-width segments instead of splitting on the separator.

use crate::chain::{compute_tag, ChainDigest, DIGEST_WIDTH};

/// Separator between the payload, pre-image, and tag segments.
pub const SEGMENT_SEP: &[u8] = b"||";

/// Separator between the ASCII payload fields.
pub const FIELD_SEP: char = '|';

/// Registration reply sent on success.
pub const ACK: &[u8] = b"ACK";

/// Registration reply sent on any reject.
pub const NACK: &[u8] = b"NACK";

const MIN_FRAME_LEN: usize = 1 + 2 * (SEGMENT_SEP.len() + DIGEST_WIDTH);

/// Errors produced while decoding wire messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// The datagram is too short to hold payload, pre-image, and tag.
    TooShort(usize),
    /// A fixed-position segment separator was missing.
    MissingSeparator,
    /// The ASCII portion of a message was not valid text.
    NotText,
    /// The payload did not split into exactly `node_id|ts|i`.
    BadFieldCount(usize),
    /// The node identifier was empty.
    EmptyNodeId,
    /// A numeric field failed to parse.
    BadNumber(String),
    /// The registration anchor was not valid digest-width hex.
    BadAnchorHex(String),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TooShort(len) => write!(f, "frame too short: {len} bytes"),
            Self::MissingSeparator => write!(f, "segment separator missing"),
            Self::NotText => write!(f, "text portion not valid UTF-8"),
            Self::BadFieldCount(n) => write!(f, "payload has {n} fields, expected 3"),
            Self::EmptyNodeId => write!(f, "empty node id"),
            Self::BadNumber(field) => write!(f, "unparsable numeric field: {field}"),
            Self::BadAnchorHex(msg) => write!(f, "bad anchor hex: {msg}"),
        }
    }
}

impl std::error::Error for FrameError {}

/// A decoded heartbeat datagram.
///
/// `payload` keeps the exact bytes the tag was computed over, so the
/// verifier recomputes `H(payload || w)` from what was received rather
/// than from a re-rendering of the parsed fields.
#[derive(Debug, Clone)]
pub struct HeartbeatFrame {
    /// Sender's node identifier.
    pub node_id: String,
    /// Advisory sender timestamp, fractional epoch seconds.
    pub ts: f64,
    /// Beat index `i`.
    pub index: u64,
    /// Revealed pre-image `w_i`.
    pub w: ChainDigest,
    /// Authenticator `H(payload || w)` as received.
    pub tag: ChainDigest,
    /// Raw payload bytes as received.
    pub payload: Vec<u8>,
}

impl HeartbeatFrame {
    /// Builds the wire bytes for beat `index` of `node_id` at time `ts`.
    pub fn encode(node_id: &str, ts: f64, index: u64, w: &ChainDigest) -> Vec<u8> {
        let payload = format!("{node_id}{FIELD_SEP}{ts}{FIELD_SEP}{index}").into_bytes();
        let tag = compute_tag(&payload, w);
        let mut out = Vec::with_capacity(payload.len() + 2 * (SEGMENT_SEP.len() + DIGEST_WIDTH));
        out.extend_from_slice(&payload);
        out.extend_from_slice(SEGMENT_SEP);
        out.extend_from_slice(w);
        out.extend_from_slice(SEGMENT_SEP);
        out.extend_from_slice(&tag);
        out
    }

    /// Decodes a datagram into its payload fields, pre-image, and tag.
    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        if buf.len() < MIN_FRAME_LEN {
            return Err(FrameError::TooShort(buf.len()));
        }
        let tag_start = buf.len() - DIGEST_WIDTH;
        let sep2_start = tag_start - SEGMENT_SEP.len();
        let w_start = sep2_start - DIGEST_WIDTH;
        let sep1_start = w_start - SEGMENT_SEP.len();
        if &buf[sep2_start..tag_start] != SEGMENT_SEP || &buf[sep1_start..w_start] != SEGMENT_SEP {
            return Err(FrameError::MissingSeparator);
        }
        let mut tag = [0u8; DIGEST_WIDTH];
        tag.copy_from_slice(&buf[tag_start..]);
        let mut w = [0u8; DIGEST_WIDTH];
        w.copy_from_slice(&buf[w_start..sep2_start]);
        let payload = buf[..sep1_start].to_vec();

        let text = std::str::from_utf8(&payload).map_err(|_| FrameError::NotText)?;
        let fields: Vec<&str> = text.split(FIELD_SEP).collect();
        if fields.len() != 3 {
            return Err(FrameError::BadFieldCount(fields.len()));
        }
        let node_id = fields[0];
        if node_id.is_empty() {
            return Err(FrameError::EmptyNodeId);
        }
        let ts: f64 = fields[1]
            .parse()
            .map_err(|_| FrameError::BadNumber(format!("ts `{}`", fields[1])))?;
        let index: u64 = fields[2]
            .parse()
            .map_err(|_| FrameError::BadNumber(format!("i `{}`", fields[2])))?;
        Ok(Self {
            node_id: node_id.to_string(),
            ts,
            index,
            w,
            tag,
            payload,
        })
    }
}

/// Builds the TCP registration request `node_id|anchor_hex`.
pub fn encode_registration(node_id: &str, anchor: &ChainDigest) -> Vec<u8> {
    format!("{node_id}{FIELD_SEP}{}", hex::encode(anchor)).into_bytes()
}

/// Parses a TCP registration request.
///
/// Rejects a missing separator, an empty node id, odd or non-hex anchor
/// text, and anchors that decode to anything but the digest width.
pub fn parse_registration(buf: &[u8]) -> Result<(String, ChainDigest), FrameError> {
    let text = std::str::from_utf8(buf).map_err(|_| FrameError::NotText)?;
    let text = text.trim_end_matches(['\r', '\n']);
    let (node_id, anchor_hex) = text
        .split_once(FIELD_SEP)
        .ok_or(FrameError::MissingSeparator)?;
    if node_id.is_empty() {
        return Err(FrameError::EmptyNodeId);
    }
    let decoded =
        hex::decode(anchor_hex).map_err(|err| FrameError::BadAnchorHex(err.to_string()))?;
    if decoded.len() != DIGEST_WIDTH {
        return Err(FrameError::BadAnchorHex(format!(
            "anchor decodes to {} bytes, expected {DIGEST_WIDTH}",
            decoded.len()
        )));
    }
    let mut anchor = [0u8; DIGEST_WIDTH];
    anchor.copy_from_slice(&decoded);
    Ok((node_id.to_string(), anchor))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::HashChain;

    #[test]
    fn frame_round_trips() {
        let w = [0xabu8; DIGEST_WIDTH];
        let bytes = HeartbeatFrame::encode("SN010003", 1754020269.1915843, 7, &w);
        let frame = HeartbeatFrame::decode(&bytes).unwrap();
        assert_eq!(frame.node_id, "SN010003");
        assert_eq!(frame.index, 7);
        assert_eq!(frame.w, w);
        assert_eq!(frame.tag, compute_tag(&frame.payload, &w));
    }

    #[test]
    fn binary_preimage_containing_separator_still_decodes() {
        let mut w = [0u8; DIGEST_WIDTH];
        w[10] = b'|';
        w[11] = b'|';
        w[12] = b'|';
        let bytes = HeartbeatFrame::encode("SN000001", 5.0, 2, &w);
        let frame = HeartbeatFrame::decode(&bytes).unwrap();
        assert_eq!(frame.w, w);
        assert_eq!(frame.index, 2);
    }

    #[test]
    fn malformed_frames_are_rejected() {
        assert!(matches!(
            HeartbeatFrame::decode(b"short"),
            Err(FrameError::TooShort(_))
        ));

        let w = [1u8; DIGEST_WIDTH];
        let mut bytes = HeartbeatFrame::encode("SN000001", 5.0, 2, &w);
        let sep1 = bytes.len() - 2 * DIGEST_WIDTH - 2 * SEGMENT_SEP.len();
        bytes[sep1] = b'/';
        assert!(matches!(
            HeartbeatFrame::decode(&bytes),
            Err(FrameError::MissingSeparator)
        ));

        let bytes = HeartbeatFrame::encode("SN000001|extra", 5.0, 2, &w);
        assert!(matches!(
            HeartbeatFrame::decode(&bytes),
            Err(FrameError::BadFieldCount(4))
        ));

        let bytes = HeartbeatFrame::encode("", 5.0, 2, &w);
        assert!(matches!(
            HeartbeatFrame::decode(&bytes),
            Err(FrameError::EmptyNodeId)
        ));
    }

    #[test]
    fn non_numeric_index_is_rejected() {
        let w = [1u8; DIGEST_WIDTH];
        let payload = b"SN000001|5.0|xyz".to_vec();
        let tag = compute_tag(&payload, &w);
        let mut bytes = payload;
        bytes.extend_from_slice(SEGMENT_SEP);
        bytes.extend_from_slice(&w);
        bytes.extend_from_slice(SEGMENT_SEP);
        bytes.extend_from_slice(&tag);
        assert!(matches!(
            HeartbeatFrame::decode(&bytes),
            Err(FrameError::BadNumber(_))
        ));
    }

    #[test]
    fn registration_round_trips() {
        let chain = HashChain::generate(4).unwrap();
        let bytes = encode_registration("SN010003", chain.anchor());
        let (node_id, anchor) = parse_registration(&bytes).unwrap();
        assert_eq!(node_id, "SN010003");
        assert_eq!(&anchor, chain.anchor());
    }

    #[test]
    fn registration_rejects() {
        assert!(matches!(
            parse_registration(b"no-separator"),
            Err(FrameError::MissingSeparator)
        ));
        assert!(matches!(
            parse_registration(b"|deadbeef"),
            Err(FrameError::EmptyNodeId)
        ));
        assert!(matches!(
            parse_registration(b"SN1|abc"),
            Err(FrameError::BadAnchorHex(_))
        ));
        assert!(matches!(
            parse_registration(b"SN1|zzzz"),
            Err(FrameError::BadAnchorHex(_))
        ));
        // Even-length valid hex of the wrong width.
        assert!(matches!(
            parse_registration(b"SN1|deadbeef"),
            Err(FrameError::BadAnchorHex(_))
        ));
    }
}
