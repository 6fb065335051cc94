//! Binary envelope: `[version][kind][len u32 LE][bincode body][4-byte checksum]`.
//! Checksum is the first 4 bytes of SHA-256 over the body.

use sha2::{Digest, Sha256};

use crate::decoder::{DecodeError, DecodeErrorKind, Decoded};
use crate::protocol::{MeshPacket, PacketKind, PROTOCOL_VERSION};

const HEADER_SIZE: usize = 1 + 1 + 4;
const CHECKSUM_SIZE: usize = 4;
const MAX_BODY_LEN: u32 = 1024 * 1024; // 1 MiB

/// Encode a packet into a single envelope.
pub fn encode_envelope(packet: &MeshPacket) -> Result<Vec<u8>, EnvelopeEncodeError> {
    let body = bincode::serialize(packet).map_err(EnvelopeEncodeError::Encode)?;
    let len = body.len() as u32;
    if len > MAX_BODY_LEN {
        return Err(EnvelopeEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(HEADER_SIZE + body.len() + CHECKSUM_SIZE);
    out.push(PROTOCOL_VERSION);
    out.push(packet.kind().as_u8());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&body);
    out.extend_from_slice(&checksum(&body));
    Ok(out)
}

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("envelope too large")]
    TooLarge,
}

/// Decode exactly one envelope. Unlike a stream codec there is no "need more":
/// the bus delivers whole payloads, so a short buffer is a truncated frame.
pub fn decode_envelope(bytes: &[u8]) -> Result<Decoded, DecodeError> {
    let fail = |kind| Err(DecodeError::new(kind, bytes));
    if bytes.len() < HEADER_SIZE {
        return fail(DecodeErrorKind::Truncated);
    }
    if bytes[0] != PROTOCOL_VERSION {
        return fail(DecodeErrorKind::UnsupportedVersion(bytes[0]));
    }
    let Some(kind) = PacketKind::from_u8(bytes[1]) else {
        return Ok(Decoded::Ignored {
            reason: format!("unknown envelope kind {}", bytes[1]),
        });
    };
    let len = u32::from_le_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);
    if len > MAX_BODY_LEN {
        return fail(DecodeErrorKind::TooLarge);
    }
    let body_end = HEADER_SIZE + len as usize;
    let frame_end = body_end + CHECKSUM_SIZE;
    if bytes.len() < frame_end {
        return fail(DecodeErrorKind::Truncated);
    }
    if bytes.len() > frame_end {
        return fail(DecodeErrorKind::TrailingBytes(bytes.len() - frame_end));
    }
    let body = &bytes[HEADER_SIZE..body_end];
    if checksum(body) != bytes[body_end..frame_end] {
        return fail(DecodeErrorKind::ChecksumMismatch);
    }
    let packet: MeshPacket = match bincode::deserialize(body) {
        Ok(p) => p,
        Err(e) => return fail(DecodeErrorKind::Body(e.to_string())),
    };
    if packet.kind() != kind {
        return fail(DecodeErrorKind::KindMismatch {
            header: kind,
            body: packet.kind(),
        });
    }
    if let Some(field) = packet.non_finite_field() {
        return fail(DecodeErrorKind::InvalidField {
            field,
            reason: "not a finite number".into(),
        });
    }
    Ok(Decoded::Packet(packet))
}

fn checksum(body: &[u8]) -> [u8; CHECKSUM_SIZE] {
    let digest = Sha256::digest(body);
    let mut out = [0u8; CHECKSUM_SIZE];
    out.copy_from_slice(&digest[..CHECKSUM_SIZE]);
    out
}
