//! Wire frame codecs.
//!
//! Two formats, one per transport class. The short-range peer mesh moves
//! kilobyte JSON envelopes with full-width identifiers. The long-range
//! radio layer gets a compact fixed-order frame: truncated identifier
//! prefixes, a single-character classification code, and a base64 payload,
//! all inside a budget of a couple hundred bytes.
//!
//! A frame that fails to decode is dropped by the relay; codec errors are
//! never fatal.

use base64::Engine;
use emberlink_core::{
    Classification, CoreError, CoreResult, DeliveryState, GeoPosition, Message, MessageId,
    TransportClass, BROADCAST, WIRE_PREFIX_LEN,
};
use serde::{Deserialize, Serialize};

/// Leading tag of a compact long-range frame.
const COMPACT_TAG: &str = "EL1";

/// Single-character broadcast marker on the compact wire.
const COMPACT_BROADCAST: &str = "*";

/// Field separator of the compact frame.
const SEP: char = '|';

#[derive(Debug, Serialize, Deserialize)]
struct JsonFrame {
    v: u8,
    id: String,
    class: char,
    sender: String,
    recipient: String,
    payload: String,
    created_at_ms: u64,
    ttl_ms: u64,
    hop_limit: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    lat: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    lon: Option<f64>,
}

/// Encode `message` for the given transport class.
///
/// Returns [`CoreError::PayloadTooLarge`] when the finished frame exceeds
/// `max_frame` bytes; nothing is ever silently truncated.
pub fn encode(message: &Message, class: TransportClass, max_frame: usize) -> CoreResult<Vec<u8>> {
    let bytes = match class {
        TransportClass::ShortRange => encode_json(message)?,
        TransportClass::LongRange => encode_compact(message),
    };

    if bytes.len() > max_frame {
        return Err(CoreError::PayloadTooLarge {
            size: bytes.len(),
            max: max_frame,
        });
    }

    Ok(bytes)
}

/// Decode an inbound frame for the given transport class.
pub fn decode(bytes: &[u8], class: TransportClass) -> CoreResult<Message> {
    match class {
        TransportClass::ShortRange => decode_json(bytes),
        TransportClass::LongRange => decode_compact(bytes),
    }
}

fn encode_json(message: &Message) -> CoreResult<Vec<u8>> {
    let frame = JsonFrame {
        v: 1,
        id: message.id.to_hex(),
        class: message.classification.wire_code(),
        sender: message.sender.clone(),
        recipient: message.recipient.clone(),
        payload: base64::engine::general_purpose::STANDARD.encode(&message.payload),
        created_at_ms: message.created_at_ms,
        ttl_ms: message.ttl_ms,
        hop_limit: message.hop_limit,
        lat: message.position.map(|p| p.lat),
        lon: message.position.map(|p| p.lon),
    };
    Ok(serde_json::to_vec(&frame)?)
}

fn decode_json(bytes: &[u8]) -> CoreResult<Message> {
    let frame: JsonFrame = serde_json::from_slice(bytes)?;
    if frame.v != 1 {
        return Err(CoreError::DecodeFailure(format!(
            "unsupported frame version {}",
            frame.v
        )));
    }

    let id: MessageId = frame.id.parse()?;
    let classification = Classification::from_wire_code(frame.class)
        .ok_or_else(|| CoreError::DecodeFailure(format!("unknown class code {}", frame.class)))?;
    let payload = base64::engine::general_purpose::STANDARD
        .decode(frame.payload.as_bytes())
        .map_err(|e| CoreError::DecodeFailure(format!("bad payload encoding: {e}")))?;

    let position = match (frame.lat, frame.lon) {
        (Some(lat), Some(lon)) => Some(GeoPosition { lat, lon }),
        _ => None,
    };

    Ok(Message {
        id,
        classification,
        sender: frame.sender,
        recipient: frame.recipient,
        payload,
        created_at_ms: frame.created_at_ms,
        ttl_ms: frame.ttl_ms,
        hop_limit: frame.hop_limit,
        state: DeliveryState::Received,
        attempt_count: 0,
        last_attempt_at_ms: None,
        position,
    })
}

fn encode_compact(message: &Message) -> Vec<u8> {
    let recipient = if message.is_broadcast() {
        COMPACT_BROADCAST.to_string()
    } else {
        truncate_ident(&message.recipient)
    };

    let mut frame = format!(
        "{COMPACT_TAG}{SEP}{}{SEP}{}{SEP}{}{SEP}{}{SEP}{}{SEP}{}{SEP}{}{SEP}{}",
        message.id.prefix(),
        truncate_ident(&message.sender),
        recipient,
        message.classification.wire_code(),
        message.hop_limit,
        message.created_at_ms / 1_000,
        message.ttl_ms / 1_000,
        base64::engine::general_purpose::STANDARD.encode(&message.payload),
    );

    if let Some(pos) = message.position {
        frame.push(SEP);
        frame.push_str(&format!("{}{SEP}{}", pos.lat, pos.lon));
    }

    frame.into_bytes()
}

fn decode_compact(bytes: &[u8]) -> CoreResult<Message> {
    let text = std::str::from_utf8(bytes)
        .map_err(|_| CoreError::DecodeFailure("compact frame is not utf-8".to_string()))?;
    let parts: Vec<&str> = text.split(SEP).collect();

    if parts.len() != 9 && parts.len() != 11 {
        return Err(CoreError::DecodeFailure(format!(
            "compact frame has {} fields",
            parts.len()
        )));
    }
    if parts[0] != COMPACT_TAG {
        return Err(CoreError::DecodeFailure(format!("unknown frame tag {}", parts[0])));
    }

    let id = expand_id_prefix(parts[1])?;
    let recipient = if parts[3] == COMPACT_BROADCAST {
        BROADCAST.to_string()
    } else {
        parts[3].to_string()
    };
    let classification = parts[4]
        .chars()
        .next()
        .filter(|_| parts[4].len() == 1)
        .and_then(Classification::from_wire_code)
        .ok_or_else(|| CoreError::DecodeFailure(format!("unknown class code {}", parts[4])))?;
    let hop_limit: u8 = parts[5]
        .parse()
        .map_err(|_| CoreError::DecodeFailure(format!("bad hop limit {}", parts[5])))?;
    let created_s: u64 = parts[6]
        .parse()
        .map_err(|_| CoreError::DecodeFailure(format!("bad timestamp {}", parts[6])))?;
    let ttl_s: u64 = parts[7]
        .parse()
        .map_err(|_| CoreError::DecodeFailure(format!("bad ttl {}", parts[7])))?;
    let payload = base64::engine::general_purpose::STANDARD
        .decode(parts[8].as_bytes())
        .map_err(|e| CoreError::DecodeFailure(format!("bad payload encoding: {e}")))?;

    let position = if parts.len() == 11 {
        let lat: f64 = parts[9]
            .parse()
            .map_err(|_| CoreError::DecodeFailure(format!("bad latitude {}", parts[9])))?;
        let lon: f64 = parts[10]
            .parse()
            .map_err(|_| CoreError::DecodeFailure(format!("bad longitude {}", parts[10])))?;
        Some(GeoPosition { lat, lon })
    } else {
        None
    };

    Ok(Message {
        id,
        classification,
        sender: parts[2].to_string(),
        recipient,
        payload,
        created_at_ms: created_s * 1_000,
        ttl_ms: ttl_s * 1_000,
        hop_limit,
        state: DeliveryState::Received,
        attempt_count: 0,
        last_attempt_at_ms: None,
        position,
    })
}

/// Truncate an opaque identifier to the fixed wire prefix width.
pub fn truncate_ident(ident: &str) -> String {
    ident.chars().take(WIRE_PREFIX_LEN).collect()
}

/// Reconstitute a full-width message id from a truncated wire prefix.
///
/// The remaining bits are zero-filled; every hop sees the same expansion, so
/// the padded id stays a stable dedup key within the long-range layer.
fn expand_id_prefix(prefix: &str) -> CoreResult<MessageId> {
    if prefix.len() != WIRE_PREFIX_LEN {
        return Err(CoreError::DecodeFailure(format!("bad id prefix {prefix}")));
    }
    let mut padded = prefix.to_string();
    padded.push_str(&"0".repeat(32 - WIRE_PREFIX_LEN));
    padded.parse()
}
