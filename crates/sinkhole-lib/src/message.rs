//! In-place manipulation of raw DNS messages.
//!
//! The proxy never decodes a full message. These helpers look at the header and the first
//! question only and leave every other byte untouched.

use crate::{ByteBuf, HeaderFlags, ResponseCode, HEADER_LEN};

/// Reported when the question section can't be read.
#[derive(Debug, PartialEq, Eq, Clone, Copy, thiserror::Error)]
pub enum QnameError {
    #[error("message is too short to contain a question ({0} bytes)")]
    TooShort(usize),
    #[error("malformed packet: expected label of length {length} at byte {pos}")]
    LabelOutOfBounds { length: usize, pos: usize },
    #[error("question doesn't contain any labels")]
    Empty,
}

impl QnameError {
    /// Placeholder used instead of the domain in logs and lookups.
    pub fn placeholder(&self) -> &'static str {
        match self {
            QnameError::LabelOutOfBounds { .. } => "invalid",
            QnameError::TooShort(_) | QnameError::Empty => "unknown",
        }
    }
}

/// Reads the QNAME of the first question, starting right after the header.
pub fn extract_qname(query: &[u8]) -> Result<String, QnameError> {
    if query.len() <= HEADER_LEN {
        return Err(QnameError::TooShort(query.len()));
    }

    let mut buf = ByteBuf::new(&query);
    buf.seek(HEADER_LEN);
    buf.read_qname()
}

/// Same as [`extract_qname`], but degrades to `"unknown"`/`"invalid"` instead of failing.
pub fn extract_qname_lossy(query: &[u8]) -> String {
    extract_qname(query).unwrap_or_else(|e| e.placeholder().to_owned())
}

/// Flags of a synthesized answer for a blocked query: QR, RD, RA and NXDOMAIN.
pub fn blocked_response_flags() -> u16 {
    HeaderFlags {
        is_response: true,
        recursion_desired: true,
        recursion_available: true,
        response_code: ResponseCode::NameError,
    }
    .to_u16()
}

/// Turns a copy of the query into an NXDOMAIN response.
///
/// Only bytes 2 and 3 change, so the ID and question section are echoed back as-is.
/// Anything shorter than a header is returned unmodified.
pub fn nxdomain_response(query: &[u8]) -> Vec<u8> {
    let mut buf = ByteBuf::new_from_vec(query.to_vec());
    if buf.len() < HEADER_LEN {
        return buf.into_vec();
    }
    if buf.set_u16(2, blocked_response_flags()).is_err() {
        return query.to_vec();
    }
    buf.into_vec()
}

pub fn transaction_id(message: &[u8]) -> Option<u16> {
    ByteBuf::new(&message).peek_u16(0).ok()
}

/// Copies `cached` and stamps it with the transaction ID of `query`.
pub fn with_transaction_id(cached: &[u8], query: &[u8]) -> Vec<u8> {
    let mut buf = ByteBuf::new_from_vec(cached.to_vec());
    if let Some(id) = transaction_id(query) {
        // Fails only if the cached message is shorter than the ID itself
        let _ = buf.set_u16(0, id);
    }
    buf.into_vec()
}

/// The bytes a cache key is derived from: the whole query with its ID zeroed.
///
/// Returns `None` for anything shorter than a header.
pub fn cache_key_material(query: &[u8]) -> Option<Vec<u8>> {
    if query.len() < HEADER_LEN {
        return None;
    }
    let mut buf = ByteBuf::new_from_vec(query.to_vec());
    buf.set_u16(0, 0).ok()?;
    Some(buf.into_vec())
}
