//! Peer discovery payload and transport.
//!
//! Every node advertises a [`PeerAnnouncement`] as a text attribute of its
//! service record: the literal `raft=` followed by the JSON document, escaped
//! so that it survives any text-record format. Records without the prefix
//! belong to some other application on the same transport and are skipped.
//!
//! The transport itself lives in [`multicast`]; it only ever hands complete
//! [`PeerAnnouncement`] values to the reconciler's queue.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod multicast;

/// Literal tag in front of every payload this application publishes.
pub const TXT_PREFIX: &str = "raft=";
pub const DEFAULT_SERVICE_NAME: &str = "_raft._udp";

/// Who a discovered node is and how to reach it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAnnouncement {
    pub id: String,
    pub raft_addr: String,
    pub http_addr: String,
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("invalid escape sequence at byte {0}")]
    BadEscape(usize),
    #[error("malformed announcement: {0}")]
    Json(#[from] serde_json::Error),
    #[error("discovery socket: {0}")]
    Io(#[from] std::io::Error),
}

/// Builds the text attribute advertised for `announcement`.
pub fn encode_txt(announcement: &PeerAnnouncement) -> Result<String, DiscoveryError> {
    let json = serde_json::to_string(announcement)?;
    Ok(format!("{TXT_PREFIX}{}", escape(&json)))
}

/// Parses a text attribute. `Ok(None)` means it is not one of ours.
pub fn decode_txt(txt: &str) -> Result<Option<PeerAnnouncement>, DiscoveryError> {
    let Some(payload) = txt.strip_prefix(TXT_PREFIX) else {
        return Ok(None);
    };
    let json = unescape(payload)?;
    Ok(Some(serde_json::from_str(&json)?))
}

/// Escapes backslashes, double quotes and control characters (`\xHH`).
pub fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            c if c.is_ascii_control() => out.push_str(&format!("\\x{:02x}", c as u32)),
            c => out.push(c),
        }
    }
    out
}

/// Inverse of [`escape`].
pub fn unescape(escaped: &str) -> Result<String, DiscoveryError> {
    let mut out = String::with_capacity(escaped.len());
    let mut chars = escaped.char_indices();
    while let Some((pos, ch)) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some((_, '\\')) => out.push('\\'),
            Some((_, '"')) => out.push('"'),
            Some((_, 'x')) => {
                let hex: String = chars.by_ref().take(2).map(|(_, c)| c).collect();
                let byte = match (hex.len(), u8::from_str_radix(&hex, 16)) {
                    (2, Ok(byte)) if byte.is_ascii() => byte,
                    _ => return Err(DiscoveryError::BadEscape(pos)),
                };
                out.push(char::from(byte));
            }
            _ => return Err(DiscoveryError::BadEscape(pos)),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn announcement() -> PeerAnnouncement {
        PeerAnnouncement {
            id: "node-1".to_string(),
            raft_addr: "10.0.0.1:12000".to_string(),
            http_addr: "10.0.0.1:11000".to_string(),
        }
    }

    #[test]
    fn txt_carries_prefix_and_escaped_json() {
        let txt = encode_txt(&announcement()).unwrap();
        assert!(txt.starts_with("raft={\\\"id\\\":\\\"node-1\\\""));
        assert_eq!(decode_txt(&txt).unwrap(), Some(announcement()));
    }

    #[test]
    fn foreign_records_are_ignored() {
        assert_eq!(decode_txt("path=/printer").unwrap(), None);
        assert_eq!(decode_txt("").unwrap(), None);
    }

    #[test]
    fn awkward_ids_survive_escaping() {
        let odd = PeerAnnouncement {
            id: "quote\" back\\slash\ttab\nnewline ünïcode".to_string(),
            ..announcement()
        };
        let txt = encode_txt(&odd).unwrap();
        assert!(!txt.contains('\n'));
        assert_eq!(decode_txt(&txt).unwrap(), Some(odd));
    }

    #[test]
    fn broken_escapes_are_errors() {
        assert!(matches!(unescape("abc\\"), Err(DiscoveryError::BadEscape(3))));
        assert!(matches!(unescape("\\q"), Err(DiscoveryError::BadEscape(0))));
        assert!(matches!(unescape("\\x4"), Err(DiscoveryError::BadEscape(0))));
        assert!(matches!(unescape("\\xzz"), Err(DiscoveryError::BadEscape(0))));
    }

    #[test]
    fn prefixed_garbage_is_malformed() {
        assert!(matches!(decode_txt("raft={not json"), Err(DiscoveryError::Json(_))));
    }
}
