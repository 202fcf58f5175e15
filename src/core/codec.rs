//! Framing codec: the wire grammar of the transfer protocol.
//!
//! Every frame is a single ASCII line that fits in one mesh text payload:
//! a one-letter kind discriminator followed by pipe-separated fields.
//! Binary chunk payloads are base64-encoded (standard alphabet, padded)
//! to survive the text transport.
//!
//! | kind  | wire form                        |
//! |-------|----------------------------------|
//! | PING  | `P\|<nonce>`                     |
//! | PONG  | `O\|<nonce>\|<name>`             |
//! | BEGIN | `B\|<tid>\|<total>\|<filename>`  |
//! | DATA  | `D\|<tid>\|<idx>\|<b64payload>`  |
//! | ACK   | `A\|<tid>\|<idx>` (`-1` = begin) |
//! | NAK   | `N\|<tid>\|<idx>`                |
//! | END   | `E\|<tid>`                       |
//! | FIN   | `F\|<tid>\|<ok\|err>`            |
//! | ABT   | `X\|<tid>\|<reason>`             |
//!
//! Parse failures are reported, never fatal: a malformed frame from the
//! mesh is logged by the caller and dropped.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;

use crate::core::session::{AbortReason, TransferId};

/// Effective byte budget of one mesh text payload. Meshtastic leaves
/// roughly 230 usable bytes for a text message after its own headers;
/// the codec rejects anything larger at encode time.
pub const FRAME_BUDGET: usize = 230;

/// Maximum characters kept from a sanitized filename.
pub const FILENAME_MAX: usize = 64;

const FIELD_SEP: char = '|';

/// Codec failure taxonomy. `Oversize` on the encode path is a programming
/// error and fails the owning session; `Malformed` on the parse path is
/// routine mesh noise.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
    #[error("encoded frame is {len} bytes, budget is {FRAME_BUDGET}")]
    Oversize { len: usize },
}

/// A parsed wire frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Discovery probe, broadcast with a fresh nonce.
    Ping { nonce: u32 },
    /// Discovery reply carrying the responder's display name.
    Pong { nonce: u32, name: String },
    /// Start of a transfer: chunk count and sanitized filename.
    Begin {
        tid: TransferId,
        total: u16,
        filename: String,
    },
    /// One chunk of file bytes.
    Data {
        tid: TransferId,
        index: u16,
        payload: Bytes,
    },
    /// Positive acknowledgment. `index == None` is the `-1` sentinel the
    /// receiver answers BEGIN with.
    Ack {
        tid: TransferId,
        index: Option<u16>,
    },
    /// Explicit retransmit request for one missing chunk.
    Nak { tid: TransferId, index: u16 },
    /// Sender finished sending every chunk.
    End { tid: TransferId },
    /// Receiver's final verdict after END and delivery.
    Fin { tid: TransferId, ok: bool },
    /// Abort from either side.
    Abort {
        tid: TransferId,
        reason: AbortReason,
    },
}

impl Frame {
    /// Serialize to the wire form, enforcing the frame budget.
    pub fn encode(&self) -> Result<String, CodecError> {
        let text = match self {
            Frame::Ping { nonce } => format!("P|{nonce}"),
            Frame::Pong { nonce, name } => format!("O|{nonce}|{}", sanitize_name(name)),
            Frame::Begin {
                tid,
                total,
                filename,
            } => format!("B|{tid}|{total}|{}", sanitize_filename(filename)),
            Frame::Data {
                tid,
                index,
                payload,
            } => format!("D|{tid}|{index}|{}", BASE64.encode(payload)),
            Frame::Ack { tid, index } => match index {
                Some(idx) => format!("A|{tid}|{idx}"),
                None => format!("A|{tid}|-1"),
            },
            Frame::Nak { tid, index } => format!("N|{tid}|{index}"),
            Frame::End { tid } => format!("E|{tid}"),
            Frame::Fin { tid, ok } => format!("F|{tid}|{}", if *ok { "ok" } else { "err" }),
            Frame::Abort { tid, reason } => format!("X|{tid}|{}", reason.token()),
        };
        if text.len() > FRAME_BUDGET {
            return Err(CodecError::Oversize { len: text.len() });
        }
        Ok(text)
    }

    /// Parse a wire frame. Rejects non-ASCII input, unknown kinds, wrong
    /// field counts, and out-of-range values.
    pub fn parse(text: &str) -> Result<Frame, CodecError> {
        if text.is_empty() || text.len() > FRAME_BUDGET {
            return Err(CodecError::Malformed("empty or over budget"));
        }
        if !text.is_ascii() {
            return Err(CodecError::Malformed("non-ascii frame"));
        }

        let mut fields = text.split(FIELD_SEP);
        let kind = fields.next().unwrap_or_default();
        let rest: Vec<&str> = fields.collect();

        match kind {
            "P" => {
                let [nonce] = take::<1>(&rest)?;
                Ok(Frame::Ping {
                    nonce: parse_nonce(nonce)?,
                })
            }
            "O" => {
                let [nonce, name] = take::<2>(&rest)?;
                Ok(Frame::Pong {
                    nonce: parse_nonce(nonce)?,
                    name: name.to_string(),
                })
            }
            "B" => {
                let [tid, total, filename] = take::<3>(&rest)?;
                let total: u16 = total
                    .parse()
                    .map_err(|_| CodecError::Malformed("bad total"))?;
                if total == 0 {
                    return Err(CodecError::Malformed("zero total"));
                }
                Ok(Frame::Begin {
                    tid: parse_tid(tid)?,
                    total,
                    filename: sanitize_filename(filename),
                })
            }
            "D" => {
                let [tid, index, b64] = take::<3>(&rest)?;
                let payload = BASE64
                    .decode(b64)
                    .map_err(|_| CodecError::Malformed("bad base64 payload"))?;
                Ok(Frame::Data {
                    tid: parse_tid(tid)?,
                    index: parse_index(index)?,
                    payload: Bytes::from(payload),
                })
            }
            "A" => {
                let [tid, index] = take::<2>(&rest)?;
                let index = if index == "-1" {
                    None
                } else {
                    Some(parse_index(index)?)
                };
                Ok(Frame::Ack {
                    tid: parse_tid(tid)?,
                    index,
                })
            }
            "N" => {
                let [tid, index] = take::<2>(&rest)?;
                Ok(Frame::Nak {
                    tid: parse_tid(tid)?,
                    index: parse_index(index)?,
                })
            }
            "E" => {
                let [tid] = take::<1>(&rest)?;
                Ok(Frame::End {
                    tid: parse_tid(tid)?,
                })
            }
            "F" => {
                let [tid, status] = take::<2>(&rest)?;
                let ok = match status {
                    "ok" => true,
                    "err" => false,
                    _ => return Err(CodecError::Malformed("bad fin status")),
                };
                Ok(Frame::Fin {
                    tid: parse_tid(tid)?,
                    ok,
                })
            }
            "X" => {
                let [tid, reason] = take::<2>(&rest)?;
                Ok(Frame::Abort {
                    tid: parse_tid(tid)?,
                    reason: AbortReason::from_token(reason),
                })
            }
            _ => Err(CodecError::Malformed("unknown frame kind")),
        }
    }

    /// Transfer id of the frame, if it carries one.
    pub fn tid(&self) -> Option<&TransferId> {
        match self {
            Frame::Begin { tid, .. }
            | Frame::Data { tid, .. }
            | Frame::Ack { tid, .. }
            | Frame::Nak { tid, .. }
            | Frame::End { tid }
            | Frame::Fin { tid, .. }
            | Frame::Abort { tid, .. } => Some(tid),
            Frame::Ping { .. } | Frame::Pong { .. } => None,
        }
    }
}

/// Require exactly N fields after the kind discriminator.
fn take<'a, const N: usize>(fields: &[&'a str]) -> Result<[&'a str; N], CodecError> {
    <[&'a str; N]>::try_from(fields).map_err(|_| CodecError::Malformed("wrong field count"))
}

fn parse_tid(s: &str) -> Result<TransferId, CodecError> {
    TransferId::parse(s).ok_or(CodecError::Malformed("bad transfer id"))
}

fn parse_index(s: &str) -> Result<u16, CodecError> {
    s.parse().map_err(|_| CodecError::Malformed("bad index"))
}

fn parse_nonce(s: &str) -> Result<u32, CodecError> {
    s.parse().map_err(|_| CodecError::Malformed("bad nonce"))
}

// ── Sanitization ─────────────────────────────────────────────────────────────

/// Reduce a filename to a safe wire form: basename only, printable ASCII,
/// no field separators, bounded length. Falls back to `"unnamed"` when
/// nothing survives.
pub fn sanitize_filename(input: &str) -> String {
    let basename = input
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(input);
    let mut out: String = basename
        .chars()
        .filter(|c| c.is_ascii_graphic() && *c != FIELD_SEP)
        .take(FILENAME_MAX)
        .collect();
    if out == "." || out == ".." {
        out.clear();
    }
    if out.is_empty() {
        out.push_str("unnamed");
    }
    out
}

fn sanitize_name(input: &str) -> String {
    let out: String = input
        .chars()
        .filter(|c| (c.is_ascii_graphic() || *c == ' ') && *c != FIELD_SEP)
        .take(32)
        .collect();
    let trimmed = out.trim();
    if trimmed.is_empty() {
        "node".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tid() -> TransferId {
        TransferId::parse("ab12cd34").unwrap()
    }

    #[test]
    fn test_roundtrip_all_kinds() {
        let frames = vec![
            Frame::Ping { nonce: 12345 },
            Frame::Pong {
                nonce: 12345,
                name: "basecamp".to_string(),
            },
            Frame::Begin {
                tid: tid(),
                total: 3,
                filename: "photo.jpg".to_string(),
            },
            Frame::Data {
                tid: tid(),
                index: 2,
                payload: Bytes::from_static(b"hello mesh"),
            },
            Frame::Ack {
                tid: tid(),
                index: Some(2),
            },
            Frame::Ack {
                tid: tid(),
                index: None,
            },
            Frame::Nak { tid: tid(), index: 7 },
            Frame::End { tid: tid() },
            Frame::Fin { tid: tid(), ok: true },
            Frame::Fin {
                tid: tid(),
                ok: false,
            },
            Frame::Abort {
                tid: tid(),
                reason: AbortReason::IdleTimeout,
            },
        ];
        for frame in frames {
            let wire = frame.encode().unwrap();
            assert!(wire.is_ascii());
            assert!(wire.len() <= FRAME_BUDGET);
            assert_eq!(Frame::parse(&wire).unwrap(), frame);
        }
    }

    #[test]
    fn test_begin_ack_sentinel_wire_form() {
        let wire = Frame::Ack {
            tid: tid(),
            index: None,
        }
        .encode()
        .unwrap();
        assert_eq!(wire, "A|ab12cd34|-1");
    }

    #[test]
    fn test_max_payload_fits_budget() {
        let frame = Frame::Data {
            tid: tid(),
            index: u16::MAX,
            payload: Bytes::from(vec![0xAB; 120]),
        };
        let wire = frame.encode().unwrap();
        assert!(wire.len() <= FRAME_BUDGET, "len = {}", wire.len());
    }

    #[test]
    fn test_oversize_payload_rejected_at_encode() {
        let frame = Frame::Data {
            tid: tid(),
            index: 0,
            payload: Bytes::from(vec![0u8; 200]),
        };
        assert!(matches!(
            frame.encode(),
            Err(CodecError::Oversize { .. })
        ));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for bad in [
            "",
            "Z|what",
            "B|ab12cd34|0|file.txt",    // zero total
            "B|ab12cd34|three|f.txt",   // non-numeric total
            "D|ab12cd34|1|@@@not-b64@@@",
            "D|ab12cd34|1",             // missing payload field
            "A|ab|3",                   // tid too short
            "F|ab12cd34|maybe",         // bad status
            "P|notanumber",
        ] {
            assert!(Frame::parse(bad).is_err(), "accepted: {bad:?}");
        }
    }

    #[test]
    fn test_parse_tolerates_empty_payload_ack_duplicates() {
        // Duplicated pipe yields an empty field, which must fail cleanly.
        assert!(Frame::parse("A|ab12cd34||3").is_err());
    }

    #[test]
    fn test_sanitize_filename_strips_paths_and_controls() {
        assert_eq!(sanitize_filename("/home/user/report.pdf"), "report.pdf");
        assert_eq!(sanitize_filename("C:\\temp\\notes.txt"), "notes.txt");
        assert_eq!(sanitize_filename("bad|name\x07.bin"), "badname.bin");
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename(".."), "unnamed");
        assert_eq!(sanitize_filename(""), "unnamed");
    }

    #[test]
    fn test_sanitize_filename_truncates() {
        let long = "x".repeat(300);
        assert_eq!(sanitize_filename(&long).len(), FILENAME_MAX);
    }

    #[test]
    fn test_unknown_abort_reason_is_preserved() {
        let frame = Frame::parse("X|ab12cd34|solarflare").unwrap();
        match frame {
            Frame::Abort { reason, .. } => assert_eq!(reason.token(), "solarflare"),
            other => panic!("unexpected frame {other:?}"),
        }
    }
}
