//! Notification buffer decoding.
//!
//! A completed change read leaves the buffer holding a chain of
//! variable-length records: a fixed 12-byte header (next-entry offset,
//! action code, name byte length, all little-endian `u32`) followed by the
//! UTF-16LE relative name. The chain ends at the record whose next-entry
//! offset is zero. A completion with zero valid bytes means the OS dropped
//! notifications because the buffer was not drained quickly enough.
//!
//! Decoding is pure: no I/O, no state, no per-record allocation beyond the
//! yielded path string. Every offset and length is checked against the
//! valid byte count before slicing — the chain originates from the OS, but
//! it is never trusted blindly.

use std::path::PathBuf;

use crate::error::DecodeError;
use crate::event::ChangeKind;

/// Size of the fixed record header in bytes.
const HEADER_LEN: usize = 12;

// Native action codes (FILE_ACTION_*). Kept as plain constants so the
// decoder compiles and tests on every platform.
const ACTION_ADDED: u32 = 1;
const ACTION_REMOVED: u32 = 2;
const ACTION_MODIFIED: u32 = 3;
const ACTION_RENAMED_OLD_NAME: u32 = 4;
const ACTION_RENAMED_NEW_NAME: u32 = 5;

/// One decoded change: a path relative to the watched directory and the
/// kind of change reported for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRecord {
    /// Path relative to the watched directory.
    pub relative_path: PathBuf,
    /// The kind of change.
    pub kind: ChangeKind,
}

/// Result of decoding a completed notification buffer.
#[derive(Debug)]
pub enum Decoded<'a> {
    /// The OS dropped notifications; no records are available and some
    /// changes were not reported. This is a distinct observable event,
    /// not silence.
    Overflow,

    /// The buffer holds a record chain; iterate to obtain the records in
    /// the order the OS reported them.
    Records(Records<'a>),
}

/// Decode a notification buffer.
///
/// `bytes_valid` is the byte count the OS reported for the completed read.
/// Zero means overflow. Each call re-decodes from the start of the buffer.
pub fn decode(buffer: &[u8], bytes_valid: usize) -> Decoded<'_> {
    if bytes_valid == 0 {
        return Decoded::Overflow;
    }
    let state = if bytes_valid > buffer.len() {
        // The reported count cannot be trusted past the real buffer.
        State::Failed(DecodeError::Truncated {
            offset: 0,
            len: buffer.len(),
        })
    } else {
        State::At(0)
    };
    Decoded::Records(Records {
        buf: &buffer[..bytes_valid.min(buffer.len())],
        state,
    })
}

/// Lazy, fused iterator over the record chain of one buffer.
///
/// Yields records in file order; after the first decode failure the
/// iterator yields that error once and then terminates.
#[derive(Debug)]
pub struct Records<'a> {
    buf: &'a [u8],
    state: State,
}

#[derive(Debug)]
enum State {
    At(usize),
    Failed(DecodeError),
    Done,
}

impl Iterator for Records<'_> {
    type Item = Result<ChangeRecord, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        match std::mem::replace(&mut self.state, State::Done) {
            State::Done => None,
            State::Failed(err) => Some(Err(err)),
            State::At(offset) => match parse_record(self.buf, offset) {
                Ok((record, next_offset)) => {
                    if let Some(next_offset) = next_offset {
                        self.state = State::At(next_offset);
                    }
                    Some(Ok(record))
                }
                Err(err) => Some(Err(err)),
            },
        }
    }
}

/// Parse the record starting at `offset`, returning it together with the
/// offset of the next record, or `None` if this record ends the chain.
fn parse_record(
    buf: &[u8],
    offset: usize,
) -> Result<(ChangeRecord, Option<usize>), DecodeError> {
    let truncated = || DecodeError::Truncated {
        offset,
        len: buf.len(),
    };

    let header = buf
        .get(offset..offset.checked_add(HEADER_LEN).ok_or_else(truncated)?)
        .ok_or_else(truncated)?;
    let next_entry_offset = read_u32(header, 0) as usize;
    let action = read_u32(header, 4);
    let name_len = read_u32(header, 8) as usize;

    if name_len % 2 != 0 {
        return Err(DecodeError::InvalidFileName { offset });
    }
    let name_start = offset + HEADER_LEN;
    let name_end = name_start.checked_add(name_len).ok_or_else(truncated)?;
    let name_bytes = buf.get(name_start..name_end).ok_or_else(truncated)?;

    let units: Vec<u16> = name_bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    let name = String::from_utf16(&units)
        .map_err(|_| DecodeError::InvalidFileName { offset })?;

    let kind = match action {
        ACTION_ADDED => ChangeKind::Added,
        ACTION_REMOVED => ChangeKind::Removed,
        ACTION_MODIFIED => ChangeKind::Modified,
        ACTION_RENAMED_OLD_NAME => ChangeKind::RenamedFrom,
        ACTION_RENAMED_NEW_NAME => ChangeKind::RenamedTo,
        other => return Err(DecodeError::UnknownAction(other)),
    };

    let next = if next_entry_offset == 0 {
        None
    } else {
        // Offsets are relative to the current record and strictly positive,
        // so the walk always makes progress and terminates.
        Some(offset.checked_add(next_entry_offset).ok_or_else(truncated)?)
    };

    Ok((
        ChangeRecord {
            relative_path: PathBuf::from(name),
            kind,
        },
        next,
    ))
}

/// Read a little-endian `u32` at `at` from a slice known to be long enough.
fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    /// Encode one record. `next` is the offset to the following record
    /// relative to this one (0 ends the chain); the name is UTF-16LE.
    fn record(next: u32, action: u32, name: &str) -> Vec<u8> {
        let units: Vec<u16> = name.encode_utf16().collect();
        let mut out = Vec::new();
        out.extend_from_slice(&next.to_le_bytes());
        out.extend_from_slice(&action.to_le_bytes());
        out.extend_from_slice(&((units.len() * 2) as u32).to_le_bytes());
        for unit in units {
            out.extend_from_slice(&unit.to_le_bytes());
        }
        out
    }

    /// Chain records back to back, fixing up each next-entry offset.
    fn chain(records: &[(u32, &str)]) -> Vec<u8> {
        let mut out = Vec::new();
        for (i, (action, name)) in records.iter().enumerate() {
            let body = record(0, *action, name);
            let next = if i + 1 == records.len() {
                0
            } else {
                body.len() as u32
            };
            let mut body = body;
            body[..4].copy_from_slice(&next.to_le_bytes());
            out.extend_from_slice(&body);
        }
        out
    }

    fn records(buf: &[u8]) -> Vec<Result<ChangeRecord, DecodeError>> {
        match decode(buf, buf.len()) {
            Decoded::Overflow => panic!("unexpected overflow"),
            Decoded::Records(iter) => iter.collect(),
        }
    }

    #[test]
    fn zero_valid_bytes_is_overflow() {
        let buf = record(0, ACTION_ADDED, "ignored.txt");
        assert!(matches!(decode(&buf, 0), Decoded::Overflow));
        assert!(matches!(decode(&[], 0), Decoded::Overflow));
    }

    #[test]
    fn single_record_decodes() {
        let buf = record(0, ACTION_ADDED, "a.txt");
        let got = records(&buf);
        assert_eq!(
            got,
            vec![Ok(ChangeRecord {
                relative_path: PathBuf::from("a.txt"),
                kind: ChangeKind::Added,
            })]
        );
    }

    #[test]
    fn chain_yields_records_in_file_order() {
        let buf = chain(&[
            (ACTION_RENAMED_OLD_NAME, "a.txt"),
            (ACTION_RENAMED_NEW_NAME, "b.txt"),
            (ACTION_MODIFIED, "c.txt"),
        ]);
        let got: Vec<_> = records(&buf)
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(got.len(), 3);
        assert_eq!(got[0].kind, ChangeKind::RenamedFrom);
        assert_eq!(got[0].relative_path, PathBuf::from("a.txt"));
        assert_eq!(got[1].kind, ChangeKind::RenamedTo);
        assert_eq!(got[1].relative_path, PathBuf::from("b.txt"));
        assert_eq!(got[2].kind, ChangeKind::Modified);
    }

    #[test]
    fn every_documented_action_maps() {
        let cases = [
            (ACTION_ADDED, ChangeKind::Added),
            (ACTION_REMOVED, ChangeKind::Removed),
            (ACTION_MODIFIED, ChangeKind::Modified),
            (ACTION_RENAMED_OLD_NAME, ChangeKind::RenamedFrom),
            (ACTION_RENAMED_NEW_NAME, ChangeKind::RenamedTo),
        ];
        for (action, kind) in cases {
            let buf = record(0, action, "x");
            let got = records(&buf);
            assert_eq!(got[0].as_ref().unwrap().kind, kind);
        }
    }

    #[test]
    fn unmapped_action_is_a_decode_error() {
        let buf = record(0, 99, "x");
        let got = records(&buf);
        assert_eq!(got, vec![Err(DecodeError::UnknownAction(99))]);
    }

    #[test]
    fn error_terminates_the_iterator() {
        // First record bad, second would be fine; only the error comes out.
        let buf = chain(&[(99, "bad"), (ACTION_ADDED, "good.txt")]);
        let got = records(&buf);
        assert_eq!(got, vec![Err(DecodeError::UnknownAction(99))]);
    }

    #[test]
    fn truncated_header_is_rejected() {
        let buf = record(0, ACTION_ADDED, "a.txt");
        let got: Vec<_> = match decode(&buf, 8) {
            Decoded::Records(iter) => iter.collect(),
            Decoded::Overflow => panic!("unexpected overflow"),
        };
        assert_eq!(got, vec![Err(DecodeError::Truncated { offset: 0, len: 8 })]);
    }

    #[test]
    fn name_running_past_the_buffer_is_rejected() {
        let mut buf = record(0, ACTION_ADDED, "abcdef.txt");
        // Claim a name longer than the remaining bytes.
        buf[8..12].copy_from_slice(&1000u32.to_le_bytes());
        let got = records(&buf);
        assert!(matches!(got[0], Err(DecodeError::Truncated { .. })));
    }

    #[test]
    fn odd_name_length_is_rejected() {
        let mut buf = record(0, ACTION_ADDED, "ab");
        buf[8..12].copy_from_slice(&3u32.to_le_bytes());
        let got = records(&buf);
        assert_eq!(got, vec![Err(DecodeError::InvalidFileName { offset: 0 })]);
    }

    #[test]
    fn unpaired_surrogate_name_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(&ACTION_ADDED.to_le_bytes());
        buf.extend_from_slice(&2u32.to_le_bytes());
        buf.extend_from_slice(&0xD800u16.to_le_bytes());
        let got = records(&buf);
        assert_eq!(got, vec![Err(DecodeError::InvalidFileName { offset: 0 })]);
    }

    #[test]
    fn next_offset_past_the_end_is_rejected() {
        let mut buf = record(0, ACTION_ADDED, "a.txt");
        let len = buf.len();
        // Point the chain just past the valid bytes.
        buf[..4].copy_from_slice(&(len as u32 + 4).to_le_bytes());
        let got = records(&buf);
        assert_eq!(got[0].as_ref().unwrap().kind, ChangeKind::Added);
        assert!(matches!(got[1], Err(DecodeError::Truncated { .. })));
        assert_eq!(got.len(), 2);
    }

    #[test]
    fn bytes_valid_beyond_buffer_is_rejected() {
        let buf = record(0, ACTION_ADDED, "a.txt");
        let got: Vec<_> = match decode(&buf, buf.len() + 8) {
            Decoded::Records(iter) => iter.collect(),
            Decoded::Overflow => panic!("unexpected overflow"),
        };
        assert_eq!(
            got,
            vec![Err(DecodeError::Truncated {
                offset: 0,
                len: buf.len(),
            })]
        );
    }

    #[test]
    fn records_need_not_be_four_byte_aligned() {
        // A 1-unit name makes the second record start at offset 14; the
        // decoder must follow the offset field, not an assumed padding.
        let mut first = record(0, ACTION_ADDED, "a");
        let second = record(0, ACTION_REMOVED, "b.txt");
        let next = first.len() as u32;
        first[..4].copy_from_slice(&next.to_le_bytes());
        first.extend_from_slice(&second);
        let got: Vec<_> = records(&first)
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(got.len(), 2);
        assert_eq!(got[1].relative_path, PathBuf::from("b.txt"));
        assert_eq!(got[1].kind, ChangeKind::Removed);
    }

    #[test]
    fn empty_name_is_allowed() {
        let buf = record(0, ACTION_MODIFIED, "");
        let got = records(&buf);
        assert_eq!(got[0].as_ref().unwrap().relative_path, PathBuf::new());
    }

    #[test]
    fn non_ascii_names_round_trip() {
        let buf = record(0, ACTION_ADDED, "héllo wörld.txt");
        let got = records(&buf);
        assert_eq!(
            got[0].as_ref().unwrap().relative_path,
            PathBuf::from("héllo wörld.txt")
        );
    }
}
