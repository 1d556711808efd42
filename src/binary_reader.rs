//! Binary log reader.
//!
//! ```text
//! file   := magic "RJLG"  version:u32le  frame*
//! frame  := kind:u32le  len:u32le  payload[len]
//! ```
//!
//! Payloads are bincode encodings of the structs in [`crate::record`]. Bytes of
//! an incomplete frame stay buffered, so a reader over a file that is still
//! being written can be polled again after [`DecodeError::Truncated`].

use std::io::{ErrorKind, Read};

use serde::de::DeserializeOwned;
use tracing::{debug, trace};

use crate::errors::DecodeError;
use crate::record::{Record, RecordKind};

pub const LOG_MAGIC: [u8; 4] = *b"RJLG";
pub const LOG_VERSION: u32 = 1;
pub const DEFAULT_MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

const FILE_HEADER_LEN: usize = 8;
const FRAME_HEADER_LEN: usize = 8;

/// Anything that yields decoded records in log order.
///
/// `Ok(None)` is end of stream. A source that may grow later (a log still
/// being written) reports `Truncated` for a partial trailing frame.
pub trait RecordSource {
    fn next_record(&mut self) -> Result<Option<Record>, DecodeError>;
}

impl<S: RecordSource + ?Sized> RecordSource for Box<S> {
    fn next_record(&mut self) -> Result<Option<Record>, DecodeError> {
        (**self).next_record()
    }
}

/// Records that were decoded elsewhere.
impl RecordSource for std::vec::IntoIter<Record> {
    fn next_record(&mut self) -> Result<Option<Record>, DecodeError> {
        Ok(self.next())
    }
}

pub struct RecordReader<R: Read> {
    inner: R,
    buf: Vec<u8>,
    /// Stream offset of `buf[0]`.
    offset: u64,
    header_checked: bool,
    end_of_log: bool,
    max_frame_len: u32,
}

impl<R: Read> RecordReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_max_frame_len(inner, DEFAULT_MAX_FRAME_LEN)
    }

    pub fn with_max_frame_len(inner: R, max_frame_len: u32) -> Self {
        Self {
            inner,
            buf: Vec::with_capacity(4096),
            offset: 0,
            header_checked: false,
            end_of_log: false,
            max_frame_len,
        }
    }

    /// Offset of the next unconsumed byte.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Try to have `needed` bytes buffered. `Ok(false)` means the source ran dry first.
    fn fill(&mut self, needed: usize) -> Result<bool, DecodeError> {
        while self.buf.len() < needed {
            let start = self.buf.len();
            self.buf.resize(needed, 0);
            match self.inner.read(&mut self.buf[start..]) {
                Ok(0) => {
                    self.buf.truncate(start);
                    return Ok(false);
                }
                Ok(n) => self.buf.truncate(start + n),
                Err(e) if e.kind() == ErrorKind::Interrupted => self.buf.truncate(start),
                Err(e) => {
                    self.buf.truncate(start);
                    return Err(DecodeError::Io(e.to_string()));
                }
            }
        }
        Ok(true)
    }

    fn consume(&mut self, n: usize) {
        self.buf.drain(..n);
        self.offset += n as u64;
    }

    fn read_u32(&self, at: usize) -> u32 {
        let mut word = [0u8; 4];
        word.copy_from_slice(&self.buf[at..at + 4]);
        u32::from_le_bytes(word)
    }

    fn check_file_header(&mut self) -> Result<bool, DecodeError> {
        if !self.fill(FILE_HEADER_LEN)? {
            if self.buf.is_empty() {
                return Ok(false);
            }
            let present = self.buf.len().min(LOG_MAGIC.len());
            if self.buf[..present] != LOG_MAGIC[..present] {
                let mut found = [0u8; 4];
                found[..present].copy_from_slice(&self.buf[..present]);
                return Err(DecodeError::BadMagic {
                    expected: LOG_MAGIC,
                    found,
                });
            }
            return Err(DecodeError::Truncated {
                needed: FILE_HEADER_LEN,
                available: self.buf.len(),
            });
        }

        let mut found = [0u8; 4];
        found.copy_from_slice(&self.buf[..4]);
        if found != LOG_MAGIC {
            return Err(DecodeError::BadMagic {
                expected: LOG_MAGIC,
                found,
            });
        }

        let version = self.read_u32(4);
        if version != LOG_VERSION {
            return Err(DecodeError::UnsupportedVersion {
                found: version,
                supported: LOG_VERSION,
            });
        }

        self.consume(FILE_HEADER_LEN);
        self.header_checked = true;
        debug!(version, "binary log header accepted");
        Ok(true)
    }

    fn decode<T: DeserializeOwned>(&self, kind: RecordKind, len: usize) -> Result<T, DecodeError> {
        let payload = &self.buf[FRAME_HEADER_LEN..FRAME_HEADER_LEN + len];
        bincode::deserialize(payload).map_err(|e| {
            DecodeError::corrupt(self.offset, format!("{kind:?} payload does not decode: {e}"))
        })
    }
}

impl<R: Read> RecordSource for RecordReader<R> {
    fn next_record(&mut self) -> Result<Option<Record>, DecodeError> {
        if self.end_of_log {
            return Ok(None);
        }
        if !self.header_checked && !self.check_file_header()? {
            return Ok(None);
        }

        if !self.fill(FRAME_HEADER_LEN)? {
            if self.buf.is_empty() {
                return Ok(None);
            }
            return Err(DecodeError::Truncated {
                needed: FRAME_HEADER_LEN,
                available: self.buf.len(),
            });
        }

        let tag = self.read_u32(0);
        let len = self.read_u32(4);
        let kind = RecordKind::from_tag(tag)
            .ok_or_else(|| DecodeError::corrupt(self.offset, format!("unknown kind tag {tag:#x}")))?;
        if len > self.max_frame_len {
            return Err(DecodeError::corrupt(
                self.offset,
                format!("frame length {len} exceeds limit {}", self.max_frame_len),
            ));
        }

        let len = len as usize;
        let total = FRAME_HEADER_LEN + len;
        if !self.fill(total)? {
            return Err(DecodeError::Truncated {
                needed: total,
                available: self.buf.len(),
            });
        }

        let record = match kind {
            RecordKind::Checkpoint => Record::Checkpoint(self.decode(kind, len)?),
            RecordKind::Interaction => Record::Interaction(self.decode(kind, len)?),
            RecordKind::Observation => Record::Observation(self.decode(kind, len)?),
            RecordKind::EpisodeBoundary => Record::EpisodeBoundary(self.decode(kind, len)?),
            RecordKind::EndOfLog => {
                self.consume(total);
                self.end_of_log = true;
                debug!(offset = self.offset, "end-of-log frame reached");
                return Ok(None);
            }
        };

        trace!(offset = self.offset, ?kind, len, "decoded frame");
        self.consume(total);
        Ok(Some(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binary_writer::RecordWriter;
    use crate::record::{DecisionPayload, EpisodeBoundary, Interaction, Observation, Outcome};
    use chrono::{TimeZone, Utc};
    use std::io::Cursor;

    fn sample_records() -> Vec<Record> {
        let ts = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
        vec![
            Record::Interaction(Interaction {
                event_id: "e1".into(),
                timestamp: ts,
                episode_id: None,
                context: "{\"user\":\"a\"}".into(),
                deferred: false,
                payload: DecisionPayload::Cb {
                    actions: vec![2, 0, 1],
                    probabilities: vec![0.8, 0.1, 0.1],
                },
            }),
            Record::Observation(Observation {
                event_id: "e1".into(),
                timestamp: ts,
                index: None,
                outcome: Outcome::Numeric(0.7),
                is_final: false,
            }),
            Record::EpisodeBoundary(EpisodeBoundary {
                episode_id: "ep".into(),
                timestamp: ts,
            }),
        ]
    }

    fn encode(records: &[Record]) -> Vec<u8> {
        let mut writer = RecordWriter::new(Vec::new()).unwrap();
        for record in records {
            writer.write_record(record).unwrap();
        }
        writer.into_inner()
    }

    #[test]
    fn test_reads_records_in_order() {
        let records = sample_records();
        let mut reader = RecordReader::new(Cursor::new(encode(&records)));

        for expected in &records {
            assert_eq!(reader.next_record().unwrap().as_ref(), Some(expected));
        }
        assert_eq!(reader.next_record().unwrap(), None);
    }

    #[test]
    fn test_rejects_unknown_version() {
        let mut bytes = encode(&sample_records());
        bytes[4..8].copy_from_slice(&7u32.to_le_bytes());

        let err = RecordReader::new(Cursor::new(bytes)).next_record().unwrap_err();
        assert_eq!(
            err,
            DecodeError::UnsupportedVersion {
                found: 7,
                supported: LOG_VERSION
            }
        );
    }

    #[test]
    fn test_rejects_bad_magic() {
        let mut bytes = encode(&sample_records());
        bytes[0] = b'X';
        let err = RecordReader::new(Cursor::new(bytes)).next_record().unwrap_err();
        assert!(matches!(err, DecodeError::BadMagic { .. }));
    }

    #[test]
    fn test_short_input_is_checked_against_magic() {
        let err = RecordReader::new(Cursor::new(b"abc".to_vec()))
            .next_record()
            .unwrap_err();
        assert_eq!(
            err,
            DecodeError::BadMagic {
                expected: LOG_MAGIC,
                found: [b'a', b'b', b'c', 0],
            }
        );

        let err = RecordReader::new(Cursor::new(b"RJL".to_vec()))
            .next_record()
            .unwrap_err();
        assert!(matches!(err, DecodeError::Truncated { needed: 8, available: 3 }));
    }

    #[test]
    fn test_truncated_frame_never_surfaces_partial_record() {
        let bytes = encode(&sample_records());
        let cut = bytes.len() - 3;
        let mut reader = RecordReader::new(Cursor::new(bytes[..cut].to_vec()));

        assert!(reader.next_record().unwrap().is_some());
        assert!(reader.next_record().unwrap().is_some());
        assert!(matches!(
            reader.next_record(),
            Err(DecodeError::Truncated { .. })
        ));
    }

    #[test]
    fn test_unknown_kind_is_corrupt() {
        let mut bytes = encode(&sample_records()[..1]);
        bytes.extend_from_slice(&0x77u32.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());

        let mut reader = RecordReader::new(Cursor::new(bytes));
        assert!(reader.next_record().unwrap().is_some());
        assert!(matches!(
            reader.next_record(),
            Err(DecodeError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_oversized_frame_is_corrupt() {
        let mut bytes = encode(&[]);
        bytes.extend_from_slice(&RecordKind::Observation.tag().to_le_bytes());
        bytes.extend_from_slice(&1024u32.to_le_bytes());

        let mut reader = RecordReader::with_max_frame_len(Cursor::new(bytes), 64);
        assert!(matches!(
            reader.next_record(),
            Err(DecodeError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_end_of_log_frame_stops_reading() {
        let records = sample_records();
        let mut writer = RecordWriter::new(Vec::new()).unwrap();
        writer.write_record(&records[0]).unwrap();
        writer.write_end_of_log().unwrap();
        let mut bytes = writer.into_inner();
        bytes.extend_from_slice(b"trailing garbage");

        let mut reader = RecordReader::new(Cursor::new(bytes));
        assert!(reader.next_record().unwrap().is_some());
        assert_eq!(reader.next_record().unwrap(), None);
        assert_eq!(reader.next_record().unwrap(), None);
    }

    #[test]
    fn test_empty_stream_is_end_of_stream() {
        let mut reader = RecordReader::new(Cursor::new(Vec::new()));
        assert_eq!(reader.next_record().unwrap(), None);
    }
}
