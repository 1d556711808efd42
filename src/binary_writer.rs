//! Writer for the binary log format read by [`crate::binary_reader`].

use std::io::Write;

use serde::Serialize;

use crate::binary_reader::{LOG_MAGIC, LOG_VERSION};
use crate::errors::{JoinerError, JoinerResult};
use crate::record::{Record, RecordKind};

pub struct RecordWriter<W: Write> {
    inner: W,
}

impl<W: Write> RecordWriter<W> {
    /// Writes the file header immediately.
    pub fn new(mut inner: W) -> JoinerResult<Self> {
        inner
            .write_all(&LOG_MAGIC)
            .and_then(|_| inner.write_all(&LOG_VERSION.to_le_bytes()))
            .map_err(|e| JoinerError::io("writing log header", e))?;
        Ok(Self { inner })
    }

    pub fn write_record(&mut self, record: &Record) -> JoinerResult<()> {
        let payload = match record {
            Record::Checkpoint(c) => encode(c)?,
            Record::Interaction(i) => encode(i)?,
            Record::Observation(o) => encode(o)?,
            Record::EpisodeBoundary(b) => encode(b)?,
        };
        self.write_frame(record.kind(), &payload)
    }

    pub fn write_end_of_log(&mut self) -> JoinerResult<()> {
        self.write_frame(RecordKind::EndOfLog, &[])
    }

    fn write_frame(&mut self, kind: RecordKind, payload: &[u8]) -> JoinerResult<()> {
        let len = u32::try_from(payload.len())
            .map_err(|_| JoinerError::config("frame", "payload larger than 4 GiB"))?;
        self.inner
            .write_all(&kind.tag().to_le_bytes())
            .and_then(|_| self.inner.write_all(&len.to_le_bytes()))
            .and_then(|_| self.inner.write_all(payload))
            .map_err(|e| JoinerError::io("writing log frame", e))?;
        Ok(())
    }

    pub fn flush(&mut self) -> JoinerResult<()> {
        self.inner
            .flush()
            .map_err(|e| JoinerError::io("flushing log", e))
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

fn encode<T: Serialize>(value: &T) -> JoinerResult<Vec<u8>> {
    bincode::serialize(value).map_err(|e| JoinerError::encoding("record payload", e))
}

/// Encode a complete in-memory log.
pub fn encode_log<'a, I>(records: I) -> JoinerResult<Vec<u8>>
where
    I: IntoIterator<Item = &'a Record>,
{
    let mut writer = RecordWriter::new(Vec::new())?;
    for record in records {
        writer.write_record(record)?;
    }
    Ok(writer.into_inner())
}
