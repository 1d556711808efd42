//! Decode-ahead stage.
//!
//! A background thread owns the reader and sends fully decoded records over a
//! bounded channel. Joining stays on the caller's thread, so resolution order
//! is unaffected. The thread stops after the first end-of-stream or error, or
//! when the receiving side is dropped.

use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

use crate::binary_reader::RecordSource;
use crate::errors::DecodeError;
use crate::record::Record;

type Item = Result<Option<Record>, DecodeError>;

pub struct ReadAheadSource {
    receiver: Receiver<Item>,
    worker: Option<JoinHandle<()>>,
    finished: bool,
}

impl ReadAheadSource {
    pub fn spawn<S>(source: S, capacity: usize) -> Self
    where
        S: RecordSource + Send + 'static,
    {
        let (sender, receiver) = sync_channel(capacity.max(1));
        let worker = thread::Builder::new()
            .name("record-read-ahead".into())
            .spawn(move || decode_loop(source, sender));

        match worker {
            Ok(handle) => Self {
                receiver,
                worker: Some(handle),
                finished: false,
            },
            Err(e) => {
                // Without a thread the receiver reports the failure on first read.
                warn!(error = %e, "could not start read-ahead thread");
                let (sender, receiver) = sync_channel(1);
                let _ = sender.send(Err(DecodeError::Io(format!(
                    "read-ahead thread failed to start: {e}"
                ))));
                Self {
                    receiver,
                    worker: None,
                    finished: false,
                }
            }
        }
    }
}

fn decode_loop<S: RecordSource>(mut source: S, sender: SyncSender<Item>) {
    let mut sent = 0u64;
    loop {
        let item = source.next_record();
        let last = !matches!(item, Ok(Some(_)));
        if sender.send(item).is_err() {
            debug!(sent, "read-ahead receiver dropped");
            return;
        }
        sent += 1;
        if last {
            debug!(sent, "read-ahead stage finished");
            return;
        }
    }
}

impl RecordSource for ReadAheadSource {
    fn next_record(&mut self) -> Result<Option<Record>, DecodeError> {
        if self.finished {
            return Ok(None);
        }
        match self.receiver.recv() {
            Ok(Ok(Some(record))) => Ok(Some(record)),
            Ok(other) => {
                self.finished = true;
                other
            }
            Err(_) => {
                self.finished = true;
                Err(DecodeError::Io("read-ahead thread stopped unexpectedly".into()))
            }
        }
    }
}

impl Drop for ReadAheadSource {
    fn drop(&mut self) {
        // Unblock a sender waiting on a full channel before joining.
        let (_, empty) = sync_channel(0);
        drop(std::mem::replace(&mut self.receiver, empty));
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
