//! COPY FROM STDIN / COPY TO STDOUT streaming.
//!
//! Protocol 3 sessions stream chunks of arbitrary size; older sessions use the
//! line-based primitives and a `\.` terminator line. The connection mutex is
//! only held for each wire call, never while the caller's source or sink runs.

use std::io::{self, BufRead, Write};

use tracing::{debug, trace};

use super::connection::{ClosedState, Exclusive};
use super::cursor::{CopyTarget, Cursor};
use super::wire::{CopyChunk, Line};
use crate::error::{Error, Result};

const COPY_FROM_NEEDS_SOURCE: &str = "can't execute COPY FROM: use the copy_from() method instead";
const COPY_TO_NEEDS_SINK: &str = "can't execute COPY TO: use the copy_to() method instead";

impl Exclusive<'_> {
    /// Feed the cursor's copy source to the backend.
    pub(crate) fn copy_in(&self, cursor: &mut Cursor) -> Result<()> {
        let v3 = self.locked(|s| s.session.protocol_version() >= 3);
        match cursor.copy.take() {
            Some(CopyTarget::From(mut source)) if v3 => {
                self.copy_in_v3(&mut *source, cursor.copy_size)
            }
            Some(CopyTarget::From(mut source)) => self.copy_in_v2(&mut *source),
            _ => {
                debug!("COPY FROM STDIN without a source, aborting it");
                let ended = self.locked(|s| {
                    let ended = if v3 {
                        s.session.put_copy_end(Some("COPY FROM STDIN without a source"))
                    } else {
                        s.session.put_line("\\.\n").and_then(|_| s.session.end_copy())
                    };
                    ended.map_err(|e| s.wire_failure(e))
                });
                ended?;
                // the backend reports the aborted copy; the caller's mistake is what matters
                let _ = self.drain_results();
                Err(Error::programming(COPY_FROM_NEEDS_SOURCE))
            }
        }
    }

    /// Forward the backend's copy stream to the cursor's sink.
    pub(crate) fn copy_out(&self, cursor: &mut Cursor) -> Result<()> {
        let v3 = self.locked(|s| s.session.protocol_version() >= 3);
        let mut target = cursor.copy.take();
        let sink: Option<&mut dyn Write> = match &mut target {
            Some(CopyTarget::To(sink)) => Some(&mut **sink),
            _ => None,
        };
        let missing = sink.is_none();

        if v3 {
            self.copy_out_v3(sink)?;
        } else {
            self.copy_out_v2(sink)?;
        }
        if missing {
            return Err(Error::programming(COPY_TO_NEEDS_SINK));
        }
        Ok(())
    }

    // ========================================================================
    // Protocol 3
    // ========================================================================

    fn copy_in_v3(&self, source: &mut dyn BufRead, chunk_size: usize) -> Result<()> {
        let mut buf = vec![0u8; chunk_size.max(1)];
        let mut source_error = None;
        let mut send_failed = false;
        let mut sent = 0usize;

        loop {
            let n = match source.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    source_error = Some(e);
                    break;
                }
            };
            let chunk = &buf[..n];
            if self.locked(|s| s.session.put_copy_data(chunk)).is_err() {
                send_failed = true;
                break;
            }
            trace!(bytes = n, "copy chunk sent");
            sent += n;
        }

        let reason = if source_error.is_some() {
            Some("error in .read() call")
        } else if send_failed {
            Some("error in PQputCopyData() call")
        } else {
            None
        };
        debug!(bytes = sent, aborted = reason.is_some(), "copy in finished");

        let ended = self.locked(|s| match s.session.put_copy_end(reason) {
            Ok(()) => Ok(()),
            Err(e) => {
                let err = s.wire_failure(e);
                s.closed = ClosedState::Broken;
                Err(err)
            }
        });
        ended?;

        let drained = self.drain_results();
        if let Some(e) = source_error {
            return Err(Error::io("error reading copy source", e));
        }
        drained
    }

    fn copy_out_v3(&self, mut sink: Option<&mut dyn Write>) -> Result<()> {
        let mut sink_error = None;
        loop {
            let chunk = self.locked(|s| s.session.get_copy_data().map_err(|_| s.raise(None)))?;
            let data = match chunk {
                CopyChunk::Data(data) => data,
                CopyChunk::Done => break,
            };
            trace!(bytes = data.len(), "copy chunk received");
            if sink_error.is_some() {
                continue;
            }
            if let Some(sink) = sink.as_mut() {
                if let Err(e) = sink.write_all(&data) {
                    sink_error = Some(e);
                }
            }
        }

        let drained = self.drain_results();
        if let Some(e) = sink_error {
            return Err(Error::io("error writing to copy sink", e));
        }
        drained
    }

    // ========================================================================
    // Protocol 2
    // ========================================================================

    /// Errors in this mode only show up later as `ERROR` notices.
    fn copy_in_v2(&self, source: &mut dyn BufRead) -> Result<()> {
        let mut line = Vec::new();
        let mut source_error = None;

        loop {
            line.clear();
            match source.read_until(b'\n', &mut line) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    source_error = Some(e);
                    break;
                }
            }
            let text = String::from_utf8_lossy(&line);
            let text: &str = &text;
            self.locked(|s| s.session.put_line(text).map_err(|e| s.wire_failure(e)))?;
            trace!(bytes = line.len(), "copy line sent");
        }

        self.locked(|s| {
            s.session
                .put_line("\\.\n")
                .and_then(|_| s.session.end_copy())
                .map_err(|e| s.wire_failure(e))
        })?;

        let drained = self.drain_results();
        if let Some(e) = source_error {
            return Err(Error::io("error reading copy source", e));
        }
        drained
    }

    fn copy_out_v2(&self, mut sink: Option<&mut dyn Write>) -> Result<()> {
        let max = self.connection().config.copy_line_buffer;
        let mut sink_error = None;
        let mut continued = false;

        loop {
            let line = self.locked(|s| s.session.get_line(max).map_err(|e| s.wire_failure(e)))?;
            let mut out = match line {
                Line::Complete(text) => {
                    if !continued && text.starts_with("\\.") {
                        break;
                    }
                    continued = false;
                    text
                }
                Line::Partial(text) => {
                    continued = true;
                    text
                }
            };
            if !continued {
                out.push('\n');
            }
            trace!(bytes = out.len(), "copy line received");

            if sink_error.is_some() {
                continue;
            }
            if let Some(sink) = sink.as_mut() {
                if let Err(e) = sink.write_all(out.as_bytes()) {
                    sink_error = Some(e);
                }
            }
        }

        self.locked(|s| s.session.end_copy().map_err(|e| s.wire_failure(e)))?;
        let drained = self.drain_results();
        if let Some(e) = sink_error {
            return Err(Error::io("error writing to copy sink", e));
        }
        drained
    }

    /// Collect every result left by the submission, raising the first failure.
    fn drain_results(&self) -> Result<()> {
        let mut failure = None;
        loop {
            let next = self.locked(|s| s.session.get_result().map_err(|e| s.wire_failure(e)))?;
            let Some(result) = next else {
                break;
            };
            if result.is_error() && failure.is_none() {
                failure = Some(self.locked(|s| s.raise(Some(&result))));
            }
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
