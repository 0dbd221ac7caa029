//! Reassembly of blank-line delimited event frames from arbitrary byte chunks.
//!
//! Both the upstream completion stream and the relay's own downstream stream
//! use the same framing: `data: <payload>` segments separated by an empty
//! line, closed by a literal `[DONE]` payload.

use std::collections::VecDeque;
use std::fmt::Display;

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use tracing::warn;

/// Payload that marks the end of an event stream.
pub const DONE_MARKER: &str = "[DONE]";

const DATA_PREFIX: &str = "data:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame<T> {
    Data(T),
    Done,
}

/// Stateful framer owning the partial buffer for one read loop.
///
/// Frames are produced in arrival order. Once the terminal marker has been
/// seen the framer is finished and ignores any further input.
pub struct ChunkFramer<F> {
    buffer: BytesMut,
    decode: F,
    finished: bool,
}

impl<F, T, E> ChunkFramer<F>
where
    F: FnMut(&str) -> Result<T, E>,
    E: Display,
{
    pub fn new(decode: F) -> Self {
        Self {
            buffer: BytesMut::new(),
            decode,
            finished: false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Bytes received but not yet part of a complete frame.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<Frame<T>> {
        let mut frames = Vec::new();
        if self.finished {
            return frames;
        }

        self.buffer.extend_from_slice(chunk);

        while let Some((end, delimiter_len)) = find_delimiter(&self.buffer) {
            let raw = self.buffer.split_to(end + delimiter_len);
            let text = String::from_utf8_lossy(&raw[..end]);

            let Some(payload) = extract_payload(&text) else {
                continue;
            };

            if payload == DONE_MARKER {
                self.finished = true;
                self.buffer.clear();
                frames.push(Frame::Done);
                break;
            }

            match (self.decode)(&payload) {
                Ok(value) => frames.push(Frame::Data(value)),
                Err(err) => warn!(error = %err, frame = %payload, "dropping undecodable frame"),
            }
        }

        frames
    }
}

/// Returns the offset and length of the first blank-line delimiter.
fn find_delimiter(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = find(buffer, b"\n\n").map(|idx| (idx, 2));
    let crlf = find(buffer, b"\r\n\r\n").map(|idx| (idx, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Pulls the decodable payload out of one trimmed frame.
///
/// `data:` lines are joined; frames with no `data:` line are passed through
/// whole. Comment-only frames (keep-alives) yield nothing.
fn extract_payload(frame: &str) -> Option<String> {
    let frame = frame.trim();
    if frame.is_empty() {
        return None;
    }

    let mut data_lines = Vec::new();
    let mut has_content = false;
    for line in frame.lines() {
        let line = line.trim_end_matches('\r');
        if line.starts_with(':') {
            continue;
        }
        has_content = true;
        if let Some(data) = line.strip_prefix(DATA_PREFIX) {
            data_lines.push(data.trim_start());
        }
    }

    if !data_lines.is_empty() {
        Some(data_lines.join("\n").trim().to_string())
    } else if has_content {
        Some(frame.to_string())
    } else {
        None
    }
}

struct FrameState<S, F, T> {
    source: S,
    framer: ChunkFramer<F>,
    ready: VecDeque<Frame<T>>,
    exhausted: bool,
}

/// Adapts a byte stream into a finite stream of decoded frames.
///
/// The stream ends after yielding [`Frame::Done`], after the first source
/// error, or when the source ends. A trailing partial frame at end of input
/// is discarded.
pub fn decode_stream<S, F, T, E, SE>(
    source: S,
    decode: F,
) -> impl Stream<Item = Result<Frame<T>, SE>>
where
    S: Stream<Item = Result<Bytes, SE>> + Unpin,
    F: FnMut(&str) -> Result<T, E>,
    E: Display,
{
    let state = FrameState {
        source,
        framer: ChunkFramer::new(decode),
        ready: VecDeque::new(),
        exhausted: false,
    };

    futures::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(frame) = st.ready.pop_front() {
                return Some((Ok(frame), st));
            }
            if st.exhausted || st.framer.is_finished() {
                return None;
            }

            match st.source.next().await {
                Some(Ok(chunk)) => {
                    let frames = st.framer.push(&chunk);
                    st.ready.extend(frames);
                }
                Some(Err(err)) => {
                    st.exhausted = true;
                    return Some((Err(err), st));
                }
                None => {
                    st.exhausted = true;
                }
            }
        }
    })
}
