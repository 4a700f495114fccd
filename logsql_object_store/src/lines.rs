//! Framing of chunked byte streams into `\n` terminated lines.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt, stream::BoxStream};

/// Incrementally splits bytes into lines.
///
/// Lines are returned without their terminator; a trailing `\r` is removed
/// as well.
#[derive(Debug, Default)]
pub struct LineSplitter {
    buf: BytesMut,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `chunk` and return every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        let searched = self.buf.len();
        self.buf.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = searched;
        while let Some(pos) = self.buf[start..].iter().position(|b| *b == b'\n') {
            let line = self.buf.split_to(start + pos + 1);
            lines.push(trim_terminator(line));
            start = 0;
        }
        lines
    }

    /// Return the unterminated remainder, if any.
    pub fn finish(&mut self) -> Option<Bytes> {
        if self.buf.is_empty() {
            return None;
        }
        Some(trim_terminator(self.buf.split()))
    }
}

fn trim_terminator(mut line: BytesMut) -> Bytes {
    if line.last() == Some(&b'\n') {
        line.truncate(line.len() - 1);
    }
    if line.last() == Some(&b'\r') {
        line.truncate(line.len() - 1);
    }
    line.freeze()
}

#[derive(Debug)]
struct LinesState<S> {
    inner: S,
    splitter: LineSplitter,
    pending: VecDeque<Bytes>,
    exhausted: bool,
}

/// Turn a stream of byte chunks into a stream of lines, in order.
///
/// An error from `stream` is passed through and ends the line stream.
pub fn into_lines<S, E>(stream: S) -> BoxStream<'static, Result<Bytes, E>>
where
    S: Stream<Item = Result<Bytes, E>> + Send + Unpin + 'static,
    E: Send + 'static,
{
    let state = LinesState {
        inner: stream,
        splitter: LineSplitter::new(),
        pending: VecDeque::new(),
        exhausted: false,
    };
    futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(line) = state.pending.pop_front() {
                return Some((Ok(line), state));
            }
            if state.exhausted {
                return None;
            }
            match state.inner.next().await {
                Some(Ok(chunk)) => state.pending.extend(state.splitter.push(&chunk)),
                Some(Err(e)) => {
                    state.exhausted = true;
                    state.pending.clear();
                    return Some((Err(e), state));
                }
                None => {
                    state.exhausted = true;
                    state.pending.extend(state.splitter.finish());
                }
            }
        }
    })
    .boxed()
}
