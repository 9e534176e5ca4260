//! Line-by-line polling of a remote file another process is appending to.
//!
//! The consumer keeps a byte offset into the output file. Each tick re-reads
//! the file, yields the complete lines past the offset, and then checks the
//! completion marker. Once the marker exists a final read flushes whatever
//! was appended in between, and the stream ends.

use std::{collections::VecDeque, sync::Arc, time::Duration};

use futures::{StreamExt, stream::BoxStream};
use sandbox_agents_core::{PollSource, TransportError};

/// Default delay between polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(300);

/// Lazy, ordered, finite sequence of raw output lines.
pub type LineStream = BoxStream<'static, Result<String, TransportError>>;

/// Polls an output file until a completion marker appears.
///
/// Not restartable: each poller yields its lines exactly once. There is no
/// built-in timeout; if the marker never appears the stream never ends.
pub struct OutputPoller {
    source: Arc<dyn PollSource>,
    output: String,
    marker: String,
    interval: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// First tick, no sleep before it.
    Start,
    Polling,
    /// Marker seen and final pass done; drain `pending`.
    Finished,
    Done,
}

struct PollState {
    poller: OutputPoller,
    offset: usize,
    /// Bytes past `offset` without a terminating newline yet.
    fragment_len: usize,
    pending: VecDeque<String>,
    /// Tick failure, yielded once `pending` is drained.
    failure: Option<TransportError>,
    phase: Phase,
}

impl OutputPoller {
    /// Create a poller for one invocation's output and marker files.
    #[must_use]
    pub fn new(
        source: Arc<dyn PollSource>,
        output: impl Into<String>,
        marker: impl Into<String>,
        interval: Duration,
    ) -> Self {
        Self {
            source,
            output: output.into(),
            marker: marker.into(),
            interval,
        }
    }

    /// Consume the poller into its line stream.
    ///
    /// Dropping the stream stops polling at the next suspension point.
    #[must_use]
    pub fn into_lines(self) -> LineStream {
        let state = PollState {
            poller: self,
            offset: 0,
            fragment_len: 0,
            pending: VecDeque::new(),
            failure: None,
            phase: Phase::Start,
        };

        futures::stream::unfold(state, |mut state| async move {
            loop {
                if let Some(line) = state.pending.pop_front() {
                    return Some((Ok(line), state));
                }
                if let Some(e) = state.failure.take() {
                    return Some((Err(e), state));
                }

                match state.phase {
                    Phase::Done => return None,
                    Phase::Finished => {
                        state.finish();
                        return None;
                    }
                    Phase::Start | Phase::Polling => {
                        if state.phase == Phase::Polling {
                            tokio::time::sleep(state.poller.interval).await;
                        }
                        state.phase = Phase::Polling;
                        if let Err(e) = state.tick().await {
                            state.failure = Some(e);
                            state.phase = Phase::Done;
                        }
                    }
                }
            }
        })
        .boxed()
    }
}

impl PollState {
    /// One poll: read new lines, then check for completion.
    async fn tick(&mut self) -> Result<(), TransportError> {
        self.read_new_lines().await?;

        if self.poller.source.exists(&self.poller.marker).await? {
            // Flush lines appended between the last read and the marker.
            self.read_new_lines().await?;
            self.phase = Phase::Finished;
            tracing::debug!(
                output = %self.poller.output,
                bytes = self.offset,
                "completion marker observed"
            );
        }
        Ok(())
    }

    async fn read_new_lines(&mut self) -> Result<(), TransportError> {
        let Some(bytes) = self.poller.source.read(&self.poller.output).await? else {
            tracing::trace!(output = %self.poller.output, "output file not created yet");
            return Ok(());
        };

        if bytes.len() < self.offset {
            tracing::warn!(
                output = %self.poller.output,
                len = bytes.len(),
                offset = self.offset,
                "output file shrank below consumed offset; ignoring"
            );
            return Ok(());
        }

        let fresh = &bytes[self.offset..];
        let Some(last_newline) = fresh.iter().rposition(|b| *b == b'\n') else {
            self.fragment_len = fresh.len();
            return Ok(());
        };

        for raw in fresh[..last_newline].split(|b| *b == b'\n') {
            let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
            self.pending.push_back(String::from_utf8_lossy(raw).into_owned());
        }
        self.offset += last_newline + 1;
        self.fragment_len = fresh.len() - last_newline - 1;
        Ok(())
    }

    fn finish(&mut self) {
        if self.fragment_len > 0 {
            tracing::warn!(
                output = %self.poller.output,
                bytes = self.fragment_len,
                "dropping unterminated trailing line at completion"
            );
        }
        self.phase = Phase::Done;
    }
}
