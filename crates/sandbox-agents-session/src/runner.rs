//! Streaming agent turns out of a sandbox.
//!
//! A turn submits the agent in the background with stdout, stderr and its
//! exit status redirected to fresh files, then polls the output file and
//! decodes each line as it lands.

use std::{future::Future, sync::Arc, time::Duration};

use futures::{StreamExt, stream::BoxStream};
use sandbox_agents_core::{
    ConfigError, PollSource, StreamEvent, TransportError, traits::ExecuteRequest,
};
use sandbox_agents_executor::{
    ClaudeCode, CommandBuildError, EventDecoder, RedirectPaths, TurnRequest,
};
use sandbox_agents_transport::{DEFAULT_POLL_INTERVAL, LineStream, OutputPoller, ProviderPollSource};
use tokio::{
    sync::{Mutex, OwnedMutexGuard},
    time::Instant,
};

use crate::manager::{SessionError, SessionManager};

/// Longest slice of a bad line included in a decode warning.
const MAX_LOGGED_LINE: usize = 200;

/// Lazy sequence of events for one turn.
pub type EventStream = BoxStream<'static, Result<StreamEvent, StreamError>>;

/// Errors raised by [`AgentRunner::stream`] or carried by its stream.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Command build error: {0}")]
    Command(#[from] CommandBuildError),
    #[error("Another turn is still streaming on this sandbox")]
    TurnInProgress,
    #[error("Turn did not complete within {0:?}")]
    DeadlineExceeded(Duration),
}

/// Per-turn options.
#[derive(Debug, Clone)]
pub struct StreamOptions {
    /// Custom instructions appended to the agent's system prompt.
    pub instructions: Option<String>,
    /// Resume the most recent conversation in this sandbox.
    pub continue_conversation: bool,
    /// Delay between polls of the output file.
    pub poll_interval: Duration,
    /// Upper bound on the whole turn. `None` polls until completion.
    pub deadline: Option<Duration>,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            instructions: None,
            continue_conversation: false,
            poll_interval: DEFAULT_POLL_INTERVAL,
            deadline: None,
        }
    }
}

impl StreamOptions {
    #[must_use]
    pub fn instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    #[must_use]
    pub const fn continue_conversation(mut self, resume: bool) -> Self {
        self.continue_conversation = resume;
        self
    }

    #[must_use]
    pub const fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    #[must_use]
    pub const fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Runs agent turns in a sandbox session.
///
/// Turns are serialized: while one turn's stream is alive, starting another
/// fails with [`StreamError::TurnInProgress`]. Dropping a stream stops the
/// local polling only; the remote agent keeps running.
pub struct AgentRunner {
    manager: Arc<SessionManager>,
    claude: ClaudeCode,
    api_key_env: String,
    api_key: String,
    output_dir: String,
    decoder: EventDecoder,
    turn: Arc<Mutex<()>>,
}

impl AgentRunner {
    #[must_use]
    pub fn new(
        manager: Arc<SessionManager>,
        claude: ClaudeCode,
        api_key_env: impl Into<String>,
        api_key: impl Into<String>,
        output_dir: impl Into<String>,
    ) -> Self {
        Self {
            manager,
            claude,
            api_key_env: api_key_env.into(),
            api_key: api_key.into(),
            output_dir: output_dir.into(),
            decoder: EventDecoder::new(),
            turn: Arc::new(Mutex::new(())),
        }
    }

    /// Start a turn and return its events.
    ///
    /// Everything up to submitting the command happens before this returns,
    /// so configuration, session and binary failures surface here. Failures
    /// while polling end the returned stream with an error item.
    ///
    /// # Errors
    /// Returns error if the options are invalid, a turn is already streaming,
    /// or the session cannot be prepared or the command submitted.
    pub async fn stream(&self, prompt: &str, options: StreamOptions) -> Result<EventStream, StreamError> {
        if prompt.trim().is_empty() {
            return Err(ConfigError::InvalidParameter("prompt must not be empty".into()).into());
        }
        if options.poll_interval.is_zero() {
            return Err(ConfigError::InvalidParameter("poll_interval must be positive".into()).into());
        }
        if options.deadline.is_some_and(|d| d.is_zero()) {
            return Err(ConfigError::InvalidParameter("deadline must be positive".into()).into());
        }

        let guard = Arc::clone(&self.turn)
            .try_lock_owned()
            .map_err(|_| StreamError::TurnInProgress)?;
        let deadline = options.deadline.map(|d| (Instant::now() + d, d));

        let session = within(deadline, self.manager.prepare()).await??;

        let paths = RedirectPaths::fresh(&self.output_dir);
        let turn = TurnRequest {
            prompt: prompt.to_string(),
            instructions: options.instructions,
            continue_conversation: options.continue_conversation,
        };
        let line = self
            .claude
            .turn_command(&turn, &self.api_key_env, &self.api_key)?
            .to_redirected_line(&paths)?;

        let submission = within(
            deadline,
            self.manager.submit(&session, &ExecuteRequest::background(line)),
        )
        .await??;
        tracing::info!(
            sandbox = %self.manager.handle(),
            %session,
            command_id = %submission.command_id,
            resume = turn.continue_conversation,
            output = %paths.output,
            "agent turn submitted"
        );

        let source: Arc<dyn PollSource> = Arc::new(ProviderPollSource::new(
            Arc::clone(self.manager.provider()),
            self.manager.handle().clone(),
        ));
        let lines = OutputPoller::new(
            Arc::clone(&source),
            paths.output.clone(),
            paths.marker.clone(),
            options.poll_interval,
        )
        .into_lines();

        Ok(turn_events(TurnState {
            lines,
            source,
            paths,
            decoder: self.decoder,
            deadline,
            stage: Stage::Lines,
            guard: Some(guard),
        }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Lines,
    Trailer,
    Done,
}

struct TurnState {
    lines: LineStream,
    source: Arc<dyn PollSource>,
    paths: RedirectPaths,
    decoder: EventDecoder,
    deadline: Option<(Instant, Duration)>,
    stage: Stage,
    /// Held until the turn ends so turns on one sandbox never overlap.
    guard: Option<OwnedMutexGuard<()>>,
}

impl TurnState {
    fn end(&mut self) {
        self.stage = Stage::Done;
        self.guard = None;
    }
}

async fn within<F: Future>(deadline: Option<(Instant, Duration)>, fut: F) -> Result<F::Output, StreamError> {
    match deadline {
        Some((at, total)) => tokio::time::timeout_at(at, fut)
            .await
            .map_err(|_| StreamError::DeadlineExceeded(total)),
        None => Ok(fut.await),
    }
}

/// Captured stderr, if any, as the trailing event.
async fn read_trailer(
    source: Arc<dyn PollSource>,
    paths: RedirectPaths,
    deadline: Option<(Instant, Duration)>,
) -> Result<Option<StreamEvent>, StreamError> {
    if let Some(raw) = within(deadline, source.read(&paths.marker)).await?? {
        match marker_status(&raw).as_deref() {
            Some("0") => tracing::debug!(output = %paths.output, "agent exited cleanly"),
            Some(status) => {
                tracing::warn!(output = %paths.output, status, "agent exited with non-zero status");
            }
            None => tracing::debug!(output = %paths.output, "exit status not recorded yet"),
        }
    }

    let Some(stderr) = within(deadline, source.read(&paths.stderr)).await?? else {
        return Ok(None);
    };
    let text = String::from_utf8_lossy(&stderr);
    if text.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(StreamEvent::stderr(text)))
}

/// Exit status written to a marker file.
///
/// The shell creates the marker before writing to it, so it can be read
/// while still empty.
fn marker_status(raw: &[u8]) -> Option<String> {
    let status = String::from_utf8_lossy(raw).trim().to_string();
    (!status.is_empty()).then_some(status)
}

fn turn_events(state: TurnState) -> EventStream {
    futures::stream::unfold(state, |mut state| async move {
        loop {
            match state.stage {
                Stage::Done => return None,
                Stage::Trailer => {
                    let trailer =
                        read_trailer(Arc::clone(&state.source), state.paths.clone(), state.deadline)
                            .await;
                    state.end();
                    return match trailer {
                        Ok(Some(event)) => Some((Ok(event), state)),
                        Ok(None) => None,
                        Err(e) => Some((Err(e), state)),
                    };
                }
                Stage::Lines => {}
            }

            let next = match within(state.deadline, state.lines.next()).await {
                Ok(next) => next,
                Err(e) => {
                    state.end();
                    return Some((Err(e), state));
                }
            };

            match next {
                Some(Ok(line)) => match state.decoder.decode(&line) {
                    Ok(Some(event)) => return Some((Ok(event), state)),
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(
                            error = %e,
                            line = truncate(&line, MAX_LOGGED_LINE),
                            "skipping undecodable output line"
                        );
                    }
                },
                Some(Err(e)) => {
                    state.end();
                    return Some((Err(e.into()), state));
                }
                None => state.stage = Stage::Trailer,
            }
        }
    })
    .boxed()
}

fn truncate(line: &str, max: usize) -> &str {
    if line.len() <= max {
        return line;
    }
    let mut end = max;
    while !line.is_char_boundary(end) {
        end -= 1;
    }
    &line[..end]
}

#[cfg(test)]
mod tests {
    use futures::TryStreamExt;
    use sandbox_agents_core::{
        EventKind, SandboxProvider,
        traits::CreateSandboxRequest,
    };

    use super::*;
    use crate::provider::{MemorySandbox, ScriptedTurn};

    const TICK: Duration = Duration::from_millis(1);

    async fn runner() -> (Arc<MemorySandbox>, AgentRunner) {
        let sandbox = Arc::new(MemorySandbox::new());
        let handle = sandbox.create(&CreateSandboxRequest::default()).await.unwrap();
        let provider: Arc<dyn SandboxProvider> = sandbox.clone();
        let manager = Arc::new(SessionManager::new(provider, handle, ClaudeCode::new("claude")));
        let runner = AgentRunner::new(manager, ClaudeCode::new("claude"), "ANTHROPIC_API_KEY", "sk-test-key", "/tmp");
        (sandbox, runner)
    }

    fn opts() -> StreamOptions {
        StreamOptions::default().poll_interval(TICK)
    }

    async fn collect(runner: &AgentRunner, prompt: &str, options: StreamOptions) -> Vec<StreamEvent> {
        runner.stream(prompt, options).await.unwrap().try_collect().await.unwrap()
    }

    fn last_turn_command(sandbox: &MemorySandbox) -> String {
        sandbox
            .commands()
            .into_iter()
            .rev()
            .find(|c| c.run_async)
            .unwrap()
            .command
    }

    #[tokio::test]
    async fn test_end_to_end_text_then_result() {
        let (sandbox, runner) = runner().await;
        sandbox.push_turn(ScriptedTurn::lines([
            "{\"type\":\"text\",\"text\":\"Hi\"}\n",
            "{\"type\":\"result\",\"result\":\"done\"}\n",
        ]));

        let events = collect(&runner, "hi", opts()).await;
        let summary: Vec<(&str, &str)> = events.iter().map(|e| (e.event_type(), e.content())).collect();
        assert_eq!(summary, [("text", "Hi"), ("result", "done")]);
    }

    #[tokio::test]
    async fn test_lines_split_across_chunks_keep_order() {
        let (sandbox, runner) = runner().await;
        sandbox.push_turn(ScriptedTurn::lines([
            "{\"type\":\"text\",\"content\":\"a\"}\n{\"type\":\"te",
            "xt\",\"content\":\"b\"}\n",
            "{\"type\":\"text\",\"content\":\"c\"}\n{\"type\":\"result\",\"result\":\"d\"}\n",
        ]));

        let contents: Vec<String> = collect(&runner, "hi", opts())
            .await
            .into_iter()
            .map(|e| e.content().to_string())
            .collect();
        assert_eq!(contents, ["a", "b", "c", "d"]);
    }

    #[tokio::test]
    async fn test_malformed_lines_are_skipped() {
        let (sandbox, runner) = runner().await;
        sandbox.push_turn(ScriptedTurn::lines([
            "this is not json\n",
            "\n",
            "{\"type\":\"text\",\"content\":\"ok\"}\n",
        ]));

        let events = collect(&runner, "hi", opts()).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].content(), "ok");
    }

    #[tokio::test]
    async fn test_stderr_is_single_trailing_event() {
        let (sandbox, runner) = runner().await;
        sandbox.push_turn(
            ScriptedTurn::lines(["{\"type\":\"text\",\"content\":\"hi\"}\n"])
                .with_stderr("Error: something went wrong\n"),
        );

        let events = collect(&runner, "hi", opts()).await;
        let stderr: Vec<_> = events.iter().filter(|e| e.kind() == &EventKind::Stderr).collect();
        assert_eq!(stderr.len(), 1);
        assert!(stderr[0].content().contains("something went wrong"));
        assert_eq!(events.last().unwrap().kind(), &EventKind::Stderr);
    }

    #[tokio::test]
    async fn test_no_output_and_no_stderr_yields_nothing() {
        let (sandbox, runner) = runner().await;
        sandbox.push_turn(ScriptedTurn::default().with_stderr("  \n"));
        assert!(collect(&runner, "hi", opts()).await.is_empty());
    }

    #[tokio::test]
    async fn test_session_reused_and_continue_flag() {
        let (sandbox, runner) = runner().await;
        sandbox.push_turn(ScriptedTurn::lines(["{\"type\":\"text\",\"content\":\"ok\"}\n"]));
        sandbox.push_turn(ScriptedTurn::lines(["{\"type\":\"text\",\"content\":\"ok\"}\n"]));

        collect(&runner, "first", opts()).await;
        let first = last_turn_command(&sandbox);
        collect(&runner, "second", opts().continue_conversation(true)).await;
        let second = last_turn_command(&sandbox);

        assert!(!first.contains("--continue"));
        assert!(second.contains("--continue"));

        let sessions: Vec<_> = sandbox
            .commands()
            .into_iter()
            .filter(|c| c.run_async)
            .map(|c| c.session)
            .collect();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0], sessions[1]);
        assert_eq!(sandbox.created_sessions().len(), 1);
    }

    #[tokio::test]
    async fn test_command_wiring() {
        let (sandbox, runner) = runner().await;
        sandbox.push_turn(ScriptedTurn::default());
        collect(&runner, "hi", opts().instructions("Be concise")).await;

        let command = last_turn_command(&sandbox);
        assert!(command.starts_with("ANTHROPIC_API_KEY=sk-test-key claude --dangerously-skip-permissions"));
        assert!(command.contains("--output-format stream-json"));
        assert!(command.contains("--include-partial-messages"));
        let tokens = shlex::split(&command).unwrap();
        let idx = tokens.iter().position(|t| t == "--append-system-prompt").unwrap();
        assert_eq!(tokens[idx + 1], "Be concise");
        assert!(command.contains("> /tmp/sandbox-agents-"));
        assert!(command.contains("2> /tmp/sandbox-agents-"));
        assert!(command.contains("echo $? > /tmp/sandbox-agents-"));
    }

    #[tokio::test]
    async fn test_each_turn_uses_fresh_paths() {
        let (sandbox, runner) = runner().await;
        sandbox.push_turn(ScriptedTurn::default());
        sandbox.push_turn(ScriptedTurn::default());
        collect(&runner, "a", opts()).await;
        let first = last_turn_command(&sandbox);
        collect(&runner, "b", opts()).await;
        let second = last_turn_command(&sandbox);

        let target = |cmd: &str| cmd.rsplit("> ").next().unwrap().to_string();
        assert_ne!(target(&first), target(&second));
    }

    #[tokio::test]
    async fn test_missing_binary_fails_before_submission() {
        let (sandbox, runner) = runner().await;
        sandbox.set_binary_present(false);

        let err = runner.stream("hi", opts()).await.err().unwrap();
        assert!(matches!(err, StreamError::Session(SessionError::BinaryNotFound { .. })));
        assert!(err.to_string().contains("claude binary not found"));
        assert!(!sandbox.commands().iter().any(|c| c.run_async));
    }

    #[tokio::test]
    async fn test_invalid_parameters() {
        let (sandbox, runner) = runner().await;
        assert!(matches!(
            runner.stream("   ", opts()).await,
            Err(StreamError::Config(ConfigError::InvalidParameter(_)))
        ));
        assert!(matches!(
            runner.stream("hi", opts().poll_interval(Duration::ZERO)).await,
            Err(StreamError::Config(ConfigError::InvalidParameter(_)))
        ));
        assert!(sandbox.commands().is_empty());
    }

    #[tokio::test]
    async fn test_second_turn_while_streaming_is_rejected() {
        let (sandbox, runner) = runner().await;
        sandbox.push_turn(ScriptedTurn::lines(["{\"type\":\"text\",\"content\":\"a\"}\n"]));
        sandbox.push_turn(ScriptedTurn::default());

        let first = runner.stream("a", opts()).await.unwrap();
        assert!(matches!(
            runner.stream("b", opts()).await,
            Err(StreamError::TurnInProgress)
        ));

        let events: Vec<StreamEvent> = first.try_collect().await.unwrap();
        assert_eq!(events.len(), 1);
        collect(&runner, "b", opts()).await;
    }

    #[tokio::test]
    async fn test_dropping_stream_releases_turn() {
        let (sandbox, runner) = runner().await;
        sandbox.push_turn(ScriptedTurn::lines(["{\"type\":\"text\",\"content\":\"a\"}\n"]));
        sandbox.push_turn(ScriptedTurn::default());

        let mut first = runner.stream("a", opts()).await.unwrap();
        first.next().await.unwrap().unwrap();
        drop(first);

        collect(&runner, "b", opts()).await;
    }

    #[tokio::test]
    async fn test_deadline_ends_stalled_turn() {
        let (sandbox, runner) = runner().await;
        sandbox.push_turn(ScriptedTurn::lines(["{\"type\":\"text\",\"content\":\"partial\"}\n"]).stalled());

        let mut stream = runner
            .stream("hi", opts().deadline(Duration::from_millis(50)))
            .await
            .unwrap();

        assert_eq!(stream.next().await.unwrap().unwrap().content(), "partial");
        assert!(matches!(
            stream.next().await.unwrap(),
            Err(StreamError::DeadlineExceeded(_))
        ));
        assert!(stream.next().await.is_none());

        // The turn lock is released with the failed turn.
        sandbox.push_turn(ScriptedTurn::default());
        collect(&runner, "again", opts()).await;
    }

    #[tokio::test]
    async fn test_deadline_covers_session_setup() {
        let (sandbox, runner) = runner().await;
        sandbox.set_sessions_hang(true);

        let started = tokio::time::timeout(
            Duration::from_secs(5),
            runner.stream("hi", opts().deadline(Duration::from_millis(50))),
        )
        .await
        .unwrap();
        assert!(matches!(started, Err(StreamError::DeadlineExceeded(_))));
        assert!(sandbox.commands().is_empty());

        sandbox.set_sessions_hang(false);
        sandbox.push_turn(ScriptedTurn::default());
        collect(&runner, "again", opts()).await;
    }

    #[tokio::test]
    async fn test_transport_failure_terminates_stream() {
        let (sandbox, runner) = runner().await;
        sandbox.push_turn(ScriptedTurn::default());
        let mut stream = runner.stream("hi", opts()).await.unwrap();
        sandbox.set_unreachable(true);

        let item = stream.next().await.unwrap();
        assert!(matches!(item, Err(StreamError::Transport(TransportError::Unreachable(_)))));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_closing_sandbox_ends_running_stream() {
        let (sandbox, runner) = runner().await;
        sandbox.push_turn(ScriptedTurn::default().stalled());
        let mut stream = runner.stream("hi", opts()).await.unwrap();

        runner.manager.close().await.unwrap();

        let item = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(item, Err(StreamError::Transport(TransportError::Unreachable(_)))));
        assert!(stream.next().await.is_none());
    }

    #[test]
    fn test_empty_marker_has_no_status() {
        assert_eq!(marker_status(b""), None);
        assert_eq!(marker_status(b" \n"), None);
        assert_eq!(marker_status(b"0\n").as_deref(), Some("0"));
        assert_eq!(marker_status(b"127\n").as_deref(), Some("127"));
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "h");
        assert_eq!(truncate("short", 200), "short");
    }
}
