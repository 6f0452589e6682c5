//! Turn-based dialogue with a child process that speaks a line-oriented
//! status protocol.
//!
//! The child announces machine-readable events as lines starting with a
//! sentinel token (`[GNUPG:]` for gpg) and blocks for input whenever it emits
//! a prompt event. [`StatusDriver`] sends one command per turn, waits for the
//! next prompt and hands back everything printed in between.

use std::fmt;
use std::process::ExitStatus;
use std::time::Duration;

use regex::Regex;
use tracing::debug;

use crate::error::{Error, Result};
use crate::process::{LineCursor, ProcessHandle};
use crate::session::{CommandLine, ProcessSession, SpawnOptions};
use crate::validation::validate_protocol_line;

/// Sentinel gpg prefixes status lines with.
pub const GNUPG_STATUS: &str = "[GNUPG:]";

/// Flags putting gpg into command-fd/status-fd mode on stdin/stdout.
pub const GNUPG_PROTOCOL_FLAGS: [&str; 5] =
    ["--batch", "--command-fd", "0", "--status-fd", "1"];

/// How a status line is recognised as the prompt ending a turn.
///
/// Each mode is applied to the text after the sentinel, with surrounding
/// whitespace removed.
#[derive(Debug, Clone)]
pub enum PromptMatch {
    /// The text occurs anywhere in the status payload.
    Contains(String),
    /// The status payload is exactly this text.
    Line(String),
    /// The status payload matches this expression.
    Regex(Regex),
}

impl PromptMatch {
    /// Compiles `pattern` for [`PromptMatch::Regex`].
    pub fn regex(pattern: &str) -> Result<Self> {
        Regex::new(pattern)
            .map(Self::Regex)
            .map_err(|e| Error::InvalidInput {
                what: "prompt pattern",
                reason: e.to_string(),
            })
    }

    pub fn matches(&self, payload: &str) -> bool {
        let payload = payload.trim();
        match self {
            Self::Contains(text) => payload.contains(text.as_str()),
            Self::Line(text) => payload == text.as_str(),
            Self::Regex(re) => re.is_match(payload),
        }
    }
}

/// Protocol parameters for a [`StatusDriver`].
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Token every status line starts with.
    pub sentinel: String,
    /// Identifies the prompt status line that ends a turn.
    pub prompt: PromptMatch,
    /// Kill the process if a single turn takes longer than this.
    pub turn_timeout: Option<Duration>,
}

impl DriverConfig {
    /// Synchronises on any status line containing `prompt`.
    pub fn new(sentinel: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self::with_prompt(sentinel, PromptMatch::Contains(prompt.into()))
    }

    pub fn with_prompt(sentinel: impl Into<String>, prompt: PromptMatch) -> Self {
        Self {
            sentinel: sentinel.into(),
            prompt,
            turn_timeout: None,
        }
    }

    /// gpg status protocol, synchronising on exactly `GET_LINE <prompt>`.
    pub fn gnupg(prompt: &str) -> Self {
        Self::with_prompt(GNUPG_STATUS, PromptMatch::Line(format!("GET_LINE {prompt}")))
    }

    #[must_use]
    pub fn turn_timeout(mut self, timeout: Duration) -> Self {
        self.turn_timeout = Some(timeout);
        self
    }
}

/// A parsed status line: `<sentinel> <KEYWORD> [args...]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    pub keyword: String,
    pub args: Vec<String>,
}

impl StatusLine {
    pub fn parse(line: &str, sentinel: &str) -> Option<Self> {
        let rest = line.strip_prefix(sentinel)?.strip_prefix(' ')?;
        let mut words = rest.split_whitespace();
        let keyword = words.next()?.to_string();
        Some(Self {
            keyword,
            args: words.map(str::to_string).collect(),
        })
    }
}

/// Output captured during one turn of a dialogue, in emission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transcript {
    lines: Vec<String>,
    sentinel: String,
}

impl Transcript {
    pub(crate) fn new(lines: Vec<String>, sentinel: &str) -> Self {
        Self {
            lines,
            sentinel: sentinel.to_string(),
        }
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn text(&self) -> String {
        self.lines.join("\n")
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Status events of this turn. Lines before the first status line, and
    /// any other free text, are skipped.
    pub fn status(&self) -> impl Iterator<Item = StatusLine> + '_ {
        self.lines
            .iter()
            .filter_map(|line| StatusLine::parse(line, &self.sentinel))
    }

    pub fn has_status(&self, keyword: &str) -> bool {
        self.status().any(|s| s.keyword == keyword)
    }

    /// Arguments of the first status event named `keyword`.
    pub fn status_args(&self, keyword: &str) -> Option<Vec<String>> {
        self.status().find(|s| s.keyword == keyword).map(|s| s.args)
    }
}

impl fmt::Display for Transcript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    /// Waiting for the caller's next command.
    Idle,
    /// A command was sent; scanning output for the next prompt.
    AwaitingSync,
    /// The process exited or was killed; no further turns are possible.
    Terminated,
}

/// Drives a long-lived child through prompt-delimited turns.
///
/// Only one turn is ever in flight: [`execute`](Self::execute) takes
/// `&mut self` and does not return until the turn's prompt has been seen.
/// The process is killed when the driver is dropped.
///
/// # Example
///
/// ```no_run
/// # async fn example() -> gpgctl::Result<()> {
/// use gpgctl::{DriverConfig, ProcessSession, StatusDriver};
///
/// let session = ProcessSession::default();
/// let mut driver = StatusDriver::activate(
///     &session,
///     ["gpg", "--batch", "--command-fd", "0", "--status-fd", "1", "--edit-key", "ALICE"],
///     DriverConfig::gnupg("keyedit.prompt"),
/// )
/// .await?;
/// let transcript = driver.execute("list", &[]).await?;
/// println!("{transcript}");
/// driver.deactivate();
/// # Ok(())
/// # }
/// ```
pub struct StatusDriver {
    handle: ProcessHandle,
    cursor: LineCursor,
    config: DriverConfig,
    state: DriverState,
    preamble: Transcript,
}

impl fmt::Debug for StatusDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusDriver")
            .field("pid", &self.handle.pid())
            .field("prompt", &self.config.prompt)
            .field("state", &self.state)
            .finish()
    }
}

impl StatusDriver {
    /// Spawns `command` and waits for its first prompt.
    ///
    /// Fails with [`Error::ProtocolViolation`] if the process exits before
    /// prompting.
    pub async fn activate(
        session: &ProcessSession,
        command: impl Into<CommandLine>,
        config: DriverConfig,
    ) -> Result<Self> {
        Self::activate_with(session, command, SpawnOptions::default(), config).await
    }

    /// [`activate`](Self::activate) with explicit spawn overrides.
    pub async fn activate_with(
        session: &ProcessSession,
        command: impl Into<CommandLine>,
        options: SpawnOptions,
        config: DriverConfig,
    ) -> Result<Self> {
        let handle = session.spawn(command, options)?;
        let cursor = handle.lines();
        let mut driver = Self {
            handle,
            cursor,
            preamble: Transcript::new(Vec::new(), &config.sentinel),
            config,
            state: DriverState::AwaitingSync,
        };
        driver.preamble = driver.sync().await?;
        Ok(driver)
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    pub fn handle(&self) -> &ProcessHandle {
        &self.handle
    }

    /// Output printed before the first prompt.
    pub fn preamble(&self) -> &Transcript {
        &self.preamble
    }

    /// Sends `command` followed by each of `answers`, then waits for the next
    /// prompt and returns what the child printed in between.
    ///
    /// `answers` are replies to sub-prompts the command triggers before the
    /// main prompt comes back. The prompt line itself and `GOT_IT`
    /// acknowledgements are not part of the transcript.
    ///
    /// Once the driver is [`DriverState::Terminated`] every call fails with
    /// [`Error::NotRunning`].
    pub async fn execute(&mut self, command: &str, answers: &[&str]) -> Result<Transcript> {
        self.send(command, answers).await?;
        self.sync().await
    }

    /// Sends a command that ends the dialogue, such as `save` or `quit`, and
    /// waits for the process to exit.
    ///
    /// Returns whatever the child printed after the command together with its
    /// exit status. The turn timeout, if any, covers the whole shutdown.
    pub async fn finish(
        &mut self,
        command: &str,
        answers: &[&str],
    ) -> Result<(Transcript, ExitStatus)> {
        self.send(command, answers).await?;

        let cursor = &mut self.cursor;
        let handle = &self.handle;
        let drain = async move {
            let lines = cursor.collect_remaining().await;
            let status = handle.wait(None).await?;
            Ok::<_, Error>((lines, status))
        };
        let result = match self.config.turn_timeout {
            None => drain.await,
            Some(limit) => match tokio::time::timeout(limit, drain).await {
                Ok(result) => result,
                Err(_) => {
                    debug!(pid = self.handle.pid(), ?limit, "process did not exit in time");
                    self.deactivate();
                    return Err(Error::Timeout(limit));
                }
            },
        };

        self.state = DriverState::Terminated;
        let (lines, status) = result?;
        debug!(pid = self.handle.pid(), ?status, "dialogue finished");
        Ok((self.transcript(lines), status))
    }

    /// Kills the process. Idempotent.
    pub fn deactivate(&mut self) {
        self.handle.kill();
        self.state = DriverState::Terminated;
    }

    async fn send(&mut self, command: &str, answers: &[&str]) -> Result<()> {
        validate_protocol_line(command)?;
        for answer in answers {
            validate_protocol_line(answer)?;
        }

        if self.state == DriverState::Terminated {
            return Err(Error::NotRunning {
                pid: self.handle.pid(),
            });
        }

        debug!(pid = self.handle.pid(), command, answers = answers.len(), "sending command");
        self.state = DriverState::AwaitingSync;
        for line in std::iter::once(&command).chain(answers) {
            match self.handle.send_line(line).await {
                Ok(()) => {}
                Err(Error::NotRunning { .. }) => {
                    self.state = DriverState::Terminated;
                    return Err(Error::ProtocolViolation {
                        transcript: String::new(),
                    });
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn sync(&mut self) -> Result<Transcript> {
        let Some(limit) = self.config.turn_timeout else {
            return self.scan_to_prompt().await;
        };

        match tokio::time::timeout(limit, self.scan_to_prompt()).await {
            Ok(result) => result,
            Err(_) => {
                debug!(pid = self.handle.pid(), ?limit, "turn timed out");
                self.deactivate();
                Err(Error::Timeout(limit))
            }
        }
    }

    async fn scan_to_prompt(&mut self) -> Result<Transcript> {
        let mut lines = Vec::new();

        while let Some(line) = self.cursor.next_line().await {
            if self.is_prompt(&line) {
                self.state = DriverState::Idle;
                return Ok(self.transcript(lines));
            }
            lines.push(line);
        }

        self.state = DriverState::Terminated;
        debug!(pid = self.handle.pid(), "process ended before prompt");
        Err(Error::ProtocolViolation {
            transcript: lines.join("\n"),
        })
    }

    fn is_prompt(&self, line: &str) -> bool {
        line.strip_prefix(self.config.sentinel.as_str())
            .is_some_and(|payload| self.config.prompt.matches(payload))
    }

    fn transcript(&self, lines: Vec<String>) -> Transcript {
        let sentinel = &self.config.sentinel;
        let mut lines: Vec<String> = lines
            .into_iter()
            .filter(|line| {
                StatusLine::parse(line, sentinel).is_none_or(|s| s.keyword != "GOT_IT")
            })
            .collect();

        while lines.first().is_some_and(|l| l.trim().is_empty()) {
            lines.remove(0);
        }
        while lines.last().is_some_and(|l| l.trim().is_empty()) {
            lines.pop();
        }

        Transcript::new(lines, sentinel)
    }
}

impl Drop for StatusDriver {
    fn drop(&mut self) {
        self.handle.kill();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCRIPT: &str = r#"
echo "banner"
echo "STATUS PROMPT-A"
read cmd
if [ "$cmd" = go ]; then
    echo "first"
    echo "STATUS GOT_IT"
    echo "second"
    echo "STATUS PROMPT-B"
fi
"#;

    fn config() -> DriverConfig {
        DriverConfig::new("STATUS", "PROMPT")
    }

    #[test]
    fn test_parse_status_line() {
        let status = StatusLine::parse("[GNUPG:] GET_LINE keyedit.prompt", GNUPG_STATUS).unwrap();
        assert_eq!(status.keyword, "GET_LINE");
        assert_eq!(status.args, vec!["keyedit.prompt"]);

        assert!(StatusLine::parse("gpg: key not found", GNUPG_STATUS).is_none());
        assert!(StatusLine::parse("[GNUPG:]", GNUPG_STATUS).is_none());
        assert!(StatusLine::parse("[GNUPG:]GOT_IT", GNUPG_STATUS).is_none());
    }

    #[test]
    fn test_transcript_status_skips_preamble() {
        let transcript = Transcript::new(
            vec![
                "Secret key is available.".to_string(),
                "[GNUPG:] KEY_CONSIDERED ABCD 0".to_string(),
                "[GNUPG:] SC_OP_SUCCESS".to_string(),
            ],
            GNUPG_STATUS,
        );
        let keywords: Vec<_> = transcript.status().map(|s| s.keyword).collect();
        assert_eq!(keywords, vec!["KEY_CONSIDERED", "SC_OP_SUCCESS"]);
        assert!(transcript.has_status("SC_OP_SUCCESS"));
        assert_eq!(
            transcript.status_args("KEY_CONSIDERED"),
            Some(vec!["ABCD".to_string(), "0".to_string()])
        );
        assert_eq!(transcript.status_args("SC_OP_FAILURE"), None);
    }

    #[tokio::test]
    async fn test_execute_returns_lines_between_prompts() {
        let session = ProcessSession::default();
        let mut driver = StatusDriver::activate(&session, ["sh", "-c", SCRIPT], config())
            .await
            .unwrap();
        assert_eq!(driver.preamble().lines(), ["banner"]);
        assert_eq!(driver.state(), DriverState::Idle);

        let transcript = driver.execute("go", &[]).await.unwrap();
        assert_eq!(transcript.lines(), ["first", "second"]);
        assert_eq!(driver.state(), DriverState::Idle);

        let err = driver.execute("again", &[]).await.unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation { .. }));
        assert_eq!(driver.state(), DriverState::Terminated);

        let err = driver.execute("again", &[]).await.unwrap_err();
        assert!(matches!(err, Error::NotRunning { .. }));
    }

    #[tokio::test]
    async fn test_protocol_violation_carries_partial_transcript() {
        let session = ProcessSession::default();
        let script = r#"echo "STATUS PROMPT"; read cmd; echo "partial $cmd""#;
        let mut driver = StatusDriver::activate(&session, ["sh", "-c", script], config())
            .await
            .unwrap();

        match driver.execute("x", &[]).await {
            Err(Error::ProtocolViolation { transcript }) => assert_eq!(transcript, "partial x"),
            other => panic!("expected protocol violation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_answers_are_sent_in_order() {
        let session = ProcessSession::default();
        let script = r#"
echo "STATUS PROMPT"
read cmd; read name; read email
echo "$cmd:$name:$email"
echo "STATUS PROMPT"
"#;
        let mut driver = StatusDriver::activate(&session, ["sh", "-c", script], config())
            .await
            .unwrap();

        let transcript = driver
            .execute("adduid", &["Alice", "alice@example.org"])
            .await
            .unwrap();
        assert_eq!(transcript.text(), "adduid:Alice:alice@example.org");
    }

    #[tokio::test]
    async fn test_activate_fails_without_prompt() {
        let session = ProcessSession::default();
        let err = StatusDriver::activate(&session, ["sh", "-c", "echo nothing"], config())
            .await
            .unwrap_err();
        match err {
            Error::ProtocolViolation { transcript } => assert_eq!(transcript, "nothing"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_rejects_embedded_newline() {
        let session = ProcessSession::default();
        let mut driver = StatusDriver::activate(&session, ["sh", "-c", SCRIPT], config())
            .await
            .unwrap();

        let err = driver.execute("go\nquit", &[]).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput { .. }));
        assert_eq!(driver.state(), DriverState::Idle);
    }

    #[tokio::test]
    async fn test_turn_timeout_kills_process() {
        let session = ProcessSession::default();
        let script = r#"echo "STATUS PROMPT"; read cmd; sleep 5"#;
        let mut driver = StatusDriver::activate(
            &session,
            ["sh", "-c", script],
            config().turn_timeout(Duration::from_millis(50)),
        )
        .await
        .unwrap();

        let err = driver.execute("x", &[]).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert_eq!(driver.state(), DriverState::Terminated);
    }

    #[tokio::test]
    async fn test_finish_collects_output_and_status() {
        let session = ProcessSession::default();
        let script = r#"echo "STATUS PROMPT"; read cmd; echo "bye $cmd"; exit 3"#;
        let mut driver = StatusDriver::activate(&session, ["sh", "-c", script], config())
            .await
            .unwrap();

        let (transcript, status) = driver.finish("save", &[]).await.unwrap();
        assert_eq!(transcript.lines(), ["bye save"]);
        assert_eq!(status.code(), Some(3));
        assert_eq!(driver.state(), DriverState::Terminated);

        let err = driver.execute("list", &[]).await.unwrap_err();
        assert!(matches!(err, Error::NotRunning { .. }));
    }

    #[tokio::test]
    async fn test_deactivate_is_idempotent() {
        let session = ProcessSession::default();
        let mut driver = StatusDriver::activate(&session, ["sh", "-c", SCRIPT], config())
            .await
            .unwrap();
        driver.deactivate();
        driver.deactivate();
        driver.handle().wait(None).await.unwrap();
        assert!(driver.handle().poll().is_some());
    }

    #[test]
    fn test_prompt_match_modes() {
        let contains = PromptMatch::Contains("PROMPT".into());
        assert!(contains.matches(" PROMPT-A"));
        assert!(!contains.matches(" READY"));

        let line = PromptMatch::Line("GET_LINE keyedit.prompt".into());
        assert!(line.matches(" GET_LINE keyedit.prompt"));
        assert!(!line.matches(" GET_LINE keyedit.prompt.foo"));
        assert!(!line.matches(" GET_BOOL keyedit.save.okay"));

        let regex = PromptMatch::regex(r"^GET_(LINE|HIDDEN) \w+\.prompt$").unwrap();
        assert!(regex.matches(" GET_LINE cardedit.prompt"));
        assert!(regex.matches(" GET_HIDDEN passphrase.prompt"));
        assert!(!regex.matches(" GET_BOOL keyedit.save.okay"));

        let err = PromptMatch::regex("GET_LINE (").unwrap_err();
        assert!(matches!(err, Error::InvalidInput { what: "prompt pattern", .. }));
    }

    #[tokio::test]
    async fn test_line_match_ignores_longer_keyword() {
        let session = ProcessSession::default();
        let script = r#"
echo "[GNUPG:] GET_LINE keyedit.prompt"
read cmd
echo "[GNUPG:] GET_LINE keyedit.prompt.extra"
echo "listed $cmd"
echo "[GNUPG:] GET_LINE keyedit.prompt"
"#;
        let mut driver = StatusDriver::activate(
            &session,
            ["sh", "-c", script],
            DriverConfig::gnupg("keyedit.prompt"),
        )
        .await
        .unwrap();

        let transcript = driver.execute("list", &[]).await.unwrap();
        assert_eq!(
            transcript.lines(),
            ["[GNUPG:] GET_LINE keyedit.prompt.extra", "listed list"]
        );
    }

    #[tokio::test]
    async fn test_regex_prompt_dialogue() {
        let session = ProcessSession::default();
        let script = r#"
echo "STATUS ready 1"
read cmd
echo "got $cmd"
echo "STATUS ready 2"
"#;
        let config =
            DriverConfig::with_prompt("STATUS", PromptMatch::regex(r"^ready \d+$").unwrap());
        let mut driver = StatusDriver::activate(&session, ["sh", "-c", script], config)
            .await
            .unwrap();

        let transcript = driver.execute("ping", &[]).await.unwrap();
        assert_eq!(transcript.text(), "got ping");
    }
}
