use std::fmt;
use std::process::ExitStatus;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin};
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};

const READ_CHUNK: usize = 4096;

/// Length and end-of-stream state of an [`OutputBuffer`], published by the
/// pump task after every append.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Published {
    len: usize,
    closed: bool,
}

/// Append-only byte buffer with a single writer and any number of readers.
///
/// Bytes below the published length are never modified again, so readers
/// only take the lock long enough to copy the range they have not seen yet.
#[derive(Debug)]
pub(crate) struct OutputBuffer {
    data: RwLock<Vec<u8>>,
    published: watch::Sender<Published>,
}

impl OutputBuffer {
    pub(crate) fn new() -> Self {
        Self {
            data: RwLock::new(Vec::new()),
            published: watch::Sender::new(Published::default()),
        }
    }

    pub(crate) fn append(&self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let len = {
            let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
            data.extend_from_slice(bytes);
            data.len()
        };
        self.published.send_modify(|p| p.len = len);
    }

    pub(crate) fn close(&self) {
        self.published.send_modify(|p| p.closed = true);
    }

    fn state(&self) -> Published {
        *self.published.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<Published> {
        self.published.subscribe()
    }

    fn copy_range(&self, start: usize, end: usize) -> Vec<u8> {
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        let end = end.min(data.len());
        data[start.min(end)..end].to_vec()
    }

    /// Returns the next complete line in `[*offset, len)` and advances
    /// `offset` past its newline.
    fn next_complete_line(&self, offset: &mut usize, len: usize) -> Option<Vec<u8>> {
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        let len = len.min(data.len());
        let start = (*offset).min(len);
        let pos = data[start..len].iter().position(|&b| b == b'\n')?;
        *offset = start + pos + 1;
        Some(data[start..*offset].to_vec())
    }

    async fn wait_closed(&self) {
        let mut rx = self.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = rx.wait_for(|p| p.closed).await;
    }
}

/// State shared between a [`ProcessHandle`] and its pump task.
#[derive(Debug)]
struct Shared {
    output: OutputBuffer,
    exit: watch::Sender<Option<ExitStatus>>,
}

/// One spawned child process.
///
/// A background pump task owns the OS process: it copies stdout (and stderr
/// unless discarded) into a shared append-only buffer, reaps the child and
/// carries out kill requests. Every accessor on the handle reads that shared
/// state, so any number of [`LineCursor`]s and output snapshots may be used
/// concurrently on the same process.
///
/// Handles are cheap to clone; all clones refer to the same process.
#[derive(Clone)]
pub struct ProcessHandle {
    inner: Arc<Inner>,
}

struct Inner {
    pid: u32,
    command: String,
    kill_on_timeout: bool,
    stdin: Mutex<Option<ChildStdin>>,
    kill_tx: mpsc::UnboundedSender<()>,
    shared: Arc<Shared>,
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.inner.pid)
            .field("command", &self.inner.command)
            .field("exit", &self.poll())
            .finish()
    }
}

impl ProcessHandle {
    /// Takes ownership of a freshly spawned child and starts its pump task.
    ///
    /// Must be called from within a Tokio runtime.
    pub(crate) fn attach(mut child: Child, command: String, kill_on_timeout: bool) -> Self {
        let pid = child.id().unwrap_or_default();
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let shared = Arc::new(Shared {
            output: OutputBuffer::new(),
            exit: watch::Sender::new(None),
        });
        let (kill_tx, kill_rx) = mpsc::unbounded_channel();

        tokio::spawn(pump(
            pid,
            child,
            StreamTap::new(stdout),
            StreamTap::new(stderr),
            Arc::clone(&shared),
            kill_rx,
        ));

        debug!(pid, command = %command, "spawned process");

        Self {
            inner: Arc::new(Inner {
                pid,
                command,
                kill_on_timeout,
                stdin: Mutex::new(stdin),
                kill_tx,
                shared,
            }),
        }
    }

    pub fn pid(&self) -> u32 {
        self.inner.pid
    }

    /// The command line this process was started with, for diagnostics.
    pub fn command(&self) -> &str {
        &self.inner.command
    }

    /// Returns the exit status if the process has terminated. Never blocks.
    pub fn poll(&self) -> Option<ExitStatus> {
        *self.inner.shared.exit.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.poll().is_none()
    }

    /// Writes `bytes` to the process's stdin and flushes immediately.
    ///
    /// Fails with [`Error::NotRunning`] if the process has exited or its
    /// stdin has been closed.
    pub async fn write(&self, bytes: &[u8]) -> Result<()> {
        let not_running = || Error::NotRunning { pid: self.inner.pid };
        if !self.is_running() {
            return Err(not_running());
        }

        let mut stdin = self.inner.stdin.lock().await;
        let pipe = stdin.as_mut().ok_or_else(not_running)?;
        let written = async {
            pipe.write_all(bytes).await?;
            pipe.flush().await
        }
        .await;

        match written {
            Ok(()) => {
                trace!(pid = self.inner.pid, bytes = bytes.len(), "wrote to stdin");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Err(not_running()),
            Err(e) => Err(e.into()),
        }
    }

    /// Writes `line` followed by a single newline. Trailing line breaks in
    /// `line` are dropped first.
    pub async fn send_line(&self, line: &str) -> Result<()> {
        let mut bytes = line.trim_end_matches(['\r', '\n']).as_bytes().to_vec();
        bytes.push(b'\n');
        self.write(&bytes).await
    }

    /// Closes stdin so the child sees end of input. Idempotent.
    pub async fn close_stdin(&self) {
        if let Some(mut pipe) = self.inner.stdin.lock().await.take()
            && let Err(e) = pipe.shutdown().await
        {
            debug!(pid = self.inner.pid, error = %e, "closing stdin failed");
        }
    }

    /// Requests termination of the process.
    ///
    /// Idempotent and infallible: a process that already exited, or that
    /// exits while the request is in flight, is left alone.
    pub fn kill(&self) {
        if !self.is_running() {
            return;
        }
        debug!(pid = self.inner.pid, "killing process");
        // A closed channel means the pump has already reaped the child.
        let _ = self.inner.kill_tx.send(());
    }

    /// Waits for the process to exit and for its output to be fully drained.
    ///
    /// With a `timeout`, returns [`Error::Timeout`] once it elapses. If the
    /// handle was spawned with `kill_on_timeout`, the process is killed and
    /// reaped before the error is returned, so [`poll`](Self::poll) reports
    /// an exit status afterwards.
    pub async fn wait(&self, timeout: Option<Duration>) -> Result<ExitStatus> {
        let Some(limit) = timeout else {
            return self.finished().await;
        };

        match tokio::time::timeout(limit, self.finished()).await {
            Ok(result) => result,
            Err(_) => {
                debug!(pid = self.inner.pid, ?limit, "wait timed out");
                if self.inner.kill_on_timeout {
                    self.kill();
                    self.exited().await?;
                }
                Err(Error::Timeout(limit))
            }
        }
    }

    async fn exited(&self) -> Result<ExitStatus> {
        let mut rx = self.inner.shared.exit.subscribe();
        let status = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| Error::NotRunning { pid: self.inner.pid })?;
        status.ok_or(Error::NotRunning { pid: self.inner.pid })
    }

    async fn finished(&self) -> Result<ExitStatus> {
        let status = self.exited().await?;
        self.inner.shared.output.wait_closed().await;
        Ok(status)
    }

    /// Everything the process has written so far. May be incomplete while
    /// the process is still running.
    pub fn output(&self) -> Vec<u8> {
        let output = &self.inner.shared.output;
        output.copy_range(0, output.state().len)
    }

    /// Lossy UTF-8 view of [`output`](Self::output).
    pub fn output_text(&self) -> String {
        String::from_utf8_lossy(&self.output()).into_owned()
    }

    /// Number of output bytes accumulated so far.
    pub fn output_len(&self) -> usize {
        self.inner.shared.output.state().len
    }

    /// Returns an independent line cursor starting at byte `offset` (clamped
    /// to what has been accumulated so far).
    ///
    /// With `strip`, trailing whitespace (including the newline) is removed
    /// from each yielded line.
    pub fn lines_from(&self, offset: usize, strip: bool) -> LineCursor {
        let shared = Arc::clone(&self.inner.shared);
        let offset = offset.min(shared.output.state().len);
        let rx = shared.output.subscribe();
        LineCursor {
            shared,
            rx,
            offset,
            strip,
            finished: false,
        }
    }

    /// Shorthand for `lines_from(0, true)`.
    pub fn lines(&self) -> LineCursor {
        self.lines_from(0, true)
    }
}

/// A non-destructive reader over a process's accumulated output.
///
/// The sequence is unbounded while the process runs; once the output stream
/// is closed the remaining complete lines are yielded, followed by any
/// trailing partial line, and then `None`.
pub struct LineCursor {
    shared: Arc<Shared>,
    rx: watch::Receiver<Published>,
    offset: usize,
    strip: bool,
    finished: bool,
}

impl fmt::Debug for LineCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LineCursor")
            .field("offset", &self.offset)
            .field("strip", &self.strip)
            .field("finished", &self.finished)
            .finish()
    }
}

impl LineCursor {
    /// Byte offset of the next unread byte.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub async fn next_line(&mut self) -> Option<String> {
        if self.finished {
            return None;
        }

        loop {
            let state = *self.rx.borrow_and_update();
            let output = &self.shared.output;

            if let Some(line) = output.next_complete_line(&mut self.offset, state.len) {
                return Some(self.decode(&line));
            }

            if state.closed {
                self.finished = true;
                let rest = output.copy_range(self.offset, state.len);
                self.offset = state.len;
                if rest.is_empty() {
                    return None;
                }
                return Some(self.decode(&rest));
            }

            if self.rx.changed().await.is_err() {
                // Unreachable while `shared` is alive; treat as end of stream.
                self.finished = true;
                return None;
            }
        }
    }

    /// Drains the cursor until the output stream closes.
    pub async fn collect_remaining(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(line) = self.next_line().await {
            lines.push(line);
        }
        lines
    }

    fn decode(&self, raw: &[u8]) -> String {
        let text = String::from_utf8_lossy(raw);
        if self.strip {
            text.trim_end().to_string()
        } else {
            text.into_owned()
        }
    }
}

/// One captured output stream, committed to the shared buffer a whole line
/// at a time so that merged stdout and stderr never interleave mid-line.
struct StreamTap<R> {
    reader: Option<R>,
    pending: Vec<u8>,
    chunk: Box<[u8; READ_CHUNK]>,
}

impl<R: AsyncRead + Unpin> StreamTap<R> {
    fn new(reader: Option<R>) -> Self {
        Self {
            reader,
            pending: Vec::new(),
            chunk: Box::new([0; READ_CHUNK]),
        }
    }

    fn is_open(&self) -> bool {
        self.reader.is_some()
    }

    async fn read(&mut self) -> std::io::Result<usize> {
        match self.reader.as_mut() {
            Some(reader) => reader.read(&mut self.chunk[..]).await,
            None => std::future::pending().await,
        }
    }

    fn commit(&mut self, pid: u32, read: std::io::Result<usize>, output: &OutputBuffer) {
        let n = match read {
            Ok(0) => return self.finish(output),
            Ok(n) => n,
            Err(e) => {
                debug!(pid, error = %e, "output stream failed");
                return self.finish(output);
            }
        };

        trace!(pid, chunk = %String::from_utf8_lossy(&self.chunk[..n]), "read output");
        self.pending.extend_from_slice(&self.chunk[..n]);
        if let Some(last_newline) = self.pending.iter().rposition(|&b| b == b'\n') {
            output.append(&self.pending[..=last_newline]);
            self.pending.drain(..=last_newline);
        }
    }

    fn finish(&mut self, output: &OutputBuffer) {
        output.append(&self.pending);
        self.pending.clear();
        self.reader = None;
    }
}

async fn pump<O, E>(
    pid: u32,
    mut child: Child,
    mut stdout: StreamTap<O>,
    mut stderr: StreamTap<E>,
    shared: Arc<Shared>,
    mut kill_rx: mpsc::UnboundedReceiver<()>,
) where
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
{
    let mut reaping = true;
    let mut kill_requests = true;

    while stdout.is_open() || stderr.is_open() || reaping {
        tokio::select! {
            read = stdout.read(), if stdout.is_open() => {
                stdout.commit(pid, read, &shared.output);
            }
            read = stderr.read(), if stderr.is_open() => {
                stderr.commit(pid, read, &shared.output);
            }
            waited = child.wait(), if reaping => {
                reaping = false;
                match waited {
                    Ok(status) => {
                        debug!(pid, code = ?status.code(), "process exited");
                        shared.exit.send_replace(Some(status));
                    }
                    Err(e) => warn!(pid, error = %e, "failed to reap process"),
                }
            }
            request = kill_rx.recv(), if reaping && kill_requests => {
                match request {
                    Some(()) => {
                        // Losing the race against a natural exit is fine.
                        if let Err(e) = child.start_kill() {
                            debug!(pid, error = %e, "kill request not delivered");
                        }
                    }
                    None => kill_requests = false,
                }
            }
        }
    }

    shared.output.close();
    trace!(pid, "output closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{ProcessSession, SessionConfig, SpawnOptions};

    fn session() -> ProcessSession {
        ProcessSession::new(SessionConfig::default())
    }

    #[test]
    fn test_output_buffer_complete_lines() {
        let buffer = OutputBuffer::new();
        buffer.append(b"first\nsec");
        let len = buffer.state().len;

        let mut offset = 0;
        assert_eq!(
            buffer.next_complete_line(&mut offset, len),
            Some(b"first\n".to_vec())
        );
        assert_eq!(offset, 6);
        assert_eq!(buffer.next_complete_line(&mut offset, len), None);

        buffer.append(b"ond\n");
        let len = buffer.state().len;
        assert_eq!(
            buffer.next_complete_line(&mut offset, len),
            Some(b"second\n".to_vec())
        );
    }

    #[test]
    fn test_output_buffer_ignores_unpublished_bytes() {
        let buffer = OutputBuffer::new();
        buffer.append(b"a\nb\n");
        let mut offset = 0;
        // Only the first two bytes are considered visible.
        assert_eq!(
            buffer.next_complete_line(&mut offset, 2),
            Some(b"a\n".to_vec())
        );
        assert_eq!(buffer.next_complete_line(&mut offset, 2), None);
    }

    #[tokio::test]
    async fn test_wait_collects_output() {
        let session = session();
        let handle = session
            .spawn(["printf", "one\\ntwo\\n"], SpawnOptions::default())
            .unwrap();

        let status = handle.wait(None).await.unwrap();
        assert!(status.success());
        assert_eq!(handle.output_text(), "one\ntwo\n");
    }

    #[tokio::test]
    async fn test_lines_yield_final_partial_line() {
        let session = session();
        let handle = session
            .spawn(["printf", "alpha\\nbeta"], SpawnOptions::default())
            .unwrap();

        let mut lines = handle.lines();
        assert_eq!(lines.next_line().await.as_deref(), Some("alpha"));
        assert_eq!(lines.next_line().await.as_deref(), Some("beta"));
        assert_eq!(lines.next_line().await, None);
        assert_eq!(lines.next_line().await, None);
    }

    #[tokio::test]
    async fn test_independent_cursors() {
        let session = session();
        let handle = session
            .spawn(["printf", "x\\ny\\n"], SpawnOptions::default())
            .unwrap();
        handle.wait(None).await.unwrap();

        let first = handle.lines().collect_remaining().await;
        let second = handle.lines().collect_remaining().await;
        assert_eq!(first, vec!["x", "y"]);
        assert_eq!(first, second);

        let tail = handle.lines_from(2, false).collect_remaining().await;
        assert_eq!(tail, vec!["y\n"]);
    }

    #[tokio::test]
    async fn test_wait_timeout_kills_process() {
        let session = session();
        let handle = session
            .spawn(["sleep", "5"], SpawnOptions::default())
            .unwrap();

        let started = std::time::Instant::now();
        let result = handle.wait(Some(Duration::from_millis(10))).await;
        assert!(matches!(result, Err(Error::Timeout(_))));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(handle.poll().is_some());
    }

    #[tokio::test]
    async fn test_wait_timeout_without_kill_leaves_process() {
        let session = session();
        let handle = session
            .spawn(
                ["sleep", "5"],
                SpawnOptions::default().kill_on_timeout(false),
            )
            .unwrap();

        let result = handle.wait(Some(Duration::from_millis(10))).await;
        assert!(matches!(result, Err(Error::Timeout(_))));
        assert!(handle.poll().is_none());

        handle.kill();
        handle.wait(None).await.unwrap();
        assert!(handle.poll().is_some());
    }

    #[tokio::test]
    async fn test_kill_is_idempotent() {
        let session = session();
        let handle = session.spawn(["true"], SpawnOptions::default()).unwrap();
        handle.wait(None).await.unwrap();

        handle.kill();
        handle.kill();
        assert!(handle.poll().unwrap().success());
    }

    #[tokio::test]
    async fn test_write_after_exit_is_not_running() {
        let session = session();
        let handle = session.spawn(["true"], SpawnOptions::default()).unwrap();
        handle.wait(None).await.unwrap();

        let err = handle.write(b"late\n").await.unwrap_err();
        assert!(matches!(err, Error::NotRunning { .. }));
    }

    #[tokio::test]
    async fn test_write_is_delivered_immediately() {
        let session = session();
        let handle = session.spawn(["cat"], SpawnOptions::default()).unwrap();

        let mut lines = handle.lines();
        handle.send_line("ping").await.unwrap();
        assert_eq!(lines.next_line().await.as_deref(), Some("ping"));
        handle.send_line("pong\n").await.unwrap();
        assert_eq!(lines.next_line().await.as_deref(), Some("pong"));

        handle.close_stdin().await;
        assert!(handle.wait(None).await.unwrap().success());
        assert_eq!(lines.next_line().await, None);
    }

    #[tokio::test]
    async fn test_close_stdin_after_exit() {
        let session = session();
        let handle = session.spawn(["true"], SpawnOptions::default()).unwrap();
        handle.wait(None).await.unwrap();

        handle.close_stdin().await;
        handle.close_stdin().await;
        let err = handle.write(b"late\n").await.unwrap_err();
        assert!(matches!(err, Error::NotRunning { .. }));
    }

    #[tokio::test]
    async fn test_stderr_is_merged_by_line() {
        let session = session();
        let handle = session
            .spawn(
                ["sh", "-c", "echo out; echo err >&2"],
                SpawnOptions::default(),
            )
            .unwrap();
        handle.wait(None).await.unwrap();

        let mut lines = handle.lines().collect_remaining().await;
        lines.sort();
        assert_eq!(lines, vec!["err", "out"]);
    }
}
