//! REPL command protocol.
//!
//! Built strictly on [`SerialSessionManager`]: commands are written as text
//! lines and responses are recognized by terminal patterns (a newline or
//! the `>>>` prompt). There is no framing, so only one command may be in
//! flight; the client serializes callers behind an async lock.

use crate::serial::events::{EventKind, ListenerId, SerialEvent};
use crate::serial::session::{SerialSessionManager, SessionState};
use crate::serial::transport::lock;
use crate::serial::types::*;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, watch};

/// Primary REPL prompt.
pub const PROMPT: &str = ">>>";
/// Continuation prompt shown inside an open block.
pub const CONTINUATION_PROMPT: &str = "...";
/// Ctrl-C, interrupts the running program.
pub const INTERRUPT: u8 = 0x03;

/// Keywords that continue a compound statement at the outer level.
const BLOCK_CONTINUATIONS: [&str; 4] = ["else", "elif", "except", "finally"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplTimings {
    pub command_timeout: Duration,
    /// Deadline for each program line in `execute_program`.
    pub program_line_timeout: Duration,
    pub inter_line_delay: Duration,
    /// Drain period after the interrupt that precedes a program.
    pub interrupt_settle: Duration,
    pub upload_open_settle: Duration,
    pub upload_line_delay: Duration,
    pub upload_close_settle: Duration,
}

impl Default for ReplTimings {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_millis(2000),
            program_line_timeout: Duration::from_millis(5000),
            inter_line_delay: Duration::from_millis(50),
            interrupt_settle: Duration::from_millis(100),
            upload_open_settle: Duration::from_millis(100),
            upload_line_delay: Duration::from_millis(50),
            upload_close_settle: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Terminator {
    /// A newline or the prompt anywhere in the buffer.
    LineOrPrompt,
    /// The last line is the primary or continuation prompt.
    Prompt,
}

impl Terminator {
    fn is_complete(&self, buffer: &str) -> bool {
        match self {
            Self::LineOrPrompt => buffer.contains('\n') || buffer.contains(PROMPT),
            Self::Prompt => {
                let tail = buffer.trim_end();
                let last = tail
                    .rsplit(|c: char| c == '\n' || c == '\r')
                    .next()
                    .unwrap_or("")
                    .trim_start();
                tail.ends_with(PROMPT) || last == CONTINUATION_PROMPT || last.starts_with("... ")
            }
        }
    }
}

/// Removes its listeners when dropped, on every exit path.
struct ListenerGuard<'a> {
    session: &'a SerialSessionManager,
    ids: Vec<(EventKind, ListenerId)>,
}

impl Drop for ListenerGuard<'_> {
    fn drop(&mut self) {
        for (kind, id) in self.ids.drain(..) {
            self.session.off(kind, id);
        }
    }
}

type Reply = Arc<Mutex<Option<oneshot::Sender<Result<String, SerialError>>>>>;

fn resolve(reply: &Reply, result: Result<String, SerialError>) {
    if let Some(tx) = lock(reply).take() {
        let _ = tx.send(result);
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Client
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Clones share the command lock, so commands stay serialized across them.
#[derive(Clone)]
pub struct ReplClient {
    session: SerialSessionManager,
    command_lock: Arc<tokio::sync::Mutex<()>>,
    line_ending: LineEnding,
    timings: ReplTimings,
}

impl ReplClient {
    pub fn new(session: SerialSessionManager) -> Self {
        Self::with_options(session, LineEnding::default(), ReplTimings::default())
    }

    pub fn with_options(session: SerialSessionManager, line_ending: LineEnding, timings: ReplTimings) -> Self {
        Self {
            session,
            command_lock: Arc::new(tokio::sync::Mutex::new(())),
            line_ending,
            timings,
        }
    }

    pub fn session(&self) -> &SerialSessionManager {
        &self.session
    }

    pub fn timings(&self) -> &ReplTimings {
        &self.timings
    }

    // ── Commands ───────────────────────────────────────────────────

    /// Send `command` and wait for the first newline or prompt.
    ///
    /// Returns the trimmed response with a trailing prompt removed.
    pub async fn send_command_and_wait(&self, command: &str, timeout: Duration) -> Result<String, SerialError> {
        let _cmd = self.command_lock.lock().await;
        let raw = self.exchange(self.line(command), Terminator::LineOrPrompt, timeout).await?;
        Ok(clean_response(&raw))
    }

    /// [`send_command_and_wait`](Self::send_command_and_wait) with the
    /// default two second deadline.
    pub async fn send_command(&self, command: &str) -> Result<String, SerialError> {
        self.send_command_and_wait(command, self.timings.command_timeout).await
    }

    /// Send `command` and wait until the device shows a prompt again, so
    /// that echo and printed output arrive together. Returns the raw buffer.
    pub async fn send_command_until_prompt(&self, command: &str, timeout: Duration) -> Result<String, SerialError> {
        let _cmd = self.command_lock.lock().await;
        self.exchange(self.line(command), Terminator::Prompt, timeout).await
    }

    /// Send the interrupt byte alone. Does not wait for the command lock so
    /// it can break a running program.
    pub async fn interrupt(&self) -> Result<(), SerialError> {
        self.session.send(&[INTERRUPT]).await
    }

    /// Run `source` line by line and collect the device output.
    ///
    /// A failure part-way through keeps the output collected so far and
    /// appends an `Error: <message>` line.
    pub async fn execute_program(&self, source: &str) -> Result<Vec<String>, SerialError> {
        let _cmd = self.command_lock.lock().await;
        if !self.session.is_connected() {
            return Err(SerialError::not_connected());
        }

        let mut output = Vec::new();
        if let Err(e) = self.interrupt_and_settle().await {
            output.push(error_line(&e));
            return Ok(output);
        }

        let lines = program_lines(source);
        log::debug!("Executing {} line(s)", lines.len());
        for (i, line) in lines.iter().enumerate() {
            match self
                .exchange(self.line(line), Terminator::Prompt, self.timings.program_line_timeout)
                .await
            {
                Ok(raw) => output.extend(response_lines(&raw)),
                Err(e) => {
                    log::warn!("Program stopped at line {}: {}", i + 1, e);
                    output.push(error_line(&e));
                    return Ok(output);
                }
            }
            if i + 1 < lines.len() {
                if let Err(e) = self.pace(self.timings.inter_line_delay).await {
                    output.push(error_line(&e));
                    return Ok(output);
                }
            }
        }
        Ok(output)
    }

    /// Write `content` to `filename` on the device through REPL statements.
    ///
    /// Any failure aborts the remaining steps. A partially written file is
    /// left on the device.
    pub async fn upload_file(&self, filename: &str, content: &str) -> Result<(), SerialError> {
        let _cmd = self.command_lock.lock().await;
        if !self.session.is_connected() {
            return Err(SerialError::not_connected());
        }

        self.statement(&format!("f = open('{}', 'w')", escape_line(filename))).await?;
        self.pace(self.timings.upload_open_settle).await?;

        let mut count = 0usize;
        for line in content.lines() {
            self.statement(&format!("f.write('{}\\n')", escape_line(line))).await?;
            self.pace(self.timings.upload_line_delay).await?;
            count += 1;
        }

        self.statement("f.close()").await?;
        self.pace(self.timings.upload_close_settle).await?;
        log::info!("Uploaded {} ({} line(s))", filename, count);
        Ok(())
    }

    // ── Internals ──────────────────────────────────────────────────

    fn line(&self, text: &str) -> Vec<u8> {
        let mut bytes = text.as_bytes().to_vec();
        bytes.extend_from_slice(self.line_ending.bytes());
        bytes
    }

    async fn statement(&self, text: &str) -> Result<(), SerialError> {
        self.session.send(&self.line(text)).await
    }

    async fn interrupt_and_settle(&self) -> Result<(), SerialError> {
        self.session.send(&[INTERRUPT]).await?;
        self.pace(self.timings.interrupt_settle).await
    }

    /// Write `payload` and collect data until `terminator` matches.
    async fn exchange(&self, payload: Vec<u8>, terminator: Terminator, timeout: Duration) -> Result<String, SerialError> {
        if !self.session.is_connected() {
            return Err(SerialError::not_connected());
        }

        let (tx, rx) = oneshot::channel();
        let reply: Reply = Arc::new(Mutex::new(Some(tx)));
        let buffer = Arc::new(Mutex::new(String::new()));

        let data_reply = reply.clone();
        let data_id = self.session.on(EventKind::Data, move |event| {
            if let SerialEvent::Data(text) = event {
                let mut buf = lock(&buffer);
                buf.push_str(text);
                if terminator.is_complete(&buf) {
                    resolve(&data_reply, Ok(buf.clone()));
                }
            }
        });
        let drop_reply = reply.clone();
        let drop_id = self.session.on(EventKind::Disconnected, move |_| {
            resolve(&drop_reply, Err(SerialError::disconnected()));
        });
        let _guard = ListenerGuard {
            session: &self.session,
            ids: vec![(EventKind::Data, data_id), (EventKind::Disconnected, drop_id)],
        };

        // The deadline covers the write too: a bridge write is a round trip.
        let exchange = async {
            self.session.send(&payload).await?;
            rx.await.unwrap_or_else(|_| Err(SerialError::disconnected()))
        };
        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(SerialError::timeout(timeout.as_millis() as u64)),
        }
    }

    /// Sleep for `delay`, aborting early if the connection drops.
    async fn pace(&self, delay: Duration) -> Result<(), SerialError> {
        let state = self.session.subscribe_state();
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = wait_until_disconnected(state) => return Err(SerialError::disconnected()),
        }
        if self.session.is_connected() {
            Ok(())
        } else {
            Err(SerialError::disconnected())
        }
    }
}

async fn wait_until_disconnected(mut state: watch::Receiver<SessionState>) {
    loop {
        if *state.borrow_and_update() != SessionState::Connected {
            return;
        }
        if state.changed().await.is_err() {
            return;
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Text helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn error_line(err: &SerialError) -> String {
    format!("Error: {}", err.message)
}

/// Trim, drop a trailing prompt, trim again.
pub fn clean_response(raw: &str) -> String {
    let trimmed = raw.trim();
    trimmed
        .strip_suffix(PROMPT)
        .map(str::trim)
        .unwrap_or(trimmed)
        .to_string()
}

/// Lines of one program step with line endings normalized. Prompt,
/// continuation and blank lines are dropped; the device's echo is kept.
pub fn response_lines(raw: &str) -> Vec<String> {
    raw.replace("\r\n", "\n")
        .replace('\r', "\n")
        .split('\n')
        .filter(|l| !l.contains(PROMPT))
        .filter(|l| !l.trim_start().starts_with(CONTINUATION_PROMPT))
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.trim_end().to_string())
        .collect()
}

/// Non-blank source lines, with empty lines inserted where an indented
/// block must be closed for a line-by-line REPL.
pub fn program_lines(source: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut in_block = false;
    for raw in source.lines() {
        let line = raw.trim_end();
        if line.trim().is_empty() {
            continue;
        }
        let indented = line.starts_with(' ') || line.starts_with('\t');
        let continues = BLOCK_CONTINUATIONS
            .iter()
            .any(|kw| line.starts_with(kw) && !line[kw.len()..].starts_with(|c: char| c.is_alphanumeric() || c == '_'));
        if in_block && !indented && !continues {
            out.push(String::new());
        }
        out.push(line.to_string());
        in_block = indented || line.ends_with(':');
    }
    if in_block {
        out.push(String::new());
    }
    out
}

/// Escape backslashes and single quotes for a single-quoted literal.
pub fn escape_line(line: &str) -> String {
    line.replace('\\', "\\\\").replace('\'', "\\'")
}

/// Whether the output contains an interpreter traceback.
pub fn has_traceback<S: AsRef<str>>(lines: &[S]) -> bool {
    lines.iter().any(|l| l.as_ref().contains("Traceback"))
}
