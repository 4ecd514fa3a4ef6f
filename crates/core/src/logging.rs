//! Logging plumbing shared by the binaries: filter resolution, the rolling log
//! file, redaction of secrets in persisted output, and crash artifacts.
//!
//! The subscriber itself is assembled by the binary; this module only hands
//! out the pieces.

use std::any::Any;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::fs;
use std::io::{self, Write};
use std::panic::{self, PanicHookInfo};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::thread;

use anyhow::{Context, Result};
use tracing::Metadata;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::writer::MakeWriter;

pub const DEFAULT_LOG_FILTER: &str = "info";
pub const DEFAULT_LOG_RETENTION_FILES: usize = 14;
pub const LOG_DIR_NAME: &str = "logs";
pub const CRASH_DIR_NAME: &str = "crash";
pub const REDACTION_PLACEHOLDER: &str = "***REDACTED***";

const LOG_FILE_PREFIX: &str = "nodeflow";
const LOG_FILE_SUFFIX: &str = "log";

static CRASH_HOOK_LOCK: Mutex<()> = Mutex::new(());
static CRASH_DIR: OnceLock<PathBuf> = OnceLock::new();
static CRASH_WRITE_ACTIVE: AtomicBool = AtomicBool::new(false);
static CRASH_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Where the effective filter came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterSource {
    Cli,
    Verbose,
    Env,
    Default,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FilterRequest<'a> {
    /// `--log-filter`
    pub cli: Option<&'a str>,
    /// Number of `-v` flags.
    pub verbose: u8,
    /// `RUST_LOG`
    pub env: Option<&'a str>,
}

/// `--log-filter` wins, then `-v`/`-vv`, then `RUST_LOG`, then [`DEFAULT_LOG_FILTER`].
pub fn resolve_filter(request: &FilterRequest<'_>) -> (String, FilterSource) {
    if let Some(filter) = request.cli {
        return (filter.to_string(), FilterSource::Cli);
    }
    match request.verbose {
        0 => {}
        1 => return ("debug".to_string(), FilterSource::Verbose),
        _ => return ("trace".to_string(), FilterSource::Verbose),
    }
    match request.env.filter(|filter| !filter.trim().is_empty()) {
        Some(filter) => (filter.to_string(), FilterSource::Env),
        None => (DEFAULT_LOG_FILTER.to_string(), FilterSource::Default),
    }
}

pub fn log_dir(data_dir: &Path) -> PathBuf {
    data_dir.join(LOG_DIR_NAME)
}

pub fn crash_dir(data_dir: &Path) -> PathBuf {
    log_dir(data_dir).join(CRASH_DIR_NAME)
}

/// Open the daily rolling log file under `<data_dir>/logs`, keeping at most
/// `retention_files` files (zero means the default).
pub fn open_log_file(data_dir: &Path, retention_files: usize) -> Result<RollingFileAppender> {
    let dir = log_dir(data_dir);
    fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create log directory: {}", dir.display()))?;

    let retention_files = match retention_files {
        0 => DEFAULT_LOG_RETENTION_FILES,
        n => n,
    };
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix(LOG_FILE_SUFFIX)
        .max_log_files(retention_files)
        .build(&dir)
        .with_context(|| format!("failed to open rolling log file in {}", dir.display()))
}

fn is_sensitive_key(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    matches!(key.as_str(), "key" | "pwd" | "passwd" | "passphrase")
        || key.contains("password")
        || key.contains("secret")
        || key.contains("token")
        || key.ends_with("_key")
        || key.ends_with("-key")
}

/// Identifier characters directly in front of a separator.
fn trailing_key(head: &str) -> &str {
    let start = head
        .char_indices()
        .rev()
        .take_while(|(_, ch)| ch.is_ascii_alphanumeric() || *ch == '_' || *ch == '-')
        .last()
        .map(|(idx, _)| idx)
        .unwrap_or(head.len());
    &head[start..]
}

/// Mask the values of `key=value` and `key: value` pairs whose key looks like a
/// credential. Quoted values keep their quotes.
pub fn redact(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(pos) = rest.find(['=', ':']) {
        let (head, tail) = rest.split_at(pos);
        out.push_str(head);
        out.push_str(&tail[..1]);
        let after = &tail[1..];

        if !is_sensitive_key(trailing_key(head)) {
            rest = after;
            continue;
        }

        let value = after.trim_start_matches(' ');
        out.push_str(&after[..after.len() - value.len()]);

        rest = match value.chars().next() {
            Some(quote @ ('"' | '\'')) => {
                let body = &value[1..];
                let end = body.find(quote).unwrap_or(body.len());
                out.push(quote);
                if end > 0 {
                    out.push_str(REDACTION_PLACEHOLDER);
                }
                &body[end..]
            }
            Some(_) => {
                let end = value
                    .find(|ch: char| ch.is_ascii_whitespace() || matches!(ch, ',' | ';' | ')' | '}'))
                    .unwrap_or(value.len());
                if end > 0 {
                    out.push_str(REDACTION_PLACEHOLDER);
                }
                &value[end..]
            }
            None => value,
        };
    }

    out.push_str(rest);
    out
}

/// [`MakeWriter`] adapter whose writers pass every line through [`redact`].
#[derive(Debug)]
pub struct RedactingMakeWriter<M> {
    inner: M,
}

pub fn redacting<M>(inner: M) -> RedactingMakeWriter<M> {
    RedactingMakeWriter { inner }
}

impl<'a, M> MakeWriter<'a> for RedactingMakeWriter<M>
where
    M: MakeWriter<'a>,
{
    type Writer = RedactingWriter<M::Writer>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter::new(self.inner.make_writer())
    }

    fn make_writer_for(&'a self, metadata: &Metadata<'_>) -> Self::Writer {
        RedactingWriter::new(self.inner.make_writer_for(metadata))
    }
}

/// Buffers partial lines so a secret split across two writes is still caught.
#[derive(Debug)]
pub struct RedactingWriter<W: Write> {
    inner: W,
    line: Vec<u8>,
}

impl<W: Write> RedactingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            line: Vec::new(),
        }
    }

    fn emit(&mut self, upto: usize) -> io::Result<()> {
        let chunk: Vec<u8> = self.line.drain(..upto).collect();
        self.inner
            .write_all(redact(&String::from_utf8_lossy(&chunk)).as_bytes())
    }
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.line.extend_from_slice(buf);
        while let Some(newline) = self.line.iter().position(|byte| *byte == b'\n') {
            self.emit(newline + 1)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.line.is_empty() {
            self.emit(self.line.len())?;
        }
        self.inner.flush()
    }
}

impl<W: Write> Drop for RedactingWriter<W> {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// Result of [`install_crash_hook`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrashHook {
    Installed(PathBuf),
    AlreadyInstalled(PathBuf),
    Unavailable { crash_dir: PathBuf, reason: String },
}

/// Install a panic hook that writes one crash artifact per panic under
/// `<data_dir>/logs/crash` and then runs the previous hook. Only the first
/// successful call installs anything.
pub fn install_crash_hook(data_dir: &Path) -> CrashHook {
    let _guard = CRASH_HOOK_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(existing) = CRASH_DIR.get() {
        return CrashHook::AlreadyInstalled(existing.clone());
    }

    let dir = crash_dir(data_dir);
    if let Err(error) = fs::create_dir_all(&dir) {
        return CrashHook::Unavailable {
            crash_dir: dir,
            reason: format!("failed to create crash directory: {error}"),
        };
    }

    let previous = panic::take_hook();
    let hook_dir = dir.clone();
    panic::set_hook(Box::new(move |info| {
        record_crash(&hook_dir, info);
        previous(info);
    }));

    let _ = CRASH_DIR.set(dir.clone());
    CrashHook::Installed(dir)
}

fn record_crash(dir: &Path, info: &PanicHookInfo<'_>) {
    // A panic inside the writer must not recurse into it.
    if CRASH_WRITE_ACTIVE.swap(true, Ordering::AcqRel) {
        return;
    }

    let outcome = panic::catch_unwind(panic::AssertUnwindSafe(|| write_crash_file(dir, info)));
    match outcome {
        Ok(Ok(_)) => {}
        Ok(Err(error)) => eprintln!(
            "Warning: could not write crash artifact under '{}': {error}",
            dir.display()
        ),
        Err(_) => eprintln!(
            "Warning: crash hook panicked while writing under '{}'",
            dir.display()
        ),
    }

    CRASH_WRITE_ACTIVE.store(false, Ordering::Release);
}

fn write_crash_file(dir: &Path, info: &PanicHookInfo<'_>) -> io::Result<PathBuf> {
    let now = chrono::Utc::now();
    let backtrace = Backtrace::capture();
    let backtrace = match backtrace.status() {
        BacktraceStatus::Captured => backtrace.to_string(),
        BacktraceStatus::Disabled => "<disabled, set RUST_BACKTRACE=1 to enable>".to_string(),
        _ => "<unavailable>".to_string(),
    };
    let location = info
        .location()
        .map(|location| format!("{}:{}", location.file(), location.line()))
        .unwrap_or_else(|| "<unknown>".to_string());

    fs::create_dir_all(dir)?;
    let sequence = CRASH_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let path = dir.join(format!(
        "crash-{}-{sequence:04}.log",
        now.format("%Y%m%dT%H%M%S%.3f")
    ));

    let mut file = fs::File::create(&path)?;
    writeln!(file, "timestamp_utc={}", now.to_rfc3339())?;
    writeln!(file, "thread={}", thread::current().name().unwrap_or("<unnamed>"))?;
    writeln!(file, "location={location}")?;
    writeln!(file, "payload={}", redact(&payload_text(info.payload())))?;
    writeln!(file, "backtrace:")?;
    writeln!(file, "{backtrace}")?;
    file.flush()?;

    Ok(path)
}

fn payload_text(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|text| (*text).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "<non-string panic payload>".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, NamedTempFile};

    #[test]
    fn test_filter_precedence() {
        let all = FilterRequest {
            cli: Some("nodeflow_core=trace"),
            verbose: 2,
            env: Some("error"),
        };
        assert_eq!(
            resolve_filter(&all),
            ("nodeflow_core=trace".to_string(), FilterSource::Cli)
        );

        let verbose = FilterRequest { cli: None, ..all };
        assert_eq!(resolve_filter(&verbose), ("trace".to_string(), FilterSource::Verbose));
        let once = FilterRequest { verbose: 1, ..verbose };
        assert_eq!(resolve_filter(&once), ("debug".to_string(), FilterSource::Verbose));

        let env = FilterRequest { verbose: 0, ..verbose };
        assert_eq!(resolve_filter(&env), ("error".to_string(), FilterSource::Env));
    }

    #[test]
    fn test_blank_rust_log_falls_back_to_default() {
        let request = FilterRequest {
            env: Some("  "),
            ..Default::default()
        };
        assert_eq!(
            resolve_filter(&request),
            (DEFAULT_LOG_FILTER.to_string(), FilterSource::Default)
        );
    }

    #[test]
    fn test_redact_masks_credentials_only() {
        let source = "node=vigenere key=LEMON password: \"hunter 2\" api_token=abc123, shift=3";
        let redacted = redact(source);

        assert_eq!(
            redacted,
            format!(
                "node=vigenere key={p} password: \"{p}\" api_token={p}, shift=3",
                p = REDACTION_PLACEHOLDER
            )
        );
    }

    #[test]
    fn test_redact_leaves_timestamps_and_empty_values() {
        let source = "2026-10-17T12:00:01Z trailing secret=";
        assert_eq!(redact(source), source);
    }

    #[test]
    fn test_redacting_writer_handles_split_writes() {
        let mut inner = Vec::new();
        {
            let mut writer = RedactingWriter::new(&mut inner);
            writer.write_all(b"secret=").expect("first half");
            writer.write_all(b"xyz fired\nnext").expect("second half");
        }

        let output = String::from_utf8(inner).expect("utf8 output");
        assert_eq!(output, format!("secret={REDACTION_PLACEHOLDER} fired\nnext"));
    }

    #[test]
    fn test_open_log_file_creates_log_dir() {
        let data_dir = tempdir().expect("tempdir");
        open_log_file(data_dir.path(), 0).expect("log file should open");
        assert!(log_dir(data_dir.path()).is_dir());
    }

    #[test]
    fn test_open_log_file_reports_unusable_data_dir() {
        let not_a_dir = NamedTempFile::new().expect("named temp file");
        let err = open_log_file(not_a_dir.path(), 3).expect_err("file is not a directory");
        assert!(err.to_string().starts_with("failed to create log directory"));
    }

    #[test]
    fn test_payload_text_handles_both_string_kinds() {
        let borrowed: Box<dyn Any + Send> = Box::new("static message");
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned message"));
        let other: Box<dyn Any + Send> = Box::new(7_u8);

        assert_eq!(payload_text(borrowed.as_ref()), "static message");
        assert_eq!(payload_text(owned.as_ref()), "owned message");
        assert_eq!(payload_text(other.as_ref()), "<non-string panic payload>");
    }
}
