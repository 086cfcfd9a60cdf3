//! HandBrake engine module
//!
//! Builds HandBrakeCLI scan and convert commands with a fixed MP4 template and
//! supervises the running child, exposing its interleaved output as a lazy
//! sequence of lines.

use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;

/// Fixed encoding parameters appended to every convert invocation.
pub const ENCODE_ARGS: &[&str] = &[
    "-e",
    "x264",
    "-q",
    "15",
    "-f",
    "mp4",
    "--pixel-aspect",
    "yuv420p",
    "-E",
    "aac",
    "-B",
    "200",
    "-R",
    "44.1",
    "--audio-fallback",
    "aac",
    "--comb-detect",
    "--deinterlace",
];

/// Error type for engine operations
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine executable could not be started at all
    #[error("Failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: io::Error,
    },

    /// IO error while talking to a running engine
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// One convertible sub-source of a work item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unit {
    /// 1-based title index on a DVD image.
    Title(u32),
    /// A discrete media file.
    File(PathBuf),
}

impl std::fmt::Display for Unit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Unit::Title(n) => write!(f, "title {}", n),
            Unit::File(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Exit status of one engine process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitExit {
    /// Numeric exit code; `None` when terminated by a signal.
    pub code: Option<i32>,
    /// The process was killed after producing no output for the stall window.
    pub stalled: bool,
}

impl UnitExit {
    /// Exit code 0 is the only success.
    pub fn success(&self) -> bool {
        self.code == Some(0) && !self.stalled
    }

    fn from_status(status: ExitStatus, stalled: bool) -> Self {
        Self {
            code: status.code(),
            stalled,
        }
    }
}

/// A running conversion: yields output lines as they are produced, then an exit status.
pub trait UnitProcess: Iterator<Item = String> + Send {
    /// Drain any unread output, wait for the process and return its exit status.
    fn finish(self: Box<Self>) -> Result<UnitExit, EngineError>;
}

/// The external transcoding engine, as seen by the item driver.
pub trait Engine: Send + Sync {
    /// Run a scan of `source` and return its diagnostic (stderr) text.
    fn scan(&self, source: &Path) -> Result<String, EngineError>;

    /// Start converting one unit of the item at `item_path` into `output`.
    fn convert(
        &self,
        item_path: &Path,
        unit: &Unit,
        output: &Path,
    ) -> Result<Box<dyn UnitProcess>, EngineError>;
}

/// Build a HandBrakeCLI title scan command.
pub fn build_scan_command(program: &str, source: &Path) -> Command {
    let mut cmd = Command::new(program);
    cmd.arg("-i").arg(source);
    cmd.arg("--scan");
    cmd
}

/// Build a HandBrakeCLI convert command for one unit.
///
/// Titles select `-t <n>` on the item directory; files are passed directly as input.
pub fn build_convert_command(
    program: &str,
    item_path: &Path,
    unit: &Unit,
    output: &Path,
) -> Command {
    let mut cmd = Command::new(program);

    match unit {
        Unit::Title(n) => {
            cmd.arg("-i").arg(item_path);
            cmd.arg("-t").arg(n.to_string());
        }
        Unit::File(path) => {
            cmd.arg("-i").arg(path);
        }
    }

    cmd.arg("-o").arg(output);
    cmd.args(ENCODE_ARGS);
    cmd
}

/// HandBrakeCLI engine.
#[derive(Debug, Clone)]
pub struct HandBrake {
    program: String,
    stall_timeout: Option<Duration>,
}

impl HandBrake {
    /// `stall_timeout` of `None` waits on a silent process forever.
    pub fn new(program: impl Into<String>, stall_timeout: Option<Duration>) -> Self {
        Self {
            program: program.into(),
            stall_timeout,
        }
    }

    fn launch_error(&self, source: io::Error) -> EngineError {
        EngineError::Launch {
            program: self.program.clone(),
            source,
        }
    }
}

impl Engine for HandBrake {
    fn scan(&self, source: &Path) -> Result<String, EngineError> {
        let output = build_scan_command(&self.program, source)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| self.launch_error(e))?;

        // The scan's exit status carries no information the title line does not.
        Ok(String::from_utf8_lossy(&output.stderr).into_owned())
    }

    fn convert(
        &self,
        item_path: &Path,
        unit: &Unit,
        output: &Path,
    ) -> Result<Box<dyn UnitProcess>, EngineError> {
        let mut cmd = build_convert_command(&self.program, item_path, unit, output);
        cmd.stdin(Stdio::null());
        let run = EngineRun::spawn(cmd, self.stall_timeout).map_err(|e| self.launch_error(e))?;
        Ok(Box::new(run))
    }
}

/// A supervised child process.
///
/// stdout and stderr are each drained by a reader thread into one channel, so
/// the child can never block on a full pipe no matter how slowly lines are
/// consumed. Lines end at `\n` or `\r`.
pub struct EngineRun {
    child: Child,
    lines: Receiver<String>,
    readers: Vec<JoinHandle<()>>,
    stall_timeout: Option<Duration>,
    stalled: bool,
    reaped: bool,
}

impl EngineRun {
    /// Spawn `cmd` with piped output. An error here means the process never started.
    pub fn spawn(mut cmd: Command, stall_timeout: Option<Duration>) -> io::Result<Self> {
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        let mut child = cmd.spawn()?;

        let (tx, rx) = mpsc::channel();
        let mut readers = Vec::with_capacity(2);

        if let Some(stdout) = child.stdout.take() {
            let tx = tx.clone();
            readers.push(thread::spawn(move || forward_lines(stdout, tx)));
        }
        if let Some(stderr) = child.stderr.take() {
            let tx = tx.clone();
            readers.push(thread::spawn(move || forward_lines(stderr, tx)));
        }
        drop(tx);

        Ok(Self {
            child,
            lines: rx,
            readers,
            stall_timeout,
            stalled: false,
            reaped: false,
        })
    }

    /// Wait for both streams to close, then for the process itself.
    pub fn wait(mut self) -> Result<UnitExit, EngineError> {
        while self.next().is_some() {}

        for reader in self.readers.drain(..) {
            if reader.join().is_err() {
                tracing::warn!(pid = self.child.id(), "Output reader thread panicked");
            }
        }

        let status = self.child.wait()?;
        self.reaped = true;
        Ok(UnitExit::from_status(status, self.stalled))
    }

    fn kill_stalled(&mut self) {
        self.stalled = true;
        tracing::warn!(
            pid = self.child.id(),
            timeout_secs = self.stall_timeout.map(|d| d.as_secs()).unwrap_or(0),
            "Engine produced no output within the stall window, killing it"
        );
        if let Err(e) = self.child.kill() {
            tracing::warn!(pid = self.child.id(), error = %e, "Failed to kill stalled engine");
        }
    }
}

impl Iterator for EngineRun {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        match self.stall_timeout {
            Some(timeout) if !self.stalled => match self.lines.recv_timeout(timeout) {
                Ok(line) => Some(line),
                Err(RecvTimeoutError::Timeout) => {
                    self.kill_stalled();
                    // Killing closes the pipes; keep draining what is left.
                    self.lines.recv().ok()
                }
                Err(RecvTimeoutError::Disconnected) => None,
            },
            _ => self.lines.recv().ok(),
        }
    }
}

impl Drop for EngineRun {
    // A run abandoned before `wait` (an unwinding driver) must not leave the
    // engine running alongside the next unit.
    fn drop(&mut self) {
        if self.reaped {
            return;
        }
        if let Ok(None) = self.child.try_wait() {
            tracing::warn!(pid = self.child.id(), "Killing abandoned engine process");
            let _ = self.child.kill();
        }
        let _ = self.child.wait();
    }
}

impl UnitProcess for EngineRun {
    fn finish(self: Box<Self>) -> Result<UnitExit, EngineError> {
        (*self).wait()
    }
}

fn forward_lines<R: Read>(stream: R, tx: mpsc::Sender<String>) {
    let mut lines = SplitLines::new(BufReader::new(stream));
    while let Some(line) = lines.next_line() {
        match line {
            Ok(line) => {
                // Receiver gone means nobody cares; keep reading so the pipe drains.
                let _ = tx.send(line);
            }
            Err(e) => {
                tracing::debug!(error = %e, "Engine output stream closed with error");
                break;
            }
        }
    }
}

/// Splits a byte stream into lines on either `\n` or `\r`, dropping empty lines.
pub struct SplitLines<R> {
    reader: R,
    pending: Vec<u8>,
}

impl<R: BufRead> SplitLines<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            pending: Vec::new(),
        }
    }

    /// Next non-empty line, lossily decoded as UTF-8.
    pub fn next_line(&mut self) -> Option<io::Result<String>> {
        loop {
            let buf = match self.reader.fill_buf() {
                Ok(buf) => buf,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Some(Err(e)),
            };

            if buf.is_empty() {
                if self.pending.is_empty() {
                    return None;
                }
                return Some(Ok(self.take_pending()));
            }

            match buf.iter().position(|&b| b == b'\n' || b == b'\r') {
                Some(pos) => {
                    self.pending.extend_from_slice(&buf[..pos]);
                    self.reader.consume(pos + 1);
                    if !self.pending.is_empty() {
                        return Some(Ok(self.take_pending()));
                    }
                }
                None => {
                    let len = buf.len();
                    self.pending.extend_from_slice(buf);
                    self.reader.consume(len);
                }
            }
        }
    }

    fn take_pending(&mut self) -> String {
        let line = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Cursor;

    fn get_command_args(cmd: &Command) -> Vec<String> {
        cmd.get_args()
            .filter_map(|arg| arg.to_str().map(String::from))
            .collect()
    }

    fn has_flag_with_value(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|pair| pair[0] == flag && pair[1] == value)
    }

    fn split_all(input: &[u8]) -> Vec<String> {
        let mut lines = SplitLines::new(Cursor::new(input.to_vec()));
        let mut out = Vec::new();
        while let Some(line) = lines.next_line() {
            out.push(line.unwrap());
        }
        out
    }

    #[test]
    fn test_scan_command() {
        let cmd = build_scan_command("HandBrakeCLI", Path::new("/dvds/MOVIE"));
        assert_eq!(cmd.get_program(), "HandBrakeCLI");
        assert_eq!(get_command_args(&cmd), vec!["-i", "/dvds/MOVIE", "--scan"]);
    }

    #[test]
    fn test_convert_command_for_title() {
        let cmd = build_convert_command(
            "HandBrakeCLI",
            Path::new("/dvds/MOVIE"),
            &Unit::Title(3),
            Path::new("/dvds/MOVIE/MOVIE-Title_3.mp4"),
        );
        let args = get_command_args(&cmd);

        assert_eq!(
            &args[..6],
            &["-i", "/dvds/MOVIE", "-t", "3", "-o", "/dvds/MOVIE/MOVIE-Title_3.mp4"]
        );
        assert_eq!(&args[6..], ENCODE_ARGS);
    }

    #[test]
    fn test_convert_command_for_file_has_no_title_selector() {
        let cmd = build_convert_command(
            "HandBrakeCLI",
            Path::new("/videos/TAPE_01"),
            &Unit::File(PathBuf::from("/videos/TAPE_01/part1.mpg")),
            Path::new("/videos/TAPE_01/TAPE_01.mp4"),
        );
        let args = get_command_args(&cmd);

        assert!(has_flag_with_value(&args, "-i", "/videos/TAPE_01/part1.mpg"));
        assert!(has_flag_with_value(&args, "-o", "/videos/TAPE_01/TAPE_01.mp4"));
        assert!(!args.iter().any(|a| a == "-t"));
    }

    // For any input and output path, the convert command carries the selector,
    // the output path and the complete fixed template.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_convert_command_completeness(
            item in "/[a-zA-Z0-9_]{1,20}",
            title in 1u32..100,
            output in "/[a-zA-Z0-9_/.-]{1,40}",
        ) {
            let cmd = build_convert_command(
                "HandBrakeCLI",
                Path::new(&item),
                &Unit::Title(title),
                Path::new(&output),
            );
            let args = get_command_args(&cmd);

            prop_assert!(has_flag_with_value(&args, "-i", &item));
            prop_assert!(has_flag_with_value(&args, "-t", &title.to_string()));
            prop_assert!(has_flag_with_value(&args, "-o", &output));
            prop_assert!(has_flag_with_value(&args, "-e", "x264"));
            prop_assert!(has_flag_with_value(&args, "-f", "mp4"));
            prop_assert!(has_flag_with_value(&args, "-E", "aac"));
            prop_assert!(has_flag_with_value(&args, "-R", "44.1"));
            prop_assert!(args.iter().any(|a| a == "--deinterlace"));
        }
    }

    #[test]
    fn test_split_lines_on_newline_and_carriage_return() {
        let input =
            b"scan start\nEncoding: task 1 of 1, 1.00 %\rEncoding: task 1 of 1, 2.00 %\r\ndone";
        assert_eq!(
            split_all(input),
            vec![
                "scan start",
                "Encoding: task 1 of 1, 1.00 %",
                "Encoding: task 1 of 1, 2.00 %",
                "done",
            ]
        );
    }

    #[test]
    fn test_split_lines_empty_input() {
        assert!(split_all(b"").is_empty());
        assert!(split_all(b"\n\r\n").is_empty());
    }

    #[test]
    fn test_split_lines_lossy_utf8() {
        let lines = split_all(b"bad \xff byte\n");
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("bad "));
    }

    #[test]
    fn test_unit_exit_success() {
        assert!(UnitExit { code: Some(0), stalled: false }.success());
        assert!(!UnitExit { code: Some(1), stalled: false }.success());
        assert!(!UnitExit { code: None, stalled: false }.success());
        assert!(!UnitExit { code: Some(0), stalled: true }.success());
    }

    #[test]
    fn test_missing_executable_is_launch_error() {
        let engine = HandBrake::new("mp4-batch-no-such-engine-xyz", None);
        let err = engine.scan(Path::new("/tmp")).unwrap_err();
        assert!(matches!(err, EngineError::Launch { .. }));

        let err = engine
            .convert(Path::new("/tmp"), &Unit::Title(1), Path::new("/tmp/out.mp4"))
            .err()
            .expect("convert should fail to launch");
        assert!(matches!(err, EngineError::Launch { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_engine_run_streams_both_pipes_then_exit_status() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(concat!(
            "echo 'Encoding: task 1 of 1, 10.00 %'; ",
            "echo 'libdvdread: CHECK_VALUE failed' 1>&2; exit 3"
        ));
        let mut run = EngineRun::spawn(cmd, None).unwrap();

        let mut lines: Vec<String> = run.by_ref().collect();
        lines.sort();
        assert_eq!(
            lines,
            vec!["Encoding: task 1 of 1, 10.00 %", "libdvdread: CHECK_VALUE failed"]
        );

        let exit = run.wait().unwrap();
        assert_eq!(exit.code, Some(3));
        assert!(!exit.success());
    }

    #[cfg(unix)]
    #[test]
    fn test_engine_run_drains_large_unread_output() {
        // Far more than a pipe buffer on both streams; wait() must not deadlock.
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(concat!(
            "i=0; while [ $i -lt 20000 ]; ",
            "do echo line-$i; echo err-$i 1>&2; i=$((i+1)); done"
        ));
        let run = EngineRun::spawn(cmd, None).unwrap();

        let exit = run.wait().unwrap();
        assert_eq!(exit.code, Some(0));
    }

    #[cfg(unix)]
    #[test]
    fn test_engine_run_kills_stalled_process() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo started; exec sleep 30");
        let mut run = EngineRun::spawn(cmd, Some(Duration::from_millis(300))).unwrap();

        assert_eq!(run.next().as_deref(), Some("started"));
        let exit = run.wait().unwrap();
        assert!(exit.stalled);
        assert!(!exit.success());
    }

    #[cfg(unix)]
    #[test]
    fn test_dropping_unfinished_run_kills_engine() {
        let temp = tempfile::TempDir::new().unwrap();
        let marker = temp.path().join("still-running");
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(format!("echo started; sleep 1; touch '{}'", marker.display()));
        let mut run = EngineRun::spawn(cmd, None).unwrap();
        assert_eq!(run.next().as_deref(), Some("started"));

        drop(run);
        std::thread::sleep(Duration::from_millis(1500));

        assert!(!marker.exists());
    }
}
