use std::ffi::OsString;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use super::{CaptchaError, CaptchaRecognizer};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Recognizer backed by an external program (for example a wrapper around an
/// ONNX model). The image is written to the program's stdin and the answer is
/// read from its stdout. A program still running after `timeout` is killed.
#[derive(Debug, Clone)]
pub struct CommandRecognizer {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub timeout: Duration,
}

impl CommandRecognizer {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl CaptchaRecognizer for CommandRecognizer {
    fn name(&self) -> &'static str {
        "command"
    }

    fn recognize(&self, image: &[u8]) -> Result<String, CaptchaError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| {
                CaptchaError::Configuration(format!("{}: {err}", self.program.display()))
            })?;

        // Pipes are serviced off this thread so a child that stops reading or
        // writing cannot hold us past the deadline.
        let stdin = child.stdin.take();
        let image = image.to_vec();
        thread::spawn(move || {
            if let Some(mut stdin) = stdin {
                let _ = stdin.write_all(&image);
            }
        });
        let stdout = child.stdout.take();
        let stdout = thread::spawn(move || drain(stdout));
        let stderr = child.stderr.take();
        let stderr = thread::spawn(move || drain(stderr));

        let status = match wait_until(&mut child, self.timeout) {
            Ok(Some(status)) => status,
            Ok(None) => {
                log::warn!(
                    "{} still running after {:?}, killing it",
                    self.program.display(),
                    self.timeout
                );
                let _ = child.kill();
                let _ = child.wait();
                return Err(CaptchaError::Timeout(self.timeout));
            }
            Err(err) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(CaptchaError::Recognizer(err.to_string()));
            }
        };

        let stdout = join_pipe(stdout)?;
        let stderr = join_pipe(stderr)?;

        if !status.success() {
            let stderr = String::from_utf8_lossy(&stderr);
            return Err(CaptchaError::Recognizer(format!(
                "{} exited with {}: {}",
                self.program.display(),
                status,
                stderr.trim()
            )));
        }

        let text =
            String::from_utf8(stdout).map_err(|err| CaptchaError::Recognizer(err.to_string()))?;
        Ok(text.trim().to_string())
    }
}

fn wait_until(child: &mut Child, timeout: Duration) -> io::Result<Option<ExitStatus>> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL.min(deadline - now));
    }
}

fn drain<R: Read>(pipe: Option<R>) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        pipe.read_to_end(&mut buf)?;
    }
    Ok(buf)
}

fn join_pipe(handle: thread::JoinHandle<io::Result<Vec<u8>>>) -> Result<Vec<u8>, CaptchaError> {
    handle
        .join()
        .map_err(|_| CaptchaError::Recognizer("pipe reader panicked".into()))?
        .map_err(|err| CaptchaError::Recognizer(err.to_string()))
}
