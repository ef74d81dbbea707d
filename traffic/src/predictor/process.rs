//! Query an out-of-process predictor.
//!
//! Each query spawns `program` once with a structured argument list:
//!
//! ```txt
//! <args...> <W> [<mean> <stdev> <latency> <0>{padding}]{W}
//! ```
//!
//! The child writes its scalar answer to a well-known result file in its working
//! directory. The file is removed before the child is spawned (so a stale answer is
//! never read) and after it has been read.

use super::{parse, Error, Predictor, Sample};
use std::{
    fs, io,
    path::PathBuf,
    process::{Command, Stdio},
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, warn};

/// Default name of the result file.
pub const DEFAULT_RESULT: &str = "pythonResult.txt";

/// How often the child is polled for completion.
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Configuration for a [Process] predictor.
#[derive(Clone, Debug)]
pub struct Config {
    /// Program to execute.
    pub program: PathBuf,

    /// Arguments passed before the history (e.g. the path of a script).
    pub args: Vec<String>,

    /// Working directory of the child (and location of the result file).
    ///
    /// Defaults to the current directory of the caller.
    pub working_dir: Option<PathBuf>,

    /// Name of the file the child writes its answer to.
    pub result: PathBuf,

    /// Maximum time to wait for the child before killing it.
    pub timeout: Duration,

    /// Number of reserved zero values appended after each history slot.
    pub padding: usize,
}

impl Config {
    /// Create a configuration for `program` with default settings.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            result: PathBuf::from(DEFAULT_RESULT),
            timeout: Duration::from_secs(5),
            padding: 4,
        }
    }
}

/// A [Predictor] backed by a one-shot child process.
pub struct Process {
    cfg: Config,
}

impl Process {
    pub fn new(cfg: Config) -> Self {
        Self { cfg }
    }

    fn result_path(&self) -> PathBuf {
        match &self.cfg.working_dir {
            Some(dir) => dir.join(&self.cfg.result),
            None => self.cfg.result.clone(),
        }
    }

    /// Build the argument list for a query over `history`.
    pub fn arguments(&self, history: &[Sample]) -> Vec<String> {
        let mut args = self.cfg.args.clone();
        args.reserve(1 + history.len() * (3 + self.cfg.padding));
        args.push(history.len().to_string());
        for sample in history {
            args.push(format!("{:.6}", sample.mean));
            args.push(format!("{:.6}", sample.stdev));
            args.push(format!("{:.6}", sample.latency));
            args.extend((0..self.cfg.padding).map(|_| "0".to_string()));
        }
        args
    }

    fn run(&self, history: &[Sample]) -> Result<(), Error> {
        let mut command = Command::new(&self.cfg.program);
        command
            .args(self.arguments(history))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Some(dir) = &self.cfg.working_dir {
            command.current_dir(dir);
        }
        let mut child = command.spawn().map_err(Error::Spawn)?;

        let deadline = Instant::now() + self.cfg.timeout;
        loop {
            let status = match child.try_wait() {
                Ok(status) => status,
                Err(err) => {
                    if let Err(err) = child.kill() {
                        warn!(?err, "failed to kill predictor");
                    }
                    return Err(Error::Wait(err));
                }
            };
            match status {
                Some(status) if status.success() => return Ok(()),
                Some(status) => return Err(Error::Exited(status)),
                None if Instant::now() >= deadline => {
                    if let Err(err) = child.kill() {
                        warn!(?err, "failed to kill predictor");
                    }
                    let _ = child.wait();
                    return Err(Error::Timeout(self.cfg.timeout));
                }
                None => thread::sleep(POLL_INTERVAL),
            }
        }
    }
}

impl Predictor for Process {
    fn predict(&mut self, history: &[Sample]) -> Result<f64, Error> {
        let path = self.result_path();
        match fs::remove_file(&path) {
            Ok(()) => debug!(?path, "removed stale predictor result"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(Error::MissingResult(err)),
        }

        self.run(history)?;

        let content = fs::read_to_string(&path).map_err(Error::MissingResult)?;
        if let Err(err) = fs::remove_file(&path) {
            warn!(?path, ?err, "failed to remove predictor result");
        }
        parse(&content)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn shell(dir: &TempDir, script: &str) -> Process {
        let mut cfg = Config::new("sh");
        cfg.args = vec!["-c".into(), script.into(), "sh".into()];
        cfg.working_dir = Some(dir.path().to_path_buf());
        cfg.timeout = Duration::from_secs(2);
        Process::new(cfg)
    }

    fn history() -> Vec<Sample> {
        vec![
            Sample {
                mean: 0.1,
                stdev: 0.0,
                latency: 0.1,
            },
            Sample {
                mean: 0.11,
                stdev: 0.01,
                latency: 0.12,
            },
        ]
    }

    #[test]
    fn test_arguments() {
        let mut cfg = Config::new("predict");
        cfg.args = vec!["model.py".into()];
        cfg.padding = 2;
        let predictor = Process::new(cfg);
        assert_eq!(
            predictor.arguments(&history()),
            vec![
                "model.py", "2", "0.100000", "0.000000", "0.100000", "0", "0", "0.110000",
                "0.010000", "0.120000", "0", "0",
            ]
        );
    }

    #[test]
    fn test_predict() {
        let dir = TempDir::new().unwrap();
        let mut predictor = shell(&dir, "echo 0.75 > pythonResult.txt");
        assert_eq!(predictor.predict(&history()).unwrap(), 0.75);

        // Result is consumed
        assert!(!dir.path().join(DEFAULT_RESULT).exists());
    }

    #[test]
    fn test_receives_history() {
        let dir = TempDir::new().unwrap();

        // $1 is the window size, $2 the first mean
        let mut predictor = shell(&dir, "echo \"$2\" > pythonResult.txt");
        assert_eq!(predictor.predict(&history()).unwrap(), 0.1);
    }

    #[test]
    fn test_stale_result_ignored() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(DEFAULT_RESULT), "0.9\n").unwrap();
        let mut predictor = shell(&dir, "true");
        assert!(matches!(
            predictor.predict(&history()),
            Err(Error::MissingResult(_))
        ));
    }

    #[test]
    fn test_malformed() {
        let dir = TempDir::new().unwrap();
        let mut predictor = shell(&dir, "echo oops > pythonResult.txt");
        assert!(predictor.predict(&history()).unwrap_err().is_malformed());
    }

    #[test]
    fn test_exit_failure() {
        let dir = TempDir::new().unwrap();
        let mut predictor = shell(&dir, "echo 0.5 > pythonResult.txt; exit 3");
        assert!(matches!(
            predictor.predict(&history()),
            Err(Error::Exited(_))
        ));
    }

    #[test]
    fn test_timeout() {
        let dir = TempDir::new().unwrap();
        let mut predictor = shell(&dir, "sleep 5");
        predictor.cfg.timeout = Duration::from_millis(50);
        assert!(matches!(
            predictor.predict(&history()),
            Err(Error::Timeout(_))
        ));
    }

    #[test]
    fn test_missing_program() {
        let dir = TempDir::new().unwrap();
        let mut cfg = Config::new("/nonexistent/predictor");
        cfg.working_dir = Some(dir.path().to_path_buf());
        let mut predictor = Process::new(cfg);
        assert!(matches!(
            predictor.predict(&history()),
            Err(Error::Spawn(_))
        ));
    }
}
