//! Container engines and the shell commands used to drive them.

use std::fmt;
use std::io;
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::error::AppError;
use crate::model::ImageHandle;
use crate::pool::Interrupt;

/// Local container engine used to pull and execute images.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Engine {
    Docker,
    Singularity2,
    Singularity3,
}

impl Engine {
    /// Image file extension, `None` for engines that keep images in a daemon.
    pub fn extension(&self) -> Option<&'static str> {
        match self {
            Engine::Docker => None,
            Engine::Singularity3 => Some("sif"),
            Engine::Singularity2 => Some("simg"),
        }
    }

    /// Every extension a previously pulled image file may carry.
    pub const EXTENSIONS: [&'static str; 2] = ["sif", "simg"];

    pub fn is_daemon(&self) -> bool {
        matches!(self, Engine::Docker)
    }

    /// Shell command running `command` inside `image`.
    pub fn exec(&self, image: &ImageHandle, command: &str) -> String {
        match self {
            Engine::Docker => {
                format!("docker run --rm --entrypoint \"\" {} {command}", image.as_arg())
            }
            Engine::Singularity2 | Engine::Singularity3 => {
                format!("singularity exec {} {command}", image.as_arg())
            }
        }
    }

    /// Detects the engine to use, honouring an optional preference.
    pub fn detect(
        runner: &dyn CommandRunner,
        preference: Option<&str>,
    ) -> Result<Engine, AppError> {
        match preference.map(str::to_ascii_lowercase).as_deref() {
            None | Some("") => detect_docker(runner)
                .or_else(|| detect_singularity(runner))
                .ok_or(AppError::NoEngine),
            Some("docker") => {
                detect_docker(runner).ok_or_else(|| AppError::EngineNotFound("docker".to_string()))
            }
            Some("singularity") => detect_singularity(runner)
                .ok_or_else(|| AppError::EngineNotFound("singularity".to_string())),
            Some(other) => Err(AppError::UnknownEngine(other.to_string())),
        }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Engine::Docker => write!(f, "docker"),
            Engine::Singularity2 => write!(f, "singularity2"),
            Engine::Singularity3 => write!(f, "singularity3"),
        }
    }
}

fn detect_docker(runner: &dyn CommandRunner) -> Option<Engine> {
    if !runner.succeeds("command -v docker") {
        return None;
    }
    debug!("detected docker on the PATH");
    if runner.succeeds("docker info") {
        debug!("using docker for container management");
        return Some(Engine::Docker);
    }
    warn!("docker is installed but not usable; does it need to be started or run with sudo?");
    None
}

fn detect_singularity(runner: &dyn CommandRunner) -> Option<Engine> {
    if !runner.succeeds("singularity help") {
        debug!("did not detect singularity");
        return None;
    }
    let output = runner.run("singularity --version", &[]).ok()?;
    let engine = singularity_from_version(&output.stdout);
    if engine.is_none() {
        error!(version = %output.stdout.trim(), "unhandled singularity version");
    }
    engine
}

/// Parses `singularity version 3.3.0-1.fc29` or `2.6.0-dist`.
pub fn singularity_from_version(version: &str) -> Option<Engine> {
    let tokens: Vec<&str> = version.split_whitespace().collect();
    let number = if tokens.len() > 2 { tokens[2] } else { *tokens.first()? };
    match number.split('.').next()? {
        "2" => Some(Engine::Singularity2),
        "3" => Some(Engine::Singularity3),
        _ => None,
    }
}

#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Executes shell snippets on the host.
pub trait CommandRunner: Send + Sync {
    fn run(&self, script: &str, env: &[(String, String)]) -> io::Result<CommandOutput>;

    fn succeeds(&self, script: &str) -> bool {
        self.run(script, &[]).map(|output| output.success).unwrap_or(false)
    }
}

/// Runs snippets through `sh -c`.
pub struct ShellRunner;

impl CommandRunner for ShellRunner {
    fn run(&self, script: &str, env: &[(String, String)]) -> io::Result<CommandOutput> {
        debug!(script, "running");
        let output = Command::new("sh")
            .arg("-c")
            .arg(script)
            .envs(env.iter().map(|(key, value)| (key.as_str(), value.as_str())))
            .stdin(Stdio::null())
            .output()?;
        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Bounded retry with a fixed backoff between attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    /// Runs `script` until it succeeds. Returns the last output either way.
    pub fn run(
        &self,
        runner: &dyn CommandRunner,
        script: &str,
        env: &[(String, String)],
    ) -> CommandOutput {
        let attempts = self.attempts.max(1);
        let mut last = CommandOutput::default();
        for attempt in 1..=attempts {
            last = match runner.run(script, env) {
                Ok(output) => output,
                Err(err) => CommandOutput {
                    success: false,
                    stdout: String::new(),
                    stderr: err.to_string(),
                },
            };
            if last.success {
                break;
            }
            if Interrupt::requested() {
                debug!(attempt, script, "interrupted, not retrying");
                break;
            }
            if attempt < attempts {
                debug!(attempt, script, "command failed, retrying");
                thread::sleep(self.delay);
            }
        }
        last
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::sync::Mutex;

    struct Scripted {
        failures_left: Mutex<u32>,
        interrupt_on_failure: bool,
        calls: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn failing(times: u32) -> Self {
            Self {
                failures_left: Mutex::new(times),
                interrupt_on_failure: false,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    impl CommandRunner for Scripted {
        fn run(&self, script: &str, _env: &[(String, String)]) -> io::Result<CommandOutput> {
            self.calls.lock().unwrap().push(script.to_string());
            let mut failures = self.failures_left.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                if self.interrupt_on_failure {
                    Interrupt::raise();
                }
                return Ok(CommandOutput {
                    success: false,
                    stdout: String::new(),
                    stderr: "boom".into(),
                });
            }
            Ok(CommandOutput { success: true, ..Default::default() })
        }
    }

    #[test]
    fn parses_singularity_versions() {
        assert_eq!(
            singularity_from_version("singularity version 3.3.0-1.fc29\n"),
            Some(Engine::Singularity3)
        );
        assert_eq!(singularity_from_version("2.6.0-dist"), Some(Engine::Singularity2));
        assert_eq!(singularity_from_version("4.1.0"), None);
        assert_eq!(singularity_from_version(""), None);
    }

    #[test]
    #[serial]
    fn retry_recovers_from_transient_failures() {
        Interrupt::reset();
        let runner = Scripted::failing(2);
        let policy = RetryPolicy { attempts: 3, delay: Duration::from_millis(1) };
        assert!(policy.run(&runner, "singularity pull", &[]).success);
        assert_eq!(runner.calls(), 3);
    }

    #[test]
    #[serial]
    fn retry_gives_up_after_bounded_attempts() {
        Interrupt::reset();
        let runner = Scripted::failing(5);
        let policy = RetryPolicy { attempts: 2, delay: Duration::from_millis(1) };
        let output = policy.run(&runner, "singularity pull", &[]);
        assert!(!output.success);
        assert_eq!(output.stderr, "boom");
        assert_eq!(runner.calls(), 2);
    }

    #[test]
    #[serial]
    fn retry_stops_once_interrupted() {
        Interrupt::reset();
        let runner = Scripted { interrupt_on_failure: true, ..Scripted::failing(5) };
        let policy = RetryPolicy { attempts: 3, delay: Duration::from_secs(30) };
        let output = policy.run(&runner, "singularity pull", &[]);
        Interrupt::reset();
        assert!(!output.success);
        assert_eq!(runner.calls(), 1);
    }

    #[test]
    fn unknown_engine_preference_fails_fast() {
        let runner = Scripted::failing(0);
        let err = Engine::detect(&runner, Some("podman")).unwrap_err();
        assert!(matches!(err, AppError::UnknownEngine(name) if name == "podman"));
        assert_eq!(runner.calls(), 0);
    }

    #[test]
    fn only_file_engines_have_an_extension() {
        assert_eq!(Engine::Docker.extension(), None);
        assert_eq!(Engine::Singularity2.extension(), Some("simg"));
        assert_eq!(Engine::Singularity3.extension(), Some("sif"));
        assert!(Engine::EXTENSIONS.contains(&"simg"));
    }

    #[test]
    fn exec_wraps_command_for_each_engine() {
        let daemon = ImageHandle::Daemon("ubuntu:bionic".into());
        assert_eq!(
            Engine::Docker.exec(&daemon, "ls"),
            "docker run --rm --entrypoint \"\" ubuntu:bionic ls"
        );
        let file = ImageHandle::File("/img/bwa.sif".into());
        assert_eq!(Engine::Singularity3.exec(&file, "ls"), "singularity exec /img/bwa.sif ls");
    }
}
