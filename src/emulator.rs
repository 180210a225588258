use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const SUPERVISOR_POLL: Duration = Duration::from_millis(50);

/// Shared stop flag observed by long-running tasks.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// Clear a previous request so the token can be reused
    pub fn reset(&self) {
        self.0.store(false, Ordering::Relaxed);
    }
}

/// Non-blocking "is the emulator still up" query used by the play loop.
pub trait Liveness {
    fn is_running(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    Normal,
    Failed(Option<i32>),
    /// Terminated through the cancel token
    Killed,
}

/// Launch parameters for the emulator.
#[derive(Debug, Clone)]
pub struct EmulatorConfig {
    pub executable: PathBuf,
    pub rom: PathBuf,
    /// Lua script that opens the command listener inside the emulator
    pub script: PathBuf,
    pub scale: u32,
}

impl EmulatorConfig {
    /// Fixed argument template the listener script expects
    pub fn args(&self) -> Result<Vec<String>> {
        let script = std::path::absolute(&self.script).with_context(|| {
            format!("Failed to resolve script path: {}", self.script.display())
        })?;
        let scale = self.scale.to_string();
        Ok(vec![
            "--nogui".to_string(),
            self.rom.to_string_lossy().into_owned(),
            "--xscale".to_string(),
            scale.clone(),
            "--yscale".to_string(),
            scale,
            "--loadlua".to_string(),
            script.to_string_lossy().into_owned(),
        ])
    }
}

/// Emulator child process owned by a supervisor thread.
pub struct EmulatorProcess {
    handle: Option<JoinHandle<ExitOutcome>>,
    outcome: Option<ExitOutcome>,
    cancel: CancelToken,
}

impl EmulatorProcess {
    pub fn start(config: &EmulatorConfig) -> Result<Self> {
        let args = config.args()?;
        Self::spawn(&config.executable, &args)
    }

    /// Spawn `program` with `args`, discarding its standard streams
    pub fn spawn(program: &Path, args: &[String]) -> Result<Self> {
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("Failed to launch emulator: {}", program.display()))?;
        tracing::info!(pid = child.id(), program = %program.display(), "emulator started");

        let cancel = CancelToken::new();
        let token = cancel.clone();
        let handle = thread::Builder::new()
            .name("emulator".to_string())
            .spawn(move || supervise(child, token))
            .context("Failed to spawn emulator supervisor thread")?;

        Ok(Self {
            handle: Some(handle),
            outcome: None,
            cancel,
        })
    }

    /// Non-blocking liveness check
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Ask the supervisor to kill the child
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Block until the child has exited. Later calls return the same outcome.
    pub fn join(&mut self) -> ExitOutcome {
        if let Some(handle) = self.handle.take() {
            let outcome = handle.join().unwrap_or_else(|_| {
                tracing::warn!("emulator supervisor panicked");
                ExitOutcome::Failed(None)
            });
            self.outcome = Some(outcome);
        }
        self.outcome.unwrap_or(ExitOutcome::Failed(None))
    }
}

impl Liveness for EmulatorProcess {
    fn is_running(&self) -> bool {
        EmulatorProcess::is_running(self)
    }
}

impl Drop for EmulatorProcess {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.cancel();
            self.join();
        }
    }
}

fn supervise(mut child: Child, cancel: CancelToken) -> ExitOutcome {
    let outcome = loop {
        if cancel.is_cancelled() {
            let _ = child.kill();
            let _ = child.wait();
            break ExitOutcome::Killed;
        }
        match child.try_wait() {
            Ok(Some(status)) if status.success() => break ExitOutcome::Normal,
            Ok(Some(status)) => break ExitOutcome::Failed(status.code()),
            Ok(None) => thread::sleep(SUPERVISOR_POLL),
            Err(err) => {
                tracing::warn!(error = %err, "failed to poll emulator process");
                break ExitOutcome::Failed(None);
            }
        }
    };
    match outcome {
        ExitOutcome::Normal => tracing::info!("emulator exited normally"),
        ExitOutcome::Failed(code) => tracing::warn!(?code, "emulator exited with an error"),
        ExitOutcome::Killed => tracing::info!("emulator stopped"),
    }
    outcome
}
