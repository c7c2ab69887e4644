//! Capture process supervision.
//!
//! `ProcessSupervisor` owns the external capture process for its whole life:
//!
//! ```text
//! STOPPED -> STARTING -> RUNNING -> STOPPING -> STOPPED
//! ```
//!
//! The process runs in its own process group so a stop reaches every helper
//! it forks. Stopping sends SIGTERM to the group, waits up to the grace
//! period, then sends SIGKILL. Killing the process closes its stdout, which is
//! what unblocks a worker parked in a read; no other cancellation exists.
//!
//! Worker threads are handed a shared run flag. It is cleared on stop, and a
//! worker that loses its stream clears it too, so `is_running()` turns false
//! on any outage.

use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::process::{Child, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::config::CaptureSettings;
use crate::error::CaptureError;
use crate::lock_unpoisoned;

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Program and argument list used to launch the capture process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CaptureCommand {
    program: String,
    args: Vec<String>,
}

impl CaptureCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// `rpicam-vid` streaming MJPEG to stdout and per-frame metadata to the
    /// side file, running until stopped.
    pub fn rpicam(settings: &CaptureSettings) -> Self {
        let mut command = Self::new(settings.program.clone());
        if let Some(post_process) = &settings.post_process_file {
            command = command
                .arg("--post-process-file")
                .arg(post_process.display().to_string());
        }
        command
            .arg("--width")
            .arg(settings.width.to_string())
            .arg("--height")
            .arg(settings.height.to_string())
            .arg("--framerate")
            .arg(settings.framerate.to_string())
            .arg("--nopreview")
            .args(["--codec", "mjpeg"])
            .arg("--metadata")
            .arg(settings.metadata_path.display().to_string())
            .args(["--metadata-format", "json"])
            .args(["-t", "0"])
            .args(["-o", "-"])
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arg_list(&self) -> &[String] {
        &self.args
    }

    /// Command line for logs.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        cmd
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SupervisorPhase {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Lifecycle owner for the capture process and its worker threads.
pub struct ProcessSupervisor {
    command: CaptureCommand,
    grace: Duration,
    /// Serializes start/stop. Never taken by `is_running()` or `phase()`.
    lifecycle: Mutex<()>,
    phase: Mutex<SupervisorPhase>,
    running: Arc<AtomicBool>,
    child: Mutex<Option<Child>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    scratch_files: Vec<PathBuf>,
}

impl ProcessSupervisor {
    pub fn new(command: CaptureCommand, grace: Duration) -> Self {
        Self {
            command,
            grace,
            lifecycle: Mutex::new(()),
            phase: Mutex::new(SupervisorPhase::Stopped),
            running: Arc::new(AtomicBool::new(false)),
            child: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
            scratch_files: Vec::new(),
        }
    }

    /// Register a file the process writes that must not outlive a run.
    /// It is removed before every start and after every stop.
    pub fn with_scratch_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.scratch_files.push(path.into());
        self
    }

    pub fn command(&self) -> &CaptureCommand {
        &self.command
    }

    pub fn phase(&self) -> SupervisorPhase {
        *lock_unpoisoned(&self.phase)
    }

    /// Spawn the process and hand its stdout to `launch`, which starts the
    /// worker threads. No-op while already running.
    ///
    /// Spawn failures are returned as-is; nothing is retried here.
    pub fn start<F>(&self, launch: F) -> Result<(), CaptureError>
    where
        F: FnOnce(ChildStdout, Arc<AtomicBool>) -> Result<Vec<JoinHandle<()>>, CaptureError>,
    {
        let _lifecycle = lock_unpoisoned(&self.lifecycle);
        if self.is_running() {
            log::info!("capture process already running");
            return Ok(());
        }
        if self.phase() != SupervisorPhase::Stopped {
            log::warn!("capture process exited out-of-band; cleaning up before restart");
            self.shutdown();
        }

        self.set_phase(SupervisorPhase::Starting);
        self.remove_scratch_files();

        log::info!("starting capture: {}", self.command.display());
        let mut child = match self.command.to_command().spawn() {
            Ok(child) => child,
            Err(source) => {
                self.set_phase(SupervisorPhase::Stopped);
                return Err(CaptureError::Spawn {
                    program: self.command.program.clone(),
                    source,
                });
            }
        };
        let pid = child.id();

        let Some(stdout) = child.stdout.take() else {
            terminate(child, Duration::ZERO);
            self.set_phase(SupervisorPhase::Stopped);
            return Err(CaptureError::MissingStdout);
        };
        let stderr = child.stderr.take();

        self.running.store(true, Ordering::SeqCst);
        *lock_unpoisoned(&self.child) = Some(child);

        let mut handles = Vec::new();
        if let Some(stderr) = stderr {
            let drain = std::thread::Builder::new()
                .name("capture-stderr".to_string())
                .spawn(move || {
                    for line in BufReader::new(stderr).lines() {
                        match line {
                            Ok(line) => log::debug!("capture: {}", line),
                            Err(_) => break,
                        }
                    }
                });
            match drain {
                Ok(handle) => handles.push(handle),
                Err(err) => log::warn!("capture stderr will not be drained: {}", err),
            }
        }

        match launch(stdout, Arc::clone(&self.running)) {
            Ok(workers) => handles.extend(workers),
            Err(err) => {
                *lock_unpoisoned(&self.workers) = handles;
                self.shutdown();
                return Err(err);
            }
        }

        *lock_unpoisoned(&self.workers) = handles;
        self.set_phase(SupervisorPhase::Running);
        log::info!("capture process started (pid {})", pid);
        Ok(())
    }

    /// Stop the process (SIGTERM, then SIGKILL after the grace period), join
    /// the workers and remove scratch files. Safe to call when stopped.
    pub fn stop(&self) {
        let _lifecycle = lock_unpoisoned(&self.lifecycle);
        self.shutdown();
    }

    /// True while the run flag is set and the process has not exited.
    ///
    /// A process that died out-of-band is reaped here and reported as not
    /// running even though `stop()` was never called.
    pub fn is_running(&self) -> bool {
        if !self.running.load(Ordering::SeqCst) {
            return false;
        }
        let mut slot = lock_unpoisoned(&self.child);
        let Some(child) = slot.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                log::warn!("capture process exited unexpectedly: {}", status);
                self.running.store(false, Ordering::SeqCst);
                false
            }
            Err(err) => {
                log::warn!("capture process status unavailable: {}", err);
                false
            }
        }
    }

    /// OS process id of the live capture process.
    pub fn pid(&self) -> Option<u32> {
        lock_unpoisoned(&self.child).as_ref().map(Child::id)
    }

    fn shutdown(&self) {
        let child = lock_unpoisoned(&self.child).take();
        let workers = std::mem::take(&mut *lock_unpoisoned(&self.workers));
        if child.is_none() && workers.is_empty() && self.phase() == SupervisorPhase::Stopped {
            return;
        }

        log::info!("stopping capture process");
        self.running.store(false, Ordering::SeqCst);
        self.set_phase(SupervisorPhase::Stopping);

        if let Some(child) = child {
            terminate(child, self.grace);
        }
        for worker in workers {
            let name = worker.thread().name().unwrap_or("worker").to_string();
            if worker.join().is_err() {
                log::error!("{} thread panicked", name);
            }
        }

        self.remove_scratch_files();
        self.set_phase(SupervisorPhase::Stopped);
        log::info!("capture process stopped");
    }

    fn set_phase(&self, phase: SupervisorPhase) {
        *lock_unpoisoned(&self.phase) = phase;
    }

    fn remove_scratch_files(&self) {
        for path in &self.scratch_files {
            match std::fs::remove_file(path) {
                Ok(()) => log::debug!("removed {}", path.display()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => log::warn!("failed to remove {}: {}", path.display(), err),
            }
        }
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Terminate a child and its process group, escalating to SIGKILL after
/// `grace`. Always reaps the child.
///
/// The group is signalled even when the leader has already exited: a helper
/// it forked can still hold the output pipes the workers are reading.
pub(crate) fn terminate(mut child: Child, grace: Duration) -> Option<ExitStatus> {
    let mut status = poll_exit(&mut child);
    if let Some(status) = status {
        if !group_alive(&child) {
            log::info!("capture process already exited: {}", status);
            return Some(status);
        }
        log::info!(
            "capture process exited ({}) but its process group is still alive",
            status
        );
    }

    signal_group(&mut child, Signal::Terminate);
    let deadline = Instant::now() + grace;
    loop {
        status = status.or_else(|| poll_exit(&mut child));
        if status.is_some() && !group_alive(&child) {
            if let Some(status) = status {
                log::info!("capture process exited: {}", status);
            }
            return status;
        }
        if Instant::now() >= deadline {
            break;
        }
        std::thread::sleep(EXIT_POLL_INTERVAL);
    }

    log::warn!(
        "capture process group did not exit within {}ms, killing",
        grace.as_millis()
    );
    signal_group(&mut child, Signal::Kill);
    if status.is_some() {
        return status;
    }
    match child.wait() {
        Ok(status) => {
            log::info!("capture process killed: {}", status);
            Some(status)
        }
        Err(err) => {
            log::error!("failed to reap capture process: {}", err);
            None
        }
    }
}

fn poll_exit(child: &mut Child) -> Option<ExitStatus> {
    match child.try_wait() {
        Ok(status) => status,
        Err(err) => {
            log::warn!("capture process status unavailable: {}", err);
            None
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum Signal {
    Terminate,
    Kill,
}

#[cfg(target_os = "linux")]
fn signal_group(child: &mut Child, signal: Signal) {
    let signo = match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // The child leads its own process group (process_group(0) at spawn).
    let pgid = child.id() as libc::pid_t;
    // SAFETY: killpg only sends a signal; pgid names a group we created.
    let rc = unsafe { libc::killpg(pgid, signo) };
    if rc != 0 {
        log::debug!(
            "killpg({}, {:?}) failed: {}",
            pgid,
            signal,
            std::io::Error::last_os_error()
        );
        if matches!(signal, Signal::Kill) {
            let _ = child.kill();
        }
    }
}

/// True while any member of the child's process group exists.
#[cfg(target_os = "linux")]
fn group_alive(child: &Child) -> bool {
    let pgid = child.id() as libc::pid_t;
    // SAFETY: signal 0 performs the permission and existence check only.
    if unsafe { libc::killpg(pgid, 0) } == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(target_os = "linux"))]
fn group_alive(_child: &Child) -> bool {
    false
}

#[cfg(not(target_os = "linux"))]
fn signal_group(child: &mut Child, signal: Signal) {
    // Without group signalling only a forced kill is available.
    if matches!(signal, Signal::Kill) {
        let _ = child.kill();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> CaptureSettings {
        crate::config::EngineConfig::default().capture
    }

    #[test]
    fn rpicam_command_line() {
        let mut settings = settings();
        settings.post_process_file = Some(PathBuf::from("/etc/camstream/imx500.json"));
        let command = CaptureCommand::rpicam(&settings);
        assert_eq!(command.program(), "rpicam-vid");
        assert_eq!(
            command.display(),
            "rpicam-vid --post-process-file /etc/camstream/imx500.json --width 640 \
             --height 480 --framerate 15 --nopreview --codec mjpeg --metadata \
             /tmp/imx500_stream_detections.json --metadata-format json -t 0 -o -"
        );
    }

    #[test]
    fn spawn_failure_is_reported() {
        let supervisor = ProcessSupervisor::new(
            CaptureCommand::new("/nonexistent/camstream-capture"),
            Duration::from_millis(100),
        );
        let err = supervisor
            .start(|_, _| Ok(Vec::new()))
            .expect_err("spawn must fail");
        assert!(matches!(err, CaptureError::Spawn { .. }));
        assert_eq!(supervisor.phase(), SupervisorPhase::Stopped);
        assert!(!supervisor.is_running());
    }

    #[cfg(unix)]
    #[test]
    fn stop_escalates_when_term_is_ignored() {
        let supervisor = ProcessSupervisor::new(
            CaptureCommand::new("sh").args(["-c", "trap '' TERM; while true; do sleep 1; done"]),
            Duration::from_millis(200),
        );
        supervisor.start(|_, _| Ok(Vec::new())).expect("start");
        assert!(supervisor.is_running());
        assert_eq!(supervisor.phase(), SupervisorPhase::Running);

        let started = Instant::now();
        supervisor.stop();
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(!supervisor.is_running());
        assert_eq!(supervisor.phase(), SupervisorPhase::Stopped);
        assert!(supervisor.pid().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn crash_is_observed_without_stop() {
        let supervisor =
            ProcessSupervisor::new(CaptureCommand::new("sh").args(["-c", "exit 3"]), Duration::ZERO);
        supervisor.start(|_, _| Ok(Vec::new())).expect("start");
        let deadline = Instant::now() + Duration::from_secs(5);
        while supervisor.is_running() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(!supervisor.is_running());
        supervisor.stop();
        assert_eq!(supervisor.phase(), SupervisorPhase::Stopped);
    }

    #[cfg(unix)]
    #[test]
    fn stop_reaches_helpers_left_behind_by_leader() {
        use std::io::Read;

        let supervisor = ProcessSupervisor::new(
            CaptureCommand::new("sh").args(["-c", "sleep 8 & exit 0"]),
            Duration::from_millis(300),
        );
        supervisor
            .start(|mut stdout, _| {
                let reader = std::thread::spawn(move || {
                    let mut sink = Vec::new();
                    let _ = stdout.read_to_end(&mut sink);
                });
                Ok(vec![reader])
            })
            .expect("start");

        let deadline = Instant::now() + Duration::from_secs(5);
        while supervisor.is_running() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(!supervisor.is_running());

        let started = Instant::now();
        supervisor.stop();
        assert!(
            started.elapsed() < Duration::from_secs(3),
            "stop took {:?}",
            started.elapsed()
        );
        assert_eq!(supervisor.phase(), SupervisorPhase::Stopped);
    }

    #[cfg(unix)]
    #[test]
    fn scratch_files_are_removed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let scratch = dir.path().join("meta.json");
        std::fs::write(&scratch, "stale").unwrap();
        let supervisor = ProcessSupervisor::new(
            CaptureCommand::new("sh").args(["-c", "sleep 30"]),
            Duration::from_millis(500),
        )
        .with_scratch_file(&scratch);

        supervisor.start(|_, _| Ok(Vec::new())).expect("start");
        assert!(!scratch.exists());
        std::fs::write(&scratch, "written by capture").unwrap();
        supervisor.stop();
        assert!(!scratch.exists());
    }
}
