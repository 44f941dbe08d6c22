//! Process launcher: every task run gets its own OS process.
//!
//! Hand-off goes through a per-run directory under `run_dir`:
//! `config.json` (the schedule's config payload) in, `result.json` out.
//! Both paths reach the child via environment variables.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use opsclaw_core::error::{OpsClawError, Result};
use opsclaw_tasks::task::TaskEntry;
use opsclaw_tasks::worker::{TaskReport, RESULT_FILE_ENV, TASK_CONFIG_ENV, TASK_ENV};
use tokio::process::{Child, Command};

use crate::schedule::ProcessHandle;

/// Sub-command that runs a compiled-in task inside a re-executed binary.
pub const RUN_TASK_SUBCOMMAND: &str = "run-task";

/// Starts task processes.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    worker_exe: PathBuf,
    run_dir: PathBuf,
    grace_period: Duration,
    extra_env: BTreeMap<String, String>,
}

impl ProcessLauncher {
    /// `worker_exe` is re-executed with `run-task <name>` for compiled-in tasks.
    pub fn new(worker_exe: impl Into<PathBuf>, run_dir: impl Into<PathBuf>) -> Self {
        Self {
            worker_exe: worker_exe.into(),
            run_dir: run_dir.into(),
            grace_period: Duration::from_secs(10),
            extra_env: BTreeMap::new(),
        }
    }

    /// Launcher that re-executes the running binary.
    pub fn current_exe(run_dir: impl Into<PathBuf>) -> Result<Self> {
        let exe = std::env::current_exe()
            .map_err(|e| OpsClawError::launch(format!("cannot locate own executable: {e}")))?;
        Ok(Self::new(exe, run_dir))
    }

    /// Delay between the terminate request and the forced kill.
    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    /// Extra variable passed to every child.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_env.insert(key.into(), value.into());
        self
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    /// Write the hand-off files and start the process.
    pub fn spawn(
        &self,
        task_name: &str,
        entry: &TaskEntry,
        config: &serde_json::Value,
        execution_id: &str,
    ) -> Result<RunningProcess> {
        let work_dir = self.run_dir.join(execution_id);
        std::fs::create_dir_all(&work_dir)?;
        let config_file = work_dir.join("config.json");
        let result_file = work_dir.join("result.json");
        let json = serde_json::to_string(config).map_err(OpsClawError::serialization)?;
        std::fs::write(&config_file, json)?;

        let mut command = match entry {
            TaskEntry::Builtin(_) => {
                let mut cmd = Command::new(&self.worker_exe);
                cmd.arg(RUN_TASK_SUBCOMMAND).arg(task_name);
                cmd
            }
            TaskEntry::Command(spec) => {
                let mut cmd = Command::new(&spec.program);
                cmd.args(&spec.args).envs(&spec.env);
                if let Some(dir) = &spec.working_dir {
                    cmd.current_dir(dir);
                }
                cmd
            }
        };
        command
            .envs(&self.extra_env)
            .env(TASK_ENV, task_name)
            .env(TASK_CONFIG_ENV, &config_file)
            .env(RESULT_FILE_ENV, &result_file)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        // Own process group, so a timeout reaches everything the task started.
        #[cfg(unix)]
        command.process_group(0);

        let child = command.spawn().map_err(|e| {
            let _ = std::fs::remove_dir_all(&work_dir);
            OpsClawError::launch(format!("failed to start {task_name}: {e}"))
        })?;
        let pid = child
            .id()
            .ok_or_else(|| OpsClawError::launch(format!("{task_name} exited before it could be tracked")))?;
        tracing::debug!("🚀 Started {} (pid {})", task_name, pid);

        Ok(RunningProcess {
            child,
            handle: ProcessHandle::new(pid),
            work_dir,
            result_file,
            grace_period: self.grace_period,
        })
    }
}

/// What the task left in its result file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskOutput {
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    /// Exit code; signal deaths report the negative signal number.
    Exited { code: i32, output: TaskOutput },
    TimedOut,
}

/// A started task process.
#[derive(Debug)]
pub struct RunningProcess {
    child: Child,
    handle: ProcessHandle,
    work_dir: PathBuf,
    result_file: PathBuf,
    grace_period: Duration,
}

impl RunningProcess {
    pub fn pid(&self) -> u32 {
        self.handle.pid()
    }

    pub fn handle(&self) -> ProcessHandle {
        self.handle.clone()
    }

    /// Wait up to `max_runtime`. On overrun: terminate, wait the grace
    /// period, then kill. The child is always reaped before this returns.
    pub async fn wait_with_timeout(mut self, max_runtime: Duration) -> Result<ProcessOutcome> {
        let outcome = match tokio::time::timeout(max_runtime, self.child.wait()).await {
            Ok(status) => {
                let status = status?;
                ProcessOutcome::Exited {
                    code: exit_code(&status),
                    output: read_output(&self.result_file),
                }
            }
            Err(_) => {
                self.terminate().await?;
                ProcessOutcome::TimedOut
            }
        };
        let _ = std::fs::remove_dir_all(&self.work_dir);
        Ok(outcome)
    }

    async fn terminate(&mut self) -> Result<()> {
        let pid = self.handle.pid();
        tracing::warn!("⏱️ Terminating pid {} after timeout", pid);
        request_termination(&mut self.child, pid)?;
        if tokio::time::timeout(self.grace_period, self.child.wait())
            .await
            .is_err()
        {
            tracing::warn!("🔪 pid {} ignored termination, killing", pid);
            force_kill(&mut self.child, pid)?;
            self.child.wait().await?;
        }
        // Leftovers of a leader that exited on SIGTERM.
        #[cfg(unix)]
        kill_group(pid, libc::SIGKILL);
        Ok(())
    }
}

/// Signal the whole process group led by `pid`. `false` once the group is gone.
#[cfg(unix)]
fn kill_group(pid: u32, signal: i32) -> bool {
    // SAFETY: plain syscall; the group id is the pid of a child we spawned as leader.
    unsafe { libc::kill(-(pid as libc::pid_t), signal) == 0 }
}

#[cfg(unix)]
fn request_termination(_child: &mut Child, pid: u32) -> Result<()> {
    if !kill_group(pid, libc::SIGTERM) {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            return Err(err.into());
        }
    }
    Ok(())
}

#[cfg(not(unix))]
fn request_termination(child: &mut Child, _pid: u32) -> Result<()> {
    child.start_kill()?;
    Ok(())
}

#[cfg(unix)]
fn force_kill(_child: &mut Child, pid: u32) -> Result<()> {
    kill_group(pid, libc::SIGKILL);
    Ok(())
}

#[cfg(not(unix))]
fn force_kill(child: &mut Child, _pid: u32) -> Result<()> {
    child.start_kill()?;
    Ok(())
}

#[cfg(unix)]
fn exit_code(status: &std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|sig| -sig))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code(status: &std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

/// A worker report yields its `task_result`/`error`; any other JSON is the
/// result itself. Missing or invalid files give an empty output.
fn read_output(path: &Path) -> TaskOutput {
    let Ok(content) = std::fs::read_to_string(path) else {
        return TaskOutput::default();
    };
    if let Ok(report) = serde_json::from_str::<TaskReport>(&content) {
        return TaskOutput {
            result: report.task_result,
            error: report.error,
        };
    }
    match serde_json::from_str(&content) {
        Ok(value) => TaskOutput {
            result: Some(value),
            error: None,
        },
        Err(e) => {
            tracing::warn!("Ignoring unreadable result file {}: {e}", path.display());
            TaskOutput::default()
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use opsclaw_tasks::task::CommandSpec;
    use serde_json::json;

    fn launcher(dir: &Path) -> ProcessLauncher {
        ProcessLauncher::new("/bin/false", dir.join("runs")).with_grace_period(Duration::from_secs(1))
    }

    fn shell(script: &str) -> TaskEntry {
        TaskEntry::Command(CommandSpec::shell(script))
    }

    #[tokio::test]
    async fn test_exit_code_and_result_file() {
        let dir = tempfile::tempdir().unwrap();
        let entry = shell(r#"echo "{\"task\": \"$OPSCLAW_TASK\"}" > "$OPSCLAW_RESULT_FILE""#);
        let process = launcher(dir.path())
            .spawn("testing/echo", &entry, &json!({}), "exec-1")
            .unwrap();
        assert!(process.pid() > 0);

        let outcome = process.wait_with_timeout(Duration::from_secs(10)).await.unwrap();
        assert_eq!(
            outcome,
            ProcessOutcome::Exited {
                code: 0,
                output: TaskOutput {
                    result: Some(json!({"task": "testing/echo"})),
                    error: None,
                },
            }
        );
        assert!(!dir.path().join("runs").join("exec-1").exists());
    }

    #[tokio::test]
    async fn test_config_handoff_and_nonzero_exit() {
        let dir = tempfile::tempdir().unwrap();
        let entry = shell(r#"grep -q '"region":"eu"' "$OPSCLAW_TASK_CONFIG" && exit 3"#);
        let process = launcher(dir.path())
            .spawn("testing/config", &entry, &json!({"region": "eu"}), "exec-2")
            .unwrap();
        match process.wait_with_timeout(Duration::from_secs(10)).await.unwrap() {
            ProcessOutcome::Exited { code, output } => {
                assert_eq!(code, 3);
                assert_eq!(output, TaskOutput::default());
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_timeout_escalates_to_kill() {
        let dir = tempfile::tempdir().unwrap();
        // Ignores SIGTERM, so only the kill ends it.
        let entry = shell("trap '' TERM; while :; do sleep 1; done");
        let process = launcher(dir.path())
            .spawn("testing/stubborn", &entry, &json!({}), "exec-3")
            .unwrap();
        let pid = process.pid();

        let started = std::time::Instant::now();
        let outcome = process.wait_with_timeout(Duration::from_secs(1)).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(10));
        // Reaped: the pid no longer names a live process of ours.
        let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
        assert_eq!(rc, -1);
    }

    /// Zombies count as gone: their parent shell died and init reaps them.
    fn process_alive(pid: libc::pid_t) -> bool {
        if let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            return stat
                .rsplit_once(") ")
                .and_then(|(_, rest)| rest.chars().next())
                .is_some_and(|state| state != 'Z' && state != 'X');
        }
        unsafe { libc::kill(pid, 0) == 0 }
    }

    #[tokio::test]
    async fn test_timeout_reaches_background_children() {
        let dir = tempfile::tempdir().unwrap();
        let pidfile = dir.path().join("child.pid");
        let entry = shell(&format!("sleep 30 & echo $! > '{}'; wait", pidfile.display()));
        let process = launcher(dir.path())
            .spawn("testing/spawner", &entry, &json!({}), "exec-5")
            .unwrap();

        let outcome = process.wait_with_timeout(Duration::from_secs(1)).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::TimedOut);

        let child: libc::pid_t = std::fs::read_to_string(&pidfile)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        let mut alive = true;
        for _ in 0..20 {
            alive = process_alive(child);
            if !alive {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(!alive, "background child {child} outlived the timeout");
    }

    #[tokio::test]
    async fn test_builtin_reexecs_worker() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let worker = dir.path().join("worker.sh");
        std::fs::write(&worker, "#!/bin/sh\nprintf '\"%s %s\"' \"$1\" \"$2\" > \"$OPSCLAW_RESULT_FILE\"\n").unwrap();
        std::fs::set_permissions(&worker, std::fs::Permissions::from_mode(0o755)).unwrap();

        let launcher = ProcessLauncher::new(&worker, dir.path().join("runs"));
        let task = opsclaw_tasks::builtin::find_builtin("testing/sample").unwrap();
        let entry = TaskEntry::Builtin(task);

        // A freshly written script can be briefly busy while other tests fork.
        let mut attempt = 0;
        let process = loop {
            match launcher.spawn("testing/sample", &entry, &json!({}), "exec-6") {
                Ok(process) => break process,
                Err(e) if attempt < 10 && e.to_string().contains("busy") => {
                    attempt += 1;
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                Err(e) => panic!("spawn failed: {e}"),
            }
        };

        match process.wait_with_timeout(Duration::from_secs(10)).await.unwrap() {
            ProcessOutcome::Exited { code, output } => {
                assert_eq!(code, 0);
                assert_eq!(output.result, Some(json!("run-task testing/sample")));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let dir = tempfile::tempdir().unwrap();
        let entry = TaskEntry::Command(CommandSpec::new("/nonexistent/program", vec![]));
        let err = launcher(dir.path())
            .spawn("testing/missing", &entry, &json!({}), "exec-4")
            .unwrap_err();
        assert!(matches!(err, OpsClawError::Launch(_)));
        assert!(!dir.path().join("runs").join("exec-4").exists());
    }

    #[test]
    fn test_read_output_variants() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("result.json");
        assert_eq!(read_output(&path), TaskOutput::default());

        std::fs::write(
            &path,
            r#"{"success": false, "start_time": "2026-03-01T00:00:00Z",
                "end_time": "2026-03-01T00:00:01Z", "runtime_seconds": 1.0,
                "task_result": null, "error": "boom"}"#,
        )
        .unwrap();
        assert_eq!(read_output(&path).error.as_deref(), Some("boom"));

        std::fs::write(&path, "[1, 2]").unwrap();
        assert_eq!(read_output(&path).result, Some(json!([1, 2])));

        std::fs::write(&path, "not json").unwrap();
        assert_eq!(read_output(&path), TaskOutput::default());
    }
}
