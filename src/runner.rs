//! Process execution and manifest application
//!
//! [`ShellRunner`] launches real processes for hooks and command apps.
//! [`KubectlApplier`] turns manifest applies and deletes into kubectl calls
//! made through any [`CommandRunner`].

use anyhow::{Context, Result, bail};
use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use taskhooks::{CommandOutput, CommandRunner, CommandSpec, Invocation, ManifestApplier};

/// How often a running child is checked against its deadline
const WAIT_POLL: Duration = Duration::from_millis(50);

/// How long output readers may keep draining after a timeout kill
const READER_GRACE: Duration = Duration::from_millis(500);

/// Runs commands as child processes with captured output
#[derive(Debug, Clone, Copy, Default)]
pub struct ShellRunner;

impl ShellRunner {
    fn command(spec: &CommandSpec) -> Result<Command> {
        let mut cmd = match &spec.invocation {
            Invocation::Shell(line) => {
                let mut cmd = Command::new("sh");
                cmd.arg("-c").arg(line);
                cmd
            }
            Invocation::Argv(argv) => {
                let Some((program, args)) = argv.split_first() else {
                    bail!("Empty command");
                };
                let mut cmd = Command::new(program);
                cmd.args(args);
                cmd
            }
        };
        cmd.envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // Own process group, so a timeout can take down everything it spawned
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        Ok(cmd)
    }
}

/// Read a pipe to the end on its own thread so the child never blocks on it
fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

/// Wait for the child, killing it once `timeout` has elapsed
///
/// Returns the exit code (if any) and whether the deadline was hit.
fn wait_with_deadline(child: &mut Child, timeout: Option<Duration>) -> Result<(Option<i32>, bool)> {
    let Some(timeout) = timeout else {
        let status = child.wait().context("Failed to wait for command")?;
        return Ok((status.code(), false));
    };

    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait().context("Failed to poll command")? {
            return Ok((status.code(), false));
        }
        if Instant::now() >= deadline {
            kill_group(child);
            return Ok((None, true));
        }
        thread::sleep(WAIT_POLL);
    }
}

/// Kill the child and every process in its group, then reap it
fn kill_group(child: &mut Child) {
    #[cfg(unix)]
    if let Ok(pid) = libc::pid_t::try_from(child.id()) {
        // SAFETY: kill(2) with a negative pid only signals the child's own group
        unsafe {
            libc::kill(-pid, libc::SIGKILL);
        }
    }
    let _ = child.kill();
    let _ = child.wait();
}

/// Output captured by a reader thread
///
/// After a timeout the reader is given `READER_GRACE` to finish; a pipe held
/// open by an escaped process is abandoned rather than waited on.
fn collect(reader: thread::JoinHandle<String>, timed_out: bool) -> String {
    if timed_out {
        let grace = Instant::now() + READER_GRACE;
        while !reader.is_finished() {
            if Instant::now() >= grace {
                return String::new();
            }
            thread::sleep(WAIT_POLL);
        }
    }
    reader.join().unwrap_or_default()
}

impl CommandRunner for ShellRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        log::debug!("exec: {}", spec.invocation);
        let mut child = Self::command(spec)?
            .spawn()
            .with_context(|| format!("Failed to execute: {}", spec.invocation))?;

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());
        let (exit_code, timed_out) = wait_with_deadline(&mut child, spec.timeout)?;

        let output = CommandOutput {
            exit_code,
            stdout: collect(stdout, timed_out),
            stderr: collect(stderr, timed_out),
            timed_out,
        };
        if timed_out {
            log::warn!("command timed out: {}", spec.invocation);
        }
        Ok(output)
    }
}

/// Applies and deletes manifests with kubectl
pub struct KubectlApplier<'a> {
    runner: &'a dyn CommandRunner,
    kubectl: String,
    kubeconfig: Option<String>,
    context: Option<String>,
    timeout: Duration,
}

impl<'a> KubectlApplier<'a> {
    pub fn new(runner: &'a dyn CommandRunner, timeout: Duration) -> Self {
        Self {
            runner,
            kubectl: "kubectl".to_string(),
            kubeconfig: None,
            context: None,
            timeout,
        }
    }

    pub fn with_kubectl(mut self, kubectl: impl Into<String>) -> Self {
        self.kubectl = kubectl.into();
        self
    }

    pub fn with_kubeconfig(mut self, kubeconfig: Option<String>) -> Self {
        self.kubeconfig = kubeconfig;
        self
    }

    pub fn with_context(mut self, context: Option<String>) -> Self {
        self.context = context;
        self
    }

    fn argv(&self, verb: &str, manifest: &Path, namespace: Option<&str>) -> Vec<String> {
        let mut argv = vec![self.kubectl.clone()];
        if let Some(kubeconfig) = &self.kubeconfig {
            argv.extend(["--kubeconfig".to_string(), kubeconfig.clone()]);
        }
        if let Some(context) = &self.context {
            argv.extend(["--context".to_string(), context.clone()]);
        }
        argv.extend([
            verb.to_string(),
            "-f".to_string(),
            manifest.to_string_lossy().into_owned(),
        ]);
        if let Some(ns) = namespace {
            argv.extend(["-n".to_string(), ns.to_string()]);
        }
        argv
    }

    fn invoke(&self, argv: Vec<String>) -> Result<()> {
        let spec = CommandSpec::argv(argv).with_timeout(self.timeout);
        let output = self.runner.run(&spec)?;
        if output.success() {
            Ok(())
        } else {
            bail!("{}: {}", spec.invocation, output.failure_summary())
        }
    }

    /// Delete what a manifest describes; already-absent objects are fine
    pub fn delete(&self, manifest: &Path, namespace: Option<&str>) -> Result<()> {
        let mut argv = self.argv("delete", manifest, namespace);
        argv.push("--ignore-not-found".to_string());
        self.invoke(argv)
    }
}

impl ManifestApplier for KubectlApplier<'_> {
    fn apply(&self, manifest: &Path, namespace: Option<&str>) -> Result<()> {
        self.invoke(self.argv("apply", manifest, namespace))
    }
}
