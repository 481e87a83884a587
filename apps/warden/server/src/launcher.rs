//! Launching the sandboxed runtime and keeping it running.

use std::{
    ffi::OsString,
    net::SocketAddr,
    path::{Component, Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use metrics::counter;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::{Child, Command},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::{KillOptions, RestartPolicy},
    error::LaunchError,
    notify::{LaunchEvent, LaunchNotifier},
    process_tree::{kill_group, kill_tree},
    task::spawn_supervised,
};

/// Directories the runtime may neither read nor write.
pub const SYSTEM_DIRS: &[&str] = &[
    "/etc", "/usr", "/bin", "/sbin", "/boot", "/dev", "/proc", "/sys", "/root", "/var",
];

/// Directory under the work directory holding the entry program.
pub const SOURCE_DIR: &str = "src";

/// Everything needed to build the runtime command line for one instance.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub executable: PathBuf,
    pub workdir: PathBuf,
    pub cache_dir: PathBuf,
    /// Relative to `workdir`.
    pub entry_program: PathBuf,
    pub allow_network: bool,
    pub control_addr: SocketAddr,
    pub control_url: String,
}

impl LaunchSpec {
    pub fn validate(&self) -> Result<(), LaunchError> {
        for (field, path) in [("workdir", &self.workdir), ("cache_dir", &self.cache_dir)] {
            if !path.is_absolute() {
                return Err(LaunchError::RelativeDirectory {
                    field,
                    path: path.clone(),
                });
            }
        }
        if normalized(&self.workdir) == normalized(&self.cache_dir) {
            return Err(LaunchError::SharedDirectory(self.workdir.clone()));
        }

        let mut components = self.entry_program.components().peekable();
        let contained = components.peek().is_some()
            && components.all(|component| matches!(component, Component::Normal(_)));
        if !contained {
            return Err(LaunchError::EntryOutsideWorkdir(self.entry_program.clone()));
        }
        Ok(())
    }

    pub fn entry_path(&self) -> PathBuf {
        self.workdir.join(&self.entry_program)
    }

    pub fn source_dir(&self) -> PathBuf {
        self.workdir.join(SOURCE_DIR)
    }

    pub fn arguments(&self) -> Vec<OsString> {
        let work = self.workdir.display();
        let cache = self.cache_dir.display();
        let system = SYSTEM_DIRS.join(",");

        let mut args: Vec<OsString> = vec![
            "run".into(),
            "--no-prompt".into(),
            format!("--allow-read={work},{cache}").into(),
            format!("--allow-write={work},{cache}").into(),
            format!("--deny-read={system}").into(),
            format!(
                "--deny-write={system},{},{}",
                self.source_dir().display(),
                self.entry_path().display()
            )
            .into(),
        ];
        if self.allow_network {
            args.push("--allow-net".into());
        } else {
            args.push(format!("--allow-net={}", self.control_addr).into());
        }
        args.push(self.entry_path().into_os_string());
        args.push(self.control_url.clone().into());
        args
    }

    /// The complete environment of the child; nothing is inherited.
    pub fn environment(&self) -> Vec<(&'static str, OsString)> {
        vec![
            ("DENO_DIR", self.cache_dir.clone().into_os_string()),
            ("DENO_NO_UPDATE_CHECK", "1".into()),
            ("NO_COLOR", "1".into()),
            ("HOME", self.workdir.clone().into_os_string()),
        ]
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.executable);
        command
            .args(self.arguments())
            .env_clear()
            .envs(self.environment())
            .current_dir(&self.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        command
    }
}

fn normalized(path: &Path) -> PathBuf {
    path.components().collect()
}

/// Counts early exits and decides when the restart loop must cool down.
#[derive(Debug)]
struct Backoff {
    policy: RestartPolicy,
    failures: u32,
}

impl Backoff {
    fn new(policy: RestartPolicy) -> Self {
        Self {
            policy,
            failures: 0,
        }
    }

    fn record_exit(&mut self, uptime: Duration) -> Option<Duration> {
        if uptime < self.policy.min_uptime {
            self.failures += 1;
        } else {
            self.failures = 1;
        }
        if self.failures >= self.policy.max_failures {
            self.failures = 0;
            Some(self.policy.cooldown)
        } else {
            None
        }
    }
}

enum Attempt {
    Exited,
    Cancelled,
}

/// Runs the runtime in a bounded restart loop.
#[derive(Debug, Clone, Default)]
pub struct Launcher {
    restart: RestartPolicy,
    kill: KillOptions,
}

impl Launcher {
    pub fn new(restart: RestartPolicy, kill: KillOptions) -> Self {
        Self { restart, kill }
    }

    /// Runs until `cancel` fires, in which case `LaunchError::Cancelled` is
    /// returned, or until the spec turns out to be invalid. Every exit of the
    /// child, including a clean one, leads to a restart.
    pub async fn execute(
        &self,
        spec: &LaunchSpec,
        cancel: &CancellationToken,
        notifier: Option<&LaunchNotifier>,
    ) -> Result<(), LaunchError> {
        spec.validate()?;
        let mut backoff = Backoff::new(self.restart.clone());

        loop {
            if cancel.is_cancelled() {
                return Err(LaunchError::Cancelled);
            }

            let started = Instant::now();
            let attempt = match spec.command().spawn() {
                Ok(child) => self.supervise(child, cancel, notifier).await,
                Err(err) => {
                    warn!(
                        executable = %spec.executable.display(),
                        error = %err,
                        "failed to spawn runtime"
                    );
                    Attempt::Exited
                }
            };
            if matches!(attempt, Attempt::Cancelled) || cancel.is_cancelled() {
                return Err(LaunchError::Cancelled);
            }

            counter!("warden_runtime_restarts_total", 1);
            if let Some(cooldown) = backoff.record_exit(started.elapsed()) {
                warn!(
                    cooldown_secs = cooldown.as_secs(),
                    "runtime keeps exiting early; pausing restarts"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(LaunchError::Cancelled),
                    _ = tokio::time::sleep(cooldown) => {}
                }
            }
        }
    }

    async fn supervise(
        &self,
        mut child: Child,
        cancel: &CancellationToken,
        notifier: Option<&LaunchNotifier>,
    ) -> Attempt {
        let pid = child.id().unwrap_or_default();
        info!(pid, "runtime started");
        if let Some(notifier) = notifier {
            notifier.notify(LaunchEvent::Started { pid });
        }
        if let Some(stdout) = child.stdout.take() {
            spawn_supervised("runtime-stdout", forward_output(stdout, pid, "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_supervised("runtime-stderr", forward_output(stderr, pid, "stderr"));
        }

        tokio::select! {
            status = child.wait() => {
                let status = status.ok();
                warn!(pid, code = ?status.and_then(|s| s.code()), "runtime exited");
                reap_group(pid);
                if let Some(notifier) = notifier {
                    notifier.notify(LaunchEvent::exited(pid, status));
                }
                Attempt::Exited
            }
            _ = cancel.cancelled() => {
                if pid != 0 {
                    if let Err(err) = kill_tree(pid, &self.kill).await {
                        warn!(pid, error = %err, "failed to kill runtime process tree");
                    }
                }
                let _ = child.start_kill();
                let status = child.wait().await.ok();
                reap_group(pid);
                debug!(pid, "runtime reaped after cancellation");
                if let Some(notifier) = notifier {
                    notifier.notify(LaunchEvent::exited(pid, status));
                }
                Attempt::Cancelled
            }
        }
    }
}

/// Kills whatever the runtime left behind in its process group. The group
/// id equals the runtime's pid.
fn reap_group(pgid: u32) {
    if pgid == 0 {
        return;
    }
    if let Err(err) = kill_group(pgid) {
        warn!(pgid, error = %err, "failed to kill runtime process group");
    }
}

async fn forward_output<R>(reader: R, pid: u32, stream: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        info!(target: "warden::runtime", pid, stream, "{line}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    use crate::process_tree::process_exists;

    fn spec(root: &Path) -> LaunchSpec {
        LaunchSpec {
            executable: PathBuf::from("/bin/sh"),
            workdir: root.join("work"),
            cache_dir: root.join("cache"),
            entry_program: PathBuf::from("src/service.ts"),
            allow_network: false,
            control_addr: "127.0.0.1:4100".parse().unwrap(),
            control_url: "ws://127.0.0.1:4100/?token=abc".into(),
        }
    }

    fn script(root: &Path, body: &str) -> PathBuf {
        let path = root.join("fake-runtime.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn prepared(root: &Path, executable: PathBuf) -> LaunchSpec {
        let spec = LaunchSpec {
            executable,
            ..spec(root)
        };
        std::fs::create_dir_all(spec.source_dir()).unwrap();
        std::fs::create_dir_all(&spec.cache_dir).unwrap();
        spec
    }

    #[test]
    fn rejects_invalid_directories() {
        let root = Path::new("/srv/warden");
        let mut relative = spec(root);
        relative.cache_dir = PathBuf::from("cache");
        assert!(matches!(
            relative.validate(),
            Err(LaunchError::RelativeDirectory {
                field: "cache_dir",
                ..
            })
        ));

        let mut shared = spec(root);
        shared.cache_dir = root.join("work/.");
        assert!(matches!(
            shared.validate(),
            Err(LaunchError::SharedDirectory(_))
        ));

        for entry in ["../escape.ts", "/abs/entry.ts", ""] {
            let mut escaping = spec(root);
            escaping.entry_program = PathBuf::from(entry);
            assert!(
                matches!(escaping.validate(), Err(LaunchError::EntryOutsideWorkdir(_))),
                "{entry:?} accepted"
            );
        }
    }

    #[test]
    fn command_line_denies_self_modification() {
        let spec = spec(Path::new("/srv/warden"));
        let args: Vec<String> = spec
            .arguments()
            .into_iter()
            .map(|arg| arg.into_string().unwrap())
            .collect();

        assert_eq!(&args[..2], ["run", "--no-prompt"]);
        assert!(args.contains(&"--allow-read=/srv/warden/work,/srv/warden/cache".to_owned()));
        assert!(args.contains(&"--allow-write=/srv/warden/work,/srv/warden/cache".to_owned()));
        let deny_write = args
            .iter()
            .find(|arg| arg.starts_with("--deny-write="))
            .unwrap();
        assert!(deny_write.contains("/etc,"));
        assert!(deny_write.ends_with(",/srv/warden/work/src,/srv/warden/work/src/service.ts"));
        assert!(args.contains(&"--allow-net=127.0.0.1:4100".to_owned()));
        assert_eq!(
            &args[args.len() - 2..],
            ["/srv/warden/work/src/service.ts", "ws://127.0.0.1:4100/?token=abc"]
        );
    }

    #[test]
    fn network_flag_widens_only_when_allowed() {
        let mut spec = spec(Path::new("/srv/warden"));
        spec.allow_network = true;
        let args = spec.arguments();
        assert!(args.iter().any(|arg| arg == "--allow-net"));
        assert!(!args
            .iter()
            .any(|arg| arg.to_string_lossy().starts_with("--allow-net=")));
    }

    #[test]
    fn early_exits_trigger_cooldown_and_reset() {
        let mut backoff = Backoff::new(RestartPolicy {
            min_uptime: Duration::from_secs(10),
            max_failures: 3,
            cooldown: Duration::from_secs(300),
        });
        let quick = Duration::from_secs(1);
        assert_eq!(backoff.record_exit(quick), None);
        assert_eq!(backoff.record_exit(quick), None);
        assert_eq!(backoff.record_exit(quick), Some(Duration::from_secs(300)));

        // A long-lived run resets the count to one.
        assert_eq!(backoff.record_exit(quick), None);
        assert_eq!(backoff.record_exit(Duration::from_secs(60)), None);
        assert_eq!(backoff.record_exit(quick), None);
        assert_eq!(backoff.record_exit(quick), Some(Duration::from_secs(300)));
    }

    #[tokio::test]
    async fn invalid_spec_fails_without_spawning() {
        let mut spec = spec(Path::new("/srv/warden"));
        spec.workdir = PathBuf::from("relative");
        let (notifier, mut events) = LaunchNotifier::channel(4);
        let err = Launcher::default()
            .execute(&spec, &CancellationToken::new(), Some(&notifier))
            .await
            .unwrap_err();
        assert!(matches!(err, LaunchError::RelativeDirectory { .. }));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn restarts_until_cooldown_then_honours_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let spec = prepared(dir.path(), script(dir.path(), "exit 0"));
        let launcher = Launcher::new(
            RestartPolicy {
                min_uptime: Duration::from_secs(10),
                max_failures: 2,
                cooldown: Duration::from_secs(3600),
            },
            KillOptions::default(),
        );
        let (notifier, mut events) = LaunchNotifier::channel(16);
        let cancel = CancellationToken::new();

        let run = {
            let cancel = cancel.clone();
            async move { launcher.execute(&spec, &cancel, Some(&notifier)).await }
        };
        let handle = tokio::spawn(run);

        let mut starts = 0;
        while starts < 2 {
            if let Some(LaunchEvent::Started { .. }) = events.recv().await {
                starts += 1;
            }
        }
        tokio::time::sleep(Duration::from_millis(300)).await;
        while let Ok(event) = events.try_recv() {
            assert!(
                matches!(event, LaunchEvent::Exited { .. }),
                "restarted during cooldown"
            );
        }

        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("cancel was not honoured")
            .unwrap();
        assert!(matches!(result, Err(LaunchError::Cancelled)));
    }

    #[tokio::test]
    async fn cancel_kills_the_running_child() {
        let dir = tempfile::tempdir().unwrap();
        let spec = prepared(dir.path(), script(dir.path(), "exec sleep 30"));
        let (notifier, mut events) = LaunchNotifier::channel(4);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                Launcher::default()
                    .execute(&spec, &cancel, Some(&notifier))
                    .await
            }
        });
        let Some(LaunchEvent::Started { pid }) = events.recv().await else {
            panic!("expected a start notification");
        };
        assert!(process_exists(pid));

        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("cancel was not honoured")
            .unwrap();
        assert!(matches!(result, Err(LaunchError::Cancelled)));
        assert!(!process_exists(pid));
    }

    #[tokio::test]
    async fn leftovers_of_a_crashed_runtime_are_killed_before_restart() {
        let dir = tempfile::tempdir().unwrap();
        let sleep = ["/bin/sleep", "/usr/bin/sleep"]
            .into_iter()
            .find(|candidate| Path::new(candidate).exists())
            .expect("no sleep binary");
        let body = format!(
            "if [ ! -f marker ]; then {sleep} 600 >/dev/null 2>&1 & echo $! > marker; exit 1; fi\nexec {sleep} 30"
        );
        let spec = prepared(dir.path(), script(dir.path(), &body));
        let marker = spec.workdir.join("marker");
        let (notifier, mut events) = LaunchNotifier::channel(16);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                Launcher::default()
                    .execute(&spec, &cancel, Some(&notifier))
                    .await
            }
        });

        let mut starts = 0;
        while starts < 2 {
            if let Some(LaunchEvent::Started { .. }) = events.recv().await {
                starts += 1;
            }
        }
        let leftover: u32 = std::fs::read_to_string(&marker)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while process_exists(leftover) {
            assert!(
                Instant::now() < deadline,
                "process left by the crashed runtime survived the restart"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("cancel was not honoured")
            .unwrap();
        assert!(matches!(result, Err(LaunchError::Cancelled)));
    }

    #[tokio::test]
    async fn child_sees_only_the_explicit_environment() {
        std::env::set_var("WARDEN_LAUNCH_TEST_AMBIENT", "leaked");
        let dir = tempfile::tempdir().unwrap();
        let spec = prepared(
            dir.path(),
            script(
                dir.path(),
                "env > \"$HOME/env.txt\"; pwd > \"$HOME/pwd.txt\"; exec sleep 30",
            ),
        );
        let workdir = spec.workdir.clone();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn({
            let cancel = cancel.clone();
            async move { Launcher::default().execute(&spec, &cancel, None).await }
        });

        let pwd_file = workdir.join("pwd.txt");
        let deadline = Instant::now() + Duration::from_secs(5);
        while !pwd_file.exists() {
            assert!(Instant::now() < deadline, "runtime never wrote its environment");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();
        handle.await.unwrap().unwrap_err();

        let env = std::fs::read_to_string(workdir.join("env.txt")).unwrap();
        assert!(env.contains("NO_COLOR=1"));
        assert!(env.contains("DENO_NO_UPDATE_CHECK=1"));
        assert!(env.contains(&format!("DENO_DIR={}", dir.path().join("cache").display())));
        assert!(!env.contains("WARDEN_LAUNCH_TEST_AMBIENT"));
        let pwd = std::fs::read_to_string(pwd_file).unwrap();
        assert_eq!(Path::new(pwd.trim()), workdir.canonicalize().unwrap());
    }
}
