//! Forceful termination of a process together with all of its descendants.
//!
//! The tree is walked depth-first: every child subtree is killed before its
//! parent so that no descendant is reparented away from the walk while it is
//! still running.

use std::{io, sync::Arc};

use futures_util::future::{BoxFuture, FutureExt};
use tracing::debug;

use crate::{config::KillOptions, error::KillError};

/// Lists the direct children of a pid. Runs on the blocking pool.
type ChildLister = Arc<dyn Fn(u32) -> io::Result<Vec<u32>> + Send + Sync>;

/// Kills `pid` and every process below it.
pub async fn kill_tree(pid: u32, options: &KillOptions) -> Result<(), KillError> {
    kill_subtree(pid, 0, options, Arc::new(child_pids)).await
}

/// Kills every member of process group `pgid`. Members that were
/// reparented away from the group leader are reached too.
pub fn kill_group(pgid: u32) -> Result<(), KillError> {
    let raw = to_pid_t(pgid)?;
    if raw <= 1 {
        return Ok(());
    }
    debug!(pgid, "killing process group");
    signal(-raw, pgid)
}

fn kill_subtree<'a>(
    pid: u32,
    depth: usize,
    options: &'a KillOptions,
    list_children: ChildLister,
) -> BoxFuture<'a, Result<(), KillError>> {
    async move {
        if pid <= 1 || pid == std::process::id() {
            return Ok(());
        }

        let mut first_error = None;
        if depth < options.max_depth {
            let children = match children_of(pid, &list_children).await {
                Ok(children) => children,
                Err(err) => {
                    first_error.get_or_insert(err);
                    Vec::new()
                }
            };
            let had_children = !children.is_empty();
            for child in children {
                if let Err(err) =
                    kill_subtree(child, depth + 1, options, Arc::clone(&list_children)).await
                {
                    first_error.get_or_insert(err);
                }
            }
            if had_children && !options.grace.is_zero() {
                tokio::time::sleep(options.grace).await;
            }
        }

        debug!(pid, depth, "killing process");
        if let Err(err) = signal(to_pid_t(pid)?, pid) {
            first_error.get_or_insert(err);
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
    .boxed()
}

async fn children_of(pid: u32, list_children: &ChildLister) -> Result<Vec<u32>, KillError> {
    let list_children = Arc::clone(list_children);
    tokio::task::spawn_blocking(move || list_children(pid))
        .await
        .map_err(|err| KillError::Enumerate {
            pid,
            source: io::Error::other(err),
        })?
        .map_err(|source| KillError::Enumerate { pid, source })
}

fn to_pid_t(pid: u32) -> Result<libc::pid_t, KillError> {
    libc::pid_t::try_from(pid).map_err(|_| KillError::Signal {
        pid,
        source: io::Error::from(io::ErrorKind::InvalidInput),
    })
}

/// SIGKILLs `target` (a pid, or a negated process group id). A target that
/// is already gone is not an error.
fn signal(target: libc::pid_t, pid: u32) -> Result<(), KillError> {
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(target, libc::SIGKILL) };
    if rc == 0 {
        return Ok(());
    }
    let source = io::Error::last_os_error();
    if source.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    Err(KillError::Signal { pid, source })
}

/// Whether `pid` names a live process. Zombies count as gone.
#[cfg(target_os = "linux")]
pub fn process_exists(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => !matches!(parse_stat(&stat), Some((state, _)) if state == 'Z' || state == 'X'),
        Err(_) => false,
    }
}

#[cfg(not(target_os = "linux"))]
pub fn process_exists(pid: u32) -> bool {
    let Ok(raw) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 only performs the existence and permission check.
    let rc = unsafe { libc::kill(raw, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Direct children of `pid`.
#[cfg(target_os = "linux")]
pub fn child_pids(pid: u32) -> io::Result<Vec<u32>> {
    let mut children = Vec::new();
    for entry in std::fs::read_dir("/proc")? {
        let Ok(entry) = entry else { continue };
        let Some(candidate) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<u32>().ok())
        else {
            continue;
        };
        // Processes can vanish between read_dir and the read.
        let Ok(stat) = std::fs::read_to_string(entry.path().join("stat")) else {
            continue;
        };
        if matches!(parse_stat(&stat), Some((_, ppid)) if ppid == pid) {
            children.push(candidate);
        }
    }
    Ok(children)
}

#[cfg(not(target_os = "linux"))]
pub fn child_pids(pid: u32) -> io::Result<Vec<u32>> {
    let output = std::process::Command::new("ps")
        .args(["-A", "-o", "pid=", "-o", "ppid="])
        .output()?;
    if !output.status.success() {
        return Err(io::Error::new(io::ErrorKind::Other, "ps exited unsuccessfully"));
    }
    let listing = String::from_utf8_lossy(&output.stdout);
    Ok(listing
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let child = fields.next()?.parse::<u32>().ok()?;
            let parent = fields.next()?.parse::<u32>().ok()?;
            (parent == pid).then_some(child)
        })
        .collect())
}

/// Extracts `(state, ppid)` from a `/proc/<pid>/stat` line. The command name
/// is parenthesised and may itself contain spaces or parentheses.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_stat(stat: &str) -> Option<(char, u32)> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    let state = fields.next()?.chars().next()?;
    let ppid = fields.next()?.parse().ok()?;
    Some((state, ppid))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn parses_stat_lines_with_awkward_names() {
        let stat = "4242 (my (odd) proc) S 17 4242 4242 0 -1 4194560";
        assert_eq!(parse_stat(stat), Some(('S', 17)));
        assert_eq!(parse_stat("garbage"), None);
    }

    #[test]
    fn current_process_exists() {
        assert!(process_exists(std::process::id()));
    }

    #[tokio::test]
    async fn refuses_to_signal_init_or_itself() {
        let options = KillOptions::default();
        kill_tree(1, &options).await.unwrap();
        kill_tree(std::process::id(), &options).await.unwrap();
        assert!(process_exists(std::process::id()));
    }

    #[tokio::test]
    async fn enumeration_failure_still_kills_the_parent() {
        let mut sleeper = std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .expect("spawn sleeper");
        let pid = sleeper.id();
        let failing: ChildLister = Arc::new(|_: u32| -> io::Result<Vec<u32>> {
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "no /proc"))
        });

        let options = KillOptions {
            grace: Duration::ZERO,
            max_depth: 4,
        };
        let err = kill_subtree(pid, 0, &options, failing).await.unwrap_err();
        assert!(matches!(err, KillError::Enumerate { pid: failed, .. } if failed == pid));

        let status = sleeper.wait().expect("reap sleeper");
        assert!(!status.success());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn group_kill_reaches_orphaned_members() {
        use std::os::unix::process::CommandExt;

        // The shell exits at once; its background sleeper is orphaned but
        // stays in the group.
        let mut shell = std::process::Command::new("sh")
            .args(["-c", "sleep 30 >/dev/null 2>&1 & echo $!"])
            .stdout(std::process::Stdio::piped())
            .process_group(0)
            .spawn()
            .expect("spawn shell");
        let pgid = shell.id();
        let output = {
            use std::io::Read;
            let mut out = String::new();
            shell
                .stdout
                .take()
                .unwrap()
                .read_to_string(&mut out)
                .unwrap();
            out
        };
        shell.wait().expect("reap shell");
        let orphan: u32 = output.trim().parse().unwrap();
        assert!(process_exists(orphan));

        kill_group(pgid).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while process_exists(orphan) {
            assert!(Instant::now() < deadline, "orphaned group member survived");
            std::thread::sleep(Duration::from_millis(10));
        }
        kill_group(pgid).unwrap();
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn kills_grandchildren_before_parent() {
        let mut shell = std::process::Command::new("sh")
            .args(["-c", "sleep 30 & sleep 30 & wait"])
            .spawn()
            .expect("spawn shell");
        let shell_pid = shell.id();

        let deadline = Instant::now() + Duration::from_secs(5);
        let grandchildren = loop {
            let children = child_pids(shell_pid).unwrap();
            if children.len() == 2 {
                break children;
            }
            assert!(Instant::now() < deadline, "sleepers never appeared");
            std::thread::sleep(Duration::from_millis(10));
        };

        let options = KillOptions {
            grace: Duration::ZERO,
            max_depth: 4,
        };
        kill_tree(shell_pid, &options).await.unwrap();
        shell.wait().expect("reap shell");

        let deadline = Instant::now() + Duration::from_secs(5);
        while grandchildren.iter().any(|pid| process_exists(*pid)) {
            assert!(Instant::now() < deadline, "grandchildren survived the kill");
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}
