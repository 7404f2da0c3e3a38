use std::path::{Path, PathBuf};

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::Serialize;

use crate::handler::{ActionContext, ActionHandler};

const PROCESS_NAME: &str = "hypridle";

#[derive(Debug, Serialize, PartialEq, Eq)]
struct IdleStatus {
    text: &'static str,
    class: &'static str,
    tooltip: &'static str,
}

impl IdleStatus {
    fn for_state(running: bool) -> Self {
        if running {
            Self {
                text: "On",
                class: "active",
                tooltip: "Screen locking active\nLeft: Deactivate\nRight: Lock Screen\nScreen will be locked after 5 minutes of inactivity.",
            }
        } else {
            Self {
                text: "Off",
                class: "notactive",
                tooltip: "Screen locking deactivated\nLeft: Activate\nRight: Lock Screen",
            }
        }
    }
}

/// Reports whether `hypridle` is running.
pub struct GetHypridleStatus {
    proc_root: PathBuf,
}

impl GetHypridleStatus {
    #[must_use]
    pub fn new() -> Self {
        Self::with_proc_root(PathBuf::from("/proc"))
    }

    fn with_proc_root(proc_root: PathBuf) -> Self {
        Self { proc_root }
    }
}

impl Default for GetHypridleStatus {
    fn default() -> Self {
        Self::new()
    }
}

fn matches_name(value: &str, name: &str) -> bool {
    let base = Path::new(value)
        .file_name()
        .map_or(value.into(), |n| n.to_string_lossy());
    base.eq_ignore_ascii_case(name)
}

/// Scan a procfs-style tree for a process named `name`, by `comm` or by the
/// first `cmdline` argument.
fn find_process(proc_root: &Path, name: &str) -> std::io::Result<bool> {
    for entry in std::fs::read_dir(proc_root)? {
        let Ok(entry) = entry else { continue };
        let is_pid = entry
            .file_name()
            .to_str()
            .is_some_and(|s| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()));
        if !is_pid {
            continue;
        }

        let dir = entry.path();
        if let Ok(comm) = std::fs::read_to_string(dir.join("comm"))
            && comm.trim().eq_ignore_ascii_case(name)
        {
            return Ok(true);
        }
        if let Ok(cmdline) = std::fs::read(dir.join("cmdline"))
            && let Some(arg0) = cmdline.split(|b| *b == 0).next()
            && !arg0.is_empty()
            && matches_name(&String::from_utf8_lossy(arg0), name)
        {
            return Ok(true);
        }
    }
    Ok(false)
}

impl ActionHandler for GetHypridleStatus {
    fn run<'a>(&'a self, ctx: &'a ActionContext) -> BoxFuture<'a, anyhow::Result<()>> {
        async move {
            let root = self.proc_root.clone();
            let running =
                tokio::task::spawn_blocking(move || find_process(&root, PROCESS_NAME)).await??;
            ctx.print(serde_json::to_string(&IdleStatus::for_state(running))?);
            Ok(())
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_proc(entries: &[(&str, &str, &str)]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (pid, comm, cmdline) in entries {
            let pid_dir = dir.path().join(pid);
            std::fs::create_dir(&pid_dir).unwrap();
            std::fs::write(pid_dir.join("comm"), comm).unwrap();
            std::fs::write(pid_dir.join("cmdline"), cmdline).unwrap();
        }
        dir
    }

    #[test]
    fn test_find_process_by_comm() {
        let proc = fake_proc(&[("1", "systemd\n", "/sbin/init\0"), ("42", "hypridle\n", "")]);
        assert!(find_process(proc.path(), "hypridle").unwrap());
    }

    #[test]
    fn test_find_process_by_cmdline() {
        let proc = fake_proc(&[("7", "hypr-wrapped\n", "/usr/bin/hypridle\0--config\0x")]);
        assert!(find_process(proc.path(), "hypridle").unwrap());
    }

    #[test]
    fn test_find_process_ignores_non_pid_dirs() {
        let proc = fake_proc(&[("self", "hypridle\n", "hypridle\0"), ("9", "bash\n", "bash\0")]);
        assert!(!find_process(proc.path(), "hypridle").unwrap());
    }

    #[test]
    fn test_find_process_missing_root() {
        assert!(find_process(Path::new("/nonexistent/proc"), "hypridle").is_err());
    }

    #[test]
    fn test_status_json() {
        let on = serde_json::to_value(IdleStatus::for_state(true)).unwrap();
        assert_eq!(on["text"], "On");
        assert_eq!(on["class"], "active");

        let off = serde_json::to_value(IdleStatus::for_state(false)).unwrap();
        assert_eq!(off["text"], "Off");
        assert_eq!(off["class"], "notactive");
    }

    #[test]
    fn test_default_uses_procfs() {
        assert_eq!(GetHypridleStatus::default().proc_root, PathBuf::from("/proc"));
        assert_eq!(
            GetHypridleStatus::with_proc_root(PathBuf::from("/x")).proc_root,
            PathBuf::from("/x")
        );
    }
}
