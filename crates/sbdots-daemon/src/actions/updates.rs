use std::fmt;
use std::process::Stdio;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::Serialize;
use tokio::process::Command;
use tracing::{debug, warn};

use super::is_installed;
use crate::handler::{ActionContext, ActionHandler};

const THRESHOLD_GREEN: usize = 1;
const THRESHOLD_YELLOW: usize = 25;
const THRESHOLD_RED: usize = 50;

/// Header lines `aur-check-updates` prints before the package list
const AUR_HEADER_LINES: usize = 2;

/// Pending updates for one source
#[derive(Debug, Clone, PartialEq, Eq)]
enum UpdateCount {
    Available(usize),
    NotInstalled(&'static str),
}

impl UpdateCount {
    fn count(&self) -> usize {
        match self {
            Self::Available(n) => *n,
            Self::NotInstalled(_) => 0,
        }
    }
}

impl fmt::Display for UpdateCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Available(n) => write!(f, "{n}"),
            Self::NotInstalled(tool) => write!(f, "{tool} Not-installed"),
        }
    }
}

#[derive(Debug, Serialize, PartialEq, Eq)]
struct UpdatesStatus {
    text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    alt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tooltip: Option<String>,
    class: &'static str,
}

#[derive(Debug)]
struct UpdateSummary {
    pacman: UpdateCount,
    aur: UpdateCount,
    flatpak: UpdateCount,
}

fn css_class(total: usize) -> &'static str {
    match total {
        t if t >= THRESHOLD_RED => "red",
        t if t >= THRESHOLD_YELLOW => "yellow",
        t if t >= THRESHOLD_GREEN => "green",
        _ => "none",
    }
}

impl UpdateSummary {
    fn total(&self) -> usize {
        self.pacman.count() + self.aur.count() + self.flatpak.count()
    }

    fn status(&self) -> UpdatesStatus {
        let total = self.total();
        if total == 0 {
            return UpdatesStatus {
                text: String::new(),
                alt: None,
                tooltip: None,
                class: "none",
            };
        }
        UpdatesStatus {
            text: total.to_string(),
            alt: Some(total.to_string()),
            tooltip: Some(format!(
                "PACMAN updates: {} \nAUR updates: {} \nFlatpak updates: {}",
                self.pacman, self.aur, self.flatpak
            )),
            class: css_class(total),
        }
    }
}

fn count_lines(stdout: &str) -> usize {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        0
    } else {
        trimmed.lines().count()
    }
}

/// Run `program` and count its output lines. The exit status is ignored:
/// `checkupdates` exits non-zero when there is nothing to report.
async fn run_and_count(program: &str, args: &[&str]) -> usize {
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await;
    match output {
        Ok(output) => {
            let n = count_lines(&String::from_utf8_lossy(&output.stdout));
            debug!("{program}: {n} lines");
            n
        }
        Err(e) => {
            warn!("Failed to run {program}: {e}");
            0
        }
    }
}

/// Counts pending pacman, AUR and flatpak updates.
#[derive(Debug, Default)]
pub struct OnCheckUpdates;

impl OnCheckUpdates {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    async fn pacman() -> UpdateCount {
        if !is_installed("checkupdates") {
            return UpdateCount::NotInstalled("'pacman-contrib'");
        }
        UpdateCount::Available(run_and_count("checkupdates", &[]).await)
    }

    async fn aur() -> UpdateCount {
        if !is_installed("yay") && !is_installed("paru") {
            return UpdateCount::NotInstalled("'yay' | 'paru'");
        }
        if !is_installed("aur-check-updates") {
            return UpdateCount::NotInstalled("'aur-check-updates'");
        }
        let lines = run_and_count("aur-check-updates", &[]).await;
        UpdateCount::Available(lines.saturating_sub(AUR_HEADER_LINES))
    }

    async fn flatpak() -> UpdateCount {
        if !is_installed("flatpak") {
            return UpdateCount::NotInstalled("'flatpak'");
        }
        UpdateCount::Available(run_and_count("flatpak", &["remote-ls", "--updates"]).await)
    }
}

impl ActionHandler for OnCheckUpdates {
    fn run<'a>(&'a self, ctx: &'a ActionContext) -> BoxFuture<'a, anyhow::Result<()>> {
        async move {
            let (pacman, aur, flatpak) =
                tokio::join!(Self::pacman(), Self::aur(), Self::flatpak());
            let summary = UpdateSummary {
                pacman,
                aur,
                flatpak,
            };
            ctx.print(serde_json::to_string(&summary.status())?);
            Ok(())
        }
        .boxed()
    }
}
