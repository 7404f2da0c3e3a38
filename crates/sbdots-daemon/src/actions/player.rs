//! Media player status via `playerctl --follow`.

use std::path::PathBuf;
use std::process::Stdio;

use anyhow::Context;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::DaemonError;
use crate::handler::{ActionContext, ActionHandler};

const PLAYERCTL: &str = "playerctl";

/// Tab-separated fields: player, status, artist, title, track id
const METADATA_FORMAT: &str =
    "{{playerName}}\t{{status}}\t{{artist}}\t{{title}}\t{{mpris:trackid}}";

#[derive(Debug, Clone, PartialEq, Eq)]
struct TrackUpdate {
    player: String,
    status: String,
    artist: Option<String>,
    title: Option<String>,
    track_id: String,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
struct PlayerStatus {
    text: String,
    class: String,
    alt: String,
}

fn non_empty(field: &str) -> Option<String> {
    let field = field.trim();
    (!field.is_empty()).then(|| field.to_string())
}

/// Parse one `--follow` line. Blank lines mean no player has metadata.
fn parse_line(line: &str) -> Option<TrackUpdate> {
    let mut fields = line.split('\t');
    let player = non_empty(fields.next()?)?;
    Some(TrackUpdate {
        player,
        status: fields.next().unwrap_or_default().trim().to_string(),
        artist: fields.next().and_then(non_empty),
        title: fields.next().and_then(non_empty),
        track_id: fields.next().unwrap_or_default().trim().to_string(),
    })
}

impl TrackUpdate {
    fn is_advertisement(&self) -> bool {
        self.player == "spotify" && self.track_id.contains(":ad:")
    }

    fn status(&self) -> PlayerStatus {
        let artist = self.artist.as_deref().unwrap_or("Unknown Artist");
        let title = self
            .title
            .as_deref()
            .map_or_else(|| "Unknown Title".to_string(), |t| t.replace('&', "&amp;"));

        let text = if self.is_advertisement() {
            "Advertisement".to_string()
        } else if self.status == "Playing" {
            format!("▶ {artist} - {title}")
        } else {
            format!("⏸ {artist} - {title}")
        };

        PlayerStatus {
            text,
            class: format!("{}-{}", self.player, self.status.to_lowercase()),
            alt: self.player.clone(),
        }
    }
}

/// Streams the current track of the selected player.
///
/// Arguments: `[selected_player] [excluded,players]`.
#[derive(Debug)]
pub struct OnMpdChange {
    program: PathBuf,
    selected_player: Option<String>,
    excluded_players: Vec<String>,
}

impl OnMpdChange {
    /// # Errors
    ///
    /// Fails if a player name contains characters `playerctl` cannot accept.
    pub fn from_args(args: &[String]) -> anyhow::Result<Self> {
        let selected_player = args.first().and_then(|s| non_empty(s));
        let excluded_players: Vec<String> = args
            .get(1)
            .map(|list| list.split(',').filter_map(non_empty).collect())
            .unwrap_or_default();

        for name in selected_player.iter().chain(&excluded_players) {
            if name.chars().any(|c| c.is_control()) {
                anyhow::bail!("invalid player name {name:?}");
            }
        }

        Ok(Self {
            program: PathBuf::from(PLAYERCTL),
            selected_player,
            excluded_players,
        })
    }

    #[cfg(test)]
    fn with_program(mut self, program: PathBuf) -> Self {
        self.program = program;
        self
    }

    fn command_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(player) = &self.selected_player {
            args.push("--player".to_string());
            args.push(player.clone());
        }
        if !self.excluded_players.is_empty() {
            args.push("--ignore-player".to_string());
            args.push(self.excluded_players.join(","));
        }
        args.extend(
            ["--follow", "metadata", "--format", METADATA_FORMAT]
                .iter()
                .map(ToString::to_string),
        );
        args
    }

    async fn follow(&self, ctx: &ActionContext) -> anyhow::Result<()> {
        let mut child = Command::new(&self.program)
            .args(self.command_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to start {PLAYERCTL}"))?;

        let stdout = child
            .stdout
            .take()
            .context("Failed to get playerctl stdout")?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("[{PLAYERCTL}] {line}");
                }
            });
        }

        let mut lines = BufReader::new(stdout).lines();
        let result = loop {
            tokio::select! {
                () = ctx.stopped() => {
                    debug!("'{}' stop requested, clearing output", ctx.action());
                    if let Err(e) = ctx.clear().await {
                        debug!("'{}' could not clear output: {e}", ctx.action());
                    }
                    break Ok(());
                }
                line = lines.next_line() => {
                    let line = match line {
                        Ok(Some(line)) => line,
                        Ok(None) => {
                            let status = child.wait().await?;
                            break Err(anyhow::anyhow!("{PLAYERCTL} exited with {status}"));
                        }
                        Err(e) => break Err(e.into()),
                    };
                    let sent = match parse_line(&line) {
                        Some(update) => ctx.emit(&update.status()).await,
                        None => ctx.clear().await,
                    };
                    match sent {
                        Ok(()) => {}
                        Err(DaemonError::ConnectionLost) => {
                            info!("Connection lost, stopping player follower");
                            break Ok(());
                        }
                        Err(e) => break Err(e.into()),
                    }
                }
            }
        };

        if let Err(e) = child.kill().await {
            debug!("{PLAYERCTL} already exited: {e}");
        }
        result
    }
}

impl ActionHandler for OnMpdChange {
    fn run<'a>(&'a self, ctx: &'a ActionContext) -> BoxFuture<'a, anyhow::Result<()>> {
        self.follow(ctx).boxed()
    }
}
