use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use super::controller::Operator;
use super::types::{MonitorEvent, SuccessCue};

const SOUND_EXTENSIONS: &[&str] = &["m4a", "wav", "ogg"];

#[cfg(target_os = "macos")]
const PLAYERS: &[&str] = &["afplay"];
#[cfg(not(target_os = "macos"))]
const PLAYERS: &[&str] = &["paplay", "pw-play", "aplay"];

/// The person at the terminal that started the monitor.
pub struct TerminalOperator {
    sounds_dir: PathBuf,
}

impl TerminalOperator {
    pub fn new(sounds_dir: PathBuf) -> Self {
        Self { sounds_dir }
    }
}

fn find_cue_file(dir: &Path, cue: SuccessCue) -> Option<PathBuf> {
    SOUND_EXTENSIONS
        .iter()
        .map(|ext| dir.join(format!("{}.{ext}", cue.name())))
        .find(|path| path.is_file())
}

fn play_with_any(players: &[&str], file: &Path) -> bool {
    players.iter().any(|player| {
        Command::new(player)
            .arg(file)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    })
}

fn ring_bell() {
    let mut stdout = io::stdout();
    let _ = stdout.write_all(b"\x07");
    let _ = stdout.flush();
}

impl Operator for TerminalOperator {
    // Blocks until playback ends; only called on the way out.
    fn play_cue(&mut self, cue: SuccessCue) {
        let Some(file) = find_cue_file(&self.sounds_dir, cue) else {
            debug!(cue = cue.name(), dir = %self.sounds_dir.display(), "no sound file for cue");
            ring_bell();
            return;
        };
        if !play_with_any(PLAYERS, &file) {
            warn!(file = %file.display(), "could not play sound; falling back to terminal bell");
            ring_bell();
        }
    }

    fn request_resolution(&mut self, events: &UnboundedSender<MonitorEvent>) {
        let events = events.clone();
        tokio::task::spawn_blocking(move || {
            let mut line = String::new();
            match io::stdin().read_line(&mut line) {
                Ok(0) => warn!("stdin closed; resuming without confirmation"),
                Ok(_) => info!("Resuming..."),
                Err(err) => warn!(%err, "failed to read from stdin; resuming"),
            }
            let _ = events.send(MonitorEvent::HumanResumed);
        });
    }
}
