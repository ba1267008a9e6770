//! Terminal progress for bootstrap flows.
//!
//! Stage changes are printed as lines on stdout. Within a stage the completion
//! percentage goes to the terminal's native progress bar through OSC 9;4
//! escape sequences (Ghostty, iTerm2, Windows Terminal); other terminals
//! ignore them.

use std::io::{self, Write};

use diaryx_sync::progress::ProgressReceiver;
use diaryx_sync::{BootstrapStage, Progress};
use tokio::task::JoinHandle;

/// Progress bar state values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProgressState {
    Hidden = 0,
    Normal = 1,
    Indeterminate = 3,
}

/// OSC 9;4 sequence: ESC ] 9 ; 4 ; <state> ; <progress> BEL
fn osc_sequence(state: ProgressState, percent: u8) -> String {
    if state == ProgressState::Indeterminate {
        format!("\x1b]9;4;{}\x07", state as u8)
    } else {
        format!("\x1b]9;4;{};{}\x07", state as u8, percent.min(100))
    }
}

fn set_progress(state: ProgressState, percent: u8) {
    // stderr keeps stdout clean for piping
    let _ = io::stderr().write_all(osc_sequence(state, percent).as_bytes());
    let _ = io::stderr().flush();
}

/// Clears the terminal progress bar when dropped.
pub struct ProgressGuard;

impl Drop for ProgressGuard {
    fn drop(&mut self) {
        set_progress(ProgressState::Hidden, 0);
    }
}

/// The line printed when a flow enters `progress.stage`, if any.
fn stage_line(progress: &Progress) -> Option<String> {
    match progress.stage {
        BootstrapStage::Complete => None,
        stage => Some(format!("  {}", stage.description())),
    }
}

/// Debug detail for an update inside a stage. Stage entries have none.
fn detail_line(progress: &Progress) -> Option<String> {
    let message = progress.message.as_deref()?;
    Some(match progress.total {
        0 if progress.completed == 0 => return None,
        0 => message.to_string(),
        total => format!("{}/{} {}", progress.completed, total, message),
    })
}

/// Print updates from `rx` until every reporter is dropped.
pub fn spawn_printer(mut rx: ProgressReceiver) -> JoinHandle<()> {
    tokio::spawn(async move {
        let _guard = ProgressGuard;
        let mut current: Option<BootstrapStage> = None;

        while let Some(progress) = rx.recv().await {
            if current != Some(progress.stage) {
                current = Some(progress.stage);
                if let Some(line) = stage_line(&progress) {
                    println!("{}", line);
                }
            }
            match progress.percent() {
                Some(percent) => set_progress(ProgressState::Normal, percent),
                None => set_progress(ProgressState::Indeterminate, 0),
            }
            if let Some(line) = detail_line(&progress) {
                log::debug!("{}", line);
            }
        }
    })
}
