//! Progress reporting for `distribution build`, with TTY detection.
//!
//! One bar position per build stage, falling back to line-at-a-time
//! `eprintln!` when stdout isn't a terminal (CI logs, piped output).

use std::time::Instant;

use indicatif::{ProgressBar, ProgressStyle};
use ldfd_types::jobs::BuildStageName;

pub fn is_tty() -> bool {
    atty::is(atty::Stream::Stdout)
}

pub struct StageProgress {
    is_tty: bool,
    total_stages: usize,
    bar: Option<ProgressBar>,
    start_time: Instant,
}

impl StageProgress {
    pub fn new() -> Self {
        let is_tty = is_tty();
        let bar = if is_tty {
            let pb = ProgressBar::new(BuildStageName::ORDER.len() as u64);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("#>-"),
            );
            Some(pb)
        } else {
            None
        };

        Self {
            is_tty,
            total_stages: BuildStageName::ORDER.len(),
            bar,
            start_time: Instant::now(),
        }
    }

    pub fn start_stage(&self, index: usize, stage: BuildStageName) {
        let elapsed = self.start_time.elapsed();
        let msg = format!("[{}/{}] {}... ({elapsed:?})", index + 1, self.total_stages, stage.as_str());
        if self.is_tty {
            if let Some(bar) = &self.bar {
                bar.set_message(msg);
                bar.set_position(index as u64);
            }
        } else {
            eprintln!("{msg}");
        }
    }

    pub fn finish(self, outcome: &str) {
        let elapsed = self.start_time.elapsed();
        let msg = format!("{outcome} in {elapsed:?}");
        if self.is_tty {
            if let Some(bar) = self.bar {
                bar.set_message(msg);
                bar.finish();
            }
        } else {
            eprintln!("{msg}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_tty_returns_bool() {
        let result = is_tty();
        assert!(matches!(result, true | false));
    }

    #[test]
    fn start_stage_does_not_panic_without_a_tty() {
        let progress = StageProgress::new();
        progress.start_stage(0, BuildStageName::Prepare);
        progress.finish("done");
    }
}
