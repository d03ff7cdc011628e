//! Stderr progress for the interactive subcommands.

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum UiMode {
    #[default]
    Auto,
    Plain,
    Pretty,
}

#[derive(Clone, Debug)]
pub struct Ui {
    pretty: bool,
}

impl Ui {
    /// `Auto` only draws spinners when stderr is a terminal and stdout is
    /// not being captured by another program.
    pub fn new(mode: UiMode, stderr_is_tty: bool, stdout_is_tty: bool) -> Self {
        let pretty = stderr_is_tty
            && match mode {
                UiMode::Pretty => true,
                UiMode::Auto => stdout_is_tty,
                UiMode::Plain => false,
            };
        Self { pretty }
    }

    pub fn is_pretty(&self) -> bool {
        self.pretty
    }

    pub fn stage(&self, name: &str) -> Stage {
        let spinner = if self.pretty {
            let spinner = ProgressBar::new_spinner();
            spinner.set_draw_target(ProgressDrawTarget::stderr());
            spinner.enable_steady_tick(Duration::from_millis(120));
            let style = ProgressStyle::with_template("{spinner} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner());
            spinner.set_style(style);
            spinner.set_message(format!("{name}…"));
            Some(spinner)
        } else {
            eprintln!("==> {}", name);
            None
        };
        Stage {
            name: name.to_string(),
            start: Instant::now(),
            spinner,
            outcome: None,
        }
    }
}

/// A running check. Reports its outcome and duration when dropped.
pub struct Stage {
    name: String,
    start: Instant,
    spinner: Option<ProgressBar>,
    outcome: Option<(bool, String)>,
}

impl Stage {
    pub fn ok(&mut self, detail: impl Into<String>) {
        self.outcome = Some((true, detail.into()));
    }

    pub fn warn(&mut self, detail: impl Into<String>) {
        self.outcome = Some((false, detail.into()));
    }
}

impl Drop for Stage {
    fn drop(&mut self) {
        let message = stage_line(&self.name, self.outcome.as_ref(), self.start.elapsed());
        match &self.spinner {
            Some(spinner) => spinner.finish_with_message(message),
            None => eprintln!("{message}"),
        }
    }
}

fn stage_line(name: &str, outcome: Option<&(bool, String)>, elapsed: Duration) -> String {
    let elapsed = format_duration(elapsed);
    match outcome {
        Some((true, detail)) if !detail.is_empty() => format!("✔ {name}: {detail} ({elapsed})"),
        Some((false, detail)) => format!("✘ {name}: {detail} ({elapsed})"),
        _ => format!("✔ {name} ({elapsed})"),
    }
}

fn format_duration(duration: Duration) -> String {
    if duration.as_secs() >= 1 {
        format!("{:.2}s", duration.as_secs_f64())
    } else {
        format!("{}ms", duration.as_millis())
    }
}
