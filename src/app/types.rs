use std::fmt;
use std::path::PathBuf;

use clap::{ArgAction, Parser, ValueEnum};
use url::Url;

#[derive(Debug, Parser, Clone)]
#[command(
    name = "restock-watch",
    version,
    about = "Reloads product pages through WebDriver until stock or a queue shows up"
)]
pub struct Cli {
    #[arg(long, value_name = "SECS", default_value_t = 10)]
    pub load_timeout_secs: u64,

    #[arg(long, value_name = "SECS", default_value_t = 3)]
    pub retry_delay_secs: u64,

    #[arg(long, value_name = "N", default_value_t = 3)]
    pub challenge_threshold: u32,

    #[arg(long, value_name = "CHARS", default_value_t = 1000)]
    pub min_markup_len: usize,

    /// Keep reloading the same page when sold out instead of rotating.
    #[arg(long, default_value_t = false)]
    pub pin_url: bool,

    /// Treat a crashed browser content process as fatal instead of reloading.
    #[arg(long, default_value_t = false)]
    pub fatal_renderer_termination: bool,

    #[arg(long, value_name = "DIR", default_value = ".sounds")]
    pub sounds_dir: PathBuf,

    #[arg(long, value_name = "URL", default_value = "http://localhost:4444")]
    pub webdriver_url: String,

    #[arg(long, value_enum, default_value_t = BrowserArg::Chrome)]
    pub webdriver_browser: BrowserArg,

    #[arg(long, default_value_t = false, action = ArgAction::SetTrue)]
    pub webdriver_headless: bool,

    #[arg(long, value_name = "PATH")]
    pub webdriver_binary: Option<String>,

    #[arg(long, default_value_t = false)]
    pub no_webdriver_autostart: bool,

    #[arg(long, value_name = "MS", default_value_t = 12000)]
    pub webdriver_start_timeout_ms: u64,
}

#[derive(Debug, Copy, Clone, ValueEnum, PartialEq, Eq)]
pub enum BrowserArg {
    Chrome,
    Firefox,
    Edge,
    Safari,
}

/// A product page under watch. Immutable once the catalogue is loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitoredUrl {
    pub id: String,
    pub url: Url,
}

impl fmt::Display for MonitoredUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.url.as_str())
    }
}

/// Identifies one load attempt so late renderer and timer events can be told apart
/// from the ones belonging to the attempt currently in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttemptId(pub u64);

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageVerdict {
    Queued,
    Challenged,
    Stocked(bool),
    Unreadable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuccessCue {
    Alert,
    Success,
}

impl SuccessCue {
    pub fn name(self) -> &'static str {
        match self {
            SuccessCue::Alert => "alert",
            SuccessCue::Success => "success",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitOutcome {
    Success,
    Failure { code: i32, message: String },
}

impl ExitOutcome {
    pub fn failure(message: impl Into<String>) -> Self {
        ExitOutcome::Failure {
            code: 1,
            message: message.into(),
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            ExitOutcome::Success => 0,
            ExitOutcome::Failure { code, .. } => *code,
        }
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitOutcome::Success => f.write_str("[SUCCESS] (0)"),
            ExitOutcome::Failure { code, message } => write!(f, "[ERROR] ({code}): {message}"),
        }
    }
}

/// Everything the controller reacts to arrives through one channel as one of these.
#[derive(Debug)]
pub enum MonitorEvent {
    LoadStarted { attempt: AttemptId },
    NavigationFinished { attempt: AttemptId },
    MarkupReady { attempt: AttemptId, markup: String },
    NavigationFailed { attempt: AttemptId, reason: String },
    WatchdogExpired { attempt: AttemptId },
    RendererTerminated { attempt: AttemptId, reason: String },
    EvaluationFailed { attempt: AttemptId, reason: String },
    RetryDue { ticket: u64 },
    HumanResumed,
}

impl MonitorEvent {
    pub fn label(&self) -> &'static str {
        match self {
            MonitorEvent::LoadStarted { .. } => "load_started",
            MonitorEvent::NavigationFinished { .. } => "navigation_finished",
            MonitorEvent::MarkupReady { .. } => "markup_ready",
            MonitorEvent::NavigationFailed { .. } => "navigation_failed",
            MonitorEvent::WatchdogExpired { .. } => "watchdog_expired",
            MonitorEvent::RendererTerminated { .. } => "renderer_terminated",
            MonitorEvent::EvaluationFailed { .. } => "evaluation_failed",
            MonitorEvent::RetryDue { .. } => "retry_due",
            MonitorEvent::HumanResumed => "human_resumed",
        }
    }
}

pub struct AbortTaskOnDrop(pub tokio::task::AbortHandle);

impl Drop for AbortTaskOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}
