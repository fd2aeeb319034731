use std::fmt;

use chrono::Local;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;

use super::classify::{Classifier, ClassifierConfig};
use super::config::{self, MonitorSettings};
use super::content_rules::ContentRuleList;
use super::controller::Controller;
use super::error::MonitorError;
use super::operator::TerminalOperator;
use super::rotator::UrlRotator;
use super::types::{Cli, ExitOutcome};
use super::webdriver::{WebDriverConfig, WebDriverRenderer};

struct LocalClock;

impl FormatTime for LocalClock {
    fn format_time(&self, w: &mut Writer<'_>) -> fmt::Result {
        write!(w, "[LOG] {}", Local::now().format("%H:%M:%S %:z"))
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(LocalClock)
        .with_target(false)
        .try_init();
}

pub async fn run() -> ExitOutcome {
    let cli = Cli::parse();
    init_logging();

    let outcome = match monitor(&cli).await {
        Ok(outcome) => outcome,
        Err(err) => ExitOutcome::failure(err.to_string()),
    };
    match &outcome {
        ExitOutcome::Success => info!("{outcome}"),
        ExitOutcome::Failure { .. } => error!("{outcome}"),
    }
    outcome
}

async fn monitor(cli: &Cli) -> Result<ExitOutcome, MonitorError> {
    let settings = MonitorSettings::from_cli(cli);
    let rotator = UrlRotator::new(config::product_pages()?)?;
    let classifier = Classifier::new(ClassifierConfig::from_cli(cli))?;
    let rules = ContentRuleList::compile(config::BLOCK_RULES)?;

    info!(
        pages = rotator.len(),
        timeout_secs = settings.load_timeout.as_secs(),
        threshold = settings.challenge_threshold,
        "starting monitor"
    );
    let renderer =
        WebDriverRenderer::connect(&WebDriverConfig::from_cli(cli, settings.load_timeout), &rules)
            .await?;
    let operator = TerminalOperator::new(cli.sounds_dir.clone());

    let mut controller = Controller::new(settings, rotator, classifier, renderer, operator);
    let outcome = controller.run().await;
    controller.into_renderer().shutdown().await;
    Ok(outcome)
}
