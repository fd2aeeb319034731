use std::ops::ControlFlow;
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, info, warn};

use super::classify::Classifier;
use super::config::{MonitorSettings, TerminationPolicy};
use super::rotator::UrlRotator;
use super::types::{
    AbortTaskOnDrop, AttemptId, ExitOutcome, MonitorEvent, MonitoredUrl, PageVerdict, SuccessCue,
};
use super::watchdog::LoadWatchdog;

const BEL: &str = "\u{7}";

/// Loads pages on behalf of the controller. Every outcome is reported back as a
/// `MonitorEvent` tagged with the attempt id passed to `load`.
pub trait Renderer {
    fn load(
        &mut self,
        attempt: AttemptId,
        page: &MonitoredUrl,
        events: &UnboundedSender<MonitorEvent>,
    );

    /// Drops any in-flight work. Events for the cancelled attempt must not be sent
    /// afterwards, or must be safe to discard as stale.
    fn cancel(&mut self);
}

/// The human at the terminal: hears the cues and clears challenges.
pub trait Operator {
    fn play_cue(&mut self, cue: SuccessCue);

    /// Must post exactly one `MonitorEvent::HumanResumed` once the human is done.
    fn request_resolution(&mut self, events: &UnboundedSender<MonitorEvent>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptPhase {
    Idle,
    Loading(AttemptId),
    Evaluating(AttemptId),
    AwaitingHuman,
    Terminated,
}

/// Consecutive challenge verdicts since the last other verdict.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ChallengeStreak(u32);

impl ChallengeStreak {
    pub fn count(self) -> u32 {
        self.0
    }

    pub fn record(&mut self) {
        self.0 = self.0.saturating_add(1);
    }

    pub fn reset(&mut self) {
        self.0 = 0;
    }

    pub fn reached(self, threshold: u32) -> bool {
        self.0 >= threshold
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Succeed(SuccessCue),
    RetryChallenge,
    EscalateToHuman,
    NextPage,
    Fail(String),
}

/// Maps a verdict to the next step and updates the streak accordingly.
pub fn decide(verdict: PageVerdict, streak: &mut ChallengeStreak, threshold: u32) -> Decision {
    match verdict {
        PageVerdict::Queued => Decision::Succeed(SuccessCue::Alert),
        PageVerdict::Challenged if streak.reached(threshold) => Decision::EscalateToHuman,
        PageVerdict::Challenged => {
            streak.record();
            Decision::RetryChallenge
        }
        PageVerdict::Stocked(true) => {
            streak.reset();
            Decision::Succeed(SuccessCue::Success)
        }
        PageVerdict::Stocked(false) => {
            streak.reset();
            Decision::NextPage
        }
        PageVerdict::Unreadable(reason) => Decision::Fail(reason),
    }
}

pub struct Controller<R, O> {
    settings: MonitorSettings,
    rotator: UrlRotator,
    classifier: Classifier,
    watchdog: LoadWatchdog,
    renderer: R,
    operator: O,
    streak: ChallengeStreak,
    phase: AttemptPhase,
    attempts: u64,
    retry_ticket: u64,
    retry_timer: Option<AbortTaskOnDrop>,
    events_tx: UnboundedSender<MonitorEvent>,
    events_rx: UnboundedReceiver<MonitorEvent>,
}

impl<R: Renderer, O: Operator> Controller<R, O> {
    pub fn new(
        settings: MonitorSettings,
        rotator: UrlRotator,
        classifier: Classifier,
        renderer: R,
        operator: O,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            settings,
            rotator,
            classifier,
            watchdog: LoadWatchdog::new(),
            renderer,
            operator,
            streak: ChallengeStreak::default(),
            phase: AttemptPhase::Idle,
            attempts: 0,
            retry_ticket: 0,
            retry_timer: None,
            events_tx,
            events_rx,
        }
    }

    #[cfg(test)]
    pub fn phase(&self) -> AttemptPhase {
        self.phase
    }

    #[cfg(test)]
    pub fn streak(&self) -> ChallengeStreak {
        self.streak
    }

    #[cfg(test)]
    pub fn renderer(&self) -> &R {
        &self.renderer
    }

    #[cfg(test)]
    pub fn operator(&self) -> &O {
        &self.operator
    }

    pub fn into_renderer(self) -> R {
        self.renderer
    }

    /// Drives attempts until a terminal outcome. Returns exactly once.
    pub async fn run(&mut self) -> ExitOutcome {
        if self.phase == AttemptPhase::Terminated {
            return ExitOutcome::failure("monitor already terminated");
        }

        self.start_attempt();
        loop {
            let Some(event) = self.events_rx.recv().await else {
                return self.fail("monitor event channel closed".to_string());
            };
            if let ControlFlow::Break(outcome) = self.handle(event) {
                return outcome;
            }
        }
    }

    fn handle(&mut self, event: MonitorEvent) -> ControlFlow<ExitOutcome> {
        match (self.phase, event) {
            (AttemptPhase::Terminated, event) => {
                debug!(event = event.label(), "monitor terminated; event ignored");
            }
            (AttemptPhase::Loading(current), MonitorEvent::LoadStarted { attempt })
                if current == attempt =>
            {
                info!("Began loading {}.", self.rotator.current().id);
            }
            (AttemptPhase::Loading(current), MonitorEvent::NavigationFinished { attempt })
                if current == attempt =>
            {
                self.watchdog.disarm(attempt);
                self.phase = AttemptPhase::Evaluating(attempt);
                info!("Finished loading {}.", self.rotator.current().id);
            }
            (AttemptPhase::Evaluating(current), MonitorEvent::MarkupReady { attempt, markup })
                if current == attempt =>
            {
                let verdict = self.classifier.classify(&markup);
                debug!(?verdict, markup_len = markup.len(), "page classified");
                return self.apply(verdict);
            }
            (AttemptPhase::Loading(current), MonitorEvent::WatchdogExpired { attempt })
                if current == attempt =>
            {
                warn!("Page loading took too long. Reloading...");
                self.renderer.cancel();
                self.start_attempt();
            }
            (AttemptPhase::Loading(current), MonitorEvent::NavigationFailed { attempt, reason })
                if current == attempt =>
            {
                warn!(%reason, "Navigation failed. Retrying shortly...");
                self.stop_attempt(attempt);
                self.schedule_retry(self.settings.retry_delay);
            }
            (
                AttemptPhase::Loading(current) | AttemptPhase::Evaluating(current),
                MonitorEvent::RendererTerminated { attempt, reason },
            ) if current == attempt => {
                self.stop_attempt(attempt);
                match self.settings.renderer_termination {
                    TerminationPolicy::Reload => {
                        warn!(%reason, "Browser content process was terminated! Reloading...");
                        self.start_attempt();
                    }
                    TerminationPolicy::Fail => {
                        return ControlFlow::Break(
                            self.fail(format!("browser content process terminated: {reason}")),
                        );
                    }
                }
            }
            (
                AttemptPhase::Loading(current) | AttemptPhase::Evaluating(current),
                MonitorEvent::EvaluationFailed { attempt, reason },
            ) if current == attempt => {
                self.stop_attempt(attempt);
                return ControlFlow::Break(self.fail(format!("script evaluation failed: {reason}")));
            }
            (AttemptPhase::Idle, MonitorEvent::RetryDue { ticket }) if ticket == self.retry_ticket => {
                self.retry_timer = None;
                self.start_attempt();
            }
            (AttemptPhase::AwaitingHuman, MonitorEvent::HumanResumed) => {
                self.streak.reset();
                info!("Resuming with {}.", self.rotator.current().id);
                self.start_attempt();
            }
            (phase, event) => {
                debug!(?phase, event = event.label(), "stale event ignored");
            }
        }
        ControlFlow::Continue(())
    }

    fn apply(&mut self, verdict: PageVerdict) -> ControlFlow<ExitOutcome> {
        let threshold = self.settings.challenge_threshold;
        let page = self.rotator.current().clone();

        match decide(verdict, &mut self.streak, threshold) {
            Decision::Succeed(cue) => {
                match cue {
                    SuccessCue::Alert => info!("{BEL}The queue for {} is up!", page.id),
                    SuccessCue::Success => info!("{BEL}High five! {} is in stock!", page.id),
                }
                info!("Product page URL: {page}");
                self.terminate();
                self.operator.play_cue(cue);
                return ControlFlow::Break(ExitOutcome::Success);
            }
            Decision::RetryChallenge => {
                info!(
                    streak = self.streak.count(),
                    threshold, "Product page challenge detected! Reloading to get past it..."
                );
                self.schedule_retry(self.settings.retry_delay);
            }
            Decision::EscalateToHuman => {
                self.renderer.cancel();
                self.watchdog.clear();
                self.phase = AttemptPhase::AwaitingHuman;
                warn!("{BEL}Couldn't get past the challenge on {}...", page.id);
                info!("Solve it in the browser window, then press Enter:");
                self.operator.request_resolution(&self.events_tx);
            }
            Decision::NextPage => {
                if self.settings.rotate_on_sold_out {
                    let next = self.rotator.advance();
                    info!("{} is sold out. Trying {} next...", page.id, next.id);
                } else {
                    info!("{} is sold out. Trying again...", page.id);
                }
                self.schedule_retry(self.settings.retry_delay);
            }
            Decision::Fail(reason) => {
                return ControlFlow::Break(
                    self.fail(format!("page markup could not be read: {reason}")),
                );
            }
        }
        ControlFlow::Continue(())
    }

    fn start_attempt(&mut self) {
        self.retry_timer = None;
        self.attempts += 1;
        let attempt = AttemptId(self.attempts);
        let page = self.rotator.current().clone();

        let expired_tx = self.events_tx.clone();
        self.watchdog
            .arm(attempt, self.settings.load_timeout, move || {
                let _ = expired_tx.send(MonitorEvent::WatchdogExpired { attempt });
            });
        self.phase = AttemptPhase::Loading(attempt);
        debug!(%attempt, url = %page, "dispatching load");
        self.renderer.load(attempt, &page, &self.events_tx);
    }

    fn stop_attempt(&mut self, attempt: AttemptId) {
        self.watchdog.disarm(attempt);
        self.renderer.cancel();
        self.phase = AttemptPhase::Idle;
    }

    fn schedule_retry(&mut self, delay: Duration) {
        self.phase = AttemptPhase::Idle;
        self.retry_ticket += 1;
        let ticket = self.retry_ticket;
        let tx = self.events_tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(MonitorEvent::RetryDue { ticket });
        });
        self.retry_timer = Some(AbortTaskOnDrop(handle.abort_handle()));
    }

    fn terminate(&mut self) {
        self.renderer.cancel();
        self.watchdog.clear();
        self.retry_timer = None;
        self.phase = AttemptPhase::Terminated;
    }

    fn fail(&mut self, message: String) -> ExitOutcome {
        self.terminate();
        error!("{message}");
        ExitOutcome::failure(message)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;
    use crate::app::classify::ClassifierConfig;
    use crate::app::config::parse_catalogue;

    #[derive(Debug, Clone)]
    enum Step {
        Page(String),
        Hang,
        Crash,
        NavFail,
        EvalFail,
    }

    #[derive(Default)]
    struct ScriptedRenderer {
        script: VecDeque<Step>,
        loads: Vec<String>,
        cancels: usize,
    }

    impl ScriptedRenderer {
        fn new(steps: impl IntoIterator<Item = Step>) -> Self {
            Self {
                script: steps.into_iter().collect(),
                ..Self::default()
            }
        }
    }

    impl Renderer for ScriptedRenderer {
        fn load(
            &mut self,
            attempt: AttemptId,
            page: &MonitoredUrl,
            events: &UnboundedSender<MonitorEvent>,
        ) {
            self.loads.push(page.id.clone());
            let _ = events.send(MonitorEvent::LoadStarted { attempt });
            match self.script.pop_front().unwrap_or(Step::Hang) {
                Step::Page(markup) => {
                    let _ = events.send(MonitorEvent::NavigationFinished { attempt });
                    let _ = events.send(MonitorEvent::MarkupReady { attempt, markup });
                }
                Step::Hang => {}
                Step::Crash => {
                    let _ = events.send(MonitorEvent::RendererTerminated {
                        attempt,
                        reason: "content process gone".to_string(),
                    });
                }
                Step::NavFail => {
                    let _ = events.send(MonitorEvent::NavigationFailed {
                        attempt,
                        reason: "net::ERR_CONNECTION_RESET".to_string(),
                    });
                }
                Step::EvalFail => {
                    let _ = events.send(MonitorEvent::NavigationFinished { attempt });
                    let _ = events.send(MonitorEvent::EvaluationFailed {
                        attempt,
                        reason: "javascript error".to_string(),
                    });
                }
            }
        }

        fn cancel(&mut self) {
            self.cancels += 1;
        }
    }

    #[derive(Default)]
    struct RecordingOperator {
        cues: Vec<SuccessCue>,
        prompts: usize,
    }

    impl Operator for RecordingOperator {
        fn play_cue(&mut self, cue: SuccessCue) {
            self.cues.push(cue);
        }

        fn request_resolution(&mut self, events: &UnboundedSender<MonitorEvent>) {
            self.prompts += 1;
            let _ = events.send(MonitorEvent::HumanResumed);
        }
    }

    fn settings() -> MonitorSettings {
        MonitorSettings {
            load_timeout: Duration::from_millis(40),
            retry_delay: Duration::from_millis(1),
            ..MonitorSettings::default()
        }
    }

    fn controller(
        settings: MonitorSettings,
        steps: impl IntoIterator<Item = Step>,
    ) -> Controller<ScriptedRenderer, RecordingOperator> {
        let pages = parse_catalogue(&[
            ("disc", "https://shop.test/console/disc"),
            ("digital", "https://shop.test/console/digital"),
        ])
        .expect("catalogue");
        Controller::new(
            settings,
            UrlRotator::new(pages).expect("rotator"),
            Classifier::new(ClassifierConfig::default()).expect("classifier"),
            ScriptedRenderer::new(steps),
            RecordingOperator::default(),
        )
    }

    fn product_page(in_stock: bool) -> String {
        let class = if in_stock { "add-to-cart" } else { "add-to-cart hide" };
        format!(
            r#"<html><body><div class="productHero-info"><div class="button-placeholder"><button class="{class}">Add to Cart</button></div></div><p>{}</p></body></html>"#,
            "Specs and details. ".repeat(60)
        )
    }

    fn challenge_page() -> String {
        "<html><body><p>We\u{2019}re trying to get you in</p></body></html>".to_string()
    }

    fn queue_page() -> String {
        format!(
            "<html><body><p>When you reach the front of the queue</p>{}</body></html>",
            product_page(true)
        )
    }

    #[test]
    fn decision_table() {
        let mut streak = ChallengeStreak::default();
        assert_eq!(
            decide(PageVerdict::Queued, &mut streak, 3),
            Decision::Succeed(SuccessCue::Alert)
        );
        for expected in 1..=3 {
            assert_eq!(
                decide(PageVerdict::Challenged, &mut streak, 3),
                Decision::RetryChallenge
            );
            assert_eq!(streak.count(), expected);
        }
        assert_eq!(
            decide(PageVerdict::Challenged, &mut streak, 3),
            Decision::EscalateToHuman
        );
        assert_eq!(streak.count(), 3);

        assert_eq!(
            decide(PageVerdict::Stocked(false), &mut streak, 3),
            Decision::NextPage
        );
        assert_eq!(streak.count(), 0);

        streak.record();
        assert_eq!(
            decide(PageVerdict::Stocked(true), &mut streak, 3),
            Decision::Succeed(SuccessCue::Success)
        );
        assert_eq!(streak.count(), 0);

        assert_eq!(
            decide(PageVerdict::Unreadable("bad".into()), &mut streak, 3),
            Decision::Fail("bad".into())
        );
    }

    #[tokio::test]
    async fn in_stock_ends_with_one_success_and_one_cue() {
        let mut controller = controller(settings(), [Step::Page(product_page(true))]);

        assert_eq!(controller.run().await, ExitOutcome::Success);
        assert_eq!(controller.phase(), AttemptPhase::Terminated);
        assert_eq!(controller.operator().cues, vec![SuccessCue::Success]);
        assert_eq!(controller.renderer().loads, vec!["disc"]);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(controller.renderer().loads.len(), 1);
    }

    #[tokio::test]
    async fn queue_plays_the_alert_cue() {
        let mut controller = controller(settings(), [Step::Page(queue_page())]);

        assert_eq!(controller.run().await, ExitOutcome::Success);
        assert_eq!(controller.operator().cues, vec![SuccessCue::Alert]);
    }

    #[tokio::test]
    async fn sold_out_rotates_through_both_pages() {
        let mut controller = controller(
            settings(),
            [
                Step::Page(product_page(false)),
                Step::Page(product_page(false)),
                Step::Page(product_page(true)),
            ],
        );

        assert_eq!(controller.run().await, ExitOutcome::Success);
        assert_eq!(controller.renderer().loads, vec!["disc", "digital", "disc"]);
    }

    #[tokio::test]
    async fn pinned_url_never_rotates() {
        let mut controller = controller(
            MonitorSettings {
                rotate_on_sold_out: false,
                ..settings()
            },
            [
                Step::Page(product_page(false)),
                Step::Page(product_page(false)),
                Step::Page(product_page(true)),
            ],
        );

        assert_eq!(controller.run().await, ExitOutcome::Success);
        assert_eq!(controller.renderer().loads, vec!["disc", "disc", "disc"]);
    }

    #[tokio::test]
    async fn fourth_challenge_prompts_the_human() {
        let mut controller = controller(
            settings(),
            [
                Step::Page(challenge_page()),
                Step::Page(challenge_page()),
                Step::Page(challenge_page()),
                Step::Page(challenge_page()),
                Step::Page(product_page(true)),
            ],
        );

        assert_eq!(controller.run().await, ExitOutcome::Success);
        assert_eq!(controller.operator().prompts, 1);
        assert_eq!(
            controller.renderer().loads,
            vec!["disc", "disc", "disc", "disc", "disc"]
        );
        assert_eq!(controller.streak().count(), 0);
    }

    #[tokio::test]
    async fn three_challenges_do_not_prompt() {
        let mut controller = controller(
            settings(),
            [
                Step::Page(challenge_page()),
                Step::Page(challenge_page()),
                Step::Page(challenge_page()),
                Step::Page(product_page(true)),
            ],
        );

        assert_eq!(controller.run().await, ExitOutcome::Success);
        assert_eq!(controller.operator().prompts, 0);
        assert_eq!(controller.renderer().loads, vec!["disc"; 4]);
    }

    #[tokio::test]
    async fn slow_load_is_cancelled_and_retried_on_same_page() {
        let mut controller = controller(settings(), [Step::Hang, Step::Page(product_page(true))]);

        assert_eq!(controller.run().await, ExitOutcome::Success);
        assert_eq!(controller.renderer().loads, vec!["disc", "disc"]);
        assert!(controller.renderer().cancels >= 1);
    }

    #[tokio::test]
    async fn crashed_renderer_reloads_same_page() {
        let mut controller = controller(
            settings(),
            [Step::Crash, Step::Page(product_page(true))],
        );

        assert_eq!(controller.run().await, ExitOutcome::Success);
        assert_eq!(controller.renderer().loads, vec!["disc", "disc"]);
    }

    #[tokio::test]
    async fn crashed_renderer_is_fatal_when_configured() {
        let mut controller = controller(
            MonitorSettings {
                renderer_termination: TerminationPolicy::Fail,
                ..settings()
            },
            [Step::Crash, Step::Page(product_page(true))],
        );

        let outcome = controller.run().await;
        assert_eq!(outcome.exit_code(), 1);
        assert_eq!(controller.renderer().loads.len(), 1);
    }

    #[tokio::test]
    async fn navigation_failure_retries_same_page() {
        let mut controller = controller(
            settings(),
            [Step::NavFail, Step::Page(product_page(true))],
        );

        assert_eq!(controller.run().await, ExitOutcome::Success);
        assert_eq!(controller.renderer().loads, vec!["disc", "disc"]);
    }

    #[tokio::test]
    async fn evaluation_failure_is_fatal() {
        let mut controller = controller(
            settings(),
            [Step::EvalFail, Step::Page(product_page(true))],
        );

        let outcome = controller.run().await;
        assert!(matches!(
            outcome,
            ExitOutcome::Failure { code: 1, ref message } if message.contains("javascript error")
        ));
        assert_eq!(controller.renderer().loads.len(), 1);
        assert!(controller.operator().cues.is_empty());
    }

    #[tokio::test]
    async fn unreadable_markup_is_fatal() {
        let mut controller = controller(
            settings(),
            [Step::Page("plain text ".repeat(200))],
        );

        assert_eq!(controller.run().await.exit_code(), 1);
        assert_eq!(controller.phase(), AttemptPhase::Terminated);
    }

    #[tokio::test]
    async fn stale_events_are_ignored() {
        let mut controller = controller(settings(), [Step::Hang]);
        controller.start_attempt();
        let current = match controller.phase() {
            AttemptPhase::Loading(attempt) => attempt,
            other => panic!("unexpected phase {other:?}"),
        };
        let stale = AttemptId(current.0 + 10);

        for event in [
            MonitorEvent::NavigationFinished { attempt: stale },
            MonitorEvent::WatchdogExpired { attempt: stale },
            MonitorEvent::EvaluationFailed {
                attempt: stale,
                reason: "late".into(),
            },
            MonitorEvent::RetryDue { ticket: 99 },
            MonitorEvent::HumanResumed,
        ] {
            assert!(controller.handle(event).is_continue());
        }
        assert_eq!(controller.phase(), AttemptPhase::Loading(current));
        assert_eq!(controller.renderer().loads.len(), 1);
    }
}
