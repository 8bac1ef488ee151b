//! Retry ladders for provider calls.
//!
//! Two independent strategies: exponential backoff for transient overload, and
//! prompt mutation for content-policy blocks. Attempt state travels in an
//! explicit [`AttemptContext`] instead of hidden counters.

use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rand::Rng;
use regex::Regex;

use crate::config::RetrySettings;
use crate::providers::HttpStatusError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ladder {
    Transient,
    PolicyBlock,
}

impl fmt::Display for Ladder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::PolicyBlock => write!(f, "policy-block"),
        }
    }
}

/// Position within one ladder. `attempt` is 1-based and counts provider calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptContext {
    pub ladder: Ladder,
    pub attempt: u32,
}

impl AttemptContext {
    pub fn first(ladder: Ladder) -> Self {
        Self { ladder, attempt: 1 }
    }

    pub fn next(self) -> Self {
        Self {
            ladder: self.ladder,
            attempt: self.attempt.saturating_add(1),
        }
    }
}

pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

pub type TransientClassifier = Arc<dyn Fn(&anyhow::Error) -> bool + Send + Sync>;

pub fn default_transient_classifier() -> TransientClassifier {
    Arc::new(is_transient_error)
}

/// Timeouts, connection failures, and 408/429/5xx statuses anywhere in the chain.
pub fn is_transient_error(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        if let Some(reqwest_err) = cause.downcast_ref::<reqwest::Error>() {
            if reqwest_err.is_timeout() || reqwest_err.is_connect() || reqwest_err.is_request() {
                return true;
            }
            if let Some(status) = reqwest_err.status() {
                return is_transient_status(status.as_u16());
            }
        }
        if let Some(http_err) = cause.downcast_ref::<HttpStatusError>() {
            return is_transient_status(http_err.status);
        }
        if let Some(io_err) = cause.downcast_ref::<std::io::Error>() {
            return matches!(
                io_err.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
            );
        }
        false
    })
}

pub fn is_transient_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500 | 502 | 503 | 504)
}

/// One step of an operation run under [`TransientPolicy::run`].
#[derive(Debug)]
pub enum Step<T, E> {
    Done(T),
    Transient(String),
    Fatal(E),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryError<E> {
    Exhausted { attempts: u32, reason: String },
    Fatal(E),
}

#[derive(Clone)]
pub struct TransientPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter: bool,
    classifier: TransientClassifier,
}

impl fmt::Debug for TransientPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransientPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("jitter", &self.jitter)
            .finish()
    }
}

impl Default for TransientPolicy {
    fn default() -> Self {
        Self::from_settings(&RetrySettings::default())
    }
}

impl TransientPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: max_delay.max(base_delay),
            jitter: false,
            classifier: default_transient_classifier(),
        }
    }

    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self::new(
            settings.max_transient_attempts,
            settings.base_delay(),
            settings.max_delay(),
        )
        .with_jitter(settings.jitter)
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_classifier(mut self, classifier: TransientClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn is_transient(&self, err: &anyhow::Error) -> bool {
        (self.classifier)(err)
    }

    pub fn can_retry(&self, ctx: AttemptContext) -> bool {
        ctx.attempt < self.max_attempts
    }

    /// Wait before retry `retry` (1-based): `base * 2^(retry-1)`, capped, plus up to 20% jitter.
    pub fn delay_before(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(20);
        let raw = self.base_delay.saturating_mul(1u32 << exponent);
        let capped = raw.min(self.max_delay);
        if !self.jitter || capped.is_zero() {
            return capped;
        }
        let spread = capped.as_millis() as u64 / 5;
        if spread == 0 {
            return capped;
        }
        let extra = rand::thread_rng().gen_range(0..=spread);
        capped + Duration::from_millis(extra)
    }

    /// Runs `op` until it completes, fails fatally, or the ladder is exhausted.
    ///
    /// `on_retry` observes every scheduled retry with the context of the failed
    /// attempt, the wait about to happen, and the transient reason.
    pub fn run<T, E>(
        &self,
        sleeper: &dyn Sleeper,
        mut op: impl FnMut(AttemptContext) -> Step<T, E>,
        mut on_retry: impl FnMut(AttemptContext, Duration, &str),
    ) -> Result<T, RetryError<E>> {
        let mut ctx = AttemptContext::first(Ladder::Transient);
        loop {
            match op(ctx) {
                Step::Done(value) => return Ok(value),
                Step::Fatal(err) => return Err(RetryError::Fatal(err)),
                Step::Transient(reason) => {
                    if !self.can_retry(ctx) {
                        return Err(RetryError::Exhausted {
                            attempts: ctx.attempt,
                            reason,
                        });
                    }
                    let delay = self.delay_before(ctx.attempt);
                    on_retry(ctx, delay, &reason);
                    sleeper.sleep(delay);
                    ctx = ctx.next();
                }
            }
        }
    }
}

/// Terms known to trip image safety filters, with their softer stand-ins.
const FLAGGED_TERMS: &[(&str, &str)] = &[
    ("explicit", "artistic"),
    ("nude", "fully clothed"),
    ("naked", "fully clothed"),
    ("nsfw", "tasteful"),
    ("sexy", "stylish"),
    ("sensual", "graceful"),
    ("seductive", "charismatic"),
    ("lingerie", "casual clothing"),
    ("gore", "dramatic tension"),
    ("gory", "dramatic"),
    ("bloody", "battle-worn"),
    ("blood", "red ink splashes"),
    ("decapitated", "defeated"),
    ("dismembered", "defeated"),
    ("mutilated", "wounded"),
    ("corpse", "fallen figure"),
    ("dead body", "fallen figure"),
    ("murder", "confrontation"),
    ("kill", "defeat"),
    ("killing", "defeating"),
    ("stab", "strike"),
    ("stabbing", "striking"),
    ("torture", "interrogation"),
    ("suicide", "despair"),
    ("violent", "intense"),
    ("violence", "conflict"),
    ("brutal", "fierce"),
    ("gun", "prop blaster"),
    ("weapon", "prop"),
    ("drugs", "potions"),
];

const SOFTEN_CLAUSE: &str =
    "Depict this tastefully in a stylized manga illustration, suitable for a general audience.";
const STRONG_CLAUSE: &str = "Render as a family-friendly, non-graphic artistic manga page: \
no gore, no nudity, no graphic injury; convey drama through expressions, composition and atmosphere.";

/// Fully generic scenes used once the user's wording has to be dropped.
const GENERIC_SCENES: &[&str] = &[
    "The main characters pause on a quiet street at dusk, exchanging determined glances as the story moves forward.",
    "A calm interior scene: the characters gather around a table, planning their next step while light streams through a window.",
    "A wide establishing shot of the city skyline, followed by close-ups of the characters reacting with quiet resolve.",
    "The characters walk together along a windswept hillside path, talking as clouds drift overhead.",
    "Morning light fills a busy train platform where one character waves goodbye from an open door.",
    "Rain drums on a rooftop shelter while two figures sit side by side, sharing an umbrella in silence.",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyRung {
    /// Swap flagged terms for softer synonyms and append a softening clause.
    Soften,
    /// Strip flagged terms and append a strong artistic-framing clause.
    Strip,
    /// Discard the wording and use generic scene `n`.
    Generic(usize),
}

impl PolicyRung {
    /// Rung applied for the `rung`-th rewrite (1-based).
    pub fn for_rewrite(rung: u32) -> Self {
        match rung {
            0 | 1 => Self::Soften,
            2 => Self::Strip,
            n => Self::Generic((n as usize - 3) % GENERIC_SCENES.len()),
        }
    }
}

#[derive(Debug, Clone)]
struct SanitizeRule {
    pattern: Regex,
    replacement: &'static str,
}

/// Table-driven content-mutation ladder for policy blocks.
#[derive(Debug, Clone)]
pub struct PolicyLadder {
    max_attempts: u32,
    rules: Vec<SanitizeRule>,
}

impl Default for PolicyLadder {
    fn default() -> Self {
        Self::new(RetrySettings::default().max_policy_attempts)
    }
}

impl PolicyLadder {
    pub fn new(max_attempts: u32) -> Self {
        let mut terms: Vec<&(&str, &'static str)> = FLAGGED_TERMS.iter().collect();
        // longer phrases first so "dead body" wins over shorter overlaps
        terms.sort_by(|left, right| right.0.len().cmp(&left.0.len()));
        let rules = terms
            .into_iter()
            .filter_map(|&(term, replacement)| {
                let pattern = format!(r"(?i)\b{}\b", regex::escape(term));
                Regex::new(&pattern).ok().map(|pattern| SanitizeRule {
                    pattern,
                    replacement,
                })
            })
            .collect();
        Self {
            max_attempts: max_attempts.max(1),
            rules,
        }
    }

    pub fn can_retry(&self, ctx: AttemptContext) -> bool {
        ctx.attempt < self.max_attempts
    }

    /// Generic scene for the `rung`-th rewrite, starting at the rung's own scene
    /// and skipping every scene `collides` rejects.
    ///
    /// `None` when the rung is not generic or every scene collides.
    pub fn distinct_generic_scene(&self, rung: u32, collides: impl Fn(&str) -> bool) -> Option<&'static str> {
        let PolicyRung::Generic(start) = PolicyRung::for_rewrite(rung) else {
            return None;
        };
        (0..GENERIC_SCENES.len())
            .map(|offset| GENERIC_SCENES[(start + offset) % GENERIC_SCENES.len()])
            .find(|scene| !collides(scene))
    }

    /// Flagged terms present in `text`, lowercased, in table order.
    pub fn flagged_terms(&self, text: &str) -> Vec<String> {
        let lowered = text.to_lowercase();
        self.rules
            .iter()
            .filter(|rule| rule.pattern.is_match(&lowered))
            .map(|rule| {
                rule.pattern
                    .find(&lowered)
                    .map(|found| found.as_str().to_string())
                    .unwrap_or_default()
            })
            .collect()
    }

    pub fn soften(&self, text: &str) -> String {
        let replaced = self.rules.iter().fold(text.to_string(), |acc, rule| {
            rule.pattern.replace_all(&acc, rule.replacement).into_owned()
        });
        tidy(&replaced)
    }

    pub fn strip(&self, text: &str) -> String {
        let stripped = self.rules.iter().fold(text.to_string(), |acc, rule| {
            rule.pattern.replace_all(&acc, "").into_owned()
        });
        tidy(&stripped)
    }

    /// Policy-safe rewrite of `original` for the `rung`-th rewrite (1-based).
    ///
    /// Every rung transforms the original text, never the previous rewrite, so
    /// calling the same rung twice yields the same result.
    pub fn next_policy_safe_prompt(&self, original: &str, block_reason: &str, rung: u32) -> String {
        match PolicyRung::for_rewrite(rung) {
            PolicyRung::Soften => {
                let clause = format!("{SOFTEN_CLAUSE}{}", reason_hint(block_reason));
                join_clause(&self.soften(original), &clause)
            }
            PolicyRung::Strip => join_clause(&self.strip(original), STRONG_CLAUSE),
            PolicyRung::Generic(index) => GENERIC_SCENES[index].to_string(),
        }
    }
}

/// Collapses whitespace and pulls punctuation back onto the preceding word.
fn tidy(text: &str) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<&str>>().join(" ");
    let mut out = String::with_capacity(collapsed.len());
    for ch in collapsed.chars() {
        if matches!(ch, ',' | '.' | ';' | ':' | '!' | '?') && out.ends_with(' ') {
            out.pop();
        }
        out.push(ch);
    }
    out.trim().to_string()
}

fn join_clause(body: &str, clause: &str) -> String {
    let body = body.trim();
    if body.is_empty() {
        return clause.to_string();
    }
    if body.ends_with(['.', '!', '?']) {
        format!("{body} {clause}")
    } else {
        format!("{body}. {clause}")
    }
}

fn reason_hint(block_reason: &str) -> &'static str {
    let reason = block_reason.to_ascii_uppercase();
    if reason.contains("IMAGE") {
        " Keep every visual non-graphic."
    } else if reason.contains("SEXUAL") || reason.contains("PROHIBITED") {
        " Keep all characters modestly dressed."
    } else {
        ""
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::{
        is_transient_error, AttemptContext, Ladder, PolicyLadder, PolicyRung, RetryError,
        Sleeper, Step, TransientPolicy,
    };
    use crate::providers::HttpStatusError;

    #[derive(Default)]
    struct RecordingSleeper {
        delays: Mutex<Vec<Duration>>,
    }

    impl Sleeper for RecordingSleeper {
        fn sleep(&self, duration: Duration) {
            if let Ok(mut delays) = self.delays.lock() {
                delays.push(duration);
            }
        }
    }

    fn policy(max_attempts: u32) -> TransientPolicy {
        TransientPolicy::new(
            max_attempts,
            Duration::from_millis(100),
            Duration::from_millis(10_000),
        )
    }

    #[test]
    fn delays_double_and_cap() {
        let policy = TransientPolicy::new(5, Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(policy.delay_before(1), Duration::from_millis(100));
        assert_eq!(policy.delay_before(2), Duration::from_millis(200));
        assert_eq!(policy.delay_before(3), Duration::from_millis(350));
        assert_eq!(policy.delay_before(9), Duration::from_millis(350));
    }

    #[test]
    fn jitter_stays_within_twenty_percent() {
        let policy = policy(4).with_jitter(true);
        for _ in 0..50 {
            let delay = policy.delay_before(2);
            assert!(delay >= Duration::from_millis(200));
            assert!(delay <= Duration::from_millis(240));
        }
    }

    #[test]
    fn transient_run_is_bounded_and_waits_grow() {
        let sleeper = RecordingSleeper::default();
        let mut calls = 0;
        let mut observed = Vec::new();
        let result: Result<(), RetryError<String>> = policy(4).run(
            &sleeper,
            |ctx| {
                calls += 1;
                assert_eq!(ctx.ladder, Ladder::Transient);
                Step::Transient(format!("overloaded #{}", ctx.attempt))
            },
            |ctx, _, _| observed.push(ctx.attempt),
        );

        assert_eq!(calls, 4);
        assert_eq!(observed, vec![1, 2, 3]);
        assert_eq!(
            result,
            Err(RetryError::Exhausted {
                attempts: 4,
                reason: "overloaded #4".to_string()
            })
        );

        let delays = sleeper.delays.lock().map(|d| d.clone()).unwrap_or_default();
        assert_eq!(delays.len(), 3);
        let mut cumulative = Duration::ZERO;
        for delay in delays {
            let next = cumulative + delay;
            assert!(next > cumulative);
            cumulative = next;
        }
    }

    #[test]
    fn transient_run_recovers_and_stops_on_fatal() {
        let sleeper = RecordingSleeper::default();
        let recovered: Result<u32, RetryError<String>> = policy(4).run(
            &sleeper,
            |ctx| {
                if ctx.attempt < 3 {
                    Step::Transient("busy".to_string())
                } else {
                    Step::Done(ctx.attempt)
                }
            },
            |_, _, _| {},
        );
        assert_eq!(recovered, Ok(3));

        let mut calls = 0;
        let fatal: Result<(), RetryError<String>> = policy(4).run(
            &sleeper,
            |_| {
                calls += 1;
                Step::Fatal("bad request".to_string())
            },
            |_, _, _| {},
        );
        assert_eq!(calls, 1);
        assert_eq!(fatal, Err(RetryError::Fatal("bad request".to_string())));
    }

    #[test]
    fn classifier_is_pluggable() {
        let err = anyhow::anyhow!("custom overloaded marker");
        let default_policy = policy(3);
        assert!(!default_policy.is_transient(&err));

        let custom = policy(3).with_classifier(Arc::new(|err: &anyhow::Error| {
            err.to_string().contains("overloaded")
        }));
        assert!(custom.is_transient(&err));
    }

    #[test]
    fn default_classifier_reads_http_status_errors() {
        let overloaded = anyhow::Error::new(HttpStatusError {
            provider: "gemini".to_string(),
            status: 503,
            body: "UNAVAILABLE".to_string(),
        })
        .context("image request failed");
        assert!(is_transient_error(&overloaded));

        let bad_request = anyhow::Error::new(HttpStatusError {
            provider: "gemini".to_string(),
            status: 400,
            body: "invalid argument".to_string(),
        });
        assert!(!is_transient_error(&bad_request));

        let timed_out = anyhow::Error::new(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "deadline elapsed",
        ));
        assert!(is_transient_error(&timed_out));
    }

    #[test]
    fn rungs_escalate_from_soften_to_generic() {
        assert_eq!(PolicyRung::for_rewrite(1), PolicyRung::Soften);
        assert_eq!(PolicyRung::for_rewrite(2), PolicyRung::Strip);
        assert_eq!(PolicyRung::for_rewrite(3), PolicyRung::Generic(0));
        assert_eq!(PolicyRung::for_rewrite(4), PolicyRung::Generic(1));
    }

    #[test]
    fn generic_scene_skips_colliding_scenes() {
        let ladder = PolicyLadder::new(5);
        let own = ladder.next_policy_safe_prompt("a brutal fight", "SAFETY", 3);
        assert_eq!(ladder.distinct_generic_scene(3, |_| false), Some(own.as_str()));

        let skipped = ladder.distinct_generic_scene(3, |scene| scene == own);
        assert!(skipped.is_some());
        assert_ne!(skipped, Some(own.as_str()));

        assert_eq!(ladder.distinct_generic_scene(3, |_| true), None);
        assert_eq!(ladder.distinct_generic_scene(2, |_| false), None);
    }

    #[test]
    fn soften_substitutes_flagged_terms() {
        let ladder = PolicyLadder::new(5);
        let prompt = "An EXPLICIT duel ends with a bloody corpse on the stairs";
        let softened = ladder.next_policy_safe_prompt(prompt, "PROHIBITED_CONTENT", 1);
        assert!(softened.starts_with("An artistic duel ends with a battle-worn fallen figure on the stairs."));
        assert!(softened.contains("tastefully"));
        assert!(ladder.flagged_terms(&softened).is_empty());
    }

    #[test]
    fn strip_removes_flagged_terms_and_tidies_spacing() {
        let ladder = PolicyLadder::new(5);
        let stripped = ladder.strip("The violent storm , with gore everywhere.");
        assert_eq!(stripped, "The storm, with everywhere.");
        let rung_two = ladder.next_policy_safe_prompt("a violent rooftop chase", "SAFETY", 2);
        assert!(rung_two.starts_with("a rooftop chase."));
        assert!(rung_two.contains("family-friendly"));
    }

    #[test]
    fn each_rung_differs_from_the_previous_one() {
        let ladder = PolicyLadder::new(8);
        let original = "A quiet talk between rivals";
        let mut previous = original.to_string();
        for rung in 1..8 {
            let next = ladder.next_policy_safe_prompt(original, "IMAGE_SAFETY", rung);
            assert_ne!(next, previous, "rung {rung} repeated the previous prompt");
            previous = next;
        }
    }

    #[test]
    fn rungs_are_idempotent_per_input() {
        let ladder = PolicyLadder::new(5);
        for rung in 1..5 {
            assert_eq!(
                ladder.next_policy_safe_prompt("a brutal fight", "SAFETY", rung),
                ladder.next_policy_safe_prompt("a brutal fight", "SAFETY", rung)
            );
        }
    }

    #[test]
    fn policy_ladder_bounds_attempts() {
        let ladder = PolicyLadder::new(3);
        let first = AttemptContext::first(Ladder::PolicyBlock);
        assert!(ladder.can_retry(first));
        assert!(ladder.can_retry(first.next()));
        assert!(!ladder.can_retry(first.next().next()));
    }
}
