//! Derives the scene prompt for the next page of a batch from the session so far.

use std::sync::Arc;
use std::time::Duration;

use mangaloom_contracts::{Session, SessionConfig};
use serde_json::json;

use crate::config::EngineConfig;
use crate::error::PromptDerivationError;
use crate::providers::{
    EncodedImage, ProviderOutcome, RequestPart, TextProvider, TextPurpose, TextRequest,
};
use crate::references::{page_reference_sources, ReferenceResolver};
use crate::retry::{RetryError, Sleeper, Step, ThreadSleeper, TransientPolicy};
use crate::similarity::{closest_match, SimilarityGuard};
use crate::support::{error_chain_text, truncate_text, RunEvents};

const SYSTEM_INSTRUCTION: &str = "You are the story writer for a manga series. \
Reply with a single scene description for the next page only: setting, characters, \
action and mood, in two to four sentences. No titles, labels, lists or commentary.";

/// Story beats for the deterministic continuation, cycled so consecutive
/// fallbacks never read alike.
const FALLBACK_BEATS: &[&str] = &[
    "picking up the moment right after it ends as the characters react to what just happened",
    "jumping ahead a little as a new complication forces a change of plans",
    "shifting to a different location where everyone regroups and argues about what comes next",
    "slowing down for a close-up conversation that reveals what one of them is hiding",
    "raising the tension as an unexpected figure arrives and the mood turns",
    "cutting to the aftermath with a wide shot of the consequences before the next move",
];

const EARLIER_PAGE_WINDOW: usize = 4;
const CONTINUATION_TEMPERATURE: f32 = 0.9;

/// Everything the continuation call is derived from.
#[derive(Debug, Clone, Copy)]
pub struct ContinuationRequest<'a> {
    /// Session snapshot holding exactly the pages committed before this one.
    pub session: &'a Session,
    pub original_intent: &'a str,
    /// 1-based page within the batch.
    pub page_number: usize,
    pub total_pages: usize,
    pub config: &'a SessionConfig,
    /// Prompts committed earlier in this run.
    pub prompts_used: &'a [String],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptSource {
    Generated,
    Fallback,
}

impl PromptSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Generated => "generated",
            Self::Fallback => "fallback",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DerivedPrompt {
    pub prompt: String,
    pub source: PromptSource,
    pub similarity_retries: u32,
    /// The similarity bound ran out and the last candidate was accepted anyway.
    pub similarity_exhausted: bool,
}

pub struct PromptContinuationEngine {
    text: Arc<dyn TextProvider>,
    model: String,
    timeout: Duration,
    transient: TransientPolicy,
    guard: SimilarityGuard,
    max_similarity_retries: u32,
    resolver: ReferenceResolver,
    reference_window: usize,
    sleeper: Arc<dyn Sleeper>,
}

impl PromptContinuationEngine {
    pub fn new(text: Arc<dyn TextProvider>, resolver: ReferenceResolver) -> Self {
        Self::from_config(&EngineConfig::default(), text, resolver)
    }

    pub fn from_config(
        config: &EngineConfig,
        text: Arc<dyn TextProvider>,
        resolver: ReferenceResolver,
    ) -> Self {
        Self {
            text,
            model: config.providers.text_model.clone(),
            timeout: config.providers.request_timeout(),
            transient: TransientPolicy::from_settings(&config.retry),
            guard: SimilarityGuard::new(config.similarity.threshold),
            max_similarity_retries: config.similarity.max_retries,
            resolver,
            reference_window: config.references.continuation_window,
            sleeper: Arc::new(ThreadSleeper),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_transient_policy(mut self, transient: TransientPolicy) -> Self {
        self.transient = transient;
        self
    }

    pub fn with_similarity(mut self, guard: SimilarityGuard, max_retries: u32) -> Self {
        self.guard = guard;
        self.max_similarity_retries = max_retries;
        self
    }

    /// Derives the next prompt, substituting a deterministic continuation on failure.
    pub fn derive_or_fallback(&self, request: &ContinuationRequest<'_>, events: &RunEvents) -> DerivedPrompt {
        match self.derive_next_prompt(request, events) {
            Ok(derived) => derived,
            Err(err) => {
                let previous_page = request.session.pages.len();
                let (prompt, repeated) = self.fallback_prompt(previous_page, request.prompts_used);
                tracing::warn!(
                    page_number = request.page_number,
                    error = %err,
                    "continuation failed, using fallback prompt"
                );
                events.emit(
                    "prompt_derivation_fallback",
                    json!({
                        "page_number": request.page_number,
                        "previous_page": previous_page,
                        "error": err.to_string(),
                        "similarity_exhausted": repeated,
                        "prompt": prompt,
                    }),
                );
                DerivedPrompt {
                    prompt,
                    source: PromptSource::Fallback,
                    similarity_retries: 0,
                    similarity_exhausted: repeated,
                }
            }
        }
    }

    /// First fallback beat the guard accepts against this run's prompts. The
    /// flag is set when every beat collides and the page's own beat is kept.
    fn fallback_prompt(&self, previous_page: usize, prompts_used: &[String]) -> (String, bool) {
        let distinct = (0..FALLBACK_BEATS.len())
            .map(|offset| fallback_continuation(previous_page, previous_page + offset))
            .find(|candidate| !self.guard.is_too_similar(candidate, prompts_used));
        match distinct {
            Some(prompt) => (prompt, false),
            None => (fallback_continuation(previous_page, previous_page), true),
        }
    }

    pub fn derive_next_prompt(
        &self,
        request: &ContinuationRequest<'_>,
        events: &RunEvents,
    ) -> Result<DerivedPrompt, PromptDerivationError> {
        let sources = page_reference_sources(request.session, self.reference_window);
        let references = self
            .resolver
            .resolve_with_report(&sources, self.reference_window);
        references.emit_skipped(events, request.page_number);
        let images = references.encoded();

        let mut rejected: Option<String> = None;
        let mut similarity_retries = 0u32;
        loop {
            let text_request = self.build_request(request, &images, rejected.as_deref());
            let candidate = self.generate(&text_request, events)?;
            if !self.guard.is_too_similar(&candidate, request.prompts_used) {
                return Ok(DerivedPrompt {
                    prompt: candidate,
                    source: PromptSource::Generated,
                    similarity_retries,
                    similarity_exhausted: false,
                });
            }

            let (closest, score) = closest_match(&candidate, request.prompts_used).unwrap_or((0, 0.0));
            if similarity_retries >= self.max_similarity_retries {
                tracing::warn!(
                    page_number = request.page_number,
                    score,
                    retries = similarity_retries,
                    "similarity retries exhausted, accepting last candidate"
                );
                events.emit(
                    "similarity_exhausted",
                    json!({
                        "page_number": request.page_number,
                        "retries": similarity_retries,
                        "score": score,
                        "closest_prompt_index": closest,
                        "prompt": truncate_text(&candidate, 400),
                    }),
                );
                return Ok(DerivedPrompt {
                    prompt: candidate,
                    source: PromptSource::Generated,
                    similarity_retries,
                    similarity_exhausted: true,
                });
            }

            similarity_retries += 1;
            tracing::debug!(
                page_number = request.page_number,
                score,
                retry = similarity_retries,
                "candidate too similar to an earlier page"
            );
            events.emit(
                "similarity_retry",
                json!({
                    "page_number": request.page_number,
                    "retry": similarity_retries,
                    "score": score,
                    "closest_prompt_index": closest,
                }),
            );
            rejected = Some(candidate);
        }
    }

    fn generate(&self, request: &TextRequest, events: &RunEvents) -> Result<String, PromptDerivationError> {
        let result = self.transient.run(
            self.sleeper.as_ref(),
            |_ctx| match self.text.generate(request) {
                Ok(ProviderOutcome::Success(text)) => {
                    let cleaned = clean_continuation(&text);
                    if cleaned.is_empty() {
                        Step::Fatal(PromptDerivationError::Empty)
                    } else {
                        Step::Done(cleaned)
                    }
                }
                Ok(ProviderOutcome::Overloaded { reason }) => Step::Transient(reason),
                Ok(ProviderOutcome::Blocked { reason, .. }) => {
                    Step::Fatal(PromptDerivationError::Blocked { reason })
                }
                Ok(ProviderOutcome::Malformed { reason }) => {
                    Step::Fatal(PromptDerivationError::Malformed { reason })
                }
                Err(err) if self.transient.is_transient(&err) => {
                    Step::Transient(error_chain_text(&err, 240))
                }
                Err(err) => Step::Fatal(PromptDerivationError::Provider {
                    reason: error_chain_text(&err, 240),
                }),
            },
            |ctx, delay, reason| {
                tracing::warn!(
                    page_number = request.page_number,
                    attempt = ctx.attempt,
                    delay_ms = delay.as_millis() as u64,
                    %reason,
                    "text provider overloaded, retrying"
                );
                events.emit(
                    "transient_retry",
                    json!({
                        "stage": "continuation",
                        "page_number": request.page_number,
                        "attempt": ctx.attempt,
                        "delay_ms": delay.as_millis() as u64,
                        "reason": reason,
                    }),
                );
            },
        );
        result.map_err(|err| match err {
            RetryError::Exhausted { attempts, reason } => {
                PromptDerivationError::TransientExhausted { attempts, reason }
            }
            RetryError::Fatal(err) => err,
        })
    }

    fn build_request(
        &self,
        request: &ContinuationRequest<'_>,
        images: &[EncodedImage],
        rejected: Option<&str>,
    ) -> TextRequest {
        let mut parts: Vec<RequestPart> = images.iter().cloned().map(RequestPart::Image).collect();
        parts.push(RequestPart::Text(continuation_brief(request, rejected)));
        TextRequest {
            model: self.model.clone(),
            purpose: TextPurpose::Continuation,
            system_instruction: Some(SYSTEM_INSTRUCTION.to_string()),
            parts,
            temperature: CONTINUATION_TEMPERATURE,
            timeout: self.timeout,
            page_number: request.page_number,
            total_pages: request.total_pages,
        }
    }
}

/// Text body of the continuation call. The latest page is the anchor.
fn continuation_brief(request: &ContinuationRequest<'_>, rejected: Option<&str>) -> String {
    let session = request.session;
    let mut sections: Vec<String> = Vec::new();
    sections.push(format!("Original request: {}", request.original_intent.trim()));

    let context = session.context.trim();
    if !context.is_empty() {
        sections.push(format!("Story context:\n{context}"));
    }

    let pages = &session.pages;
    if pages.len() > 1 {
        let earlier_end = pages.len() - 1;
        let earlier_start = earlier_end.saturating_sub(EARLIER_PAGE_WINDOW);
        let lines = pages[earlier_start..earlier_end]
            .iter()
            .enumerate()
            .map(|(offset, page)| format!("- Page {}: {}", earlier_start + offset + 1, page.prompt.trim()))
            .collect::<Vec<String>>();
        sections.push(format!("Earlier pages:\n{}", lines.join("\n")));
    }

    match session.last_page() {
        Some(last) => sections.push(format!(
            "Most recent page (page {}). The new page must continue directly from this moment:\n{}",
            pages.len(),
            last.prompt.trim()
        )),
        None => sections.push(format!(
            "There are no pages yet. Open the story from the original request:\n{}",
            request.original_intent.trim()
        )),
    }

    if !request.prompts_used.is_empty() {
        let lines = request
            .prompts_used
            .iter()
            .map(|prompt| format!("- {}", prompt.trim()))
            .collect::<Vec<String>>();
        sections.push(format!(
            "Prompts already used in this run. Do not repeat any of them:\n{}",
            lines.join("\n")
        ));
    }

    let render = &request.config.render;
    match render.panel_hint() {
        Some(panels) => sections.push(format!(
            "Layout: {}. Plan the scene for about {panels} panel{}.",
            render.layout,
            if panels == 1 { "" } else { "s" }
        )),
        None => sections.push(format!("Layout: {}.", render.layout)),
    }

    if let Some(direction) = request
        .config
        .story_direction
        .as_deref()
        .map(str::trim)
        .filter(|direction| !direction.is_empty())
    {
        sections.push(format!("Story direction: {direction}"));
    }

    if let Some(rejected) = rejected {
        sections.push(format!(
            "Your previous suggestion was too close to an earlier page:\n{}\nWrite a clearly different scene. Change the location, the action or skip ahead in time.",
            rejected.trim()
        ));
    }

    sections.push(format!(
        "Write the scene for page {} of {}.",
        request.page_number, request.total_pages
    ));
    sections.join("\n\n")
}

/// Deterministic continuation used when the text provider cannot produce one.
pub fn fallback_continuation(previous_page: usize, beat: usize) -> String {
    format!(
        "Continue the story from page {previous_page}, {}.",
        FALLBACK_BEATS[beat % FALLBACK_BEATS.len()]
    )
}

/// Strips fences, wrapping quotes and a leading label such as `Page 3:` or `Scene:`.
pub fn clean_continuation(raw: &str) -> String {
    let without_fences = raw
        .lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect::<Vec<&str>>()
        .join(" ");
    let collapsed = without_fences.split_whitespace().collect::<Vec<&str>>().join(" ");
    let unlabeled = strip_label(&collapsed);
    let unquoted = strip_quotes(unlabeled);
    strip_label(unquoted).trim().to_string()
}

fn strip_label(text: &str) -> &str {
    let Some((head, rest)) = text.split_once(':') else {
        return text;
    };
    let head = head.trim().to_ascii_lowercase();
    let numbered = |prefix: &str| {
        head.strip_prefix(prefix)
            .map(|tail| {
                let tail = tail.trim();
                tail.is_empty() || tail.chars().all(|ch| ch.is_ascii_digit())
            })
            .unwrap_or(false)
    };
    let is_label = numbered("page")
        || numbered("scene")
        || head == "prompt"
        || head == "next page"
        || head == "next scene";
    if is_label {
        rest.trim_start()
    } else {
        text
    }
}

fn strip_quotes(text: &str) -> &str {
    let trimmed = text.trim();
    for (open, close) in [('"', '"'), ('\'', '\''), ('“', '”')] {
        if trimmed.len() >= 2 && trimmed.starts_with(open) && trimmed.ends_with(close) {
            return &trimmed[open.len_utf8()..trimmed.len() - close.len_utf8()];
        }
    }
    trimmed
}
