//! Single-page image generation with both retry ladders.

use std::sync::Arc;
use std::time::Duration;

use mangaloom_contracts::RenderConfig;
use serde_json::json;
use similar::TextDiff;

use crate::config::EngineConfig;
use crate::error::GenerationError;
use crate::providers::{
    BlockStage, EncodedImage, ImageProvider, ImageRequest, ProviderOutcome, RequestPart,
    TextProvider, TextPurpose, TextRequest,
};
use crate::retry::{AttemptContext, Ladder, PolicyLadder, PolicyRung, Sleeper, ThreadSleeper, TransientPolicy};
use crate::similarity::SimilarityGuard;
use crate::support::{error_chain_text, truncate_text, RunEvents};

const REWRITE_INSTRUCTION: &str = "You edit scene descriptions for a manga page that an image \
model refused on content-safety grounds. Keep the characters, setting and story beat, but remove \
or soften anything graphic, sexual or violent. Reply with the rewritten scene only.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    TransientError,
    PolicyBlocked,
    FatalError,
}

/// One provider call made while rendering a page. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationAttempt {
    /// Scene prompt sent on this attempt (before render directives).
    pub prompt: String,
    pub reference_count: usize,
    pub transient: AttemptContext,
    pub policy: AttemptContext,
    pub outcome: AttemptOutcome,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderedPage {
    pub image: EncodedImage,
    pub caption: Option<String>,
    /// Scene prompt that produced the image, after any policy rewrites.
    pub prompt: String,
    pub attempts: Vec<GenerationAttempt>,
    pub policy_rewrites: u32,
}

struct SmartRewriter {
    text: Arc<dyn TextProvider>,
    model: String,
    timeout: Duration,
}

pub struct PageRenderer {
    image: Arc<dyn ImageProvider>,
    model: String,
    timeout: Duration,
    transient: TransientPolicy,
    policy: PolicyLadder,
    guard: SimilarityGuard,
    rewriter: Option<SmartRewriter>,
    sleeper: Arc<dyn Sleeper>,
}

impl PageRenderer {
    pub fn new(image: Arc<dyn ImageProvider>) -> Self {
        Self::from_config(&EngineConfig::default(), image)
    }

    pub fn from_config(config: &EngineConfig, image: Arc<dyn ImageProvider>) -> Self {
        Self {
            image,
            model: config.providers.image_model.clone(),
            timeout: config.providers.request_timeout(),
            transient: TransientPolicy::from_settings(&config.retry),
            policy: PolicyLadder::new(config.retry.max_policy_attempts),
            guard: SimilarityGuard::new(config.similarity.threshold),
            rewriter: None,
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

    pub fn with_policy_ladder(mut self, policy: PolicyLadder) -> Self {
        self.policy = policy;
        self
    }

    /// Guard the generic policy rung uses to avoid repeating earlier prompts.
    pub fn with_similarity_guard(mut self, guard: SimilarityGuard) -> Self {
        self.guard = guard;
        self
    }

    /// Delegates the first two policy rungs to a text model, keeping the
    /// deterministic rung as fallback.
    pub fn with_smart_rewriter(mut self, text: Arc<dyn TextProvider>, model: impl Into<String>) -> Self {
        self.rewriter = Some(SmartRewriter {
            text,
            model: model.into(),
            timeout: self.timeout,
        });
        self
    }

    pub fn render(
        &self,
        prompt: &str,
        config: &RenderConfig,
        references: &[EncodedImage],
        page_number: usize,
        events: &RunEvents,
    ) -> Result<RenderedPage, GenerationError> {
        self.render_avoiding(prompt, config, references, &[], page_number, events)
    }

    /// Renders like [`PageRenderer::render`], keeping generic policy rewrites
    /// apart from `prior_prompts`.
    pub fn render_avoiding(
        &self,
        prompt: &str,
        config: &RenderConfig,
        references: &[EncodedImage],
        prior_prompts: &[String],
        page_number: usize,
        events: &RunEvents,
    ) -> Result<RenderedPage, GenerationError> {
        let mut transient = AttemptContext::first(Ladder::Transient);
        let mut policy = AttemptContext::first(Ladder::PolicyBlock);
        let mut scene = prompt.trim().to_string();
        let mut attempts: Vec<GenerationAttempt> = Vec::new();
        let mut policy_rewrites = 0u32;

        loop {
            let request = ImageRequest {
                model: self.model.clone(),
                prompt: assemble_prompt(&scene, config),
                references: references.to_vec(),
                aspect_ratio: config.aspect_ratio.clone(),
                timeout: self.timeout,
                page_number,
            };
            let mut record = |outcome: AttemptOutcome, detail: Option<String>| {
                attempts.push(GenerationAttempt {
                    prompt: scene.clone(),
                    reference_count: references.len(),
                    transient,
                    policy,
                    outcome,
                    detail,
                });
            };

            let transient_reason = match self.image.generate(&request) {
                Ok(ProviderOutcome::Success(generated)) => {
                    record(AttemptOutcome::Success, None);
                    tracing::debug!(
                        page_number,
                        attempts = attempts.len(),
                        policy_rewrites,
                        "page rendered"
                    );
                    return Ok(RenderedPage {
                        image: generated.image,
                        caption: generated.caption,
                        prompt: scene,
                        attempts,
                        policy_rewrites,
                    });
                }
                Ok(ProviderOutcome::Overloaded { reason }) => reason,
                Err(err) if self.transient.is_transient(&err) => error_chain_text(&err, 240),
                Err(err) => {
                    let reason = error_chain_text(&err, 240);
                    record(AttemptOutcome::FatalError, Some(reason.clone()));
                    tracing::warn!(page_number, %reason, "image provider call failed");
                    return Err(GenerationError::Fatal { reason });
                }
                Ok(ProviderOutcome::Malformed { reason }) => {
                    record(AttemptOutcome::FatalError, Some(reason.clone()));
                    tracing::warn!(page_number, %reason, "malformed image response");
                    return Err(GenerationError::MalformedResponse { reason });
                }
                Ok(ProviderOutcome::Blocked { stage, reason }) => {
                    record(AttemptOutcome::PolicyBlocked, Some(reason.clone()));
                    if !self.policy.can_retry(policy) {
                        tracing::warn!(page_number, attempts = policy.attempt, %reason, "policy ladder exhausted");
                        return Err(GenerationError::PolicyExhausted {
                            attempts: policy.attempt,
                            reason,
                        });
                    }
                    let rung = policy.attempt;
                    let (rewritten, source) = self.rewrite(prompt, &scene, &reason, rung, prior_prompts, page_number);
                    tracing::info!(page_number, rung, block_stage = ?stage, %reason, source, "rewriting blocked prompt");
                    events.emit(
                        "policy_rewrite",
                        json!({
                            "page_number": page_number,
                            "rung": rung,
                            "stage": block_stage_label(stage),
                            "reason": reason,
                            "source": source,
                            "diff": prompt_diff(&scene, &rewritten),
                        }),
                    );
                    scene = rewritten;
                    policy = policy.next();
                    policy_rewrites += 1;
                    continue;
                }
            };

            record(AttemptOutcome::TransientError, Some(transient_reason.clone()));
            if !self.transient.can_retry(transient) {
                tracing::warn!(page_number, attempts = transient.attempt, reason = %transient_reason, "transient ladder exhausted");
                return Err(GenerationError::TransientExhausted {
                    attempts: transient.attempt,
                    reason: transient_reason,
                });
            }
            let delay = self.transient.delay_before(transient.attempt);
            tracing::warn!(
                page_number,
                attempt = transient.attempt,
                delay_ms = delay.as_millis() as u64,
                reason = %transient_reason,
                "image provider overloaded, retrying"
            );
            events.emit(
                "transient_retry",
                json!({
                    "stage": "render",
                    "page_number": page_number,
                    "attempt": transient.attempt,
                    "delay_ms": delay.as_millis() as u64,
                    "reason": transient_reason,
                }),
            );
            self.sleeper.sleep(delay);
            transient = transient.next();
        }
    }

    /// Rewrite for the `rung`-th policy retry. Returns the new scene and how it was produced.
    fn rewrite(
        &self,
        original: &str,
        current: &str,
        reason: &str,
        rung: u32,
        prior_prompts: &[String],
        page_number: usize,
    ) -> (String, &'static str) {
        let deterministic = self.policy.next_policy_safe_prompt(original, reason, rung);
        if matches!(PolicyRung::for_rewrite(rung), PolicyRung::Generic(_)) {
            let distinct = self.policy.distinct_generic_scene(rung, |scene| {
                scene == current || self.guard.is_too_similar(scene, prior_prompts)
            });
            return match distinct {
                Some(scene) => (scene.to_string(), "deterministic"),
                None => {
                    tracing::debug!(page_number, rung, "every generic scene repeats an earlier prompt");
                    (deterministic, "deterministic")
                }
            };
        }
        let Some(rewriter) = self.rewriter.as_ref() else {
            return (deterministic, "deterministic");
        };
        let request = TextRequest {
            model: rewriter.model.clone(),
            purpose: TextPurpose::PolicyRewrite,
            system_instruction: Some(REWRITE_INSTRUCTION.to_string()),
            parts: vec![RequestPart::Text(format!(
                "Block reason: {reason}\n\nScene:\n{}",
                original.trim()
            ))],
            temperature: 0.4,
            timeout: rewriter.timeout,
            page_number,
            total_pages: 0,
        };
        match rewriter.text.generate(&request) {
            Ok(ProviderOutcome::Success(text)) => {
                let text = text.trim().to_string();
                if !text.is_empty() && text != current {
                    return (text, "smart");
                }
                tracing::debug!(page_number, "smart rewrite unusable, using deterministic rung");
            }
            Ok(other) => {
                tracing::debug!(page_number, outcome = ?other, "smart rewrite refused, using deterministic rung");
            }
            Err(err) => {
                tracing::debug!(page_number, error = %err, "smart rewrite failed, using deterministic rung");
            }
        }
        (deterministic, "deterministic")
    }
}

/// Render directives followed by the scene prompt.
pub fn assemble_prompt(scene: &str, config: &RenderConfig) -> String {
    let mut lines = vec![format!(
        "Create a single manga page in {} style with {} inking.",
        config.style, config.inking
    )];
    match config.panel_hint() {
        Some(1) => lines.push(format!("Layout: {}, one full-page panel.", config.layout)),
        Some(panels) => lines.push(format!("Layout: {}, about {panels} panels.", config.layout)),
        None => lines.push(format!("Layout: {}.", config.layout)),
    }
    lines.push(format!("Color: {}.", config.color_mode));
    lines.push(format!(
        "Dialogue: {} density, speech bubbles lettered in {}.",
        config.dialogue_density, config.language
    ));
    lines.push(format!("Aspect ratio: {}.", config.aspect_ratio));
    lines.push(String::new());
    lines.push(format!("Scene: {}", scene.trim()));
    lines.join("\n")
}

fn block_stage_label(stage: BlockStage) -> &'static str {
    match stage {
        BlockStage::Request => "request",
        BlockStage::Candidate => "candidate",
    }
}

fn prompt_diff(prev: &str, curr: &str) -> Vec<String> {
    let prev = format!("{}\n", truncate_text(prev.trim(), 600));
    let curr = format!("{}\n", truncate_text(curr.trim(), 600));
    let diff = TextDiff::from_lines(&prev, &curr);
    diff.unified_diff()
        .header("blocked", "rewrite")
        .to_string()
        .lines()
        .map(str::to_string)
        .collect()
}
