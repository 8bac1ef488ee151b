pub mod config;
pub mod continuation;
pub mod error;
pub mod orchestrator;
pub mod providers;
pub mod references;
pub mod renderer;
pub mod retry;
pub mod similarity;
mod support;

pub use config::{ConfigError, ContinuationPolicy, EngineConfig};
pub use continuation::{ContinuationRequest, DerivedPrompt, PromptContinuationEngine, PromptSource};
pub use error::{BatchError, GenerationError, PromptDerivationError};
pub use orchestrator::{
    BatchFailure, BatchOrchestrator, BatchOutcome, BatchReport, BatchRequest, CancelToken, Phase,
    Progress, RunHandle, RunState, MAX_BATCH_PAGES,
};
pub use providers::{
    DryrunImageProvider, DryrunTextProvider, EncodedImage, GeminiClient, GeminiImageProvider,
    GeminiTextProvider, ImageProvider, ProviderOutcome, TextProvider,
};
pub use references::{ImageSource, ReferenceResolver};
pub use renderer::{assemble_prompt, GenerationAttempt, PageRenderer, RenderedPage};
pub use retry::{AttemptContext, Ladder, PolicyLadder, TransientPolicy};
pub use similarity::SimilarityGuard;
pub use support::RunEvents;
