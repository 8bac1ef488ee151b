use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Render directives captured with every committed page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    pub style: String,
    pub inking: String,
    pub layout: String,
    pub language: String,
    pub dialogue_density: String,
    pub color_mode: String,
    pub aspect_ratio: String,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            style: "shonen".to_string(),
            inking: "clean lines".to_string(),
            layout: "dynamic".to_string(),
            language: "English".to_string(),
            dialogue_density: "medium".to_string(),
            color_mode: "black and white".to_string(),
            aspect_ratio: "3:4".to_string(),
        }
    }
}

impl RenderConfig {
    /// Number of panels the layout implies, when it implies one.
    pub fn panel_hint(&self) -> Option<u32> {
        let layout = self.layout.trim().to_ascii_lowercase();
        if layout.is_empty() {
            return None;
        }
        if layout.contains("splash") || layout == "single" || layout.contains("full page") {
            return Some(1);
        }
        let digits: String = layout
            .chars()
            .skip_while(|ch| !ch.is_ascii_digit())
            .take_while(|ch| ch.is_ascii_digit())
            .collect();
        if let Ok(count) = digits.parse::<u32>() {
            return Some(count.clamp(1, 12));
        }
        match layout.as_str() {
            "dynamic" | "action" => Some(5),
            "grid" | "classic" => Some(6),
            "vertical" | "webtoon" => Some(3),
            _ => None,
        }
    }
}

/// A user-uploaded standalone reference image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedReference {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Data URL, local path or http(s) URL.
    pub url: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    #[serde(flatten)]
    pub render: RenderConfig,
    pub reference_images: Vec<UploadedReference>,
    /// When non-empty, only these pages are used as visual references.
    pub selected_reference_page_ids: Vec<String>,
    pub story_direction: Option<String>,
    pub auto_continue: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            render: RenderConfig::default(),
            reference_images: Vec::new(),
            selected_reference_page_ids: Vec::new(),
            story_direction: None,
            auto_continue: true,
        }
    }
}

impl SessionConfig {
    pub fn enabled_references(&self) -> impl Iterator<Item = &UploadedReference> {
        self.reference_images.iter().filter(|reference| reference.enabled)
    }
}

/// One committed generation result. Never rewritten once committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub id: String,
    /// Encoded image as a data URL.
    pub url: String,
    pub prompt: String,
    pub timestamp: String,
    pub config: RenderConfig,
    #[serde(default)]
    pub marked_for_export: bool,
}

impl Page {
    pub fn new(prompt: impl Into<String>, url: impl Into<String>, config: RenderConfig) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            url: url.into(),
            prompt: prompt.into(),
            timestamp: now_utc_iso(),
            config,
            marked_for_export: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: String,
    pub text: String,
    pub ts: String,
}

impl HistoryEntry {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            text: text.into(),
            ts: now_utc_iso(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    #[serde(default)]
    pub title: String,
    /// World and character bible text.
    #[serde(default)]
    pub context: String,
    #[serde(default)]
    pub config: SessionConfig,
    #[serde(default)]
    pub pages: Vec<Page>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    pub created_at: String,
    pub updated_at: String,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        let now = now_utc_iso();
        Self {
            id: id.into(),
            title: String::new(),
            context: String::new(),
            config: SessionConfig::default(),
            pages: Vec::new(),
            history: Vec::new(),
            created_at: now.clone(),
            updated_at: now,
        }
    }

    pub fn last_page(&self) -> Option<&Page> {
        self.pages.last()
    }

    /// The most recent `count` pages, oldest first.
    pub fn recent_pages(&self, count: usize) -> &[Page] {
        let start = self.pages.len().saturating_sub(count);
        &self.pages[start..]
    }

    pub fn page(&self, page_id: &str) -> Option<&Page> {
        self.pages.iter().find(|page| page.id == page_id)
    }

    pub fn commit_page(&mut self, page: Page) {
        self.pages.push(page);
        self.updated_at = now_utc_iso();
    }
}

pub(crate) fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

fn default_true() -> bool {
    true
}
