//! Best-effort resolution of page and uploaded references into inline images.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use indexmap::IndexMap;
use mangaloom_contracts::{Session, SessionConfig};
use reqwest::blocking::Client as HttpClient;
use serde_json::json;

use crate::providers::{mime_for_path, EncodedImage};
use crate::support::{error_chain_text, truncate_text, RunEvents};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ImageSource {
    /// Already encoded; passed through untouched.
    Inline(EncodedImage),
    DataUrl(String),
    File(PathBuf),
    Remote(String),
}

impl ImageSource {
    /// Classifies a stored image reference. Blank values yield `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        if trimmed.starts_with("data:") {
            return Some(Self::DataUrl(trimmed.to_string()));
        }
        if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            return Some(Self::Remote(trimmed.to_string()));
        }
        let path = trimmed.strip_prefix("file://").unwrap_or(trimmed);
        Some(Self::File(PathBuf::from(path)))
    }

    pub fn label(&self) -> String {
        match self {
            Self::Inline(image) => format!("inline {}", image.mime_type),
            Self::DataUrl(raw) => truncate_text(raw, 48),
            Self::File(path) => path.display().to_string(),
            Self::Remote(url) => url.clone(),
        }
    }
}

pub trait ImageFetcher: Send + Sync {
    fn fetch(&self, url: &str) -> Result<EncodedImage>;
}

#[derive(Debug, Clone)]
pub struct HttpImageFetcher {
    http: HttpClient,
    timeout: Duration,
}

impl HttpImageFetcher {
    pub fn new(timeout: Duration) -> Self {
        Self {
            http: HttpClient::new(),
            timeout,
        }
    }
}

impl ImageFetcher for HttpImageFetcher {
    fn fetch(&self, url: &str) -> Result<EncodedImage> {
        let response = self
            .http
            .get(url)
            .timeout(self.timeout)
            .send()
            .with_context(|| format!("reference download failed ({url})"))?;
        if !response.status().is_success() {
            let code = response.status().as_u16();
            let body = response.text().unwrap_or_default();
            bail!(
                "reference download failed ({code}): {}",
                truncate_text(&body, 256)
            );
        }
        let mime_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.split(';').next().unwrap_or(value).trim().to_string());
        let bytes = response
            .bytes()
            .context("reference body read failed")?
            .to_vec();
        if bytes.is_empty() {
            bail!("reference download returned an empty body ({url})");
        }
        Ok(EncodedImage::from_bytes(&bytes, mime_type.as_deref()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedReference {
    pub source: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct ResolvedReferences {
    pub images: IndexMap<ImageSource, EncodedImage>,
    pub skipped: Vec<SkippedReference>,
}

impl ResolvedReferences {
    /// Resolved images in source order.
    pub fn encoded(&self) -> Vec<EncodedImage> {
        self.images.values().cloned().collect()
    }

    pub fn emit_skipped(&self, events: &RunEvents, page_number: usize) {
        for skipped in &self.skipped {
            events.emit(
                "reference_skipped",
                json!({
                    "page_number": page_number,
                    "source": skipped.source,
                    "reason": skipped.reason,
                }),
            );
        }
    }
}

#[derive(Clone)]
pub struct ReferenceResolver {
    fetcher: Arc<dyn ImageFetcher>,
}

impl std::fmt::Debug for ReferenceResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReferenceResolver").finish_non_exhaustive()
    }
}

impl ReferenceResolver {
    pub fn new(fetcher: Arc<dyn ImageFetcher>) -> Self {
        Self { fetcher }
    }

    pub fn http(timeout: Duration) -> Self {
        Self::new(Arc::new(HttpImageFetcher::new(timeout)))
    }

    /// Resolves at most `limit` distinct sources, omitting any that fail.
    pub fn resolve(&self, sources: &[ImageSource], limit: usize) -> IndexMap<ImageSource, EncodedImage> {
        self.resolve_with_report(sources, limit).images
    }

    pub fn resolve_with_report(&self, sources: &[ImageSource], limit: usize) -> ResolvedReferences {
        let mut out = ResolvedReferences::default();
        let mut seen = 0usize;
        for source in sources {
            if seen >= limit {
                break;
            }
            if out.images.contains_key(source) {
                continue;
            }
            seen += 1;
            match self.resolve_one(source) {
                Ok(image) => {
                    out.images.insert(source.clone(), image);
                }
                Err(err) => {
                    let reason = error_chain_text(&err, 240);
                    tracing::warn!(source = %source.label(), %reason, "skipping reference");
                    out.skipped.push(SkippedReference {
                        source: source.label(),
                        reason,
                    });
                }
            }
        }
        tracing::debug!(
            resolved = out.images.len(),
            skipped = out.skipped.len(),
            "references resolved"
        );
        out
    }

    fn resolve_one(&self, source: &ImageSource) -> Result<EncodedImage> {
        match source {
            ImageSource::Inline(image) => {
                if image.data.is_empty() {
                    bail!("inline reference has no data");
                }
                Ok(image.clone())
            }
            ImageSource::DataUrl(raw) => EncodedImage::parse_data_url(raw)
                .ok_or_else(|| anyhow!("not a base64 data URL")),
            ImageSource::File(path) => {
                let bytes =
                    fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
                if bytes.is_empty() {
                    bail!("{} is empty", path.display());
                }
                Ok(EncodedImage::from_bytes(&bytes, mime_for_path(path)))
            }
            ImageSource::Remote(url) => self.fetcher.fetch(url),
        }
    }
}

/// Page references for the next call: the session's explicit selection when
/// present, otherwise the most recent `window` pages, oldest first.
pub fn page_reference_sources(session: &Session, window: usize) -> Vec<ImageSource> {
    if window == 0 {
        return Vec::new();
    }
    let selected = &session.config.selected_reference_page_ids;
    if !selected.is_empty() {
        return selected
            .iter()
            .filter_map(|page_id| {
                let page = session.page(page_id);
                if page.is_none() {
                    tracing::debug!(%page_id, "selected reference page not in session");
                }
                page
            })
            .filter_map(|page| ImageSource::parse(&page.url))
            .take(window)
            .collect();
    }
    session
        .recent_pages(window)
        .iter()
        .filter_map(|page| ImageSource::parse(&page.url))
        .collect()
}

/// Enabled uploaded references, capped at `max`. Disabled entries are never returned.
pub fn uploaded_reference_sources(config: &SessionConfig, max: usize) -> Vec<ImageSource> {
    config
        .enabled_references()
        .filter_map(|reference| ImageSource::parse(&reference.url))
        .take(max)
        .collect()
}

pub fn reference_sources(session: &Session, page_window: usize, max_uploaded: usize) -> Vec<ImageSource> {
    let mut sources = page_reference_sources(session, page_window);
    sources.extend(uploaded_reference_sources(&session.config, max_uploaded));
    sources
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::{Arc, Mutex};

    use anyhow::{bail, Result};
    use mangaloom_contracts::{Page, RenderConfig, Session, UploadedReference};

    use super::{
        page_reference_sources, reference_sources, uploaded_reference_sources, ImageFetcher,
        ImageSource, ReferenceResolver,
    };
    use crate::providers::EncodedImage;

    const PNG_MAGIC: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];

    #[derive(Default)]
    struct StubFetcher {
        calls: Mutex<Vec<String>>,
    }

    impl ImageFetcher for StubFetcher {
        fn fetch(&self, url: &str) -> Result<EncodedImage> {
            if let Ok(mut calls) = self.calls.lock() {
                calls.push(url.to_string());
            }
            if url.contains("missing") {
                bail!("reference download failed (404): not found");
            }
            Ok(EncodedImage::new("image/webp", "UklGRg=="))
        }
    }

    fn resolver() -> (ReferenceResolver, Arc<StubFetcher>) {
        let fetcher = Arc::new(StubFetcher::default());
        (ReferenceResolver::new(fetcher.clone()), fetcher)
    }

    fn page(url: &str) -> Page {
        Page::new("prompt", url, RenderConfig::default())
    }

    #[test]
    fn parse_classifies_sources() {
        assert!(matches!(
            ImageSource::parse("data:image/png;base64,AAAA"),
            Some(ImageSource::DataUrl(_))
        ));
        assert!(matches!(
            ImageSource::parse("https://cdn.example.com/p1.png"),
            Some(ImageSource::Remote(_))
        ));
        assert_eq!(
            ImageSource::parse("file:///tmp/ref.png"),
            Some(ImageSource::File("/tmp/ref.png".into()))
        );
        assert_eq!(ImageSource::parse("   "), None);
    }

    #[test]
    fn one_failing_source_of_three_is_omitted() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("hero.png");
        fs::write(&path, PNG_MAGIC)?;
        let (resolver, _) = resolver();
        let sources = vec![
            ImageSource::File(path.clone()),
            ImageSource::Remote("https://cdn.example.com/missing.png".to_string()),
            ImageSource::DataUrl("data:image/jpeg;base64,/9j/AA==".to_string()),
        ];

        let report = resolver.resolve_with_report(&sources, 3);
        assert_eq!(report.images.len(), 2);
        assert_eq!(report.skipped.len(), 1);
        assert!(report.skipped[0].reason.contains("404"));

        let keys: Vec<&ImageSource> = report.images.keys().collect();
        assert_eq!(keys[0], &ImageSource::File(path));
        assert_eq!(report.images[0].mime_type, "image/png");
        assert_eq!(report.images[1].mime_type, "image/jpeg");
        Ok(())
    }

    #[test]
    fn limit_bounds_resolution_and_duplicates_collapse() {
        let (resolver, fetcher) = resolver();
        let a = ImageSource::Remote("https://cdn.example.com/a.png".to_string());
        let b = ImageSource::Remote("https://cdn.example.com/b.png".to_string());
        let c = ImageSource::Remote("https://cdn.example.com/c.png".to_string());
        let resolved = resolver.resolve(&[a.clone(), a.clone(), b.clone(), c], 2);
        assert_eq!(resolved.len(), 2);
        assert!(resolved.contains_key(&a) && resolved.contains_key(&b));
        let calls = fetcher.calls.lock().map(|calls| calls.len()).unwrap_or(0);
        assert_eq!(calls, 2);
    }

    #[test]
    fn inline_sources_pass_through_and_bad_data_urls_skip() {
        let (resolver, _) = resolver();
        let inline = EncodedImage::new("image/png", "AAAA");
        let report = resolver.resolve_with_report(
            &[
                ImageSource::Inline(inline.clone()),
                ImageSource::DataUrl("data:image/png,not-base64".to_string()),
            ],
            4,
        );
        assert_eq!(report.encoded(), vec![inline]);
        assert_eq!(report.skipped.len(), 1);
    }

    #[test]
    fn page_sources_use_recent_window_or_explicit_selection() {
        let mut session = Session::new("s1");
        for idx in 1..=4 {
            session.commit_page(page(&format!("https://cdn.example.com/p{idx}.png")));
        }
        let recent = page_reference_sources(&session, 2);
        assert_eq!(
            recent,
            vec![
                ImageSource::Remote("https://cdn.example.com/p3.png".to_string()),
                ImageSource::Remote("https://cdn.example.com/p4.png".to_string()),
            ]
        );

        let first_id = session.pages[0].id.clone();
        session.config.selected_reference_page_ids = vec![first_id, "gone".to_string()];
        assert_eq!(
            page_reference_sources(&session, 3),
            vec![ImageSource::Remote("https://cdn.example.com/p1.png".to_string())]
        );
        assert!(page_reference_sources(&session, 0).is_empty());
    }

    #[test]
    fn disabled_uploads_are_never_sent() {
        let mut session = Session::new("s1");
        session.config.reference_images = vec![
            UploadedReference {
                id: "r1".to_string(),
                name: "hero sheet".to_string(),
                url: "https://cdn.example.com/hero.png".to_string(),
                enabled: true,
            },
            UploadedReference {
                id: "r2".to_string(),
                name: "old villain".to_string(),
                url: "https://cdn.example.com/villain.png".to_string(),
                enabled: false,
            },
        ];
        let uploaded = uploaded_reference_sources(&session.config, 4);
        assert_eq!(
            uploaded,
            vec![ImageSource::Remote("https://cdn.example.com/hero.png".to_string())]
        );

        session.commit_page(page("data:image/png;base64,AAAA"));
        let all = reference_sources(&session, 3, 4);
        assert_eq!(all.len(), 2);
        assert!(matches!(all[0], ImageSource::DataUrl(_)));
    }
}
