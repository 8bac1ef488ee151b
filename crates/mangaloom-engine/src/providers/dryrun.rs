//! Offline providers for local runs and tests. Output depends only on the request.

use std::io::Cursor;

use anyhow::{Context, Result};
use image::{ImageFormat, Rgb, RgbImage};
use sha2::{Digest, Sha256};

use super::{
    EncodedImage, GeneratedImage, ImageProvider, ImageRequest, ProviderOutcome, TextProvider,
    TextPurpose, TextRequest,
};

const SETTINGS: &[&str] = &[
    "on a rain-slick rooftop at night",
    "inside a crowded market at noon",
    "across a collapsing rope bridge",
    "in a lantern-lit shrine",
    "aboard a speeding cargo train",
    "at the edge of a frozen harbor",
    "beneath the roots of a giant tree",
];

const ACTIONS: &[&str] = &[
    "the hero confronts a masked rival",
    "an old mentor reveals a hidden map",
    "a child steals the hero's pendant",
    "two allies argue over the next move",
    "a messenger collapses with urgent news",
    "the rival's army appears on the horizon",
    "the hero trains until dawn",
    "a storm forces everyone to take shelter",
    "a secret door opens onto a vault",
    "the villain makes an unexpected offer",
    "the heroes share a quiet meal",
];

const LONG_SIDE: u32 = 512;

fn digest(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    out
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DryrunTextProvider;

impl DryrunTextProvider {
    pub fn new() -> Self {
        Self
    }
}

impl TextProvider for DryrunTextProvider {
    fn name(&self) -> &str {
        "dryrun-text"
    }

    fn generate(&self, request: &TextRequest) -> Result<ProviderOutcome<String>> {
        let text = request.text();
        let hash = digest(&[text.as_bytes()]);
        let scene = match request.purpose {
            TextPurpose::Continuation => {
                let setting = SETTINGS[(request.page_number + hash[0] as usize) % SETTINGS.len()];
                let action = ACTIONS[(request.page_number + hash[1] as usize) % ACTIONS.len()];
                format!(
                    "Page {}: {setting}, {action}.",
                    request.page_number.max(1)
                )
            }
            TextPurpose::PolicyRewrite => {
                let setting = SETTINGS[hash[0] as usize % SETTINGS.len()];
                format!("A calm, non-graphic scene {setting} as the story moves forward.")
            }
        };
        Ok(ProviderOutcome::Success(scene))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DryrunImageProvider;

impl DryrunImageProvider {
    pub fn new() -> Self {
        Self
    }
}

impl ImageProvider for DryrunImageProvider {
    fn name(&self) -> &str {
        "dryrun-image"
    }

    fn generate(&self, request: &ImageRequest) -> Result<ProviderOutcome<GeneratedImage>> {
        let (width, height) = dimensions_for_ratio(&request.aspect_ratio);
        let bytes = solid_png(width, height, color_from_prompt(&request.prompt))?;
        Ok(ProviderOutcome::Success(GeneratedImage {
            image: EncodedImage::from_bytes(&bytes, Some("image/png")),
            caption: None,
        }))
    }
}

pub(crate) fn color_from_prompt(prompt: &str) -> (u8, u8, u8) {
    let hash = digest(&[prompt.as_bytes()]);
    (hash[0], hash[1], hash[2])
}

fn dimensions_for_ratio(aspect_ratio: &str) -> (u32, u32) {
    let parsed = aspect_ratio.split_once(':').and_then(|(w, h)| {
        let w = w.trim().parse::<f64>().ok()?;
        let h = h.trim().parse::<f64>().ok()?;
        (w > 0.0 && h > 0.0).then_some((w, h))
    });
    let Some((w, h)) = parsed else {
        return (LONG_SIDE * 3 / 4, LONG_SIDE);
    };
    if w >= h {
        (LONG_SIDE, ((LONG_SIDE as f64) * h / w).round().max(1.0) as u32)
    } else {
        (((LONG_SIDE as f64) * w / h).round().max(1.0) as u32, LONG_SIDE)
    }
}

fn solid_png(width: u32, height: u32, (r, g, b): (u8, u8, u8)) -> Result<Vec<u8>> {
    let mut image = RgbImage::new(width, height);
    for pixel in image.pixels_mut() {
        *pixel = Rgb([r, g, b]);
    }
    let mut buffer = Cursor::new(Vec::new());
    image
        .write_to(&mut buffer, ImageFormat::Png)
        .context("failed to encode dryrun PNG")?;
    Ok(buffer.into_inner())
}
