use crate::models::{Image, ImageKind, ImageStatus};
use crate::storage::{StorageClient, StorageError, is_remote};
use crate::templates::TemplateRef;
use crate::transform::{TransformClient, TransformError};
use ab_glyph::{FontVec, PxScale};
use chrono::Utc;
use image::{DynamicImage, ImageFormat, Rgba};
use imageproc::drawing::draw_text_mut;
use once_cell::sync::Lazy;
use std::io::{Cursor, Write};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

/// One swap job: everything needed to produce a single image slot.
#[derive(Debug, Clone)]
pub struct SlotSpec {
    pub order_id: Uuid,
    pub template: TemplateRef,
    pub subject_ref: String,
    pub breed: Option<String>,
    pub details: Option<String>,
    /// Human review feedback; regeneration appends it to the instruction.
    pub feedback: Option<String>,
    /// Pet-name caption stamped post-transform when the theme asks for it.
    pub caption: Option<String>,
    pub filename: String,
    pub display_order: u32,
    pub is_bonus: bool,
    /// Operator-triggered regeneration inserts `Approved`, everything else
    /// starts in review.
    pub initial_status: ImageStatus,
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("subject photo unavailable: {0}")]
    Subject(StorageError),
    #[error("template unavailable: {0}")]
    Template(#[source] StorageError),
    #[error("transform failed: {0}")]
    Transform(#[from] TransformError),
    #[error("transform returned undecodable image: {0}")]
    Decode(String),
    #[error("upload failed: {0}")]
    Upload(StorageError),
    #[error("temp file error: {0}")]
    TempFile(String),
}

/// Execute one swap job: resolve subject and template bytes, run the opaque
/// transform, stamp, render the locked variant for bonus slots, upload, and
/// return the record for slot insertion. The caller owns the insert so that
/// archive-and-replace stays under the store's slot lock.
pub async fn generate(
    storage: &StorageClient,
    transform: &TransformClient,
    spec: &SlotSpec,
) -> Result<Image, WorkerError> {
    let subject = storage
        .fetch(&spec.subject_ref)
        .await
        .map_err(WorkerError::Subject)?;
    let template_bytes = resolve_template_bytes(storage, &spec.template.reference).await?;

    let instruction = build_instruction(spec);
    let rendered = transform
        .transform(&template_bytes, &subject, &instruction)
        .await?;

    let mut canvas = image::load_from_memory(&rendered)
        .map_err(|err| WorkerError::Decode(err.to_string()))?
        .to_rgba8();

    if let Some(caption) = spec.caption.as_deref() {
        stamp_caption(&mut canvas, caption);
    }

    let clean = encode_png(&DynamicImage::ImageRgba8(canvas.clone()));
    let canonical_path = format!("generated/{}/{}", spec.order_id, spec.filename);
    let canonical_ref = storage
        .upload(&canonical_path, clean)
        .await
        .map_err(WorkerError::Upload)?;

    // Locked bonus slots get a separate watermarked object; the clean render
    // stays the unlock source of truth.
    let public_ref = if spec.is_bonus {
        apply_watermark(&mut canvas);
        let locked = encode_png(&DynamicImage::ImageRgba8(canvas));
        let locked_path = format!("generated/{}/locked-{}", spec.order_id, spec.filename);
        storage
            .upload(&locked_path, locked)
            .await
            .map_err(WorkerError::Upload)?
    } else {
        canonical_ref.clone()
    };

    Ok(Image {
        id: Uuid::new_v4(),
        order_id: spec.order_id,
        kind: ImageKind::Primary,
        is_bonus: spec.is_bonus,
        status: spec.initial_status,
        public_ref,
        canonical_ref,
        display_order: spec.display_order,
        template_id: spec.template.id.clone(),
        theme_name: spec.template.theme_name.clone(),
        product_type: None,
        created_at: Utc::now(),
    })
}

/// Remote templates are downloaded into a scoped temp file before use; the
/// `NamedTempFile` guard removes it on every exit path, success or not.
/// Local and object-store references read directly.
async fn resolve_template_bytes(
    storage: &StorageClient,
    reference: &str,
) -> Result<Vec<u8>, WorkerError> {
    if !is_remote(reference) {
        return storage.fetch(reference).await.map_err(WorkerError::Template);
    }

    let bytes = storage.fetch(reference).await.map_err(WorkerError::Template)?;
    let mut temp = tempfile::NamedTempFile::new()
        .map_err(|err| WorkerError::TempFile(err.to_string()))?;
    temp.write_all(&bytes)
        .map_err(|err| WorkerError::TempFile(err.to_string()))?;
    let data =
        std::fs::read(temp.path()).map_err(|err| WorkerError::TempFile(err.to_string()))?;
    Ok(data)
}

/// Natural-language instruction for the transform backend. Review feedback
/// rides along as an emphasized adjustment so regeneration attempts stay
/// comparable against the same template.
pub fn build_instruction(spec: &SlotSpec) -> String {
    let mut instruction = format!(
        "Repaint the pet from the subject photo into the {} scene, preserving the pet's face, markings and expression.",
        spec.template.theme_name
    );
    if let Some(breed) = spec.breed.as_deref().filter(|s| !s.trim().is_empty()) {
        instruction.push_str(&format!(" The pet is a {breed}."));
    }
    if let Some(details) = spec.details.as_deref().filter(|s| !s.trim().is_empty()) {
        instruction.push_str(&format!(" Additional details: {details}."));
    }
    if let Some(feedback) = spec.feedback.as_deref().filter(|s| !s.trim().is_empty()) {
        instruction.push_str(&format!(" IMPORTANT ADJUSTMENT: {feedback}"));
    }
    instruction
}

static CAPTION_FONT: Lazy<Option<FontVec>> = Lazy::new(|| {
    let path = crate::config::CAPTION_FONT_PATH.as_str();
    match std::fs::read(path) {
        Ok(bytes) => FontVec::try_from_vec(bytes).ok(),
        Err(err) => {
            warn!(
                target = "pawtraits.worker",
                path = path,
                error = %err,
                "caption font unavailable, stamping band only"
            );
            None
        }
    }
});

/// Pet-name caption: a darkened band along the bottom edge, with the name
/// drawn when a caption font is available.
pub fn stamp_caption(canvas: &mut image::RgbaImage, caption: &str) {
    let (width, height) = canvas.dimensions();
    let band_height = (height / 8).max(24);
    for y in height.saturating_sub(band_height)..height {
        for x in 0..width {
            let pixel = canvas.get_pixel_mut(x, y);
            pixel.0[0] = pixel.0[0] / 3;
            pixel.0[1] = pixel.0[1] / 3;
            pixel.0[2] = pixel.0[2] / 3;
        }
    }

    if let Some(font) = CAPTION_FONT.as_ref() {
        let scale = PxScale::from(band_height as f32 * 0.6);
        let x = (width / 2).saturating_sub(caption.len() as u32 * band_height / 5) as i32;
        let y = (height - band_height + band_height / 5) as i32;
        draw_text_mut(canvas, Rgba([245, 240, 220, 255]), x, y, scale, font, caption);
    } else {
        debug!(target = "pawtraits.worker", "caption text skipped, no font");
    }
}

/// Locked-preview watermark: translucent diagonal stripes across the whole
/// frame. Heavy enough to spoil printing, light enough to sell the bonus.
pub fn apply_watermark(canvas: &mut image::RgbaImage) {
    let (width, height) = canvas.dimensions();
    let stripe = (width / 12).max(16);
    for y in 0..height {
        for x in 0..width {
            if ((x + y) / stripe) % 2 == 0 {
                let pixel = canvas.get_pixel_mut(x, y);
                pixel.0[0] = pixel.0[0] / 2 + 110;
                pixel.0[1] = pixel.0[1] / 2 + 110;
                pixel.0[2] = pixel.0[2] / 2 + 110;
            }
        }
    }
}

pub fn encode_png(image: &DynamicImage) -> Vec<u8> {
    let mut buf = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .unwrap_or_default();
    buf
}

pub fn slot_filename(slot: u32, is_bonus: bool) -> String {
    let nonce: u32 = rand::random();
    if is_bonus {
        format!("bonus-{slot}-{nonce:08x}.png")
    } else {
        format!("primary-{slot}-{nonce:08x}.png")
    }
}
