use crate::models::{FlowError, Image, ImageKind, ImageStatus};
use crate::orchestrator::Fulfillment;
use crate::templates::TemplateRef;
use crate::worker::{self, SlotSpec};
use image::{DynamicImage, Rgba, RgbaImage};
use imageproc::geometric_transformations::{Interpolation, Projection, warp_into};
use tracing::info;
use uuid::Uuid;

/// How a product preview is rendered: geometric placement of the portrait
/// into the product photo, or a full AI composite through the same opaque
/// transform used for portraits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockupStrategy {
    GeometricOverlay,
    AiComposite,
}

/// Product scene: the texture/template to composite against and, for the
/// geometric strategy, the normalized corner quad (unit coordinates,
/// clockwise from top-left) the portrait is warped into.
#[derive(Clone, Copy)]
pub struct ProductScene {
    pub product_type: &'static str,
    pub template_id: &'static str,
    pub reference: &'static str,
    pub strategy: MockupStrategy,
    pub corners: [(f32, f32); 4],
}

const PRODUCT_SCENES: [ProductScene; 3] = [
    ProductScene {
        product_type: "canvas",
        template_id: "scene-canvas",
        reference: "templates/products/canvas.png",
        strategy: MockupStrategy::GeometricOverlay,
        corners: [(0.22, 0.14), (0.78, 0.17), (0.76, 0.86), (0.20, 0.83)],
    },
    ProductScene {
        product_type: "mug",
        template_id: "scene-mug",
        reference: "templates/products/mug.png",
        strategy: MockupStrategy::GeometricOverlay,
        corners: [(0.30, 0.32), (0.68, 0.30), (0.68, 0.74), (0.30, 0.72)],
    },
    ProductScene {
        product_type: "framed_print",
        template_id: "scene-framed-print",
        reference: "templates/products/framed_print.png",
        strategy: MockupStrategy::AiComposite,
        corners: [(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0)],
    },
];

fn scene_for(product_type: &str) -> Option<(usize, &'static ProductScene)> {
    PRODUCT_SCENES
        .iter()
        .enumerate()
        .find(|(_, scene)| scene.product_type == product_type)
}

// Upsell records sit above the portrait slot range so mockups never collide
// with generation slots.
const UPSELL_SLOT_BASE: u32 = 100;

/// Produce (or return the cached) product mockup for an order. The chosen
/// portrait is the customer's selection when present, otherwise the first
/// approved portrait, otherwise the first portrait at all.
pub async fn create_mockup(
    fx: &Fulfillment,
    order_id: Uuid,
    product_type: &str,
) -> Result<Image, FlowError> {
    let (scene_index, scene) = scene_for(product_type)
        .ok_or_else(|| FlowError::invalid_input("mockup", format!("unknown product `{product_type}`")))?;

    // idempotent per (order, template, product): unchanged pairs are never
    // regenerated on every view
    if let Some(cached) = fx
        .store
        .find_mockup(order_id, scene.template_id, product_type)
        .await
    {
        return Ok(cached);
    }

    let order = fx
        .store
        .get_order(order_id)
        .await
        .map_err(|err| FlowError::not_found("mockup", err.to_string()))?;
    let portrait = pick_portrait(fx, order_id, order.selected_image_id).await?;

    let display_order = UPSELL_SLOT_BASE + scene_index as u32;
    let mut record = match scene.strategy {
        MockupStrategy::GeometricOverlay => {
            compose_geometric(fx, &order.id, &portrait, scene, display_order).await?
        }
        MockupStrategy::AiComposite => {
            compose_via_transform(fx, &order, &portrait, scene, display_order).await?
        }
    };

    record.kind = ImageKind::Upsell;
    record.product_type = Some(product_type.to_string());
    let id = fx.store.insert_image_at_slot(record).await;
    let record = fx
        .store
        .get_image(id)
        .await
        .map_err(|err| FlowError::internal("mockup", err.to_string()))?;

    info!(
        target = "pawtraits.mockup",
        order_id = %order_id,
        product = product_type,
        strategy = ?scene.strategy,
        "mockup generated"
    );
    Ok(record)
}

async fn pick_portrait(
    fx: &Fulfillment,
    order_id: Uuid,
    selected: Option<Uuid>,
) -> Result<Image, FlowError> {
    if let Some(image_id) = selected {
        return fx
            .store
            .get_image(image_id)
            .await
            .map_err(|err| FlowError::internal("mockup", err.to_string()));
    }
    let portraits: Vec<Image> = fx
        .store
        .images_for_order(order_id)
        .await
        .into_iter()
        .filter(|image| image.kind == ImageKind::Primary)
        .collect();
    portraits
        .iter()
        .find(|image| image.status == ImageStatus::Approved)
        .or_else(|| portraits.first())
        .cloned()
        .ok_or_else(|| FlowError::invalid_input("mockup", "order has no portrait yet"))
}

/// Geometric strategy: perspective-warp the portrait into the scene's corner
/// quad, then multiply-blend the product texture on top so its shading shows
/// through the artwork.
async fn compose_geometric(
    fx: &Fulfillment,
    order_id: &Uuid,
    portrait: &Image,
    scene: &ProductScene,
    display_order: u32,
) -> Result<Image, FlowError> {
    let portrait_bytes = fx
        .storage
        .fetch(&portrait.canonical_ref)
        .await
        .map_err(|err| FlowError::internal("mockup", err.to_string()))?;
    let texture_bytes = fx
        .storage
        .fetch(scene.reference)
        .await
        .map_err(|err| FlowError::internal("mockup", err.to_string()))?;

    let portrait_raster = image::load_from_memory(&portrait_bytes)
        .map_err(|err| FlowError::internal("mockup", err.to_string()))?
        .to_rgba8();
    let texture = image::load_from_memory(&texture_bytes)
        .map_err(|err| FlowError::internal("mockup", err.to_string()))?
        .to_rgba8();

    let composed = overlay_into_quad(&portrait_raster, &texture, scene.corners)
        .ok_or_else(|| FlowError::internal("mockup", "degenerate corner quad"))?;

    let filename = format!("mockup-{}-{}.png", scene.product_type, portrait.id.simple());
    let path = format!("generated/{order_id}/{filename}");
    let reference = fx
        .storage
        .upload(&path, worker::encode_png(&DynamicImage::ImageRgba8(composed)))
        .await
        .map_err(|err| FlowError::internal("mockup", err.to_string()))?;

    Ok(upsell_record(
        *order_id,
        scene,
        reference,
        portrait.theme_name.clone(),
        display_order,
    ))
}

/// AI strategy: the same opaque transform as portraits, with the portrait as
/// subject and the product scene as template.
async fn compose_via_transform(
    fx: &Fulfillment,
    order: &crate::models::Order,
    portrait: &Image,
    scene: &ProductScene,
    display_order: u32,
) -> Result<Image, FlowError> {
    let spec = SlotSpec {
        order_id: order.id,
        template: TemplateRef {
            id: scene.template_id.to_string(),
            reference: scene.reference.to_string(),
            theme_name: portrait.theme_name.clone(),
        },
        subject_ref: portrait.canonical_ref.clone(),
        breed: None,
        details: Some(format!(
            "Place the finished portrait naturally on the {} product",
            scene.product_type
        )),
        feedback: None,
        caption: None,
        filename: format!("mockup-{}-{}.png", scene.product_type, portrait.id.simple()),
        display_order,
        is_bonus: false,
        initial_status: ImageStatus::Approved,
    };
    worker::generate(&fx.storage, &fx.transform, &spec)
        .await
        .map_err(|err| FlowError::internal("mockup", err.to_string()))
}

fn upsell_record(
    order_id: Uuid,
    scene: &ProductScene,
    reference: String,
    theme_name: String,
    display_order: u32,
) -> Image {
    Image {
        id: Uuid::new_v4(),
        order_id,
        kind: ImageKind::Upsell,
        is_bonus: false,
        status: ImageStatus::Approved,
        public_ref: reference.clone(),
        canonical_ref: reference,
        display_order,
        template_id: scene.template_id.to_string(),
        theme_name,
        product_type: Some(scene.product_type.to_string()),
        created_at: chrono::Utc::now(),
    }
}

/// Warp `portrait` into the normalized `corners` quad of `texture`'s frame,
/// then multiply-blend the texture over the warped layer.
pub fn overlay_into_quad(
    portrait: &RgbaImage,
    texture: &RgbaImage,
    corners: [(f32, f32); 4],
) -> Option<RgbaImage> {
    let (tw, th) = texture.dimensions();
    let (pw, ph) = portrait.dimensions();

    let from = [
        (0.0, 0.0),
        (pw as f32, 0.0),
        (pw as f32, ph as f32),
        (0.0, ph as f32),
    ];
    let to = [
        (corners[0].0 * tw as f32, corners[0].1 * th as f32),
        (corners[1].0 * tw as f32, corners[1].1 * th as f32),
        (corners[2].0 * tw as f32, corners[2].1 * th as f32),
        (corners[3].0 * tw as f32, corners[3].1 * th as f32),
    ];
    let projection = Projection::from_control_points(from, to)?;

    let mut layer = RgbaImage::from_pixel(tw, th, Rgba([0, 0, 0, 0]));
    warp_into(
        portrait,
        &projection,
        Interpolation::Bilinear,
        Rgba([0, 0, 0, 0]),
        &mut layer,
    );

    let mut out = texture.clone();
    for (x, y, pixel) in out.enumerate_pixels_mut() {
        let warped = layer.get_pixel(x, y);
        if warped.0[3] == 0 {
            continue;
        }
        // multiply keeps the product's shading visible through the artwork
        for channel in 0..3 {
            pixel.0[channel] =
                ((pixel.0[channel] as u16 * warped.0[channel] as u16) / 255) as u8;
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::testutil::{sample_order, seed_order_assets};
    use crate::orchestrator::run_batch;
    use crate::worker::encode_png;

    async fn generated_order(fx: &Fulfillment) -> Uuid {
        let order = sample_order();
        seed_order_assets(fx, &order).await;
        let order_id = fx.store.insert_order(order).await;
        run_batch(fx, order_id).await.unwrap();
        order_id
    }

    async fn seed_scene(fx: &Fulfillment, scene: &ProductScene) {
        let texture = RgbaImage::from_pixel(200, 160, Rgba([180, 170, 150, 255]));
        fx.storage
            .upload(
                scene.reference,
                encode_png(&DynamicImage::ImageRgba8(texture)),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn geometric_mockup_is_created_and_cached() {
        let fx = Fulfillment::demo();
        let order_id = generated_order(&fx).await;
        let (_, scene) = scene_for("canvas").unwrap();
        seed_scene(&fx, scene).await;

        let first = create_mockup(&fx, order_id, "canvas").await.unwrap();
        assert_eq!(first.kind, ImageKind::Upsell);
        assert_eq!(first.product_type.as_deref(), Some("canvas"));
        assert_eq!(first.status, ImageStatus::Approved);
        assert!(first.display_order >= UPSELL_SLOT_BASE);

        let second = create_mockup(&fx, order_id, "canvas").await.unwrap();
        assert_eq!(first.id, second.id);

        let upsells = fx
            .store
            .images_for_order(order_id)
            .await
            .into_iter()
            .filter(|i| i.kind == ImageKind::Upsell)
            .count();
        assert_eq!(upsells, 1);
    }

    #[tokio::test]
    async fn ai_composite_mockup_runs_offline() {
        let fx = Fulfillment::demo();
        let order_id = generated_order(&fx).await;
        let (_, scene) = scene_for("framed_print").unwrap();
        seed_scene(&fx, scene).await;

        let mockup = create_mockup(&fx, order_id, "framed_print").await.unwrap();
        assert_eq!(mockup.kind, ImageKind::Upsell);
        assert_eq!(mockup.template_id, "scene-framed-print");
        let bytes = fx.storage.fetch(&mockup.canonical_ref).await.unwrap();
        assert!(image::load_from_memory(&bytes).is_ok());
    }

    #[tokio::test]
    async fn unknown_product_rejected() {
        let fx = Fulfillment::demo();
        let order_id = generated_order(&fx).await;
        let err = create_mockup(&fx, order_id, "skateboard").await.unwrap_err();
        assert_eq!(err.kind(), crate::models::FlowErrorKind::InvalidInput);
    }

    #[test]
    fn overlay_keeps_texture_dimensions() {
        let portrait = RgbaImage::from_pixel(64, 64, Rgba([200, 100, 50, 255]));
        let texture = RgbaImage::from_pixel(120, 90, Rgba([255, 255, 255, 255]));
        let corners = [(0.25, 0.25), (0.75, 0.25), (0.75, 0.75), (0.25, 0.75)];
        let out = overlay_into_quad(&portrait, &texture, corners).unwrap();
        assert_eq!(out.dimensions(), (120, 90));
        // center carries the multiplied portrait, corners stay pure texture
        assert_eq!(out.get_pixel(1, 1).0, [255, 255, 255, 255]);
        assert_eq!(out.get_pixel(60, 45).0[0], 200);
    }
}
