use crate::intake::CheckoutClient;
use crate::models::{FlowError, ImageStatus, Order};
use crate::notify::Notifier;
use crate::storage::StorageClient;
use crate::store::Store;
use crate::templates::{TemplateRef, resolve_theme};
use crate::tokens::TokenService;
use crate::transform::{TransformClient, TransformConfig};
use crate::worker::{self, SlotSpec};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Service bundle for the fulfillment core. Clients are constructed once and
/// passed in explicitly (no module-scope singletons), so every piece is
/// swappable for an offline double in tests.
#[derive(Clone)]
pub struct Fulfillment {
    pub store: Store,
    pub storage: StorageClient,
    pub transform: Arc<TransformClient>,
    pub notifier: Notifier,
    pub tokens: TokenService,
    pub checkout: CheckoutClient,
}

impl Fulfillment {
    pub fn from_env() -> Self {
        let store = Store::new();
        Self {
            tokens: TokenService::from_env(store.clone()),
            store: store.clone(),
            storage: StorageClient::from_env(),
            transform: Arc::new(TransformClient::new(TransformConfig::from_env())),
            notifier: Notifier::from_env(),
            checkout: CheckoutClient::from_env(),
        }
    }

    /// Fully offline bundle: in-memory tables and object map, deterministic
    /// transform, log-only notifier.
    pub fn demo() -> Self {
        let store = Store::new();
        Self {
            tokens: TokenService::new(store.clone(), b"demo-signing-key".to_vec()),
            store: store.clone(),
            storage: StorageClient::in_memory(),
            transform: Arc::new(TransformClient::new(TransformConfig::offline())),
            notifier: Notifier::in_memory(),
            checkout: CheckoutClient::offline(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub order_id: Uuid,
    pub requested_primary: usize,
    pub requested_bonus: usize,
    pub generated_primary: usize,
    pub generated_bonus: usize,
    pub failures: Vec<SlotFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SlotFailure {
    pub display_order: u32,
    pub template_id: String,
    pub error: String,
}

/// Fan out the generation batch for a new (or re-queued) order: resolve the
/// theme into primary and bonus template sets and run the worker once per
/// slot, sequentially. Each slot failure is caught and logged; one bad slot
/// never aborts the batch. The batch does not advance order status — `Ready`
/// belongs to the review workflow — and an undersized batch is a soft
/// failure that leaves the order `Pending` for manual attention.
pub async fn run_batch(fx: &Fulfillment, order_id: Uuid) -> Result<BatchReport, FlowError> {
    let order = fx
        .store
        .get_order(order_id)
        .await
        .map_err(|err| FlowError::not_found("generate_batch", err.to_string()))?;

    let primary_count = crate::config::primary_slot_count();
    let bonus_count = crate::config::bonus_slot_count();
    let plan = resolve_theme(&order.product_type, primary_count, bonus_count);

    let mut report = BatchReport {
        order_id,
        requested_primary: plan.primary.len(),
        requested_bonus: plan.bonus.len(),
        generated_primary: 0,
        generated_bonus: 0,
        failures: Vec::new(),
    };

    for (idx, template) in plan.primary.iter().enumerate() {
        let slot = idx as u32;
        let caption = plan
            .caption_required
            .then(|| order.pet_name.clone())
            .flatten();
        if run_slot(fx, &order, template, slot, false, caption, &mut report).await {
            report.generated_primary += 1;
        }
    }

    // Bonus slots occupy the range after the primaries; there is no ordering
    // guarantee between the two sets and review may start before this loop
    // finishes.
    for (idx, template) in plan.bonus.iter().enumerate() {
        let slot = (plan.primary.len() + idx) as u32;
        if run_slot(fx, &order, template, slot, true, None, &mut report).await {
            report.generated_bonus += 1;
        }
    }

    if report.generated_primary < crate::config::approval_threshold() {
        warn!(
            target = "pawtraits.orchestrator",
            order_id = %order_id,
            generated = report.generated_primary,
            requested = report.requested_primary,
            "batch fell short of the review threshold, order stays pending"
        );
    } else {
        info!(
            target = "pawtraits.orchestrator",
            order_id = %order_id,
            primary = report.generated_primary,
            bonus = report.generated_bonus,
            "generation batch complete"
        );
    }

    Ok(report)
}

async fn run_slot(
    fx: &Fulfillment,
    order: &Order,
    template: &TemplateRef,
    display_order: u32,
    is_bonus: bool,
    caption: Option<String>,
    report: &mut BatchReport,
) -> bool {
    let spec = SlotSpec {
        order_id: order.id,
        template: template.clone(),
        subject_ref: order.subject_photo.clone(),
        breed: order.breed.clone(),
        details: order.notes.clone(),
        feedback: None,
        caption,
        filename: worker::slot_filename(display_order, is_bonus),
        display_order,
        is_bonus,
        initial_status: ImageStatus::PendingReview,
    };

    match worker::generate(&fx.storage, &fx.transform, &spec).await {
        Ok(image) => {
            fx.store.insert_image_at_slot(image).await;
            crate::metrics::slot_outcome(if is_bonus { "bonus" } else { "primary" }, "ok");
            true
        }
        Err(err) => {
            warn!(
                target = "pawtraits.orchestrator",
                order_id = %order.id,
                slot = display_order,
                template_id = %template.id,
                error = %err,
                "slot generation failed, skipping"
            );
            crate::metrics::slot_outcome(if is_bonus { "bonus" } else { "primary" }, "failed");
            report.failures.push(SlotFailure {
                display_order,
                template_id: template.id.clone(),
                error: err.to_string(),
            });
            false
        }
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::models::Order;

    /// Seed the in-memory object store with every template an order's theme
    /// plan needs, plus the subject photo.
    pub async fn seed_order_assets(fx: &Fulfillment, order: &Order) {
        let plan = resolve_theme(
            &order.product_type,
            crate::config::primary_slot_count(),
            crate::config::bonus_slot_count(),
        );
        for template in plan.primary.iter().chain(plan.bonus.iter()) {
            fx.storage
                .upload(&template.reference, template.id.clone().into_bytes())
                .await
                .unwrap();
        }
        fx.storage
            .upload(&order.subject_photo, b"subject-photo".to_vec())
            .await
            .unwrap();
    }

    pub fn sample_order() -> Order {
        let mut order = Order::new("Ada", "ada@example.com", "royal", "uploads/pets/ada.jpg");
        order.pet_name = Some("Biscuit".into());
        order.breed = Some("corgi".into());
        order
    }
}
