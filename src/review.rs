use crate::models::{
    FlowError, Image, ImageStatus, OrderStatus, RevisionMetadata,
};
use crate::orchestrator::Fulfillment;
use crate::store::StoreError;
use crate::templates::find_template;
use crate::worker::{self, SlotSpec};
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeSet;
use tracing::{info, warn};
use uuid::Uuid;

/// Who asked for the regeneration. The post-regeneration status policy is
/// per caller role: operators get the auto-approve fast path, customer
/// requests go back through review.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegenSource {
    Operator,
    Customer,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReviewOutcome {
    pub order_id: Uuid,
    pub order_status: OrderStatus,
    pub approved_count: usize,
    /// Whether this operation fired the "portraits ready" notification.
    pub notified: bool,
}

/// Already-approved images are tolerated as no-ops, matching `approve_bulk`,
/// so replayed approvals behave the same either way.
pub async fn approve(fx: &Fulfillment, image_id: Uuid) -> Result<ReviewOutcome, FlowError> {
    let image = fx.store.get_image(image_id).await.map_err(store_error)?;
    let order_id = if image.status == ImageStatus::Approved {
        image.order_id
    } else {
        transition(fx, image_id, ImageStatus::Approved).await?
    };
    recompute_completion(fx, order_id).await
}

/// Rejection only flags the slot for operator or customer-visible retry; it
/// never auto-triggers regeneration.
pub async fn reject(fx: &Fulfillment, image_id: Uuid) -> Result<ReviewOutcome, FlowError> {
    let order_id = transition(fx, image_id, ImageStatus::Rejected).await?;
    let order = fx
        .store
        .get_order(order_id)
        .await
        .map_err(store_error)?;
    Ok(ReviewOutcome {
        order_id,
        order_status: order.status,
        approved_count: fx.store.approved_count(order_id).await,
        notified: false,
    })
}

/// Approve a set in one call. Side effects are computed once against the
/// post-bulk-update state, so bulk-approving a set behaves exactly like
/// approving one at a time and still fires at most one completion
/// notification. Already-approved ids are tolerated as no-ops.
pub async fn approve_bulk(
    fx: &Fulfillment,
    image_ids: &[Uuid],
) -> Result<Vec<ReviewOutcome>, FlowError> {
    let mut orders = BTreeSet::new();
    for &image_id in image_ids {
        let image = fx.store.get_image(image_id).await.map_err(store_error)?;
        if image.status == ImageStatus::Approved {
            orders.insert(image.order_id);
            continue;
        }
        let order_id = transition(fx, image_id, ImageStatus::Approved).await?;
        orders.insert(order_id);
    }

    let mut outcomes = Vec::with_capacity(orders.len());
    for order_id in orders {
        outcomes.push(recompute_completion(fx, order_id).await?);
    }
    Ok(outcomes)
}

/// Regenerate one slot with the original template and optional human
/// feedback. The superseded image is archived and the successor takes the
/// same `display_order`; repeated attempts stay comparable because the
/// template never changes.
pub async fn regenerate(
    fx: &Fulfillment,
    image_id: Uuid,
    feedback: Option<String>,
    source: RegenSource,
) -> Result<Image, FlowError> {
    let previous = fx.store.get_image(image_id).await.map_err(store_error)?;
    if previous.status == ImageStatus::Archived {
        return Err(FlowError::invalid_input(
            "regenerate",
            "image already superseded",
        ));
    }
    let order = fx
        .store
        .get_order(previous.order_id)
        .await
        .map_err(store_error)?;

    let template = find_template(&previous.template_id).ok_or_else(|| {
        FlowError::internal(
            "regenerate",
            format!("template `{}` no longer in any pool", previous.template_id),
        )
    })?;

    let theme = crate::templates::resolve_theme(&previous.theme_name, 0, 0);
    let spec = SlotSpec {
        order_id: order.id,
        template,
        subject_ref: order.subject_photo.clone(),
        breed: order.breed.clone(),
        details: order.notes.clone(),
        feedback: feedback.clone(),
        caption: theme
            .caption_required
            .then(|| order.pet_name.clone())
            .flatten(),
        filename: worker::slot_filename(previous.display_order, previous.is_bonus),
        display_order: previous.display_order,
        is_bonus: previous.is_bonus,
        initial_status: match source {
            RegenSource::Operator => ImageStatus::Approved,
            RegenSource::Customer => ImageStatus::PendingReview,
        },
    };

    let replacement = worker::generate(&fx.storage, &fx.transform, &spec)
        .await
        .map_err(|err| FlowError::internal("regenerate", err.to_string()))?;
    let replacement_id = fx.store.insert_image_at_slot(replacement).await;
    let replacement = fx
        .store
        .get_image(replacement_id)
        .await
        .map_err(store_error)?;

    match source {
        RegenSource::Operator => {
            // auto-approved successor can tip the order over the threshold
            recompute_completion(fx, order.id).await?;
        }
        RegenSource::Customer => {
            fx.store
                .update_order_with(order.id, |order| {
                    order.revision_metadata = Some(RevisionMetadata {
                        selected_image_ids: vec![image_id],
                        reference_photo_urls: vec![order.subject_photo.clone()],
                        feedback: feedback.clone(),
                        requested_at: Utc::now(),
                    });
                    if order.status == OrderStatus::Ready
                        && order.status.can_transition_to(OrderStatus::Revising)
                    {
                        order.status = OrderStatus::Revising;
                    }
                })
                .await
                .map_err(store_error)?;
        }
    }

    info!(
        target = "pawtraits.review",
        order_id = %order.id,
        slot = replacement.display_order,
        template_id = %replacement.template_id,
        source = ?source,
        "slot regenerated"
    );
    Ok(replacement)
}

/// Recount approvals and advance the order exactly once. The status
/// transition under the table lock is itself the idempotency guard for the
/// ready notification; post-approval automation failures are logged and
/// never rolled back into the approval.
async fn recompute_completion(
    fx: &Fulfillment,
    order_id: Uuid,
) -> Result<ReviewOutcome, FlowError> {
    let approved = fx.store.approved_count(order_id).await;
    let threshold = crate::config::approval_threshold();

    let notify = fx
        .store
        .update_order_with(order_id, |order| {
            if approved >= threshold
                && !order.status.review_complete()
                && order.status.can_transition_to(OrderStatus::Ready)
            {
                order.status = OrderStatus::Ready;
                true
            } else {
                false
            }
        })
        .await
        .map_err(store_error)?;

    let order = fx.store.get_order(order_id).await.map_err(store_error)?;
    if notify {
        let link = crate::notify::portal_link(&order);
        if let Err(err) = fx.notifier.order_ready(&order, &link).await {
            warn!(
                target = "pawtraits.review",
                order_id = %order_id,
                error = %err,
                "ready notification failed, approval stands"
            );
        }
    }

    Ok(ReviewOutcome {
        order_id,
        order_status: order.status,
        approved_count: approved,
        notified: notify,
    })
}

async fn transition(
    fx: &Fulfillment,
    image_id: Uuid,
    next: ImageStatus,
) -> Result<Uuid, FlowError> {
    let image = fx.store.get_image(image_id).await.map_err(store_error)?;
    fx.store
        .transition_image(image_id, next)
        .await
        .map_err(|err| match err {
            StoreError::IllegalImageTransition { .. } => {
                FlowError::invalid_input("review", err.to_string())
            }
            other => store_error(other),
        })?;
    Ok(image.order_id)
}

fn store_error(err: StoreError) -> FlowError {
    match err {
        StoreError::OrderNotFound(_) | StoreError::ImageNotFound(_) => {
            FlowError::not_found("review", err.to_string())
        }
        other => FlowError::internal("review", other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ImageKind;
    use crate::orchestrator::testutil::{sample_order, seed_order_assets};
    use crate::orchestrator::{Fulfillment, run_batch};

    async fn generated_order(fx: &Fulfillment) -> Uuid {
        let order = sample_order();
        seed_order_assets(fx, &order).await;
        let order_id = fx.store.insert_order(order).await;
        run_batch(fx, order_id).await.unwrap();
        order_id
    }

    async fn primary_ids(fx: &Fulfillment, order_id: Uuid) -> Vec<Uuid> {
        fx.store
            .images_for_order(order_id)
            .await
            .into_iter()
            .filter(|i| i.kind == ImageKind::Primary && !i.is_bonus)
            .map(|i| i.id)
            .collect()
    }

    #[tokio::test]
    async fn threshold_flips_order_and_notifies_exactly_once() {
        let fx = Fulfillment::demo();
        let order_id = generated_order(&fx).await;
        let primaries = primary_ids(&fx, order_id).await;
        assert_eq!(primaries.len(), 5);

        for (idx, image_id) in primaries.iter().enumerate() {
            let outcome = approve(&fx, *image_id).await.unwrap();
            if idx < 4 {
                assert_eq!(outcome.order_status, OrderStatus::Pending);
                assert!(!outcome.notified);
            } else {
                assert_eq!(outcome.order_status, OrderStatus::Ready);
                assert!(outcome.notified);
            }
        }

        // a sixth approval must not re-notify
        let bonus = fx
            .store
            .images_for_order(order_id)
            .await
            .into_iter()
            .find(|i| i.is_bonus)
            .unwrap();
        let outcome = approve(&fx, bonus.id).await.unwrap();
        assert_eq!(outcome.order_status, OrderStatus::Ready);
        assert!(!outcome.notified);

        let ready_mails: Vec<_> = fx
            .notifier
            .outbox()
            .await
            .into_iter()
            .filter(|n| n.kind == "order_ready")
            .collect();
        assert_eq!(ready_mails.len(), 1);
    }

    #[tokio::test]
    async fn bulk_matches_one_at_a_time() {
        let fx = Fulfillment::demo();
        let order_id = generated_order(&fx).await;
        let primaries = primary_ids(&fx, order_id).await;

        let outcomes = approve_bulk(&fx, &primaries).await.unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].order_status, OrderStatus::Ready);
        assert!(outcomes[0].notified);
        assert_eq!(outcomes[0].approved_count, 5);

        let ready_mails = fx
            .notifier
            .outbox()
            .await
            .into_iter()
            .filter(|n| n.kind == "order_ready")
            .count();
        assert_eq!(ready_mails, 1);

        // replaying the bulk call is a no-op with no second notification
        let outcomes = approve_bulk(&fx, &primaries).await.unwrap();
        assert!(!outcomes[0].notified);
        let ready_mails = fx
            .notifier
            .outbox()
            .await
            .into_iter()
            .filter(|n| n.kind == "order_ready")
            .count();
        assert_eq!(ready_mails, 1);
    }

    #[tokio::test]
    async fn mockups_do_not_count_toward_the_threshold() {
        let fx = Fulfillment::demo();
        let order_id = generated_order(&fx).await;
        let texture = image::RgbaImage::from_pixel(200, 160, image::Rgba([180, 170, 150, 255]));
        fx.storage
            .upload(
                "templates/products/canvas.png",
                crate::worker::encode_png(&image::DynamicImage::ImageRgba8(texture)),
            )
            .await
            .unwrap();
        crate::mockup::create_mockup(&fx, order_id, "canvas")
            .await
            .unwrap();

        // four portrait approvals plus an approved mockup must not complete
        let primaries = primary_ids(&fx, order_id).await;
        for image_id in &primaries[..4] {
            let outcome = approve(&fx, *image_id).await.unwrap();
            assert_eq!(outcome.order_status, OrderStatus::Pending);
            assert!(!outcome.notified);
        }

        let outcome = approve(&fx, primaries[4]).await.unwrap();
        assert_eq!(outcome.order_status, OrderStatus::Ready);
        assert!(outcome.notified);
    }

    #[tokio::test]
    async fn unlocked_bonus_images_do_not_count_toward_the_threshold() {
        let fx = Fulfillment::demo();
        let order_id = generated_order(&fx).await;
        crate::unlock::unlock_bonus(&fx, order_id).await.unwrap();

        // unlock force-approves the five bonus images; one portrait approval
        // afterward must leave the order pending
        let target = primary_ids(&fx, order_id).await[0];
        let outcome = approve(&fx, target).await.unwrap();
        assert_eq!(outcome.approved_count, 1);
        assert_eq!(outcome.order_status, OrderStatus::Pending);
        assert!(!outcome.notified);
    }

    #[tokio::test]
    async fn replayed_single_approval_is_a_no_op() {
        let fx = Fulfillment::demo();
        let order_id = generated_order(&fx).await;
        let primaries = primary_ids(&fx, order_id).await;

        for image_id in &primaries {
            approve(&fx, *image_id).await.unwrap();
        }
        // a second pass over already-approved ids succeeds without
        // re-notifying, same as replaying the bulk call
        for image_id in &primaries {
            let outcome = approve(&fx, *image_id).await.unwrap();
            assert_eq!(outcome.order_status, OrderStatus::Ready);
            assert!(!outcome.notified);
        }

        let ready_mails = fx
            .notifier
            .outbox()
            .await
            .into_iter()
            .filter(|n| n.kind == "order_ready")
            .count();
        assert_eq!(ready_mails, 1);
    }

    #[tokio::test]
    async fn regeneration_preserves_slot_and_template() {
        let fx = Fulfillment::demo();
        let order_id = generated_order(&fx).await;
        let target = primary_ids(&fx, order_id).await[1];
        let before = fx.store.get_image(target).await.unwrap();

        let replacement = regenerate(
            &fx,
            target,
            Some("warmer background".into()),
            RegenSource::Customer,
        )
        .await
        .unwrap();

        assert_eq!(replacement.display_order, before.display_order);
        assert_eq!(replacement.template_id, before.template_id);
        assert_eq!(replacement.status, ImageStatus::PendingReview);

        let superseded = fx.store.get_image(target).await.unwrap();
        assert_eq!(superseded.status, ImageStatus::Archived);

        let occupants = fx
            .store
            .images_for_order(order_id)
            .await
            .into_iter()
            .filter(|i| i.display_order == before.display_order)
            .count();
        assert_eq!(occupants, 1);
    }

    #[tokio::test]
    async fn operator_regen_auto_approves_customer_regen_revises() {
        let fx = Fulfillment::demo();
        let order_id = generated_order(&fx).await;
        let primaries = primary_ids(&fx, order_id).await;
        approve_bulk(&fx, &primaries).await.unwrap();
        assert_eq!(
            fx.store.get_order(order_id).await.unwrap().status,
            OrderStatus::Ready
        );

        let operator_regen = regenerate(
            &fx,
            primaries[0],
            None,
            RegenSource::Operator,
        )
        .await
        .unwrap();
        assert_eq!(operator_regen.status, ImageStatus::Approved);
        assert_eq!(
            fx.store.get_order(order_id).await.unwrap().status,
            OrderStatus::Ready
        );

        let customer_regen =
            regenerate(&fx, operator_regen.id, Some("less crown".into()), RegenSource::Customer)
                .await
                .unwrap();
        assert_eq!(customer_regen.status, ImageStatus::PendingReview);
        let order = fx.store.get_order(order_id).await.unwrap();
        assert_eq!(order.status, OrderStatus::Revising);
        let revision = order.revision_metadata.unwrap();
        assert_eq!(revision.selected_image_ids, vec![operator_regen.id]);
        assert_eq!(revision.feedback.as_deref(), Some("less crown"));
    }

    #[tokio::test]
    async fn reject_flags_without_regenerating() {
        let fx = Fulfillment::demo();
        let order_id = generated_order(&fx).await;
        let target = primary_ids(&fx, order_id).await[0];
        let count_before = fx.store.images_for_order(order_id).await.len();

        let outcome = reject(&fx, target).await.unwrap();
        assert!(!outcome.notified);
        assert_eq!(
            fx.store.get_image(target).await.unwrap().status,
            ImageStatus::Rejected
        );
        assert_eq!(fx.store.images_for_order(order_id).await.len(), count_before);
    }
}
