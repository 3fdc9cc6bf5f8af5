use crate::models::{BonusPaymentStatus, FlowError, ImageStatus};
use crate::orchestrator::Fulfillment;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct UnlockReport {
    pub order_id: Uuid,
    /// Bonus images rewritten from the locked to the clean representation.
    pub rewritten: usize,
    /// Bonus images that were already serving the clean form (redelivered
    /// webhook, partial earlier unlock) — a no-op, not an error.
    pub already_clean: usize,
}

/// Content Unlock Gate: on a confirmed bonus payment, converge every bonus
/// image of the order onto its canonical representation and flip the order
/// flags. Safe to run any number of times; callers on the payment-webhook
/// path log failures instead of failing the acknowledgment, since the
/// payment succeeded regardless and unlock can be retried manually.
pub async fn unlock_bonus(fx: &Fulfillment, order_id: Uuid) -> Result<UnlockReport, FlowError> {
    // existence check up front so a bad webhook payload is loud in the logs
    fx.store
        .get_order(order_id)
        .await
        .map_err(|err| FlowError::not_found("unlock", err.to_string()))?;

    let mut report = UnlockReport {
        order_id,
        rewritten: 0,
        already_clean: 0,
    };

    for image in fx.store.images_for_order(order_id).await {
        if !image.is_bonus {
            continue;
        }
        let rewritten = fx
            .store
            .update_image_with(image.id, |image| {
                let changed = image.public_ref != image.canonical_ref;
                image.public_ref = image.canonical_ref.clone();
                // the paid unlock is authoritative for bonus content; a slot
                // still sitting in review (or even rejected) ships clean
                if image.status != ImageStatus::Archived {
                    image.status = ImageStatus::Approved;
                }
                changed
            })
            .await
            .map_err(|err| FlowError::internal("unlock", err.to_string()))?;
        if rewritten {
            report.rewritten += 1;
        } else {
            report.already_clean += 1;
        }
    }

    fx.store
        .update_order_with(order_id, |order| {
            order.bonus_unlocked = true;
            order.bonus_payment_status = BonusPaymentStatus::Paid;
        })
        .await
        .map_err(|err| FlowError::internal("unlock", err.to_string()))?;

    info!(
        target = "pawtraits.unlock",
        order_id = %order_id,
        rewritten = report.rewritten,
        already_clean = report.already_clean,
        "bonus content unlocked"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::testutil::{sample_order, seed_order_assets};
    use crate::orchestrator::run_batch;

    async fn generated_order(fx: &Fulfillment) -> Uuid {
        let order = sample_order();
        seed_order_assets(fx, &order).await;
        let order_id = fx.store.insert_order(order).await;
        run_batch(fx, order_id).await.unwrap();
        order_id
    }

    #[tokio::test]
    async fn unlock_converges_bonus_refs_and_flags() {
        let fx = Fulfillment::demo();
        let order_id = generated_order(&fx).await;

        let locked: Vec<_> = fx
            .store
            .images_for_order(order_id)
            .await
            .into_iter()
            .filter(|i| i.is_bonus)
            .collect();
        assert_eq!(locked.len(), 5);
        assert!(locked.iter().all(|i| i.is_locked()));

        let report = unlock_bonus(&fx, order_id).await.unwrap();
        assert_eq!(report.rewritten, 5);
        assert_eq!(report.already_clean, 0);

        let order = fx.store.get_order(order_id).await.unwrap();
        assert!(order.bonus_unlocked);
        assert_eq!(order.bonus_payment_status, BonusPaymentStatus::Paid);

        for image in fx.store.images_for_order(order_id).await {
            if image.is_bonus {
                assert!(!image.is_locked());
                assert_eq!(image.status, ImageStatus::Approved);
                assert_eq!(image.serve_ref(order.bonus_unlocked), image.canonical_ref);
            }
        }
    }

    #[tokio::test]
    async fn replayed_unlock_is_idempotent() {
        let fx = Fulfillment::demo();
        let order_id = generated_order(&fx).await;

        unlock_bonus(&fx, order_id).await.unwrap();
        let after_first = fx.store.images_for_order(order_id).await;
        let order_first = fx.store.get_order(order_id).await.unwrap();

        let report = unlock_bonus(&fx, order_id).await.unwrap();
        assert_eq!(report.rewritten, 0);
        assert_eq!(report.already_clean, 5);

        let after_second = fx.store.images_for_order(order_id).await;
        let order_second = fx.store.get_order(order_id).await.unwrap();
        assert_eq!(after_first.len(), after_second.len());
        for (a, b) in after_first.iter().zip(after_second.iter()) {
            assert_eq!(a.public_ref, b.public_ref);
            assert_eq!(a.status, b.status);
        }
        assert_eq!(order_first.bonus_unlocked, order_second.bonus_unlocked);
        assert_eq!(
            order_first.bonus_payment_status,
            order_second.bonus_payment_status
        );
    }

    #[tokio::test]
    async fn unknown_order_fails_loudly_for_manual_retry() {
        let fx = Fulfillment::demo();
        let err = unlock_bonus(&fx, Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err.kind(), crate::models::FlowErrorKind::NotFound);
    }
}
