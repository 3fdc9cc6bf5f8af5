use crate::models::{Image, ImageStatus, Order, OrderStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Relational table store: Orders, Images, plus the append-only access log
/// and revocation list. This is the single source of truth for status; the
/// process-local tables stand at the persistence interface boundary and are
/// constructed explicitly and passed in, never reached through a module
/// singleton.
///
/// Slot occupancy lives here: archive-and-insert for a `(order_id,
/// display_order)` slot runs under one table lock, so at most one
/// non-archived image ever occupies a slot regardless of how callers
/// interleave.
#[derive(Clone, Default)]
pub struct Store {
    inner: Arc<Mutex<Tables>>,
}

#[derive(Default)]
struct Tables {
    orders: HashMap<Uuid, Order>,
    images: HashMap<Uuid, Image>,
    access_log: Vec<AccessLogEntry>,
    revoked_tokens: HashSet<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AccessLogEntry {
    pub order_id: Option<Uuid>,
    pub token_hash: String,
    pub outcome: &'static str,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("order not found: {0}")]
    OrderNotFound(Uuid),
    #[error("image not found: {0}")]
    ImageNotFound(Uuid),
    #[error("illegal order transition {from:?} -> {to:?}")]
    IllegalOrderTransition { from: OrderStatus, to: OrderStatus },
    #[error("illegal image transition {from:?} -> {to:?}")]
    IllegalImageTransition { from: ImageStatus, to: ImageStatus },
    #[error("image {image} is not owned by order {order}")]
    ForeignImage { order: Uuid, image: Uuid },
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_order(&self, order: Order) -> Uuid {
        let id = order.id;
        self.inner.lock().await.orders.insert(id, order);
        id
    }

    pub async fn get_order(&self, id: Uuid) -> Result<Order, StoreError> {
        self.inner
            .lock()
            .await
            .orders
            .get(&id)
            .cloned()
            .ok_or(StoreError::OrderNotFound(id))
    }

    /// Run a closure against the order row under the table lock and return
    /// its result. Callers that need read-modify-write semantics (unlock
    /// idempotence, exactly-once transitions) go through here.
    pub async fn update_order_with<R>(
        &self,
        id: Uuid,
        f: impl FnOnce(&mut Order) -> R,
    ) -> Result<R, StoreError> {
        let mut tables = self.inner.lock().await;
        let order = tables
            .orders
            .get_mut(&id)
            .ok_or(StoreError::OrderNotFound(id))?;
        Ok(f(order))
    }

    /// Validated status transition. Returns `false` without touching the row
    /// when the order is already in `next`, so redelivered events stay
    /// no-ops; any other illegal move is an error.
    pub async fn transition_order(
        &self,
        id: Uuid,
        next: OrderStatus,
    ) -> Result<bool, StoreError> {
        self.update_order_with(id, |order| {
            if order.status == next {
                return Ok(false);
            }
            if !order.status.can_transition_to(next) {
                return Err(StoreError::IllegalOrderTransition {
                    from: order.status,
                    to: next,
                });
            }
            order.status = next;
            Ok(true)
        })
        .await?
    }

    /// Set the customer's selected image, enforcing that the image belongs
    /// to the order.
    pub async fn select_image(&self, order_id: Uuid, image_id: Uuid) -> Result<(), StoreError> {
        let mut tables = self.inner.lock().await;
        let owned = tables
            .images
            .get(&image_id)
            .ok_or(StoreError::ImageNotFound(image_id))?
            .order_id
            == order_id;
        if !owned {
            return Err(StoreError::ForeignImage {
                order: order_id,
                image: image_id,
            });
        }
        let order = tables
            .orders
            .get_mut(&order_id)
            .ok_or(StoreError::OrderNotFound(order_id))?;
        order.selected_image_id = Some(image_id);
        Ok(())
    }

    /// Insert an image into its `(order_id, display_order)` slot, archiving
    /// whatever non-archived image currently holds the slot. Both steps run
    /// under the table lock; concurrent regenerations of one slot resolve
    /// last-write-wins.
    pub async fn insert_image_at_slot(&self, image: Image) -> Uuid {
        let mut tables = self.inner.lock().await;
        let superseded: Vec<Uuid> = tables
            .images
            .values()
            .filter(|existing| {
                existing.order_id == image.order_id
                    && existing.display_order == image.display_order
                    && existing.status != ImageStatus::Archived
            })
            .map(|existing| existing.id)
            .collect();
        for id in superseded {
            if let Some(existing) = tables.images.get_mut(&id) {
                existing.status = ImageStatus::Archived;
            }
        }
        let id = image.id;
        tables.images.insert(id, image);
        id
    }

    pub async fn get_image(&self, id: Uuid) -> Result<Image, StoreError> {
        self.inner
            .lock()
            .await
            .images
            .get(&id)
            .cloned()
            .ok_or(StoreError::ImageNotFound(id))
    }

    pub async fn update_image_with<R>(
        &self,
        id: Uuid,
        f: impl FnOnce(&mut Image) -> R,
    ) -> Result<R, StoreError> {
        let mut tables = self.inner.lock().await;
        let image = tables
            .images
            .get_mut(&id)
            .ok_or(StoreError::ImageNotFound(id))?;
        Ok(f(image))
    }

    pub async fn transition_image(
        &self,
        id: Uuid,
        next: ImageStatus,
    ) -> Result<(), StoreError> {
        self.update_image_with(id, |image| {
            if !image.status.can_transition_to(next) {
                return Err(StoreError::IllegalImageTransition {
                    from: image.status,
                    to: next,
                });
            }
            image.status = next;
            Ok(())
        })
        .await?
    }

    /// Non-archived images of an order, slot order.
    pub async fn images_for_order(&self, order_id: Uuid) -> Vec<Image> {
        let tables = self.inner.lock().await;
        let mut images: Vec<Image> = tables
            .images
            .values()
            .filter(|image| image.order_id == order_id && image.status != ImageStatus::Archived)
            .cloned()
            .collect();
        images.sort_by_key(|image| (image.kind == crate::models::ImageKind::Upsell, image.display_order));
        images
    }

    /// Approved primary portraits only. Upsell mockups and bonus images are
    /// excluded: neither counts toward the review-completion threshold, so a
    /// pre-review mockup or an early bonus unlock cannot flip an order to
    /// `Ready` on its own.
    pub async fn approved_count(&self, order_id: Uuid) -> usize {
        self.inner
            .lock()
            .await
            .images
            .values()
            .filter(|image| {
                image.order_id == order_id
                    && image.status == ImageStatus::Approved
                    && image.kind == crate::models::ImageKind::Primary
                    && !image.is_bonus
            })
            .count()
    }

    /// Mockup cache lookup: an unchanged portrait/product pair must not be
    /// regenerated on every view.
    pub async fn find_mockup(
        &self,
        order_id: Uuid,
        template_id: &str,
        product_type: &str,
    ) -> Option<Image> {
        self.inner
            .lock()
            .await
            .images
            .values()
            .find(|image| {
                image.order_id == order_id
                    && image.kind == crate::models::ImageKind::Upsell
                    && image.status != ImageStatus::Archived
                    && image.template_id == template_id
                    && image.product_type.as_deref() == Some(product_type)
            })
            .cloned()
    }

    pub async fn append_access_log(&self, entry: AccessLogEntry) {
        self.inner.lock().await.access_log.push(entry);
    }

    pub async fn access_log(&self) -> Vec<AccessLogEntry> {
        self.inner.lock().await.access_log.clone()
    }

    /// Revocation is append-only; tokens are never mutated, only their hash
    /// is listed here.
    pub async fn revoke_token_hash(&self, hash: String) {
        self.inner.lock().await.revoked_tokens.insert(hash);
    }

    pub async fn is_token_revoked(&self, hash: &str) -> bool {
        self.inner.lock().await.revoked_tokens.contains(hash)
    }
}
