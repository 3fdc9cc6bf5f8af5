use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Order lifecycle. Transitions are validated through [`OrderStatus::can_transition_to`]
/// so the legal-transition table lives in one place instead of ad-hoc string
/// checks at every call site.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Revising,
    Ready,
    Fulfilled,
    Failed,
}

impl OrderStatus {
    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (self, next),
            (Pending, Revising)
                | (Pending, Ready)
                | (Pending, Failed)
                | (Revising, Ready)
                | (Revising, Failed)
                | (Ready, Revising)
                | (Ready, Fulfilled)
                | (Failed, Pending)
        )
    }

    /// Terminal for the review workflow: approvals past this point must not
    /// re-fire the ready notification.
    pub fn review_complete(self) -> bool {
        matches!(self, OrderStatus::Ready | OrderStatus::Fulfilled)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Unpaid,
    Paid,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BonusPaymentStatus {
    Unpaid,
    Paid,
    Refunded,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ImageKind {
    Primary,
    Upsell,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ImageStatus {
    PendingReview,
    Approved,
    Rejected,
    Archived,
}

impl ImageStatus {
    pub fn can_transition_to(self, next: ImageStatus) -> bool {
        use ImageStatus::*;
        matches!(
            (self, next),
            (PendingReview, Approved)
                | (PendingReview, Rejected)
                | (PendingReview, Archived)
                | (Approved, Archived)
                | (Rejected, Archived)
        )
    }
}

/// Structured revision request; replaces an earlier free-text note.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RevisionMetadata {
    pub selected_image_ids: Vec<Uuid>,
    pub reference_photo_urls: Vec<String>,
    #[serde(default)]
    pub feedback: Option<String>,
    pub requested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub customer_name: String,
    pub customer_email: String,
    pub product_type: String,
    pub pet_name: Option<String>,
    pub breed: Option<String>,
    pub notes: Option<String>,
    /// Subject photo reference: remote URL or object-store path; legacy and
    /// current records mix both schemes.
    pub subject_photo: String,
    pub status: OrderStatus,
    pub payment_status: PaymentStatus,
    pub bonus_unlocked: bool,
    pub bonus_payment_status: BonusPaymentStatus,
    pub selected_image_id: Option<Uuid>,
    pub access_token: Option<String>,
    pub revision_metadata: Option<RevisionMetadata>,
    pub created_at: DateTime<Utc>,
}

impl Order {
    pub fn new(
        customer_name: impl Into<String>,
        customer_email: impl Into<String>,
        product_type: impl Into<String>,
        subject_photo: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            customer_name: customer_name.into(),
            customer_email: customer_email.into(),
            product_type: product_type.into(),
            pet_name: None,
            breed: None,
            notes: None,
            subject_photo: subject_photo.into(),
            status: OrderStatus::Pending,
            payment_status: PaymentStatus::Unpaid,
            bonus_unlocked: false,
            bonus_payment_status: BonusPaymentStatus::Unpaid,
            selected_image_id: None,
            access_token: None,
            revision_metadata: None,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Image {
    pub id: Uuid,
    pub order_id: Uuid,
    pub kind: ImageKind,
    pub is_bonus: bool,
    pub status: ImageStatus,
    /// Currently servable representation; watermarked for locked bonus slots.
    pub public_ref: String,
    /// Canonical clean representation, the unlock source of truth.
    pub canonical_ref: String,
    /// Stable slot index; regeneration archives the predecessor and inserts
    /// the successor at the same slot.
    pub display_order: u32,
    pub template_id: String,
    pub theme_name: String,
    /// Set on upsell mockups; part of the mockup cache key.
    pub product_type: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Image {
    /// Which representation the customer may see right now.
    pub fn serve_ref(&self, bonus_unlocked: bool) -> &str {
        if self.is_bonus && !bonus_unlocked {
            &self.public_ref
        } else {
            &self.canonical_ref
        }
    }

    /// A bonus image is locked while its servable ref still differs from the
    /// canonical one.
    pub fn is_locked(&self) -> bool {
        self.is_bonus && self.public_ref != self.canonical_ref
    }
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Central operation error carried up to the HTTP layer; `stage` names the
/// failing step for logs and the error payload.
#[derive(Debug, Error)]
#[error("stage `{stage}` failed: {message}")]
pub struct FlowError {
    stage: &'static str,
    message: String,
    kind: FlowErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowErrorKind {
    InvalidInput,
    Unauthorized,
    NotFound,
    Internal,
}

impl FlowError {
    pub fn invalid_input(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: FlowErrorKind::InvalidInput,
        }
    }

    pub fn unauthorized(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: FlowErrorKind::Unauthorized,
        }
    }

    pub fn not_found(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: FlowErrorKind::NotFound,
        }
    }

    pub fn internal(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: FlowErrorKind::Internal,
        }
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn kind(&self) -> FlowErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.message
    }
}

/// Customer-facing projection of one image; refs are resolved through
/// [`Image::serve_ref`] so locked bonus slots never leak the clean form.
#[derive(Debug, Clone, Serialize)]
pub struct ImageView {
    pub id: Uuid,
    pub kind: ImageKind,
    pub is_bonus: bool,
    pub status: ImageStatus,
    pub url: String,
    pub display_order: u32,
    pub theme_name: String,
}

impl ImageView {
    pub fn from_image(image: &Image, bonus_unlocked: bool) -> Self {
        Self {
            id: image.id,
            kind: image.kind,
            is_bonus: image.is_bonus,
            status: image.status,
            url: image.serve_ref(bonus_unlocked).to_string(),
            display_order: image.display_order,
            theme_name: image.theme_name.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderView {
    pub id: Uuid,
    pub customer_name: String,
    pub product_type: String,
    pub status: OrderStatus,
    pub bonus_unlocked: bool,
    pub selected_image_id: Option<Uuid>,
    pub images: Vec<ImageView>,
}

/// Payment-webhook metadata attached to a checkout session at creation and
/// read back when the provider confirms completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutMetadata {
    pub order_id: Uuid,
    pub product_type: String,
    #[serde(default)]
    pub portrait_url: Option<String>,
    #[serde(default)]
    pub intent: Option<String>,
}

pub fn value_as_trimmed_string(value: &Value) -> Option<String> {
    value
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
