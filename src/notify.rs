use crate::http::build_client;
use crate::models::Order;
use reqwest::Client;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

/// Outbound customer notifications. With `EMAIL_GATEWAY_URL` configured the
/// rendered payload is POSTed to the mail gateway; otherwise sends are
/// log-only. Every send is also recorded in an outbox so tests can assert
/// exactly-once behavior.
#[derive(Clone)]
pub struct Notifier {
    gateway: Option<EmailGateway>,
    http: Client,
    outbox: Arc<Mutex<Vec<SentNotification>>>,
}

#[derive(Clone)]
struct EmailGateway {
    url: String,
    api_key: Option<String>,
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("email gateway error: {0}")]
    Gateway(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct SentNotification {
    pub kind: &'static str,
    pub order_id: Uuid,
    pub to: String,
    pub portal_link: String,
}

/// Portal link for outbound mail: token-based when the order has an active
/// access token, plain order id otherwise (legacy flow).
pub fn portal_link(order: &Order) -> String {
    let base = crate::config::PORTAL_BASE_URL.trim_end_matches('/');
    match &order.access_token {
        Some(token) => format!("{base}/{token}"),
        None => format!("{base}/{}", order.id),
    }
}

impl Notifier {
    pub fn from_env() -> Self {
        let gateway = std::env::var("EMAIL_GATEWAY_URL").ok().map(|url| EmailGateway {
            url: url.trim_end_matches('/').to_string(),
            api_key: std::env::var("EMAIL_GATEWAY_KEY").ok(),
        });
        Self {
            gateway,
            http: build_client(),
            outbox: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            gateway: None,
            http: build_client(),
            outbox: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub async fn order_created(&self, order: &Order, portal_link: &str) -> Result<(), NotifyError> {
        self.send("order_created", order, portal_link).await
    }

    pub async fn order_ready(&self, order: &Order, portal_link: &str) -> Result<(), NotifyError> {
        self.send("order_ready", order, portal_link).await
    }

    async fn send(
        &self,
        kind: &'static str,
        order: &Order,
        portal_link: &str,
    ) -> Result<(), NotifyError> {
        let notification = SentNotification {
            kind,
            order_id: order.id,
            to: order.customer_email.clone(),
            portal_link: portal_link.to_string(),
        };

        if let Some(gateway) = &self.gateway {
            let mut request = self
                .http
                .post(format!("{}/v1/send", gateway.url))
                .json(&notification);
            if let Some(key) = &gateway.api_key {
                request = request.header("X-API-Key", key);
            }
            let response = request
                .send()
                .await
                .map_err(|err| NotifyError::Gateway(err.to_string()))?;
            if !response.status().is_success() {
                return Err(NotifyError::Gateway(format!("HTTP {}", response.status())));
            }
        } else {
            info!(
                target = "pawtraits.notify",
                kind = kind,
                order_id = %order.id,
                to = %order.customer_email,
                "notification (log-only, no gateway configured)"
            );
        }

        self.outbox.lock().await.push(notification);
        Ok(())
    }

    pub async fn outbox(&self) -> Vec<SentNotification> {
        self.outbox.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn log_only_sends_are_recorded() {
        let notifier = Notifier::in_memory();
        let order = Order::new("Ada", "ada@example.com", "royal", "p.jpg");
        notifier
            .order_created(&order, "http://localhost/portal/t")
            .await
            .unwrap();
        notifier
            .order_ready(&order, "http://localhost/portal/t")
            .await
            .unwrap();

        let outbox = notifier.outbox().await;
        assert_eq!(outbox.len(), 2);
        assert_eq!(outbox[0].kind, "order_created");
        assert_eq!(outbox[1].kind, "order_ready");
        assert_eq!(outbox[1].to, "ada@example.com");
    }
}
