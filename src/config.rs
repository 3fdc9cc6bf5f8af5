use once_cell::sync::Lazy;
use std::env;

pub static STOREFRONT_WEBHOOK_SECRET: Lazy<String> =
    Lazy::new(|| env::var("STOREFRONT_WEBHOOK_SECRET").unwrap_or_default());

pub static PAYMENT_WEBHOOK_SECRET: Lazy<String> =
    Lazy::new(|| env::var("PAYMENT_WEBHOOK_SECRET").unwrap_or_default());

pub static TOKEN_SIGNING_KEY: Lazy<String> =
    Lazy::new(|| env::var("TOKEN_SIGNING_KEY").unwrap_or_else(|_| "demo-signing-key".to_string()));

pub static PORTAL_BASE_URL: Lazy<String> = Lazy::new(|| {
    env::var("PORTAL_BASE_URL").unwrap_or_else(|_| "http://localhost:8000/portal".to_string())
});

pub static CAPTION_FONT_PATH: Lazy<String> = Lazy::new(|| {
    env::var("CAPTION_FONT_PATH")
        .unwrap_or_else(|_| "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf".to_string())
});

pub fn token_ttl_secs() -> i64 {
    env::var("ACCESS_TOKEN_TTL_SECS")
        .ok()
        .and_then(|v| v.parse::<i64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(60 * 60 * 24 * 30)
}

pub fn primary_slot_count() -> usize {
    env::var("PRIMARY_SLOT_COUNT")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v >= 1)
        .unwrap_or(5)
}

pub fn bonus_slot_count() -> usize {
    env::var("BONUS_SLOT_COUNT")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(5)
}

pub fn approval_threshold() -> usize {
    env::var("APPROVAL_THRESHOLD")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v >= 1)
        .unwrap_or(5)
}

pub fn parse_env_bool(key: &str) -> bool {
    match env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}
