use reqwest::Client;
use std::time::Duration;

/// Shared client for storage, notification, and checkout calls.
pub fn build_client() -> Client {
    client_with_timeout(env_secs("PAWTRAITS_HTTP_TIMEOUT_SECS", 30))
}

/// Client for the image-transform gateway. Generation runs for tens of
/// seconds on a cold model, so it gets its own, much longer deadline.
pub fn build_transform_client() -> Client {
    client_with_timeout(env_secs("PAWTRAITS_TRANSFORM_TIMEOUT_SECS", 120))
}

fn client_with_timeout(timeout_secs: u64) -> Client {
    let connect = env_secs("PAWTRAITS_HTTP_CONNECT_TIMEOUT_SECS", 5);
    Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .connect_timeout(Duration::from_secs(connect))
        .build()
        .unwrap_or_else(|_| Client::new())
}

fn env_secs(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}
