use crate::http::build_transform_client;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use image::{ImageFormat, Rgba, RgbaImage};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    io::Cursor,
};
use thiserror::Error;

/// Gateway client for the opaque image transform:
/// `transform(template, subject, prompt) -> image bytes`. With no gateway
/// configured the client runs offline and synthesizes a deterministic
/// placeholder raster, which keeps the whole fulfillment pipeline runnable
/// in tests and demo builds.
#[derive(Debug, Clone)]
pub struct TransformConfig {
    pub gateway_url: Option<String>,
    pub api_key: Option<String>,
    pub model: Option<String>,
}

impl TransformConfig {
    pub fn from_env() -> Self {
        Self {
            gateway_url: std::env::var("TRANSFORM_GATEWAY_URL").ok(),
            api_key: std::env::var("TRANSFORM_API_KEY").ok(),
            model: std::env::var("TRANSFORM_MODEL").ok(),
        }
    }

    pub fn offline() -> Self {
        Self {
            gateway_url: None,
            api_key: None,
            model: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("http error: {0}")]
    Http(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("transform returned no image")]
    EmptyResult,
}

pub struct TransformClient {
    http: Client,
    config: TransformConfig,
}

impl TransformClient {
    pub fn new(config: TransformConfig) -> Self {
        Self {
            http: build_transform_client(),
            config,
        }
    }

    pub async fn transform(
        &self,
        template: &[u8],
        subject: &[u8],
        prompt: &str,
    ) -> Result<Vec<u8>, TransformError> {
        let Some(gateway) = self.config.gateway_url.as_deref().map(str::trim) else {
            return Ok(placeholder_render(template, subject, prompt));
        };

        let body = TransformRequest {
            template_b64: BASE64.encode(template),
            subject_b64: BASE64.encode(subject),
            prompt: prompt.to_string(),
            model: self.config.model.clone(),
        };

        let mut request = self.http.post(format!("{gateway}/v1/transform")).json(&body);
        if let Some(key) = &self.config.api_key {
            request = request.header("X-API-Key", key);
        }

        let response = request
            .send()
            .await
            .map_err(|err| TransformError::Http(err.to_string()))?;
        if !response.status().is_success() {
            return Err(TransformError::Http(format!("HTTP {}", response.status())));
        }

        let payload: TransformResponse = response
            .json()
            .await
            .map_err(|err| TransformError::InvalidResponse(err.to_string()))?;
        let encoded = payload.image_b64.ok_or(TransformError::EmptyResult)?;
        let bytes = BASE64
            .decode(encoded.as_bytes())
            .map_err(|err| TransformError::InvalidResponse(err.to_string()))?;
        if bytes.is_empty() {
            return Err(TransformError::EmptyResult);
        }
        Ok(bytes)
    }
}

#[derive(Debug, Serialize)]
struct TransformRequest {
    template_b64: String,
    subject_b64: String,
    prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TransformResponse {
    #[serde(default)]
    image_b64: Option<String>,
}

/// Deterministic stand-in raster: a flat-shaded canvas whose palette is a
/// hash of the inputs, so repeated runs with the same template, subject and
/// prompt produce identical bytes.
fn placeholder_render(template: &[u8], subject: &[u8], prompt: &str) -> Vec<u8> {
    let mut hasher = DefaultHasher::new();
    template.hash(&mut hasher);
    subject.hash(&mut hasher);
    prompt.hash(&mut hasher);
    let seed = hasher.finish();

    let base = [
        64 + (seed & 0x7f) as u8,
        64 + ((seed >> 8) & 0x7f) as u8,
        64 + ((seed >> 16) & 0x7f) as u8,
    ];
    let mut canvas = RgbaImage::new(512, 512);
    for (x, y, pixel) in canvas.enumerate_pixels_mut() {
        let shade = ((x + y) / 8 % 2) as u8 * 12;
        *pixel = Rgba([
            base[0].saturating_add(shade),
            base[1].saturating_add(shade),
            base[2].saturating_add(shade),
            255,
        ]);
    }

    let mut buf = Vec::new();
    // PNG encoding of an in-memory raster cannot fail
    canvas
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .unwrap_or_default();
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn offline_transform_yields_decodable_png() {
        let client = TransformClient::new(TransformConfig::offline());
        let bytes = client
            .transform(b"template", b"subject", "royal portrait of a corgi")
            .await
            .unwrap();
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!(decoded.width(), 512);
    }

    #[tokio::test]
    async fn offline_transform_is_deterministic() {
        let client = TransformClient::new(TransformConfig::offline());
        let a = client.transform(b"t", b"s", "prompt").await.unwrap();
        let b = client.transform(b"t", b"s", "prompt").await.unwrap();
        let c = client.transform(b"t", b"s", "other prompt").await.unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
