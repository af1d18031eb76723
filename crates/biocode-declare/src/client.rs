//! Registry submission
//!
//! [`DeclarationClient`] signs a note and POSTs it to `<hub_url>/declaration`.
//! Duplicate submissions come back as 409 with the id of the existing
//! declaration, so repeating a declaration for identical content always
//! resolves to the same external id. Nothing here is fatal: every problem ends
//! in a [`DeclarationOutcome`] the caller can record and move past.

use crate::error::DeclareError;
use crate::keys::Keypair;
use crate::note::{gateway_url, DeclarationNote, MAX_HUB_ID};
use async_trait::async_trait;
use biocode_core::{ContentIdentifier, RetryPolicy};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Environment variable naming the hub id
pub const HUB_ID_ENV: &str = "ISCC_HUB_ID";
/// Environment variable naming the registry base URL
pub const HUB_URL_ENV: &str = "ISCC_HUB_URL";
/// Environment variable naming the public image server URL
pub const PUBLIC_URL_ENV: &str = "OMERO_HOST_PUBLIC_URL";

/// Registry coordinates; any missing value disables declaration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Hub id embedded in every nonce (0..=4095)
    pub hub_id: Option<u32>,
    /// Registry base URL
    pub hub_url: Option<String>,
    /// Public URL of the image server, used for gateway links
    pub public_url: Option<String>,
}

impl RegistryConfig {
    /// Empty configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With hub id
    #[inline]
    #[must_use]
    pub fn with_hub_id(mut self, hub_id: u32) -> Self {
        self.hub_id = Some(hub_id);
        self
    }

    /// With registry URL
    #[inline]
    #[must_use]
    pub fn with_hub_url(mut self, url: impl Into<String>) -> Self {
        self.hub_url = Some(url.into());
        self
    }

    /// With public image server URL
    #[inline]
    #[must_use]
    pub fn with_public_url(mut self, url: impl Into<String>) -> Self {
        self.public_url = Some(url.into());
        self
    }

    /// Declaration endpoint
    ///
    /// # Errors
    /// Returns [`DeclareError::MissingConfig`] if the registry URL is unset
    pub fn endpoint(&self) -> Result<String, DeclareError> {
        let url = non_empty(self.hub_url.as_deref()).ok_or(DeclareError::MissingConfig(HUB_URL_ENV))?;
        Ok(format!("{}/declaration", url.trim_end_matches('/')))
    }
}

/// Result of one declaration attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum DeclarationOutcome {
    /// Registry accepted a new declaration
    Declared(String),
    /// Content was declared before; carries the existing id
    AlreadyDeclared(String),
    /// Declaration not attempted
    Skipped(String),
    /// Declaration attempted without obtaining an id
    Failed(String),
}

impl DeclarationOutcome {
    /// External id, if one was obtained
    #[inline]
    #[must_use]
    pub fn iscc_id(&self) -> Option<&str> {
        match self {
            Self::Declared(id) | Self::AlreadyDeclared(id) => Some(id),
            Self::Skipped(_) | Self::Failed(_) => None,
        }
    }

    /// Whether an id was obtained
    #[inline]
    #[must_use]
    pub fn is_declared(&self) -> bool {
        self.iscc_id().is_some()
    }
}

/// Something that can declare a content identifier for an image
#[async_trait]
pub trait Declare: Send + Sync {
    /// Declare `id` for the image `image_id`
    async fn declare(&self, id: &ContentIdentifier, image_id: u64) -> DeclarationOutcome;
}

/// Stand-in used when declaration is not configured
#[derive(Debug, Clone)]
pub struct DisabledDeclarer {
    reason: String,
}

impl DisabledDeclarer {
    /// Declarer that always skips with `reason`
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl Declare for DisabledDeclarer {
    async fn declare(&self, _id: &ContentIdentifier, _image_id: u64) -> DeclarationOutcome {
        DeclarationOutcome::Skipped(self.reason.clone())
    }
}

/// HTTP client for the registry
#[derive(Debug, Clone)]
pub struct DeclarationClient {
    http: reqwest::Client,
    endpoint: String,
    hub_id: u32,
    public_url: String,
    keypair: Keypair,
    retry: RetryPolicy,
}

impl DeclarationClient {
    /// Build a client
    ///
    /// # Errors
    /// Returns error if any registry setting is missing or out of range, or
    /// if the HTTP client cannot be built
    pub fn new(
        config: &RegistryConfig,
        keypair: Keypair,
        retry: RetryPolicy,
        timeout: Duration,
    ) -> Result<Self, DeclareError> {
        let hub_id = config.hub_id.ok_or(DeclareError::MissingConfig(HUB_ID_ENV))?;
        if hub_id > MAX_HUB_ID {
            return Err(DeclareError::HubIdOutOfRange(hub_id));
        }
        let endpoint = config.endpoint()?;
        let public_url = non_empty(config.public_url.as_deref())
            .ok_or(DeclareError::MissingConfig(PUBLIC_URL_ENV))?
            .to_string();

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("biocode/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http,
            endpoint,
            hub_id,
            public_url,
            keypair,
            retry,
        })
    }

    /// Endpoint notes are posted to
    #[inline]
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Sign and submit one declaration
    ///
    /// Every attempt carries a freshly signed note, so a retry never reuses
    /// a nonce the registry may already have seen.
    pub async fn submit(&self, id: &ContentIdentifier, image_id: u64) -> DeclarationOutcome {
        let gateway = gateway_url(&self.public_url, image_id);

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let signed = match DeclarationNote::new(id, self.hub_id, gateway.clone(), chrono::Utc::now())
                .and_then(|note| note.sign(&self.keypair))
            {
                Ok(signed) => signed,
                Err(e) => return DeclarationOutcome::Failed(e.to_string()),
            };
            let verdict = match self.http.post(&self.endpoint).json(&signed).send().await {
                Ok(response) => classify(response).await,
                Err(e) => Attempt::Retry(format!("transport error: {e}")),
            };

            match verdict {
                Attempt::Done(outcome) => {
                    match &outcome {
                        DeclarationOutcome::Declared(iscc_id) => {
                            info!(image_id, iscc_id = %iscc_id, "declared");
                        }
                        DeclarationOutcome::AlreadyDeclared(iscc_id) => {
                            info!(image_id, iscc_id = %iscc_id, "already declared");
                        }
                        DeclarationOutcome::Failed(reason) => {
                            warn!(image_id, reason = %reason, "declaration rejected");
                        }
                        DeclarationOutcome::Skipped(_) => {}
                    }
                    return outcome;
                }
                Attempt::Retry(reason) if self.retry.allows_retry(attempt) => {
                    let delay = self.retry.delay_after(attempt - 1);
                    debug!(
                        image_id,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        reason = %reason,
                        "retrying declaration"
                    );
                    tokio::time::sleep(delay).await;
                }
                Attempt::Retry(reason) => {
                    info!(image_id, attempt, reason = %reason, "declaration failed");
                    return DeclarationOutcome::Failed(reason);
                }
            }
        }
    }
}

#[async_trait]
impl Declare for DeclarationClient {
    async fn declare(&self, id: &ContentIdentifier, image_id: u64) -> DeclarationOutcome {
        self.submit(id, image_id).await
    }
}

enum Attempt {
    Done(DeclarationOutcome),
    Retry(String),
}

async fn classify(response: reqwest::Response) -> Attempt {
    let status = response.status();
    if status.is_server_error() {
        return Attempt::Retry(format!("registry returned {status}"));
    }

    let body: Option<Value> = response.json().await.ok();
    let outcome = if status == StatusCode::CONFLICT {
        match body.as_ref().and_then(existing_id) {
            Some(id) => DeclarationOutcome::AlreadyDeclared(id),
            None => DeclarationOutcome::Failed("unparseable 409 response".into()),
        }
    } else if status.is_success() {
        match body.as_ref().and_then(declared_id) {
            Some(id) => DeclarationOutcome::Declared(id),
            None => DeclarationOutcome::Failed("invalid registry response format".into()),
        }
    } else {
        DeclarationOutcome::Failed(format!("registry returned {status}"))
    };
    Attempt::Done(outcome)
}

fn existing_id(body: &Value) -> Option<String> {
    body.pointer("/error/existing_iscc_id")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn declared_id(body: &Value) -> Option<String> {
    body.pointer("/credentialSubject/declaration/iscc_id")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|s| !s.is_empty())
}
