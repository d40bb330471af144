//! Uniform contract over external marketplaces.

pub mod ebay;
pub mod etsy;

pub use ebay::EbayAdapter;
pub use etsy::EtsyAdapter;

use crate::config::AppConfig;
use crate::http::HttpFailure;
use crate::models::{Product, ScrapeResult};
use crate::recovery::{Classify, ErrorKind, classify_message};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::skip_serializing_none;
use std::{collections::BTreeMap, sync::Arc};
use thiserror::Error;
use uuid::Uuid;

/// Upper bound on results requested from any marketplace search.
pub const MAX_SCAN_LIMIT: u32 = 100;

pub fn cap_scan_limit(limit: u32) -> u32 {
    limit.clamp(1, MAX_SCAN_LIMIT)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ListingRequest {
    #[serde(default)]
    pub product_id: Option<Uuid>,
    #[serde(default)]
    pub sku: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub price: f64,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default = "default_quantity")]
    pub quantity: u32,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub images: Vec<String>,
}

fn default_currency() -> String {
    "USD".into()
}

fn default_quantity() -> u32 {
    999
}

impl ListingRequest {
    pub fn from_product(product: &Product) -> Self {
        Self {
            product_id: Some(product.id),
            sku: format!("TF-{}", product.id.simple()),
            title: product.title.clone(),
            description: product.description.clone(),
            price: product.price,
            currency: product.currency.clone(),
            quantity: default_quantity(),
            tags: product.tags.clone(),
            category: product.category.clone(),
            images: Vec::new(),
        }
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ListingPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub price: Option<f64>,
    pub quantity: Option<u32>,
    pub tags: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ListingValidation {
    pub valid: bool,
    pub errors: Vec<String>,
}

impl ListingValidation {
    pub fn from_errors(errors: Vec<String>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
        }
    }
}

/// Result of the side-effecting publish call. A remote rejection comes back
/// as `success: false` so the caller can still persist the attempt.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ListingOutcome {
    pub success: bool,
    pub listing: Option<Value>,
    pub listing_id: Option<String>,
    pub external_id: Option<String>,
    pub error: Option<String>,
}

impl ListingOutcome {
    pub fn published(listing_id: String, external_id: Option<String>, listing: Value) -> Self {
        Self {
            success: true,
            listing: Some(listing),
            listing_id: Some(listing_id),
            external_id,
            error: None,
        }
    }

    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            success: false,
            listing: None,
            listing_id: None,
            external_id: None,
            error: Some(error.into()),
        }
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpdateOutcome {
    pub success: bool,
    pub listing: Option<Value>,
    pub error: Option<String>,
}

#[derive(Debug, Error, Clone)]
pub enum MarketplaceError {
    #[error("{0} marketplace is not configured")]
    NotConfigured(String),
    #[error("{0}")]
    Transport(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("marketplace api error (HTTP {status}): {message}")]
    Http { status: u16, message: String },
    #[error("invalid marketplace response: {0}")]
    InvalidResponse(String),
}

impl MarketplaceError {
    pub fn from_http(failure: HttpFailure) -> Self {
        match failure.status.as_u16() {
            429 => MarketplaceError::RateLimited(failure.message()),
            401 | 403 => MarketplaceError::Unauthorized(failure.message()),
            status => MarketplaceError::Http {
                status,
                message: failure.message(),
            },
        }
    }

    pub fn from_transport(err: &reqwest::Error) -> Self {
        MarketplaceError::Transport(crate::http::describe_transport(err))
    }
}

impl Classify for MarketplaceError {
    fn error_kind(&self) -> ErrorKind {
        match self {
            MarketplaceError::NotConfigured(_) => ErrorKind::ConfigError,
            MarketplaceError::RateLimited(_) => ErrorKind::RateLimitError,
            MarketplaceError::Unauthorized(_) => ErrorKind::AuthError,
            MarketplaceError::Http { status: 408 | 504, .. } => ErrorKind::TimeoutError,
            MarketplaceError::Http { .. } | MarketplaceError::InvalidResponse(_) => {
                ErrorKind::ApiError
            }
            MarketplaceError::Transport(message) => match classify_message(message) {
                ErrorKind::UnknownError => ErrorKind::ApiError,
                kind => kind,
            },
        }
    }

    fn is_retryable(&self) -> bool {
        !matches!(self, MarketplaceError::NotConfigured(_))
    }
}

#[async_trait]
pub trait MarketplaceAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// Whether every credential this marketplace needs is present.
    fn is_available(&self) -> bool;

    async fn scan_trends(
        &self,
        category: Option<&str>,
        limit: u32,
    ) -> Result<Vec<ScrapeResult>, MarketplaceError>;

    /// Local checks only; never touches the network.
    fn validate_listing(&self, request: &ListingRequest) -> ListingValidation;

    async fn list_product(&self, request: &ListingRequest)
    -> Result<ListingOutcome, MarketplaceError>;

    async fn update_product(
        &self,
        listing_id: &str,
        patch: &ListingPatch,
    ) -> Result<UpdateOutcome, MarketplaceError>;

    async fn delete_product(&self, listing_id: &str) -> Result<bool, MarketplaceError>;

    async fn get_categories(&self) -> Result<Vec<String>, MarketplaceError>;
}

#[derive(Clone, Default)]
pub struct MarketplaceRegistry {
    adapters: BTreeMap<String, Arc<dyn MarketplaceAdapter>>,
}

impl MarketplaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &AppConfig) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(EtsyAdapter::new(config.etsy.clone())));
        registry.register(Arc::new(EbayAdapter::new(config.ebay.clone())));
        registry
    }

    pub fn register(&mut self, adapter: Arc<dyn MarketplaceAdapter>) {
        self.adapters
            .insert(adapter.name().to_lowercase(), adapter);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn MarketplaceAdapter>> {
        self.adapters.get(&name.trim().to_lowercase()).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.adapters.keys().cloned().collect()
    }
}

/// Checks shared by every marketplace; adapters add their own limits.
pub(crate) fn common_listing_errors(
    request: &ListingRequest,
    max_title: usize,
    max_tags: usize,
) -> Vec<String> {
    let mut errors = Vec::new();
    let title = request.title.trim();
    if title.is_empty() {
        errors.push("title is required".to_string());
    } else if title.chars().count() > max_title {
        errors.push(format!("title exceeds {max_title} characters"));
    }
    if request.description.trim().is_empty() {
        errors.push("description is required".to_string());
    }
    if !request.price.is_finite() || request.price <= 0.0 {
        errors.push("price must be greater than zero".to_string());
    }
    if request.quantity == 0 {
        errors.push("quantity must be at least 1".to_string());
    }
    if request.tags.len() > max_tags {
        errors.push(format!("at most {max_tags} tags are allowed"));
    }
    if request.currency.trim().len() != 3 {
        errors.push("currency must be a 3-letter code".to_string());
    }
    errors
}

/// Best-effort keyword for a scraped listing: first tag, else the leading
/// words of its title.
pub(crate) fn keyword_for(tags: &[String], title: &str) -> String {
    tags.iter()
        .map(|tag| tag.trim())
        .find(|tag| !tag.is_empty())
        .map(str::to_lowercase)
        .unwrap_or_else(|| {
            title
                .split(|ch: char| !ch.is_alphanumeric() && ch != '\'')
                .filter(|word| !word.is_empty())
                .take(3)
                .collect::<Vec<_>>()
                .join(" ")
                .to_lowercase()
        })
}
