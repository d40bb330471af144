use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::skip_serializing_none;
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Competition {
    Low,
    #[default]
    Medium,
    High,
}

impl Competition {
    /// Multiplier applied to search volume when ranking trends locally.
    pub fn weight(self) -> f64 {
        match self {
            Competition::Low => 1.0,
            Competition::Medium => 0.6,
            Competition::High => 0.3,
        }
    }

    pub fn from_str(input: &str) -> Option<Self> {
        match input.trim().to_lowercase().as_str() {
            "low" => Some(Competition::Low),
            "medium" | "med" => Some(Competition::Medium),
            "high" => Some(Competition::High),
            _ => None,
        }
    }

    /// Rough bucket from the number of competing listings a marketplace reports.
    pub fn from_listing_count(count: u64) -> Self {
        match count {
            0..=999 => Competition::Low,
            1_000..=9_999 => Competition::Medium,
            _ => Competition::High,
        }
    }
}

/// Keyword-level demand signal, unique by normalized keyword.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrendData {
    pub keyword: String,
    pub search_volume: u64,
    pub competition: Competition,
    pub avg_price: f64,
    pub score: Option<f64>,
    pub rank: Option<u32>,
    pub insight: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TrendData {
    pub fn local_score(&self) -> f64 {
        self.search_volume as f64 * self.competition.weight()
    }

    pub fn effective_score(&self) -> f64 {
        self.score.unwrap_or_else(|| self.local_score())
    }
}

/// Values merged into a [`TrendData`] row by the scrape stage.
#[derive(Debug, Clone, PartialEq)]
pub struct TrendUpsert {
    pub keyword: String,
    pub search_volume: u64,
    pub competition: Competition,
    pub avg_price: f64,
}

pub fn normalize_keyword(keyword: &str) -> String {
    keyword
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Point-in-time snapshot of an external listing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScrapeResult {
    pub marketplace: String,
    pub external_product_id: String,
    pub keyword: String,
    pub title: String,
    pub search_volume: u64,
    pub competition: Competition,
    pub price: f64,
    pub currency: String,
    pub collected_at: DateTime<Utc>,
    #[serde(default)]
    pub raw: Value,
}

impl ScrapeResult {
    pub fn unique_key(&self) -> (String, String, DateTime<Utc>) {
        (
            self.marketplace.clone(),
            self.external_product_id.clone(),
            self.collected_at,
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProductStatus {
    #[default]
    Draft,
    Published,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub tags: Vec<String>,
    pub price: f64,
    pub currency: String,
    pub category: String,
    pub status: ProductStatus,
    pub source_keyword: String,
    #[serde(default)]
    pub seo_keywords: Vec<String>,
    #[serde(default)]
    pub image_prompt: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub specifications: Value,
    pub metadata: ProductMetadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Product {
    /// Records a successful listing and flips the product to published.
    ///
    /// Refuses listings that are not a success with a remote id, so a product
    /// can never be published without at least one live listing.
    pub fn mark_published(&mut self, listing: &Listing) -> Result<(), String> {
        let remote_id = match (&listing.status, &listing.remote_id) {
            (ListingStatus::Success, Some(id)) if !id.trim().is_empty() => id.clone(),
            _ => return Err(format!("listing {} is not live", listing.id)),
        };
        if listing.product_id != self.id {
            return Err(format!(
                "listing {} belongs to product {}",
                listing.id, listing.product_id
            ));
        }
        self.metadata.marketplaces.insert(
            listing.marketplace.clone(),
            MarketplaceListingMeta {
                listing_id: remote_id,
                external_id: listing.external_id.clone(),
                price: listing.price,
                listed_at: listing.created_at,
            },
        );
        self.status = ProductStatus::Published;
        self.updated_at = Utc::now();
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProductMetadata {
    pub generation: GenerationMeta,
    pub pricing: PricingMeta,
    #[serde(default)]
    pub marketplaces: BTreeMap<String, MarketplaceListingMeta>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct GenerationMeta {
    pub provider: String,
    pub prompt_trend: String,
    #[serde(default)]
    pub custom_prompt: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PricingMeta {
    pub suggested: f64,
    pub trend_average: f64,
    /// True when the provider omitted a price and the trend average was used.
    #[serde(default)]
    pub defaulted: bool,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MarketplaceListingMeta {
    pub listing_id: String,
    pub external_id: Option<String>,
    pub price: f64,
    pub listed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ListingStatus {
    Success,
    Failed,
}

/// One publish attempt of a product on one marketplace.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Listing {
    pub id: Uuid,
    pub product_id: Uuid,
    pub marketplace: String,
    pub remote_id: Option<String>,
    pub external_id: Option<String>,
    pub status: ListingStatus,
    pub price: f64,
    pub currency: String,
    pub job_id: Uuid,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn draft() -> Product {
        Product {
            id: Uuid::new_v4(),
            title: "Handmade Aura Candle".into(),
            description: String::new(),
            tags: vec!["candle".into()],
            price: 24.5,
            currency: "USD".into(),
            category: "Home".into(),
            status: ProductStatus::Draft,
            source_keyword: "aura candle".into(),
            seo_keywords: vec![],
            image_prompt: String::new(),
            content: String::new(),
            specifications: Value::Null,
            metadata: ProductMetadata::default(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn listing_for(product: &Product, status: ListingStatus, remote: Option<&str>) -> Listing {
        Listing {
            id: Uuid::new_v4(),
            product_id: product.id,
            marketplace: "etsy".into(),
            remote_id: remote.map(str::to_string),
            external_id: None,
            status,
            price: product.price,
            currency: "USD".into(),
            job_id: Uuid::new_v4(),
            error: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn publish_requires_live_listing() {
        let mut product = draft();
        let failed = listing_for(&product, ListingStatus::Failed, Some("etsy_1"));
        assert!(product.mark_published(&failed).is_err());
        let no_remote = listing_for(&product, ListingStatus::Success, None);
        assert!(product.mark_published(&no_remote).is_err());
        assert_eq!(product.status, ProductStatus::Draft);

        let live = listing_for(&product, ListingStatus::Success, Some("etsy_123"));
        product.mark_published(&live).expect("publish");
        assert_eq!(product.status, ProductStatus::Published);
        assert_eq!(product.metadata.marketplaces["etsy"].listing_id, "etsy_123");
    }

    #[test]
    fn keyword_normalization_collapses_case_and_spaces() {
        assert_eq!(normalize_keyword("  Wedding   Planner "), "wedding planner");
    }

    #[test]
    fn generation_metadata_uses_camel_case() {
        let mut product = draft();
        product.metadata.generation.prompt_trend = "Aura Candle".into();
        let value = serde_json::to_value(&product).unwrap();
        assert_eq!(
            value["metadata"]["generation"]["promptTrend"],
            json!("Aura Candle")
        );
        assert_eq!(value["status"], json!("draft"));
    }

    #[test]
    fn competition_buckets() {
        assert_eq!(Competition::from_listing_count(10), Competition::Low);
        assert_eq!(Competition::from_listing_count(5_000), Competition::Medium);
        assert_eq!(Competition::from_listing_count(50_000), Competition::High);
        assert_eq!(Competition::from_str("HIGH"), Some(Competition::High));
    }
}
