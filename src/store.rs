//! Entity persistence for trends, scrape snapshots, products, and listings.

use crate::models::{
    Listing, ListingStatus, Product, ScrapeResult, TrendData, TrendUpsert, normalize_keyword,
};
use crate::recovery::{Classify, ErrorKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("invalid write: {0}")]
    Invalid(String),
}

impl Classify for StoreError {
    fn error_kind(&self) -> ErrorKind {
        match self {
            StoreError::Unavailable(_) => ErrorKind::DatabaseError,
            _ => ErrorKind::UnknownError,
        }
    }

    fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Inserts or refreshes the trend row for `upsert.keyword`.
    async fn upsert_trend(&self, upsert: TrendUpsert) -> Result<TrendData, StoreError>;
    async fn get_trend(&self, keyword: &str) -> Result<Option<TrendData>, StoreError>;
    async fn list_trends(&self) -> Result<Vec<TrendData>, StoreError>;
    async fn rank_trend(
        &self,
        keyword: &str,
        score: f64,
        rank: u32,
        insight: Option<String>,
    ) -> Result<TrendData, StoreError>;
    /// Highest scoring trends first; unranked trends use their local score.
    async fn top_trends(&self, limit: usize) -> Result<Vec<TrendData>, StoreError>;

    /// Returns `false` when the `(marketplace, product, collected_at)` triple
    /// was already stored.
    async fn insert_scrape_result(&self, result: ScrapeResult) -> Result<bool, StoreError>;
    async fn recent_scrape_results(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<ScrapeResult>, StoreError>;

    async fn insert_product(&self, product: Product) -> Result<Product, StoreError>;
    async fn get_product(&self, id: Uuid) -> Result<Option<Product>, StoreError>;
    async fn update_product(&self, product: Product) -> Result<Product, StoreError>;
    async fn list_products(&self) -> Result<Vec<Product>, StoreError>;

    async fn insert_listing(&self, listing: Listing) -> Result<Listing, StoreError>;
    async fn listings_for(&self, product_id: Uuid) -> Result<Vec<Listing>, StoreError>;
    async fn update_listing_price(&self, listing_id: Uuid, price: f64) -> Result<Listing, StoreError>;
    async fn successful_listing(
        &self,
        product_id: Uuid,
        marketplace: &str,
    ) -> Result<Option<Listing>, StoreError>;

    async fn health_check(&self) -> Result<(), StoreError>;
}

#[derive(Default)]
struct Tables {
    trends: BTreeMap<String, TrendData>,
    scrape_keys: HashSet<(String, String, DateTime<Utc>)>,
    scrape_results: Vec<ScrapeResult>,
    products: HashMap<Uuid, Product>,
    listings: Vec<Listing>,
}

/// Process-local store. Writers for one logical unit are serialized by the
/// job ledger, so a single lock is enough here.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn upsert_trend(&self, upsert: TrendUpsert) -> Result<TrendData, StoreError> {
        let key = normalize_keyword(&upsert.keyword);
        if key.is_empty() {
            return Err(StoreError::Invalid("trend keyword is empty".into()));
        }
        let display = upsert.keyword.split_whitespace().collect::<Vec<_>>().join(" ");
        let now = Utc::now();
        let mut tables = self.tables.write().await;
        let row = tables
            .trends
            .entry(key)
            .and_modify(|existing| {
                existing.search_volume = upsert.search_volume;
                existing.competition = upsert.competition;
                existing.avg_price = upsert.avg_price;
                existing.updated_at = now;
            })
            .or_insert_with(|| TrendData {
                keyword: display,
                search_volume: upsert.search_volume,
                competition: upsert.competition,
                avg_price: upsert.avg_price,
                score: None,
                rank: None,
                insight: None,
                created_at: now,
                updated_at: now,
            });
        Ok(row.clone())
    }

    async fn get_trend(&self, keyword: &str) -> Result<Option<TrendData>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables.trends.get(&normalize_keyword(keyword)).cloned())
    }

    async fn list_trends(&self) -> Result<Vec<TrendData>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables.trends.values().cloned().collect())
    }

    async fn rank_trend(
        &self,
        keyword: &str,
        score: f64,
        rank: u32,
        insight: Option<String>,
    ) -> Result<TrendData, StoreError> {
        let key = normalize_keyword(keyword);
        let mut tables = self.tables.write().await;
        let row = tables
            .trends
            .get_mut(&key)
            .ok_or_else(|| StoreError::NotFound {
                entity: "trend",
                id: key.clone(),
            })?;
        row.score = Some(score);
        row.rank = Some(rank);
        if insight.is_some() {
            row.insight = insight;
        }
        row.updated_at = Utc::now();
        Ok(row.clone())
    }

    async fn top_trends(&self, limit: usize) -> Result<Vec<TrendData>, StoreError> {
        let tables = self.tables.read().await;
        let mut trends: Vec<TrendData> = tables.trends.values().cloned().collect();
        trends.sort_by(|a, b| {
            b.effective_score()
                .total_cmp(&a.effective_score())
                .then_with(|| a.keyword.cmp(&b.keyword))
        });
        trends.truncate(limit);
        Ok(trends)
    }

    async fn insert_scrape_result(&self, result: ScrapeResult) -> Result<bool, StoreError> {
        let mut tables = self.tables.write().await;
        if !tables.scrape_keys.insert(result.unique_key()) {
            return Ok(false);
        }
        tables.scrape_results.push(result);
        Ok(true)
    }

    async fn recent_scrape_results(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<ScrapeResult>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .scrape_results
            .iter()
            .filter(|row| row.collected_at >= since)
            .cloned()
            .collect())
    }

    async fn insert_product(&self, product: Product) -> Result<Product, StoreError> {
        let mut tables = self.tables.write().await;
        if tables.products.contains_key(&product.id) {
            return Err(StoreError::Invalid(format!(
                "product {} already exists",
                product.id
            )));
        }
        tables.products.insert(product.id, product.clone());
        Ok(product)
    }

    async fn get_product(&self, id: Uuid) -> Result<Option<Product>, StoreError> {
        Ok(self.tables.read().await.products.get(&id).cloned())
    }

    async fn update_product(&self, product: Product) -> Result<Product, StoreError> {
        let mut tables = self.tables.write().await;
        let slot = tables
            .products
            .get_mut(&product.id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "product",
                id: product.id.to_string(),
            })?;
        *slot = product.clone();
        Ok(product)
    }

    async fn list_products(&self) -> Result<Vec<Product>, StoreError> {
        let tables = self.tables.read().await;
        let mut products: Vec<Product> = tables.products.values().cloned().collect();
        products.sort_by_key(|product| product.created_at);
        Ok(products)
    }

    async fn insert_listing(&self, listing: Listing) -> Result<Listing, StoreError> {
        let mut tables = self.tables.write().await;
        if !tables.products.contains_key(&listing.product_id) {
            return Err(StoreError::NotFound {
                entity: "product",
                id: listing.product_id.to_string(),
            });
        }
        if listing.status == ListingStatus::Success
            && tables.listings.iter().any(|existing| {
                existing.product_id == listing.product_id
                    && existing.marketplace == listing.marketplace
                    && existing.status == ListingStatus::Success
            })
        {
            return Err(StoreError::Invalid(format!(
                "product {} already has a live {} listing",
                listing.product_id, listing.marketplace
            )));
        }
        tables.listings.push(listing.clone());
        Ok(listing)
    }

    async fn update_listing_price(&self, listing_id: Uuid, price: f64) -> Result<Listing, StoreError> {
        let mut tables = self.tables.write().await;
        let listing = tables
            .listings
            .iter_mut()
            .find(|listing| listing.id == listing_id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "listing",
                id: listing_id.to_string(),
            })?;
        listing.price = price;
        Ok(listing.clone())
    }

    async fn listings_for(&self, product_id: Uuid) -> Result<Vec<Listing>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .listings
            .iter()
            .filter(|listing| listing.product_id == product_id)
            .cloned()
            .collect())
    }

    async fn successful_listing(
        &self,
        product_id: Uuid,
        marketplace: &str,
    ) -> Result<Option<Listing>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .listings
            .iter()
            .find(|listing| {
                listing.product_id == product_id
                    && listing.marketplace == marketplace
                    && listing.status == ListingStatus::Success
            })
            .cloned())
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        let _tables = self.tables.read().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Competition;
    use serde_json::Value;

    fn upsert(keyword: &str, volume: u64) -> TrendUpsert {
        TrendUpsert {
            keyword: keyword.into(),
            search_volume: volume,
            competition: Competition::Low,
            avg_price: 18.5,
        }
    }

    fn scrape(id: &str, at: DateTime<Utc>) -> ScrapeResult {
        ScrapeResult {
            marketplace: "etsy".into(),
            external_product_id: id.into(),
            keyword: "wedding planner".into(),
            title: "Wedding Planner".into(),
            search_volume: 120,
            competition: Competition::Low,
            price: 18.5,
            currency: "USD".into(),
            collected_at: at,
            raw: Value::Null,
        }
    }

    #[tokio::test]
    async fn upsert_by_keyword_keeps_one_row() {
        let store = MemoryStore::new();
        let first = store.upsert_trend(upsert("Wedding Planner", 120)).await.unwrap();
        let second = store.upsert_trend(upsert("wedding  planner", 150)).await.unwrap();
        let trends = store.list_trends().await.unwrap();
        assert_eq!(trends.len(), 1);
        assert_eq!(trends[0].search_volume, 150);
        assert_eq!(trends[0].keyword, "Wedding Planner");
        assert_eq!(first.created_at, second.created_at);
    }

    #[tokio::test]
    async fn scrape_results_are_unique_on_triple() {
        let store = MemoryStore::new();
        let at = Utc::now();
        assert!(store.insert_scrape_result(scrape("1", at)).await.unwrap());
        assert!(!store.insert_scrape_result(scrape("1", at)).await.unwrap());
        assert!(store.insert_scrape_result(scrape("2", at)).await.unwrap());
        let later = at + chrono::Duration::seconds(1);
        assert!(store.insert_scrape_result(scrape("1", later)).await.unwrap());
        let rows = store
            .recent_scrape_results(at - chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(rows.len(), 3);
    }

    #[tokio::test]
    async fn top_trends_prefer_ranked_score() {
        let store = MemoryStore::new();
        store.upsert_trend(upsert("alpha", 1_000)).await.unwrap();
        store.upsert_trend(upsert("beta", 10)).await.unwrap();
        store.rank_trend("beta", 5_000.0, 1, None).await.unwrap();
        let top = store.top_trends(1).await.unwrap();
        assert_eq!(top[0].keyword, "beta");
    }

    #[tokio::test]
    async fn ranking_unknown_trend_is_not_found() {
        let store = MemoryStore::new();
        let err = store.rank_trend("ghost", 1.0, 1, None).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn repricing_an_unknown_listing_is_not_found() {
        let store = MemoryStore::new();
        let err = store.update_listing_price(Uuid::new_v4(), 9.5).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { entity: "listing", .. }));
    }
}
