//! Scripted adapters and a pipeline builder shared by the unit tests.

use crate::ai::{AiError, AiProvider, CompletionRequest, GeneratedProduct, RankedTrend};
use crate::config::{PipelineSettings, RecoverySettings};
use crate::ledger::JobLedger;
use crate::marketplace::{
    ListingOutcome, ListingPatch, ListingRequest, ListingValidation, MarketplaceAdapter,
    MarketplaceError, MarketplaceRegistry, UpdateOutcome, common_listing_errors,
};
use crate::models::{
    Competition, Product, ProductMetadata, ProductStatus, ScrapeResult, TrendData, TrendUpsert,
    normalize_keyword,
};
use crate::pipeline::Pipeline;
use crate::recovery::RecoveryEngine;
use crate::store::{MemoryStore, Store};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

pub fn scrape_row(
    keyword: &str,
    id: &str,
    volume: u64,
    competition: Competition,
    price: f64,
) -> ScrapeResult {
    ScrapeResult {
        marketplace: "etsy".into(),
        external_product_id: id.into(),
        keyword: keyword.into(),
        title: keyword.into(),
        search_volume: volume,
        competition,
        price,
        currency: "USD".into(),
        collected_at: Utc::now(),
        raw: Value::Null,
    }
}

pub async fn seed_trend(
    pipeline: &Pipeline,
    keyword: &str,
    volume: u64,
    competition: Competition,
    avg_price: f64,
) -> TrendData {
    pipeline
        .store()
        .upsert_trend(TrendUpsert {
            keyword: keyword.into(),
            search_volume: volume,
            competition,
            avg_price,
        })
        .await
        .unwrap()
}

pub async fn seed_product(pipeline: &Pipeline, price: f64) -> Product {
    let now = Utc::now();
    let product = Product {
        id: Uuid::new_v4(),
        title: "Handmade Aura Candle".into(),
        description: "Soy wax candle poured by hand".into(),
        tags: vec!["candle".into(), "handmade".into()],
        price,
        currency: "USD".into(),
        category: "Home & Living".into(),
        status: ProductStatus::Draft,
        source_keyword: "Aura Candle".into(),
        seo_keywords: Vec::new(),
        image_prompt: String::new(),
        content: String::new(),
        specifications: json!({}),
        metadata: ProductMetadata::default(),
        created_at: now,
        updated_at: now,
    };
    pipeline.store().insert_product(product).await.unwrap()
}

struct MarketplaceScript {
    scan: Result<Vec<ScrapeResult>, MarketplaceError>,
    listing: Result<ListingOutcome, MarketplaceError>,
    list_calls: u32,
    update_calls: u32,
}

/// In-process marketplace whose responses are set by the test. Clones share
/// one script, so a test can keep a handle after registering it.
#[derive(Clone)]
pub struct FakeMarketplace {
    name: String,
    available: bool,
    gate: Option<Arc<Notify>>,
    script: Arc<Mutex<MarketplaceScript>>,
}

impl FakeMarketplace {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.into(),
            available: true,
            gate: None,
            script: Arc::new(Mutex::new(MarketplaceScript {
                scan: Ok(Vec::new()),
                listing: Ok(ListingOutcome::published(
                    format!("{name}_1"),
                    None,
                    json!({}),
                )),
                list_calls: 0,
                update_calls: 0,
            })),
        }
    }

    pub fn with_scan(self, rows: Vec<ScrapeResult>) -> Self {
        self.set_scan(rows);
        self
    }

    pub fn set_scan(&self, rows: Vec<ScrapeResult>) {
        let rows = rows
            .into_iter()
            .map(|mut row| {
                row.marketplace = self.name.clone();
                row
            })
            .collect();
        self.script.lock().unwrap().scan = Ok(rows);
    }

    pub fn failing_scan(self, message: &str) -> Self {
        self.script.lock().unwrap().scan = Err(MarketplaceError::Transport(message.into()));
        self
    }

    pub fn with_listing(self, result: Result<ListingOutcome, MarketplaceError>) -> Self {
        self.script.lock().unwrap().listing = result;
        self
    }

    pub fn timing_out(self) -> Self {
        self.with_listing(Err(MarketplaceError::Transport("request timed out".into())))
    }

    /// `list_product` parks after counting the call until `gate` is notified.
    pub fn gated(mut self, gate: Arc<Notify>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    pub fn list_calls(&self) -> u32 {
        self.script.lock().unwrap().list_calls
    }

    pub fn update_calls(&self) -> u32 {
        self.script.lock().unwrap().update_calls
    }
}

#[async_trait]
impl MarketplaceAdapter for FakeMarketplace {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_available(&self) -> bool {
        self.available
    }

    async fn scan_trends(
        &self,
        _category: Option<&str>,
        _limit: u32,
    ) -> Result<Vec<ScrapeResult>, MarketplaceError> {
        let script = self.script.lock().unwrap();
        script.scan.clone().map(|rows| {
            let now = Utc::now();
            rows.into_iter()
                .map(|mut row| {
                    row.collected_at = now;
                    row
                })
                .collect()
        })
    }

    fn validate_listing(&self, request: &ListingRequest) -> ListingValidation {
        ListingValidation::from_errors(common_listing_errors(request, 140, 13))
    }

    async fn list_product(
        &self,
        _request: &ListingRequest,
    ) -> Result<ListingOutcome, MarketplaceError> {
        self.script.lock().unwrap().list_calls += 1;
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        self.script.lock().unwrap().listing.clone()
    }

    async fn update_product(
        &self,
        _listing_id: &str,
        patch: &ListingPatch,
    ) -> Result<UpdateOutcome, MarketplaceError> {
        self.script.lock().unwrap().update_calls += 1;
        Ok(UpdateOutcome {
            success: true,
            listing: Some(serde_json::to_value(patch).unwrap_or(Value::Null)),
            error: None,
        })
    }

    async fn delete_product(&self, _listing_id: &str) -> Result<bool, MarketplaceError> {
        Ok(true)
    }

    async fn get_categories(&self) -> Result<Vec<String>, MarketplaceError> {
        Ok(vec!["Digital Downloads".into()])
    }
}

#[derive(Default)]
struct AiScript {
    products: HashMap<String, Result<GeneratedProduct, AiError>>,
    ranking: Option<Vec<RankedTrend>>,
    images: VecDeque<Result<String, AiError>>,
    product_calls: u32,
    image_calls: u32,
}

/// AI provider with per-keyword scripted products. Unscripted keywords get a
/// plain product with no price; unscripted analysis ranks by local score.
#[derive(Clone, Default)]
pub struct FakeAi {
    script: Arc<Mutex<AiScript>>,
}

impl FakeAi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_product(self, keyword: &str, result: Result<GeneratedProduct, AiError>) -> Self {
        self.script
            .lock()
            .unwrap()
            .products
            .insert(normalize_keyword(keyword), result);
        self
    }

    pub fn with_ranking(self, ranking: Vec<RankedTrend>) -> Self {
        self.script.lock().unwrap().ranking = Some(ranking);
        self
    }

    /// Image results handed out in order; once drained, images are unsupported.
    pub fn with_images(self, results: Vec<Result<String, AiError>>) -> Self {
        self.script.lock().unwrap().images = results.into();
        self
    }

    pub fn product_calls(&self) -> u32 {
        self.script.lock().unwrap().product_calls
    }

    pub fn image_calls(&self) -> u32 {
        self.script.lock().unwrap().image_calls
    }
}

#[async_trait]
impl AiProvider for FakeAi {
    fn name(&self) -> &str {
        "fake"
    }

    async fn complete(&self, _request: &CompletionRequest) -> Result<String, AiError> {
        Err(AiError::Unsupported("raw completion".into()))
    }

    async fn generate_product(
        &self,
        trend: &TrendData,
        _custom_prompt: Option<&str>,
    ) -> Result<GeneratedProduct, AiError> {
        let mut script = self.script.lock().unwrap();
        script.product_calls += 1;
        script
            .products
            .get(&normalize_keyword(&trend.keyword))
            .cloned()
            .unwrap_or_else(|| {
                Ok(GeneratedProduct {
                    title: format!("{} Printable", trend.keyword),
                    description: format!("A printable built around {}", trend.keyword),
                    tags: vec![trend.keyword.clone()],
                    ..GeneratedProduct::default()
                })
            })
    }

    async fn generate_image(&self, _prompt: &str) -> Result<String, AiError> {
        let mut script = self.script.lock().unwrap();
        script.image_calls += 1;
        script
            .images
            .pop_front()
            .unwrap_or_else(|| Err(AiError::Unsupported("image generation".into())))
    }

    async fn analyze_trends(&self, trends: &[TrendData]) -> Result<Vec<RankedTrend>, AiError> {
        if let Some(ranking) = self.script.lock().unwrap().ranking.clone() {
            return Ok(ranking);
        }
        let mut ranked: Vec<RankedTrend> = trends
            .iter()
            .map(|trend| RankedTrend {
                keyword: trend.keyword.clone(),
                score: trend.local_score(),
                rank: None,
                insight: None,
            })
            .collect();
        ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
        Ok(ranked)
    }
}

/// Pipeline over a memory store with zero-delay recovery. Scrape sources and
/// list targets are the registered marketplaces in registration order.
pub struct PipelineBuilder {
    marketplaces: Vec<FakeMarketplace>,
    ai: FakeAi,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self {
            marketplaces: Vec::new(),
            ai: FakeAi::new(),
        }
    }

    pub fn marketplace(mut self, marketplace: FakeMarketplace) -> Self {
        self.marketplaces.push(marketplace);
        self
    }

    pub fn ai(mut self, ai: FakeAi) -> Self {
        self.ai = ai;
        self
    }

    pub fn build(self) -> Pipeline {
        let names: Vec<String> = self
            .marketplaces
            .iter()
            .map(|marketplace| marketplace.name.clone())
            .collect();
        let mut registry = MarketplaceRegistry::new();
        for marketplace in self.marketplaces {
            registry.register(Arc::new(marketplace));
        }
        let settings = PipelineSettings {
            product_delay: Duration::ZERO,
            target_marketplaces: names.clone(),
            scrape_sources: names,
            ..PipelineSettings::default()
        };
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        Pipeline::new(
            store,
            JobLedger::new(),
            Arc::new(RecoveryEngine::in_memory(RecoverySettings::immediate())),
            Arc::new(registry),
            Arc::new(self.ai),
            settings,
        )
    }
}
