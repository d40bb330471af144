use super::{
    ListingOutcome, ListingPatch, ListingRequest, ListingValidation, MarketplaceAdapter,
    MarketplaceError, UpdateOutcome, cap_scan_limit, common_listing_errors, keyword_for,
};
use crate::config::EtsyCredentials;
use crate::http::{build_client, ensure_success};
use crate::models::{Competition, ScrapeResult};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info};

const MAX_TITLE: usize = 140;
const MAX_TAGS: usize = 13;
const MAX_TAG_CHARS: usize = 20;
/// Used when the product category is not an Etsy taxonomy id.
const FALLBACK_TAXONOMY_ID: u64 = 2078;

pub struct EtsyAdapter {
    http: Client,
    creds: EtsyCredentials,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    count: u64,
    #[serde(default)]
    results: Vec<EtsyListing>,
}

#[derive(Debug, Deserialize, Serialize)]
struct EtsyListing {
    listing_id: u64,
    title: String,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    views: Option<u64>,
    #[serde(default)]
    num_favorers: Option<u64>,
    #[serde(default)]
    price: Option<EtsyMoney>,
}

#[derive(Debug, Deserialize, Serialize)]
struct EtsyMoney {
    amount: i64,
    divisor: i64,
    currency_code: String,
}

impl EtsyMoney {
    fn value(&self) -> f64 {
        if self.divisor == 0 {
            return 0.0;
        }
        self.amount as f64 / self.divisor as f64
    }
}

#[derive(Debug, Deserialize)]
struct TaxonomyResponse {
    #[serde(default)]
    results: Vec<TaxonomyNode>,
}

#[derive(Debug, Deserialize)]
struct TaxonomyNode {
    name: String,
}

impl EtsyAdapter {
    pub fn new(creds: EtsyCredentials) -> Self {
        Self {
            http: build_client(),
            creds,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v3/application{path}", self.creds.api_root.trim_end_matches('/'))
    }

    fn shop_id(&self) -> Result<&str, MarketplaceError> {
        self.creds
            .shop_id
            .as_deref()
            .ok_or_else(|| MarketplaceError::NotConfigured("etsy".into()))
    }

    fn authorized(&self, builder: RequestBuilder) -> Result<RequestBuilder, MarketplaceError> {
        let (Some(key), Some(token)) = (&self.creds.api_key, &self.creds.access_token) else {
            return Err(MarketplaceError::NotConfigured("etsy".into()));
        };
        Ok(builder.header("x-api-key", key).bearer_auth(token))
    }

    async fn send(&self, builder: RequestBuilder) -> Result<reqwest::Response, MarketplaceError> {
        self.authorized(builder)?
            .send()
            .await
            .map_err(|err| MarketplaceError::from_transport(&err))
    }
}

#[async_trait]
impl MarketplaceAdapter for EtsyAdapter {
    fn name(&self) -> &str {
        "etsy"
    }

    fn is_available(&self) -> bool {
        self.creds.api_key.is_some()
            && self.creds.access_token.is_some()
            && self.creds.shop_id.is_some()
    }

    async fn scan_trends(
        &self,
        category: Option<&str>,
        limit: u32,
    ) -> Result<Vec<ScrapeResult>, MarketplaceError> {
        let limit = cap_scan_limit(limit);
        let mut query = vec![
            ("limit", limit.to_string()),
            ("sort_on", "score".to_string()),
        ];
        if let Some(category) = category.filter(|c| !c.trim().is_empty()) {
            query.push(("keywords", category.trim().to_string()));
        }
        let response = self
            .send(self.http.get(self.url("/listings/active")).query(&query))
            .await?;
        let response = ensure_success(response)
            .await
            .map_err(MarketplaceError::from_http)?;
        let payload: SearchResponse = response
            .json()
            .await
            .map_err(|err| MarketplaceError::InvalidResponse(err.to_string()))?;

        let competition = Competition::from_listing_count(payload.count);
        let collected_at = Utc::now();
        let results: Vec<ScrapeResult> = payload
            .results
            .into_iter()
            .map(|listing| {
                let (price, currency) = listing
                    .price
                    .as_ref()
                    .map(|money| (money.value(), money.currency_code.clone()))
                    .unwrap_or((0.0, "USD".to_string()));
                ScrapeResult {
                    marketplace: "etsy".into(),
                    external_product_id: listing.listing_id.to_string(),
                    keyword: keyword_for(&listing.tags, &listing.title),
                    title: listing.title.clone(),
                    search_volume: listing.views.unwrap_or(0)
                        + listing.num_favorers.unwrap_or(0),
                    competition,
                    price,
                    currency,
                    collected_at,
                    raw: serde_json::to_value(&listing).unwrap_or(Value::Null),
                }
            })
            .collect();
        debug!(target = "trendforge.marketplace", marketplace = "etsy", count = results.len(), "scan_complete");
        Ok(results)
    }

    fn validate_listing(&self, request: &ListingRequest) -> ListingValidation {
        let mut errors = common_listing_errors(request, MAX_TITLE, MAX_TAGS);
        if let Some(tag) = request
            .tags
            .iter()
            .find(|tag| tag.chars().count() > MAX_TAG_CHARS)
        {
            errors.push(format!("tag '{tag}' exceeds {MAX_TAG_CHARS} characters"));
        }
        ListingValidation::from_errors(errors)
    }

    async fn list_product(
        &self,
        request: &ListingRequest,
    ) -> Result<ListingOutcome, MarketplaceError> {
        let shop_id = self.shop_id()?;
        let body = json!({
            "quantity": request.quantity,
            "title": request.title,
            "description": request.description,
            "price": request.price,
            "who_made": "i_did",
            "when_made": "made_to_order",
            "taxonomy_id": request.category.parse::<u64>().unwrap_or(FALLBACK_TAXONOMY_ID),
            "type": "download",
            "tags": request.tags,
            "sku": [request.sku],
        });
        let response = self
            .send(
                self.http
                    .post(self.url(&format!("/shops/{shop_id}/listings")))
                    .json(&body),
            )
            .await?;
        let status = response.status();
        if matches!(
            status,
            StatusCode::BAD_REQUEST | StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY
        ) {
            let body = response.text().await.unwrap_or_default();
            return Ok(ListingOutcome::rejected(format!(
                "etsy rejected listing (HTTP {status}): {}",
                body.trim()
            )));
        }
        let response = ensure_success(response)
            .await
            .map_err(MarketplaceError::from_http)?;
        let listing: Value = response
            .json()
            .await
            .map_err(|err| MarketplaceError::InvalidResponse(err.to_string()))?;
        let Some(listing_id) = listing.get("listing_id").and_then(id_string) else {
            return Err(MarketplaceError::InvalidResponse(
                "listing_id missing from etsy response".into(),
            ));
        };
        info!(target = "trendforge.marketplace", marketplace = "etsy", listing_id = %listing_id, "listing_created");
        Ok(ListingOutcome::published(
            listing_id.clone(),
            Some(listing_id),
            listing,
        ))
    }

    async fn update_product(
        &self,
        listing_id: &str,
        patch: &ListingPatch,
    ) -> Result<UpdateOutcome, MarketplaceError> {
        let shop_id = self.shop_id()?;
        let response = self
            .send(
                self.http
                    .patch(self.url(&format!("/shops/{shop_id}/listings/{listing_id}")))
                    .json(patch),
            )
            .await?;
        let status = response.status();
        if matches!(status, StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND) {
            let body = response.text().await.unwrap_or_default();
            return Ok(UpdateOutcome {
                success: false,
                listing: None,
                error: Some(format!("HTTP {status}: {}", body.trim())),
            });
        }
        let response = ensure_success(response)
            .await
            .map_err(MarketplaceError::from_http)?;
        let listing: Value = response
            .json()
            .await
            .map_err(|err| MarketplaceError::InvalidResponse(err.to_string()))?;
        Ok(UpdateOutcome {
            success: true,
            listing: Some(listing),
            error: None,
        })
    }

    async fn delete_product(&self, listing_id: &str) -> Result<bool, MarketplaceError> {
        let response = self
            .send(self.http.delete(self.url(&format!("/listings/{listing_id}"))))
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        ensure_success(response)
            .await
            .map_err(MarketplaceError::from_http)?;
        Ok(true)
    }

    async fn get_categories(&self) -> Result<Vec<String>, MarketplaceError> {
        let response = self
            .send(self.http.get(self.url("/seller-taxonomy/nodes")))
            .await?;
        let response = ensure_success(response)
            .await
            .map_err(MarketplaceError::from_http)?;
        let payload: TaxonomyResponse = response
            .json()
            .await
            .map_err(|err| MarketplaceError::InvalidResponse(err.to_string()))?;
        Ok(payload.results.into_iter().map(|node| node.name).collect())
    }
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}
