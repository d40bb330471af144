//! eBay Sell Inventory adapter.
//!
//! A listing is an inventory item plus a published offer. The offer id is the
//! handle used for later updates and deletes; the id eBay assigns on publish
//! is reported as the external id.

mod auth;
mod catalog;
mod inventory;
mod offers;

use super::{
    ListingOutcome, ListingPatch, ListingRequest, ListingValidation, MarketplaceAdapter,
    MarketplaceError, UpdateOutcome, cap_scan_limit, common_listing_errors, keyword_for,
};
use crate::config::EbayCredentials;
use crate::http::build_client;
use crate::models::{Competition, ScrapeResult};
use async_trait::async_trait;
use chrono::Utc;
use inventory::InventoryItemRequest;
use offers::{CreateOfferRequest, ListingPolicies, OfferCreation, Price, PricingSummary};
use reqwest::Client;
use serde_json::{Value, json};
use tracing::{info, warn};

const MAX_TITLE: usize = 80;
const MAX_TAGS: usize = 30;
const MAX_SKU: usize = 50;

pub struct EbayAdapter {
    http: Client,
    creds: EbayCredentials,
}

impl EbayAdapter {
    pub fn new(creds: EbayCredentials) -> Self {
        Self {
            http: build_client(),
            creds,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.creds.api_root.trim_end_matches('/'))
    }

    fn policies(&self) -> Option<(ListingPolicies, String)> {
        Some((
            ListingPolicies {
                fulfillment_policy_id: self.creds.fulfillment_policy_id.clone()?,
                payment_policy_id: self.creds.payment_policy_id.clone()?,
                return_policy_id: self.creds.return_policy_id.clone()?,
            },
            self.creds.merchant_location_key.clone()?,
        ))
    }

    fn offer_for(
        &self,
        request: &ListingRequest,
        policies: ListingPolicies,
        location: String,
    ) -> CreateOfferRequest {
        let category_id = if !request.category.is_empty()
            && request.category.chars().all(|ch| ch.is_ascii_digit())
        {
            request.category.clone()
        } else {
            self.creds.default_category_id.clone()
        };
        CreateOfferRequest {
            sku: request.sku.clone(),
            marketplace_id: self.creds.marketplace_id.clone(),
            format: "FIXED_PRICE",
            category_id,
            listing_description: request.description.clone(),
            pricing_summary: PricingSummary {
                price: Price::from_amount(request.price, &request.currency),
            },
            available_quantity: request.quantity,
            merchant_location_key: location,
            listing_policies: policies,
        }
    }

    async fn publish(
        &self,
        request: &ListingRequest,
        token: &str,
    ) -> Result<ListingOutcome, MarketplaceError> {
        let Some((policies, location)) = self.policies() else {
            return Err(MarketplaceError::NotConfigured("ebay".into()));
        };
        self.upsert_inventory_item(
            &request.sku,
            &InventoryItemRequest::from_listing(request),
            token,
        )
        .await?;

        let offer = self.offer_for(request, policies, location);
        let offer_id = match self.create_offer(&offer, token).await? {
            OfferCreation::Created(offer_id) => offer_id,
            OfferCreation::AlreadyExists => {
                // Reconcile with the offer left behind by an earlier attempt.
                let existing = self.offers_by_sku(&request.sku, token).await?;
                let offer_id = existing
                    .into_iter()
                    .find(|summary| {
                        summary.marketplace_id.as_deref()
                            == Some(self.creds.marketplace_id.as_str())
                    })
                    .and_then(|summary| summary.offer_id)
                    .ok_or_else(|| {
                        MarketplaceError::InvalidResponse(format!(
                            "offer for sku {} exists but could not be found",
                            request.sku
                        ))
                    })?;
                warn!(target = "trendforge.marketplace", marketplace = "ebay", sku = %request.sku, offer_id = %offer_id, "offer_reconciled");
                self.put_offer(&offer_id, &offer.as_update(), token).await?;
                offer_id
            }
        };

        let listing_id = self.publish_offer(&offer_id, token).await?;
        info!(
            target = "trendforge.marketplace",
            marketplace = "ebay",
            offer_id = %offer_id,
            listing_id = listing_id.as_deref().unwrap_or(""),
            "offer_published"
        );
        let listing = json!({
            "offerId": offer_id,
            "listingId": listing_id,
            "sku": request.sku,
        });
        Ok(ListingOutcome::published(offer_id, listing_id, listing))
    }
}

/// Client errors on the write path are the marketplace refusing the listing;
/// everything else stays an error so the caller can retry it.
fn rejection_or_error(err: MarketplaceError) -> Result<ListingOutcome, MarketplaceError> {
    match err {
        MarketplaceError::Http { status, message }
            if (400..500).contains(&status) && status != 408 =>
        {
            Ok(ListingOutcome::rejected(format!(
                "ebay rejected listing (HTTP {status}): {message}"
            )))
        }
        other => Err(other),
    }
}

#[async_trait]
impl MarketplaceAdapter for EbayAdapter {
    fn name(&self) -> &str {
        "ebay"
    }

    fn is_available(&self) -> bool {
        self.creds.app_id.is_some()
            && self.creds.cert_id.is_some()
            && self.creds.refresh_token.is_some()
            && self.policies().is_some()
    }

    async fn scan_trends(
        &self,
        category: Option<&str>,
        limit: u32,
    ) -> Result<Vec<ScrapeResult>, MarketplaceError> {
        let token = self.app_token().await?;
        let query = category
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .unwrap_or("trending");
        let payload = self
            .search_items(query, cap_scan_limit(limit), &token)
            .await?;

        let competition = Competition::from_listing_count(payload.total);
        let collected_at = Utc::now();
        Ok(payload
            .item_summaries
            .into_iter()
            .map(|item| {
                let (price, currency) = item
                    .price
                    .as_ref()
                    .map(|p| (p.value.parse::<f64>().unwrap_or(0.0), p.currency.clone()))
                    .unwrap_or((0.0, "USD".to_string()));
                ScrapeResult {
                    marketplace: "ebay".into(),
                    external_product_id: item.item_id.clone(),
                    keyword: keyword_for(&[], &item.title),
                    title: item.title.clone(),
                    search_volume: payload.total,
                    competition,
                    price,
                    currency,
                    collected_at,
                    raw: serde_json::to_value(&item).unwrap_or(Value::Null),
                }
            })
            .collect())
    }

    fn validate_listing(&self, request: &ListingRequest) -> ListingValidation {
        let mut errors = common_listing_errors(request, MAX_TITLE, MAX_TAGS);
        let sku = request.sku.trim();
        if sku.is_empty() {
            errors.push("sku is required".to_string());
        } else if sku.len() > MAX_SKU {
            errors.push(format!("sku exceeds {MAX_SKU} characters"));
        }
        ListingValidation::from_errors(errors)
    }

    async fn list_product(
        &self,
        request: &ListingRequest,
    ) -> Result<ListingOutcome, MarketplaceError> {
        let token = self.user_token().await?;
        match self.publish(request, &token).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => rejection_or_error(err),
        }
    }

    async fn update_product(
        &self,
        listing_id: &str,
        patch: &ListingPatch,
    ) -> Result<UpdateOutcome, MarketplaceError> {
        let token = self.user_token().await?;
        let mut offer = match self.get_offer(listing_id, &token).await {
            Ok(offer) => offer,
            Err(MarketplaceError::Http { status: 404, message }) => {
                return Ok(UpdateOutcome {
                    success: false,
                    listing: None,
                    error: Some(message),
                });
            }
            Err(err) => return Err(err),
        };
        let sku = offer
            .get("sku")
            .and_then(Value::as_str)
            .map(str::to_string);
        if let (Some(title), Some(sku)) = (&patch.title, &sku) {
            self.retitle_inventory_item(sku, title, &token).await?;
        }
        offers::apply_patch(&mut offer, patch);
        match self.put_offer(listing_id, &offer, &token).await {
            Ok(()) => Ok(UpdateOutcome {
                success: true,
                listing: Some(offer),
                error: None,
            }),
            Err(MarketplaceError::Http { status: 400, message }) => Ok(UpdateOutcome {
                success: false,
                listing: None,
                error: Some(message),
            }),
            Err(err) => Err(err),
        }
    }

    async fn delete_product(&self, listing_id: &str) -> Result<bool, MarketplaceError> {
        let token = self.user_token().await?;
        self.delete_offer(listing_id, &token).await
    }

    async fn get_categories(&self) -> Result<Vec<String>, MarketplaceError> {
        let token = self.app_token().await?;
        self.top_level_categories(&token).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn creds(root: &str) -> EbayCredentials {
        EbayCredentials {
            app_id: Some("app".into()),
            cert_id: Some("cert".into()),
            refresh_token: Some("refresh".into()),
            api_root: root.to_string(),
            marketplace_id: "EBAY_US".into(),
            category_tree_id: "0".into(),
            default_category_id: "99".into(),
            merchant_location_key: Some("home".into()),
            fulfillment_policy_id: Some("f".into()),
            payment_policy_id: Some("p".into()),
            return_policy_id: Some("r".into()),
        }
    }

    fn request() -> ListingRequest {
        ListingRequest {
            product_id: None,
            sku: "TF-1".into(),
            title: "Aura Candle".into(),
            description: "Soy wax".into(),
            price: 19.0,
            currency: "USD".into(),
            quantity: 5,
            tags: vec!["candle".into()],
            category: "Home".into(),
            images: vec![],
        }
    }

    async fn mount_token(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/identity/v1/oauth2/token"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"access_token": "tok"})),
            )
            .mount(server)
            .await;
    }

    #[test]
    fn missing_policy_makes_adapter_unavailable() {
        let mut creds = creds("http://localhost");
        assert!(EbayAdapter::new(creds.clone()).is_available());
        creds.return_policy_id = None;
        assert!(!EbayAdapter::new(creds).is_available());
    }

    #[tokio::test]
    async fn publishes_inventory_item_then_offer() {
        let server = MockServer::start().await;
        mount_token(&server).await;
        Mock::given(method("PUT"))
            .and(path("/sell/inventory/v1/inventory_item/TF-1"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/sell/inventory/v1/offer"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"offerId": "555"})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/sell/inventory/v1/offer/555/publish"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"listingId": "1100"})),
            )
            .mount(&server)
            .await;

        let outcome = EbayAdapter::new(creds(&server.uri()))
            .list_product(&request())
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.listing_id.as_deref(), Some("555"));
        assert_eq!(outcome.external_id.as_deref(), Some("1100"));
    }

    #[tokio::test]
    async fn invalid_offer_is_reported_as_rejection() {
        let server = MockServer::start().await;
        mount_token(&server).await;
        Mock::given(method("PUT"))
            .and(path("/sell/inventory/v1/inventory_item/TF-1"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/sell/inventory/v1/offer"))
            .respond_with(ResponseTemplate::new(400).set_body_string("invalid category"))
            .mount(&server)
            .await;

        let outcome = EbayAdapter::new(creds(&server.uri()))
            .list_product(&request())
            .await
            .unwrap();
        assert!(!outcome.success);
        assert!(outcome.error.unwrap_or_default().contains("invalid category"));
    }

    #[tokio::test]
    async fn revoked_refresh_token_is_an_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/identity/v1/oauth2/token"))
            .respond_with(ResponseTemplate::new(400).set_body_string("invalid_grant"))
            .mount(&server)
            .await;

        let err = EbayAdapter::new(creds(&server.uri()))
            .list_product(&request())
            .await
            .unwrap_err();
        assert!(matches!(err, MarketplaceError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn scan_uses_browse_totals_for_competition() {
        let server = MockServer::start().await;
        mount_token(&server).await;
        Mock::given(method("GET"))
            .and(path("/buy/browse/v1/item_summary/search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "total": 25000,
                "itemSummaries": [{
                    "itemId": "v1|1|0",
                    "title": "Aura Candle Gift Set",
                    "price": {"value": "21.00", "currency": "USD"}
                }]
            })))
            .mount(&server)
            .await;

        let rows = EbayAdapter::new(creds(&server.uri()))
            .scan_trends(Some("candles"), 20)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].keyword, "aura candle gift");
        assert_eq!(rows[0].competition, Competition::High);
        assert!((rows[0].price - 21.0).abs() < f64::EPSILON);
    }
}
