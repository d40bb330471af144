use super::EbayAdapter;
use crate::http::ensure_success;
use crate::marketplace::{ListingPatch, MarketplaceError};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ListingPolicies {
    pub fulfillment_policy_id: String,
    pub payment_policy_id: String,
    pub return_policy_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub(super) struct Price {
    pub value: String,
    pub currency: String,
}

impl Price {
    pub fn from_amount(amount: f64, currency: &str) -> Self {
        Self {
            value: format!("{amount:.2}"),
            currency: currency.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub(super) struct PricingSummary {
    pub price: Price,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct CreateOfferRequest {
    pub sku: String,
    pub marketplace_id: String,
    pub format: &'static str,
    pub category_id: String,
    pub listing_description: String,
    pub pricing_summary: PricingSummary,
    pub available_quantity: u32,
    pub merchant_location_key: String,
    pub listing_policies: ListingPolicies,
}

impl CreateOfferRequest {
    /// Body for `PUT offer/{id}`: same document minus the identity fields.
    pub fn as_update(&self) -> Value {
        let mut body = serde_json::to_value(self).unwrap_or(Value::Null);
        if let Some(fields) = body.as_object_mut() {
            fields.remove("sku");
            fields.remove("marketplaceId");
        }
        body
    }
}

pub(super) enum OfferCreation {
    Created(String),
    AlreadyExists,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OfferResponse {
    offer_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublishResponse {
    listing_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct OfferSummary {
    pub offer_id: Option<String>,
    pub marketplace_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OfferSearchResponse {
    offers: Option<Vec<OfferSummary>>,
}

/// Merges a partial update into a fetched offer document.
pub(super) fn apply_patch(offer: &mut Value, patch: &ListingPatch) {
    let Some(fields) = offer.as_object_mut() else {
        return;
    };
    for readonly in ["offerId", "sku", "marketplaceId", "status", "listing"] {
        fields.remove(readonly);
    }
    if let Some(price) = patch.price {
        let currency = fields
            .get("pricingSummary")
            .and_then(|summary| summary.pointer("/price/currency"))
            .and_then(Value::as_str)
            .unwrap_or("USD")
            .to_string();
        fields.insert(
            "pricingSummary".into(),
            json!({ "price": Price::from_amount(price, &currency) }),
        );
    }
    if let Some(quantity) = patch.quantity {
        fields.insert("availableQuantity".into(), json!(quantity));
    }
    if let Some(description) = &patch.description {
        fields.insert("listingDescription".into(), json!(description));
    }
}

impl EbayAdapter {
    fn offer_url(&self, suffix: &str) -> String {
        self.url(&format!("/sell/inventory/v1/offer{suffix}"))
    }

    pub(super) async fn create_offer(
        &self,
        request: &CreateOfferRequest,
        token: &str,
    ) -> Result<OfferCreation, MarketplaceError> {
        let response = self
            .http
            .post(self.offer_url(""))
            .bearer_auth(token)
            .header("Content-Language", "en-US")
            .json(request)
            .send()
            .await
            .map_err(|err| MarketplaceError::from_transport(&err))?;
        if response.status() == StatusCode::CONFLICT {
            return Ok(OfferCreation::AlreadyExists);
        }
        let response = ensure_success(response)
            .await
            .map_err(MarketplaceError::from_http)?;
        let payload: OfferResponse = response
            .json()
            .await
            .map_err(|err| MarketplaceError::InvalidResponse(err.to_string()))?;
        Ok(OfferCreation::Created(payload.offer_id))
    }

    pub(super) async fn publish_offer(
        &self,
        offer_id: &str,
        token: &str,
    ) -> Result<Option<String>, MarketplaceError> {
        let response = self
            .http
            .post(self.offer_url(&format!("/{offer_id}/publish")))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|err| MarketplaceError::from_transport(&err))?;
        let response = ensure_success(response)
            .await
            .map_err(MarketplaceError::from_http)?;
        let payload: PublishResponse = response
            .json()
            .await
            .map_err(|err| MarketplaceError::InvalidResponse(err.to_string()))?;
        Ok(payload.listing_id.filter(|id| !id.is_empty()))
    }

    pub(super) async fn offers_by_sku(
        &self,
        sku: &str,
        token: &str,
    ) -> Result<Vec<OfferSummary>, MarketplaceError> {
        let response = self
            .http
            .get(self.offer_url(""))
            .bearer_auth(token)
            .query(&[("sku", sku)])
            .send()
            .await
            .map_err(|err| MarketplaceError::from_transport(&err))?;
        let response = ensure_success(response)
            .await
            .map_err(MarketplaceError::from_http)?;
        let payload: OfferSearchResponse = response
            .json()
            .await
            .map_err(|err| MarketplaceError::InvalidResponse(err.to_string()))?;
        Ok(payload.offers.unwrap_or_default())
    }

    pub(super) async fn get_offer(
        &self,
        offer_id: &str,
        token: &str,
    ) -> Result<Value, MarketplaceError> {
        let response = self
            .http
            .get(self.offer_url(&format!("/{offer_id}")))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|err| MarketplaceError::from_transport(&err))?;
        let response = ensure_success(response)
            .await
            .map_err(MarketplaceError::from_http)?;
        response
            .json()
            .await
            .map_err(|err| MarketplaceError::InvalidResponse(err.to_string()))
    }

    pub(super) async fn put_offer(
        &self,
        offer_id: &str,
        body: &Value,
        token: &str,
    ) -> Result<(), MarketplaceError> {
        let response = self
            .http
            .put(self.offer_url(&format!("/{offer_id}")))
            .bearer_auth(token)
            .header("Content-Language", "en-US")
            .json(body)
            .send()
            .await
            .map_err(|err| MarketplaceError::from_transport(&err))?;
        ensure_success(response)
            .await
            .map_err(MarketplaceError::from_http)?;
        Ok(())
    }

    /// `false` when eBay no longer knows the offer.
    pub(super) async fn delete_offer(
        &self,
        offer_id: &str,
        token: &str,
    ) -> Result<bool, MarketplaceError> {
        let response = self
            .http
            .delete(self.offer_url(&format!("/{offer_id}")))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|err| MarketplaceError::from_transport(&err))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        ensure_success(response)
            .await
            .map_err(MarketplaceError::from_http)?;
        Ok(true)
    }
}
