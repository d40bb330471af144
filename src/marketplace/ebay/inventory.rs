use super::EbayAdapter;
use crate::http::ensure_success;
use crate::marketplace::{ListingRequest, MarketplaceError};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use urlencoding::encode;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct InventoryItemRequest {
    pub availability: InventoryAvailability,
    pub condition: &'static str,
    pub product: InventoryProduct,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct InventoryAvailability {
    pub ship_to_location_availability: ShipToLocationAvailability,
}

#[derive(Debug, Clone, Serialize)]
pub(super) struct ShipToLocationAvailability {
    pub quantity: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct InventoryProduct {
    pub title: String,
    pub description: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub aspects: BTreeMap<String, Vec<String>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub image_urls: Vec<String>,
}

impl InventoryItemRequest {
    pub fn from_listing(request: &ListingRequest) -> Self {
        let mut aspects = BTreeMap::new();
        if !request.tags.is_empty() {
            aspects.insert("Theme".to_string(), request.tags.clone());
        }
        Self {
            availability: InventoryAvailability {
                ship_to_location_availability: ShipToLocationAvailability {
                    quantity: request.quantity,
                },
            },
            condition: "NEW",
            product: InventoryProduct {
                title: request.title.clone(),
                description: request.description.clone(),
                aspects,
                image_urls: request.images.clone(),
            },
        }
    }
}

impl EbayAdapter {
    fn inventory_url(&self, sku: &str) -> String {
        self.url(&format!("/sell/inventory/v1/inventory_item/{}", encode(sku)))
    }

    pub(super) async fn upsert_inventory_item(
        &self,
        sku: &str,
        payload: &InventoryItemRequest,
        token: &str,
    ) -> Result<(), MarketplaceError> {
        let response = self
            .http
            .put(self.inventory_url(sku))
            .bearer_auth(token)
            .header("Content-Language", "en-US")
            .json(payload)
            .send()
            .await
            .map_err(|err| MarketplaceError::from_transport(&err))?;
        ensure_success(response)
            .await
            .map_err(MarketplaceError::from_http)?;
        Ok(())
    }

    /// Rewrites the title on an existing inventory item; eBay keeps it there
    /// rather than on the offer.
    pub(super) async fn retitle_inventory_item(
        &self,
        sku: &str,
        title: &str,
        token: &str,
    ) -> Result<(), MarketplaceError> {
        let response = self
            .http
            .get(self.inventory_url(sku))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|err| MarketplaceError::from_transport(&err))?;
        let response = ensure_success(response)
            .await
            .map_err(MarketplaceError::from_http)?;
        let mut item: Value = response
            .json()
            .await
            .map_err(|err| MarketplaceError::InvalidResponse(err.to_string()))?;
        if let Some(product) = item.get_mut("product").and_then(Value::as_object_mut) {
            product.insert("title".into(), Value::String(title.to_string()));
        }
        if let Some(fields) = item.as_object_mut() {
            fields.remove("sku");
            fields.remove("locale");
        }

        let response = self
            .http
            .put(self.inventory_url(sku))
            .bearer_auth(token)
            .header("Content-Language", "en-US")
            .json(&item)
            .send()
            .await
            .map_err(|err| MarketplaceError::from_transport(&err))?;
        ensure_success(response)
            .await
            .map_err(MarketplaceError::from_http)?;
        Ok(())
    }
}
