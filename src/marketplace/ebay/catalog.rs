//! Read-only Browse and Taxonomy calls.

use super::EbayAdapter;
use crate::http::ensure_success;
use crate::marketplace::MarketplaceError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct SearchResponse {
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub item_summaries: Vec<ItemSummary>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ItemSummary {
    pub item_id: String,
    pub title: String,
    #[serde(default)]
    pub price: Option<ItemPrice>,
}

#[derive(Debug, Deserialize, Serialize)]
pub(super) struct ItemPrice {
    pub value: String,
    pub currency: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CategoryTree {
    root_category_node: CategoryNode,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CategoryNode {
    category: Category,
    #[serde(default)]
    child_category_tree_nodes: Vec<CategoryNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Category {
    category_name: String,
}

impl EbayAdapter {
    pub(super) async fn search_items(
        &self,
        query: &str,
        limit: u32,
        token: &str,
    ) -> Result<SearchResponse, MarketplaceError> {
        let response = self
            .http
            .get(self.url("/buy/browse/v1/item_summary/search"))
            .bearer_auth(token)
            .header("X-EBAY-C-MARKETPLACE-ID", &self.creds.marketplace_id)
            .query(&[("q", query.to_string()), ("limit", limit.to_string())])
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

    /// Names of the top-level categories in the configured tree.
    pub(super) async fn top_level_categories(
        &self,
        token: &str,
    ) -> Result<Vec<String>, MarketplaceError> {
        let url = self.url(&format!(
            "/commerce/taxonomy/v1/category_tree/{}",
            self.creds.category_tree_id
        ));
        let response = self
            .http
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|err| MarketplaceError::from_transport(&err))?;
        let response = ensure_success(response)
            .await
            .map_err(MarketplaceError::from_http)?;
        let tree: CategoryTree = response
            .json()
            .await
            .map_err(|err| MarketplaceError::InvalidResponse(err.to_string()))?;
        let root = tree.root_category_node;
        if root.child_category_tree_nodes.is_empty() {
            return Ok(vec![root.category.category_name]);
        }
        Ok(root
            .child_category_tree_nodes
            .into_iter()
            .map(|node| node.category.category_name)
            .collect())
    }
}
