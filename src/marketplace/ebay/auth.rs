use super::EbayAdapter;
use crate::marketplace::MarketplaceError;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use serde::Deserialize;

const APP_SCOPES: &[&str] = &["https://api.ebay.com/oauth/api_scope"];
const SELL_SCOPES: &[&str] = &["https://api.ebay.com/oauth/api_scope/sell.inventory"];

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

impl EbayAdapter {
    /// Client-credentials token for the public Browse and Taxonomy APIs.
    pub(super) async fn app_token(&self) -> Result<String, MarketplaceError> {
        let scope = APP_SCOPES.join(" ");
        self.request_token(&[("grant_type", "client_credentials"), ("scope", &scope)])
            .await
    }

    /// Seller token minted from the long-lived refresh token.
    pub(super) async fn user_token(&self) -> Result<String, MarketplaceError> {
        let Some(refresh_token) = self.creds.refresh_token.as_deref() else {
            return Err(MarketplaceError::NotConfigured("ebay".into()));
        };
        let scope = SELL_SCOPES.join(" ");
        self.request_token(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("scope", &scope),
        ])
        .await
    }

    async fn request_token(&self, params: &[(&str, &str)]) -> Result<String, MarketplaceError> {
        let (Some(app_id), Some(cert_id)) = (&self.creds.app_id, &self.creds.cert_id) else {
            return Err(MarketplaceError::NotConfigured("ebay".into()));
        };
        let credentials = BASE64.encode(format!("{app_id}:{cert_id}"));
        let response = self
            .http
            .post(self.url("/identity/v1/oauth2/token"))
            .header(reqwest::header::AUTHORIZATION, format!("Basic {credentials}"))
            .form(params)
            .send()
            .await
            .map_err(|err| MarketplaceError::from_transport(&err))?;

        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(MarketplaceError::from_http(crate::http::HttpFailure {
                status,
                body,
            }));
        }
        if !status.is_success() {
            // eBay answers a revoked refresh token with a plain 400.
            return Err(MarketplaceError::Unauthorized(format!(
                "oauth token request failed with HTTP {status}"
            )));
        }

        let payload: TokenResponse = response
            .json()
            .await
            .map_err(|err| MarketplaceError::InvalidResponse(err.to_string()))?;
        Ok(payload.access_token)
    }
}
