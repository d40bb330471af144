use super::CompletionRequest;
use crate::models::{Product, TrendData};
use serde_json::json;

const PRODUCT_SYSTEM: &str = "You design digital products sold on handmade and \
resale marketplaces. Reply with a single JSON object and nothing else.";

const ANALYST_SYSTEM: &str = "You are a marketplace trend analyst. Reply with a \
single JSON object and nothing else.";

pub fn product(trend: &TrendData, custom_prompt: Option<&str>) -> CompletionRequest {
    let mut prompt = format!(
        "Create a digital product for the trending keyword \"{keyword}\".\n\
         Observed demand: search volume {volume}, competition {competition:?}, \
         average price {price:.2}.\n\
         Return JSON with keys: title (max 140 chars), description, tags (up to 13 \
         short tags), price (number), category, seoKeywords (array), imagePrompt, \
         content, specifications (object).",
        keyword = trend.keyword,
        volume = trend.search_volume,
        competition = trend.competition,
        price = trend.avg_price,
    );
    if let Some(extra) = custom_prompt.map(str::trim).filter(|p| !p.is_empty()) {
        prompt.push_str("\nAdditional direction: ");
        prompt.push_str(extra);
    }
    CompletionRequest {
        system: PRODUCT_SYSTEM.to_string(),
        prompt,
        expect_json: true,
    }
}

pub fn analysis(trends: &[TrendData]) -> CompletionRequest {
    let rows: Vec<_> = trends
        .iter()
        .map(|trend| {
            json!({
                "keyword": trend.keyword,
                "searchVolume": trend.search_volume,
                "competition": trend.competition,
                "avgPrice": trend.avg_price,
            })
        })
        .collect();
    CompletionRequest {
        system: ANALYST_SYSTEM.to_string(),
        prompt: format!(
            "Score each trend from 0 to 100 for how likely a new digital product \
             would sell. Return {{\"trends\": [{{\"keyword\", \"score\", \"insight\"}}]}} \
             covering every keyword below.\n{}",
            serde_json::Value::Array(rows)
        ),
        expect_json: true,
    }
}

pub fn listing(product: &Product, marketplace: &str) -> CompletionRequest {
    CompletionRequest {
        system: PRODUCT_SYSTEM.to_string(),
        prompt: format!(
            "Rewrite this product's listing copy for {marketplace}. Keep the facts.\n\
             Title: {}\nDescription: {}\nTags: {}\n\
             Return JSON with keys: title, description, tags.",
            product.title,
            product.description,
            product.tags.join(", "),
        ),
        expect_json: true,
    }
}
