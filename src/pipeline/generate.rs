use super::{Pipeline, PipelineError, StageOutcome};
use crate::ai::GeneratedProduct;
use crate::ledger::JobStage;
use crate::models::{
    GenerationMeta, PricingMeta, Product, ProductMetadata, ProductStatus, TrendData,
};
use chrono::Utc;
use serde_json::{Value, json};
use tracing::info;
use uuid::Uuid;

const STAGE: &str = "generate";
const MAX_TAGS: usize = 13;
const DEFAULT_CATEGORY: &str = "Digital Downloads";

pub(super) struct Generated {
    pub job_id: Uuid,
    pub product: Product,
}

impl Pipeline {
    /// Asks the AI provider for a product built around `keyword` and stores
    /// it as a draft.
    pub async fn generate(
        &self,
        keyword: &str,
        custom_prompt: Option<&str>,
    ) -> Result<Product, PipelineError> {
        self.generate_for(keyword, custom_prompt, None)
            .await
            .map(|generated| generated.product)
    }

    pub(super) async fn generate_for(
        &self,
        keyword: &str,
        custom_prompt: Option<&str>,
        parent_job_id: Option<Uuid>,
    ) -> Result<Generated, PipelineError> {
        let metadata = json!({ "keyword": keyword, "customPrompt": custom_prompt });
        self.tracked(JobStage::Generate, keyword, metadata, parent_job_id, |job| async move {
            let trend = self
                .store
                .get_trend(keyword)
                .await
                .map_err(|err| PipelineError::from_store(STAGE, err))?
                .ok_or_else(|| {
                    PipelineError::validation(STAGE, format!("unknown trend '{keyword}'"), Vec::new())
                })?;

            let ai = self.ai.as_ref();
            let trend_ref = &trend;
            let outcome = self
                .recovery
                .run(STAGE, move || ai.generate_product(trend_ref, custom_prompt))
                .await;
            self.record_attempts(job.id, outcome.attempts).await;
            let Some(generated) = outcome.value else {
                return Err(outcome
                    .last_error
                    .as_ref()
                    .map(|err| PipelineError::from_ai(STAGE, err))
                    .unwrap_or_else(|| PipelineError::external(STAGE, "generation produced no result")));
            };

            let product = build_product(
                &trend,
                generated,
                custom_prompt,
                self.ai.name(),
                &self.settings.default_currency,
            )?;
            let product = self
                .store
                .insert_product(product)
                .await
                .map_err(|err| PipelineError::from_store(STAGE, err))?;

            info!(
                target = "trendforge.pipeline",
                keyword = %trend.keyword,
                product_id = %product.id,
                price = product.price,
                "product_generated"
            );
            let output = json!({
                "productId": product.id,
                "title": product.title,
                "price": product.price,
                "priceDefaulted": product.metadata.pricing.defaulted,
            });
            Ok(StageOutcome::new(
                Generated {
                    job_id: job.id,
                    product,
                },
                output,
            ))
        })
        .await
    }
}

/// Checks provider output against what a product needs and fills the gaps
/// the provider is allowed to leave.
fn build_product(
    trend: &TrendData,
    generated: GeneratedProduct,
    custom_prompt: Option<&str>,
    provider: &str,
    currency: &str,
) -> Result<Product, PipelineError> {
    let title = generated.title.trim().to_string();
    if title.is_empty() {
        return Err(PipelineError::generation(STAGE, "provider returned a product without a title"));
    }

    let (price, defaulted) = match generated.price {
        Some(price) if price.is_finite() && price > 0.0 => (price, false),
        Some(price) => {
            return Err(PipelineError::generation(
                STAGE,
                format!("provider suggested an invalid price {price}"),
            ));
        }
        None if trend.avg_price > 0.0 => (trend.avg_price, true),
        None => {
            return Err(PipelineError::generation(
                STAGE,
                "provider omitted a price and the trend has no observed average",
            ));
        }
    };

    let mut tags: Vec<String> = Vec::new();
    for tag in generated.tags {
        let tag = tag.trim().to_string();
        if !tag.is_empty() && !tags.iter().any(|seen| seen.eq_ignore_ascii_case(&tag)) {
            tags.push(tag);
        }
    }
    tags.truncate(MAX_TAGS);

    let category = match generated.category.trim() {
        "" => DEFAULT_CATEGORY.to_string(),
        other => other.to_string(),
    };
    let description = match generated.description.trim() {
        "" => title.clone(),
        other => other.to_string(),
    };
    let specifications = match generated.specifications {
        Value::Null => json!({}),
        other => other,
    };

    let now = Utc::now();
    Ok(Product {
        id: Uuid::new_v4(),
        title,
        description,
        tags,
        price,
        currency: currency.to_string(),
        category,
        status: ProductStatus::Draft,
        source_keyword: trend.keyword.clone(),
        seo_keywords: generated.seo_keywords,
        image_prompt: generated.image_prompt,
        content: generated.content,
        specifications,
        metadata: ProductMetadata {
            generation: GenerationMeta {
                provider: provider.to_string(),
                prompt_trend: trend.keyword.clone(),
                custom_prompt: custom_prompt.map(str::to_string),
            },
            pricing: PricingMeta {
                suggested: price,
                trend_average: trend.avg_price,
                defaulted,
            },
            marketplaces: Default::default(),
        },
        created_at: now,
        updated_at: now,
    })
}

#[cfg(test)]
mod tests {
    use crate::ai::{AiError, GeneratedProduct};
    use crate::ledger::{JobStage, JobStatus};
    use crate::models::{Competition, ProductStatus};
    use crate::pipeline::PipelineErrorKind;
    use crate::testing::{FakeAi, PipelineBuilder, seed_trend};

    fn candle() -> GeneratedProduct {
        GeneratedProduct {
            title: "Handmade Aura Candle".into(),
            price: Some(24.5),
            tags: vec!["candle".into(), "handmade".into()],
            ..GeneratedProduct::default()
        }
    }

    #[tokio::test]
    async fn generated_product_is_stored_as_draft_with_provenance() {
        let ai = FakeAi::new().with_product("Aura Candle", Ok(candle()));
        let pipeline = PipelineBuilder::new().ai(ai).build();
        seed_trend(&pipeline, "Aura Candle", 300, Competition::Medium, 21.0).await;

        let product = pipeline.generate("Aura Candle", None).await.unwrap();
        assert_eq!(product.status, ProductStatus::Draft);
        assert_eq!(product.price, 24.5);
        assert_eq!(product.tags, vec!["candle", "handmade"]);
        assert_eq!(product.metadata.generation.prompt_trend, "Aura Candle");
        assert_eq!(product.metadata.pricing.suggested, 24.5);
        assert!(!product.metadata.pricing.defaulted);

        let stored = pipeline.store().get_product(product.id).await.unwrap();
        assert_eq!(stored.as_ref().map(|p| p.id), Some(product.id));
        let jobs = pipeline.ledger().list_by_stage(JobStage::Generate).await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, JobStatus::Success);
    }

    #[tokio::test]
    async fn missing_price_falls_back_to_trend_average() {
        let mut product = candle();
        product.price = None;
        let ai = FakeAi::new().with_product("Aura Candle", Ok(product));
        let pipeline = PipelineBuilder::new().ai(ai).build();
        seed_trend(&pipeline, "Aura Candle", 300, Competition::Medium, 21.0).await;

        let product = pipeline.generate("aura candle", None).await.unwrap();
        assert_eq!(product.price, 21.0);
        assert!(product.metadata.pricing.defaulted);
    }

    #[tokio::test]
    async fn malformed_output_fails_the_job_as_generation_error() {
        let ai = FakeAi::new().with_product(
            "Aura Candle",
            Err(AiError::Malformed("expected JSON, got: Sure!".into())),
        );
        let pipeline = PipelineBuilder::new().ai(ai.clone()).build();
        seed_trend(&pipeline, "Aura Candle", 300, Competition::Medium, 21.0).await;

        let err = pipeline.generate("Aura Candle", None).await.unwrap_err();
        assert_eq!(err.kind(), PipelineErrorKind::Generation);
        assert_eq!(ai.product_calls(), 1, "malformed output is not retried");
        let jobs = pipeline.ledger().list_by_status(JobStatus::Failed).await;
        assert_eq!(jobs.len(), 1);
        assert!(jobs[0].error.as_deref().unwrap_or("").contains("malformed"));
        assert!(pipeline.store().list_products().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn untitled_product_is_rejected() {
        let ai = FakeAi::new().with_product(
            "Aura Candle",
            Ok(GeneratedProduct {
                price: Some(10.0),
                ..GeneratedProduct::default()
            }),
        );
        let pipeline = PipelineBuilder::new().ai(ai).build();
        seed_trend(&pipeline, "Aura Candle", 300, Competition::Medium, 21.0).await;

        let err = pipeline.generate("Aura Candle", None).await.unwrap_err();
        assert_eq!(err.kind(), PipelineErrorKind::Generation);
    }

    #[tokio::test]
    async fn unknown_trend_is_a_validation_error() {
        let pipeline = PipelineBuilder::new().build();
        let err = pipeline.generate("ghost", None).await.unwrap_err();
        assert_eq!(err.kind(), PipelineErrorKind::Validation);
    }
}
