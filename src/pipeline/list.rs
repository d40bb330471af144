use super::{Pipeline, PipelineError, StageOutcome};
use crate::ledger::JobStage;
use crate::marketplace::{ListingPatch, ListingRequest};
use crate::models::{Listing, ListingStatus};
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

const STAGE: &str = "list";
const PRICE_EPSILON: f64 = 0.005;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListOutcome {
    pub job_id: Uuid,
    pub listing: Option<Listing>,
    /// The pair already had a live listing; nothing new was published.
    pub skipped: bool,
}

impl Pipeline {
    /// Publishes a stored product on one marketplace.
    ///
    /// A pair that already has a live listing is never published twice. The
    /// existing listing is returned (its price refreshed if the product's
    /// price moved) and the job is recorded as skipped.
    pub async fn list(&self, product_id: Uuid, marketplace: &str) -> Result<ListOutcome, PipelineError> {
        self.list_for(product_id, marketplace, None).await
    }

    pub(super) async fn list_for(
        &self,
        product_id: Uuid,
        marketplace: &str,
        parent_job_id: Option<Uuid>,
    ) -> Result<ListOutcome, PipelineError> {
        let unit = format!("{product_id}:{}", marketplace.trim().to_lowercase());
        let metadata = json!({ "productId": product_id, "marketplace": marketplace });

        self.tracked(JobStage::List, &unit, metadata, parent_job_id, |job| async move {
            let mut product = self
                .store
                .get_product(product_id)
                .await
                .map_err(|err| PipelineError::from_store(STAGE, err))?
                .ok_or_else(|| {
                    PipelineError::validation(STAGE, format!("unknown product {product_id}"), Vec::new())
                })?;
            let adapter = self.marketplaces.get(marketplace).ok_or_else(|| {
                PipelineError::validation(STAGE, format!("unknown marketplace '{marketplace}'"), Vec::new())
            })?;
            let name = adapter.name().to_string();
            if !adapter.is_available() {
                return Err(PipelineError::configuration(
                    STAGE,
                    format!("{name} marketplace is not configured"),
                ));
            }
            let context = format!("list:{name}");

            if let Some(existing) = self
                .store
                .successful_listing(product.id, &name)
                .await
                .map_err(|err| PipelineError::from_store(STAGE, err))?
            {
                let mut existing = existing;
                let mut price_updated = false;
                if let Some(remote_id) = existing.remote_id.as_deref()
                    && (existing.price - product.price).abs() > PRICE_EPSILON
                {
                    let patch = ListingPatch {
                        price: Some(product.price),
                        ..ListingPatch::default()
                    };
                    let adapter_ref = adapter.as_ref();
                    let patch_ref = &patch;
                    let outcome = self
                        .recovery
                        .run(&context, move || adapter_ref.update_product(remote_id, patch_ref))
                        .await;
                    self.record_attempts(job.id, outcome.attempts).await;
                    match outcome.value {
                        Some(update) if update.success => {
                            existing = self
                                .store
                                .update_listing_price(existing.id, product.price)
                                .await
                                .map_err(|err| PipelineError::from_store(STAGE, err))?;
                            if let Some(meta) = product.metadata.marketplaces.get_mut(&name) {
                                meta.price = product.price;
                            }
                            product = self
                                .store
                                .update_product(product)
                                .await
                                .map_err(|err| PipelineError::from_store(STAGE, err))?;
                            price_updated = true;
                        }
                        Some(update) => {
                            return Err(PipelineError::external(
                                STAGE,
                                update
                                    .error
                                    .unwrap_or_else(|| "price update was rejected".into()),
                            ));
                        }
                        None => {
                            return Err(outcome
                                .last_error
                                .as_ref()
                                .map(|err| PipelineError::from_marketplace(STAGE, err))
                                .unwrap_or_else(|| PipelineError::external(STAGE, "price update produced no result")));
                        }
                    }
                }
                info!(
                    target = "trendforge.pipeline",
                    product_id = %product.id,
                    marketplace = %name,
                    price_updated,
                    "listing_already_live"
                );
                let output = json!({
                    "skipped": true,
                    "listingId": existing.id,
                    "remoteId": existing.remote_id,
                    "priceUpdated": price_updated,
                });
                return Ok(StageOutcome::new(
                    ListOutcome {
                        job_id: job.id,
                        listing: Some(existing),
                        skipped: true,
                    },
                    output,
                ));
            }

            let request = ListingRequest::from_product(&product);
            let validation = adapter.validate_listing(&request);
            if !validation.valid {
                return Err(PipelineError::validation(
                    STAGE,
                    format!("listing for {name} failed validation"),
                    validation.errors,
                ));
            }

            let adapter_ref = adapter.as_ref();
            let request_ref = &request;
            let outcome = self
                .recovery
                .run(&context, move || adapter_ref.list_product(request_ref))
                .await;
            self.record_attempts(job.id, outcome.attempts).await;
            let Some(published) = outcome.value else {
                return Err(outcome
                    .last_error
                    .as_ref()
                    .map(|err| PipelineError::from_marketplace(STAGE, err))
                    .unwrap_or_else(|| PipelineError::external(STAGE, "listing produced no result")));
            };

            let remote_id = published
                .listing_id
                .clone()
                .filter(|id| published.success && !id.trim().is_empty());
            let Some(remote_id) = remote_id else {
                let reason = published
                    .error
                    .clone()
                    .unwrap_or_else(|| format!("{name} accepted the listing without an id"));
                let failed = Listing {
                    id: Uuid::new_v4(),
                    product_id: product.id,
                    marketplace: name.clone(),
                    remote_id: None,
                    external_id: None,
                    status: ListingStatus::Failed,
                    price: product.price,
                    currency: product.currency.clone(),
                    job_id: job.id,
                    error: Some(reason.clone()),
                    created_at: Utc::now(),
                };
                if let Err(err) = self.store.insert_listing(failed).await {
                    warn!(target = "trendforge.pipeline", product_id = %product.id, error = %err, "failed_listing_not_stored");
                }
                return Err(PipelineError::external(
                    STAGE,
                    format!("{name} rejected the listing: {reason}"),
                ));
            };

            let listing = Listing {
                id: Uuid::new_v4(),
                product_id: product.id,
                marketplace: name.clone(),
                remote_id: Some(remote_id.clone()),
                external_id: published.external_id.clone(),
                status: ListingStatus::Success,
                price: product.price,
                currency: product.currency.clone(),
                job_id: job.id,
                error: None,
                created_at: Utc::now(),
            };
            let listing = self
                .store
                .insert_listing(listing)
                .await
                .map_err(|err| PipelineError::from_store(STAGE, err))?;
            product
                .mark_published(&listing)
                .map_err(|reason| PipelineError::internal(STAGE, reason))?;
            self.store
                .update_product(product)
                .await
                .map_err(|err| PipelineError::from_store(STAGE, err))?;

            info!(
                target = "trendforge.pipeline",
                product_id = %listing.product_id,
                marketplace = %name,
                remote_id = %remote_id,
                "product_listed"
            );
            let output = json!({
                "skipped": false,
                "listingId": listing.id,
                "remoteId": remote_id,
                "externalId": listing.external_id,
            });
            Ok(StageOutcome::new(
                ListOutcome {
                    job_id: job.id,
                    listing: Some(listing),
                    skipped: false,
                },
                output,
            ))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use crate::ledger::{JobStage, JobStatus};
    use crate::marketplace::ListingOutcome;
    use crate::models::{ListingStatus, ProductStatus};
    use crate::pipeline::PipelineErrorKind;
    use crate::recovery::ErrorKind;
    use crate::testing::{FakeMarketplace, PipelineBuilder, seed_product};
    use serde_json::json;
    use std::sync::Arc;
    use tokio::sync::Notify;

    fn etsy_accepting() -> FakeMarketplace {
        FakeMarketplace::new("etsy").with_listing(Ok(ListingOutcome::published(
            "etsy_123".into(),
            None,
            json!({ "listing_id": "etsy_123" }),
        )))
    }

    #[tokio::test]
    async fn successful_listing_publishes_the_product() {
        let pipeline = PipelineBuilder::new().marketplace(etsy_accepting()).build();
        let product = seed_product(&pipeline, 24.5).await;

        let outcome = pipeline.list(product.id, "etsy").await.unwrap();
        assert!(!outcome.skipped);
        let listing = outcome.listing.unwrap();
        assert_eq!(listing.remote_id.as_deref(), Some("etsy_123"));
        assert_eq!(listing.status, ListingStatus::Success);

        let stored = pipeline.store().get_product(product.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ProductStatus::Published);
        assert_eq!(stored.metadata.marketplaces["etsy"].listing_id, "etsy_123");

        let jobs = pipeline.ledger().list_by_stage(JobStage::List).await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, JobStatus::Success);
        assert_eq!(jobs[0].id, outcome.job_id);
    }

    #[tokio::test]
    async fn timeout_exhaustion_fails_the_job_without_a_listing() {
        let etsy = FakeMarketplace::new("etsy").timing_out();
        let pipeline = PipelineBuilder::new().marketplace(etsy.clone()).build();
        let product = seed_product(&pipeline, 24.5).await;

        let err = pipeline.list(product.id, "etsy").await.unwrap_err();
        assert_eq!(err.kind(), PipelineErrorKind::ExternalService);
        assert_eq!(etsy.list_calls(), 3);
        assert_eq!(
            pipeline
                .recovery()
                .error_count("list:etsy", ErrorKind::TimeoutError)
                .await,
            3
        );

        let jobs = pipeline.ledger().list_by_stage(JobStage::List).await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, JobStatus::Failed);
        assert_eq!(jobs[0].attempts, 3);
        assert!(pipeline.store().listings_for(product.id).await.unwrap().is_empty());
        let stored = pipeline.store().get_product(product.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ProductStatus::Draft);
    }

    #[tokio::test]
    async fn relisting_a_live_pair_is_a_recorded_no_op() {
        let etsy = etsy_accepting();
        let pipeline = PipelineBuilder::new().marketplace(etsy.clone()).build();
        let product = seed_product(&pipeline, 24.5).await;

        pipeline.list(product.id, "etsy").await.unwrap();
        let again = pipeline.list(product.id, "etsy").await.unwrap();
        assert!(again.skipped);
        assert_eq!(etsy.list_calls(), 1);
        assert_eq!(etsy.update_calls(), 0);
        assert_eq!(pipeline.store().listings_for(product.id).await.unwrap().len(), 1);

        let jobs = pipeline.ledger().list_by_stage(JobStage::List).await;
        assert_eq!(jobs.len(), 2);
        assert!(jobs.iter().all(|job| job.status == JobStatus::Success));
        assert_eq!(jobs[1].result.as_ref().unwrap()["skipped"], json!(true));
    }

    #[tokio::test]
    async fn relisting_after_a_price_change_updates_the_remote_price() {
        let etsy = etsy_accepting();
        let pipeline = PipelineBuilder::new().marketplace(etsy.clone()).build();
        let product = seed_product(&pipeline, 24.5).await;
        pipeline.list(product.id, "etsy").await.unwrap();

        let mut repriced = pipeline.store().get_product(product.id).await.unwrap().unwrap();
        repriced.price = 19.0;
        pipeline.store().update_product(repriced).await.unwrap();

        let again = pipeline.list(product.id, "etsy").await.unwrap();
        assert!(again.skipped);
        assert_eq!(again.listing.unwrap().price, 19.0);
        assert_eq!(etsy.update_calls(), 1);

        let settled = pipeline.list(product.id, "etsy").await.unwrap();
        assert!(settled.skipped);
        assert_eq!(etsy.update_calls(), 1);
        assert_eq!(etsy.list_calls(), 1);

        let listings = pipeline.store().listings_for(product.id).await.unwrap();
        assert_eq!(listings.len(), 1);
        assert_eq!(listings[0].price, 19.0);
        let stored = pipeline.store().get_product(product.id).await.unwrap().unwrap();
        assert_eq!(stored.metadata.marketplaces["etsy"].price, 19.0);
    }

    #[tokio::test]
    async fn overlapping_list_calls_publish_once() {
        let gate = Arc::new(Notify::new());
        let etsy = etsy_accepting().gated(gate.clone());
        let pipeline = PipelineBuilder::new().marketplace(etsy.clone()).build();
        let product = seed_product(&pipeline, 24.5).await;

        let release = async {
            while etsy.list_calls() == 0 {
                tokio::task::yield_now().await;
            }
            gate.notify_one();
        };
        let (first, second, ()) = tokio::join!(
            pipeline.list(product.id, "etsy"),
            pipeline.list(product.id, "etsy"),
            release
        );

        let results = [first, second];
        let duplicates = results
            .iter()
            .filter(|result| {
                matches!(result, Err(err) if err.kind() == PipelineErrorKind::DuplicateJob)
            })
            .count();
        assert_eq!(duplicates, 1);
        assert_eq!(results.iter().filter(|result| result.is_ok()).count(), 1);
        assert_eq!(etsy.list_calls(), 1);
        assert_eq!(pipeline.store().listings_for(product.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn remote_rejection_keeps_a_failed_listing_row() {
        let etsy = FakeMarketplace::new("etsy")
            .with_listing(Ok(ListingOutcome::rejected("title contains banned word")));
        let pipeline = PipelineBuilder::new().marketplace(etsy).build();
        let product = seed_product(&pipeline, 24.5).await;

        let err = pipeline.list(product.id, "etsy").await.unwrap_err();
        assert_eq!(err.kind(), PipelineErrorKind::ExternalService);
        let listings = pipeline.store().listings_for(product.id).await.unwrap();
        assert_eq!(listings.len(), 1);
        assert_eq!(listings[0].status, ListingStatus::Failed);
        assert_eq!(listings[0].error.as_deref(), Some("title contains banned word"));
    }

    #[tokio::test]
    async fn local_validation_failure_never_reaches_the_marketplace() {
        let etsy = etsy_accepting();
        let pipeline = PipelineBuilder::new().marketplace(etsy.clone()).build();
        let product = seed_product(&pipeline, 0.0).await;

        let err = pipeline.list(product.id, "etsy").await.unwrap_err();
        assert_eq!(err.kind(), PipelineErrorKind::Validation);
        assert!(!err.details().is_empty());
        assert_eq!(etsy.list_calls(), 0);
        assert!(pipeline.store().listings_for(product.id).await.unwrap().is_empty());
        let failed = pipeline.ledger().list_by_status(JobStatus::Failed).await;
        assert_eq!(failed.len(), 1);
    }

    #[tokio::test]
    async fn unconfigured_marketplace_is_a_configuration_error() {
        let pipeline = PipelineBuilder::new()
            .marketplace(FakeMarketplace::new("etsy").unavailable())
            .build();
        let product = seed_product(&pipeline, 24.5).await;
        let err = pipeline.list(product.id, "etsy").await.unwrap_err();
        assert_eq!(err.kind(), PipelineErrorKind::Configuration);
    }
}
