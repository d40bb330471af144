use super::classify::ErrorKind;
use crate::config::RecoverySettings;
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::sleep;

/// Side effects the recovery strategies may need from the rest of the process.
#[async_trait]
pub trait RecoveryHooks: Send + Sync {
    async fn reconnect(&self) -> Result<(), String> {
        Ok(())
    }

    async fn health_check(&self) -> Result<(), String> {
        Ok(())
    }

    async fn reload_config(&self) -> Result<(), String> {
        Ok(())
    }

    /// Placeholder for provider-specific token refresh.
    async fn refresh_credentials(&self) -> Result<(), String> {
        Ok(())
    }
}

pub struct NoopHooks;

impl RecoveryHooks for NoopHooks {}

/// Runs the single registered strategy for `kind`.
pub(super) async fn primary(
    kind: ErrorKind,
    settings: &RecoverySettings,
    hooks: &dyn RecoveryHooks,
) -> Result<&'static str, String> {
    match kind {
        ErrorKind::DatabaseError => {
            pause(settings.db_reconnect_delay).await;
            hooks.reconnect().await?;
            hooks.health_check().await?;
            Ok("database_reconnect")
        }
        ErrorKind::ApiError => {
            pause(settings.api_retry_delay).await;
            Ok("api_retry_delay")
        }
        ErrorKind::ConfigError => {
            hooks.reload_config().await?;
            Ok("config_reload")
        }
        ErrorKind::AuthError => {
            hooks.refresh_credentials().await?;
            Ok("credential_refresh")
        }
        ErrorKind::RateLimitError => {
            pause(settings.rate_limit_backoff).await;
            Ok("rate_limit_backoff")
        }
        ErrorKind::TimeoutError => {
            pause(settings.timeout_retry_delay).await;
            Ok("timeout_delay")
        }
        ErrorKind::UnknownError => Err("no strategy registered for UNKNOWN_ERROR".into()),
    }
}

pub(super) async fn backoff_retry(
    kind: ErrorKind,
    occurrence: u64,
    settings: &RecoverySettings,
) -> Result<&'static str, String> {
    if !kind.is_transient() {
        return Err(format!("{kind} is not transient"));
    }
    pause(settings.backoff_step(occurrence)).await;
    Ok("exponential_backoff")
}

async fn pause(delay: Duration) {
    if !delay.is_zero() {
        sleep(delay).await;
    }
}
