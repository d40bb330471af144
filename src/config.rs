use std::{env, time::Duration};

/// Everything the process reads from the environment, resolved once at start-up.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub redis_url: Option<String>,
    pub run_queue_capacity: usize,
    pub ai_provider: String,
    pub ai: AiSettings,
    pub pipeline: PipelineSettings,
    pub recovery: RecoverySettings,
    pub etsy: EtsyCredentials,
    pub ebay: EbayCredentials,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            port: parse_env("PORT").unwrap_or(8000),
            redis_url: non_empty_env("REDIS_URL"),
            run_queue_capacity: parse_env::<usize>("RUN_QUEUE_CAPACITY")
                .filter(|v| *v > 0)
                .unwrap_or(16),
            ai_provider: non_empty_env("AI_PROVIDER").unwrap_or_else(|| "gemini".into()),
            ai: AiSettings::from_env(),
            pipeline: PipelineSettings::from_env(),
            recovery: RecoverySettings::from_env(),
            etsy: EtsyCredentials::from_env(),
            ebay: EbayCredentials::from_env(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub top_n: usize,
    pub product_delay: Duration,
    pub target_marketplaces: Vec<String>,
    pub scrape_sources: Vec<String>,
    pub scan_limit: u32,
    pub scan_category: Option<String>,
    pub analyze_min_points: usize,
    pub analyze_window: chrono::Duration,
    pub default_currency: String,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            top_n: 5,
            product_delay: Duration::from_secs(2),
            target_marketplaces: vec!["etsy".into(), "ebay".into()],
            scrape_sources: vec!["etsy".into(), "ebay".into()],
            scan_limit: 50,
            scan_category: None,
            analyze_min_points: 10,
            analyze_window: chrono::Duration::hours(72),
            default_currency: "USD".into(),
        }
    }
}

impl PipelineSettings {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            top_n: parse_env::<usize>("PIPELINE_TOP_N")
                .filter(|v| *v > 0)
                .unwrap_or(defaults.top_n),
            product_delay: parse_env::<u64>("PIPELINE_PRODUCT_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.product_delay),
            target_marketplaces: list_env("PIPELINE_TARGET_MARKETPLACES")
                .unwrap_or(defaults.target_marketplaces),
            scrape_sources: list_env("PIPELINE_SCRAPE_SOURCES").unwrap_or(defaults.scrape_sources),
            scan_limit: parse_env::<u32>("PIPELINE_SCAN_LIMIT")
                .filter(|v| *v > 0)
                .unwrap_or(defaults.scan_limit),
            scan_category: non_empty_env("PIPELINE_SCAN_CATEGORY"),
            analyze_min_points: parse_env("ANALYZE_MIN_POINTS")
                .unwrap_or(defaults.analyze_min_points),
            analyze_window: parse_env::<i64>("ANALYZE_WINDOW_HOURS")
                .filter(|v| *v > 0)
                .map(chrono::Duration::hours)
                .unwrap_or(defaults.analyze_window),
            default_currency: non_empty_env("DEFAULT_CURRENCY")
                .unwrap_or(defaults.default_currency),
        }
    }
}

/// Tuning values for the recovery engine. None of these are derived from an
/// SLA; they are knobs.
#[derive(Debug, Clone)]
pub struct RecoverySettings {
    pub max_attempts: u32,
    pub escalation_threshold: u64,
    pub backoff_ladder: Vec<Duration>,
    pub db_reconnect_delay: Duration,
    pub rate_limit_backoff: Duration,
    pub api_retry_delay: Duration,
    pub timeout_retry_delay: Duration,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            escalation_threshold: 3,
            backoff_ladder: [1000, 2000, 4000, 8000]
                .into_iter()
                .map(Duration::from_millis)
                .collect(),
            db_reconnect_delay: Duration::from_secs(1),
            rate_limit_backoff: Duration::from_secs(5),
            api_retry_delay: Duration::from_secs(1),
            timeout_retry_delay: Duration::from_secs(2),
        }
    }
}

impl RecoverySettings {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let ladder = env::var("RECOVERY_BACKOFF_LADDER_MS")
            .ok()
            .map(|raw| {
                raw.split(',')
                    .filter_map(|step| step.trim().parse::<u64>().ok())
                    .map(Duration::from_millis)
                    .collect::<Vec<_>>()
            })
            .filter(|steps| !steps.is_empty())
            .unwrap_or(defaults.backoff_ladder);
        Self {
            max_attempts: parse_env::<u32>("RECOVERY_MAX_ATTEMPTS")
                .filter(|v| *v > 0)
                .unwrap_or(defaults.max_attempts),
            escalation_threshold: parse_env::<u64>("RECOVERY_ESCALATION_THRESHOLD")
                .filter(|v| *v > 0)
                .unwrap_or(defaults.escalation_threshold),
            backoff_ladder: ladder,
            db_reconnect_delay: millis_env("RECOVERY_DB_RECONNECT_MS")
                .unwrap_or(defaults.db_reconnect_delay),
            rate_limit_backoff: millis_env("RECOVERY_RATE_LIMIT_MS")
                .unwrap_or(defaults.rate_limit_backoff),
            api_retry_delay: millis_env("RECOVERY_API_DELAY_MS").unwrap_or(defaults.api_retry_delay),
            timeout_retry_delay: millis_env("RECOVERY_TIMEOUT_DELAY_MS")
                .unwrap_or(defaults.timeout_retry_delay),
        }
    }

    /// Same policy with every delay set to zero.
    #[cfg(test)]
    pub fn immediate() -> Self {
        Self {
            backoff_ladder: vec![Duration::ZERO; 4],
            db_reconnect_delay: Duration::ZERO,
            rate_limit_backoff: Duration::ZERO,
            api_retry_delay: Duration::ZERO,
            timeout_retry_delay: Duration::ZERO,
            ..Self::default()
        }
    }

    pub fn backoff_step(&self, occurrence: u64) -> Duration {
        let idx = occurrence.saturating_sub(1) as usize;
        self.backoff_ladder
            .get(idx)
            .or_else(|| self.backoff_ladder.last())
            .copied()
            .unwrap_or(Duration::ZERO)
    }
}

#[derive(Debug, Clone, Default)]
pub struct AiSettings {
    pub gemini_api_key: Option<String>,
    pub gemini_model: String,
    pub gemini_base_url: String,
    pub openai_api_key: Option<String>,
    pub openai_model: String,
    pub openai_base_url: String,
    pub tensorzero_gateway_url: String,
    pub tensorzero_api_key: Option<String>,
    pub tensorzero_function: Option<String>,
}

impl AiSettings {
    pub fn from_env() -> Self {
        Self {
            gemini_api_key: non_empty_env("GEMINI_API_KEY"),
            gemini_model: non_empty_env("GEMINI_MODEL").unwrap_or_else(|| "gemini-1.5-flash".into()),
            gemini_base_url: non_empty_env("GEMINI_BASE_URL")
                .unwrap_or_else(|| "https://generativelanguage.googleapis.com".into()),
            openai_api_key: non_empty_env("OPENAI_API_KEY"),
            openai_model: non_empty_env("OPENAI_MODEL").unwrap_or_else(|| "gpt-4o-mini".into()),
            openai_base_url: non_empty_env("OPENAI_BASE_URL")
                .unwrap_or_else(|| "https://api.openai.com/v1".into()),
            tensorzero_gateway_url: non_empty_env("TENSORZERO_GATEWAY_URL")
                .unwrap_or_else(|| "http://localhost:3000".into()),
            tensorzero_api_key: non_empty_env("TENSORZERO_API_KEY"),
            tensorzero_function: non_empty_env("TENSORZERO_FUNCTION"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EtsyCredentials {
    pub api_key: Option<String>,
    pub access_token: Option<String>,
    pub shop_id: Option<String>,
    pub api_root: String,
}

impl EtsyCredentials {
    pub fn from_env() -> Self {
        Self {
            api_key: non_empty_env("ETSY_API_KEY"),
            access_token: non_empty_env("ETSY_ACCESS_TOKEN"),
            shop_id: non_empty_env("ETSY_SHOP_ID"),
            api_root: non_empty_env("ETSY_API_ROOT")
                .unwrap_or_else(|| "https://openapi.etsy.com".into()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EbayCredentials {
    pub app_id: Option<String>,
    pub cert_id: Option<String>,
    pub refresh_token: Option<String>,
    pub api_root: String,
    pub marketplace_id: String,
    pub category_tree_id: String,
    pub default_category_id: String,
    pub merchant_location_key: Option<String>,
    pub fulfillment_policy_id: Option<String>,
    pub payment_policy_id: Option<String>,
    pub return_policy_id: Option<String>,
}

impl EbayCredentials {
    pub fn from_env() -> Self {
        let production = env::var("EBAY_ENV")
            .map(|value| value.eq_ignore_ascii_case("PROD"))
            .unwrap_or(false);
        let api_root = non_empty_env("EBAY_API_ROOT").unwrap_or_else(|| {
            if production {
                "https://api.ebay.com".into()
            } else {
                "https://api.sandbox.ebay.com".into()
            }
        });
        Self {
            app_id: non_empty_env("EBAY_APP_ID"),
            cert_id: non_empty_env("EBAY_CERT_ID"),
            refresh_token: non_empty_env("EBAY_REFRESH_TOKEN"),
            api_root,
            marketplace_id: non_empty_env("EBAY_MARKETPLACE_ID").unwrap_or_else(|| "EBAY_US".into()),
            category_tree_id: non_empty_env("EBAY_CATEGORY_TREE_ID").unwrap_or_else(|| "0".into()),
            default_category_id: non_empty_env("EBAY_DEFAULT_CATEGORY_ID")
                .unwrap_or_else(|| "99".into()),
            merchant_location_key: non_empty_env("EBAY_MERCHANT_LOCATION_KEY"),
            fulfillment_policy_id: non_empty_env("EBAY_FULFILLMENT_POLICY_ID"),
            payment_policy_id: non_empty_env("EBAY_PAYMENT_POLICY_ID"),
            return_policy_id: non_empty_env("EBAY_RETURN_POLICY_ID"),
        }
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|value| value.trim().parse::<T>().ok())
}

fn millis_env(key: &str) -> Option<Duration> {
    parse_env::<u64>(key).map(Duration::from_millis)
}

fn list_env(key: &str) -> Option<Vec<String>> {
    non_empty_env(key)
        .map(|raw| {
            raw.split([',', ' '])
                .map(|entry| entry.trim().to_lowercase())
                .filter(|entry| !entry.is_empty())
                .collect::<Vec<_>>()
        })
        .filter(|entries| !entries.is_empty())
}
