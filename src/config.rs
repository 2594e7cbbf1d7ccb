use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::Path;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError};

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";
const DEFAULT_FLAT_SHIPPING_FEE: i64 = 50_000;
const DEFAULT_FREE_SHIPPING_THRESHOLD: i64 = 1_000_000;
const DEFAULT_ORDER_NUMBER_ATTEMPTS: u32 = 5;
const DEFAULT_GATEWAY_MIN_AMOUNT: i64 = 5_000;

/// Pricing and order-numbering knobs used at checkout
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct CheckoutConfig {
    /// Flat shipping fee charged below the free-shipping threshold
    #[serde(default = "default_flat_shipping_fee")]
    #[validate(range(min = 0))]
    pub flat_shipping_fee: i64,

    /// Orders whose subtotal is strictly greater than this ship for free
    #[serde(default = "default_free_shipping_threshold")]
    #[validate(range(min = 0))]
    pub free_shipping_threshold: i64,

    /// How many order numbers to try before giving up on a collision streak
    #[serde(default = "default_order_number_attempts")]
    #[validate(range(min = 1, max = 20))]
    pub order_number_attempts: u32,
}

impl Default for CheckoutConfig {
    fn default() -> Self {
        Self {
            flat_shipping_fee: default_flat_shipping_fee(),
            free_shipping_threshold: default_free_shipping_threshold(),
            order_number_attempts: default_order_number_attempts(),
        }
    }
}

/// Redirect payment gateway settings.
///
/// Credentials are optional at load time: a deployment without them still boots, and every
/// payment request fails with a configuration error until they are provided.
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct PaymentGatewayConfig {
    /// Gateway payment page the customer is redirected to
    #[serde(default = "default_gateway_payment_url")]
    #[validate(url)]
    pub payment_url: String,

    /// Merchant (terminal) code issued by the gateway
    #[serde(default)]
    pub merchant_code: Option<String>,

    /// Shared HMAC secret issued by the gateway
    #[serde(default)]
    pub hash_secret: Option<String>,

    /// Where the gateway sends the customer (and the signed result) back to
    #[serde(default)]
    pub return_url: Option<String>,

    #[serde(default = "default_gateway_version")]
    pub version: String,

    #[serde(default = "default_gateway_command")]
    pub command: String,

    #[serde(default = "default_gateway_currency")]
    pub currency: String,

    #[serde(default = "default_gateway_locale")]
    pub locale: String,

    #[serde(default = "default_gateway_order_type")]
    pub order_type: String,

    /// Smallest order total (store currency) the gateway accepts
    #[serde(default = "default_gateway_min_amount")]
    #[validate(range(min = 1))]
    pub min_amount: i64,

    /// Provider name recorded on settled orders
    #[serde(default = "default_gateway_provider")]
    pub provider: String,

    /// Minutes until the gateway payment page expires
    #[serde(default = "default_gateway_expire_minutes")]
    #[validate(range(min = 1, max = 1440))]
    pub expire_minutes: i64,
}

impl Default for PaymentGatewayConfig {
    fn default() -> Self {
        Self {
            payment_url: default_gateway_payment_url(),
            merchant_code: None,
            hash_secret: None,
            return_url: None,
            version: default_gateway_version(),
            command: default_gateway_command(),
            currency: default_gateway_currency(),
            locale: default_gateway_locale(),
            order_type: default_gateway_order_type(),
            min_amount: default_gateway_min_amount(),
            provider: default_gateway_provider(),
            expire_minutes: default_gateway_expire_minutes(),
        }
    }
}

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    /// HS256 secret used to verify bearer tokens issued by the identity service
    #[validate(length(min = 32), custom = "validate_jwt_secret")]
    pub jwt_secret: String,

    /// Server host address
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Application environment
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Whether to run database migrations on startup
    #[serde(default)]
    pub auto_migrate: bool,

    /// CORS: comma-separated list of allowed origins (production)
    #[serde(default)]
    pub cors_allowed_origins: Option<String>,

    /// DB pool: max connections
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    /// DB pool: min connections
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    /// DB timeouts (seconds)
    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,
    #[serde(default = "default_db_idle_timeout_secs")]
    pub db_idle_timeout_secs: u64,
    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    /// Event channel capacity for async event processing
    #[serde(default = "default_event_channel_capacity")]
    #[validate(range(min = 1))]
    pub event_channel_capacity: usize,

    #[serde(default)]
    #[validate]
    pub checkout: CheckoutConfig,

    #[serde(default)]
    #[validate]
    pub payment_gateway: PaymentGatewayConfig,
}

impl AppConfig {
    /// Creates a new configuration with defaults for everything but the essentials
    pub fn new(
        database_url: String,
        jwt_secret: String,
        host: String,
        port: u16,
        environment: String,
    ) -> Self {
        Self {
            database_url,
            jwt_secret,
            host,
            port,
            environment,
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: false,
            cors_allowed_origins: None,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_idle_timeout_secs: default_db_idle_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            event_channel_capacity: default_event_channel_capacity(),
            checkout: CheckoutConfig::default(),
            payment_gateway: PaymentGatewayConfig::default(),
        }
    }

    /// Checks if running in development environment
    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
    }

    pub fn log_level(&self) -> &str {
        &self.log_level
    }
}

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_db_max_connections() -> u32 {
    10
}
fn default_db_min_connections() -> u32 {
    1
}
fn default_db_connect_timeout_secs() -> u64 {
    30
}
fn default_db_idle_timeout_secs() -> u64 {
    600
}
fn default_db_acquire_timeout_secs() -> u64 {
    8
}

fn default_event_channel_capacity() -> usize {
    1024
}

fn default_flat_shipping_fee() -> i64 {
    DEFAULT_FLAT_SHIPPING_FEE
}
fn default_free_shipping_threshold() -> i64 {
    DEFAULT_FREE_SHIPPING_THRESHOLD
}
fn default_order_number_attempts() -> u32 {
    DEFAULT_ORDER_NUMBER_ATTEMPTS
}

fn default_gateway_payment_url() -> String {
    "https://sandbox.vnpayment.vn/paymentv2/vpcpay.html".to_string()
}
fn default_gateway_version() -> String {
    "2.1.0".to_string()
}
fn default_gateway_command() -> String {
    "pay".to_string()
}
fn default_gateway_currency() -> String {
    "VND".to_string()
}
fn default_gateway_locale() -> String {
    "vn".to_string()
}
fn default_gateway_order_type() -> String {
    "other".to_string()
}
fn default_gateway_min_amount() -> i64 {
    DEFAULT_GATEWAY_MIN_AMOUNT
}
fn default_gateway_provider() -> String {
    "vnpay".to_string()
}
fn default_gateway_expire_minutes() -> i64 {
    15
}

/// Validates log level values
fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if valid_levels.contains(&level.to_lowercase().as_str()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("log_level");
        err.message = Some("Must be one of: trace, debug, info, warn, error".into());
        Err(err)
    }
}

fn validate_jwt_secret(secret: &str) -> Result<(), ValidationError> {
    let trimmed = secret.trim();

    const DISALLOWED: [&str; 3] = ["your-secret-key", "default-secret-key", "changeme"];
    if DISALLOWED
        .iter()
        .any(|&bad| trimmed.eq_ignore_ascii_case(bad))
    {
        let mut err = ValidationError::new("jwt_secret");
        err.message = Some("JWT secret must be overridden with a secure random value".into());
        return Err(err);
    }

    if let Some(first) = trimmed.chars().next() {
        if trimmed.chars().all(|c| c == first) {
            let mut err = ValidationError::new("jwt_secret");
            err.message = Some("JWT secret cannot be a repeated character sequence".into());
            return Err(err);
        }
    }

    Ok(())
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("techstore_api={},tower_http=debug", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    if json {
        let _ = fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .json()
            .try_init();
    } else {
        let _ = fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .try_init();
    }
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Built-in defaults
/// 2. Default config (config/default.toml)
/// 3. Environment-specific config (config/{env}.toml)
/// 4. Environment variables (APP__*)
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    load_config_from(Path::new(CONFIG_DIR), &run_env)
}

/// Same as [`load_config`] but reads files from an explicit directory.
pub fn load_config_from(config_dir: &Path, run_env: &str) -> Result<AppConfig, AppConfigError> {
    info!("Loading configuration for environment: {}", run_env);

    if !config_dir.exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            config_dir.display()
        );
    }

    let config = Config::builder()
        .set_default("database_url", "sqlite://techstore.db?mode=rwc")?
        .set_default("host", "0.0.0.0")?
        .set_default("port", i64::from(DEFAULT_PORT))?
        .set_default("environment", run_env)?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .add_source(File::with_name(&config_dir.join("default").to_string_lossy()).required(false))
        .add_source(File::with_name(&config_dir.join(run_env).to_string_lossy()).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    if config.get_string("jwt_secret").is_err() {
        error!("JWT secret is not configured. Set APP__JWT_SECRET to the identity service signing secret.");
        return Err(AppConfigError::Load(ConfigError::NotFound(
            "jwt_secret is required but not configured. Set APP__JWT_SECRET environment variable."
                .into(),
        )));
    }

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    if app_config.payment_gateway.hash_secret.is_none()
        || app_config.payment_gateway.merchant_code.is_none()
        || app_config.payment_gateway.return_url.is_none()
    {
        error!("Payment gateway credentials are incomplete; redirect payments will fail until merchant_code, hash_secret and return_url are set");
    }

    info!("Configuration loaded successfully");
    Ok(app_config)
}
