use crate::domain::{AnonymousHistoryPolicy, QuotaPolicy};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::str::FromStr;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub server_host: String,
    pub server_port: u16,
    /// Shared bearer token expected from the web front-end. Empty disables the check.
    pub api_token: String,

    // Stripe
    pub stripe_secret_key: String,
    pub stripe_webhook_secret: String,
    pub stripe_api_base: String,
    pub stripe_pro_price_id: String,
    pub stripe_lifetime_price_id: String,
    pub webhook_tolerance_secs: i64,
    pub app_base_url: String,

    // Quota
    pub free_action_limit: i64,
    pub action_price_cents: i64,
    pub currency: String,
    pub anonymous_history: String,
    pub max_artifacts_per_parent: i64,
    pub checkout_session_ttl_hours: i64,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::with_prefix("CVE")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .set_default("server_host", "0.0.0.0")?
            .set_default("server_port", 8080)?
            .set_default("api_token", "")?
            .set_default("stripe_api_base", "https://api.stripe.com/v1")?
            .set_default("stripe_pro_price_id", "")?
            .set_default("stripe_lifetime_price_id", "")?
            .set_default("webhook_tolerance_secs", 300)?
            .set_default("app_base_url", "http://localhost:3000")?
            .set_default("free_action_limit", 3)?
            .set_default("action_price_cents", 199)?
            .set_default("currency", "eur")?
            .set_default("anonymous_history", "separate")?
            .set_default("max_artifacts_per_parent", 3)?
            .set_default("checkout_session_ttl_hours", 24)?
            .build()?;

        let cfg: AppConfig = config.try_deserialize()?;
        cfg.history_policy()?;
        Ok(cfg)
    }

    pub fn quota_policy(&self) -> QuotaPolicy {
        QuotaPolicy {
            free_action_limit: self.free_action_limit,
            action_price_cents: self.action_price_cents,
            currency: self.currency.clone(),
        }
    }

    pub fn history_policy(&self) -> Result<AnonymousHistoryPolicy, ConfigError> {
        AnonymousHistoryPolicy::from_str(&self.anonymous_history).map_err(|_| {
            ConfigError::Message(format!(
                "anonymous_history must be 'separate' or 'carry_over', got '{}'",
                self.anonymous_history
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> AppConfig {
        AppConfig {
            database_url: "postgres://localhost/cv".to_string(),
            server_host: "127.0.0.1".to_string(),
            server_port: 8080,
            api_token: String::new(),
            stripe_secret_key: "sk_test_123".to_string(),
            stripe_webhook_secret: "whsec_123".to_string(),
            stripe_api_base: "https://api.stripe.com/v1".to_string(),
            stripe_pro_price_id: "price_pro".to_string(),
            stripe_lifetime_price_id: "price_lifetime".to_string(),
            webhook_tolerance_secs: 300,
            app_base_url: "http://localhost:3000".to_string(),
            free_action_limit: 3,
            action_price_cents: 199,
            currency: "eur".to_string(),
            anonymous_history: "carry_over".to_string(),
            max_artifacts_per_parent: 3,
            checkout_session_ttl_hours: 24,
        }
    }

    #[test]
    fn derives_policies() {
        let cfg = sample();
        assert_eq!(cfg.quota_policy(), QuotaPolicy::default());
        assert_eq!(
            cfg.history_policy().unwrap(),
            AnonymousHistoryPolicy::CarryOver
        );
    }

    #[test]
    fn rejects_unknown_history_policy() {
        let mut cfg = sample();
        cfg.anonymous_history = "merge_everything".to_string();
        assert!(cfg.history_policy().is_err());
    }
}
