use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;

/// Process configuration loaded from environment variables.
/// Contains only secrets and deployment knobs; subcategory rules and
/// settlement amounts live in the TOML `FileConfig`.
#[derive(Debug, Clone)]
pub struct Config {
    // Database
    pub database_url: String,

    // Rules file
    pub config_path: PathBuf,

    // Resolver loop
    pub resolver_interval_secs: u64,
    pub resolver_concurrency: usize,
    pub resolver_batch_limit: i64,

    // Logging
    pub log_json: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL is required")?,
            config_path: env::var("VIGIL_CONFIG")
                .unwrap_or_else(|_| "./config/vigil.toml".to_string())
                .into(),
            resolver_interval_secs: parse_env("RESOLVER_INTERVAL_SECS", 300)?,
            resolver_concurrency: parse_env("RESOLVER_CONCURRENCY", 4)?,
            resolver_batch_limit: parse_env("RESOLVER_BATCH_LIMIT", 500)?,
            log_json: env::var("LOG_FORMAT")
                .map(|v| v.eq_ignore_ascii_case("json"))
                .unwrap_or(false),
        })
    }

    /// Log the loaded config with the database password masked.
    pub fn log_redacted(&self) {
        tracing::info!(
            database_url = %redact_url(&self.database_url),
            config_path = %self.config_path.display(),
            resolver_interval_secs = self.resolver_interval_secs,
            resolver_concurrency = self.resolver_concurrency,
            resolver_batch_limit = self.resolver_batch_limit,
            "Config loaded"
        );
    }
}

fn parse_env<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("{key} must be a number, got {raw:?}")),
        Err(_) => Ok(default),
    }
}

/// Mask credentials in a connection URL: the userinfo password and any
/// password-bearing query parameters.
pub fn redact_url(raw: &str) -> String {
    const SECRET_PARAMS: &[&str] = &["password", "sslpassword"];
    const MASK: &str = "***";

    let Ok(mut parsed) = url::Url::parse(raw) else {
        return raw.to_string();
    };

    if parsed.password().is_some() && parsed.set_password(Some(MASK)).is_err() {
        return MASK.to_string();
    }

    if parsed.query().is_some() {
        let pairs: Vec<(String, String)> = parsed
            .query_pairs()
            .map(|(k, v)| {
                if SECRET_PARAMS.iter().any(|p| k.eq_ignore_ascii_case(p)) {
                    (k.into_owned(), MASK.to_string())
                } else {
                    (k.into_owned(), v.into_owned())
                }
            })
            .collect();
        parsed.query_pairs_mut().clear().extend_pairs(pairs);
    }

    parsed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_password() {
        assert_eq!(
            redact_url("postgres://vigil:hunter2@db:5432/vigil"),
            "postgres://vigil:***@db:5432/vigil"
        );
    }

    #[test]
    fn redacts_password_query_params() {
        assert_eq!(
            redact_url("postgres://vigil@db/vigil?password=hunter2"),
            "postgres://vigil@db/vigil?password=***"
        );

        let both = redact_url("postgres://vigil:hunter2@db/vigil?sslpassword=s3cret&sslmode=require");
        assert!(!both.contains("hunter2"));
        assert!(!both.contains("s3cret"));
        assert_eq!(
            both,
            "postgres://vigil:***@db/vigil?sslpassword=***&sslmode=require"
        );
    }

    #[test]
    fn leaves_passwordless_urls_alone() {
        assert_eq!(
            redact_url("postgres://vigil@db/vigil"),
            "postgres://vigil@db/vigil"
        );
        assert_eq!(redact_url("not a url"), "not a url");
    }
}
