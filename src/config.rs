use anyhow::{Context, Result};
use clap::Parser;
use std::env;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub storage_dir: String,
    pub cache_dir: String,
    pub bucket: String,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Document repository and blob store API")]
pub struct Args {
    /// Host to bind to (overrides DOC_REPO_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides DOC_REPO_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Database URL (overrides DOC_REPO_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Directory where blob payloads are stored (overrides DOC_REPO_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Directory for the local download cache (overrides DOC_REPO_CACHE_DIR)
    #[arg(long)]
    pub cache_dir: Option<String>,

    /// Default blob bucket (overrides DOC_REPO_BUCKET)
    #[arg(long)]
    pub bucket: Option<String>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let migrate = args.migrate;
        let cfg = Self::from_sources(args, |key| env::var(key).ok())?;
        Ok((cfg, migrate))
    }

    /// Merge `args` over values read through `env`, then over defaults.
    pub fn from_sources(args: Args, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let env_or = |key: &str, default: &str| env(key).unwrap_or_else(|| default.into());

        let env_port = match env("DOC_REPO_PORT") {
            Some(value) => value
                .parse::<u16>()
                .with_context(|| format!("parsing DOC_REPO_PORT value `{}`", value))?,
            None => 3000,
        };

        Ok(Self {
            host: args.host.unwrap_or_else(|| env_or("DOC_REPO_HOST", "0.0.0.0")),
            port: args.port.unwrap_or(env_port),
            database_url: args.database_url.unwrap_or_else(|| {
                env_or("DOC_REPO_DATABASE_URL", "sqlite://./data/meta/repository.db")
            }),
            storage_dir: args
                .storage_dir
                .unwrap_or_else(|| env_or("DOC_REPO_STORAGE_DIR", "./data/blobs")),
            cache_dir: args
                .cache_dir
                .unwrap_or_else(|| env_or("DOC_REPO_CACHE_DIR", "./data/cache")),
            bucket: args
                .bucket
                .unwrap_or_else(|| env_or("DOC_REPO_BUCKET", "my_file_bucket")),
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_without_env_or_args() {
        let cfg = AppConfig::from_sources(Args::default(), env_from(&[])).unwrap();
        assert_eq!(cfg.addr(), "0.0.0.0:3000");
        assert_eq!(cfg.database_url, "sqlite://./data/meta/repository.db");
        assert_eq!(cfg.storage_dir, "./data/blobs");
        assert_eq!(cfg.cache_dir, "./data/cache");
        assert_eq!(cfg.bucket, "my_file_bucket");
    }

    #[test]
    fn args_override_env() {
        let args = Args::try_parse_from(["doc-repository", "--port", "8080", "--bucket", "media"])
            .unwrap();
        let env = env_from(&[
            ("DOC_REPO_PORT", "9000"),
            ("DOC_REPO_BUCKET", "env_bucket"),
            ("DOC_REPO_CACHE_DIR", "/tmp/cache"),
        ]);
        let cfg = AppConfig::from_sources(args, env).unwrap();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.bucket, "media");
        assert_eq!(cfg.cache_dir, "/tmp/cache");
    }

    #[test]
    fn bad_port_is_reported() {
        let err = AppConfig::from_sources(Args::default(), env_from(&[("DOC_REPO_PORT", "http")]))
            .unwrap_err();
        assert!(err.to_string().contains("DOC_REPO_PORT"));
    }

    #[test]
    fn migrate_flag_parses() {
        let args = Args::try_parse_from(["doc-repository", "--migrate"]).unwrap();
        assert!(args.migrate);
    }
}
