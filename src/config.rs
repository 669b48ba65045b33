use anyhow::{Context, Result, bail};
use clap::Parser;
use std::{env, fmt, path::PathBuf, time::Duration};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments. Built once at startup and
/// handed to every client constructor.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub sql_dir: PathBuf,
    pub relational: RelationalConfig,
    pub warehouse: WarehouseConfig,
}

/// Everything needed to reach the relational instance.
#[derive(Debug, Clone)]
pub struct RelationalConfig {
    /// Instance identifier: `host[:port]`, or an absolute socket directory.
    pub instance: String,
    pub user: String,
    pub password: Secret,
    pub database: String,
    pub ssl_mode: String,
    pub connect_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct WarehouseConfig {
    pub project_id: String,
    /// Service-account key file. Application default credentials when unset.
    pub credentials_file: Option<PathBuf>,
    pub max_retries: usize,
    pub retry_initial_backoff: Duration,
}

/// A string that never shows up in `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(****)")
    }
}

/// Command-line configuration.
#[derive(Parser, Debug, Default)]
#[command(
    author,
    version,
    about = "HTTP bridge between a relational database and an analytics warehouse"
)]
pub struct Args {
    /// Host to bind to (overrides HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Root directory holding `relational/` and `warehouse/` SQL files (overrides SQL_DIR)
    #[arg(long)]
    pub sql_dir: Option<PathBuf>,
}

const REQUIRED_VARS: [&str; 4] = ["DB_HOST", "DB_USER", "DB_PASSWORD", "WAREHOUSE_PROJECT_ID"];

impl AppConfig {
    /// Parse CLI args and the process environment into an AppConfig.
    pub fn from_env_and_args() -> Result<Self> {
        let args = Args::parse();
        Self::from_sources(args, |key| env::var(key).ok())
    }

    /// Merge CLI args over values produced by `lookup`, falling back to defaults.
    ///
    /// Fails naming every missing required variable, so a misconfigured
    /// deployment is fixed in one round.
    pub fn from_sources<F>(args: Args, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let missing: Vec<&str> = REQUIRED_VARS
            .iter()
            .copied()
            .filter(|key| var(*key).is_none())
            .collect();
        if !missing.is_empty() {
            bail!(
                "missing required environment variables: {}",
                missing.join(", ")
            );
        }

        let env_port = parse_or(&var("PORT"), "PORT", 8080u16)?;
        let connect_timeout_secs = parse_or(
            &var("DB_CONNECT_TIMEOUT_SECS"),
            "DB_CONNECT_TIMEOUT_SECS",
            30u64,
        )?;
        let max_retries =
            parse_or(&var("WAREHOUSE_MAX_RETRIES"), "WAREHOUSE_MAX_RETRIES", 3usize)?;
        let retry_initial_ms = parse_or(
            &var("WAREHOUSE_RETRY_INITIAL_MS"),
            "WAREHOUSE_RETRY_INITIAL_MS",
            1000u64,
        )?;

        let relational = RelationalConfig {
            instance: var("DB_HOST").unwrap_or_default(),
            user: var("DB_USER").unwrap_or_default(),
            password: Secret::new(var("DB_PASSWORD").unwrap_or_default()),
            database: var("DB_NAME").unwrap_or_else(|| "sample_db".into()),
            ssl_mode: var("DB_SSLMODE").unwrap_or_else(|| "require".into()),
            connect_timeout: Duration::from_secs(connect_timeout_secs),
        };

        let warehouse = WarehouseConfig {
            project_id: var("WAREHOUSE_PROJECT_ID").unwrap_or_default(),
            credentials_file: var("WAREHOUSE_CREDENTIALS_FILE").map(PathBuf::from),
            max_retries,
            retry_initial_backoff: Duration::from_millis(retry_initial_ms),
        };

        Ok(Self {
            host: args
                .host
                .or_else(|| var("HOST"))
                .unwrap_or_else(|| "0.0.0.0".into()),
            port: args.port.unwrap_or(env_port),
            sql_dir: args
                .sql_dir
                .or_else(|| var("SQL_DIR").map(PathBuf::from))
                .unwrap_or_else(|| PathBuf::from("sql")),
            relational,
            warehouse,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_or<T>(value: &Option<String>, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match value {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", key, raw)),
        None => Ok(default),
    }
}
