//! Connectors turn an instance identifier into connection options for a
//! secure path to the relational database.
//!
//! The default [`SecureConnector`] understands two shapes of `DB_HOST`:
//! - an absolute directory, treated as the unix socket directory of a local
//!   auth proxy (the proxy owns the encrypted tunnel);
//! - `host[:port]`, reached directly over TLS with the configured SSL mode.

use crate::{
    config::RelationalConfig,
    services::error::{ClientError, ClientResult},
};
use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgSslMode};
use std::{path::Path, str::FromStr};
use tracing::info;

const DEFAULT_PG_PORT: u16 = 5432;

#[async_trait]
pub trait Connector: Send + Sync {
    /// Resolve connection options for the configured instance.
    async fn connect_options(&self, cfg: &RelationalConfig) -> ClientResult<PgConnectOptions>;

    /// Release whatever the connector holds open.
    async fn close(&self) -> ClientResult<()> {
        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct SecureConnector;

#[async_trait]
impl Connector for SecureConnector {
    async fn connect_options(&self, cfg: &RelationalConfig) -> ClientResult<PgConnectOptions> {
        let base = PgConnectOptions::new()
            .username(&cfg.user)
            .password(cfg.password.expose())
            .database(&cfg.database);

        if Path::new(&cfg.instance).is_absolute() {
            info!(socket_dir = %cfg.instance, "connecting through proxy socket");
            return Ok(base.socket(&cfg.instance));
        }

        let (host, port) = parse_host_port(&cfg.instance)
            .ok_or_else(|| ClientError::connection(&cfg.instance, "invalid instance address"))?;
        let ssl_mode = PgSslMode::from_str(&cfg.ssl_mode)
            .map_err(|e| ClientError::connection(&cfg.instance, e))?;

        info!(
            host,
            port,
            ssl_mode = %cfg.ssl_mode,
            user = %cfg.user,
            db = %cfg.database,
            "connecting over tls"
        );
        Ok(base.host(host).port(port).ssl_mode(ssl_mode))
    }
}

/// Split `host[:port]`. Bracketed IPv6 (`[::1]:5432`) is accepted.
fn parse_host_port(instance: &str) -> Option<(&str, u16)> {
    let instance = instance.trim();
    if instance.is_empty() {
        return None;
    }

    if let Some(rest) = instance.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        return match tail.strip_prefix(':') {
            Some(port) => Some((host, port.parse().ok()?)),
            None if tail.is_empty() => Some((host, DEFAULT_PG_PORT)),
            None => None,
        };
    }

    match instance.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            if host.is_empty() {
                return None;
            }
            Some((host, port.parse().ok()?))
        }
        // bare IPv6 without brackets
        Some(_) => Some((instance, DEFAULT_PG_PORT)),
        None => Some((instance, DEFAULT_PG_PORT)),
    }
}
