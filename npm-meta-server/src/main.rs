//! npm-meta server
//!
//! Serves the JSON management API over Nginx Proxy Manager streams and
//! their local metadata, and sweeps orphaned metadata in the background.

use clap::Parser;
use npm_meta_lib::{Config, MetaDatabase, NpmClient, PortRange};
use npm_meta_server::{api, reaper};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "npm-meta-server")]
#[command(author, version, about = "Notes, tags and links for Nginx Proxy Manager streams", long_about = None)]
struct Args {
    /// Management API port
    #[arg(long, env = "NPM_META_PORT", default_value = "5001")]
    port: u16,

    /// NPM host as host:port
    #[arg(long, env = "NPM_HOST", default_value = "localhost:81")]
    npm_host: String,

    /// Full NPM API URL; overrides --npm-host
    #[arg(long, env = "NPM_URL")]
    npm_url: Option<String>,

    /// Data directory for the metadata database
    #[arg(long, env = "NPM_META_DATA_DIR")]
    data_dir: Option<String>,

    /// Timeout for each NPM call, in seconds
    #[arg(long, default_value = "10")]
    upstream_timeout_secs: u64,

    /// First port considered when suggesting a free port
    #[arg(long, default_value = "8000")]
    port_range_start: u16,

    /// Last port considered when suggesting a free port
    #[arg(long, default_value = "65535")]
    port_range_end: u16,

    /// Hours an orphaned record is kept before reaping
    #[arg(long, default_value = "24")]
    orphan_grace_hours: u64,

    /// Minutes between background orphan sweeps
    #[arg(long, default_value = "60")]
    reap_interval_mins: u64,

    /// Hours a "remember me" login stays valid
    #[arg(long, default_value = "168")]
    session_ttl_hours: u64,

    /// Seconds a just-created port counts as taken for suggestions
    #[arg(long, default_value = "60")]
    recent_port_ttl_secs: u64,

    /// NPM identity used by the background sweep
    #[arg(long, env = "NPM_META_IDENTITY")]
    service_identity: Option<String>,

    /// NPM secret used by the background sweep
    #[arg(long, env = "NPM_META_SECRET", hide_env_values = true)]
    service_secret: Option<String>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn to_config(&self) -> anyhow::Result<Config> {
        if self.upstream_timeout_secs == 0 {
            anyhow::bail!("--upstream-timeout-secs must be at least 1");
        }
        if self.reap_interval_mins == 0 {
            anyhow::bail!("--reap-interval-mins must be at least 1");
        }
        if self.session_ttl_hours == 0 {
            anyhow::bail!("--session-ttl-hours must be at least 1");
        }

        let config = Config::new()
            .with_npm_host(&self.npm_host)
            .with_listen_port(self.port)
            .with_upstream_timeout(Duration::from_secs(self.upstream_timeout_secs))
            .with_port_range(PortRange::new(self.port_range_start, self.port_range_end)?)
            .with_orphan_grace(hours("--orphan-grace-hours", self.orphan_grace_hours)?)
            .with_reap_interval(minutes("--reap-interval-mins", self.reap_interval_mins)?)
            .with_session_ttl(hours("--session-ttl-hours", self.session_ttl_hours)?)
            .with_recent_port_ttl(Duration::from_secs(self.recent_port_ttl_secs))
            .with_log_level(self.log_level.clone());

        let config = match &self.npm_url {
            Some(url) => config.with_npm_url(url.clone()),
            None => config,
        };
        let config = match &self.data_dir {
            Some(dir) => config.with_data_dir(dir.clone()),
            None => config,
        };
        Ok(config)
    }

    fn service_credentials(&self) -> Option<reaper::ServiceCredentials> {
        match (&self.service_identity, &self.service_secret) {
            (Some(identity), Some(secret)) => Some(reaper::ServiceCredentials {
                identity: identity.clone(),
                secret: secret.clone(),
            }),
            _ => None,
        }
    }
}

fn hours(flag: &str, value: u64) -> anyhow::Result<Duration> {
    value
        .checked_mul(60 * 60)
        .map(Duration::from_secs)
        .ok_or_else(|| anyhow::anyhow!("{} is too large", flag))
}

fn minutes(flag: &str, value: u64) -> anyhow::Result<Duration> {
    value
        .checked_mul(60)
        .map(Duration::from_secs)
        .ok_or_else(|| anyhow::anyhow!("{} is too large", flag))
}

/// Database file under the data dir, or `~/.npm-meta/` by default
fn database_path(config: &Config) -> anyhow::Result<PathBuf> {
    let dir = match config.data_dir.as_ref() {
        Some(dir) => PathBuf::from(dir),
        None => dirs::home_dir()
            .ok_or_else(|| anyhow::anyhow!("Cannot determine home directory"))?
            .join(".npm-meta"),
    };
    std::fs::create_dir_all(&dir)?;
    Ok(dir.join("npm_meta.db"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = args.to_config()?;

    tracing_subscriber::fmt()
        .with_env_filter(config.log_level.as_str())
        .init();

    tracing::info!("Starting npm-meta server");
    tracing::info!("NPM API: {}", config.npm_url);

    let db_path = database_path(&config)?;
    let db_path_str = db_path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Database path is not valid UTF-8"))?;
    let db = Arc::new(MetaDatabase::open(db_path_str).await?);
    tracing::info!("Database opened at {}", db_path.display());

    let client = Arc::new(NpmClient::from_config(&config)?);
    let state = api::ApiState::new(&config, client, db);

    match args.service_credentials() {
        Some(credentials) => {
            let sweep = reaper::Reaper::new(
                Arc::clone(&state.reconciler),
                Arc::clone(&state.relay),
                credentials,
            );
            let _reaper_handle = reaper::spawn_reaper(sweep, config.reap_interval);
            tracing::info!(
                "Orphan sweep every {} minutes",
                config.reap_interval.as_secs() / 60
            );
        }
        None => tracing::info!(
            "No service credentials set; orphans are reaped only on request"
        ),
    }

    let app = api::create_router(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.listen_port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Management API listening on http://{}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_defaults() {
        let args = Args::parse_from(["npm-meta-server"]);
        assert_eq!(args.port, 5001);
        assert_eq!(args.port_range_start, 8000);
        assert_eq!(args.log_level, "info");
    }

    #[test]
    fn test_args_to_config() {
        let args = Args::parse_from([
            "npm-meta-server",
            "--npm-host",
            "npm.lan:81",
            "--port",
            "6000",
            "--port-range-start",
            "9000",
            "--port-range-end",
            "9100",
            "--orphan-grace-hours",
            "2",
        ]);
        let config = args.to_config().unwrap();

        assert_eq!(config.npm_url, "http://npm.lan:81/api");
        assert_eq!(config.listen_port, 6000);
        assert_eq!(config.port_range, PortRange::new(9000, 9100).unwrap());
        assert_eq!(config.orphan_grace, Duration::from_secs(7200));
    }

    #[test]
    fn test_npm_url_overrides_host() {
        let args = Args::parse_from([
            "npm-meta-server",
            "--npm-url",
            "https://npm.example.com/api/",
        ]);
        let config = args.to_config().unwrap();
        assert_eq!(config.npm_url, "https://npm.example.com/api");
    }

    #[test]
    fn test_inverted_port_range_rejected() {
        let args = Args::parse_from([
            "npm-meta-server",
            "--port-range-start",
            "9000",
            "--port-range-end",
            "8000",
        ]);
        assert!(args.to_config().is_err());
    }

    #[test]
    fn test_zero_reap_interval_rejected() {
        let args = Args::parse_from(["npm-meta-server", "--reap-interval-mins", "0"]);
        assert!(args.to_config().is_err());
    }

    #[test]
    fn test_zero_upstream_timeout_rejected() {
        let args = Args::parse_from(["npm-meta-server", "--upstream-timeout-secs", "0"]);
        assert!(args.to_config().is_err());
    }

    #[test]
    fn test_overflowing_hours_rejected() {
        let max = u64::MAX.to_string();
        let args = Args::parse_from(["npm-meta-server", "--orphan-grace-hours", max.as_str()]);
        let err = args.to_config().unwrap_err();
        assert!(err.to_string().contains("--orphan-grace-hours"));
    }

    #[test]
    fn test_session_and_recent_port_ttls_wired() {
        let args = Args::parse_from([
            "npm-meta-server",
            "--session-ttl-hours",
            "24",
            "--recent-port-ttl-secs",
            "5",
            "--log-level",
            "debug",
        ]);
        let config = args.to_config().unwrap();
        assert_eq!(config.session_ttl, Duration::from_secs(24 * 60 * 60));
        assert_eq!(config.recent_port_ttl, Duration::from_secs(5));
        assert_eq!(config.log_level, "debug");

        let defaults = Args::parse_from(["npm-meta-server"]).to_config().unwrap();
        assert_eq!(defaults.session_ttl, Config::default().session_ttl);
        assert_eq!(defaults.recent_port_ttl, Config::default().recent_port_ttl);
    }

    #[test]
    fn test_service_credentials_need_both() {
        let args = Args::parse_from(["npm-meta-server", "--service-identity", "svc@example.com"]);
        assert!(args.service_credentials().is_none());

        let args = Args::parse_from([
            "npm-meta-server",
            "--service-identity",
            "svc@example.com",
            "--service-secret",
            "pw",
        ]);
        assert!(args.service_credentials().is_some());
    }

    #[test]
    fn test_database_path_in_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("data");
        let config = Config::new().with_data_dir(nested.to_str().unwrap());

        let path = database_path(&config).unwrap();
        assert_eq!(path, nested.join("npm_meta.db"));
        assert!(nested.is_dir());
    }
}
