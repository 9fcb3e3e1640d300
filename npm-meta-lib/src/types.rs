//! Core types for npm-meta
//!
//! Defines the data structures shared by the upstream client, the metadata
//! store and the reconciliation layer:
//! - Forwarding rules (owned by Nginx Proxy Manager)
//! - Metadata records (owned locally)
//! - Merged view entries
//! - Configuration

use crate::error::{MetaError, Result};
use crate::ports::PortRange;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

/// Identifier NPM assigns to a stream.
pub type RuleId = i64;

/// A port-forwarding rule ("stream") as reported by Nginx Proxy Manager.
///
/// Only upstream creates or deletes these; the local side merely reflects them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForwardingRule {
    pub id: RuleId,
    pub incoming_port: u16,
    pub forwarding_host: String,
    pub forwarding_port: u16,
    #[serde(default = "default_true", deserialize_with = "bool_or_int")]
    pub tcp_forwarding: bool,
    #[serde(default, deserialize_with = "bool_or_int")]
    pub udp_forwarding: bool,
    #[serde(default = "default_true", deserialize_with = "bool_or_int")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// NPM reports flags as JSON booleans on newer releases and as 0/1 on older ones.
fn bool_or_int<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Int(i64),
    }

    Ok(match Flag::deserialize(deserializer)? {
        Flag::Bool(b) => b,
        Flag::Int(i) => i != 0,
    })
}

/// Request to create a new forwarding rule upstream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuleSpec {
    pub incoming_port: u16,
    pub forwarding_host: String,
    pub forwarding_port: u16,
    #[serde(default = "default_true")]
    pub tcp_forwarding: bool,
    #[serde(default)]
    pub udp_forwarding: bool,
}

impl RuleSpec {
    /// Create a TCP-only rule spec
    pub fn new(incoming_port: u16, forwarding_host: impl Into<String>, forwarding_port: u16) -> Self {
        Self {
            incoming_port,
            forwarding_host: forwarding_host.into(),
            forwarding_port,
            tcp_forwarding: true,
            udp_forwarding: false,
        }
    }

    /// Reject specs that upstream would refuse for obvious reasons.
    pub fn validate(&self) -> Result<()> {
        if self.incoming_port == 0 || self.forwarding_port == 0 {
            return Err(MetaError::invalid_input("ports must be between 1 and 65535"));
        }
        if self.forwarding_host.trim().is_empty() {
            return Err(MetaError::invalid_input("forwarding host must not be empty"));
        }
        if !self.tcp_forwarding && !self.udp_forwarding {
            return Err(MetaError::invalid_input(
                "at least one of TCP or UDP forwarding must be enabled",
            ));
        }
        Ok(())
    }
}

/// A labelled link shown next to a rule (docs, test endpoint, repository...).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuickLink {
    pub label: String,
    pub url: String,
}

impl QuickLink {
    pub fn new(label: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            url: url.into(),
        }
    }
}

/// User-editable annotation of a rule.
///
/// Tags are case-sensitive opaque strings. Quick links keep insertion order
/// and may repeat.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Metadata {
    #[serde(default)]
    pub note: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub quick_links: Vec<QuickLink>,
}

impl Metadata {
    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = note.into();
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_link(mut self, label: impl Into<String>, url: impl Into<String>) -> Self {
        self.quick_links.push(QuickLink::new(label, url));
        self
    }

    /// Trim tags and drop blank ones. Case is preserved.
    pub fn normalized(mut self) -> Self {
        self.tags = self
            .tags
            .into_iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        self
    }

    pub fn is_empty(&self) -> bool {
        self.note.is_empty() && self.tags.is_empty() && self.quick_links.is_empty()
    }
}

/// Locally stored metadata for one rule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MetadataRecord {
    pub rule_id: RuleId,
    pub metadata: Metadata,
    pub updated_at: DateTime<Utc>,
    /// First time a reconciliation saw this rule missing upstream.
    pub orphaned_since: Option<DateTime<Utc>>,
}

impl MetadataRecord {
    pub fn new(rule_id: RuleId, metadata: Metadata) -> Self {
        Self {
            rule_id,
            metadata,
            updated_at: Utc::now(),
            orphaned_since: None,
        }
    }
}

/// One row of the merged view: the upstream rule plus its metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MergedEntry {
    #[serde(flatten)]
    pub rule: ForwardingRule,
    #[serde(flatten)]
    pub metadata: Metadata,
}

/// Runtime configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the NPM REST API, including the `/api` suffix
    pub npm_url: String,
    /// Data directory for the metadata database
    pub data_dir: Option<String>,
    /// Management API port (default: 5001)
    pub listen_port: u16,
    /// Bound on every upstream call
    pub upstream_timeout: Duration,
    /// Range scanned when suggesting an incoming port
    pub port_range: PortRange,
    /// How long an orphaned record is kept before it is reaped
    pub orphan_grace: Duration,
    /// Interval of the background orphan sweep
    pub reap_interval: Duration,
    /// How long a port created by this process counts as taken for suggestions
    pub recent_port_ttl: Duration,
    /// Lifetime of a login session
    pub session_ttl: Duration,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            npm_url: "http://localhost:81/api".to_string(),
            data_dir: None,
            listen_port: 5001,
            upstream_timeout: Duration::from_secs(10),
            port_range: PortRange::default(),
            orphan_grace: Duration::from_secs(24 * 60 * 60),
            reap_interval: Duration::from_secs(60 * 60),
            recent_port_ttl: Duration::from_secs(60),
            session_ttl: Duration::from_secs(7 * 24 * 60 * 60),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Create a new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Point at an NPM instance by `host:port`, as `NPM_HOST` is given
    pub fn with_npm_host(mut self, host: &str) -> Self {
        self.npm_url = format!("http://{}/api", host.trim_end_matches('/'));
        self
    }

    /// Point at an NPM API by full URL
    pub fn with_npm_url(mut self, url: impl Into<String>) -> Self {
        self.npm_url = url.into().trim_end_matches('/').to_string();
        self
    }

    /// Set data directory
    pub fn with_data_dir(mut self, dir: impl Into<String>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    /// Set API port
    pub fn with_listen_port(mut self, port: u16) -> Self {
        self.listen_port = port;
        self
    }

    pub fn with_upstream_timeout(mut self, timeout: Duration) -> Self {
        self.upstream_timeout = timeout;
        self
    }

    pub fn with_port_range(mut self, range: PortRange) -> Self {
        self.port_range = range;
        self
    }

    pub fn with_orphan_grace(mut self, grace: Duration) -> Self {
        self.orphan_grace = grace;
        self
    }

    pub fn with_reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval = interval;
        self
    }

    pub fn with_recent_port_ttl(mut self, ttl: Duration) -> Self {
        self.recent_port_ttl = ttl;
        self
    }

    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }
}
