/// npm-meta - Shared Library
///
/// Reconciles Nginx Proxy Manager streams with locally stored notes, tags
/// and quick links. Used by the `npm-meta-server` daemon.
pub mod database;
pub mod error;
pub mod ports;
pub mod reconcile;
pub mod session;
pub mod storage;
pub mod types;
pub mod upstream;

pub use database::MetaDatabase;
pub use error::{MetaError, Result};
pub use ports::{suggest_next_port, PortRange};
pub use reconcile::{merge, plan_reap, CreateOutcome, MergedView, ReapPlan, Reconciler, Reconciliation};
pub use session::{CredentialRelay, Session};
pub use storage::{MemoryStore, MetadataStore};
pub use types::{Config, ForwardingRule, MergedEntry, Metadata, MetadataRecord, QuickLink, RuleId, RuleSpec};
pub use upstream::{NpmClient, StreamApi, UpstreamToken};
