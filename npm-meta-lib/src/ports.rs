//! Incoming port suggestion
//!
//! Suggestions are advisory: nothing is reserved, and two callers may be
//! handed the same port. The upstream duplicate-port rejection settles races.

use crate::error::{MetaError, Result};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Inclusive range of ports scanned for suggestions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            start: 8000,
            end: u16::MAX,
        }
    }
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Result<Self> {
        if start == 0 {
            return Err(MetaError::config("port range must start at 1 or above"));
        }
        if start > end {
            return Err(MetaError::config(format!(
                "port range start {} is above end {}",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    /// Range starting at `start` and running to 65535.
    pub fn from_base(start: u16) -> Result<Self> {
        Self::new(start, u16::MAX)
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }
}

/// Lowest port in `range` that is not in `existing`.
pub fn suggest_next_port(existing: &HashSet<u16>, range: PortRange) -> Result<u16> {
    (range.start..=range.end)
        .find(|port| !existing.contains(port))
        .ok_or(MetaError::PortRangeExhausted {
            start: range.start,
            end: range.end,
        })
}

/// Ports created by this process that upstream may not list yet.
///
/// Entries expire after `ttl`; by then the rule is either visible upstream or
/// its creation never took effect.
#[derive(Debug)]
pub struct RecentPorts {
    ttl: Duration,
    ports: Mutex<HashMap<u16, Instant>>,
}

impl RecentPorts {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            ports: Mutex::new(HashMap::new()),
        }
    }

    pub fn record(&self, port: u16, now: Instant) {
        let mut ports = self.ports.lock().unwrap_or_else(|e| e.into_inner());
        ports.insert(port, now);
    }

    /// Ports still inside the TTL. Expired entries are dropped.
    pub fn active(&self, now: Instant) -> HashSet<u16> {
        let mut ports = self.ports.lock().unwrap_or_else(|e| e.into_inner());
        ports.retain(|_, created| now.saturating_duration_since(*created) < self.ttl);
        ports.keys().copied().collect()
    }
}
