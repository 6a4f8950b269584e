//! Network gate: the single point of outbound network policy
//!
//! Every component that opens a connection must ask the gate first. The gate
//! is injected (`Arc<NetworkGate>`) rather than held as a global, and every
//! decision — allow or deny — produces an audit record.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use url::Url;

use crate::config::GateMode;
use crate::error::{Error, Result};

use super::audit::{AuditDecision, AuditLog, NetworkAuditRecord};

/// A configured endpoint the online mode may reach
#[derive(Debug, Clone)]
struct AllowedEndpoint {
    host: String,
    port: Option<u16>,
}

struct GateState {
    mode: GateMode,
    endpoints: Vec<AllowedEndpoint>,
}

/// Process-wide allowlist for outbound URLs
pub struct NetworkGate {
    state: RwLock<GateState>,
    audit: Arc<AuditLog>,
}

impl NetworkGate {
    /// Create a gate in offline mode
    pub fn new(audit: Arc<AuditLog>) -> Self {
        Self {
            state: RwLock::new(GateState {
                mode: GateMode::Offline,
                endpoints: Vec::new(),
            }),
            audit,
        }
    }

    /// Transition the gate to a mode with an endpoint allowlist.
    ///
    /// Endpoints that fail to parse are skipped with a warning; they never
    /// silently widen the policy.
    pub fn configure(&self, mode: GateMode, allowed_endpoints: &[String]) {
        let mut endpoints = Vec::new();
        for raw in allowed_endpoints {
            match Url::parse(raw) {
                Ok(url) => match url.host_str() {
                    Some(host) => endpoints.push(AllowedEndpoint {
                        host: host.to_ascii_lowercase(),
                        port: url.port(),
                    }),
                    None => tracing::warn!("allowlist entry without host ignored: {}", raw),
                },
                Err(e) => tracing::warn!("unparseable allowlist entry ignored: {} ({})", raw, e),
            }
        }

        tracing::info!(mode = %mode, endpoints = endpoints.len(), "network gate configured");
        let mut state = self.state.write();
        state.mode = mode;
        state.endpoints = endpoints;
    }

    /// Current gate mode
    pub fn mode(&self) -> GateMode {
        self.state.read().mode
    }

    /// The audit log backing this gate
    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    /// Check a URL against the active policy, recording the attempt.
    ///
    /// Denial is fatal to the caller: no retry, no fallback.
    pub fn check_allowed(&self, url: &str, purpose: &str, caller: &str) -> Result<()> {
        let (decision, mode) = self.evaluate(url);
        self.audit.record(NetworkAuditRecord {
            timestamp: Utc::now(),
            url: url.to_string(),
            purpose: purpose.to_string(),
            caller: caller.to_string(),
            mode: mode.to_string(),
            decision,
        });

        match decision {
            AuditDecision::Allow => Ok(()),
            AuditDecision::Deny => Err(Error::NetworkBlocked {
                url: url.to_string(),
                mode: mode.to_string(),
            }),
        }
    }

    /// Non-raising form; still audited
    pub fn is_allowed(&self, url: &str) -> bool {
        let (decision, mode) = self.evaluate(url);
        self.audit.record(NetworkAuditRecord {
            timestamp: Utc::now(),
            url: url.to_string(),
            purpose: "probe".to_string(),
            caller: "is_allowed".to_string(),
            mode: mode.to_string(),
            decision,
        });
        decision == AuditDecision::Allow
    }

    fn evaluate(&self, url: &str) -> (AuditDecision, GateMode) {
        let state = self.state.read();
        let mode = state.mode;

        let parsed = match Url::parse(url) {
            Ok(u) => u,
            Err(_) => return (AuditDecision::Deny, mode),
        };

        if !matches!(parsed.scheme(), "http" | "https") {
            return (AuditDecision::Deny, mode);
        }

        if mode == GateMode::Admin {
            return (AuditDecision::Allow, mode);
        }

        let host = match parsed.host_str() {
            Some(h) => h.to_ascii_lowercase(),
            None => return (AuditDecision::Deny, mode),
        };

        if is_loopback(&host) {
            return (AuditDecision::Allow, mode);
        }

        if mode == GateMode::Online {
            let port = parsed.port();
            let matched = state.endpoints.iter().any(|ep| {
                if ep.host != host {
                    return false;
                }
                match ep.port {
                    Some(p) => port == Some(p),
                    None => true,
                }
            });
            if matched {
                return (AuditDecision::Allow, mode);
            }
        }

        (AuditDecision::Deny, mode)
    }
}

fn is_loopback(host: &str) -> bool {
    if host == "localhost" {
        return true;
    }
    if let Ok(ip) = host.trim_matches(|c| c == '[' || c == ']').parse::<std::net::IpAddr>() {
        return ip.is_loopback();
    }
    false
}
