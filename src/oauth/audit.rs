//! Audit trail for the authorization server.
//!
//! Every security-relevant transition is emitted through `tracing` with the
//! event serialized into an `audit` field, so log aggregators can index it.
//! Users appear only as `user:<hash>`; tokens never appear at all.
//!
//! | Event | Level |
//! |-------|-------|
//! | `client.registered` | info |
//! | `code.issued` | info |
//! | `token.issued` / `token.refreshed` | info |
//! | `token.revoked` / `lineage.revoked` | info |
//! | `registration.denied` | warn |
//! | `redirect.rejected` | warn |
//! | `replay.detected` | warn |
//! | `rate_limited` | warn |

use serde::Serialize;

use crate::federation::validation::anonymize_email;

/// Structured audit event
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    /// Event type (`token.issued`, `replay.detected`, ...)
    pub event: &'static str,
    /// Hashed user identity
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_hash: Option<String>,
    /// OAuth client
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Token lineage
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lineage_id: Option<String>,
    /// Caller IP
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<String>,
    /// Rejection bucket
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<&'static str>,
    /// Human-readable detail
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip)]
    violation: bool,
}

impl AuditEvent {
    fn new(event: &'static str, violation: bool) -> Self {
        Self {
            event,
            user_hash: None,
            client_id: None,
            lineage_id: None,
            client_ip: None,
            category: None,
            reason: None,
            violation,
        }
    }

    /// A client was registered
    #[must_use]
    pub fn client_registered(client_id: &str, trust: &'static str, client_ip: &str) -> Self {
        Self {
            client_id: Some(client_id.to_string()),
            client_ip: Some(client_ip.to_string()),
            category: Some(trust),
            ..Self::new("client.registered", false)
        }
    }

    /// Registration was refused
    #[must_use]
    pub fn registration_denied(reason: impl Into<String>, client_ip: &str) -> Self {
        Self {
            client_ip: Some(client_ip.to_string()),
            reason: Some(reason.into()),
            ..Self::new("registration.denied", true)
        }
    }

    /// A redirect URI failed validation
    #[must_use]
    pub fn redirect_rejected(client_id: Option<&str>, category: &'static str, reason: impl Into<String>) -> Self {
        Self {
            client_id: client_id.map(str::to_string),
            category: Some(category),
            reason: Some(reason.into()),
            ..Self::new("redirect.rejected", true)
        }
    }

    /// An authorization code was issued
    #[must_use]
    pub fn code_issued(client_id: &str, email: &str, lineage_id: &str) -> Self {
        Self {
            client_id: Some(client_id.to_string()),
            user_hash: Some(anonymize_email(email)),
            lineage_id: Some(lineage_id.to_string()),
            ..Self::new("code.issued", false)
        }
    }

    /// A token pair was issued from a code
    #[must_use]
    pub fn token_issued(client_id: &str, email: &str, lineage_id: &str) -> Self {
        Self {
            client_id: Some(client_id.to_string()),
            user_hash: Some(anonymize_email(email)),
            lineage_id: Some(lineage_id.to_string()),
            ..Self::new("token.issued", false)
        }
    }

    /// A refresh token was rotated
    #[must_use]
    pub fn token_refreshed(client_id: &str, email: &str, lineage_id: &str) -> Self {
        Self {
            client_id: Some(client_id.to_string()),
            user_hash: Some(anonymize_email(email)),
            lineage_id: Some(lineage_id.to_string()),
            ..Self::new("token.refreshed", false)
        }
    }

    /// A consumed code or rotated refresh token was presented again
    #[must_use]
    pub fn replay_detected(kind: &'static str, lineage_id: &str) -> Self {
        Self {
            lineage_id: Some(lineage_id.to_string()),
            category: Some(kind),
            reason: Some(format!("{kind} reused; lineage revoked")),
            ..Self::new("replay.detected", true)
        }
    }

    /// A single token was revoked
    #[must_use]
    pub fn token_revoked(client_id: &str, lineage_id: &str) -> Self {
        Self {
            client_id: Some(client_id.to_string()),
            lineage_id: Some(lineage_id.to_string()),
            ..Self::new("token.revoked", false)
        }
    }

    /// A whole lineage was revoked
    #[must_use]
    pub fn lineage_revoked(lineage_id: &str, reason: impl Into<String>) -> Self {
        Self {
            lineage_id: Some(lineage_id.to_string()),
            reason: Some(reason.into()),
            ..Self::new("lineage.revoked", false)
        }
    }

    /// A caller exceeded a limit
    #[must_use]
    pub fn rate_limited(operation: &'static str, client_ip: &str) -> Self {
        Self {
            client_ip: Some(client_ip.to_string()),
            category: Some(operation),
            ..Self::new("rate_limited", true)
        }
    }

    /// Whether this event records a security violation
    #[must_use]
    pub fn is_violation(&self) -> bool {
        self.violation
    }
}

/// Emit an audit event; violations are logged at `warn`.
pub fn emit(event: &AuditEvent) {
    match serde_json::to_string(event) {
        Ok(ref json) if event.is_violation() => tracing::warn!(audit = %json, "oauth audit"),
        Ok(ref json) => tracing::info!(audit = %json, "oauth audit"),
        Err(ref e) => tracing::warn!(error = %e, "Failed to serialize audit event"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_identity_is_hashed() {
        // GIVEN: an issued-token event
        let event = AuditEvent::token_issued("client-1", "jane@example.com", "lin-1");

        // WHEN: serialized
        let json = serde_json::to_string(&event).unwrap();

        // THEN: the e-mail never appears, its hash does
        assert!(!json.contains("jane@example.com"));
        assert!(json.contains("\"user_hash\":\"user:"));
        assert!(!event.is_violation());
    }

    #[test]
    fn replay_is_a_violation() {
        let event = AuditEvent::replay_detected("authorization_code", "lin-9");
        assert!(event.is_violation());
        assert_eq!(event.event, "replay.detected");
        assert_eq!(event.lineage_id.as_deref(), Some("lin-9"));
    }

    #[test]
    fn empty_fields_are_skipped() {
        let json = serde_json::to_string(&AuditEvent::rate_limited("register", "203.0.113.7")).unwrap();
        assert!(!json.contains("user_hash"));
        assert!(!json.contains("violation"));
        assert!(json.contains("\"category\":\"register\""));
    }
}
