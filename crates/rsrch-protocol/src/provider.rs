//! External collaborator seams named in spec.md §6 that don't belong to any
//! one pipeline stage: auth verification and notification delivery.

use async_trait::async_trait;

/// Result of verifying an inbound request (spec.md §6).
#[derive(Debug, Clone)]
pub struct AuthOutcome {
    pub valid: bool,
    pub error: Option<String>,
}

/// Pluggable auth verifier. Authentication itself is out of scope for this
/// engine (spec.md §1) — the seam exists so a caller can wire one in;
/// `NoopAuthVerifier` is the default that always succeeds.
#[async_trait]
pub trait AuthVerifier: Send + Sync {
    async fn verify(&self, bearer_token: Option<&str>) -> AuthOutcome;
}

/// Always-valid verifier used when no auth policy is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAuthVerifier;

#[async_trait]
impl AuthVerifier for NoopAuthVerifier {
    async fn verify(&self, _bearer_token: Option<&str>) -> AuthOutcome {
        AuthOutcome {
            valid: true,
            error: None,
        }
    }
}

/// A notification to be delivered asynchronously and lossily (spec.md §6,
/// §4.H credit/quota classification).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationMessage {
    pub task_id: Option<String>,
    pub subject: String,
    pub body: String,
}

/// Pluggable notification sink (webhook/email/push — spec.md §1 names the
/// transports as out of scope; this is just the seam).
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send_async(&self, message: NotificationMessage);
}

/// Sink that drops every message, logging at debug level. Used when no
/// sink is configured — matches spec.md's "non-blocking, lossy under
/// failure" characterization taken to its logical limit.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullNotificationSink;

#[async_trait]
impl NotificationSink for NullNotificationSink {
    async fn send_async(&self, message: NotificationMessage) {
        tracing::debug!(subject = %message.subject, "dropping notification: no sink configured");
    }
}
