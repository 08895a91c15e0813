//! Explicit per-call context.
//!
//! Carries the namespace a call is scoped to, the lease that owns resources
//! created by the call, and an optional deadline for slow plugin invocations.

use std::future::Future;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Maximum identifier length (namespaces, manager and network names).
pub const MAX_IDENTIFIER_LEN: usize = 76;

#[derive(Debug, Clone, Default)]
pub struct Context {
    namespace: Option<String>,
    lease: Option<String>,
    deadline: Option<Instant>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context scoped to a namespace.
    pub fn with_namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            ..Default::default()
        }
    }

    pub fn lease(mut self, lease: impl Into<String>) -> Self {
        self.lease = Some(lease.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn lease_id(&self) -> Option<&str> {
        self.lease.as_deref()
    }

    /// Time left until the deadline, `None` without a deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Runs `fut` bounded by the deadline, if any.
    pub async fn bounded<F: Future>(&self, what: &str, fut: F) -> Result<F::Output> {
        match self.remaining() {
            Some(left) => tokio::time::timeout(left, fut)
                .await
                .map_err(|_| Error::DeadlineExceeded(format!("{what}: deadline exceeded"))),
            None => Ok(fut.await),
        }
    }

    /// Checks that the namespace and lease, where set, are well-formed
    /// identifiers.
    pub fn validate(&self) -> Result<()> {
        if let Some(ns) = &self.namespace {
            validate_identifier("namespace", ns)?;
        }
        if let Some(lease) = &self.lease {
            validate_identifier("lease", lease)?;
        }
        Ok(())
    }

    /// Fails once the deadline has passed.
    pub fn check_deadline(&self) -> Result<()> {
        if self.remaining().is_some_and(|left| left.is_zero()) {
            return Err(Error::DeadlineExceeded("deadline exceeded".to_string()));
        }
        Ok(())
    }

    /// Returns the namespace or fails. Never falls back to a default.
    pub fn namespace_required(&self) -> Result<&str> {
        let ns = self
            .namespace
            .as_deref()
            .ok_or_else(|| Error::InvalidArgument("namespace is required".to_string()))?;
        validate_identifier("namespace", ns)?;
        Ok(ns)
    }
}

/// Validates namespace, manager and network names.
pub fn validate_identifier(what: &str, s: &str) -> Result<()> {
    if s.is_empty() {
        return Err(Error::InvalidArgument(format!("{what} must not be empty")));
    }
    if s.len() > MAX_IDENTIFIER_LEN {
        return Err(Error::InvalidArgument(format!(
            "{what} {s:?} exceeds {MAX_IDENTIFIER_LEN} characters"
        )));
    }

    let mut chars = s.chars();
    let first_ok = chars.next().is_some_and(|c| c.is_ascii_alphanumeric());
    let rest_ok = chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if !first_ok || !rest_ok {
        return Err(Error::InvalidArgument(format!(
            "{what} {s:?} must match [A-Za-z0-9][A-Za-z0-9._-]*"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_namespace_required() {
        assert_eq!(
            Context::new().namespace_required().unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
        assert_eq!(
            Context::with_namespace("").namespace_required().unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
        assert_eq!(
            Context::with_namespace("k8s.io").namespace_required().unwrap(),
            "k8s.io"
        );
    }

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("network", "web").is_ok());
        assert!(validate_identifier("network", "web-01_a.b").is_ok());
        assert!(validate_identifier("network", "-web").is_err());
        assert!(validate_identifier("network", "a/b").is_err());
        assert!(validate_identifier("network", "web net").is_err());
        assert!(validate_identifier("network", &"a".repeat(77)).is_err());
        assert!(validate_identifier("network", &"a".repeat(76)).is_ok());
    }

    #[test]
    fn test_validate_lease_and_namespace() {
        assert!(Context::new().validate().is_ok());
        assert!(Context::with_namespace("ns1").lease("lease-a").validate().is_ok());

        for ctx in [
            Context::with_namespace("ns1").lease(""),
            Context::with_namespace("ns1").lease("lé"),
            Context::with_namespace("ns1").lease("a/b"),
            Context::with_namespace("a/b"),
            Context::with_namespace("nämespace"),
        ] {
            assert_eq!(
                ctx.validate().unwrap_err().kind(),
                ErrorKind::InvalidArgument,
                "{ctx:?}"
            );
        }
    }

    #[test]
    fn test_check_deadline() {
        assert!(Context::new().check_deadline().is_ok());
        assert!(
            Context::new()
                .timeout(Duration::from_secs(60))
                .check_deadline()
                .is_ok()
        );
        let err = Context::new()
            .deadline(Instant::now())
            .check_deadline()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeadlineExceeded);
    }

    #[tokio::test]
    async fn test_bounded() {
        let ctx = Context::with_namespace("default").timeout(Duration::from_millis(10));
        let err = ctx
            .bounded("sleep", tokio::time::sleep(Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeadlineExceeded);

        let ok = Context::new().bounded("noop", async { 7 }).await.unwrap();
        assert_eq!(ok, 7);
    }

    #[test]
    fn test_remaining_saturates() {
        let ctx = Context::with_namespace("default").deadline(Instant::now());
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(ctx.remaining(), Some(Duration::ZERO));
        assert_eq!(Context::new().remaining(), None);
    }
}
