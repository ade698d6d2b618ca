use tokio_util::sync::CancellationToken;

use super::supervisor::QueueRuntime;

/// Builder for constructing a [`QueueRuntime`].
///
/// Every field has a sensible default; the builder exists so hosts can pin
/// the host identity (which keys subscriber identifiers) and hand in an
/// externally owned app-stop token.
#[derive(Debug, Default)]
pub struct QueueRuntimeBuilder {
    host_identity: Option<String>,
    shutdown: Option<CancellationToken>,
}

impl QueueRuntimeBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the host identity used to derive subscriber identifiers.
    ///
    /// Must be stable across restarts for subscribers to resume their
    /// streams; defaults to the `HOSTNAME` environment variable, falling
    /// back to `"localhost"`.
    pub fn with_host_identity(mut self, host_identity: impl Into<String>) -> Self {
        self.host_identity = Some(host_identity.into());
        self
    }

    /// Use an externally owned shutdown token instead of a fresh one.
    pub fn with_shutdown_token(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Build the runtime.
    pub fn build(self) -> QueueRuntime {
        let host_identity = self.host_identity.unwrap_or_else(default_host_identity);
        let shutdown = self.shutdown.unwrap_or_default();
        QueueRuntime::new(host_identity, shutdown)
    }
}

fn default_host_identity() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let runtime = QueueRuntimeBuilder::new().build();
        assert!(!runtime.host_identity().is_empty());
        assert!(!runtime.shutdown_token().is_cancelled());
    }

    #[test]
    fn test_builder_overrides() {
        let token = CancellationToken::new();
        let runtime = QueueRuntimeBuilder::new()
            .with_host_identity("worker-7")
            .with_shutdown_token(token.clone())
            .build();

        assert_eq!(runtime.host_identity(), "worker-7");
        token.cancel();
        assert!(runtime.shutdown_token().is_cancelled());
    }
}
