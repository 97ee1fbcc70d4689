use std::time::Duration;

use crate::svc::SVC_HEADER_SIZE;

/// Tunables for a [`Bridge`](super::Bridge).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Pooled egress transfer buffers.
    pub egress_slots: usize,
    /// Ingress buffers kept posted at all times. Never zero.
    pub ingress_buffers: usize,
    pub ingress_buffer_size: usize,
    pub svc_buffer_size: usize,
    /// Upper bound on a supervisory control send.
    pub svc_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl BridgeConfig {
    pub fn new() -> Self {
        Self {
            egress_slots: 8,
            ingress_buffers: 4,
            ingress_buffer_size: 4096,
            svc_buffer_size: SVC_HEADER_SIZE + 64 * 1024,
            svc_timeout: Duration::from_millis(500),
        }
    }

    /// Defaults overlaid with `GREYBUS_EGRESS_SLOTS`, `GREYBUS_INGRESS_BUFFERS`
    /// and `GREYBUS_SVC_TIMEOUT_MS`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::new();
        if let Some(n) = parse_var(&lookup, "GREYBUS_EGRESS_SLOTS") {
            config = config.with_egress_slots(n);
        }
        if let Some(n) = parse_var(&lookup, "GREYBUS_INGRESS_BUFFERS") {
            config = config.with_ingress_buffers(n);
        }
        if let Some(ms) = parse_var(&lookup, "GREYBUS_SVC_TIMEOUT_MS") {
            config = config.with_svc_timeout(Duration::from_millis(ms as u64));
        }
        config
    }

    pub fn with_egress_slots(mut self, n: usize) -> Self {
        self.egress_slots = n;
        self
    }

    pub fn with_ingress_buffers(mut self, n: usize) -> Self {
        if n == 0 {
            tracing::warn!("Ingress buffer count must be at least 1, using 1");
        }
        self.ingress_buffers = n.max(1);
        self
    }

    pub fn with_ingress_buffer_size(mut self, size: usize) -> Self {
        self.ingress_buffer_size = size;
        self
    }

    pub fn with_svc_buffer_size(mut self, size: usize) -> Self {
        self.svc_buffer_size = size;
        self
    }

    pub fn with_svc_timeout(mut self, timeout: Duration) -> Self {
        self.svc_timeout = timeout;
        self
    }
}

fn parse_var(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<usize> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(n) => Some(n),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring invalid value");
            None
        }
    }
}
