//! A stand-in backend with configurable latency and failure rate.
//!
//! Useful for exercising routing without provider credentials; the CLI
//! builds its backends from these.

use std::time::Duration;

use async_trait::async_trait;

use super::traits::Backend;
use crate::types::{BackendId, BackendReply, GenerationParams, Usage};
use crate::{OrchesityError, Result};

/// Backend that sleeps for `latency`, then answers or fails at random.
#[derive(Debug, Clone)]
pub struct SimulatedBackend {
    id: BackendId,
    latency: Duration,
    failure_rate: f64,
    cost: Option<f64>,
}

impl SimulatedBackend {
    /// 100ms latency, never fails.
    pub fn new(id: impl Into<BackendId>) -> Self {
        Self {
            id: id.into(),
            latency: Duration::from_millis(100),
            failure_rate: 0.0,
            cost: None,
        }
    }

    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Probability in `[0, 1]` that a call fails.
    pub fn failure_rate(mut self, rate: f64) -> Self {
        self.failure_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Fixed cost reported with every reply.
    pub fn cost(mut self, cost: f64) -> Self {
        self.cost = Some(cost);
        self
    }

    /// Parse `name[:latency_ms[:failure_rate]]`, e.g. `"openai/gpt-4:120:0.1"`.
    pub fn parse(spec: &str) -> Result<Self> {
        let mut parts = spec.split(':');
        let name = parts
            .next()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| OrchesityError::InvalidInput(format!("empty backend spec: {spec}")))?;
        let mut backend = Self::new(name);
        if let Some(ms) = parts.next() {
            let ms: u64 = ms
                .parse()
                .map_err(|e| OrchesityError::InvalidInput(format!("bad latency in {spec}: {e}")))?;
            backend = backend.latency(Duration::from_millis(ms));
        }
        if let Some(rate) = parts.next() {
            let rate: f64 = rate.parse().map_err(|e| {
                OrchesityError::InvalidInput(format!("bad failure rate in {spec}: {e}"))
            })?;
            backend = backend.failure_rate(rate);
        }
        Ok(backend)
    }
}

#[async_trait]
impl Backend for SimulatedBackend {
    fn id(&self) -> &BackendId {
        &self.id
    }

    async fn invoke(
        &self,
        prompt: &str,
        _params: &GenerationParams,
        _deadline: Duration,
    ) -> Result<BackendReply> {
        let fails = self.failure_rate > 0.0 && rand::random::<f64>() < self.failure_rate;
        tokio::time::sleep(self.latency).await;
        if fails {
            return Err(OrchesityError::Backend {
                backend: self.id.clone(),
                message: "simulated failure".into(),
            });
        }
        let excerpt: String = prompt.chars().take(50).collect();
        let text = format!("[{}] Response to: {excerpt}...", self.id);
        let mut reply = BackendReply::text(text.clone()).usage(Usage::estimate(prompt, &text));
        if let Some(cost) = self.cost {
            reply = reply.cost(cost);
        }
        Ok(reply)
    }
}
