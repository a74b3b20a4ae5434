//! The backend capability trait.
//!
//! # Error Semantics
//!
//! Implementations report failure through the crate error type. The
//! dispatcher classifies what comes back:
//! - `BackendTimeout` → timeout
//! - `MalformedResponse` → malformed response
//! - anything else → backend error
//!
//! An `Ok` reply with empty text is treated as malformed as well.
//!
//! # Example
//!
//! ```ignore
//! #[async_trait]
//! impl Backend for MyProvider {
//!     fn id(&self) -> &BackendId {
//!         &self.id
//!     }
//!
//!     async fn invoke(
//!         &self,
//!         prompt: &str,
//!         params: &GenerationParams,
//!         deadline: Duration,
//!     ) -> Result<BackendReply> {
//!         let text = self.client.complete(prompt, params, deadline).await?;
//!         Ok(BackendReply::text(text))
//!     }
//! }
//! ```

use std::time::Duration;

use async_trait::async_trait;

use crate::Result;
use crate::types::{BackendId, BackendReply, GenerationParams};

/// One interchangeable downstream service (a provider + model pair).
#[async_trait]
pub trait Backend: Send + Sync {
    /// Stable identity used for metrics, ranking and cache fingerprints.
    fn id(&self) -> &BackendId;

    /// Send a prompt and wait for the reply.
    ///
    /// `deadline` is the budget this call was given. The dispatcher stops
    /// waiting once it elapses whether or not the implementation honours it.
    async fn invoke(
        &self,
        prompt: &str,
        params: &GenerationParams,
        deadline: Duration,
    ) -> Result<BackendReply>;
}

