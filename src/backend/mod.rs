//! Backend capability, registration and decorators.
//!
//! The engine never speaks a provider protocol itself. Each backend is an
//! opaque [`Backend`] supplied by an integration layer ("send prompt, get
//! text or error"); the engine measures only latency and success.

pub mod registry;
pub mod retry;
pub mod simulated;
pub mod traits;

pub use registry::{BackendProfile, BackendRegistry, BackendSlot, InFlightGuard};
pub use retry::{RetryConfig, RetryingBackend};
pub use simulated::SimulatedBackend;
pub use traits::Backend;
