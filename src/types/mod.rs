//! Public types for the Orchesity API.

mod backend;
mod policy;
mod request;
mod response;

pub use backend::{BackendId, BackendReply, Usage};
pub use policy::SelectionPolicy;
pub use request::{GenerationParams, OrchestrationRequest};
pub use response::{
    BackendFailure, BackendResult, DispatchStatus, ErrorKind, OrchestrationResponse, ResultSource,
};
