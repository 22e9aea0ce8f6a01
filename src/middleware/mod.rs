//! Request admission stage and its responses.

mod response;
mod service;

pub use response::{
    dispatch, Dispatch, RejectionResponse, StatusResponse, STATUS_INTERNAL_SERVER_ERROR,
    STATUS_TOO_MANY_REQUESTS,
};
pub use service::{Admission, AdmissionOutcome, AdmissionService};
