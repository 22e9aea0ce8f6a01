//! Responses produced when a request is not admitted.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AdmissionError;
use crate::ratelimit::Verdict;

pub const STATUS_TOO_MANY_REQUESTS: u16 = 429;
pub const STATUS_INTERNAL_SERVER_ERROR: u16 = 500;

/// JSON body `{"status":..,"message":..,"timestamp":..}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: u16,
    pub message: String,
    /// RFC 3339 UTC timestamp
    pub timestamp: String,
}

impl StatusResponse {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self::at(status, message, Utc::now())
    }

    pub fn at(status: u16, message: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            status,
            message: message.into(),
            timestamp: at.to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }
}

/// A response returned in place of the protected handler.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RejectionResponse {
    pub status: u16,
    pub body: StatusResponse,
    /// Whole seconds for the `Retry-After` header
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    /// Limiter that refused the request
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limiter: Option<String>,
}

impl RejectionResponse {
    /// 429 response for a rejecting verdict.
    pub fn too_many_requests(verdict: &Verdict) -> Self {
        Self {
            status: STATUS_TOO_MANY_REQUESTS,
            body: StatusResponse::new(STATUS_TOO_MANY_REQUESTS, verdict.reason.clone()),
            retry_after: verdict.retry_after_secs(),
            limiter: verdict.limiter.clone(),
        }
    }

    /// 500 response for a limiter failure under a fail-closed policy.
    pub fn internal_error(err: &AdmissionError) -> Self {
        Self {
            status: STATUS_INTERNAL_SERVER_ERROR,
            body: StatusResponse::new(
                STATUS_INTERNAL_SERVER_ERROR,
                format!("Unable to evaluate rate limits: {}", err),
            ),
            retry_after: None,
            limiter: None,
        }
    }

    /// Serialized response body.
    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.body).unwrap_or_else(|_| {
            format!(r#"{{"status":{},"message":"","timestamp":""}}"#, self.status)
        })
    }

    /// Headers to send with the body.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![("Content-Type", "application/json".to_string())];
        if let Some(secs) = self.retry_after {
            headers.push(("Retry-After", secs.to_string()));
        }
        headers
    }
}

/// What the surrounding server should do with a verdict.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    PassThrough,
    Reject(RejectionResponse),
}

/// Map a verdict to a pass-through or a 429 response.
pub fn dispatch(verdict: &Verdict) -> Dispatch {
    if verdict.admitted {
        Dispatch::PassThrough
    } else {
        Dispatch::Reject(RejectionResponse::too_many_requests(verdict))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::Rejection;
    use chrono::TimeZone;
    use std::time::Duration;

    fn rejected(retry_after: Option<Duration>) -> Verdict {
        Verdict::reject(
            "fixed",
            Rejection::new(
                "Rate limit exceeded. You can only make 5 requests in 60 seconds.",
                retry_after,
            ),
        )
    }

    #[test]
    fn test_admitted_passes_through() {
        assert_eq!(dispatch(&Verdict::admit()), Dispatch::PassThrough);
    }

    #[test]
    fn test_rejection_carries_status_and_retry_after() {
        let Dispatch::Reject(response) = dispatch(&rejected(Some(Duration::from_millis(40_200))))
        else {
            panic!("expected rejection");
        };
        assert_eq!(response.status, 429);
        assert_eq!(response.body.status, 429);
        assert_eq!(response.retry_after, Some(41));
        assert_eq!(response.limiter.as_deref(), Some("fixed"));
        assert!(response
            .headers()
            .contains(&("Retry-After", "41".to_string())));

        let body: serde_json::Value = serde_json::from_str(&response.to_json()).unwrap();
        assert_eq!(body["status"], 429);
        assert_eq!(
            body["message"],
            "Rate limit exceeded. You can only make 5 requests in 60 seconds."
        );
        assert!(body["timestamp"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn test_rejection_without_hint_omits_header() {
        let response = RejectionResponse::too_many_requests(&rejected(None));
        assert_eq!(response.retry_after, None);
        assert_eq!(
            response.headers(),
            vec![("Content-Type", "application/json".to_string())]
        );
    }

    #[test]
    fn test_internal_error_response() {
        let err = AdmissionError::Unavailable("store offline".to_string());
        let response = RejectionResponse::internal_error(&err);
        assert_eq!(response.status, 500);
        assert!(response.body.message.contains("store offline"));
    }

    #[test]
    fn test_timestamp_format() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap();
        let body = StatusResponse::at(200, "Welcome", at);
        assert_eq!(body.timestamp, "2024-05-01T12:30:00.000Z");
    }
}
