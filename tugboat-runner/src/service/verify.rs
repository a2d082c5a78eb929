//! Endpoint verification
//!
//! Confirms the application answers on its public entry point. Success is
//! only the exact expected status; redirects are not followed, so a 301
//! from a misrouted ingress counts as a failure.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;
use tugboat_core::domain::policy::RetryPolicy;
use tugboat_core::error::VerificationError;

use crate::poller::{Check, PollError, poll_until};

/// Issues a single HTTP GET and reports the status code
#[async_trait]
pub trait HttpProbe: Send + Sync {
    /// # Returns
    /// The response status, or a description of the transport failure
    async fn status(&self, url: &str, timeout: Duration) -> Result<u16, String>;
}

/// reqwest-backed HTTP probe
pub struct ReqwestProbe {
    client: reqwest::Client,
}

impl ReqwestProbe {
    pub fn new() -> Result<Self, VerificationError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| VerificationError::Client(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpProbe for ReqwestProbe {
    async fn status(&self, url: &str, timeout: Duration) -> Result<u16, String> {
        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    format!("no response within {:?}", timeout)
                } else if e.is_connect() {
                    format!("connection failed: {}", e)
                } else {
                    e.to_string()
                }
            })?;
        Ok(response.status().as_u16())
    }
}

/// Polls an endpoint until it returns the expected status
pub struct Verifier {
    probe: Arc<dyn HttpProbe>,
    expected_status: u16,
}

impl Verifier {
    pub fn new(probe: Arc<dyn HttpProbe>, expected_status: u16) -> Self {
        Self {
            probe,
            expected_status,
        }
    }

    /// Requests `endpoint` under `policy` until it answers with the
    /// expected status
    ///
    /// # Returns
    /// The number of requests it took
    pub async fn verify_reachable(
        &self,
        endpoint: &str,
        policy: &RetryPolicy,
    ) -> Result<u32, VerificationError> {
        validate_endpoint(endpoint)?;

        info!(
            "Verifying {} returns {} (up to {} attempt(s))",
            endpoint,
            self.expected_status,
            policy.max_attempts()
        );

        let last = Mutex::new(String::from("no response"));
        let last_ref = &last;
        let probe = self.probe.as_ref();
        let expected = self.expected_status;
        let timeout = policy.per_attempt_timeout();
        let what = format!("{} to return {}", endpoint, expected);

        let result = poll_until::<std::convert::Infallible, _, _>(&what, policy, move || async move {
            let observed = match probe.status(endpoint, timeout).await {
                Ok(status) if status == expected => return Check::Ready,
                Ok(status) => format!("HTTP {}", status),
                Err(e) => e,
            };
            info!("{} answered: {}", endpoint, observed);
            *last_ref.lock().unwrap_or_else(|e| e.into_inner()) = observed;
            Check::Pending
        })
        .await;

        match result {
            Ok(attempts) => Ok(attempts),
            Err(PollError::Timeout(timeout)) => Err(VerificationError::Exhausted {
                endpoint: endpoint.to_string(),
                expected,
                attempts: timeout.attempts,
                last: last.into_inner().unwrap_or_else(|e| e.into_inner()),
            }),
            Err(PollError::Aborted { error, .. }) => match error {},
        }
    }
}

fn validate_endpoint(endpoint: &str) -> Result<(), VerificationError> {
    let url = reqwest::Url::parse(endpoint)
        .map_err(|e| VerificationError::InvalidEndpoint(format!("{}: {}", endpoint, e)))?;

    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(VerificationError::InvalidEndpoint(endpoint.to_string()));
    }
    Ok(())
}
