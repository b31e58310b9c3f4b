use async_trait::async_trait;
use std::time::Duration;

/// Optional follow-up check run against a domain after its certificate
/// probe, e.g. fetching the site over HTTPS to record the status code.
#[async_trait]
pub trait SecondaryCheck: Send + Sync {
    /// Returns the observed HTTP status, or `None` when the request failed.
    async fn check(&self, hostname: &str) -> Option<u16>;
}

/// Fetches `https://{hostname}/` and reports the response status.
/// Certificate errors are ignored; this check is about reachability,
/// not trust.
pub struct HttpStatusCheck {
    client: reqwest::Client,
}

impl HttpStatusCheck {
    pub fn new(timeout_secs: u64) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .danger_accept_invalid_certs(true)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl SecondaryCheck for HttpStatusCheck {
    async fn check(&self, hostname: &str) -> Option<u16> {
        let url = format!("https://{hostname}/");
        match self.client.get(&url).send().await {
            Ok(resp) => Some(resp.status().as_u16()),
            Err(e) => {
                tracing::debug!(domain = %hostname, error = %e, "HTTP check failed");
                None
            }
        }
    }
}
