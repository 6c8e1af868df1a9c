//! Downstream "new trip uploaded" notifications.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::NotificationConfig;
use crate::error::{CollectorError, Result};

/// Body posted for every uploaded object
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadNotice {
    pub object_location: String,
    pub upload_date: String,
}

impl UploadNotice {
    /// Notice for `key` stamped with the current UTC time
    pub fn now(key: &str) -> Self {
        Self {
            object_location: key.to_string(),
            upload_date: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Delivers one notice and reports the HTTP status
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notice: &UploadNotice) -> Result<u16>;
}

pub struct HttpNotifier {
    client: reqwest::Client,
    url: String,
    secret_header: String,
    secret: String,
}

impl HttpNotifier {
    /// # Errors
    ///
    /// Returns `Http` if the client cannot be built
    pub fn new(config: &NotificationConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            url: format!(
                "{}/{}",
                config.base_url.trim_end_matches('/'),
                config.path.trim_start_matches('/')
            ),
            secret_header: config.secret_header.clone(),
            secret: config.secret.clone(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn notify(&self, notice: &UploadNotice) -> Result<u16> {
        let response = self
            .client
            .post(&self.url)
            .header(self.secret_header.as_str(), self.secret.as_str())
            .json(notice)
            .send()
            .await?;
        Ok(response.status().as_u16())
    }
}

/// Exponential backoff between notification attempts
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub initial: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn from_config(config: &NotificationConfig) -> Self {
        Self {
            initial: Duration::from_millis(config.retry_initial_ms),
            multiplier: config.retry_multiplier,
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
            max_attempts: config.retry_max_attempts,
        }
    }

    /// Wait after failed attempt number `attempt` (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.initial.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::try_from_secs_f64(secs)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&NotificationConfig::default())
    }
}

/// Deliver `notice` until the endpoint answers 200
///
/// Returns the number of attempts used.
///
/// # Errors
///
/// - `NotificationExhausted` once the policy's attempt cap is reached
/// - `NotificationUnreachable` if `running` is cleared before delivery
pub async fn deliver(
    notifier: &dyn Notifier,
    notice: &UploadNotice,
    policy: &RetryPolicy,
    running: &AtomicBool,
) -> Result<u32> {
    let mut attempt = 0;

    loop {
        attempt += 1;

        match notifier.notify(notice).await {
            Ok(200) => {
                info!("Notified upload of {} (attempt {})", notice.object_location, attempt);
                return Ok(attempt);
            }
            Ok(status) => {
                warn!("Notification for {} answered {}", notice.object_location, status);
            }
            Err(e) => {
                warn!("Notification for {} failed: {}", notice.object_location, e);
            }
        }

        if attempt >= policy.max_attempts {
            return Err(CollectorError::NotificationExhausted {
                key: notice.object_location.clone(),
                attempts: attempt,
            });
        }

        if !running.load(Ordering::SeqCst) {
            return Err(CollectorError::NotificationUnreachable(format!(
                "{} cancelled after {} attempts",
                notice.object_location, attempt
            )));
        }

        let delay = policy.delay(attempt);
        debug!("Retrying notification in {:?}", delay);
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            initial: Duration::from_millis(1),
            multiplier: 2.0,
            max_delay: Duration::from_millis(4),
            max_attempts,
        }
    }

    #[test]
    fn test_notice_serializes_camel_case() {
        let notice = UploadNotice {
            object_location: "trips/pi-01/a.csv".to_string(),
            upload_date: "2024-01-01T12:00:00+00:00".to_string(),
        };
        let json = serde_json::to_value(&notice).unwrap();
        assert_eq!(json["objectLocation"], "trips/pi-01/a.csv");
        assert_eq!(json["uploadDate"], "2024-01-01T12:00:00+00:00");
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            initial: Duration::from_millis(2500),
            multiplier: 2.0,
            max_delay: Duration::from_secs(8),
            max_attempts: 10,
        };
        assert_eq!(policy.delay(1), Duration::from_millis(2500));
        assert_eq!(policy.delay(2), Duration::from_millis(5000));
        assert_eq!(policy.delay(3), Duration::from_secs(8));
        assert_eq!(policy.delay(9), Duration::from_secs(8));
    }

    #[test]
    fn test_backoff_large_attempts_stay_capped() {
        let config = NotificationConfig {
            retry_max_attempts: 5000,
            ..NotificationConfig::default()
        };
        let policy = RetryPolicy::from_config(&config);
        assert_eq!(policy.delay(64), policy.max_delay);
        assert_eq!(policy.delay(1100), policy.max_delay);
        assert_eq!(policy.delay(u32::MAX), policy.max_delay);

        let steep = RetryPolicy { multiplier: 10.0, ..policy };
        assert_eq!(steep.delay(400), steep.max_delay);
    }

    #[test]
    fn test_url_join() {
        let config = NotificationConfig {
            base_url: "https://collector.local/".to_string(),
            path: "/trips".to_string(),
            ..NotificationConfig::default()
        };
        let notifier = HttpNotifier::new(&config).unwrap();
        assert_eq!(notifier.url(), "https://collector.local/trips");
    }

    #[tokio::test]
    async fn test_deliver_retries_until_200() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let mut notifier = MockNotifier::new();
        notifier.expect_notify().times(3).returning(move |_| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Ok(503)
            } else {
                Ok(200)
            }
        });

        let running = AtomicBool::new(true);
        let attempts = deliver(&notifier, &UploadNotice::now("k"), &fast_policy(10), &running)
            .await
            .unwrap();
        assert_eq!(attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_deliver_exhausts_budget() {
        let mut notifier = MockNotifier::new();
        notifier
            .expect_notify()
            .times(4)
            .returning(|_| Err(CollectorError::NotificationUnreachable("refused".to_string())));

        let running = AtomicBool::new(true);
        let result = deliver(&notifier, &UploadNotice::now("k"), &fast_policy(4), &running).await;
        assert!(matches!(
            result,
            Err(CollectorError::NotificationExhausted { attempts: 4, .. })
        ));
    }

    #[tokio::test]
    async fn test_deliver_stops_when_cancelled() {
        let mut notifier = MockNotifier::new();
        notifier.expect_notify().times(1).returning(|_| Ok(500));

        let running = AtomicBool::new(false);
        let result = deliver(&notifier, &UploadNotice::now("k"), &fast_policy(10), &running).await;
        assert!(matches!(result, Err(CollectorError::NotificationUnreachable(_))));
    }
}
