//! CI platform configuration: loaded from environment variables.

use std::time::Duration;

#[derive(Clone, Debug)]
pub struct CiConfig {
    /// GitHub webhook secret for HMAC validation.
    pub github_webhook_secret: String,
    /// Probability that a simulated build passes, in `0.0..=1.0`.
    pub success_rate: f64,
    /// Multiplier applied to every simulated step duration.
    pub step_delay_scale: f64,
    /// Hard upper bound on a single pipeline step.
    pub step_timeout_secs: u64,
    /// How long shutdown waits for running pipelines to stop.
    pub shutdown_grace_secs: u64,
    /// Origin allowed by CORS for the dashboard front-end.
    pub frontend_url: String,
}

impl Default for CiConfig {
    fn default() -> Self {
        Self {
            github_webhook_secret: String::new(),
            success_rate: 0.8,
            step_delay_scale: 1.0,
            step_timeout_secs: 300,
            shutdown_grace_secs: 10,
            frontend_url: "http://localhost:3000".to_string(),
        }
    }
}

impl CiConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let github_webhook_secret = std::env::var("CI_WEBHOOK_SECRET").unwrap_or_default();
        let success_rate = std::env::var("CI_SUCCESS_RATE")
            .ok()
            .and_then(|s| s.parse::<f64>().ok())
            .filter(|r| (0.0..=1.0).contains(r))
            .unwrap_or(defaults.success_rate);
        let step_delay_scale = std::env::var("CI_STEP_DELAY_SCALE")
            .ok()
            .and_then(|s| s.parse::<f64>().ok())
            .filter(|s| s.is_finite() && *s >= 0.0)
            .unwrap_or(defaults.step_delay_scale);
        let step_timeout_secs = std::env::var("CI_STEP_TIMEOUT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.step_timeout_secs);
        let shutdown_grace_secs = std::env::var("CI_SHUTDOWN_GRACE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.shutdown_grace_secs);
        let frontend_url = std::env::var("CI_FRONTEND_URL").unwrap_or(defaults.frontend_url);

        if github_webhook_secret.is_empty() {
            tracing::warn!("CI_WEBHOOK_SECRET not set -- webhook signature validation disabled");
        }

        Self {
            github_webhook_secret,
            success_rate,
            step_delay_scale,
            step_timeout_secs,
            shutdown_grace_secs,
            frontend_url,
        }
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}
