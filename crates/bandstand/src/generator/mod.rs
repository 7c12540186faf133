//! Async client for the external music-generation service.
//!
//! Uses the submit + long-poll pattern: `POST /generate` returns
//! immediately with a job id (or a pre-completed cache hit), then
//! `GET /jobs/{id}/wait?timeout=N` long-polls until the job finishes.
//! Jobs survive poll timeouts: the work continues server-side and the
//! next poll picks up the result.
//!
//! Every call is gated by a counting semaphore (`max_concurrent`) and a
//! consecutive-failure circuit breaker. One client instance is shared
//! process-wide so the connection pool is reused across requests.

pub mod adapter;
pub mod breaker;

use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use bandconf::GeneratorSettings;
use bandproto::generator::{
    GeneratorResult, JobStatus, JobWaitResponse, SubmitRequest, SubmitResponse,
};

use adapter::flatten_job_result;
use breaker::CircuitBreaker;

/// Wire error kind reported while the circuit breaker is open. Clients
/// must not retry in-session when they see this.
pub const CIRCUIT_OPEN_ERROR: &str = "orpheus_circuit_open";

pub struct GeneratorClient {
    base_url: String,
    http: reqwest::Client,
    semaphore: tokio::sync::Semaphore,
    max_concurrent: usize,
    breaker: Mutex<CircuitBreaker>,
    settings: GeneratorSettings,
}

impl GeneratorClient {
    pub fn new(settings: GeneratorSettings) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            http,
            semaphore: tokio::sync::Semaphore::new(settings.max_concurrent.max(1)),
            max_concurrent: settings.max_concurrent.max(1),
            breaker: Mutex::new(CircuitBreaker::new(
                settings.cb_threshold,
                Duration::from_secs(settings.cb_cooldown_secs),
            )),
            settings,
        }
    }

    /// True when the circuit breaker is tripped (the service is down).
    pub fn circuit_open(&self) -> bool {
        self.breaker.lock().map(|cb| cb.is_open()).unwrap_or(false)
    }

    fn record_failure(&self) {
        if let Ok(mut cb) = self.breaker.lock() {
            cb.record_failure();
        }
    }

    fn record_success(&self) {
        if let Ok(mut cb) = self.breaker.lock() {
            cb.record_success();
        }
    }

    /// Pre-establish the keep-alive connection during startup.
    ///
    /// Failure is logged but non-fatal: the service may still be
    /// starting, and generation requests retry on their own.
    pub async fn warmup(&self) {
        if self.health_check().await {
            info!("generator connection warmed up");
        } else {
            warn!("generator warmup failed; service may not be running yet");
        }
    }

    /// Probe `GET /health` with a short timeout independent of the
    /// generation timeout.
    pub async fn health_check(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        match self
            .http
            .get(&url)
            .timeout(Duration::from_secs(3))
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                warn!(error = %e, "generator health check failed");
                false
            }
        }
    }

    /// Generate MIDI for one request. Errors are reported in-band via
    /// `GeneratorResult { success: false, error }` so callers see the
    /// same shape for every outcome.
    pub async fn generate(&self, request: SubmitRequest) -> GeneratorResult {
        if self.circuit_open() {
            return GeneratorResult::failure(CIRCUIT_OPEN_ERROR, 0);
        }

        if self.semaphore.available_permits() == 0 {
            info!(
                slots = self.max_concurrent,
                instruments = ?request.instruments,
                "all generator slots in use, request queued"
            );
        }
        let queue_start = Instant::now();
        let _permit = match self.semaphore.acquire().await {
            Ok(permit) => permit,
            Err(_) => return GeneratorResult::failure("generator client shut down", 0),
        };
        let queued = queue_start.elapsed();
        if queued > Duration::from_millis(100) {
            info!(
                waited_secs = queued.as_secs_f64(),
                "generator slot acquired after queue wait"
            );
        }

        let generate_start = Instant::now();

        // ── Submit phase ──
        let delays = &self.settings.submit_retry_delays_secs;
        let max_retries = delays.len().max(1);
        let mut job_id: Option<String> = None;

        for attempt in 0..max_retries {
            let url = format!("{}/generate", self.base_url);
            let response = self
                .http
                .post(&url)
                .json(&request)
                .timeout(Duration::from_secs(10))
                .send()
                .await;

            match response {
                Err(e) if e.is_timeout() || e.is_connect() => {
                    if attempt < max_retries - 1 {
                        let delay = delays[attempt];
                        warn!(
                            attempt = attempt + 1,
                            delay_secs = delay,
                            error = %e,
                            "transient generator submit error, retrying"
                        );
                        tokio::time::sleep(Duration::from_secs(delay)).await;
                        continue;
                    }
                    self.record_failure();
                    return GeneratorResult::failure(
                        format!("generator submit failed: {e}"),
                        attempt as u32 + 1,
                    );
                }
                Err(e) => {
                    self.record_failure();
                    error!(error = %e, "generator submit error");
                    return GeneratorResult::failure(e.to_string(), attempt as u32);
                }
                Ok(resp) if resp.status() == reqwest::StatusCode::SERVICE_UNAVAILABLE => {
                    if attempt < max_retries - 1 {
                        let delay = delays[attempt];
                        warn!(delay_secs = delay, "generator queue full (503), retrying");
                        tokio::time::sleep(Duration::from_secs(delay)).await;
                        continue;
                    }
                    self.record_failure();
                    return GeneratorResult::failure(
                        "generator queue full",
                        attempt as u32 + 1,
                    );
                }
                Ok(resp) if !resp.status().is_success() => {
                    self.record_failure();
                    return GeneratorResult::failure(
                        format!("generator submit returned {}", resp.status()),
                        attempt as u32,
                    );
                }
                Ok(resp) => {
                    let submit: SubmitResponse = match resp.json().await {
                        Ok(body) => body,
                        Err(e) => {
                            self.record_failure();
                            return GeneratorResult::failure(
                                format!("invalid submit response: {e}"),
                                attempt as u32,
                            );
                        }
                    };

                    // Cache hit fast path: no poll slot used.
                    if submit.status == JobStatus::Complete {
                        let raw = submit.result.unwrap_or_default();
                        self.record_success();
                        info!(
                            elapsed_secs = generate_start.elapsed().as_secs_f64(),
                            instruments = ?request.instruments,
                            "generator cache hit"
                        );
                        return flatten_job_result(raw, attempt as u32);
                    }

                    match submit.job_id {
                        Some(id) => {
                            debug!(
                                job.id = %id,
                                position = ?submit.position,
                                "generation job submitted"
                            );
                            job_id = Some(id);
                        }
                        None => {
                            self.record_failure();
                            return GeneratorResult::failure(
                                "no jobId in generator submit response",
                                attempt as u32,
                            );
                        }
                    }
                    break;
                }
            }
        }

        let job_id = match job_id {
            Some(id) => id,
            None => {
                self.record_failure();
                return GeneratorResult::failure(
                    "failed to submit job after retries",
                    max_retries as u32,
                );
            }
        };

        // ── Poll phase ──
        let poll_timeout = self.settings.poll_timeout_secs;
        let max_polls = self.settings.poll_max_attempts.max(1);

        for poll_num in 0..max_polls {
            let url = format!("{}/jobs/{}/wait", self.base_url, job_id);
            let response = self
                .http
                .get(&url)
                .query(&[("timeout", poll_timeout)])
                .timeout(Duration::from_secs(poll_timeout + 5))
                .send()
                .await;

            match response {
                Err(e) if e.is_timeout() => {
                    // Not a failure: the job keeps running server-side.
                    debug!(
                        job.id = %job_id,
                        poll = poll_num + 1,
                        "poll timeout, job still running"
                    );
                }
                Err(e) if e.is_connect() => {
                    self.record_failure();
                    warn!(job.id = %job_id, error = %e, "connection lost while polling");
                    return GeneratorResult::failure(
                        "generator connection lost during polling",
                        0,
                    );
                }
                Err(e) => {
                    warn!(job.id = %job_id, error = %e, "poll error");
                }
                Ok(resp) => {
                    let wait: JobWaitResponse = match resp.json().await {
                        Ok(body) => body,
                        Err(e) => {
                            warn!(job.id = %job_id, error = %e, "invalid poll response");
                            continue;
                        }
                    };
                    match wait.status {
                        JobStatus::Complete | JobStatus::Failed => {
                            let raw = wait.result.unwrap_or_default();
                            let error_text = raw
                                .error
                                .clone()
                                .or(wait.error)
                                .unwrap_or_else(|| "Generation failed".to_string());
                            if wait.status == JobStatus::Failed || !raw.success {
                                self.record_failure();
                                error!(
                                    job.id = %job_id,
                                    elapsed_secs = generate_start.elapsed().as_secs_f64(),
                                    error = %error_text,
                                    "generation job failed"
                                );
                                return GeneratorResult::failure(error_text, 0);
                            }
                            self.record_success();
                            info!(
                                job.id = %job_id,
                                elapsed_secs = generate_start.elapsed().as_secs_f64(),
                                poll = poll_num + 1,
                                "generation job complete"
                            );
                            return flatten_job_result(raw, 0);
                        }
                        JobStatus::Queued | JobStatus::Running => {
                            debug!(
                                job.id = %job_id,
                                status = ?wait.status,
                                poll = poll_num + 1,
                                "job still pending"
                            );
                        }
                    }
                }
            }
        }

        self.record_failure();
        let budget = poll_timeout * max_polls as u64;
        error!(job.id = %job_id, budget_secs = budget, "generation did not complete in time");
        GeneratorResult::failure(
            format!("Generation did not complete within {budget}s"),
            0,
        )
    }
}

// ── Process-wide singleton ──

static SHARED_CLIENT: OnceLock<Arc<GeneratorClient>> = OnceLock::new();

/// Initialise (or fetch) the process-wide client.
pub fn shared_client(settings: &GeneratorSettings) -> Arc<GeneratorClient> {
    SHARED_CLIENT
        .get_or_init(|| Arc::new(GeneratorClient::new(settings.clone())))
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_circuit_fails_fast_without_io() {
        let settings = GeneratorSettings {
            base_url: "http://127.0.0.1:1".to_string(),
            cb_threshold: 1,
            ..Default::default()
        };
        let client = GeneratorClient::new(settings);
        client.record_failure();
        assert!(client.circuit_open());

        let start = Instant::now();
        let result = client.generate(SubmitRequest::default()).await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some(CIRCUIT_OPEN_ERROR));
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let settings = GeneratorSettings {
            base_url: "http://gen.local:2000/".to_string(),
            ..Default::default()
        };
        let client = GeneratorClient::new(settings);
        assert_eq!(client.base_url, "http://gen.local:2000");
    }
}
