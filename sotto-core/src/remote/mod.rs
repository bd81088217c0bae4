//! Remote transcription over the upload → poll → download protocol.
//!
//! The server exposes four endpoints:
//!
//! ```text
//! GET  /health            liveness probe
//! POST /transcribe        multipart WAV upload → { "task_id": .. }
//! GET  /status/{task_id}  { "status": "processing" | "completed" | "failed" }
//! GET  /result/{task_id}  plain-text transcript
//! ```
//!
//! Health is probed across the configured endpoints in order and the first
//! healthy one becomes the active endpoint. Probe results — positive and
//! negative alike — are cached for a TTL so a hotkey press never pays for a
//! connection timeout twice in a row.
//!
//! Uploads go through a temp WAV file that is removed on every exit path via
//! an RAII guard.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::{
    audio::wav::write_pcm16_wav,
    dispatch::RemoteTranscriber,
    error::{Result, SottoError},
};

/// Remote service connection knobs.
#[derive(Debug, Clone)]
pub struct RemoteClientConfig {
    /// Candidate server base URLs, probed in order.
    pub endpoints: Vec<String>,
    /// Per-probe timeout for `/health`.
    pub health_timeout: Duration,
    /// How long a probe result (healthy or not) stays valid.
    pub health_cache_ttl: Duration,
    /// Timeout for the multipart upload request.
    pub upload_timeout: Duration,
    /// Per-request timeout for status and result calls.
    pub poll_timeout: Duration,
    /// Delay between status polls.
    pub poll_interval: Duration,
    /// Absolute ceiling on one transcription, independent of how many polls
    /// fit inside it.
    pub overall_deadline: Duration,
    /// Where temp WAV uploads are staged.
    pub temp_dir: PathBuf,
}

impl Default for RemoteClientConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            health_timeout: Duration::from_secs(3),
            health_cache_ttl: Duration::from_secs(30),
            upload_timeout: Duration::from_secs(60),
            poll_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_secs(2),
            overall_deadline: Duration::from_secs(300),
            temp_dir: std::env::temp_dir(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    task_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum TaskStatus {
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: TaskStatus,
    error: Option<String>,
}

struct HealthCache {
    checked_at: Option<Instant>,
    healthy: bool,
    active_endpoint: Option<String>,
}

/// Blocking client for the remote transcription service.
pub struct RemoteClient {
    config: RemoteClientConfig,
    http: reqwest::blocking::Client,
    health: Mutex<HealthCache>,
}

impl RemoteClient {
    pub fn new(config: RemoteClientConfig) -> Self {
        Self {
            config,
            http: reqwest::blocking::Client::new(),
            health: Mutex::new(HealthCache {
                checked_at: None,
                healthy: false,
                active_endpoint: None,
            }),
        }
    }

    /// Probe for a healthy endpoint, honouring the TTL cache.
    ///
    /// Negative results are cached too: an unreachable server costs at most
    /// one round of connection timeouts per TTL window.
    pub fn check_health(&self) -> bool {
        let mut cache = self.health.lock();

        if let Some(checked_at) = cache.checked_at {
            if checked_at.elapsed() < self.config.health_cache_ttl {
                return cache.healthy;
            }
        }

        let mut healthy = false;
        let mut active = None;
        for endpoint in &self.config.endpoints {
            match self
                .http
                .get(format!("{endpoint}/health"))
                .timeout(self.config.health_timeout)
                .send()
            {
                Ok(response) if response.status().is_success() => {
                    debug!(%endpoint, "transcription server is healthy");
                    healthy = true;
                    active = Some(endpoint.clone());
                    break;
                }
                Ok(response) => {
                    debug!(%endpoint, status = %response.status(), "health probe rejected");
                }
                Err(e) => {
                    debug!(%endpoint, "health probe failed: {e}");
                }
            }
        }

        if !healthy {
            warn!("no healthy transcription server among {} endpoint(s)", self.config.endpoints.len());
        }
        cache.checked_at = Some(Instant::now());
        cache.healthy = healthy;
        cache.active_endpoint = active;
        cache.healthy
    }

    /// Run the full upload → poll → download protocol for one capture.
    pub fn transcribe(&self, samples: &[f32], sample_rate: u32) -> Result<String> {
        if !self.check_health() {
            return Err(SottoError::RemoteUnavailable);
        }
        let endpoint = self
            .health
            .lock()
            .active_endpoint
            .clone()
            .ok_or(SottoError::RemoteUnavailable)?;

        let wav = TempWav::create(&self.config.temp_dir, samples, sample_rate)?;
        let started = Instant::now();

        let task_id = self.upload(&endpoint, &wav)?;
        info!(%task_id, %endpoint, "upload accepted");

        self.poll_until_complete(&endpoint, &task_id)?;
        let text = self.download_result(&endpoint, &task_id)?;

        info!(
            %task_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            chars = text.len(),
            "remote transcription complete"
        );
        Ok(text)
    }

    fn upload(&self, endpoint: &str, wav: &TempWav) -> Result<String> {
        let bytes = std::fs::read(&wav.path)?;
        let part = reqwest::blocking::multipart::Part::bytes(bytes)
            .file_name("capture.wav")
            .mime_str("audio/wav")
            .map_err(|e| SottoError::RemoteUpload(e.to_string()))?;
        let form = reqwest::blocking::multipart::Form::new().part("file", part);

        let response = self
            .http
            .post(format!("{endpoint}/transcribe"))
            .multipart(form)
            .timeout(self.config.upload_timeout)
            .send()
            .map_err(|e| SottoError::RemoteUpload(e.to_string()))?;

        if !response.status().is_success() {
            return Err(SottoError::RemoteUpload(format!(
                "server returned {}",
                response.status()
            )));
        }

        let parsed: UploadResponse = response
            .json()
            .map_err(|e| SottoError::RemoteUpload(format!("invalid upload response: {e}")))?;
        Ok(parsed.task_id)
    }

    fn poll_until_complete(&self, endpoint: &str, task_id: &str) -> Result<()> {
        let deadline = Instant::now() + self.config.overall_deadline;

        loop {
            let response = self
                .http
                .get(format!("{endpoint}/status/{task_id}"))
                .timeout(self.config.poll_timeout)
                .send()
                .map_err(|e| SottoError::RemoteStatus(e.to_string()))?;

            if !response.status().is_success() {
                return Err(SottoError::RemoteStatus(format!(
                    "server returned {}",
                    response.status()
                )));
            }

            let parsed: StatusResponse = response
                .json()
                .map_err(|e| SottoError::RemoteStatus(format!("invalid status response: {e}")))?;

            match parsed.status {
                TaskStatus::Completed => return Ok(()),
                TaskStatus::Failed => {
                    return Err(SottoError::RemoteTask(
                        parsed.error.unwrap_or_else(|| "unspecified".into()),
                    ));
                }
                TaskStatus::Processing => {
                    if Instant::now() + self.config.poll_interval > deadline {
                        return Err(SottoError::RemoteDeadline(self.config.overall_deadline));
                    }
                    std::thread::sleep(self.config.poll_interval);
                }
            }
        }
    }

    fn download_result(&self, endpoint: &str, task_id: &str) -> Result<String> {
        let response = self
            .http
            .get(format!("{endpoint}/result/{task_id}"))
            .timeout(self.config.poll_timeout)
            .send()
            .map_err(|e| SottoError::RemoteResult(e.to_string()))?;

        if !response.status().is_success() {
            return Err(SottoError::RemoteResult(format!(
                "server returned {}",
                response.status()
            )));
        }

        response
            .text()
            .map_err(|e| SottoError::RemoteResult(e.to_string()))
    }
}

impl RemoteTranscriber for RemoteClient {
    fn check_health(&self) -> bool {
        RemoteClient::check_health(self)
    }

    fn transcribe(&self, samples: &[f32], sample_rate: u32) -> Result<String> {
        RemoteClient::transcribe(self, samples, sample_rate)
    }
}

/// Temp WAV staged for upload; the file is removed when the guard drops,
/// covering success, every error path, and panics alike.
struct TempWav {
    path: PathBuf,
}

impl TempWav {
    fn create(dir: &std::path::Path, samples: &[f32], sample_rate: u32) -> Result<Self> {
        let name = format!(
            "sotto-remote-{}-{}.wav",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_millis())
                .unwrap_or(0)
        );
        let path = dir.join(name);
        write_pcm16_wav(&path, samples, sample_rate, 1)?;
        Ok(Self { path })
    }
}

impl Drop for TempWav {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            debug!(path = %self.path.display(), "failed to remove temp WAV: {e}");
        }
    }
}
