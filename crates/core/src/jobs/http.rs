//! HTTP job engine client.
//!
//! Endpoints:
//! - `POST /jobs` submits a job and answers `{ "job_uuid": ... }`
//! - `GET /jobs/{uuid}/watch` streams newline-delimited JSON `JobSignal`s
//! - `POST /jobs/{uuid}/stop` asks a job to stop

use std::io;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, Stream, StreamExt, TryStreamExt};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

use crate::config::ServiceConfig;
use crate::metrics::observe_external_call;

use super::{JobEngine, JobEngineError, JobHandle, JobSignal, JobSignalStream, JobSpec};

const SERVICE: &str = "job_engine";

/// Longest signal line accepted on a watch stream.
const MAX_SIGNAL_LINE: usize = 1024 * 1024;

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    job_uuid: String,
}

/// Job engine reached over HTTP.
pub struct HttpJobEngine {
    client: Client,
    /// Client without a total timeout, for long-lived watch streams.
    watch_client: Client,
    config: ServiceConfig,
}

impl HttpJobEngine {
    /// Create a new job engine client.
    pub fn new(config: ServiceConfig) -> Result<Self, JobEngineError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs as u64))
            .build()
            .map_err(|e| JobEngineError::ConnectionFailed(e.to_string()))?;
        let watch_client = Client::builder()
            .connect_timeout(Duration::from_secs(config.timeout_secs as u64))
            .build()
            .map_err(|e| JobEngineError::ConnectionFailed(e.to_string()))?;

        Ok(Self {
            client,
            watch_client,
            config,
        })
    }

    fn base_url(&self) -> &str {
        self.config.url.trim_end_matches('/')
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.config.api_token {
            Some(token) if !token.is_empty() => builder.bearer_auth(token),
            _ => builder,
        }
    }

    fn map_send_error(e: reqwest::Error) -> JobEngineError {
        if e.is_timeout() {
            JobEngineError::Timeout
        } else if e.is_connect() {
            JobEngineError::ConnectionFailed(e.to_string())
        } else {
            JobEngineError::ApiError(e.to_string())
        }
    }

    async fn check_status(
        response: reqwest::Response,
        job_uuid: Option<&str>,
    ) -> Result<reqwest::Response, JobEngineError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let body: String = body.chars().take(200).collect();
        match status {
            StatusCode::NOT_FOUND => Err(JobEngineError::JobNotFound(
                job_uuid.unwrap_or_default().to_string(),
            )),
            StatusCode::BAD_REQUEST | StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY => {
                Err(JobEngineError::Rejected(body))
            }
            _ => Err(JobEngineError::ApiError(format!("HTTP {}: {}", status, body))),
        }
    }
}

#[async_trait]
impl JobEngine for HttpJobEngine {
    async fn submit(&self, spec: JobSpec) -> Result<JobHandle, JobEngineError> {
        let url = format!("{}/jobs", self.base_url());
        let started = Instant::now();

        let result = async {
            let response = self
                .authorized(self.client.post(&url).json(&spec))
                .send()
                .await
                .map_err(Self::map_send_error)?;
            let response = Self::check_status(response, None).await?;
            response
                .json::<SubmitResponse>()
                .await
                .map_err(|e| JobEngineError::ApiError(format!("invalid submit response: {}", e)))
        }
        .await;

        observe_external_call(SERVICE, "submit", started.elapsed().as_secs_f64(), result.is_ok());
        let submitted = result?;
        debug!(job_uuid = %submitted.job_uuid, task = %spec.task, "Job submitted");
        Ok(JobHandle::new(submitted.job_uuid))
    }

    async fn subscribe(&self, job: &JobHandle) -> Result<JobSignalStream, JobEngineError> {
        let url = format!("{}/jobs/{}/watch", self.base_url(), job.job_uuid);
        let started = Instant::now();

        let result = async {
            let response = self
                .authorized(self.watch_client.get(&url))
                .send()
                .await
                .map_err(Self::map_send_error)?;
            Self::check_status(response, Some(&job.job_uuid)).await
        }
        .await;
        observe_external_call(
            SERVICE,
            "subscribe",
            started.elapsed().as_secs_f64(),
            result.is_ok(),
        );
        let response = result?;

        let body = response.bytes_stream().map_err(io::Error::other);
        Ok(decode_signals(body, job.job_uuid.clone()))
    }

    async fn stop(&self, job: &JobHandle) -> Result<(), JobEngineError> {
        let url = format!("{}/jobs/{}/stop", self.base_url(), job.job_uuid);
        let started = Instant::now();

        let result = async {
            let response = self
                .authorized(self.client.post(&url))
                .send()
                .await
                .map_err(Self::map_send_error)?;
            Self::check_status(response, Some(&job.job_uuid)).await.map(|_| ())
        }
        .await;

        observe_external_call(SERVICE, "stop", started.elapsed().as_secs_f64(), result.is_ok());
        result
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

/// Decode a newline-delimited JSON body into job signals.
///
/// Blank and malformed lines are skipped. The stream ends after the first
/// terminal signal, at the end of the body, or on a framing error: a line
/// longer than `MAX_SIGNAL_LINE`, invalid UTF-8, or a broken connection.
fn decode_signals<S>(body: S, job_uuid: String) -> JobSignalStream
where
    S: Stream<Item = io::Result<Bytes>> + Send + 'static,
{
    let lines = FramedRead::new(
        StreamReader::new(body),
        LinesCodec::new_with_max_length(MAX_SIGNAL_LINE),
    )
    .boxed();

    stream::unfold((lines, job_uuid, false), |(mut lines, job_uuid, done)| async move {
        if done {
            return None;
        }
        loop {
            let line = match lines.next().await? {
                Ok(line) => line,
                Err(e) => {
                    warn!(job_uuid = %job_uuid, "Job watch stream error: {}", e);
                    return None;
                }
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<JobSignal>(line) {
                Ok(signal) => {
                    let done = signal.is_terminal();
                    return Some((signal, (lines, job_uuid, done)));
                }
                Err(e) => warn!(job_uuid = %job_uuid, "Skipping malformed job signal: {}", e),
            }
        }
    })
    .boxed()
}
