//! gRPC client for worker processes

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use tonic::transport::{Channel, Endpoint};

use super::backend::Backend;
use crate::process::WorkerProcess;
use crate::proto;
use crate::proto::backend_client::BackendClient;
use crate::{Error, Result};

/// [`Backend`] implementation talking to a worker over gRPC
#[derive(Debug, Clone)]
pub struct GrpcBackend {
    /// Backend tag, for error reporting
    backend: String,
    address: String,
    client: BackendClient<Channel>,
}

impl GrpcBackend {
    /// Connect to a worker at `address` (`host:port`), retrying until it
    /// answers the health probe
    ///
    /// A worker counts as connected only once `Health` returns `"OK"`.
    /// When `process` is given, retrying stops as soon as it exits.
    pub async fn connect(
        backend: &str,
        address: &str,
        attempts: u32,
        attempts_sleep: Duration,
        process: Option<&WorkerProcess>,
    ) -> Result<Self> {
        let endpoint = Endpoint::from_shared(format!("http://{}", address))
            .map_err(|e| Error::BackendSpawnFailed {
                backend: backend.to_string(),
                reason: format!("invalid worker address {}: {}", address, e),
            })?
            .connect_timeout(Duration::from_secs(5));

        let retry = Self::retry(backend, address, &endpoint, attempts, attempts_sleep);
        let Some(process) = process else {
            return retry.await;
        };

        tokio::select! {
            result = retry => result,
            reason = process.exited() => Err(Error::BackendSpawnFailed {
                backend: backend.to_string(),
                reason: format!("worker {} before answering the health probe", reason),
            }),
        }
    }

    async fn retry(
        backend: &str,
        address: &str,
        endpoint: &Endpoint,
        attempts: u32,
        attempts_sleep: Duration,
    ) -> Result<Self> {
        let attempts = attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match Self::probe(endpoint).await {
                Ok(client) => {
                    tracing::info!(backend, address, attempt, "Connected to worker");
                    return Ok(Self {
                        backend: backend.to_string(),
                        address: address.to_string(),
                        client,
                    });
                }
                Err(e) => {
                    last_error = e;
                    if attempt < attempts {
                        tracing::warn!(
                            backend,
                            address,
                            attempt,
                            "Worker not ready, retrying in {:?}: {}",
                            attempts_sleep,
                            last_error
                        );
                        tokio::time::sleep(attempts_sleep).await;
                    }
                }
            }
        }

        Err(Error::BackendSpawnFailed {
            backend: backend.to_string(),
            reason: format!(
                "worker at {} not ready after {} attempts: {}",
                address, attempts, last_error
            ),
        })
    }

    /// Client for an already-established channel, without probing
    pub fn from_channel(backend: &str, address: &str, channel: Channel) -> Self {
        Self {
            backend: backend.to_string(),
            address: address.to_string(),
            client: BackendClient::new(channel),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    async fn probe(endpoint: &Endpoint) -> std::result::Result<BackendClient<Channel>, String> {
        let channel = endpoint.connect().await.map_err(|e| e.to_string())?;
        let mut client = BackendClient::new(channel);
        let reply = client
            .health(proto::HealthMessage {})
            .await
            .map_err(|s| s.message().to_string())?
            .into_inner();
        let message = String::from_utf8_lossy(&reply.message);
        if message == "OK" {
            Ok(client)
        } else {
            Err(format!("health probe answered {:?}", message))
        }
    }

    fn client(&self) -> BackendClient<Channel> {
        self.client.clone()
    }

    fn status_error(
        &self,
        operation: &'static str,
        deadline: Option<Duration>,
    ) -> impl FnOnce(tonic::Status) -> Error + '_ {
        move |status| {
            Error::from_status(status, &self.backend, operation, deadline, Error::PredictFailed)
        }
    }
}

#[async_trait]
impl Backend for GrpcBackend {
    async fn health(&self) -> Result<String> {
        let reply = self
            .client()
            .health(proto::HealthMessage {})
            .await
            .map_err(self.status_error("health", None))?
            .into_inner();
        Ok(String::from_utf8_lossy(&reply.message).into_owned())
    }

    async fn load(&self, options: proto::ModelOptions) -> Result<()> {
        let model = options.model.clone();
        let result = self
            .client()
            .load_model(options)
            .await
            .map_err(|status| {
                Error::from_status(status, &self.backend, "load", None, |msg| {
                    Error::LoadFailed(model.clone(), msg)
                })
            })?
            .into_inner();
        if result.success {
            Ok(())
        } else {
            Err(Error::LoadFailed(model, result.message))
        }
    }

    async fn predict(
        &self,
        options: proto::PredictOptions,
        deadline: Option<Duration>,
    ) -> Result<String> {
        let reply = self
            .client()
            .predict(request(options, deadline))
            .await
            .map_err(self.status_error("predict", deadline))?
            .into_inner();
        Ok(String::from_utf8_lossy(&reply.message).into_owned())
    }

    async fn predict_stream(
        &self,
        options: proto::PredictOptions,
        deadline: Option<Duration>,
    ) -> Result<BoxStream<'static, Result<String>>> {
        let stream = self
            .client()
            .predict_stream(request(options, deadline))
            .await
            .map_err(self.status_error("predict_stream", deadline))?
            .into_inner();

        let backend = self.backend.clone();
        Ok(stream
            .map(move |item| match item {
                Ok(reply) => Ok(String::from_utf8_lossy(&reply.message).into_owned()),
                Err(status) => Err(Error::from_status(
                    status,
                    &backend,
                    "predict_stream",
                    deadline,
                    Error::PredictFailed,
                )),
            })
            .boxed())
    }

    async fn embed(
        &self,
        options: proto::PredictOptions,
        deadline: Option<Duration>,
    ) -> Result<Vec<f32>> {
        let result = self
            .client()
            .embedding(request(options, deadline))
            .await
            .map_err(self.status_error("embed", deadline))?
            .into_inner();
        Ok(result.embeddings)
    }

    async fn transcribe(
        &self,
        transcript: proto::TranscriptRequest,
        deadline: Option<Duration>,
    ) -> Result<proto::TranscriptResult> {
        Ok(self
            .client()
            .audio_transcription(request(transcript, deadline))
            .await
            .map_err(self.status_error("transcribe", deadline))?
            .into_inner())
    }

    async fn synthesize(&self, tts: proto::TtsRequest, deadline: Option<Duration>) -> Result<()> {
        let result = self
            .client()
            .tts(request(tts, deadline))
            .await
            .map_err(self.status_error("synthesize", deadline))?
            .into_inner();
        op_result(result)
    }

    async fn generate_image(
        &self,
        image: proto::GenerateImageRequest,
        deadline: Option<Duration>,
    ) -> Result<()> {
        let result = self
            .client()
            .generate_image(request(image, deadline))
            .await
            .map_err(self.status_error("generate_image", deadline))?
            .into_inner();
        op_result(result)
    }

    async fn status(&self, deadline: Option<Duration>) -> Result<proto::StatusResponse> {
        Ok(self
            .client()
            .status(request(proto::HealthMessage {}, deadline))
            .await
            .map_err(self.status_error("status", deadline))?
            .into_inner())
    }

    async fn unload(&self) -> Result<()> {
        let result = self
            .client()
            .unload(proto::HealthMessage {})
            .await
            .map_err(self.status_error("unload", None))?
            .into_inner();
        op_result(result)
    }
}

/// Wrap `message`, carrying the caller's deadline to the worker as `grpc-timeout`
fn request<T>(message: T, deadline: Option<Duration>) -> tonic::Request<T> {
    let mut request = tonic::Request::new(message);
    if let Some(deadline) = deadline {
        request.set_timeout(deadline);
    }
    request
}

fn op_result(result: proto::OpResult) -> Result<()> {
    if result.success {
        Ok(())
    } else {
        Err(Error::PredictFailed(result.message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_gives_up_after_attempts() {
        // Nothing listens on port 1
        let err =
            GrpcBackend::connect("llama-cpp", "127.0.0.1:1", 2, Duration::from_millis(10), None)
                .await
                .unwrap_err();
        match err {
            Error::BackendSpawnFailed { backend, reason } => {
                assert_eq!(backend, "llama-cpp");
                assert!(reason.contains("2 attempts"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_connect_stops_when_worker_exits() {
        use crate::process::SpawnConfig;

        let process = WorkerProcess::spawn(
            SpawnConfig::new("sh", "crashing-worker")
                .arg("-c")
                .arg("exit 3"),
        )
        .unwrap();

        // 50 attempts 100ms apart would take over five seconds
        let started = std::time::Instant::now();
        let err = GrpcBackend::connect(
            "llama-cpp",
            "127.0.0.1:1",
            50,
            Duration::from_millis(100),
            Some(&process),
        )
        .await
        .unwrap_err();

        assert!(started.elapsed() < Duration::from_secs(3));
        match err {
            Error::BackendSpawnFailed { backend, reason } => {
                assert_eq!(backend, "llama-cpp");
                assert!(reason.contains("exited with code 3"), "{}", reason);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_request_carries_deadline() {
        let req = request(proto::HealthMessage {}, Some(Duration::from_secs(2)));
        assert!(req.metadata().get("grpc-timeout").is_some());

        let req = request(proto::HealthMessage {}, None);
        assert!(req.metadata().get("grpc-timeout").is_none());
    }

    #[test]
    fn test_failed_op_result() {
        let err = op_result(proto::OpResult {
            message: "voice not found".to_string(),
            success: false,
        })
        .unwrap_err();
        assert!(matches!(err, Error::PredictFailed(msg) if msg == "voice not found"));
    }
}
