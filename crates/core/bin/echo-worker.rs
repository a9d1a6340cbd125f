//! Echo worker binary
//!
//! A reference worker speaking the backend gRPC contract with deterministic
//! answers: completions echo the prompt, streams emit one chunk per word,
//! embeddings are derived from the input bytes, and speech or image
//! requests write the input text to the destination file.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tonic::transport::Server;
use tonic::{Request, Response, Status};

use localgate_core::proto;
use localgate_core::proto::backend_server::{Backend, BackendServer};
use localgate_core::proto::status_response::State;

const EMBEDDING_DIMS: usize = 8;

#[derive(Parser, Debug)]
#[command(name = "echo-worker")]
#[command(about = "Deterministic worker for the localgate backend protocol")]
struct Args {
    /// Address to serve on
    #[arg(long)]
    addr: SocketAddr,

    /// Artificial latency added to every model operation
    #[arg(long, default_value_t = 0)]
    delay_ms: u64,
}

struct EchoWorker {
    loaded: Mutex<Option<String>>,
    delay: Duration,
}

impl EchoWorker {
    fn new(delay: Duration) -> Self {
        Self {
            loaded: Mutex::new(None),
            delay,
        }
    }

    /// Fail unless a model is loaded, then apply the configured latency
    async fn ready(&self) -> Result<(), Status> {
        if self.loaded.lock().is_none() {
            return Err(Status::failed_precondition("no model loaded"));
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(())
    }
}

fn op_ok() -> proto::OpResult {
    proto::OpResult {
        message: String::new(),
        success: true,
    }
}

/// Fold the input bytes into a fixed-size unit vector
fn embed_text(text: &str) -> Vec<f32> {
    let mut vector = vec![0.0f32; EMBEDDING_DIMS];
    for (i, byte) in text.bytes().enumerate() {
        vector[i % EMBEDDING_DIMS] += byte as f32;
    }
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        vector.iter_mut().for_each(|v| *v /= norm);
    }
    vector
}

#[tonic::async_trait]
impl Backend for EchoWorker {
    type PredictStreamStream = ReceiverStream<Result<proto::Reply, Status>>;

    async fn health(
        &self,
        _request: Request<proto::HealthMessage>,
    ) -> Result<Response<proto::Reply>, Status> {
        Ok(Response::new(proto::Reply {
            message: b"OK".to_vec(),
        }))
    }

    async fn load_model(
        &self,
        request: Request<proto::ModelOptions>,
    ) -> Result<Response<proto::OpResult>, Status> {
        let options = request.into_inner();
        if options.model.contains("broken") {
            return Ok(Response::new(proto::OpResult {
                message: format!("cannot load {}", options.model),
                success: false,
            }));
        }
        tracing::info!(model = %options.model, threads = options.threads, "Model loaded");
        *self.loaded.lock() = Some(options.model);
        Ok(Response::new(op_ok()))
    }

    async fn predict(
        &self,
        request: Request<proto::PredictOptions>,
    ) -> Result<Response<proto::Reply>, Status> {
        self.ready().await?;
        let options = request.into_inner();
        Ok(Response::new(proto::Reply {
            message: options.prompt.into_bytes(),
        }))
    }

    async fn predict_stream(
        &self,
        request: Request<proto::PredictOptions>,
    ) -> Result<Response<Self::PredictStreamStream>, Status> {
        self.ready().await?;
        let prompt = request.into_inner().prompt;
        let (tx, rx) = mpsc::channel(16);

        tokio::spawn(async move {
            for (i, word) in prompt.split_whitespace().enumerate() {
                let chunk = if i == 0 {
                    word.to_string()
                } else {
                    format!(" {}", word)
                };
                let reply = proto::Reply {
                    message: chunk.into_bytes(),
                };
                if tx.send(Ok(reply)).await.is_err() {
                    break;
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn embedding(
        &self,
        request: Request<proto::PredictOptions>,
    ) -> Result<Response<proto::EmbeddingResult>, Status> {
        self.ready().await?;
        let options = request.into_inner();
        let input = if options.embeddings.is_empty() {
            options.prompt
        } else {
            options.embeddings
        };
        Ok(Response::new(proto::EmbeddingResult {
            embeddings: embed_text(&input),
        }))
    }

    async fn audio_transcription(
        &self,
        request: Request<proto::TranscriptRequest>,
    ) -> Result<Response<proto::TranscriptResult>, Status> {
        self.ready().await?;
        let request = request.into_inner();
        let audio = tokio::fs::read(&request.dst)
            .await
            .map_err(|e| Status::not_found(format!("{}: {}", request.dst, e)))?;
        let text = String::from_utf8_lossy(&audio).trim().to_string();

        Ok(Response::new(proto::TranscriptResult {
            segments: vec![proto::TranscriptSegment {
                id: 0,
                start: 0,
                end: text.split_whitespace().count() as i64,
                text: text.clone(),
                tokens: Vec::new(),
            }],
            text,
        }))
    }

    async fn tts(
        &self,
        request: Request<proto::TtsRequest>,
    ) -> Result<Response<proto::OpResult>, Status> {
        self.ready().await?;
        let request = request.into_inner();
        let body = format!("{}|{}|{}", request.voice, request.language, request.text);
        tokio::fs::write(&request.dst, body)
            .await
            .map_err(|e| Status::internal(format!("{}: {}", request.dst, e)))?;
        Ok(Response::new(op_ok()))
    }

    async fn generate_image(
        &self,
        request: Request<proto::GenerateImageRequest>,
    ) -> Result<Response<proto::OpResult>, Status> {
        self.ready().await?;
        let request = request.into_inner();
        tokio::fs::write(&request.dst, request.positive_prompt.as_bytes())
            .await
            .map_err(|e| Status::internal(format!("{}: {}", request.dst, e)))?;
        Ok(Response::new(op_ok()))
    }

    async fn status(
        &self,
        _request: Request<proto::HealthMessage>,
    ) -> Result<Response<proto::StatusResponse>, Status> {
        let state = if self.loaded.lock().is_some() {
            State::Ready
        } else {
            State::Uninitialized
        };
        let memory = localgate_core::process::resident_memory(std::process::id()).map(|rss| {
            proto::MemoryUsageData {
                total: rss,
                breakdown: HashMap::from([("rss".to_string(), rss)]),
            }
        });

        let mut response = proto::StatusResponse {
            state: 0,
            memory,
        };
        response.set_state(state);
        Ok(Response::new(response))
    }

    async fn unload(
        &self,
        _request: Request<proto::HealthMessage>,
    ) -> Result<Response<proto::OpResult>, Status> {
        if let Some(model) = self.loaded.lock().take() {
            tracing::info!(%model, "Model unloaded");
        }
        Ok(Response::new(op_ok()))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let listener = tokio::net::TcpListener::bind(args.addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "Echo worker serving");

    let worker = EchoWorker::new(Duration::from_millis(args.delay_ms));
    Server::builder()
        .add_service(BackendServer::new(worker))
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    tracing::info!("Echo worker stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedding_is_deterministic_unit_vector() {
        let a = embed_text("hello world");
        assert_eq!(a, embed_text("hello world"));
        assert_eq!(a.len(), EMBEDDING_DIMS);
        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
        assert_eq!(embed_text(""), vec![0.0; EMBEDDING_DIMS]);
    }
}
