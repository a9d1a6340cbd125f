//! localgate - command-line front end
//!
//! Runs single requests against local models through the dispatch facade.
//!
//! # Usage
//!
//! ```bash
//! # Synthesize speech into a file
//! localgate tts --model en-us-amy --voice amy --output hello.wav Hello there
//!
//! # Stream a completion to stdout
//! localgate predict --model gpt-local Write a haiku about rust
//! ```

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use localgate_core::{Dispatcher, GatewayConfig, InvokeRequest, RequestOverrides};

/// localgate - run models behind a local inference gateway
#[derive(Parser)]
#[command(name = "localgate")]
#[command(author, version)]
#[command(about = "Run completions and speech synthesis against local model workers")]
struct Args {
    /// Gateway settings file (TOML); LOCALGATE_* variables otherwise
    #[arg(short, long, global = true, env = "LOCALGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Synthesize speech from text
    Tts {
        /// Model name or model file
        #[arg(short, long)]
        model: String,

        /// Backend override (e.g. piper, bark)
        #[arg(short, long)]
        backend: Option<String>,

        #[arg(long)]
        voice: Option<String>,

        #[arg(short, long)]
        language: Option<String>,

        /// Where to write the audio; the staging path is printed otherwise
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Text to speak
        #[arg(required = true)]
        text: Vec<String>,
    },

    /// Stream a completion to stdout
    Predict {
        /// Model name or model file
        #[arg(short, long)]
        model: String,

        #[arg(short, long)]
        backend: Option<String>,

        #[arg(short, long)]
        temperature: Option<f32>,

        /// Prompt text
        #[arg(required = true)]
        prompt: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = match args.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .init();

    let config = GatewayConfig::load(args.config.as_deref()).context("Failed to load gateway settings")?;
    let dispatcher = Dispatcher::from_gateway_config(&config)?;

    let outcome = tokio::select! {
        result = run(&dispatcher, args.command) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted");
            Ok(())
        }
    };

    dispatcher.registry().stop_all().await?;
    outcome
}

async fn run(dispatcher: &Dispatcher, command: Command) -> Result<()> {
    match command {
        Command::Tts {
            model,
            backend,
            voice,
            language,
            output,
            text,
        } => {
            let overrides = RequestOverrides {
                backend,
                voice,
                language,
                ..Default::default()
            };
            let request = InvokeRequest::synthesize(model, text.join(" ")).with_overrides(overrides);
            let staged = dispatcher
                .invoke(request)
                .await?
                .into_file()
                .context("Speech synthesis returned no file")?;

            let path = match output {
                Some(output) => {
                    move_file(&staged, &output).await?;
                    output
                }
                None => staged,
            };
            println!("{}", path.display());
        }

        Command::Predict {
            model,
            backend,
            temperature,
            prompt,
        } => {
            let overrides = RequestOverrides {
                backend,
                temperature,
                ..Default::default()
            };
            let request =
                InvokeRequest::predict_stream(model, prompt.join(" ")).with_overrides(overrides);
            let mut stream = dispatcher
                .invoke(request)
                .await?
                .into_stream()
                .context("Prediction returned no stream")?;

            let mut stdout = std::io::stdout();
            while let Some(chunk) = stream.next().await {
                stdout.write_all(chunk?.as_bytes())?;
                stdout.flush()?;
            }
            writeln!(stdout)?;
        }
    }
    Ok(())
}

/// Move a staged artifact, copying when it sits on another filesystem
async fn move_file(from: &Path, to: &Path) -> Result<()> {
    if tokio::fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    tokio::fs::copy(from, to)
        .await
        .with_context(|| format!("Failed to write {}", to.display()))?;
    tokio::fs::remove_file(from).await?;
    Ok(())
}
