//! `vsock-sample` command-line entry point.
//!
//! `client` sends one prompt and streams the reply to stdout; `server` loads
//! the generator and answers connections until interrupted. Diagnostics go
//! to stderr through `tracing` so stdout carries only reply text.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{CommandFactory, Parser, Subcommand};
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use vsock_sample::config::{
    DEFAULT_BACKLOG, DEFAULT_CONNECT_TIMEOUT, DEFAULT_MAX_LENGTH, DEFAULT_MODEL_PATH,
};
use vsock_sample::{
    ClientConfig, Connector, Endpoint, GenerationContext, Generator, Listener, LoadError,
    ReplyDecoder, ServerConfig, VsockError,
};

const DEFAULT_PROMPT: &str = "Hello, world!";

#[derive(Parser)]
#[command(name = "vsock-sample", version, about = "Prompt/reply exchange over vsock")]
struct Cli {
    #[command(subcommand)]
    mode: Option<Mode>,
}

#[derive(Subcommand)]
enum Mode {
    /// Connect to a given cid and port.
    Client {
        /// The remote endpoint CID.
        cid: u32,
        /// The remote endpoint port.
        #[arg(value_parser = clap::value_parser!(u32).range(1..=65535))]
        port: u32,
        /// Prompt to send to the model.
        #[arg(long, default_value = DEFAULT_PROMPT)]
        prompt: String,
        /// Seconds to wait for the connection to be established.
        #[arg(long, default_value_t = DEFAULT_CONNECT_TIMEOUT.as_secs_f64())]
        connect_timeout: f64,
    },
    /// Listen on a given port.
    Server {
        /// The local port to listen on.
        #[arg(value_parser = clap::value_parser!(u32).range(1..=65535))]
        port: u32,
        /// Directory holding the model and its generator.json.
        #[arg(long, default_value = DEFAULT_MODEL_PATH)]
        model_path: PathBuf,
        /// Upper bound on generated length, passed to the generator.
        #[arg(long, default_value_t = DEFAULT_MAX_LENGTH)]
        max_length: usize,
        /// Pending-connection queue length.
        #[arg(long, default_value_t = DEFAULT_BACKLOG)]
        backlog: i32,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let Some(mode) = cli.mode else {
        eprintln!("{}", Cli::command().render_usage());
        return ExitCode::FAILURE;
    };

    init_tracing();

    match mode {
        Mode::Client {
            cid,
            port,
            prompt,
            connect_timeout,
        } => {
            let config = match Duration::try_from_secs_f64(connect_timeout) {
                Ok(timeout) => ClientConfig::new().with_connect_timeout(timeout),
                Err(err) => {
                    error!(error = %err, "invalid --connect-timeout");
                    return ExitCode::FAILURE;
                }
            };
            match run_client(config, Endpoint::new(cid, port), prompt).await {
                Ok(()) => ExitCode::SUCCESS,
                Err(err) => {
                    error!(error = %err, "client failed");
                    ExitCode::FAILURE
                }
            }
        }
        Mode::Server {
            port,
            model_path,
            max_length,
            backlog,
        } => {
            let config = ServerConfig::new(port)
                .with_model_path(model_path)
                .with_max_length(max_length)
                .with_backlog(backlog);
            run_server(config).await
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn run_client(config: ClientConfig, endpoint: Endpoint, prompt: String) -> Result<(), VsockError> {
    let connector = Connector::new(config);
    let mut conn = connector.connect(endpoint).await?;

    let result = exchange(&mut conn, prompt).await;
    conn.close().await;
    result
}

async fn exchange(conn: &mut vsock_sample::Connection, prompt: String) -> Result<(), VsockError> {
    conn.send_request(prompt).await?;

    let mut stdout = tokio::io::stdout();
    let mut decoder = ReplyDecoder::new();
    let mut reply = Box::pin(conn.receive_reply());
    while let Some(chunk) = reply.next().await {
        let text = decoder.decode(&chunk?);
        stdout.write_all(text.as_bytes()).await?;
        stdout.flush().await?;
    }
    let tail = decoder.finish();
    stdout.write_all(tail.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await?;
    Ok(())
}

async fn run_server(config: ServerConfig) -> ExitCode {
    info!(model_path = %config.model_path().display(), "loading model");
    let generator = match GenerationContext::load(config.model_path(), config.max_length()) {
        Ok(ctx) => ctx,
        Err(err @ LoadError::NotFound(_)) => {
            error!(error = %err, "model path does not exist");
            return ExitCode::FAILURE;
        }
        Err(err) => {
            error!(error = %err, "failed to load model");
            return ExitCode::FAILURE;
        }
    };
    info!("model loaded");
    let generator: Arc<dyn Generator> = Arc::new(generator);

    let mut listener = match Listener::bind(&config, Some(generator)) {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, "failed to bind");
            return ExitCode::FAILURE;
        }
    };
    info!(port = config.port(), "server listening on port {}", config.port());

    tokio::select! {
        result = listener.serve() => match result {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => {
                error!(error = %err, "listener stopped");
                ExitCode::FAILURE
            }
        },
        signal = tokio::signal::ctrl_c() => {
            if let Err(err) = signal {
                error!(error = %err, "failed to listen for shutdown signal");
                return ExitCode::FAILURE;
            }
            info!("shutting down");
            ExitCode::SUCCESS
        }
    }
}
