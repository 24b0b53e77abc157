use std::io::{self, BufRead, Write};
use std::time::Instant;

use chatstream_core::{
    chunk::StreamChunk,
    config::StreamCfg,
    encoder::{SseEncoder, SseEncoderOptions},
    fetch_sse::{fetch_sse, FetchSseOptions, MessageChunk, SmoothingConfig},
    speed::TokenSpeedCalculator,
    transport::EventSourceClient,
};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(author, version, about = "chatstream CLI smoke tool", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Consume a live SSE endpoint and print paced output
    Stream {
        #[arg(long)]
        url: String,
        #[arg(short, long, help = "JSON request body")]
        body: Option<String>,
        #[arg(long, help = "Config file (TOML or JSON)")]
        config: Option<String>,
        #[arg(long, help = "Disable playback smoothing")]
        no_smoothing: bool,
        #[arg(long, help = "Fixed drain speed in chars per tick")]
        speed: Option<usize>,
    },
    /// Read chunk JSON lines ({"id", "event", "data"}) from stdin and emit
    /// speed-annotated wire lines
    Encode {
        #[arg(long, default_value = "cli")]
        stream_id: String,
        #[arg(long, help = "Synthesize an error event if no terminal chunk arrives")]
        require_terminal: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Stream {
            url,
            body,
            config,
            no_smoothing,
            speed,
        } => {
            let cfg = match config {
                Some(path) => StreamCfg::from_path(path)?,
                None => StreamCfg::default(),
            };
            let body = match body {
                Some(raw) => Some(serde_json::from_str(&raw)?),
                None => None,
            };
            let signal = CancellationToken::new();
            let ctrl_c = signal.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    ctrl_c.cancel();
                }
            });

            let smoothing = if no_smoothing {
                SmoothingConfig::from(false)
            } else {
                SmoothingConfig {
                    text: true,
                    tools_calling: true,
                    speed: speed.or(cfg.animation.speed),
                }
            };
            let options = FetchSseOptions {
                body,
                smoothing,
                signal,
                client: Some(EventSourceClient::from_config(&cfg.http)?),
                on_message_handle: Some(Box::new(|chunk| match chunk {
                    MessageChunk::Text { text } | MessageChunk::Reasoning { text } => {
                        print!("{}", text);
                        io::stdout().flush().ok();
                    }
                    MessageChunk::ToolCalls { tool_calls, .. } => {
                        eprint!("\r[tool calls: {}]", tool_calls.len());
                    }
                    MessageChunk::Stop { reason } => {
                        eprintln!("\n[stop: {}]", reason);
                    }
                    _ => {}
                })),
                on_finish: Some(Box::new(|_, ctx| {
                    if let Some(speed) = &ctx.speed {
                        eprintln!(
                            "[ttft {}ms, {:.1} tok/s, latency {}ms]",
                            speed.ttft, speed.tps, speed.latency
                        );
                    }
                })),
                on_abort: Some(Box::new(|_| {
                    eprintln!("\n[aborted]");
                })),
                ..Default::default()
            };
            fetch_sse(url, options).await?;
            println!();
        }
        Commands::Encode {
            stream_id,
            require_terminal,
        } => {
            let mut encoder = SseEncoder::new(
                &stream_id,
                SseEncoderOptions {
                    require_terminal_event: require_terminal,
                },
            );
            let mut calculator = TokenSpeedCalculator::new(Instant::now());
            let stdout = io::stdout();
            let mut out = stdout.lock();
            for line in io::stdin().lock().lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let value: serde_json::Value = serde_json::from_str(&line)?;
                let id = value
                    .get("id")
                    .and_then(|v| v.as_str())
                    .unwrap_or(&stream_id)
                    .to_string();
                let event = value
                    .get("event")
                    .and_then(|v| v.as_str())
                    .unwrap_or("data")
                    .to_string();
                let data = value.get("data").cloned().unwrap_or(serde_json::Value::Null);
                let chunk = StreamChunk::from_wire(id, &event, data)?;
                let speed = calculator.observe(&chunk);
                for wire in encoder.encode(&chunk)? {
                    out.write_all(wire.as_bytes())?;
                }
                if let Some(speed) = speed {
                    for wire in encoder.encode(&speed)? {
                        out.write_all(wire.as_bytes())?;
                    }
                }
            }
            for wire in encoder.flush() {
                out.write_all(wire.as_bytes())?;
            }
            out.flush()?;
        }
    }

    Ok(())
}
