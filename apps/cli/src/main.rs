use anyhow::Result;
use clap::Parser;
use client_core::{BatchSession, ClientEvent};

/// Submit a batch of commands and stream their results until completion.
#[derive(Parser, Debug)]
struct Args {
    #[arg(long)]
    server_url: String,
    /// Bearer token forwarded on both the submission and the stream.
    #[arg(long, env = "CONTROLLER_TOKEN")]
    token: Option<String>,
    /// Commands to run, one per argument.
    #[arg(required = true)]
    commands: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();
    let args = Args::parse();

    let session = match args.token {
        Some(token) => BatchSession::with_bearer_token(args.server_url, token),
        None => BatchSession::new(args.server_url),
    };

    let mut events = session.subscribe_events();
    let batch_id = session.submit_batch(&args.commands).await?;
    println!("submitted batch {batch_id}");

    loop {
        match events.recv().await {
            Ok(ClientEvent::Joined { .. }) => {}
            Ok(ClientEvent::ResultReceived(result)) => {
                let marker = if result.success { "ok" } else { "failed" };
                print!("[{} {marker}] {}", result.command_index, result.output);
            }
            Ok(ClientEvent::BatchCompleted {
                expected, received, ..
            }) => {
                println!("batch complete ({received}/{expected})");
                break;
            }
            Ok(ClientEvent::Disconnected) => {
                eprintln!("stream disconnected; partial results shown above");
                break;
            }
            Ok(ClientEvent::Error(message)) => {
                eprintln!("error: {message}");
            }
            Err(_) => break,
        }
    }

    session.close().await;
    Ok(())
}
