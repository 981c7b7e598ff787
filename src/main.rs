mod args_handler;
mod conversation;
mod error;
mod llm;
#[cfg(test)]
mod test_support;
mod transcript;

use anyhow::Context;
use clap::Parser;
use log::{info, warn};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use args_handler::Args;
use conversation::{Conversation, Exit};
use llm::OllamaClient;
use transcript::{load_system_prompt, Transcript};

fn init_logging() {
    // stdout belongs to the conversation, logs go to stderr
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> anyhow::Result<()> {
    let args: Args = Args::parse();
    init_logging();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .with_context(|| "unable to start the async runtime")?;
    let result = runtime.block_on(chat(args));
    // a pending stdin read must not hold the process open after an interrupt
    runtime.shutdown_background();
    result
}

async fn chat(args: Args) -> anyhow::Result<()> {
    info!("starting chatbot");

    let system_prompt = load_system_prompt(&args.system_prompt)?;

    let client = OllamaClient::new(
        &args.base_url,
        &args.model,
        args.connect_timeout(),
        args.read_timeout(),
    )
    .with_context(|| "unable to create the http client")?;

    if args.skip_readiness_check {
        warn!("skipping readiness check for {}", args.base_url);
    } else {
        client
            .check_ready()
            .await
            .with_context(|| format!("model server at {} is not available", args.base_url))?;
    }

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                shutdown.cancel();
            }
        }
    });

    println!("{}", "=".repeat(60));
    println!("Chatting with {} at {}", client.model(), args.base_url);
    println!("{}", "=".repeat(60));

    let mut conversation =
        Conversation::new(client, Transcript::new(system_prompt), shutdown).verbose(args.verbose);
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let exit = conversation.run(stdin, &mut std::io::stdout()).await?;

    let turns = conversation.transcript().turns();
    match exit {
        Exit::Quit | Exit::EndOfInput => info!("session ended after {turns} turn(s)"),
        Exit::Interrupted => info!("session interrupted after {turns} turn(s)"),
    }
    Ok(())
}
