use std::io::Write;

use futures_util::StreamExt;
use llm_provider_router::models::{CompletionRequest, Message, StreamEvent};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,llm_provider_router=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let prompt = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    if prompt.trim().is_empty() {
        return Err("usage: llm-router <prompt>".into());
    }

    let manager = llm_provider_router::build_manager_from_env().await?;
    let request = CompletionRequest::new(vec![Message::user(prompt)]);
    let mut stream = manager.stream_complete(request).await?;

    let mut stdout = std::io::stdout();
    while let Some(event) = stream.next().await {
        match event? {
            StreamEvent::Content { delta } => {
                stdout.write_all(delta.as_bytes())?;
                stdout.flush()?;
            }
            StreamEvent::ToolCall { delta } => {
                info!(index = delta.index, name = ?delta.name, "tool call delta");
            }
            StreamEvent::Done {
                provider,
                model,
                usage,
                cost,
                ..
            } => {
                writeln!(stdout)?;
                info!(
                    provider = %provider,
                    model = %model,
                    prompt_tokens = usage.prompt_tokens,
                    completion_tokens = usage.completion_tokens,
                    cost_usd = cost.total_cost,
                    "completion finished"
                );
            }
        }
    }

    manager.destroy().await;
    Ok(())
}
