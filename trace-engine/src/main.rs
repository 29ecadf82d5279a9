use tokio::io::AsyncWriteExt;
use trace_engine::actors::connection::SessionKey;
use trace_engine::actors::event_bus::{BusPayload, Topic};
use trace_engine::{EngineConfig, TraceEngine};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let config = EngineConfig::from_env()?;
    let session_id = config
        .session_id
        .clone()
        .ok_or_else(|| anyhow::anyhow!("TRACE_ENGINE_SESSION_ID is required"))?;
    let mut key = SessionKey::new(session_id);
    if let Some(model_id) = config.model_id.clone() {
        key = key.with_model(model_id);
    }

    let engine = TraceEngine::start(config).await?;
    let mut events = engine.watch(&[Topic::ActivationChanged]).await?;

    // The poll fallback keeps running if the socket never opens.
    if let Err(e) = engine.connect(key.clone()).await {
        tracing::warn!(connection_id = %key.connection_id(), error = %e, "Running without a live connection");
    }

    let mut stdout = tokio::io::stdout();
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                if let BusPayload::ActivationChanged(snapshot) = event.payload {
                    let mut line = serde_json::to_string(&snapshot)?;
                    line.push('\n');
                    stdout.write_all(line.as_bytes()).await?;
                    stdout.flush().await?;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted; shutting down");
                break;
            }
        }
    }

    engine.shutdown().await;
    Ok(())
}
