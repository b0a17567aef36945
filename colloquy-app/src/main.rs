//! Colloquy headless host.
//!
//! Wires the HTTP recognition/completion boundaries and the credential pool
//! into the engine, echoes the conversation to the terminal, and stops
//! cleanly on Ctrl-C. Speech output is discarded here — a host with a
//! synthesis backend swaps `NullRenderer` for its own `SpeechRenderer`.

mod settings;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use colloquy_core::{
    ColloquyEngine, HttpCompletionClient, HttpRecognizer, KeyPool, NullRenderer, RecognizerHandle,
};
use settings::{default_settings_path, load_settings};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let path = default_settings_path();
    let mut settings = load_settings(&path);
    settings.normalize();
    info!(settings_path = %path.display(), "settings loaded");

    let keys = KeyPool::from_env(&settings.credential_env_prefix, settings.rotation_limits())
        .with_context(|| {
            format!(
                "no API credentials configured — set {}1..N",
                settings.credential_env_prefix
            )
        })?;

    let recognizer = RecognizerHandle::new(HttpRecognizer::new(
        settings.recognition_url.clone(),
        settings.recognition_model.clone(),
        settings.recognition_api_key.clone(),
    )?);
    let completion = Arc::new(HttpCompletionClient::new(settings.completion_url.clone())?);

    let engine = Arc::new(ColloquyEngine::new(
        settings.to_engine_config(),
        keys,
        recognizer,
        completion,
        Arc::new(NullRenderer),
    ));

    let mut display_rx = engine.subscribe_display();
    let mut status_rx = engine.subscribe_status();

    engine.start()?;

    let display_task = tokio::spawn(async move {
        while let Ok(event) = display_rx.recv().await {
            let speaker = if event.is_user { "you" } else { "assistant" };
            println!("[{speaker}] {}", event.text);
        }
    });

    let status_task = tokio::spawn(async move {
        while let Ok(event) = status_rx.recv().await {
            info!(
                status = ?event.status,
                detail = event.detail.as_deref().unwrap_or(""),
                "engine status"
            );
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("ctrl-c received — shutting down");
    engine.stop()?;

    let snap = engine.diagnostics_snapshot();
    info!(
        chunks_in = snap.chunks_in,
        utterances = snap.utterances_emitted,
        completions = snap.completion_calls,
        rotations = snap.rotations,
        "session diagnostics"
    );

    // Let the workers drain their queues before the runtime tears down
    tokio::time::sleep(Duration::from_millis(300)).await;
    display_task.abort();
    status_task.abort();

    Ok(())
}
