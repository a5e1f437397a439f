//! Line-oriented front end for the prompt executor.
//!
//! Reads one JSON command per line on stdin and writes every text event as a
//! JSON line on stdout. Logs go to stderr. Set `PROMPT_WORKER_CONFIG` to a
//! YAML file to override the defaults.

use anyhow::Context;
use async_broadcast::RecvError;
use serde::Deserialize;
use serde_json::json;
use std::io::BufRead;
use std::sync::Arc;
use tracing::{warn, Level};
use tracing_subscriber::FmtSubscriber;

use prompt_executor::events::{BroadcastEventSink, LoggingEventSink, Notifier};
use prompt_executor::models::ResidentModels;
use prompt_executor::nodes::ActionRegistry;
use prompt_executor::server::{PromptServer, SubmitRequest};
use prompt_executor::WorkerConfig;

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Command {
    Submit(SubmitRequest),
    Interrupt {
        #[serde(default)]
        prompt_id: Option<String>,
    },
    FreeMemory,
    UnloadModels,
    Delete {
        prompt_id: String,
    },
    Wipe,
    Queue,
    History {
        #[serde(default)]
        limit: Option<usize>,
    },
}

fn handle_line(server: &PromptServer, line: &str) -> anyhow::Result<()> {
    let command: Command = serde_json::from_str(line).context("invalid command")?;
    let response = match command {
        Command::Submit(request) => serde_json::to_value(server.submit(request)?)?,
        Command::Interrupt { prompt_id } => {
            json!({ "interrupted": server.request_interrupt(prompt_id.as_deref()) })
        }
        Command::FreeMemory => {
            server.request_free_memory();
            json!({ "ok": true })
        }
        Command::UnloadModels => {
            server.request_unload_models();
            json!({ "ok": true })
        }
        Command::Delete { prompt_id } => json!({ "deleted": server.delete_pending(&prompt_id) }),
        Command::Wipe => json!({ "removed": server.wipe_pending() }),
        Command::Queue => serde_json::to_value(server.get_queue_state())?,
        Command::History { limit } => serde_json::to_value(server.get_history(limit))?,
    };
    println!("{}", json!({ "response": response }));
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;

    let config = match std::env::var("PROMPT_WORKER_CONFIG") {
        Ok(path) => WorkerConfig::from_yaml_file(&path)?,
        Err(_) => WorkerConfig::default(),
    };

    let broadcast = Arc::new(BroadcastEventSink::new(config.event_buffer));
    let mut events = broadcast.subscribe();
    let notifier = Notifier::new()
        .with_sink(Arc::new(LoggingEventSink))
        .with_sink(broadcast.clone());
    drop(broadcast);

    let server = Arc::new(PromptServer::new(
        config,
        ActionRegistry::with_builtins(),
        notifier,
    )?);
    let worker = server.spawn_worker(Arc::new(ResidentModels::new()))?;

    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(envelope) => {
                    if let Some(value) = envelope.to_json() {
                        println!("{}", value);
                    }
                }
                Err(RecvError::Overflowed(missed)) => warn!("Missed {} events", missed),
                Err(RecvError::Closed) => break,
            }
        }
    });

    tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let line = line.context("reading stdin")?;
            if line.trim().is_empty() {
                continue;
            }
            if let Err(err) = handle_line(&server, &line) {
                println!("{}", json!({ "error": format!("{:#}", err) }));
            }
        }
        server.queue().join(None);
        worker.shutdown()?;
        Ok(())
    })
    .await??;

    printer.await?;
    Ok(())
}
