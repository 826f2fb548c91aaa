use std::{fs, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use client_core::{ChatError, ChatSession, MemoryTransport, Scripted};
use tracing::{info, warn};

mod config;
mod fixture;
mod logging;
mod snapshot;

use config::{Settings, DEFAULT_CONFIG_PATH};
use fixture::{Fixture, Step};
use snapshot::Snapshot;

/// Replays a recorded chat fixture and prints the reconciled state.
#[derive(Parser, Debug)]
struct Args {
    /// JSON fixture with seed data and steps.
    fixture: PathBuf,
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    viewer: Option<String>,
    #[arg(long)]
    event_buffer: Option<usize>,
    #[arg(long)]
    recall_placeholder: Option<String>,
    /// Print the snapshot as JSON.
    #[arg(long)]
    json: bool,
}

impl Args {
    fn apply(&self, settings: &mut Settings) {
        if let Some(v) = &self.viewer {
            settings.viewer = Some(v.clone());
        }
        if let Some(v) = self.event_buffer {
            settings.event_buffer = v;
        }
        if let Some(v) = &self.recall_placeholder {
            settings.recall_placeholder = v.clone();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();
    let args = Args::parse();

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let mut settings = config::load_settings(&config_path, args.config.is_some())?;
    args.apply(&mut settings);

    let raw = fs::read_to_string(&args.fixture)
        .with_context(|| format!("failed to read fixture '{}'", args.fixture.display()))?;
    let fixture = Fixture::from_json(&raw)
        .with_context(|| format!("invalid fixture '{}'", args.fixture.display()))?;

    let viewer = fixture.viewer_for(settings.viewer.as_deref());
    info!(viewer = %viewer.user_id, steps = fixture.steps.len(), "starting replay");

    let mut transport = MemoryTransport::new(viewer.clone(), settings.event_buffer)
        .with_conversations(fixture.conversations.clone());
    for (conversation_id, history) in &fixture.histories {
        transport = transport.with_history(conversation_id.clone(), history.clone());
    }
    let transport = Arc::new(transport);
    let session = ChatSession::new(viewer, transport.clone(), settings.session_config());
    session.connect().await.context("failed to connect")?;

    for (index, step) in fixture.steps.into_iter().enumerate() {
        if let Err(err) = run_step(&session, &transport, step).await {
            warn!(step = index, %err, "step failed");
        }
    }

    let snapshot = Snapshot::capture(&session).await;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        print!("{snapshot}");
    }
    Ok(())
}

async fn run_step(
    session: &ChatSession,
    transport: &MemoryTransport,
    step: Step,
) -> Result<(), ChatError> {
    match step {
        // Applied inline so the replay is deterministic.
        Step::Push(event) => session.handle_push(event).await,
        Step::LoadHistory { conversation_id } => session.load_history(&conversation_id).await?,
        Step::Select { conversation_id } => session.select_conversation(&conversation_id).await?,
        Step::Send {
            conversation_id,
            content,
            reply_to,
        } => {
            let id = session
                .send_message(&conversation_id, &content, reply_to)
                .await?;
            info!(conversation_id = %conversation_id, message_id = %id, "sent");
        }
        Step::Retry {
            conversation_id,
            message_id,
        } => session.retry_send(&conversation_id, &message_id).await?,
        Step::Edit {
            conversation_id,
            message_id,
            content,
        } => {
            session
                .edit_message(&conversation_id, &message_id, &content)
                .await?
        }
        Step::Recall {
            conversation_id,
            message_id,
            scope,
        } => {
            session
                .recall_message(&conversation_id, &message_id, scope)
                .await?
        }
        Step::Pin {
            conversation_id,
            message_id,
            pinned,
        } => session.set_pinned(&conversation_id, &message_id, pinned).await?,
        Step::React {
            conversation_id,
            message_id,
            icon,
        } => session.react(&conversation_id, &message_id, &icon).await?,
        Step::ScriptAck { request, ack } => transport.script(request, Scripted::Ack(ack)).await,
        Step::ScriptFailure { request, error } => {
            transport
                .script(request, Scripted::Fail(ChatError::from(error)))
                .await
        }
    }
    Ok(())
}
