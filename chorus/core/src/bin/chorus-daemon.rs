//! chorus-daemon
//!
//! Wires the concurrency core to a line-based surface: inbound messages
//! arrive on stdin as `channel<TAB>sender<TAB>text`, generated replies are
//! printed to stdout. Ctrl-C drains every worker through its final persist
//! before exiting.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use chorus_core::{
    BackendDescriptor, ChannelKey, ChorusConfig, ConversationRegistry, EndpointPool,
    FileStore, GenerationSettings, InboundMessage, OpenAiBackend, ResponderAction,
    ResponderTable, UnavailableTools, WorkerDeps,
};

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = ChorusConfig::load(config_path.as_deref()).context("loading configuration")?;
    if config.backends.is_empty() {
        anyhow::bail!("no backends configured; add [[backends]] entries to chorus.toml");
    }

    let mut pool = EndpointPool::new(config.retry_interval);
    for settings in &config.backends {
        pool.register(
            BackendDescriptor {
                id: settings.id.clone(),
                model: settings.model.clone(),
                total_slots: settings.slots,
            },
            Arc::new(OpenAiBackend::from_settings(settings)),
        );
    }
    let pool = Arc::new(pool);

    let store = Arc::new(FileStore::new(config.data_dir.clone()));
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
    let deps = Arc::new(WorkerDeps {
        pool,
        tools: Arc::new(UnavailableTools),
        store,
        outbound: outbound_tx,
        settings: config.worker.clone(),
        generation: GenerationSettings {
            model: config.default_model.clone(),
            lease_timeout: config.lease_timeout,
        },
        system_prompt: config.system_prompt.clone(),
    });
    let registry = ConversationRegistry::new(deps, config.registry.clone());

    let printer = tokio::spawn(async move {
        while let Some(reply) = outbound_rx.recv().await {
            println!("[{}] {}", reply.channel, reply.text);
        }
    });

    let table = ResponderTable::builtin();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    info!(model = %config.default_model, backends = config.backends.len(), "chorus daemon ready");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
            line = lines.next_line() => match line.context("reading stdin")? {
                Some(line) => handle_line(&registry, &table, &config.bot_name, &line),
                None => {
                    info!("stdin closed");
                    break;
                }
            }
        }
    }

    registry.shutdown().await;
    printer.abort();
    Ok(())
}

fn handle_line(
    registry: &ConversationRegistry,
    table: &ResponderTable,
    bot_name: &str,
    line: &str,
) {
    if line.trim().is_empty() {
        return;
    }

    let mut parts = line.splitn(3, '\t');
    let (Some(channel), Some(sender), Some(text)) = (parts.next(), parts.next(), parts.next())
    else {
        warn!(%line, "malformed input, expected channel<TAB>sender<TAB>text");
        return;
    };

    let mentioned = text.to_lowercase().contains(&bot_name.to_lowercase());
    let mut rng = rand::thread_rng();
    match table.decide(text, mentioned, &mut rng) {
        None => {}
        Some(ResponderAction::CannedReply(reply)) => println!("[{channel}] {reply}"),
        Some(ResponderAction::Engage) => registry.dispatch(
            &ChannelKey::from(channel),
            InboundMessage {
                sender: sender.to_string(),
                text: text.to_string(),
            },
        ),
    }
}
