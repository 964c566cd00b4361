// vuelink — desktop CLI for the Vuelink advertisement mesh
//
// The real BLE adapters live in the platform apps; this binary drives the
// core over an in-process loopback bus. `demo` runs a three-node exchange
// showing splitting, reassembly, forwarding, and duplicate suppression;
// the history/snapshot commands operate a sled-backed store.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use tokio::sync::broadcast;
use vuelink_core::{
    FlightUpdateType, LoopbackBus, Message, Priority, ReceivedMessage, StoredMessage, Vuelink,
    VuelinkConfig,
};

#[derive(Parser)]
#[command(name = "vuelink")]
#[command(about = "Vuelink — offline BLE advertisement mesh for flight operations", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a three-node loopback exchange (sender, relay, receiver)
    Demo {
        /// Text to send in the long-message leg of the demo
        #[arg(short, long)]
        message: Option<String>,
    },
    /// List the stored message history
    History {
        /// Path of the sled store
        #[arg(short, long, default_value = ".vuelink")]
        storage: String,
    },
    /// Wipe the stored message history
    ClearHistory {
        #[arg(short, long, default_value = ".vuelink")]
        storage: String,
    },
    /// Print the history as a shareable snapshot string
    Export {
        #[arg(short, long, default_value = ".vuelink")]
        storage: String,
    },
    /// Import a snapshot string received out-of-band
    Import {
        #[arg(short, long, default_value = ".vuelink")]
        storage: String,
        /// URL-safe base64 snapshot
        snapshot: String,
    },
    /// Advertise a text message and store the receipt
    SendText {
        #[arg(short, long, default_value = ".vuelink")]
        storage: String,
        /// Message text
        text: String,
        /// Set the repeat flag so peers re-forward once
        #[arg(short, long)]
        repeat: bool,
        #[arg(value_enum, short, long, default_value = "medium")]
        priority: PriorityKind,
    },
    /// Advertise a flight update and store the receipt
    SendFlight {
        #[arg(short, long, default_value = ".vuelink")]
        storage: String,
        /// Flight identifier, e.g. FL123
        flight: String,
        /// Kind of update
        #[arg(value_enum, default_value = "general")]
        update: UpdateKind,
        /// Set the repeat flag so peers re-forward once
        #[arg(short, long)]
        repeat: bool,
        #[arg(value_enum, short, long, default_value = "medium")]
        priority: PriorityKind,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum UpdateKind {
    General,
    GateChange,
    Boarding,
    Delay,
    Cancellation,
    Emergency,
}

impl From<UpdateKind> for FlightUpdateType {
    fn from(kind: UpdateKind) -> Self {
        match kind {
            UpdateKind::General => FlightUpdateType::General,
            UpdateKind::GateChange => FlightUpdateType::GateChange,
            UpdateKind::Boarding => FlightUpdateType::Boarding,
            UpdateKind::Delay => FlightUpdateType::Delay,
            UpdateKind::Cancellation => FlightUpdateType::Cancellation,
            UpdateKind::Emergency => FlightUpdateType::Emergency,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum PriorityKind {
    Low,
    Medium,
    High,
    Urgent,
    Emergency,
}

impl From<PriorityKind> for Priority {
    fn from(kind: PriorityKind) -> Self {
        match kind {
            PriorityKind::Low => Priority::Low,
            PriorityKind::Medium => Priority::Medium,
            PriorityKind::High => Priority::High,
            PriorityKind::Urgent => Priority::Urgent,
            PriorityKind::Emergency => Priority::Emergency,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Demo { message } => run_demo(message).await,
        Commands::History { storage } => show_history(&storage),
        Commands::ClearHistory { storage } => clear_history(&storage),
        Commands::Export { storage } => export_snapshot(&storage),
        Commands::Import { storage, snapshot } => import_snapshot(&storage, &snapshot),
        Commands::SendText {
            storage,
            text,
            repeat,
            priority,
        } => send_message(&storage, Message::text(text, repeat, priority.into())).await,
        Commands::SendFlight {
            storage,
            flight,
            update,
            repeat,
            priority,
        } => {
            send_message(
                &storage,
                Message::flight_update(flight, update.into(), repeat, priority.into()),
            )
            .await
        }
    }
}

fn demo_config() -> VuelinkConfig {
    VuelinkConfig::default()
        .with_dwell(Duration::from_millis(250))
        .with_chunk_gap(Duration::from_millis(100))
}

/// Open a node over a throwaway loopback adapter, just for its store.
fn storage_node(path: &str) -> Result<Vuelink> {
    let bus = LoopbackBus::new();
    Vuelink::with_storage(Arc::new(bus.adapter("cli")), VuelinkConfig::default(), path)
        .context("failed to open message store")
}

async fn run_demo(message: Option<String>) -> Result<()> {
    let bus = LoopbackBus::new();
    let config = demo_config();
    let sender = Vuelink::new(Arc::new(bus.adapter("sender")), config.clone())?;
    let relay = Vuelink::new(Arc::new(bus.adapter("relay")), config.clone())?;
    let receiver = Vuelink::new(Arc::new(bus.adapter("receiver")), config)?;

    relay.scan_start().await?;
    receiver.scan_start().await?;
    spawn_printer("relay", relay.subscribe());
    spawn_printer("receiver", receiver.subscribe());

    println!("{}", "— leg 1: plain text, no forwarding —".dimmed());
    let text = message.unwrap_or_else(|| {
        "Gate change: FL204 now boarding at B12, expect 15 minute delay".to_string()
    });
    let done = sender
        .advertise(Message::text(text, false, Priority::Medium), None)
        .await?;
    done.await.ok();

    println!("{}", "— leg 2: urgent flight update, forwarded —".dimmed());
    let done = sender
        .advertise(
            Message::flight_update("FL204", FlightUpdateType::Delay, false, Priority::Urgent),
            None,
        )
        .await?;
    done.await.ok();
    tokio::time::sleep(Duration::from_millis(800)).await;

    println!("{}", "— leg 3: duplicate send, suppressed —".dimmed());
    let done = sender
        .advertise(
            Message::flight_update("FL204", FlightUpdateType::Delay, false, Priority::Urgent),
            None,
        )
        .await?;
    done.await.ok();
    tokio::time::sleep(Duration::from_millis(500)).await;

    println!();
    println!(
        "receiver history: {} message(s), {} advertisement(s) heard",
        receiver.history().len().to_string().bold(),
        receiver.received_count()
    );
    println!(
        "relay history:    {} message(s), {} advertisement(s) heard",
        relay.history().len().to_string().bold(),
        relay.received_count()
    );
    Ok(())
}

fn spawn_printer(name: &'static str, mut events: broadcast::Receiver<ReceivedMessage>) {
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            let tag = format!("[{name}]");
            let forward = if event.will_forward {
                " → forwarding".yellow().to_string()
            } else {
                String::new()
            };
            let reassembled = if event.reassembled { " (reassembled)" } else { "" };
            println!(
                "{} from {}: {}{}{}",
                tag.cyan(),
                event.source.green(),
                describe(&event.message),
                reassembled.dimmed(),
                forward
            );
        }
    });
}

fn describe(message: &Message) -> String {
    match message {
        Message::GeneralBasic { content, .. } => {
            format!("basic ({} bytes)", content.len())
        }
        Message::GeneralText { text, .. } => format!("\"{text}\""),
        Message::FlightUpdate {
            flight_id,
            update_type,
            ..
        } => format!("{flight_id} {update_type:?}").bold().to_string(),
        Message::FlightUpdateGeneral {
            flight_id, text, ..
        } => format!("{}: \"{text}\"", flight_id.bold()),
    }
}

fn show_history(storage: &str) -> Result<()> {
    let node = storage_node(storage)?;
    let history = node.history();
    if history.is_empty() {
        println!("{}", "history is empty".dimmed());
        return Ok(());
    }
    for stored in &history {
        print_stored(stored);
    }
    println!("{} message(s)", history.len().to_string().bold());
    Ok(())
}

fn print_stored(stored: &StoredMessage) {
    let when = stored
        .received_at
        .format("%Y-%m-%d %H:%M:%S")
        .to_string();
    let repeat = if stored.message.repeat() {
        " repeat".yellow().to_string()
    } else {
        String::new()
    };
    println!(
        "{}  {:?}{}  {}",
        when.dimmed(),
        stored.message.priority(),
        repeat,
        describe(&stored.message)
    );
}

fn clear_history(storage: &str) -> Result<()> {
    let node = storage_node(storage)?;
    let count = node.history().len();
    node.clear_history();
    println!("cleared {} message(s)", count.to_string().bold());
    Ok(())
}

fn export_snapshot(storage: &str) -> Result<()> {
    let node = storage_node(storage)?;
    let snapshot = node.export_snapshot()?;
    println!("{snapshot}");
    Ok(())
}

fn import_snapshot(storage: &str, snapshot: &str) -> Result<()> {
    let node = storage_node(storage)?;
    let accepted = node.import_snapshot(snapshot)?;
    println!(
        "{} new message(s), history now {}",
        accepted.to_string().bold(),
        node.history().len()
    );
    Ok(())
}

/// Advertise one message over a loopback pair whose receiving side persists
/// to the store, so the send exercises the whole radio path: split,
/// advertise, scan, dedup, history.
async fn send_message(storage: &str, message: Message) -> Result<()> {
    let bus = LoopbackBus::new();
    let sender = Vuelink::new(Arc::new(bus.adapter("cli-tx")), demo_config())?;
    let receiver = Vuelink::with_storage(Arc::new(bus.adapter("cli-rx")), demo_config(), storage)
        .context("failed to open message store")?;

    receiver.scan_start().await?;
    let mut events = receiver.subscribe();

    let done = sender.advertise(message, None).await?;
    if !done.await.unwrap_or(false) {
        bail!("advertisement sequence did not complete");
    }

    match tokio::time::timeout(Duration::from_secs(2), events.recv()).await {
        Ok(Ok(event)) => {
            let reassembled = if event.reassembled { " (reassembled)" } else { "" };
            println!(
                "{} {}{}",
                "sent".green(),
                describe(&event.message),
                reassembled.dimmed()
            );
        }
        _ => println!(
            "{}",
            "sent, but suppressed as a duplicate of stored history".dimmed()
        ),
    }
    receiver.scan_stop().await;
    println!("history now {} message(s)", receiver.history().len());
    Ok(())
}
