mod console;
mod simulator;

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use pairlink_core::logging;
use pairlink_core::{JsonPeerMemory, PairlinkConfig};
use pairlink_network::transfer::TransferSource;
use pairlink_network::{
    CommandDispatcher, DeviceIdentity, LanBackend, NodeEvent, NodeHandle, PairNode, Role,
    TransferCoordinator,
};

use crate::console::ConsoleCommand;
use crate::simulator::LoggingSimulator;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// `pairlink [initiator|responder] [device name]` overrides the stored role
/// and name for this run.
fn apply_args(config: &mut PairlinkConfig, mut args: impl Iterator<Item = String>) -> Result<()> {
    if let Some(role) = args.next() {
        config.role = match role.as_str() {
            "initiator" => Role::Initiator,
            "responder" => Role::Responder,
            other => bail!("unknown role '{other}' (expected initiator or responder)"),
        };
    }
    let name: Vec<String> = args.collect();
    if !name.is_empty() {
        config.device_name = name.join(" ");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut config = PairlinkConfig::load().context("Failed to load configuration")?;
    apply_args(&mut config, std::env::args().skip(1))?;

    let _log_guard = logging::init_logging(&config.log_level)?;
    info!(
        "Starting pairlink v{VERSION} as '{}' ({})",
        config.device_name, config.role
    );

    let identity = DeviceIdentity::load_or_generate(
        &PairlinkConfig::identity_path()?,
        config.device_name.clone(),
        config.role,
    );
    let memory = Arc::new(JsonPeerMemory::open(PairlinkConfig::session_path()?));
    let backend = Arc::new(LanBackend::new(config.network.clone()));
    let (node, events) = PairNode::new(identity, config.network.clone(), backend)
        .with_memory(memory)
        .spawn();

    if let Err(e) = node.start().await {
        error!("Pairing unavailable: {e}");
        println!("pairing unavailable ({e}); type 'restart' to retry");
    }

    let dispatcher = CommandDispatcher::new(Box::new(LoggingSimulator)).on_permission_denied(
        |command, e| warn!("Grant input permission to apply {}: {e}", command.kind()),
    );
    let printer = tokio::spawn(handle_events(node.clone(), events, dispatcher));

    let coordinator =
        TransferCoordinator::new(Arc::new(node.clone()), config.network.transfer.clone());
    run_console(&node, &coordinator).await?;

    info!("Shutting down");
    let _ = node.stop().await;
    printer.abort();
    Ok(())
}

async fn handle_events(
    node: NodeHandle,
    mut events: mpsc::Receiver<NodeEvent>,
    mut dispatcher: CommandDispatcher,
) {
    while let Some(event) = events.recv().await {
        match event {
            NodeEvent::StateChanged(snapshot) => match snapshot.active_peer {
                Some(peer) => println!("[{:?}] {peer}", snapshot.state),
                None => println!("[{:?}]", snapshot.state),
            },
            NodeEvent::PeerFound(peer) => println!("+ {peer}"),
            NodeEvent::PeerLost(id) => println!("- {id}"),
            NodeEvent::CommandReceived { from, command } => {
                info!("{} from {from}", command.kind());
                // The node may be blocked emitting into this stream.
                if let Some(reply) = dispatcher.dispatch(command) {
                    let node = node.clone();
                    tokio::spawn(async move {
                        if let Err(e) = node.send(reply).await {
                            warn!("Failed to answer {from}: {e}");
                        }
                    });
                }
            }
            NodeEvent::ResourceReceived { name, path, .. } => {
                println!("received '{name}' -> {}", path.display());
                dispatcher.resource_received(path);
            }
            NodeEvent::ReconnectStarted { target } => println!("reconnecting to '{target}'..."),
            NodeEvent::ReconnectGaveUp { target, attempts } => {
                println!("could not reach '{target}' after {attempts} attempts");
            }
        }
    }
}

async fn run_console(node: &NodeHandle, coordinator: &TransferCoordinator) -> Result<()> {
    println!("pairlink {VERSION} - type 'help' for commands");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        let command = match console::parse(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(message) => {
                println!("{message}");
                continue;
            }
        };

        match command {
            ConsoleCommand::Quit => break,
            ConsoleCommand::Help => println!("{}", console::HELP),
            ConsoleCommand::Status => {
                let snapshot = node.snapshot();
                match snapshot.active_peer {
                    Some(peer) => println!("{:?} with {peer}", snapshot.state),
                    None => println!("{:?}", snapshot.state),
                }
            }
            ConsoleCommand::Peers => {
                let peers = node.discovered_peers().await?;
                if peers.is_empty() {
                    println!("no peers discovered");
                }
                for peer in peers {
                    println!("  {peer} [{}]", peer.role);
                }
            }
            ConsoleCommand::Connect(name) => match node.find_peer_by_name(&name).await? {
                Some(peer) => {
                    if let Err(e) = node.connect(&peer.id).await {
                        println!("connect failed: {e}");
                    }
                }
                None => println!("no peer named '{name}'"),
            },
            ConsoleCommand::Disconnect => node.disconnect().await?,
            ConsoleCommand::Restart => {
                if let Err(e) = node.restart().await {
                    println!("restart failed: {e}");
                }
            }
            ConsoleCommand::Send(command) => {
                if let Err(e) = node.send(command).await {
                    println!("send failed: {e}");
                }
            }
            ConsoleCommand::Photos(paths) => {
                let sources = paths
                    .into_iter()
                    .map(|path| {
                        let name = path
                            .file_name()
                            .map(|n| n.to_string_lossy().into_owned())
                            .unwrap_or_else(|| path.display().to_string());
                        TransferSource::new(name, path)
                    })
                    .collect();
                let connected = node.snapshot().is_connected();
                match coordinator.start_transfer(sources, connected).await {
                    Ok(batch) => {
                        println!("sending {} file(s)", batch.total());
                        tokio::spawn(async move {
                            let report = batch.finished().await;
                            println!(
                                "batch {:?}: {}/{} delivered",
                                report.result(),
                                report.success_count,
                                report.total
                            );
                        });
                    }
                    Err(e) => println!("transfer not started: {e}"),
                }
            }
        }
    }
    Ok(())
}
