use std::net::IpAddr;
use std::path::PathBuf;

use clap::Parser;
use lan_messenger::p2p::{LanNode, NetworkConfig, NodeEvent};
use lan_messenger::PeerError;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(about = "Serverless LAN messenger peer", author, version)]
struct Cli {
    /// Name announced to other peers
    #[arg(long = "name", default_value = "Unknown")]
    name: String,

    /// Directory for the identity, groups and message history
    #[arg(long = "storage-dir", value_name = "DIR")]
    storage_dir: Option<PathBuf>,

    /// Address peers reach us at (resolved automatically when omitted)
    #[arg(long = "local-address")]
    local_address: Option<IpAddr>,

    /// Address to bind the sockets to
    #[arg(long = "bind", default_value = "0.0.0.0")]
    bind: IpAddr,

    /// Destination of presence broadcasts
    #[arg(long = "broadcast", default_value = "255.255.255.255")]
    broadcast: IpAddr,

    #[arg(long = "discovery-port", default_value_t = 50000)]
    discovery_port: u16,

    #[arg(long = "messaging-port", default_value_t = 50001)]
    messaging_port: u16,

    /// Disable UDP discovery (peers must then be addressed directly)
    #[arg(long = "disable-discovery", default_value_t = false)]
    disable_discovery: bool,

    /// Bind outbound connections to the local address
    #[arg(long = "pin-source", default_value_t = false)]
    pin_source: bool,
}

const HELP: &str = "\
commands:
  peers                          list discovered peers
  keys <ip>                      exchange keys with a peer
  msg <ip> <text>                send an encrypted direct message
  multi <ip,ip,...> <text>       send the same message to several peers
  history [ip]                   show direct messages
  search <word>                  search direct messages
  group create <name> <ip,...>   create a group
  group send <name> <text>       message a group
  group show <name>              members and history of a group
  groups                         list groups
  whoami                         show our identity
  quit";

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    let config = NetworkConfig {
        display_name: cli.name,
        local_address: cli.local_address,
        bind_address: cli.bind,
        broadcast_address: cli.broadcast,
        discovery_port: cli.discovery_port,
        messaging_port: cli.messaging_port,
        storage_dir: cli.storage_dir,
        enable_discovery: !cli.disable_discovery,
        pin_source_address: cli.pin_source,
        ..NetworkConfig::default()
    };

    let node = match LanNode::start(config).await {
        Ok(node) => node,
        Err(e) => {
            eprintln!("Peer node failed: {e}");
            std::process::exit(1);
        }
    };

    let mut events = node.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(skipped)) => warn!("Missed {} events", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });

    info!(
        "Peer {} running at {}. Type 'help' for commands, Ctrl+C to stop.",
        node.identity().label(),
        node.local_address()
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line == "quit" {
                        break;
                    }
                    if let Err(e) = run_command(&node, line).await {
                        error!("{}", e);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!("Cannot read stdin: {}", e);
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    node.shutdown().await;
}

async fn run_command(node: &LanNode, line: &str) -> Result<(), PeerError> {
    let (command, rest) = split_word(line);
    match command {
        "" => {}
        "help" => println!("{}", HELP),
        "peers" => {
            for peer in node.peers() {
                println!("{:<16} {}", peer.address, peer.display_name);
            }
        }
        "keys" => {
            node.exchange_keys(parse_address(rest)?).await?;
            println!("keys exchanged");
        }
        "msg" => {
            let (address, text) = split_word(rest);
            node.send_direct_message(parse_address(address)?, text).await?;
        }
        "multi" => {
            let (list, text) = split_word(rest);
            let report = node.send_multicast(&parse_address_list(list)?, text).await;
            for (address, delivered) in report {
                println!("{:<16} {}", address, if delivered { "ok" } else { "failed" });
            }
        }
        "history" => {
            let messages = if rest.is_empty() {
                node.messages()
            } else {
                node.messages_with(&parse_address(rest)?)
            };
            for m in messages {
                println!("[{}] {:?} {}: {}", m.timestamp, m.direction, m.peer_address, m.text);
            }
        }
        "search" => {
            for m in node.engine().search_messages(rest) {
                println!("{:?} {}: {}", m.direction, m.peer_address, m.text);
            }
        }
        "group" => run_group_command(node, rest).await?,
        "groups" => {
            for group in node.groups() {
                println!("{} ({} members)", group.name, group.members.len());
            }
        }
        "whoami" => {
            let identity = node.identity();
            println!(
                "{} at {} key {}",
                identity.label(),
                node.local_address(),
                identity.fingerprint()
            );
        }
        other => println!("unknown command {:?}, try 'help'", other),
    }
    Ok(())
}

async fn run_group_command(node: &LanNode, line: &str) -> Result<(), PeerError> {
    let (action, rest) = split_word(line);
    let (name, rest) = split_word(rest);
    match action {
        "create" => {
            let members = if rest.is_empty() {
                Vec::new()
            } else {
                parse_address_list(rest)?
            };
            let creation = node.create_group(name, &members).await?;
            for member in &creation.incomplete {
                println!("could not invite {}", member);
            }
        }
        "send" => {
            let report = node.send_group_message(name, rest).await?;
            let failed = report.values().filter(|ok| !**ok).count();
            println!("sent to {} member(s), {} failed", report.len() - failed, failed);
        }
        "show" => {
            let group = node
                .group_coordinator()
                .group(name)
                .ok_or_else(|| PeerError::State(format!("unknown group {}", name)))?;
            let members: Vec<String> = group.members.iter().map(|m| m.to_string()).collect();
            println!("members: {}", members.join(", "));
            for m in group.messages {
                println!("{}: {}", m.sender, m.text);
            }
        }
        other => println!("unknown group action {:?}", other),
    }
    Ok(())
}

fn print_event(event: &NodeEvent) {
    match event {
        NodeEvent::PeerDiscovered {
            address,
            display_name,
        } => println!("+ {} ({})", display_name, address),
        NodeEvent::PeerLost { address } => println!("- {}", address),
        NodeEvent::DirectMessage { address, text } => println!("{}> {}", address, text),
        NodeEvent::GroupMessage {
            group,
            address,
            text,
        } => println!("[{}] {}> {}", group, address, text),
        NodeEvent::Log(text) => println!("* {}", text),
    }
}

fn split_word(line: &str) -> (&str, &str) {
    let line = line.trim_start();
    match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim_start()),
        None => (line, ""),
    }
}

fn parse_address(text: &str) -> Result<IpAddr, PeerError> {
    text.trim()
        .parse()
        .map_err(|_| PeerError::State(format!("invalid address {:?}", text)))
}

fn parse_address_list(text: &str) -> Result<Vec<IpAddr>, PeerError> {
    text.split(',')
        .filter(|s| !s.trim().is_empty())
        .map(parse_address)
        .collect()
}

fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .try_init();
    });
}
