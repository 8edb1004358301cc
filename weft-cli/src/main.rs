use std::io::Write as _;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use weft_core::config::OverlayConfig;
use weft_core::logging::{init_logging_with_config, LogConfig, LogHandle, LogLevel};
use weft_core::WeftNode;

#[derive(Parser, Debug)]
#[command(name = "weft")]
#[command(version, about = "Run a weft overlay node", long_about = None)]
struct Args {
    /// The server port to bind to; 0 picks an ephemeral port
    #[arg(short, long, default_value_t = 0)]
    port: u16,

    /// An existing node to connect to; empty starts a standalone overlay
    #[arg(short, long, default_value = "")]
    connect: String,

    /// Turn on debug message printing
    #[arg(short, long)]
    debug: bool,

    /// Set the log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Enable JSON formatted logging
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.debug {
        LogLevel::Debug
    } else {
        args.log_level.parse().unwrap_or_else(|_| {
            eprintln!("Invalid log level {:?}, using 'info'", args.log_level);
            LogLevel::Info
        })
    };
    let log = init_logging_with_config(LogConfig::new(level).json_format(args.json_logs))?;

    let mut config = OverlayConfig::from_env()?;
    config.port = args.port;
    if !args.connect.is_empty() {
        config.seed = Some(args.connect.clone());
    }
    config.validate()?;

    match (config.port, config.seed.as_deref()) {
        (0, None) => info!("starting a standalone node on an ephemeral port"),
        (0, Some(seed)) => info!(%seed, "starting a node on an ephemeral port"),
        (port, None) => info!(port, "starting a standalone node"),
        (port, Some(seed)) => info!(port, %seed, "starting a node"),
    }

    let node = WeftNode::start(config).await?;
    println!("Started node {} at {}", node.id(), node.address());

    shell(node, log).await
}

async fn shell(node: Arc<WeftNode>, log: LogHandle) -> Result<()> {
    print_help();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };

        let mut parts = line.split_whitespace();
        let Some(command) = parts.next() else {
            continue;
        };
        let args: Vec<&str> = parts.collect();

        match command {
            "help" => print_help(),
            "table" => println!("{}", node.routing_table_dump()),
            "backpointers" => println!("{}", node.backpointers_dump()),
            "replicas" => println!("{}", node.locations_dump()),
            "list" => {
                for key in node.blob_keys() {
                    println!("{}", key);
                }
            }
            "put" => {
                if args.len() != 2 {
                    println!("USAGE: put <key> <value>");
                    continue;
                }
                match node.store(args[0], args[1].as_bytes().to_vec()).await {
                    Ok(()) => println!(
                        "Successfully stored value ({}) at key ({})",
                        args[1], args[0]
                    ),
                    Err(e) => eprintln!("{}", e),
                }
            }
            "lookup" => {
                if args.len() != 1 {
                    println!("USAGE: lookup <key>");
                    continue;
                }
                match node.lookup(args[0]).await {
                    Ok(replicas) => {
                        let rendered: Vec<String> =
                            replicas.iter().map(|node| node.to_string()).collect();
                        println!("{}: [{}]", args[0], rendered.join(", "));
                    }
                    Err(e) => eprintln!("{}", e),
                }
            }
            "get" => {
                if args.len() != 1 {
                    println!("USAGE: get <key>");
                    continue;
                }
                match node.get(args[0]).await {
                    Ok(bytes) => println!("{}: {}", args[0], String::from_utf8_lossy(&bytes)),
                    Err(e) => eprintln!("{}", e),
                }
            }
            "remove" => {
                if args.len() != 1 {
                    println!("USAGE: remove <key>");
                    continue;
                }
                if node.remove(args[0]) {
                    println!("Successfully removed {}", args[0]);
                } else {
                    println!("This node is not advertising {}", args[0]);
                }
            }
            "debug" => {
                match args.first().map(|s| s.to_lowercase()).as_deref() {
                    Some("on") | Some("true") => {
                        log.set_debug(true)?;
                        println!("Debug turned on");
                    }
                    Some("off") | Some("false") => {
                        log.set_debug(false)?;
                        println!("Debug turned off");
                    }
                    _ => println!("USAGE: debug <on|off>"),
                }
            }
            "leave" => {
                node.leave().await;
                println!("Left the overlay gracefully");
            }
            "kill" => {
                node.kill();
                println!("Left the overlay abruptly");
            }
            "exit" => break,
            other => println!("Unknown command {:?}; try 'help'", other),
        }
    }

    Ok(())
}

fn print_help() {
    println!("Commands:");
    println!(" - help                    Prints this help message");
    println!(" - table                   Prints this node's routing table");
    println!(" - backpointers            Prints this node's backpointers");
    println!(" - replicas                Prints the advertised objects registered to this node");
    println!();
    println!(" - put <key> <value>       Stores the pair on the local node and advertises the key");
    println!(" - lookup <key>            Looks up the key and prints its advertisers");
    println!(" - get <key>               Looks up the key, then fetches the value from a replica");
    println!(" - remove <key>            Removes the key from the local store and stops advertising");
    println!(" - list                    Lists the blobs stored and advertised by the local node");
    println!();
    println!(" - debug on|off            Turn debug logging on or off; off by default");
    println!();
    println!(" - leave                   Gracefully leave the overlay");
    println!(" - kill                    Leave the overlay without graceful exit");
    println!(" - exit                    Quit this shell");
}
