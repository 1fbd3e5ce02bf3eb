//! Nameserv - LLMNR and NetBIOS name service responder
//!
//! Answers LLMNR queries for configured host names and runs an NBNS name
//! server with registration, release, refresh and redirect support.

mod config;
mod error;
mod helpers;
mod llmnr;
mod logging;
mod nbns;
mod txid;
mod wire;

use config::{load_config, LlmnrConfig, NbnsConfig};
use llmnr::{LogHandler, RecordType, StaticHostHandler};
use logging::{LogSink, TracingSink};
use nbns::registry::spawn_cleanup;
use nbns::{Challenger, PacketHandler, RedirectManager, Registry, TcpServer, UdpServer};

use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args: Vec<String> = env::args().collect();

    // Parse command line arguments
    let mut config_path: Option<&str> = None;
    let mut query_name: Option<String> = None;
    let mut use_llmnr = true;
    let mut use_nbns = true;
    let mut force_debug = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                i += 1;
                config_path = args.get(i).map(|s| s.as_str());
            }
            "--query" | "-q" => {
                i += 1;
                query_name = args.get(i).cloned();
            }
            "--no-llmnr" => {
                use_llmnr = false;
            }
            "--no-nbns" => {
                use_nbns = false;
            }
            "--debug" => {
                force_debug = true;
            }
            "-h" | "--help" => {
                print_usage(&args[0]);
                return Ok(());
            }
            _ => {
                eprintln!("Unknown argument: {}", args[i]);
                print_usage(&args[0]);
                std::process::exit(1);
            }
        }
        i += 1;
    }

    // Load config from file
    let mut config = load_config(config_path)?;

    // CLI arguments override config file
    if !use_llmnr {
        config.llmnr = None;
    }
    if !use_nbns {
        config.nbns = None;
    }
    if force_debug {
        if let Some(llmnr) = config.llmnr.as_mut() {
            llmnr.debug = true;
        }
        if let Some(nbns) = config.nbns.as_mut() {
            nbns.debug = true;
        }
    }

    // Initialize logging system
    let _log_guard = logging::init_logging(&config.logging);
    logging::spawn_log_maintenance(&config.logging);

    tracing::debug!(config = ?config, "Configuration loaded");

    if let Some(name) = query_name {
        let llmnr = config.llmnr.clone().unwrap_or_default();
        return run_query(&name, &llmnr).await;
    }

    let sink: Arc<dyn LogSink> = Arc::new(TracingSink::new());
    let mut llmnr_servers = Vec::new();
    let mut nbns_udp = None;
    let mut nbns_tcp = None;

    if let Some(llmnr_config) = &config.llmnr {
        for network in &llmnr_config.networks {
            let server = start_llmnr(network, llmnr_config, &sink);
            println!("LLMNR responder on {} port {}", network, llmnr_config.port);
            llmnr_servers.push(server);
        }
        if !llmnr_config.hosts.is_empty() {
            println!("LLMNR hosts: {:?}", llmnr_config.hosts.keys().collect::<Vec<_>>());
        }
    }

    if let Some(nbns_config) = &config.nbns {
        let (udp, tcp) = start_nbns(nbns_config, &sink).await?;
        println!("NBNS server listening on udp://{}", nbns_config.listen);
        if tcp.is_some() {
            println!("NBNS server listening on tcp://{}", nbns_config.listen);
        }
        if nbns_config.challenge.enabled {
            println!(
                "NBNS ownership challenge: enabled (timeout={}ms, attempts={})",
                nbns_config.challenge.timeout_ms, nbns_config.challenge.attempts
            );
        }
        nbns_udp = Some(udp);
        nbns_tcp = tcp;
    }

    if llmnr_servers.is_empty() && nbns_udp.is_none() {
        eprintln!("Nothing to serve: both LLMNR and NBNS are disabled");
        std::process::exit(1);
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    for server in &llmnr_servers {
        server.close();
    }
    if let Some(udp) = &nbns_udp {
        udp.close();
    }
    if let Some(tcp) = &nbns_tcp {
        tcp.close();
    }

    Ok(())
}

fn start_llmnr(network: &str, config: &LlmnrConfig, sink: &Arc<dyn LogSink>) -> llmnr::Server {
    let server = llmnr::Server::with_port(network, config.port);
    server.set_sink(Arc::clone(sink));
    server.set_debug(config.debug);
    if config.debug {
        server.register_handler(LogHandler::new(Arc::clone(sink)));
    }
    server.register_handler(StaticHostHandler::from_config(&config.hosts));

    let running = server.clone();
    let network = network.to_string();
    tokio::spawn(async move {
        if let Err(e) = running.listen_and_serve().await {
            error!(network = %network, error = %e, "LLMNR server error");
        }
    });
    server
}

async fn start_nbns(
    config: &NbnsConfig,
    sink: &Arc<dyn LogSink>,
) -> Result<(Arc<UdpServer>, Option<Arc<TcpServer>>), Box<dyn std::error::Error + Send + Sync>> {
    let listen_addr: SocketAddr = config.listen.parse()?;

    let registry = Arc::new(Registry::new());
    spawn_cleanup(
        Arc::clone(&registry),
        Duration::from_secs(config.cleanup_interval_seconds.max(1)),
    );

    let mut handler = PacketHandler::new(Arc::clone(&registry))
        .with_lenient_release(config.lenient_release)
        .with_debug(config.debug, Arc::clone(sink));
    if config.challenge.enabled {
        handler = handler.with_challenger(Arc::new(Challenger::from_config(&config.challenge)));
    }
    if !config.redirects.is_empty() {
        let redirects = RedirectManager::from_config(&config.redirects)?;
        println!("NBNS redirects: {} scope(s)", redirects.len());
        handler = handler.with_redirects(Arc::new(redirects));
    }
    let handler = Arc::new(handler);

    let udp = Arc::new(
        UdpServer::bind(listen_addr, Arc::clone(&handler))
            .await?
            .with_timeouts(
                Duration::from_millis(config.udp_read_timeout_ms),
                Duration::from_millis(config.udp_write_timeout_ms),
            ),
    );
    let running = Arc::clone(&udp);
    tokio::spawn(async move {
        if let Err(e) = running.run().await {
            error!(error = %e, "NBNS UDP server error");
        }
    });

    let tcp = if config.tcp {
        let tcp = Arc::new(
            TcpServer::bind(listen_addr, handler)
                .await?
                .with_timeout(Duration::from_secs(config.tcp_timeout_seconds))
                .with_max_message(config.max_tcp_message),
        );
        let running = Arc::clone(&tcp);
        tokio::spawn(async move {
            if let Err(e) = running.run().await {
                error!(error = %e, "NBNS TCP server error");
            }
        });
        Some(tcp)
    } else {
        None
    };

    Ok((udp, tcp))
}

/// Resolve `name` over LLMNR multicast and print every answer.
async fn run_query(
    name: &str,
    config: &LlmnrConfig,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let client = llmnr::Client::new(Duration::from_millis(config.query_timeout_ms)).await?;
    let mut found = false;
    for qtype in [RecordType::A, RecordType::AAAA] {
        match client.query(name, qtype).await {
            Ok(response) => {
                for line in response.describe() {
                    println!("{}", line);
                }
                found |= !response.answers.is_empty();
            }
            Err(error::Error::Timeout) => {
                info!(name = %name, qtype = %qtype, "No LLMNR response");
            }
            Err(e) => return Err(e.into()),
        }
    }
    client.close();
    if !found {
        eprintln!("{}: no answer", name);
        std::process::exit(2);
    }
    Ok(())
}

fn print_usage(program: &str) {
    eprintln!("Usage: {} [options]", program);
    eprintln!();
    eprintln!("LLMNR (RFC 4795) responder and NetBIOS name server (RFC 1001/1002).");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -c, --config <path>     Load config from YAML file");
    eprintln!("  -q, --query <name>      Resolve a name over LLMNR and exit");
    eprintln!("  --no-llmnr              Disable the LLMNR responder");
    eprintln!("  --no-nbns               Disable the NBNS server");
    eprintln!("  --debug                 Dump every request through the logger");
    eprintln!("  -h, --help              Show this help message");
    eprintln!();
    eprintln!("Config file (nameserv.yaml):");
    eprintln!("  llmnr:");
    eprintln!("    networks: [\"udp4\", \"udp6\"]");
    eprintln!("    hosts:");
    eprintln!("      printer: [\"192.168.1.20\"]");
    eprintln!("  nbns:");
    eprintln!("    listen: \"0.0.0.0:137\"");
    eprintln!("    challenge:");
    eprintln!("      enabled: true");
    eprintln!();
    eprintln!("Examples:");
    eprintln!("  {}                          # Serve using nameserv.yaml", program);
    eprintln!("  {} --no-nbns --debug        # LLMNR only, verbose", program);
    eprintln!("  {} -q printer               # Look up a host", program);
}
