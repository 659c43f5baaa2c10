use std::{error::Error, sync::Arc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

mod config;
mod app_metrics;
mod frame_filter;
mod message_logger;

use config::Config;
use app_metrics::{AppMetrics, MetricsLogger};
use frame_filter::should_process_message;
use message_logger::{MessageLogger, format_time};

use isoblue::{BufferedSocket, BusKind, Device, Socket, SocketError, TcpTransport};

// ========== Logging Setup ==========

fn init_logging(log_config: &config::LogConfig) -> Result<(), Box<dyn Error>> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
    use tracing_appender::rolling;

    std::fs::create_dir_all(&log_config.directory)?;

    // Create daily rolling file appender
    let file_appender = rolling::daily(&log_config.directory, &log_config.file_prefix);

    let file_layer = fmt::layer()
        .with_writer(file_appender)
        .with_ansi(false)
        .with_timer(fmt::time::OffsetTime::local_rfc_3339().unwrap_or_else(|_| fmt::time::OffsetTime::new(
            time::UtcOffset::UTC,
            time::format_description::well_known::Rfc3339,
        )));

    let console_layer = fmt::layer()
        .with_writer(std::io::stdout)
        .with_timer(fmt::time::OffsetTime::local_rfc_3339().unwrap_or_else(|_| fmt::time::OffsetTime::new(
            time::UtcOffset::UTC,
            time::format_description::well_known::Rfc3339,
        )));

    // RUST_LOG wins over the configured level
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&log_config.level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    Ok(())
}

// ========== Socket Readers ==========

fn spawn_socket_reader(socket: Socket, config: Arc<Config>, metrics: Arc<AppMetrics>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match socket.read().await {
                Ok(message) => {
                    if !should_process_message(&config, &message) {
                        metrics.filtered_message();
                        continue;
                    }
                    metrics.socket_message();
                    debug!("[{} {}] {} at {}", socket.bus(), socket.id(), message, format_time(&message));
                }
                Err(SocketError::Closed) => break,
                Err(e) => {
                    warn!("Error reading {} {}: {}", socket.bus(), socket.id(), e);
                    break;
                }
            }
        }
        debug!("{} {} reader stopped", socket.bus(), socket.id());
    })
}

async fn read_replay(socket: BufferedSocket, metrics: Arc<AppMetrics>) {
    let mut replayed: u64 = 0;
    loop {
        match socket.read().await {
            Ok(message) => {
                replayed += 1;
                metrics.replayed_message();
                debug!("[{} replay] {} at {}", socket.bus(), message, format_time(&message));
            }
            Err(SocketError::EndOfHistory) => {
                info!("Replay of {} bus {} finished: {} messages", socket.bus(), socket.window(), replayed);
                break;
            }
            Err(e) => {
                warn!("Replay of {} bus stopped after {} messages: {}", socket.bus(), replayed, e);
                break;
            }
        }
    }
}

/// Wait for the first live message, then replay both buses from `from_id`.
fn spawn_replay(device: Arc<Device>, from_id: u32, metrics: Arc<AppMetrics>) -> JoinHandle<()> {
    tokio::spawn(async move {
        match device.create_buffered_sockets(from_id).await {
            Ok((engine, implement)) => {
                info!("Replaying history {}", engine.window());
                tokio::join!(
                    read_replay(engine, Arc::clone(&metrics)),
                    read_replay(implement, metrics)
                );
            }
            Err(e) => warn!("Could not start replay: {}", e),
        }
    })
}

// ========== Main Application ==========

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args: Vec<String> = std::env::args().collect();

    if args.contains(&"--help".to_string()) || args.contains(&"-h".to_string()) {
        println!("ISOBlue Router");
        println!();
        println!("USAGE:");
        println!("    isoblue_router [OPTIONS]");
        println!();
        println!("OPTIONS:");
        println!("    --validate-config, --validate, -v    Validate configuration and exit");
        println!("    --help, -h                           Show this help message");
        println!();
        println!("Configuration file: config.json (in current directory)");
        std::process::exit(0);
    }

    let validate_only = args.contains(&"--validate-config".to_string())
                     || args.contains(&"--validate".to_string())
                     || args.contains(&"-v".to_string());

    let config = match Config::from_file("config.json") {
        Ok(cfg) => {
            if validate_only {
                println!("✓ Configuration validation successful");
                println!("  Bridge: {}", cfg.bridge_address);
                println!("  Reconnect backoff: {} ms", cfg.device.reconnect_backoff_ms);
                println!("  Socket queue: {} ({:?} when full)", cfg.device.socket_queue_capacity, cfg.device.overflow_policy);
                for bus in BusKind::ALL {
                    match cfg.filters.raw(bus) {
                        Some([]) => println!("  {} socket: all PGNs", bus),
                        Some(pgns) => println!("  {} socket: {} PGNs", bus, pgns.len()),
                        None => println!("  {} socket: none", bus),
                    }
                }
                if let Some(replay) = &cfg.replay {
                    println!("  Replay from id: {}", replay.from_id);
                }
                println!("  PGN source filters: {} entries", cfg.source_filter.pgn_source_map.len());
                std::process::exit(0);
            }
            cfg
        },
        Err(e) => {
            if validate_only {
                eprintln!("✗ Configuration validation failed: {}", e);
                std::process::exit(1);
            }
            eprintln!("Warning: Could not load config.json: {}", e);
            eprintln!("Using default configuration");
            Config::default()
        }
    };
    let config = Arc::new(config);

    init_logging(&config.logging)?;
    info!("ISOBlue Router starting...");
    info!("Loaded configuration");

    let metrics = Arc::new(AppMetrics::new());
    let sink = Arc::new(MessageLogger::new(Arc::clone(&metrics)));
    let transport = Arc::new(TcpTransport::new(config.bridge_address.clone()));

    info!("Connecting to bridge: {}", config.bridge_address);
    let device = tokio::select! {
        device = Device::connect(transport, config.device.clone(), Some(sink)) => device,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted before the bridge answered");
            return Ok(());
        }
    };
    let device = Arc::new(device);
    info!("Listening for ISOBUS messages");

    let mut readers = Vec::new();
    for bus in BusKind::ALL {
        let Some(pgns) = config.filters.pgns(bus)? else {
            continue;
        };
        let socket = device.bus(bus).connect(pgns).await?;
        info!("Opened {} on {} bus", socket.id(), bus);
        readers.push(spawn_socket_reader(socket, Arc::clone(&config), Arc::clone(&metrics)));
    }

    let mut metrics_logger = MetricsLogger::new(config.metrics_interval());
    let mut ticker = tokio::time::interval(config.metrics_interval());
    if let Some(replay) = &config.replay {
        readers.push(spawn_replay(Arc::clone(&device), replay.from_id, Arc::clone(&metrics)));
    }
    let mut events = device.subscribe_state();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                break;
            }
            _ = ticker.tick() => {
                metrics_logger.check_and_log(&metrics, device.metrics());
            }
            event = events.recv() => {
                if let Ok(state) = event {
                    debug!("Bridge link is now {}", state);
                }
            }
        }
    }

    device.shutdown().await;
    for reader in readers {
        if let Err(e) = reader.await {
            warn!("Socket reader failed: {}", e);
        }
    }
    metrics_logger.check_and_log(&metrics, device.metrics());
    info!("ISOBlue Router stopped");
    Ok(())
}
