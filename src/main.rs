use clap::Parser;
use std::sync::Arc;

use overlayd::config::{self, Config};
use overlayd::error::AppError;
use overlayd::network::client::TcpTransport;
use overlayd::network::server::TransportServer;
use overlayd::peer::{Peer, Role};
use overlayd::reunion::ReunionScheduler;
use overlayd::shutdown::ShutdownManager;

#[derive(Parser, Debug)]
#[command(name = "overlayd")]
#[command(about = "Tree overlay network daemon", long_about = None)]
struct Args {
    #[arg(short, long, default_value = "overlay.toml")]
    config: String,

    /// Override node.listen_address
    #[arg(long)]
    listen_addr: Option<String>,

    /// Run as the root of the overlay
    #[arg(long)]
    root: bool,

    /// Override node.root_address (implies peer role unless --root)
    #[arg(long)]
    root_addr: Option<String>,

    #[arg(short, long)]
    verbose: bool,

    /// Write a default config file and exit
    #[arg(long)]
    generate_config: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Ok(hostname) = hostname::get() {
        if let Ok(hostname_str) = hostname.into_string() {
            let short_name = hostname_str.split('.').next().unwrap_or(&hostname_str);
            eprintln!("\n╔═══════════════════════════════════════════╗");
            eprintln!("║  🖥️  NODE: {:<30} ║", short_name);
            eprintln!("╚═══════════════════════════════════════════╝\n");
        }
    }

    if args.generate_config {
        match Config::default().save_to_file(&args.config) {
            Ok(()) => {
                println!("✅ Generated default config at: {}", args.config);
                return;
            }
            Err(e) => {
                eprintln!("❌ Failed to generate config: {}", e);
                std::process::exit(1);
            }
        }
    }

    let mut config = match Config::load_or_create(&args.config) {
        Ok(cfg) => {
            println!("✓ Loaded configuration from {}", args.config);
            cfg
        }
        Err(e) => {
            eprintln!("❌ Failed to load config: {}", e);
            std::process::exit(1);
        }
    };
    apply_overrides(&mut config, &args);

    if let Err(e) = config.validate() {
        eprintln!("❌ Invalid configuration: {}", e);
        std::process::exit(1);
    }

    setup_logging(&config.logging, args.verbose);

    let (address, root_address) = match (config.advertised_address(), config.root_address()) {
        (Ok(address), Ok(root)) => (address, root),
        (Err(e), _) | (_, Err(e)) => {
            eprintln!("❌ Invalid address: {}", e);
            std::process::exit(1);
        }
    };

    let version = env!("CARGO_PKG_VERSION");
    let git_hash = option_env!("GIT_HASH").unwrap_or("unknown");
    let build_date = option_env!("BUILD_DATE").unwrap_or("unknown");

    println!("\n🚀 Overlay Daemon v{} ({})", version, git_hash);
    println!("  └─ Build: {}", build_date);
    println!("═══════════════════════════════════════════════════════");
    println!("🌳 Role: {}", config.role());
    println!("📡 Listening on: {}", config.node.listen_address);
    println!("🏷️  Node address: {}", address);
    println!("👑 Root address: {}", root_address);
    println!();

    let server =
        match TransportServer::bind(&config.node.listen_address, config.timing.send_timeout()).await
        {
            Ok(server) => server,
            Err(e) => {
                tracing::error!("❌ {}", AppError::from(e));
                std::process::exit(1);
            }
        };

    let transport = Arc::new(TcpTransport::new(config.timing.send_timeout()));
    let peer = Arc::new(match config.role() {
        Role::Root => Peer::root(address, transport, config.peer_options()),
        Role::Leaf => Peer::leaf(address, root_address, transport, config.peer_options()),
    });

    let mut shutdown_manager = ShutdownManager::new();
    let shutdown_token = shutdown_manager.token();

    let inbox = peer.inbox();
    let token = shutdown_token.clone();
    shutdown_manager.register_task(tokio::spawn(async move {
        if let Err(e) = server.run(inbox, token).await {
            tracing::error!("❌ Transport server stopped: {}", e);
        }
    }));

    shutdown_manager.register_task(tokio::spawn(
        peer.clone()
            .run_ticks(config.timing.tick_interval(), shutdown_token.clone()),
    ));

    shutdown_manager.register_task(tokio::spawn(
        ReunionScheduler::new(peer.clone(), config.timing.reunion_interval())
            .run(shutdown_token.clone()),
    ));

    if peer.role() == Role::Leaf && config.node.auto_join {
        if let Err(e) = peer.register() {
            tracing::warn!("⚠️ Could not start registration: {}", e);
        }
    }

    tracing::info!("✓ {} {} is up", peer.role(), peer.address());
    shutdown_manager.wait_for_shutdown().await;
}

/// CLI flags win over the config file.
fn apply_overrides(config: &mut Config, args: &Args) {
    if let Some(listen) = &args.listen_addr {
        config.node.listen_address = listen.clone();
    }
    if let Some(root) = &args.root_addr {
        config.node.root_address = Some(root.clone());
        if !args.root {
            config.node.role = "peer".to_string();
        }
    }
    if args.root {
        config.node.role = "root".to_string();
    }
}

fn setup_logging(config: &config::LoggingConfig, verbose: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let level = if verbose { "trace" } else { &config.level };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // Detect if running under systemd/journald
    let is_systemd =
        std::env::var("JOURNAL_STREAM").is_ok() || std::env::var("INVOCATION_ID").is_ok();

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    let short_hostname = hostname.split('.').next().unwrap_or(&hostname).to_string();

    match config.format.as_str() {
        "json" => {
            fmt()
                .json()
                .with_env_filter(filter)
                .with_thread_ids(false)
                .init();
        }
        _ => {
            if is_systemd {
                // journald adds its own timestamp and host
                fmt()
                    .with_env_filter(filter)
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false)
                    .without_time()
                    .compact()
                    .init();
            } else {
                fmt()
                    .with_env_filter(filter)
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false)
                    .with_timer(CustomTimer {
                        hostname: short_hostname,
                    })
                    .compact()
                    .init();
            }
        }
    }
}

// UTC time plus short hostname
struct CustomTimer {
    hostname: String,
}

impl tracing_subscriber::fmt::time::FormatTime for CustomTimer {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        let now = chrono::Utc::now();
        write!(
            w,
            "{}.{:03} [{}]",
            now.format("%Y-%m-%d %H:%M:%S"),
            now.timestamp_subsec_millis(),
            self.hostname
        )
    }
}
