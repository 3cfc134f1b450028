#[cfg(any(target_os = "linux", target_os = "macos"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use relaybot::{config, core, daemon};
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    // Deployment convenience: a .env next to the binary. Channel and
    // container secrets do NOT live here; they come from ./data/env/env.
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() > 1 {
        match args[1].as_str() {
            "--version" | "-V" => {
                println!("relaybot {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            "--help" | "-h" => {
                println!("relaybot {}", env!("CARGO_PKG_VERSION"));
                println!("{}\n", env!("CARGO_PKG_DESCRIPTION"));
                println!("Usage: relaybot [COMMAND]\n");
                println!("Commands:");
                println!("  install-service    Install as a system service (launchd/systemd)");
                println!("\nOptions:");
                println!("  -h, --help         Print help");
                println!("  -V, --version      Print version");
                println!("\nConfiguration is taken from environment variables:");
                println!("  ASSISTANT_NAME, POLL_INTERVAL, SCHEDULER_POLL_INTERVAL,");
                println!("  MAX_CONCURRENT_CONTAINERS, CONTAINER_IMAGE, TIMEZONE, DATA_DIR");
                return Ok(());
            }
            "install-service" => {
                return daemon::install_service();
            }
            other => {
                eprintln!("Unknown command '{}'; see --help", other);
                std::process::exit(1);
            }
        }
    }

    let config = match config::CoreConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Config error: {e}");
            std::process::exit(core::ExitStatus::ConfigError.code());
        }
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let status = runtime.block_on(core::run(config));
    std::process::exit(status.code());
}
