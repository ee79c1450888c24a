use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "burrow")]
#[command(about = "Zero-trust folder tunneling over a blind relay", long_about = None)]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Share a local directory
    Share {
        /// Path to the directory to share
        path: String,

        /// Relay server URL
        #[arg(long)]
        relay: Option<String>,

        /// Share in read-only mode
        #[arg(long)]
        readonly: bool,
    },
    /// Connect to a shared session
    Connect {
        /// Session id from the sharer
        session_id: String,

        /// Relay server URL
        #[arg(long)]
        relay: Option<String>,

        /// Session passcode (will prompt if not provided)
        #[arg(short, long)]
        passcode: Option<String>,

        /// Mount point (not supported yet)
        #[arg(short, long)]
        mount: Option<String>,
    },
    /// Run the relay server
    Relay {
        /// Listen address (e.g. :8080 or 0.0.0.0:8080)
        #[arg(long, default_value = ":8080")]
        listen: String,
    },
    /// Print version information
    Version,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Configure logging based on verbose flag
    let debug_env = std::env::var("BURROW_DEBUG").is_ok();
    if cli.verbose || debug_env {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
        log::info!("Verbose logging enabled");
    } else {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Info)
            .init();
    }

    let result = match cli.command {
        Commands::Share { path, relay, readonly } => {
            burrow::commands::share::run(&path, relay, readonly).await
        }
        Commands::Connect {
            session_id,
            relay,
            passcode,
            mount,
        } => burrow::commands::connect::run(&session_id, relay, passcode, mount).await,
        Commands::Relay { listen } => burrow::commands::relay::run(&listen).await,
        Commands::Version => {
            print_version();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn print_version() {
    println!("Burrow version {}", env!("CARGO_PKG_VERSION"));
    println!("Git commit: {}", option_env!("BUILD_COMMIT").unwrap_or("unknown"));
    println!("Build date: {}", option_env!("BUILD_DATE").unwrap_or("unknown"));
}
