use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use shadowy_config::ShadowyConfig;
use shadowy_consensus::walk_chain;
use shadowy_node::run_node;
use shadowy_plot::{create_plot, Farm, PlotHandle};
use shadowy_storage::{ChainStore, SqliteStore};
use shadowy_wallet::WalletStore;
use std::path::PathBuf;
use tokio::runtime::Runtime;

#[derive(Parser)]
#[command(name = "shadowy", version, about = "Shadowy proof-of-space-and-time node")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write an example config
    Init {
        #[arg(long, default_value = "config/shadowy.toml")]
        config: PathBuf,
    },
    /// Node operations
    Node {
        #[command(subcommand)]
        cmd: NodeCmd,
    },
    /// Wallet operations
    Wallet {
        #[command(subcommand)]
        cmd: WalletCmd,
    },
    /// Plot file operations
    Plot {
        #[command(subcommand)]
        cmd: PlotCmd,
    },
    /// Chain store diagnostics
    Chain {
        #[command(subcommand)]
        cmd: ChainCmd,
    },
}

#[derive(Subcommand)]
enum NodeCmd {
    Start {
        #[arg(long, default_value = "config/shadowy.toml")]
        config: PathBuf,
        /// farmer wallet password; falls back to SHADOWY_WALLET_PASSWORD
        #[arg(long)]
        password: Option<String>,
        /// skip the first interval wait and mine immediately
        #[arg(long)]
        force_block: bool,
    },
}

#[derive(Subcommand)]
enum WalletCmd {
    New {
        #[arg(long, default_value = "farmer")]
        name: String,
        #[arg(long)]
        password: String,
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    List {
        #[arg(long)]
        dir: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum PlotCmd {
    /// Generate a new plot of post-quantum keys
    Create {
        #[arg(long)]
        path: PathBuf,
        #[arg(long, default_value_t = 1024)]
        count: u64,
    },
    /// Validate a plot and print its shape
    Inspect {
        #[arg(long)]
        path: PathBuf,
    },
    /// Validate every plot in a directory
    Check {
        #[arg(long)]
        dir: PathBuf,
    },
}

#[derive(Subcommand)]
enum ChainCmd {
    /// Traverse the chain store and report gaps, orphans and bad links
    Walk {
        #[arg(long, default_value = "config/shadowy.toml")]
        config: PathBuf,
    },
    /// Print the current tip
    Tip {
        #[arg(long, default_value = "config/shadowy.toml")]
        config: PathBuf,
    },
}

fn main() {
    if let Err(e) = run(Cli::parse()) {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Init { config } => init_config(config),
        Commands::Node { cmd } => match cmd {
            NodeCmd::Start {
                config,
                password,
                force_block,
            } => {
                let password = password
                    .or_else(|| std::env::var("SHADOWY_WALLET_PASSWORD").ok())
                    .ok_or_else(|| {
                        anyhow!("pass --password or set SHADOWY_WALLET_PASSWORD")
                    })?;
                let rt = Runtime::new()?;
                rt.block_on(async move {
                    if force_block {
                        let node = shadowy_node::start_node(&config, &password).await?;
                        node.handle.force_block().await?;
                        node.wait().await
                    } else {
                        run_node(&config, &password).await
                    }
                })
            }
        },
        Commands::Wallet { cmd } => match cmd {
            WalletCmd::New { name, password, dir } => {
                let store = WalletStore::new(wallet_dir(dir)?)?;
                let wallet = store.create(&name, &password)?;
                println!("created wallet {} address {}", wallet.name, wallet.address);
                Ok(())
            }
            WalletCmd::List { dir } => {
                let store = WalletStore::new(wallet_dir(dir)?)?;
                for wallet in store.list()? {
                    println!("{} -> {}", wallet.name, wallet.address);
                }
                Ok(())
            }
        },
        Commands::Plot { cmd } => match cmd {
            PlotCmd::Create { path, count } => {
                let bar = ProgressBar::new(count);
                bar.set_style(
                    ProgressStyle::with_template(
                        "{bar:40} {pos}/{len} keys ({eta} remaining)",
                    )
                    .expect("progress template"),
                );
                create_plot(&path, count, |done| bar.set_position(done))?;
                bar.finish();
                println!("plot written to {}", path.display());
                Ok(())
            }
            PlotCmd::Inspect { path } => {
                let handle = PlotHandle::open(&path)?;
                println!(
                    "{}: {} identifiers, header valid",
                    path.display(),
                    handle.len()
                );
                Ok(())
            }
            PlotCmd::Check { dir } => {
                let farm = Farm::load(&dir)?;
                println!(
                    "{}: {} plots loaded, {} identifiers total",
                    dir.display(),
                    farm.plot_count(),
                    farm.entry_count()
                );
                Ok(())
            }
        },
        Commands::Chain { cmd } => match cmd {
            ChainCmd::Walk { config } => {
                let cfg = ShadowyConfig::load(&config)?;
                let rt = Runtime::new()?;
                rt.block_on(async move {
                    let store = SqliteStore::open(&cfg.node.blockchain_directory).await?;
                    let report = walk_chain(&store).await?;
                    match report.tip {
                        Some((height, hash)) => println!("tip: height {height} hash {hash}"),
                        None => println!("tip: none (empty store)"),
                    }
                    if report.is_clean() {
                        println!("chain store is clean");
                    } else {
                        for (from, to) in &report.missing {
                            println!("missing heights {from}..={to}");
                        }
                        for height in &report.broken_links {
                            println!("broken link at height {height}");
                        }
                        for height in &report.hash_mismatches {
                            println!("hash mismatch at height {height}");
                        }
                        for hash in &report.orphans {
                            println!("orphan block {hash}");
                        }
                    }
                    Ok::<(), anyhow::Error>(())
                })
            }
            ChainCmd::Tip { config } => {
                let cfg = ShadowyConfig::load(&config)?;
                let rt = Runtime::new()?;
                rt.block_on(async move {
                    let store = SqliteStore::open(&cfg.node.blockchain_directory).await?;
                    match store.tip().await? {
                        Some((height, hash)) => println!("height {height} hash {hash}"),
                        None => println!("empty chain store"),
                    }
                    Ok::<(), anyhow::Error>(())
                })
            }
        },
    }
}

fn init_config(path: PathBuf) -> Result<()> {
    if path.exists() {
        println!("config already exists at {}", path.display());
        return Ok(());
    }
    ShadowyConfig::write_example(&path)?;
    println!("wrote config to {}", path.display());
    Ok(())
}

fn wallet_dir(explicit: Option<PathBuf>) -> Result<PathBuf> {
    let dir = match explicit {
        Some(dir) => dir,
        None => dirs::home_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(".shadowy")
            .join("wallets"),
    };
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}
