use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use spotctl::config::Config;

#[derive(Parser)]
#[command(name = "spotctl")]
#[command(
    about = "Replaces on-demand Auto Scaling Group instances with cheaper spot equivalents",
    long_about = "spotctl scans the account's Auto Scaling Groups for the opt-in tag,\n\
                  finds cheaper spot instance types compatible with each group's running\n\
                  on-demand instances, and swaps them in without violating the group's\n\
                  capacity contract. All in-flight state is kept in resource tags, so\n\
                  interrupted runs resume safely on the next cycle."
)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one replacement cycle and exit
    Run {
        /// Restrict processing to these region globs (overrides config)
        #[arg(long, value_delimiter = ',')]
        regions: Vec<String>,
        /// Instance type dataset path (overrides config)
        #[arg(long)]
        dataset: Option<PathBuf>,
    },
    /// Run replacement cycles on an interval until interrupted
    Watch {
        /// Seconds between cycles
        #[arg(long, default_value_t = 300)]
        interval: u64,
        #[arg(long, value_delimiter = ',')]
        regions: Vec<String>,
        #[arg(long)]
        dataset: Option<PathBuf>,
    },
    /// List the regions a cycle would process
    Regions,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let mut config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Run { regions, dataset } => {
            apply_overrides(&mut config, regions, dataset);
            spotctl::coordinator::run_cycle(config).await?;
        }
        Commands::Watch {
            interval,
            regions,
            dataset,
        } => {
            apply_overrides(&mut config, regions, dataset);
            loop {
                spotctl::coordinator::run_cycle(config.clone()).await?;
                tokio::time::sleep(std::time::Duration::from_secs(interval)).await;
            }
        }
        Commands::Regions => {
            let enabled = spotctl::aws::enumerate_regions().await?;
            for region in spotctl::coordinator::select_regions(&enabled, &config.regions) {
                println!("{region}");
            }
        }
    }

    Ok(())
}

fn apply_overrides(config: &mut Config, regions: Vec<String>, dataset: Option<PathBuf>) {
    if !regions.is_empty() {
        config.regions = regions;
    }
    if let Some(dataset) = dataset {
        config.dataset_path = dataset;
    }
}
