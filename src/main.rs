use anyhow::{Context, Result, bail};
use llm_relay::cli::{Args, ConfigDiscovery, ExecuteConfig, ExecutionMode};
use llm_relay::{Processor, ResponseMetadata, env};
use std::path::Path;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(env::DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let mode = match args.mode() {
        Ok(mode) => mode,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(2);
        }
    };

    match mode {
        ExecutionMode::Execute(config) => run_request(config).await,
        ExecutionMode::Status { config_override } => show_status(config_override.as_deref()).await,
        ExecutionMode::ShowConfig { config_override } => {
            ConfigDiscovery::show_discovery_info();
            let config = ConfigDiscovery::load(config_override.as_deref())
                .context("Failed to load configuration")?;
            println!();
            println!(
                "{}",
                config
                    .redacted()
                    .to_toml_string()
                    .context("Failed to render configuration")?
            );
            Ok(())
        }
        ExecutionMode::Init => {
            let path = ConfigDiscovery::create_default_user_config()
                .context("Failed to create user configuration")?;
            println!("Configuration written to {}", path.display());
            Ok(())
        }
    }
}

fn build_processor(config_override: Option<&Path>) -> Result<Processor> {
    let config = ConfigDiscovery::load(config_override).context("Failed to load configuration")?;
    Processor::from_config(&config).context("Failed to initialize providers")
}

async fn run_request(config: ExecuteConfig) -> Result<()> {
    let processor = build_processor(config.config_override.as_deref())?;
    info!(
        "Executing request {} ({:?})",
        config.request.id, config.request.category
    );

    let response = processor
        .execute(&config.request)
        .await
        .context("Request failed")?;

    if config.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&response).context("Failed to serialize response")?
        );
    } else {
        print_response(&response);
    }
    Ok(())
}

fn print_response(response: &ResponseMetadata) {
    println!("{}", response.text);

    if !response.sources.is_empty() {
        println!();
        println!("Sources:");
        for source in &response.sources {
            println!("  - {source}");
        }
    }

    if let Some(footer) = response.status_footer() {
        println!();
        println!("[{footer}]");
    }
}

async fn show_status(config_override: Option<&Path>) -> Result<()> {
    let processor = build_processor(config_override)?;
    let report = processor.provider_status().await;
    if report.is_empty() {
        bail!("No providers are enabled");
    }

    println!("Retry policy: {:?}", processor.policy());
    println!();
    for health in report {
        let marker = if health.is_default { " (default)" } else { "" };
        let state = if health.configured {
            "configured"
        } else {
            "NOT CONFIGURED"
        };
        println!("{}{}: {}", health.name, marker, state);
        println!("  capable: {}", health.capable_model);
        println!("  fast:    {}", health.fast_model);

        for (label, pool) in [("capable", &health.capable_pool), ("fast", &health.fast_pool)] {
            if let Some(pool) = pool {
                print!(
                    "  {label} keys: {}/{} usable",
                    pool.usable_keys, pool.total_keys
                );
                match pool.next_available {
                    Some(at) => println!(", next reset {at}"),
                    None => println!(),
                }
            }
        }

        if let Some(until) = health.capable_exhausted_until {
            println!("  capable tier exhausted until {until}");
        }
    }

    Ok(())
}
