use anyhow::Result;
use clap::Parser;
use product_image_worker::app::App;
use product_image_worker::models::Config;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "product-image-worker")]
#[command(about = "Process product images from the task queue")]
struct CliArgs {
    /// Number of tasks processed concurrently (overrides WORKER_CONCURRENCY).
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    concurrency: Option<u32>,

    /// Queue to consume (overrides QUEUE_NAME).
    #[arg(long)]
    queue: Option<String>,
}

impl CliArgs {
    fn apply(self, config: &mut Config) {
        if let Some(concurrency) = self.concurrency {
            config.worker_concurrency = concurrency as usize;
        }
        if let Some(queue) = self.queue {
            config.queue_name = queue;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "product_image_worker=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = CliArgs::parse();

    let mut config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };
    args.apply(&mut config);

    info!(queue = %config.queue_name, "Starting product-image-worker");

    let app = match App::new(&config).await {
        Ok(app) => app,
        Err(e) => {
            error!("Failed to initialize application: {}", e);
            std::process::exit(1);
        }
    };

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested, finishing in-flight tasks");
            signal.cancel();
        }
    });

    app.run(shutdown).await?;
    info!("Worker stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config::from_lookup(|key| match key {
            "DATABASE_URL" | "REDIS_URL" | "S3_BUCKET" => Some("x".to_string()),
            _ => None,
        })
        .unwrap()
    }

    #[test]
    fn test_cli_overrides_config() {
        let mut config = config();
        CliArgs::parse_from(["product-image-worker", "--concurrency", "8", "--queue", "retry"])
            .apply(&mut config);

        assert_eq!(config.worker_concurrency, 8);
        assert_eq!(config.queue_name, "retry");
    }

    #[test]
    fn test_cli_without_flags_keeps_config() {
        let mut config = config();
        CliArgs::parse_from(["product-image-worker"]).apply(&mut config);

        assert_eq!(config.worker_concurrency, 4);
        assert_eq!(config.queue_name, "image_processing_queue");
    }

    #[test]
    fn test_cli_rejects_zero_concurrency() {
        assert!(CliArgs::try_parse_from(["product-image-worker", "--concurrency", "0"]).is_err());
    }
}
