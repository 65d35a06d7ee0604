use pullthrough::config::Config;
use pullthrough::Gateway;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize the logger
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::new_from_flags(env!("CARGO_PKG_VERSION"))?;

    // Tries a kubeconfig file first, then falls back on an in-cluster
    // configuration.
    let client = kube::Client::try_default().await?;

    let gateway = Gateway::new(config, client)?;
    gateway.start().await
}
