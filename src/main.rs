use pavlik::Config;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            std::process::exit(1);
        }
    };

    info!(
        gitlab = %config.gitlab_url,
        repository = %config.catalogue_project,
        clone_url_field = %config.clone_url_field,
        index_files = %config.index_files.join(", "),
        "pavlik reporting"
    );

    pavlik::run(config).await
}
