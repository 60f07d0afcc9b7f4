use lowcode_releases::config::AppConfig;
use lowcode_releases::seed;
use lowcode_releases::service::SyntaxService;
use lowcode_releases::store::PostgresStore;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env is optional
    dotenvy::dotenv().ok();

    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .filter_module("sqlx", log::LevelFilter::Warn)
        .parse_default_env()
        .init();

    let config = AppConfig::load()?;
    log::info!(
        "Configuration loaded: label length {}, auto-staged pages {}",
        config.engine.version_label_length,
        config.engine.auto_stage_pages
    );

    log::info!("Connecting to PostgreSQL...");
    let database_url = config.database_url()?;
    let postgres_store = PostgresStore::new(&database_url, config.max_connections()).await?;

    log::info!("Running database migrations...");
    postgres_store.migrate().await?;

    let service = SyntaxService::new(Arc::new(postgres_store), config.engine.clone());

    seed::ensure_root_release(&service, &config.bootstrap).await?;

    if config.bootstrap.load_seed_data {
        log::info!("Loading seed data...");
        seed::load_seed_data(&service).await?;
    }

    let tree = service.release_tree().await?;
    println!("{}", tree.render());

    Ok(())
}
