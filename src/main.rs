use influence::{AppState, Config, app, db};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("influence=debug,tower_http=debug")),
        )
        .init();

    let config = Config::from_env()?;
    let db_pool = db::connect(&config.database_url).await?;
    let bind_addr = config.bind_addr.clone();
    tracing::info!(operators = config.operators.len(), dev_login = config.dev_login, "configuration loaded");

    let app = app(AppState::new(db_pool, config));
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(%bind_addr, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}
