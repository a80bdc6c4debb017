// Read-only query API over the synced catalog.

use anyhow::Result;
use steam_catalog::api::ApiServer;
use steam_catalog::util::db::Db;
use steam_catalog::tracing::{init_tracing, DEFAULT_FILTER};
use steam_catalog::util::env as env_util;

#[actix_web::main]
async fn main() -> Result<()> {
    env_util::init_env();
    init_tracing(DEFAULT_FILTER)?;

    tracing::info!("Initializing steam-catalog API server");

    let server = ApiServer::from_env()?;

    let database_url = env_util::db_url()?;
    let max_connections: u32 = env_util::env_parse("DB_MAX_CONNS", 10u32);
    let db = Db::connect(&database_url, max_connections).await?;

    tracing::info!("Database connected successfully");

    server.run(db).await?;

    Ok(())
}
