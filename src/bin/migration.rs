use masterskaya_core::{config, db, migrator::Migrator};
use sea_orm_migration::MigratorTrait;
use tracing::info;

/// Applies (`up`, the default), rolls back (`down [n]`) or lists (`status`) migrations
/// against the configured database.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = config::load_config()?;
    config::init_tracing(cfg.log_level(), cfg.log_json);

    let mut args = std::env::args().skip(1);
    let command = args.next().unwrap_or_else(|| "up".to_string());

    info!("Connecting to database for migration command '{}'", command);
    let pool = db::establish_connection_with_config(&cfg.db_config()).await?;

    match command.as_str() {
        "up" => db::run_migrations(&pool).await?,
        "down" => {
            let steps = args.next().map(|n| n.parse::<u32>()).transpose()?.unwrap_or(1);
            Migrator::down(&pool, Some(steps)).await?;
            info!("Rolled back {} migration(s)", steps);
        }
        "status" => Migrator::status(&pool).await?,
        other => anyhow::bail!("unknown migration command '{}', expected up, down or status", other),
    }

    db::close_pool(pool).await?;
    info!("Migration command completed successfully");
    Ok(())
}
