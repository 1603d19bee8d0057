use anyhow::Context;
use courier_infra::cache::{CacheRepository, RedisStore};
use courier_infra::config::AppConfig;
use courier_infra::db::PgSessionPool;
use courier_infra::services::{UserService, UserServiceConfig};
use courier_observability::LogConfig;
use figment::providers::{Env, Serialized};
use figment::Figment;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log: LogConfig = Figment::from(Serialized::defaults(LogConfig::default()))
        .merge(Env::prefixed("LOG_"))
        .extract()
        .context("invalid LOG_* settings")?;
    courier_observability::init_with(&log);

    let config = AppConfig::load().context("failed to load configuration")?;
    tracing::info!(
        postgres = %config.postgres.host,
        redis = %config.redis.host,
        locales = config.locales.supported.len(),
        "configuration loaded"
    );

    let pool = PgSessionPool::connect(&config.postgres, &config.pool)
        .await
        .context("failed to open the postgres pool")?;
    pool.ensure_schema()
        .await
        .context("failed to prepare the database schema")?;
    let store = match RedisStore::connect(config.redis.build_url()).await {
        Ok(store) => store,
        Err(err) => {
            courier_infra::SessionPool::close(&pool).await;
            return Err(err).context("failed to connect to redis");
        }
    };

    let users = UserService::new(
        pool,
        CacheRepository::new(store),
        UserServiceConfig::from(&config.cache),
    );
    tracing::info!("user service ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutting down");

    users.close().await;
    Ok(())
}
