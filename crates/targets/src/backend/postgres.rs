//! PostgreSQL backend for target rules.
//!
//! CRUD goes through a shared `PgPool`; every subscription gets its own
//! single-connection pool so that a connection parked in `LISTEN` never
//! starves the CRUD pool. The `targets` table and its notify trigger live in
//! `migrations/` and are applied on connect unless disabled.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgListener, PgPool, PgPoolOptions, PgSslMode};
use tracing::{debug, info};
use uuid::Uuid;

use cartograph_core::config::PostgresConfig;

use super::{ChangeNotice, ChangeSubscription, RuleBackend};
use crate::error::BackendError;
use crate::types::{Rule, RuleKind};

static MIGRATIONS: sqlx::migrate::Migrator = sqlx::migrate!("../../migrations");

/// Target rules stored in the `targets` table.
#[derive(Debug)]
pub struct PgRuleBackend {
    pool: PgPool,
    connect_options: PgConnectOptions,
    closed: AtomicBool,
}

impl PgRuleBackend {
    /// Open the CRUD pool and (optionally) apply migrations.
    pub async fn connect(
        config: &PostgresConfig,
        run_migrations: bool,
    ) -> Result<Self, BackendError> {
        let connect_options = connect_options(config)?;
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout())
            .connect_with(connect_options.clone())
            .await?;
        info!(url = %config.redacted_url(), "PostgreSQL connected");

        if run_migrations {
            MIGRATIONS.run(&pool).await?;
            info!("target store migrations applied");
        }

        Ok(Self {
            pool,
            connect_options,
            closed: AtomicBool::new(false),
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn connect_options(config: &PostgresConfig) -> Result<PgConnectOptions, BackendError> {
    let ssl_mode = PgSslMode::from_str(&config.ssl_mode)
        .map_err(|e| BackendError::Unavailable(format!("invalid PG_SSL_MODE: {e}")))?;
    let mut options = PgConnectOptions::new()
        .host(&config.host)
        .port(config.port)
        .database(&config.database)
        .username(config.username.as_deref().unwrap_or("postgres"))
        .ssl_mode(ssl_mode);
    if let Some(password) = &config.password {
        options = options.password(password);
    }
    Ok(options)
}

#[async_trait]
impl RuleBackend for PgRuleBackend {
    fn name(&self) -> &str {
        "postgres"
    }

    async fn insert(&self, kind: RuleKind, hosts: &[String]) -> Result<Uuid, BackendError> {
        let mut tx = self.pool.begin().await?;
        let id = sqlx::query_scalar::<_, Uuid>(
            "INSERT INTO targets (ignore, hosts) VALUES ($1, $2) RETURNING id",
        )
        .bind(kind.is_ignore())
        .bind(hosts)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(id)
    }

    async fn delete(&self, id: Uuid) -> Result<bool, BackendError> {
        let result = sqlx::query("DELETE FROM targets WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn load_all(&self) -> Result<Vec<(Uuid, Rule)>, BackendError> {
        let rows = sqlx::query_as::<_, (Uuid, bool, Vec<String>)>(
            "SELECT id, ignore, hosts FROM targets",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, ignore, hosts)| (id, Rule::new(RuleKind::from_ignore(ignore), hosts)))
            .collect())
    }

    async fn subscribe(&self, channel: &str) -> Result<Box<dyn ChangeSubscription>, BackendError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BackendError::Unavailable("backend closed".to_string()));
        }

        let pool = PgPoolOptions::new()
            .max_connections(1)
            .max_lifetime(None)
            .idle_timeout(None)
            .connect_with(self.connect_options.clone())
            .await?;
        let mut listener = match PgListener::connect_with(&pool).await {
            Ok(listener) => listener,
            Err(e) => {
                pool.close().await;
                return Err(e.into());
            }
        };
        if let Err(e) = listener.listen(channel).await {
            drop(listener);
            pool.close().await;
            return Err(e.into());
        }
        debug!(channel, "LISTEN issued");

        Ok(Box::new(PgSubscription { listener, pool }))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.pool.close().await;
        info!("PostgreSQL pool closed");
    }
}

/// A `PgListener` on its own single-connection pool.
struct PgSubscription {
    listener: PgListener,
    pool: PgPool,
}

#[async_trait]
impl ChangeSubscription for PgSubscription {
    async fn recv(&mut self) -> Result<ChangeNotice, BackendError> {
        // `try_recv` yields `None` once when the connection drops; the driver
        // would silently reconnect on the next call, but reconnection is
        // owned by the change listener so it can reload after re-subscribing.
        match self.listener.try_recv().await? {
            Some(notification) => Ok(ChangeNotice {
                channel: notification.channel().to_string(),
                payload: notification.payload().to_string(),
            }),
            None => Err(BackendError::Unavailable(
                "subscriber connection lost".to_string(),
            )),
        }
    }

    fn next_buffered(&mut self) -> Option<ChangeNotice> {
        self.listener.next_buffered().map(|notification| ChangeNotice {
            channel: notification.channel().to_string(),
            payload: notification.payload().to_string(),
        })
    }

    async fn close(self: Box<Self>) {
        let Self { listener, pool } = *self;
        drop(listener);
        pool.close().await;
    }
}
