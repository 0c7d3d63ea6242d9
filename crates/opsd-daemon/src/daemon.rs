//! Daemon assembly and lifecycle.
//!
//! [`Daemon::start`] connects the external collaborators (Postgres, bus,
//! cache), wires the components and spawns every long-lived task under
//! one root cancellation token. The service handles it exposes are what
//! the HTTP collaborator mounts its routes on.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use chrono::Duration as ChronoDuration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use opsd_core::hub::ConflictHub;
use opsd_core::identity::jwt::JwtIssuer;

use crate::bus::{self, Bus};
use crate::cache::RedisCache;
use crate::config::Config;
use crate::conflict::ConflictService;
use crate::enroll::Enroller;
use crate::ingest::{start_events_consumer, start_inventory_consumer, start_kv_watcher};
use crate::rpc::RpcDispatcher;
use crate::storage::Storage;
use crate::workers::{start_keyevent_worker, start_periodic_reconciler};

/// How long shutdown waits for the ingest tasks to drain.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

/// The assembled daemon.
pub struct Daemon {
    /// Persistence gateway, read directly by HTTP collaborators.
    pub storage: Storage,
    /// Presence cache handle.
    pub cache: Arc<RedisCache>,
    /// Bus handles.
    pub bus: Bus,
    /// Action dispatch to agents.
    pub rpc: RpcDispatcher,
    /// Conflict detection, fan-out and resolution.
    pub conflicts: ConflictService,
    /// Enrollment orchestrator; `None` when no signing key is configured.
    pub enroller: Option<Enroller>,

    cancel: CancellationToken,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl Daemon {
    /// Connect collaborators, wire components and start every worker.
    ///
    /// # Errors
    ///
    /// Returns an error when a required collaborator is unreachable or a
    /// durable consumer cannot be created.
    pub async fn start(config: Config) -> anyhow::Result<Self> {
        let storage = Storage::connect(&config.database.dsn())
            .await
            .context("connect to database")?;

        let cache = Arc::new(
            RedisCache::connect(&config.redis_url, config.redis_db)
                .await
                .map_err(|e| anyhow::anyhow!(e.0))
                .context("connect to redis")?,
        );

        let bus = bus::connect(&config.nats_urls).await?;

        let enroller = match (&config.signing_key_seed, &config.agents_account_public_key) {
            (Some(seed), Some(account_key)) => {
                let issuer = JwtIssuer::new(seed, account_key).context("configure JWT issuer")?;
                Some(Enroller::new(
                    storage.clone(),
                    issuer,
                    config.nats_urls.clone(),
                    ChronoDuration::days(config.credential_ttl_days),
                ))
            }
            _ => {
                warn!("NATS signing key not configured, enrollment is disabled");
                None
            }
        };

        let hub = ConflictHub::new();
        let conflicts = ConflictService::new(storage.clone(), hub);
        let rpc = RpcDispatcher::new(bus.client.clone());

        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();

        tasks.push(start_events_consumer(&bus, storage.clone(), cancel.child_token()).await?);
        tasks.push(start_inventory_consumer(&bus, storage.clone(), cancel.child_token()).await?);
        tasks.push(
            start_kv_watcher(
                bus.kv.clone(),
                storage.clone(),
                cache.clone(),
                cancel.child_token(),
            )
            .await?,
        );

        // At most one presence reconciliation path runs: expirations when
        // the cache can notify, the periodic sweep otherwise.
        let keyevents_active =
            start_keyevent_worker(cache.clone(), storage.clone(), cancel.child_token()).await;
        if !keyevents_active {
            warn!("cache expiration notifications unavailable, using periodic reconciler");
            tasks.push(start_periodic_reconciler(
                cache.clone(),
                storage.clone(),
                cancel.child_token(),
            ));
        }

        info!("daemon started");

        Ok(Self {
            storage,
            cache,
            bus,
            rpc,
            conflicts,
            enroller,
            cancel,
            tasks,
        })
    }

    /// Stop every worker, draining in-flight batches.
    pub async fn shutdown(self) {
        info!("shutting down");
        self.cancel.cancel();

        let drain = async {
            for task in self.tasks {
                if let Err(e) = task.await {
                    warn!(error = %e, "worker task panicked");
                }
            }
        };

        if tokio::time::timeout(SHUTDOWN_DEADLINE, drain).await.is_err() {
            warn!("shutdown deadline lapsed with workers still draining");
        }

        info!("daemon stopped");
    }
}
