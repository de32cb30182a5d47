//! Server context
//!
//! Everything a session worker needs, built once at startup and cloned into
//! each worker. There is no process-wide state.

use crate::auth::{AllowAll, Authorizer, CachingAuthorizer};
use crate::metadata::MetadataRegistrar;
use afs_common::{AfsConfig, Result};
use afs_storage::{StorageLayout, WriteAheadLog};
use afs_txn::{RecoveryReport, TransactionCoordinator};
use std::sync::Arc;
use tracing::info;

/// Shared handles threaded from the entry point to every worker
#[derive(Clone)]
pub struct ServerContext {
    pub config: Arc<AfsConfig>,
    pub coordinator: Arc<TransactionCoordinator>,
    pub authorizer: Arc<dyn Authorizer>,
}

impl ServerContext {
    /// Open storage and the log, register hooks and run recovery
    ///
    /// Must be called from within a tokio runtime when a metadata endpoint
    /// is configured.
    pub fn open(config: AfsConfig) -> Result<(Self, RecoveryReport)> {
        config.validate()?;

        let layout = Arc::new(StorageLayout::open(&config.storage)?);
        let wal = Arc::new(WriteAheadLog::open(&config.wal.root, config.wal.sync_mode)?);
        let coordinator = Arc::new(TransactionCoordinator::new(wal, Arc::clone(&layout)));

        if let Some(endpoint) = &config.metadata.endpoint {
            let registrar = MetadataRegistrar::new(
                endpoint.clone(),
                config.metadata.timeout(),
                layout.instance_uuid(),
            )?;
            coordinator.add_hook(Arc::new(registrar));
        }

        let report = coordinator.recover()?;

        let authorizer: Arc<dyn Authorizer> =
            Arc::new(CachingAuthorizer::new(Arc::new(AllowAll), &config.auth));

        info!(
            "Server context ready: instance={}, pool_size={}",
            layout.instance_uuid(),
            config.server.pool_size
        );

        Ok((
            Self {
                config: Arc::new(config),
                coordinator,
                authorizer,
            },
            report,
        ))
    }

    /// Replace the authorization gate
    #[must_use]
    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }
}
