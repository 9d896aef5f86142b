//! Redis-compatible persistent key-value node over an LSM keyspace, with a
//! live slot migration engine as its core subsystem.
//!
//! The crate doubles as a library so nodes can be embedded in-process (the
//! integration tests run whole source/destination pairs this way).

pub mod batch_extractor;
pub mod batch_sender;
pub mod cluster;
pub mod config;
pub mod db;
pub mod metadata;
pub mod redis_server;
pub mod resp;
pub mod slot;
pub mod slot_import;
pub mod slot_migrate;
pub mod storage;
pub mod wal;

use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use anyhow::Context;
use tokio::net::TcpListener;

use cluster::Cluster;
use config::NodeArgs;
use db::{Db, DEFAULT_NAMESPACE};
use redis_server::ServerContext;
use slot_import::SlotImporter;
use slot_migrate::{MigrateContext, SlotMigrator};
use storage::Storage;

/// Build the shared state of a node: storage, cluster topology, data model,
/// import side, and the migration engine with its worker thread.
pub fn build_context(args: NodeArgs) -> anyhow::Result<Arc<ServerContext>> {
    let storage = Arc::new(Storage::open(&args.data_dir)?);
    let cluster = Arc::new(Cluster::open(&storage)?);
    let db = Db::new(storage.clone());
    let exclusive = Arc::new(RwLock::new(()));
    let migrator = SlotMigrator::spawn(MigrateContext {
        storage: storage.clone(),
        cluster: cluster.clone(),
        namespace: DEFAULT_NAMESPACE.to_vec(),
        exclusive: exclusive.clone(),
        password: args.requirepass.clone(),
    })?;
    let migrate_shared = migrator.shared();
    let importer = SlotImporter::new(db.clone(), cluster.clone());

    Ok(Arc::new(ServerContext {
        db,
        storage,
        cluster,
        migrator,
        migrate_shared,
        importer,
        exclusive,
        args,
    }))
}

/// Handle to a node running inside this process.
pub struct NodeHandle {
    pub ctx: Arc<ServerContext>,
    pub addr: SocketAddr,
    shutdown: Option<tokio::sync::oneshot::Sender<()>>,
    task: tokio::task::JoinHandle<anyhow::Result<()>>,
}

impl NodeHandle {
    pub async fn shutdown(mut self) -> anyhow::Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(result) => result,
            Err(err) => Err(anyhow::anyhow!("node task join failed: {err}")),
        }
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

/// Bind the listener and start serving. Returns once the socket is ready,
/// with the actually bound address (port 0 picks a free one).
pub async fn start_node(args: NodeArgs) -> anyhow::Result<NodeHandle> {
    let ctx = build_context(args)?;
    let listener = TcpListener::bind(ctx.args.listen)
        .await
        .with_context(|| format!("bind {}", ctx.args.listen))?;
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "listening");

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let serve_ctx = ctx.clone();
    let task = tokio::spawn(async move {
        tokio::select! {
            result = redis_server::serve(listener, serve_ctx) => result,
            _ = shutdown_rx => Ok(()),
        }
    });

    Ok(NodeHandle {
        ctx,
        addr,
        shutdown: Some(shutdown_tx),
        task,
    })
}
