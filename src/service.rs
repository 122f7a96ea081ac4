use std::{net::SocketAddr, sync::Arc};

use anyhow::{anyhow, Context, Result};
use axum_server::Handle;
use blob_index::{BlobIndex, MemoryBlobIndex, RocksDbBlobIndex};
use blob_store::{
    build_backends,
    BackendDeps,
    DnsPeerDiscovery,
    FileSystemStore,
    NamespacePolicyResolver,
    PeerDiscovery,
    ServiceCredentials,
    StaticCredentials,
    StaticPeerDiscovery,
    StaticPolicyResolver,
};
use tokio::{signal, sync::watch};
use tracing::{error, info};

use crate::{
    blob_service::BlobService,
    config::{BlobIndexConfig, DiscoveryConfig, ServerConfig},
    consistency::{
        BlobIndexCheck,
        BlobStoreCheck,
        ConsistencyCheck,
        ConsistencyWorker,
        RefStoreCheck,
    },
    fs_cleanup::FileSystemCleanup,
    leader::{LeaderElection, StaticLeaderElection},
    peers::PeerRegistry,
    ref_store::{MemoryReferenceStore, ReferenceStore},
    replication::Replicator,
    routes::{create_routes, RouteState},
};

#[derive(Clone)]
pub struct Service {
    pub config: ServerConfig,
    pub shutdown_tx: watch::Sender<()>,
    pub shutdown_rx: watch::Receiver<()>,
    pub blob_service: Arc<BlobService>,
    pub policies: Arc<dyn NamespacePolicyResolver>,
    pub peers: Arc<PeerRegistry>,
    pub leader: Arc<dyn LeaderElection>,
    pub ref_store: Arc<dyn ReferenceStore>,
    pub filesystems: Vec<Arc<FileSystemStore>>,
}

impl Service {
    pub async fn new(config: ServerConfig) -> Result<Self> {
        config.validate()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(());

        let policies: Arc<dyn NamespacePolicyResolver> =
            Arc::new(StaticPolicyResolver::new(config.namespaces.clone()));
        let credentials: Arc<dyn ServiceCredentials> = Arc::new(StaticCredentials::new(
            config.credentials.scheme.clone(),
            config.credentials.token.clone(),
        ));
        let discovery: Arc<dyn PeerDiscovery> = match &config.peers.discovery {
            DiscoveryConfig::Static { peers } => Arc::new(StaticPeerDiscovery::new(peers.clone())),
            DiscoveryConfig::Dns {
                host,
                port,
                scheme,
                own_addresses,
                ttl_secs,
            } => Arc::new(DnsPeerDiscovery::new(
                host.clone(),
                *port,
                scheme.clone(),
                own_addresses.clone(),
                std::time::Duration::from_secs(*ttl_secs),
            )),
        };

        let backends = build_backends(
            &config.storage.backends,
            &BackendDeps {
                policies: policies.clone(),
                credentials: credentials.clone(),
                discovery,
            },
        )
        .await
        .map_err(|e| anyhow!("error initializing blob stores: {}", e))?;

        let index: Arc<dyn BlobIndex> = match &config.blob_index {
            BlobIndexConfig::Memory => Arc::new(MemoryBlobIndex::new(config.region.clone())),
            BlobIndexConfig::Rocksdb { path } => Arc::new(
                RocksDbBlobIndex::open(path, config.region.clone())
                    .context("error initializing blob index")?,
            ),
        };

        let peers = Arc::new(PeerRegistry::new(
            config.peers.regions.clone(),
            config.peers.probe_timeout(),
        ));
        let replicator = Arc::new(Replicator::new(
            index.clone(),
            peers.clone(),
            credentials,
            config.peers.replication_timeout(),
        ));
        let blob_service = Arc::new(BlobService::new(
            backends.stores,
            index,
            policies.clone(),
            replicator,
        ));
        let leader: Arc<dyn LeaderElection> = Arc::new(StaticLeaderElection::from(&config.leader));

        Ok(Self {
            config,
            shutdown_tx,
            shutdown_rx,
            blob_service,
            policies,
            peers,
            leader,
            ref_store: Arc::new(MemoryReferenceStore::new()),
            filesystems: backends.filesystems,
        })
    }

    fn consistency_workers(&self) -> Vec<ConsistencyWorker> {
        let consistency = &self.config.consistency;
        let mut checks: Vec<(Arc<dyn ConsistencyCheck>, std::time::Duration)> = Vec::new();
        if consistency.blob_index.enabled {
            checks.push((
                Arc::new(BlobIndexCheck::new(
                    self.blob_service.clone(),
                    self.policies.clone(),
                    consistency.blob_index.clone(),
                )),
                consistency.blob_index.poll_interval(),
            ));
        }
        if consistency.blob_store.enabled {
            checks.push((
                Arc::new(BlobStoreCheck::new(
                    self.blob_service.stores().to_vec(),
                    self.blob_service.index().clone(),
                    self.policies.clone(),
                    self.leader.clone(),
                    consistency.blob_store.clone(),
                )),
                consistency.blob_store.poll_interval(),
            ));
        }
        if consistency.ref_store.enabled {
            checks.push((
                Arc::new(RefStoreCheck::new(
                    self.ref_store.clone(),
                    consistency.ref_store.clone(),
                )),
                consistency.ref_store.poll_interval(),
            ));
        }
        checks
            .into_iter()
            .map(|(check, interval)| ConsistencyWorker::new(check, self.leader.clone(), interval))
            .collect()
    }

    pub async fn start(&self) -> Result<()> {
        let peers = self.peers.clone();
        let probe_interval = self.config.peers.probe_interval();
        let shutdown_rx = self.shutdown_rx.clone();
        tokio::spawn(async move {
            peers.start(probe_interval, shutdown_rx).await;
        });

        for worker in self.consistency_workers() {
            let shutdown_rx = self.shutdown_rx.clone();
            tokio::spawn(async move {
                worker.start(shutdown_rx).await;
            });
        }

        if self.config.filesystem_gc.enabled {
            let cleanup =
                FileSystemCleanup::new(self.filesystems.clone(), self.config.filesystem_gc.interval());
            let shutdown_rx = self.shutdown_rx.clone();
            tokio::spawn(async move {
                cleanup.start(shutdown_rx).await;
            });
        }

        let route_state = RouteState {
            blob_service: self.blob_service.clone(),
        };

        let handle = Handle::new();
        let handle_sh = handle.clone();
        let shutdown_tx = self.shutdown_tx.clone();
        tokio::spawn(async move {
            shutdown_signal(handle_sh, shutdown_tx).await;
            info!("graceful shutdown signal received, shutting down server gracefully");
        });

        let addr: SocketAddr = self.config.listen_addr.parse()?;
        info!(region = %self.config.region, "blob server listening on {}", self.config.listen_addr);
        axum_server::bind(addr)
            .handle(handle)
            .serve(create_routes(route_state).into_make_service())
            .await?;

        Ok(())
    }
}

async fn shutdown_signal(handle: Handle, shutdown_tx: watch::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {:?}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("failed to install signal handler: {:?}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
        },
        _ = terminate => {
        },
    }
    handle.shutdown();
    if shutdown_tx.send(()).is_err() {
        error!("no workers were listening for shutdown");
    }
    info!("signal received, shutting down server gracefully");
}
