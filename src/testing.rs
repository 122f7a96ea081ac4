use std::{collections::HashMap, sync::Arc, time::Duration};

use blob_index::MemoryBlobIndex;
use blob_store::{BlobStore, MemoryStore, StaticCredentials, StaticPolicyResolver};
use data_model::{NamespaceId, NamespacePolicy};
use tokio::net::TcpListener;
use tracing::subscriber;
use tracing_subscriber::{layer::SubscriberExt, Layer};
use url::Url;

use crate::{
    blob_service::BlobService,
    config::PeerRegion,
    peers::PeerRegistry,
    replication::Replicator,
    routes::{create_routes, RouteState},
};

/// A blob service over in-memory tiers and an in-memory index.
pub struct TestHarness {
    pub service: Arc<BlobService>,
    pub stores: Vec<Arc<MemoryStore>>,
    pub index: Arc<MemoryBlobIndex>,
    pub policies: Arc<StaticPolicyResolver>,
}

pub struct TestHarnessBuilder {
    region: String,
    tiers: usize,
    stores: Option<Vec<Arc<MemoryStore>>>,
    upper_tiers: Vec<Arc<dyn BlobStore>>,
    root_tiers: Vec<Arc<dyn BlobStore>>,
    namespaces: HashMap<NamespaceId, NamespacePolicy>,
    peer_regions: Vec<PeerRegion>,
}

impl TestHarness {
    /// One tier, region `r1`, and a content-addressed namespace `test`.
    pub fn builder() -> TestHarnessBuilder {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug"));
        let _ = subscriber::set_global_default(
            tracing_subscriber::registry()
                .with(tracing_subscriber::fmt::layer().with_filter(env_filter)),
        );

        TestHarnessBuilder {
            region: "r1".to_string(),
            tiers: 1,
            stores: None,
            upper_tiers: Vec::new(),
            root_tiers: Vec::new(),
            namespaces: HashMap::from([(
                NamespaceId::new("test").unwrap(),
                NamespacePolicy::default(),
            )]),
            peer_regions: Vec::new(),
        }
    }

    /// Serve the blob API on an ephemeral port and return its base URL.
    pub async fn serve(&self) -> Url {
        let app = create_routes(RouteState {
            blob_service: self.service.clone(),
        });
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/", addr).parse().unwrap()
    }
}

impl TestHarnessBuilder {
    pub fn region(mut self, region: &str) -> Self {
        self.region = region.to_string();
        self
    }

    pub fn tiers(mut self, tiers: usize) -> Self {
        self.tiers = tiers;
        self
    }

    pub fn with_stores(mut self, stores: Vec<Arc<MemoryStore>>) -> Self {
        self.stores = Some(stores);
        self
    }

    /// Extra tier placed above the memory tiers.
    pub fn upper_tier(mut self, store: Arc<dyn BlobStore>) -> Self {
        self.upper_tiers.push(store);
        self
    }

    /// Extra tier placed below the memory tiers, becoming the root.
    pub fn root_tier(mut self, store: Arc<dyn BlobStore>) -> Self {
        self.root_tiers.push(store);
        self
    }

    pub fn namespace(mut self, name: &str, policy: NamespacePolicy) -> Self {
        self.namespaces
            .insert(NamespaceId::new(name).unwrap(), policy);
        self
    }

    pub fn peer_region(mut self, region: PeerRegion) -> Self {
        self.peer_regions.push(region);
        self
    }

    pub fn build(self) -> TestHarness {
        let stores = self.stores.unwrap_or_else(|| {
            (0..self.tiers)
                .map(|_| Arc::new(MemoryStore::strict()))
                .collect()
        });
        let index = Arc::new(MemoryBlobIndex::new(self.region.clone()));
        let policies = Arc::new(StaticPolicyResolver::new(self.namespaces));
        let peers = Arc::new(PeerRegistry::new(
            self.peer_regions,
            Duration::from_secs(1),
        ));
        let replicator = Arc::new(Replicator::new(
            index.clone(),
            peers,
            Arc::new(StaticCredentials::anonymous()),
            Duration::from_secs(5),
        ));
        let tiers = self
            .upper_tiers
            .into_iter()
            .chain(stores.iter().map(|store| store.clone() as Arc<dyn BlobStore>))
            .chain(self.root_tiers)
            .collect();
        let service = Arc::new(BlobService::new(
            tiers,
            index.clone(),
            policies.clone(),
            replicator,
        ));
        TestHarness {
            service,
            stores,
            index,
            policies,
        }
    }
}
