use async_trait::async_trait;

use crate::config::LeaderConfig;

/// Decides which instance in a fleet runs shared maintenance.
#[async_trait]
pub trait LeaderElection: Send + Sync {
    async fn is_this_instance_leader(&self) -> bool;
}

/// Leadership fixed by configuration.
pub struct StaticLeaderElection {
    is_leader: bool,
}

impl StaticLeaderElection {
    pub fn new(is_leader: bool) -> Self {
        Self { is_leader }
    }
}

impl From<&LeaderConfig> for StaticLeaderElection {
    fn from(config: &LeaderConfig) -> Self {
        match config {
            LeaderConfig::Static { is_leader } => Self::new(*is_leader),
        }
    }
}

#[async_trait]
impl LeaderElection for StaticLeaderElection {
    async fn is_this_instance_leader(&self) -> bool {
        self.is_leader
    }
}
