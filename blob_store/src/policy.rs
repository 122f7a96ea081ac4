use std::collections::HashMap;

use data_model::{BlobError, BlobResult, NamespaceId, NamespacePolicy};

/// Resolves a namespace to its storage policy.
pub trait NamespacePolicyResolver: Send + Sync {
    /// Fails with `BlobError::NamespaceNotFound` for unknown namespaces.
    fn get_policies_for_ns(&self, ns: &NamespaceId) -> BlobResult<NamespacePolicy>;

    /// All namespaces this resolver knows about.
    fn namespaces(&self) -> Vec<NamespaceId>;
}

/// Policy table loaded once from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticPolicyResolver {
    policies: HashMap<NamespaceId, NamespacePolicy>,
}

impl StaticPolicyResolver {
    pub fn new(policies: HashMap<NamespaceId, NamespacePolicy>) -> Self {
        Self { policies }
    }

    pub fn with_policy(mut self, ns: NamespaceId, policy: NamespacePolicy) -> Self {
        self.policies.insert(ns, policy);
        self
    }
}

impl NamespacePolicyResolver for StaticPolicyResolver {
    fn get_policies_for_ns(&self, ns: &NamespaceId) -> BlobResult<NamespacePolicy> {
        self.policies
            .get(ns)
            .cloned()
            .ok_or_else(|| BlobError::namespace_not_found(ns))
    }

    fn namespaces(&self) -> Vec<NamespaceId> {
        let mut namespaces: Vec<_> = self.policies.keys().cloned().collect();
        namespaces.sort();
        namespaces
    }
}
