//! Periodically refreshed, content-addressed cache of registry entries.
//!
//! The mirror is the only thing in this crate that touches both the
//! registry client and the vector index, and it is the component
//! responsible for the two core correctness properties: the cache is never
//! observed half-updated, and an empty fetch (a transient registry outage)
//! never wipes the index.

use crate::descriptor::ServerDescriptor;
use crate::digest::DescribedDigest;
use crate::registry_client::RegistryClient;
use crate::vector_index::VectorIndex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

struct MirrorState {
    cache: HashMap<String, ServerDescriptor>,
    versions: HashMap<String, DescribedDigest>,
}

/// The router's local view of the registry.
///
/// In router mode this mirrors every enabled entry; in proxy mode it mirrors
/// exactly one fixed entry and is never diffed against a vector index.
pub struct RegistryMirror {
    registry: RegistryClient,
    index: Option<Arc<VectorIndex>>,
    state: RwLock<MirrorState>,
}

impl RegistryMirror {
    pub fn new(registry: RegistryClient, index: Option<Arc<VectorIndex>>) -> Self {
        Self {
            registry,
            index,
            state: RwLock::new(MirrorState {
                cache: HashMap::new(),
                versions: HashMap::new(),
            }),
        }
    }

    /// Router-mode refresh: pull every enabled entry, diff by digest, swap
    /// the cache in atomically, and reconcile the vector index.
    ///
    /// Guards against indexing wipe on a transient registry outage: if the
    /// fetch came back empty, the cache and index are left untouched.
    pub async fn refresh_all(&self) {
        let descriptors = self.registry.list_all().await;
        if descriptors.is_empty() {
            warn!("registry fetch returned no entries; leaving mirror untouched");
            return;
        }

        let mut new_cache = HashMap::with_capacity(descriptors.len());
        let mut new_versions = HashMap::with_capacity(descriptors.len());
        let mut upsert_ids = Vec::new();
        let mut upsert_docs = Vec::new();

        {
            let state = self.state.read().await;
            for descriptor in descriptors {
                let digest = DescribedDigest::of(&descriptor);
                let changed = state.versions.get(&descriptor.name) != Some(&digest);
                if changed {
                    upsert_ids.push(descriptor.name.clone());
                    upsert_docs.push(descriptor.tool_description());
                }
                new_versions.insert(descriptor.name.clone(), digest);
                new_cache.insert(descriptor.name.clone(), descriptor);
            }
        }

        let cache_keys: std::collections::HashSet<String> = new_cache.keys().cloned().collect();

        {
            let mut state = self.state.write().await;
            state.cache = new_cache;
            state.versions = new_versions;
        }

        let Some(index) = &self.index else {
            return;
        };

        if !upsert_ids.is_empty() {
            if let Err(e) = index.upsert(&upsert_ids, &upsert_docs).await {
                warn!(error = %e, "failed to upsert changed entries into vector index");
            } else {
                debug!(count = upsert_ids.len(), "upserted changed entries into vector index");
            }
        }

        let all_ids = index.list_all_ids().await;
        let tombstones: Vec<String> = all_ids
            .into_iter()
            .filter(|id| !cache_keys.contains(id))
            .collect();
        if !tombstones.is_empty() {
            if let Err(e) = index.delete(&tombstones).await {
                warn!(error = %e, "failed to delete tombstoned entries from vector index");
            } else {
                info!(count = tombstones.len(), "deleted tombstoned entries from vector index");
            }
        }
    }

    /// Proxy-mode refresh: fetch exactly one named entry.
    pub async fn refresh_one(&self, name: &str) -> bool {
        let Some(descriptor) = self.registry.get_by_name(name).await else {
            warn!(server = %name, "proxied server not found in registry");
            return false;
        };

        let mut state = self.state.write().await;
        state.cache.clear();
        state.cache.insert(descriptor.name.clone(), descriptor);
        true
    }

    /// Case-sensitive substring search over the cached descriptions.
    pub async fn search_by_keyword(&self, keyword: &str) -> Vec<ServerDescriptor> {
        self.state
            .read()
            .await
            .cache
            .values()
            .filter(|d| d.description.contains(keyword))
            .cloned()
            .collect()
    }

    /// Semantic top-k lookup, resolved back against the current cache; ids
    /// the vector index knows about but that have since fallen out of the
    /// cache are dropped.
    pub async fn get_mcp_server_semantic(
        &self,
        query: &str,
        k: usize,
    ) -> Vec<ServerDescriptor> {
        let Some(index) = &self.index else {
            return Vec::new();
        };

        let ids = match index.query_top_k(query, k).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "vector index query failed");
                return Vec::new();
            }
        };

        let state = self.state.read().await;
        ids.into_iter()
            .filter_map(|id| state.cache.get(&id).cloned())
            .collect()
    }

    pub async fn get_by_name(&self, name: &str) -> Option<ServerDescriptor> {
        self.state.read().await.cache.get(name).cloned()
    }

    pub fn registry(&self) -> &RegistryClient {
        &self.registry
    }
}

/// Combined keyword + semantic-top-up search used by `search_mcp_server`.
///
/// Runs the keyword search for every comma-separated keyword first; only if
/// that union has fewer than `min_results` entries does it top up with a
/// semantic query using `task_description` itself (not the keywords) as the
/// query string — the keyword search already ran separately.
pub async fn search_mcp_server(
    mirror: &RegistryMirror,
    task_description: &str,
    key_words: &str,
    min_results: usize,
) -> Vec<ServerDescriptor> {
    let mut seen = std::collections::HashSet::new();
    let mut results = Vec::new();

    for keyword in key_words.split(',') {
        let keyword = keyword.trim();
        if keyword.is_empty() {
            continue;
        }
        for descriptor in mirror.search_by_keyword(keyword).await {
            if seen.insert(descriptor.name.clone()) {
                results.push(descriptor);
            }
        }
    }

    if results.len() < min_results {
        let remaining = min_results - results.len();
        for descriptor in mirror
            .get_mcp_server_semantic(task_description, remaining)
            .await
        {
            if seen.insert(descriptor.name.clone()) {
                results.push(descriptor);
            }
        }
    }

    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry_client::RegistryClientConfig;

    fn test_mirror() -> RegistryMirror {
        RegistryMirror::new(
            RegistryClient::new(RegistryClientConfig {
                addr: "127.0.0.1:8848".to_string(),
                username: "nacos".to_string(),
                password: String::new(),
                scheme: "http".to_string(),
            }),
            None,
        )
    }

    fn descriptor(name: &str, description: &str) -> ServerDescriptor {
        serde_json::from_value(serde_json::json!({
            "name": name,
            "protocol": "stdio",
            "description": description,
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn search_by_keyword_is_case_sensitive_substring() {
        let mirror = test_mirror();
        {
            let mut state = mirror.state.write().await;
            state
                .cache
                .insert("weather".to_string(), descriptor("weather", "Weather forecasts"));
        }

        assert_eq!(mirror.search_by_keyword("Weather").await.len(), 1);
        assert_eq!(mirror.search_by_keyword("weather").await.len(), 0);
    }

    #[tokio::test]
    async fn get_by_name_reads_from_cache() {
        let mirror = test_mirror();
        {
            let mut state = mirror.state.write().await;
            state
                .cache
                .insert("weather".to_string(), descriptor("weather", "Weather forecasts"));
        }

        assert!(mirror.get_by_name("weather").await.is_some());
        assert!(mirror.get_by_name("missing").await.is_none());
    }
}
