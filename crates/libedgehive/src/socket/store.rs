use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::connection::Connection;

/// Remote modules and groups, each mapped to the connection that reaches it.
#[derive(Default)]
pub struct PipeStore {
    modules: RwLock<HashMap<String, Arc<Connection>>>,
    groups: RwLock<HashMap<String, HashMap<String, Arc<Connection>>>>,
}

impl PipeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, module: &str, conn: Arc<Connection>) {
        self.modules.write().await.insert(module.to_string(), conn);
    }

    pub async fn add_group(&self, module: &str, group: &str, conn: Arc<Connection>) {
        self.groups
            .write()
            .await
            .entry(group.to_string())
            .or_default()
            .insert(module.to_string(), conn);
    }

    pub async fn get(&self, module: &str) -> Option<Arc<Connection>> {
        self.modules.read().await.get(module).cloned()
    }

    pub async fn contains(&self, module: &str) -> bool {
        self.modules.read().await.contains_key(module)
    }

    pub async fn modules(&self) -> Vec<String> {
        let mut names: Vec<_> = self.modules.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Members of `group` with their connections, sorted by module name.
    pub async fn group_members(&self, group: &str) -> Vec<(String, Arc<Connection>)> {
        let mut members: Vec<_> = self
            .groups
            .read()
            .await
            .get(group)
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        members.sort_by(|a, b| a.0.cmp(&b.0));
        members
    }

    pub async fn delete(&self, module: &str) -> bool {
        let removed = self.modules.write().await.remove(module).is_some();
        let mut groups = self.groups.write().await;
        for members in groups.values_mut() {
            members.remove(module);
        }
        groups.retain(|_, members| !members.is_empty());
        removed
    }

    /// Drops every module reached through connection `conn_id` and returns
    /// their names.
    pub async fn remove_connection(&self, conn_id: u64) -> Vec<String> {
        let mut removed = Vec::new();
        self.modules.write().await.retain(|name, conn| {
            let keep = conn.id() != conn_id;
            if !keep {
                removed.push(name.clone());
            }
            keep
        });
        let mut groups = self.groups.write().await;
        for members in groups.values_mut() {
            members.retain(|_, conn| conn.id() != conn_id);
        }
        groups.retain(|_, members| !members.is_empty());
        removed.sort();
        removed
    }
}
