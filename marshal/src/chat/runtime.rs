//! Runtime snapshot for the chat system prompt and scope resolution.
//!
//! Clients and their projects change rarely and are cached for five minutes;
//! pending user tasks are fetched fresh each turn.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tracing::warn;

use crate::coordinator::CoordinatorClient;

const CLIENTS_CACHE_TTL: Duration = Duration::from_secs(300);

/// Runtime data injected into the system prompt.
#[derive(Clone, Debug, Default)]
pub struct RuntimeContext {
    pub clients_projects: Vec<Value>,
    pub pending_user_tasks: Value,
}

impl RuntimeContext {
    /// Resolves a client by name: exact match first, then case-insensitive
    /// substring.
    pub fn resolve_client(&self, name_query: &str) -> Option<&Value> {
        let needle = name_query.trim().to_lowercase();
        if needle.is_empty() {
            return None;
        }
        self.clients_projects.iter().find(|c| {
            let cname = c["name"].as_str().unwrap_or("").to_lowercase();
            cname == needle || cname.contains(&needle)
        })
    }

    pub fn resolve_project<'a>(&self, client: &'a Value, name_query: &str) -> Option<&'a Value> {
        let needle = name_query.trim().to_lowercase();
        if needle.is_empty() {
            return None;
        }
        client["projects"].as_array()?.iter().find(|p| {
            let pname = p["name"].as_str().unwrap_or("").to_lowercase();
            pname == needle || pname.contains(&needle)
        })
    }

    pub fn client_name(&self, client_id: &str) -> Option<String> {
        self.clients_projects
            .iter()
            .find(|c| c["id"].as_str() == Some(client_id))
            .and_then(|c| c["name"].as_str())
            .map(str::to_string)
    }

    pub fn project_name(&self, client_id: &str, project_id: &str) -> Option<String> {
        self.clients_projects
            .iter()
            .find(|c| c["id"].as_str() == Some(client_id))?["projects"]
            .as_array()?
            .iter()
            .find(|p| p["id"].as_str() == Some(project_id))?["name"]
            .as_str()
            .map(str::to_string)
    }

    /// Projects of a client as a JSON array for scope_change events.
    pub fn client_projects(&self, client_id: &str) -> Value {
        self.clients_projects
            .iter()
            .find(|c| c["id"].as_str() == Some(client_id))
            .map(|c| c["projects"].clone())
            .filter(|p| p.is_array())
            .unwrap_or_else(|| json!([]))
    }

    pub fn available_client_names(&self) -> String {
        self.clients_projects
            .iter()
            .map(|c| c["name"].as_str().unwrap_or("?"))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// TTL-cached loader for [`RuntimeContext`].
pub struct RuntimeContextCache {
    coordinator: CoordinatorClient,
    clients: Mutex<Option<(Vec<Value>, Instant)>>,
}

impl RuntimeContextCache {
    pub fn new(coordinator: CoordinatorClient) -> Self {
        Self {
            coordinator,
            clients: Mutex::new(None),
        }
    }

    pub async fn load(&self) -> RuntimeContext {
        let cached = {
            let guard = self.clients.lock().unwrap_or_else(|e| e.into_inner());
            guard.clone().filter(|(_, at)| at.elapsed() < CLIENTS_CACHE_TTL)
        };
        let clients_projects = match cached {
            Some((clients, _)) => clients,
            None => match self.coordinator.get_clients_projects().await {
                Ok(clients) => {
                    *self.clients.lock().unwrap_or_else(|e| e.into_inner()) =
                        Some((clients.clone(), Instant::now()));
                    clients
                }
                Err(e) => {
                    warn!(error = %e, "failed to load clients-projects");
                    Vec::new()
                }
            },
        };

        let pending_user_tasks = self
            .coordinator
            .get_pending_user_tasks(3)
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "failed to load pending user tasks");
                json!({"count": 0, "tasks": []})
            });

        RuntimeContext {
            clients_projects,
            pending_user_tasks,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> RuntimeContext {
        RuntimeContext {
            clients_projects: vec![json!({
                "id": "c1",
                "name": "Acme Corp",
                "projects": [
                    {"id": "p1", "name": "Website"},
                    {"id": "p2", "name": "Mobile App"},
                ],
            })],
            pending_user_tasks: json!({"count": 0, "tasks": []}),
        }
    }

    #[test]
    fn resolves_client_by_substring_case_insensitive() {
        let ctx = ctx();
        assert_eq!(ctx.resolve_client("acme").unwrap()["id"], "c1");
        assert!(ctx.resolve_client("globex").is_none());
        assert!(ctx.resolve_client("").is_none());
    }

    #[test]
    fn resolves_project_within_client() {
        let ctx = ctx();
        let client = ctx.resolve_client("Acme Corp").unwrap();
        assert_eq!(ctx.resolve_project(client, "mobile").unwrap()["id"], "p2");
        assert!(ctx.resolve_project(client, "backend").is_none());
    }

    #[test]
    fn name_lookups_and_projects_json() {
        let ctx = ctx();
        assert_eq!(ctx.client_name("c1").as_deref(), Some("Acme Corp"));
        assert_eq!(ctx.project_name("c1", "p1").as_deref(), Some("Website"));
        assert!(ctx.project_name("c1", "ghost").is_none());
        assert_eq!(ctx.client_projects("c1").as_array().unwrap().len(), 2);
        assert_eq!(ctx.client_projects("ghost"), json!([]));
    }
}
