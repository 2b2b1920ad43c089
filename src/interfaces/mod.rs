//! Interface plugins: per-mode request validation and two-phase health
//! checks. One instance per `Mode` (Chat, Base, Embedding, Reranker); the
//! distilled system's notion of a loadable `interface_plugin_dir` of
//! third-party plugins is an external collaborator and out of scope here.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::json;

use crate::config::Mode;

/// Shallow-poll interval (phase 1) and deep-poll interval (phase 2),
/// grounded on the distilled source's base interface plugin.
const SHALLOW_POLL_INTERVAL: Duration = Duration::from_secs(2);
const DEEP_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[async_trait]
pub trait InterfacePlugin: Send + Sync {
    fn supported_endpoints(&self) -> HashSet<&'static str>;

    /// `path` has any leading slash already stripped by the caller.
    fn validate_request(&self, path: &str) -> Result<(), String> {
        if self.supported_endpoints().contains(path) {
            Ok(())
        } else {
            Err(format!("endpoint '{path}' is not served by this model's mode"))
        }
    }

    /// Two-phase probe. `on_shallow_passed` fires once, the moment phase 1
    /// succeeds, so the caller can record the `init_script -> health_check`
    /// transition at the right instant rather than only at the very end.
    async fn health_check(
        &self,
        client: &reqwest::Client,
        port: u16,
        deadline: Instant,
        on_shallow_passed: &(dyn Fn() + Send + Sync),
    ) -> (bool, String);
}

pub struct ModeInterface {
    mode: Mode,
}

impl ModeInterface {
    pub fn new(mode: Mode) -> Self {
        Self { mode }
    }

    fn minimal_request_body(&self) -> serde_json::Value {
        match self.mode {
            Mode::Chat => json!({
                "model": "probe",
                "messages": [{"role": "user", "content": "hi"}],
                "max_tokens": 1,
                "stream": false
            }),
            Mode::Base => json!({
                "model": "probe",
                "prompt": "hello",
                "max_tokens": 1,
                "stream": false
            }),
            Mode::Embedding => json!({
                "model": "probe",
                "input": "hello"
            }),
            Mode::Reranker => json!({
                "model": "probe",
                "query": "hello",
                "documents": ["hello"]
            }),
        }
    }
}

#[async_trait]
impl InterfacePlugin for ModeInterface {
    fn supported_endpoints(&self) -> HashSet<&'static str> {
        HashSet::from([self.mode.endpoint()])
    }

    async fn health_check(
        &self,
        client: &reqwest::Client,
        port: u16,
        deadline: Instant,
        on_shallow_passed: &(dyn Fn() + Send + Sync),
    ) -> (bool, String) {
        let base = format!("http://127.0.0.1:{port}");

        // Phase 1: shallow poll, every 2s, any response counts as success.
        loop {
            match client.get(format!("{base}/v1/models")).send().await {
                Ok(_) => break,
                Err(_) if Instant::now() < deadline => {
                    tokio::time::sleep(SHALLOW_POLL_INTERVAL).await;
                }
                Err(e) => return (false, format!("shallow probe never came up: {e}")),
            }
            if Instant::now() >= deadline {
                return (false, "shallow probe deadline exceeded".to_string());
            }
        }
        on_shallow_passed();

        // Phase 2: deep poll, every 1s, success on any 2xx.
        let url = format!("{base}/{}", self.mode.endpoint());
        let body = self.minimal_request_body();
        loop {
            match client.post(&url).json(&body).send().await {
                Ok(resp) if resp.status().is_success() => return (true, "ok".to_string()),
                _ if Instant::now() < deadline => {
                    tokio::time::sleep(DEEP_POLL_INTERVAL).await;
                }
                Ok(resp) => {
                    return (
                        false,
                        format!("deep probe deadline exceeded (last status {})", resp.status()),
                    )
                }
                Err(e) => return (false, format!("deep probe deadline exceeded: {e}")),
            }
            if Instant::now() >= deadline {
                return (false, "deep probe deadline exceeded".to_string());
            }
        }
    }
}

/// Built once at startup; one entry per `Mode` variant.
pub struct InterfaceRegistry {
    plugins: HashMap<Mode, Box<dyn InterfacePlugin>>,
}

impl InterfaceRegistry {
    pub fn default_registry() -> Self {
        let mut plugins: HashMap<Mode, Box<dyn InterfacePlugin>> = HashMap::new();
        for mode in [Mode::Chat, Mode::Base, Mode::Embedding, Mode::Reranker] {
            plugins.insert(mode, Box::new(ModeInterface::new(mode)));
        }
        Self { plugins }
    }

    pub fn get(&self, mode: Mode) -> &dyn InterfacePlugin {
        self.plugins[&mode].as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_request_rejects_wrong_endpoint() {
        let iface = ModeInterface::new(Mode::Chat);
        assert!(iface.validate_request("v1/chat/completions").is_ok());
        assert!(iface.validate_request("v1/completions").is_err());
    }

    #[test]
    fn each_mode_maps_to_its_canonical_endpoint() {
        assert_eq!(Mode::Chat.endpoint(), "v1/chat/completions");
        assert_eq!(Mode::Base.endpoint(), "v1/completions");
        assert_eq!(Mode::Embedding.endpoint(), "v1/embeddings");
        assert_eq!(Mode::Reranker.endpoint(), "v1/rerank");
    }
}
