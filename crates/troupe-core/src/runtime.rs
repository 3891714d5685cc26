// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Per-user runtime cache.
//!
//! Building a runtime is expensive (persona settings load, credential
//! decryption, model client construction), so one lives per user until
//! explicitly invalidated.  Construction is guarded by a per-user async
//! lock; two concurrent sessions of the same user build once.  Runtimes
//! are never shared across users.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use troupe_config::Settings;
use troupe_model::{ChatCompletionsProvider, ModelProvider};
use troupe_retrieval::RetrievalService;
use troupe_store::{PersonaRecord, PersonaRepository};
use troupe_tools::ToolRegistry;

use crate::invoker::PersonaInvoker;

/// Builds the model provider for one persona.  Swappable so tests can
/// inject scripted providers.
pub type ProviderFactory =
    Arc<dyn Fn(&PersonaRecord, &Settings) -> Arc<dyn ModelProvider> + Send + Sync>;

/// One user's wired persona set.
pub struct UserRuntime {
    pub username: String,
    pub personas: Vec<PersonaRecord>,
    pub memory_window: i32,
    pub max_agents_per_turn: i32,
    invokers: HashMap<String, PersonaInvoker>,
}

impl UserRuntime {
    pub fn invoker(&self, persona_name: &str) -> Option<&PersonaInvoker> {
        self.invokers.get(persona_name)
    }

    pub fn persona_by_id(&self, id: i64) -> Option<&PersonaRecord> {
        self.personas.iter().find(|p| p.id == id)
    }
}

/// Map `user → Runtime`, built lazily.
pub struct UserRuntimes {
    settings: Settings,
    personas: Arc<dyn PersonaRepository>,
    tools: Arc<ToolRegistry>,
    provider_factory: ProviderFactory,
    /// When present, persona background text is ingested into the persona's
    /// collection on first runtime build.
    retrieval: Option<Arc<RetrievalService>>,
    runtimes: Mutex<HashMap<String, Arc<UserRuntime>>>,
    build_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl UserRuntimes {
    pub fn new(
        settings: Settings,
        personas: Arc<dyn PersonaRepository>,
        tools: Arc<ToolRegistry>,
    ) -> Self {
        Self {
            settings,
            personas,
            tools,
            provider_factory: Arc::new(default_provider),
            retrieval: None,
            runtimes: Mutex::new(HashMap::new()),
            build_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the model-provider factory (tests).
    pub fn with_provider_factory(mut self, factory: ProviderFactory) -> Self {
        self.provider_factory = factory;
        self
    }

    /// Enable background-text ingestion on runtime build.
    pub fn with_retrieval(mut self, retrieval: Arc<RetrievalService>) -> Self {
        self.retrieval = Some(retrieval);
        self
    }

    /// Return the cached runtime for `username`, building it on first use.
    pub async fn get_or_build(&self, username: &str) -> anyhow::Result<Arc<UserRuntime>> {
        if let Some(rt) = self.runtimes.lock().await.get(username) {
            return Ok(rt.clone());
        }
        let lock = {
            let mut locks = self.build_locks.lock().await;
            locks
                .entry(username.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = lock.lock().await;
        // Double-check: another task may have built it while we waited.
        if let Some(rt) = self.runtimes.lock().await.get(username) {
            return Ok(rt.clone());
        }

        let runtime = Arc::new(self.build(username).await?);
        self.runtimes
            .lock()
            .await
            .insert(username.to_string(), runtime.clone());
        Ok(runtime)
    }

    /// Evict a user's runtime (credentials or personas changed).
    pub async fn invalidate(&self, username: &str) {
        self.runtimes.lock().await.remove(username);
    }

    async fn build(&self, username: &str) -> anyhow::Result<UserRuntime> {
        let settings = self
            .personas
            .load_persona_settings(username)
            .await
            .map_err(anyhow::Error::from)?;
        info!(
            user = username,
            personas = settings.personas.len(),
            "building user runtime"
        );

        let mut invokers = HashMap::new();
        for persona in &settings.personas {
            if let (Some(retrieval), Some(background)) = (&self.retrieval, &persona.background) {
                if !background.is_empty() {
                    if let Err(e) = retrieval
                        .ingest_text(username, persona.id, background, Some("background"))
                        .await
                    {
                        warn!(persona = %persona.name, "background ingestion failed: {e:#}");
                    }
                }
            }
            let model = (self.provider_factory)(persona, &self.settings);
            let instructions =
                (!persona.tone.is_empty()).then(|| format!("语气：{}", persona.tone));
            let invoker = PersonaInvoker::new(
                &persona.name,
                &persona.prompt,
                instructions,
                persona.memory_window,
                model,
                self.tools.clone(),
            );
            invokers.insert(persona.name.clone(), invoker);
        }

        Ok(UserRuntime {
            username: username.to_string(),
            personas: settings.personas,
            memory_window: settings.memory_window,
            max_agents_per_turn: settings.max_agents_per_turn,
            invokers,
        })
    }
}

/// Default factory: the persona's own profile, or the process defaults.
fn default_provider(persona: &PersonaRecord, settings: &Settings) -> Arc<dyn ModelProvider> {
    let api = persona.api.as_ref();
    let base_url = api
        .and_then(|a| a.base_url.clone())
        .unwrap_or_else(|| settings.default_base_url.clone());
    let model = api
        .and_then(|a| a.model.clone())
        .unwrap_or_else(|| settings.default_model.clone());
    let api_key = api
        .and_then(|a| a.api_key.clone())
        .or_else(|| (!settings.default_api_key.is_empty()).then(|| settings.default_api_key.clone()));
    let temperature = api
        .and_then(|a| a.temperature)
        .unwrap_or(settings.temperature);
    Arc::new(ChatCompletionsProvider::new(
        &base_url,
        model,
        api_key,
        Some(temperature),
        None,
    ))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use troupe_model::ScriptedMockProvider;
    use troupe_store::{InMemoryPersonaRepository, NewPersona};

    fn scripted_factory() -> ProviderFactory {
        Arc::new(|_, _| Arc::new(ScriptedMockProvider::always_text("ok")))
    }

    async fn runtimes_with_personas(names: &[&str]) -> UserRuntimes {
        let repo = Arc::new(InMemoryPersonaRepository::default());
        for n in names {
            repo.create_persona("alice", NewPersona::named(*n)).await.unwrap();
        }
        UserRuntimes::new(Settings::default(), repo, Arc::new(ToolRegistry::new()))
            .with_provider_factory(scripted_factory())
    }

    #[tokio::test]
    async fn runtime_is_cached_per_user() {
        let rts = runtimes_with_personas(&["Ada"]).await;
        let a = rts.get_or_build("alice").await.unwrap();
        let b = rts.get_or_build("alice").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn invalidate_forces_rebuild() {
        let rts = runtimes_with_personas(&["Ada"]).await;
        let a = rts.get_or_build("alice").await.unwrap();
        rts.invalidate("alice").await;
        let b = rts.get_or_build("alice").await.unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn runtime_has_invoker_per_persona() {
        let rts = runtimes_with_personas(&["Ada", "Ben"]).await;
        let rt = rts.get_or_build("alice").await.unwrap();
        assert!(rt.invoker("Ada").is_some());
        assert!(rt.invoker("Ben").is_some());
        assert!(rt.invoker("Nobody").is_none());
    }

    #[tokio::test]
    async fn users_do_not_share_runtimes() {
        let repo = Arc::new(InMemoryPersonaRepository::default());
        repo.create_persona("alice", NewPersona::named("Ada")).await.unwrap();
        repo.create_persona("bob", NewPersona::named("Rex")).await.unwrap();
        let rts = UserRuntimes::new(Settings::default(), repo, Arc::new(ToolRegistry::new()))
            .with_provider_factory(scripted_factory());
        let alice = rts.get_or_build("alice").await.unwrap();
        let bob = rts.get_or_build("bob").await.unwrap();
        assert!(alice.invoker("Ada").is_some());
        assert!(alice.invoker("Rex").is_none());
        assert!(bob.invoker("Rex").is_some());
    }
}
