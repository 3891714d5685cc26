// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Service entry point: load settings, wire repositories, retrieval, tools
//! and the conversation engine, then serve HTTP/WebSocket.

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use troupe_config::{RuntimeMode, SessionRepoKind, Settings};
use troupe_core::{
    EngineRuntimeAdapter, InterruptRegistry, RuntimeAdapter, SessionService, StubRuntimeAdapter,
    UserRuntimes,
};
use troupe_retrieval::{
    EmbeddingClient, HttpEmbeddingClient, MemoryVectorStore, MockEmbeddingClient, RetrievalScope,
    RetrievalService,
};
use troupe_store::{
    InMemoryPersonaRepository, InMemorySessionRepository, KeyCipher, PersonaRepository,
    SessionRepository, SqliteStore,
};
use troupe_tools::builtin::{RagQueryTool, WebSearchTool};
use troupe_tools::ToolRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = Settings::from_env()?;
    let cipher = KeyCipher::new(&settings.encryption_key);

    let (sessions, personas): (Arc<dyn SessionRepository>, Arc<dyn PersonaRepository>) =
        match settings.session_repo {
            SessionRepoKind::Db => {
                let store = Arc::new(SqliteStore::open(
                    &settings.database_url,
                    cipher,
                    settings.memory_window,
                    settings.max_agents_per_turn,
                )?);
                info!(url = %settings.database_url, "using sqlite repositories");
                (store.clone(), store)
            }
            SessionRepoKind::Memory => {
                let personas = Arc::new(InMemoryPersonaRepository::new(
                    cipher,
                    settings.memory_window,
                    settings.max_agents_per_turn,
                ));
                info!("using in-memory repositories");
                (Arc::new(InMemorySessionRepository::new(personas.clone())), personas)
            }
        };

    let scope = RetrievalScope::new();
    let embedder: Arc<dyn EmbeddingClient> = if settings.embedding_model.is_empty() {
        Arc::new(MockEmbeddingClient::new(settings.embedding_dimension))
    } else {
        Arc::new(HttpEmbeddingClient::new(
            &settings.default_base_url,
            &settings.embedding_model,
            (!settings.default_api_key.is_empty()).then(|| settings.default_api_key.clone()),
            settings.embedding_dimension,
        ))
    };
    let retrieval = Arc::new(RetrievalService::new(
        Arc::new(MemoryVectorStore::new()),
        embedder,
    ));

    let mut tools = ToolRegistry::new();
    tools.register(WebSearchTool::default());
    tools.register(RagQueryTool::new(retrieval.clone(), scope.clone()));
    let tools = Arc::new(tools);

    let interrupts = InterruptRegistry::new();
    let adapter: Arc<dyn RuntimeAdapter> = match settings.runtime_mode {
        RuntimeMode::Stub => {
            info!("stub runtime adapter selected");
            Arc::new(StubRuntimeAdapter)
        }
        RuntimeMode::Engine => {
            let runtimes = Arc::new(
                UserRuntimes::new(settings.clone(), personas, tools).with_retrieval(retrieval),
            );
            Arc::new(EngineRuntimeAdapter::new(
                runtimes,
                settings.clone(),
                interrupts.clone(),
                scope,
            ))
        }
    };

    let service = Arc::new(SessionService::new(
        sessions,
        adapter,
        interrupts,
        settings.history_limit,
    ));

    troupe_server::serve(service, &settings.listen_addr).await
}
