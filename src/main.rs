// CharHub core server: config → store → engine wiring → HTTP/WS serve.
// Background work (usage pricing, job workers, progress routing, the
// monthly grant tick) runs on the same runtime and drains on shutdown.

use charhub_core::api::{self, AppState, StoredTranslator};
use charhub_core::engine::auth::TokenSigner;
use charhub_core::engine::backends::{DisabledPaymentGateway, MemoryObjectStore, StubImageBackend};
use charhub_core::engine::broker::{LlmBroker, ToolRegistry};
use charhub_core::engine::cache::MemoryKv;
use charhub_core::engine::clock::system_clock;
use charhub_core::engine::config::EngineConfig;
use charhub_core::engine::costs::CostTable;
use charhub_core::engine::hub::SessionHub;
use charhub_core::engine::jobs::worker::WorkerPool;
use charhub_core::engine::jobs::{
    character_gen, credit_grants, image_dataset, translation, JobEngine,
};
use charhub_core::engine::ledger::Ledger;
use charhub_core::engine::membership::MembershipCore;
use charhub_core::engine::orchestrator::Orchestrator;
use charhub_core::engine::policy::PolicyGate;
use charhub_core::engine::progress;
use charhub_core::engine::store::Store;
use charhub_core::engine::usage::UsagePipeline;
use log::{error, info};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const GRANT_TICK_INTERVAL_SECS: u64 = 3600;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run().await {
        error!("[main] Fatal: {e}");
        std::process::exit(1);
    }
}

async fn run() -> charhub_core::atoms::error::EngineResult<()> {
    let config = EngineConfig::load()?;
    let clock = system_clock();

    let store = Arc::new(Store::open(&config.database_path)?);
    let kv = Arc::new(MemoryKv::new(clock.clone()));
    let signer = Arc::new(TokenSigner::new(
        config.auth_secret.clone().into_bytes(),
        clock.clone(),
    ));

    let ledger = Arc::new(Ledger::new(store.clone(), kv.clone(), clock.clone()));
    let usage = Arc::new(UsagePipeline::new(
        store.clone(),
        ledger.clone(),
        clock.clone(),
    ));
    let membership = Arc::new(MembershipCore::new(
        store.clone(),
        signer.clone(),
        clock.clone(),
    ));
    let policy = Arc::new(PolicyGate::new(
        ledger.clone(),
        kv.clone(),
        clock.clone(),
        config.rate_limits.clone(),
        config.default_rate_per_minute,
    ));

    let tools = Arc::new(
        ToolRegistry::new(clock.clone())
            .with_web_search(config.web_search_endpoint.clone(), kv.clone()),
    );
    let llm = Arc::new(LlmBroker::new(config.providers.clone()));

    let jobs = Arc::new(JobEngine::new(store.clone(), clock.clone()));
    let hub = SessionHub::new(
        store.clone(),
        membership.clone(),
        Arc::new(Orchestrator::new()),
        policy.clone(),
        usage.clone(),
        llm.clone(),
        tools,
        clock.clone(),
        config.default_model.clone(),
    );

    // External backends: swap these for the real object store and image
    // service in deployment; the in-process ones serve local runs.
    let object_store = MemoryObjectStore::new();
    let image_backend = Arc::new(StubImageBackend);

    let mut pool = WorkerPool::new(jobs.clone());
    pool.register(Arc::new(image_dataset::ImageDatasetHandler::new(
        object_store,
        image_backend,
        store.clone(),
        usage.clone(),
        clock.clone(),
    )));
    pool.register(Arc::new(credit_grants::PlanGrantHandler::new(
        ledger.clone(),
        store.clone(),
        clock.clone(),
    )));
    pool.register(Arc::new(character_gen::CharacterGenHandler::new(
        llm.clone(),
        store.clone(),
        usage.clone(),
        clock.clone(),
        config.default_model.clone(),
    )));
    pool.register(Arc::new(translation::TranslationHandler::new(
        llm.clone(),
        store.clone(),
        usage.clone(),
        clock.clone(),
        config.default_model.clone(),
    )));
    let pool = Arc::new(pool);

    let stop = Arc::new(AtomicBool::new(false));

    // Background tasks: pricing worker, job workers, progress router, and
    // the hourly monthly-grant tick.
    tokio::spawn(usage.clone().run_worker(stop.clone()));
    for i in 0..config.job_workers.max(1) {
        tokio::spawn(pool.clone().run(format!("worker-{i}"), stop.clone()));
    }
    tokio::spawn(progress::run_router(
        jobs.clone(),
        hub.clone(),
        stop.clone(),
    ));
    {
        let store = store.clone();
        let jobs = jobs.clone();
        let clock = clock.clone();
        let stop = stop.clone();
        tokio::spawn(async move {
            while !stop.load(Ordering::Relaxed) {
                if let Err(e) = credit_grants::run_grant_tick(&store, &jobs, &clock) {
                    error!("[main] Grant tick failed: {e}");
                }
                tokio::time::sleep(std::time::Duration::from_secs(GRANT_TICK_INTERVAL_SECS)).await;
            }
        });
    }

    let state = Arc::new(AppState {
        store: store.clone(),
        hub,
        signer,
        ledger,
        policy,
        membership,
        jobs,
        costs: CostTable::new(store.clone()),
        clock,
        translator: Arc::new(StoredTranslator::new(store)),
        payments: Arc::new(DisabledPaymentGateway),
    });

    let addr = format!("{}:{}", config.bind_address, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("[main] Listening on http://{addr}");

    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Let background loops observe the flag and wind down.
    stop.store(true, Ordering::Relaxed);
    info!("[main] Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("[main] Shutdown signal received");
}
