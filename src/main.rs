use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::info;
use url::Url;

use recital::admission::Admission;
use recital::billing::MemoryBilling;
use recital::cache::AudioCache;
use recital::config::{GatewayConfig, ModelBackend};
use recital::consumer::ResultConsumer;
use recital::dispatcher::{ExternalDispatcher, RetryPolicy};
use recital::documents::{Block, MemoryDocumentStore};
use recital::records::MemoryBlockVariantStore;
use recital::scanner::{OverflowScanner, VisibilityScanner, run_cache_maintenance};
use recital::server::{Gateway, serve};
use recital::session::SessionChannel;
use recital::substrate::Substrate;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    recital::tracing::init_tracing();

    let config = match std::env::args().nth(1) {
        Some(path) => GatewayConfig::from_file(&path)?,
        None => GatewayConfig::default(),
    };
    config.validate()?;
    let config = Arc::new(config);

    let substrate = Arc::new(Substrate::new());
    let cache = Arc::new(AudioCache::open(&config.cache).await?);

    let documents = Arc::new(MemoryDocumentStore::new());
    for seed in &config.seed_documents {
        let blocks = seed.blocks.iter().map(|text| Block::new(text.clone())).collect();
        documents.insert_document(&seed.id, blocks);
    }
    let records = Arc::new(MemoryBlockVariantStore::new());
    let billing = Arc::new(MemoryBilling::unlimited());

    let admission = Arc::new(Admission {
        substrate: substrate.clone(),
        cache: cache.clone(),
        documents: documents.clone(),
        records: records.clone(),
        billing: billing.clone(),
        config: config.clone(),
    });

    let results = substrate
        .take_results()
        .context("results stream already taken")?;
    let consumer = ResultConsumer {
        substrate: substrate.clone(),
        cache: cache.clone(),
        records: records.clone(),
        billing: billing.clone(),
        config: config.clone(),
    };
    tokio::spawn(consumer.run(results));

    tokio::spawn(
        VisibilityScanner { substrate: substrate.clone(), config: config.clone() }.run(),
    );
    tokio::spawn(run_cache_maintenance(
        cache.clone(),
        config.cache.touch_flush_interval(),
    ));

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(60))
        .build()
        .context("build http client")?;

    let overflow = OverflowScanner::new(substrate.clone(), config.clone(), http.clone())?;
    if overflow.has_targets() {
        tokio::spawn(overflow.run());
    }

    for model in &config.models {
        match &model.backend {
            ModelBackend::External { endpoint, dispatchers } => {
                let dispatcher = Arc::new(ExternalDispatcher {
                    substrate: substrate.clone(),
                    http: http.clone(),
                    endpoint: Url::parse(endpoint)
                        .with_context(|| format!("endpoint for model {:?}", model.slug))?,
                    model: model.slug.clone(),
                    retry: RetryPolicy::default(),
                    claim_wait: config.claim_wait(),
                });
                for task_idx in 0..*dispatchers {
                    tokio::spawn(dispatcher.clone().run(task_idx));
                }
                info!(model = %model.slug, tasks = *dispatchers, "external dispatchers started");
            }
            ModelBackend::Local => {
                info!(model = %model.slug, "local queue ready; awaiting pull workers");
            }
        }
    }

    let sessions = Arc::new(SessionChannel {
        admission,
        substrate: substrate.clone(),
        config: config.clone(),
    });
    let gateway = Arc::new(Gateway {
        config: config.clone(),
        substrate,
        cache,
        sessions,
    });

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("bind {}", config.bind_addr))?;
    serve(listener, gateway).await
}
