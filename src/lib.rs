pub mod cooldown;
pub mod db;
pub mod identity;
pub mod processor;
pub mod renders;
pub mod settings;
mod utils;

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use log::{error, info, warn};

use db::{Database, LocalRenderStore, RenderScope};
use processor::{LocalRenderProcessor, ProcessorMode};
use renders::{RenderEngine, SubmitOutcome};
use settings::SettingsStore;

const DEFAULT_DATA_DIR: &str = ".renderdesk";
const DEFAULT_OWNER: &str = "local";
const PROCESSOR_DELAY: Duration = Duration::from_secs(2);

/// Command-line entry: `renderdesk <page-url> <screenshot-key>...`
///
/// Renders every key against the local processor and prints the settled view as JSON.
pub fn run() {
    // RUST_LOG still wins when set.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("renderdesk starting up...");

    let result = tokio::runtime::Runtime::new()
        .context("failed to start tokio runtime")
        .and_then(|runtime| runtime.block_on(run_app(std::env::args().skip(1).collect())));

    if let Err(err) = result {
        error!("{err:#}");
        std::process::exit(1);
    }
}

async fn run_app(args: Vec<String>) -> Result<()> {
    let Some((page_url, keys)) = args.split_first() else {
        bail!("usage: renderdesk <page-url> <screenshot-key>...");
    };
    if keys.is_empty() {
        bail!("at least one screenshot key is required");
    }
    if !identity::is_web_url(Some(&identity::ensure_scheme(page_url))) {
        bail!("{page_url} is not a web URL");
    }

    let data_dir = std::env::var("RENDERDESK_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_DATA_DIR));
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to create {}", data_dir.display()))?;
    let owner = std::env::var("RENDERDESK_OWNER").unwrap_or_else(|_| DEFAULT_OWNER.into());

    let settings = SettingsStore::new(data_dir.join("settings.json"))?;
    let config = settings.engine().apply_env_overrides();

    let database = Database::new(data_dir.join("renderdesk.sqlite3"))?;
    let store = LocalRenderStore::new(database);
    let processor = LocalRenderProcessor::new(
        store.clone(),
        owner.clone(),
        ProcessorMode::Deferred(PROCESSOR_DELAY),
    );

    let scope = RenderScope::for_url(owner, page_url);
    info!("rendering {} key(s) for {}", keys.len(), scope.url);

    let ceiling = config.poll_ceiling();
    let engine = RenderEngine::new(scope, config, Arc::new(store), Arc::new(processor));
    engine.attach_feed().await?;

    for key in keys {
        match engine.submit_job(key, None).await {
            Ok(SubmitOutcome::Submitted { placeholder, .. }) => {
                info!("submitted {key} as {}", placeholder.id)
            }
            Ok(SubmitOutcome::Rejected { reason }) => info!("skipped {key}: {reason:?}"),
            Err(err) => warn!("{err:#}"),
        }
    }

    let mut view = engine.subscribe_view();
    let settled = tokio::time::timeout(ceiling, async {
        loop {
            if !view.borrow_and_update().iter().any(|r| r.is_queued()) {
                break;
            }
            if view.changed().await.is_err() {
                break;
            }
        }
    })
    .await;
    if settled.is_err() {
        warn!("renders still queued after {}s", ceiling.as_secs());
    }

    engine.shutdown().await;
    println!("{}", serde_json::to_string_pretty(&engine.view())?);
    Ok(())
}
