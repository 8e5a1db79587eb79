use anyhow::{Context, Result};
use std::sync::Arc;
use trellis_runtime::{worker_main, ModuleLoader, ScriptLoader};

/// Serve the orchestrator over stdin/stdout until it shuts us down
///
/// Must run on a current-thread runtime: a test that blocks the thread also
/// stops this context's heartbeats, which is how the orchestrator notices.
pub async fn run_worker_process(worker_id: String) -> Result<()> {
    let loader: Arc<dyn ModuleLoader> = Arc::new(ScriptLoader::new());
    worker_main(worker_id.clone(), loader)
        .await
        .with_context(|| format!("Execution context {} failed", worker_id))
}
