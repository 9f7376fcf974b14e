/// Bounded concurrent fan-out over the planned hosts.
///
/// One task per host, gated by a token semaphore sized from the
/// configuration (or `--max-conns`). Workers never surface errors here;
/// they record into the failure tracker and the scheduler simply joins
/// everything before returning.
use crate::deploy;
use crate::resolve::DeploymentPlan;
use crate::RunContext;
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

pub async fn run_deployment(ctx: Arc<RunContext>, plan: DeploymentPlan) {
    if plan.hosts.is_empty() {
        info!("no hosts have planned files");
        return;
    }

    let limit = ctx
        .options
        .max_conns
        .unwrap_or(ctx.config.max_ssh_concurrency);

    if limit <= 1 {
        // Sequential mode short-circuits on the first failing host.
        for host in &plan.hosts {
            let failures_before = ctx.tracker.len();
            deploy::deploy_host(&ctx, host).await;
            if ctx.tracker.len() > failures_before {
                warn!(host = %host.settings.name, "stopping sequential deployment after failure");
                break;
            }
        }
        return;
    }

    let semaphore = Arc::new(Semaphore::new(limit));
    let workers: Vec<_> = plan
        .hosts
        .into_iter()
        .map(|host| {
            let ctx = Arc::clone(&ctx);
            let semaphore = Arc::clone(&semaphore);
            tokio::spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    // Only possible after close(), which never happens here.
                    Err(_) => return,
                };
                deploy::deploy_host(&ctx, &host).await;
            })
        })
        .collect();

    for joined in join_all(workers).await {
        if let Err(e) = joined {
            error!("deployment worker panicked: {}", e);
        }
    }
}
