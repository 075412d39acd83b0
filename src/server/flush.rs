use std::sync::Arc;
use std::time::Duration;
use log::{debug, error};

use crate::server::ServerCtx;

/// Periodic attribute flusher: persists `.spa` files whose update tag
/// moved past the last flushed tag.
pub async fn run_flusher(ctx: Arc<ServerCtx>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
    let period = Duration::from_secs(ctx.config.searchd.attr_flush_period_secs.max(1));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await; // the first tick fires immediately

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => return,
        }
        for name in ctx.local_names() {
            let Some(index) = ctx.local(&name) else { continue };
            let flushed = tokio::task::spawn_blocking(move || index.save_attributes()).await;
            match flushed {
                Ok(Ok(true)) => debug!("index '{}': attributes flushed", name),
                Ok(Ok(false)) => {}
                Ok(Err(e)) => error!("index '{}': attribute flush failed: {}", name, e),
                Err(e) => error!("index '{}': flush task failed: {}", name, e),
            }
        }
    }
}
