use std::sync::Arc;
use std::sync::atomic::Ordering;
use log::{error, info, warn};

use crate::core::error::{Error, Result};
use crate::index::reader::SearchIndex;
use crate::index::segment::{rename_segment, SegmentPaths};
use crate::server::{IndexSlot, ServerCtx};

/// SIGHUP entry point: checks every local index for a `.new` shadow
/// and swaps the ones that have it. Runs as its own task, so the
/// accept loop never stalls on a rotation.
pub async fn rotate_all(ctx: Arc<ServerCtx>) {
    let candidates: Vec<(String, String)> = ctx
        .config
        .indexes
        .iter()
        .filter(|(_, c)| c.kind != "distributed")
        .map(|(name, c)| (name.clone(), c.path.clone()))
        .collect();

    for (name, path) in candidates {
        let shadow = SegmentPaths::new_variant(&path);
        if !shadow.exists() {
            continue;
        }
        info!("rotating index '{}': new version found", name);
        let seamless = ctx.config.searchd.seamless_rotate;
        let outcome = if seamless {
            rotate_seamless(&ctx, &name, &path).await
        } else {
            rotate_greedy(&ctx, &name, &path)
        };
        match outcome {
            Ok(()) => {
                ctx.stats.rotations.fetch_add(1, Ordering::Relaxed);
                info!("rotating index '{}': success", name);
            }
            Err(e) => {
                // the old index keeps serving
                error!("rotating index '{}': {}; using old index", name, e);
            }
        }
    }
}

/// Seamless mode: preread the shadow in the background, then swap.
/// In-flight queries finish on the old `Arc`.
async fn rotate_seamless(ctx: &Arc<ServerCtx>, name: &str, path: &str) -> Result<()> {
    let shadow = SegmentPaths::new_variant(path);

    // validate and warm the new files before touching the live ones
    let preread = tokio::task::spawn_blocking(move || -> Result<()> {
        let probe = SearchIndex::open(shadow, false)?;
        probe.preread();
        Ok(())
    })
    .await
    .map_err(|e| Error::internal(format!("preread task failed: {}", e)))?;
    preread?;

    swap_index(ctx, name, path)
}

/// Greedy mode: no preread, straight rename-and-reload.
fn rotate_greedy(ctx: &Arc<ServerCtx>, name: &str, path: &str) -> Result<()> {
    swap_index(ctx, name, path)
}

/// cur -> old, new -> cur with rollback, then pointer swap.
fn swap_index(ctx: &Arc<ServerCtx>, name: &str, path: &str) -> Result<()> {
    let cur = SegmentPaths::new(path);
    let old = SegmentPaths::old_variant(path);
    let new = SegmentPaths::new_variant(path);

    // the outgoing reader holds the flock on the live lock file until
    // every in-flight query drains, so the incoming one opens unlocked
    let renamed_to_old = rename_segment(&cur, &old)?;
    let index = match rename_segment(&new, &cur) {
        Ok(_) => match SearchIndex::open(SegmentPaths::new(path), false) {
            Ok(index) => index,
            Err(e) => {
                // roll everything back; the old index keeps serving
                let _ = rename_segment(&cur, &new);
                for (dst, src) in renamed_to_old.iter().rev() {
                    let _ = std::fs::rename(dst, src);
                }
                return Err(e);
            }
        },
        Err(e) => {
            for (dst, src) in renamed_to_old.iter().rev() {
                let _ = std::fs::rename(dst, src);
            }
            return Err(e);
        }
    };

    let map = ctx.indexes.read();
    match map.get(name) {
        Some(IndexSlot::Local(slot)) => {
            *slot.write() = Arc::new(index);
        }
        _ => {
            drop(map);
            ctx.indexes
                .write()
                .insert(name.to_string(), IndexSlot::Local(parking_lot::RwLock::new(Arc::new(index))));
            warn!("index '{}': was not serving before rotation, now added", name);
        }
    }
    Ok(())
}
