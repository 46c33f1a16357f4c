//! Assembles the engine (trees, pipeline, reconciler, scheduler, watcher)
//! from a resolved [`Config`] and drives the long-running sync loop.
//! Grounded in `event_handler.py`'s `EventHandler.run`: authenticate,
//! initial sync, then alternate between draining filesystem events and
//! servicing the periodic dirty-check/refresh-tick jobs until asked to
//! stop.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::auth::{Authenticator, Credentials, NonInteractiveAuthenticator};
use crate::config::Config;
use crate::drive_api::{DriveApi, HttpDriveApi};
use crate::event_pipeline::EventPipeline;
use crate::filters::FilterSet;
use crate::local_tree::LocalTree;
use crate::node_record::rounding_family;
use crate::reconciler::Reconciler;
use crate::remote_tree::RemoteTree;
use crate::scheduler::{Scheduler, SchedulerConfig, REFRESH_BACKOFF_CAP_MULTIPLIER};
use crate::watcher;

/// Per §7: an unclassified ("fatal") error sleeps and restarts the whole
/// loop rather than propagating out of the process.
const FATAL_RESTART_DELAY: Duration = Duration::from_secs(60);

/// No production iCloud Drive endpoint exists to point at by default;
/// overriding this is a future CLI concern, not part of the current
/// surface (see SPEC_FULL.md §4.14).
const DEFAULT_DRIVE_BASE_URL: &str = "https://icloud.invalid/drive";

/// Runs the daemon until `shutdown` fires, restarting the sync loop after
/// any fatal error with a 60s backoff rather than exiting.
pub async fn run(cfg: Config, shutdown: Arc<tokio::sync::Notify>) -> Result<()> {
    crate::logging::init_log_file(&cfg.log_path)?;
    if let Some(password) = cfg.password.as_deref() {
        crate::logging::add_keyword(password);
    }
    crate::logging::info(format!(
        "daemon start version={} directory={} log={}",
        env!("CARGO_PKG_VERSION"),
        cfg.directory.display(),
        cfg.log_path.display(),
    ));

    loop {
        let shutdown_fired = shutdown.notified();
        tokio::pin!(shutdown_fired);
        tokio::select! {
            _ = &mut shutdown_fired => {
                crate::logging::info("shutdown requested, stopping");
                return Ok(());
            }
            result = run_once(&cfg, shutdown.clone()) => {
                match result {
                    Ok(()) => return Ok(()),
                    Err(e) => {
                        crate::logging::error(format!("fatal error, restarting in 60s: {e:#}"));
                        tokio::time::sleep(FATAL_RESTART_DELAY).await;
                    }
                }
            }
        }
    }
}

async fn run_once(cfg: &Config, shutdown: Arc<tokio::sync::Notify>) -> Result<()> {
    let ignore_patterns = load_pattern_file(cfg.ignore_regexes_path.as_deref())?;
    let include_patterns = load_pattern_file(cfg.include_regexes_path.as_deref())?;
    let filters = Arc::new(FilterSet::new(&ignore_patterns, &include_patterns)?);

    let local = LocalTree::new(cfg.directory.clone(), rounding_family());
    local.refresh(&filters);

    let drive: Arc<dyn DriveApi> = Arc::new(HttpDriveApi::new(DEFAULT_DRIVE_BASE_URL));
    let authenticator: Arc<dyn Authenticator> = Arc::new(NonInteractiveAuthenticator);
    let credentials = Credentials {
        username: cfg.username.clone(),
        password: cfg.password.clone(),
        cookie_directory: cfg.cookie_directory.display().to_string(),
    };

    let build_remote = {
        let drive = drive.clone();
        let authenticator = authenticator.clone();
        let credentials = credentials.clone();
        let filters = filters.clone();
        let max_workers = cfg.max_workers;
        let directory = cfg.directory.clone();
        move || {
            Arc::new(RemoteTree::new(
                drive.clone(),
                authenticator.clone(),
                credentials.clone(),
                filters.clone(),
                rounding_family(),
                max_workers,
                directory.clone(),
            ))
        }
    };

    let remote = build_remote();
    let initial_refresh = remote.refresh().await;
    if !initial_refresh.success {
        anyhow::bail!(
            "initial remote refresh failed: {}",
            initial_refresh.error.as_deref().unwrap_or("unknown error")
        );
    }

    let pipeline = Arc::new(EventPipeline::new(cfg.debounce_period));

    let debug_dump_dir = cfg.log_path.parent().map(|p| p.to_path_buf());
    let mut reconciler = Reconciler::new(local, remote, pipeline.clone());
    if let Some(dir) = debug_dump_dir {
        reconciler = reconciler.with_debug_dump_dir(dir);
    }

    let initial_jobs = reconciler.initial_sync();
    let scheduler_config = SchedulerConfig {
        max_readers: cfg.max_workers,
        icloud_check_period: cfg.icloud_check_period,
        icloud_refresh_period: cfg.icloud_refresh_period,
    };
    let (scheduler, writer_rx) = Scheduler::new(reconciler, scheduler_config);
    tokio::spawn(scheduler.clone().run_writer_pool(writer_rx));
    for dispatch in initial_jobs {
        scheduler.submit(dispatch).await;
    }

    let watcher_handle = watcher::watch(cfg.directory.clone(), pipeline.handle(), pipeline.clone(), filters.clone())
        .context("starting filesystem watcher")?;

    let mut dirty_check_ticker = tokio::time::interval(scheduler.dirty_check_period());
    let mut refresh_ticker = tokio::time::interval(scheduler.refresh_period());
    dirty_check_ticker.tick().await;
    refresh_ticker.tick().await;
    let mut refresh_period = scheduler.refresh_period();

    loop {
        let shutdown_fired = shutdown.notified();
        tokio::pin!(shutdown_fired);
        tokio::select! {
            _ = &mut shutdown_fired => {
                watcher_handle.stop();
                return Ok(());
            }
            drained = pipeline.drain() => {
                let coalesced = crate::event_pipeline::coalesce(drained);
                let conflated = crate::event_pipeline::conflate_folder_scope(coalesced);
                let reconciler = scheduler.reconciler.lock().await;
                let dispatches = reconciler.dispatch_events(conflated).await;
                drop(reconciler);
                for dispatch in dispatches {
                    scheduler.submit(dispatch).await;
                }
            }
            _ = dirty_check_ticker.tick() => {
                let dirty = if scheduler.is_idle() {
                    let reconciler = scheduler.reconciler.lock().await;
                    !reconciler.is_applying_refresh() && reconciler.remote.is_dirty().await
                } else {
                    false
                };
                if dirty {
                    crate::logging::info("dirty check found remote changes, requesting refresh");
                    apply_background_refresh(&scheduler, &build_remote).await;
                }
            }
            _ = refresh_ticker.tick() => {
                if scheduler.is_idle() {
                    let applied = apply_background_refresh(&scheduler, &build_remote).await;
                    let next_period = if applied {
                        scheduler.refresh_period()
                    } else {
                        std::cmp::min(refresh_period * 2, scheduler.refresh_period() * REFRESH_BACKOFF_CAP_MULTIPLIER)
                    };
                    if next_period != refresh_period {
                        refresh_period = next_period;
                        refresh_ticker = tokio::time::interval(refresh_period);
                        refresh_ticker.tick().await;
                        crate::logging::info(format!(
                            "refresh tick period now {}s",
                            refresh_period.as_secs()
                        ));
                    }
                }
            }
        }

        // Per §4.6: the suppressed-path set is cleared each time all
        // in-flight futures finish, so a genuine later edit to a path the
        // reconciler suppressed for its own write isn't dropped forever.
        if scheduler.is_idle() {
            pipeline.clear_suppressed();
        }
    }
}

/// Returns whether the refresh was cleanly applied, so the caller can
/// drive the refresh-tick backoff (§4.6): a `false` here means the next
/// tick should wait longer, not retry at the nominal cadence.
async fn apply_background_refresh(
    scheduler: &Arc<Scheduler>,
    build_remote: &impl Fn() -> Arc<RemoteTree>,
) -> bool {
    if !scheduler.is_idle() {
        return false;
    }
    let candidate = build_remote();
    let refresh_result = candidate.refresh().await;
    if !refresh_result.success {
        crate::logging::error(format!(
            "background refresh failed: {}",
            refresh_result.error.as_deref().unwrap_or("unknown error")
        ));
        return false;
    }

    let mut reconciler = scheduler.reconciler.lock().await;
    if reconciler.is_applying_refresh() {
        return false;
    }
    match reconciler.apply_refresh(candidate).await {
        Ok((uploaded, downloaded, deleted, created)) => {
            crate::logging::info_kv(
                "refresh applied",
                &[
                    ("uploaded", &uploaded.to_string()),
                    ("downloaded", &downloaded.to_string()),
                    ("deleted", &deleted.to_string()),
                    ("folders_created", &created.to_string()),
                ],
            );
            true
        }
        Err(e) => {
            crate::logging::error(format!("discarding inconsistent refresh: {e:#}"));
            false
        }
    }
}

fn load_pattern_file(path: Option<&std::path::Path>) -> Result<Vec<String>> {
    match path {
        Some(p) => FilterSet::load_pattern_file(p),
        None => Ok(Vec::new()),
    }
}
