//! Reload coordinator
//!
//! Control-plane mutations write their artifacts to disk, then enqueue a
//! reload here. The coordinator debounces bursts, rebuilds the spec set
//! from the app directory, swaps the registry pointer, and fires the
//! completion callbacks of every queued request. Group reloads
//! additionally broadcast a notification for peer nodes.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::config::Config;
use crate::notifications::{Command, Notification, Notifier};
use crate::registry::{load_specs_from_dir, SpecRegistry};
use crate::session::PolicyMap;

const DEBOUNCE_WINDOW: Duration = Duration::from_millis(100);

/// Queue handle for reload requests.
#[derive(Clone)]
pub struct ReloadCoordinator {
    tx: mpsc::UnboundedSender<Option<oneshot::Sender<()>>>,
}

impl ReloadCoordinator {
    /// Spawn the coordinator loop. The returned handle enqueues requests;
    /// the join handle owns the loop task.
    pub fn spawn(
        config: Arc<Config>,
        registry: Arc<SpecRegistry>,
        policies: Arc<PolicyMap>,
    ) -> (Self, tokio::task::JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Option<oneshot::Sender<()>>>();

        let handle = tokio::spawn(async move {
            while let Some(first) = rx.recv().await {
                let mut waiters = Vec::new();
                if let Some(done) = first {
                    waiters.push(done);
                }

                // coalesce the burst
                tokio::time::sleep(DEBOUNCE_WINDOW).await;
                while let Ok(extra) = rx.try_recv() {
                    if let Some(done) = extra {
                        waiters.push(done);
                    }
                }

                rebuild(&config, &registry, &policies);

                for done in waiters {
                    let _ = done.send(());
                }
            }
        });

        (Self { tx }, handle)
    }

    /// Queue a reload; the swap happens on the coordinator task.
    pub fn queue_reload(&self) {
        let _ = self.tx.send(None);
    }

    /// Queue a reload and get a completion receiver (`block=true`).
    pub fn queue_reload_blocking(&self) -> oneshot::Receiver<()> {
        let (done_tx, done_rx) = oneshot::channel();
        let _ = self.tx.send(Some(done_tx));
        done_rx
    }
}

/// Rebuild the registry and policy map from disk and swap atomically.
fn rebuild(config: &Config, registry: &SpecRegistry, policies: &PolicyMap) {
    match load_specs_from_dir(&config.app_path) {
        Ok(specs) => {
            tracing::info!(apis = specs.len(), "Reloaded URL structure");
            registry.swap(specs);
        }
        Err(e) => {
            tracing::error!(error = %e, "Reload failed, keeping current API set");
        }
    }

    if config.policies.policy_source != "service" {
        match policies.load_from_dir(&config.policies.policy_path) {
            Ok(count) => tracing::debug!(policies = count, "Policies reloaded"),
            Err(e) => tracing::error!(error = %e, "Policy reload failed"),
        }
    }
}

/// Bridge group-reload notifications into local reloads.
pub fn spawn_notification_listener(
    notifier: &Notifier,
    coordinator: ReloadCoordinator,
) -> tokio::task::JoinHandle<()> {
    let mut rx = notifier.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(notification) => match notification.command {
                    Command::GroupReload
                    | Command::ApiAdded
                    | Command::ApiUpdated
                    | Command::ApiRemoved => {
                        tracing::info!(command = ?notification.command, "Reload requested by notification");
                        coordinator.queue_reload();
                    }
                    _ => {}
                },
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Notification listener lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// Watch the app-definition directory and reload on changes. The watcher
/// must stay alive for events to keep flowing.
pub fn watch_app_dir(
    app_path: impl Into<PathBuf>,
    coordinator: ReloadCoordinator,
) -> notify::Result<notify::RecommendedWatcher> {
    use notify::{Event, EventKind, RecursiveMode, Watcher};

    let app_path = app_path.into();
    let mut watcher = notify::recommended_watcher(move |event: notify::Result<Event>| {
        if let Ok(event) = event {
            match event.kind {
                EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) => {
                    tracing::debug!("App directory changed, scheduling reload");
                    coordinator.queue_reload();
                }
                _ => {}
            }
        }
    })?;
    watcher.watch(&app_path, RecursiveMode::NonRecursive)?;
    tracing::info!(path = %app_path.display(), "Watching app directory for changes");
    Ok(watcher)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apidef::{ApiDefinition, ProxyConfig};

    fn temp_app_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("gantry-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write_definition(dir: &PathBuf, api_id: &str) {
        let def = ApiDefinition {
            api_id: api_id.to_string(),
            name: api_id.to_string(),
            active: true,
            proxy: ProxyConfig {
                listen_path: format!("/{}/", api_id),
                target_url: "http://upstream".to_string(),
                ..ProxyConfig::default()
            },
            ..ApiDefinition::default()
        };
        std::fs::write(
            dir.join(format!("{}.json", api_id)),
            serde_json::to_string_pretty(&def).unwrap(),
        )
        .unwrap();
    }

    fn test_config(dir: &PathBuf) -> Arc<Config> {
        let mut config = Config::default();
        config.app_path = dir.to_string_lossy().to_string();
        config.policies.policy_path = dir.join("policies").to_string_lossy().to_string();
        Arc::new(config)
    }

    #[tokio::test]
    async fn test_blocking_reload_swaps_registry() {
        let dir = temp_app_dir();
        write_definition(&dir, "alpha");

        let registry = Arc::new(SpecRegistry::new());
        let policies = Arc::new(PolicyMap::new());
        let (coordinator, _task) =
            ReloadCoordinator::spawn(test_config(&dir), registry.clone(), policies);

        assert!(registry.is_empty());
        coordinator.queue_reload_blocking().await.unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.get("alpha").is_some());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_burst_coalesced_into_one_swap() {
        let dir = temp_app_dir();
        write_definition(&dir, "alpha");
        write_definition(&dir, "beta");

        let registry = Arc::new(SpecRegistry::new());
        let policies = Arc::new(PolicyMap::new());
        let (coordinator, _task) =
            ReloadCoordinator::spawn(test_config(&dir), registry.clone(), policies);

        coordinator.queue_reload();
        coordinator.queue_reload();
        let done = coordinator.queue_reload_blocking();
        done.await.unwrap();

        assert_eq!(registry.len(), 2);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_notification_listener_triggers_reload() {
        let dir = temp_app_dir();
        write_definition(&dir, "alpha");

        let registry = Arc::new(SpecRegistry::new());
        let policies = Arc::new(PolicyMap::new());
        let (coordinator, _task) =
            ReloadCoordinator::spawn(test_config(&dir), registry.clone(), policies);
        let notifier = Notifier::new();
        let _listener = spawn_notification_listener(&notifier, coordinator);

        notifier.notify(Notification::new(Command::GroupReload, ""));

        // listener → queue → debounce → swap
        for _ in 0..50 {
            if !registry.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(registry.len(), 1);
        std::fs::remove_dir_all(&dir).ok();
    }
}
