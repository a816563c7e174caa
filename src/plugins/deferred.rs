// Deferred install queue - custom installers that need server-generated config

use crate::plugins::catalog::CustomInstall;
use crate::plugins::error::PluginError;
use crate::plugins::installers::{InstallContext, InstallerRegistry};
use crate::probe::ServerReachable;
use std::collections::VecDeque;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeferredInstall {
    pub plugin: String,
    pub install: CustomInstall,
}

/// FIFO of deferred installs, drained once the server is reachable
#[derive(Debug, Default)]
pub struct DeferredQueue {
    items: VecDeque<DeferredInstall>,
}

impl DeferredQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, plugin: &str, install: CustomInstall) {
        tracing::info!(
            "Deferring installer {} for {} until the server is online",
            install.script_reference,
            plugin
        );
        self.items.push_back(DeferredInstall {
            plugin: plugin.to_string(),
            install,
        });
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeferredInstall> {
        self.items.iter()
    }

    /// Run every queued installer in enqueue order, emptying the queue.
    /// Stops at the first failure.
    pub async fn drain(
        &mut self,
        reachable: &ServerReachable,
        registry: &InstallerRegistry,
        ctx: &InstallContext<'_>,
    ) -> Result<usize, PluginError> {
        if self.items.is_empty() {
            return Ok(0);
        }
        tracing::info!(
            "Server at {} is up, running {} deferred installer(s)",
            reachable.addr(),
            self.items.len()
        );

        let mut ran = 0;
        while let Some(item) = self.items.pop_front() {
            tracing::info!("Deferred install for {}", item.plugin);
            registry.run(&item.install, ctx).await?;
            ran += 1;
        }
        Ok(ran)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{HttpError, HttpFetch};
    use crate::plugins::catalog::InstallerCall;
    use crate::plugins::installers::CustomInstaller;
    use crate::probe::{wait_until_reachable, ProbeError, ReadinessProbe};
    use async_trait::async_trait;
    use std::net::SocketAddr;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    struct NoHttp;

    #[async_trait]
    impl HttpFetch for NoHttp {
        async fn get_text(&self, url: &str) -> Result<String, HttpError> {
            panic!("unexpected GET {}", url)
        }
        async fn download_to_file(&self, url: &str, _dest: &Path) -> Result<(), HttpError> {
            panic!("unexpected download {}", url)
        }
    }

    struct FakeProbe {
        online: Arc<AtomicBool>,
    }

    #[async_trait]
    impl ReadinessProbe for FakeProbe {
        async fn wait(&self, _addr: SocketAddr) -> Result<(), ProbeError> {
            tokio::task::yield_now().await;
            self.online.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    // Records its marker argument, and whether the server was up at the time
    struct Marker {
        online: Arc<AtomicBool>,
        log: Arc<Mutex<Vec<(String, bool)>>>,
    }

    #[async_trait]
    impl CustomInstaller for Marker {
        async fn install(
            &self,
            _ctx: &InstallContext<'_>,
            call: Option<&InstallerCall>,
        ) -> Result<(), PluginError> {
            let marker = call.and_then(|c| c.args.get("marker")).cloned().unwrap_or_default();
            if marker == "fail" {
                return Err(PluginError::installer("marker", "asked to fail"));
            }
            self.log
                .lock()
                .unwrap()
                .push((marker, self.online.load(Ordering::SeqCst)));
            Ok(())
        }
    }

    fn marker_install(marker: &str) -> CustomInstall {
        CustomInstall {
            script_reference: "marker".to_string(),
            function_to_call: Some(InstallerCall {
                function: "mark".to_string(),
                args: [("marker".to_string(), marker.to_string())].into_iter().collect(),
            }),
            defer_until_post_install: true,
        }
    }

    fn context<'a>(http: &'a NoHttp, dir: &'a Path) -> InstallContext<'a> {
        InstallContext {
            http,
            data_dir: dir,
            downloads_dir: dir,
            profile_dir: dir,
            instance_number: 1,
            sbpp: None,
        }
    }

    #[tokio::test]
    async fn test_drain_runs_fifo_after_readiness() {
        let online = Arc::new(AtomicBool::new(false));
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = InstallerRegistry::new();
        registry.register(
            "marker",
            Box::new(Marker {
                online: online.clone(),
                log: log.clone(),
            }),
        );

        let mut queue = DeferredQueue::new();
        for marker in ["1", "2", "3"] {
            queue.enqueue(&format!("plugin-{}", marker), marker_install(marker));
        }
        assert_eq!(queue.len(), 3);
        assert!(log.lock().unwrap().is_empty());

        let probe = FakeProbe {
            online: online.clone(),
        };
        let reachable = wait_until_reachable(&probe, "127.0.0.1:27015".parse().unwrap())
            .await
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let http = NoHttp;
        let ran = queue
            .drain(&reachable, &registry, &context(&http, dir.path()))
            .await
            .unwrap();

        assert_eq!(ran, 3);
        assert!(queue.is_empty());
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                ("1".to_string(), true),
                ("2".to_string(), true),
                ("3".to_string(), true),
            ]
        );
    }

    #[tokio::test]
    async fn test_drain_stops_at_first_failure() {
        let online = Arc::new(AtomicBool::new(true));
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = InstallerRegistry::new();
        registry.register(
            "marker",
            Box::new(Marker {
                online: online.clone(),
                log: log.clone(),
            }),
        );

        let mut queue = DeferredQueue::new();
        queue.enqueue("a", marker_install("1"));
        queue.enqueue("b", marker_install("fail"));
        queue.enqueue("c", marker_install("3"));

        let reachable = wait_until_reachable(&FakeProbe { online }, "127.0.0.1:27015".parse().unwrap())
            .await
            .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let http = NoHttp;
        let err = queue
            .drain(&reachable, &registry, &context(&http, dir.path()))
            .await
            .unwrap_err();

        assert!(matches!(err, PluginError::InstallerFailed { .. }));
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unregistered_installer() {
        let mut queue = DeferredQueue::new();
        queue.enqueue("a", marker_install("1"));
        let reachable = wait_until_reachable(
            &FakeProbe {
                online: Arc::new(AtomicBool::new(false)),
            },
            "127.0.0.1:27015".parse().unwrap(),
        )
        .await
        .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let http = NoHttp;

        let err = queue
            .drain(&reachable, &InstallerRegistry::new(), &context(&http, dir.path()))
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::UnknownInstaller(name) if name == "marker"));
    }
}
