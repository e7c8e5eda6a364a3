use crate::config::ManagedProcessConfig;
use crate::error::{Result, VigilError};
use crate::events::SupervisorEvent;
use crate::process::supervisor::{Backend, Supervisor, SupervisorStatus};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{error, info};

/// Owns one supervisor per configured app, keyed by app name
pub struct SupervisorRegistry {
    supervisors: HashMap<String, Supervisor>,
    backend: Backend,
    events: mpsc::Sender<SupervisorEvent>,
}

impl SupervisorRegistry {
    /// All supervisors share `backend` and report into `events`
    pub fn new(backend: Backend, events: mpsc::Sender<SupervisorEvent>) -> Self {
        Self {
            supervisors: HashMap::new(),
            backend,
            events,
        }
    }

    /// Create an Idle supervisor for `config`
    pub fn launch(&mut self, config: ManagedProcessConfig) -> Result<()> {
        if self.supervisors.contains_key(&config.name) {
            return Err(VigilError::AppAlreadyExists(config.name));
        }

        let name = config.name.clone();
        let supervisor = Supervisor::spawn(config, self.backend.clone(), self.events.clone())?;
        self.supervisors.insert(name, supervisor);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Supervisor> {
        self.supervisors.get(name)
    }

    /// Registered app names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.supervisors.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.supervisors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.supervisors.is_empty()
    }

    pub async fn start(&self, name: &str) -> Result<()> {
        self.lookup(name)?.start().await
    }

    pub async fn stop(&self, name: &str) -> Result<()> {
        self.lookup(name)?.stop().await
    }

    pub fn status(&self, name: &str) -> Result<SupervisorStatus> {
        Ok(self.lookup(name)?.status())
    }

    /// Status of every app, sorted by name
    pub fn statuses(&self) -> Vec<(String, SupervisorStatus)> {
        self.names()
            .into_iter()
            .filter_map(|name| {
                let status = self.supervisors.get(&name)?.status();
                Some((name, status))
            })
            .collect()
    }

    /// Start every app; failures are logged and the remaining apps still start
    ///
    /// Returns the number of apps whose first spawn succeeded.
    pub async fn start_all(&self) -> usize {
        let names = self.names();
        info!("Starting {} app(s)", names.len());

        let mut started = 0;
        for name in names {
            match self.start(&name).await {
                Ok(()) => started += 1,
                Err(e) => error!("Failed to start app '{}': {}", name, e),
            }
        }
        started
    }

    /// Stop every app, logging failures
    pub async fn stop_all(&self) -> Result<()> {
        let names = self.names();
        info!("Stopping {} app(s) gracefully", names.len());

        for name in names {
            if let Err(e) = self.stop(&name).await {
                error!("Failed to stop app '{}': {}", name, e);
            }
        }

        Ok(())
    }

    /// Stop an app and drop its supervisor
    pub async fn remove(&mut self, name: &str) -> Result<()> {
        let supervisor = self
            .supervisors
            .remove(name)
            .ok_or_else(|| VigilError::AppNotFound(name.to_string()))?;
        supervisor.shutdown().await
    }

    fn lookup(&self, name: &str) -> Result<&Supervisor> {
        self.supervisors
            .get(name)
            .ok_or_else(|| VigilError::AppNotFound(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::events::{EventKind, EVENT_BUFFER};
    use crate::process::clock::SystemClock;
    use crate::process::supervisor::SupervisorState;
    use crate::process::testing::FakeOs;
    use std::sync::Arc;

    fn managed(name: &str) -> ManagedProcessConfig {
        ManagedProcessConfig::try_from(&AppConfig::new(name, "/bin/true")).unwrap()
    }

    fn registry(os: &FakeOs) -> (SupervisorRegistry, mpsc::Receiver<SupervisorEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        (SupervisorRegistry::new(os.backend(Arc::new(SystemClock)), tx), rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_launch_and_lookup() {
        let os = FakeOs::new();
        let (mut registry, _events) = registry(&os);

        registry.launch(managed("worker")).unwrap();
        registry.launch(managed("api")).unwrap();

        assert_eq!(registry.names(), vec!["api".to_string(), "worker".to_string()]);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get("api").map(Supervisor::name), Some("api"));
        assert!(registry.get("missing").is_none());
        assert_eq!(
            registry.status("worker").unwrap().state,
            SupervisorState::Idle
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_name_rejected() {
        let os = FakeOs::new();
        let (mut registry, _events) = registry(&os);

        registry.launch(managed("api")).unwrap();
        assert!(matches!(
            registry.launch(managed("api")),
            Err(VigilError::AppAlreadyExists(name)) if name == "api"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_app() {
        let os = FakeOs::new();
        let (mut registry, _events) = registry(&os);

        assert!(matches!(
            registry.start("ghost").await,
            Err(VigilError::AppNotFound(_))
        ));
        assert!(matches!(
            registry.stop("ghost").await,
            Err(VigilError::AppNotFound(_))
        ));
        assert!(matches!(
            registry.remove("ghost").await,
            Err(VigilError::AppNotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_all_and_stop_all() {
        let os = FakeOs::new();
        os.fail_next_spawns(1);
        let (mut registry, mut events) = registry(&os);

        registry.launch(managed("a")).unwrap();
        registry.launch(managed("b")).unwrap();

        // "a" starts first and takes the failed spawn
        assert_eq!(registry.start_all().await, 1);
        assert_eq!(registry.status("b").unwrap().state, SupervisorState::Running);

        // "a" restarts on its own after the failed spawn
        registry
            .get("a")
            .unwrap()
            .subscribe()
            .wait_for(|status| status.state == SupervisorState::Running)
            .await
            .unwrap();

        registry.stop_all().await.unwrap();
        for (_, status) in registry.statuses() {
            assert_eq!(status.state, SupervisorState::Idle);
            assert_eq!(status.pid, None);
        }

        let mut stopped = 0;
        while let Ok(event) = events.try_recv() {
            if event.kind == EventKind::Stopped {
                stopped += 1;
            }
        }
        assert_eq!(stopped, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_shuts_down_supervisor() {
        let os = FakeOs::new();
        let (mut registry, _events) = registry(&os);

        registry.launch(managed("api")).unwrap();
        registry.start("api").await.unwrap();
        let pid = registry.status("api").unwrap().pid.unwrap();

        registry.remove("api").await.unwrap();
        assert!(registry.is_empty());
        assert!(!os.is_alive(pid));

        // The name is free again
        registry.launch(managed("api")).unwrap();
    }
}
