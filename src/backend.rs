//! Backend module for iohub
//!
//! This module handles taking in a configuration and setting up the cache
//! engine and its transport bridges.

use crate::cache::IoCache;
use crate::config::AppConfig;
use crate::mqtt::MqttBridge;
use crate::web::WebServer;
use eyre::Result;
use futures::future::select_all;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// A transport adapter that is both a producer and a listener for the cache.
#[async_trait::async_trait]
pub trait Bridge {
    async fn run(&mut self) -> Result<()>;
}

/// Manages the lifecycle of background services (tasks)
struct ServiceManager {
    handles: Vec<JoinHandle<()>>,
}

impl ServiceManager {
    /// Creates a new, empty ServiceManager.
    fn new() -> Self {
        Self {
            handles: Vec::new(),
        }
    }

    /// Spawns a new task and adds its handle to the manager.
    fn spawn<F>(&mut self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handles.push(tokio::spawn(future));
    }

    /// Aborts all managed tasks.
    fn shutdown(&self) {
        tracing::info!("Aborting all service tasks...");
        for handle in &self.handles {
            handle.abort();
        }
    }

    /// Waits for any of the managed services to complete.
    /// This is useful for detecting unexpected shutdowns.
    async fn wait_for_any_completion(&mut self) {
        if self.handles.is_empty() {
            // If there are no tasks, wait indefinitely.
            std::future::pending::<()>().await;
            return;
        }
        // `select_all` waits for the first future to complete.
        let (result, index, _) = select_all(self.handles.iter_mut()).await;
        tracing::warn!("Service task at index {} completed unexpectedly.", index);
        if let Err(e) = result {
            if e.is_panic() {
                tracing::error!("The task panicked!");
            }
        }
    }
}

/// Represents the actual backend service
pub struct Backend {
    config: AppConfig,
    cache: Arc<IoCache>,
    service_manager: ServiceManager,
}

impl Backend {
    /// Create a new backend from configuration. The cache engine's worker
    /// starts here and runs until shutdown.
    pub fn new(config: AppConfig) -> Self {
        let cache = Arc::new(IoCache::with_capacity(config.cache.queue_capacity));
        Self {
            config,
            cache,
            service_manager: ServiceManager::new(),
        }
    }

    /// Spawn a service task with automatic management
    fn spawn_service<F>(&mut self, name: &str, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tracing::debug!("Spawning service: {}", name);
        self.service_manager.spawn(future);
    }

    /// Start all configured bridge services
    pub async fn start(&mut self) -> Result<()> {
        tracing::info!("Starting backend services...");

        self.start_web_service()?;
        self.start_mqtt_service();

        tracing::info!("All backend services started successfully");
        Ok(())
    }

    fn start_web_service(&mut self) -> Result<()> {
        if !self.config.web.enabled {
            tracing::info!("Web bridge is disabled");
            return Ok(());
        }
        let mut server = WebServer::new(&self.config.web, self.cache.clone())?;
        self.spawn_service("web", async move {
            if let Err(e) = server.run().await {
                tracing::error!("Web bridge error: {}", e);
            }
        });
        Ok(())
    }

    fn start_mqtt_service(&mut self) {
        if !self.config.mqtt.enabled {
            tracing::info!("MQTT bridge is disabled");
            return;
        }
        let mut bridge = MqttBridge::new(self.config.mqtt.clone(), self.cache.clone());
        self.spawn_service("mqtt", async move {
            if let Err(e) = bridge.run().await {
                tracing::error!("MQTT bridge error: {}", e);
            }
        });
    }

    /// Wait for all services to complete or handle shutdown
    pub async fn wait_for_shutdown(&mut self) -> Result<()> {
        tracing::info!("Waiting for shutdown signal...");

        tokio::select! {
            // Wait for Ctrl+C
            signal_result = tokio::signal::ctrl_c() => {
                match signal_result {
                    Ok(_) => tracing::info!("Received Ctrl+C, shutting down gracefully..."),
                    Err(e) => tracing::error!("Failed to listen for Ctrl+C: {}", e),
                }
            }
            // Wait for any service to complete (which might indicate an error)
            _ = self.service_manager.wait_for_any_completion() => {
                tracing::warn!("One or more services completed unexpectedly, shutting down...");
            }
        }

        self.shutdown().await?;
        Ok(())
    }

    /// Gracefully shutdown all services, then drain and stop the cache engine
    pub async fn shutdown(&mut self) -> Result<()> {
        tracing::info!("Shutting down backend services...");
        self.service_manager.shutdown();
        self.cache.shutdown();
        tracing::info!("Backend shutdown complete");
        Ok(())
    }
}

/// Convenience function to create and start a backend from configuration
pub async fn setup_and_run_backend(config: AppConfig) -> Result<()> {
    let mut backend = Backend::new(config);
    backend.start().await?;
    backend.wait_for_shutdown().await?;
    Ok(())
}
