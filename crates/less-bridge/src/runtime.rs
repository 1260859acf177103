use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::Result;
use crate::config::{CallMode, Config};
use crate::dispatch::{DispatchStats, Dispatcher, PluginFunction};
use crate::host::{PluginHost, PluginManifest};
use crate::scope::Scope;
use crate::shm::ShmManager;

/// Everything a compiler needs to call plugins: the host process, the dispatcher and the
/// root scope.
#[derive(Debug)]
pub struct Runtime {
    host: PluginHost,
    shm: Arc<ShmManager>,
    dispatcher: Arc<Dispatcher>,
    root: Scope,
}

impl Runtime {
    /// Starts the plugin host. In binary mode the persistent protocol is set up as well; if
    /// that fails, calls still work over per-call regions and JSON.
    pub fn start(config: Config) -> Result<Self> {
        let host = PluginHost::spawn(&config)?;
        let shm = Arc::new(match config.shm_capacity {
            Some(limit) => ShmManager::with_capacity_limit(limit),
            None => ShmManager::new(),
        });
        let dispatcher = Arc::new(Dispatcher::new(config.clone(), Arc::clone(host.mux()), Arc::clone(&shm)));

        if config.mode == CallMode::Binary {
            match dispatcher.init_protocol() {
                Ok(polling) => debug!(polling, "Protocol handshake done"),
                Err(e) => warn!(error = %e, "Binary protocol unavailable, continuing without it"),
            }
        }

        Ok(Self {
            host,
            shm,
            dispatcher,
            root: Scope::root(),
        })
    }

    pub fn root_scope(&self) -> &Scope {
        &self.root
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn host(&self) -> &PluginHost {
        &self.host
    }

    /// Loads a plugin in the peer and registers what it declares into `scope`.
    pub fn load_plugin(&self, path: &str, options: Value, scope: &Scope) -> Result<PluginManifest> {
        let manifest = self.host.load_plugin(path, options)?;

        for spec in &manifest.functions {
            let function = PluginFunction::new(spec.clone(), Arc::clone(&self.dispatcher));
            if scope.add_function(function).is_some() {
                debug!(function = %spec.name, "Replaced local function");
            }
            self.dispatcher.invalidate(&spec.name);
        }
        manifest.visitors.iter().cloned().for_each(|v| scope.add_visitor(v));
        manifest.pre_processors.iter().cloned().for_each(|p| scope.add_pre_processor(p));
        manifest.post_processors.iter().cloned().for_each(|p| scope.add_post_processor(p));
        manifest.file_managers.iter().cloned().for_each(|m| scope.add_file_manager(m));

        info!(
            path,
            depth = scope.depth(),
            functions = manifest.functions.len(),
            "Loaded plugin"
        );
        Ok(manifest)
    }

    pub fn begin_compilation(&self) {
        self.dispatcher.begin_compilation();
    }

    pub fn stats(&self) -> DispatchStats {
        self.dispatcher.stats()
    }

    /// Stops the protocol, then the host process, then removes all shared regions.
    pub fn shutdown(&self) {
        self.dispatcher.shutdown_protocol();
        self.host.shutdown();
        if let Err(e) = self.shm.destroy_all() {
            warn!(error = %e, "Failed to remove shared regions");
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}
