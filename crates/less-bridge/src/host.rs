//! The plugin host child process.
use std::io::{self, BufRead, BufReader};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::dispatch::FunctionSpec;
use crate::mux::{CommandMux, MuxError};
use crate::scope::{FileManager, Processor, Visitor};

const EXIT_POLL: Duration = Duration::from_millis(10);

#[derive(Error, Debug)]
pub enum HostError {
    #[error("Failed to start plugin host \"{command}\": {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("Plugin host did not become ready: {0}")]
    NotReady(String),
    #[error(transparent)]
    Mux(#[from] MuxError),
    #[error("Invalid plugin manifest: {0}")]
    Manifest(#[from] serde_json::Error),
}

/// What a loaded plugin registers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PluginManifest {
    pub functions: Vec<FunctionSpec>,
    pub visitors: Vec<Visitor>,
    pub pre_processors: Vec<Processor>,
    pub post_processors: Vec<Processor>,
    pub file_managers: Vec<FileManager>,
}

/// A running plugin host, talking line-delimited JSON over its stdin and stdout.
///
/// Its stderr is forwarded to `tracing` under the `less_bridge::peer` target.
pub struct PluginHost {
    config: Config,
    mux: Arc<CommandMux>,
    child: Mutex<Option<Child>>,
    stderr: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for PluginHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginHost")
            .field("command", &self.config.peer_command)
            .field("shut_down", &self.shut_down.load(Ordering::Relaxed))
            .finish()
    }
}

impl PluginHost {
    /// Starts the peer command and waits for it to answer `ping`.
    pub fn spawn(config: &Config) -> Result<Self, HostError> {
        let mut child = Command::new(&config.peer_command)
            .args(&config.peer_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| HostError::Spawn {
                command: config.peer_command.clone(),
                source,
            })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(HostError::NotReady("stdio was not captured".to_string()));
        };
        let stderr = child.stderr.take().and_then(|stderr| {
            thread::Builder::new()
                .name("less-bridge-peer-stderr".to_string())
                .spawn(move || forward_stderr(stderr))
                .map_err(|e| warn!(error = %e, "Failed to forward peer stderr"))
                .ok()
        });

        info!(command = %config.peer_command, pid = child.id(), "Started plugin host");
        let host = Self {
            config: config.clone(),
            mux: Arc::new(CommandMux::new(BufReader::new(stdout), stdin)),
            child: Mutex::new(Some(child)),
            stderr: Mutex::new(stderr),
            shut_down: AtomicBool::new(false),
        };

        let started = Instant::now();
        if let Err(e) = host.mux.send("ping", Value::Null, config.startup_timeout) {
            host.shutdown();
            return Err(HostError::NotReady(e.to_string()));
        }
        debug!(elapsed = ?started.elapsed(), "Plugin host ready");
        Ok(host)
    }

    pub fn mux(&self) -> &Arc<CommandMux> {
        &self.mux
    }

    pub fn pid(&self) -> Option<u32> {
        lock(&self.child).as_ref().map(Child::id)
    }

    pub fn is_running(&self) -> bool {
        lock(&self.child)
            .as_mut()
            .is_some_and(|child| matches!(child.try_wait(), Ok(None)))
    }

    /// Sends a command with the configured call timeout.
    pub fn send(&self, cmd: &str, data: Value) -> Result<Value, MuxError> {
        self.mux.send(cmd, data, self.config.call_timeout)
    }

    /// Asks the peer to load the plugin at `path`.
    pub fn load_plugin(&self, path: &str, options: Value) -> Result<PluginManifest, HostError> {
        let manifest = self.send("loadPlugin", json!({ "path": path, "options": options }))?;
        if manifest.is_null() {
            return Ok(PluginManifest::default());
        }
        Ok(serde_json::from_value(manifest)?)
    }

    /// Cooperative then forced shutdown. Safe to call more than once.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Err(e) = self.mux.notify("shutdown", Value::Null) {
            debug!(error = %e, "Could not send shutdown");
        }
        self.mux.close_writer();

        if let Some(mut child) = lock(&self.child).take() {
            let deadline = Instant::now() + self.config.shutdown_grace;
            loop {
                match child.try_wait() {
                    Ok(Some(status)) => {
                        info!(%status, "Plugin host exited");
                        break;
                    }
                    Ok(None) if Instant::now() < deadline => thread::sleep(EXIT_POLL),
                    Ok(None) => {
                        warn!(grace = ?self.config.shutdown_grace, "Plugin host did not exit, killing it");
                        kill(&mut child);
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to poll plugin host");
                        kill(&mut child);
                        break;
                    }
                }
            }
        }

        self.mux.join_reader();
        if let Some(handle) = lock(&self.stderr).take()
            && handle.join().is_err()
        {
            warn!("Peer stderr thread panicked");
        }
    }
}

impl Drop for PluginHost {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn forward_stderr(stderr: impl io::Read) {
    for line in BufReader::new(stderr).lines() {
        match line {
            Ok(line) if !line.trim().is_empty() => info!(target: "less_bridge::peer", "{line}"),
            Ok(_) => {}
            Err(e) => {
                debug!(error = %e, "Peer stderr closed");
                break;
            }
        }
    }
}

fn kill(child: &mut Child) {
    if let Err(e) = child.kill() {
        warn!(error = %e, "Failed to kill plugin host");
    }
    let _ = child.wait();
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_manifest_defaults() {
        let manifest: PluginManifest = serde_json::from_value(json!({
            "functions": [{"name": "f", "cacheable": true}],
            "preProcessors": [{"name": "p", "priority": 2}],
        }))
        .unwrap();
        assert_eq!(manifest.functions.len(), 1);
        assert!(manifest.functions[0].cacheable);
        assert_eq!(manifest.pre_processors[0].priority, 2);
        assert!(manifest.visitors.is_empty());
        assert!(manifest.file_managers.is_empty());
    }

    #[test]
    fn test_spawn_failure() {
        let config = Config {
            peer_command: "/nonexistent/less-bridge-peer".to_string(),
            ..Config::default()
        };
        let err = PluginHost::spawn(&config).unwrap_err();
        assert!(matches!(err, HostError::Spawn { command, .. } if command == "/nonexistent/less-bridge-peer"));
    }

    #[cfg(unix)]
    #[test]
    fn test_peer_that_never_answers_is_not_ready() {
        let config = Config {
            peer_command: "sh".to_string(),
            peer_args: vec!["-c".to_string(), "cat > /dev/null".to_string()],
            startup_timeout: Duration::from_millis(200),
            shutdown_grace: Duration::from_millis(500),
            ..Config::default()
        };
        let err = PluginHost::spawn(&config).unwrap_err();
        assert!(matches!(err, HostError::NotReady(_)));
    }
}
