//! Bridge between a Less compiler and an out-of-process plugin host.
//!
//! The host runs as a child process. Commands and callbacks travel as line-delimited JSON
//! over its stdio ([`mux`]); bulk data travels through memory-mapped files ([`shm`]), either
//! as a FlatAST per call or through the persistent [`protocol`] region.
//!
//! ```rust,no_run
//! use less_bridge::{CallArg, Config, Runtime};
//! use less_flat::Node;
//!
//! let runtime = Runtime::start(Config::from_env()).unwrap();
//! let scope = runtime.root_scope();
//! runtime.load_plugin("plugins/math.js", serde_json::Value::Null, scope).unwrap();
//!
//! let add = scope.lookup_function("add").unwrap();
//! let result = add.call(&[CallArg::from(Node::dimension(1.0, "px")), CallArg::from(2.0)]).unwrap();
//! println!("{}", result.to_css());
//! ```
pub mod config;
pub mod dispatch;
mod error;
pub mod host;
pub mod log;
pub mod message;
pub mod mux;
pub mod peer;
pub mod protocol;
mod runtime;
pub mod scope;
pub mod shm;
#[cfg(test)]
mod testing;

pub use config::{CallMode, Config};
pub use dispatch::{CallArg, DispatchError, Dispatcher, EvalContext, FunctionSpec, PluginFunction, ResultNode};
pub use error::{Error, Result};
pub use host::{HostError, PluginHost, PluginManifest};
pub use runtime::Runtime;
pub use scope::{BoundFunction, Scope, ScopeKey};
