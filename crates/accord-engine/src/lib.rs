//! Accord policy engine.
//!
//! An [`Engine`] is one replica: it owns a fact store, the live policies and
//! the registered datasources, and keeps every derived table up to date as
//! datasource tables change. Derived `execute[service:action]` facts are
//! dispatched to the adapter registered for `service` once per appearance.

pub mod actions;
mod config;
pub mod datasource;
pub mod driver;
mod engine;
mod error;
pub mod library;
pub mod policy;
pub mod poller;
mod staged;
pub mod translator;

pub use actions::{ActionExecutor, Dispatch, ExecutionFact};
pub use config::EngineConfig;
pub use datasource::{
    ActionCall, DatasourceAdapter, DatasourceConfig, DatasourceInfo, DatasourceStatus, Record,
    TableUpdate, UpdateMode,
};
pub use driver::{DocumentSource, Mapping, TranslatorDriver, TranslatorDriverConfig};
pub use engine::Engine;
pub use error::{AdapterError, EngineError};
pub use library::{LibraryPolicy, PolicyLibrary};
pub use policy::{PolicyInfo, PolicyKind, PolicySpec, PolicyStatus, RuleInfo, RuleSpec};
pub use poller::Poller;
pub use translator::{TranslateError, Translator};
