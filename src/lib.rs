//! Micro-application bundle loader running on an embedded QuickJS host page.

pub mod config;
pub mod context;
pub mod frame;
pub mod hook;
pub mod host;
pub mod js;
pub mod loader;
pub mod net;

pub use config::LoaderConfig;
pub use context::{ContextError, ContextOptions, IsolatedContext};
pub use frame::{FrameId, NodeHandle};
pub use hook::{HookCall, HookHandler, HookOutcome};
pub use host::{EventTarget, HostPage};
pub use loader::{BundleRequest, LoadError, ModuleExports, ModuleLoader, Transport};
pub use net::{BundleFetcher, HttpFetcher, StaticFetcher};
