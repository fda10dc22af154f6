pub mod authority;
pub mod lkg;
mod mirror;
pub mod normalize;

pub use lkg::{LkgError, LkgStore};
pub use mirror::{ColdStart, ConfigMirror, MirrorConfig, MirrorError, RefreshOutcome};
