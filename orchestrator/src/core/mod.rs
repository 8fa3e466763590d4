//! Pure, deterministic logic. No filesystem, process or clock access
//! beyond values passed in by callers.

pub mod authorization;
pub mod delta;
pub mod gates;
pub mod policy;
pub mod scope;
pub mod types;
