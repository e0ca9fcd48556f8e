pub mod config;
pub mod escalation;
pub mod model;
pub mod notifier;
pub mod notion;
pub mod sweep;
