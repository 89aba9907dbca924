pub mod accelerator;
pub mod discover;
pub mod metadata;
pub mod reconcile;
pub mod scheduler;
pub mod store;
pub mod tracker;
pub mod watcher;
