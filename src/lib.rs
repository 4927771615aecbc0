pub mod config;
pub mod controller;
pub mod diagnostics;
pub mod duration;
pub mod enums;
pub mod interventions;
pub mod jobs;
pub mod loader;
pub mod logging;
pub mod manifest;
pub mod monitor;
pub mod notifications;
pub mod pool;
pub mod probes;
pub mod ring;
pub mod router;
pub mod runtime;
pub mod sizing;
pub mod systems;
pub mod version;
pub mod window;
