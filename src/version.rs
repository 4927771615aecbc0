//! Build identity reported by the CLI, `/debug/health` and outgoing requests.

/// Release version: `CPRA_VERSION` at build time, else the crate version.
pub const VERSION: &str = match option_env!("CPRA_VERSION") {
    Some(version) => version,
    None => env!("CARGO_PKG_VERSION"),
};

/// `User-Agent` sent by HTTP probes, webhook actions and notifiers.
pub fn user_agent() -> String {
    format!("cpra/{VERSION}")
}
