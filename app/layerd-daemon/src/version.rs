/// Binary name reported by `--version`.
pub const NAME: &str = "layerd";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Source revision captured by `build.rs`.
pub const REVISION: &str = env!("LAYERD_REVISION");

/// The single `name version revision` line printed by `--version`.
pub fn line() -> String {
    format!("{NAME} {VERSION} {REVISION}")
}
