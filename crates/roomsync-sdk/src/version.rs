//! SDK 版本与运行时元信息
//!
//! - **SDK Version** → Cargo.toml（唯一权威源）
//! - **Build Metadata** → build.rs 中由 vergen 生成

/// SDK semver，来自 Cargo.toml
///
/// 禁止手写版本号，必须用 `env!("CARGO_PKG_VERSION")` 与 Cargo.toml 保持同步。
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// SDK 名称，用于默认 User-Agent
pub const SDK_NAME: &str = env!("CARGO_PKG_NAME");

/// git commit（由 vergen 在 build.rs 中生成，非 git 构建时为 "unknown"）
pub const GIT_SHA: &str = or_unknown(option_env!("VERGEN_GIT_SHA"));

/// build time（由 vergen 在 build.rs 中生成）
pub const BUILD_TIME: &str = or_unknown(option_env!("VERGEN_BUILD_TIMESTAMP"));

const fn or_unknown(value: Option<&'static str>) -> &'static str {
    match value {
        Some(v) => v,
        None => "unknown",
    }
}

/// 默认 User-Agent：`roomsync-sdk/0.1.0`
pub fn default_user_agent() -> String {
    format!("{}/{}", SDK_NAME, SDK_VERSION)
}
