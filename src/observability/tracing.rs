use anyhow::{Error, Result};
use once_cell::sync::OnceCell;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

static TRACING_INIT: OnceCell<()> = OnceCell::new();

/// Tracing サブスクライバを一度だけ初期化する。
///
/// 既定は JSON 出力。`LOG_FORMAT=pretty` の場合は人間向けの整形出力に切り替える。
/// フィルタは `RUST_LOG`（未設定時は `info`）。
///
/// # Errors
/// サブスクライバの初期化に失敗した場合はエラーを返す。
pub fn init() -> Result<()> {
    TRACING_INIT.get_or_try_init(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let pretty = std::env::var("LOG_FORMAT").is_ok_and(|format| format == "pretty");

        let registry = tracing_subscriber::registry().with(env_filter);
        let result = if pretty {
            registry
                .with(tracing_subscriber::fmt::layer().with_target(false).pretty())
                .try_init()
        } else {
            registry
                .with(tracing_subscriber::fmt::layer().with_target(false).json())
                .try_init()
        };
        result.map_err(|e: tracing_subscriber::util::TryInitError| Error::msg(e.to_string()))?;

        info!(pretty, "tracing initialized");
        Ok::<(), Error>(())
    })?;
    Ok(())
}
