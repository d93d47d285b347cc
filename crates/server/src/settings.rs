//! Layered configuration: files, then environment

use config::{Config, ConfigBuilder, Environment, File};
use config::builder::DefaultState;

use liquidity_core::AppConfig;
use liquidity_exchanges::default_exchanges;

pub const ENV_PREFIX: &str = "LIQUIDITY";

fn builder(run_env: &str) -> ConfigBuilder<DefaultState> {
    Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(File::with_name(&format!("config/{}", run_env)).required(false))
        .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
}

/// Load `config/default`, `config/{run_env}` and `LIQUIDITY__*` overrides
pub fn load(run_env: &str) -> anyhow::Result<AppConfig> {
    finish(builder(run_env))
}

fn finish(builder: ConfigBuilder<DefaultState>) -> anyhow::Result<AppConfig> {
    let mut app: AppConfig = builder.build()?.try_deserialize()?;

    if app.exchanges.is_empty() {
        app.exchanges = default_exchanges();
    }
    app.validate()?;
    Ok(app)
}
