use clap::Parser;

/// Multi-protocol LLM proxy gateway.
#[derive(Debug, Parser)]
#[command(name = "maxx", version, about)]
pub struct Cli {
    /// Listen host.
    #[arg(long, env = "MAXX_HOST")]
    pub host: Option<String>,

    /// Listen port.
    #[arg(long, env = "MAXX_PORT")]
    pub port: Option<u16>,

    /// Database DSN, e.g. `sqlite://maxx.db?mode=rwc` or `memory`.
    #[arg(long, env = "MAXX_DSN", default_value = "sqlite://maxx.db?mode=rwc")]
    pub dsn: String,

    /// Outbound proxy for upstream egress.
    #[arg(long, env = "MAXX_PROXY")]
    pub proxy: Option<String>,
}
