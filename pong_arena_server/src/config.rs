use clap::Parser;

/// Server configuration. Every knob can come from the command line or the
/// environment; bad values abort startup with a parse error.
#[derive(Parser, Debug, Clone)]
#[command(name = "pong_arena_server")]
#[command(about = "Competitive Pong platform backend")]
pub struct Config {
    /// Bind host
    #[arg(long, env = "PONG_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Bind port
    #[arg(short, long, env = "PONG_PORT", default_value = "3000")]
    pub port: u16,

    /// Honor X-Forwarded-* headers from a fronting proxy
    #[arg(long, env = "PONG_TRUST_PROXY")]
    pub trust_proxy: bool,

    /// HMAC secret for access tokens
    #[arg(
        long,
        env = "PONG_ACCESS_SECRET",
        default_value = "pong-arena-dev-access-secret",
        hide_env_values = true
    )]
    pub access_secret: String,

    /// HMAC secret for refresh tokens (consumed by the auth service; kept
    /// here so one env file configures the whole deployment)
    #[arg(
        long,
        env = "PONG_REFRESH_SECRET",
        default_value = "pong-arena-dev-refresh-secret",
        hide_env_values = true
    )]
    pub refresh_secret: String,

    /// Access token lifetime in seconds
    #[arg(long, env = "PONG_ACCESS_TTL_SECS", default_value = "900")]
    pub access_ttl_secs: u64,

    /// Refresh token lifetime in seconds
    #[arg(long, env = "PONG_REFRESH_TTL_SECS", default_value = "604800")]
    pub refresh_ttl_secs: u64,

    /// Comma-separated CORS origins, or "*"
    #[arg(long, env = "PONG_CORS_ORIGINS", default_value = "*")]
    pub cors_origins: String,

    /// Database URL (the in-memory store ignores everything but the scheme)
    #[arg(long, env = "DATABASE_URL", default_value = "memory://")]
    pub database_url: String,

    /// Points needed to win a match
    #[arg(long, env = "PONG_WINNING_SCORE", default_value = "11")]
    pub winning_score: u32,

    /// Maximum accepted `input` messages per participant per second
    #[arg(long, env = "PONG_MAX_INPUT_RATE", default_value = "60")]
    pub max_input_rate: u32,

    /// Seconds a disconnected participant may reconnect before forfeiting.
    /// 0 means transport loss forfeits immediately.
    #[arg(long, env = "PONG_RECONNECT_GRACE_SECS", default_value = "0")]
    pub reconnect_grace_secs: u64,

    /// Maximum unresolved invites per sender before RATE_LIMIT
    #[arg(long, env = "PONG_MAX_PENDING_INVITES", default_value = "8")]
    pub max_pending_invites: usize,

    /// Domain for TLS certificate (enables HTTPS)
    #[arg(long, env = "PONG_TLS_DOMAIN")]
    pub domain: Option<String>,

    /// Email for ACME/Let's Encrypt registration
    #[arg(long, env = "PONG_ACME_EMAIL")]
    pub acme_email: Option<String>,

    /// Directory to cache ACME certificates
    #[arg(long, env = "PONG_ACME_CACHE", default_value = "./acme-cache")]
    pub acme_cache: String,

    /// Use Let's Encrypt staging environment (for testing)
    #[arg(long, env = "PONG_ACME_STAGING")]
    pub acme_staging: bool,
}

impl Config {
    /// Defaults only, no CLI or environment. Used by tests.
    pub fn for_tests() -> Self {
        let mut cfg = Config::parse_from(["pong_arena_server"]);
        // Keep test matches short.
        cfg.winning_score = 3;
        cfg
    }
}
