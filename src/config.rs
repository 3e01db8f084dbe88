use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

/// Deployment profile. Non-production deployments get looser traffic caps so
/// local clients and test harnesses are not throttled while iterating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    Production,
    Development,
}

/// Caps for one rate-limit window.
#[derive(Debug, Clone, Copy)]
pub struct WindowLimit {
    /// Events of one name allowed per window on one connection.
    pub max_events: u32,
    /// Window length; counters lazily reset on first use after expiry.
    pub window: Duration,
}

/// Gateway configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// HMAC secret the core API signs session tokens with.
    pub session_secret: String,
    /// Base URL of the core API (match lookups go through its internal endpoints).
    pub match_api_url: String,
    /// Port the gateway binds to.
    pub port: u16,
    pub profile: Profile,
    /// Name of the cookie carrying the session token.
    pub session_cookie: String,
    /// Connection attempts allowed per identity per admission window.
    pub admission_cap: u32,
    pub admission_window: Duration,
    /// Default per-event-name cap; per-class overrides below take precedence.
    pub event_limit: WindowLimit,
    pub event_overrides: HashMap<String, WindowLimit>,
    /// Cumulative payload budget per (connection, event name) window, in megabytes.
    pub max_mb_per_window: u64,
    /// How often the limiter sweep runs.
    pub sweep_interval: Duration,
    /// How long a rate window may sit idle before the sweep evicts it.
    pub idle_eviction: Duration,
    /// Deadline for the client to complete IDENTIFY after the upgrade.
    pub handshake_timeout: Duration,
    /// Heartbeat interval advertised to clients in READY.
    pub heartbeat_interval: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Panics with a descriptive message if a required variable is missing.
    pub fn from_env() -> Self {
        let profile = match std::env::var("GATEWAY_PROFILE").as_deref() {
            Ok("development") => Profile::Development,
            _ => Profile::Production,
        };

        let mut config = Self::for_profile(
            profile,
            required_var("SESSION_SECRET"),
            required_var("MATCH_API_URL"),
        );

        config.port = var_parsed("PORT", config.port);
        config.session_cookie = std::env::var("SESSION_COOKIE").unwrap_or(config.session_cookie);
        config.admission_cap = var_parsed("ADMISSION_CAP", config.admission_cap);
        config.admission_window =
            Duration::from_secs(var_parsed("ADMISSION_WINDOW_SECS", config.admission_window.as_secs()));
        config.event_limit.max_events = var_parsed("EVENT_CAP", config.event_limit.max_events);
        config.event_limit.window =
            Duration::from_secs(var_parsed("EVENT_WINDOW_SECS", config.event_limit.window.as_secs()));
        config.max_mb_per_window = var_parsed("MAX_MB_PER_WINDOW", config.max_mb_per_window);
        config.sweep_interval =
            Duration::from_secs(var_parsed("SWEEP_INTERVAL_SECS", config.sweep_interval.as_secs()));
        config.idle_eviction =
            Duration::from_secs(var_parsed("IDLE_EVICTION_SECS", config.idle_eviction.as_secs()));
        config.handshake_timeout =
            Duration::from_secs(var_parsed("HANDSHAKE_TIMEOUT_SECS", config.handshake_timeout.as_secs()));
        config.heartbeat_interval = Duration::from_millis(var_parsed(
            "HEARTBEAT_INTERVAL_MS",
            config.heartbeat_interval.as_millis() as u64,
        ));

        config
    }

    /// Baseline configuration for a profile, before env overrides.
    pub fn for_profile(profile: Profile, session_secret: String, match_api_url: String) -> Self {
        let (admission_cap, event_limit, max_mb_per_window) = match profile {
            Profile::Production => (
                3,
                WindowLimit {
                    max_events: 50,
                    window: Duration::from_secs(300),
                },
                5,
            ),
            Profile::Development => (
                100,
                WindowLimit {
                    max_events: 1000,
                    window: Duration::from_secs(300),
                },
                50,
            ),
        };

        // Typing indicators are cheap but chatty; they get a shorter window
        // with a higher count than the default class.
        let mut event_overrides = HashMap::new();
        event_overrides.insert(
            "typing".to_string(),
            WindowLimit {
                max_events: 120,
                window: Duration::from_secs(60),
            },
        );

        Self {
            session_secret,
            match_api_url,
            port: 4010,
            profile,
            session_cookie: "amica_session".to_string(),
            admission_cap,
            admission_window: Duration::from_secs(60),
            event_limit,
            event_overrides,
            max_mb_per_window,
            sweep_interval: Duration::from_secs(600),
            idle_eviction: Duration::from_secs(1800),
            handshake_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_millis(41_250),
        }
    }
}

fn required_var(name: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| panic!("{name} env var is required"))
}

fn var_parsed<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
