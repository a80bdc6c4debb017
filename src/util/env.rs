//! Environment helpers: centralized dotenv loading and ergonomic getters.
//! Call `init_env()` once early in each binary (or rely on lazy Once).
use std::str::FromStr;
use std::sync::Once;
use tracing::info;

static INIT: Once = Once::new();

/// Load .env exactly once. Safe to call many times.
pub fn init_env() {
    INIT.call_once(|| {
        if dotenv::dotenv().is_ok() {
            return;
        }
        // Fallback to the crate root so `cargo run` from a subdirectory still finds it.
        let candidate = format!("{}/.env", env!("CARGO_MANIFEST_DIR"));
        let _ = dotenv::from_filename(candidate);
    });
}

/// Get optional env var (None if unset or empty).
pub fn env_opt(key: &str) -> Option<String> {
    init_env();
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => Some(v),
        _ => None,
    }
}

/// Get parsed value with default fallback.
pub fn env_parse<T>(key: &str, default: T) -> T
where
    T: FromStr + Clone,
{
    init_env();
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse::<T>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Optional parsed value.
pub fn env_parse_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    init_env();
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

/// Boolean flag; accepts 1/true/on/yes (case-insensitive) as true.
pub fn env_flag(key: &str, default: bool) -> bool {
    init_env();
    match std::env::var(key) {
        Ok(raw) => parse_flag(&raw),
        Err(_) => default,
    }
}

fn parse_flag(raw: &str) -> bool {
    let v = raw.trim().to_ascii_lowercase();
    matches!(v.as_str(), "1" | "true" | "on" | "yes")
}

/// Database URL: first explicit DSN found, else one composed from DB_* parts.
pub fn db_url() -> anyhow::Result<String> {
    init_env();
    for k in ["STEAM_DB_URL", "DATABASE_URL", "DB_URL"] {
        if let Some(v) = env_opt(k) {
            info!(target = "env", source = k, "using database DSN");
            return Ok(v);
        }
    }

    if let Some(dsn) = compose_dsn(
        env_opt("DB_HOST").as_deref(),
        env_opt("DB_USERNAME").as_deref(),
        env_opt("DB_PASSWORD").as_deref(),
        env_opt("DB_DATABASE").as_deref(),
        env_opt("DB_PORT").as_deref(),
        env_opt("DB_SSLMODE").as_deref(),
    ) {
        info!(target = "env", "using DSN composed from DB_* variables");
        return Ok(dsn);
    }

    Err(anyhow::anyhow!(
        "no database URL configured; set STEAM_DB_URL / DATABASE_URL or DB_HOST + DB_USERNAME"
    ))
}

fn compose_dsn(
    host: Option<&str>,
    user: Option<&str>,
    password: Option<&str>,
    database: Option<&str>,
    port: Option<&str>,
    ssl_mode: Option<&str>,
) -> Option<String> {
    let host = host?;
    let user = user?;
    let database = database.unwrap_or("steam");
    let port_u16: u16 = port.and_then(|p| p.parse().ok()).unwrap_or(5432);
    let ssl_mode = ssl_mode.unwrap_or("prefer");

    // Build via `url::Url` so reserved characters in credentials get percent-encoded.
    let mut out = url::Url::parse("postgresql://localhost").ok()?;
    out.set_username(user).ok()?;
    if let Some(pass) = password {
        out.set_password(Some(pass)).ok()?;
    }
    let host_trimmed = host.trim().trim_matches(|c| c == '[' || c == ']');
    if host_trimmed.contains(':') {
        out.set_host(Some(&format!("[{host_trimmed}]"))).ok()?;
    } else {
        out.set_host(Some(host_trimmed)).ok()?;
    }
    out.set_port(Some(port_u16)).ok()?;
    out.set_path(&format!("/{database}"));
    if ssl_mode != "disable" {
        out.query_pairs_mut().append_pair("sslmode", ssl_mode);
    }
    Some(out.to_string())
}

fn redact_value(key: &str, val: &str) -> String {
    let k = key.to_ascii_uppercase();
    if k.contains("PASSWORD") || k.contains("SECRET") || k.contains("TOKEN") {
        return "***".to_string();
    }
    let val_trim = val.trim();
    // Always redact postgres DSNs even if the key isn't obviously sensitive.
    if let Ok(mut u) = url::Url::parse(val_trim) {
        let scheme = u.scheme().to_ascii_lowercase();
        if scheme == "postgres" || scheme == "postgresql" {
            let _ = u.set_username("***");
            let _ = u.set_password(Some("***"));
            return u.to_string();
        }
    }
    val_trim.to_string()
}

/// Log a redacted snapshot of the given keys.
pub fn log_config_snapshot(title: &str, keys: &[&str]) {
    let snapshot: Vec<(String, String)> = keys
        .iter()
        .filter_map(|k| env_opt(k).map(|v| (k.to_string(), redact_value(k, &v))))
        .collect();
    info!(target = "preflight", title, snapshot = ?snapshot, "configuration snapshot");
}
