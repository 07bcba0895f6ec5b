use async_mutex::Mutex;
use cached::stores::TimedCache;
use slog::o;
use slog::Drain;
use sqlx::postgres::PgPoolOptions;
use std::io::Read;
use std::sync::Arc;
use std::{env, fs};

pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Result<T> = std::result::Result<T, Error>;

/// Formatted string error, usable both as `crate::Error`
/// and as a tide handler error.
#[derive(Debug)]
pub struct StringError(pub String);
impl std::fmt::Display for StringError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        self.0.fmt(f)
    }
}
impl std::error::Error for StringError {}

macro_rules! se {
    ($($arg:tt)*) => {
        crate::StringError(format!($($arg)*))
    };
}
pub(crate) use se;

macro_rules! resp {
    (json => $body:expr) => {
        tide::Response::builder(200)
            .body(tide::Body::from_json(&$body)?)
            .build()
    };
    (status => $status:expr, error => $msg:expr) => {
        tide::Response::builder($status)
            .body(serde_json::json!({ "error": $msg }))
            .build()
    };
}
pub(crate) use resp;

mod crypto;
mod logging;
mod mailer;
mod models;
mod oauth;
mod service;
mod spotify;
mod sync;
mod utils;
mod youtube;

use models::Platform;

fn env_or(k: &str, default: &str) -> String {
    env::var(k).unwrap_or_else(|_| default.to_string())
}

lazy_static::lazy_static! {
    pub static ref CONFIG: Config = Config::load();

    // The "base" logger that everything branches off of
    pub static ref BASE_LOG: slog::Logger = {
        let level: slog::Level = CONFIG.log_level
                .parse()
                .expect("invalid log_level");
        if CONFIG.log_format == "pretty" {
            let decorator = slog_term::TermDecorator::new().build();
            let drain = slog_term::CompactFormat::new(decorator).build().fuse();
            let drain = slog_async::Async::new(drain).build().fuse();
            let drain = slog::LevelFilter::new(drain, level).fuse();
            slog::Logger::root(drain, o!())
        } else {
            let drain = slog_json::Json::default(std::io::stderr()).fuse();
            let drain = slog_async::Async::new(drain).build().fuse();
            let drain = slog::LevelFilter::new(drain, level).fuse();
            slog::Logger::root(drain, o!())
        }
    };

    // Base logger
    pub static ref LOG: slog::Logger = BASE_LOG.new(slog::o!("app" => "backline"));

    // one-time oauth state nonces, valid for the authorize redirect round-trip
    pub static ref STATE_KEYS: Arc<Mutex<TimedCache<String, ()>>> =
        Arc::new(Mutex::new(TimedCache::with_lifespan(600)));
}

#[derive(Debug, Clone)]
pub struct ClientCreds {
    pub id: String,
    pub secret: String,
}

pub struct Config {
    pub version: String,
    pub ssl: bool,
    pub host: String,
    pub real_hostname: Option<String>,
    pub port: u16,
    pub log_format: String,
    pub log_level: String,
    pub db_url: String,
    pub enc_key: String,

    pub spotify_client_id: Option<String>,
    pub spotify_client_secret: Option<String>,
    pub youtube_client_id: Option<String>,
    pub youtube_client_secret: Option<String>,
    pub apple_music_client_id: Option<String>,
    pub apple_music_client_secret: Option<String>,
    pub audiomack_client_id: Option<String>,
    pub audiomack_client_secret: Option<String>,
    pub boomplay_client_id: Option<String>,
    pub boomplay_client_secret: Option<String>,
    pub soundcloud_client_id: Option<String>,
    pub soundcloud_client_secret: Option<String>,

    pub email_api_url: String,
    pub email_api_key: Option<String>,
    pub email_from: String,
    pub notify_fallback_email: String,
}
impl Config {
    pub fn load() -> Self {
        let version = fs::File::open("commit_hash.txt")
            .map(|mut f| {
                let mut s = String::new();
                f.read_to_string(&mut s).expect("error reading commit_hash");
                s
            })
            .unwrap_or_else(|_| "unknown".to_string());
        Self {
            version,
            ssl: env_or("SSL", "false") == "true",
            host: env_or("HOST", "localhost"),
            real_hostname: env::var("REAL_HOSTNAME").ok(),
            port: env_or("PORT", "3030").parse().expect("invalid port"),
            log_format: env_or("LOG_FORMAT", "json")
                .to_lowercase()
                .trim()
                .to_string(),
            log_level: env_or("LOG_LEVEL", "INFO"),
            db_url: env_or("DATABASE_URL", "error"),
            enc_key: env_or("ENC_KEY", "01234567890123456789012345678901"),

            spotify_client_id: env::var("SPOTIFY_CLIENT_ID").ok(),
            spotify_client_secret: env::var("SPOTIFY_CLIENT_SECRET").ok(),
            youtube_client_id: env::var("YOUTUBE_CLIENT_ID").ok(),
            youtube_client_secret: env::var("YOUTUBE_CLIENT_SECRET").ok(),
            apple_music_client_id: env::var("APPLE_MUSIC_CLIENT_ID").ok(),
            apple_music_client_secret: env::var("APPLE_MUSIC_CLIENT_SECRET").ok(),
            audiomack_client_id: env::var("AUDIOMACK_CLIENT_ID").ok(),
            audiomack_client_secret: env::var("AUDIOMACK_CLIENT_SECRET").ok(),
            boomplay_client_id: env::var("BOOMPLAY_CLIENT_ID").ok(),
            boomplay_client_secret: env::var("BOOMPLAY_CLIENT_SECRET").ok(),
            soundcloud_client_id: env::var("SOUNDCLOUD_CLIENT_ID").ok(),
            soundcloud_client_secret: env::var("SOUNDCLOUD_CLIENT_SECRET").ok(),

            email_api_url: env_or("EMAIL_API_URL", "https://api.resend.com/emails"),
            email_api_key: env::var("EMAIL_API_KEY").ok(),
            email_from: env_or("EMAIL_FROM", "Backline <notifications@backline.dev>"),
            notify_fallback_email: env_or("NOTIFY_FALLBACK_EMAIL", "label-ops@backline.dev"),
        }
    }
    pub fn initialize(&self) -> anyhow::Result<()> {
        slog::info!(
            LOG, "initialized config";
            "version" => &CONFIG.version,
            "ssl" => &CONFIG.ssl,
            "host" => &CONFIG.host,
            "port" => &CONFIG.port,
            "log_format" => &CONFIG.log_format,
            "log_level" => &CONFIG.log_level,
        );
        Ok(())
    }
    pub fn host(&self) -> String {
        let p = if self.ssl { "https" } else { "http" };
        format!("{}://{}:{}", p, self.host, self.port)
    }
    pub fn public_host(&self) -> String {
        self.real_hostname.clone().unwrap_or_else(|| self.host())
    }
    /// Redirect URI registered with the platform. Must match byte-for-byte
    /// between the authorize redirect and the token exchange.
    pub fn callback_url(&self, platform: Platform) -> String {
        format!("{}/callback/{}", self.public_host(), platform.as_str())
    }
    pub fn client_creds(&self, platform: Platform) -> crate::Result<ClientCreds> {
        let (id, secret, id_var, secret_var) = match platform {
            Platform::Spotify => (
                &self.spotify_client_id,
                &self.spotify_client_secret,
                "SPOTIFY_CLIENT_ID",
                "SPOTIFY_CLIENT_SECRET",
            ),
            Platform::Youtube => (
                &self.youtube_client_id,
                &self.youtube_client_secret,
                "YOUTUBE_CLIENT_ID",
                "YOUTUBE_CLIENT_SECRET",
            ),
            Platform::AppleMusic => (
                &self.apple_music_client_id,
                &self.apple_music_client_secret,
                "APPLE_MUSIC_CLIENT_ID",
                "APPLE_MUSIC_CLIENT_SECRET",
            ),
            Platform::Audiomack => (
                &self.audiomack_client_id,
                &self.audiomack_client_secret,
                "AUDIOMACK_CLIENT_ID",
                "AUDIOMACK_CLIENT_SECRET",
            ),
            Platform::Boomplay => (
                &self.boomplay_client_id,
                &self.boomplay_client_secret,
                "BOOMPLAY_CLIENT_ID",
                "BOOMPLAY_CLIENT_SECRET",
            ),
            Platform::Soundcloud => (
                &self.soundcloud_client_id,
                &self.soundcloud_client_secret,
                "SOUNDCLOUD_CLIENT_ID",
                "SOUNDCLOUD_CLIENT_SECRET",
            ),
        };
        let id = id.clone().ok_or_else(|| se!("missing configuration {}", id_var))?;
        let secret = secret
            .clone()
            .ok_or_else(|| se!("missing configuration {}", secret_var))?;
        Ok(ClientCreds { id, secret })
    }
}

#[async_std::main]
async fn main() -> tide::Result<()> {
    // try sourcing a .env if one exists
    dotenv::dotenv().ok();
    CONFIG.initialize()?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&CONFIG.db_url)
        .await?;
    sqlx::migrate!().run(&pool).await?;

    service::start(pool)
        .await
        .map_err(|e| tide::Error::from_str(tide::StatusCode::InternalServerError, e.to_string()))?;
    Ok(())
}
