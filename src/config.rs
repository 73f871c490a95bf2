//! CLI arguments and server configuration defaults.

use clap::{Parser, ValueEnum};
use shadow_rs::formatcp;

use crate::build;

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

const MIB: u64 = 1024 * 1024;

pub const DEFAULT_ACCESS_PASSWORD: &str = "qrdrop";
pub const AUTH_COOKIE_NAME: &str = "QRDROP_SESSION";
pub const DEFAULT_AUTH_SESSION_TTL_SECS: u64 = 24 * 60 * 60;
pub const DEFAULT_LOGIN_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_LOGIN_WINDOW_SECS: u64 = 5 * 60;
pub const DEFAULT_LOGIN_LOCKOUT_SECS: u64 = 10 * 60;
pub const DEFAULT_ARTIFACT_CAPACITY: usize = 20;
pub const DEFAULT_UPLOAD_MAX_SIZE: u64 = 50 * MIB;
pub const DEFAULT_CHUNK_MAX_SIZE: u64 = 8 * MIB;
pub const DEFAULT_CHUNKED_MAX_SIZE: u64 = 200 * MIB;
pub const DEFAULT_UPLOAD_MAX_CHUNKS: u64 = 1024;
pub const DEFAULT_UPLOAD_MAX_SESSIONS: u64 = 32;
pub const DEFAULT_UPLOAD_SESSION_TTL_SECS: u64 = 60 * 60;
pub const DEFAULT_DRIVE_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_DRIVE_API_BASE: &str = "https://www.googleapis.com/drive/v3";
pub const DEFAULT_DRIVE_UPLOAD_BASE: &str = "https://www.googleapis.com/upload/drive/v3";
pub const DEFAULT_DRIVE_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
pub const AUTH_PRUNE_INTERVAL_SECS: u64 = 300;
pub const UPLOAD_SWEEP_INTERVAL_SECS: u64 = 60;
/// Multipart framing overhead allowed on top of the payload ceilings.
pub const MULTIPART_OVERHEAD: u64 = 64 * 1024;

/// Where finished uploads are kept.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum SinkKind {
    /// In-process bounded artifact store served by `/api/file/{id}`.
    Local,
    /// Google Drive; the public Drive link is returned instead.
    Drive,
}

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(name = "qrdrop", version = VERSION_INFO, about = "QrDrop PDF share server")]
pub struct Args {
    #[arg(
        short = 'b',
        long,
        env = "QRDROP_BIND",
        default_value = "0.0.0.0",
        help = "Bind address for HTTP/HTTPS"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "QRDROP_HTTP_PORT",
        default_value_t = 5005,
        help = "HTTP port"
    )]
    pub http_port: u16,
    #[arg(
        short = 'P',
        long,
        env = "QRDROP_HTTPS_PORT",
        default_value_t = 5006,
        help = "HTTPS port"
    )]
    pub https_port: u16,
    #[arg(long, env = "QRDROP_DISABLE_HTTPS", help = "Serve plain HTTP only")]
    pub disable_https: bool,
    #[arg(short = 'c', long, env = "QRDROP_TLS_CERT", help = "TLS cert path")]
    pub tls_cert: Option<String>,
    #[arg(short = 'k', long, env = "QRDROP_TLS_KEY", help = "TLS key path")]
    pub tls_key: Option<String>,
    #[arg(long, env = "QRDROP_CORS_ORIGINS", help = "Comma separated CORS origins")]
    pub cors_origins: Option<String>,
    #[arg(
        long,
        env = "QRDROP_PUBLIC_URL",
        help = "Public origin used in generated links, e.g. https://share.example.com"
    )]
    pub public_url: Option<String>,
    #[arg(
        long,
        env = "QRDROP_ACCESS_PASSWORD",
        default_value = DEFAULT_ACCESS_PASSWORD,
        help = "Shared password for the upload UI/API"
    )]
    pub access_password: String,
    #[arg(
        long,
        env = "QRDROP_AUTH_SESSION_TTL_SECS",
        default_value_t = DEFAULT_AUTH_SESSION_TTL_SECS,
        help = "Login session expiration in seconds"
    )]
    pub auth_session_ttl_secs: u64,
    #[arg(
        long,
        env = "QRDROP_LOGIN_MAX_ATTEMPTS",
        default_value_t = DEFAULT_LOGIN_MAX_ATTEMPTS,
        help = "Max login attempts before lockout"
    )]
    pub login_max_attempts: u32,
    #[arg(
        long,
        env = "QRDROP_LOGIN_WINDOW_SECS",
        default_value_t = DEFAULT_LOGIN_WINDOW_SECS,
        help = "Login attempt window in seconds"
    )]
    pub login_window_secs: u64,
    #[arg(
        long,
        env = "QRDROP_LOGIN_LOCKOUT_SECS",
        default_value_t = DEFAULT_LOGIN_LOCKOUT_SECS,
        help = "Login lockout time after max attempts"
    )]
    pub login_lockout_secs: u64,
    #[arg(
        long,
        env = "QRDROP_ARTIFACT_CAPACITY",
        default_value_t = DEFAULT_ARTIFACT_CAPACITY,
        help = "Max finished files kept in memory (oldest evicted first)"
    )]
    pub artifact_capacity: usize,
    #[arg(
        long,
        env = "QRDROP_UPLOAD_MAX_SIZE",
        default_value_t = DEFAULT_UPLOAD_MAX_SIZE,
        help = "Max single-shot upload size in bytes (0 to disable)"
    )]
    pub upload_max_size: u64,
    #[arg(
        long,
        env = "QRDROP_CHUNK_MAX_SIZE",
        default_value_t = DEFAULT_CHUNK_MAX_SIZE,
        help = "Max size of one upload chunk in bytes (0 to disable)"
    )]
    pub chunk_max_size: u64,
    #[arg(
        long,
        env = "QRDROP_CHUNKED_MAX_SIZE",
        default_value_t = DEFAULT_CHUNKED_MAX_SIZE,
        help = "Max total size of a chunked upload in bytes (0 to disable)"
    )]
    pub chunked_max_size: u64,
    #[arg(
        long,
        env = "QRDROP_UPLOAD_MAX_CHUNKS",
        default_value_t = DEFAULT_UPLOAD_MAX_CHUNKS,
        help = "Max chunks per upload (0 to disable)"
    )]
    pub upload_max_chunks: u64,
    #[arg(
        long,
        env = "QRDROP_UPLOAD_MAX_SESSIONS",
        default_value_t = DEFAULT_UPLOAD_MAX_SESSIONS,
        help = "Max chunked uploads in flight (0 to disable)"
    )]
    pub upload_max_sessions: u64,
    #[arg(
        long,
        env = "QRDROP_UPLOAD_SESSION_TTL_SECS",
        default_value_t = DEFAULT_UPLOAD_SESSION_TTL_SECS,
        help = "Idle chunked uploads are dropped after this many seconds (0 to disable)"
    )]
    pub upload_session_ttl_secs: u64,
    #[arg(
        long,
        value_enum,
        env = "QRDROP_SINK",
        default_value_t = SinkKind::Local,
        help = "Where finished uploads are stored"
    )]
    pub sink: SinkKind,
    #[arg(long, env = "QRDROP_DRIVE_FOLDER_ID", help = "Drive folder receiving uploads")]
    pub drive_folder_id: Option<String>,
    #[arg(
        long,
        env = "QRDROP_DRIVE_ACCESS_TOKEN",
        help = "Static OAuth access token for Drive (skips service account auth)"
    )]
    pub drive_access_token: Option<String>,
    #[arg(long, env = "GOOGLE_CLIENT_EMAIL", help = "Service account client email")]
    pub drive_client_email: Option<String>,
    #[arg(
        long,
        env = "GOOGLE_PRIVATE_KEY",
        help = "Service account PKCS#8 private key (PEM, literal \\n accepted)"
    )]
    pub drive_private_key: Option<String>,
    #[arg(
        long,
        env = "QRDROP_DRIVE_TIMEOUT_SECS",
        default_value_t = DEFAULT_DRIVE_TIMEOUT_SECS,
        help = "Timeout for each Drive API request"
    )]
    pub drive_timeout_secs: u64,
    #[arg(long, env = "QRDROP_DRIVE_API_BASE", default_value = DEFAULT_DRIVE_API_BASE)]
    pub drive_api_base: String,
    #[arg(long, env = "QRDROP_DRIVE_UPLOAD_BASE", default_value = DEFAULT_DRIVE_UPLOAD_BASE)]
    pub drive_upload_base: String,
    #[arg(long, env = "QRDROP_DRIVE_TOKEN_URI", default_value = DEFAULT_DRIVE_TOKEN_URI)]
    pub drive_token_uri: String,
}

/// 将 0 视为“不限制”。
pub fn limit(value: u64) -> Option<u64> {
    (value > 0).then_some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse_without_flags() {
        let args = Args::try_parse_from(["qrdrop"]).expect("parse defaults");
        assert_eq!(args.sink, SinkKind::Local);
        assert_eq!(args.artifact_capacity, DEFAULT_ARTIFACT_CAPACITY);
        assert_eq!(args.upload_max_size, DEFAULT_UPLOAD_MAX_SIZE);
        assert!(!args.disable_https);
    }

    #[test]
    fn sink_flag_selects_drive() {
        let args = Args::try_parse_from(["qrdrop", "--sink", "drive", "--drive-folder-id", "abc"])
            .expect("parse drive args");
        assert_eq!(args.sink, SinkKind::Drive);
        assert_eq!(args.drive_folder_id.as_deref(), Some("abc"));
    }

    #[test]
    fn zero_disables_limit() {
        assert_eq!(limit(0), None);
        assert_eq!(limit(10), Some(10));
    }
}
