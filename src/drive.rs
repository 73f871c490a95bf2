//! Google Drive 远端存储：上传文件并开放“任何人可读”权限。

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use bytes::Bytes;
use reqwest::StatusCode;
use ring::rand::SystemRandom;
use ring::signature::{RSA_PKCS1_SHA256, RsaKeyPair};
use serde::{Deserialize, Serialize};
use std::io;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{Args, SinkKind};
use crate::error::{BackendFailure, UploadError};
use crate::sink::{ArtifactSink, SinkLocation};

const DRIVE_SCOPE: &str = "https://www.googleapis.com/auth/drive.file";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const TOKEN_LIFETIME_SECS: i64 = 3600;
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);
const QUOTA_REASONS: [&str; 4] = [
    "rateLimitExceeded",
    "userRateLimitExceeded",
    "quotaExceeded",
    "storageQuotaExceeded",
];

pub enum DriveCredentials {
    AccessToken(String),
    ServiceAccount {
        client_email: String,
        private_key_pem: String,
    },
}

pub struct DriveConfig {
    pub folder_id: Option<String>,
    pub credentials: DriveCredentials,
    pub timeout: Duration,
    pub api_base: String,
    pub upload_base: String,
    pub token_uri: String,
}

impl DriveConfig {
    /// 从命令行参数构建 Drive 配置；缺少凭据时报错。
    pub fn from_args(args: &Args) -> io::Result<Self> {
        let credentials = match (
            &args.drive_access_token,
            &args.drive_client_email,
            &args.drive_private_key,
        ) {
            (Some(token), _, _) => DriveCredentials::AccessToken(token.clone()),
            (None, Some(client_email), Some(private_key_pem)) => DriveCredentials::ServiceAccount {
                client_email: client_email.clone(),
                private_key_pem: private_key_pem.clone(),
            },
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "drive sink requires an access token or service account credentials",
                ));
            }
        };
        Ok(Self {
            folder_id: args.drive_folder_id.clone(),
            credentials,
            timeout: Duration::from_secs(args.drive_timeout_secs),
            api_base: args.drive_api_base.trim_end_matches('/').to_string(),
            upload_base: args.drive_upload_base.trim_end_matches('/').to_string(),
            token_uri: args.drive_token_uri.clone(),
        })
    }
}

enum TokenSource {
    Static(String),
    ServiceAccount {
        client_email: String,
        key_pair: RsaKeyPair,
    },
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

pub struct DriveSink {
    client: reqwest::Client,
    source: TokenSource,
    cached: Mutex<Option<CachedToken>>,
    folder_id: Option<String>,
    api_base: String,
    upload_base: String,
    token_uri: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FileMetadata<'a> {
    name: &'a str,
    mime_type: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    parents: Vec<&'a str>,
}

#[derive(Serialize)]
struct JwtClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<u64>,
}

#[derive(Deserialize)]
struct CreatedFile {
    id: String,
}

impl DriveSink {
    pub fn new(config: DriveConfig) -> io::Result<Self> {
        let source = match config.credentials {
            DriveCredentials::AccessToken(token) => TokenSource::Static(token),
            DriveCredentials::ServiceAccount {
                client_email,
                private_key_pem,
            } => {
                let der = decode_pem(&private_key_pem)?;
                let key_pair = RsaKeyPair::from_pkcs8(&der).map_err(|err| {
                    io::Error::new(io::ErrorKind::InvalidInput, format!("invalid private key: {err}"))
                })?;
                TokenSource::ServiceAccount {
                    client_email,
                    key_pair,
                }
            }
        };
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(io::Error::other)?;
        Ok(Self {
            client,
            source,
            cached: Mutex::new(None),
            folder_id: config.folder_id,
            api_base: config.api_base,
            upload_base: config.upload_base,
            token_uri: config.token_uri,
        })
    }

    async fn access_token(&self) -> Result<String, BackendFailure> {
        let (client_email, key_pair) = match &self.source {
            TokenSource::Static(token) => return Ok(token.clone()),
            TokenSource::ServiceAccount {
                client_email,
                key_pair,
            } => (client_email, key_pair),
        };

        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref()
            && token.expires_at > Instant::now() + TOKEN_REFRESH_MARGIN
        {
            return Ok(token.value.clone());
        }

        let assertion = sign_jwt(client_email, &self.token_uri, key_pair)?;
        let response = self
            .client
            .post(&self.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await
            .map_err(transport_failure)?;
        let response = check_status(response).await?;
        let token: TokenResponse = response.json().await.map_err(transport_failure)?;
        let lifetime = Duration::from_secs(token.expires_in.unwrap_or(TOKEN_LIFETIME_SECS as u64));
        debug!(expires_in = lifetime.as_secs(), "drive access token refreshed");
        *cached = Some(CachedToken {
            value: token.access_token.clone(),
            expires_at: Instant::now() + lifetime,
        });
        Ok(token.access_token)
    }

    async fn upload(
        &self,
        token: &str,
        file_name: &str,
        mime_type: &str,
        content: Bytes,
    ) -> Result<String, BackendFailure> {
        let metadata = FileMetadata {
            name: file_name,
            mime_type,
            parents: self.folder_id.as_deref().into_iter().collect(),
        };
        let boundary = format!("qrdrop-{}", Uuid::new_v4().simple());
        let body = multipart_related_body(&boundary, &metadata, mime_type, &content)?;
        let response = self
            .client
            .post(format!("{}/files", self.upload_base))
            .query(&[("uploadType", "multipart"), ("fields", "id")])
            .bearer_auth(token)
            .header(
                reqwest::header::CONTENT_TYPE,
                format!("multipart/related; boundary={boundary}"),
            )
            .body(body)
            .send()
            .await
            .map_err(transport_failure)?;
        let response = check_status(response).await?;
        let created: CreatedFile = response.json().await.map_err(transport_failure)?;
        Ok(created.id)
    }

    async fn share_publicly(&self, token: &str, file_id: &str) -> Result<(), BackendFailure> {
        let response = self
            .client
            .post(format!("{}/files/{file_id}/permissions", self.api_base))
            .bearer_auth(token)
            .json(&serde_json::json!({ "role": "reader", "type": "anyone" }))
            .send()
            .await
            .map_err(transport_failure)?;
        check_status(response).await?;
        Ok(())
    }
}

#[async_trait]
impl ArtifactSink for DriveSink {
    fn kind(&self) -> SinkKind {
        SinkKind::Drive
    }

    async fn store(
        &self,
        file_name: &str,
        mime_type: &str,
        content: Bytes,
    ) -> Result<SinkLocation, UploadError> {
        let bytes = content.len();
        let result: Result<String, BackendFailure> = async {
            let token = self.access_token().await?;
            let file_id = self.upload(&token, file_name, mime_type, content).await?;
            self.share_publicly(&token, &file_id).await?;
            Ok(file_id)
        }
        .await;

        match result {
            Ok(file_id) => {
                info!(file_id, name = file_name, bytes, "drive upload complete");
                let url = format!("https://drive.google.com/file/d/{file_id}/view");
                Ok(SinkLocation::Remote { file_id, url })
            }
            Err(err) => {
                warn!(name = file_name, bytes, error = %err, "drive upload failed");
                Err(err.into())
            }
        }
    }
}

/// 组装 `multipart/related` 请求体：JSON 元数据 + 文件内容。
fn multipart_related_body(
    boundary: &str,
    metadata: &FileMetadata<'_>,
    mime_type: &str,
    content: &[u8],
) -> Result<Vec<u8>, BackendFailure> {
    let metadata = serde_json::to_vec(metadata).map_err(|err| BackendFailure::Unexpected {
        status: None,
        message: err.to_string(),
    })?;
    let mut body = Vec::with_capacity(content.len() + metadata.len() + 256);
    body.extend_from_slice(
        format!("--{boundary}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n").as_bytes(),
    );
    body.extend_from_slice(&metadata);
    body.extend_from_slice(format!("\r\n--{boundary}\r\nContent-Type: {mime_type}\r\n\r\n").as_bytes());
    body.extend_from_slice(content);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    Ok(body)
}

fn sign_jwt(client_email: &str, audience: &str, key_pair: &RsaKeyPair) -> Result<String, BackendFailure> {
    let iat = chrono::Utc::now().timestamp();
    let claims = JwtClaims {
        iss: client_email,
        scope: DRIVE_SCOPE,
        aud: audience,
        iat,
        exp: iat + TOKEN_LIFETIME_SECS,
    };
    let claims = serde_json::to_vec(&claims).map_err(|err| BackendFailure::Unexpected {
        status: None,
        message: err.to_string(),
    })?;
    let signing_input = format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256","typ":"JWT"}"#),
        URL_SAFE_NO_PAD.encode(claims)
    );
    let mut signature = vec![0; key_pair.public().modulus_len()];
    key_pair
        .sign(
            &RSA_PKCS1_SHA256,
            &SystemRandom::new(),
            signing_input.as_bytes(),
            &mut signature,
        )
        .map_err(|_| BackendFailure::Unauthorized("failed to sign service account assertion".into()))?;
    Ok(format!("{signing_input}.{}", URL_SAFE_NO_PAD.encode(signature)))
}

/// 解析 PEM 私钥，兼容环境变量中的字面量 `\n`。
fn decode_pem(pem: &str) -> io::Result<Vec<u8>> {
    let normalized = pem.replace("\\n", "\n");
    let encoded: String = normalized
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("-----"))
        .collect();
    STANDARD
        .decode(encoded)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, format!("invalid PEM: {err}")))
}

fn transport_failure(err: reqwest::Error) -> BackendFailure {
    if err.is_timeout() {
        return BackendFailure::Timeout;
    }
    BackendFailure::Unexpected {
        status: err.status().map(|status| status.as_u16()),
        message: err.to_string(),
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, BackendFailure> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(classify_status(status, &body))
}

fn classify_status(status: StatusCode, body: &str) -> BackendFailure {
    let message: String = body.chars().take(512).collect();
    match status {
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => BackendFailure::Timeout,
        StatusCode::TOO_MANY_REQUESTS => BackendFailure::Quota(message),
        StatusCode::FORBIDDEN if QUOTA_REASONS.iter().any(|reason| body.contains(reason)) => {
            BackendFailure::Quota(message)
        }
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => BackendFailure::Unauthorized(message),
        _ => BackendFailure::Unexpected {
            status: Some(status.as_u16()),
            message,
        },
    }
}
