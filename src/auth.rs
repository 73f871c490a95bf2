//! 共享口令访问控制：登录令牌 Cookie、Basic 认证与按 IP 的登录限流。

use axum::extract::{Extension, Json, connect_info::ConnectInfo};
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{body::Body as AxumBody, middleware};
use axum_extra::extract::cookie::{Cookie, SameSite};
use axum_extra::extract::{CookieJar, TypedHeader};
use axum_extra::headers::{Authorization, authorization::Basic};
use cookie::time::Duration as CookieDuration;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::AUTH_COOKIE_NAME;
use crate::error::ApiError;
use crate::http::{RequestScheme, is_https_request, resolve_client_ip};

/// 访问口令及其派生状态：已签发的令牌与登录失败记录。
#[derive(Debug)]
pub struct AuthConfig {
    secret: String,
    tokens: TokenBook,
    guard: LoginGuard,
}

impl AuthConfig {
    pub fn new(
        secret: String,
        token_ttl: Duration,
        failure_window: Duration,
        max_failures: u32,
        lockout: Duration,
    ) -> Self {
        Self {
            secret,
            tokens: TokenBook {
                ttl: token_ttl,
                issued: Mutex::new(HashMap::new()),
            },
            guard: LoginGuard {
                window: failure_window,
                max_failures,
                lockout,
                clients: Mutex::new(HashMap::new()),
            },
        }
    }

    fn secret_matches(&self, candidate: &str) -> bool {
        candidate == self.secret
    }

    /// 丢弃过期令牌与失效的失败记录。
    pub async fn prune(&self) {
        self.tokens.prune().await;
        self.guard.prune().await;
    }
}

/// 登录成功后签发的令牌，值为到期时刻。
#[derive(Debug)]
struct TokenBook {
    ttl: Duration,
    issued: Mutex<HashMap<String, Instant>>,
}

impl TokenBook {
    async fn issue(&self) -> String {
        let token = Uuid::new_v4().simple().to_string();
        self.issued
            .lock()
            .await
            .insert(token.clone(), Instant::now() + self.ttl);
        token
    }

    /// 过期令牌在校验时顺便删除。
    async fn is_live(&self, token: &str) -> bool {
        let mut issued = self.issued.lock().await;
        match issued.get(token) {
            Some(expires_at) if *expires_at > Instant::now() => true,
            Some(_) => {
                issued.remove(token);
                false
            }
            None => false,
        }
    }

    async fn revoke(&self, token: &str) {
        self.issued.lock().await.remove(token);
    }

    async fn prune(&self) {
        let now = Instant::now();
        self.issued.lock().await.retain(|_, expires_at| *expires_at > now);
    }

    fn cookie_max_age(&self) -> CookieDuration {
        CookieDuration::seconds(self.ttl.as_secs() as i64)
    }
}

/// 单个客户端在当前窗口内的失败次数与锁定截止时刻。
#[derive(Debug)]
struct FailureRecord {
    first_failure: Instant,
    count: u32,
    locked_until: Option<Instant>,
}

/// 按 IP 统计登录失败；`max_failures` 为 0 时不限流。
#[derive(Debug)]
struct LoginGuard {
    window: Duration,
    max_failures: u32,
    lockout: Duration,
    clients: Mutex<HashMap<IpAddr, FailureRecord>>,
}

impl LoginGuard {
    /// 仍处于锁定期时返回剩余秒数。
    async fn locked_for(&self, ip: IpAddr) -> Option<u64> {
        if self.max_failures == 0 {
            return None;
        }
        let mut clients = self.clients.lock().await;
        let locked_until = clients.get(&ip)?.locked_until;
        let now = Instant::now();
        match locked_until {
            Some(until) if until > now => Some(until.duration_since(now).as_secs().max(1)),
            Some(_) => {
                clients.remove(&ip);
                None
            }
            None => None,
        }
    }

    async fn record_failure(&self, ip: IpAddr) {
        if self.max_failures == 0 {
            return;
        }
        let now = Instant::now();
        let mut clients = self.clients.lock().await;
        let record = clients.entry(ip).or_insert(FailureRecord {
            first_failure: now,
            count: 0,
            locked_until: None,
        });
        if now.duration_since(record.first_failure) > self.window {
            *record = FailureRecord {
                first_failure: now,
                count: 0,
                locked_until: None,
            };
        }
        record.count += 1;
        if record.count >= self.max_failures {
            record.locked_until = Some(now + self.lockout);
            warn!(client_ip = %ip, failures = record.count, "login locked out");
        }
    }

    async fn forget(&self, ip: IpAddr) {
        self.clients.lock().await.remove(&ip);
    }

    async fn prune(&self) {
        let now = Instant::now();
        self.clients.lock().await.retain(|_, record| match record.locked_until {
            Some(until) => until > now,
            None => now.duration_since(record.first_failure) <= self.window,
        });
    }
}

/// 放行持有有效令牌 Cookie 或以口令作为 Basic 密码（用户名任意）的请求。
pub async fn auth_middleware(
    Extension(auth): Extension<Arc<AuthConfig>>,
    jar: CookieJar,
    basic: Option<TypedHeader<Authorization<Basic>>>,
    req: Request<AxumBody>,
    next: middleware::Next,
) -> Result<Response, ApiError> {
    let allowed = is_auth_exempt_path(req.uri().path())
        || has_live_token(&auth, &jar).await
        || basic.is_some_and(|TypedHeader(basic)| auth.secret_matches(basic.password()));
    if !allowed {
        return Err(ApiError::Unauthorized(HeaderMap::new()));
    }
    Ok(next.run(req).await)
}

#[derive(Deserialize)]
pub(crate) struct AuthLoginRequest {
    password: String,
}

/// 口令正确时签发令牌并写入 http-only Cookie。
pub async fn auth_login(
    Extension(auth): Extension<Arc<AuthConfig>>,
    Extension(scheme): Extension<RequestScheme>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    jar: CookieJar,
    Json(payload): Json<AuthLoginRequest>,
) -> Result<(CookieJar, Response), ApiError> {
    let client_ip = resolve_client_ip(&headers, Some(addr.ip())).unwrap_or(addr.ip());

    if let Some(retry_after) = auth.guard.locked_for(client_ip).await {
        return Err(ApiError::TooManyRequests(
            retry_after,
            "too_many_requests",
            "too many login attempts".into(),
        ));
    }
    if !auth.secret_matches(&payload.password) {
        auth.guard.record_failure(client_ip).await;
        return Err(ApiError::Unauthorized(HeaderMap::new()));
    }
    auth.guard.forget(client_ip).await;

    let token = auth.tokens.issue().await;
    info!(client_ip = %client_ip, "access granted");
    let cookie = Cookie::build((AUTH_COOKIE_NAME, token))
        .path("/")
        .http_only(true)
        .secure(is_https_request(&headers, scheme))
        .same_site(SameSite::Strict)
        .max_age(auth.tokens.cookie_max_age())
        .build();
    Ok((jar.add(cookie), StatusCode::NO_CONTENT.into_response()))
}

/// 撤销令牌并让浏览器删除 Cookie。
pub async fn auth_logout(
    Extension(auth): Extension<Arc<AuthConfig>>,
    jar: CookieJar,
) -> (CookieJar, StatusCode) {
    if let Some(cookie) = jar.get(AUTH_COOKIE_NAME) {
        auth.tokens.revoke(cookie.value()).await;
    }
    let removal = Cookie::build(AUTH_COOKIE_NAME).path("/").build();
    (jar.remove(removal), StatusCode::NO_CONTENT)
}

pub async fn auth_status(
    Extension(auth): Extension<Arc<AuthConfig>>,
    jar: CookieJar,
) -> StatusCode {
    if has_live_token(&auth, &jar).await {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::UNAUTHORIZED
    }
}

async fn has_live_token(auth: &AuthConfig, jar: &CookieJar) -> bool {
    match jar.get(AUTH_COOKIE_NAME) {
        Some(cookie) => auth.tokens.is_live(cookie.value()).await,
        None => false,
    }
}

/// 二维码链接、状态与版本接口无需登录。
fn is_auth_exempt_path(path: &str) -> bool {
    matches!(
        path,
        "/api/auth/login" | "/api/auth/logout" | "/api/auth/status" | "/api/version" | "/api/status"
    ) || path.starts_with("/api/file/")
        || path.starts_with("/api/view/")
        || !path.starts_with("/api/")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_auth(max_failures: u32) -> Arc<AuthConfig> {
        Arc::new(AuthConfig::new(
            "secret".to_string(),
            Duration::from_secs(60),
            Duration::from_secs(60),
            max_failures,
            Duration::from_secs(600),
        ))
    }

    async fn login(
        auth: &Arc<AuthConfig>,
        password: &str,
    ) -> Result<(CookieJar, Response), ApiError> {
        auth_login(
            Extension(auth.clone()),
            Extension(RequestScheme::Http),
            ConnectInfo("198.51.100.4:40000".parse().expect("socket addr")),
            HeaderMap::new(),
            CookieJar::new(),
            Json(AuthLoginRequest {
                password: password.to_string(),
            }),
        )
        .await
    }

    #[tokio::test]
    async fn correct_password_issues_token_cookie() {
        let auth = make_auth(5);
        let (jar, response) = login(&auth, "secret")
            .await
            .unwrap_or_else(|_| panic!("login failed"));

        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        let cookie = jar.get(AUTH_COOKIE_NAME).expect("token cookie");
        assert!(cookie.http_only().unwrap_or(false));
        assert!(auth.tokens.is_live(cookie.value()).await);
        assert_eq!(
            auth_status(Extension(auth.clone()), jar.clone()).await,
            StatusCode::NO_CONTENT
        );

        let (jar, status) = auth_logout(Extension(auth.clone()), jar).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert_eq!(
            auth_status(Extension(auth.clone()), jar).await,
            StatusCode::UNAUTHORIZED
        );
        assert!(auth.tokens.issued.lock().await.is_empty());
    }

    #[tokio::test]
    async fn repeated_failures_lock_out_client() {
        let auth = make_auth(2);
        for _ in 0..2 {
            let result = login(&auth, "wrong").await;
            assert!(matches!(result, Err(ApiError::Unauthorized(_))));
        }

        let result = login(&auth, "secret").await;
        assert!(matches!(result, Err(ApiError::TooManyRequests(..))));
    }

    #[tokio::test]
    async fn zero_max_failures_disables_lockout() {
        let auth = make_auth(0);
        for _ in 0..5 {
            assert!(login(&auth, "wrong").await.is_err());
        }
        assert!(login(&auth, "secret").await.is_ok());
    }

    #[tokio::test]
    async fn expired_tokens_are_pruned() {
        let auth = Arc::new(AuthConfig::new(
            "secret".to_string(),
            Duration::ZERO,
            Duration::from_secs(60),
            5,
            Duration::from_secs(60),
        ));
        let token = auth.tokens.issue().await;
        assert!(!auth.tokens.is_live(&token).await);

        auth.tokens.issue().await;
        auth.prune().await;
        assert!(auth.tokens.issued.lock().await.is_empty());
    }

    #[test]
    fn retrieval_links_skip_auth() {
        assert!(is_auth_exempt_path("/api/file/abc"));
        assert!(is_auth_exempt_path("/api/view/abc"));
        assert!(is_auth_exempt_path("/api/status"));
        assert!(!is_auth_exempt_path("/api/upload"));
        assert!(!is_auth_exempt_path("/api/upload-chunk"));
    }
}
