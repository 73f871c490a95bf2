//! HTTP 辅助工具：请求方案与来源识别、CORS 与安全头。

use axum::body::Body as AxumBody;
use axum::http::{HeaderMap, HeaderValue, Request, StatusCode, header};
use axum::{middleware, response::Response};
use std::net::IpAddr;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::warn;

#[derive(Clone, Copy, Debug)]
pub enum RequestScheme {
    Http,
    Https,
}

impl RequestScheme {
    pub fn is_https(self) -> bool {
        matches!(self, RequestScheme::Https)
    }
}

/// 构建 CORS Layer（支持逗号分隔的来源列表）。
pub fn build_cors_layer(cors_origins: Option<&str>) -> Option<CorsLayer> {
    let origins = cors_origins?
        .split(',')
        .map(|origin| origin.trim())
        .filter(|origin| !origin.is_empty())
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin, "invalid cors origin");
                None
            }
        })
        .collect::<Vec<_>>();

    if origins.is_empty() {
        return None;
    }

    Some(
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(Any)
            .allow_headers(Any)
            .allow_credentials(true),
    )
}

/// 从 `x-forwarded-for` 解析客户端 IP。
pub fn extract_forwarded_ip(headers: &HeaderMap) -> Option<IpAddr> {
    first_forwarded_value(headers, "x-forwarded-for").and_then(|value| value.parse().ok())
}

pub fn resolve_client_ip(headers: &HeaderMap, connect_ip: Option<IpAddr>) -> Option<IpAddr> {
    extract_forwarded_ip(headers).or(connect_ip)
}

/// 判断请求是否为 HTTPS（含反向代理头）。
pub fn is_https_request(headers: &HeaderMap, scheme: RequestScheme) -> bool {
    if let Some(value) = first_forwarded_value(headers, "x-forwarded-proto") {
        return value.eq_ignore_ascii_case("https");
    }
    scheme.is_https()
}

/// 计算生成链接所用的来源：优先使用配置的公开地址，否则按请求头推断。
pub fn request_origin(
    headers: &HeaderMap,
    scheme: RequestScheme,
    public_url: Option<&str>,
) -> String {
    if let Some(url) = public_url.map(str::trim).filter(|url| !url.is_empty()) {
        return url.trim_end_matches('/').to_string();
    }
    let proto = if is_https_request(headers, scheme) {
        "https"
    } else {
        "http"
    };
    let host = first_forwarded_value(headers, "x-forwarded-host")
        .or_else(|| {
            headers
                .get(header::HOST)
                .and_then(|value| value.to_str().ok())
        })
        .unwrap_or("localhost");
    format!("{proto}://{host}")
}

fn first_forwarded_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// 添加基础安全响应头。
pub async fn add_security_headers(
    request: Request<AxumBody>,
    next: middleware::Next,
) -> Result<Response, StatusCode> {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers
        .entry(header::X_FRAME_OPTIONS)
        .or_insert(HeaderValue::from_static("DENY"));
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn origin_prefers_configured_public_url() {
        let map = headers(&[("host", "10.0.0.2:5005")]);
        assert_eq!(
            request_origin(&map, RequestScheme::Http, Some("https://share.example.com/")),
            "https://share.example.com"
        );
    }

    #[test]
    fn origin_follows_proxy_headers() {
        let map = headers(&[
            ("host", "127.0.0.1:5005"),
            ("x-forwarded-proto", "https"),
            ("x-forwarded-host", "qr.example.com, proxy.internal"),
        ]);
        assert_eq!(
            request_origin(&map, RequestScheme::Http, None),
            "https://qr.example.com"
        );
    }

    #[test]
    fn origin_uses_host_and_listener_scheme() {
        let map = headers(&[("host", "192.168.1.10:5006")]);
        assert_eq!(
            request_origin(&map, RequestScheme::Https, None),
            "https://192.168.1.10:5006"
        );
        assert_eq!(
            request_origin(&HeaderMap::new(), RequestScheme::Http, None),
            "http://localhost"
        );
    }

    #[test]
    fn client_ip_from_forwarded_header() {
        let map = headers(&[("x-forwarded-for", "203.0.113.7, 10.0.0.1")]);
        let fallback: IpAddr = "127.0.0.1".parse().expect("ip");
        assert_eq!(
            resolve_client_ip(&map, Some(fallback)),
            Some("203.0.113.7".parse().expect("ip"))
        );
        assert_eq!(resolve_client_ip(&HeaderMap::new(), Some(fallback)), Some(fallback));
    }
}
