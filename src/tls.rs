//! HTTPS 监听所用的证书：加载配置的 PEM 文件，或生成自签名证书。

use axum_server::tls_rustls::RustlsConfig;
use rcgen::generate_simple_self_signed;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::info;

use crate::config::Args;

/// 构建 Rustls 配置；未配置证书与私钥时在临时目录生成自签名证书。
pub async fn build_rustls_config(
    args: &Args,
    host: IpAddr,
) -> Result<RustlsConfig, std::io::Error> {
    let (cert_path, key_path) = match (&args.tls_cert, &args.tls_key) {
        (Some(cert), Some(key)) => (PathBuf::from(cert), PathBuf::from(key)),
        _ => write_self_signed(host, &std::env::temp_dir())?,
    };

    let cert = fs::read(&cert_path).await?;
    let key = fs::read(&key_path).await?;
    RustlsConfig::from_pem(cert, key).await
}

/// 为绑定地址与 `localhost` 签发证书，写入 `dir` 并返回文件路径。
fn write_self_signed(host: IpAddr, dir: &Path) -> Result<(PathBuf, PathBuf), std::io::Error> {
    let mut names = vec!["localhost".to_string()];
    if !host.is_unspecified() {
        names.push(host.to_string());
    }
    let cert = generate_simple_self_signed(names)
        .map_err(|err| std::io::Error::other(err.to_string()))?;
    let cert_path = dir.join("qrdrop-cert.pem");
    let key_path = dir.join("qrdrop-key.pem");
    std::fs::write(&cert_path, cert.cert.pem())?;
    std::fs::write(&key_path, cert.key_pair.serialize_pem())?;
    info!(cert = %cert_path.display(), "generated self-signed certificate");
    Ok((cert_path, key_path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[tokio::test]
    async fn configured_pem_files_are_loaded() {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let dir = tempfile::tempdir().expect("tempdir");
        let (cert, key) =
            write_self_signed("127.0.0.1".parse().expect("ip"), dir.path()).expect("generate");
        let cert_text = std::fs::read_to_string(&cert).expect("read cert");
        assert!(cert_text.starts_with("-----BEGIN CERTIFICATE-----"));

        let args = Args::try_parse_from([
            "qrdrop",
            "--tls-cert",
            cert.to_str().expect("utf8 path"),
            "--tls-key",
            key.to_str().expect("utf8 path"),
        ])
        .expect("parse args");
        build_rustls_config(&args, "127.0.0.1".parse().expect("ip"))
            .await
            .expect("load pem");
    }
}
