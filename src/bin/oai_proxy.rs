//! Model Proxy binary entrypoint.

use std::net::SocketAddr;

use clap::Parser;
use evmbench::oai_proxy::{OaiProxy, ProxyConfig};
use secrecy::{ExposeSecret, SecretString};

#[derive(Debug, Parser)]
struct Settings {
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:8002")]
    bind_addr: SocketAddr,

    #[arg(long, env = "OAI_PROXY_AES_SHARED_SECRET")]
    aes_shared_secret: SecretString,

    #[arg(long, env = "OAI_PROXY_STATIC_KEY")]
    static_key: Option<SecretString>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    evmbench::config::init_tracing();
    let settings = Settings::parse();

    let config = ProxyConfig {
        aes_key: evmbench::crypto::derive_key(settings.aes_shared_secret.expose_secret()),
        static_key: settings.static_key.map(|s| s.expose_secret().to_string()),
    };

    tracing::info!(addr = %settings.bind_addr, "model proxy listening");
    OaiProxy::new(config).serve(settings.bind_addr).await?;
    Ok(())
}
