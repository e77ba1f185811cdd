//! 演示主机
//!
//! 写入演示配置，启动后台清理，然后以 `native.code` 客户端走一遍授权码 + PKCE 流程，
//! 最后用 API 资源的身份内省访问令牌。
//!
//! 运行: RUST_LOG=oidcrs=debug cargo run --example host

use chrono::Utc;
use oidcrs::oauth::{IntrospectionRequest, PkceChallenge, PkceMethod};
use oidcrs::registry::{InMemoryConfigurationStore, demo_seed_data, seed_if_empty};
use oidcrs::{AuthorizeRequest, IdentityServer, ServerOptions, Subject, TokenRequest};
use serde_json::json;
use tracing_subscriber::EnvFilter;

const REDIRECT_URI: &str = "https://notused";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    println!("=== oidcrs 演示主机 ===\n");

    // 1. 配置：默认值 + 环境变量覆盖
    let options = ServerOptions::development().with_env_overrides()?;
    println!("签发者: {}", options.issuer);

    // 2. 种子数据，重复执行不会产生变化
    let store = InMemoryConfigurationStore::new();
    let seed = demo_seed_data()?;
    let first = seed_if_empty(&store, &seed).await?;
    let second = seed_if_empty(&store, &seed).await?;
    println!(
        "种子: 第一次插入 {} 个客户端，第二次插入 {} 个",
        first.clients.len(),
        second.clients.len()
    );

    // 3. 组装服务并启动清理
    let server = IdentityServer::from_configuration_store(options, &store)
        .await?
        .build()?;
    let cleanup = server.start_cleanup();

    let discovery = server.discovery();
    println!("token 端点: {}", discovery.token_endpoint);
    println!("支持的 scope: {}", discovery.scopes_supported.join(" "));

    // 4. 宿主完成用户认证
    let alice = Subject::new("alice", Utc::now())
        .with_claim("name", json!("Alice Smith"))
        .with_claim("email", json!("alice@example.com"));

    // 5. 授权请求
    let pkce = PkceChallenge::new(PkceMethod::S256)?;
    let authorize = AuthorizeRequest::new("code", "native.code", REDIRECT_URI)
        .with_scope("openid profile api offline_access")
        .with_state("xyz")
        .with_code_challenge(pkce.challenge(), "S256");
    let response = server.authorize(&authorize, &alice).await?;
    println!("\n重定向: {}", response.redirect_url()?);

    let code = response.code.ok_or("授权响应缺少 code")?;

    // 6. 兑换授权码
    let token_request = TokenRequest::authorization_code("native.code", &code, REDIRECT_URI)
        .with_code_verifier(pkce.verifier());
    let tokens = server.token(&token_request).await?;
    println!("\n授予的 scope: {}", tokens.scope);
    println!("访问令牌有效期: {} 秒", tokens.expires_in);
    println!("身份令牌: {}", tokens.id_token.is_some());
    println!("刷新令牌: {}", tokens.refresh_token.is_some());

    // 同一个授权码不能兑换第二次
    if let Err(e) = server.token(&token_request).await {
        println!("再次兑换: {}", e.to_response());
    }

    // 7. API 内省
    let introspection = server
        .introspect("api", "secret", &IntrospectionRequest::new(&tokens.access_token))
        .await?;
    println!("\n内省: {}", serde_json::to_string_pretty(&introspection)?);

    // 8. 刷新
    if let Some(refresh_token) = &tokens.refresh_token {
        let refreshed = server
            .token(&TokenRequest::refresh_token("native.code", refresh_token).with_scope("api"))
            .await?;
        println!("\n刷新后的 scope: {}", refreshed.scope);
    }

    println!("\nJWKS: {}", serde_json::to_string(&server.jwks())?);

    if let Some(handle) = cleanup {
        handle.shutdown().await;
    }
    Ok(())
}
