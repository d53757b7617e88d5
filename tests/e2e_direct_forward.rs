//! 端到端测试：内置组件组成的 box
//!
//! client → DirectInbound → 默认出站(direct) → echo server

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use proxybox::config::parse_options;
use proxybox::{BoxOptions, ProxyBox};

/// Helper: allocate a free port
async fn free_port() -> u16 {
    let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = l.local_addr().unwrap().port();
    drop(l);
    port
}

/// Helper: start an echo server, returns its address
async fn start_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(s) => s,
                Err(_) => break,
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    let n = match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    };
                    if stream.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    addr
}

/// Poll a V2Ray counter until the forwarded connection has been accounted.
async fn wait_for_counter(instance: &ProxyBox, name: &str) -> u64 {
    let stats = instance.router().v2ray_server().unwrap().stats();
    for _ in 0..50 {
        let value = stats.get_stats(name, false).unwrap().value;
        if value > 0 {
            return value;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("counter {} stayed at zero", name);
}

#[tokio::test]
async fn forwards_through_default_outbound() {
    let echo = start_echo_server().await;
    let port = free_port().await;
    let stats_port = free_port().await;
    let config = format!(
        r#"{{
            "log": {{ "level": "warn" }},
            "inbounds": [{{
                "type": "direct",
                "tag": "forward",
                "listen": "127.0.0.1",
                "listen_port": {port},
                "override_address": "127.0.0.1",
                "override_port": {echo_port}
            }}],
            "outbounds": [{{ "type": "direct", "tag": "direct", "connect_timeout": 2000 }}],
            "experimental": {{
                "v2ray_api": {{
                    "listen": "127.0.0.1:{stats_port}",
                    "stats": {{ "enabled": true, "inbounds": ["forward"], "outbounds": ["direct"] }}
                }}
            }}
        }}"#,
        port = port,
        echo_port = echo.port(),
        stats_port = stats_port
    );
    let instance = ProxyBox::new(BoxOptions::new(parse_options(&config).unwrap()))
        .await
        .unwrap();
    instance.start().await.unwrap();
    instance.post_start().await.unwrap();

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    client.write_all(b"hello proxybox").await.unwrap();
    let mut buf = [0u8; 14];
    tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut buf))
        .await
        .expect("echo timed out")
        .unwrap();
    assert_eq!(&buf, b"hello proxybox");
    drop(client);

    // 连接结束后记账：上行为 client → 目标，下行为回显
    for name in [
        "inbound>>>forward>>>traffic>>>uplink",
        "inbound>>>forward>>>traffic>>>downlink",
        "outbound>>>direct>>>traffic>>>uplink",
        "outbound>>>direct>>>traffic>>>downlink",
    ] {
        assert_eq!(wait_for_counter(&instance, name).await, 14);
    }

    instance.close().await.unwrap();
    // 监听已释放
    assert!(TcpListener::bind(("127.0.0.1", port)).await.is_ok());
}

#[tokio::test]
async fn missing_outbounds_get_a_default_direct() {
    let config = r#"{ "log": { "level": "warn" } }"#;
    let instance = ProxyBox::new(BoxOptions::new(parse_options(config).unwrap()))
        .await
        .unwrap();
    let default = instance.router().default_outbound().unwrap();
    assert_eq!(default.tag(), "default");
    assert_eq!(default.outbound_type(), "direct");
    instance.start().await.unwrap();
    instance.close().await.unwrap();
}

#[tokio::test]
async fn unknown_final_outbound_fails_construction() {
    let config = r#"{
        "route": { "final": "missing" },
        "outbounds": [{ "type": "direct", "tag": "direct" }]
    }"#;
    let err = ProxyBox::new(BoxOptions::new(parse_options(config).unwrap()))
        .await
        .err()
        .unwrap();
    assert_eq!(err.stage(), Some("initialize router"));
}

#[tokio::test]
async fn clash_api_serves_mode_and_proxies() {
    let port = free_port().await;
    let config = format!(
        r#"{{
            "log": {{ "level": "warn" }},
            "outbounds": [
                {{ "type": "direct", "tag": "direct" }},
                {{ "type": "block", "tag": "block" }}
            ],
            "experimental": {{
                "clash_api": {{ "external_controller": "127.0.0.1:{port}" }}
            }}
        }}"#,
        port = port
    );
    let instance = ProxyBox::new(BoxOptions::new(parse_options(&config).unwrap()))
        .await
        .unwrap();
    assert_eq!(instance.pre_service_names(), vec!["clash api"]);
    instance.start().await.unwrap();

    let base = format!("http://127.0.0.1:{}", port);
    let client = reqwest::Client::new();

    let version: serde_json::Value = client
        .get(format!("{}/version", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(version["version"], env!("CARGO_PKG_VERSION"));

    let configs: serde_json::Value = client
        .get(format!("{}/configs", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(configs["mode"], "Rule");

    let resp = client
        .patch(format!("{}/configs", base))
        .json(&serde_json::json!({ "mode": "nope" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);

    let proxies: serde_json::Value = client
        .get(format!("{}/proxies", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(proxies["proxies"]["block"]["type"], "Block");
    assert_eq!(proxies["proxies"]["GLOBAL"]["now"], "direct");

    let resp = client
        .get(format!("{}/proxies/missing", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 404);

    instance.close().await.unwrap();
}

#[tokio::test]
async fn clash_api_upgrade_header_does_not_bypass_secret() {
    let port = free_port().await;
    let config = format!(
        r#"{{
            "log": {{ "level": "warn" }},
            "outbounds": [{{ "type": "direct", "tag": "direct" }}],
            "experimental": {{
                "clash_api": {{ "external_controller": "127.0.0.1:{port}", "secret": "s3cret" }}
            }}
        }}"#,
        port = port
    );
    let instance = ProxyBox::new(BoxOptions::new(parse_options(&config).unwrap()))
        .await
        .unwrap();
    instance.start().await.unwrap();

    let base = format!("http://127.0.0.1:{}", port);
    let client = reqwest::Client::new();

    let resp = client.get(format!("{}/proxies", base)).send().await.unwrap();
    assert_eq!(resp.status().as_u16(), 401);

    let resp = client
        .get(format!("{}/proxies", base))
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 401);

    let resp = client
        .patch(format!("{}/configs", base))
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .json(&serde_json::json!({ "mode": "Global" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 401);

    let resp = client
        .get(format!("{}/proxies", base))
        .bearer_auth("s3cret")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);

    let resp = client.get(format!("{}/version", base)).send().await.unwrap();
    assert_eq!(resp.status().as_u16(), 200);

    instance.close().await.unwrap();
}
