//! End-to-end tests driving a real server over TCP.

use std::io::Read;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use webpipes::config::parse_config;

mod common;

#[tokio::test]
async fn test_text_route_and_missing_route() {
    let server = common::start_server(
        r#"
        [[routes]]
        pattern = "/hello"
        stages = [{ kind = "text", body = "hello, world" }, { kind = "output" }]
        "#,
    )
    .await;
    let client = common::client();

    let res = client.get(server.url("/hello")).send().await.expect("server unreachable");
    assert_eq!(res.status(), 200);
    assert!(res.headers().contains_key("x-request-id"));
    assert!(res.headers()["server"].to_str().unwrap().starts_with("webpipes/"));
    assert_eq!(res.text().await.unwrap(), "hello, world");

    let res = client.get(server.url("/nope")).send().await.unwrap();
    assert_eq!(res.status(), 404);
    assert_eq!(res.text().await.unwrap(), "404 page not found\n");

    server.shutdown.trigger();
}

#[tokio::test]
async fn test_rot13_through_network() {
    let server = common::start_server(
        r#"
        [[routes]]
        pattern = "/secret"
        topology = "network"
        capacity = 2
        stage_workers = 1
        stages = [
            { kind = "text", body = "Uryyb, Jbeyq!" },
            { kind = "rot13" },
            { kind = "output" },
        ]
        "#,
    )
    .await;
    let client = common::client();

    let requests = (0..20).map(|_| {
        let client = client.clone();
        let url = server.url("/secret");
        async move {
            let res = client.get(url).send().await.unwrap();
            (res.status().as_u16(), res.text().await.unwrap())
        }
    });

    for (status, body) in join_all(requests).await {
        assert_eq!(status, 200);
        assert_eq!(body, "Hello, World!");
    }

    server.shutdown.trigger();
}

#[tokio::test]
async fn test_shared_network_serves_two_routes() {
    let server = common::start_server(
        r#"
        [[networks]]
        name = "common"
        capacity = 4
        stages = [{ kind = "text", body = "shared" }, { kind = "output" }]

        [[routes]]
        pattern = "/one"
        topology = "shared"
        network = "common"

        [[routes]]
        pattern = "/two/"
        topology = "shared"
        network = "common"
        "#,
    )
    .await;
    let client = common::client();

    for path in ["/one", "/two/deeper"] {
        let res = client.get(server.url(path)).send().await.unwrap();
        assert_eq!(res.status(), 200, "{}", path);
        assert_eq!(res.text().await.unwrap(), "shared");
    }

    server.shutdown.trigger();
}

#[tokio::test]
async fn test_basic_auth() {
    let server = common::start_server(
        r#"
        [[routes]]
        pattern = "/private"
        stages = [
            { kind = "basic_auth", realm = "vault", users = { alice = "wonderland" } },
            { kind = "text", body = "welcome" },
            { kind = "output" },
        ]
        "#,
    )
    .await;
    let client = common::client();

    let res = client.get(server.url("/private")).send().await.unwrap();
    assert_eq!(res.status(), 401);
    assert_eq!(res.headers()["www-authenticate"], "Basic realm=\"vault\"");

    let res = client
        .get(server.url("/private"))
        .basic_auth("alice", Some("wrong"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 401);

    let res = client
        .get(server.url("/private"))
        .basic_auth("alice", Some("wonderland"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    assert_eq!(res.text().await.unwrap(), "welcome");

    server.shutdown.trigger();
}

#[tokio::test]
async fn test_canned_responses_drop_stale_entity_headers() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("big.txt"), vec![b'x'; 1000]).unwrap();
    let server = common::start_server(&format!(
        r#"
        [[routes]]
        pattern = "/doc/"
        stages = [
            {{ kind = "file", root = "{root}" }},
            {{ kind = "text", body = "second source" }},
            {{ kind = "output" }},
        ]

        [[routes]]
        pattern = "/zipped-private"
        stages = [
            {{ kind = "text", body = "secret" }},
            {{ kind = "gzip" }},
            {{ kind = "basic_auth", realm = "vault", users = {{ alice = "wonderland" }} }},
            {{ kind = "output" }},
        ]
        "#,
        root = common::toml_path(dir.path()),
    ))
    .await;
    let client = common::client();

    let res = client.get(server.url("/doc/big.txt")).send().await.unwrap();
    assert_eq!(res.status(), 500);
    assert_ne!(res.headers().get("content-length").map(|v| v.as_bytes()), Some(&b"1000"[..]));
    assert_eq!(res.text().await.unwrap(), "Internal Server Error\n");

    let res = client.get(server.url("/zipped-private")).send().await.unwrap();
    assert_eq!(res.status(), 401);
    assert!(res.headers().get("content-encoding").is_none());
    assert_eq!(res.headers()["www-authenticate"], "Basic realm=\"vault\"");
    assert_eq!(res.text().await.unwrap(), "Unauthorized\n");

    server.shutdown.trigger();
}

#[tokio::test]
async fn test_gzip_negotiation() {
    let server = common::start_server(
        r#"
        [[routes]]
        pattern = "/zip"
        stages = [
            { kind = "text", body = "compress me, compress me, compress me" },
            { kind = "compression" },
            { kind = "output" },
        ]
        "#,
    )
    .await;
    let client = common::client();

    let res = client
        .get(server.url("/zip"))
        .header("Accept-Encoding", "deflate;q=0.5, gzip")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    assert_eq!(res.headers()["content-encoding"], "gzip");
    let compressed = res.bytes().await.unwrap();

    let mut text = String::new();
    flate2::read::GzDecoder::new(&compressed[..])
        .read_to_string(&mut text)
        .unwrap();
    assert_eq!(text, "compress me, compress me, compress me");

    let res = client.get(server.url("/zip")).send().await.unwrap();
    assert!(res.headers().get("content-encoding").is_none());
    assert_eq!(res.text().await.unwrap(), "compress me, compress me, compress me");

    server.shutdown.trigger();
}

#[tokio::test]
async fn test_http10_keep_alive_gets_content_length() {
    let server = common::start_server(
        r#"
        [[routes]]
        pattern = "/old"
        stages = [{ kind = "text", body = "hello" }, { kind = "output_http10" }]
        "#,
    )
    .await;

    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    stream
        .write_all(b"GET /old HTTP/1.0\r\nConnection: keep-alive\r\n\r\n")
        .await
        .unwrap();

    let mut received = Vec::new();
    let mut chunk = [0u8; 1024];
    let response = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let n = stream.read(&mut chunk).await.unwrap();
            received.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&received).to_string();
            if n == 0 || (text.contains("\r\n\r\n") && text.ends_with("hello")) {
                return text;
            }
        }
    })
    .await
    .expect("response must arrive");

    let lower = response.to_ascii_lowercase();
    assert!(lower.starts_with("http/1.0 200"), "{}", response);
    assert!(lower.contains("content-length: 5"), "{}", response);
    assert!(response.ends_with("hello"));

    server.shutdown.trigger();
}

#[tokio::test]
async fn test_hot_reload_swaps_routes() {
    let server = common::start_server(
        r#"
        [[routes]]
        pattern = "/version"
        stages = [{ kind = "text", body = "v1" }, { kind = "output" }]
        "#,
    )
    .await;
    let client = common::client();

    let res = client.get(server.url("/version")).send().await.unwrap();
    assert_eq!(res.text().await.unwrap(), "v1");

    let next = parse_config(
        r#"
        [[routes]]
        pattern = "/version"
        topology = "network"
        stages = [{ kind = "text", body = "v2" }, { kind = "output" }]
        "#,
    )
    .unwrap();
    server.updates.send(next).unwrap();

    let mut body = String::new();
    for _ in 0..50 {
        body = client
            .get(server.url("/version"))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        if body == "v2" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(body, "v2");

    server.shutdown.trigger();
}

#[tokio::test]
async fn test_graceful_shutdown_stops_server() {
    let server = common::start_server("").await;
    server.shutdown.trigger();

    tokio::time::timeout(Duration::from_secs(5), server.task)
        .await
        .expect("server must stop after shutdown")
        .unwrap();
}
