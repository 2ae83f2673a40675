//! HTTP-level tests against a real listener on an ephemeral loopback port.

use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use webbox::config::env::constants::PAGE_MARKER;
use webbox::config::EnvConfig;
use webbox::domain::PortBinding;
use webbox::error::LifecycleError;
use webbox::infra::ProbeClient;
use webbox::services::site::SiteRenderer;
use webbox::state::AppState;

struct Running {
    addr: SocketAddr,
    shutdown: CancellationToken,
    handle: JoinHandle<Result<(), LifecycleError>>,
}

impl Running {
    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    async fn stop(self) {
        self.shutdown.cancel();
        self.handle.await.unwrap().unwrap();
    }
}

async fn start(templates: Option<&Path>, assets: Option<&Path>) -> Running {
    let config = EnvConfig {
        bind: PortBinding::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
        template_dir: templates.map(Path::to_path_buf),
        static_dir: assets.map(Path::to_path_buf),
    };
    let site = SiteRenderer::new(&config).unwrap();
    let listener = webbox::bind(&config).await.unwrap();
    let addr = listener.local_addr().unwrap();

    let shutdown = CancellationToken::new();
    let state = Arc::new(AppState::new(config, site));
    let handle = tokio::spawn(webbox::serve_on(listener, state, shutdown.clone()));
    Running {
        addr,
        shutdown,
        handle,
    }
}

#[tokio::test]
async fn test_index_page() {
    let server = start(None, None).await;

    let resp = reqwest::get(server.url("/")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let content_type = resp.headers()["content-type"].to_str().unwrap().to_string();
    assert!(content_type.starts_with("text/html"));
    let body = resp.text().await.unwrap();
    assert!(body.contains(PAGE_MARKER));
    assert!(body.contains("bootstrap"));

    server.stop().await;
}

#[tokio::test]
async fn test_static_assets() {
    let server = start(None, None).await;

    let resp = reqwest::get(server.url("/static/css/style.css")).await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["content-type"], "text/css; charset=utf-8");

    let resp = reqwest::get(server.url("/static/js/script.js")).await.unwrap();
    assert_eq!(resp.status(), 200);
    assert!(resp.text().await.unwrap().contains("greet"));

    let resp = reqwest::get(server.url("/static/css/nope.css")).await.unwrap();
    assert_eq!(resp.status(), 404);

    server.stop().await;
}

#[tokio::test]
async fn test_health() {
    let server = start(None, None).await;

    let resp = reqwest::get(server.url("/health")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = serde_json::from_str(&resp.text().await.unwrap()).unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "webbox");
    assert_eq!(body["templates"], "embedded");
    assert_eq!(body["bind"], "127.0.0.1:0");

    server.stop().await;
}

#[tokio::test]
async fn test_template_overlay_edits_show_without_restart() {
    let templates = TempDir::new().unwrap();
    let assets = TempDir::new().unwrap();
    fs::write(
        templates.path().join("base.html"),
        "<html><body>{% block content %}{% endblock %}</body></html>",
    )
    .unwrap();
    fs::write(
        templates.path().join("index.html"),
        "{% extends 'base.html' %}{% block content %}<h1>Welcome to Flask + Bootstrap</h1>{% endblock %}",
    )
    .unwrap();
    fs::create_dir_all(assets.path().join("css")).unwrap();
    fs::write(assets.path().join("css/style.css"), "h1 { color: red; }").unwrap();

    let server = start(Some(templates.path()), Some(assets.path())).await;

    let body = reqwest::get(server.url("/")).await.unwrap().text().await.unwrap();
    assert!(body.contains(PAGE_MARKER));

    fs::write(
        templates.path().join("index.html"),
        "{% extends 'base.html' %}{% block content %}<h1>Edited on the host</h1>{% endblock %}",
    )
    .unwrap();
    fs::write(assets.path().join("css/style.css"), "h1 { color: blue; }").unwrap();

    let body = reqwest::get(server.url("/")).await.unwrap().text().await.unwrap();
    assert!(body.contains("Edited on the host"));
    let css = reqwest::get(server.url("/static/css/style.css"))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(css, "h1 { color: blue; }");

    let health = reqwest::get(server.url("/health")).await.unwrap().text().await.unwrap();
    assert!(health.contains("\"templates\":\"directory\""));

    server.stop().await;

    // the baked-in page is untouched by overlay edits
    let embedded = SiteRenderer::new(&EnvConfig::default()).unwrap();
    assert!(embedded.render("index.html").unwrap().contains(PAGE_MARKER));
}

#[tokio::test]
async fn test_bind_conflict_is_a_start_error() {
    let server = start(None, None).await;

    let config = EnvConfig {
        bind: PortBinding::new(IpAddr::V4(Ipv4Addr::LOCALHOST), server.addr.port()),
        ..EnvConfig::default()
    };
    let err = webbox::bind(&config).await.unwrap_err();
    assert_eq!(LifecycleError::from(err).exit_code(), 3);

    server.stop().await;
}

#[tokio::test]
async fn test_page_check_against_running_server() {
    let server = start(None, None).await;
    let client = ProbeClient::new(Duration::from_secs(5)).unwrap();

    let report = client.probe(&server.url("/")).await.unwrap();
    assert_eq!(report.status, 200);
    assert!(report.is_healthy());

    let report = client
        .with_marker("Welcome to Django")
        .probe(&server.url("/"))
        .await
        .unwrap();
    assert!(!report.marker_found);
    assert!(!report.is_healthy());

    server.stop().await;
}
