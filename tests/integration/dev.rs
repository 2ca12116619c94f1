//! Dev session tests: build, serve, rebuild on change, reload, shut down.

use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use kiln::core::TaskSpec;
use kiln::orchestration::{DevSession, RELOAD_PATH};
use kiln::transform::TransformRegistry;
use kiln::Pipeline;

use crate::fixtures::{config, TestProject};

async fn get(addr: SocketAddr, path: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
        path
    );
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

/// Read from `stream` into `buf` until it contains `needle`.
async fn read_until(stream: &mut TcpStream, buf: &mut String, needle: &str) {
    let mut chunk = [0u8; 1024];
    while !buf.contains(needle) {
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "connection closed before {:?} arrived", needle);
        buf.push_str(&String::from_utf8_lossy(&chunk[..n]));
    }
}

/// Given a project with an html task bound to `src/*.html`
/// When a dev session runs on port 0 and the page is edited
/// Then the page is served, rebuilt, a reload is pushed, and cancellation
/// stops the server
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dev_session_serves_rebuilds_and_stops() {
    let project = TestProject::new();
    project.write("src/index.html", "<body>first</body>");
    let tasks = vec![TaskSpec::new("html", "copy")
        .inputs(["src/*.html"])
        .output("", Some("*.html"))];
    let config = config(tasks, &[("src/*.html", &["html"])]);
    let pipeline = Pipeline::from_config(config, &project.path, TransformRegistry::with_builtins())
        .expect("Failed to build pipeline");

    let (ready_tx, ready_rx) = oneshot::channel();
    let cancel = CancellationToken::new();
    let session = DevSession::new(
        pipeline.config.clone(),
        pipeline.graph.clone(),
        pipeline.registry.clone(),
        2,
    )
    .with_port(0)
    .with_ready(ready_tx);
    let running = tokio::spawn(session.run(cancel.clone()));

    let addr = tokio::time::timeout(Duration::from_secs(10), ready_rx)
        .await
        .expect("server should start")
        .unwrap();

    // The initial build finished before the server started.
    let page = get(addr, "/").await;
    assert!(page.starts_with("HTTP/1.1 200"));
    assert!(page.contains("first"));
    assert!(page.contains(RELOAD_PATH));

    let mut events = TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: localhost\r\nAccept: text/event-stream\r\n\r\n",
        RELOAD_PATH
    );
    events.write_all(request.as_bytes()).await.unwrap();
    let mut received = String::new();
    tokio::time::timeout(Duration::from_secs(5), read_until(&mut events, &mut received, "\r\n\r\n"))
        .await
        .expect("reload endpoint should answer");
    assert!(received.starts_with("HTTP/1.1 200"));

    // Rewrite until the watcher, which registers after the server, picks it up.
    let reloaded = tokio::time::timeout(Duration::from_secs(10), async {
        let mut edit = tokio::time::interval(Duration::from_millis(500));
        loop {
            tokio::select! {
                _ = edit.tick() => {
                    project.write("src/index.html", "<body>second</body>");
                }
                _ = read_until(&mut events, &mut received, "event: reload") => break,
            }
        }
    })
    .await;
    assert!(reloaded.is_ok(), "an edit should push a reload event");
    assert!(get(addr, "/").await.contains("second"));
    assert_eq!(project.read("dist/index.html"), "<body>second</body>");

    drop(events);
    cancel.cancel();
    let initial = tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .expect("session should end after cancellation")
        .unwrap()
        .unwrap();
    assert!(initial.success());
    assert_eq!(initial.reports.len(), 1);

    assert!(
        TcpStream::connect(addr).await.is_err(),
        "the server should be down after the session ends"
    );
}
