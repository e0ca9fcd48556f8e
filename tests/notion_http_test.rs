use reqwest::Url;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use notion_overdue::config;
use notion_overdue::model::{Stage, StageEncoding};
use notion_overdue::notion::{LoanStore, NotionClient, NotionIds};

#[derive(Debug, Clone)]
struct SeenRequest {
    line: String,
    body: Value,
}

/// Serves one canned response per connection, in order, and records what it was sent.
async fn serve(responses: Vec<(u16, Value)>) -> (Url, Arc<Mutex<Vec<SeenRequest>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();
    tokio::spawn(async move {
        for (status, body) in responses {
            let (mut socket, _) = listener.accept().await.unwrap();
            let request = read_request(&mut socket).await;
            log.lock().unwrap().push(request);
            let payload = body.to_string();
            let reason = if status < 400 { "OK" } else { "Error" };
            let response = format!(
                "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\n\
                 Content-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                reason,
                payload.len(),
                payload
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
        }
    });
    let url = Url::parse(&format!("http://{}/", addr)).unwrap();
    (url, seen)
}

async fn read_request(socket: &mut tokio::net::TcpStream) -> SeenRequest {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        let n = socket.read(&mut chunk).await.unwrap();
        assert!(n > 0, "connection closed before headers");
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };
    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let length = head
        .lines()
        .filter_map(|l| l.split_once(':'))
        .find(|(k, _)| k.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.trim().parse::<usize>().ok())
        .unwrap_or(0);
    while buf.len() < header_end + length {
        let n = socket.read(&mut chunk).await.unwrap();
        assert!(n > 0, "connection closed before body");
        buf.extend_from_slice(&chunk[..n]);
    }
    let raw = &buf[header_end..header_end + length];
    SeenRequest {
        line: head.lines().next().unwrap_or_default().to_string(),
        body: if raw.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(raw).unwrap()
        },
    }
}

fn example_config() -> config::Config {
    let mut cfg: config::Config = serde_yaml::from_str(config::example()).unwrap();
    cfg.notion.databases.loans.id = "loans-db".into();
    cfg
}

fn ids(encoding: StageEncoding) -> NotionIds {
    let mut ids = example_config().notion_ids();
    ids.stage_encoding = encoding;
    ids
}

fn client(url: Url) -> NotionClient {
    NotionClient::with_base_url(
        "secret".into(),
        "2022-06-28".into(),
        url,
        Duration::from_secs(5),
    )
    .unwrap()
}

fn loan_page(id: &str) -> Value {
    json!({
        "id": id,
        "url": format!("https://www.notion.so/{}", id),
        "properties": {
            "Title": { "type": "title", "title": [{ "plain_text": format!("Book {}", id) }] },
            "Borrower": { "type": "people", "people": [{ "id": "u-1", "name": "Kim" }] },
            "Borrowed on": { "type": "date", "date": { "start": "2024-06-01" } },
            "Alert stage": { "type": "select", "select": null }
        }
    })
}

#[tokio::test]
async fn error_status_carries_response_body() {
    let (url, seen) = serve(vec![(
        400,
        json!({ "code": "validation_error", "message": "bad select" }),
    )])
    .await;
    let notion = client(url);

    let err = notion
        .patch_alert_stage(&ids(StageEncoding::Select), "page-9", Stage::Week3)
        .await
        .unwrap_err();
    let text = format!("{:#}", err);
    assert!(text.contains("WEEK_3"), "{}", text);
    assert!(text.contains("400"), "{}", text);
    assert!(text.contains("validation_error"), "{}", text);
    assert!(text.contains("bad select"), "{}", text);

    let seen = seen.lock().unwrap();
    assert!(seen[0].line.starts_with("PATCH /v1/pages/page-9 "));
    assert_eq!(
        seen[0].body["properties"]["Alert stage"]["select"]["name"],
        "WEEK_3"
    );
}

#[tokio::test]
async fn candidates_follow_the_cursor_across_pages() {
    let (url, seen) = serve(vec![
        (
            200,
            json!({
                "results": [loan_page("p1"), loan_page("p2")],
                "has_more": true,
                "next_cursor": "cursor-2"
            }),
        ),
        (
            200,
            json!({ "results": [loan_page("p3")], "has_more": false, "next_cursor": null }),
        ),
    ])
    .await;
    let notion = client(url);

    let items = notion
        .fetch_candidates(&ids(StageEncoding::Select))
        .await
        .unwrap();
    let got: Vec<&str> = items.iter().map(|i| i.id.as_str()).collect();
    assert_eq!(got, ["p1", "p2", "p3"]);
    assert_eq!(items[2].title, "Book p3");
    assert_eq!(items[0].borrowers[0].user_id, "u-1");

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert!(seen[0].line.starts_with("POST /v1/databases/loans-db/query "));
    assert!(seen[0].body.get("start_cursor").is_none());
    assert_eq!(seen[0].body["page_size"], 100);
    assert_eq!(seen[1].body["start_cursor"], "cursor-2");
    assert_eq!(seen[1].body["filter"], seen[0].body["filter"]);
}

#[tokio::test]
async fn candidate_query_failure_is_an_error() {
    let (url, _) = serve(vec![(500, json!({ "message": "internal" }))]).await;
    let err = client(url)
        .fetch_candidates(&ids(StageEncoding::Select))
        .await
        .unwrap_err();
    let text = format!("{:#}", err);
    assert!(text.contains("500"), "{}", text);
    assert!(text.contains("internal"), "{}", text);
}

#[tokio::test]
async fn stage_write_waits_the_courtesy_delay() {
    let (url, seen) = serve(vec![(200, json!({ "object": "page", "id": "page-1" }))]).await;
    let notion = client(url).with_page_delay(Duration::from_millis(150));

    let started = Instant::now();
    notion
        .patch_alert_stage(&ids(StageEncoding::Status), "page-1", Stage::Week4)
        .await
        .unwrap();
    assert!(started.elapsed() >= Duration::from_millis(150));

    let seen = seen.lock().unwrap();
    assert_eq!(
        seen[0].body["properties"]["Alert stage"]["status"]["name"],
        "WEEK_4"
    );
}

#[tokio::test]
async fn schema_type_wins_over_configured_encoding() {
    let schema = json!({
        "id": "loans-db",
        "title": [],
        "properties": {
            "Title": { "id": "title", "type": "title" },
            "Borrower": { "id": "b", "type": "people" },
            "Borrowed on": { "id": "d", "type": "date" },
            "Alert stage": { "id": "s", "type": "status" }
        }
    });
    let (url, seen) = serve(vec![(200, schema)]).await;
    let mut cfg = example_config();
    cfg.notion.databases.loans.fields.alert_stage_type = StageEncoding::Select;

    let ids = client(url).resolve_property_ids(&cfg).await.unwrap();
    assert_eq!(ids.stage_encoding, StageEncoding::Status);
    assert!(seen.lock().unwrap()[0]
        .line
        .starts_with("GET /v1/databases/loans-db "));
}

#[tokio::test]
async fn missing_property_fails_schema_check() {
    let schema = json!({
        "id": "loans-db",
        "properties": {
            "Title": { "id": "title", "type": "title" },
            "Borrower": { "id": "b", "type": "people" },
            "Alert stage": { "id": "s", "type": "select" }
        }
    });
    let (url, _) = serve(vec![(200, schema)]).await;
    let err = client(url)
        .resolve_property_ids(&example_config())
        .await
        .unwrap_err();
    assert!(format!("{:#}", err).contains("Borrowed on"));
}
