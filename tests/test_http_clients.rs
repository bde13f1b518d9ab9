//! Drives the OpenAI and BigQuery clients against a local HTTP server that
//! replays canned responses, one connection per response.

use askdata::error::AskError;
use askdata::execution::{BigQueryWarehouse, QueryExecutor, Warehouse};
use askdata::extract::wrap;
use askdata::llm::{ChatModel, OpenAiClient};
use askdata::pipeline::{NoopObserver, Pipeline, RunState};
use askdata::stream::{aggregate, NoopStreamObserver};
use askdata::SchemaDescription;
use polars::prelude::*;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A request as the server saw it: request line and body.
#[derive(Debug, Clone)]
struct Recorded {
    request_line: String,
    headers: String,
    body: String,
}

async fn serve(responses: Vec<String>) -> (String, JoinHandle<Vec<Recorded>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = tokio::spawn(async move {
        let mut recorded = Vec::new();
        for response in responses {
            let (mut socket, _) = listener.accept().await.unwrap();
            recorded.push(read_request(&mut socket).await);
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
        }
        recorded
    });

    (format!("http://{}", addr), handle)
}

async fn read_request(socket: &mut tokio::net::TcpStream) -> Recorded {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    let header_end = loop {
        let n = socket.read(&mut chunk).await.unwrap();
        assert!(n > 0, "client closed before sending headers");
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let content_length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())
                .flatten()
        })
        .unwrap_or(0);

    while buf.len() < header_end + content_length {
        let n = socket.read(&mut chunk).await.unwrap();
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    let mut lines = head.lines();
    Recorded {
        request_line: lines.next().unwrap_or_default().to_string(),
        headers: lines.collect::<Vec<_>>().join("\n"),
        body: String::from_utf8_lossy(&buf[header_end..]).to_string(),
    }
}

fn sse_response(fragments: &[&str], finish_reason: &str) -> String {
    let mut body = String::new();
    for fragment in fragments {
        let chunk = serde_json::json!({
            "choices": [{"index": 0, "delta": {"content": fragment}, "finish_reason": null}]
        });
        body.push_str(&format!("data: {}\n\n", chunk));
    }
    let last = serde_json::json!({
        "choices": [{"index": 0, "delta": {}, "finish_reason": finish_reason}]
    });
    body.push_str(&format!("data: {}\n\n", last));
    body.push_str("data: [DONE]\n\n");

    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nConnection: close\r\n\r\n{}",
        body
    )
}

fn json_response(status: &str, body: serde_json::Value) -> String {
    let body = body.to_string();
    format!(
        "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    )
}

fn finished_query(job_id: &str) -> serde_json::Value {
    serde_json::json!({
        "kind": "bigquery#queryResponse",
        "jobComplete": true,
        "jobReference": {"projectId": "proj", "jobId": job_id, "location": "EU"},
        "totalRows": "2",
        "totalBytesProcessed": "1024",
        "schema": {"fields": [
            {"name": "foretag", "type": "STRING", "mode": "NULLABLE"},
            {"name": "omsattning", "type": "INTEGER", "mode": "NULLABLE"}
        ]},
        "rows": [
            {"f": [{"v": "Beta AB"}, {"v": "450000"}]},
            {"f": [{"v": "Acme AB"}, {"v": "120000"}]}
        ]
    })
}

fn client(base: &str) -> OpenAiClient {
    OpenAiClient::new("sk-test".to_string(), "gpt-4-turbo".to_string(), format!("{}/v1", base))
}

fn warehouse(base: &str) -> BigQueryWarehouse {
    BigQueryWarehouse::new("proj".to_string(), "EU".to_string(), "ya29.token".to_string())
        .unwrap()
        .with_base_url(base)
}

#[tokio::test]
async fn test_openai_stream_is_assembled() {
    let (base, server) = serve(vec![sse_response(&["```sql\nSELECT ", "1\n", "```"], "stop")]).await;

    let stream = client(&base).stream_chat("prompt text").await.unwrap();
    let assembled = aggregate(stream, &mut NoopStreamObserver, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(assembled.text, "```sql\nSELECT 1\n```");
    assert!(assembled.is_complete());

    let requests = server.await.unwrap();
    assert_eq!(requests[0].request_line, "POST /v1/chat/completions HTTP/1.1");
    assert!(requests[0].headers.to_lowercase().contains("authorization: bearer sk-test"));

    let body: serde_json::Value = serde_json::from_str(&requests[0].body).unwrap();
    assert_eq!(body["model"], "gpt-4-turbo");
    assert_eq!(body["stream"], true);
    assert_eq!(body["messages"][0]["role"], "system");
    assert_eq!(body["messages"][0]["content"], "prompt text");
}

#[tokio::test]
async fn test_openai_length_finish_is_reported() {
    let (base, _server) = serve(vec![sse_response(&["SELECT foretag"], "length")]).await;

    let stream = client(&base).stream_chat("prompt").await.unwrap();
    let assembled = aggregate(stream, &mut NoopStreamObserver, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(assembled.text, "SELECT foretag");
    assert!(!assembled.is_complete());
}

#[tokio::test]
async fn test_openai_error_status() {
    let (base, _server) = serve(vec![json_response(
        "401 Unauthorized",
        serde_json::json!({"error": {"message": "Incorrect API key provided"}}),
    )])
    .await;

    let result = client(&base).stream_chat("prompt").await;
    match result {
        Err(AskError::Llm(message)) => assert!(message.contains("Incorrect API key")),
        Err(other) => panic!("unexpected error {:?}", other),
        Ok(_) => panic!("expected an error"),
    }
}

#[tokio::test]
async fn test_bigquery_polls_until_complete() {
    let (base, server) = serve(vec![
        json_response(
            "200 OK",
            serde_json::json!({
                "jobComplete": false,
                "jobReference": {"projectId": "proj", "jobId": "job_42", "location": "EU"}
            }),
        ),
        json_response("200 OK", finished_query("job_42")),
    ])
    .await;

    let result = warehouse(&base)
        .execute("SELECT foretag, omsattning FROM `dnb_data.dnb_ab_falkenberg`", Some(100))
        .await
        .unwrap();

    assert_eq!(result.row_count(), 2);
    assert_eq!(result.total_rows, Some(2));
    assert!(!result.truncated);
    assert_eq!(result.data.column("omsattning").unwrap().dtype(), &DataType::Int64);
    assert_eq!(result.engine_metadata["job_id"], "job_42");
    assert_eq!(result.engine_metadata["total_bytes_processed"], "1024");

    let requests = server.await.unwrap();
    assert_eq!(requests[0].request_line, "POST /projects/proj/queries HTTP/1.1");
    assert!(requests[0].headers.to_lowercase().contains("authorization: bearer ya29.token"));
    let submitted: serde_json::Value = serde_json::from_str(&requests[0].body).unwrap();
    assert_eq!(submitted["useLegacySql"], false);
    assert_eq!(submitted["location"], "EU");
    assert_eq!(submitted["maxResults"], 100);

    assert!(requests[1].request_line.starts_with("GET /projects/proj/queries/job_42?"));
    assert!(requests[1].request_line.contains("location=EU"));
}

#[tokio::test]
async fn test_bigquery_row_cap_stops_paging() {
    let mut first_page = finished_query("job_7");
    first_page["totalRows"] = serde_json::json!("5000");
    first_page["pageToken"] = serde_json::json!("next-page");
    let (base, server) = serve(vec![json_response("200 OK", first_page)]).await;

    let result = warehouse(&base).execute("SELECT 1", Some(2)).await.unwrap();

    assert_eq!(result.row_count(), 2);
    assert!(result.truncated);
    assert_eq!(result.total_rows, Some(5000));
    assert_eq!(server.await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_bigquery_job_warnings_do_not_fail_the_query() {
    let mut page = finished_query("job_9");
    page["errors"] = serde_json::json!([
        {"reason": "invalidQuery", "message": "Column omsattning is deprecated"}
    ]);
    let (base, _server) = serve(vec![json_response("200 OK", page)]).await;

    let result = warehouse(&base).execute("SELECT foretag, omsattning FROM t", None).await.unwrap();

    assert_eq!(result.row_count(), 2);
    let warnings = result.engine_metadata["warnings"].as_array().unwrap();
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].as_str().unwrap().contains("deprecated"));
}

#[tokio::test]
async fn test_bigquery_error_message_is_surfaced() {
    let (base, _server) = serve(vec![json_response(
        "400 Bad Request",
        serde_json::json!({
            "error": {
                "code": 400,
                "message": "Unrecognized name: omsattningen at [1:8]",
                "status": "INVALID_ARGUMENT"
            }
        }),
    )])
    .await;

    let result = warehouse(&base).execute("SELECT omsattningen FROM t", None).await;
    match result {
        Err(AskError::Execution(message)) => {
            assert!(message.contains("Unrecognized name: omsattningen"));
        }
        other => panic!("unexpected result {:?}", other.map(|r| r.row_count())),
    }
}

#[tokio::test]
async fn test_pipeline_over_http() {
    let sql = "SELECT foretag, omsattning FROM `dnb_data.dnb_ab_falkenberg` ORDER BY omsattning DESC";
    let generation = wrap(sql);
    let (llm_base, llm_server) = serve(vec![
        sse_response(&[&generation[..10], &generation[10..]], "stop"),
        sse_response(&["Beta AB omsatte mest, ", "450 000 kr."], "stop"),
    ])
    .await;
    let (bq_base, bq_server) = serve(vec![json_response("200 OK", finished_query("job_1"))]).await;

    let pipeline = Pipeline::new(
        Arc::new(client(&llm_base)),
        QueryExecutor::new(Arc::new(warehouse(&bq_base))),
        Arc::new(SchemaDescription::default()),
    );
    let report = pipeline
        .run("Vem omsatte mest?", &NoopObserver, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.state(), RunState::Done);
    assert_eq!(report.sql.as_deref(), Some(sql));
    assert_eq!(report.table.as_ref().unwrap().row_count(), 2);
    assert_eq!(report.explanation.as_deref(), Some("Beta AB omsatte mest, 450 000 kr."));

    let llm_requests = llm_server.await.unwrap();
    assert_eq!(llm_requests.len(), 2);
    let analysis: serde_json::Value = serde_json::from_str(&llm_requests[1].body).unwrap();
    let analysis_prompt = analysis["messages"][0]["content"].as_str().unwrap();
    assert!(analysis_prompt.contains("| Beta AB"));
    assert!(analysis_prompt.contains(sql));

    let bq_requests = bq_server.await.unwrap();
    let submitted: serde_json::Value = serde_json::from_str(&bq_requests[0].body).unwrap();
    assert_eq!(submitted["query"], sql);
}
