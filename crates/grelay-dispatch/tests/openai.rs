mod common;

use std::sync::Arc;

use bytes::Bytes;
use grelay_dispatch::{Monitor, Pipeline, Relay, RelayConfig, RelayRequest, build_registry};
use grelay_relay_core::{
    BillingTasks, CallerRequest, Channel, CollectWriter, CredentialCache, FormPart, MemoryBalance,
    MemoryChannels, MemoryPricing, MemoryRecorder, RelayMode, Usage, response_channel,
};
use http::{HeaderMap, Method, StatusCode};
use serde_json::json;
use wiremock::matchers::{body_partial_json, body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::{GROUP, MODEL, channel, chat_request, dec, hello, price};

struct Gateway {
    relay: Relay,
    balance: MemoryBalance,
    recorder: Arc<MemoryRecorder>,
    tasks: BillingTasks,
}

fn gateway(channel: Channel) -> Gateway {
    let balance = MemoryBalance::new().with_group(GROUP, dec("1.00"));
    let pricing = MemoryPricing::default()
        .with_price(MODEL, price())
        .with_price("whisper-1", price());
    let recorder = Arc::new(MemoryRecorder::new());
    let tasks = BillingTasks::new();
    let config = RelayConfig::default();
    let monitor = Arc::new(Monitor::new(config.monitor.clone()));
    let pipeline = Pipeline::new(
        build_registry(CredentialCache::default()),
        Arc::new(balance.clone()),
        Arc::new(pricing),
        recorder.clone(),
        tasks.clone(),
        Arc::new(config),
    );
    Gateway {
        relay: Relay::new(
            Arc::new(pipeline),
            Arc::new(MemoryChannels::new([channel])),
            monitor,
        ),
        balance,
        recorder,
        tasks,
    }
}

fn upstream_channel(server: &MockServer) -> Channel {
    let mut channel = channel(1);
    channel.base_url = server.uri();
    channel
        .model_mapping
        .insert(MODEL.to_string(), "gpt-3.5-turbo-0125".to_string());
    channel
}

#[tokio::test]
async fn chat_completion_round_trip() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .and(body_partial_json(json!({"model": "gpt-3.5-turbo-0125"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "chatcmpl-1",
            "object": "chat.completion",
            "model": "gpt-3.5-turbo-0125",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "hi"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 100, "completion_tokens": 40, "total_tokens": 140}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let gateway = gateway(upstream_channel(&server));
    let mut writer = CollectWriter::new();
    let usage = gateway.relay.relay(hello(50), &mut writer).await.unwrap();
    gateway.tasks.drain().await;

    assert_eq!(usage, Usage::new(100, 40));
    let body: serde_json::Value = serde_json::from_slice(&writer.body).unwrap();
    assert_eq!(body["model"], MODEL);
    assert_eq!(body["choices"][0]["message"]["content"], "hi");
    assert_eq!(gateway.recorder.records()[0].amount, dec("0.0036"));
    assert_eq!(gateway.balance.balance(GROUP), Some(dec("0.9964")));
}

#[tokio::test]
async fn streamed_chat_is_relayed_with_usage() {
    let server = MockServer::start().await;
    let events = [
        json!({"id": "c1", "model": "gpt-3.5-turbo-0125", "choices": [{"index": 0, "delta": {"content": "Hel"}}]}),
        json!({"id": "c1", "model": "gpt-3.5-turbo-0125", "choices": [{"index": 0, "delta": {"content": "lo"}}]}),
        json!({"id": "c1", "model": "gpt-3.5-turbo-0125", "choices": [], "usage": {"prompt_tokens": 12, "completion_tokens": 2, "total_tokens": 14}}),
    ];
    let mut sse = String::new();
    for event in &events {
        sse.push_str(&format!("data: {event}\n\n"));
    }
    sse.push_str("data: [DONE]\n\n");
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(json!({"stream": true, "stream_options": {"include_usage": true}})))
        .respond_with(ResponseTemplate::new(200).set_body_raw(sse, "text/event-stream"))
        .expect(1)
        .mount(&server)
        .await;

    let gateway = gateway(upstream_channel(&server));
    let request = chat_request(json!({
        "model": MODEL,
        "stream": true,
        "messages": [{"role": "user", "content": "hello"}]
    }));
    let mut writer = CollectWriter::new();
    let usage = gateway.relay.relay(request, &mut writer).await.unwrap();
    gateway.tasks.drain().await;

    assert_eq!(usage, Usage::new(12, 2));
    let body = String::from_utf8(writer.body.to_vec()).unwrap();
    assert!(body.ends_with("data: [DONE]\n\n"));
    assert_eq!(body.matches("[DONE]").count(), 1);
    assert!(body.contains(&format!("\"model\":\"{MODEL}\"")));
    assert!(!body.contains("gpt-3.5-turbo-0125"));
    let head = writer.head.as_ref().unwrap();
    assert_eq!(head.headers["content-type"], "text/event-stream");
    assert_eq!(gateway.recorder.records().len(), 1);
}

#[tokio::test]
async fn upstream_error_body_is_surfaced() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(429).set_body_json(json!({
            "error": {"message": "slow down", "type": "rate_limit_error", "code": "rate_limited"}
        })))
        .mount(&server)
        .await;

    let gateway = gateway(upstream_channel(&server));
    let mut writer = CollectWriter::new();
    let err = gateway.relay.relay(hello(10), &mut writer).await.unwrap_err();
    gateway.tasks.drain().await;

    assert_eq!(err.status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(err.code, "rate_limited");
    assert_eq!(err.error_type, "rate_limit_error");
    assert_eq!(writer.status(), Some(StatusCode::TOO_MANY_REQUESTS));
    let records = gateway.recorder.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].code, 429);
}

#[tokio::test]
async fn transcription_form_is_forwarded() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/audio/transcriptions"))
        .and(body_string_contains("name=\"model\"\r\n\r\nwhisper-1\r\n"))
        .and(body_string_contains("filename=\"a.wav\""))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"text": "hello world"})))
        .expect(1)
        .mount(&server)
        .await;

    let mut whisper = channel(1);
    whisper.base_url = format!("{}/v1", server.uri());
    whisper.models = vec!["whisper-1".to_string()];
    let gateway = gateway(whisper);
    let caller = CallerRequest::new(
        Method::POST,
        "/v1/audio/transcriptions",
        HeaderMap::new(),
        Bytes::new(),
    )
    .with_form(vec![
        FormPart::text("model", "whisper-1"),
        FormPart {
            name: "file".to_string(),
            file_name: Some("a.wav".to_string()),
            content_type: Some("audio/wav".to_string()),
            data: Bytes::from_static(b"RIFF0000WAVE"),
        },
    ]);
    let request = RelayRequest {
        mode: RelayMode::AudioTranscription,
        model: "whisper-1".to_string(),
        caller,
        ..chat_request(json!({}))
    };

    let mut writer = CollectWriter::new();
    let usage = gateway.relay.relay(request, &mut writer).await.unwrap();
    gateway.tasks.drain().await;

    assert_eq!(usage.prompt_tokens, 0);
    assert!(usage.completion_tokens > 0);
    let body: serde_json::Value = serde_json::from_slice(&writer.body).unwrap();
    assert_eq!(body["text"], "hello world");
}

#[tokio::test]
async fn caller_leaving_mid_stream_still_bills_full_usage() {
    let server = MockServer::start().await;
    let mut sse = String::new();
    for piece in ["Hel", "lo", " the", "re"] {
        let event = json!({"id": "c1", "model": "gpt-3.5-turbo-0125", "choices": [{"index": 0, "delta": {"content": piece}}]});
        sse.push_str(&format!("data: {event}\n\n"));
    }
    let last = json!({"id": "c1", "choices": [], "usage": {"prompt_tokens": 30, "completion_tokens": 4, "total_tokens": 34}});
    sse.push_str(&format!("data: {last}\n\ndata: [DONE]\n\n"));
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(sse, "text/event-stream"))
        .expect(1)
        .mount(&server)
        .await;

    let Gateway {
        relay,
        balance,
        recorder,
        tasks,
    } = gateway(upstream_channel(&server));
    let request = chat_request(json!({
        "model": MODEL,
        "stream": true,
        "messages": [{"role": "user", "content": "hello"}]
    }));
    let (mut writer, mut receiver) = response_channel(1);
    let relaying = tokio::spawn(async move { relay.relay(request, &mut writer).await });

    let head = (&mut receiver.head).await.unwrap();
    assert_eq!(head.status, StatusCode::OK);
    assert!(receiver.body.recv().await.is_some());
    drop(receiver);

    let usage = relaying.await.unwrap().unwrap();
    tasks.drain().await;

    assert_eq!(usage, Usage::new(30, 4));
    let records = recorder.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].code, 200);
    assert_eq!(records[0].prompt_tokens, 30);
    assert_eq!(records[0].completion_tokens, 4);
    assert_eq!(records[0].amount, dec("0.00076"));
    assert_eq!(balance.balance(GROUP), Some(dec("0.99924")));
}
