//! Slack 入站路由

use std::sync::Arc;

use axum::{Router, routing::post};

use super::dedupe::EventDeduper;
use super::handlers::{handle_command, handle_events};
use super::signature::SignatureVerifier;
use crate::worker::WorkerPool;

/// Slack 路由状态
#[derive(Clone)]
pub struct SlackState {
    pub verifier: SignatureVerifier,
    pub deduper: Arc<EventDeduper>,
    pub pool: Arc<WorkerPool>,
}

/// 创建 Slack 路由
///
/// # 端点
/// - `POST /events` - Events API（含 URL 验证）
/// - `POST /commands` - Slash command
///
/// # 认证
/// 所有请求需通过 Slack 签名校验（`X-Slack-Signature` + `X-Slack-Request-Timestamp`）
pub fn create_slack_router(state: SlackState) -> Router {
    Router::new()
        .route("/events", post(handle_events))
        .route("/commands", post(handle_command))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::unix_now_secs;
    use crate::dispatch::tests::ScriptedAi;
    use crate::worker::tests::Harness;
    use axum::{
        body::{Body, to_bytes},
        http::{Request, StatusCode},
    };
    use std::time::Duration;
    use tower::ServiceExt;

    const SECRET: &str = "8f742231b10e8888abcd99yyyzzz85a5";

    fn setup(ai: ScriptedAi) -> (Harness, Router, SignatureVerifier) {
        let h = Harness::new(ai, 20);
        let verifier = SignatureVerifier::new(SECRET, Duration::from_secs(300));
        let router = create_slack_router(SlackState {
            verifier: verifier.clone(),
            deduper: Arc::new(EventDeduper::new(Duration::from_secs(600))),
            pool: h.pool.clone(),
        });
        (h, router, verifier)
    }

    fn signed(
        verifier: &SignatureVerifier,
        uri: &str,
        content_type: &str,
        body: &str,
    ) -> Request<Body> {
        let ts = unix_now_secs().to_string();
        let signature = verifier.sign(&ts, body.as_bytes());
        Request::post(uri)
            .header("content-type", content_type)
            .header("x-slack-request-timestamp", ts)
            .header("x-slack-signature", signature)
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn mention(event_id: &str) -> String {
        serde_json::json!({
            "type": "event_callback",
            "event_id": event_id,
            "event": {
                "type": "app_mention",
                "user": "U1",
                "text": "<@UBOT> explain ```print(1)```",
                "channel": "C1",
                "ts": "1700000000.000100"
            }
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_url_verification_echoes_challenge() {
        let (_h, router, verifier) = setup(ScriptedAi::replying("unused"));
        let body = r#"{"type":"url_verification","challenge":"abc123","token":"t"}"#;
        let response = router
            .oneshot(signed(&verifier, "/events", "application/json", body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await, serde_json::json!({"challenge": "abc123"}));
    }

    #[tokio::test]
    async fn test_bad_signature_has_no_side_effects() {
        let (h, router, _) = setup(ScriptedAi::replying("answer"));
        let forged = SignatureVerifier::new("wrong-secret", Duration::from_secs(300));
        let response = router
            .clone()
            .oneshot(signed(&forged, "/events", "application/json", &mention("Ev1")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(response).await["error"]["type"], "authentication_error");

        let unsigned = Request::post("/commands")
            .header("content-type", "application/x-www-form-urlencoded")
            .body(Body::from("command=%2Fanalyze&text=python+x&user_id=U1&channel_id=C1"))
            .unwrap();
        let response = router.oneshot(unsigned).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        h.drain().await;
        assert_eq!(h.ai.calls(), 0);
        assert_eq!(h.chat.total(), 0);
        assert_eq!(h.warehouse.total(), 0);
    }

    #[tokio::test]
    async fn test_stale_timestamp_rejected() {
        let (h, router, verifier) = setup(ScriptedAi::replying("answer"));
        let body = mention("Ev1");
        let ts = (unix_now_secs() - 600).to_string();
        let request = Request::post("/events")
            .header("x-slack-request-timestamp", ts.as_str())
            .header("x-slack-signature", verifier.sign(&ts, body.as_bytes()))
            .body(Body::from(body))
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        h.drain().await;
        assert_eq!(h.ai.calls(), 0);
    }

    #[tokio::test]
    async fn test_mention_accepted_once() {
        let (h, router, verifier) = setup(ScriptedAi::replying("It prints 1."));
        let body = mention("Ev42");

        let first = router
            .clone()
            .oneshot(signed(&verifier, "/events", "application/json", &body))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        let ack = json_body(first).await;
        assert_eq!(ack["status"], "accepted");
        assert_eq!(ack["message_id"], "Ev42");

        let retry = router
            .oneshot(signed(&verifier, "/events", "application/json", &body))
            .await
            .unwrap();
        assert_eq!(json_body(retry).await["status"], "duplicate");

        h.drain().await;
        assert_eq!(h.ai.calls(), 1);
        let prompt = &h.ai.requests.lock()[0].messages[0].content;
        assert!(!prompt.contains("<@UBOT>"));
        let posts = h.chat.posts.lock().clone();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].1, "It prints 1.");
        assert_eq!(posts[0].2.as_deref(), Some("1700000000.000100"));
    }

    #[tokio::test]
    async fn test_full_queue_rejects_then_accepts_retry() {
        let (ai, gate) = ScriptedAi::gated("done");
        let h = Harness::with_pool(ai, 20, 1, 1, None);
        let verifier = SignatureVerifier::new(SECRET, Duration::from_secs(300));
        let router = create_slack_router(SlackState {
            verifier: verifier.clone(),
            deduper: Arc::new(EventDeduper::new(Duration::from_secs(600))),
            pool: h.pool.clone(),
        });

        // 一个任务阻塞在 worker 中，分发循环和队列最多再容纳两个
        let mut accepted = 0;
        let mut rejected = None;
        for i in 0..5 {
            let id = format!("EvFull{}", i);
            let response = router
                .clone()
                .oneshot(signed(&verifier, "/events", "application/json", &mention(&id)))
                .await
                .unwrap();
            if response.status() == StatusCode::SERVICE_UNAVAILABLE {
                assert_eq!(json_body(response).await["error"]["type"], "service_unavailable");
                rejected = Some(id);
                break;
            }
            assert_eq!(json_body(response).await["status"], "accepted");
            accepted += 1;
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let rejected = rejected.expect("queue never filled");
        assert!(accepted >= 1);

        gate.add_permits(100);
        for _ in 0..200 {
            if h.pool.queue_depth() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let retry = router
            .oneshot(signed(&verifier, "/events", "application/json", &mention(&rejected)))
            .await
            .unwrap();
        assert_eq!(retry.status(), StatusCode::OK);
        assert_eq!(json_body(retry).await["status"], "accepted");

        h.drain().await;
        assert_eq!(h.ai.calls(), accepted + 1);
    }

    #[tokio::test]
    async fn test_bot_message_ignored() {
        let (h, router, verifier) = setup(ScriptedAi::replying("unused"));
        let body = serde_json::json!({
            "type": "event_callback",
            "event_id": "Ev7",
            "event": {"type": "message", "channel_type": "im", "bot_id": "B1", "text": "hi", "channel": "D1"}
        })
        .to_string();
        let response = router
            .oneshot(signed(&verifier, "/events", "application/json", &body))
            .await
            .unwrap();
        assert_eq!(json_body(response).await["status"], "ignored");
        h.drain().await;
        assert_eq!(h.chat.total(), 0);
    }

    #[tokio::test]
    async fn test_slash_command_acknowledged_then_answered() {
        let (h, router, verifier) = setup(ScriptedAi::replying("Looks good."));
        let form = "command=%2Freview&text=python+def+f%28%29%3A+pass&user_id=U9&channel_id=C9&response_url=https%3A%2F%2Fhooks.slack.test%2Fx";
        let response = router
            .oneshot(signed(
                &verifier,
                "/commands",
                "application/x-www-form-urlencoded",
                form,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let ack = json_body(response).await;
        assert_eq!(ack["response_type"], "ephemeral");

        h.drain().await;
        assert_eq!(h.ai.calls(), 1);
        let responses = h.chat.responses.lock().clone();
        assert_eq!(responses, vec![("https://hooks.slack.test/x".to_string(), "Looks good.".to_string())]);
    }
}
