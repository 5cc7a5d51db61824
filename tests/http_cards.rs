mod support;

use axum::http::{
    StatusCode,
    header::{CACHE_CONTROL, CONTENT_TYPE},
};
use social_cards::{
    application::{
        error::{INVALID_REQUEST_MESSAGE, RENDER_FAILED_MESSAGE},
        render::RenderError,
    },
    cache::encode_title,
    infra::http::X_CACHE,
};
use support::{FAKE_PNG, FakeEngine, body_bytes, get, harness};

fn card_uri(template: &str, title: &str) -> String {
    format!("/{template}/{}.png", encode_title(title))
}

#[tokio::test]
async fn miss_renders_then_hit_serves_from_store() {
    let harness = harness(FakeEngine::default());
    let uri = card_uri("card", "Hello world");

    let first = get(&harness.router, &uri).await;
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(first.headers()[CONTENT_TYPE], "image/png");
    assert_eq!(
        first.headers()[CACHE_CONTROL],
        "public, max-age=31536000, immutable"
    );
    assert_eq!(first.headers()[X_CACHE], "miss");
    assert_eq!(body_bytes(first).await.as_ref(), FAKE_PNG);
    assert!(harness.objects.contains("card/Hello%20world.png"));

    let second = get(&harness.router, &uri).await;
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(second.headers()[X_CACHE], "hit");
    assert_eq!(body_bytes(second).await.as_ref(), FAKE_PNG);

    assert_eq!(harness.engine.calls(), 1);
}

#[tokio::test]
async fn options_are_part_of_the_storage_key() {
    let harness = harness(FakeEngine::default());
    let uri = format!("{}?options=font_serif", card_uri("card", "Hello"));

    let response = get(&harness.router, &uri).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert!(harness.objects.contains("card/font%3Dserif/Hello.png"));
}

#[tokio::test]
async fn malformed_input_answers_invalid_request() {
    let harness = harness(FakeEngine::default());
    let bad_options = format!("{}?options=bad", card_uri("card", "Hello"));

    for uri in [
        bad_options.as_str(),
        "/card/SGVsbG8.jpg",
        "/card/%%%.png",
        "/only-one-segment",
        "/too/many/segments.png",
    ] {
        let response = get(&harness.router, uri).await;
        assert_eq!(
            response.status(),
            StatusCode::INTERNAL_SERVER_ERROR,
            "{uri}"
        );
        assert_eq!(body_bytes(response).await.as_ref(), INVALID_REQUEST_MESSAGE.as_bytes());
    }

    assert_eq!(harness.engine.calls(), 0);
    assert!(harness.objects.is_empty());
}

#[tokio::test]
async fn unknown_template_is_a_rejection() {
    let harness = harness(FakeEngine::failing(RenderError::TemplateNotFound {
        template: "nope".to_string(),
    }));

    let response = get(&harness.router, &card_uri("nope", "Hello")).await;

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body_bytes(response).await.as_ref(), INVALID_REQUEST_MESSAGE.as_bytes());
}

#[tokio::test]
async fn engine_failure_answers_render_failed_and_stores_nothing() {
    let harness = harness(FakeEngine::failing(RenderError::CaptureFailure {
        reason: "screenshot failed".to_string(),
    }));

    let response = get(&harness.router, &card_uri("card", "Hello")).await;

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(response.headers().get(X_CACHE).is_none());
    assert_eq!(body_bytes(response).await.as_ref(), RENDER_FAILED_MESSAGE.as_bytes());
    assert!(harness.objects.is_empty());
}

#[tokio::test]
async fn health_endpoint_returns_no_content() {
    let harness = harness(FakeEngine::default());

    let response = get(&harness.router, "/_health").await;

    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(harness.engine.calls(), 0);
}
