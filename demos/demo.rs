use axum::{
    body::Body,
    extract::Path,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use logged_http::*;
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use tokio::{net::TcpListener, time::sleep};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DECLARATIONS: &str = r#"
name = "ArticleResource"

[logged]

[[mappings]]
kind = "header"
field_key = "case-id"
param_names = ["X-Case-ID"]

[[operations]]
name = "create"

[[operations.logged.body]]
modes = ["log", "context"]
limit = 4096
filters = ["secret"]

[[operations]]
name = "get"

[[operations.mappings]]
kind = "path"
field_key = "article-id"
param_names = ["id"]

[[operations]]
name = "stream"

[[operations.logged.body]]
modes = ["log"]
limit = 32
targets = ["response"]
"#;

async fn create_handler(Json(article): Json<Value>) -> impl IntoResponse {
    sleep(Duration::from_millis(50)).await; // Simulate some work
    Json(article)
}

async fn get_handler(Path(id): Path<u32>) -> impl IntoResponse {
    format!("Article {id}")
}

async fn streaming_handler() -> impl IntoResponse {
    use futures::stream;
    use tokio::time::interval;

    let stream = stream::unfold(0u32, |count| async move {
        if count >= 5 {
            None
        } else {
            let mut interval = interval(Duration::from_millis(200));
            interval.tick().await;
            Some((
                Ok::<_, std::convert::Infallible>(Bytes::from(format!("chunk-{count}\n"))),
                count + 1,
            ))
        }
    });

    Response::builder()
        .header("content-type", "text/plain")
        .body(Body::from_stream(stream))
        .map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,logged_http=debug")),
        )
        .init();

    info!("Starting logged-http demo server");

    let filters = FilterRegistry::new()
        .register("secret", || {
            Ok(Arc::new(FieldMask::new(["secret-code", "password"])?) as Arc<dyn BodyFilter>)
        })
        .register("card", || {
            Ok(Arc::new(PatternMask::new(r"\d{4}-\d{4}-\d{4}-(\d{4})", "****-$1")?) as Arc<dyn BodyFilter>)
        });

    let logger = Arc::new(
        RequestLogger::builder()
            .filters(filters)
            .extra_field("user-agent")
            .enricher(|request: &RequestView<'_>, fields: &mut ContextFields| {
                if let Some(agent) = request.headers.get("user-agent").and_then(|v| v.to_str().ok()) {
                    fields.put("user-agent", agent);
                }
            })
            .build(),
    );
    let articles = ResourceDeclarations::from_toml_str(DECLARATIONS)?;
    let layer = |operation: &str| LoggedLayer::for_operation(logger.clone(), &articles, operation);

    let app = Router::new()
        .route("/articles", post(create_handler).layer(layer("create")))
        .route("/articles/{id}", get(get_handler).layer(layer("get")))
        .route("/streaming", get(streaming_handler).layer(layer("stream")))
        .layer(TraceLayer::new_for_http());

    info!("Demo server endpoints:");
    info!("  POST /articles       - Echo an article, secret-code masked in logs");
    info!("  GET  /articles/{{id}}  - Fetch an article, id published as article-id");
    info!("  GET  /streaming      - Streaming response, first 32 bytes logged");
    info!("");
    info!("Try these commands:");
    info!(r#"  curl -X POST -H 'content-type: application/json' -d '{{"content":"My Article","secret-code":"1234-ABCD"}}' http://localhost:3000/articles"#);
    info!("  curl -H 'X-Case-ID: C-1' http://localhost:3000/articles/7");
    info!("  curl http://localhost:3000/streaming");

    let listener = TcpListener::bind("0.0.0.0:3000").await?;
    info!("Demo server listening on http://localhost:3000");

    axum::serve(listener, app).await?;

    Ok(())
}
