use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Redirect, Response},
    routing,
};
use expiring_short::{
    api, config,
    url_repo::OriginalUrl,
    url_service::{ResolveError, ShortenError, UrlCreationStatus, url_service_capsule},
};
use rearch::Container;
use tokio::net::TcpListener;
use tracing::{error, info, instrument};
use uuid::Uuid;

const NO_CACHE: &str = "no-cache, no-store, must-revalidate";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let container = config::init_container().await?;

    let app = Router::new()
        .route(
            "/api/shorten",
            routing::post(shorten_url).get(resolve_url),
        )
        .route("/{short_code}", routing::get(redirect_to_url))
        .layer(axum::middleware::map_response(disable_caching))
        .with_state(container.clone());

    let listener = TcpListener::bind(container.read(config::addr_capsule)).await?;
    info!(addr = %listener.local_addr()?, "Started listening on TCP");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Closing database connection pool");
    container.read(config::db_conn_capsule).close().await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(?err, "Failed to listen for shutdown signal");
    }
    info!("Shutdown signal received");
}

async fn disable_caching(mut response: Response) -> Response {
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static(NO_CACHE));
    response
}

#[instrument(skip(container, headers))]
async fn shorten_url(
    State(container): State<Container>,
    headers: HeaderMap,
    Json(api::ShortenPayload { original_url }): Json<api::ShortenPayload>,
) -> impl IntoResponse {
    container
        .read(url_service_capsule)
        .shorten(&original_url)
        .await
        .map(|(shortened, creation_status)| {
            (
                match creation_status {
                    UrlCreationStatus::NewlyCreated => StatusCode::CREATED,
                    UrlCreationStatus::AlreadyExists => StatusCode::OK,
                },
                Json(api::ShortenedUrl {
                    short_url: public_short_url(&headers, &shortened.short_code),
                    short_code: shortened.short_code,
                    expires_at: shortened.expires_at,
                }),
            )
        })
        .map_err(|error: ShortenError| {
            let err_uuid = Uuid::new_v4();
            match error {
                ShortenError::InvalidInput(_) => {
                    info!(?err_uuid, ?error, "User submitted a bad request");
                    error_response(StatusCode::BAD_REQUEST, error.to_string(), err_uuid)
                }
                ShortenError::CapacityExhausted { .. } => {
                    error!(?err_uuid, ?error, "Short code space is exhausted");
                    error_response(
                        StatusCode::SERVICE_UNAVAILABLE,
                        "No short code available, try again later".to_owned(),
                        err_uuid,
                    )
                }
                ShortenError::StorageFailure(_) => {
                    error!(?err_uuid, ?error, "Encountered an error during a request");
                    error_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "Internal server error".to_owned(),
                        err_uuid,
                    )
                }
            }
        })
}

#[instrument(skip(container))]
async fn resolve_url(
    State(container): State<Container>,
    Query(api::ResolveQuery { short_url }): Query<api::ResolveQuery>,
) -> impl IntoResponse {
    container
        .read(url_service_capsule)
        .resolve(&short_url)
        .await
        .map(|resolved| {
            Json(api::ResolvedUrl {
                original_url: resolved.original_url,
                expires_at: resolved.expires_at,
            })
        })
        .map_err(resolve_error_response)
}

#[instrument(skip(container))]
async fn redirect_to_url(
    State(container): State<Container>,
    Path(short_code): Path<String>,
) -> impl IntoResponse {
    container
        .read(url_service_capsule)
        .resolve(&short_code)
        .await
        .map(|resolved| {
            Redirect::temporary(&OriginalUrl::absolute(&resolved.original_url))
        })
        .map_err(resolve_error_response)
}

fn resolve_error_response(error: ResolveError) -> (StatusCode, Json<api::Error>) {
    let err_uuid = Uuid::new_v4();
    match error {
        ResolveError::InvalidInput(_) => {
            info!(?err_uuid, ?error, "User submitted a bad request");
            error_response(StatusCode::BAD_REQUEST, error.to_string(), err_uuid)
        }
        ResolveError::NotFound => {
            error_response(StatusCode::NOT_FOUND, error.to_string(), err_uuid)
        }
        ResolveError::StorageFailure(_) => {
            error!(?err_uuid, ?error, "Encountered an error during a request");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_owned(),
                err_uuid,
            )
        }
    }
}

fn error_response(
    status: StatusCode,
    error: String,
    err_uuid: Uuid,
) -> (StatusCode, Json<api::Error>) {
    (
        status,
        Json(api::Error {
            error,
            error_id: err_uuid.to_string(),
        }),
    )
}

fn public_short_url(headers: &HeaderMap, short_code: &str) -> String {
    let scheme = headers
        .get("x-forwarded-proto")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("http");
    let host = headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("localhost");
    format!("{scheme}://{host}/{short_code}")
}
