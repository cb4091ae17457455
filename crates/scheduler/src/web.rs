use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{DefaultBodyLimit, Multipart, Path, Request, State},
    http::{header, StatusCode},
    middleware::{from_fn, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use common::FindDeaRequest;

use crate::cache::ArtifactCache;
use crate::registry::DeaPool;
use crate::store::ObjectStore;

/// The three artifact classes served under `/scheduler`. Droplets and
/// packages are mirrored to the blob store; buildpack caches are
/// local-only (rebuild-cheap, host-affinity-biased).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactClass {
    Droplet,
    Package,
    BuildpackCache,
}

impl ArtifactClass {
    fn label(self) -> &'static str {
        match self {
            ArtifactClass::Droplet => "droplet",
            ArtifactClass::Package => "package",
            ArtifactClass::BuildpackCache => "buildpack cache",
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<DeaPool>,
    pub droplets: Arc<ArtifactCache>,
    pub packages: Arc<ArtifactCache>,
    pub buildpacks: Arc<ArtifactCache>,
    pub droplet_store: Arc<dyn ObjectStore>,
    pub package_store: Arc<dyn ObjectStore>,
}

impl AppState {
    fn cache_for(&self, class: ArtifactClass) -> &Arc<ArtifactCache> {
        match class {
            ArtifactClass::Droplet => &self.droplets,
            ArtifactClass::Package => &self.packages,
            ArtifactClass::BuildpackCache => &self.buildpacks,
        }
    }

    fn store_for(&self, class: ArtifactClass) -> Option<&Arc<dyn ObjectStore>> {
        match class {
            ArtifactClass::Droplet => Some(&self.droplet_store),
            ArtifactClass::Package => Some(&self.package_store),
            ArtifactClass::BuildpackCache => None,
        }
    }
}

pub fn create_app(state: AppState, max_upload_mb: u64) -> Router {
    let body_limit = if max_upload_mb == 0 {
        DefaultBodyLimit::disable()
    } else {
        DefaultBodyLimit::max((max_upload_mb * 1024 * 1024) as usize)
    };

    Router::new()
        .route("/scheduler/health", get(health))
        .route("/scheduler/deapool", get(dea_pool_dump))
        .route("/scheduler/droplets", get(droplets_dump))
        .route("/scheduler/packages", get(packages_dump))
        .route("/scheduler/buildpackcache", get(buildpacks_dump))
        .route("/scheduler/droplet/:guid/download", get(download_droplet))
        .route("/scheduler/droplet/:guid/upload", post(upload_droplet))
        .route("/scheduler/packages/:guid/download", get(download_package))
        .route("/scheduler/packages/:guid/upload", post(upload_package))
        .route("/scheduler/buildpackCache/:guid/download", get(download_buildpack))
        .route("/scheduler/buildpackCache/:guid/upload", post(upload_buildpack))
        .route(
            "/scheduler/:appid/:memory/:disk/:stacks/:owner/:other/:docker/finddea",
            get(find_dea),
        )
        .layer(
            ServiceBuilder::new()
                .layer(from_fn(log_request))
                .layer(CorsLayer::permissive())
                .layer(body_limit),
        )
        .with_state(state)
}

async fn log_request(req: Request, next: Next) -> Response {
    info!(method = %req.method(), uri = %req.uri(), "http request");
    next.run(req).await
}

#[derive(Serialize)]
struct HealthResponse {
    #[serde(rename = "Status")]
    status: &'static str,
}

async fn health() -> impl IntoResponse {
    Json(HealthResponse { status: "ok" })
}

async fn dea_pool_dump(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.pool.dump())
}

async fn droplets_dump(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.droplets.snapshot())
}

async fn packages_dump(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.packages.snapshot())
}

async fn buildpacks_dump(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.buildpacks.snapshot())
}

async fn upload_droplet(
    State(state): State<AppState>,
    Path(guid): Path<String>,
    multipart: Multipart,
) -> Response {
    upload_artifact(state, ArtifactClass::Droplet, guid, multipart).await
}

async fn upload_package(
    State(state): State<AppState>,
    Path(guid): Path<String>,
    multipart: Multipart,
) -> Response {
    upload_artifact(state, ArtifactClass::Package, guid, multipart).await
}

async fn upload_buildpack(
    State(state): State<AppState>,
    Path(guid): Path<String>,
    multipart: Multipart,
) -> Response {
    upload_artifact(state, ArtifactClass::BuildpackCache, guid, multipart).await
}

async fn download_droplet(State(state): State<AppState>, Path(guid): Path<String>) -> Response {
    download_artifact(state, ArtifactClass::Droplet, guid).await
}

async fn download_package(State(state): State<AppState>, Path(guid): Path<String>) -> Response {
    download_artifact(state, ArtifactClass::Package, guid).await
}

async fn download_buildpack(State(state): State<AppState>, Path(guid): Path<String>) -> Response {
    download_artifact(state, ArtifactClass::BuildpackCache, guid).await
}

/// Multipart ingest: every part's bytes are appended to the target file
/// in arrival order; part names and boundaries carry no meaning. The
/// write is replace-only and the blob store must acknowledge before the
/// local copy becomes authoritative.
async fn upload_artifact(
    state: AppState,
    class: ArtifactClass,
    guid: String,
    mut multipart: Multipart,
) -> Response {
    if guid.chars().count() < 4 {
        warn!(class = class.label(), guid = %guid, "upload rejected: invalid guid");
        return (StatusCode::BAD_REQUEST, "invalid guid").into_response();
    }
    info!(class = class.label(), guid = %guid, "upload started");

    let cache = state.cache_for(class);
    let path = match cache.ensure_path(&guid) {
        Ok(path) => path,
        Err(e) => {
            warn!(class = class.label(), guid = %guid, error = %e, "cannot prepare cache path");
            return (StatusCode::BAD_REQUEST, "cannot prepare cache path").into_response();
        }
    };

    // Replace-only: a previous upload for this guid is deleted first.
    match tokio::fs::remove_file(&path).await {
        Ok(()) => info!(class = class.label(), guid = %guid, "existing cache file replaced"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            warn!(class = class.label(), guid = %guid, error = %e, "cannot replace cache file");
            return (StatusCode::BAD_REQUEST, "cannot replace cache file").into_response();
        }
    }

    let mut open_options = tokio::fs::OpenOptions::new();
    open_options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    open_options.mode(0o644);
    let mut file = match open_options.open(&path).await {
        Ok(file) => file,
        Err(e) => {
            warn!(class = class.label(), guid = %guid, error = %e, "cannot create cache file");
            return (StatusCode::BAD_REQUEST, "cannot create cache file").into_response();
        }
    };

    loop {
        let mut field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => {
                warn!(class = class.label(), guid = %guid, error = %e, "multipart read failed");
                return (StatusCode::BAD_REQUEST, "multipart read failed").into_response();
            }
        };
        loop {
            match field.chunk().await {
                Ok(Some(chunk)) => {
                    if let Err(e) = file.write_all(&chunk).await {
                        warn!(class = class.label(), guid = %guid, error = %e, "cache write failed");
                        return (StatusCode::BAD_REQUEST, "cache write failed").into_response();
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(class = class.label(), guid = %guid, error = %e, "multipart read failed");
                    return (StatusCode::BAD_REQUEST, "multipart read failed").into_response();
                }
            }
        }
    }

    if let Err(e) = file.shutdown().await {
        warn!(class = class.label(), guid = %guid, error = %e, "closing cache file failed");
        return (StatusCode::BAD_REQUEST, "closing cache file failed").into_response();
    }
    drop(file);

    // Droplets and packages are only authoritative once the remote copy
    // exists; a failed mirror rolls the local file back.
    if let Some(store) = state.store_for(class) {
        if let Err(e) = store.put(&guid, &path).await {
            warn!(class = class.label(), guid = %guid, error = %e, "blob store upload failed, dropping local file");
            let _ = tokio::fs::remove_file(&path).await;
            return (StatusCode::BAD_REQUEST, "blob store upload failed").into_response();
        }
    }

    cache.register(&guid, path);
    info!(class = class.label(), guid = %guid, "upload complete");
    StatusCode::OK.into_response()
}

/// Serve an artifact: index hit streams from disk; a cold index entry is
/// repaired from the canonical path; droplets and packages fall through
/// to the blob store, teeing the remote body to the client and the disk.
async fn download_artifact(state: AppState, class: ArtifactClass, guid: String) -> Response {
    if guid.chars().count() < 4 {
        warn!(class = class.label(), guid = %guid, "download rejected: invalid guid");
        return (StatusCode::BAD_REQUEST, "invalid guid").into_response();
    }
    info!(class = class.label(), guid = %guid, "download started");

    let cache = state.cache_for(class).clone();
    if let Some(path) = cache.lookup(&guid) {
        return stream_file(&cache, &guid, path).await;
    }

    // Index misses may still be on disk (restart wiped the index).
    let path = match cache.canonical_path(&guid) {
        Ok(path) => path,
        Err(e) => {
            warn!(class = class.label(), guid = %guid, error = %e, "cannot derive cache path");
            return (StatusCode::BAD_REQUEST, "invalid guid").into_response();
        }
    };
    if tokio::fs::try_exists(&path).await.unwrap_or(false) {
        info!(class = class.label(), guid = %guid, "repaired index entry from disk");
        cache.register(&guid, path.clone());
        return stream_file(&cache, &guid, path).await;
    }

    let Some(store) = state.store_for(class) else {
        info!(class = class.label(), guid = %guid, "not cached and class has no remote source");
        return (StatusCode::BAD_REQUEST, "artifact not cached").into_response();
    };

    let remote = match store.get(&guid).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(class = class.label(), guid = %guid, error = %e, "blob store download failed");
            return (StatusCode::BAD_REQUEST, "blob store download failed").into_response();
        }
    };

    tee_remote_to_client(cache, class, guid, path, remote).await
}

async fn stream_file(cache: &Arc<ArtifactCache>, guid: &str, path: PathBuf) -> Response {
    let file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(e) => {
            warn!(guid = %guid, path = %path.display(), error = %e, "cached file unreadable");
            cache.unregister(guid);
            return (StatusCode::BAD_REQUEST, "cached file unreadable").into_response();
        }
    };
    let length = file.metadata().await.ok().map(|m| m.len());

    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream");
    if let Some(length) = length {
        response = response.header(header::CONTENT_LENGTH, length);
    }
    match response.body(Body::from_stream(ReaderStream::new(file))) {
        Ok(response) => response,
        Err(e) => {
            warn!(guid = %guid, error = %e, "building download response failed");
            (StatusCode::BAD_REQUEST, "download failed").into_response()
        }
    }
}

/// Classic tee: one bounded read loop feeds both the HTTP response and a
/// fresh cache file. The file is provisional until the remote stream
/// finishes cleanly; on any sink or source error the partial file is left
/// for the next sweep and the entry is never indexed.
async fn tee_remote_to_client(
    cache: Arc<ArtifactCache>,
    class: ArtifactClass,
    guid: String,
    path: PathBuf,
    mut remote: crate::store::ByteStream,
) -> Response {
    let mut open_options = tokio::fs::OpenOptions::new();
    open_options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    open_options.mode(0o644);
    let mut file = match open_options.open(&path).await {
        Ok(file) => file,
        Err(e) => {
            warn!(class = class.label(), guid = %guid, error = %e, "cannot create cache file");
            return (StatusCode::BAD_REQUEST, "cannot create cache file").into_response();
        }
    };

    let (mut tx, rx) = futures::channel::mpsc::channel::<std::io::Result<bytes::Bytes>>(16);
    tokio::spawn(async move {
        let mut clean = true;
        while let Some(next) = remote.next().await {
            match next {
                Ok(chunk) => {
                    if let Err(e) = file.write_all(&chunk).await {
                        warn!(class = class.label(), guid = %guid, error = %e, "cache write failed mid-stream");
                        clean = false;
                        break;
                    }
                    if tx.send(Ok(chunk)).await.is_err() {
                        info!(class = class.label(), guid = %guid, "client went away mid-stream");
                        clean = false;
                        break;
                    }
                }
                Err(e) => {
                    warn!(class = class.label(), guid = %guid, error = %e, "blob store stream failed");
                    let _ = tx.send(Err(e)).await;
                    clean = false;
                    break;
                }
            }
        }
        if clean {
            if file.shutdown().await.is_ok() {
                cache.register(&guid, path);
                info!(class = class.label(), guid = %guid, "cache repaired from blob store");
            }
            // A close failure leaves the file unindexed for the sweep.
        }
    });

    match Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .body(Body::from_stream(rx))
    {
        Ok(response) => response,
        Err(e) => {
            warn!(error = %e, "building download response failed");
            (StatusCode::BAD_REQUEST, "download failed").into_response()
        }
    }
}

/// Path-encoded placement query. Unparseable numbers fall back to
/// 256 MB / 512 MB and unparseable flags to false.
async fn find_dea(
    State(state): State<AppState>,
    Path((appid, memory, disk, stacks, owner, other, docker)): Path<(
        String,
        String,
        String,
        String,
        String,
        String,
        String,
    )>,
) -> impl IntoResponse {
    let request = FindDeaRequest {
        app_id: appid,
        memory: memory.parse().unwrap_or(256),
        disk: disk.parse().unwrap_or(512),
        stacks,
        owner_app: parse_flag(&owner),
        other_dea: parse_flag(&other),
        docker: parse_flag(&docker),
    };
    info!(app = %request.app_id, memory = request.memory, "placement requested over http");
    Json(state.pool.find(&request))
}

fn parse_flag(raw: &str) -> bool {
    matches!(raw.to_ascii_lowercase().as_str(), "1" | "t" | "true")
}
