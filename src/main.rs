use std::convert::Infallible;
use std::io;
use std::path::{Component, Path as FsPath, PathBuf};
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    routing::{delete, get, post},
    BoxError, Json, Router,
};
use futures::{Stream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use tokio::{fs::File, io::BufWriter};
use tokio_util::io::StreamReader;

use darkroom::adapters::{CommandSiteGenerator, JsonMetadataStore};
use darkroom::application::MediaService;
use darkroom::av::cmd::SubprocessRunner;
use darkroom::av::stills::DEFAULT_STILL_TIMESTAMP;
use darkroom::config::Config;
use darkroom::error::PipelineError;
use darkroom::jobs::{
    JobId, JobRegistry, JobStage, MediaType, ProgressBroadcaster, ProgressEvent,
};

type Service = MediaService<SubprocessRunner, JsonMetadataStore, CommandSiteGenerator>;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Arc::new(Config::from_env());
    tokio::fs::create_dir_all(config.upload_dir())
        .await
        .expect("Failed to create upload directory");

    let service = Arc::new(MediaService::new(
        Arc::new(SubprocessRunner),
        Arc::new(JsonMetadataStore::new(config.gallery_dir.join("meta"))),
        Arc::new(CommandSiteGenerator::new(config.site_regen_cmd.clone())),
        Arc::new(JobRegistry::new()),
        Arc::new(ProgressBroadcaster::new()),
        config.clone(),
    ));

    let app = Router::new()
        .route("/upload", post(upload_media))
        .route("/progress/:album/:filename", get(progress_stream))
        .route("/stills/:album/:filename", post(extract_stills))
        .route("/jobs", get(list_jobs))
        .route("/media/:album/:filename", delete(delete_media))
        .route("/album/:album", delete(delete_album))
        .layer(DefaultBodyLimit::disable())
        .with_state(service);

    let listener = tokio::net::TcpListener::bind(format!("{}:{}", config.addr, config.port))
        .await
        .expect("Failed to bind TCP listener");
    tracing::info!("Listening at {}:{}", config.addr, config.port);
    axum::serve(listener, app)
        .await
        .expect("Server failed to start");
}

#[derive(Serialize)]
struct AcceptedUpload {
    album: String,
    filename: String,
    state: JobStage,
}

/// Accepts a multipart form with an `album` text field followed by one or
/// more file fields, streams each file to disk and submits it as a job.
async fn upload_media(
    State(service): State<Arc<Service>>,
    mut multipart: Multipart,
) -> Result<Json<Vec<AcceptedUpload>>, (StatusCode, String)> {
    let mut album: Option<String> = None;
    let mut accepted = Vec::new();

    while let Ok(Some(field)) = multipart.next_field().await {
        if field.name() == Some("album") {
            let name = field
                .text()
                .await
                .map_err(|err| (StatusCode::BAD_REQUEST, err.to_string()))?;
            if !segment_is_valid(&name) {
                return Err((StatusCode::BAD_REQUEST, "Invalid album name".to_owned()));
            }
            album = Some(name);
            continue;
        }

        let Some(filename) = field.file_name().map(str::to_owned) else {
            continue;
        };
        let Some(album) = album.clone() else {
            return Err((
                StatusCode::BAD_REQUEST,
                "album field must precede file fields".to_owned(),
            ));
        };
        if !segment_is_valid(&filename) {
            return Err((StatusCode::BAD_REQUEST, "Invalid file name".to_owned()));
        }
        let Some(kind) = MediaType::from_filename(&filename) else {
            return Err((
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                format!("unsupported file type: {}", filename),
            ));
        };

        // Admission first: the job enters `queued`, then reports `uploading`
        // while its bytes stream to disk.
        let id = JobId::new(album.clone(), filename.clone());
        if !service.admit(&id, kind) {
            return Err((
                StatusCode::CONFLICT,
                format!("{} is already being processed", id),
            ));
        }

        let path = service.config().upload_path(&album, &filename);
        if let Some(parent) = path.parent() {
            if let Err(err) = tokio::fs::create_dir_all(parent).await {
                service.fail_job(&id, err.to_string());
                return Err((StatusCode::INTERNAL_SERVER_ERROR, err.to_string()));
            }
        }

        service
            .broadcaster()
            .publish(ProgressEvent::new(&id, JobStage::Uploading, 0));
        tracing::info!(job = %id, "saving upload to {:?}", path);
        if let Err(err) = stream_to_file(&path, field).await {
            service.fail_job(&id, err.1.clone());
            return Err(err);
        }

        service.dispatch(id, kind, path);
        accepted.push(AcceptedUpload {
            album,
            filename,
            state: JobStage::Queued,
        });
    }

    if accepted.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "no files uploaded".to_owned()));
    }
    Ok(Json(accepted))
}

/// Streams a job's progress events as SSE. A subscriber attaching mid-job
/// first receives the retained latest event, then live updates; the stream
/// ends after a terminal event.
async fn progress_stream(
    State(service): State<Arc<Service>>,
    Path((album, filename)): Path<(String, String)>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let id = JobId::new(album, filename);
    let (latest, rx) = service.broadcaster().subscribe(&id);

    let already_done = latest
        .as_ref()
        .map(|event| event.state.is_terminal())
        .unwrap_or(false);
    let replay = futures::stream::iter(latest.map(|event| sse_event(&event)));

    let live = futures::stream::unfold((rx, already_done), |(mut rx, done)| async move {
        if done {
            return None;
        }
        loop {
            use tokio::sync::broadcast::error::RecvError;
            match rx.recv().await {
                Ok(event) => {
                    let terminal = event.state.is_terminal();
                    return Some((sse_event(&event), (rx, terminal)));
                }
                // A slow consumer missed intermediate events; newer ones follow.
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return None,
            }
        }
    });

    Sse::new(replay.chain(live)).keep_alive(KeepAlive::default())
}

fn sse_event(event: &ProgressEvent) -> Result<Event, Infallible> {
    let data = serde_json::to_string(event).unwrap_or_else(|_| String::from("{}"));
    Ok(Event::default().data(data))
}

#[derive(Debug, Deserialize)]
struct StillsRequest {
    timestamp: Option<f64>,
}

/// Re-extracts both preview stills from the retained upload at a chosen
/// timestamp.
async fn extract_stills(
    State(service): State<Arc<Service>>,
    Path((album, filename)): Path<(String, String)>,
    Query(request): Query<StillsRequest>,
) -> Result<StatusCode, (StatusCode, String)> {
    if !segment_is_valid(&album) || !segment_is_valid(&filename) {
        return Err((StatusCode::BAD_REQUEST, "Invalid path".to_owned()));
    }

    let id = JobId::new(album, filename);
    let timestamp = request.timestamp.unwrap_or(DEFAULT_STILL_TIMESTAMP);
    match service.extract_stills(&id, timestamp).await {
        Ok(()) => Ok(StatusCode::OK),
        Err(PipelineError::NotFound(path)) => Err((
            StatusCode::NOT_FOUND,
            format!("no retained upload at {}", path.display()),
        )),
        Err(err) => Err((StatusCode::INTERNAL_SERVER_ERROR, err.to_string())),
    }
}

#[derive(Serialize)]
struct JobSummary {
    album: String,
    filename: String,
    kind: MediaType,
    state: JobStage,
    running_secs: u64,
}

async fn list_jobs(State(service): State<Arc<Service>>) -> Json<Vec<JobSummary>> {
    let mut jobs: Vec<JobSummary> = service
        .registry()
        .snapshot()
        .into_iter()
        .map(|(id, record)| JobSummary {
            album: id.album,
            filename: id.filename,
            kind: record.kind,
            state: record.stage,
            running_secs: record
                .started_at
                .elapsed()
                .unwrap_or_default()
                .as_secs(),
        })
        .collect();
    jobs.sort_by(|a, b| b.running_secs.cmp(&a.running_secs));
    Json(jobs)
}

async fn delete_media(
    State(service): State<Arc<Service>>,
    Path((album, filename)): Path<(String, String)>,
) -> Result<StatusCode, (StatusCode, String)> {
    if !segment_is_valid(&album) || !segment_is_valid(&filename) {
        return Err((StatusCode::BAD_REQUEST, "Invalid path".to_owned()));
    }
    service.delete_media(&JobId::new(album, filename)).await;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_album(
    State(service): State<Arc<Service>>,
    Path(album): Path<String>,
) -> Result<StatusCode, (StatusCode, String)> {
    if !segment_is_valid(&album) {
        return Err((StatusCode::BAD_REQUEST, "Invalid path".to_owned()));
    }
    service.delete_album(&album).await;
    Ok(StatusCode::NO_CONTENT)
}

// Save a `Stream` to a file
async fn stream_to_file<S, E>(path: &PathBuf, stream: S) -> Result<(), (StatusCode, String)>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Into<BoxError>,
{
    async {
        let body_with_io_error = stream.map_err(|err| io::Error::new(io::ErrorKind::Other, err));
        let body_reader = StreamReader::new(body_with_io_error);
        futures::pin_mut!(body_reader);

        let mut file = BufWriter::new(File::create(path).await?);
        tokio::io::copy(&mut body_reader, &mut file).await?;

        Ok::<_, io::Error>(())
    }
    .await
    .map_err(|err| (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))
}

/// Album and file names become single path segments under the gallery root;
/// anything that would escape or nest is rejected.
fn segment_is_valid(segment: &str) -> bool {
    if segment.is_empty() {
        return false;
    }
    let path = FsPath::new(segment);
    let mut components = path.components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures::stream;
    use std::fs;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_stream_to_file() {
        let temp_dir = tempdir().unwrap();
        let file_path = temp_dir.path().join("test_file.txt");

        type E = std::io::Error;

        let test_data = "Hello, world!";
        let mock_stream = stream::iter(vec![Ok::<bytes::Bytes, E>(Bytes::from(test_data))]);

        let result = stream_to_file(&file_path, mock_stream).await;
        assert!(result.is_ok());

        let file_contents = fs::read_to_string(file_path).unwrap();
        assert_eq!(file_contents, test_data);
    }

    #[tokio::test]
    async fn test_stream_to_file_error() {
        let temp_dir = tempdir().unwrap();
        let file_path = temp_dir.path().join("test_file.txt");

        let mock_stream = stream::iter(vec![Err("Test error")]);

        let result = stream_to_file(&file_path, mock_stream).await;
        assert!(result.is_err());
        assert_eq!(
            result.unwrap_err(),
            (StatusCode::INTERNAL_SERVER_ERROR, "Test error".to_string())
        );
    }

    #[test]
    fn test_valid_segment() {
        assert!(segment_is_valid("vacation-2024"));
        assert!(segment_is_valid("beach.mp4"));
    }

    #[test]
    fn test_invalid_segment_with_parent() {
        assert!(!segment_is_valid("../escape"));
    }

    #[test]
    fn test_invalid_segment_with_separator() {
        assert!(!segment_is_valid("dir1/dir2"));
    }

    #[test]
    fn test_invalid_segment_with_root() {
        assert!(!segment_is_valid("/absolute"));
    }

    #[test]
    fn test_invalid_empty_segment() {
        assert!(!segment_is_valid(""));
    }
}
