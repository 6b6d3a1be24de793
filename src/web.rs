use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use actix_multipart::Multipart;
use actix_web::{
    get,
    http::header::{Charset, ContentDisposition, DispositionParam, DispositionType, ExtendedValue},
    post, web, App, HttpResponse, HttpServer, Responder, Result,
};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

use crate::config::Config;
use crate::error::ServiceError;
use crate::models::{ArtifactName, ConvertedPdf, ManifestEntry, UploadedInput};
use crate::processor::{Dispatched, Dispatcher};
use crate::store::{ArtifactStore, PurgeGuard};

const EXPIRE_ORIGINAL_NAMES_AFTER: Duration = Duration::from_secs(24 * 60 * 60);
const ORIGINAL_FILENAME_HEADER: &str = "X-Original-Filename";

pub struct AppState {
    dispatcher: Dispatcher,
    /// Client-facing names of batch outputs awaiting download.
    original_names: Mutex<HashMap<String, (String, Instant)>>,
}

impl AppState {
    pub fn new(dispatcher: Dispatcher) -> Self {
        AppState {
            dispatcher,
            original_names: Mutex::new(HashMap::new()),
        }
    }

    fn store(&self) -> &ArtifactStore {
        self.dispatcher.store()
    }

    fn remember_originals(&self, entries: &[ManifestEntry]) {
        let mut names = self
            .original_names
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        names.retain(|_, (_, added)| added.elapsed() < EXPIRE_ORIGINAL_NAMES_AFTER);

        for entry in entries {
            names.insert(
                entry.artifact_name.clone(),
                (entry.original_name.clone(), Instant::now()),
            );
        }
    }

    fn take_original(&self, artifact: &ArtifactName) -> Option<String> {
        self.original_names
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(artifact.as_str())
            .map(|(original, _)| original)
    }
}

#[derive(Clone, Copy)]
enum FileKind {
    Pdf,
    Csv,
}

impl FileKind {
    fn extension(self) -> &'static str {
        match self {
            FileKind::Pdf => "pdf",
            FileKind::Csv => "csv",
        }
    }

    fn accepts(self, content_type: &str, original_name: &str) -> bool {
        match self {
            FileKind::Pdf => content_type == "application/pdf",
            FileKind::Csv => {
                matches!(content_type, "text/csv" | "application/csv" | "application/vnd.ms-excel")
                    || original_name.to_ascii_lowercase().ends_with(".csv")
            }
        }
    }

    fn rejection(self) -> &'static str {
        match self {
            FileKind::Pdf => "Only PDF files are allowed!",
            FileKind::Csv => "Only CSV files are allowed!",
        }
    }
}

#[derive(Serialize)]
struct ManifestResponse {
    files: Vec<ManifestEntry>,
}

#[derive(Serialize)]
struct ClientsResponse {
    filename: String,
    clients: Vec<Value>,
}

#[derive(Serialize)]
struct FdfResponse {
    fdf_filename: String,
}

#[derive(Serialize)]
struct ZipResponse {
    zip_filename: String,
}

#[derive(Deserialize)]
struct ConvertFdfParams {
    filename: Option<String>,
    #[serde(rename = "clientIndex")]
    client_index: Option<Value>,
}

#[derive(Deserialize)]
struct CsvParams {
    filename: Option<String>,
}

/// A file body that deletes its source once the body is dropped, whether the
/// transfer finished or the client went away.
struct PurgingStream {
    inner: ReaderStream<fs::File>,
    _guard: PurgeGuard,
}

impl Stream for PurgingStream {
    type Item = std::io::Result<web::Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().inner).poll_next(cx)
    }
}

fn header_safe(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '"' | '\\' => '_',
            c if c.is_ascii_graphic() || c == ' ' => c,
            _ => '_',
        })
        .collect()
}

fn content_type_for(name: &ArtifactName) -> &'static str {
    match name.extension().map(|ext| ext.to_ascii_lowercase()).as_deref() {
        Some("fdf") => "application/vnd.fdf",
        Some("zip") => "application/zip",
        Some("pdf") => "application/pdf",
        Some("csv") => "text/csv",
        _ => "application/octet-stream",
    }
}

/// ASCII `filename` for every client, plus an RFC 5987 `filename*` when the
/// ASCII form had to replace characters.
fn attachment(filename: &str) -> ContentDisposition {
    let fallback = header_safe(filename);
    let mut parameters = vec![];

    if fallback != filename {
        parameters.push(DispositionParam::FilenameExt(ExtendedValue {
            charset: Charset::Ext("UTF-8".to_owned()),
            language_tag: None,
            value: filename.as_bytes().to_vec(),
        }));
    }
    parameters.insert(0, DispositionParam::Filename(fallback));

    ContentDisposition {
        disposition: DispositionType::Attachment,
        parameters,
    }
}

async fn stream_and_purge(
    path: std::path::PathBuf,
    guard: PurgeGuard,
    content_type: &'static str,
    filename: &str,
    original: Option<&str>,
) -> Result<HttpResponse, ServiceError> {
    let file = fs::File::open(&path).await?;

    let mut response = HttpResponse::Ok();
    response.content_type(content_type).insert_header(attachment(filename));
    if let Some(original) = original {
        response.insert_header((ORIGINAL_FILENAME_HEADER, header_safe(original)));
    }

    Ok(response.streaming(PurgingStream {
        inner: ReaderStream::new(file),
        _guard: guard,
    }))
}

async fn discard(store: &ArtifactStore, inputs: &[UploadedInput]) {
    for input in inputs {
        store.remove(&input.path).await;
    }
}

/// Writes every file part of a multipart body into the store.
async fn receive_files(
    store: &ArtifactStore,
    mut payload: Multipart,
    kind: FileKind,
    limit: usize,
) -> Result<Vec<UploadedInput>, ServiceError> {
    let mut inputs = vec![];

    while let Some(item) = payload.next().await {
        let mut field = match item {
            Ok(field) => field,
            Err(err) => {
                discard(store, &inputs).await;
                return Err(ServiceError::Upload(format!("Malformed upload: {err}")));
            }
        };

        let Some(original_name) = field
            .content_disposition()
            .and_then(|disposition| disposition.get_filename())
            .map(|name| name.to_owned())
        else {
            // not a file part
            while let Some(Ok(_)) = field.next().await {}
            continue;
        };

        let content_type = field
            .content_type()
            .map(|mime| mime.essence_str().to_owned())
            .unwrap_or_default();

        if !kind.accepts(&content_type, &original_name) {
            tracing::warn!(original = %original_name, content_type = %content_type, "rejected upload");
            discard(store, &inputs).await;
            return Err(ServiceError::Upload(kind.rejection().to_owned()));
        }

        if inputs.len() == limit {
            discard(store, &inputs).await;
            return Err(ServiceError::Upload(format!(
                "At most {limit} files can be uploaded at once"
            )));
        }

        let name = ArtifactName::generate("upload", kind.extension());
        let path = store.path_of(&name);
        let mut size = 0u64;

        let written: Result<(), ServiceError> = async {
            let mut file = fs::File::create(&path).await?;

            while let Some(chunk) = field.next().await {
                let chunk = chunk.map_err(|err| ServiceError::Upload(format!("Malformed upload: {err}")))?;
                size += chunk.len() as u64;
                file.write_all(&chunk).await?;
            }

            file.flush().await?;
            Ok(())
        }
        .await;

        if let Err(err) = written {
            store.remove(&path).await;
            discard(store, &inputs).await;
            return Err(err);
        }

        tracing::info!(original = %original_name, stored = %name, size, "received file");

        inputs.push(UploadedInput {
            path,
            name,
            original_name,
            content_type,
            size,
        });
    }

    Ok(inputs)
}

#[get("/health")]
async fn health() -> impl Responder {
    HttpResponse::Ok().body("ok")
}

#[post("/upload")]
async fn upload(data: web::Data<AppState>, payload: Multipart) -> Result<HttpResponse, ServiceError> {
    let inputs = receive_files(
        data.store(),
        payload,
        FileKind::Pdf,
        data.dispatcher.max_batch_files(),
    )
    .await?;

    match data.dispatcher.convert(inputs).await? {
        Dispatched::Single(pdf) => serve_converted(pdf).await,
        Dispatched::Batch(files) => {
            data.remember_originals(&files);
            Ok(HttpResponse::Ok().json(ManifestResponse { files }))
        }
    }
}

async fn serve_converted(pdf: ConvertedPdf) -> Result<HttpResponse, ServiceError> {
    let guard = PurgeGuard::new(pdf.path.clone());
    let filename = format!("converted_{}", pdf.original_name);

    stream_and_purge(
        pdf.path,
        guard,
        "application/pdf",
        &filename,
        Some(&pdf.original_name),
    )
    .await
}

#[post("/upload-csv")]
async fn upload_csv(data: web::Data<AppState>, payload: Multipart) -> Result<HttpResponse, ServiceError> {
    let mut inputs = receive_files(data.store(), payload, FileKind::Csv, 1).await?;
    let input = inputs
        .pop()
        .ok_or_else(|| ServiceError::Upload("No file uploaded.".to_owned()))?;

    let clients = data.dispatcher.list_clients(input.name.as_str()).await?;

    Ok(HttpResponse::Ok().json(ClientsResponse {
        filename: input.name.to_string(),
        clients,
    }))
}

fn client_index(value: &Value) -> Option<u64> {
    match value {
        Value::Number(number) => number.as_u64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

#[post("/convert-fdf")]
async fn convert_fdf(
    data: web::Data<AppState>,
    params: web::Json<ConvertFdfParams>,
) -> Result<HttpResponse, ServiceError> {
    let filename = params.filename.as_deref().filter(|name| !name.is_empty());
    let (Some(filename), Some(index)) = (filename, params.client_index.as_ref()) else {
        tracing::warn!("missing filename or client index for FDF conversion");
        return Err(ServiceError::Upload("Missing filename or client index.".to_owned()));
    };
    let index = client_index(index)
        .ok_or_else(|| ServiceError::Upload("Client index must be a non-negative integer.".to_owned()))?;

    let fdf = data.dispatcher.convert_client(filename, index).await?;

    Ok(HttpResponse::Ok().json(FdfResponse {
        fdf_filename: fdf.to_string(),
    }))
}

fn required_filename(params: &CsvParams) -> Result<&str, ServiceError> {
    params
        .filename
        .as_deref()
        .filter(|name| !name.is_empty())
        .ok_or_else(|| ServiceError::Upload("Missing filename.".to_owned()))
}

#[post("/download-all-fdfs")]
async fn download_all_fdfs(
    data: web::Data<AppState>,
    params: web::Json<CsvParams>,
) -> Result<HttpResponse, ServiceError> {
    let zip = data.dispatcher.convert_all(required_filename(&params)?).await?;

    Ok(HttpResponse::Ok().json(ZipResponse {
        zip_filename: zip.to_string(),
    }))
}

#[post("/generate-empty-fdf")]
async fn generate_empty_fdf(
    data: web::Data<AppState>,
    params: web::Json<CsvParams>,
) -> Result<HttpResponse, ServiceError> {
    let fdf = data.dispatcher.generate_empty(required_filename(&params)?).await?;

    Ok(HttpResponse::Ok().json(FdfResponse {
        fdf_filename: fdf.to_string(),
    }))
}

/// Serves an artifact once. The file is claimed before streaming so a
/// concurrent request for the same name gets a 404, and deleted when the
/// body is dropped.
#[get("/download/{filename}")]
async fn download(data: web::Data<AppState>, filename: web::Path<String>) -> Result<HttpResponse, ServiceError> {
    let filename = filename.into_inner();

    let claimed = match data.store().claim(&filename).await {
        Ok(claimed) => claimed,
        Err(err) => {
            tracing::info!(artifact = %filename, error = %err, "download target not found");
            return Err(ServiceError::NotFound("File not found.".to_owned()));
        }
    };

    let guard = claimed.purge_on_drop();
    let original = data.take_original(&claimed.name);
    tracing::info!(artifact = %claimed.name, "serving download");

    stream_and_purge(
        claimed.path.clone(),
        guard,
        content_type_for(&claimed.name),
        claimed.name.as_str(),
        original.as_deref(),
    )
    .await
}

pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.service(health)
        .service(upload)
        .service(upload_csv)
        .service(convert_fdf)
        .service(download_all_fdfs)
        .service(generate_empty_fdf)
        .service(download);
}

pub async fn start_web_server(config: &Config, dispatcher: Dispatcher) -> std::io::Result<()> {
    let app_state = web::Data::new(AppState::new(dispatcher));

    tracing::info!(host = %config.host, port = config.port, "starting web server");

    HttpServer::new(move || App::new().app_data(app_state.clone()).configure(routes))
        .bind((config.host.as_str(), config.port))?
        .run()
        .await
}
