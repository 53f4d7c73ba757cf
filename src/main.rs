use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use clap::Parser;
use photozip::blobsource::StorageSource;
use photozip::catalog::CatalogFile;
use photozip::config::ExportConfig;
use photozip::{PhotoExporter, TenantId};
use tokio_util::io::ReaderStream;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Serves per-company photo export archives.
#[derive(Parser, Debug)]
#[command(name = "photozip")]
struct Args {
    /// YAML config file; `PHOTOZIP_*` environment variables override it.
    #[arg(long, short, env = "PHOTOZIP_CONFIG")]
    config: Option<PathBuf>,
}

type Exporter = PhotoExporter<CatalogFile, StorageSource>;

#[derive(Clone)]
struct AppState {
    exporter: Arc<Exporter>,
    error_redirect: Arc<str>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = ExportConfig::load(args.config.as_deref())?;

    let exporter = PhotoExporter::new(
        CatalogFile::new(&config.catalog_path),
        config.blob_source()?,
        Arc::new(config.buffer_pool()),
    )
    .with_compression(config.compression);
    let state = AppState {
        exporter: Arc::new(exporter),
        error_redirect: config.error_redirect.as_str().into(),
    };

    let app = Router::new()
        .route("/companies/{company_id}/export", get(export_photos))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, storage = %config.storage.url, "listening");
    axum::serve(listener, app).await?;

    Ok(())
}

async fn export_photos(
    State(state): State<AppState>,
    Path(company_id): Path<String>,
) -> Response {
    let tenant = TenantId::from(company_id);

    let result = match state.exporter.export_to_tempfile(&tenant).await {
        Ok(result) => result,
        Err(err) => {
            error!(error = %err, "photo export failed");
            return (StatusCode::FOUND, [(LOCATION, state.error_redirect.to_string())])
                .into_response();
        }
    };

    let file = result.into_archive();
    let len = match file.metadata() {
        Ok(metadata) => metadata.len(),
        Err(err) => {
            error!(tenant = %tenant, error = %err, "cannot stat spooled archive");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    let body = Body::from_stream(ReaderStream::new(tokio::fs::File::from_std(file)));

    (
        [
            (CONTENT_TYPE, "application/zip".to_owned()),
            (
                CONTENT_DISPOSITION,
                "attachment; filename=\"export.zip\"".to_owned(),
            ),
            (CONTENT_LENGTH, len.to_string()),
        ],
        body,
    )
        .into_response()
}
