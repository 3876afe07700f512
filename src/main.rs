use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use knowledge_ingest::config::{self, Config};
use knowledge_ingest::embedding::get_embedding_client;
use knowledge_ingest::knowledge::{KnowledgeApi, KnowledgeService, ServiceSettings};
use knowledge_ingest::metadata::PostgresMetadataStore;
use knowledge_ingest::storage::{S3ObjectStore, S3Settings};
use knowledge_ingest::vector::{QdrantService, QdrantSettings};
use knowledge_ingest::{api, logging};
use std::sync::Arc;
use tokio::net::TcpListener;
use uuid::Uuid;

#[derive(Parser)]
#[command(
    name = "knowledge-ingest",
    about = "Knowledge ingestion service: presigned uploads and document vectorization"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP server (default).
    Serve,
    /// Apply metadata migrations and exit.
    Migrate,
    /// Vectorize one file in the foreground and print the outcome. FAILED and stuck
    /// PROCESSING files are requeued first.
    Vectorize {
        /// Identifier of the file to process.
        file_id: Uuid,
    },
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn run() -> Result<()> {
    let cli = Cli::parse();
    config::init_config();
    logging::init_tracing();
    let config = config::get_config();

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Migrate => {
            connect_metadata(config).await?;
            tracing::info!("Metadata migrations applied");
            Ok(())
        }
        Command::Vectorize { file_id } => {
            let service = build_service(config).await?;
            let outcome = service
                .reprocess(file_id)
                .await
                .with_context(|| format!("vectorizing {file_id}"))?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            Ok(())
        }
    }
}

async fn serve(config: &Config) -> Result<()> {
    let service = build_service(config).await?;
    let app = api::create_router(Arc::new(service));

    let (listener, port) = bind_listener(config)
        .await
        .context("failed to bind listener")?;
    tracing::info!("Listening on http://0.0.0.0:{}", port);
    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}

async fn connect_metadata(config: &Config) -> Result<PostgresMetadataStore> {
    let metadata =
        PostgresMetadataStore::connect(&config.database_url, config.database_max_connections)
            .await
            .context("connecting to the metadata database")?;
    metadata
        .migrate()
        .await
        .context("applying metadata migrations")?;
    Ok(metadata)
}

async fn build_service(config: &Config) -> Result<KnowledgeService> {
    let metadata = connect_metadata(config).await?;

    let store = S3ObjectStore::new(S3Settings {
        endpoint: config.s3_endpoint.clone(),
        region: config.s3_region.clone(),
        access_key: config.s3_access_key.clone(),
        secret_key: config.s3_secret_key.clone(),
        bucket: config.s3_bucket.clone(),
        timeout: config.http_timeout(),
    })
    .context("configuring the object store")?;
    store
        .ensure_bucket()
        .await
        .context("ensuring the object store bucket")?;

    let vectors = QdrantService::new(QdrantSettings {
        url: config.qdrant_url.clone(),
        api_key: config.qdrant_api_key.clone(),
        collection: config.qdrant_collection_name.clone(),
        dimension: config.embedding_dimension,
        timeout: config.http_timeout(),
    })
    .context("configuring the vector store")?;
    vectors
        .ensure_collection()
        .await
        .context("ensuring the vector collection")?;

    let embedder = get_embedding_client(config).context("configuring embeddings")?;

    Ok(KnowledgeService::new(
        Arc::new(metadata),
        Arc::new(store),
        embedder,
        Arc::new(vectors),
        ServiceSettings::from_config(config),
    ))
}

async fn bind_listener(config: &Config) -> Result<(TcpListener, u16), std::io::Error> {
    use std::net::Ipv4Addr;

    if let Some(port) = config.server_port {
        return TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))
            .await
            .map(|listener| (listener, port));
    }

    const PORT_RANGE: std::ops::RangeInclusive<u16> = 4100..=4199;
    for port in PORT_RANGE {
        match TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await {
            Ok(listener) => {
                tracing::debug!(port, "Bound server port");
                return Ok((listener, port));
            }
            Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
                tracing::debug!(port, "Port already in use; trying next");
                continue;
            }
            Err(err) => return Err(err),
        }
    }

    Err(std::io::Error::new(
        std::io::ErrorKind::AddrNotAvailable,
        "No available port found in range 4100-4199",
    ))
}
