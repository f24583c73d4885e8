use std::path::PathBuf;
use std::time::Duration;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use clap::Parser;
use flexi_logger::{Cleanup, Criterion, Duplicate, FileSpec, Logger, Naming};
use log::{info, warn};

use whisper_server::config::LoggingConfig;
use whisper_server::config_loader::{self, CliOverrides};
use whisper_server::error::ApiError;
use whisper_server::file_utils::exe_dir;
use whisper_server::handlers::{
    config_echo, config_echo_v1, get_model, health, list_models, transcribe, transcribe_base64,
    transcribe_url,
};
use whisper_server::model_manager::ModelManager;
use whisper_server::state::AppState;

/// Rotated log files kept on disk
const LOG_FILES_KEPT: usize = 10;

#[derive(Parser, Debug)]
#[command(name = "whisper-server", version)]
#[command(about = "OpenAI-compatible speech-to-text server backed by whisper.cpp")]
struct Cli {
    /// Bind address
    #[arg(long)]
    host: Option<String>,

    /// Bind port
    #[arg(long)]
    port: Option<u16>,

    /// Whisper model id (e.g. whisper-base)
    #[arg(long)]
    model: Option<String>,

    /// Transcription language, "auto" to detect
    #[arg(long)]
    language: Option<String>,

    /// Per-request timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Explicit config file path
    #[arg(long)]
    config: Option<PathBuf>,

    /// Download a model and exit instead of serving
    #[arg(long, value_name = "MODEL_ID")]
    download: Option<String>,
}

impl Cli {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            host: self.host.clone(),
            port: self.port,
            model: self.model.clone(),
            language: self.language.clone(),
            timeout: self.timeout,
            config: self.config.clone(),
        }
    }
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    let cli = Cli::parse();

    let config = match config_loader::resolve(&cli.overrides()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(1);
        }
    };

    // the handle flushes and closes the log file when dropped at exit
    let _logger = match init_logging(&config.logging) {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("failed to initialize logging: {e}");
            std::process::exit(1);
        }
    };

    // --download bypasses server startup entirely
    if let Some(model_id) = &cli.download {
        let manager = ModelManager::new(exe_dir().join("models"));
        match manager.ensure(model_id).await {
            Ok(path) => {
                eprintln!("model installed at {}", path.display());
                std::process::exit(0);
            }
            Err(e) => {
                eprintln!("model download failed: {e}");
                std::process::exit(1);
            }
        }
    }

    info!(
        "starting whisper-server {} with model {} on {}:{}",
        env!("CARGO_PKG_VERSION"),
        config.whisper.model_name,
        config.server.host,
        config.server.port
    );

    let bind_addr = (config.server.host.clone(), config.server.port);
    let keep_alive = Duration::from_secs(config.server.timeout_seconds);

    // Base64 bodies inflate the audio by 4/3, plus JSON overhead
    let json_limit = (config.whisper.max_file_size_bytes() * 2) as usize;

    let data = web::Data::new(AppState::new(config));

    // Provision the configured model up front; a failure here is not fatal,
    // requests re-attempt and surface 503 until the model is present.
    if let Err(e) = data.models.ensure(&data.config.whisper.model_name).await {
        warn!("startup model provisioning failed: {e}");
    }

    HttpServer::new(move || {
        let json_config = web::JsonConfig::default()
            .limit(json_limit)
            .error_handler(|err, _req| {
                ApiError::InvalidRequest(format!("invalid JSON body: {err}")).into()
            });

        App::new()
            .app_data(data.clone())
            .app_data(json_config)
            .wrap(Cors::permissive())
            .service(health)
            .service(config_echo)
            .service(config_echo_v1)
            .service(list_models)
            .service(get_model)
            .service(transcribe)
            .service(transcribe_base64)
            .service(transcribe_url)
    })
    .bind(bind_addr)?
    .keep_alive(keep_alive)
    .run()
    .await
}

fn init_logging(
    logging: &LoggingConfig,
) -> Result<flexi_logger::LoggerHandle, Box<dyn std::error::Error>> {
    let file_spec = FileSpec::try_from(PathBuf::from(&logging.file_path))?;
    let handle = Logger::try_with_str(&logging.level)?
        .log_to_file(file_spec)
        .rotate(
            Criterion::Size(logging.max_bytes),
            Naming::Numbers,
            Cleanup::KeepLogFiles(LOG_FILES_KEPT),
        )
        .duplicate_to_stderr(Duplicate::Info)
        .start()?;
    Ok(handle)
}
