use std::{process, sync::Arc};

use futures::FutureExt;
use social_cards::{
    application::{
        error::AppError,
        pipeline::{PipelineSettings, RenderPipeline},
        purge::{CachePurger, Distribution, NoopDistribution, purge_prefix},
        render::{ChromiumEngine, ChromiumOptions, TemplateCatalog},
    },
    cache::{CacheStore, cache_key, request_path},
    config,
    domain::{card::RenderRequest, options::OptionSet},
    infra::{
        cdn::HttpDistribution,
        error::InfraError,
        http::{self, AdminState, HttpState},
        storage, telemetry,
    },
};
use tokio::try_join;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Purge(args) => run_purge(settings, args).await,
        config::Command::Key(args) => print_key(&args),
    }
}

fn print_key(args: &config::KeyArgs) -> Result<(), AppError> {
    let options =
        OptionSet::parse(&args.options).map_err(|err| AppError::validation(err.to_string()))?;
    let request = RenderRequest::new(args.template.as_str(), args.title.as_str(), options);
    let key = cache_key(&request).map_err(|err| AppError::validation(err.to_string()))?;

    println!("path\t{}", request_path(&request));
    println!("key\t{key}");
    Ok(())
}

async fn build_store(settings: &config::Settings) -> Result<CacheStore, AppError> {
    let backend = storage::build(&settings.store).await?;
    Ok(CacheStore::new(backend).with_batch_retry(settings.purge.batch_retry))
}

fn build_purger(settings: &config::Settings, store: CacheStore) -> Result<CachePurger, AppError> {
    let distribution: Arc<dyn Distribution> = match &settings.cdn.invalidation_url {
        Some(url) => Arc::new(HttpDistribution::new(
            url.clone(),
            settings.cdn.token.clone(),
        )?),
        None => Arc::new(NoopDistribution),
    };
    Ok(CachePurger::new(
        store,
        distribution,
        settings.cdn.retry,
    ))
}

async fn run_purge(settings: config::Settings, args: config::PurgeArgs) -> Result<(), AppError> {
    let prefix =
        purge_prefix(&args.path).map_err(|err| AppError::validation(err.to_string()))?;
    let store = build_store(&settings).await?;
    let purger = build_purger(&settings, store)?;

    let report = purger.purge(&prefix).await;
    let rendered = serde_json::to_string_pretty(&report)
        .map_err(|err| AppError::unexpected(format!("failed to encode purge report: {err}")))?;
    println!("{rendered}");

    if report.deletion_failed() {
        return Err(AppError::unexpected(format!(
            "purge of `{prefix}` did not complete"
        )));
    }
    Ok(())
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let store = build_store(&settings).await?;
    let purger = build_purger(&settings, store.clone())?;

    let engine = Arc::new(ChromiumEngine::new(
        TemplateCatalog::new(settings.render.template_dir.clone()),
        ChromiumOptions {
            chrome_path: settings.render.chrome_path.clone(),
            pool_size: settings.render.pool_size.get(),
            no_sandbox: settings.render.no_sandbox,
            request_timeout: settings.render.timeout,
            viewport: settings.render.viewport,
        },
    ));

    let pipeline = RenderPipeline::new(
        store,
        engine.clone(),
        PipelineSettings {
            lookup_enabled: settings.cache.lookup_enabled,
            render_timeout: settings.render.timeout,
            viewport: settings.render.viewport,
        },
    );

    let http_state = HttpState {
        pipeline: Arc::new(pipeline),
    };
    let admin_state = AdminState { purger };

    let result = serve_http(&settings, http_state, admin_state).await;

    if tokio::time::timeout(settings.server.graceful_shutdown, engine.shutdown())
        .await
        .is_err()
    {
        warn!(
            target = "social_cards::shutdown",
            timeout_ms =
                u64::try_from(settings.server.graceful_shutdown.as_millis()).unwrap_or(u64::MAX),
            "Browser pool did not drain before the shutdown deadline"
        );
    }

    result
}

async fn serve_http(
    settings: &config::Settings,
    http_state: HttpState,
    admin_state: AdminState,
) -> Result<(), AppError> {
    let public_router = http::build_router(http_state);
    let admin_router = http::build_admin_router(admin_state);

    let public_listener = tokio::net::TcpListener::bind(settings.server.public_addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    let admin_listener = tokio::net::TcpListener::bind(settings.server.admin_addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;

    info!(
        target = "social_cards::serve",
        public_addr = %settings.server.public_addr,
        admin_addr = %settings.server.admin_addr,
        "Listening"
    );

    let shutdown = shutdown_signal().shared();
    let public_server = axum::serve(public_listener, public_router.into_make_service())
        .with_graceful_shutdown(shutdown.clone());
    let admin_server = axum::serve(admin_listener, admin_router.into_make_service())
        .with_graceful_shutdown(shutdown);

    try_join!(public_server, admin_server)
        .map_err(|err| AppError::unexpected(format!("server error: {err}")))?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }

    info!(target = "social_cards::serve", "Shutdown signal received");
}
