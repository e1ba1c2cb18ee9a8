use std::num::NonZeroU32;
use std::process;
use std::sync::Arc;

use tokio::signal;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;
use vetrina::{
    application::error::AppError,
    application::render::{
        EnvironmentPool, PoolSettings, RenderRequest, RenderService, RouteLoaderRegistry,
        RouteTable, ShellEnvironmentFactory, VisitorIdentity,
    },
    config,
    infra::{
        assets::AssetResolver,
        error::InfraError,
        http::{self, AppState, ClassificationPolicy, ClientShell, SsrState},
        loaders::HttpJsonLoader,
        telemetry,
    },
};

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
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::RenderPath(args) => run_render(settings, args).await,
    }
}

struct ApplicationContext {
    app_state: AppState,
    ssr_state: SsrState,
    render: Arc<RenderService>,
    pool: Arc<EnvironmentPool>,
}

fn build_application_context(settings: &config::Settings) -> Result<ApplicationContext, AppError> {
    let index_path = settings.assets.directory.join(&settings.assets.index_file);

    let factory = Arc::new(ShellEnvironmentFactory::new(index_path.clone()));
    let pool = Arc::new(EnvironmentPool::new(
        PoolSettings::from(&settings.pool),
        factory,
    ));

    let registry = build_registry(&settings.ssr)?;
    let routes = RouteTable::new(
        settings.ssr.known_routes.clone(),
        settings.ssr.default_route.clone(),
    );
    let render = Arc::new(RenderService::new(
        Arc::clone(&pool),
        Arc::new(registry),
        routes,
        settings.ssr.stability_timeout,
    ));

    let assets = Arc::new(AssetResolver::new(
        settings.assets.directory.clone(),
        settings.assets.internal_marker.clone(),
    ));
    let policy = Arc::new(ClassificationPolicy {
        bypass_markers: settings.ssr.bypass_markers.clone(),
        visitor_header: settings.ssr.visitor_header.clone(),
    });

    let app_state = AppState {
        render: Arc::clone(&render),
        shell: Arc::new(ClientShell::new(index_path)),
    };
    let ssr_state = SsrState {
        render: Arc::clone(&render),
        assets,
        policy,
    };

    Ok(ApplicationContext {
        app_state,
        ssr_state,
        render,
        pool,
    })
}

fn build_registry(ssr: &config::SsrSettings) -> Result<RouteLoaderRegistry, AppError> {
    let mut builder = RouteLoaderRegistry::builder();

    if ssr.routes.iter().any(|route| route.data_url.is_some()) {
        let client = HttpJsonLoader::shared_client()
            .map_err(|err| AppError::unexpected(err.to_string()))?;
        for route in &ssr.routes {
            builder = match &route.data_url {
                Some(url) => builder.loader(
                    route.path.clone(),
                    Arc::new(HttpJsonLoader::new(client.clone(), url.clone())),
                ),
                None => builder.no_prefetch(route.path.clone()),
            };
        }
    } else {
        for route in &ssr.routes {
            builder = builder.no_prefetch(route.path.clone());
        }
    }

    Ok(builder.build())
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let context = build_application_context(&settings)?;
    let router = http::build_router(context.app_state, context.ssr_state);

    let listener = tokio::net::TcpListener::bind(settings.server.public_addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;

    info!(
        target = "vetrina::serve",
        addr = %settings.server.public_addr,
        pool_capacity = settings.pool.min_instances.get(),
        "Vetrina gateway listening"
    );

    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| AppError::unexpected(format!("server error: {err}")))?;

    // Dispose pooled environments inside the shutdown budget; a hung engine
    // must not keep the process alive.
    if tokio::time::timeout(settings.server.graceful_shutdown, context.pool.shutdown())
        .await
        .is_err()
    {
        warn!(
            target = "vetrina::serve",
            "pool shutdown exceeded the graceful window"
        );
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = signal::ctrl_c().await {
        error!(target = "vetrina::serve", error = %error, "failed to listen for shutdown signal");
    }
}

async fn run_render(
    mut settings: config::Settings,
    args: config::RenderPathArgs,
) -> Result<(), AppError> {
    if !args.path.starts_with('/') {
        return Err(AppError::validation(
            "render path must start with a leading slash",
        ));
    }

    // A one-shot render only needs a single environment unless the caller
    // explicitly asked for more.
    if args.overrides.pool_min_instances.is_none() {
        settings.pool.min_instances = NonZeroU32::MIN;
    }

    let context = build_application_context(&settings)?;

    let request = RenderRequest {
        path: args.path.clone(),
        visitor: VisitorIdentity::Anonymous,
    };
    let document = context.render.render(&request).await.map_err(AppError::from)?;

    println!("{}", document.html);

    context.pool.shutdown().await;
    Ok(())
}
