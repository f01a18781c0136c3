use std::{sync::Arc, time::Duration};

use operator::{
    api,
    config::Config,
    dispatch::{self, DispatchQueue, LoggingExecutor, SessionFactory},
    kube::{DisabledKube, KubeClient, OperatorCommandSink, WorkloadLabeler},
    notification::{
        self, CommandRouter, ConnectionSupervisor, EnvelopeHandler, SafeModeForwarder,
        SupervisorConfig, WebsocketTransport,
    },
    reporter::{HttpReportSender, NoopReportSender, ReportSender},
    rulesupdate::RulesUpdater,
    safemode::{SafeModeConfig, SafeModeHandler},
    AppState,
};
use tokio::{sync::mpsc, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "operator=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    info!(
        port = config.port,
        cluster = %config.cluster_name,
        namespace = %config.namespace,
        "operator starting"
    );

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    // Status events
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()?;
    let report_sender: Arc<dyn ReportSender> = if config.event_receiver_url.is_empty() {
        Arc::new(NoopReportSender)
    } else {
        Arc::new(HttpReportSender::new(http, &config.event_receiver_url))
    };

    // Kubernetes
    let (labeler, command_sink): (Arc<dyn WorkloadLabeler>, Arc<dyn OperatorCommandSink>) =
        match KubeClient::in_cluster(&config.namespace) {
            Ok(client) => {
                let client = Arc::new(client);
                (client.clone(), client)
            }
            Err(e) => {
                warn!(error = %e, "running without kubernetes access");
                (Arc::new(DisabledKube), Arc::new(DisabledKube))
            }
        };

    let sessions = SessionFactory::new(&config.account_id, &config.cluster_name, report_sender);
    let (dispatch_queue, dispatch_rx) = DispatchQueue::bounded(config.dispatch_queue_capacity);
    let (safe_mode_tx, safe_mode_rx) = mpsc::channel(config.dispatch_queue_capacity);

    let safe_mode = SafeModeHandler::new(
        labeler,
        sessions.clone(),
        dispatch_queue.clone(),
        SafeModeConfig {
            sweep_interval: config.safe_mode_sweep_interval,
            grace_period: config.safe_mode_grace_period,
        },
    );
    match safe_mode.bootstrap().await {
        Ok(known) => info!(known, "loaded workload compatibility"),
        Err(e) => warn!(error = %e, "failed to load workload compatibility; starting empty"),
    }

    let mut tasks = JoinSet::new();
    tasks.spawn(dispatch::run_worker_pool(
        dispatch_rx,
        Arc::new(LoggingExecutor),
        config.worker_concurrency,
        cancel.clone(),
    ));
    tasks.spawn(safe_mode.clone().run(safe_mode_rx, cancel.clone()));
    tasks.spawn(safe_mode.clone().run_sweep(cancel.clone()));

    // Notification connections
    let command_router: Arc<dyn EnvelopeHandler> =
        Arc::new(CommandRouter::new(sessions.clone(), dispatch_queue.clone()));
    spawn_supervisor(&mut tasks, &config, notification::COMPONENT_TRIGGER, command_router, &cancel)?;
    if config.safe_mode_websocket_enabled {
        let forwarder: Arc<dyn EnvelopeHandler> =
            Arc::new(SafeModeForwarder::new(safe_mode_tx.clone()));
        spawn_supervisor(&mut tasks, &config, notification::COMPONENT_SAFE_MODE, forwarder, &cancel)?;
    }

    if config.rules_update.enabled {
        tasks.spawn(RulesUpdater::new(command_sink, &config.rules_update).run(cancel.clone()));
    }

    // REST API
    let state = Arc::new(AppState {
        sessions,
        dispatch: dispatch_queue,
        safe_mode_reports: safe_mode_tx,
    });
    let app = api::router(state).layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.port);
    info!("listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let shutdown = cancel.clone();
    tasks.spawn(async move {
        let serve = axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await });
        if let Err(e) = serve.await {
            error!(error = %e, "REST server failed");
        }
    });

    while let Some(res) = tasks.join_next().await {
        if let Err(e) = res {
            error!(error = %e, "background task failed");
        }
    }
    info!("operator stopped");
    Ok(())
}

fn spawn_supervisor(
    tasks: &mut JoinSet<()>,
    config: &Config,
    component: &str,
    handler: Arc<dyn EnvelopeHandler>,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let Some(url) = notification::notification_server_url(
        &config.gateway_websocket_url,
        &config.account_id,
        &config.cluster_name,
        component,
    )?
    else {
        info!(component, "GATEWAY_WEBSOCKET_URL not set; notification connection disabled");
        return Ok(());
    };

    let transport = Arc::new(WebsocketTransport::new(url.to_string()));
    let supervisor =
        ConnectionSupervisor::new(component, transport, handler, SupervisorConfig::default());
    tasks.spawn(supervisor.run(cancel.clone()));
    Ok(())
}

async fn cancel_on_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable; waiting for Ctrl+C only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    info!("shutdown signal received");
    cancel.cancel();
}
