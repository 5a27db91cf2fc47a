use coach_call::application::{
    CallController, CallDependencies, CallSettings, IncomingCallListener, Profile,
    ProfileResolver,
};
use coach_call::config::{Config, StorageBackend, TransportKind};
use coach_call::domain::call::{CallStore, ChangeFeed, EndReason};
use coach_call::domain::shared::UserId;
use coach_call::infrastructure::media::VirtualAudioDevice;
use coach_call::infrastructure::metrics::init_metrics;
use coach_call::infrastructure::persistence::MemoryCallStore;
use coach_call::infrastructure::protocols::webrtc::{
    RtcTransportFactory, SimulatedNetwork, TransportFactory,
};
use coach_call::interface::api::{build_router, ApiState};
use std::sync::Arc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[cfg(feature = "postgres")]
use coach_call::infrastructure::persistence::{create_pool, run_migrations, PgCallStore, PgChangeFeed};

type Storage = (Arc<dyn CallStore>, Arc<dyn ChangeFeed>, Arc<dyn ProfileResolver>);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = Config::load()?;

    // Initialize tracing; RUST_LOG wins over the configured filter
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.telemetry.log_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting coach-call");
    debug!("Effective configuration:\n{}", config.to_toml()?);

    let local_user = match config.identity.user_id {
        Some(id) => id,
        None => {
            let id = UserId::new();
            warn!("No identity.user_id configured, using generated id {}", id);
            id
        }
    };

    let (store, feed, profiles) = build_storage(&config, local_user).await?;

    let transports: Arc<dyn TransportFactory> = match config.ice.transport {
        TransportKind::Webrtc => Arc::new(RtcTransportFactory::new()?),
        TransportKind::Simulated => {
            warn!("Using the simulated transport; no audio leaves this process");
            Arc::new(SimulatedNetwork::new().endpoint(local_user.to_string()))
        }
    };

    let controller = CallController::new(
        local_user,
        CallSettings {
            caller_type: config.identity.caller_type,
            timing: config.call.clone(),
            peer: config.ice.peer_config(),
        },
        CallDependencies {
            store: store.clone(),
            feed: feed.clone(),
            devices: Arc::new(VirtualAudioDevice::new()),
            profiles: profiles.clone(),
            transports,
        },
    );

    let listener = IncomingCallListener::new(
        store,
        feed,
        profiles,
        Arc::new(controller.clone()),
        config.call.profile_lookup_timeout(),
    );
    listener.init(local_user).await?;

    let prometheus_handle = if config.telemetry.metrics_enabled {
        Some(init_metrics()?)
    } else {
        None
    };

    let app = build_router(
        ApiState {
            controller: controller.clone(),
        },
        prometheus_handle,
        config.server.enable_cors,
    );

    let addr = config.bind_address();
    let tcp = tokio::net::TcpListener::bind(&addr).await?;
    info!("Call API listening on {} as {}", addr, local_user);

    axum::serve(tcp, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    listener.shutdown().await;
    controller.end_call(EndReason::UserHangup).await;
    info!("coach-call stopped");
    Ok(())
}

async fn build_storage(config: &Config, local_user: UserId) -> anyhow::Result<Storage> {
    match config.database.backend {
        StorageBackend::Memory => {
            info!("Using in-memory call store");
            let memory =
                Arc::new(MemoryCallStore::new().with_ringing_window(config.call.ringing_window()));
            if let Some(display_name) = &config.identity.display_name {
                let profile = Profile {
                    display_name: display_name.clone(),
                    avatar_url: None,
                };
                memory.put_profile(local_user, profile).await;
            }

            let store: Arc<dyn CallStore> = memory.clone();
            let feed: Arc<dyn ChangeFeed> = memory.clone();
            let profiles: Arc<dyn ProfileResolver> = memory;
            Ok((store, feed, profiles))
        }
        #[cfg(feature = "postgres")]
        StorageBackend::Postgres => {
            let pool = create_pool(&config.database).await?;
            if config.database.run_migrations {
                run_migrations(&pool).await?;
            }

            let pg = PgCallStore::new(pool, config.call.ringing_window());
            let feed: Arc<dyn ChangeFeed> = Arc::new(PgChangeFeed::new(pg.clone()));
            let pg = Arc::new(pg);
            let store: Arc<dyn CallStore> = pg.clone();
            let profiles: Arc<dyn ProfileResolver> = pg;
            Ok((store, feed, profiles))
        }
        #[cfg(not(feature = "postgres"))]
        StorageBackend::Postgres => {
            anyhow::bail!("database.backend = \"postgres\" requires the postgres feature")
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
