//! Application startup and lifecycle management.

use crate::config::{Config, StorageBackend};
use crate::handlers;
use crate::services::{
    Database, ExpirySweeper, LifecycleSettings, MemoryStore, OrderOrchestrator, PaymentBroker,
    PaymentGateway, RazorpayClient, Store, SystemClock,
};
use axum::{
    middleware::from_fn,
    routing::{get, post},
    Router,
};
use secrecy::ExposeSecret;
use service_core::error::AppError;
use service_core::middleware::{
    metrics::metrics_middleware,
    tracing::{make_request_span, request_id_middleware},
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::trace::TraceLayer;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: OrderOrchestrator,
    /// `None` when running on the in-memory store.
    pub database: Option<Database>,
}

/// HTTP routes with the shared middleware stack.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/metrics", get(handlers::metrics_endpoint))
        .route("/coupons/validate", post(handlers::coupons::validate_coupon))
        .route("/orders", post(handlers::orders::create_order))
        .route("/orders/:id", get(handlers::orders::get_order))
        .route(
            "/orders/:id/payment/confirm",
            post(handlers::orders::confirm_payment),
        )
        .route("/orders/:id/cancel", post(handlers::orders::cancel_order))
        .route("/orders/:id/return", post(handlers::orders::return_order))
        .route(
            "/admin/orders/expire",
            post(handlers::admin::expire_pending_orders),
        )
        .route(
            "/admin/orders/:id/process",
            post(handlers::admin::start_processing),
        )
        .route("/admin/orders/:id/ship", post(handlers::admin::mark_shipped))
        .route(
            "/admin/orders/:id/deliver",
            post(handlers::admin::mark_delivered),
        )
        .route(
            "/admin/orders/:id/return/approve",
            post(handlers::admin::approve_return),
        )
        .route(
            "/admin/orders/:id/refund",
            post(handlers::admin::process_refund),
        )
        .route(
            "/admin/orders/:id/tracking",
            post(handlers::admin::append_tracking_step),
        )
        .layer(from_fn(metrics_middleware))
        .layer(TraceLayer::new_for_http().make_span_with(make_request_span::<axum::body::Body>))
        // Outermost, so the request span already sees the minted id.
        .layer(from_fn(request_id_middleware))
        .with_state(state)
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    state: AppState,
    sweep_interval: Duration,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: Config) -> Result<Self, AppError> {
        let (store, database): (Arc<dyn Store>, Option<Database>) = match config.storage.backend {
            StorageBackend::Postgres => {
                let db = Database::new(
                    config.database.url.expose_secret(),
                    config.database.max_connections,
                    config.database.min_connections,
                )
                .await
                .map_err(|e| {
                    tracing::error!("Failed to connect to PostgreSQL: {}", e);
                    e
                })?;

                if config.database.run_migrations {
                    db.run_migrations().await?;
                }

                (Arc::new(db.clone()), Some(db))
            }
            StorageBackend::Memory => {
                tracing::warn!("Using in-memory storage; data is lost on restart");
                (Arc::new(MemoryStore::new()), None)
            }
        };

        let razorpay = RazorpayClient::new(config.gateway.clone());
        if razorpay.is_configured() {
            tracing::info!("Razorpay client initialized");
        } else {
            tracing::warn!("Razorpay credentials not configured - online payments will fail");
        }
        let gateway: Arc<dyn PaymentGateway> = Arc::new(razorpay);

        let broker = PaymentBroker::new(
            gateway,
            config.gateway.key_id.clone(),
            config.gateway.key_secret.clone(),
            config.gateway.currency.clone(),
        );

        let orchestrator = OrderOrchestrator::new(
            store,
            broker,
            Arc::new(SystemClock),
            LifecycleSettings::from(&config.lifecycle),
        );

        let addr = format!("{}:{}", config.server.host, config.server.port);
        let listener = TcpListener::bind(&addr).await.map_err(|e| {
            tracing::error!("Failed to bind HTTP listener to {}: {}", addr, e);
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!(port, service = %config.service_name, "Order service listening");

        Ok(Self {
            port,
            listener,
            state: AppState {
                orchestrator,
                database,
            },
            sweep_interval: Duration::from_secs(config.lifecycle.sweep_interval_secs),
        })
    }

    /// Get the HTTP port the server is listening on.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    /// Serve HTTP and run the expiry sweeper until a shutdown signal arrives.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let sweeper = ExpirySweeper::new(self.state.orchestrator.clone(), self.sweep_interval);
        let sweeper_token = sweeper.shutdown_token();
        let sweeper_handle = sweeper.spawn();

        let served = axum::serve(self.listener, router(self.state))
            .with_graceful_shutdown(shutdown_signal())
            .await;

        sweeper_token.cancel();
        if let Err(e) = sweeper_handle.await {
            tracing::error!(error = %e, "Expiry sweeper task failed");
        }

        served
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
