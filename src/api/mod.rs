// API module - HTTP endpoints

pub mod audit;
pub mod credentials;
pub mod erasure;
pub mod health;
pub mod middleware;
pub mod retention;

use axum::{middleware::from_fn, routing::get, Router};

use self::middleware::session::AppState;
use self::middleware::tenant::bind_tenant;

/// All routes. Everything except `/health` runs with a bound tenant.
pub fn router() -> Router<AppState> {
    let tenant_routes = Router::new()
        .merge(credentials::router())
        .merge(retention::router())
        .merge(audit::router())
        .merge(erasure::router())
        .route_layer(from_fn(bind_tenant));

    Router::new()
        .route("/health", get(health::health_check))
        .merge(tenant_routes)
}
