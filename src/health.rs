//! Minimal health surface: liveness backed by a database ping.

use std::time::Duration;

use actix_web::dev::ServerHandle;
use actix_web::web::Data;
use actix_web::{App, HttpResponse, HttpServer};
use sqlx::SqlitePool;
use tracing_actix_web::TracingLogger;

pub struct HealthServer {
    handle: ServerHandle,
}

impl HealthServer {
    /// Binds and spawns the health server on `port`.
    pub fn spawn(port: u16, db: SqlitePool) -> eyre::Result<Self> {
        let data = Data::new(db);

        let server = HttpServer::new(move || {
            App::new()
                .wrap(TracingLogger::default())
                .app_data(data.clone())
                .service(health)
                .service(ready)
        })
        .workers(1)
        .bind(("0.0.0.0", port))?
        .run();

        let handle = server.handle();
        tokio::spawn(server);

        tracing::info!(port, "health server listening");

        Ok(Self { handle })
    }

    pub async fn stop(self) {
        self.handle.stop(true).await;
    }
}

#[actix_web::get("/health")]
async fn health(db: Data<SqlitePool>) -> HttpResponse {
    let ping = tokio::time::timeout(
        Duration::from_secs(5),
        sqlx::query("SELECT 1").execute(db.get_ref()),
    )
    .await;

    match ping {
        Ok(Ok(_)) => HttpResponse::Ok().body("OK"),
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "health check failed: database unavailable");
            HttpResponse::ServiceUnavailable().body("Database unavailable")
        }
        Err(_) => {
            tracing::warn!("health check failed: database ping timed out");
            HttpResponse::ServiceUnavailable().body("Database unavailable")
        }
    }
}

#[actix_web::get("/ready")]
async fn ready() -> HttpResponse {
    HttpResponse::Ok().body("ready")
}
