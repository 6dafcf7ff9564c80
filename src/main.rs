#[macro_use]
extern crate log;

mod collaborators;
mod config;
mod engine;
mod routes;
mod state;
mod ws;

#[cfg(test)]
mod tests;

use std::sync::Arc;

use actix_cors::Cors;
use actix_governor::{Governor, GovernorConfigBuilder};
use actix_web::middleware::{self, Logger};
use actix_web::{web, App, HttpResponse, HttpServer};
use openssl::ssl::{SslAcceptor, SslFiletype, SslMethod};

use collaborators::{AnonymousIdentityVerifier, NullBroadcastTranscoder};
use config::Config;
use engine::room::LOBBY_NAMESPACE;
use state::AppState;

const GC_SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenvy::dotenv().ok();

    env_logger::init_from_env(env_logger::Env::new().filter_or("LOG", "debug"));

    let config = Config::from_env();
    serve(config).await
}

// Split out of `main` so integration tests can build the app without going
// through env/TLS setup (mirrors the teacher's `serve(is_prod)` split).
async fn serve(config: Config) -> std::io::Result<()> {
    let is_prod = config.is_prod;
    let socket = config.socket;

    let state = Arc::new(AppState::new(
        config,
        Arc::new(AnonymousIdentityVerifier),
        Arc::new(NullBroadcastTranscoder),
    ));
    state.bus.create_namespace(LOBBY_NAMESPACE).await;
    state.spawn_gc_sweep(GC_SWEEP_INTERVAL);

    // TODO: behind a reverse proxy, swap the key extractor so the limiter
    // doesn't key everything off the proxy's own IP.
    let governor_conf = GovernorConfigBuilder::default()
        .burst_size(20)
        .seconds_per_request(1)
        .finish()
        .expect("failed to build governor (rate limiter)");

    let server = HttpServer::new(move || {
        App::new()
            .wrap(Logger::new("%a %r status %s %Dms"))
            .wrap(Cors::permissive()) // TODO prod: restrict to the web client's origin
            .wrap(middleware::Compress::default())
            .wrap(Governor::new(&governor_conf))
            .app_data(web::Data::new(Arc::clone(&state)))
            .default_service(web::to(HttpResponse::NotFound))
            .service(routes::root)
            .service(routes::list_rooms)
            .configure(routes::configure_ws)
    });

    match is_prod {
        true => {
            let key_path = dotenvy::var("TLS_PRIVATE_KEY").expect("TLS_PRIVATE_KEY env not found");
            let cert_path = dotenvy::var("TLS_CERT_KEY").expect("TLS_CERT_KEY env not found");

            let mut builder = SslAcceptor::mozilla_intermediate(SslMethod::tls())?;
            builder.set_private_key_file(&key_path, SslFiletype::PEM)?;
            builder.set_certificate_chain_file(&cert_path)?;

            server.bind_openssl(socket, builder)?.run().await?;
        }
        false => {
            server.bind(socket)?.run().await?;
        }
    }

    Ok(())
}
