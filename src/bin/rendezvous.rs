use actix::Actor;
use actix_web::{web, App, HttpResponse, HttpServer, Responder};
use meshcall::{
    config::RendezvousConfig,
    rendezvous::{websocket_route, RendezvousServer},
};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::prelude::__tracing_subscriber_SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = RendezvousConfig::from_env();
    let server = RendezvousServer::new().start();
    tracing::info!(
        "rendezvous listening on ws://{}:{}{}",
        config.host,
        config.port,
        config.path
    );

    let path = config.path.clone();
    HttpServer::new(move || {
        App::new()
            .wrap(TracingLogger::default())
            .app_data(web::Data::new(server.clone()))
            .service(index)
            .route(&path, web::get().to(websocket_route))
    })
    .bind((config.host.as_str(), config.port))?
    .run()
    .await
}

#[actix_web::get("/")]
async fn index() -> impl Responder {
    HttpResponse::Ok().body("healthy")
}

