use std::path::PathBuf;

use actix_web::{
    get, middleware, web::Data, App, HttpRequest, HttpResponse, HttpServer, Responder,
};
use clap::Parser;
use prometheus::{Encoder, TextEncoder};

pub use addon_operator::{self, telemetry, State};

#[derive(Debug, clap::Parser)]
struct Arguments {
    /// Transport used to deliver manifest works to member clusters. Only the
    /// native hub apiserver transport is supported.
    #[arg(
        long = "work-driver",
        env = "WORK_DRIVER",
        value_name = "DRIVER",
        default_value = "native"
    )]
    work_driver: String,

    /// Configuration file for non-native work drivers.
    #[arg(long = "work-driver-config", env = "WORK_DRIVER_CONFIG", value_name = "PATH")]
    work_driver_config: Option<PathBuf>,

    /// Client id used by cloudevents-based work drivers.
    #[arg(
        long = "cloudevents-client-id",
        env = "CLOUDEVENTS_CLIENT_ID",
        value_name = "ID"
    )]
    cloudevents_client_id: Option<String>,

    /// Source id stamped on works delivered by cloudevents-based drivers.
    #[arg(long = "source-id", env = "SOURCE_ID", value_name = "ID")]
    source_id: Option<String>,
}

#[get("/metrics")]
async fn metrics(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let metrics = c.metrics();
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    encoder.encode(&metrics, &mut buffer).unwrap();
    HttpResponse::Ok().body(buffer)
}

#[get("/health")]
async fn health(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[get("/")]
async fn index(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let d = c.diagnostics().await;
    HttpResponse::Ok().json(&d)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init();

    let args: Arguments = Arguments::parse();
    if args.work_driver != "native" {
        anyhow::bail!(
            "unsupported work driver {:?}; only the native hub apiserver driver is available",
            args.work_driver
        );
    }
    if args.work_driver_config.is_some()
        || args.cloudevents_client_id.is_some()
        || args.source_id.is_some()
    {
        tracing::warn!("work driver options are ignored by the native driver");
    }

    // Initialize Kubernetes controller state. Template-based add-ons register
    // their providers at runtime; SDK consumers embed this crate as a library
    // and seed the registry instead.
    let state = State::new(Default::default());
    let controller = addon_operator::run(state.clone());
    tokio::pin!(controller);

    // Start web server
    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(state.clone()))
            .wrap(middleware::Logger::default().exclude("/health"))
            .service(index)
            .service(health)
            .service(metrics)
    })
    .bind("0.0.0.0:8080")?
    .shutdown_timeout(5)
    .run();

    tokio::pin!(server);

    // Both runtimes implements graceful shutdown, so poll until both are done
    tokio::join!(controller, server).1?;
    Ok(())
}
