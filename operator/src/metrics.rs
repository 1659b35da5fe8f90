use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};
use owo_colors::OwoColorize;
use prometheus::{Encoder, TextEncoder};
use std::convert::Infallible;
use std::net::SocketAddr;

async fn serve_req(_req: Request<Body>) -> Result<Response<Body>, Infallible> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&prometheus::gather(), &mut buffer)
        .expect("encode metrics");
    Ok(Response::builder()
        .header(hyper::header::CONTENT_TYPE, encoder.format_type())
        .body(Body::from(buffer))
        .expect("build metrics response"))
}

/// Serves the default Prometheus registry on `0.0.0.0:<port>`.
pub async fn run_server(port: u16) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    println!(
        "{}{}",
        "📊 Serving Prometheus metrics on port ".green(),
        port.green()
    );
    let make_svc = make_service_fn(|_conn| async { Ok::<_, Infallible>(service_fn(serve_req)) });
    if let Err(e) = Server::bind(&addr).serve(make_svc).await {
        eprintln!("{}", format!("metrics server error: {e}").red());
    }
}
