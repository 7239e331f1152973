//! Serves three routes until ctrl-c:
//!
//! - `GET /hello?name=..` answers with plain text
//! - `POST /echo` sends the request body back
//! - `GET /echo-socket` with `Upgrade: echo` echoes raw bytes until the client hangs up

use futures::FutureExt;
use http::{Method, StatusCode};
use micro_bridge::engine::{BridgeEngine, ConnectorConfig, EngineConfig};
use micro_pipeline::{ApplicationCall, BoxError, OutgoingContent, ProtocolUpgrade, pipeline_fn, respond};
use tracing::{Level, error, info};
use tracing_subscriber::FmtSubscriber;

async fn route(call: &mut dyn ApplicationCall) -> Result<(), BoxError> {
    let method = call.request().method().clone();
    let path = call.request().uri().path().to_owned();

    match (method, path.as_str()) {
        (Method::GET, "/hello") => {
            let name = call.request().query_parameters().get("name").unwrap_or("world").to_owned();
            respond(call, OutgoingContent::text(format!("hello {name}\n"))).await?;
        }
        (Method::POST, "/echo") => {
            let body = call.request_mut().receive_channel()?.read_remaining().await?;
            respond(call, OutgoingContent::bytes(body)).await?;
        }
        (Method::GET, "/echo-socket") => {
            let upgrade = ProtocolUpgrade::for_protocol("echo", |mut input, mut output, _token| async move {
                while let Some(chunk) = input.read_chunk().await? {
                    output.write_fully(chunk).await?;
                    output.flush().await?;
                }
                Ok(())
            })?;
            respond(call, OutgoingContent::Upgrade(upgrade)).await?;
        }
        _ => {
            call.response_mut().set_status(StatusCode::NOT_FOUND);
            respond(call, OutgoingContent::text("404 not found\n")).await?;
        }
    }
    Ok(())
}

fn main() {
    let subscriber = FmtSubscriber::builder().with_max_level(Level::INFO).finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let config = EngineConfig::default().connector(ConnectorConfig::http("127.0.0.1", 8080));
    let engine = BridgeEngine::new(config, pipeline_fn(|call| route(call).boxed()));

    match engine.start() {
        Ok(connectors) => {
            for connector in connectors {
                info!(scheme = %connector.scheme, addr = %connector.local_addr, "serving");
            }
        }
        Err(e) => {
            error!(cause = %e, "can't start engine");
            return;
        }
    }

    let signal = tokio::runtime::Builder::new_current_thread().enable_all().build().expect("building signal runtime failed");
    if let Err(e) = signal.block_on(tokio::signal::ctrl_c()) {
        error!(cause = %e, "can't listen for ctrl-c");
    }
    engine.stop();
}
