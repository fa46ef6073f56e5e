#![allow(unused_imports)]

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, info_span, Level};

use stranded::config::config;
use stranded::connections::Metrics;
use stranded::protocol::{BasicHandler, BasicProtocol, Context, LineReceiver, LinesHandler, LineReceiverControl};
use stranded::reactor::Reactor;
use stranded::transport::TlsAcceptorConfig;
use stranded::{init_runtime, init_settings, init_tracing, spawn_coarse_clock};

/// Echoes back whatever bytes arrive, unframed - the simplest possible
/// `Protocol`, used to exercise `BasicProtocol` end to end.
struct Echo;

#[async_trait]
impl BasicHandler for Echo {
    type Error = std::convert::Infallible;

    async fn on_message(&mut self, ctx: &Context, data: &[u8]) -> Result<(), Self::Error> {
        let _ = ctx.send(data).await;
        Ok(())
    }
}

/// Echoes back each line, re-adding the delimiter - exercises `LineReceiver`
/// and `send_line`.
struct LineEcho;

#[async_trait]
impl LinesHandler for LineEcho {
    type Error = std::convert::Infallible;

    async fn line_received(
        &mut self,
        ctx: &Context,
        ctrl: &mut LineReceiverControl<'_>,
        data: &[u8],
    ) -> Result<(), Self::Error> {
        let _ = ctrl.send_line(ctx, data).await;
        Ok(())
    }
}

fn main() {
    init_tracing(Level::INFO);
    let _span = info_span!("startup").entered();

    let settings = init_settings().expect("could not load stranded.yaml");
    let runtime = init_runtime(settings).expect("could not build tokio runtime");
    spawn_coarse_clock(&runtime);

    runtime.block_on(async move {
        let mut reactor = Reactor::new();

        for listener in &settings.listeners {
            match &listener.tls {
                None => {
                    info!(port = listener.port, "starting demo echo listener");
                    reactor
                        .listen_tcp(listener.port, || BasicProtocol::new(Echo))
                        .expect("could not bind listener");
                }
                Some(material) => {
                    info!(port = listener.port, "starting demo TLS line-echo listener");
                    let tls_config = TlsAcceptorConfig::from_material(material)
                        .build()
                        .expect("invalid TLS material");
                    reactor
                        .listen_tls(listener.port, tls_config, || LineReceiver::new(LineEcho))
                        .expect("could not bind TLS listener");
                }
            }
        }

        reactor.run().await;
    });
}
