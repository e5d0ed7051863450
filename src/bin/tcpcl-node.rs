//! Demonstration node: drives the Manager/Session/Listener/Dialer surface
//! from the command line. Not a DTN node — no routing, no store-and-forward,
//! no EID scheme parsing (spec.md §1). It binds an optional listener,
//! dials optional peers, and prints convergence events as they arrive.

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use tcpcl_cla::cli::Args;
use tcpcl_cla::manager::Manager;
use tcpcl_cla::session::{ConvergenceStatus, Session, SessionParams};
use tcpcl_cla::transport::tcp;
use tcpcl_cla::{defaults, logging::ColorizedFormatter};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    if args.listen.is_none() && args.dial.is_empty() {
        anyhow::bail!("nothing to do: pass --listen, --dial, or both");
    }

    let params = SessionParams {
        cla_type: args.cla_type(),
        local_eid: args.local_endpoint_id(),
        keepalive: args.keepalive,
        segment_mru: args.segment_mru,
        transfer_mru: args.transfer_mru,
        contact_flags: args.contact_flags(),
    };

    let manager = Manager::new(defaults::INITIAL_TTL, args.retry_interval());

    if let Some(listen_addr) = &args.listen {
        let listener = tcp::Listener::bind(listen_addr, 256 * 1024)
            .await
            .with_context(|| format!("binding listener on {listen_addr}"))?;
        tracing::info!(address = %listener.local_addr(), "listening");
        manager.spawn_tcp_listener(listener, params.clone());
    }

    for target in &args.dial {
        let session = std::sync::Arc::new(Session::new_active(
            target.clone(),
            params.clone(),
            args.permanent,
        ));
        manager
            .register(session)
            .await
            .with_context(|| format!("registering dial target {target}"))?;
    }

    let mut events = manager.channel().expect("channel taken exactly once");
    while let Some(status) = events.recv().await {
        match status {
            ConvergenceStatus::PeerAppeared { address, peer_eid } => {
                tracing::info!(address = %address, peer = %peer_eid, "peer appeared");
            }
            ConvergenceStatus::PeerDisappeared { address } => {
                tracing::warn!(address = %address, "peer disappeared");
            }
            ConvergenceStatus::ReceivedBundle { address, bundle } => {
                tracing::info!(address = %address, len = bundle.len(), "bundle received");
            }
        }
    }

    manager.close().await;
    Ok(())
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .event_format(ColorizedFormatter)
        .init();
}
