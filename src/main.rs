use chartrelay::config::{Cli, Command, ServeArgs};
use chartrelay::relay::Relay;
use chartrelay::server::{self, AppState};
use chartrelay::tools::ToolRegistry;
use chartrelay::upstream::HttpUpstream;
use chartrelay::{cli, config, logging, prompt, Result};

use clap::Parser;
use futures_util::FutureExt;
use std::sync::Arc;

async fn serve(args: ServeArgs) -> Result<()> {
    let api_key = config::upstream_key()?;
    let client = args.http_client()?;

    let upstream = HttpUpstream::new(
        client,
        args.upstream_url.clone(),
        api_key,
        args.model.clone(),
        args.retry_policy(),
    );
    let relay = Relay::new(
        Arc::new(upstream),
        Arc::new(ToolRegistry::with_builtin_tools()),
        prompt::build_system_prompt(),
    );
    let app = server::router(Arc::new(AppState::new(relay)), args.max_body_size);

    let addr = args.addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("chartrelay listening on {} (model {})", addr, args.model);

    let server_future = async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
    };

    match std::panic::AssertUnwindSafe(server_future)
        .catch_unwind()
        .await
    {
        Ok(result) => result?,
        Err(panic_payload) => {
            tracing::error!(
                target: "panic",
                "CRITICAL: Server task panicked: {}",
                logging::panic_message(panic_payload.as_ref())
            );
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let opts = Cli::parse();
    let console = matches!(opts.command, Command::Serve(_));
    let guard = logging::init_tracing(&opts.log_dir, console);
    logging::setup_panic_hook();

    let outcome = match opts.command {
        Command::Serve(args) => serve(args).await,
        Command::Chat(args) => cli::run_chat(args).await,
    };

    if let Err(e) = outcome {
        tracing::error!("{}", e);
        eprintln!("Error: {}", e.inner);
        drop(guard);
        std::process::exit(1);
    }
}
