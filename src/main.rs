use std::sync::Arc;

use dreamlog::clock::SystemClock;
use dreamlog::config::Config;
use dreamlog::proxy::AnalysisProxy;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    // Load .env from the binary's directory first, then the project root
    // (development builds: target/release/../..), then the CWD.
    let env_file = std::env::current_exe().ok().and_then(|exe| {
        let dir = exe.parent()?;
        [dir.join(".env"), dir.join("../../.env")]
            .into_iter()
            .find(|p| p.exists())
    });
    match env_file {
        Some(path) => {
            dotenvy::from_path(&path).ok();
        }
        None => {
            dotenvy::dotenv().ok();
        }
    }

    tracing::info!("dreamlog starting");

    let config = Config::load();
    if let Some(dir) = &config.state_dir {
        std::fs::create_dir_all(dir)?;
    }
    let proxy = Arc::new(AnalysisProxy::from_config(&config, Arc::new(SystemClock))?);

    let listener = tokio::net::TcpListener::bind(&config.bind).await?;
    tracing::info!("listening on {}", listener.local_addr()?);

    dreamlog::server::serve(listener, proxy, async {
        tokio::signal::ctrl_c().await.ok();
    })
    .await
    .inspect_err(|e| tracing::error!("serving error: {e:?}"))?;

    tracing::info!("dreamlog shutting down");
    Ok(())
}
