use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use courier_core::{AckMode, Frame};
use courier_server::{route, Authenticator, InsecureAuth, JwtAuth, Server, ServerConfig};

#[derive(Parser)]
#[command(name = "courier", about = "WebSocket message delivery server")]
struct Args {
    #[arg(long, default_value_t = 9090)]
    port: u16,

    /// URL path accepting the WebSocket upgrade.
    #[arg(long, default_value = "/ws")]
    path: String,

    /// Reliability tier: disabled, single or rigorous.
    #[arg(long, default_value = "disabled")]
    ack_mode: AckMode,

    /// Seconds a rigorous-tier frame may await client confirmation.
    #[arg(long, default_value_t = 30)]
    ack_timeout_secs: u64,

    /// Reclaim connections idle longer than this many seconds. Unset
    /// leaves idle reclamation off.
    #[arg(long)]
    max_idle_secs: Option<u64>,

    /// HS256 secret for bearer-token authentication. Unset accepts
    /// unauthenticated clients.
    #[arg(long)]
    jwt_secret: Option<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = ServerConfig {
        port: args.port,
        pattern: args.path,
        ack_mode: args.ack_mode,
        ack_timeout: Duration::from_secs(args.ack_timeout_secs),
        ..Default::default()
    };
    if let Some(secs) = args.max_idle_secs {
        config.max_connection_idle = Duration::from_secs(secs);
    }

    let auth: Arc<dyn Authenticator> = match &args.jwt_secret {
        Some(secret) => Arc::new(JwtAuth::new(secret)),
        None => {
            tracing::warn!("no JWT secret configured, accepting unauthenticated clients");
            Arc::new(InsecureAuth)
        }
    };

    let server = Server::new(config, auth);
    server.add_routes(vec![
        route("chat.echo", |_server, conn, frame| async move {
            conn.write_frame(&Frame::data(frame.form_id.clone(), frame.data.clone()))
                .await?;
            Ok(())
        }),
        route("user.online", |server, conn, _frame| async move {
            let users = server.user_ids(&[]);
            conn.write_frame(&Frame::data("", serde_json::json!({ "users": users })))
                .await?;
            Ok(())
        }),
    ]);

    let handle = server.start().await.expect("failed to bind server port");
    tracing::info!(port = handle.port, "courier ready");

    tokio::signal::ctrl_c()
        .await
        .expect("failed to listen for ctrl+c");
    tracing::info!("shutting down");
}
