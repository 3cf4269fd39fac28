use anyhow::{Context, Result};
use bearer_session::auth::{redact, SessionState};
use bearer_session::config::{Command, Config};
use bearer_session::{PendingRequest, SessionClient};
use reqwest::Method;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (for log level)
    let (config, command) = Config::load()?;
    config.validate()?;

    // Initialize logging with a configured level
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .init();

    tracing::debug!(
        base_url = %config.base_url,
        db_file = %config.session_db_file.display(),
        "Configuration loaded"
    );

    let client = SessionClient::from_config(&config).await?;

    let outcome = tokio::select! {
        result = run(&client, command) => result,
        _ = shutdown_signal() => Ok(()),
    };

    // Persist whatever state the session reached, even after a failed command
    client
        .teardown()
        .await
        .context("Failed to flush session state")?;

    outcome
}

async fn run(client: &SessionClient, command: Command) -> Result<()> {
    match command {
        Command::Login { email, password } => {
            let password = match password {
                Some(password) => password,
                None => dialoguer::Password::new()
                    .with_prompt(format!("Password for {}", email))
                    .interact()
                    .context("Failed to read password")?,
            };

            let pair = client.sign_in(&email, &password).await?;
            println!(
                "Logged in as {} ({})",
                pair.identity.email, pair.identity.role
            );
        }

        Command::Logout => {
            client.logout().await?;
            println!("Logged out");
        }

        Command::Status => match (client.session().state().await, client.store().get()) {
            (SessionState::Authenticated, Some(pair)) => {
                println!("Authenticated");
                println!("  Email:   {}", pair.identity.email);
                println!("  Role:    {}", pair.identity.role);
                println!("  Access:  {}", redact(&pair.access_token));
                println!("  Refresh: {}", redact(&pair.refresh_token));
            }
            _ => println!("Not authenticated"),
        },

        Command::Request {
            target,
            method,
            data,
        } => {
            let method = Method::from_bytes(method.to_uppercase().as_bytes())
                .with_context(|| format!("Invalid HTTP method: {}", method))?;

            let mut request = PendingRequest::new(method, target);
            if let Some(data) = data {
                let value: serde_json::Value =
                    serde_json::from_str(&data).context("Request body is not valid JSON")?;
                request = request.with_json(&value)?;
            }

            let response = client.send(request).await?;
            eprintln!("{}", response.status);
            println!("{}", response.text());

            if !response.status.is_success() {
                anyhow::bail!("Request failed with status {}", response.status);
            }
        }
    }

    Ok(())
}

/// Resolve on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal, shutting down...");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, shutting down...");
        },
    }
}
