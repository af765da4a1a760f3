use anyhow::{bail, Context, Result};
use tether_core::{ApiClient, StreamConnectionState, SystemStats};
use tracing::{info, warn};

/// Log in with the configured credentials. Each invocation is its own
/// session and ends with a logout, so there is nothing to restore silently.
pub async fn authenticate(client: &ApiClient, password: Option<&str>) -> Result<()> {
    let Some(username) = client.settings().username.clone() else {
        bail!("a username is required; pass --username or set TETHER_USERNAME");
    };
    let Some(password) = password else {
        bail!("a password is required; pass --password or set TETHER_PASSWORD");
    };
    client
        .login(&username, password)
        .await
        .context("login failed")?;
    Ok(())
}

pub fn login(client: &ApiClient) -> Result<()> {
    let user = client
        .session()
        .user()
        .context("login succeeded without an identity")?;
    println!("logged in as {} (id {})", user.username, user.id);
    Ok(())
}

pub async fn whoami(client: &ApiClient) -> Result<()> {
    let user = match client.session().user() {
        Some(user) => user,
        None => client.fetch_user().await?,
    };
    println!("{} (id {})", user.username, user.id);
    Ok(())
}

pub async fn get(client: &ApiClient, path: &str) -> Result<()> {
    let value: serde_json::Value = client.get_json(path).await?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

pub async fn info(client: &ApiClient) -> Result<()> {
    let info = client.system_info().await?;
    println!("{}: {} {} (kernel {})", info.hostname, info.os, info.os_version, info.kernel);
    println!("uptime {}s, {} cpus, {} bytes memory", info.uptime, info.cpu_count, info.total_memory);
    Ok(())
}

pub async fn stats(client: &ApiClient, limit: Option<usize>) -> Result<()> {
    let stream = client.stats_stream()?;
    let mut latest = stream.subscribe_latest();
    let mut state = stream.subscribe_state();
    stream.start();

    let mut printed = 0usize;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *state.borrow_and_update();
                if current == StreamConnectionState::Disconnected {
                    warn!("stats stream disconnected, waiting for reconnect");
                } else {
                    info!(state = ?current, "stats stream");
                }
            }
            changed = latest.changed() => {
                if changed.is_err() {
                    break;
                }
                let sample = latest.borrow_and_update().clone();
                let Some(sample) = sample else { continue };
                match sample.decode::<SystemStats>() {
                    Ok(stats) => println!(
                        "cpu {:5.1}%  mem {:5.1}%  load {:.2} {:.2} {:.2}",
                        stats.cpu_usage,
                        stats.memory_percent,
                        stats.load_avg[0],
                        stats.load_avg[1],
                        stats.load_avg[2]
                    ),
                    Err(_) => println!("{}", sample.data),
                }
                printed += 1;
                if limit.is_some_and(|limit| printed >= limit) {
                    break;
                }
            }
        }
    }

    stream.stop();
    info!(samples = printed, retained = stream.history().len(), "stats stream closed");
    Ok(())
}
