//! Multi-tunnel manager
//!
//! Spawns one [`Session`] per configured tunnel. All sessions share the
//! request permits and the request log, and stop together on shutdown.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::ClientConfig;
use crate::inspector::RequestLog;
use crate::session::{RetryPolicy, Session};

/// Manages multiple tunnel connections
pub struct TunnelManager {
    sessions: Vec<Arc<Session>>,
    handles: Vec<JoinHandle<()>>,
}

impl TunnelManager {
    /// Sessions are cancelled together with `shutdown`.
    pub fn new(config: &ClientConfig, log: RequestLog, shutdown: &CancellationToken) -> Result<Self> {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_requests));
        let retry = RetryPolicy::from(&config.retry);

        let sessions = config
            .tunnels
            .iter()
            .map(|setting| {
                Session::new(
                    setting.clone(),
                    retry.clone(),
                    permits.clone(),
                    log.clone(),
                    shutdown,
                )
                .map(Arc::new)
                .with_context(|| format!("Invalid tunnel '{}'", setting.name))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            sessions,
            handles: Vec::new(),
        })
    }

    /// Start all tunnels defined in the configuration
    pub fn start_all(&mut self) {
        info!("Starting {} tunnel(s)", self.sessions.len());

        for session in &self.sessions {
            let session = session.clone();
            self.handles.push(tokio::spawn(async move {
                match session.run().await {
                    Ok(()) => info!("Tunnel '{}' closed gracefully", session.name()),
                    Err(e) => error!("Tunnel '{}' stopped: {}", session.name(), e),
                }
            }));
        }
    }

    pub fn sessions(&self) -> &[Arc<Session>] {
        &self.sessions
    }

    /// Cancel every session
    pub fn stop_all(&self) {
        info!("Shutting down all tunnels...");
        for session in &self.sessions {
            session.stop();
        }
    }

    /// Wait for all tunnels to end or Ctrl+C
    pub async fn wait_for_shutdown(mut self) {
        let all = futures_util::future::join_all(std::mem::take(&mut self.handles));
        tokio::pin!(all);

        tokio::select! {
            _ = &mut all => {}
            _ = tokio::signal::ctrl_c() => {
                self.stop_all();
                all.await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RetryConfig, TunnelSetting};
    use crate::session::SessionState;
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn config(remotes: &[String]) -> ClientConfig {
        ClientConfig {
            tunnels: remotes
                .iter()
                .enumerate()
                .map(|(i, remote)| {
                    TunnelSetting::new(format!("t{}", i), remote.clone(), "http://127.0.0.1:1")
                })
                .collect(),
            retry: RetryConfig {
                max_retries: -1,
                interval_ms: 10,
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_one_session_per_tunnel() {
        let a = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let b = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let remotes = vec![
            a.local_addr().unwrap().to_string(),
            b.local_addr().unwrap().to_string(),
        ];

        let shutdown = CancellationToken::new();
        let mut manager =
            TunnelManager::new(&config(&remotes), RequestLog::default(), &shutdown).unwrap();
        assert_eq!(manager.sessions().len(), 2);
        manager.start_all();

        for listener in [&a, &b] {
            let (stream, _) = tokio::time::timeout(Duration::from_secs(2), listener.accept())
                .await
                .unwrap()
                .unwrap();
            tokio::spawn(async move {
                let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                use futures_util::StreamExt;
                while ws.next().await.is_some() {}
            });
        }

        for session in manager.sessions() {
            let mut state = session.subscribe();
            tokio::time::timeout(
                Duration::from_secs(2),
                state.wait_for(|s| *s == SessionState::Connected),
            )
            .await
            .unwrap()
            .unwrap();
        }

        manager.stop_all();
        tokio::time::timeout(Duration::from_secs(2), manager.wait_for_shutdown())
            .await
            .expect("sessions did not stop");
        assert!(!shutdown.is_cancelled());
    }

    #[test]
    fn test_invalid_tunnel_rejected() {
        let mut config = config(&["127.0.0.1:1".to_string()]);
        config.tunnels[0].host_header = Some("bad\nhost".into());
        assert!(TunnelManager::new(&config, RequestLog::default(), &CancellationToken::new()).is_err());
    }
}
