use std::{
    future::Future,
    io::ErrorKind,
    net::TcpListener,
    sync::OnceLock,
    time::Duration,
};

/// Bounded polling policy: no backoff growth, no jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthPolicy {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub timeout: Duration,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            max_retries: 60,
            retry_delay: Duration::from_millis(1000),
            timeout: Duration::from_millis(5000),
        }
    }
}

fn http_client() -> &'static reqwest::Client {
    static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();
    CLIENT.get_or_init(|| {
        reqwest::Client::builder()
            .user_agent(concat!("till-desktop/", env!("CARGO_PKG_VERSION")))
            .no_proxy()
            .build()
            .unwrap_or_else(|_| reqwest::Client::new())
    })
}

/// True only when binding fails with `AddrInUse`. Any other bind error is
/// reported as free.
pub fn is_port_in_use(port: u16) -> bool {
    match TcpListener::bind(("0.0.0.0", port)) {
        Ok(l) => {
            drop(l);
            false
        }
        Err(e) if e.kind() == ErrorKind::AddrInUse => true,
        Err(e) => {
            tracing::debug!(port, error = %e, "port check failed; treating as free");
            false
        }
    }
}

/// Single GET with a hard timeout. Healthy means any response below 500.
pub async fn check_health(url: &str, timeout: Duration) -> bool {
    match http_client().get(url).timeout(timeout).send().await {
        Ok(resp) => resp.status().as_u16() < 500,
        Err(e) => {
            tracing::trace!(url, error = %e, "health check failed");
            false
        }
    }
}

/// Calls `check` up to `max_retries` times (1-based attempt number), sleeping
/// `retry_delay` between attempts but not after the last one.
pub async fn poll_until<F, Fut>(policy: &HealthPolicy, mut check: F) -> bool
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = bool>,
{
    for attempt in 1..=policy.max_retries {
        if check(attempt).await {
            return true;
        }
        if attempt < policy.max_retries {
            tokio::time::sleep(policy.retry_delay).await;
        }
    }
    false
}

pub async fn wait_for_ready(url: &str, policy: &HealthPolicy) -> bool {
    let ok = poll_until(policy, |attempt| {
        tracing::trace!(url, attempt, "waiting for service");
        check_health(url, policy.timeout)
    })
    .await;
    if !ok {
        tracing::warn!(
            url,
            attempts = policy.max_retries,
            "service did not become ready"
        );
    }
    ok
}
