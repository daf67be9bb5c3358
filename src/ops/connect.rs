//! Remote-host connection provisioning.
//!
//! Brings up a control-mode connection for a configured flavor: spawn the
//! flavor's connect command on a PTY, surface its raw output as a
//! provisioning terminal view, parse the resolved hostname out of that
//! output, and promote the host through provisioning → connecting →
//! connected. The setup cancellation token only guards setup; once the
//! protocol is active the connection outlives the caller's cancel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::hub::Hub;
use crate::mux::control::ControlMode;
use crate::mux::OutputSubscription;
use crate::session::SessionManager;
use crate::state::{HostStatus, RemoteHost, Store, HOST_TTL_HOURS};

/// Connection output lines like `hostname: dev-3.fly.dev` or
/// `HOST=gpu-1.internal`.
static HOSTNAME_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bhost(?:name)?\s*[:=]\s*([A-Za-z0-9._-]+)").unwrap());

pub struct ConnectionManager {
    config: Arc<Config>,
    store: Arc<Store>,
    sessions: Arc<SessionManager>,
    hub: Arc<Hub>,
    /// Serializes connection-creation; two racing connects for one flavor
    /// must not double-provision
    connect_mu: AsyncMutex<()>,
    active: Mutex<HashMap<String, Arc<ControlMode>>>,
}

impl ConnectionManager {
    pub fn new(
        config: Arc<Config>,
        store: Arc<Store>,
        sessions: Arc<SessionManager>,
        hub: Arc<Hub>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            store,
            sessions,
            hub,
            connect_mu: AsyncMutex::new(()),
            active: Mutex::new(HashMap::new()),
        })
    }

    /// Provision (or reuse) a connection for `flavor`. Returns once the
    /// control-mode protocol is live.
    pub async fn connect(&self, flavor: &str, setup: &CancellationToken) -> CoreResult<RemoteHost> {
        let _guard = self.connect_mu.lock().await;

        if let Some(existing) = self.store.host_by_flavor(flavor) {
            let connected = existing.status == HostStatus::Connected
                && self.active.lock().unwrap().contains_key(&existing.id);
            if connected && !existing.is_expired(Utc::now()) {
                return Ok(existing);
            }
        }

        let flavor_config = self
            .config
            .remote_flavor(flavor)
            .ok_or_else(|| CoreError::NotFound(format!("remote flavor '{flavor}'")))?
            .clone();

        let host_id = format!("host-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
        self.store.add_host(RemoteHost {
            id: host_id.clone(),
            flavor: flavor.to_string(),
            hostname: None,
            status: HostStatus::Provisioning,
            provisioned: false,
            connected_at: None,
            expires_at: None,
        })?;
        self.hub.trigger();

        match self
            .establish(&host_id, &flavor_config.connect_command, flavor_config.provision_timeout_ms, setup)
            .await
        {
            Ok(host) => Ok(host),
            Err(e) => {
                let _ = self.store.update_host(&host_id, |h| {
                    h.status = HostStatus::Disconnected;
                });
                let _ = self.store.save();
                self.hub.trigger();
                Err(e)
            }
        }
    }

    async fn establish(
        &self,
        host_id: &str,
        connect_command: &str,
        provision_timeout_ms: u64,
        setup: &CancellationToken,
    ) -> CoreResult<RemoteHost> {
        let mux = Arc::new(
            ControlMode::connect(
                host_id,
                connect_command,
                self.config.terminal.width,
                self.config.terminal.height,
                None,
                setup,
            )
            .map_err(|e| CoreError::Unavailable(e.to_string()))?,
        );

        // Hostname arrives in pre-protocol output; scan until connected
        let mut raw = mux.subscribe_raw();
        let store = self.store.clone();
        let hub = self.hub.clone();
        let scan_host = host_id.to_string();
        tokio::spawn(async move {
            let mut carry = String::new();
            while let Some(chunk) = raw.rx.recv().await {
                carry.push_str(&String::from_utf8_lossy(&chunk));
                if let Some(caps) = HOSTNAME_LINE.captures(&carry) {
                    let hostname = caps[1].to_string();
                    info!(host = scan_host, hostname, "remote hostname resolved");
                    let _ = store.update_host(&scan_host, |h| {
                        h.hostname = Some(hostname.clone());
                    });
                    let _ = store.save();
                    hub.trigger();
                    break;
                }
                // Bound the scan buffer to recent output
                if carry.len() > 64 * 1024 {
                    let cut = carry.len() - 4096;
                    carry.drain(..cut);
                }
            }
        });

        self.store.update_host(host_id, |h| {
            h.status = HostStatus::Connecting;
        })?;
        self.hub.trigger();

        let timeout = Duration::from_millis(provision_timeout_ms);
        if let Err(e) = mux.wait_active(timeout).await {
            mux.close();
            return Err(match e {
                crate::mux::MuxError::Timeout(_) => {
                    CoreError::Timeout(format!("provisioning '{host_id}' after {timeout:?}"))
                }
                other => CoreError::Unavailable(other.to_string()),
            });
        }

        let now = Utc::now();
        self.store.update_host(host_id, |h| {
            h.status = HostStatus::Connected;
            h.provisioned = true;
            h.connected_at = Some(now);
            h.expires_at = Some(now + ChronoDuration::hours(HOST_TTL_HOURS));
        })?;
        self.store.save()?;

        self.sessions.register_remote(host_id, mux.clone());
        self.active.lock().unwrap().insert(host_id.to_string(), mux);
        self.hub.trigger();

        info!(host = host_id, "remote host connected");
        self.store.host(host_id)
    }

    /// Provisioning terminal view: raw PTY bytes for a host that is still
    /// coming up (and beyond).
    pub fn subscribe_provisioning(&self, host_id: &str) -> Option<OutputSubscription> {
        self.active
            .lock()
            .unwrap()
            .get(host_id)
            .map(|mux| mux.subscribe_raw())
    }

    pub async fn disconnect(&self, host_id: &str) -> CoreResult<()> {
        if let Some(mux) = self.active.lock().unwrap().remove(host_id) {
            mux.close();
        }
        self.sessions.unregister_remote(host_id);
        self.store.update_host(host_id, |h| {
            h.status = HostStatus::Disconnected;
        })?;
        self.store.save()?;
        self.hub.trigger();
        Ok(())
    }

    /// Attempt to re-establish a dropped connection.
    pub async fn reconnect(&self, host_id: &str) -> CoreResult<RemoteHost> {
        let host = self.store.host(host_id)?;
        let flavor = self
            .config
            .remote_flavor(&host.flavor)
            .ok_or_else(|| CoreError::NotFound(format!("remote flavor '{}'", host.flavor)))?
            .clone();

        let _guard = self.connect_mu.lock().await;
        self.store.update_host(host_id, |h| {
            h.status = HostStatus::Reconnecting;
        })?;
        self.hub.trigger();

        self.establish(
            host_id,
            &flavor.connect_command,
            flavor.provision_timeout_ms,
            &CancellationToken::new(),
        )
        .await
    }

    /// Expiry sweep: mark hosts past their TTL expired, tear down their
    /// connections, and prune them from state.
    pub async fn gc_expired(&self) {
        let now = Utc::now();
        for host in self.store.hosts() {
            if host.status != HostStatus::Expired && host.is_expired(now) {
                warn!(host = host.id, "remote host TTL elapsed");
                if let Some(mux) = self.active.lock().unwrap().remove(&host.id) {
                    mux.close();
                }
                self.sessions.unregister_remote(&host.id);
                let _ = self.store.update_host(&host.id, |h| {
                    h.status = HostStatus::Expired;
                });
            }
        }
        let pruned = self.store.prune_expired_hosts(now);
        if !pruned.is_empty() {
            self.hub.trigger();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hostname_regex_variants() {
        for (line, expected) in [
            ("hostname: dev-3.fly.dev", "dev-3.fly.dev"),
            ("Host: gpu-1.internal", "gpu-1.internal"),
            ("HOST=worker_2", "worker_2"),
            ("resolved hostname = box.example.com", "box.example.com"),
        ] {
            let caps = HOSTNAME_LINE.captures(line).expect(line);
            assert_eq!(&caps[1], expected);
        }
        assert!(HOSTNAME_LINE.captures("no match here").is_none());
    }
}
