//! Admission and removal of peers.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{ConfigServer, ProtocolEngine};
use crate::cluster::address::{BrokerAddress, BrokerInfo};
use crate::cluster::membership::AddBrokerInfoResult;
use crate::cluster::metrics;

impl ProtocolEngine {
    /// Admit a peer whose link just came up.
    ///
    /// - `Ban`: the peer must not be served; the caller closes the link
    /// - `Retry`: the peer may be admitted later; the caller retries
    /// - `Ok`: the peer is in the live broker list
    pub async fn add_broker_info(self: &Arc<Self>, info: BrokerInfo) -> AddBrokerInfoResult {
        let result = self.admit(info.clone()).await;
        metrics::record_broker_info_decision(result.as_metric_label());
        metrics::set_live_brokers(self.brokers.len());
        info!(broker = %info, %result, "Broker info processed");
        result
    }

    async fn admit(self: &Arc<Self>, info: BrokerInfo) -> AddBrokerInfoResult {
        let addr = info.address.clone();

        if self.is_shutdown() {
            debug!(broker = %addr, "Shutting down, refusing broker");
            return AddBrokerInfoResult::Ban;
        }

        match info.protocol_version {
            Some(v) if v >= self.config.min_protocol_version => {}
            version => {
                warn!(
                    broker = %addr,
                    ?version,
                    min = self.config.min_protocol_version,
                    "Broker protocol version not supported"
                );
                return AddBrokerInfoResult::Ban;
            }
        }

        if self.is_takeover_target(&addr).await {
            warn!(broker = %addr, "Broker is a takeover target, banning");
            self.forward_takeover_brokers(&addr, false).await;
            return AddBrokerInfoResult::Ban;
        }

        if let ConfigServer::Unresolved(id) = self.config_server()
            && id == addr.broker_id
        {
            info!(broker = %addr, "Master broker resolved");
            self.set_config_server(ConfigServer::Resolved(addr.clone()));
        }

        let is_config_server = self.is_config_server(&addr);
        if !self.is_config_sync_complete() && !is_config_server {
            debug!(broker = %addr, "Config sync not complete, retry later");
            return AddBrokerInfoResult::Retry;
        }

        let Some(entry) = self.brokers.insert_if_absent(info.clone()) else {
            debug!(broker = %addr, "Broker already in live broker list");
            return AddBrokerInfoResult::Ok;
        };

        if let Err(e) = self.callbacks.activate_broker(&info).await {
            warn!(broker = %addr, error = %e, "Failed to activate broker");
            self.brokers.remove(&addr);
            entry.deactivate();
            return AddBrokerInfoResult::Retry;
        }

        self.restart_elections(&addr);
        if self.config.ha_enabled {
            self.forward_takeover_brokers(&addr, true).await;
        }

        if is_config_server && !self.is_config_sync_complete() {
            if let Err(e) = self.send_config_changes_request(&addr, false).await {
                warn!(broker = %addr, error = %e, "Failed to request config changes");
            }
        } else if info.store_dirty
            && let Some(master) = self.master_broker()
            && master != addr
            && master != self.self_addr
        {
            info!(broker = %addr, master = %master, "Broker store dirty, resyncing with master broker");
            if let Err(e) = self.send_config_changes_request(&master, true).await {
                warn!(broker = %addr, error = %e, "Config resync failed, banning broker");
                self.remove_broker_info(&addr).await;
                return AddBrokerInfoResult::Ban;
            }
        }

        AddBrokerInfoResult::Ok
    }

    /// Drop a peer whose link went down, failing everything that waits on
    /// it.
    pub async fn remove_broker_info(&self, addr: &BrokerAddress) {
        let Some(entry) = self.brokers.remove(addr) else {
            return;
        };
        let goodbyed = entry.goodbye_done();
        let shutdown = self.is_shutdown();

        for tracker in self.trackers() {
            tracker.remove_broker(addr, goodbyed, shutdown);
        }
        for resource in self.resources.snapshot() {
            resource.broker_removed(addr);
        }
        if self.is_config_server(addr) {
            self.event_log_waiters
                .fail_all(&format!("master broker {} left", addr));
        }

        self.callbacks.deactivate_broker(addr).await;
        entry.deactivate();

        metrics::set_live_brokers(self.brokers.len());
        info!(broker = %addr, goodbyed, shutdown, "Broker removed");
    }
}
