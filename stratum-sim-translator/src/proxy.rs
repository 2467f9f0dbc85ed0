//! Generic proxy shell hosting one `Translator` per accepted downstream
//! connection.
//!
//! Grounded on `examples/original_source/.../sim_primitives/proxy.py`'s
//! `Proxy`. The source's `upstream_node: AcceptingConnection` constructor
//! argument is an abstract interface the proxy calls into to hand off each
//! freshly-built upstream connection; `UpstreamAcceptor` below is that same
//! seam, kept abstract so this crate never needs to depend on
//! `stratum-sim-pool` directly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use stratum_sim_core::{Connection, ConnectionFactory, EventBus, Scheduler, TaskHandle};
use stratum_sim_v1::Message as V1Message;
use stratum_sim_v2::Message as V2Message;

use crate::translator::Translator;

/// Implemented by whatever owns the real upstream pool (`stratum-sim-pool`'s
/// `Pool`, in practice) so the proxy can hand it each newly-opened V1
/// connection without creating a dependency cycle between the two crates.
pub trait UpstreamAcceptor: Send + Sync {
    fn accept_v1(&self, connection: Arc<Connection<V1Message>>);
}

pub struct ProxyConfig {
    pub name: String,
    pub upstream_port: String,
    pub upstream_mean_latency: Duration,
    pub upstream_latency_stddev_percent: f64,
    pub seed: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            name: "proxy".to_string(),
            upstream_port: "stratum".to_string(),
            upstream_mean_latency: Duration::ZERO,
            upstream_latency_stddev_percent: 0.0,
            seed: 1,
        }
    }
}

pub struct Proxy {
    name: String,
    bus: Arc<EventBus>,
    scheduler: Scheduler,
    upstream_node: Arc<dyn UpstreamAcceptor>,
    upstream_factory: ConnectionFactory,
    channel_id_seed: AtomicU64,
    translators: Mutex<HashMap<u64, Arc<Translator>>>,
    _run_tasks: Mutex<HashMap<u64, TaskHandle<()>>>,
}

impl Proxy {
    pub fn new(
        bus: Arc<EventBus>,
        scheduler: Scheduler,
        upstream_node: Arc<dyn UpstreamAcceptor>,
        config: ProxyConfig,
    ) -> Arc<Self> {
        let upstream_factory = ConnectionFactory::new(
            scheduler,
            config.upstream_port,
            config.upstream_mean_latency,
            config.upstream_latency_stddev_percent,
            config.seed,
        );
        Arc::new(Self {
            name: config.name,
            bus,
            scheduler,
            upstream_node,
            upstream_factory,
            channel_id_seed: AtomicU64::new(config.seed.wrapping_add(1000)),
            translators: Mutex::new(HashMap::new()),
            _run_tasks: Mutex::new(HashMap::new()),
        })
    }

    /// Accepts a downstream V2 connection: opens a matching upstream V1
    /// connection, hands it to the upstream node, builds a `Translator`
    /// bridging the pair, and spawns it.
    pub fn accept(self: &Arc<Self>, v2_connection: Arc<Connection<V2Message>>) -> Arc<Translator> {
        let v1_connection = Arc::new(self.upstream_factory.connect::<V1Message>());
        self.upstream_node.accept_v1(v1_connection.clone());

        let seed = self.channel_id_seed.fetch_add(1, Ordering::Relaxed);
        let translator = Translator::new(
            self.name.clone(),
            self.bus.clone(),
            v2_connection.clone(),
            v1_connection,
            seed,
        );

        let task = {
            let translator = translator.clone();
            self.scheduler.spawn(async move { translator.run().await })
        };
        self.translators
            .lock()
            .unwrap()
            .insert(v2_connection.uid, translator.clone());
        self._run_tasks
            .lock()
            .unwrap()
            .insert(v2_connection.uid, task);

        translator
    }

    pub fn disconnect(&self, v2_connection_uid: u64) {
        self.translators.lock().unwrap().remove(&v2_connection_uid);
        if let Some(task) = self._run_tasks.lock().unwrap().remove(&v2_connection_uid) {
            task.interrupt();
        }
    }

    pub fn translator_for(&self, v2_connection_uid: u64) -> Option<Arc<Translator>> {
        self.translators.lock().unwrap().get(&v2_connection_uid).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratum_sim_core::Scheduler as Sched;

    struct RecordingAcceptor {
        accepted: Mutex<Vec<Arc<Connection<V1Message>>>>,
    }

    impl UpstreamAcceptor for RecordingAcceptor {
        fn accept_v1(&self, connection: Arc<Connection<V1Message>>) {
            self.accepted.lock().unwrap().push(connection);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn accept_hands_a_fresh_v1_connection_to_the_upstream_node() {
        let sched = Sched::new();
        let bus = Arc::new(EventBus::new(sched.now()));
        let acceptor = Arc::new(RecordingAcceptor {
            accepted: Mutex::new(Vec::new()),
        });
        let proxy = Proxy::new(
            bus.clone(),
            sched,
            acceptor.clone(),
            ProxyConfig::default(),
        );

        let downstream_factory = ConnectionFactory::new(sched, "stratum", Duration::ZERO, 0.0, 500);
        let v2_connection = Arc::new(downstream_factory.connect::<V2Message>());
        proxy.accept(v2_connection.clone());
        tokio::task::yield_now().await;

        assert_eq!(acceptor.accepted.lock().unwrap().len(), 1);
        assert!(proxy.translator_for(v2_connection.uid).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_forgets_the_translator() {
        let sched = Sched::new();
        let bus = Arc::new(EventBus::new(sched.now()));
        let acceptor = Arc::new(RecordingAcceptor {
            accepted: Mutex::new(Vec::new()),
        });
        let proxy = Proxy::new(bus, sched, acceptor, ProxyConfig::default());

        let downstream_factory = ConnectionFactory::new(sched, "stratum", Duration::ZERO, 0.0, 501);
        let v2_connection = Arc::new(downstream_factory.connect::<V2Message>());
        proxy.accept(v2_connection.clone());
        proxy.disconnect(v2_connection.uid);
        assert!(proxy.translator_for(v2_connection.uid).is_none());
    }
}
