//! In-process loopback engine

use super::{
    EngineEvent, EngineEventSender, EngineResult, MediaConsumer, MediaEngine, MediaProducer,
    MediaRouter, MediaTransport,
};
use crate::error::EngineError;
use crate::media::{
    DtlsParameters, RtpCapabilities, RtpCodecCapability, RtpParameters, TransportParameters,
};
use crate::types::{ConsumerId, MediaKind, ProducerId, RouterId, TransportDirection, TransportId};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// First port handed out in loopback ICE candidates
const BASE_PORT: u16 = 40000;

/// Loopback media engine
///
/// Keeps the complete object lifecycle (routers, transports, producers,
/// consumers and the teardown cascade between them) in memory without moving
/// any media. Backs the test-suite and lets the signaling server run without a
/// native media worker.
#[derive(Clone, Default)]
pub struct LocalEngine {
    inner: Arc<EngineInner>,
}

#[derive(Default)]
struct EngineInner {
    dead: CancellationToken,
    routers_created: AtomicUsize,
    next_port: AtomicU16,
    pause_faults: Mutex<HashSet<ProducerId>>,
    transports: DashMap<TransportId, Weak<LocalTransport>>,
}

impl LocalEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the engine process dying
    pub fn kill(&self) {
        self.inner.dead.cancel();
    }

    /// Number of routers created over the engine's lifetime
    #[must_use]
    pub fn routers_created(&self) -> usize {
        self.inner.routers_created.load(Ordering::Relaxed)
    }

    /// Make every future pause of `producer_id` fail
    pub fn fail_pause(&self, producer_id: ProducerId) {
        self.inner.pause_faults.lock().insert(producer_id);
    }

    /// Simulate a transport failing underneath its owner.
    /// Returns false if the transport does not exist (anymore).
    pub fn fail_transport(&self, transport_id: &TransportId) -> bool {
        let transport = self
            .inner
            .transports
            .get(transport_id)
            .and_then(|entry| entry.value().upgrade());
        match transport {
            Some(transport) => transport.teardown(true),
            None => false,
        }
    }
}

#[async_trait]
impl MediaEngine for LocalEngine {
    async fn create_router(
        &self,
        codecs: &[RtpCodecCapability],
        events: EngineEventSender,
    ) -> EngineResult<Arc<dyn MediaRouter>> {
        if self.inner.dead.is_cancelled() {
            return Err(EngineError::Closed);
        }
        if codecs.is_empty() {
            return Err(EngineError::Router(
                "router needs at least one media codec".to_string(),
            ));
        }

        self.inner.routers_created.fetch_add(1, Ordering::Relaxed);
        let router = RouterInner {
            id: RouterId::generate(),
            capabilities: RtpCapabilities::new(codecs.to_vec()),
            producers: DashMap::new(),
            transports: DashMap::new(),
            events,
            closed: AtomicBool::new(false),
            engine: Arc::clone(&self.inner),
        };
        debug!(router_id = %router.id, codecs = codecs.len(), "Loopback router created");

        Ok(Arc::new(LocalRouter {
            inner: Arc::new(router),
        }))
    }

    fn dead(&self) -> CancellationToken {
        self.inner.dead.clone()
    }
}

struct RouterInner {
    id: RouterId,
    capabilities: RtpCapabilities,
    producers: DashMap<ProducerId, Arc<LocalProducer>>,
    transports: DashMap<TransportId, Arc<LocalTransport>>,
    events: EngineEventSender,
    closed: AtomicBool,
    engine: Arc<EngineInner>,
}

impl RouterInner {
    fn emit(&self, event: EngineEvent) {
        // The owning room may already be gone; nobody is left to notify then.
        let _ = self.events.send(event);
    }

    fn ensure_open(&self) -> EngineResult<()> {
        if self.closed.load(Ordering::Acquire) || self.engine.dead.is_cancelled() {
            Err(EngineError::Closed)
        } else {
            Ok(())
        }
    }
}

struct LocalRouter {
    inner: Arc<RouterInner>,
}

#[async_trait]
impl MediaRouter for LocalRouter {
    fn id(&self) -> RouterId {
        self.inner.id.clone()
    }

    fn rtp_capabilities(&self) -> RtpCapabilities {
        self.inner.capabilities.clone()
    }

    fn can_consume(&self, producer_id: &ProducerId, capabilities: &RtpCapabilities) -> bool {
        let Some(producer) = self.inner.producers.get(producer_id) else {
            return false;
        };
        !producer.closed.load(Ordering::Acquire)
            && producer
                .rtp_parameters
                .media_codec()
                .is_some_and(|codec| capabilities.supports(codec))
    }

    async fn create_transport(
        &self,
        direction: TransportDirection,
    ) -> EngineResult<Arc<dyn MediaTransport>> {
        self.inner.ensure_open()?;

        let port = BASE_PORT.wrapping_add(self.inner.engine.next_port.fetch_add(1, Ordering::Relaxed));
        let transport = Arc::new(LocalTransport {
            id: TransportId::generate(),
            router: Arc::downgrade(&self.inner),
            parameters: loopback_parameters(port),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            producers: Mutex::new(Vec::new()),
            consumers: Mutex::new(Vec::new()),
        });
        self.inner
            .transports
            .insert(transport.id.clone(), Arc::clone(&transport));
        self.inner
            .engine
            .transports
            .insert(transport.id.clone(), Arc::downgrade(&transport));

        debug!(
            router_id = %self.inner.id,
            transport_id = %transport.id,
            direction = ?direction,
            "Loopback transport created"
        );
        Ok(transport)
    }

    async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let transports: Vec<_> = self
            .inner
            .transports
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for transport in transports {
            transport.teardown(false);
        }
        debug!(router_id = %self.inner.id, "Loopback router closed");
    }
}

struct LocalTransport {
    id: TransportId,
    router: Weak<RouterInner>,
    parameters: TransportParameters,
    connected: AtomicBool,
    closed: AtomicBool,
    producers: Mutex<Vec<Arc<LocalProducer>>>,
    consumers: Mutex<Vec<Arc<LocalConsumer>>>,
}

impl LocalTransport {
    fn router(&self) -> EngineResult<Arc<RouterInner>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::Transport(format!("transport {} is closed", self.id)));
        }
        let router = self.router.upgrade().ok_or(EngineError::Closed)?;
        router.ensure_open()?;
        Ok(router)
    }

    /// Close the transport and everything carried on it, reporting each loss.
    /// Returns true when this call performed the close.
    fn teardown(&self, report_self: bool) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let router = self.router.upgrade();
        if let Some(router) = &router {
            router.transports.remove(&self.id);
            router.engine.transports.remove(&self.id);
        }

        for producer in std::mem::take(&mut *self.producers.lock()) {
            producer.shutdown(true);
        }
        for consumer in std::mem::take(&mut *self.consumers.lock()) {
            if consumer.mark_closed() {
                if let Some(router) = &router {
                    router.emit(EngineEvent::ConsumerClosed {
                        consumer_id: consumer.id.clone(),
                        producer_id: consumer.producer_id.clone(),
                    });
                }
            }
        }

        if report_self {
            if let Some(router) = &router {
                router.emit(EngineEvent::TransportClosed {
                    transport_id: self.id.clone(),
                });
            }
        }
        true
    }
}

#[async_trait]
impl MediaTransport for LocalTransport {
    fn id(&self) -> TransportId {
        self.id.clone()
    }

    fn parameters(&self) -> TransportParameters {
        self.parameters.clone()
    }

    async fn connect(&self, dtls_parameters: DtlsParameters) -> EngineResult<()> {
        self.router()?;
        if !dtls_parameters.0.is_object() {
            return Err(EngineError::Transport(
                "DTLS parameters must be an object".to_string(),
            ));
        }
        if self.connected.swap(true, Ordering::AcqRel) {
            return Err(EngineError::Transport(format!(
                "transport {} is already connected",
                self.id
            )));
        }
        Ok(())
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> EngineResult<Arc<dyn MediaProducer>> {
        let router = self.router()?;
        let codec = rtp_parameters
            .media_codec()
            .ok_or_else(|| EngineError::Producer("RTP parameters carry no media codec".to_string()))?;
        let supported = router
            .capabilities
            .codecs
            .iter()
            .any(|c| c.kind == kind && c.accepts(codec));
        if !supported {
            return Err(EngineError::Producer(format!(
                "codec {} is not supported for {kind}",
                codec.mime_type
            )));
        }

        let producer = Arc::new(LocalProducer {
            id: ProducerId::generate(),
            kind,
            rtp_parameters,
            paused: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            consumers: Mutex::new(Vec::new()),
            router: Arc::downgrade(&router),
        });
        router
            .producers
            .insert(producer.id.clone(), Arc::clone(&producer));
        self.producers.lock().push(Arc::clone(&producer));
        Ok(producer)
    }

    async fn consume(
        &self,
        producer_id: &ProducerId,
        capabilities: &RtpCapabilities,
        paused: bool,
    ) -> EngineResult<Arc<dyn MediaConsumer>> {
        let router = self.router()?;
        let producer = router
            .producers
            .get(producer_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| EngineError::Consumer(format!("unknown producer {producer_id}")))?;

        let compatible = producer
            .rtp_parameters
            .media_codec()
            .is_some_and(|codec| capabilities.supports(codec));
        if !compatible {
            return Err(EngineError::Consumer(format!(
                "capabilities cannot decode producer {producer_id}"
            )));
        }

        let mut rtp_parameters = producer.rtp_parameters.clone();
        rtp_parameters
            .codecs
            .retain(|codec| codec.is_rtx() || capabilities.supports(codec));
        rtp_parameters.mid = None;

        let consumer = Arc::new(LocalConsumer {
            id: ConsumerId::generate(),
            producer_id: producer_id.clone(),
            kind: producer.kind,
            rtp_parameters,
            paused: AtomicBool::new(paused),
            closed: AtomicBool::new(false),
        });
        producer.consumers.lock().push(Arc::clone(&consumer));
        self.consumers.lock().push(Arc::clone(&consumer));
        Ok(consumer)
    }

    async fn close(&self) {
        self.teardown(false);
    }
}

struct LocalProducer {
    id: ProducerId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    paused: AtomicBool,
    closed: AtomicBool,
    consumers: Mutex<Vec<Arc<LocalConsumer>>>,
    router: Weak<RouterInner>,
}

impl LocalProducer {
    fn shutdown(&self, report_self: bool) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let router = self.router.upgrade();
        if let Some(router) = &router {
            router.producers.remove(&self.id);
        }

        for consumer in std::mem::take(&mut *self.consumers.lock()) {
            if consumer.mark_closed() {
                if let Some(router) = &router {
                    router.emit(EngineEvent::ConsumerClosed {
                        consumer_id: consumer.id.clone(),
                        producer_id: self.id.clone(),
                    });
                }
            }
        }

        if report_self {
            if let Some(router) = &router {
                router.emit(EngineEvent::ProducerClosed {
                    producer_id: self.id.clone(),
                });
            }
        }
    }

    fn ensure_open(&self) -> EngineResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(EngineError::Producer(format!("producer {} is closed", self.id)))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl MediaProducer for LocalProducer {
    fn id(&self) -> ProducerId {
        self.id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    async fn pause(&self) -> EngineResult<()> {
        self.ensure_open()?;
        let faulted = self
            .router
            .upgrade()
            .is_some_and(|router| router.engine.pause_faults.lock().contains(&self.id));
        if faulted {
            return Err(EngineError::Producer(format!(
                "producer {} refused to pause",
                self.id
            )));
        }
        self.paused.store(true, Ordering::Release);
        Ok(())
    }

    async fn resume(&self) -> EngineResult<()> {
        self.ensure_open()?;
        self.paused.store(false, Ordering::Release);
        Ok(())
    }

    async fn close(&self) {
        self.shutdown(false);
    }
}

struct LocalConsumer {
    id: ConsumerId,
    producer_id: ProducerId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    paused: AtomicBool,
    closed: AtomicBool,
}

impl LocalConsumer {
    /// Returns true when this call performed the close
    fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    fn ensure_open(&self) -> EngineResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(EngineError::Consumer(format!("consumer {} is closed", self.id)))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl MediaConsumer for LocalConsumer {
    fn id(&self) -> ConsumerId {
        self.id.clone()
    }

    fn producer_id(&self) -> ProducerId {
        self.producer_id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> RtpParameters {
        self.rtp_parameters.clone()
    }

    async fn pause(&self) -> EngineResult<()> {
        self.ensure_open()?;
        self.paused.store(true, Ordering::Release);
        Ok(())
    }

    async fn resume(&self) -> EngineResult<()> {
        self.ensure_open()?;
        self.paused.store(false, Ordering::Release);
        Ok(())
    }

    async fn close(&self) {
        self.mark_closed();
    }
}

fn loopback_parameters(port: u16) -> TransportParameters {
    let fingerprint = uuid::Uuid::new_v4()
        .as_bytes()
        .iter()
        .chain(uuid::Uuid::new_v4().as_bytes())
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":");

    TransportParameters {
        ice_parameters: json!({
            "usernameFragment": nanoid::nanoid!(16),
            "password": nanoid::nanoid!(32),
            "iceLite": true,
        }),
        ice_candidates: vec![json!({
            "foundation": "udpcandidate",
            "priority": 1_076_302_079_u32,
            "ip": "127.0.0.1",
            "protocol": "udp",
            "port": port,
            "type": "host",
        })],
        dtls_parameters: json!({
            "role": "auto",
            "fingerprints": [{ "algorithm": "sha-256", "value": fingerprint }],
        }),
        sctp_parameters: None,
    }
}
