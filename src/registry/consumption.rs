//! Consumption manager
//!
//! Binds consumers on a session's receive transport to the room's live
//! producers. Video consumers start paused and are resumed by the client once
//! its receive transport is wired up; audio starts flowing immediately.

use std::sync::Arc;
use std::time::{Duration, Instant};

use super::bounded;
use super::production::{ProducerRef, ProductionManager};
use super::transport::TransportState;
use crate::engine::{
    ConsumerId, ConsumerType, EngineConsumer, MediaEngine, MediaKind, ProducerId, RtpCapabilities,
};
use crate::error::{Direction, Error, Result};
use crate::protocol::ConsumerDescriptor;
use crate::server::config::MediaConfig;
use crate::session::SessionState;
use crate::stats::RoomStats;

/// A consumer owned by a session
pub struct ConsumerEntry {
    consumer: Arc<dyn EngineConsumer>,
    created_at: Instant,
}

impl ConsumerEntry {
    pub fn id(&self) -> ConsumerId {
        self.consumer.id()
    }

    pub fn producer_id(&self) -> ProducerId {
        self.consumer.producer_id()
    }

    pub fn kind(&self) -> MediaKind {
        self.consumer.kind()
    }

    pub fn paused(&self) -> bool {
        self.consumer.paused()
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

impl std::fmt::Debug for ConsumerEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerEntry")
            .field("id", &self.id())
            .field("producer_id", &self.producer_id())
            .field("kind", &self.kind())
            .field("paused", &self.paused())
            .finish()
    }
}

/// Creates, resumes and closes consumers
pub struct ConsumptionManager {
    engine: Arc<dyn MediaEngine>,
    production: Arc<ProductionManager>,
    config: MediaConfig,
    stats: Arc<RoomStats>,
}

impl ConsumptionManager {
    pub fn new(
        engine: Arc<dyn MediaEngine>,
        production: Arc<ProductionManager>,
        config: MediaConfig,
        stats: Arc<RoomStats>,
    ) -> Self {
        Self {
            engine,
            production,
            config,
            stats,
        }
    }

    /// Whether a device with `rtp_capabilities` can receive `producer_id`
    pub fn can_consume(&self, producer_id: &ProducerId, rtp_capabilities: &RtpCapabilities) -> bool {
        self.engine.can_consume(producer_id, rtp_capabilities)
    }

    /// Resolve which producer a `consume` request targets
    ///
    /// An explicit producer id wins, then the current producer of the
    /// requested kind, then the current video producer, then audio.
    pub async fn resolve_target(
        &self,
        producer_id: Option<&ProducerId>,
        kind: Option<MediaKind>,
    ) -> Result<ProducerRef> {
        if let Some(id) = producer_id {
            return self
                .production
                .get_producer(id)
                .await
                .ok_or_else(|| Error::NoProducer(Some(id.clone())));
        }
        if let Some(kind) = kind {
            return self
                .production
                .get_current_producer(kind)
                .await
                .ok_or(Error::NoProducer(None));
        }
        self.production
            .current_producers()
            .await
            .into_iter()
            .next()
            .ok_or(Error::NoProducer(None))
    }

    /// Create a consumer of the target producer on the session's receive
    /// transport
    pub async fn consume(
        &self,
        session: &mut SessionState,
        producer_id: Option<&ProducerId>,
        kind: Option<MediaKind>,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<ConsumerDescriptor> {
        let session_id = session.id();
        let entry = session
            .transport(Direction::Recv)
            .ok_or(Error::NoReceiveTransport)?;
        if entry.state().is_terminal() {
            return Err(Error::TransportUnusable(entry.id()));
        }

        let target = self.resolve_target(producer_id, kind).await?;
        if !self.can_consume(&target.id, rtp_capabilities) {
            tracing::warn!(
                session_id = session_id,
                producer_id = %target.id,
                "Consume rejected, incompatible capabilities"
            );
            return Err(Error::Incompatible(target.id));
        }

        let _negotiation = entry.begin_negotiation()?;
        let transport = Arc::clone(entry.transport());
        let transport_id = entry.id();

        let paused = target.kind == MediaKind::Video;
        let consumer = bounded(
            "consume",
            self.config.engine_timeout,
            transport.consume(&target.id, rtp_capabilities, paused),
        )
        .await?;
        self.stats.consumer_created();

        if consumer.consumer_type() == ConsumerType::Simulcast {
            let layers = self.config.preferred_layers;
            let result = bounded(
                "setPreferredLayers",
                self.config.engine_timeout,
                consumer.set_preferred_layers(layers),
            )
            .await;
            if let Err(e) = result {
                consumer.close();
                self.stats.consumer_closed();
                return Err(e.into());
            }
        }

        let descriptor = ConsumerDescriptor {
            producer_id: target.id.clone(),
            id: consumer.id(),
            kind: consumer.kind(),
            rtp_parameters: consumer.rtp_parameters(),
            consumer_type: consumer.consumer_type(),
            producer_paused: consumer.producer_paused(),
        };

        let replaced = session.insert_consumer(ConsumerEntry {
            consumer,
            created_at: Instant::now(),
        });
        if let Some(old) = replaced {
            self.close(old);
        }

        tracing::info!(
            session_id = session_id,
            consumer_id = %descriptor.id,
            producer_id = %descriptor.producer_id,
            transport_id = %transport_id,
            kind = %descriptor.kind,
            paused = paused,
            "Consumer created"
        );

        Ok(descriptor)
    }

    /// Resume one consumer, or every paused consumer of the session
    ///
    /// The receive transport must have been connected (or be connecting).
    pub async fn resume(
        &self,
        session: &mut SessionState,
        consumer_id: Option<&ConsumerId>,
    ) -> Result<()> {
        let entry = session
            .transport(Direction::Recv)
            .ok_or(Error::NoReceiveTransport)?;
        match entry.state() {
            TransportState::Connecting | TransportState::Connected => {}
            TransportState::New => return Err(Error::TransportNotConnected(entry.id())),
            TransportState::Failed | TransportState::Closed => {
                return Err(Error::TransportUnusable(entry.id()))
            }
        }

        let targets: Vec<Arc<dyn EngineConsumer>> = match consumer_id {
            Some(id) => {
                let entry = session.consumer(id).ok_or(Error::NoConsumer)?;
                vec![Arc::clone(&entry.consumer)]
            }
            None => {
                if session.consumers().is_empty() {
                    return Err(Error::NoConsumer);
                }
                session
                    .consumers()
                    .values()
                    .filter(|entry| entry.paused())
                    .map(|entry| Arc::clone(&entry.consumer))
                    .collect()
            }
        };

        for consumer in targets {
            bounded("resume", self.config.engine_timeout, consumer.resume()).await?;
            tracing::debug!(
                session_id = session.id(),
                consumer_id = %consumer.id(),
                "Consumer resumed"
            );
        }
        Ok(())
    }

    /// Close the session's consumers bound to `producer_id`
    pub fn release_for_producer(&self, session: &mut SessionState, producer_id: &ProducerId) -> usize {
        let removed = session.remove_consumers_of(producer_id);
        let count = removed.len();
        for entry in removed {
            self.close(entry);
        }
        count
    }

    /// Close every consumer of the session
    pub fn release_all(&self, session: &mut SessionState) -> usize {
        let removed = session.take_consumers();
        let count = removed.len();
        for entry in removed {
            self.close(entry);
        }
        count
    }

    fn close(&self, entry: ConsumerEntry) {
        entry.consumer.close();
        self.stats.consumer_closed();
        tracing::debug!(
            consumer_id = %entry.id(),
            producer_id = %entry.producer_id(),
            age_ms = entry.age().as_millis() as u64,
            "Consumer closed"
        );
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::engine::memory::FailPoint;
    use crate::engine::{ConsumerLayers, DtlsParameters, InMemoryEngine, RtpParameters};
    use crate::registry::TransportRegistry;

    struct Fixture {
        engine: InMemoryEngine,
        transports: TransportRegistry,
        production: Arc<ProductionManager>,
        consumption: ConsumptionManager,
        publisher: SessionState,
    }

    async fn fixture() -> Fixture {
        let engine = InMemoryEngine::new();
        let stats = Arc::new(RoomStats::new());
        let config = MediaConfig::default().engine_timeout(Duration::from_millis(100));
        let shared: Arc<dyn MediaEngine> = Arc::new(engine.clone());
        let transports = TransportRegistry::new(Arc::clone(&shared), config.clone(), Arc::clone(&stats));
        let production = Arc::new(ProductionManager::new(
            16,
            config.engine_timeout,
            Arc::clone(&stats),
        ));
        let consumption =
            ConsumptionManager::new(shared, Arc::clone(&production), config, stats);

        let (mut publisher, _notices) = SessionState::new(1, None);
        transports
            .create(&mut publisher, Direction::Send, false)
            .await
            .unwrap();
        transports
            .connect(
                &mut publisher,
                Direction::Send,
                None,
                DtlsParameters(json!({"role": "client"})),
            )
            .await
            .unwrap();

        Fixture {
            engine,
            transports,
            production,
            consumption,
            publisher,
        }
    }

    impl Fixture {
        async fn produce(&mut self, kind: MediaKind) -> ProducerId {
            self.production
                .produce(&mut self.publisher, None, kind, RtpParameters(json!({})))
                .await
                .unwrap()
        }

        async fn subscriber(&self, id: u64) -> SessionState {
            let (mut session, _notices) = SessionState::new(id, None);
            self.transports
                .create(&mut session, Direction::Recv, false)
                .await
                .unwrap();
            session
        }

        async fn connect(&self, session: &mut SessionState) {
            self.transports
                .connect(
                    session,
                    Direction::Recv,
                    None,
                    DtlsParameters(json!({"role": "client"})),
                )
                .await
                .unwrap();
        }
    }

    fn caps(engine: &InMemoryEngine) -> RtpCapabilities {
        engine.rtp_capabilities()
    }

    #[tokio::test]
    async fn test_video_consumer_starts_paused() {
        let mut f = fixture().await;
        let producer_id = f.produce(MediaKind::Video).await;
        let mut session = f.subscriber(2).await;

        let descriptor = f
            .consumption
            .consume(&mut session, None, None, &caps(&f.engine))
            .await
            .unwrap();

        assert_eq!(descriptor.producer_id, producer_id);
        assert_eq!(descriptor.kind, MediaKind::Video);
        assert_eq!(descriptor.consumer_type, ConsumerType::Simple);
        assert!(!descriptor.producer_paused);
        assert!(session.consumer(&descriptor.id).unwrap().paused());
    }

    #[tokio::test]
    async fn test_audio_consumer_starts_flowing() {
        let mut f = fixture().await;
        f.produce(MediaKind::Audio).await;
        let mut session = f.subscriber(2).await;

        let descriptor = f
            .consumption
            .consume(&mut session, None, Some(MediaKind::Audio), &caps(&f.engine))
            .await
            .unwrap();

        assert_eq!(descriptor.kind, MediaKind::Audio);
        assert!(!session.consumer(&descriptor.id).unwrap().paused());
    }

    #[tokio::test]
    async fn test_target_resolution_prefers_video() {
        let mut f = fixture().await;
        let audio = f.produce(MediaKind::Audio).await;
        let video = f.produce(MediaKind::Video).await;

        assert_eq!(f.consumption.resolve_target(None, None).await.unwrap().id, video);
        assert_eq!(
            f.consumption
                .resolve_target(None, Some(MediaKind::Audio))
                .await
                .unwrap()
                .id,
            audio
        );
        assert_eq!(
            f.consumption.resolve_target(Some(&audio), None).await.unwrap().id,
            audio
        );
        assert!(matches!(
            f.consumption
                .resolve_target(Some(&ProducerId::from("gone")), None)
                .await,
            Err(Error::NoProducer(Some(_)))
        ));
    }

    #[tokio::test]
    async fn test_consume_without_producer() {
        let f = fixture().await;
        let mut session = f.subscriber(2).await;

        let err = f
            .consumption
            .consume(&mut session, None, None, &caps(&f.engine))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::NoProducer(None)));
        assert_eq!(f.engine.ledger().consume_calls, 0);
    }

    #[tokio::test]
    async fn test_consume_without_receive_transport() {
        let mut f = fixture().await;
        f.produce(MediaKind::Video).await;
        let (mut session, _notices) = SessionState::new(2, None);

        let err = f
            .consumption
            .consume(&mut session, None, None, &caps(&f.engine))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoReceiveTransport));
    }

    #[tokio::test]
    async fn test_incompatible_never_reaches_engine() {
        let mut f = fixture().await;
        let producer_id = f.produce(MediaKind::Video).await;
        f.engine.mark_incompatible(&producer_id);
        let mut session = f.subscriber(2).await;

        let err = f
            .consumption
            .consume(&mut session, None, None, &caps(&f.engine))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Incompatible(id) if id == producer_id));
        assert_eq!(f.engine.ledger().consume_calls, 0);
        assert!(session.consumers().is_empty());
    }

    #[tokio::test]
    async fn test_simulcast_consumer_gets_preferred_layers() {
        let mut f = fixture().await;
        f.engine.set_consumer_type(ConsumerType::Simulcast);
        f.produce(MediaKind::Video).await;
        let mut session = f.subscriber(2).await;

        let descriptor = f
            .consumption
            .consume(&mut session, None, None, &caps(&f.engine))
            .await
            .unwrap();

        assert_eq!(descriptor.consumer_type, ConsumerType::Simulcast);
        assert_eq!(
            f.engine.ledger().preferred_layers,
            vec![(descriptor.id, ConsumerLayers::default())]
        );
    }

    #[tokio::test]
    async fn test_failed_preferred_layers_closes_consumer() {
        let mut f = fixture().await;
        f.engine.set_consumer_type(ConsumerType::Simulcast);
        f.engine.fail_next(FailPoint::PreferredLayers);
        f.produce(MediaKind::Video).await;
        let mut session = f.subscriber(2).await;

        let err = f
            .consumption
            .consume(&mut session, None, None, &caps(&f.engine))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Engine(_)));
        assert!(session.consumers().is_empty());
        let ledger = f.engine.ledger();
        assert_eq!(ledger.consumers_created, ledger.consumers_closed);
    }

    #[tokio::test]
    async fn test_reconsume_replaces_consumer() {
        let mut f = fixture().await;
        f.produce(MediaKind::Video).await;
        let mut session = f.subscriber(2).await;

        let first = f
            .consumption
            .consume(&mut session, None, None, &caps(&f.engine))
            .await
            .unwrap();
        let second = f
            .consumption
            .consume(&mut session, None, None, &caps(&f.engine))
            .await
            .unwrap();

        assert_ne!(first.id, second.id);
        assert_eq!(session.consumers().len(), 1);
        assert_eq!(f.engine.ledger().consumers_closed, 1);
    }

    #[tokio::test]
    async fn test_resume_all_paused() {
        let mut f = fixture().await;
        f.produce(MediaKind::Video).await;
        f.produce(MediaKind::Audio).await;
        let mut session = f.subscriber(2).await;
        let caps = caps(&f.engine);
        f.consumption
            .consume(&mut session, None, Some(MediaKind::Video), &caps)
            .await
            .unwrap();
        f.consumption
            .consume(&mut session, None, Some(MediaKind::Audio), &caps)
            .await
            .unwrap();
        f.connect(&mut session).await;

        f.consumption.resume(&mut session, None).await.unwrap();

        // Only the paused video consumer needed resuming
        assert_eq!(f.engine.ledger().resume_calls, 1);
        assert!(session.consumers().values().all(|c| !c.paused()));
    }

    #[tokio::test]
    async fn test_resume_before_connect_is_rejected() {
        let mut f = fixture().await;
        f.produce(MediaKind::Video).await;
        let mut session = f.subscriber(2).await;
        f.consumption
            .consume(&mut session, None, None, &caps(&f.engine))
            .await
            .unwrap();

        let err = f.consumption.resume(&mut session, None).await.unwrap_err();

        assert!(matches!(err, Error::TransportNotConnected(_)));
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidState);
        assert_eq!(f.engine.ledger().resume_calls, 0);
        assert!(session.consumers().values().all(|c| c.paused()));
    }

    #[tokio::test]
    async fn test_resume_without_receive_transport() {
        let f = fixture().await;
        let (mut session, _notices) = SessionState::new(2, None);

        assert!(matches!(
            f.consumption.resume(&mut session, None).await,
            Err(Error::NoReceiveTransport)
        ));
    }

    #[tokio::test]
    async fn test_resume_errors() {
        let mut f = fixture().await;
        let mut session = f.subscriber(2).await;
        f.connect(&mut session).await;

        assert!(matches!(
            f.consumption.resume(&mut session, None).await,
            Err(Error::NoConsumer)
        ));
        assert!(matches!(
            f.consumption
                .resume(&mut session, Some(&ConsumerId::from("nope")))
                .await,
            Err(Error::NoConsumer)
        ));

        f.produce(MediaKind::Video).await;
        let descriptor = f
            .consumption
            .consume(&mut session, None, None, &caps(&f.engine))
            .await
            .unwrap();
        f.engine.fail_next(FailPoint::Resume);
        let err = f
            .consumption
            .resume(&mut session, Some(&descriptor.id))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::EngineFailure);
    }

    #[tokio::test]
    async fn test_release_for_producer() {
        let mut f = fixture().await;
        let video = f.produce(MediaKind::Video).await;
        f.produce(MediaKind::Audio).await;
        let mut session = f.subscriber(2).await;
        let caps = caps(&f.engine);
        f.consumption
            .consume(&mut session, None, Some(MediaKind::Video), &caps)
            .await
            .unwrap();
        f.consumption
            .consume(&mut session, None, Some(MediaKind::Audio), &caps)
            .await
            .unwrap();

        assert_eq!(f.consumption.release_for_producer(&mut session, &video), 1);
        assert_eq!(session.consumers().len(), 1);
        assert_eq!(f.consumption.release_all(&mut session), 1);
        assert!(session.consumers().is_empty());
        assert!(f.engine.ledger().double_closes.is_empty());
    }
}
