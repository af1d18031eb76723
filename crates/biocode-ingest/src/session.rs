//! Ingestion session
//!
//! One [`IngestSession`] owns everything a run needs: the source connection,
//! the declarer, the cursor, the dead-letter log and the per-run cache. It
//! walks images in ascending id order, one at a time:
//!
//! 1. skip images already carrying an annotation in the namespace
//! 2. compute (or fetch from cache) the content identifier
//! 3. declare it, best effort
//! 4. write the annotation
//! 5. advance and persist the watermark
//!
//! A lost source connection interrupts the image without advancing the
//! watermark, so it is retried after reconnecting and backing off. An image
//! that keeps losing the connection is failed once its retry budget is spent.
//! Every other failure is recorded and the watermark moves on.

use crate::annotation::Annotation;
use crate::cache::ContentCache;
use crate::config::{ConfigError, FailurePolicy, ServiceConfig};
use crate::cursor::{Cursor, CursorError, DeadLetterLog};
use crate::identify::{identify_image, Identification, IdentifyError};
use crate::source::{ImageId, ImageSource, SourceError, SourceImage};
use crate::state::{validate_transition, IngestState, StateError};
use biocode_core::ContentIdentifier;
use biocode_declare::{
    DeclarationClient, DeclarationOutcome, Declare, DeclareError, DisabledDeclarer, KeyError,
    Keypair,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// What happened to one image
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageOutcome {
    /// Identified and annotated
    Processed {
        /// Content identifier written to the annotation
        identifier: ContentIdentifier,
        /// Registry result
        declaration: DeclarationOutcome,
        /// Identifier came from the per-run cache
        cached: bool,
    },
    /// Nothing to do
    Skipped(String),
    /// Gave up on the image
    Failed(String),
}

/// Counters for a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestStats {
    /// Pages fetched
    pub pages: u64,
    /// Images annotated
    pub processed: u64,
    /// Images skipped
    pub skipped: u64,
    /// Images given up on
    pub failed: u64,
    /// Images with an external id
    pub declared: u64,
    /// Identifiers served from cache
    pub cache_hits: u64,
    /// Reconnects after a lost connection
    pub reconnects: u64,
}

/// Sender side of the stop signal
#[derive(Debug, Clone)]
pub struct StopHandle(Arc<watch::Sender<bool>>);

impl StopHandle {
    /// Ask the session to stop after the current image
    pub fn stop(&self) {
        self.0.send_replace(true);
    }
}

/// Receiver side of the stop signal
#[derive(Debug, Clone)]
pub struct StopSignal(watch::Receiver<bool>);

impl StopSignal {
    /// Signal that never fires
    #[must_use]
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self(rx)
    }

    /// Whether a stop was requested
    #[inline]
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolve once a stop is requested
    pub async fn stopped(&mut self) {
        loop {
            if *self.0.borrow_and_update() {
                return;
            }
            if self.0.changed().await.is_err() {
                // sender gone: nobody can stop us any more
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Create a connected stop handle and signal
#[must_use]
pub fn stop_channel() -> (StopHandle, StopSignal) {
    let (tx, rx) = watch::channel(false);
    (StopHandle(Arc::new(tx)), StopSignal(rx))
}

/// Declarer for `config`, using the key from the environment
///
/// Falls back to a [`DisabledDeclarer`] when anything is missing.
#[must_use]
pub fn declarer_from_config(config: &ServiceConfig) -> Arc<dyn Declare> {
    build_declarer(config, Keypair::from_env())
}

/// Declarer for `config` and an already resolved key
#[must_use]
pub fn build_declarer(config: &ServiceConfig, key: Result<Keypair, KeyError>) -> Arc<dyn Declare> {
    let client = key.map_err(DeclareError::from).and_then(|keypair| {
        DeclarationClient::new(
            &config.registry,
            keypair,
            config.submission_retry,
            config.request_timeout(),
        )
    });
    match client {
        Ok(client) => {
            info!(endpoint = client.endpoint(), "declarations enabled");
            Arc::new(client)
        }
        Err(e) => {
            info!(reason = %e, "declarations disabled");
            Arc::new(DisabledDeclarer::new(e.to_string()))
        }
    }
}

enum Step {
    Idle,
    Worked,
    Stopped,
}

/// Explicit state of one ingestion run
pub struct IngestSession<S: ImageSource> {
    source: S,
    declarer: Arc<dyn Declare>,
    config: ServiceConfig,
    cursor: Cursor,
    dead_letters: DeadLetterLog,
    cache: ContentCache,
    state: IngestState,
    stats: IngestStats,
    stop: StopSignal,
    /// Image whose processing lost the connection, with attempts so far
    interrupted: Option<(ImageId, u32)>,
    /// Connection losses since the last successful listing
    losses: u32,
}

impl<S: ImageSource> IngestSession<S> {
    /// Build a session, loading the cursor from the state directory
    ///
    /// A corrupt cursor file is logged and replaced by the origin; existing
    /// annotations keep already handled images from being redone.
    ///
    /// # Errors
    /// Returns error on invalid configuration or unreadable state
    pub fn new(
        source: S,
        declarer: Arc<dyn Declare>,
        config: ServiceConfig,
        stop: StopSignal,
    ) -> Result<Self, IngestError> {
        config.validate()?;
        let cursor = match Cursor::load(&config.state_dir) {
            Ok(cursor) => cursor,
            Err(CursorError::Corrupt { path, source }) => {
                warn!(path = %path.display(), error = %source, "corrupt cursor, starting from origin");
                Cursor::origin(&config.state_dir)
            }
            Err(e) => return Err(e.into()),
        };
        info!(
            watermark = cursor.watermark(),
            state_dir = %config.state_dir.display(),
            mode = %config.hash_mode,
            "loaded ingestion state"
        );
        Ok(Self {
            source,
            declarer,
            dead_letters: DeadLetterLog::new(&config.state_dir),
            cache: ContentCache::new(config.cache_capacity),
            config,
            cursor,
            state: IngestState::Disconnected,
            stats: IngestStats::default(),
            stop,
            interrupted: None,
            losses: 0,
        })
    }

    /// Rewind the watermark to the origin
    ///
    /// # Errors
    /// Returns error if the cursor cannot be written
    pub fn reset_cursor(&mut self) -> Result<(), IngestError> {
        self.cursor.reset()?;
        info!("watermark reset to origin");
        Ok(())
    }

    /// Current watermark
    #[inline]
    #[must_use]
    pub fn watermark(&self) -> ImageId {
        self.cursor.watermark()
    }

    /// Current state
    #[inline]
    #[must_use]
    pub fn state(&self) -> IngestState {
        self.state
    }

    /// Counters so far
    #[inline]
    #[must_use]
    pub fn stats(&self) -> IngestStats {
        self.stats
    }

    /// Dead-letter log of this session
    #[inline]
    #[must_use]
    pub fn dead_letters(&self) -> &DeadLetterLog {
        &self.dead_letters
    }

    /// Run until stopped or the source is unreachable for good
    ///
    /// # Errors
    /// Returns error when connection retries are exhausted or durable state
    /// cannot be written
    pub async fn run(mut self) -> Result<IngestStats, IngestError> {
        let result = self.run_inner().await;
        self.finish(result)
    }

    /// Process pages until one comes back empty, then return
    ///
    /// Connects first if needed. Connection loss is handled as in [`run`](Self::run).
    ///
    /// # Errors
    /// Returns error when connection retries are exhausted or durable state
    /// cannot be written
    pub async fn drain(&mut self) -> Result<IngestStats, IngestError> {
        let result = self.drain_inner().await;
        match result {
            Ok(()) if !self.state.is_terminal() && !self.stop.is_stopped() => Ok(self.stats),
            other => {
                let stats = self.finish(other)?;
                Ok(stats)
            }
        }
    }

    async fn run_inner(&mut self) -> Result<(), IngestError> {
        if !self.start().await? {
            return Ok(());
        }
        loop {
            if self.stop.is_stopped() {
                return Ok(());
            }
            match self.step().await? {
                Step::Idle => {
                    if self.sleep_or_stop(self.config.poll_interval()).await {
                        return Ok(());
                    }
                }
                Step::Worked => {}
                Step::Stopped => return Ok(()),
            }
        }
    }

    async fn drain_inner(&mut self) -> Result<(), IngestError> {
        if self.state == IngestState::Disconnected && !self.start().await? {
            return Ok(());
        }
        loop {
            if self.stop.is_stopped() {
                return Ok(());
            }
            match self.step().await? {
                Step::Idle | Step::Stopped => return Ok(()),
                Step::Worked => {}
            }
        }
    }

    fn finish(&mut self, result: Result<(), IngestError>) -> Result<IngestStats, IngestError> {
        if !self.state.is_terminal() {
            self.transition(IngestState::Stopped)?;
        }
        match result {
            Ok(()) => {
                info!(
                    watermark = self.cursor.watermark(),
                    processed = self.stats.processed,
                    skipped = self.stats.skipped,
                    failed = self.stats.failed,
                    declared = self.stats.declared,
                    "ingestion stopped"
                );
                Ok(self.stats)
            }
            Err(e) => {
                error!(error = %e, watermark = self.cursor.watermark(), "ingestion aborted");
                Err(e)
            }
        }
    }

    fn transition(&mut self, to: IngestState) -> Result<(), StateError> {
        validate_transition(self.state, to)?;
        debug!(from = ?self.state, to = ?to, "state transition");
        self.state = to;
        Ok(())
    }

    /// Disconnected -> Connecting -> Polling; `false` if stopped meanwhile
    async fn start(&mut self) -> Result<bool, IngestError> {
        self.transition(IngestState::Connecting)?;
        if !self.connect_with_retry().await? {
            return Ok(false);
        }
        self.transition(IngestState::Polling)?;
        Ok(true)
    }

    async fn connect_with_retry(&mut self) -> Result<bool, IngestError> {
        let policy = self.config.connection_retry;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.source.connect().await {
                Ok(()) => {
                    info!(attempt, "connected to image source");
                    return Ok(true);
                }
                Err(e) if policy.allows_retry(attempt) => {
                    let delay = policy.delay_after(attempt - 1);
                    warn!(
                        attempt,
                        max_attempts = policy.max_attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "connect failed, retrying"
                    );
                    if self.sleep_or_stop(delay).await {
                        return Ok(false);
                    }
                }
                Err(e) => {
                    error!(attempts = attempt, error = %e, "image source unreachable");
                    return Err(IngestError::ConnectionExhausted {
                        attempts: attempt,
                        last: e.to_string(),
                    });
                }
            }
        }
    }

    async fn step(&mut self) -> Result<Step, IngestError> {
        match self.poll_page().await {
            Ok(0) => Ok(Step::Idle),
            Ok(_) => Ok(Step::Worked),
            Err(e) if e.is_connection_loss() => {
                self.losses += 1;
                if !self.config.connection_retry.allows_retry(self.losses) {
                    error!(losses = self.losses, error = %e, "connection keeps dropping");
                    return Err(IngestError::ConnectionExhausted {
                        attempts: self.losses,
                        last: e.to_string(),
                    });
                }
                warn!(error = %e, watermark = self.cursor.watermark(), "source connection lost");
                self.transition(IngestState::Backoff)?;
                self.stats.reconnects += 1;
                let delay = match self.interrupted {
                    Some((_, attempts)) => self.config.image_retry.delay_after(attempts - 1),
                    None => self.config.connection_retry.delay_after(self.losses - 1),
                };
                if self.sleep_or_stop(delay).await || !self.connect_with_retry().await? {
                    return Ok(Step::Stopped);
                }
                self.transition(IngestState::Polling)?;
                Ok(Step::Worked)
            }
            Err(e) => Err(e),
        }
    }

    /// Fetch one page after the watermark and process it; returns its size
    async fn poll_page(&mut self) -> Result<usize, IngestError> {
        let images = self
            .source
            .images_after(self.cursor.watermark(), self.config.batch_size)
            .await?;
        self.losses = 0;
        self.stats.pages += 1;
        if images.is_empty() {
            debug!(watermark = self.cursor.watermark(), "no new images");
            return Ok(0);
        }

        self.transition(IngestState::Processing)?;
        let count = images.len();
        for image in images {
            if self.stop.is_stopped() {
                info!(image_id = image.id(), "stop requested, leaving page");
                break;
            }
            self.process_image(image.as_ref()).await?;
        }
        self.transition(IngestState::Polling)?;
        info!(
            images = count,
            watermark = self.cursor.watermark(),
            processed = self.stats.processed,
            skipped = self.stats.skipped,
            failed = self.stats.failed,
            "page complete"
        );
        Ok(count)
    }

    /// Handle one image and advance the watermark past it
    ///
    /// # Errors
    /// Returns error for a lost connection or unwritable durable state. The
    /// watermark stays put on a lost connection until the image has used up
    /// its retry budget; it is then failed and passed before the error is
    /// returned.
    pub async fn process_image(&mut self, image: &dyn SourceImage) -> Result<ImageOutcome, IngestError> {
        let image_id = image.id();
        let span = info_span!("image", image_id, name = image.name());
        self.handle_image(image).instrument(span).await.map_err(|e| {
            if let Some((_, attempts)) = self.interrupted.filter(|_| e.is_connection_loss()) {
                warn!(image_id, attempts, error = %e, "connection lost while processing, will retry image");
            }
            e
        })
    }

    async fn handle_image(&mut self, image: &dyn SourceImage) -> Result<ImageOutcome, IngestError> {
        let image_id = image.id();
        let mut lost = None;
        let outcome = match self.evaluate(image).await {
            Ok(outcome) => outcome,
            Err(IdentifyError::Source(e)) if e.is_connection_loss() => {
                let attempts = match self.interrupted {
                    Some((id, n)) if id == image_id => n + 1,
                    _ => 1,
                };
                self.interrupted = Some((image_id, attempts));
                if self.config.image_retry.allows_retry(attempts) {
                    return Err(e.into());
                }
                let reason = format!("connection lost {attempts} times while processing: {e}");
                lost = Some(e);
                ImageOutcome::Failed(reason)
            }
            Err(e) => ImageOutcome::Failed(e.to_string()),
        };
        self.interrupted = None;

        match &outcome {
            ImageOutcome::Processed {
                declaration, cached, ..
            } => {
                self.stats.processed += 1;
                if declaration.is_declared() {
                    self.stats.declared += 1;
                }
                if *cached {
                    self.stats.cache_hits += 1;
                }
            }
            ImageOutcome::Skipped(reason) => {
                debug!(reason = %reason, "skipped");
                self.stats.skipped += 1;
            }
            ImageOutcome::Failed(reason) => {
                error!(image_id, reason = %reason, "image failed");
                self.stats.failed += 1;
                if self.config.failure_policy == FailurePolicy::DeadLetter {
                    self.dead_letters.append(image_id, reason)?;
                }
            }
        }

        self.cursor.advance(image_id)?;
        match lost {
            Some(e) => Err(e.into()),
            None => Ok(outcome),
        }
    }

    async fn evaluate(&self, image: &dyn SourceImage) -> Result<ImageOutcome, IdentifyError> {
        let image_id = image.id();
        let namespace = self.config.namespace.as_str();

        if !image.annotations(namespace).await?.is_empty() {
            return Ok(ImageOutcome::Skipped("already annotated".into()));
        }

        let identified = match identify_image(
            image,
            self.config.hash_mode,
            self.config.chunk_size,
            &self.cache,
        )
        .await?
        {
            Identification::Done(identified) => identified,
            Identification::Empty(reason) => {
                warn!(image_id, reason, "nothing to hash");
                return Ok(ImageOutcome::Skipped(reason.to_string()));
            }
        };

        let declaration = self.declarer.declare(&identified.identifier, image_id).await;
        let annotation = Annotation::for_identifier(
            namespace,
            &identified.identifier,
            declaration.iscc_id(),
            self.config.hash_mode,
            identified.source_file.as_deref(),
        );
        image.write_annotation(&annotation).await?;
        info!(
            iscc_code = %identified.identifier.content_code,
            iscc_id = declaration.iscc_id().unwrap_or("-"),
            cached = identified.cached,
            "annotated"
        );

        Ok(ImageOutcome::Processed {
            identifier: identified.identifier,
            declaration,
            cached: identified.cached,
        })
    }

    async fn sleep_or_stop(&mut self, delay: Duration) -> bool {
        let stopped = tokio::select! {
            () = tokio::time::sleep(delay) => false,
            () = self.stop.stopped() => true,
        };
        stopped || self.stop.is_stopped()
    }
}

/// Fatal ingestion failures
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// Store failure that escaped image handling
    #[error("source error: {0}")]
    Source(#[from] SourceError),

    /// Cursor or dead-letter log could not be written
    #[error("durable state error: {0}")]
    Cursor(#[from] CursorError),

    /// Bad configuration
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Internal state machine violation
    #[error(transparent)]
    State(#[from] StateError),

    /// Source still unreachable after every retry
    #[error("image source unreachable after {attempts} attempts: {last}")]
    ConnectionExhausted { attempts: u32, last: String },
}

impl IngestError {
    /// Check if the error means the connection is gone
    #[inline]
    #[must_use]
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, Self::Source(e) if e.is_connection_loss())
    }
}
