//! The flash orchestrator.
//!
//! A [`Flasher`] drives one image onto one target. The write pass runs
//! three tasks connected by bounded channels:
//!
//! ```text
//! image source -> [progress] -> [decode] -> checksum -> aligner -> writer
//! image source -> [decode] -> aligner -> block-map filter -> progress -> checksum -> writer
//! ```
//!
//! (sequential and sparse shapes respectively). The verify pass reads the
//! target back over the same channels and compares checksums. Progress,
//! checksums, state changes and the final outcome are published as
//! [`FlashEvent`]s.
use crate::aligner::BlockAligner;
use crate::blockmap::{BlockMap, BlockMapFilter};
use crate::checksum::{Checksum, ChecksumReport, ChecksumSet};
use crate::chunk::Chunk;
use crate::descriptor::Descriptor;
use crate::error::{FlashError, Result};
use crate::event::{FlashEvent, FlashState, PassKind, PassResult};
use crate::image::{Image, ImageSize};
use crate::options::FlashOptions;
use crate::progress::Progress;
use crate::reader::ChunkedReader;
use crate::source::Source;
use crate::transform::{Pipeline, Transform};
use crate::verify::{ByteLimit, compare_checksums};
use crate::writer::CoalescingWriter;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How data is laid out on the target, chosen once per flash.
#[derive(Clone, Debug)]
pub enum PipelineShape {
    /// The whole image, written back to back from offset zero.
    Sequential,
    /// Only the blocks listed in the map, each at its own offset.
    Sparse(Arc<BlockMap>),
}

/// What the write pass hands to the verify pass.
#[derive(Debug)]
struct WriteOutcome {
    bytes_read: u64,
    bytes_written: u64,
    /// End of the furthest write; bounds the read-back of a sparse flash.
    high_water: u64,
    checksum: ChecksumReport,
}

/// Requests that a running flash stop.
#[derive(Clone, Debug)]
pub struct AbortHandle {
    token: CancellationToken,
}

impl AbortHandle {
    /// Tears down the active pass. The flash then fails with
    /// [`FlashError::Aborted`] unless it had already completed.
    pub fn abort(&self) {
        self.token.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }
}

pub struct Flasher {
    options: FlashOptions,
    state: FlashState,
    had_error: bool,
    abort: CancellationToken,
    events: mpsc::UnboundedSender<FlashEvent>,
    /// The target, once the write pass has opened it.
    target: Option<Descriptor>,
}

impl Flasher {
    /// Validates `options` and returns a flasher together with the stream of
    /// events it will publish.
    pub fn new(options: FlashOptions) -> Result<(Self, mpsc::UnboundedReceiver<FlashEvent>)> {
        options.validate()?;
        Checksum::new(&options.checksum_algorithms)?;

        let (events, receiver) = mpsc::unbounded_channel();
        let flasher = Self {
            options,
            state: FlashState::Idle,
            had_error: false,
            abort: CancellationToken::new(),
            events,
            target: None,
        };
        Ok((flasher, receiver))
    }

    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle {
            token: self.abort.clone(),
        }
    }

    pub fn state(&self) -> FlashState {
        self.state
    }

    /// Whether any stage has failed during this flash.
    pub fn had_error(&self) -> bool {
        self.had_error
    }

    /// Writes `image`, verifies it if configured, and reports the outcome.
    ///
    /// Exactly one of [`FlashEvent::Finish`] or [`FlashEvent::Error`] is
    /// published, and the same outcome is returned.
    pub async fn run(&mut self, image: Image) -> Result<PassResult> {
        if self.state != FlashState::Idle {
            return Err(FlashError::InvalidConfig(
                "a flasher can only run once".to_string(),
            ));
        }

        let result = match self.execute(image).await {
            Ok(result) => self.close_target().await.map(|()| result),
            Err(error) => {
                if let Err(close_error) = self.close_target().await {
                    warn!(error = %close_error, "failed to close target");
                }
                Err(error)
            }
        };

        match result {
            Ok(result) => {
                info!(
                    bytes_read = result.bytes_read,
                    bytes_written = result.bytes_written,
                    "flash finished"
                );
                self.set_state(FlashState::Finished);
                self.emit(FlashEvent::Finish(result.clone()));
                Ok(result)
            }
            Err(error) => {
                self.had_error = true;
                if error.is_aborted() {
                    warn!("flash aborted");
                    self.emit(FlashEvent::Abort);
                    self.set_state(FlashState::Aborted);
                } else {
                    warn!(%error, "flash failed");
                    self.set_state(FlashState::Errored);
                }
                self.emit(FlashEvent::Error(error.clone()));
                Err(error)
            }
        }
    }

    async fn execute(&mut self, image: Image) -> Result<PassResult> {
        self.set_state(FlashState::Writing);
        let size = image.size;
        let (source, transform, block_map) = image.into_parts();
        let shape = match block_map {
            Some(map) => PipelineShape::Sparse(Arc::new(map)),
            None => PipelineShape::Sequential,
        };

        let written = self
            .write(Source::Stream(source), size, transform, &shape)
            .await?;
        let result = PassResult {
            bytes_read: written.bytes_read,
            bytes_written: written.bytes_written,
            checksum: written.checksum.checksums.clone(),
        };

        if self.options.verify {
            self.set_state(FlashState::Verifying);
            let actual = self.verify(&written, &shape).await?;
            compare_checksums(&written.checksum.checksums, &actual)?;
            debug!("verification passed");
        }
        Ok(result)
    }

    fn write_pipeline(
        &self,
        size: ImageSize,
        transform: Box<dyn Transform>,
        shape: &PipelineShape,
        checksum: Checksum,
    ) -> Pipeline {
        let mut pipeline = Pipeline::new();
        let sequential = matches!(shape, PipelineShape::Sequential);

        // An estimated size is only meaningful for the bytes as stored.
        if size.final_size.estimation && sequential {
            pipeline.append(self.progress_stage(PassKind::Write, size.original));
        }
        if !transform.is_pass_through() {
            pipeline.append_boxed(transform);
        }
        if !size.final_size.estimation && sequential {
            pipeline.append(self.progress_stage(PassKind::Write, size.final_size.value));
        }

        let aligner = BlockAligner::new(self.options.block_size, self.options.chunk_size);
        match shape {
            PipelineShape::Sparse(map) => {
                pipeline
                    .append(aligner)
                    .append(BlockMapFilter::new(map.clone()))
                    .append(self.progress_stage(PassKind::Write, map.mapped_bytes()))
                    .append(checksum);
            }
            PipelineShape::Sequential => {
                pipeline.append(checksum).append(aligner);
            }
        }
        pipeline
    }

    async fn write(
        &mut self,
        mut source: Source,
        size: ImageSize,
        transform: Box<dyn Transform>,
        shape: &PipelineShape,
    ) -> Result<WriteOutcome> {
        let (checksum, checksum_report) = self.checksum_stage(PassKind::Write)?;
        let pipeline = self.write_pipeline(size, transform, shape, checksum);
        info!(stages = ?pipeline.names(), ?size, "write pass started");

        let writer = CoalescingWriter::new(Descriptor::open(&self.options.target), false)
            .with_threshold(self.options.chunk_size)
            .with_range(self.options.target.start, self.options.target.end);

        let cancel = self.abort.child_token();
        let (source_tx, source_rx) = mpsc::channel(self.options.channel_capacity);
        let (sink_tx, sink_rx) = mpsc::channel(self.options.channel_capacity);

        let source_task: JoinHandle<(u64, Result<()>)> = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                let result = source.run(source_tx, cancel).await;
                (source.bytes_read(), result)
            }
        });
        let pipeline_task = tokio::spawn(pipeline.run(source_rx, sink_tx, cancel.clone()));
        let writer_task = tokio::spawn(async move {
            let mut writer = writer;
            let result = writer.run(sink_rx, cancel).await;
            (writer, result)
        });

        let (source_out, pipeline_out, writer_out) =
            tokio::join!(source_task, pipeline_task, writer_task);
        let (mut writer, writer_result) = writer_out.map_err(join_error)?;
        self.target = writer.take_descriptor();
        let (bytes_read, source_result) = source_out.map_err(join_error)?;
        first_error([source_result, pipeline_out.map_err(join_error)?, writer_result])?;

        let checksum = checksum_report
            .await
            .map_err(|_| FlashError::stage("checksum", "write pass ended without a checksum"))?;
        let stats = writer.stats();
        info!(bytes_read, stats = ?stats, "write pass complete");

        Ok(WriteOutcome {
            bytes_read,
            bytes_written: stats.bytes_written,
            high_water: stats.high_water,
            checksum,
        })
    }

    async fn verify(&mut self, written: &WriteOutcome, shape: &PipelineShape) -> Result<ChecksumSet> {
        let descriptor = match self.target.take() {
            Some(descriptor) => descriptor,
            None => Descriptor::open(&self.options.target),
        };
        let start = self.options.target.start;
        let end = match shape {
            PipelineShape::Sequential => start + written.bytes_written,
            PipelineShape::Sparse(_) => written.high_water.max(start),
        };

        let (checksum, checksum_report) = self.checksum_stage(PassKind::Verify)?;
        let mut pipeline = Pipeline::new();
        pipeline.append(self.progress_stage(PassKind::Verify, end - start));
        match shape {
            PipelineShape::Sequential => {
                pipeline.append(ByteLimit::new(written.checksum.bytes));
            }
            PipelineShape::Sparse(map) => {
                pipeline.append(BlockMapFilter::new(map.clone()));
            }
        }
        pipeline.append(checksum);
        info!(stages = ?pipeline.names(), start, end, "verify pass started");

        let cancel = self.abort.child_token();
        let (source_tx, source_rx) = mpsc::channel(self.options.channel_capacity);
        let (sink_tx, sink_rx) = mpsc::channel(self.options.channel_capacity);

        let mut source = Source::Target(ChunkedReader::new(descriptor, start, end, false));
        let source_task = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                let result = source.run(source_tx, cancel).await;
                (source, result)
            }
        });
        let pipeline_task = tokio::spawn(pipeline.run(source_rx, sink_tx, cancel));
        let drain_task = tokio::spawn(drain(sink_rx));

        let (source_out, pipeline_out, drain_out) =
            tokio::join!(source_task, pipeline_task, drain_task);
        let (source, source_result) = source_out.map_err(join_error)?;
        if let Source::Target(reader) = source {
            self.target = Some(reader.into_descriptor());
        }
        drain_out.map_err(join_error)?;
        first_error([source_result, pipeline_out.map_err(join_error)?])?;

        let report = checksum_report
            .await
            .map_err(|_| FlashError::stage("checksum", "verify pass ended without a checksum"))?;
        info!(bytes = report.bytes, "verify pass complete");
        Ok(report.checksums)
    }

    fn progress_stage(&self, kind: PassKind, length: u64) -> Progress {
        let events = self.events.clone();
        Progress::new(kind, length)
            .with_interval(self.options.progress_interval)
            .on_progress(move |state| {
                let _ = events.send(FlashEvent::Progress(state));
            })
    }

    fn checksum_stage(&self, kind: PassKind) -> Result<(Checksum, oneshot::Receiver<ChecksumReport>)> {
        let (report_tx, report_rx) = oneshot::channel();
        let events = self.events.clone();
        let checksum = Checksum::new(&self.options.checksum_algorithms)?.on_checksum(move |report| {
            let _ = events.send(FlashEvent::Checksum {
                kind,
                checksums: report.checksums.clone(),
            });
            let _ = report_tx.send(report);
        });
        Ok((checksum, report_rx))
    }

    async fn close_target(&mut self) -> Result<()> {
        if let Some(mut target) = self.target.take() {
            target.close().await?;
        }
        Ok(())
    }

    fn set_state(&mut self, state: FlashState) {
        debug!(from = ?self.state, to = ?state, "flash state");
        self.state = state;
        self.emit(FlashEvent::State(state));
    }

    fn emit(&self, event: FlashEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }
}

/// Consumes the output of a pass that has no sink.
async fn drain(mut input: mpsc::Receiver<Chunk>) {
    while input.recv().await.is_some() {}
}

fn join_error(e: JoinError) -> FlashError {
    FlashError::stage("task", e.to_string())
}

/// Picks the error that explains a failed pass.
///
/// Stages torn down because another one failed report
/// [`FlashError::Aborted`]; the root cause is the first other error.
fn first_error<const N: usize>(results: [Result<()>; N]) -> Result<()> {
    let mut aborted = None;
    for result in results {
        match result {
            Ok(()) => {}
            Err(e) if e.is_aborted() => aborted = Some(e),
            Err(e) => return Err(e),
        }
    }
    aborted.map_or(Ok(()), Err)
}

/// A flash running on its own task.
pub struct FlashHandle {
    events: mpsc::UnboundedReceiver<FlashEvent>,
    abort: AbortHandle,
    task: JoinHandle<Result<PassResult>>,
}

impl FlashHandle {
    pub fn abort(&self) {
        self.abort.abort();
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// The next event, or `None` once the flash has ended and every event
    /// has been received.
    pub async fn next_event(&mut self) -> Option<FlashEvent> {
        self.events.recv().await
    }

    /// Waits for the flash to end.
    pub async fn wait(self) -> Result<PassResult> {
        self.task.await.map_err(join_error)?
    }
}

/// Starts flashing `image` on a new task.
pub fn start(image: Image, options: FlashOptions) -> Result<FlashHandle> {
    let (mut flasher, events) = Flasher::new(options)?;
    let abort = flasher.abort_handle();
    let task = tokio::spawn(async move { flasher.run(image).await });
    Ok(FlashHandle {
        events,
        abort,
        task,
    })
}
