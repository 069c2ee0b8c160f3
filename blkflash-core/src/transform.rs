//! The transform stage abstraction and the chain that drives it.
//!
//! Transforms are synchronous and CPU-bound (hashing, re-chunking,
//! decompression, filtering), so the whole chain runs inside a single task
//! between the source and the sink. Each transform may emit zero or more
//! chunks per input chunk and may flush buffered data at end of stream.
use crate::chunk::Chunk;
use crate::error::{FlashError, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// A pipeline stage that turns chunks into chunks.
pub trait Transform: Send {
    /// Short stage name used in logs and [`FlashError::Stage`].
    fn name(&self) -> &'static str;

    /// Processes one chunk, appending any output to `out`.
    fn push(&mut self, chunk: Chunk, out: &mut Vec<Chunk>) -> Result<()>;

    /// Flushes buffered state at end of stream.
    fn finish(&mut self, _out: &mut Vec<Chunk>) -> Result<()> {
        Ok(())
    }

    /// Identity transforms are left out of the pipeline entirely.
    fn is_pass_through(&self) -> bool {
        false
    }
}

/// Forwards every chunk unchanged.
#[derive(Debug, Default)]
pub struct PassThrough;

impl Transform for PassThrough {
    fn name(&self) -> &'static str {
        "pass-through"
    }

    fn push(&mut self, chunk: Chunk, out: &mut Vec<Chunk>) -> Result<()> {
        out.push(chunk);
        Ok(())
    }

    fn is_pass_through(&self) -> bool {
        true
    }
}

/// An ordered chain of transforms.
#[derive(Default)]
pub struct Pipeline {
    stages: Vec<Box<dyn Transform>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, stage: impl Transform + 'static) -> &mut Self {
        self.stages.push(Box::new(stage));
        self
    }

    pub fn append_boxed(&mut self, stage: Box<dyn Transform>) -> &mut Self {
        self.stages.push(stage);
        self
    }

    pub fn prepend(&mut self, stage: impl Transform + 'static) -> &mut Self {
        self.stages.insert(0, Box::new(stage));
        self
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Stage names in order, for logging.
    pub fn names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Runs one chunk through every stage.
    pub fn feed(&mut self, chunk: Chunk) -> Result<Vec<Chunk>> {
        let mut pending = vec![chunk];
        for stage in &mut self.stages {
            let mut next = Vec::with_capacity(pending.len());
            for chunk in pending.drain(..) {
                stage.push(chunk, &mut next)?;
            }
            pending = next;
            if pending.is_empty() {
                break;
            }
        }
        Ok(pending)
    }

    /// Flushes every stage in order, feeding each stage's tail into the next.
    pub fn finish(&mut self) -> Result<Vec<Chunk>> {
        let mut pending = Vec::new();
        for stage in &mut self.stages {
            let mut next = Vec::with_capacity(pending.len() + 1);
            for chunk in pending.drain(..) {
                stage.push(chunk, &mut next)?;
            }
            stage.finish(&mut next)?;
            pending = next;
        }
        Ok(pending)
    }

    /// Pumps chunks from `input` through the chain into `output`.
    ///
    /// Ends when `input` is exhausted. If the pass was torn down (`cancel`),
    /// the chain is not flushed, so a partial stream never reaches the sink
    /// as if it were complete. A failure cancels the pass.
    pub(crate) async fn run(
        mut self,
        mut input: mpsc::Receiver<Chunk>,
        output: mpsc::Sender<Chunk>,
        cancel: CancellationToken,
    ) -> Result<()> {
        debug!(stages = ?self.names(), "pipeline started");
        let result = self.pump(&mut input, &output, &cancel).await;
        if result.is_err() {
            cancel.cancel();
        }
        debug!(ok = result.is_ok(), "pipeline stopped");
        result
    }

    async fn pump(
        &mut self,
        input: &mut mpsc::Receiver<Chunk>,
        output: &mpsc::Sender<Chunk>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        while let Some(chunk) = input.recv().await {
            trace!(len = chunk.len(), "pipeline chunk");
            for out in self.feed(chunk)? {
                // A closed sink has already failed and reports its own error.
                if output.send(out).await.is_err() {
                    return Ok(());
                }
            }
        }

        if cancel.is_cancelled() {
            return Err(FlashError::Aborted);
        }

        for out in self.finish()? {
            if output.send(out).await.is_err() {
                return Ok(());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    /// Splits every chunk in two and emits a marker at end of stream.
    struct Splitter;

    impl Transform for Splitter {
        fn name(&self) -> &'static str {
            "splitter"
        }

        fn push(&mut self, chunk: Chunk, out: &mut Vec<Chunk>) -> Result<()> {
            let mid = chunk.len() / 2;
            out.push(Chunk::new(chunk.data.slice(..mid)));
            out.push(Chunk::new(chunk.data.slice(mid..)));
            Ok(())
        }

        fn finish(&mut self, out: &mut Vec<Chunk>) -> Result<()> {
            out.push(Chunk::new(Bytes::from_static(b"!")));
            Ok(())
        }
    }

    struct Failing;

    impl Transform for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn push(&mut self, _chunk: Chunk, _out: &mut Vec<Chunk>) -> Result<()> {
            Err(FlashError::stage("failing", "boom"))
        }
    }

    #[test]
    fn test_feed_runs_stages_in_order() {
        let mut pipeline = Pipeline::new();
        pipeline.append(Splitter).append(Splitter);

        let out = pipeline.feed(Chunk::new(&b"abcdefgh"[..])).unwrap();
        let parts: Vec<&[u8]> = out.iter().map(|c| c.data.as_ref()).collect();
        assert_eq!(parts, vec![&b"ab"[..], &b"cd"[..], &b"ef"[..], &b"gh"[..]]);
    }

    #[test]
    fn test_finish_flows_through_later_stages() {
        let mut pipeline = Pipeline::new();
        pipeline.append(Splitter).append(PassThrough);

        let out = pipeline.finish().unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].data.as_ref(), b"!");
    }

    #[tokio::test]
    async fn test_run_stops_without_flushing_when_cancelled() {
        let mut pipeline = Pipeline::new();
        pipeline.append(Splitter);

        let (in_tx, in_rx) = mpsc::channel(4);
        let (out_tx, mut out_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        cancel.cancel();
        drop(in_tx);

        let err = pipeline.run(in_rx, out_tx, cancel).await.unwrap_err();
        assert!(err.is_aborted());
        assert!(out_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_run_stage_error_cancels_pass() {
        let mut pipeline = Pipeline::new();
        pipeline.append(Failing);

        let (in_tx, in_rx) = mpsc::channel(4);
        let (out_tx, _out_rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        in_tx.send(Chunk::new(&b"x"[..])).await.unwrap();
        drop(in_tx);

        let err = pipeline.run(in_rx, out_tx, cancel.clone()).await.unwrap_err();
        assert!(matches!(err, FlashError::Stage { stage: "failing", .. }));
        assert!(cancel.is_cancelled());
    }
}
