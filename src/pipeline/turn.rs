//! Resources owned by the one in-flight turn of a session.
//!
//! An [`ActiveTurn`] holds the turn's cancellation token (a child of the
//! session token), the generator and synthesizer chunk channels, and the
//! spawned generator / synthesizer / playback tasks. It ends either through
//! [`ActiveTurn::release`] once playback has finished, or through
//! [`ActiveTurn::shutdown`] when the turn is cancelled.

use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::conversation::types::TurnId;
use crate::error::{Result, SessionError};
use crate::metrics::Stage;
use crate::pipeline::messages::SynthesizedAudio;
use crate::pipeline::relay::{ChunkReader, ChunkWriter, chunk_channel};

pub struct ActiveTurn {
    id: TurnId,
    cancel: CancellationToken,
    started: Instant,
    llm_writer: Option<ChunkWriter<String>>,
    llm_reader: Option<ChunkReader<String>>,
    tts_writer: Option<ChunkWriter<SynthesizedAudio>>,
    tasks: Vec<(Stage, JoinHandle<()>)>,
}

impl ActiveTurn {
    pub fn new(id: TurnId, session_cancel: &CancellationToken) -> Self {
        Self {
            id,
            cancel: session_cancel.child_token(),
            started: Instant::now(),
            llm_writer: None,
            llm_reader: None,
            tts_writer: None,
            tasks: Vec::new(),
        }
    }

    pub fn id(&self) -> TurnId {
        self.id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    /// Open the generator-chunk channel. The reader is kept until synthesis starts.
    pub fn open_llm_channel(&mut self) {
        let (writer, reader) = chunk_channel();
        self.llm_writer = Some(writer);
        self.llm_reader = Some(reader);
    }

    /// Hand the generator-chunk reader to the synthesizer. `None` if already taken.
    pub fn take_llm_reader(&mut self) -> Option<ChunkReader<String>> {
        self.llm_reader.take()
    }

    /// Open the synthesizer-chunk channel, returning the reader for playback.
    pub fn open_tts_channel(&mut self) -> ChunkReader<SynthesizedAudio> {
        let (writer, reader) = chunk_channel();
        self.tts_writer = Some(writer);
        reader
    }

    pub fn relay_llm(&self, text: String) -> Result<()> {
        match &self.llm_writer {
            Some(writer) => writer.send(text),
            None => Err(SessionError::Pipeline(format!(
                "turn {} has no generator channel",
                self.id
            ))),
        }
    }

    pub fn relay_tts(&self, audio: SynthesizedAudio) -> Result<()> {
        match &self.tts_writer {
            Some(writer) => writer.send(audio),
            None => Err(SessionError::Pipeline(format!(
                "turn {} has no synthesizer channel",
                self.id
            ))),
        }
    }

    pub fn complete_llm(&mut self) {
        if let Some(writer) = self.llm_writer.as_mut() {
            writer.complete();
        }
    }

    pub fn complete_tts(&mut self) {
        if let Some(writer) = self.tts_writer.as_mut() {
            writer.complete();
        }
    }

    /// Keep a spawned stage task so cancellation can wait for it.
    pub fn track(&mut self, stage: Stage, handle: JoinHandle<()>) {
        self.tasks.push((stage, handle));
    }

    /// Finish a turn whose output completed normally.
    pub fn release(mut self) {
        self.complete_llm();
        self.complete_tts();
        debug!("turn {} released", self.id);
    }

    /// Cancel the turn and tear down its scope.
    ///
    /// Cancels the token, waits up to `wait` for the stage tasks (aborting
    /// stragglers), then cancels both chunk channels. Returns how many tasks
    /// had to be aborted.
    pub async fn shutdown(mut self, wait: Duration) -> usize {
        self.cancel.cancel();

        let deadline = tokio::time::Instant::now() + wait;
        let mut aborted = 0;
        for (stage, mut handle) in self.tasks.drain(..) {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_panic() => {
                    warn!("{stage} task of turn {} panicked: {e}", self.id);
                }
                Ok(Err(_)) => {}
                Err(_) => {
                    warn!(
                        "{stage} task of turn {} did not stop within {wait:?}, aborting",
                        self.id
                    );
                    handle.abort();
                    aborted += 1;
                }
            }
        }

        if let Some(writer) = self.llm_writer.as_mut() {
            writer.cancel();
        }
        if let Some(writer) = self.tts_writer.as_mut() {
            writer.cancel();
        }
        debug!("turn {} cancelled", self.id);
        aborted
    }
}

impl Drop for ActiveTurn {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[tokio::test]
    async fn turn_token_is_child_of_session_token() {
        let session = CancellationToken::new();
        let turn = ActiveTurn::new(TurnId::new(), &session);
        let token = turn.token().clone();

        session.cancel();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn cancelling_a_turn_leaves_the_session_running() {
        let session = CancellationToken::new();
        let turn = ActiveTurn::new(TurnId::new(), &session);
        let token = turn.token().clone();

        turn.shutdown(Duration::from_millis(100)).await;
        assert!(token.is_cancelled());
        assert!(!session.is_cancelled());
    }

    #[tokio::test]
    async fn shutdown_waits_for_cooperative_tasks() {
        let session = CancellationToken::new();
        let mut turn = ActiveTurn::new(TurnId::new(), &session);
        let token = turn.token().clone();
        turn.track(
            Stage::Llm,
            tokio::spawn(async move { token.cancelled().await }),
        );

        let aborted = turn.shutdown(Duration::from_secs(5)).await;
        assert_eq!(aborted, 0);
    }

    #[tokio::test]
    async fn shutdown_aborts_stuck_tasks() {
        let session = CancellationToken::new();
        let mut turn = ActiveTurn::new(TurnId::new(), &session);
        turn.track(
            Stage::Audio,
            tokio::spawn(async { tokio::time::sleep(Duration::from_secs(60)).await }),
        );

        let aborted = turn.shutdown(Duration::from_millis(50)).await;
        assert_eq!(aborted, 1);
    }

    #[tokio::test]
    async fn shutdown_cancels_chunk_readers() {
        let session = CancellationToken::new();
        let mut turn = ActiveTurn::new(TurnId::new(), &session);
        turn.open_llm_channel();
        let mut text = turn.take_llm_reader().unwrap();
        let mut audio = turn.open_tts_channel();
        turn.relay_llm("queued".to_owned()).unwrap();

        turn.shutdown(Duration::from_millis(10)).await;
        assert_eq!(text.recv().await, None);
        assert!(text.is_cancelled());
        assert!(audio.recv().await.is_none());
    }

    #[tokio::test]
    async fn release_lets_readers_drain() {
        let session = CancellationToken::new();
        let mut turn = ActiveTurn::new(TurnId::new(), &session);
        turn.open_llm_channel();
        let mut reader = turn.take_llm_reader().unwrap();
        turn.relay_llm("Hi".to_owned()).unwrap();

        turn.release();
        assert_eq!(reader.recv().await.as_deref(), Some("Hi"));
        assert_eq!(reader.recv().await, None);
    }

    #[test]
    fn relay_without_channels_fails() {
        let session = CancellationToken::new();
        let turn = ActiveTurn::new(TurnId::new(), &session);
        assert!(turn.relay_llm("x".to_owned()).is_err());
        assert!(
            turn.relay_tts(SynthesizedAudio {
                samples: Vec::new(),
                sample_rate: 24_000,
                text: String::new(),
            })
            .is_err()
        );
    }
}
