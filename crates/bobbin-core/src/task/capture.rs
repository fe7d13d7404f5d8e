//! Output and log capture around a task run.

use std::future::Future;

use tracing::instrument::WithSubscriber;
use tracing::level_filters::LevelFilter;

use crate::command::OutputSink;
use crate::error::StoreError;
use crate::observability::LogLevel;
use crate::ports::{FileRef, ObjectStore};

pub(crate) struct Capture {
    level: Option<LogLevel>,
    pub log: OutputSink,
    pub stdout: OutputSink,
    pub stderr: OutputSink,
}

impl Capture {
    pub fn new(level: Option<LogLevel>, echo: bool) -> Self {
        let (stdout, stderr) = if echo {
            (OutputSink::tee_stdout(), OutputSink::tee_stderr())
        } else {
            (OutputSink::new(), OutputSink::new())
        };
        Self {
            level,
            log: OutputSink::new(),
            stdout,
            stderr,
        }
    }

    /// Poll `fut` with a subscriber that writes events at or above the task's
    /// level into the log sink. Without a level the future runs untouched.
    pub async fn scope<F: Future>(&self, fut: F) -> F::Output {
        let Some(level) = self.level else {
            return fut.await;
        };
        let sink = self.log.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || sink.clone())
            .with_max_level(LevelFilter::from(level))
            .with_ansi(false)
            .with_target(false)
            .finish();
        fut.with_subscriber(subscriber).await
    }

    /// Append everything captured to the task's files.
    pub async fn flush(
        &self,
        store: &dyn ObjectStore,
        log: &FileRef,
        stdout: &FileRef,
        stderr: &FileRef,
    ) -> Result<(), StoreError> {
        for (sink, file) in [(&self.log, log), (&self.stdout, stdout), (&self.stderr, stderr)] {
            let bytes = sink.take();
            if !bytes.is_empty() {
                store.append_file(file.id, &bytes).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_events_at_or_above_level() {
        let capture = Capture::new(Some(LogLevel::Warn), false);
        capture
            .scope(async {
                tracing::info!("quiet");
                tracing::warn!("loud");
            })
            .await;

        let log = capture.log.contents();
        assert!(log.contains("loud"));
        assert!(!log.contains("quiet"));
    }

    #[tokio::test]
    async fn no_level_means_no_log() {
        let capture = Capture::new(None, false);
        capture.scope(async { tracing::error!("dropped") }).await;
        assert_eq!(capture.log.contents(), "");
    }
}
