//! Failure handlers that record or misbehave.

use async_trait::async_trait;
use courier_delivery::{EmailMessage, FailureHandler, FailureReason};
use parking_lot::Mutex;

#[derive(Debug, Default)]
pub struct RecordingHandler {
    failures: Mutex<Vec<(Vec<String>, FailureReason)>>,
}

impl RecordingHandler {
    pub fn reasons(&self) -> Vec<FailureReason> {
        self.failures.lock().iter().map(|(_, reason)| *reason).collect()
    }

    pub fn recipients(&self) -> Vec<Vec<String>> {
        self.failures
            .lock()
            .iter()
            .map(|(recipients, _)| recipients.clone())
            .collect()
    }
}

#[async_trait]
impl FailureHandler for RecordingHandler {
    async fn on_failure(&self, message: &EmailMessage, reason: FailureReason) -> anyhow::Result<()> {
        self.failures
            .lock()
            .push((message.recipients.clone(), reason));
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct PanickingHandler;

#[async_trait]
impl FailureHandler for PanickingHandler {
    async fn on_failure(&self, _: &EmailMessage, _: FailureReason) -> anyhow::Result<()> {
        panic!("failure handler exploded")
    }
}

#[derive(Debug, Default)]
pub struct ErroringHandler;

#[async_trait]
impl FailureHandler for ErroringHandler {
    async fn on_failure(&self, _: &EmailMessage, _: FailureReason) -> anyhow::Result<()> {
        anyhow::bail!("failure handler is broken")
    }
}
