//! Delivery backends.
//!
//! The chat front end is not part of this crate; [`LogDelivery`] records
//! every outbound notice and artifact in the log so a deployment without a
//! front end still shows what would have been sent.

use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;
use tracing::info;

use crate::traits::Delivery;

pub struct LogDelivery;

#[async_trait]
impl Delivery for LogDelivery {
    async fn send_text(&self, target: &str, text: &str) -> Result<()> {
        info!(destination = target, text, "deliver text");
        Ok(())
    }

    async fn send_document(&self, target: &str, path: &Path, caption: &str) -> Result<()> {
        info!(destination = target, path = %path.display(), caption, "deliver document");
        Ok(())
    }
}
