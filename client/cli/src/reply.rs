//! Outgoing messages
//!
//! Handlers never talk to a transport directly. They push [`Reply`] values
//! into an [`Outbox`], so long operations can report progress before they
//! finish. A transport drains the receiving end.

use std::path::PathBuf;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Text(String),
    /// A local file to hand to the user. The file is removed shortly after
    /// it is announced, so the transport must send or copy it promptly.
    File { name: String, path: PathBuf },
}

impl Reply {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Reply::Text(text) => Some(text),
            Reply::File { .. } => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::Sender<Reply>,
}

impl Outbox {
    pub fn new(tx: mpsc::Sender<Reply>) -> Self {
        Self { tx }
    }

    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<Reply>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self::new(tx), rx)
    }

    pub async fn send(&self, reply: Reply) {
        if self.tx.send(reply).await.is_err() {
            tracing::debug!("reply dropped: transport is gone");
        }
    }

    pub async fn text(&self, text: impl Into<String>) {
        self.send(Reply::Text(text.into())).await
    }

    pub async fn file(&self, name: &str, path: PathBuf) {
        self.send(Reply::File {
            name: name.to_string(),
            path,
        })
        .await
    }
}
