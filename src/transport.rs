//! Mail transport capability.
//!
//! The queue never builds or speaks a mail protocol itself; it hands each
//! claimed record to a [`Transport`] as an [`Envelope`] and records the
//! outcome. A transport error of any kind counts as one failed attempt.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use futures_util::future::{self, BoxFuture};
use serde::Serialize;
use tracing::info;

use crate::{
    error::Error,
    message::{Message, MessageId},
};

/// What a transport receives for one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Envelope {
    pub id: MessageId,
    pub recipient: String,
    pub subject: String,
    pub body: String,
}

impl From<&Message> for Envelope {
    fn from(message: &Message) -> Self {
        Self {
            id: message.id,
            recipient: message.recipient.clone(),
            subject: message.subject.clone(),
            body: message.body.clone(),
        }
    }
}

pub trait Transport: Send + Sync + 'static {
    fn send<'a>(&'a self, envelope: &'a Envelope) -> BoxFuture<'a, Result<(), Error>>;

    /// True when the transport does not actually deliver anything. The claim
    /// and bookkeeping path still runs in full.
    fn is_dry_run(&self) -> bool {
        false
    }
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn send<'a>(&'a self, envelope: &'a Envelope) -> BoxFuture<'a, Result<(), Error>> {
        (**self).send(envelope)
    }

    fn is_dry_run(&self) -> bool {
        (**self).is_dry_run()
    }
}

/// Accepts every envelope without delivering it.
#[derive(Debug, Default)]
pub struct DryRunTransport {
    accepted: AtomicU64,
}

impl DryRunTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of envelopes accepted so far.
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }
}

impl Transport for DryRunTransport {
    fn send<'a>(&'a self, envelope: &'a Envelope) -> BoxFuture<'a, Result<(), Error>> {
        self.accepted.fetch_add(1, Ordering::Relaxed);
        info!(
            message_id = envelope.id,
            recipient = %envelope.recipient,
            subject = %envelope.subject,
            "dry run, skipping delivery"
        );
        Box::pin(future::ready(Ok(())))
    }

    fn is_dry_run(&self) -> bool {
        true
    }
}
