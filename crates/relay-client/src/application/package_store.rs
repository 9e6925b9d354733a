//! In-memory store of the packages this client has received.
//!
//! The store is a plain `Vec` in arrival order.  Queries never copy
//! payloads; they return references, so the terminal can print a filtered
//! history cheaply.

use std::time::SystemTime;

use relay_core::domain::identity::name_key;
use relay_core::domain::package::DEFAULT_CONTENT_TYPE;
use relay_core::protocol::messages::PackageMessage;
use relay_core::Recipients;

/// A package as delivered to this client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedPackage {
    /// Sender name, as stamped by the server.
    pub sender: String,
    pub recipients: Recipients,
    pub content_type: String,
    pub payload: Vec<u8>,
    /// Sender's clock at submission, microseconds since the Unix epoch.
    pub sent_at_us: u64,
    /// Local clock at arrival.
    pub received_at: SystemTime,
}

impl ReceivedPackage {
    /// Wraps a wire package; `sent_at_us` is the frame timestamp.
    pub fn from_wire(message: PackageMessage, sent_at_us: u64) -> Self {
        Self {
            sender: message.sender,
            recipients: message.recipients,
            content_type: message.content_type,
            payload: message.payload,
            sent_at_us,
            received_at: SystemTime::now(),
        }
    }

    /// The payload as text, for `text/*` packages that are valid UTF-8.
    pub fn text(&self) -> Option<&str> {
        if self.content_type == DEFAULT_CONTENT_TYPE || self.content_type.starts_with("text/") {
            std::str::from_utf8(&self.payload).ok()
        } else {
            None
        }
    }

    pub fn is_from(&self, name: &str) -> bool {
        name_key(&self.sender) == name_key(name)
    }

    /// Whether `name` was addressed (explicitly or through `all`).
    pub fn is_addressed_to(&self, name: &str) -> bool {
        self.recipients.includes(&name_key(name))
    }
}

/// Received packages in arrival order.
#[derive(Debug, Default)]
pub struct PackageStore {
    packages: Vec<ReceivedPackage>,
}

impl PackageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, package: ReceivedPackage) {
        self.packages.push(package);
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ReceivedPackage> {
        self.packages.iter()
    }

    /// Packages sent by `name` (case-insensitive).
    pub fn from_sender<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a ReceivedPackage> {
        self.packages.iter().filter(move |p| p.is_from(name))
    }

    /// Packages whose recipients include `name`, counting `all`.
    pub fn addressed_to<'a>(
        &'a self,
        name: &'a str,
    ) -> impl Iterator<Item = &'a ReceivedPackage> {
        self.packages.iter().filter(move |p| p.is_addressed_to(name))
    }

    /// Removes every package matching `predicate`; returns how many went.
    pub fn remove_where<F>(&mut self, mut predicate: F) -> usize
    where
        F: FnMut(&ReceivedPackage) -> bool,
    {
        let before = self.packages.len();
        self.packages.retain(|p| !predicate(p));
        before - self.packages.len()
    }

    pub fn clear(&mut self) {
        self.packages.clear();
    }
}
