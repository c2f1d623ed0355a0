use futures::stream::{self, BoxStream, SelectAll};
use futures::{FutureExt, StreamExt};

use super::{Channel, ChannelName, Envelope};

/// Multiplexes several channels into the single event stream a peer's
/// event loop consumes.
pub struct Inbox {
    streams: SelectAll<BoxStream<'static, (ChannelName, Envelope)>>,
    channels: Vec<ChannelName>,
}

impl Default for Inbox {
    fn default() -> Self {
        Self::new()
    }
}

impl Inbox {
    pub fn new() -> Self {
        Self {
            streams: SelectAll::new(),
            channels: Vec::new(),
        }
    }

    /// Subscribe to `channel`; messages published from now on are queued
    pub fn attach(&mut self, channel: &Channel) {
        let name = channel.name();
        if self.channels.contains(&name) {
            return;
        }

        let rx = channel.subscribe();
        let messages = stream::unfold(rx, move |mut rx| async move {
            rx.recv().await.map(|envelope| ((name, envelope), rx))
        });
        self.streams.push(messages.boxed());
        self.channels.push(name);
    }

    pub fn channels(&self) -> &[ChannelName] {
        &self.channels
    }

    /// Wait for the next message on any attached channel
    pub async fn next(&mut self) -> Option<(ChannelName, Envelope)> {
        self.streams.next().await
    }

    /// Take everything already queued without waiting
    pub fn drain(&mut self) -> Vec<(ChannelName, Envelope)> {
        let mut out = Vec::new();
        while let Some(Some(message)) = self.streams.next().now_or_never() {
            out.push(message);
        }
        out
    }
}
