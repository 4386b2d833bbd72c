//! SSE transport: one long-lived event stream per channel.
//!
//! Each pushed envelope becomes one `data:` event. A `{"type":"ping"}` event
//! is written every keep-alive interval; once the client is gone that write
//! fails, axum drops the stream, and dropping the lease unregisters the
//! channel.

use std::convert::Infallible;

use axum::response::sse::{Event, Sse};
use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior, interval_at};

use crate::error::ChannelError;
use crate::gateway::ConnectionGuard;
use crate::gateway::server::GatewayState;
use crate::protocol::{ChannelId, Envelope, Metadata, TransportKind};
use crate::relay::{AttachOptions, ChannelLease};

pub type ChannelStream = BoxStream<'static, Result<Event, Infallible>>;

struct StreamState {
    rx: mpsc::UnboundedReceiver<Envelope>,
    ticker: Interval,
    lease: ChannelLease,
    _connection: ConnectionGuard,
}

/// Register a channel and return its event stream.
///
/// With a `requested` id the tab already knows its id, so no handshake is
/// sent. Without one, the relay mints an id and the first event is
/// `CLIENT_REGISTERED` carrying it.
pub fn open_channel_stream(
    state: &GatewayState,
    requested: Option<ChannelId>,
    metadata: Metadata,
) -> Result<Sse<ChannelStream>, ChannelError> {
    let (tx, rx) = mpsc::unbounded_channel();
    let options = AttachOptions::new(TransportKind::Sse).with_metadata(metadata);
    let options = match requested {
        Some(id) => options.with_id(id),
        None => options.with_handshake(),
    };
    let lease = state.relay.attach(tx, options)?;

    let mut ticker = interval_at(Instant::now() + state.keepalive, state.keepalive);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let initial = StreamState {
        rx,
        ticker,
        lease,
        _connection: state.sse_tracker.track(),
    };

    let stream = futures::stream::unfold(initial, |mut st| async move {
        loop {
            let envelope = tokio::select! {
                pushed = st.rx.recv() => match pushed {
                    Some(envelope) => envelope,
                    None => return None,
                },
                _ = st.ticker.tick() => Envelope::Ping,
            };
            match envelope.to_json() {
                Ok(data) => return Some((Ok(Event::default().data(data)), st)),
                Err(e) => {
                    tracing::warn!(channel = %st.lease.id(), error = %e, "Failed to encode SSE frame");
                }
            }
        }
    });

    Ok(Sse::new(stream.boxed()))
}
