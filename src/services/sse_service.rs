use std::{convert::Infallible, time::Duration};

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::Stream;
use tokio::sync::{
    broadcast::{self, error::RecvError},
    mpsc, watch,
};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    dto::sse::{Handshake, ServerEvent},
    error::ServiceError,
    services::session_events::{EVENT_HANDSHAKE, system_status_event},
    state::{SharedState, channel::session_topic, transitions::load_session},
};

/// Live feed of one session: the subscription plus the handshake to send first.
pub struct SessionFeed {
    /// Session being followed.
    pub session_id: Uuid,
    /// Session topic subscription.
    pub receiver: broadcast::Receiver<ServerEvent>,
    /// Sent before any topic event.
    pub handshake: ServerEvent,
    /// Degraded flag changes, forwarded as `system_status`.
    pub degraded: watch::Receiver<bool>,
}

/// Subscribe to the event topic of an existing session.
///
/// The subscription is taken before the handshake is built, so a client that then
/// fetches a snapshot misses nothing in between.
pub async fn subscribe_session(
    state: &SharedState,
    session_id: Uuid,
) -> Result<SessionFeed, ServiceError> {
    let store = state.require_session_store().await?;
    let receiver = state.channel().subscribe(&session_topic(session_id));
    load_session(&store, session_id).await?;

    let handshake = ServerEvent::json(
        Some(EVENT_HANDSHAKE.to_string()),
        &Handshake {
            session_id,
            message: "subscribed to session events".into(),
            degraded: state.is_degraded(),
        },
    )
    .map_err(|err| ServiceError::InvalidState(format!("failed to encode handshake: {err}")))?;

    Ok(SessionFeed {
        session_id,
        receiver,
        handshake,
        degraded: state.degraded_watcher(),
    })
}

fn to_event(payload: ServerEvent) -> Event {
    let mut event = Event::default().data(payload.data);
    if let Some(name) = payload.event {
        event = event.event(name);
    }
    event
}

/// Convert a session feed into an SSE response, forwarding events and degraded-mode
/// changes until the client disconnects.
pub fn to_sse_stream(feed: SessionFeed) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let SessionFeed {
        session_id,
        mut receiver,
        handshake,
        mut degraded,
    } = feed;
    // small bounded channel between forwarder and response
    let (tx, rx) = mpsc::channel::<Result<Event, Infallible>>(8);

    // forwarder task: reads from broadcast and pushes into mpsc
    tokio::spawn(async move {
        if tx.send(Ok(to_event(handshake))).await.is_err() {
            return;
        }
        degraded.borrow_and_update();

        loop {
            tokio::select! {
                _ = tx.closed() => break,
                changed = degraded.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let flag = *degraded.borrow_and_update();
                    if let Some(event) = system_status_event(flag)
                        && tx.send(Ok(to_event(event))).await.is_err()
                    {
                        break;
                    }
                }
                recv_result = receiver.recv() => {
                    match recv_result {
                        Ok(payload) => {
                            if tx.send(Ok(to_event(payload))).await.is_err() {
                                break;
                            }
                        }
                        Err(RecvError::Closed) => break,
                        Err(RecvError::Lagged(skipped)) => {
                            // Skip lagged messages; the client resyncs from a snapshot.
                            debug!(%session_id, skipped, "session SSE subscriber lagged");
                            continue;
                        }
                    }
                }
            }
        }

        info!(%session_id, "session SSE stream disconnected");
    });

    // response stream reads from mpsc; when client disconnects axum drops this stream
    let stream = ReceiverStream::new(rx);
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}
