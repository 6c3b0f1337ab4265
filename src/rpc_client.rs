//! # Correlated RPC Client Module
//!
//! Request/response calls over a queue-based transport. A request is
//! published to the request queue carrying a fresh correlation id and the
//! name of the response queue; the matching reply is picked off the response
//! queue and handed back to the caller.
//!
//! Each client owns one channel and one consumer on its response queue. A
//! single background dispatcher reads that consumer and routes every reply
//! to the waiter registered under its correlation id, so any number of calls
//! can be outstanding on one client without stealing each other's replies.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::connection_manager::ConnectionManager;
use crate::correlation::{PendingReplies, ReplyEvent, SessionId};
use crate::errors::{RpcError, TransportError};
use crate::transport::{Channel, Delivery, DeliveryStream, OutboundMessage, QueueIdentity};

struct ChannelSession {
    id: SessionId,
    channel: Arc<dyn Channel>,
    dispatcher: JoinHandle<()>,
}

/// The channel a call was sent on, and the session it belongs to
#[derive(Clone)]
struct SessionHandle {
    id: SessionId,
    channel: Arc<dyn Channel>,
}

impl ChannelSession {
    fn handle(&self) -> SessionHandle {
        SessionHandle {
            id: self.id,
            channel: Arc::clone(&self.channel),
        }
    }

    fn is_live(&self) -> bool {
        self.channel.is_open() && !self.dispatcher.is_finished()
    }

    async fn shutdown(self) -> Result<(), TransportError> {
        let closed = self.channel.close().await;
        self.dispatcher.abort();
        // Wait for the abort so a late dispatcher cannot touch new waiters
        let _ = self.dispatcher.await;
        closed
    }
}

/// Request/response client bound to one queue pair in one virtual host
pub struct RpcClient {
    queues: QueueIdentity,
    connections: Arc<ConnectionManager>,
    reply_timeout: Duration,
    consumer_tag: String,
    pending: PendingReplies,
    session: Mutex<Option<ChannelSession>>,
    next_session: AtomicU64,
}

impl RpcClient {
    /// Bind a client to a queue pair, provisioning its virtual host
    ///
    /// Nothing is connected yet; the first `connect()` or `send_message()`
    /// opens the channel.
    ///
    /// # Errors
    ///
    /// `RpcError::Provision` when the management API neither created nor
    /// confirmed the vhost.
    pub async fn new(
        connections: Arc<ConnectionManager>,
        queues: QueueIdentity,
        reply_timeout: Duration,
    ) -> Result<Self, RpcError> {
        let status = connections.ensure_vhost(&queues.vhost).await?;
        debug!(queues = %queues, ?status, "RPC client bound");

        Ok(Self {
            queues,
            connections,
            reply_timeout,
            consumer_tag: format!("rpc-{}", Uuid::new_v4()),
            pending: PendingReplies::new(),
            session: Mutex::new(None),
            next_session: AtomicU64::new(1),
        })
    }

    pub fn queues(&self) -> &QueueIdentity {
        &self.queues
    }

    pub fn reply_timeout(&self) -> Duration {
        self.reply_timeout
    }

    /// Number of calls currently waiting for a reply
    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }

    /// Make sure a live channel with both queues declared exists
    ///
    /// Idempotent: with a live channel this does no I/O at all.
    pub async fn connect(&self) -> Result<(), RpcError> {
        self.live_session().await.map(|_| ())
    }

    /// The live session, opened (or replaced) under the session lock
    async fn live_session(&self) -> Result<SessionHandle, RpcError> {
        let mut session = self.session.lock().await;
        if let Some(live) = session.as_ref().filter(|s| s.is_live()) {
            return Ok(live.handle());
        }

        if let Some(stale) = session.take() {
            debug!(queues = %self.queues, session = stale.id, "Replacing dead channel");
            let stale_id = stale.id;
            if let Err(e) = stale.shutdown().await {
                debug!(error = %e, "Closing dead channel failed");
            }
            self.pending.complete_session(stale_id, ReplyEvent::StreamClosed);
        }

        let fresh = self.open_session().await?;
        let handle = fresh.handle();
        *session = Some(fresh);
        Ok(handle)
    }

    /// Send a request and wait for its reply using the configured timeout
    ///
    /// Returns `Ok(None)` when the reply stream ended without a matching
    /// reply, and `RpcError::TimedOut` when nothing arrived in time.
    pub async fn send_message<T, R>(&self, payload: &T) -> Result<Option<R>, RpcError>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.send_message_with_timeout(payload, self.reply_timeout)
            .await
    }

    /// Same as [`RpcClient::send_message`] with an explicit timeout
    pub async fn send_message_with_timeout<T, R>(
        &self,
        payload: &T,
        timeout: Duration,
    ) -> Result<Option<R>, RpcError>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let body = match serde_json::to_vec(payload) {
            Ok(body) => body,
            Err(e) => {
                error!(queue = %self.queues.request_queue, error = %e, "Failed to encode request");
                return Err(RpcError::Encode(e));
            }
        };

        let session = match self.live_session().await {
            Ok(session) => session,
            Err(e) => {
                error!(queues = %self.queues, error = %e, "Failed to connect to broker");
                return Err(e);
            }
        };

        let correlation_id = Uuid::new_v4().to_string();
        match self.exchange(&session, body, &correlation_id, timeout).await {
            Ok(reply) => Ok(reply),
            Err(e) if e.is_timeout() => {
                warn!(queue = %self.queues.request_queue, correlation_id = %correlation_id, ?timeout, "No reply before timeout");
                Err(e)
            }
            // The reply arrived and was acked; only this caller is affected
            Err(e @ RpcError::Decode(_)) => {
                error!(queue = %self.queues.response_queue, correlation_id = %correlation_id, error = %e, "Failed to decode reply");
                Err(e)
            }
            Err(e) => {
                error!(queue = %self.queues.request_queue, correlation_id = %correlation_id, error = %e, "Failed to send message over broker");
                self.abort_session(&session, ReplyEvent::Failed(e.to_string())).await;
                Err(e)
            }
        }
    }

    /// Close the channel; the shared connection stays open
    ///
    /// Calls still waiting resolve to "no response". Closing a closed client
    /// is a no-op.
    pub async fn close(&self) -> Result<(), RpcError> {
        let session = self.session.lock().await.take();
        let closed = match session {
            Some(session) => {
                info!(queues = %self.queues, "Closing RPC channel");
                session.shutdown().await
            }
            None => Ok(()),
        };
        self.pending.complete_all(ReplyEvent::StreamClosed);
        closed.map_err(RpcError::from)
    }

    async fn exchange<R>(
        &self,
        session: &SessionHandle,
        body: Vec<u8>,
        correlation_id: &str,
        timeout: Duration,
    ) -> Result<Option<R>, RpcError>
    where
        R: DeserializeOwned,
    {
        // Registered before publishing so a fast reply cannot be missed
        let mut waiter = self.pending.register(correlation_id, session.id);
        session
            .channel
            .publish(OutboundMessage::request(
                &self.queues.request_queue,
                body,
                correlation_id,
                &self.queues.response_queue,
            ))
            .await?;
        debug!(queue = %self.queues.request_queue, correlation_id, "Request published");

        match waiter.wait(timeout).await {
            Some(ReplyEvent::Delivered(body)) => serde_json::from_slice(&body)
                .map(Some)
                .map_err(RpcError::Decode),
            Some(ReplyEvent::StreamClosed) => {
                info!(queue = %self.queues.response_queue, correlation_id, "Reply stream ended without a response");
                Ok(None)
            }
            Some(ReplyEvent::Failed(reason)) => Err(RpcError::ChannelLost(reason)),
            None => Err(RpcError::TimedOut {
                correlation_id: correlation_id.to_string(),
                timeout,
            }),
        }
    }

    async fn open_session(&self) -> Result<ChannelSession, RpcError> {
        let vhost = &self.queues.vhost;
        let connection = self.connections.acquire(vhost).await?;

        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                self.connections.invalidate(vhost).await;
                return Err(e.into());
            }
        };

        let setup = async {
            channel
                .declare_durable_queue(&self.queues.request_queue)
                .await?;
            channel
                .declare_durable_queue(&self.queues.response_queue)
                .await?;
            channel
                .consume(&self.queues.response_queue, &self.consumer_tag)
                .await
        }
        .await;

        let deliveries = match setup {
            Ok(deliveries) => deliveries,
            Err(e) => {
                let _ = channel.close().await;
                return Err(e.into());
            }
        };

        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let dispatcher = tokio::spawn(dispatch_replies(
            deliveries,
            self.pending.clone(),
            id,
            self.queues.response_queue.clone(),
        ));
        info!(queues = %self.queues, consumer_tag = %self.consumer_tag, session = id, "RPC channel open");

        Ok(ChannelSession {
            id,
            channel,
            dispatcher,
        })
    }

    /// Tear down the session a failed call used, if it is still current
    ///
    /// Only callers registered on that session are resolved; a session opened
    /// since then is left alone.
    async fn abort_session(&self, failed: &SessionHandle, event: ReplyEvent) {
        let stale = {
            let mut session = self.session.lock().await;
            if session.as_ref().is_some_and(|current| current.id == failed.id) {
                session.take()
            } else {
                None
            }
        };
        if let Some(stale) = stale {
            if let Err(e) = stale.shutdown().await {
                debug!(error = %e, "Closing failed channel failed");
            }
        }
        self.pending.complete_session(failed.id, event);
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().take() {
            session.dispatcher.abort();
        }
    }
}

/// Route replies from the response queue to their waiters until the
/// consumer stream ends or fails
async fn dispatch_replies(
    mut deliveries: DeliveryStream,
    pending: PendingReplies,
    session: SessionId,
    queue: String,
) {
    while let Some(item) = deliveries.next().await {
        match item {
            Ok(delivery) => route_reply(delivery, &pending, &queue).await,
            Err(e) => {
                error!(queue = %queue, session, error = %e, "Reply consumer failed");
                pending.complete_session(session, ReplyEvent::Failed(e.to_string()));
                return;
            }
        }
    }

    let orphaned = pending.complete_session(session, ReplyEvent::StreamClosed);
    if orphaned > 0 {
        warn!(queue = %queue, orphaned, "Reply stream ended with calls outstanding");
    } else {
        debug!(queue = %queue, "Reply stream ended");
    }
}

async fn route_reply(delivery: Delivery, pending: &PendingReplies, queue: &str) {
    let Some(correlation_id) = delivery.correlation_id.clone() else {
        warn!(queue, "Dropping reply without correlation id");
        log_settle_failure(delivery.ack().await, queue);
        return;
    };

    if pending.contains(&correlation_id) {
        match delivery.ack().await {
            Ok(()) => {
                if !pending.complete(&correlation_id, ReplyEvent::Delivered(delivery.body)) {
                    debug!(queue, correlation_id = %correlation_id, "Caller left before its reply arrived");
                }
            }
            Err(e) => {
                error!(queue, correlation_id = %correlation_id, error = %e, "Failed to ack reply");
                pending.complete(&correlation_id, ReplyEvent::Failed(e.to_string()));
            }
        }
    } else if delivery.redelivered {
        // Nobody claimed it the first time round either
        warn!(queue, correlation_id = %correlation_id, "Dropping stale reply");
        log_settle_failure(delivery.ack().await, queue);
    } else {
        // Another client consuming the same queue may own it
        debug!(queue, correlation_id = %correlation_id, "Requeueing reply with unknown correlation id");
        log_settle_failure(delivery.requeue().await, queue);
    }
}

fn log_settle_failure(result: Result<(), TransportError>, queue: &str) {
    if let Err(e) = result {
        error!(queue, error = %e, "Failed to settle reply");
    }
}
