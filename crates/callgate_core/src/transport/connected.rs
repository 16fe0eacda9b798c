//! Drivers pumping a call spine through a transport stream.
//!
//! On the client the driver owns the handler end of the spine and plays the
//! remote server. On the server it owns the initiator end and plays the
//! remote client. Every driver step runs on the call's party.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future;

use crate::metadata::TrailingMetadata;
use crate::spine::{CallHandler, CallInitiator};
use crate::transport::{BatchBuilder, InitialMetadata, Target};

/// Drive an outgoing call: client metadata and messages go out, the server's
/// answer is pushed into the spine.
pub(crate) fn spawn_client_stream(handler: CallHandler, target: Target) {
    let builder = Arc::new(BatchBuilder::new());
    tracing::debug!(stream = %target.stream, path = %handler.client_initial_metadata().path, "Starting client stream");

    target.party.spawn("client-send", {
        let handler = handler.clone();
        let target = target.clone();
        let builder = Arc::clone(&builder);
        async move {
            let metadata = handler.client_initial_metadata().clone();
            if let Err(status) = builder
                .send_initial_metadata(&target, InitialMetadata::Client(metadata))
                .await
            {
                handler.cancel_from_remote(&status);
                return;
            }

            loop {
                match handler.pull_message().await {
                    Ok(Some(message)) => {
                        let sent = builder.send_message(&target, message);
                        if handler.client_messages_finished() {
                            // Last message: half-close in the same batch.
                            let close =
                                builder.send_trailing_metadata(&target, TrailingMetadata::ok(), false);
                            let (sent, close) = future::join(sent, close).await;
                            if let Err(status) = sent.and(close.map(|_| ())) {
                                handler.cancel_from_remote(&status);
                            }
                            return;
                        }
                        if let Err(status) = sent.await {
                            handler.cancel_from_remote(&status);
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(_) => return,
                }
            }

            if handler.is_finished() {
                return;
            }
            if let Err(status) = builder
                .send_trailing_metadata(&target, TrailingMetadata::ok(), false)
                .await
            {
                handler.cancel_from_remote(&status);
            }
        }
    });

    target.party.spawn("client-recv", {
        let handler = handler.clone();
        let target = target.clone();
        let builder = Arc::clone(&builder);
        async move {
            match builder.receive_initial_metadata(&target).await {
                Ok(Some(InitialMetadata::Server(metadata))) => {
                    handler.push_server_initial_metadata(metadata);
                    loop {
                        match builder.receive_message(&target).await {
                            Ok(Some(message)) => {
                                if handler.push_message(message).await.is_err() {
                                    break;
                                }
                            }
                            Ok(None) => break,
                            Err(status) => {
                                handler.cancel_from_remote(&status);
                                return;
                            }
                        }
                    }
                }
                Ok(Some(InitialMetadata::Client(_))) => {
                    tracing::warn!(stream = %target.stream, "Peer sent client metadata on a client stream");
                }
                // Trailers-only answer.
                Ok(None) => {}
                Err(status) => {
                    handler.cancel_from_remote(&status);
                    return;
                }
            }

            let trailing = builder.receive_trailing_metadata(&target).await;
            tracing::debug!(stream = %target.stream, code = ?trailing.code, cancelled = trailing.was_cancelled, "Client stream finished");
            handler.push_trailing_metadata(trailing);
        }
    });

    target.party.spawn("client-cancel", {
        let target = target.clone();
        async move {
            if let Some(status) = handler.local_cancellation().await {
                tracing::debug!(stream = %target.stream, code = ?status.code(), "Cancelling client stream");
                let _ = builder.cancel(&target, status).await;
            }
        }
    });
}

/// Drive an accepted call whose client initial metadata has already been
/// received: client messages are pushed into the spine, the application's
/// answer goes out.
pub(crate) fn spawn_server_stream(initiator: CallInitiator, target: Target) {
    let builder = Arc::new(BatchBuilder::new());
    let peer_cancelled = Arc::new(AtomicBool::new(false));

    target.party.spawn("server-recv", {
        let initiator = initiator.clone();
        let target = target.clone();
        let builder = Arc::clone(&builder);
        async move {
            loop {
                match builder.receive_message(&target).await {
                    Ok(Some(message)) => {
                        if initiator.push_message(message).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => {
                        initiator.finish_sends();
                        return;
                    }
                    Err(status) => {
                        initiator.cancel_from_remote(&status);
                        return;
                    }
                }
            }
        }
    });

    target.party.spawn("server-recv-close", {
        let initiator = initiator.clone();
        let target = target.clone();
        let builder = Arc::clone(&builder);
        let peer_cancelled = Arc::clone(&peer_cancelled);
        async move {
            let trailing = builder.receive_trailing_metadata(&target).await;
            if trailing.was_cancelled {
                tracing::debug!(stream = %target.stream, code = ?trailing.code, "Peer cancelled server stream");
                peer_cancelled.store(true, Ordering::Release);
                initiator.cancel_from_remote(&trailing.to_status());
            }
        }
    });

    target.party.spawn("server-send", {
        let target = target.clone();
        async move {
            if let Some(metadata) = initiator.pull_server_initial_metadata().await {
                if builder
                    .send_initial_metadata(&target, InitialMetadata::Server(metadata))
                    .await
                    .is_err()
                {
                    return;
                }
            }

            let mut last_message = None;
            loop {
                match initiator.pull_message().await {
                    Ok(Some(message)) => {
                        let sent = builder.send_message(&target, message);
                        if initiator.server_messages_finished() {
                            // Trailing metadata is already known; send it with this message.
                            last_message = Some(sent);
                            break;
                        }
                        if sent.await.is_err() {
                            return;
                        }
                    }
                    Ok(None) | Err(_) => break,
                }
            }

            let trailing = initiator.pull_trailing_metadata().await;
            if peer_cancelled.load(Ordering::Acquire) {
                return;
            }
            let convert_to_cancellation = trailing.was_cancelled;
            let sent = builder.send_trailing_metadata(&target, trailing, convert_to_cancellation);
            let result = match last_message {
                Some(message) => {
                    let (message, trailing) = future::join(message, sent).await;
                    message.and(trailing)
                }
                None => sent.await,
            };
            match result {
                Ok(trailing) => {
                    tracing::debug!(stream = %target.stream, code = ?trailing.code, cancelled = trailing.was_cancelled, "Server stream finished");
                }
                Err(status) => {
                    tracing::debug!(stream = %target.stream, error = %status, "Failed to send trailing metadata");
                }
            }
        }
    });
}
