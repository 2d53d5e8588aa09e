//! Client connection server
//!
//! Accepts long-lived WebSocket connections and runs the submission
//! pipeline for each binary CBOR frame: structural limits, signature
//! recovery, disabled-verifier check, pre-verification, payer
//! resolution, ledger checks, enqueue. Replies flow through a single
//! writer task per connection, so acknowledgments are delivered in the
//! order they are produced.
//!
//! Text frames and undecodable frames are fatal protocol violations and
//! terminate the stream; ordinary rejections leave it open.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::Address;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Semaphore};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

use crate::config::{CONNECTION_TIMEOUT_SECS, PROTOCOL_VERSION};
use crate::crypto::signature::{recover_submitter, submission_digest};
use crate::domain::VerificationCommitment;
use crate::errors::{BatcherError, RejectReason, Result};
use crate::queue::{QueueEntry, ReplyHandle};
use crate::server::BatcherState;
use crate::shutdown::{ConnectionTracker, ShutdownSignal};
use crate::wire::{cbor_deserialize, cbor_serialize, ClientMessage, ServerMessage, SubmitRequest};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Accept connections until shutdown.
pub async fn run(
    state: Arc<BatcherState>,
    tracker: Arc<ConnectionTracker>,
    shutdown: ShutdownSignal,
) -> Result<()> {
    let listener = TcpListener::bind(state.config.listen_addr)
        .await
        .map_err(|e| BatcherError::Listener(e.to_string()))?;
    info!(addr = %state.config.listen_addr, "listening for client connections");

    loop {
        tokio::select! {
            _ = shutdown.wait() => {
                info!("stopping accept loop");
                return Ok(());
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let state = state.clone();
                        let guard = tracker.track();
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            let _guard = guard;
                            handle_connection(state, stream, peer, shutdown).await;
                        });
                    }
                    Err(e) => error!(error = %e, "failed to accept connection"),
                }
            }
        }
    }
}

async fn handle_connection(
    state: Arc<BatcherState>,
    stream: TcpStream,
    peer: SocketAddr,
    shutdown: ShutdownSignal,
) {
    debug!(%peer, "incoming connection");
    state.metrics.open_connections.inc();
    serve_connection(&state, stream, peer, shutdown).await;
    state.metrics.open_connections.dec();
    debug!(%peer, "connection closed");
}

async fn serve_connection(
    state: &Arc<BatcherState>,
    stream: TcpStream,
    peer: SocketAddr,
    shutdown: ShutdownSignal,
) {
    // Slow handshakes hold a slot for nothing; cut them off.
    let handshake = tokio_tungstenite::accept_async(stream);
    let ws = match timeout(Duration::from_secs(CONNECTION_TIMEOUT_SECS), handshake).await {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => {
            warn!(%peer, error = %e, "websocket handshake failed");
            return;
        }
        Err(_) => {
            warn!(%peer, "websocket handshake timed out");
            return;
        }
    };

    let (sink, mut stream) = ws.split();
    let (reply_tx, reply_rx) = mpsc::unbounded_channel::<ServerMessage>();

    // All replies funnel through one writer; per-connection FIFO falls
    // out of the channel order.
    tokio::spawn(write_loop(sink, reply_rx));

    if reply_tx
        .send(ServerMessage::ProtocolVersion(PROTOCOL_VERSION))
        .is_err()
    {
        return;
    }

    let inflight = Arc::new(Semaphore::new(state.config.max_inflight_per_connection));

    loop {
        let frame = tokio::select! {
            _ = shutdown.wait() => break,
            frame = stream.next() => frame,
        };
        let message = match frame {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                debug!(%peer, error = %e, "read error");
                break;
            }
            None => break,
        };

        match message {
            Message::Binary(bytes) => {
                if !handle_frame(state, &bytes, &reply_tx, &inflight).await {
                    break;
                }
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Text(_) => {
                warn!(%peer, "text frame on binary protocol, closing");
                break;
            }
            _ => {}
        }
    }
    // Queued entries keep their reply handles; the writer lives until the
    // last one resolves or the socket dies.
}

async fn write_loop(mut sink: WsSink, mut reply_rx: mpsc::UnboundedReceiver<ServerMessage>) {
    while let Some(message) = reply_rx.recv().await {
        let bytes = match cbor_serialize(&message) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(error = %e, "failed to encode reply frame");
                continue;
            }
        };
        if sink.send(Message::binary(bytes)).await.is_err() {
            break;
        }
    }
    let _ = sink.close().await;
}

/// A client speaking a protocol newer than ours cannot be served; older
/// declarations are accepted for compatibility within the major line.
fn version_mismatch(got: u16) -> Option<RejectReason> {
    (got > PROTOCOL_VERSION).then_some(RejectReason::ProtocolMismatch {
        expected: PROTOCOL_VERSION,
        got,
    })
}

/// Deliver a rejection and report whether the stream stays open: fatal
/// protocol violations close it after the reply.
fn reject(
    state: &BatcherState,
    reply_tx: &mpsc::UnboundedSender<ServerMessage>,
    reason: RejectReason,
) -> bool {
    state.metrics.rejection(reason.metric_label());
    let fatal = reason.is_fatal();
    let _ = reply_tx.send(ServerMessage::rejection(reason));
    !fatal
}

/// Returns false when the stream must terminate.
async fn handle_frame(
    state: &Arc<BatcherState>,
    bytes: &[u8],
    reply_tx: &mpsc::UnboundedSender<ServerMessage>,
    inflight: &Arc<Semaphore>,
) -> bool {
    let frame: ClientMessage = match cbor_deserialize(bytes) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(error = %e, "undecodable frame, closing");
            return false;
        }
    };

    match frame {
        ClientMessage::ProtocolVersion(version) => match version_mismatch(version) {
            Some(reason) => {
                warn!(
                    got = version,
                    expected = PROTOCOL_VERSION,
                    "client protocol is newer than ours, closing"
                );
                reject(state, reply_tx, reason)
            }
            None => true,
        },
        ClientMessage::GetNonce(address) => handle_get_nonce(state, address, reply_tx).await,
        ClientMessage::Submit(request) => handle_submit(state, *request, reply_tx, inflight).await,
    }
}

/// Returns false when the rejection was fatal for the stream.
async fn handle_get_nonce(
    state: &Arc<BatcherState>,
    address: Address,
    reply_tx: &mpsc::UnboundedSender<ServerMessage>,
) -> bool {
    let address = match &state.non_paying {
        Some(policy) if policy.applies_to(&address) => policy.replacement_address(),
        _ => address,
    };

    match next_nonce(state, address).await {
        Ok(nonce) => {
            let _ = reply_tx.send(ServerMessage::Nonce(nonce));
            true
        }
        Err(_) => reject(state, reply_tx, RejectReason::RpcUnavailable),
    }
}

/// Next usable nonce for `payer`: queue accounting when tracked, the
/// chain otherwise.
async fn next_nonce(state: &Arc<BatcherState>, payer: Address) -> Result<u64> {
    let cached = {
        let queue = state.queue.lock().expect("queue lock poisoned");
        queue.user(&payer).map(|user| user.expected_nonce)
    };
    match cached {
        Some(nonce) => Ok(nonce),
        None => Ok(state.ledger.get(payer).await?.nonce),
    }
}

/// Returns false when the rejection was fatal for the stream.
async fn handle_submit(
    state: &Arc<BatcherState>,
    request: SubmitRequest,
    reply_tx: &mpsc::UnboundedSender<ServerMessage>,
    inflight: &Arc<Semaphore>,
) -> bool {
    state.metrics.received_submissions.inc();

    // In-flight window: one permit per unacknowledged submission, freed
    // with the terminal reply.
    let Ok(permit) = inflight.clone().try_acquire_owned() else {
        return reject(state, reply_tx, RejectReason::RateLimited);
    };

    match process_submission(state, request, reply_tx, permit).await {
        Ok(()) => true,
        Err(reason) => reject(state, reply_tx, reason),
    }
}

/// Structural limits before any cryptography: serialize the signed
/// payload and the verification data, rejecting oversized proofs.
/// Returns `(payload_bytes, data_bytes)`.
pub(crate) fn encode_within_limits(
    request: &SubmitRequest,
    max_proof_size: usize,
) -> std::result::Result<(Vec<u8>, Vec<u8>), RejectReason> {
    let payload_bytes =
        cbor_serialize(&request.signed_payload()).map_err(|_| RejectReason::Internal)?;
    let data_bytes =
        cbor_serialize(&request.verification_data).map_err(|_| RejectReason::Internal)?;
    if data_bytes.len() > max_proof_size {
        return Err(RejectReason::ProofTooLarge);
    }
    Ok((payload_bytes, data_bytes))
}

/// The submission pipeline. On success the entry is queued and its
/// terminal reply will come from the finalizer; every error is a
/// synchronous terminal reply.
async fn process_submission(
    state: &Arc<BatcherState>,
    request: SubmitRequest,
    reply_tx: &mpsc::UnboundedSender<ServerMessage>,
    permit: tokio::sync::OwnedSemaphorePermit,
) -> std::result::Result<(), RejectReason> {
    let config = &state.config;

    let signed_payload = request.signed_payload();
    let (payload_bytes, data_bytes) = encode_within_limits(&request, config.max_proof_size)?;

    let digest = submission_digest(&payload_bytes);
    let submitter =
        recover_submitter(&request.signature, &digest).ok_or(RejectReason::InvalidSignature)?;

    let system = request.verification_data.proving_system;
    {
        let bitmap = state
            .disabled_verifiers
            .lock()
            .expect("bitmap lock poisoned");
        if system.is_disabled_in(*bitmap) {
            return Err(RejectReason::VerifierDisabled(system));
        }
    }

    let commitment = VerificationCommitment::from(&request.verification_data);
    let fingerprint = commitment.fingerprint();

    if config.pre_verification_is_enabled {
        let already_verified = {
            let recent = state
                .recent_fingerprints
                .lock()
                .expect("fingerprint lock poisoned");
            recent.contains(&fingerprint)
        };
        if !already_verified {
            let valid = state
                .verifier_pool
                .verify(
                    Arc::new(request.verification_data.clone()),
                    config.verification_timeout,
                )
                .await?;
            if !valid {
                return Err(RejectReason::MalformedProof);
            }
            state
                .recent_fingerprints
                .lock()
                .expect("fingerprint lock poisoned")
                .insert(fingerprint);
            state.metrics.verified_submissions.inc();
        }
    }

    // Payer resolution: the non-paying address is billed to the
    // replacement wallet under that wallet's own nonce sequence.
    let (submission, signature, payer) = match &state.non_paying {
        Some(policy) if policy.applies_to(&submitter) => {
            let payer = policy.replacement_address();
            let replacement_nonce = next_nonce(state, payer)
                .await
                .map_err(|_| RejectReason::RpcUnavailable)?;
            let rewritten = policy
                .rewrite(&signed_payload, replacement_nonce)
                .map_err(|_| RejectReason::Internal)?;
            (rewritten.submission, rewritten.signature, rewritten.payer)
        }
        _ => (signed_payload, request.signature, submitter),
    };

    let view = state
        .ledger
        .get(payer)
        .await
        .map_err(|_| RejectReason::RpcUnavailable)?;
    if view.withdrawal_initiated() {
        return Err(RejectReason::InsufficientBalance(payer));
    }

    let current_block = state
        .current_block
        .load(std::sync::atomic::Ordering::SeqCst);

    let queued = {
        let mut queue = state.queue.lock().expect("queue lock poisoned");
        queue.register_user(payer, view.nonce);
        let entry = QueueEntry {
            submission,
            commitment,
            payer,
            signature,
            reply: Some(ReplyHandle::new(reply_tx.clone(), Some(permit))),
            serialized_size: data_bytes.len(),
            arrival: queue.next_arrival(),
            queued_block: current_block,
            resubmissions: 0,
        };
        queue.submit(entry, view.balance)
    };
    queued?;

    let (len, bytes) = {
        let queue = state.queue.lock().expect("queue lock poisoned");
        (queue.len(), queue.size_bytes())
    };
    state.metrics.queue_len.set(len as i64);
    state.metrics.queue_bytes.set(bytes as i64);
    debug!(%payer, queue_len = len, "submission queued");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::U256;
    use crate::domain::{ProvingSystem, VerificationData};

    fn request_with_proof(proof: Vec<u8>) -> SubmitRequest {
        SubmitRequest {
            verification_data: VerificationData {
                proving_system: ProvingSystem::Sp1,
                proof,
                public_input: None,
                verification_key: None,
                vm_program: Some(vec![0u8; 8]),
                proof_generator_addr: Address::repeat_byte(1),
            },
            nonce: 0,
            max_fee: U256::from(100u64),
            signature: vec![0u8; 65],
        }
    }

    #[test]
    fn proof_at_exactly_the_size_limit_passes() {
        let request = request_with_proof(vec![7u8; 1024]);
        let encoded = cbor_serialize(&request.verification_data).unwrap();

        let at_limit = encode_within_limits(&request, encoded.len());
        assert!(at_limit.is_ok());
        let (_, data_bytes) = at_limit.unwrap();
        assert_eq!(data_bytes.len(), encoded.len());
    }

    #[test]
    fn proof_one_byte_past_the_limit_is_too_large() {
        let request = request_with_proof(vec![7u8; 1024]);
        let encoded = cbor_serialize(&request.verification_data).unwrap();

        assert_eq!(
            encode_within_limits(&request, encoded.len() - 1),
            Err(RejectReason::ProofTooLarge)
        );
    }

    #[test]
    fn newer_client_versions_are_refused_and_fatal() {
        let reason = version_mismatch(PROTOCOL_VERSION + 1).unwrap();
        assert_eq!(
            reason,
            RejectReason::ProtocolMismatch {
                expected: PROTOCOL_VERSION,
                got: PROTOCOL_VERSION + 1,
            }
        );
        assert!(reason.is_fatal());
    }

    #[test]
    fn current_and_older_client_versions_are_accepted() {
        assert_eq!(version_mismatch(PROTOCOL_VERSION), None);
        assert_eq!(version_mismatch(0), None);
    }
}
