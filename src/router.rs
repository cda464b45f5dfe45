/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The message router and the pluggable networking seam.
//!
//! Peers exchange consensus messages as JSON envelopes POSTed to the `/consensus` (committee
//! handshake) and `/pacemaker` (pacemaker) endpoints on port 8670. The envelope carries the
//! hex-encoded canonical payload and the network magic; this frame is the compatibility surface
//! with existing peers and is preserved bit-for-bit here. The HTTP server and client themselves
//! are the networking provider's concern, behind the [`Network`] trait; the router owns
//! everything in between: frame encoding, the size bound, the magic check, payload decoding, and
//! sender authentication.

use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::thread::{self, JoinHandle};

use serde::{Deserialize, Serialize};

use crate::pacemaker::messages::ConsensusMessage;
use crate::types::basic::{Magic, NetAddress, PubKeyBytes};
use crate::types::committee::Committee;

/// Path committee handshake messages are POSTed to.
pub const CONSENSUS_PATH: &str = "/consensus";
/// Path pacemaker messages are POSTed to.
pub const PACEMAKER_PATH: &str = "/pacemaker";
/// Default port consensus endpoints bind to.
pub const DEFAULT_PORT: u16 = 8670;
/// Upper bound on an encoded message. Derived from the 20M gas limit worst-case block plus QC and
/// committee payloads.
pub const MAX_MSG_SIZE: usize = 1_300_000;

/// The JSON envelope a message travels in. Field names and hex encoding are part of the wire
/// format.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WireFrame {
    pub peer_ip: String,
    pub peer_port: String,
    pub message: String,
    pub magic: String,
}

/// Routing failure modes. All are local: the offending frame is dropped and recorded, never
/// answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
    /// The envelope or payload does not decode.
    Malformed,
    /// The frame's magic does not match the configured network magic. Dropped silently.
    MagicMismatch,
    /// The encoded message exceeds [`MAX_MSG_SIZE`].
    Oversize,
    /// The embedded signature does not authenticate the claimed sender.
    Unauthorized,
}

/// Stateless encoder/decoder for wire frames, configured with the local network magic and
/// address.
#[derive(Clone)]
pub struct Router {
    magic: Magic,
    my_addr: NetAddress,
}

impl Router {
    pub fn new(magic: Magic, my_addr: NetAddress) -> Router {
        Router { magic, my_addr }
    }

    pub fn magic(&self) -> Magic {
        self.magic
    }

    /// Encode `msg` into the JSON envelope sent to peers.
    pub fn encode_frame(&self, msg: &ConsensusMessage) -> Result<WireFrame, RouteError> {
        let payload = msg.to_wire();
        if payload.len() > MAX_MSG_SIZE {
            log::error!(
                "{} exceeds max message size: {} > {}",
                msg.kind(),
                payload.len(),
                MAX_MSG_SIZE
            );
            return Err(RouteError::Oversize);
        }
        Ok(WireFrame {
            peer_ip: self.my_addr.ip.clone(),
            peer_port: self.my_addr.port.to_string(),
            message: hex::encode(payload),
            magic: self.magic.to_hex(),
        })
    }

    /// Decode and authenticate an inbound envelope. Returns the peer's claimed address and the
    /// decoded message.
    pub fn decode_frame(
        &self,
        frame: &WireFrame,
    ) -> Result<(NetAddress, ConsensusMessage), RouteError> {
        if frame.magic != self.magic.to_hex() {
            return Err(RouteError::MagicMismatch);
        }
        if frame.message.len() > MAX_MSG_SIZE * 2 {
            return Err(RouteError::Oversize);
        }

        let payload = hex::decode(&frame.message).map_err(|_| RouteError::Malformed)?;
        let msg = ConsensusMessage::from_wire(&payload).map_err(|_| RouteError::Malformed)?;
        if msg.header().magic != self.magic {
            return Err(RouteError::MagicMismatch);
        }
        if !msg.is_correct() {
            return Err(RouteError::Unauthorized);
        }

        let port = frame.peer_port.parse().unwrap_or(DEFAULT_PORT);
        Ok((NetAddress::new(frame.peer_ip.clone(), port), msg))
    }

    /// Decode an envelope from raw JSON bytes, as delivered by the HTTP endpoint.
    pub fn decode_json(
        &self,
        bytes: &[u8],
    ) -> Result<(NetAddress, ConsensusMessage), RouteError> {
        let frame: WireFrame =
            serde_json::from_slice(bytes).map_err(|_| RouteError::Malformed)?;
        self.decode_frame(&frame)
    }
}

/// Pluggable peer-to-peer networking, with each committee peer reachable by its ECDSA public key.
///
/// Networking providers interact with the consensus threads through implementations of this
/// trait. `broadcast` must reach all connected peers, including listeners that are not in the
/// committee, so non-voting nodes can follow consensus decisions.
pub trait Network: Clone + Send + 'static {
    /// Informs the network provider of the committee on wake-up.
    fn init_committee(&mut self, committee: &Committee);

    /// Informs the networking provider of a committee rotation.
    fn update_committee(&mut self, committee: &Committee);

    /// Send a frame to all peers without blocking.
    fn broadcast(&mut self, frame: WireFrame);

    /// Send a frame to the specified peer without blocking.
    fn send(&mut self, peer: PubKeyBytes, frame: WireFrame);

    /// Receive a frame from any peer. Returns immediately with `None` if nothing is available.
    fn recv(&mut self) -> Option<WireFrame>;
}

/// Handle for sending and broadcasting consensus messages: frames outbound messages through the
/// router, then hands them to the network provider.
#[derive(Clone)]
pub struct SenderHandle<N: Network> {
    network: N,
    router: Router,
}

impl<N: Network> SenderHandle<N> {
    pub fn new(network: N, router: Router) -> SenderHandle<N> {
        SenderHandle { network, router }
    }

    pub fn send<M: Into<ConsensusMessage>>(&mut self, peer: PubKeyBytes, msg: M) {
        let msg = msg.into();
        if let Ok(frame) = self.router.encode_frame(&msg) {
            self.network.send(peer, frame);
        }
    }

    pub fn broadcast<M: Into<ConsensusMessage>>(&mut self, msg: M) {
        let msg = msg.into();
        if let Ok(frame) = self.router.encode_frame(&msg) {
            self.network.broadcast(frame);
        }
    }
}

/// Spawn the poller thread: drains the network provider, routes each frame (magic check, decode,
/// authentication), and forwards accepted messages into the dispatch loop's input channel.
/// Rejected frames are dropped; everything except a magic mismatch is logged.
pub fn start_polling<N: Network>(
    mut network: N,
    router: Router,
    shutdown_signal: Receiver<()>,
) -> (JoinHandle<()>, Receiver<(NetAddress, ConsensusMessage)>) {
    let (to_dispatch, dispatch_receiver) = mpsc::channel();

    let poller_thread = thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) => return,
            Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Disconnected) => {
                panic!("poller thread disconnected from main thread")
            }
        }

        if let Some(frame) = network.recv() {
            match router.decode_frame(&frame) {
                Ok((peer, msg)) => {
                    let _ = to_dispatch.send((peer, msg));
                }
                Err(RouteError::MagicMismatch) => {}
                Err(err) => {
                    log::debug!("dropped inbound frame from {}: {:?}", frame.peer_ip, err)
                }
            }
        } else {
            thread::yield_now()
        }
    });

    (poller_thread, dispatch_receiver)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::EcdsaKeypair;
    use crate::types::basic::*;
    use crate::types::certificates::QuorumCert;
    use crate::pacemaker::messages::NewView;

    fn sample_msg(keypair: &EcdsaKeypair, magic: Magic) -> ConsensusMessage {
        NewView::new(
            keypair,
            magic,
            Round::new(1),
            EpochId::new(0),
            QuorumCert::genesis(BlockId::default()),
        )
        .into()
    }

    #[test]
    fn frame_roundtrip() {
        let router = Router::new(Magic::V1, NetAddress::new("10.0.0.1", DEFAULT_PORT));
        let keypair = EcdsaKeypair::generate();
        let msg = sample_msg(&keypair, Magic::V1);

        let frame = router.encode_frame(&msg).unwrap();
        assert_eq!(frame.magic, "76010000");

        let json = serde_json::to_vec(&frame).unwrap();
        let (peer, decoded) = router.decode_json(&json).unwrap();
        assert_eq!(peer, NetAddress::new("10.0.0.1", DEFAULT_PORT));
        assert_eq!(decoded, msg);
    }

    #[test]
    fn magic_mismatch_drops_silently() {
        let sender = Router::new(Magic::new([1, 2, 3, 4]), NetAddress::new("10.0.0.1", 8670));
        let receiver = Router::new(Magic::V1, NetAddress::new("10.0.0.2", 8670));
        let keypair = EcdsaKeypair::generate();

        let frame = sender
            .encode_frame(&sample_msg(&keypair, Magic::new([1, 2, 3, 4])))
            .unwrap();
        assert_eq!(
            receiver.decode_frame(&frame).unwrap_err(),
            RouteError::MagicMismatch
        );
    }

    #[test]
    fn garbage_payload_is_malformed() {
        let router = Router::new(Magic::V1, NetAddress::new("10.0.0.1", 8670));
        let frame = WireFrame {
            peer_ip: "10.0.0.9".into(),
            peer_port: "8670".into(),
            message: "zzzz".into(),
            magic: Magic::V1.to_hex(),
        };
        assert_eq!(router.decode_frame(&frame).unwrap_err(), RouteError::Malformed);

        let frame = WireFrame {
            peer_ip: "10.0.0.9".into(),
            peer_port: "8670".into(),
            message: hex::encode([0x42u8; 8]),
            magic: Magic::V1.to_hex(),
        };
        assert_eq!(router.decode_frame(&frame).unwrap_err(), RouteError::Malformed);
    }

    #[test]
    fn tampered_signature_is_unauthorized() {
        let router = Router::new(Magic::V1, NetAddress::new("10.0.0.1", 8670));
        let keypair = EcdsaKeypair::generate();
        let msg = sample_msg(&keypair, Magic::V1);

        let mut payload = msg.to_wire();
        // Flip a bit inside the QC body, past the header.
        let index = payload.len() - 1;
        payload[index] ^= 0x01;
        let frame = WireFrame {
            peer_ip: "10.0.0.9".into(),
            peer_port: "8670".into(),
            message: hex::encode(payload),
            magic: Magic::V1.to_hex(),
        };
        let err = router.decode_frame(&frame).unwrap_err();
        assert!(err == RouteError::Unauthorized || err == RouteError::Malformed);
    }
}
