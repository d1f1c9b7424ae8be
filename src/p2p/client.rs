//! Master-side signing client: fans a request out to every cosigner peer and
//! joins the responses on a count-or-timeout barrier.

use std::collections::HashMap;

use async_trait::async_trait;
use eyre::{eyre, Result, WrapErr};
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use libp2p::multiaddr::Protocol;
use libp2p::request_response::{self, OutboundRequestId};
use libp2p::swarm::SwarmEvent;
use libp2p::{identity, Multiaddr, PeerId, Swarm};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::protocol::{SignRequest, SignResponse};
use super::{build_swarm, SignerBehaviour, SignerBehaviourEvent, SignerClient, GATHER_TIMEOUT};

struct GatherCommand {
    request: SignRequest,
    needed: usize,
    reply: oneshot::Sender<Vec<SignResponse>>,
}

/// Handle to the swarm task driving the cosigner fan-out.
pub struct SignersClient {
    command_tx: mpsc::Sender<GatherCommand>,
}

impl SignersClient {
    /// Spawn the swarm task. Cosigners are reachable through the relay: the
    /// circuit address of each peer is registered up front, so requests dial
    /// on demand without any discovery.
    pub fn start(
        keypair: identity::Keypair,
        cosigners: Vec<PeerId>,
        relay: Multiaddr,
    ) -> Result<Self> {
        if !relay.iter().any(|p| matches!(p, Protocol::P2p(_))) {
            return Err(eyre!("relay address must carry a /p2p peer id"));
        }

        let mut swarm = build_swarm(keypair)?;
        swarm
            .dial(relay.clone())
            .wrap_err("failed to dial relay")?;
        for peer in &cosigners {
            let circuit = relay.clone().with(Protocol::P2pCircuit);
            swarm.add_peer_address(*peer, circuit);
        }

        info!(
            component = "signers_client",
            cosigners = cosigners.len(),
            relay = %relay,
            "signer client started"
        );

        let (command_tx, command_rx) = mpsc::channel(16);
        tokio::spawn(run_client(swarm, cosigners, command_rx));
        Ok(Self { command_tx })
    }
}

#[async_trait]
impl SignerClient for SignersClient {
    async fn gather(&self, request: SignRequest, needed: usize) -> Result<Vec<SignResponse>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(GatherCommand {
                request,
                needed,
                reply: reply_tx,
            })
            .await
            .map_err(|_| eyre!("signer client task stopped"))?;
        reply_rx
            .await
            .wrap_err("signer client task dropped the request")
    }
}

struct GatherState {
    responses: Vec<SignResponse>,
    outstanding: usize,
    needed: usize,
    reply: Option<oneshot::Sender<Vec<SignResponse>>>,
}

impl GatherState {
    fn satisfied(&self) -> bool {
        let usable = self
            .responses
            .iter()
            .filter(|r| !matches!(r, SignResponse::Rejected { .. }))
            .count();
        usable >= self.needed || self.outstanding == 0
    }

    fn finish(&mut self) {
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(std::mem::take(&mut self.responses));
        }
    }
}

async fn run_client(
    mut swarm: Swarm<SignerBehaviour>,
    cosigners: Vec<PeerId>,
    mut command_rx: mpsc::Receiver<GatherCommand>,
) {
    let mut next_id: u64 = 0;
    let mut gathers: HashMap<u64, GatherState> = HashMap::new();
    let mut by_request: HashMap<OutboundRequestId, u64> = HashMap::new();
    let mut deadlines = FuturesUnordered::new();

    loop {
        tokio::select! {
            command = command_rx.recv() => {
                let Some(command) = command else {
                    // the bridge dropped its handle, nothing left to do
                    return;
                };
                let id = next_id;
                next_id += 1;

                let mut outstanding = 0;
                for peer in &cosigners {
                    let request_id = swarm
                        .behaviour_mut()
                        .request_response
                        .send_request(peer, command.request.clone());
                    by_request.insert(request_id, id);
                    outstanding += 1;
                }

                let mut state = GatherState {
                    responses: Vec::new(),
                    outstanding,
                    needed: command.needed,
                    reply: Some(command.reply),
                };
                if state.satisfied() {
                    state.finish();
                } else {
                    gathers.insert(id, state);
                    deadlines.push(async move {
                        tokio::time::sleep(GATHER_TIMEOUT).await;
                        id
                    });
                }
            }
            Some(id) = deadlines.next() => {
                if let Some(mut state) = gathers.remove(&id) {
                    warn!(
                        component = "signers_client",
                        gathered = state.responses.len(),
                        needed = state.needed,
                        "signature gathering timed out"
                    );
                    state.finish();
                }
            }
            event = swarm.select_next_some() => {
                handle_event(event, &mut gathers, &mut by_request);
            }
        }
    }
}

fn handle_event(
    event: SwarmEvent<SignerBehaviourEvent>,
    gathers: &mut HashMap<u64, GatherState>,
    by_request: &mut HashMap<OutboundRequestId, u64>,
) {
    match event {
        SwarmEvent::Behaviour(SignerBehaviourEvent::RequestResponse(
            request_response::Event::Message {
                peer,
                message: request_response::Message::Response { request_id, response },
                ..
            },
        )) => {
            let Some(id) = by_request.remove(&request_id) else {
                return;
            };
            let Some(state) = gathers.get_mut(&id) else {
                return;
            };
            debug!(component = "signers_client", %peer, "received signer response");
            state.outstanding -= 1;
            state.responses.push(response);
            if state.satisfied() {
                let mut state = gathers.remove(&id).unwrap();
                state.finish();
            }
        }
        SwarmEvent::Behaviour(SignerBehaviourEvent::RequestResponse(
            request_response::Event::OutboundFailure { peer, request_id, error, .. },
        )) => {
            warn!(
                component = "signers_client",
                %peer,
                err = %error,
                "signer request failed"
            );
            let Some(id) = by_request.remove(&request_id) else {
                return;
            };
            let Some(state) = gathers.get_mut(&id) else {
                return;
            };
            state.outstanding -= 1;
            if state.satisfied() {
                let mut state = gathers.remove(&id).unwrap();
                state.finish();
            }
        }
        SwarmEvent::ConnectionEstablished { peer_id, .. } => {
            debug!(component = "signers_client", %peer_id, "connection established");
        }
        _ => {}
    }
}
