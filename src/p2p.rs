//! Gossip feed of committed receipts and sealed blocks.
//!
//! Peers only index what they receive; nothing arriving here touches local
//! ledger state.

use libp2p::{
    gossipsub::{
        Behaviour as Gossipsub, ConfigBuilder as GossipsubConfigBuilder,
        Event as GossipsubEvent, IdentTopic, MessageAuthenticity,
    },
    identity,
    mdns::{self, Config as MdnsConfig, Event as MdnsEvent},
    noise,
    swarm::{NetworkBehaviour, Swarm},
    tcp,
    yamux::Config as YamuxConfig,
    PeerId, SwarmBuilder,
};
use serde::{Deserialize, Serialize};
use std::error::Error;
use tracing::{debug, info};

use crate::chain::{Block, Receipt};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub enum NetworkMessage {
    Receipt(Receipt),
    Block(Block),
}

#[derive(NetworkBehaviour)]
#[behaviour(out_event = "P2PEvent")]
pub struct P2PNetwork {
    pub gossipsub: Gossipsub,
    pub mdns: mdns::tokio::Behaviour,
}

#[derive(Debug)]
pub enum P2PEvent {
    Gossipsub(GossipsubEvent),
    Mdns(MdnsEvent),
}

impl From<GossipsubEvent> for P2PEvent {
    fn from(event: GossipsubEvent) -> Self {
        P2PEvent::Gossipsub(event)
    }
}

impl From<MdnsEvent> for P2PEvent {
    fn from(event: MdnsEvent) -> Self {
        P2PEvent::Mdns(event)
    }
}

pub fn build_swarm(topic: &str) -> Result<Swarm<P2PNetwork>, Box<dyn Error>> {
    let id_keys = identity::Keypair::generate_ed25519();
    let peer_id = PeerId::from(id_keys.public());
    info!(%peer_id, "local peer id");

    let gossipsub_config = GossipsubConfigBuilder::default()
        .build()
        .map_err(|e| format!("invalid gossipsub config: {:?}", e))?;
    let mut gossipsub = Gossipsub::new(
        MessageAuthenticity::Signed(id_keys.clone()),
        gossipsub_config,
    )?;
    gossipsub.subscribe(&IdentTopic::new(topic))?;

    let mdns = mdns::tokio::Behaviour::new(MdnsConfig::default(), peer_id)?;
    let behaviour = P2PNetwork { gossipsub, mdns };

    let swarm = SwarmBuilder::with_existing_identity(id_keys)
        .with_tokio()
        .with_tcp(
            tcp::Config::default().nodelay(true),
            noise::Config::new,
            YamuxConfig::default,
        )?
        .with_dns()?
        .with_behaviour(|_key| behaviour)?
        .build();

    Ok(swarm)
}

/// Publishes a message on `topic`. Having no peers yet is not an error.
pub fn publish(swarm: &mut Swarm<P2PNetwork>, topic: &str, msg: &NetworkMessage) -> Result<(), Box<dyn Error>> {
    let json = serde_json::to_string(msg)?;
    match swarm
        .behaviour_mut()
        .gossipsub
        .publish(IdentTopic::new(topic), json.as_bytes())
    {
        Ok(_) => Ok(()),
        Err(libp2p::gossipsub::PublishError::InsufficientPeers) => {
            debug!("no peers subscribed, message not gossiped");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Logs a message received from a peer.
pub fn handle_incoming(data: &[u8]) {
    match serde_json::from_slice::<NetworkMessage>(data) {
        Ok(NetworkMessage::Receipt(receipt)) => {
            for event in &receipt.events {
                info!(tx = %receipt.tx_hash, event = event.name(), task_id = event.task_id(), "peer ledger event");
            }
        }
        Ok(NetworkMessage::Block(block)) => {
            info!(index = block.index, hash = %block.hash, receipts = block.receipts.len(), "peer sealed block");
        }
        Err(e) => debug!(error = %e, "ignoring malformed gossip message"),
    }
}
