use task_escrow::{
    api::{self, AppState},
    chain::{Call, Chain},
    config::NodeConfig,
    error::ChainError,
    p2p::{self, NetworkMessage, P2PEvent},
    task::{format_amount, parse_amount, TaskId},
};
use std::error::Error;
use std::sync::{Arc, Mutex};
use libp2p::{
    gossipsub::Event as GossipsubEvent,
    mdns::Event as MdnsEvent,
    swarm::SwarmEvent,
};
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::select;
use tokio::sync::mpsc::{self, UnboundedSender};
use futures::StreamExt;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

type Input = Lines<BufReader<Stdin>>;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "task_escrow=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = NodeConfig::from_env()?;
    info!(data_dir = %config.data_dir.display(), topic = %config.topic, "🌱 Task Escrow Node starting");

    let chain = Arc::new(Mutex::new(Chain::open(&config)?));

    let mut swarm = p2p::build_swarm(&config.topic)?;
    swarm.listen_on("/ip4/0.0.0.0/tcp/0".parse()?)?;

    let (outbox, mut inbox) = mpsc::unbounded_channel();
    let state = Arc::new(AppState { chain: chain.clone(), outbox: outbox.clone() });
    let api_addr = config.api_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = api::start_api_server(state, &api_addr).await {
            error!(error = %e, "API server stopped");
        }
    });

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print_menu();

        select! {
            line = stdin.next_line() => {
                let choice = match line {
                    Ok(Some(line_str)) => line_str,
                    Ok(None) | Err(_) => "14".to_string(),
                };

                match choice.trim() {
                    "1" => {
                        let caller = prompt(&mut stdin, "Enter your wallet address:").await?;
                        let key = prompt(&mut stdin, "Enter your wallet key:").await?;
                        let description = prompt(&mut stdin, "Task description:").await?;
                        let reward = prompt(&mut stdin, "Reward (coins, e.g. 0.5):").await?;
                        match parse_amount(&reward) {
                            Some(reward) => {
                                run_call(&chain, &outbox, &caller, &key, Call::PostTask { description, reward })
                            }
                            None => println!("❌ Invalid amount."),
                        }
                    }
                    "2" | "3" | "4" | "5" | "6" => {
                        let caller = prompt(&mut stdin, "Enter your wallet address:").await?;
                        let key = prompt(&mut stdin, "Enter your wallet key:").await?;
                        let Some(id) = prompt_id(&mut stdin).await? else { continue };
                        let call = match choice.trim() {
                            "2" => Call::AcceptTask { id },
                            "3" => Call::CompleteTask { id },
                            "4" => Call::ConfirmCompletion { id },
                            "5" => Call::CancelTask { id },
                            _ => Call::WithdrawFromTask { id },
                        };
                        run_call(&chain, &outbox, &caller, &key, call);
                    }
                    "7" => {
                        let Some(id) = prompt_id(&mut stdin).await? else { continue };
                        match with_chain(&chain, |c| c.ledger.get_task(id)) {
                            Ok(Ok(task)) => println!("{:#?}", task),
                            Ok(Err(e)) => println!("❌ {}", e),
                            Err(e) => println!("❌ {}", e),
                        }
                    }
                    "8" => {
                        let filter = prompt(&mut stdin, "Filter: [o]pen, [p]oster, [w]orker").await?;
                        let ids = match filter.as_str() {
                            "p" => {
                                let addr = prompt(&mut stdin, "Poster address:").await?;
                                with_chain(&chain, |c| c.ledger.tasks_by_poster(&addr))
                            }
                            "w" => {
                                let addr = prompt(&mut stdin, "Worker address:").await?;
                                with_chain(&chain, |c| c.ledger.tasks_by_worker(&addr))
                            }
                            _ => with_chain(&chain, |c| c.ledger.open_tasks()),
                        };
                        match ids {
                            Ok(ids) => println!("Task ids: {:?}", ids),
                            Err(e) => println!("❌ {}", e),
                        }
                    }
                    "9" => {
                        if let Err(e) = with_chain(&chain, |c| {
                            c.wallets.view_wallets();
                            println!("In custody: {}", format_amount(c.ledger.custody()));
                        }) {
                            println!("❌ {}", e);
                        }
                    }
                    "10" => match with_chain(&chain, |c| c.create_wallet()).and_then(|r| r) {
                        Ok(created) => {
                            println!("✅ Wallet created! Address: {}", created.wallet.address);
                            println!("Mnemonic (save this!): {}", created.mnemonic);
                            println!("Wallet key (needed to sign calls): {}", created.key);
                        }
                        Err(e) => println!("❌ {}", e),
                    },
                    "11" => match with_chain(&chain, |c| c.seal_block()) {
                        Ok(Some(block)) => {
                            println!("✅ Block {} sealed: {}", block.index, block.hash);
                            if outbox.send(NetworkMessage::Block(block)).is_err() {
                                warn!("gossip outbox closed, block not published");
                            }
                        }
                        Ok(None) => println!("Nothing pending."),
                        Err(e) => println!("❌ {}", e),
                    },
                    "12" => {
                        if let Err(e) = with_chain(&chain, |c| {
                            c.blocks.iter().for_each(|block| println!("{:#?}", block));
                            println!("Chain valid: {}", c.verify());
                        }) {
                            println!("❌ {}", e);
                        }
                    }
                    "13" => {
                        println!("Connected Peers:");
                        for peer in swarm.behaviour().mdns.discovered_nodes() { println!("{}", peer); }
                    }
                    "14" | "exit" => break,
                    _ => println!("❌ Invalid choice."),
                }
            },
            Some(msg) = inbox.recv() => {
                if let Err(e) = p2p::publish(&mut swarm, &config.topic, &msg) {
                    warn!(error = %e, "failed to gossip message");
                }
            },
            event = swarm.select_next_some() => {
                match event {
                    SwarmEvent::Behaviour(P2PEvent::Gossipsub(GossipsubEvent::Message { message, .. })) => {
                        p2p::handle_incoming(&message.data);
                    }
                    SwarmEvent::Behaviour(P2PEvent::Mdns(MdnsEvent::Discovered(peers))) => {
                        for (peer_id, _) in peers {
                            swarm.behaviour_mut().gossipsub.add_explicit_peer(&peer_id);
                        }
                    }
                    SwarmEvent::Behaviour(P2PEvent::Mdns(MdnsEvent::Expired(peers))) => {
                        for (peer_id, _) in peers {
                            swarm.behaviour_mut().gossipsub.remove_explicit_peer(&peer_id);
                        }
                    }
                    SwarmEvent::NewListenAddr { address, .. } => info!(%address, "listening"),
                    _ => {}
                }
            }
        }
    }
    Ok(())
}

fn print_menu() {
    println!("\n🌍 Options:");
    println!("1.  Post Task");
    println!("2.  Accept Task");
    println!("3.  Complete Task");
    println!("4.  Confirm Completion");
    println!("5.  Cancel Task");
    println!("6.  Withdraw From Task");
    println!("7.  View Task");
    println!("8.  List Tasks");
    println!("9.  View Wallets");
    println!("10. Create Wallet");
    println!("11. Seal Block");
    println!("12. View Chain");
    println!("13. View Peers");
    println!("14. Exit");
}

async fn prompt(stdin: &mut Input, label: &str) -> std::io::Result<String> {
    println!("{}", label);
    Ok(stdin.next_line().await?.unwrap_or_default().trim().to_string())
}

async fn prompt_id(stdin: &mut Input) -> std::io::Result<Option<TaskId>> {
    let raw = prompt(stdin, "Task id:").await?;
    let id = raw.parse().ok();
    if id.is_none() {
        println!("❌ Invalid task id.");
    }
    Ok(id)
}

fn with_chain<R>(chain: &Mutex<Chain>, f: impl FnOnce(&mut Chain) -> R) -> Result<R, ChainError> {
    let mut guard = chain
        .lock()
        .map_err(|e| ChainError::Unavailable(e.to_string()))?;
    Ok(f(&mut guard))
}

fn run_call(
    chain: &Mutex<Chain>,
    outbox: &UnboundedSender<NetworkMessage>,
    caller: &str,
    key: &str,
    call: Call,
) {
    let op = call.name();
    match with_chain(chain, |c| c.execute_authenticated(caller, key, call)).and_then(|r| r) {
        Ok(receipt) => {
            println!("✅ {} committed (tx {})", op, receipt.tx_hash);
            if outbox.send(NetworkMessage::Receipt(receipt)).is_err() {
                warn!("gossip outbox closed, receipt not published");
            }
        }
        Err(e) => println!("❌ {} failed: {}", op, e),
    }
}
