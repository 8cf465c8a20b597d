use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::mpsc;

use wallet_sync::remote::TxStatus;
use wallet_sync::transport::{BoxedStream, Connector};

/// Raw transaction the server hands out for `tx_hash`.
pub fn raw_tx(tx_hash: &str) -> String {
    format!("raw-{}", tx_hash)
}

/// Timestamp the server reports for block `height`.
pub fn block_timestamp(height: u64) -> u64 {
    1_600_000_000 + height
}

#[derive(Default)]
struct ChainState {
    histories: HashMap<String, Vec<TxStatus>>,
    transactions: HashSet<String>,
    tip: u64,
    held: HashSet<String>,
    calls: Vec<(String, Value)>,
}

enum Outbound {
    Line(String),
    Close,
}

/// Scripted chain server. Clones share state.
#[derive(Clone, Default)]
pub struct ChainServer {
    state: Arc<Mutex<ChainState>>,
    connection: Arc<Mutex<Option<mpsc::UnboundedSender<Outbound>>>>,
    connections: Arc<AtomicUsize>,
}

impl ChainServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(ChainConnector {
            server: self.clone(),
        })
    }

    /// Set the history of `address`; every listed transaction becomes
    /// fetchable.
    pub fn set_history(&self, address: &str, history: &[(&str, i64)]) {
        let mut state = self.state.lock().unwrap();
        let statuses: Vec<TxStatus> = history
            .iter()
            .map(|(hash, height)| TxStatus {
                tx_hash: hash.to_string(),
                height: *height,
            })
            .collect();
        for status in &statuses {
            state.transactions.insert(status.tx_hash.clone());
        }
        state.histories.insert(address.to_string(), statuses);
    }

    /// Make `tx_hash` unfetchable.
    pub fn forget_transaction(&self, tx_hash: &str) {
        self.state.lock().unwrap().transactions.remove(tx_hash);
    }

    pub fn set_tip(&self, height: u64) {
        self.state.lock().unwrap().tip = height;
    }

    /// Leave requests for `method` unanswered.
    pub fn hold(&self, method: &str) {
        self.state.lock().unwrap().held.insert(method.to_string());
    }

    pub fn release(&self, method: &str) {
        self.state.lock().unwrap().held.remove(method);
    }

    /// Params of every received call of `method`, in arrival order.
    pub fn calls(&self, method: &str) -> Vec<Value> {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|(m, _)| m == method)
            .map(|(_, params)| params.clone())
            .collect()
    }

    pub fn call_count(&self, method: &str) -> usize {
        self.calls(method).len()
    }

    pub fn total_calls(&self) -> usize {
        self.state.lock().unwrap().calls.len()
    }

    /// Addresses subscribed so far, with repeats.
    pub fn subscribed(&self) -> Vec<String> {
        self.calls("blockchain.address.subscribe")
            .iter()
            .filter_map(|params| params[0].as_str().map(str::to_string))
            .collect()
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn notify_address(&self, address: &str) {
        self.push(json!({
            "method": "blockchain.address.subscribe",
            "params": [address, "status"],
        }));
    }

    pub fn notify_header(&self, height: u64) {
        self.push(json!({
            "method": "blockchain.headers.subscribe",
            "params": [{"block_height": height, "timestamp": block_timestamp(height)}],
        }));
    }

    pub fn notify_block_count(&self, height: u64) {
        self.push(json!({
            "method": "blockchain.numblocks.subscribe",
            "params": [height],
        }));
    }

    /// Close the current connection from the server side.
    pub fn drop_connection(&self) {
        if let Some(sender) = self.connection.lock().unwrap().take() {
            let _ = sender.send(Outbound::Close);
        }
    }

    fn push(&self, message: Value) {
        if let Some(sender) = self.connection.lock().unwrap().as_ref() {
            let _ = sender.send(Outbound::Line(format!("{}\n", message)));
        }
    }

    fn answer(&self, request: &Value) -> Option<Value> {
        let id = request["id"].clone();
        let method = request["method"].as_str().unwrap_or_default().to_string();
        let params = request["params"].clone();

        let mut state = self.state.lock().unwrap();
        state.calls.push((method.clone(), params.clone()));
        if state.held.contains(&method) {
            return None;
        }

        let first = params.get(0).cloned().unwrap_or(Value::Null);
        let result: Result<Value, String> = match method.as_str() {
            "blockchain.address.get_history" => {
                let address = first.as_str().unwrap_or_default();
                Ok(json!(state.histories.get(address).cloned().unwrap_or_default()))
            }
            "blockchain.address.subscribe" => Ok(Value::Null),
            "blockchain.transaction.get" => {
                let hash = first.as_str().unwrap_or_default();
                if state.transactions.contains(hash) {
                    Ok(json!(raw_tx(hash)))
                } else {
                    Err(format!("unknown transaction {}", hash))
                }
            }
            "blockchain.transaction.broadcast" => {
                Ok(json!(format!("txid-{}", first.as_str().unwrap_or_default())))
            }
            "blockchain.headers.subscribe" => Ok(json!({
                "block_height": state.tip,
                "timestamp": block_timestamp(state.tip),
            })),
            "blockchain.block.get_header" => {
                let height = first.as_u64().unwrap_or_default();
                Ok(json!({"block_height": height, "timestamp": block_timestamp(height)}))
            }
            other => Err(format!("unknown method {}", other)),
        };

        Some(match result {
            Ok(result) => json!({"id": id, "result": result}),
            Err(message) => json!({"id": id, "error": {"code": -32600, "message": message}}),
        })
    }
}

struct ChainConnector {
    server: ChainServer,
}

#[async_trait]
impl Connector for ChainConnector {
    async fn connect(&self) -> io::Result<BoxedStream> {
        let (client, server_end) = tokio::io::duplex(256 * 1024);
        let (sender, outbound) = mpsc::unbounded_channel();
        *self.server.connection.lock().unwrap() = Some(sender);
        self.server.connections.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(serve(self.server.clone(), server_end, outbound));
        Ok(Box::new(client))
    }

    fn describe(&self) -> String {
        "chain-fixture".to_string()
    }
}

async fn serve(
    server: ChainServer,
    stream: DuplexStream,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) {
    let (read, mut write) = tokio::io::split(stream);
    let mut lines = BufReader::new(read).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Ok(Some(line)) = line else { break };
                let Ok(request) = serde_json::from_str::<Value>(&line) else { break };
                if let Some(reply) = server.answer(&request) {
                    let reply = format!("{}\n", reply);
                    if write.write_all(reply.as_bytes()).await.is_err() {
                        break;
                    }
                }
            }
            message = outbound.recv() => match message {
                Some(Outbound::Line(line)) => {
                    if write.write_all(line.as_bytes()).await.is_err() {
                        break;
                    }
                }
                Some(Outbound::Close) | None => break,
            },
        }
    }
}
