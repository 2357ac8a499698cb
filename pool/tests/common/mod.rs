#![allow(dead_code)]

use async_trait::async_trait;
use num_bigint::BigUint;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use stratum_core::pow::bitcoin_diff1;
use stratum_core::{target_to_hex, HashAlgorithm};
use stratum_pool::auth::Authorizer;
use stratum_pool::banning::BanManager;
use stratum_pool::blockchain::{BlockSubmitter, BlockTemplate};
use stratum_pool::coin::GenericSerializer;
use stratum_pool::config::PoolConfig;
use stratum_pool::jobs::JobManager;
use stratum_pool::shares::{Share, ShareProcessor, ShareSink};
use stratum_pool::stratum::{ConnectionRegistry, StratumServer};
use stratum_pool::vardiff::VarDiffConfig;

pub const CUR_TIME: u32 = 1_700_000_000;

/// Hashes every header to the same value.
pub struct FixedHasher([u8; 32]);

impl FixedHasher {
    pub fn of(value: &BigUint) -> Self {
        let raw = value.to_bytes_be();
        let mut out = [0u8; 32];
        out[32 - raw.len()..].copy_from_slice(&raw);
        Self(out)
    }
}

impl HashAlgorithm for FixedHasher {
    fn name(&self) -> &'static str {
        "fixed"
    }
    fn digest(&self, _header: &[u8]) -> [u8; 32] {
        self.0
    }
    fn diff1(&self) -> &BigUint {
        bitcoin_diff1()
    }
}

#[derive(Default)]
pub struct RecordingSink {
    pub shares: Mutex<Vec<Share>>,
}

#[async_trait]
impl ShareSink for RecordingSink {
    async fn record_share(&self, share: &Share) -> anyhow::Result<()> {
        self.shares.lock().push(share.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct CountingSubmitter {
    pub calls: AtomicUsize,
}

#[async_trait]
impl BlockSubmitter for CountingSubmitter {
    async fn submit_block(&self, _share: &Share, _block: &[u8]) -> anyhow::Result<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }
}

pub struct AllowAll;

#[async_trait]
impl Authorizer for AllowAll {
    async fn authorize(&self, _addr: IpAddr, username: &str, _password: &str) -> anyhow::Result<bool> {
        Ok(username != "denied")
    }
}

/// Template at `network_difficulty` that the generic serializer accepts.
pub fn template(height: u64, network_difficulty: u32) -> BlockTemplate {
    BlockTemplate {
        height,
        prev_hash: format!("{:064x}", height),
        cur_time: CUR_TIME,
        target: target_to_hex(&(bitcoin_diff1() / BigUint::from(network_difficulty))),
        data: json!({"coinbase1": "0100", "coinbase2": "ffff"}),
    }
}

pub fn test_config() -> PoolConfig {
    let mut cfg = PoolConfig::default();
    cfg.stratum.listen = "127.0.0.1:0".to_string();
    cfg.stratum.initial_difficulty = 1.0;
    cfg.stratum.max_line_length = 1024;
    cfg.vardiff = Some(VarDiffConfig {
        min_diff: 1.0,
        ..VarDiffConfig::default()
    });
    cfg.metrics_listen = None;
    cfg
}

pub struct TestPool {
    pub addr: SocketAddr,
    pub server: Arc<StratumServer>,
    pub jobs: Arc<JobManager>,
    pub sink: Arc<RecordingSink>,
    pub submitter: Arc<CountingSubmitter>,
    pub cancel: CancellationToken,
}

impl TestPool {
    pub async fn start(config: PoolConfig, hasher: Arc<dyn HashAlgorithm>) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let jobs = Arc::new(JobManager::new(
            Arc::new(GenericSerializer::new(config.stratum.extranonce2_size)),
            hasher,
            registry,
            config.jobs.max_active_jobs,
        ));
        let sink = Arc::new(RecordingSink::default());
        let submitter = Arc::new(CountingSubmitter::default());
        let shares = Arc::new(ShareProcessor::new(sink.clone(), Some(submitter.clone())));
        let server = Arc::new(StratumServer::new(
            &config,
            Arc::clone(&jobs),
            Arc::new(BanManager::new()),
            Arc::new(AllowAll),
            shares,
        ));

        let listener = StratumServer::bind(&config.stratum.listen).unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        tokio::spawn(Arc::clone(&server).serve(listener, cancel.clone()));

        Self {
            addr,
            server,
            jobs,
            sink,
            submitter,
            cancel,
        }
    }

    pub async fn connect(&self) -> Miner {
        Miner::connect(self.addr).await
    }
}

impl Drop for TestPool {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Minimal line-oriented Stratum client.
pub struct Miner {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    next_id: u64,
}

impl Miner {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, writer) = stream.into_split();
        Self {
            reader: BufReader::new(reader),
            writer,
            next_id: 1,
        }
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.unwrap();
    }

    /// Send a request and return its id.
    pub async fn request(&mut self, method: &str, params: Value) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        let line = json!({"id": id, "method": method, "params": params}).to_string() + "\n";
        self.send_raw(line.as_bytes()).await;
        id
    }

    /// Next message, or `None` when the server closed the connection.
    pub async fn recv(&mut self) -> Option<Value> {
        let mut line = String::new();
        let read = tokio::time::timeout(Duration::from_secs(5), self.reader.read_line(&mut line))
            .await
            .expect("timed out waiting for the pool");
        match read {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(serde_json::from_str(line.trim()).unwrap()),
        }
    }

    /// Skip notifications until the response to `id` arrives.
    pub async fn response(&mut self, id: u64) -> Value {
        loop {
            let msg = self.recv().await.expect("connection closed");
            if msg["id"] == json!(id) {
                return msg;
            }
        }
    }

    pub async fn subscribe(&mut self) -> Value {
        let id = self.request("mining.subscribe", json!(["test-miner/1.0"])).await;
        self.recv_expect_id(id).await
    }

    pub async fn authorize(&mut self, user: &str, password: &str) -> Value {
        let id = self.request("mining.authorize", json!([user, password])).await;
        self.response(id).await
    }

    async fn recv_expect_id(&mut self, id: u64) -> Value {
        let msg = self.recv().await.expect("connection closed");
        assert_eq!(msg["id"], json!(id), "unexpected message {msg}");
        msg
    }
}
