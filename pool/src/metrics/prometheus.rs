use prometheus::core::Collector;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, TextEncoder};
use std::sync::OnceLock;

static ACCEPTED: OnceLock<IntCounter> = OnceLock::new();
static REJECTED: OnceLock<IntCounterVec> = OnceLock::new();
static BLOCK_CANDIDATES: OnceLock<IntCounter> = OnceLock::new();
static VARDIFF_RETARGETS: OnceLock<IntCounter> = OnceLock::new();
static JOB_BROADCASTS: OnceLock<IntCounter> = OnceLock::new();

static RPC_REQUESTS: OnceLock<IntCounter> = OnceLock::new();
static RPC_ERRORS: OnceLock<IntCounter> = OnceLock::new();
static TEMPLATE_UPDATES: OnceLock<IntCounter> = OnceLock::new();
static TEMPLATE_FETCH_ERRORS: OnceLock<IntCounter> = OnceLock::new();
static BLOCK_SUBMIT_ATTEMPTS: OnceLock<IntCounter> = OnceLock::new();
static BLOCK_SUBMIT_REJECTED: OnceLock<IntCounter> = OnceLock::new();

static BANS: OnceLock<IntCounter> = OnceLock::new();
static PROTOCOL_ERRORS: OnceLock<IntCounter> = OnceLock::new();
static SEND_QUEUE_OVERFLOWS: OnceLock<IntCounter> = OnceLock::new();

static ACTIVE_CONNECTIONS: OnceLock<IntGauge> = OnceLock::new();
static TEMPLATE_HEIGHT: OnceLock<IntGauge> = OnceLock::new();

fn counter(cell: &'static OnceLock<IntCounter>, name: &str, help: &str) -> &'static IntCounter {
    cell.get_or_init(|| IntCounter::new(name, help).unwrap())
}

fn gauge(cell: &'static OnceLock<IntGauge>, name: &str, help: &str) -> &'static IntGauge {
    cell.get_or_init(|| IntGauge::new(name, help).unwrap())
}

fn accepted() -> &'static IntCounter {
    counter(&ACCEPTED, "shares_accepted_total", "Total accepted shares")
}
fn rejected() -> &'static IntCounterVec {
    REJECTED.get_or_init(|| {
        IntCounterVec::new(
            Opts::new("shares_rejected_total", "Total rejected shares"),
            &["reason"],
        )
        .unwrap()
    })
}
fn block_candidates() -> &'static IntCounter {
    counter(&BLOCK_CANDIDATES, "block_candidates_total", "Shares meeting the network target")
}
fn vardiff_retargets() -> &'static IntCounter {
    counter(&VARDIFF_RETARGETS, "vardiff_retargets_total", "Total vardiff retargets")
}
fn job_broadcasts() -> &'static IntCounter {
    counter(&JOB_BROADCASTS, "job_broadcasts_total", "Total job broadcasts")
}
fn rpc_requests() -> &'static IntCounter {
    counter(&RPC_REQUESTS, "daemon_rpc_requests_total", "Total daemon RPC requests")
}
fn rpc_errors() -> &'static IntCounter {
    counter(&RPC_ERRORS, "daemon_rpc_errors_total", "Total daemon RPC errors")
}
fn template_updates() -> &'static IntCounter {
    counter(&TEMPLATE_UPDATES, "template_updates_total", "Templates that produced a new job")
}
fn template_fetch_errors() -> &'static IntCounter {
    counter(&TEMPLATE_FETCH_ERRORS, "template_fetch_errors_total", "Failed template fetches")
}
fn block_submit_attempts() -> &'static IntCounter {
    counter(&BLOCK_SUBMIT_ATTEMPTS, "block_submit_attempts_total", "Block submissions sent to the daemon")
}
fn block_submit_rejected() -> &'static IntCounter {
    counter(&BLOCK_SUBMIT_REJECTED, "block_submit_rejected_total", "Block submissions rejected or failed")
}
fn bans() -> &'static IntCounter {
    counter(&BANS, "bans_total", "IP bans issued")
}
fn protocol_errors() -> &'static IntCounter {
    counter(&PROTOCOL_ERRORS, "stratum_protocol_errors_total", "Connections closed for protocol violations")
}
fn send_queue_overflows() -> &'static IntCounter {
    counter(&SEND_QUEUE_OVERFLOWS, "stratum_send_queue_overflows_total", "Connections dropped for a full send queue")
}
fn active_connections() -> &'static IntGauge {
    gauge(&ACTIVE_CONNECTIONS, "stratum_active_connections", "Active Stratum connections")
}
fn template_height() -> &'static IntGauge {
    gauge(&TEMPLATE_HEIGHT, "block_template_height", "Current block template height")
}

pub fn inc_accepted() {
    accepted().inc();
}
pub fn inc_rejected(reason: &str) {
    rejected().with_label_values(&[reason]).inc();
}
pub fn inc_block_candidates() {
    block_candidates().inc();
}
pub fn inc_vardiff_retarget() {
    vardiff_retargets().inc();
}
pub fn inc_job_broadcasts() {
    job_broadcasts().inc();
}
pub fn inc_rpc_requests() {
    rpc_requests().inc();
}
pub fn inc_rpc_errors() {
    rpc_errors().inc();
}
pub fn inc_template_updates() {
    template_updates().inc();
}
pub fn inc_template_fetch_errors() {
    template_fetch_errors().inc();
}
pub fn inc_block_submit_attempts() {
    block_submit_attempts().inc();
}
pub fn inc_block_submit_rejected() {
    block_submit_rejected().inc();
}
pub fn inc_bans() {
    bans().inc();
}
pub fn inc_protocol_errors() {
    protocol_errors().inc();
}
pub fn inc_send_queue_overflows() {
    send_queue_overflows().inc();
}
pub fn set_connections(count: usize) {
    active_connections().set(count as i64);
}
pub fn set_template_height(height: u64) {
    template_height().set(height as i64);
}

pub fn render() -> String {
    let enc = TextEncoder::new();
    let mut mfs = Vec::new();
    mfs.extend(accepted().collect());
    mfs.extend(rejected().collect());
    mfs.extend(block_candidates().collect());
    mfs.extend(vardiff_retargets().collect());
    mfs.extend(job_broadcasts().collect());
    mfs.extend(rpc_requests().collect());
    mfs.extend(rpc_errors().collect());
    mfs.extend(template_updates().collect());
    mfs.extend(template_fetch_errors().collect());
    mfs.extend(block_submit_attempts().collect());
    mfs.extend(block_submit_rejected().collect());
    mfs.extend(bans().collect());
    mfs.extend(protocol_errors().collect());
    mfs.extend(send_queue_overflows().collect());
    mfs.extend(active_connections().collect());
    mfs.extend(template_height().collect());

    let mut buf = Vec::new();
    let _ = enc.encode(&mfs, &mut buf);
    String::from_utf8_lossy(&buf).to_string()
}
