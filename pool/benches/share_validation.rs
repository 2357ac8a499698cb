use criterion::{black_box, criterion_group, criterion_main, Criterion};
use num_bigint::BigUint;
use serde_json::json;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use stratum_core::pow::bitcoin_diff1;
use stratum_core::{target_to_hex, Sha256d};
use stratum_pool::blockchain::BlockTemplate;
use stratum_pool::coin::GenericSerializer;
use stratum_pool::jobs::JobManager;
use stratum_pool::session::ShareContext;
use stratum_pool::stratum::{ConnectionRegistry, ShareSubmission};

const CUR_TIME: u32 = 1_700_000_000;

fn manager() -> (JobManager, String) {
    let jobs = JobManager::new(
        Arc::new(GenericSerializer::default()),
        Arc::new(Sha256d),
        Arc::new(ConnectionRegistry::new()),
        4,
    );
    let template = BlockTemplate {
        height: 1,
        prev_hash: "00".repeat(32),
        cur_time: CUR_TIME,
        target: target_to_hex(&(bitcoin_diff1() / BigUint::from(1_000_000u32))),
        data: json!({"coinbase1": "01000000010000", "coinbase2": "ffffffff0100"}),
    };
    let job = jobs.on_new_template(template).unwrap().unwrap();
    let id = job.id().to_string();
    (jobs, id)
}

fn bench_submit_share(c: &mut Criterion) {
    let (jobs, job_id) = manager();
    let ctx = ShareContext::new(vec![0, 0, 0, 1], 1e-9, IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)));
    let mut nonce: u32 = 0;

    c.bench_function("submit_share_sha256d", |b| {
        b.iter(|| {
            nonce = nonce.wrapping_add(1);
            let submission = ShareSubmission {
                worker: "bench".into(),
                job_id: job_id.clone(),
                extranonce2: "00000000".into(),
                ntime: format!("{:08x}", CUR_TIME),
                nonce: format!("{:08x}", nonce),
            };
            black_box(jobs.submit_share(&ctx, &submission).is_ok())
        })
    });
}

fn bench_duplicate_rejection(c: &mut Criterion) {
    let (jobs, job_id) = manager();
    let ctx = ShareContext::new(vec![0, 0, 0, 2], 1e-9, IpAddr::V4(Ipv4Addr::new(192, 0, 2, 2)));
    let submission = ShareSubmission {
        worker: "bench".into(),
        job_id,
        extranonce2: "00000000".into(),
        ntime: format!("{:08x}", CUR_TIME),
        nonce: "00000000".into(),
    };
    let _ = jobs.submit_share(&ctx, &submission);

    c.bench_function("submit_share_duplicate", |b| {
        b.iter(|| black_box(jobs.submit_share(&ctx, &submission).is_err()))
    });
}

criterion_group!(benches, bench_submit_share, bench_duplicate_rejection);
criterion_main!(benches);
