use applauncherd::booster::types::BoosterType;
use applauncherd::daemon::protocol::{
    decode_message, encode_message, read_message, recv_fds, send_fds, write_message, Accepted,
    InvocationRequest, Message, PROTOCOL_VERSION,
};
use applauncherd::single_instance::{Acquire, LockManager};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use nix::unistd::getpid;
use std::collections::HashMap;
use std::io::Cursor;
use std::os::unix::net::UnixStream;

// ---------------------------------------------------------------------------
// Request fixtures
// ---------------------------------------------------------------------------

fn request(env_vars: usize) -> InvocationRequest {
    let mut env = HashMap::new();
    env.insert("PATH".to_string(), "/usr/local/bin:/usr/bin:/bin".to_string());
    env.insert("DISPLAY".to_string(), ":0".to_string());
    for i in 0..env_vars {
        env.insert(format!("VAR_{}", i), format!("value-{}-{}", i, "x".repeat(32)));
    }

    InvocationRequest {
        version: PROTOCOL_VERSION,
        app_name: "fala_ft_hello".to_string(),
        target: "/usr/bin/fala_ft_hello".to_string(),
        args: vec!["fala_ft_hello".to_string(), "--full-screen".to_string()],
        env,
        working_dir: "/home/user".to_string(),
        priority: 0,
        single_instance: false,
        booster_type: BoosterType::M,
    }
}

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

fn bench_framing(c: &mut Criterion) {
    let mut group = c.benchmark_group("framing");

    for env_vars in [0, 32, 256] {
        let message = Message::Invoke(request(env_vars));
        let bytes = encode_message(&message, 1).unwrap();

        group.bench_with_input(BenchmarkId::new("encode_invoke", env_vars), &message, |b, m| {
            b.iter(|| encode_message(black_box(m), 1).unwrap())
        });
        group.bench_with_input(BenchmarkId::new("decode_invoke", env_vars), &bytes, |b, bytes| {
            b.iter(|| decode_message(&mut Cursor::new(black_box(bytes))).unwrap())
        });
    }

    group.finish();
}

// ---------------------------------------------------------------------------
// Socket round trip: invoke + stdio fds, accepted reply
// ---------------------------------------------------------------------------

fn bench_round_trip(c: &mut Criterion) {
    let (mut invoker, mut booster) = UnixStream::pair().unwrap();
    let message = Message::Invoke(request(32));
    let stdio = [0, 1, 2];

    c.bench_function("invoke_round_trip", |b| {
        b.iter(|| {
            write_message(&mut invoker, &message, 7).unwrap();
            send_fds(&invoker, &stdio).unwrap();

            let (received, id) = read_message(&mut booster).unwrap();
            let fds = recv_fds(&booster, 3).unwrap();
            black_box((&received, fds.len()));

            write_message(&mut booster, &Message::Accepted(Accepted { pid: 1 }), id).unwrap();
            read_message(&mut invoker).unwrap()
        })
    });
}

// ---------------------------------------------------------------------------
// Single-instance locking
// ---------------------------------------------------------------------------

fn bench_single_instance(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let locks = LockManager::new(dir.path());
    let pid = getpid();

    c.bench_function("single_instance_acquire_release", |b| {
        b.iter(|| match locks.acquire("/usr/bin/fala_ft_hello", pid).unwrap() {
            Acquire::Granted(lock) => locks.release(lock, pid).unwrap(),
            Acquire::Held(owner) => panic!("lock held by {}", owner),
        })
    });
}

criterion_group!(benches, bench_framing, bench_round_trip, bench_single_instance);
criterion_main!(benches);
