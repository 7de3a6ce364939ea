mod common;

use std::fs;
use std::sync::Arc;

use common::{local_harness, vp};

const OLD_LEN: usize = 64 * 1024;
const NEW_LEN: usize = 96 * 1024;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn readers_never_see_a_partial_commit() {
    let h = Arc::new(local_harness());
    fs::write(h.remote_root.join("big"), vec![b'a'; OLD_LEN]).unwrap();
    // prime the cache
    assert_eq!(h.read_all("/big").await.len(), OLD_LEN);

    let writer = h.fs.open(&vp("/big"), libc::O_RDWR as u32).await.unwrap();
    h.fs.write(writer, 0, &vec![b'b'; NEW_LEN]).await.unwrap();

    let mut readers = Vec::new();
    for _ in 0..8 {
        let h = h.clone();
        readers.push(tokio::spawn(async move {
            for _ in 0..20 {
                let data = h.read_all("/big").await;
                let old = data.len() == OLD_LEN && data.iter().all(|&b| b == b'a');
                let new = data.len() == NEW_LEN && data.iter().all(|&b| b == b'b');
                assert!(old || new, "torn read of {} bytes", data.len());
            }
        }));
    }
    tokio::task::yield_now().await;
    h.fs.release(writer).await.unwrap();

    for r in readers {
        r.await.unwrap();
    }
    assert_eq!(h.read_all("/big").await, vec![b'b'; NEW_LEN]);
    assert_eq!(h.staged_files(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_first_opens_fetch_consistently() {
    let h = Arc::new(local_harness());
    let body: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();
    fs::write(h.remote_root.join("shared"), &body).unwrap();

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let h = h.clone();
        tasks.push(tokio::spawn(async move { h.read_all("/shared").await }));
    }
    for t in tasks {
        assert_eq!(t.await.unwrap(), body);
    }
    assert_eq!(h.fs.open_handles().await, 0);
    assert_eq!(h.staged_files(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn last_release_wins_whole() {
    let h = Arc::new(local_harness());
    fs::write(h.remote_root.join("race"), b"").unwrap();

    let mut tasks = Vec::new();
    for i in 0..6u8 {
        let h = h.clone();
        tasks.push(tokio::spawn(async move {
            let fh = h.fs.open(&vp("/race"), libc::O_WRONLY as u32).await.unwrap();
            h.fs.write(fh, 0, &vec![b'0' + i; 4096]).await.unwrap();
            h.fs.release(fh).await.unwrap();
        }));
    }
    for t in tasks {
        t.await.unwrap();
    }

    let data = fs::read(h.cache_path("/race")).unwrap();
    assert_eq!(data.len(), 4096);
    assert!(data.iter().all(|&b| b == data[0]));
}
