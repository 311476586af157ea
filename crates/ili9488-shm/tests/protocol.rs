// Protocol tests over a real shared-memory arena: one thread plays the
// daemon's trywait/copy/post bracket, another plays a producer. Exercises
// the semaphore rendezvous the way two processes would.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ili9488_shm::{ArenaClient, TripleBufferArena};

fn unique_name(tag: &str) -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let id = COUNTER.fetch_add(1, Ordering::SeqCst);
    format!("proto-test-{}-{}-{}", tag, std::process::id(), id)
}

#[test]
fn producer_and_consumer_never_overlap() {
    let name = unique_name("rendezvous");
    let arena = TripleBufferArena::create(&name, 16, 16, [0; 3]).unwrap();
    arena.set_daemon_ready();
    let arena = Arc::new(arena);

    let frames_to_send = 100u32;

    let producer_name = name.clone();
    let producer = std::thread::spawn(move || {
        let client = ArenaClient::open(&producer_name).unwrap();
        assert!(client.wait_daemon_ready(Duration::from_secs(1)));
        client.mark_connected();

        let mut sent = 0u32;
        while sent < frames_to_send {
            let wrote = client
                .try_submit_frame(|buf, _, _| {
                    buf.fill((sent % 256) as u8);
                })
                .unwrap();
            if wrote {
                sent += 1;
            } else {
                std::thread::sleep(Duration::from_micros(50));
            }
        }
    });

    let consumer_arena = Arc::clone(&arena);
    let consumer = std::thread::spawn(move || {
        let sem = consumer_arena.pending_sem();
        let mut consumed = 0u32;
        let mut last_counter = 0u32;
        let deadline = Instant::now() + Duration::from_secs(5);
        while last_counter < frames_to_send {
            assert!(Instant::now() < deadline, "consumer stalled");
            if !sem.try_wait().unwrap() {
                std::thread::sleep(Duration::from_micros(50));
                continue;
            }
            let counter = consumer_arena.frame_counter();
            if counter != last_counter {
                // SAFETY: semaphore held.
                let mirror = unsafe { consumer_arena.pending_mirror() };
                // Every byte of a submitted frame carries the same fill value.
                let first = mirror[0];
                assert!(mirror.iter().all(|&b| b == first));
                last_counter = counter;
                consumed += 1;
            }
            sem.post().unwrap();
        }
        consumed
    });

    producer.join().unwrap();
    let consumed = consumer.join().unwrap();

    assert_eq!(arena.frame_counter(), frames_to_send);
    assert!(consumed >= 1 && consumed <= frames_to_send);
    // Semaphore back to its resting value.
    assert_eq!(arena.pending_sem().value().unwrap(), 1);
}

#[test]
fn client_rejects_foreign_region() {
    let name = unique_name("foreign");
    // A region that is too small to even hold the header.
    let shm = ili9488_shm::SharedMemory::create(&name, 64).unwrap();
    assert!(ArenaClient::open(&name).is_err());
    drop(shm);
}
