// Concurrent Queue Integration Tests
// Test ID Format: LFQ-2XX

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use hazard_queue::LockFreeQueue;
use rand::Rng;

// LFQ-201: producer/consumer balance. Four threads each enqueue a million
// items and then dequeue a million times; every dequeue must find an item
// because each thread only starts consuming after finishing producing.
#[test]
fn test_lfq_201_producer_consumer_balance() {
    const THREADS: usize = 4;
    const OPS: u64 = 1_000_000;

    let queue = LockFreeQueue::new();
    let mut handles = Vec::new();

    for _ in 0..THREADS {
        let q = queue.clone();
        handles.push(thread::spawn(move || {
            for i in 1..=OPS {
                q.enqueue(i);
            }
            for _ in 0..OPS {
                assert!(q.dequeue().is_some());
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert!(queue.is_empty());
    let stats = queue.stats();
    assert_eq!(stats.enqueue_count, THREADS as u64 * OPS);
    assert_eq!(stats.dequeue_count, THREADS as u64 * OPS);

    println!("LFQ-201: PASSED - {} enqueues matched by dequeues", stats.enqueue_count);
}

// LFQ-202: alternating enqueue/dequeue under contention on twice as many
// threads as CPUs. Odd iterations enqueue, even iterations dequeue, so
// every dequeue is preceded by one more enqueue on the same thread and can
// never legitimately find the queue empty.
#[test]
fn test_lfq_202_alternating_contention() {
    const ITERS: u64 = 1_000_000;
    let threads = num_cpus::get() * 2;

    let queue = LockFreeQueue::new();
    let mut handles = Vec::new();

    for _ in 0..threads {
        let q = queue.clone();
        handles.push(thread::spawn(move || {
            for i in 1..=ITERS {
                if i % 2 == 1 {
                    q.enqueue(i);
                } else {
                    assert!(q.dequeue().is_some());
                }
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    // Every thread enqueued and dequeued the same number of times.
    assert!(queue.is_empty());
    assert_eq!(queue.len(), 0);

    println!("LFQ-202: PASSED - {threads} threads alternated to an empty queue");
}

// LFQ-203: ABA stress. A small token pool cycles through the queue at high
// contention for a fixed budget; recycled nodes maximize the chance of a
// pointer value reappearing. Per-token accounting proves that no unknown
// token appears and none is delivered more often than it was enqueued.
#[test]
fn test_lfq_203_aba_stress() {
    const TOKENS: usize = 16;
    const THREADS: usize = 8;
    const BUDGET: Duration = Duration::from_millis(500);

    let queue = LockFreeQueue::new();
    let enqueued: Arc<Vec<AtomicUsize>> =
        Arc::new((0..TOKENS).map(|_| AtomicUsize::new(0)).collect());
    let dequeued: Arc<Vec<AtomicUsize>> =
        Arc::new((0..TOKENS).map(|_| AtomicUsize::new(0)).collect());

    for token in 0..TOKENS {
        queue.enqueue(token);
        enqueued[token].fetch_add(1, Ordering::SeqCst);
    }

    let deadline = Instant::now() + BUDGET;
    let mut handles = Vec::new();
    for _ in 0..THREADS {
        let q = queue.clone();
        let enqueued = Arc::clone(&enqueued);
        let dequeued = Arc::clone(&dequeued);
        handles.push(thread::spawn(move || {
            let mut rng = rand::rng();
            while Instant::now() < deadline {
                if let Some(token) = q.dequeue() {
                    assert!(token < TOKENS, "dequeued a token that was never enqueued");
                    dequeued[token].fetch_add(1, Ordering::SeqCst);

                    // Hold the token for a random beat, then recycle it.
                    for _ in 0..rng.random_range(0..64) {
                        std::hint::spin_loop();
                    }
                    q.enqueue(token);
                    enqueued[token].fetch_add(1, Ordering::SeqCst);
                }
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    // Drain the survivors, then balance the books per token.
    while let Some(token) = queue.dequeue() {
        assert!(token < TOKENS);
        dequeued[token].fetch_add(1, Ordering::SeqCst);
    }
    for token in 0..TOKENS {
        assert_eq!(
            enqueued[token].load(Ordering::SeqCst),
            dequeued[token].load(Ordering::SeqCst),
            "token {token} delivered a different number of times than enqueued"
        );
    }

    println!("LFQ-203: PASSED - {TOKENS}-token pool survived recycling stress");
}

// LFQ-204: no loss, no duplication across disjoint producers. Each
// producer enqueues a distinct range; consumers pop until everything has
// been seen exactly once.
#[test]
fn test_lfq_204_no_loss_no_duplication() {
    const PRODUCERS: usize = 4;
    const CONSUMERS: usize = 4;
    const PER_PRODUCER: usize = 100_000;
    const TOTAL: usize = PRODUCERS * PER_PRODUCER;

    let queue = LockFreeQueue::new();
    let seen: Arc<Vec<AtomicUsize>> =
        Arc::new((0..TOTAL).map(|_| AtomicUsize::new(0)).collect());
    let consumed = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for p in 0..PRODUCERS {
        let q = queue.clone();
        handles.push(thread::spawn(move || {
            for i in 0..PER_PRODUCER {
                q.enqueue(p * PER_PRODUCER + i);
            }
        }));
    }
    for _ in 0..CONSUMERS {
        let q = queue.clone();
        let seen = Arc::clone(&seen);
        let consumed = Arc::clone(&consumed);
        handles.push(thread::spawn(move || {
            while consumed.load(Ordering::SeqCst) < TOTAL {
                if let Some(token) = q.dequeue() {
                    let previous = seen[token].fetch_add(1, Ordering::SeqCst);
                    assert_eq!(previous, 0, "token {token} delivered twice");
                    consumed.fetch_add(1, Ordering::SeqCst);
                } else {
                    thread::yield_now();
                }
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert!(queue.is_empty());
    for token in 0..TOTAL {
        assert_eq!(seen[token].load(Ordering::SeqCst), 1, "token {token} lost");
    }

    println!("LFQ-204: PASSED - {TOTAL} distinct tokens each delivered once");
}
