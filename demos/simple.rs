//! A couple of writers publishing consecutive values while readers poll
//! them, all through the fair queued lock.

extern crate frwlock;

use frwlock::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const WRITERS: usize = 2;
const VALUES_PER_WRITER: usize = 10;

fn main() {
    let value = Arc::new(RwLock::new(0usize));
    let done = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..4)
        .map(|id| {
            let value = value.clone();
            let done = done.clone();
            thread::spawn(move || {
                while !done.load(Ordering::Relaxed) {
                    println!("reader {id} saw {}", *value.read());
                    thread::sleep(Duration::from_micros(10));
                }
            })
        })
        .collect();

    let writers: Vec<_> = (0..WRITERS)
        .map(|id| {
            let value = value.clone();
            thread::spawn(move || {
                for i in id * VALUES_PER_WRITER..(id + 1) * VALUES_PER_WRITER {
                    *value.write() = i;
                    thread::sleep(Duration::from_micros(10));
                }
            })
        })
        .collect();

    for th in writers {
        th.join().unwrap();
    }

    done.store(true, Ordering::Relaxed);

    for th in readers {
        th.join().unwrap();
    }

    let last = *value.read();
    assert!(last < WRITERS * VALUES_PER_WRITER);
    println!("final value {last}");
}
