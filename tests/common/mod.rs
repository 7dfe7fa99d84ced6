#![allow(dead_code)]

use std::io::Write;
use std::path::Path;
use std::thread;
use std::time::Duration;

pub fn write_file(path: &Path, data: &[u8]) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    let mut f = std::fs::File::create(path).unwrap();
    f.write_all(data).unwrap();
}

/// Deterministic pseudo-random bytes
pub fn sample(len: usize, seed: u32) -> Vec<u8> {
    let mut x = seed.wrapping_mul(2_654_435_761).max(1);
    (0..len)
        .map(|_| {
            x ^= x << 13;
            x ^= x >> 17;
            x ^= x << 5;
            x as u8
        })
        .collect()
}

pub fn free_port() -> u16 {
    let sock = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    sock.local_addr().unwrap().port()
}

pub fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let step = Duration::from_millis(25);
    let mut waited = Duration::ZERO;
    while waited < timeout {
        if cond() {
            return true;
        }
        thread::sleep(step);
        waited += step;
    }
    cond()
}

/// Move `path`'s mtime ahead so the next scan looks at its content
pub fn touch_ahead(path: &Path) {
    let f = std::fs::File::options().write(true).open(path).unwrap();
    f.set_modified(std::time::SystemTime::now() + Duration::from_secs(60))
        .unwrap();
}
