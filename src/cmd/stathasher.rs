//! Standalone hashing utility: given a ring file (one backend name per line)
//! and a newline-delimited list of keys on stdin, print `"{key} {backend}"`
//! for each, using the same murmur3 ring used to shard live traffic. Ported
//! from the original C `stathasher.c`, which exists so operators can check
//! where a given metric key would land without spinning up a whole relay.

use std::io::{self, BufRead, Write};

use statsrelay::hash::{choose_by_key, Ring};

fn load_ring(path: &str) -> io::Result<Ring<String>> {
    let contents = std::fs::read_to_string(path)?;
    let mut ring = Ring::new();
    for line in contents.lines() {
        let line = line.trim();
        if !line.is_empty() {
            ring.push(line.to_string());
        }
    }
    Ok(ring)
}

fn main() -> anyhow::Result<()> {
    let mut args = std::env::args();
    let argv0 = args.next().unwrap_or_else(|| "stathasher".to_string());
    let ring_path = match args.next() {
        Some(p) => p,
        None => {
            eprintln!("usage: {} /path/to/ring.txt", argv0);
            std::process::exit(1);
        }
    };

    let ring = load_ring(&ring_path)?;
    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut out = stdout.lock();

    for line in stdin.lock().lines() {
        let key = line?;
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        match choose_by_key(&ring, key.as_bytes()) {
            Some(backend) => writeln!(out, "{} {}", key, backend)?,
            None => writeln!(out, "{} -", key)?,
        }
    }
    Ok(())
}
