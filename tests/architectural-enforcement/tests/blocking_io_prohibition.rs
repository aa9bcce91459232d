//! Integration Test: Blocking I/O Prohibition
//!
//! **Policy**: Async functions MUST NOT use blocking I/O.
//! **Required**: `tokio::fs` and `tokio::net`, not `std::fs` and `std::net` sockets.
//! Synchronous functions that run before the runtime serves traffic (config
//! loading) may read files directly.

use architectural_enforcement::production_sources;

const BLOCKING_CALLS: &[(&str, &str)] = &[
    ("std::fs::", "Blocking file I/O"),
    ("std::net::TcpStream", "Blocking network I/O"),
    ("std::net::TcpListener", "Blocking network I/O"),
    ("std::net::UdpSocket", "Blocking network I/O"),
    ("std::process::Command", "Blocking process I/O"),
    ("std::io::stdin()", "Blocking stdin"),
    ("std::io::stdout()", "Blocking stdout"),
];

#[test]
fn test_no_blocking_io_in_async_code() {
    let mut violations = Vec::new();

    for file in production_sources() {
        for line in file.lines.iter().filter(|l| l.in_async_fn) {
            for (pattern, what) in BLOCKING_CALLS {
                if line.code.contains(pattern) {
                    violations.push(file.violation(line, what));
                }
            }
        }
    }

    if !violations.is_empty() {
        eprintln!("\n❌ Blocking I/O calls found in async code!\n");
        for violation in &violations {
            eprintln!("  ❌ {violation}");
        }
        eprintln!("\n✅ Use tokio::fs, tokio::net and tokio::io instead.");
        panic!("\nFound {} blocking I/O violation(s).", violations.len());
    }
}

#[test]
fn test_no_blocking_sockets_anywhere() {
    let violations: Vec<String> = production_sources()
        .iter()
        .flat_map(|file| {
            file.lines
                .iter()
                .filter(|l| l.code.contains("std::net::Tcp"))
                .map(|l| file.violation(l, "Blocking socket"))
                .collect::<Vec<_>>()
        })
        .collect();

    assert!(violations.is_empty(), "{violations:#?}");
}
