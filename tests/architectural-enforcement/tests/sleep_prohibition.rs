//! Integration Test: Sleep Prohibition
//!
//! **Policy**: Relay production code MUST NOT sleep to wait for events.
//! Readers park on broker connections and cancellation tokens instead.
//! **Exception**: publish retry backoff in `publisher.rs`.

use architectural_enforcement::production_sources;

/// Files allowed to sleep between retry attempts
const BACKOFF_FILES: &[&str] = &["publisher.rs"];

#[test]
fn test_no_sleep_in_production_code() {
    let mut violations = Vec::new();

    for file in production_sources() {
        let backoff_allowed = file
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|name| BACKOFF_FILES.contains(&name));

        for line in &file.lines {
            if line.code.contains("thread::sleep") {
                violations.push(file.violation(line, "Thread sleep"));
            } else if line.code.contains("time::sleep") && !backoff_allowed {
                violations.push(file.violation(line, "Sleep outside retry backoff"));
            }
        }
    }

    if !violations.is_empty() {
        eprintln!("\n❌ Sleep calls found in production code!\n");
        for violation in &violations {
            eprintln!("  ❌ {violation}");
        }
        eprintln!("\n✅ Wait on I/O, channels or a CancellationToken instead.");
        panic!("\nFound {} sleep violation(s).", violations.len());
    }
}
