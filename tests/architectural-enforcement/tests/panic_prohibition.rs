//! Integration Test: Panic Prohibition
//!
//! **Policy**: Relay core production code propagates errors with `?`. It MUST
//! NOT call `unwrap()`, `expect()` or `panic!`; a panicking forwarder would
//! surface as a join failure instead of a typed connection error.

use architectural_enforcement::production_sources;

const PANICKING: &[&str] = &[".unwrap()", ".expect(", "panic!(", "unreachable!(", "todo!("];

#[test]
fn test_no_panics_in_core_production_code() {
    let mut violations = Vec::new();

    for file in production_sources()
        .into_iter()
        .filter(|f| f.path.components().any(|c| c.as_os_str() == "core"))
    {
        for line in &file.lines {
            for pattern in PANICKING {
                if line.code.contains(pattern) {
                    violations.push(file.violation(line, "Panicking call"));
                }
            }
        }
    }

    if !violations.is_empty() {
        eprintln!("\n❌ Panicking calls found in relay core!\n");
        for violation in &violations {
            eprintln!("  ❌ {violation}");
        }
        panic!("\nFound {} panicking call(s).", violations.len());
    }
}
