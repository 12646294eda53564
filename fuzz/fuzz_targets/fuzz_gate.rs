//! Fuzz testing for the request-facing parsers of the gate.
//!
//! Every function exercised here sees attacker-controlled input on each
//! request. They must never panic, and their outputs must keep the
//! invariants the gate relies on.
//!
//! # Running the Fuzz Tests
//!
//! ```bash
//! # Install cargo-fuzz (requires nightly)
//! cargo +nightly install cargo-fuzz
//!
//! # Run with a time limit (e.g., 60 seconds)
//! cargo +nightly fuzz run fuzz_gate -- -max_total_time=60
//! ```
//!
//! # What This Tests
//!
//! - `PolicyTable::resolve`: the resolved prefix always matches the path and
//!   no longer matching prefix exists
//! - `is_valid_trace_id`: accepted ids are always valid header values
//! - `extract_client_ip`: arbitrary forwarding headers and proxy ranges
//! - `CidrRange::parse`: arbitrary CIDR strings

#![no_main]

use arbitrary::Arbitrary;
use axum::body::Body;
use axum::http::{HeaderValue, Request};
use libfuzzer_sys::fuzz_target;
use mealplan_gate::middleware::{CidrRange, TrustedProxyConfig, extract_client_ip};
use mealplan_gate::policy::PolicyTable;
use mealplan_gate::trace::is_valid_trace_id;

#[derive(Debug, Arbitrary)]
struct Input<'a> {
    path: &'a str,
    correlation_id: &'a str,
    forwarded_for: &'a [u8],
    real_ip: &'a [u8],
    proxy: &'a str,
}

fuzz_target!(|input: Input<'_>| {
    let table = PolicyTable::with_defaults(None).expect("built-in table is valid");
    if let Some(policy) = table.resolve(input.path) {
        assert!(input.path.starts_with(&policy.path_prefix));
        assert!(
            table
                .policies()
                .iter()
                .filter(|p| p.matches(input.path))
                .all(|p| p.path_prefix.len() <= policy.path_prefix.len())
        );
    }

    if is_valid_trace_id(input.correlation_id) {
        assert!(HeaderValue::from_str(input.correlation_id).is_ok());
    }

    let _ = CidrRange::parse(input.proxy);

    let mut builder = Request::builder();
    if let Ok(value) = HeaderValue::from_bytes(input.forwarded_for) {
        builder = builder.header("x-forwarded-for", value);
    }
    if let Ok(value) = HeaderValue::from_bytes(input.real_ip) {
        builder = builder.header("x-real-ip", value);
    }
    if let Ok(req) = builder.body(Body::empty()) {
        let trusted = TrustedProxyConfig::new(&[input.proxy.to_string()]);
        let client = extract_client_ip(&req, &trusted);
        assert!(!client.is_empty());
    }
});
