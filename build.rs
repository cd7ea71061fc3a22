//! Build script for Corral.
//!
//! Recompiles the crate when migration files change so that the `SQLx`
//! `migrate!()` macro picks up schema updates.

fn main() {
    println!("cargo:rerun-if-changed=migrations");
}
