//! Build script for stackroots-core
//!
//! Checks the toolchain before compilation and records the compiler version
//! so the CLI can print it next to decoded output.
//!
//! ## Requirements
//!
//! - **Rust**: 1.82.0 or newer (`Option::is_none_or`, `u32::next_multiple_of`)

fn main()
{
    println!("cargo:rerun-if-changed=build.rs");

    match rustc_version::version() {
        Ok(found) => {
            let minimum = rustc_version::Version::new(1, 82, 0);
            if found < minimum {
                panic!("stackroots-core requires Rust {minimum} or newer, found {found}");
            }
            println!("cargo:rustc-env=STACKROOTS_RUSTC_VERSION={found}");
        }
        Err(_) => {
            // Some build environments hide rustc; the version string is optional.
            println!("cargo:warning=could not verify Rust version");
        }
    }
}
