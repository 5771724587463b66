use std::env;
use std::process::Command;

fn main() {
    let rustc = env::var("RUSTC").unwrap_or_else(|_| "rustc".to_string());
    let version = Command::new(rustc)
        .arg("--version")
        .output()
        .ok()
        .and_then(|out| String::from_utf8(out.stdout).ok())
        .map(|s| s.trim().to_string())
        .unwrap_or_default();

    // "rustc 1.75.0 (82e1608df 2023-12-21)" -> toolchain string + bare version
    let semver = version.split_whitespace().nth(1).unwrap_or("unknown");
    println!(
        "cargo:rustc-env=XRAY_TOOLCHAIN={}",
        if version.is_empty() { "unknown" } else { version.as_str() }
    );
    println!("cargo:rustc-env=XRAY_RUSTC_VERSION={semver}");
}
