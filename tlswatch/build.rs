use std::{env, path::PathBuf, process::Command};

fn main() {
    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());

    println!("cargo:rerun-if-changed=../tlswatch-ebpf/src");
    println!("cargo:rerun-if-changed=../tlswatch-common/src");

    let arch = env::var("CARGO_CFG_TARGET_ARCH").unwrap();

    let bpf_target = match arch.as_str() {
        "x86_64" | "x86" | "aarch64" | "arm" | "riscv64" => "bpfel-unknown-none",
        "mips" | "mips64" | "powerpc" | "powerpc64" | "s390x" => "bpfeb-unknown-none",
        _ => {
            println!(
                "cargo:warning=Unknown architecture '{}', defaulting to bpfel-unknown-none",
                arch
            );
            "bpfel-unknown-none"
        }
    };

    // A separate target dir keeps the nightly bpf build from contending for
    // the host build's lock.
    let ebpf_target_dir = PathBuf::from(env::var("HOME").unwrap()).join("cargo-target-tlswatch-ebpf");
    let cargo = env::var("CARGO").unwrap_or_else(|_| "cargo".to_string());

    let status = Command::new(cargo)
        .current_dir("../tlswatch-ebpf")
        .env("RUSTUP_TOOLCHAIN", "nightly")
        .env("CARGO_TARGET_DIR", &ebpf_target_dir)
        .args([
            "build",
            "--release",
            &format!("--target={}", bpf_target),
            "-Z",
            "build-std=core",
        ])
        .stdout(std::process::Stdio::inherit())
        .stderr(std::process::Stdio::inherit())
        .status()
        .expect("Failed to execute cargo command");

    if !status.success() {
        panic!("Failed to build tlswatch-ebpf");
    }

    let ebpf_binary = ebpf_target_dir.join(format!("{}/release/tlswatch", bpf_target));
    std::fs::copy(&ebpf_binary, out_dir.join("tlswatch")).expect("Failed to copy eBPF object file");
}
