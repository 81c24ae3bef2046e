use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

const BINARY: &str = "tlswatch";

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Build and deploy tlswatch")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the complete binary (eBPF + userspace)
    Build {
        /// Build in release mode
        #[arg(long)]
        release: bool,

        /// Target triple for cross-compilation (e.g. aarch64-unknown-linux-gnu)
        #[arg(long)]
        target: Option<String>,
    },

    /// Copy the binary to a remote host
    Deploy {
        /// Remote host (user@host or host)
        #[arg(long)]
        host: String,

        #[arg(long, default_value = "/usr/local/bin/tlswatch")]
        path: String,

        #[arg(long)]
        target: Option<String>,

        /// Restart the systemd unit after copying
        #[arg(long)]
        restart: bool,
    },

    /// Install the systemd unit on a remote host
    InstallService {
        #[arg(long)]
        host: String,

        /// EnvironmentFile holding TRACER__* settings
        #[arg(long)]
        env_file: Option<String>,
    },
}

fn main() -> Result<()> {
    match Cli::parse().command {
        Commands::Build { release, target } => {
            build(release, target.as_deref())?;
        }
        Commands::Deploy {
            host,
            path,
            target,
            restart,
        } => deploy(&host, &path, target.as_deref(), restart)?,
        Commands::InstallService { host, env_file } => install_service(&host, env_file.as_deref())?,
    }
    Ok(())
}

fn project_root() -> Result<PathBuf> {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .map(Path::to_path_buf)
        .context("xtask must live inside the workspace")
}

fn build(release: bool, target: Option<&str>) -> Result<PathBuf> {
    let root = project_root()?;

    let cross = target.is_some_and(|t| t.contains("linux")) && !cfg!(target_os = "linux");
    let tool = if cross {
        if which::which("cross").is_err() {
            bail!(
                "Cross-compilation to Linux requires 'cross' (cargo install cross) and a running Docker daemon."
            );
        }
        "cross"
    } else {
        "cargo"
    };

    println!("Building {}...", BINARY);
    let mut cmd = Command::new(tool);
    cmd.current_dir(&root).arg("build").arg("-p").arg(BINARY);
    if release {
        cmd.arg("--release");
    }
    if let Some(t) = target {
        cmd.arg("--target").arg(t);
    }

    let status = cmd.status().context("Failed to run cargo build")?;
    if !status.success() {
        bail!("Build failed");
    }

    let profile = if release { "release" } else { "debug" };
    let mut binary = root.join("target");
    if let Some(t) = target {
        binary.push(t);
    }
    binary.push(profile);
    binary.push(BINARY);

    println!("Build complete: {}", binary.display());
    Ok(binary)
}

fn ssh(host: &str, command: &str) -> Result<bool> {
    let status = Command::new("ssh")
        .arg(host)
        .arg(command)
        .status()
        .with_context(|| format!("Failed to run ssh {}", host))?;
    Ok(status.success())
}

fn deploy(host: &str, remote_path: &str, target: Option<&str>, restart: bool) -> Result<()> {
    let binary = build(true, target)?;
    if !binary.exists() {
        bail!("Binary not found at: {}", binary.display());
    }

    println!("Deploying to {}:{}", host, remote_path);
    let staged = format!("/tmp/{}.tmp", BINARY);
    let status = Command::new("scp")
        .arg(&binary)
        .arg(format!("{}:{}", host, staged))
        .status()
        .context("Failed to run scp")?;
    if !status.success() {
        bail!("scp failed");
    }

    if !ssh(
        host,
        &format!(
            "sudo mv {staged} {remote_path} && sudo chmod +x {remote_path}"
        ),
    )? {
        bail!("Failed to move binary to {}", remote_path);
    }

    if restart && !ssh(host, &format!("sudo systemctl restart {}", BINARY))? {
        println!("Service restart failed (is the unit installed?)");
    }
    Ok(())
}

fn install_service(host: &str, env_file: Option<&str>) -> Result<()> {
    let unit = systemd_unit(env_file).replace('\'', "'\\''");
    let cmd = format!(
        "echo '{unit}' | sudo tee /etc/systemd/system/{BINARY}.service > /dev/null && \
         sudo systemctl daemon-reload && sudo systemctl enable {BINARY}"
    );
    if !ssh(host, &cmd)? {
        bail!("Failed to install systemd service");
    }
    println!("Installed {}.service on {}", BINARY, host);
    Ok(())
}

fn systemd_unit(env_file: Option<&str>) -> String {
    let env_line = env_file
        .map(|f| format!("EnvironmentFile={}", f))
        .unwrap_or_default();

    format!(
        r#"[Unit]
Description=tlswatch TLS plaintext tracer
After=network.target

[Service]
Type=simple
ExecStart=/usr/local/bin/{BINARY}
ExecReload=/bin/kill -USR1 $MAINPID
Restart=on-failure
RestartSec=5
{env_line}

CapabilityBoundingSet=CAP_SYS_ADMIN CAP_BPF CAP_PERFMON CAP_SYS_PTRACE CAP_DAC_READ_SEARCH
AmbientCapabilities=CAP_SYS_ADMIN CAP_BPF CAP_PERFMON CAP_SYS_PTRACE CAP_DAC_READ_SEARCH

[Install]
WantedBy=multi-user.target
"#
    )
}
