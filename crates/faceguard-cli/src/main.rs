use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use serde_json::Value;

const TIMED_OUT: &str = "org.freedesktop.DBus.Error.TimedOut";

#[zbus::proxy(
    interface = "org.faceguard.Guard1",
    default_service = "org.faceguard.Guard1",
    default_path = "/org/faceguard/Guard1"
)]
trait Guard {
    async fn status(&self) -> zbus::Result<String>;
    async fn enroll_pose(&self, pose: u32) -> zbus::Result<String>;
    async fn reset_enrollment(&self) -> zbus::Result<()>;
    async fn set_password(&self, password: &str, confirm: &str) -> zbus::Result<()>;
    async fn set_user_name(&self, name: &str) -> zbus::Result<()>;
    async fn start_protection(&self) -> zbus::Result<String>;
    async fn stop_protection(&self) -> zbus::Result<bool>;
    async fn allow(&self) -> zbus::Result<String>;
    async fn unlock(&self, password: &str) -> zbus::Result<String>;
    async fn reset(&self) -> zbus::Result<()>;

    #[zbus(signal)]
    fn enroll_progress(&self, event: String) -> zbus::Result<()>;
}

#[derive(Parser)]
#[command(name = "faceguard", about = "FaceGuard owner-presence protection CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show registration, session and alert state
    Status,
    /// Capture the enrollment poses (center, left, right, up, down)
    Enroll {
        /// Retries per pose after a timeout
        #[arg(short, long, default_value_t = 2)]
        retries: u32,
    },
    /// Set the backup password; completes registration
    SetPassword {
        #[arg(long)]
        password: String,
        #[arg(long)]
        confirm: String,
    },
    /// Set the owner's display name
    Name { name: String },
    /// Start protection
    Start,
    /// Stop protection
    Stop,
    /// Clear the active alert if you were just verified
    Allow,
    /// Clear the active alert with the backup password
    Unlock {
        #[arg(long)]
        password: String,
    },
    /// Erase all credentials
    Reset {
        /// Confirm the reset
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let conn = zbus::Connection::session().await?;
    let proxy = GuardProxy::new(&conn).await?;

    match cli.command {
        Commands::Status => {
            let status: Value = serde_json::from_str(&proxy.status().await?)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Enroll { retries } => enroll(&proxy, retries).await?,
        Commands::SetPassword { password, confirm } => {
            proxy.set_password(&password, &confirm).await?;
            println!("Password set. Registration complete.");
        }
        Commands::Name { name } => {
            proxy.set_user_name(&name).await?;
            println!("Name set to {}", name.trim());
        }
        Commands::Start => {
            let session = proxy.start_protection().await?;
            println!("Protection active (session {session})");
        }
        Commands::Stop => {
            if proxy.stop_protection().await? {
                println!("Protection stopped");
            } else {
                println!("Protection was not active");
            }
        }
        Commands::Allow => {
            let clearance = proxy.allow().await?;
            println!("Alert cleared ({})", clearance.trim_matches('"'));
        }
        Commands::Unlock { password } => {
            let clearance = proxy.unlock(&password).await?;
            println!("Alert cleared ({})", clearance.trim_matches('"'));
        }
        Commands::Reset { yes } => {
            if !yes {
                bail!("reset erases the enrolled face and password; pass --yes to confirm");
            }
            proxy.reset().await?;
            println!("All credentials erased");
        }
    }

    Ok(())
}

/// Walk every remaining pose, retrying a pose that times out.
async fn enroll(proxy: &GuardProxy<'_>, retries: u32) -> Result<()> {
    let status: Value = serde_json::from_str(&proxy.status().await?)?;
    if status["enrollment_in_progress"].as_bool() == Some(true) {
        bail!("another enrollment is in progress");
    }
    let total = status["enrollment_poses"].as_u64().unwrap_or(5);
    let mut pose = status["enrollment_next_pose"].as_u64().unwrap_or(0);
    let mut progress = proxy.receive_enroll_progress().await?;

    while pose < total {
        let mut attempt = 0;
        let step: Value = loop {
            println!("Pose {}/{total}: hold still and follow the prompt", pose + 1);
            let call = proxy.enroll_pose(pose as u32);
            tokio::pin!(call);
            let reply = loop {
                tokio::select! {
                    reply = &mut call => break reply,
                    Some(signal) = progress.next() => {
                        if let Ok(args) = signal.args() {
                            print_progress(args.event());
                        }
                    }
                }
            };

            match reply {
                Ok(reply) => break serde_json::from_str(&reply)?,
                Err(e) if is_timeout(&e) && attempt < retries => {
                    attempt += 1;
                    tracing::debug!(error = %e, pose, attempt, "pose capture timed out");
                    println!("  {e}; retrying ({attempt}/{retries})");
                }
                Err(e) => {
                    let _ = proxy.reset_enrollment().await;
                    bail!("enrollment aborted at pose {}: {e}", pose + 1);
                }
            }
        };

        println!("  captured '{}'", step["label"].as_str().unwrap_or("?"));
        if step["enrolled"].as_bool() == Some(true) {
            println!("Face enrolled. Set a backup password with `faceguard set-password`.");
            return Ok(());
        }
        pose = step["next_pose"].as_u64().unwrap_or(pose + 1);
    }

    Ok(())
}

fn print_progress(event: &str) {
    let Ok(event) = serde_json::from_str::<Value>(event) else {
        return;
    };
    if event["event"] == "progress" {
        println!(
            "  attempt {}/{}: {} sample(s)",
            event["attempt"], event["max_attempts"], event["samples"]
        );
    }
}

/// Only a pose timeout can succeed on a retry.
fn is_timeout(err: &zbus::Error) -> bool {
    match err {
        zbus::Error::MethodError(name, _, _) => name.as_str() == TIMED_OUT,
        zbus::Error::FDO(e) => matches!(**e, zbus::fdo::Error::TimedOut(_)),
        _ => false,
    }
}
