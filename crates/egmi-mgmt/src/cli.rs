use anyhow::Result;
use clap::{Parser, Subcommand};
use reqwest::Client;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::config::EgmiConfig;
use crate::system_status::SystemStatus;

#[derive(Parser)]
#[command(name = "egmi")]
#[command(about = "Self-healing management of Gluster storage clusters", long_about = None)]
pub struct Cli {
    /// Base URL of a running instance.
    #[arg(short, long, global = true, env = "EGMI_URL", default_value = "http://localhost:28901")]
    pub url: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Runs election, reconciliation and the admin API.
    Serve {
        #[arg(short, long, default_value = "/etc/egmi/egmi.toml")]
        config: PathBuf,

        #[arg(long, env = "EGMI_BIND_ADDR")]
        bind: Option<SocketAddr>,

        #[arg(long, env = "EGMI_HOSTNAME")]
        hostname: Option<String>,

        /// Forces the master role on or off.
        #[arg(long, env = "EGMI_MASTER", action = clap::ArgAction::Set)]
        master: Option<bool>,
    },
    /// Prints the last computed cluster status.
    Status,
    /// Prints who is master.
    Master,
}

/// Applies command line overrides on top of the file configuration.
pub fn apply_overrides(
    config: &mut EgmiConfig,
    bind: Option<SocketAddr>,
    hostname: Option<String>,
    master: Option<bool>,
) {
    if let Some(bind) = bind {
        config.bind_addr = bind;
    }
    if let Some(hostname) = hostname {
        config.hostname = hostname;
    }
    if master.is_some() {
        config.election.master = master;
    }
}

/// Node and volume tables of `status`.
pub fn render_status(status: &SystemStatus) -> String {
    let mut out = String::new();
    out.push_str(&format!("Status computed by {}\n\n", status.hostname));

    out.push_str(&format!("{:<24} {:<14} {:<30} {:>6}\n", "NODE", "STATUS", "VOLUMES", "BRICKS"));
    out.push_str(&format!("{}\n", "-".repeat(77)));
    for node in &status.nodes {
        out.push_str(&format!(
            "{:<24} {:<14} {:<30} {:>6}\n",
            node.host.to_string(),
            node.status.to_string(),
            node.volumes.as_deref().unwrap_or("-"),
            node.nbr_bricks.map(|b| b.to_string()).unwrap_or_else(|| "-".into())
        ));
    }

    out.push_str(&format!(
        "\n{:<20} {:<24} {:<12} {:<12} {:<12}\n",
        "VOLUME", "TYPE", "SHARDS", "REPLICAS", "BRICKS"
    ));
    out.push_str(&format!("{}\n", "-".repeat(84)));
    for volume in &status.volumes {
        out.push_str(&format!(
            "{:<20} {:<24} {:<12} {:<12} {:<12}\n",
            volume.volume.to_string(),
            volume.volume_type.as_deref().unwrap_or("-"),
            volume.nb_shards.as_deref().unwrap_or("-"),
            volume.nb_replicas.as_deref().unwrap_or("-"),
            volume.nb_bricks.as_deref().unwrap_or("-"),
        ));
        out.push_str(&format!("  status: {}\n", volume.status));
    }
    out
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        match self.command {
            Command::Status => self.status().await,
            Command::Master => self.master().await,
            Command::Serve { .. } => anyhow::bail!("serve is handled by the binary entry point"),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.url.trim_end_matches('/'), path)
    }

    async fn get_json(&self, path: &str) -> Result<serde_json::Value> {
        let response = Client::new().get(self.endpoint(path)).send().await?;
        if !response.status().is_success() {
            anyhow::bail!("Request failed: {}", response.status());
        }
        Ok(response.json().await?)
    }

    async fn status(&self) -> Result<()> {
        let json = self.get_json("get-status").await?;
        if json.get("clear").is_some() {
            println!("System status is initializing");
            return Ok(());
        }
        if json.get("status").and_then(|s| s.as_str()) == Some("KO") {
            anyhow::bail!("{}", json["error"].as_str().unwrap_or("unknown error"));
        }
        let status: SystemStatus = serde_json::from_value(json)?;
        print!("{}", render_status(&status));
        Ok(())
    }

    async fn master(&self) -> Result<()> {
        #[derive(Deserialize)]
        struct MasterReply {
            master: bool,
            master_url: String,
        }

        let reply: MasterReply = serde_json::from_value(self.get_json("get-master").await?)?;
        println!("This instance is master: {}", if reply.master { "yes" } else { "no" });
        println!("Master URL: {}", reply.master_url);
        Ok(())
    }
}
