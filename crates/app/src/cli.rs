use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "reverse-http", about = "Reverse tunnel HTTP proxy", long_about = None)]
#[command(disable_version_flag = true)]
pub struct Cli {
	#[command(subcommand)]
	pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
	/// Run the agent-side QUIC client and local HTTP egress proxy.
	Agent,
	/// Run the agent-server (QUIC listener) and HTTP proxy on this node.
	Proxy,
	/// Run a load balancer HTTP proxy fronting a fleet of proxies via the registry.
	Lb,
	/// Key and token tooling.
	Auth {
		#[command(subcommand)]
		command: AuthCommand,
	},
	/// Print version info.
	Version,
}

#[derive(Subcommand, Debug)]
pub enum AuthCommand {
	Key {
		#[command(subcommand)]
		command: KeyCommand,
	},
	/// Mint a signed JWT asserting an agentID/role pair.
	Jwt {
		#[command(subcommand)]
		command: JwtCommand,
	},
}

#[derive(Subcommand, Debug)]
pub enum KeyCommand {
	/// Generate a new Ed25519 keypair and print the PKCS8 private key.
	Private(KeyArgs),
	/// Derive and print the public key from an existing private key.
	Public(KeyArgs),
}

#[derive(Args, Debug)]
pub struct KeyArgs {
	/// Path to an existing PKCS8 private key (DER). Generates a fresh one if omitted.
	#[arg(long)]
	pub key: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum JwtCommand {
	Token(JwtTokenArgs),
}

#[derive(Args, Debug)]
pub struct JwtTokenArgs {
	#[arg(long)]
	pub key: PathBuf,
	#[arg(long, value_name = "agentID")]
	pub agent_id: String,
	#[arg(long, default_value = "agent")]
	pub role: String,
	#[arg(long)]
	pub audience: Option<String>,
}
