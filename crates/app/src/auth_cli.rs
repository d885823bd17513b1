use std::path::Path;

use ring::signature::{Ed25519KeyPair, KeyPair};

use crate::cli::{JwtCommand, JwtTokenArgs, KeyArgs, KeyCommand};

pub fn run_key(cmd: &KeyCommand) -> anyhow::Result<()> {
	match cmd {
		KeyCommand::Private(args) => print_private(args),
		KeyCommand::Public(args) => print_public(args),
	}
}

fn print_private(args: &KeyArgs) -> anyhow::Result<()> {
	if let Some(path) = &args.key {
		let der = std::fs::read(path)?;
		println!("{}", hex::encode(der));
		return Ok(());
	}
	let rng = ring::rand::SystemRandom::new();
	let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng).map_err(|e| anyhow::anyhow!("key generation failed: {e}"))?;
	println!("{}", hex::encode(pkcs8.as_ref()));
	Ok(())
}

fn print_public(args: &KeyArgs) -> anyhow::Result<()> {
	let der = load_or_generate(args.key.as_deref())?;
	let pair = Ed25519KeyPair::from_pkcs8(&der).map_err(|e| anyhow::anyhow!("invalid private key: {e}"))?;
	println!("{}", hex::encode(pair.public_key().as_ref()));
	Ok(())
}

fn load_or_generate(key: Option<&Path>) -> anyhow::Result<Vec<u8>> {
	match key {
		Some(path) => Ok(std::fs::read(path)?),
		None => {
			let rng = ring::rand::SystemRandom::new();
			let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng).map_err(|e| anyhow::anyhow!("key generation failed: {e}"))?;
			Ok(pkcs8.as_ref().to_vec())
		},
	}
}

pub fn run_jwt(cmd: &JwtCommand) -> anyhow::Result<()> {
	let JwtCommand::Token(args) = cmd;
	print_token(args)
}

fn print_token(args: &JwtTokenArgs) -> anyhow::Result<()> {
	let der = std::fs::read(&args.key)?;
	let encoding_key = jsonwebtoken::EncodingKey::from_ed_der(&der);
	let header = jsonwebtoken::Header::new(jsonwebtoken::Algorithm::EdDSA);

	let mut claims = serde_json::Map::new();
	claims.insert("agentID".to_string(), serde_json::Value::String(args.agent_id.clone()));
	claims.insert("role".to_string(), serde_json::Value::String(args.role.clone()));
	if let Some(aud) = &args.audience {
		claims.insert("aud".to_string(), serde_json::Value::String(aud.clone()));
	}

	let token = jsonwebtoken::encode(&header, &claims, &encoding_key)?;
	println!("{token}");
	Ok(())
}
