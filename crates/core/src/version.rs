use std::fmt::{self, Display, Formatter};

const BUILD_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(serde::Serialize, Clone, Debug, Default)]
pub struct BuildInfo {
	pub version: String,
	pub rust_version: String,
}

impl BuildInfo {
	pub fn new() -> Self {
		BuildInfo {
			version: BUILD_VERSION.to_string(),
			rust_version: rustc_version_str().to_string(),
		}
	}
}

fn rustc_version_str() -> &'static str {
	option_env!("REVERSE_GATEWAY_RUSTC_VERSION").unwrap_or("unknown")
}

impl Display for BuildInfo {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"version.BuildInfo{{Version:\"{}\", RustVersion:\"{}\"}}",
			self.version, self.rust_version
		)
	}
}
