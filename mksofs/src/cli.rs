use std::path::PathBuf;

use clap::Parser;

#[derive(Parser)]
#[command(version, about)]
pub struct Cli {
	/// Path to the backing file
	pub device: PathBuf,

	/// Volume name (capped at 23 characters)
	#[arg(short, long, default_value = "SOFS13")]
	pub name: String,

	/// Number of inodes; defaults to one per eight blocks
	#[arg(short, long)]
	pub inodes: Option<u32>,

	/// Zero-fill every data cluster
	#[arg(short, long)]
	pub zero: bool,

	/// Suppress the summary printout
	#[arg(short, long)]
	pub quiet: bool,
}
