use anyhow::Result;
use clap::Parser;
use rsofs::{format, FormatOpts};

use crate::cli::Cli;

mod cli;

fn main() -> Result<()> {
	let cli = Cli::parse();

	env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

	let opts = FormatOpts {
		name:   cli.name.clone(),
		itotal: cli.inodes,
		zero:   cli.zero,
	};
	let info = format(&cli.device, &opts)?;

	if !cli.quiet {
		println!("{}: volume {:?}", cli.device.display(), info.name);
		println!("block size:    {} B", info.bsize);
		println!("cluster size:  {} B", info.csize);
		println!("inodes:        {} ({} free)", info.files, info.ffree);
		println!("data clusters: {} ({} free)", info.clusters, info.cfree);
	}

	Ok(())
}
