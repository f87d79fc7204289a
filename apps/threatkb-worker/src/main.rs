use clap::Parser;

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
	color_eyre::install()?;

	let args = threatkb_worker::Args::parse();

	threatkb_worker::run(args).await
}
