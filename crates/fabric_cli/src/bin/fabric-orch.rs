use clap::Parser;

#[tokio::main]
async fn main() {
    let ops = fabric_cli::FabricOrch::parse();
    if std::env::var_os("RUST_LOG").is_some() {
        fabric_trace::init_fmt(ops.structured.clone()).ok();
    }

    if let Err(err) = ops.run().await {
        eprintln!("{} {:#}", ansi_term::Color::Red.bold().paint("fabric-orch:"), err);
        std::process::exit(fabric_cli::exit_code(&err));
    }
}
